//! Row types and DTOs.

pub mod script;
pub mod video_generation;

//! Repository layer.
//!
//! Each repository is a zero-sized struct providing async methods
//! that accept `&PgPool` as the first argument.

pub mod script_repo;
pub mod video_generation_repo;

pub use script_repo::ScriptRepo;
pub use video_generation_repo::VideoGenerationRepo;

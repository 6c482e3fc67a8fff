//! Pure domain logic for the video generation pipeline.
//!
//! Everything in this crate is free of I/O: step and run state machines,
//! progress blending, the provider waterfall table, quality-tier policy and
//! the failure taxonomy. The `db`, `pipeline`, `client` and `api` crates
//! build on these types.

#[macro_use]
mod macros;

pub mod error;
pub mod failure;
pub mod progress;
pub mod providers;
pub mod snapshot;
pub mod steps;
pub mod types;
pub mod units;

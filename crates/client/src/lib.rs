//! Client side of the polling protocol.
//!
//! [`poll_status`] turns a [`StatusSource`] into a stream of snapshots that
//! follows the server's recommended interval, backs off on transient read
//! errors and ends once the run is terminal. [`PollHandle`] owns one such
//! loop as a cancellable task.

pub mod http;
pub mod poll;

pub use http::HttpStatusSource;
pub use poll::{next_delay, poll_status, PollConfig, PollError, PollHandle, StatusSource};

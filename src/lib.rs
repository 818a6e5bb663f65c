//! conductor: dependency-aware task orchestration.
//!
//! Build a [`TaskGraph`](core::TaskGraph) of agent tasks, drive it with an
//! [`ExecutionEngine`](orchestration::ExecutionEngine) in bounded-parallel
//! rounds, and persist round-boundary state through a
//! [`CheckpointStore`](state::CheckpointStore) so an interrupted run can
//! resume.

pub mod config;
pub mod core;
pub mod error;
pub mod log;
pub mod orchestration;
pub mod state;

pub use config::Config;
pub use error::{Error, Result};

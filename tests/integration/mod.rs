//! Integration test suite for conductor.
//!
//! These tests drive whole missions through the public API: graphs built
//! from node specs, the execution engine with a supervised executor, and
//! checkpoint/resume against a real git repository marker.
//!
//! # Test Categories
//!
//! - `mission_e2e`: Full mission execution, failure cascades, concurrency
//! - `resume`: Checkpointing at round boundaries and resuming after a crash
//!
//! # CI Compatibility
//!
//! Executors are scripted mocks and git repositories are created with
//! `git2` in temporary directories, so no external tools are needed.


mod mission_e2e;
mod resume;

//! Core domain models for conductor.
//!
//! This module contains the task nodes and the dependency graph that the
//! execution engine drains.

pub mod graph;
pub mod node;

pub use graph::{CriticalPath, GraphSnapshot, Progress, TaskGraph, ValidationReport};
pub use node::{Metadata, NodeSpec, NodeStatus, TaskNode};

//! Durable run state for conductor.
//!
//! Checkpoints persist round-boundary engine state to a JSON file; state
//! markers decide whether a stored checkpoint still matches the world.

mod checkpoint;
mod marker;

pub use checkpoint::{
    collect_checkpoint_state, restore_checkpoint_state, validate_checkpoint, Checkpoint,
    CheckpointState, CheckpointStore, CheckpointValidation, LiveState, RestoreTargets,
    CHECKPOINT_VERSION,
};
pub use marker::{GitHeadMarker, StateMarker, StaticMarker};

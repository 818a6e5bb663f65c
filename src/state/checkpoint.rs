//! Crash-safe persistence of round-boundary engine state.
//!
//! A checkpoint is a single JSON document written after a round completes.
//! Writes go to a sibling temp file that is renamed over the target, so a
//! reader sees either the previous checkpoint or the new one. Every failure
//! on this path is logged and swallowed: a missing, unreadable or outdated
//! checkpoint means a cold start, never an error.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::core::{GraphSnapshot, TaskGraph};
use crate::error::Result;
use crate::orchestration::{AdaptiveTiming, RoundSummary, TimingSnapshot};
use crate::{clog, clog_debug, clog_error, clog_warn};

/// Bumped whenever the checkpoint layout changes incompatibly.
pub const CHECKPOINT_VERSION: u32 = 1;

/// Engine state captured at a round boundary.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointState {
    /// Last completed round.
    pub round: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_state_marker: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graph: Option<GraphSnapshot>,
    #[serde(default)]
    pub timing: TimingSnapshot,
    #[serde(default)]
    pub round_log: Vec<RoundSummary>,
    #[serde(default)]
    pub consecutive_empty_rounds: HashMap<String, u32>,
}

/// A persisted [`CheckpointState`] with its version and write time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub state: CheckpointState,
}

impl Checkpoint {
    /// Rebuild the stored graph, if the checkpoint carries one.
    pub fn graph(&self) -> Result<Option<TaskGraph>> {
        self.state
            .graph
            .clone()
            .map(TaskGraph::from_snapshot)
            .transpose()
    }
}

#[derive(Serialize)]
struct CheckpointRecord<'a> {
    version: u32,
    timestamp: DateTime<Utc>,
    #[serde(flatten)]
    state: &'a CheckpointState,
}

/// Outcome of [`validate_checkpoint`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointValidation {
    pub valid: bool,
    pub reason: Option<String>,
}

impl CheckpointValidation {
    fn valid() -> Self {
        Self {
            valid: true,
            reason: None,
        }
    }

    fn invalid(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            reason: Some(reason.into()),
        }
    }
}

/// Decide whether `checkpoint` is safe to resume from given the current
/// external state marker. Markers are compared verbatim.
pub fn validate_checkpoint(
    checkpoint: Option<&Checkpoint>,
    current_marker: &str,
) -> CheckpointValidation {
    let Some(checkpoint) = checkpoint else {
        return CheckpointValidation::invalid("no checkpoint");
    };
    match checkpoint.state.external_state_marker.as_deref() {
        None | Some("") => CheckpointValidation::invalid("checkpoint missing marker"),
        Some(stored) if stored != current_marker => CheckpointValidation::invalid(format!(
            "marker mismatch: checkpoint={} current={}",
            stored, current_marker
        )),
        Some(_) => CheckpointValidation::valid(),
    }
}

/// Borrowed view of the live engine state to snapshot.
#[derive(Debug, Clone, Copy)]
pub struct LiveState<'a> {
    pub round: u32,
    pub external_state_marker: Option<&'a str>,
    pub graph: Option<&'a TaskGraph>,
    pub timing: &'a AdaptiveTiming,
    pub round_log: &'a [RoundSummary],
    pub consecutive_empty_rounds: &'a HashMap<String, u32>,
}

/// Copy everything in `live` into an owned [`CheckpointState`].
///
/// The result shares nothing with `live`; later changes to the engine do
/// not reach the snapshot.
pub fn collect_checkpoint_state(live: &LiveState<'_>) -> CheckpointState {
    CheckpointState {
        round: live.round,
        external_state_marker: live.external_state_marker.map(str::to_string),
        graph: live.graph.map(TaskGraph::snapshot),
        timing: live.timing.snapshot(),
        round_log: live.round_log.to_vec(),
        consecutive_empty_rounds: live.consecutive_empty_rounds.clone(),
    }
}

/// Live containers that [`restore_checkpoint_state`] repopulates in place.
#[derive(Debug)]
pub struct RestoreTargets<'a> {
    pub timing: &'a mut AdaptiveTiming,
    pub round_log: &'a mut Vec<RoundSummary>,
    pub consecutive_empty_rounds: &'a mut HashMap<String, u32>,
}

/// Clear each target and refill it from `checkpoint`. Returns the stored round.
///
/// Containers are emptied and extended rather than replaced, so references
/// held elsewhere keep pointing at the restored data.
pub fn restore_checkpoint_state(checkpoint: &Checkpoint, targets: RestoreTargets<'_>) -> u32 {
    let state = &checkpoint.state;
    targets.timing.restore(&state.timing);

    targets.round_log.clear();
    targets.round_log.extend(state.round_log.iter().cloned());

    targets.consecutive_empty_rounds.clear();
    targets.consecutive_empty_rounds.extend(
        state
            .consecutive_empty_rounds
            .iter()
            .map(|(kind, count)| (kind.clone(), *count)),
    );

    clog_debug!(
        "Checkpoint restored: round={} rounds_logged={}",
        state.round,
        targets.round_log.len()
    );
    state.round
}

/// Reads and writes the checkpoint file.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at the configured checkpoint path.
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self::new(config.checkpoint_path()?))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist `state`. Returns whether anything reached disk.
    pub fn write_checkpoint(&self, state: &CheckpointState) -> bool {
        let record = CheckpointRecord {
            version: CHECKPOINT_VERSION,
            timestamp: Utc::now(),
            state,
        };
        let contents = match serde_json::to_string_pretty(&record) {
            Ok(contents) => contents,
            Err(e) => {
                clog_error!("Failed to serialize checkpoint: {}", e);
                return false;
            }
        };

        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                clog_debug!("Creating checkpoint directory: {}", dir.display());
                if let Err(e) = fs::create_dir_all(dir) {
                    clog_error!("Failed to create {}: {}", dir.display(), e);
                    return false;
                }
            }
        }

        let temp_path = self.path.with_extension("json.tmp");
        let atomic =
            fs::write(&temp_path, &contents).and_then(|_| fs::rename(&temp_path, &self.path));
        match atomic {
            Ok(()) => {
                clog_debug!(
                    "Checkpoint saved: round={} path={}",
                    state.round,
                    self.path.display()
                );
                true
            }
            Err(e) => {
                clog_warn!(
                    "Atomic checkpoint write failed ({}), writing {} directly",
                    e,
                    self.path.display()
                );
                let _ = fs::remove_file(&temp_path);
                match fs::write(&self.path, &contents) {
                    Ok(()) => true,
                    Err(e) => {
                        clog_error!("Failed to write checkpoint {}: {}", self.path.display(), e);
                        false
                    }
                }
            }
        }
    }

    /// Read the checkpoint, or `None` if there is nothing usable on disk.
    pub fn load_checkpoint(&self) -> Option<Checkpoint> {
        if !self.path.exists() {
            clog_debug!("No checkpoint at {}", self.path.display());
            return None;
        }

        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) => {
                clog_warn!("Failed to read checkpoint {}: {}", self.path.display(), e);
                return None;
            }
        };
        let value: serde_json::Value = match serde_json::from_str(&contents) {
            Ok(value) => value,
            Err(e) => {
                clog_warn!("Ignoring unparsable checkpoint {}: {}", self.path.display(), e);
                return None;
            }
        };

        let version = value.get("version").and_then(serde_json::Value::as_u64);
        if version != Some(u64::from(CHECKPOINT_VERSION)) {
            clog_warn!(
                "Ignoring checkpoint with version {:?}, expected {}",
                version,
                CHECKPOINT_VERSION
            );
            return None;
        }

        match serde_json::from_value::<Checkpoint>(value) {
            Ok(checkpoint) => {
                clog_debug!(
                    "Checkpoint loaded: round={} written={}",
                    checkpoint.state.round,
                    checkpoint.timestamp
                );
                Some(checkpoint)
            }
            Err(e) => {
                clog_warn!("Ignoring malformed checkpoint {}: {}", self.path.display(), e);
                None
            }
        }
    }

    /// Load the checkpoint and keep it only if it validates against `current_marker`.
    pub fn load_valid(&self, current_marker: &str) -> Option<Checkpoint> {
        let checkpoint = self.load_checkpoint();
        let validation = validate_checkpoint(checkpoint.as_ref(), current_marker);
        if validation.valid {
            clog!("Resuming from checkpoint {}", self.path.display());
            checkpoint
        } else {
            clog!(
                "Starting cold: {}",
                validation.reason.as_deref().unwrap_or("invalid checkpoint")
            );
            None
        }
    }

    /// Remove the checkpoint file. Missing files are not an error.
    pub fn clear_checkpoint(&self) -> Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path)?;
            clog_debug!("Checkpoint cleared: {}", self.path.display());
        }
        Ok(())
    }
}

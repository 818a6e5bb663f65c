//! External state markers.
//!
//! A marker is an opaque string describing the state of the world a run
//! operates on. It is stored in each checkpoint and compared verbatim on
//! resume; a different marker means the world moved on and the checkpoint
//! is discarded.

use git2::Repository;
use std::path::{Path, PathBuf};

use crate::clog_debug;
use crate::error::Result;

/// Supplies the current external state marker.
pub trait StateMarker {
    fn current_marker(&self) -> Result<String>;
}

/// Marker from the HEAD commit of a git repository.
///
/// Uses the full commit id so that any new commit invalidates old checkpoints.
#[derive(Debug, Clone)]
pub struct GitHeadMarker {
    repo_path: PathBuf,
}

impl GitHeadMarker {
    pub fn new(repo_path: &Path) -> Self {
        Self {
            repo_path: repo_path.to_path_buf(),
        }
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }
}

impl StateMarker for GitHeadMarker {
    fn current_marker(&self) -> Result<String> {
        let repo = Repository::open(&self.repo_path)?;
        let commit = repo.head()?.peel_to_commit()?;
        let marker = commit.id().to_string();
        clog_debug!("HEAD marker for {}: {}", self.repo_path.display(), marker);
        Ok(marker)
    }
}

/// A fixed marker, for callers that track external state themselves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticMarker(pub String);

impl StaticMarker {
    pub fn new(marker: impl Into<String>) -> Self {
        Self(marker.into())
    }
}

impl StateMarker for StaticMarker {
    fn current_marker(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

//! Version store abstraction
//!
//! Durable, versioned storage is delegated to a version-control backend
//! behind the [`VersionStore`] trait. [`GitStore`] drives the `git` command
//! line; [`MemoryStore`] keeps everything in memory and can inject failures,
//! which is what the engine tests run against.
//!
//! All operations are synchronous and blocking. Remote operations are the
//! only ones retried, through [`RetryPolicy::run`].

use crate::error::{Result, VaultError};
use crate::types::{CommitMeta, FileChange, VersionId};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::warn;

mod git;
mod memory;

pub use git::GitStore;
pub use memory::MemoryStore;

/// Tree-root file name reserved for the permission manifest [`GitStore`] commits
///
/// A source file with this name at the source root is never mirrored.
pub const MODE_MANIFEST: &str = ".snapvault-modes";

/// Operations the engines need from a version-control backend
pub trait VersionStore: Send + Sync {
    /// Working copy directory managed by this store
    fn root(&self) -> &Path;

    /// Prepare the working copy (idempotent)
    fn init(&self) -> Result<()>;

    /// Stage every addition, modification and deletion in the working copy
    fn stage_all(&self) -> Result<()>;

    /// Staged changes relative to head, ordered by path
    fn pending_changes(&self) -> Result<Vec<FileChange>>;

    /// Whether anything is staged relative to head
    fn has_changes(&self) -> Result<bool> {
        Ok(!self.pending_changes()?.is_empty())
    }

    /// Record the staged tree as a new snapshot
    ///
    /// Fails with [`VaultError::NoChanges`] if nothing differs from head.
    fn commit(&self, message: &str) -> Result<VersionId>;

    /// Send local history to the remote
    fn push(&self) -> Result<()>;

    /// Send local history to the remote, replacing a diverged remote branch
    fn force_push(&self) -> Result<()>;

    /// Bring in history from the remote; a missing remote branch is not an error
    fn pull(&self) -> Result<()>;

    /// Snapshots, newest first
    fn log(&self, limit: Option<usize>) -> Result<Vec<CommitMeta>>;

    /// Paths changed between two snapshots (`None` means the empty tree)
    fn diff(&self, from: Option<&VersionId>, to: &VersionId) -> Result<Vec<FileChange>>;

    /// Materialize a snapshot's tree into `target` without moving head or the index
    fn checkout(&self, id: &VersionId, target: &Path) -> Result<()>;

    /// Attach or replace the annotation of a snapshot
    fn annotate(&self, id: &VersionId, text: &str) -> Result<()>;

    /// Remove the newest snapshot and reset the working copy to its parent
    fn drop_head(&self) -> Result<VersionId>;

    /// Whether a remote is configured
    fn has_remote(&self) -> bool;

    /// Newest snapshot, if any
    fn head(&self) -> Result<Option<VersionId>>;
}

/// Bounded retry with exponential backoff for remote operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Wait before the second attempt; doubled each time
    pub initial_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 2000,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no waiting
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff_ms: 0,
        }
    }

    /// Run `op`, retrying only network failures
    ///
    /// The final network error reports the number of attempts made.
    pub fn run<T, F>(&self, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        let attempts = self.max_attempts.max(1);
        let mut backoff = Duration::from_millis(self.initial_backoff_ms);
        let mut attempt = 1;

        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if err.is_network() && attempt < attempts => {
                    warn!(operation, attempt, %err, "Remote operation failed, retrying in {:?}", backoff);
                    std::thread::sleep(backoff);
                    backoff = backoff.saturating_mul(2);
                    attempt += 1;
                }
                Err(VaultError::Network { operation: op_name, detail, .. }) => {
                    return Err(VaultError::Network {
                        operation: op_name,
                        attempts: attempt,
                        detail,
                    });
                }
                Err(err) => return Err(err),
            }
        }
    }
}

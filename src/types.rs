//! Core data types used throughout the snapvault library
//!
//! This module contains the value objects exchanged between the engines:
//!
//! - **History**: `VersionId`, `CommitMeta`, `FileChange`, `Selector`
//! - **Outcomes**: `BackupResult`, `RestoreResult`, `PruneResult`, `ChangeSummary`
//! - **Hooks**: `VaultHook` - the logging/notification collaborator
//!
//! ## Examples
//!
//! ```rust
//! use snapvault::types::Selector;
//!
//! assert_eq!("3".parse::<Selector>().unwrap(), Selector::Position(3));
//! assert_eq!("id:4f2a9c".parse::<Selector>().unwrap(), Selector::Id("4f2a9c".to_string()));
//! assert_eq!("before upgrade".parse::<Selector>().unwrap(), Selector::Text("before upgrade".to_string()));
//! ```

use crate::error::{ErrorKind, VaultError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Trailer recording what started a backup cycle
pub const TRIGGER_TRAILER: &str = "Snapvault-Trigger";

/// Opaque identifier of a snapshot in the version store
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionId(String);

impl VersionId {
    /// Wrap a backend identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Full identifier
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated identifier for display (7 characters)
    pub fn short(&self) -> &str {
        &self.0[..7.min(self.0.len())]
    }
}

impl std::fmt::Display for VersionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// What started a backup cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    /// Timer fire from the scheduler
    Scheduled,
    /// Operator asked for it
    Manual,
}

impl Trigger {
    /// Value written into the commit trailer
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Scheduled => "scheduled",
            Trigger::Manual => "manual",
        }
    }
}

/// Metadata of one snapshot, as listed by the version store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitMeta {
    /// Version identifier
    pub id: VersionId,
    /// Commit time
    pub timestamp: DateTime<Utc>,
    /// Author name recorded by the backend
    pub author: String,
    /// Whether the scheduler (not an operator) created it
    pub automated: bool,
    /// Full commit message
    pub message: String,
    /// Amended description, if any
    pub annotation: Option<String>,
}

impl CommitMeta {
    /// Build metadata, deriving the automated flag from the message trailer
    pub fn new(
        id: VersionId,
        timestamp: DateTime<Utc>,
        author: impl Into<String>,
        message: impl Into<String>,
        annotation: Option<String>,
    ) -> Self {
        let message = message.into();
        let automated = message.lines().any(|line| {
            line.strip_prefix(TRIGGER_TRAILER)
                .and_then(|rest| rest.strip_prefix(':'))
                .map(|value| value.trim() == Trigger::Scheduled.as_str())
                .unwrap_or(false)
        });
        Self {
            id,
            timestamp,
            author: author.into(),
            automated,
            message,
            annotation: annotation.filter(|a| !a.trim().is_empty()),
        }
    }

    /// First line of the commit message
    pub fn summary(&self) -> &str {
        self.message.lines().next().unwrap_or("").trim()
    }

    /// Description shown to operators: the amendment if present, else the summary
    pub fn description(&self) -> &str {
        match &self.annotation {
            Some(text) => text.trim(),
            None => self.summary(),
        }
    }

    /// Case-insensitive search over message and annotation
    pub fn matches_text(&self, needle: &str) -> bool {
        let needle = needle.to_lowercase();
        self.message.to_lowercase().contains(&needle)
            || self
                .annotation
                .as_ref()
                .map(|a| a.to_lowercase().contains(&needle))
                .unwrap_or(false)
    }
}

/// Kind of change to a single path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// Path exists only in the newer version
    Added,
    /// Path content differs
    Modified,
    /// Path exists only in the older version
    Deleted,
}

impl ChangeKind {
    /// One-character marker used in summaries and listings
    pub fn marker(&self) -> char {
        match self {
            ChangeKind::Added => '+',
            ChangeKind::Modified => '~',
            ChangeKind::Deleted => '-',
        }
    }
}

/// A changed path between two versions
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileChange {
    /// Path relative to the tree root
    pub path: PathBuf,
    /// Kind of change
    pub kind: ChangeKind,
}

impl FileChange {
    /// Create a change entry
    pub fn new(path: impl Into<PathBuf>, kind: ChangeKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }
}

/// Operator reference to one snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Selector {
    /// Newest snapshot
    Head,
    /// 1-based position in the newest-first listing
    Position(usize),
    /// Full or abbreviated version id
    Id(String),
    /// Substring of the description
    Text(String),
}

impl FromStr for Selector {
    type Err = VaultError;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        let s = raw.trim();
        if s.is_empty() {
            return Err(VaultError::NotFound(raw.to_string()));
        }
        if s.eq_ignore_ascii_case("head") || s.eq_ignore_ascii_case("latest") {
            return Ok(Selector::Head);
        }
        if let Some(rest) = s.strip_prefix('#') {
            return rest
                .parse::<usize>()
                .map(Selector::Position)
                .map_err(|_| VaultError::NotFound(raw.to_string()));
        }
        if let Some(rest) = s.strip_prefix("id:") {
            return Ok(Selector::Id(rest.trim().to_lowercase()));
        }
        if let Some(rest) = s.strip_prefix("text:") {
            return Ok(Selector::Text(rest.trim().to_string()));
        }
        if s.chars().all(|c| c.is_ascii_digit()) && s.len() <= 6 {
            if let Ok(n) = s.parse::<usize>() {
                return Ok(Selector::Position(n));
            }
        }
        if s.len() >= 4 && s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Ok(Selector::Id(s.to_lowercase()));
        }
        Ok(Selector::Text(s.to_string()))
    }
}

impl std::fmt::Display for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Selector::Head => f.write_str("head"),
            Selector::Position(n) => write!(f, "#{}", n),
            Selector::Id(id) => write!(f, "id:{}", id),
            Selector::Text(text) => write!(f, "text:{}", text),
        }
    }
}

/// Counts produced by one mirror pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSummary {
    /// Entries that did not exist in the working copy
    pub copied: usize,
    /// Entries whose content or link target changed
    pub updated: usize,
    /// Entries removed because the source no longer has them
    pub deleted: usize,
    /// Entries left as they were
    pub unchanged: usize,
    /// Bytes written into the working copy
    pub bytes_copied: u64,
}

impl ChangeSummary {
    /// Check if the pass wrote anything
    pub fn has_changes(&self) -> bool {
        self.copied > 0 || self.updated > 0 || self.deleted > 0
    }

    /// Total number of entries written or removed
    pub fn total_operations(&self) -> usize {
        self.copied + self.updated + self.deleted
    }
}

/// Terminal status of a backup cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    /// Committed and (if a remote is configured) pushed
    Success,
    /// Committed locally, push failed
    SuccessDegraded,
    /// Nothing changed since the last snapshot
    NoChanges,
    /// Cycle aborted, no snapshot created
    Failed,
}

/// Step of a backup cycle, reported on failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleStep {
    /// Source checks
    VerifySource,
    /// Working copy initialisation
    Init,
    /// Mirroring source into the working copy
    Mirror,
    /// Staging and change detection
    Detect,
    /// Creating the snapshot
    Commit,
    /// Sending the snapshot to the remote
    Push,
}

/// Structured description of a failure, safe to log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureDetail {
    /// Taxonomy tag
    pub kind: ErrorKind,
    /// Step where it happened
    pub step: CycleStep,
    /// Rendered error (credentials already redacted)
    pub message: String,
}

impl FailureDetail {
    /// Capture an error at a cycle step
    pub fn new(step: CycleStep, error: &VaultError) -> Self {
        Self {
            kind: error.kind(),
            step,
            message: error.to_string(),
        }
    }
}

/// Outcome of one backup cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupResult {
    /// Terminal status
    pub status: BackupStatus,
    /// What started the cycle
    pub trigger: Trigger,
    /// Number of paths in the snapshot's change set
    pub changed_files: usize,
    /// Snapshot created, if any
    pub snapshot: Option<VersionId>,
    /// Whether the snapshot reached the remote
    pub pushed: bool,
    /// Mirror counts, if mirroring ran
    pub mirror: Option<ChangeSummary>,
    /// Failure or degradation detail
    pub error: Option<FailureDetail>,
    /// Cycle start time
    pub started_at: DateTime<Utc>,
    /// Wall time in milliseconds
    pub duration_ms: u64,
}

impl BackupResult {
    /// Check if a snapshot exists locally after this cycle
    pub fn is_committed(&self) -> bool {
        matches!(
            self.status,
            BackupStatus::Success | BackupStatus::SuccessDegraded
        )
    }
}

/// Outcome of a successful restore
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreResult {
    /// Snapshot that was restored
    pub version: VersionId,
    /// Directory that now holds it
    pub target: PathBuf,
    /// Copy of the target taken before the swap
    pub safety_snapshot: PathBuf,
    /// Files materialized from the snapshot
    pub files_restored: usize,
    /// Time taken in milliseconds
    pub duration_ms: u64,
    /// Non-fatal problems (e.g. leftover aside directory)
    pub warnings: Vec<String>,
}

/// Outcome of removing the newest snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PruneResult {
    /// Snapshot that was removed
    pub removed: VersionId,
    /// New newest snapshot
    pub new_head: VersionId,
    /// Whether the rewritten history reached the remote
    pub pushed: bool,
    /// History was rewritten; ids held elsewhere for `removed` are now dangling
    pub history_rewritten: bool,
    /// Force-push failure, if any
    pub error: Option<String>,
}

/// Hook trait for backup and restore outcomes
///
/// This is the logging/notification collaborator: engines hand it structured
/// results and never format log lines for it.
///
/// # Examples
///
/// ```rust
/// use snapvault::types::{BackupResult, BackupStatus, VaultHook};
///
/// struct AlertOnFailure;
///
/// impl VaultHook for AlertOnFailure {
///     fn post_backup(&self, result: &BackupResult) {
///         if result.status == BackupStatus::Failed {
///             eprintln!("backup failed: {:?}", result.error);
///         }
///     }
/// }
/// ```
pub trait VaultHook: Send + Sync {
    /// Called after every backup cycle, whatever its status
    fn post_backup(&self, _result: &BackupResult) {}

    /// Called after the safety snapshot, before the target is touched.
    /// Returning an error cancels the restore.
    fn pre_restore(&self, _version: &CommitMeta, _target: &Path) -> crate::error::Result<()> {
        Ok(())
    }

    /// Called after a successful restore
    fn post_restore(&self, _result: &RestoreResult) {}

    /// Called when a restore fails after resolution
    fn restore_failed(&self, _error: &VaultError) {}
}

/// Hook that emits structured `tracing` events for every outcome
#[derive(Debug, Default)]
pub struct TracingHook;

impl VaultHook for TracingHook {
    fn post_backup(&self, result: &BackupResult) {
        match result.status {
            BackupStatus::Failed => tracing::error!(
                status = ?result.status,
                trigger = result.trigger.as_str(),
                error = ?result.error,
                "backup cycle failed"
            ),
            BackupStatus::SuccessDegraded => tracing::warn!(
                status = ?result.status,
                snapshot = result.snapshot.as_ref().map(|id| id.short().to_string()),
                changed_files = result.changed_files,
                error = ?result.error,
                "backup committed locally but not pushed"
            ),
            _ => tracing::info!(
                status = ?result.status,
                snapshot = result.snapshot.as_ref().map(|id| id.short().to_string()),
                changed_files = result.changed_files,
                duration_ms = result.duration_ms,
                "backup cycle finished"
            ),
        }
    }

    fn post_restore(&self, result: &RestoreResult) {
        tracing::info!(
            version = result.version.short(),
            target = %result.target.display(),
            safety_snapshot = %result.safety_snapshot.display(),
            files_restored = result.files_restored,
            "restore finished"
        );
    }

    fn restore_failed(&self, error: &VaultError) {
        if error.is_fatal() {
            tracing::error!(kind = ?error.kind(), %error, "restore left target in an unknown state");
        } else {
            tracing::error!(kind = ?error.kind(), %error, "restore failed");
        }
    }
}

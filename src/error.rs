//! Error types for the snapvault library
//!
//! Every fallible operation returns [`VaultError`]. Variants follow the
//! backup engine's failure taxonomy so callers can tell a normal terminal
//! outcome (`NoChanges`) from a retryable one (`Network`, `AlreadyRunning`)
//! and from a condition that needs operator intervention
//! (`RestoreIntegrity`). Each variant carries the path, version id or step
//! needed to act on it without re-running at higher verbosity.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Type alias for Results in the snapvault library
pub type Result<T> = std::result::Result<T, VaultError>;

/// Main error type for all snapvault operations
#[derive(Debug, Error)]
pub enum VaultError {
    /// I/O errors during file operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors during JSON serialization/deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Walk directory error from walkdir crate
    #[error("Walk directory error: {0}")]
    WalkDir(#[from] walkdir::Error),

    /// The watched source directory is missing, empty or unreadable
    #[error("Source unavailable at {path:?}: {reason}")]
    SourceUnavailable {
        /// Source root that was checked
        path: PathBuf,
        /// What was wrong with it
        reason: String,
    },

    /// The working copy does not differ from its current head
    #[error("No changes to commit")]
    NoChanges,

    /// Transport failure talking to the remote
    #[error("Network error during {operation} after {attempts} attempt(s): {detail}")]
    Network {
        /// Backend operation (push, pull, ...)
        operation: String,
        /// Attempts made before giving up
        attempts: u32,
        /// Redacted backend output
        detail: String,
    },

    /// A version id prefix matched more than one snapshot
    #[error("Selector '{selector}' is ambiguous: matches {}", candidates.join(", "))]
    AmbiguousSelector {
        /// Selector as given by the caller
        selector: String,
        /// Short ids of the matching snapshots
        candidates: Vec<String>,
    },

    /// A selector matched no snapshot
    #[error("No snapshot matches '{0}'")]
    NotFound(String),

    /// Another backup, restore or prune holds the lock
    #[error("Another operation is already running (lock held at {path:?})")]
    AlreadyRunning {
        /// Lock file path
        path: PathBuf,
    },

    /// The target directory may be in a mixed state
    #[error("Restore integrity violated for {target:?}: {detail} (previous content left at {aside:?})")]
    RestoreIntegrity {
        /// Restore target
        target: PathBuf,
        /// Where the pre-restore content was moved
        aside: PathBuf,
        /// What went wrong while rolling back
        detail: String,
    },

    /// The pre-restore safety copy could not be taken
    #[error("Failed to create safety snapshot at {path:?}: {reason}")]
    SafetySnapshot {
        /// Intended safety snapshot location
        path: PathBuf,
        /// Underlying failure
        reason: String,
    },

    /// Restore failed after the safety snapshot was taken; target untouched
    #[error("Restore failed during {step} (target unchanged, safety snapshot at {safety_snapshot:?}): {source}")]
    RestoreFailed {
        /// Safety snapshot of the pre-restore state
        safety_snapshot: PathBuf,
        /// Step that failed
        step: RestoreStep,
        /// Underlying failure
        #[source]
        source: Box<VaultError>,
    },

    /// The version-control backend rejected a command
    #[error("Version store command '{operation}' failed (status {status:?}): {stderr}")]
    VersionStore {
        /// Backend operation
        operation: String,
        /// Exit status, if the process ran
        status: Option<i32>,
        /// Redacted stderr
        stderr: String,
    },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Exclude pattern parsing error
    #[error("Invalid exclude pattern: {0}")]
    InvalidPattern(String),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<globset::Error> for VaultError {
    fn from(err: globset::Error) -> Self {
        VaultError::InvalidPattern(err.to_string())
    }
}

/// Step of a restore, reported with [`VaultError::RestoreFailed`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreStep {
    /// Selector resolution
    Resolve,
    /// Pre-restore safety copy
    SafetySnapshot,
    /// Pre-restore hook veto
    Hook,
    /// Materializing the selected version into staging
    Checkout,
    /// Swapping staging into the target
    Swap,
}

impl std::fmt::Display for RestoreStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RestoreStep::Resolve => "resolve",
            RestoreStep::SafetySnapshot => "safety snapshot",
            RestoreStep::Hook => "pre-restore hook",
            RestoreStep::Checkout => "checkout",
            RestoreStep::Swap => "swap",
        };
        f.write_str(name)
    }
}

/// Serializable taxonomy tag for an error, used in results handed to hooks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Source missing or empty
    SourceUnavailable,
    /// Nothing to commit
    NoChanges,
    /// Remote transport failure
    Network,
    /// Selector matched several snapshots
    AmbiguousSelector,
    /// Selector matched nothing
    NotFound,
    /// Lock held by another operation
    AlreadyRunning,
    /// Target may be in a mixed state
    RestoreIntegrity,
    /// Safety snapshot could not be created
    SafetySnapshot,
    /// Backend command failed
    VersionStore,
    /// Configuration rejected
    Configuration,
    /// Local I/O failure
    Io,
    /// Anything else
    Internal,
}

impl VaultError {
    /// Create an internal error with a custom message
    pub fn internal(msg: impl Into<String>) -> Self {
        VaultError::Internal(msg.into())
    }

    /// Create a configuration error with a custom message
    pub fn config(msg: impl Into<String>) -> Self {
        VaultError::InvalidConfiguration(msg.into())
    }

    /// Create a source-unavailable error
    pub fn source_unavailable(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        VaultError::SourceUnavailable {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Taxonomy tag for this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            VaultError::Io(_) | VaultError::WalkDir(_) => ErrorKind::Io,
            VaultError::Json(_) | VaultError::Internal(_) => ErrorKind::Internal,
            VaultError::SourceUnavailable { .. } => ErrorKind::SourceUnavailable,
            VaultError::NoChanges => ErrorKind::NoChanges,
            VaultError::Network { .. } => ErrorKind::Network,
            VaultError::AmbiguousSelector { .. } => ErrorKind::AmbiguousSelector,
            VaultError::NotFound(_) => ErrorKind::NotFound,
            VaultError::AlreadyRunning { .. } => ErrorKind::AlreadyRunning,
            VaultError::RestoreIntegrity { .. } => ErrorKind::RestoreIntegrity,
            VaultError::SafetySnapshot { .. } => ErrorKind::SafetySnapshot,
            VaultError::RestoreFailed { source, .. } => source.kind(),
            VaultError::VersionStore { .. } => ErrorKind::VersionStore,
            VaultError::InvalidConfiguration(_) | VaultError::InvalidPattern(_) => {
                ErrorKind::Configuration
            }
        }
    }

    /// Check if this error is a remote transport failure
    pub fn is_network(&self) -> bool {
        matches!(self, VaultError::Network { .. })
    }

    /// Check if the caller may simply try again later
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            VaultError::Network { .. } | VaultError::AlreadyRunning { .. }
        )
    }

    /// Check if this error requires operator intervention before continuing
    pub fn is_fatal(&self) -> bool {
        match self {
            VaultError::RestoreIntegrity { .. } => true,
            VaultError::RestoreFailed { source, .. } => source.is_fatal(),
            _ => false,
        }
    }

    /// Get a user-friendly error message with suggestions
    pub fn user_message(&self) -> String {
        match self {
            VaultError::NotFound(selector) => {
                format!(
                    "No snapshot matches '{}'. Use 'snapvault list' to see available snapshots.",
                    selector
                )
            }
            VaultError::AlreadyRunning { path } => {
                format!(
                    "Another backup or restore is in progress. Try again later, or remove {:?} if no snapvault process is running.",
                    path
                )
            }
            VaultError::RestoreIntegrity { target, aside, .. } => {
                format!(
                    "The restore of {:?} could not be completed or rolled back. Stop all writers, then move {:?} back into place manually.",
                    target, aside
                )
            }
            VaultError::RestoreFailed { safety_snapshot, .. } => {
                format!(
                    "{}\nYour data before the restore is preserved at {:?}.",
                    self, safety_snapshot
                )
            }
            VaultError::Network { .. } => {
                format!("{}. Check connectivity and credentials; local history is intact.", self)
            }
            _ => self.to_string(),
        }
    }
}

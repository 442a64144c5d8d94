//! # Snapvault - scheduled, git-backed snapshots with safe restore
//!
//! Snapvault periodically mirrors an application data directory into a git
//! working copy, commits each change set as a snapshot and pushes it to a
//! remote. An operator can list, describe, diff, annotate and prune
//! snapshots, and roll the directory back to any of them.
//!
//! ## Overview
//!
//! - The source directory is only ever read
//! - Durable storage is delegated to a version-control backend behind the
//!   [`VersionStore`](store::VersionStore) trait ([`GitStore`] in production)
//! - A push failure never loses a snapshot: the backup is reported as
//!   degraded and the commit stays local until the next successful push
//! - A restore always leaves the target either as it was or exactly as the
//!   selected snapshot, and a full safety copy is taken before anything is
//!   touched
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use snapvault::{VaultBuilder, VaultConfig};
//! use std::path::Path;
//!
//! # fn main() -> snapvault::Result<()> {
//! let config = VaultConfig::load(Path::new("snapvault.json"))?;
//! let vault = VaultBuilder::new(config).build()?;
//!
//! // Take a snapshot now
//! let result = vault.backup(Some("before upgrade"))?;
//! println!("{:?}: {} files changed", result.status, result.changed_files);
//!
//! // Roll back to the second newest snapshot
//! let restored = vault.restore("2", None)?;
//! println!("Previous content kept at {}", restored.safety_snapshot.display());
//! # Ok(())
//! # }
//! ```
//!
//! ## Selectors
//!
//! Snapshots are picked with [`Selector`]s, parsed from operator input:
//!
//! | Input | Meaning |
//! |---|---|
//! | `head`, `latest` | newest snapshot |
//! | `3`, `#3` | third newest |
//! | `id:a1b2`, `a1b2c3d` | id prefix; ambiguity is an error |
//! | `text:nightly`, `before upgrade` | newest snapshot whose description contains the text |
//!
//! ## Module Organization
//!
//! - [`config`]: configuration file, environment overrides, schedule
//! - [`store`]: version store trait, git and in-memory adapters
//! - [`mirror`]: one-way source → working copy sync
//! - [`backup`]: the backup cycle
//! - [`history`]: listing, selection, diff, amendment, prune
//! - [`restore`]: safety snapshot, staged checkout, rename swap
//! - [`scheduler`]: timer loop
//! - [`lock`]: pid-file workspace lock
//! - [`types`]: shared data types and hooks
//! - [`error`]: error types and handling

pub mod backup;
pub mod config;
pub mod error;
pub mod history;
pub mod lock;
pub mod mirror;
pub mod restore;
pub mod scheduler;
pub mod store;
pub mod types;
pub mod utils;
pub mod vault;

// Re-export main types for convenience
pub use backup::BackupEngine;
pub use config::{RemoteConfig, Schedule, Secret, VaultConfig};
pub use error::{ErrorKind, RestoreStep, Result, VaultError};
pub use history::{HistoryCatalog, SnapshotDetails};
pub use restore::RestoreEngine;
pub use scheduler::{CycleRunner, Scheduler, SchedulerState};
pub use store::{GitStore, MemoryStore, RetryPolicy, VersionStore};
pub use types::*;
pub use vault::{Vault, VaultBuilder};

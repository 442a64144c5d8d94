//! Backup cycle: mirror, detect changes, commit, push
//!
//! One [`BackupEngine::run_cycle`] call performs a complete cycle under the
//! working-copy lock and reports its outcome as a [`BackupResult`]. Only a
//! held lock is returned as an error; every other failure is folded into a
//! `Failed` result so the scheduler can log it and carry on.

use crate::error::{Result, VaultError};
use crate::lock::WorkspaceLock;
use crate::mirror::Mirror;
use crate::store::{RetryPolicy, VersionStore};
use crate::types::{
    BackupResult, BackupStatus, CycleStep, FailureDetail, FileChange, Trigger, VaultHook,
    TRIGGER_TRAILER,
};
use chrono::{DateTime, Local, Utc};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Names listed per group in a commit message before collapsing the rest
const MAX_NAMES_PER_GROUP: usize = 5;

/// Runs backup cycles for one source and working copy
pub struct BackupEngine {
    store: Arc<dyn VersionStore>,
    mirror: Mirror,
    source: PathBuf,
    retry: RetryPolicy,
    hooks: Vec<Arc<dyn VaultHook>>,
}

type StepResult<T> = std::result::Result<T, (CycleStep, VaultError)>;

impl BackupEngine {
    /// Create an engine mirroring `source` into the store's working copy
    pub fn new(store: Arc<dyn VersionStore>, mirror: Mirror, source: impl Into<PathBuf>) -> Self {
        Self {
            store,
            mirror,
            source: source.into(),
            retry: RetryPolicy::default(),
            hooks: Vec::new(),
        }
    }

    /// Set the push retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Add a hook that receives every result
    pub fn with_hook(mut self, hook: Arc<dyn VaultHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Source directory being backed up
    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Working copy the store versions
    pub fn working_copy(&self) -> &Path {
        self.store.root()
    }

    /// Run one complete cycle
    ///
    /// # Errors
    ///
    /// - [`VaultError::AlreadyRunning`] if another backup, restore or prune
    ///   holds the working-copy lock. Nothing is touched in that case.
    #[instrument(skip(self, description), fields(trigger = trigger.as_str()))]
    pub fn run_cycle(&self, trigger: Trigger, description: Option<&str>) -> Result<BackupResult> {
        let _lock = WorkspaceLock::acquire(self.store.root())?;
        let clock = Instant::now();

        let mut result = BackupResult {
            status: BackupStatus::Failed,
            trigger,
            changed_files: 0,
            snapshot: None,
            pushed: false,
            mirror: None,
            error: None,
            started_at: Utc::now(),
            duration_ms: 0,
        };

        if let Err((step, err)) = self.cycle(&mut result, description) {
            warn!(?step, %err, "Backup cycle failed");
            result.status = BackupStatus::Failed;
            result.error = Some(FailureDetail::new(step, &err));
        }
        result.duration_ms = clock.elapsed().as_millis() as u64;

        for hook in &self.hooks {
            hook.post_backup(&result);
        }
        Ok(result)
    }

    fn cycle(&self, result: &mut BackupResult, description: Option<&str>) -> StepResult<()> {
        let at = |step: CycleStep| move |err: VaultError| (step, err);

        verify_source(&self.source).map_err(at(CycleStep::VerifySource))?;
        self.store.init().map_err(at(CycleStep::Init))?;

        let summary = self
            .mirror
            .sync(&self.source, self.store.root())
            .map_err(at(CycleStep::Mirror))?;
        result.mirror = Some(summary);

        self.store.stage_all().map_err(at(CycleStep::Detect))?;
        let changes = self.store.pending_changes().map_err(at(CycleStep::Detect))?;
        if changes.is_empty() {
            info!("No changes since the last snapshot");
            result.status = BackupStatus::NoChanges;
            return Ok(());
        }

        let message = build_commit_message(result.trigger, description, &changes, Local::now());
        let id = match self.store.commit(&message) {
            Ok(id) => id,
            Err(VaultError::NoChanges) => {
                result.status = BackupStatus::NoChanges;
                return Ok(());
            }
            Err(err) => return Err((CycleStep::Commit, err)),
        };
        info!(id = id.short(), changed = changes.len(), "Snapshot committed");
        result.snapshot = Some(id);
        result.changed_files = changes.len();

        if !self.store.has_remote() {
            debug!("No remote configured, snapshot kept locally");
            result.status = BackupStatus::Success;
            return Ok(());
        }

        match self.retry.run("push", || self.store.push()) {
            Ok(()) => {
                result.pushed = true;
                result.status = BackupStatus::Success;
            }
            Err(err) => {
                warn!(%err, "Push failed, snapshot kept locally");
                result.status = BackupStatus::SuccessDegraded;
                result.error = Some(FailureDetail::new(CycleStep::Push, &err));
            }
        }
        Ok(())
    }
}

fn verify_source(source: &Path) -> Result<()> {
    Mirror::check_source(source)?;
    let empty = fs::read_dir(source)
        .map_err(|e| VaultError::source_unavailable(source, format!("unreadable: {}", e)))?
        .next()
        .is_none();
    if empty {
        return Err(VaultError::source_unavailable(source, "directory is empty"));
    }
    Ok(())
}

/// Build the commit message for a snapshot
///
/// ```text
/// Automatic backup 2026-03-14 03:00:00
///
/// (top level): ~settings.json
/// chats: +alice/3.jsonl, ~alice/2.jsonl
///
/// 3 files changed
///
/// Snapvault-Trigger: scheduled
/// ```
pub fn build_commit_message(
    trigger: Trigger,
    description: Option<&str>,
    changes: &[FileChange],
    at: DateTime<Local>,
) -> String {
    let label = match trigger {
        Trigger::Scheduled => "Automatic backup",
        Trigger::Manual => "Manual backup",
    };
    let mut message = format!("{} {}", label, at.format("%Y-%m-%d %H:%M:%S"));

    if let Some(text) = description.map(str::trim).filter(|t| !t.is_empty()) {
        message.push_str("\n\n");
        message.push_str(text);
    }

    let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for change in changes {
        let mut components = change.path.components();
        let first = components
            .next()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .unwrap_or_default();
        let rest = components.as_path();
        let (group, name) = if rest.as_os_str().is_empty() {
            ("(top level)".to_string(), first)
        } else {
            (first, rest.to_string_lossy().into_owned())
        };
        groups
            .entry(group)
            .or_default()
            .push(format!("{}{}", change.kind.marker(), name));
    }

    if !groups.is_empty() {
        message.push_str("\n\n");
        let lines: Vec<String> = groups
            .into_iter()
            .map(|(group, names)| {
                let mut line = format!(
                    "{}: {}",
                    group,
                    names.iter().take(MAX_NAMES_PER_GROUP).cloned().collect::<Vec<_>>().join(", ")
                );
                if names.len() > MAX_NAMES_PER_GROUP {
                    line.push_str(&format!(" (+{} more)", names.len() - MAX_NAMES_PER_GROUP));
                }
                line
            })
            .collect();
        message.push_str(&lines.join("\n"));
    }

    let noun = if changes.len() == 1 { "file" } else { "files" };
    message.push_str(&format!("\n\n{} {} changed", changes.len(), noun));
    message.push_str(&format!("\n\n{}: {}\n", TRIGGER_TRAILER, trigger.as_str()));
    message
}

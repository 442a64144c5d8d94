//! Safe rollback of a directory to a snapshot
//!
//! ## Overview
//!
//! [`RestoreEngine::restore`] replaces a target directory with the content
//! of one snapshot. The target is always either its pre-restore state or the
//! snapshot's state:
//!
//! 1. resolve the selector (nothing is touched if this fails)
//! 2. lock the working copy and the target
//! 3. copy the target to a fresh, timestamped safety snapshot
//! 4. check the snapshot out into a staging directory next to the target
//! 5. rename the target aside and the staging directory into place,
//!    renaming the old target back if the second rename fails
//! 6. remove the aside copy
//!
//! A target that cannot be renamed (a mount point, or a parent on another
//! filesystem) is swapped in place instead: staging and aside directories
//! live inside the target and its top-level entries are moved one by one,
//! moving them back if any move fails. A symbolic link given as the target
//! is resolved first, so the link itself is left alone.
//!
//! Safety snapshots are never deleted by snapvault.

use crate::error::{RestoreStep, Result, VaultError};
use crate::history::HistoryCatalog;
use crate::lock::WorkspaceLock;
use crate::store::VersionStore;
use crate::types::{CommitMeta, RestoreResult, Selector, VaultHook};
use crate::utils;
use chrono::Local;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// How the staged snapshot replaces the target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SwapStrategy {
    /// Stage next to the target and rename the whole directory
    Rename,
    /// Stage inside the target and move its top-level entries
    InPlace,
}

/// A failed step before or during the swap
type StepFailure = (RestoreStep, VaultError);

/// Restores snapshots into target directories
pub struct RestoreEngine {
    store: Arc<dyn VersionStore>,
    catalog: Arc<HistoryCatalog>,
    safety_root: PathBuf,
    hooks: Vec<Arc<dyn VaultHook>>,
}

impl RestoreEngine {
    /// Create an engine writing safety snapshots under `safety_root`
    pub fn new(
        store: Arc<dyn VersionStore>,
        catalog: Arc<HistoryCatalog>,
        safety_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            catalog,
            safety_root: safety_root.into(),
            hooks: Vec::new(),
        }
    }

    /// Add a hook consulted before and informed after each restore
    pub fn with_hook(mut self, hook: Arc<dyn VaultHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Directory safety snapshots are written to
    pub fn safety_root(&self) -> &Path {
        &self.safety_root
    }

    /// Replace `target` with the content of the selected snapshot
    ///
    /// # Errors
    ///
    /// - [`VaultError::NotFound`] / [`VaultError::AmbiguousSelector`] before anything is touched
    /// - [`VaultError::AlreadyRunning`] if a backup or another restore holds a lock
    /// - [`VaultError::SafetySnapshot`] if the pre-restore copy cannot be made
    /// - [`VaultError::RestoreFailed`] for later failures; the target is unchanged
    /// - [`VaultError::RestoreIntegrity`] if rolling back the swap failed
    #[instrument(skip(self), fields(target = ?target))]
    pub fn restore(&self, selector: &Selector, target: &Path) -> Result<RestoreResult> {
        let (_, meta) = self.catalog.resolve(selector)?;
        let result = self.restore_resolved(&meta, target);
        match &result {
            Ok(restored) => {
                for hook in &self.hooks {
                    hook.post_restore(restored);
                }
            }
            Err(err) => {
                for hook in &self.hooks {
                    hook.restore_failed(err);
                }
            }
        }
        result
    }

    fn restore_resolved(&self, meta: &CommitMeta, target: &Path) -> Result<RestoreResult> {
        let clock = Instant::now();
        let target = &resolve_target(target)?;
        self.check_paths(target)?;

        let _wc_lock = WorkspaceLock::acquire(self.store.root())?;
        let _target_lock = WorkspaceLock::acquire(target)?;
        info!(version = meta.id.short(), "Restoring snapshot");

        let safety_snapshot = self.take_safety_snapshot(target)?;
        let failed = |(step, source): StepFailure| match source {
            VaultError::RestoreIntegrity { .. } => source,
            source => VaultError::RestoreFailed {
                safety_snapshot: safety_snapshot.clone(),
                step,
                source: Box::new(source),
            },
        };

        for hook in &self.hooks {
            hook.pre_restore(meta, target)
                .map_err(|e| failed((RestoreStep::Hook, e)))?;
        }

        let strategy = swap_strategy(target);
        let swapped = match self.stage_and_swap(meta, target, strategy) {
            Err((RestoreStep::Swap, VaultError::Io(err)))
                if strategy == SwapStrategy::Rename && cannot_rename(&err) =>
            {
                warn!(?target, %err, "Target cannot be renamed, swapping entries in place");
                self.stage_and_swap(meta, target, SwapStrategy::InPlace)
            }
            other => other,
        };
        let (files_restored, warnings) = swapped.map_err(failed)?;

        let result = RestoreResult {
            version: meta.id.clone(),
            target: target.to_path_buf(),
            safety_snapshot,
            files_restored,
            duration_ms: clock.elapsed().as_millis() as u64,
            warnings,
        };
        info!(version = meta.id.short(), files_restored, "Restore complete");
        Ok(result)
    }

    /// Check the snapshot out and put it in place of `target`
    ///
    /// Returns the number of restored files and any cleanup warnings.
    fn stage_and_swap(
        &self,
        meta: &CommitMeta,
        target: &Path,
        strategy: SwapStrategy,
    ) -> std::result::Result<(usize, Vec<String>), StepFailure> {
        let checkout = |e: VaultError| (RestoreStep::Checkout, e);
        let swap = |e: VaultError| (RestoreStep::Swap, e);

        let staging_parent = match strategy {
            SwapStrategy::Rename => parent_of(target).map_err(checkout)?,
            SwapStrategy::InPlace => target.to_path_buf(),
        };
        let staging = tempfile::Builder::new()
            .prefix(".snapvault-staging-")
            .tempdir_in(&staging_parent)
            .map_err(|e| checkout(e.into()))?;
        self.store.checkout(&meta.id, staging.path()).map_err(checkout)?;
        let files_restored = utils::count_files(staging.path()).map_err(checkout)?;
        debug!(files_restored, staging = ?staging.path(), ?strategy, "Snapshot staged");

        let aside = match strategy {
            SwapStrategy::Rename => {
                if let Ok(metadata) = fs::metadata(target) {
                    utils::set_permissions(staging.path(), utils::get_permissions(&metadata))
                        .map_err(checkout)?;
                }
                let aside = sibling(target, "snapvault-aside");
                swap_into_place(staging.path(), target, &aside).map_err(swap)?;
                aside
            }
            SwapStrategy::InPlace => {
                let aside = target.join(format!(
                    ".snapvault-aside-{}",
                    Local::now().format("%Y%m%d_%H%M%S%.f")
                ));
                fs::create_dir(&aside).map_err(|e| swap(e.into()))?;
                let skip = [staging.path(), aside.as_path()];
                if let Err(err) = swap_entries_in_place(staging.path(), target, &aside, &skip) {
                    if !matches!(err, VaultError::RestoreIntegrity { .. }) {
                        if let Err(cleanup) = fs::remove_dir(&aside) {
                            warn!(?aside, %cleanup, "Failed to remove empty aside directory");
                        }
                    }
                    return Err(swap(err));
                }
                aside
            }
        };
        // Staging is now either the target itself or empty
        drop(staging);

        let mut warnings = Vec::new();
        if aside.exists() {
            if let Err(err) = fs::remove_dir_all(&aside) {
                warn!(?aside, %err, "Failed to remove previous target content");
                warnings.push(format!("previous content left at {}: {}", aside.display(), err));
            }
        }
        Ok((files_restored, warnings))
    }

    fn check_paths(&self, target: &Path) -> Result<()> {
        let root = self.store.root();
        if utils::is_within(target, root) || utils::is_within(root, target) {
            return Err(VaultError::config(format!(
                "restore target {:?} must not overlap the working copy {:?}",
                target, root
            )));
        }
        if utils::is_within(&self.safety_root, target) {
            return Err(VaultError::config(format!(
                "safety snapshot root {:?} must be outside the restore target {:?}",
                self.safety_root, target
            )));
        }
        if target.exists() && !target.is_dir() {
            return Err(VaultError::config(format!("restore target {:?} is not a directory", target)));
        }
        Ok(())
    }

    fn take_safety_snapshot(&self, target: &Path) -> Result<PathBuf> {
        let path = self.next_safety_path(target);
        let to_error = |reason: String| VaultError::SafetySnapshot {
            path: path.clone(),
            reason,
        };

        fs::create_dir_all(&self.safety_root).map_err(|e| to_error(e.to_string()))?;
        if target.exists() {
            match utils::copy_tree(target, &path) {
                Ok(stats) => debug!(?path, files = stats.files, "Safety snapshot taken"),
                Err(err) => {
                    error!(?path, %err, "Safety snapshot failed, restore aborted");
                    return Err(to_error(err.to_string()));
                }
            }
        } else {
            fs::create_dir(&path).map_err(|e| to_error(e.to_string()))?;
        }
        info!(?path, "Safety snapshot ready");
        Ok(path)
    }

    fn next_safety_path(&self, target: &Path) -> PathBuf {
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "target".to_string());
        let base = format!("{}.safety-{}", name, Local::now().format("%Y%m%d_%H%M%S"));
        let mut candidate = self.safety_root.join(&base);
        let mut n = 1;
        while candidate.exists() {
            candidate = self.safety_root.join(format!("{}-{}", base, n));
            n += 1;
        }
        candidate
    }
}

/// Follow a symbolic link given as the target so the link survives the swap
fn resolve_target(target: &Path) -> Result<PathBuf> {
    match fs::symlink_metadata(target) {
        Ok(metadata) if metadata.file_type().is_symlink() => {
            let resolved = fs::canonicalize(target)?;
            debug!(?target, ?resolved, "Restore target is a symbolic link");
            Ok(resolved)
        }
        _ => Ok(target.to_path_buf()),
    }
}

/// Rename unless the target is a mount point
fn swap_strategy(target: &Path) -> SwapStrategy {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        let parent = target.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
        if let (Ok(own), Ok(above)) = (fs::metadata(target), fs::metadata(parent)) {
            if own.dev() != above.dev() {
                return SwapStrategy::InPlace;
            }
        }
    }
    SwapStrategy::Rename
}

/// Errors a whole-directory rename gives for mount points and cross-device moves
fn cannot_rename(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ResourceBusy | io::ErrorKind::CrossesDevices
    )
}

fn parent_of(target: &Path) -> Result<PathBuf> {
    let parent = match target.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        Some(_) => PathBuf::from("."),
        None => {
            return Err(VaultError::config(format!(
                "restore target {:?} has no parent directory",
                target
            )))
        }
    };
    fs::create_dir_all(&parent)?;
    Ok(parent)
}

/// `<parent>/.<name>.<label>-<timestamp>`, unique at the time of the call
fn sibling(target: &Path, label: &str) -> PathBuf {
    let mut name = OsString::from(".");
    name.push(target.file_name().unwrap_or_default());
    let base = format!(".{}-{}", label, Local::now().format("%Y%m%d_%H%M%S"));
    name.push(&base);
    let mut candidate = target.with_file_name(&name);
    let mut n = 1;
    while candidate.exists() {
        let mut numbered = name.clone();
        numbered.push(format!("-{}", n));
        candidate = target.with_file_name(numbered);
        n += 1;
    }
    candidate
}

/// Move `staging` to `target`, keeping the old target at `aside` until it succeeds
fn swap_into_place(staging: &Path, target: &Path, aside: &Path) -> Result<()> {
    let had_target = target.exists();
    if had_target {
        fs::rename(target, aside)?;
    }
    if let Err(err) = fs::rename(staging, target) {
        if had_target {
            if let Err(rollback) = fs::rename(aside, target) {
                error!(?target, ?aside, %rollback, "Rollback of restore swap failed");
                return Err(VaultError::RestoreIntegrity {
                    target: target.to_path_buf(),
                    aside: aside.to_path_buf(),
                    detail: format!("swap failed ({}), rollback failed ({})", err, rollback),
                });
            }
            warn!(?target, %err, "Swap failed, previous content put back");
        }
        return Err(err.into());
    }
    Ok(())
}

/// Replace the top-level entries of `target` with those of `staging`
///
/// Old entries go into `aside`; paths in `skip` stay where they are. On
/// failure every entry is moved back and the error returned, or
/// `RestoreIntegrity` if moving back fails too.
fn swap_entries_in_place(staging: &Path, target: &Path, aside: &Path, skip: &[&Path]) -> Result<()> {
    let list = |dir: &Path| -> Result<Vec<OsString>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if !skip.contains(&entry.path().as_path()) {
                names.push(entry.file_name());
            }
        }
        Ok(names)
    };
    let old_entries = list(target)?;
    let new_entries = list(staging)?;

    let mut moved_out = Vec::new();
    let mut moved_in = Vec::new();
    let outcome = (|| -> io::Result<()> {
        for name in &old_entries {
            fs::rename(target.join(name), aside.join(name))?;
            moved_out.push(name);
        }
        for name in &new_entries {
            fs::rename(staging.join(name), target.join(name))?;
            moved_in.push(name);
        }
        Ok(())
    })();

    let Err(err) = outcome else {
        return Ok(());
    };
    let mut rollback_errors = Vec::new();
    for name in moved_in.iter().rev() {
        if let Err(e) = fs::rename(target.join(name), staging.join(name)) {
            rollback_errors.push(format!("{:?}: {}", name, e));
        }
    }
    for name in moved_out.iter().rev() {
        if let Err(e) = fs::rename(aside.join(name), target.join(name)) {
            rollback_errors.push(format!("{:?}: {}", name, e));
        }
    }
    if !rollback_errors.is_empty() {
        error!(?target, ?aside, "Rollback of in-place restore swap failed");
        return Err(VaultError::RestoreIntegrity {
            target: target.to_path_buf(),
            aside: aside.to_path_buf(),
            detail: format!("swap failed ({}), rollback failed ({})", err, rollback_errors.join("; ")),
        });
    }
    warn!(?target, %err, "In-place swap failed, previous content put back");
    Err(err.into())
}

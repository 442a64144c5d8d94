//! Vault facade and builder
//!
//! [`Vault`] wires the engines together from one [`VaultConfig`] and is what
//! the command line talks to. Selectors are accepted as operator-typed
//! strings (see [`HistoryCatalog::resolve_str`]).

use crate::backup::BackupEngine;
use crate::config::VaultConfig;
use crate::error::{Result, VaultError};
use crate::history::{HistoryCatalog, SnapshotDetails};
use crate::mirror::Mirror;
use crate::restore::RestoreEngine;
use crate::scheduler::Scheduler;
use crate::store::{GitStore, RetryPolicy, VersionStore};
use crate::types::{
    BackupResult, CommitMeta, FileChange, PruneResult, RestoreResult, Selector, TracingHook,
    Trigger, VaultHook,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Configured backup/restore engine for one source directory
///
/// # Examples
///
/// ```rust,no_run
/// use snapvault::{VaultBuilder, VaultConfig};
///
/// # fn main() -> snapvault::Result<()> {
/// let config = VaultConfig::new("/var/app/data", "/var/backups/app-data");
/// let vault = VaultBuilder::new(config)
///     .exclude(vec!["**/*.tmp".to_string()])
///     .build()?;
///
/// let result = vault.backup(Some("before upgrade"))?;
/// println!("{:?}", result.status);
///
/// for meta in vault.list(Some(5))? {
///     println!("{} {}", meta.id.short(), meta.summary());
/// }
/// # Ok(())
/// # }
/// ```
pub struct Vault {
    config: VaultConfig,
    store: Arc<dyn VersionStore>,
    backup: Arc<BackupEngine>,
    catalog: Arc<HistoryCatalog>,
    restore: RestoreEngine,
}

impl std::fmt::Debug for Vault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vault")
            .field("config", &self.config.redacted())
            .field("working_copy", &self.store.root())
            .finish()
    }
}

impl Vault {
    /// Configuration this vault was built from
    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    /// Version store backing this vault
    pub fn store(&self) -> &Arc<dyn VersionStore> {
        &self.store
    }

    /// Run a manual backup cycle
    pub fn backup(&self, description: Option<&str>) -> Result<BackupResult> {
        self.backup.run_cycle(Trigger::Manual, description)
    }

    /// Scheduler running backups on the configured schedule
    pub fn scheduler(&self) -> Scheduler {
        Scheduler::new(self.backup.clone(), self.config.schedule)
    }

    /// Snapshots, newest first
    pub fn list(&self, limit: Option<usize>) -> Result<Vec<CommitMeta>> {
        self.catalog.list(limit)
    }

    /// Resolve a selector string to its position and metadata
    pub fn resolve(&self, selector: &str) -> Result<(usize, CommitMeta)> {
        self.catalog.resolve_str(selector)
    }

    /// Metadata and changed paths of one snapshot
    pub fn describe(&self, selector: &str) -> Result<SnapshotDetails> {
        self.catalog.describe(&self.pin(selector)?)
    }

    /// Paths changed between two snapshots; `to` defaults to the newest
    pub fn diff(&self, from: &str, to: Option<&str>) -> Result<Vec<FileChange>> {
        let from = self.pin(from)?;
        let to = to.map(|raw| self.pin(raw)).transpose()?;
        self.catalog.diff(&from, to.as_ref())
    }

    /// Changes between a snapshot (default: newest) and the live source
    pub fn compare(&self, selector: Option<&str>) -> Result<Vec<FileChange>> {
        let selector = selector.map(|raw| self.pin(raw)).transpose()?;
        self.catalog.compare_with_source(selector.as_ref())
    }

    /// Replace a snapshot's description; its id does not change
    pub fn amend(&self, selector: &str, text: &str) -> Result<CommitMeta> {
        self.catalog.amend_description(&self.pin(selector)?, text)
    }

    /// Restore a snapshot into `target`, or into the source directory
    #[instrument(skip(self))]
    pub fn restore(&self, selector: &str, target: Option<&Path>) -> Result<RestoreResult> {
        let selector = self.pin(selector)?;
        let target = target.unwrap_or(&self.config.source);
        self.restore.restore(&selector, target)
    }

    /// Remove the newest snapshot (history rewrite)
    pub fn prune(&self) -> Result<PruneResult> {
        self.catalog.prune_latest()
    }

    /// Pull snapshots from the remote
    pub fn refresh(&self) -> Result<()> {
        self.catalog.refresh()
    }

    /// Resolve once, then refer to the snapshot by its full id
    fn pin(&self, raw: &str) -> Result<Selector> {
        let (_, meta) = self.catalog.resolve_str(raw)?;
        debug!(raw, id = meta.id.short(), "Selector resolved");
        Ok(Selector::Id(meta.id.as_str().to_string()))
    }
}

/// Builder for [`Vault`]
///
/// Settings given to the builder override the corresponding configuration
/// fields. A [`TracingHook`] is installed unless [`without_default_hook`]
/// is called.
///
/// [`without_default_hook`]: VaultBuilder::without_default_hook
pub struct VaultBuilder {
    config: VaultConfig,
    hooks: Vec<Arc<dyn VaultHook>>,
    default_hook: bool,
}

impl VaultBuilder {
    /// Start from a configuration
    pub fn new(config: VaultConfig) -> Self {
        Self {
            config,
            hooks: Vec::new(),
            default_hook: true,
        }
    }

    /// Exclude patterns, relative to the source root
    pub fn exclude(mut self, patterns: Vec<String>) -> Self {
        self.config.exclude = patterns;
        self
    }

    /// Directory safety snapshots are written to
    pub fn safety_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.safety_root = Some(path.into());
        self
    }

    /// Push/pull retry policy
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.config.retry = retry;
        self
    }

    /// Parallel copy workers
    pub fn parallel_workers(mut self, count: usize) -> Self {
        self.config.workers = Some(count);
        self
    }

    /// Add a hook receiving backup and restore outcomes
    pub fn hook(mut self, hook: Arc<dyn VaultHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Do not install the [`TracingHook`]
    pub fn without_default_hook(mut self) -> Self {
        self.default_hook = false;
        self
    }

    /// Build a vault backed by the `git` command line
    ///
    /// # Errors
    ///
    /// - [`VaultError::InvalidConfiguration`] if the configuration does not validate
    ///   or `git` is not installed
    pub fn build(self) -> Result<Vault> {
        self.config.validate()?;
        if !GitStore::is_available() {
            return Err(VaultError::config("git is not installed or not on PATH"));
        }
        let store = GitStore::new(
            &self.config.working_copy,
            self.config.remote.clone(),
            self.config.author.clone(),
        );
        self.build_with_store(Arc::new(store))
    }

    /// Build a vault on an existing store; its root is used as the working copy
    pub fn build_with_store(mut self, store: Arc<dyn VersionStore>) -> Result<Vault> {
        self.config.working_copy = store.root().to_path_buf();
        self.config.validate()?;

        let mirror = Mirror::new(&self.config.exclude)?.with_workers(self.config.workers());
        let mut hooks = self.hooks;
        if self.default_hook {
            hooks.insert(0, Arc::new(TracingHook));
        }

        let mut backup = BackupEngine::new(store.clone(), mirror.clone(), &self.config.source)
            .with_retry(self.config.retry);
        let mut restore = RestoreEngine::new(
            store.clone(),
            Arc::new(
                HistoryCatalog::new(store.clone(), mirror.clone(), &self.config.source)
                    .with_retry(self.config.retry),
            ),
            self.config.safety_root(),
        );
        for hook in &hooks {
            backup = backup.with_hook(hook.clone());
            restore = restore.with_hook(hook.clone());
        }
        let catalog = Arc::new(
            HistoryCatalog::new(store.clone(), mirror, &self.config.source).with_retry(self.config.retry),
        );

        info!(
            source = ?self.config.source,
            working_copy = ?self.config.working_copy,
            remote = store.has_remote(),
            "Vault ready"
        );
        Ok(Vault {
            config: self.config,
            store,
            backup: Arc::new(backup),
            catalog,
            restore,
        })
    }
}

//! Snapshot history: listing, selection, comparison and amendment
//!
//! ## Overview
//!
//! [`HistoryCatalog`] is the read side of the vault plus the two history
//! maintenance operations:
//!
//! - [`list`](HistoryCatalog::list) - newest first
//! - [`resolve`](HistoryCatalog::resolve) - map a [`Selector`] to exactly one snapshot
//! - [`describe`](HistoryCatalog::describe), [`diff`](HistoryCatalog::diff),
//!   [`compare_with_source`](HistoryCatalog::compare_with_source)
//! - [`amend_description`](HistoryCatalog::amend_description) - annotation,
//!   the version id never changes
//! - [`prune_latest`](HistoryCatalog::prune_latest) - the only history rewrite
//! - [`refresh`](HistoryCatalog::refresh) - pull from the remote
//!
//! ## Ordering
//!
//! Listings are sorted by commit time, newest first. The sort is stable, so
//! snapshots sharing a timestamp keep the backend's history order (child
//! before parent).

use crate::error::{Result, VaultError};
use crate::lock::WorkspaceLock;
use crate::mirror::Mirror;
use crate::store::{RetryPolicy, VersionStore};
use crate::types::{CommitMeta, FileChange, PruneResult, Selector, VersionId};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// A snapshot with its position and the paths it changed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotDetails {
    /// 1-based position in the newest-first listing
    pub position: usize,
    /// Snapshot metadata
    pub meta: CommitMeta,
    /// Changes relative to the parent snapshot
    pub changes: Vec<FileChange>,
}

/// Read and maintenance access to snapshot history
pub struct HistoryCatalog {
    store: Arc<dyn VersionStore>,
    mirror: Mirror,
    source: PathBuf,
    retry: RetryPolicy,
}

impl HistoryCatalog {
    /// Create a catalog over a store; `source` is used for live comparisons
    pub fn new(store: Arc<dyn VersionStore>, mirror: Mirror, source: impl Into<PathBuf>) -> Self {
        Self {
            store,
            mirror,
            source: source.into(),
            retry: RetryPolicy::default(),
        }
    }

    /// Set the retry policy for pull and force-push
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Snapshots, newest first, at most `limit`
    pub fn list(&self, limit: Option<usize>) -> Result<Vec<CommitMeta>> {
        let mut commits = self.store.log(None)?;
        commits.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        if let Some(limit) = limit {
            commits.truncate(limit);
        }
        Ok(commits)
    }

    /// Resolve a selector to its 1-based position and metadata
    ///
    /// # Errors
    ///
    /// - [`VaultError::NotFound`] if nothing matches
    /// - [`VaultError::AmbiguousSelector`] if an id prefix matches several snapshots
    pub fn resolve(&self, selector: &Selector) -> Result<(usize, CommitMeta)> {
        let commits = self.list(None)?;
        let not_found = || VaultError::NotFound(selector.to_string());

        let index = match selector {
            Selector::Head => {
                if commits.is_empty() {
                    return Err(not_found());
                }
                0
            }
            Selector::Position(n) => {
                if *n == 0 || *n > commits.len() {
                    return Err(not_found());
                }
                n - 1
            }
            Selector::Id(prefix) => {
                let prefix = prefix.to_lowercase();
                if prefix.is_empty() {
                    return Err(not_found());
                }
                let matches: Vec<usize> = commits
                    .iter()
                    .enumerate()
                    .filter(|(_, c)| c.id.as_str().starts_with(&prefix))
                    .map(|(i, _)| i)
                    .collect();
                match matches.as_slice() {
                    [] => return Err(not_found()),
                    [only] => *only,
                    many => match many.iter().find(|&&i| commits[i].id.as_str() == prefix) {
                        Some(&exact) => exact,
                        None => {
                            return Err(VaultError::AmbiguousSelector {
                                selector: prefix,
                                candidates: many
                                    .iter()
                                    .map(|&i| commits[i].id.short().to_string())
                                    .collect(),
                            })
                        }
                    },
                }
            }
            Selector::Text(text) => {
                if text.trim().is_empty() {
                    return Err(not_found());
                }
                commits
                    .iter()
                    .position(|c| c.matches_text(text))
                    .ok_or_else(not_found)?
            }
        };

        let meta = commits
            .into_iter()
            .nth(index)
            .ok_or_else(not_found)?;
        Ok((index + 1, meta))
    }

    /// Resolve an operator-typed selector string
    ///
    /// A bare hex string that matches no id is retried as a text search.
    pub fn resolve_str(&self, raw: &str) -> Result<(usize, CommitMeta)> {
        let selector: Selector = raw.parse()?;
        match self.resolve(&selector) {
            Err(VaultError::NotFound(_))
                if matches!(selector, Selector::Id(_)) && !raw.trim().starts_with("id:") =>
            {
                debug!(raw, "No id matches, falling back to text search");
                self.resolve(&Selector::Text(raw.trim().to_string()))
            }
            other => other,
        }
    }

    /// Paths changed by a snapshot relative to its parent
    pub fn changes_in(&self, id: &VersionId) -> Result<Vec<FileChange>> {
        let log = self.store.log(None)?;
        let index = log
            .iter()
            .position(|c| &c.id == id)
            .ok_or_else(|| VaultError::NotFound(id.to_string()))?;
        let parent = log.get(index + 1).map(|c| &c.id);
        self.store.diff(parent, id)
    }

    /// Metadata, position and changed paths of one snapshot
    pub fn describe(&self, selector: &Selector) -> Result<SnapshotDetails> {
        let (position, meta) = self.resolve(selector)?;
        let changes = self.changes_in(&meta.id)?;
        Ok(SnapshotDetails {
            position,
            meta,
            changes,
        })
    }

    /// Paths that differ between two snapshots; `to` defaults to the newest
    pub fn diff(&self, from: &Selector, to: Option<&Selector>) -> Result<Vec<FileChange>> {
        let (_, from) = self.resolve(from)?;
        let (_, to) = self.resolve(to.unwrap_or(&Selector::Head))?;
        self.store.diff(Some(&from.id), &to.id)
    }

    /// Changes needed to turn a snapshot (default: newest) into the live source tree
    #[instrument(skip(self))]
    pub fn compare_with_source(&self, selector: Option<&Selector>) -> Result<Vec<FileChange>> {
        let (_, meta) = self.resolve(selector.unwrap_or(&Selector::Head))?;
        Mirror::check_source(&self.source)?;

        let scratch = tempfile::Builder::new()
            .prefix("snapvault-compare-")
            .tempdir()?;
        self.store.checkout(&meta.id, scratch.path())?;
        self.mirror.compare(scratch.path(), &self.source)
    }

    /// Replace a snapshot's description without changing its id
    #[instrument(skip(self, text))]
    pub fn amend_description(&self, selector: &Selector, text: &str) -> Result<CommitMeta> {
        let text = text.trim();
        if text.is_empty() {
            return Err(VaultError::config("description must not be empty"));
        }
        let (_, meta) = self.resolve(selector)?;

        let _lock = WorkspaceLock::acquire(self.store.root())?;
        self.store.annotate(&meta.id, text)?;
        info!(id = meta.id.short(), "Description amended");

        if self.store.has_remote() {
            if let Err(err) = self.retry.run("push", || self.store.push()) {
                warn!(%err, "Amended description not pushed; it will go out with the next backup");
            }
        }

        let (_, refreshed) = self.resolve(&Selector::Id(meta.id.as_str().to_string()))?;
        Ok(refreshed)
    }

    /// Remove the newest snapshot
    ///
    /// This rewrites history: the removed id stays reachable only from
    /// copies made before the prune. With a remote configured the new
    /// history is force-pushed; a failed force-push is reported in the
    /// result, not as an error.
    #[instrument(skip(self))]
    pub fn prune_latest(&self) -> Result<PruneResult> {
        let _lock = WorkspaceLock::acquire(self.store.root())?;
        let removed = self
            .store
            .head()?
            .ok_or_else(|| VaultError::NotFound(Selector::Head.to_string()))?;
        let new_head = self.store.drop_head()?;
        warn!(removed = removed.short(), new_head = new_head.short(), "History rewritten: newest snapshot removed");

        let mut result = PruneResult {
            removed,
            new_head,
            pushed: false,
            history_rewritten: true,
            error: None,
        };
        if self.store.has_remote() {
            match self.retry.run("force-push", || self.store.force_push()) {
                Ok(()) => result.pushed = true,
                Err(err) => {
                    warn!(%err, "Force-push after prune failed");
                    result.error = Some(err.to_string());
                }
            }
        }
        Ok(result)
    }

    /// Bring in snapshots from the remote
    #[instrument(skip(self))]
    pub fn refresh(&self) -> Result<()> {
        if !self.store.has_remote() {
            return Err(VaultError::config("no remote configured"));
        }
        let _lock = WorkspaceLock::acquire(self.store.root())?;
        self.store.init()?;
        self.retry.run("pull", || self.store.pull())?;
        info!("History refreshed from remote");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::ChangeKind;
    use chrono::{TimeZone, Utc};
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        store: Arc<MemoryStore>,
        catalog: HistoryCatalog,
        ids: Vec<VersionId>,
    }

    /// Three snapshots: a.txt, then b.txt added, then a.txt modified
    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("data");
        fs::create_dir_all(&source).unwrap();
        let store = Arc::new(MemoryStore::new(dir.path().join("work")).with_remote());
        store.init().unwrap();

        let mut ids = Vec::new();
        let steps: [(&str, &[u8], &str); 3] = [
            ("a.txt", b"A", "first"),
            ("b.txt", b"B", "second"),
            ("a.txt", b"A2", "third"),
        ];
        for (i, (name, content, message)) in steps.iter().enumerate() {
            fs::write(store.root().join(name), content).unwrap();
            fs::write(source.join(name), content).unwrap();
            store.freeze_time(Some(Utc.with_ymd_and_hms(2026, 1, 1, 0, i as u32, 0).unwrap()));
            store.stage_all().unwrap();
            ids.push(store.commit(message).unwrap());
        }

        let catalog = HistoryCatalog::new(store.clone(), Mirror::new(&[]).unwrap(), &source)
            .with_retry(RetryPolicy::none());
        Fixture { dir, store, catalog, ids }
    }

    #[test]
    fn test_list_newest_first() {
        let f = fixture();
        let list = f.catalog.list(None).unwrap();
        let ids: Vec<_> = list.iter().map(|c| c.id.clone()).collect();
        assert_eq!(ids, vec![f.ids[2].clone(), f.ids[1].clone(), f.ids[0].clone()]);
        assert_eq!(f.catalog.list(Some(1)).unwrap().len(), 1);
        assert!(list.windows(2).all(|w| w[0].timestamp >= w[1].timestamp));
    }

    #[test]
    fn test_ties_keep_history_order() {
        let f = fixture();
        let tie = Utc.with_ymd_and_hms(2026, 1, 1, 0, 2, 0).unwrap();
        f.store.freeze_time(Some(tie));
        fs::write(f.store.root().join("c.txt"), b"C").unwrap();
        f.store.stage_all().unwrap();
        let fourth = f.store.commit("fourth").unwrap();

        let list = f.catalog.list(None).unwrap();
        assert_eq!(list[0].id, fourth);
        assert_eq!(list[1].id, f.ids[2]);
    }

    #[test]
    fn test_resolve_selectors() {
        let f = fixture();
        assert_eq!(f.catalog.resolve(&Selector::Position(1)).unwrap().1.id, f.ids[2]);
        assert_eq!(f.catalog.resolve(&Selector::Head).unwrap().1.id, f.ids[2]);
        assert_eq!(f.catalog.resolve(&Selector::Position(3)).unwrap().1.id, f.ids[0]);
        assert!(matches!(
            f.catalog.resolve(&Selector::Position(4)),
            Err(VaultError::NotFound(_))
        ));
        assert!(matches!(
            f.catalog.resolve(&Selector::Position(0)),
            Err(VaultError::NotFound(_))
        ));

        let short = f.ids[1].short().to_string();
        let (position, meta) = f.catalog.resolve(&Selector::Id(short)).unwrap();
        assert_eq!((position, meta.id), (2, f.ids[1].clone()));

        let (_, meta) = f.catalog.resolve(&Selector::Text("SECOND".to_string())).unwrap();
        assert_eq!(meta.id, f.ids[1]);
        assert!(f.catalog.resolve(&Selector::Text("nothing".to_string())).is_err());
    }

    #[test]
    fn test_ambiguous_prefix() {
        let f = fixture();
        let mut ids = f.ids.clone();
        // 17 or more ids guarantee two share a first hex digit
        for i in 0..15 {
            fs::write(f.store.root().join("n.txt"), i.to_string()).unwrap();
            f.store.stage_all().unwrap();
            ids.push(f.store.commit(&format!("extra {}", i)).unwrap());
        }
        let mut by_first: std::collections::HashMap<char, usize> = Default::default();
        for id in &ids {
            *by_first.entry(id.as_str().chars().next().unwrap()).or_default() += 1;
        }
        let (shared, _) = by_first.into_iter().find(|(_, n)| *n > 1).unwrap();

        let err = f.catalog.resolve(&Selector::Id(shared.to_string())).unwrap_err();
        match err {
            VaultError::AmbiguousSelector { candidates, .. } => assert!(candidates.len() > 1),
            other => panic!("unexpected error: {other}"),
        }
        let full = ids[0].as_str().to_string();
        assert_eq!(f.catalog.resolve(&Selector::Id(full)).unwrap().1.id, ids[0]);
    }

    #[test]
    fn test_resolve_str_falls_back_to_text() {
        let f = fixture();
        f.store.annotate(&f.ids[0], "deadbeef rollout").unwrap();
        let (position, meta) = f.catalog.resolve_str("deadbeef").unwrap();
        assert_eq!((position, meta.id), (3, f.ids[0].clone()));
        assert!(matches!(
            f.catalog.resolve_str("id:deadbeef"),
            Err(VaultError::NotFound(_))
        ));
        assert_eq!(f.catalog.resolve_str("#1").unwrap().1.id, f.ids[2]);
    }

    #[test]
    fn test_describe_and_diff() {
        let f = fixture();
        let details = f.catalog.describe(&Selector::Position(2)).unwrap();
        assert_eq!(details.position, 2);
        assert_eq!(details.changes, vec![FileChange::new("b.txt", ChangeKind::Added)]);

        let first = f.catalog.describe(&Selector::Position(3)).unwrap();
        assert_eq!(first.changes, vec![FileChange::new("a.txt", ChangeKind::Added)]);

        let changes = f.catalog.diff(&Selector::Position(3), None).unwrap();
        assert_eq!(
            changes,
            vec![
                FileChange::new("a.txt", ChangeKind::Modified),
                FileChange::new("b.txt", ChangeKind::Added),
            ]
        );
    }

    #[test]
    fn test_amend_keeps_id() {
        let f = fixture();
        let amended = f
            .catalog
            .amend_description(&Selector::Position(2), "  known good  ")
            .unwrap();
        assert_eq!(amended.id, f.ids[1]);
        assert_eq!(amended.description(), "known good");
        assert_eq!(f.catalog.list(None).unwrap().len(), 3);
        assert_eq!(
            f.catalog.resolve(&Selector::Text("known good".to_string())).unwrap().1.id,
            f.ids[1]
        );
        assert!(f.catalog.amend_description(&Selector::Head, " ").is_err());
    }

    #[test]
    fn test_compare_with_source() {
        let f = fixture();
        let source = f.dir.path().join("data");
        assert!(f.catalog.compare_with_source(None).unwrap().is_empty());

        fs::write(source.join("new.txt"), b"N").unwrap();
        let changes = f.catalog.compare_with_source(Some(&Selector::Position(3))).unwrap();
        assert_eq!(
            changes,
            vec![
                FileChange::new("a.txt", ChangeKind::Modified),
                FileChange::new("b.txt", ChangeKind::Added),
                FileChange::new("new.txt", ChangeKind::Added),
            ]
        );
    }

    #[test]
    fn test_prune_latest() {
        let f = fixture();
        f.store.push().unwrap();
        let result = f.catalog.prune_latest().unwrap();
        assert_eq!(result.removed, f.ids[2]);
        assert_eq!(result.new_head, f.ids[1]);
        assert!(result.pushed && result.history_rewritten);
        assert_eq!(f.store.remote_log(), vec![f.ids[1].clone(), f.ids[0].clone()]);
        assert_eq!(fs::read(f.store.root().join("a.txt")).unwrap(), b"A");

        f.catalog.prune_latest().unwrap();
        assert!(f.catalog.prune_latest().is_err());
    }

    #[test]
    fn test_prune_degraded_when_force_push_fails() {
        let f = fixture();
        f.store.fail_pushes(1);
        let result = f.catalog.prune_latest().unwrap();
        assert!(!result.pushed);
        assert!(result.error.is_some());
        assert_eq!(f.catalog.list(None).unwrap().len(), 2);
    }
}

//! In-memory version store
//!
//! Snapshots are kept as path → entry maps; the working copy is still a
//! real directory so the mirror and restore engines run unchanged against
//! it. A second in-memory history stands in for the remote. Pushes and
//! checkouts can be made to fail on demand.

use super::VersionStore;
use crate::error::{Result, VaultError};
use crate::types::{ChangeKind, CommitMeta, FileChange, VersionId};
use crate::utils;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tracing::{debug, trace};
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Entry {
    File { content: Vec<u8>, mode: u32 },
    Symlink(PathBuf),
}

type Tree = BTreeMap<PathBuf, Entry>;

#[derive(Debug, Clone)]
struct Snapshot {
    id: VersionId,
    timestamp: DateTime<Utc>,
    message: String,
    tree: Tree,
}

#[derive(Debug, Default)]
struct State {
    /// Oldest first
    history: Vec<Snapshot>,
    staged: Option<Tree>,
    notes: HashMap<VersionId, String>,
    remote: Option<RemoteState>,
    frozen_time: Option<DateTime<Utc>>,
    sequence: u64,
}

#[derive(Debug, Default, Clone)]
struct RemoteState {
    history: Vec<Snapshot>,
    notes: HashMap<VersionId, String>,
}

/// Version store that keeps history in memory
#[derive(Debug)]
pub struct MemoryStore {
    root: PathBuf,
    author: String,
    state: Mutex<State>,
    failing_pushes: AtomicU32,
    failing_checkout: AtomicBool,
    push_attempts: AtomicU32,
}

impl MemoryStore {
    /// Create a store for a working copy directory, without a remote
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            author: "snapvault".to_string(),
            state: Mutex::new(State::default()),
            failing_pushes: AtomicU32::new(0),
            failing_checkout: AtomicBool::new(false),
            push_attempts: AtomicU32::new(0),
        }
    }

    /// Attach an (initially empty) in-memory remote
    pub fn with_remote(self) -> Self {
        self.state.lock().remote = Some(RemoteState::default());
        self
    }

    /// Make the next `count` push attempts fail with a network error
    pub fn fail_pushes(&self, count: u32) {
        self.failing_pushes.store(count, Ordering::SeqCst);
    }

    /// Make every checkout fail until reset
    pub fn fail_checkout(&self, fail: bool) {
        self.failing_checkout.store(fail, Ordering::SeqCst);
    }

    /// Push attempts made so far, including failed ones
    pub fn push_attempts(&self) -> u32 {
        self.push_attempts.load(Ordering::SeqCst)
    }

    /// Pin the timestamp given to new snapshots (`None` restores the clock)
    pub fn freeze_time(&self, at: Option<DateTime<Utc>>) {
        self.state.lock().frozen_time = at;
    }

    /// Version ids present on the remote, newest first
    pub fn remote_log(&self) -> Vec<VersionId> {
        self.state
            .lock()
            .remote
            .as_ref()
            .map(|r| r.history.iter().rev().map(|s| s.id.clone()).collect())
            .unwrap_or_default()
    }

    /// Content of a file in a snapshot
    pub fn file_at(&self, id: &VersionId, path: &Path) -> Option<Vec<u8>> {
        let state = self.state.lock();
        let snapshot = state.history.iter().find(|s| &s.id == id)?;
        match snapshot.tree.get(path)? {
            Entry::File { content, .. } => Some(content.clone()),
            Entry::Symlink(_) => None,
        }
    }

    fn head_tree(state: &State) -> Tree {
        state
            .history
            .last()
            .map(|s| s.tree.clone())
            .unwrap_or_default()
    }

    fn find<'a>(state: &'a State, id: &VersionId) -> Result<&'a Snapshot> {
        state
            .history
            .iter()
            .find(|s| &s.id == id)
            .ok_or_else(|| VaultError::NotFound(id.to_string()))
    }

    fn scan(&self) -> Result<Tree> {
        let mut tree = Tree::new();
        if !self.root.exists() {
            return Ok(tree);
        }
        for entry in WalkDir::new(&self.root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || e.file_name() != ".git")
        {
            let entry = entry?;
            let file_type = entry.file_type();
            if file_type.is_dir() {
                continue;
            }
            let relative = utils::make_relative(entry.path(), &self.root)?;
            if file_type.is_symlink() {
                tree.insert(relative, Entry::Symlink(utils::read_symlink(entry.path())?));
            } else {
                let mode = utils::get_permissions(&entry.metadata()?);
                tree.insert(
                    relative,
                    Entry::File {
                        content: fs::read(entry.path())?,
                        mode,
                    },
                );
            }
        }
        Ok(tree)
    }

    fn write_tree(tree: &Tree, target: &Path) -> Result<()> {
        fs::create_dir_all(target)?;
        for (path, entry) in tree {
            let out = target.join(path);
            if let Some(parent) = out.parent() {
                fs::create_dir_all(parent)?;
            }
            match entry {
                Entry::File { content, mode } => {
                    fs::write(&out, content)?;
                    utils::set_permissions(&out, *mode)?;
                }
                Entry::Symlink(link) => utils::create_symlink(link, &out)?,
            }
        }
        Ok(())
    }

    fn reset_working_copy(&self, tree: &Tree) -> Result<()> {
        if self.root.exists() {
            for entry in fs::read_dir(&self.root)? {
                let entry = entry?;
                if entry.file_name() == ".git" {
                    continue;
                }
                if entry.file_type()?.is_dir() {
                    fs::remove_dir_all(entry.path())?;
                } else {
                    fs::remove_file(entry.path())?;
                }
            }
        }
        Self::write_tree(tree, &self.root)
    }

    fn meta(&self, state: &State, snapshot: &Snapshot) -> CommitMeta {
        CommitMeta::new(
            snapshot.id.clone(),
            snapshot.timestamp,
            self.author.clone(),
            snapshot.message.clone(),
            state.notes.get(&snapshot.id).cloned(),
        )
    }

    fn transmit(&self, force: bool) -> Result<()> {
        self.push_attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self.failing_pushes.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_pushes.store(failing - 1, Ordering::SeqCst);
            return Err(VaultError::Network {
                operation: "push".to_string(),
                attempts: 1,
                detail: "simulated network failure".to_string(),
            });
        }

        let mut state = self.state.lock();
        let local = state.history.clone();
        let notes = state.notes.clone();
        let remote = state
            .remote
            .as_mut()
            .ok_or_else(|| VaultError::config("no remote configured"))?;

        let fast_forward = remote.history.len() <= local.len()
            && remote
                .history
                .iter()
                .zip(local.iter())
                .all(|(r, l)| r.id == l.id);
        if !fast_forward && !force {
            return Err(VaultError::VersionStore {
                operation: "push".to_string(),
                status: Some(1),
                stderr: "rejected: non-fast-forward".to_string(),
            });
        }
        remote.history = local;
        remote.notes = notes;
        debug!(commits = remote.history.len(), force, "Pushed to in-memory remote");
        Ok(())
    }
}

fn diff_trees(from: &Tree, to: &Tree) -> Vec<FileChange> {
    let mut changes = Vec::new();
    for (path, entry) in to {
        match from.get(path) {
            None => changes.push(FileChange::new(path.clone(), ChangeKind::Added)),
            Some(old) if old != entry => changes.push(FileChange::new(path.clone(), ChangeKind::Modified)),
            Some(_) => {}
        }
    }
    for path in from.keys() {
        if !to.contains_key(path) {
            changes.push(FileChange::new(path.clone(), ChangeKind::Deleted));
        }
    }
    changes.sort();
    changes
}

impl VersionStore for MemoryStore {
    fn root(&self) -> &Path {
        &self.root
    }

    fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        Ok(())
    }

    fn stage_all(&self) -> Result<()> {
        let tree = self.scan()?;
        self.state.lock().staged = Some(tree);
        Ok(())
    }

    fn pending_changes(&self) -> Result<Vec<FileChange>> {
        let state = self.state.lock();
        Ok(match &state.staged {
            Some(staged) => diff_trees(&Self::head_tree(&state), staged),
            None => Vec::new(),
        })
    }

    fn commit(&self, message: &str) -> Result<VersionId> {
        let mut state = self.state.lock();
        let head = Self::head_tree(&state);
        let tree = match state.staged.take() {
            Some(tree) if tree != head => tree,
            other => {
                state.staged = other;
                return Err(VaultError::NoChanges);
            }
        };

        state.sequence += 1;
        let mut hasher = Sha256::new();
        hasher.update(state.sequence.to_le_bytes());
        hasher.update(message.as_bytes());
        for path in tree.keys() {
            hasher.update(path.to_string_lossy().as_bytes());
        }
        let id = VersionId::new(hex::encode(&hasher.finalize()[..20]));
        let timestamp = state.frozen_time.unwrap_or_else(Utc::now);

        state.history.push(Snapshot {
            id: id.clone(),
            timestamp,
            message: message.to_string(),
            tree,
        });
        trace!(id = id.short(), "Committed in-memory snapshot");
        Ok(id)
    }

    fn push(&self) -> Result<()> {
        self.transmit(false)
    }

    fn force_push(&self) -> Result<()> {
        self.transmit(true)
    }

    fn pull(&self) -> Result<()> {
        let mut state = self.state.lock();
        let Some(remote) = state.remote.clone() else {
            return Err(VaultError::config("no remote configured"));
        };
        let ahead = remote.history.len() > state.history.len()
            && state
                .history
                .iter()
                .zip(remote.history.iter())
                .all(|(l, r)| l.id == r.id);
        for (id, text) in remote.notes {
            state.notes.entry(id).or_insert(text);
        }
        if ahead {
            state.history = remote.history;
            state.staged = None;
            let tree = Self::head_tree(&state);
            drop(state);
            self.reset_working_copy(&tree)?;
        }
        Ok(())
    }

    fn log(&self, limit: Option<usize>) -> Result<Vec<CommitMeta>> {
        let state = self.state.lock();
        Ok(state
            .history
            .iter()
            .rev()
            .take(limit.unwrap_or(usize::MAX))
            .map(|s| self.meta(&state, s))
            .collect())
    }

    fn diff(&self, from: Option<&VersionId>, to: &VersionId) -> Result<Vec<FileChange>> {
        let state = self.state.lock();
        let to_tree = &Self::find(&state, to)?.tree;
        let empty = Tree::new();
        let from_tree = match from {
            Some(id) => &Self::find(&state, id)?.tree,
            None => &empty,
        };
        Ok(diff_trees(from_tree, to_tree))
    }

    fn checkout(&self, id: &VersionId, target: &Path) -> Result<()> {
        if self.failing_checkout.load(Ordering::SeqCst) {
            return Err(VaultError::VersionStore {
                operation: "checkout".to_string(),
                status: None,
                stderr: "simulated checkout failure".to_string(),
            });
        }
        let tree = {
            let state = self.state.lock();
            Self::find(&state, id)?.tree.clone()
        };
        Self::write_tree(&tree, target)
    }

    fn annotate(&self, id: &VersionId, text: &str) -> Result<()> {
        let mut state = self.state.lock();
        Self::find(&state, id)?;
        state.notes.insert(id.clone(), text.to_string());
        Ok(())
    }

    fn drop_head(&self) -> Result<VersionId> {
        let mut state = self.state.lock();
        if state.history.len() < 2 {
            return Err(VaultError::VersionStore {
                operation: "drop_head".to_string(),
                status: None,
                stderr: "refusing to remove the only snapshot".to_string(),
            });
        }
        state.history.pop();
        state.staged = None;
        let new_head = state
            .history
            .last()
            .map(|s| s.id.clone())
            .ok_or_else(|| VaultError::internal("history emptied while dropping head"))?;
        let tree = Self::head_tree(&state);
        drop(state);
        self.reset_working_copy(&tree)?;
        Ok(new_head)
    }

    fn has_remote(&self) -> bool {
        self.state.lock().remote.is_some()
    }

    fn head(&self) -> Result<Option<VersionId>> {
        Ok(self.state.lock().history.last().map(|s| s.id.clone()))
    }
}

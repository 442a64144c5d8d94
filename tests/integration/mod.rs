//! Integration tests for snapvault
//!
//! Drives the vault through realistic sequences of source mutations,
//! backups and restores, recording the expected tree after every snapshot.
//! Each scenario runs against the in-memory store and, when `git` is
//! installed, against a real repository.

use ::snapvault::config::AuthorConfig;
use ::snapvault::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tracing::info;

/// Relative path → content of every regular file under a root
pub type TreeContent = BTreeMap<PathBuf, Vec<u8>>;

/// Read a tree, skipping `.git`
pub fn read_tree(root: &Path) -> TreeContent {
    walkdir::WalkDir::new(root)
        .into_iter()
        .filter_entry(|e| e.file_name() != ".git")
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            (
                e.path().strip_prefix(root).unwrap().to_path_buf(),
                fs::read(e.path()).unwrap(),
            )
        })
        .collect()
}

/// Deterministic content generator
pub struct FileGenerator {
    pub rng: StdRng,
}

impl FileGenerator {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn generate_file_content(&mut self, size_range: Range<usize>) -> Vec<u8> {
        let size = self.rng.random_range(size_range);
        let mut content = vec![0u8; size];
        self.rng.fill(&mut content[..]);
        content
    }
}

/// Operations applied to the source, for failure messages
#[derive(Debug, Clone)]
pub enum TestOperation {
    CreateFile { path: PathBuf },
    ModifyFile { path: PathBuf },
    DeleteFile { path: PathBuf },
    Backup { id: Option<VersionId> },
    Restore { selector: String },
}

/// Backend a harness runs against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Memory,
    Git,
}

/// Vault over a temp source directory and one version store
pub struct VaultTestHarness {
    pub temp_dir: TempDir,
    pub source: PathBuf,
    pub kind: StoreKind,
    pub store: Arc<dyn VersionStore>,
    pub vault: Vault,
    pub file_generator: FileGenerator,
    pub operation_log: Vec<TestOperation>,
    /// Expected tree per snapshot id
    pub expected: BTreeMap<VersionId, TreeContent>,
}

impl VaultTestHarness {
    pub fn new() -> Self {
        Self::with_store(StoreKind::Memory, Vec::new())
    }

    pub fn with_excludes(exclude: Vec<String>) -> Self {
        Self::with_store(StoreKind::Memory, exclude)
    }

    pub fn with_store(kind: StoreKind, exclude: Vec<String>) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("data");
        fs::create_dir_all(&source).unwrap();
        let work = temp_dir.path().join("work");
        let store: Arc<dyn VersionStore> = match kind {
            StoreKind::Memory => Arc::new(MemoryStore::new(work).with_remote()),
            StoreKind::Git => Arc::new(GitStore::new(work, None, AuthorConfig::default())),
        };
        let vault = VaultBuilder::new(VaultConfig::new(&source, "unused"))
            .exclude(exclude)
            .safety_root(temp_dir.path().join("safety"))
            .retry(RetryPolicy { max_attempts: 2, initial_backoff_ms: 1 })
            .build_with_store(store.clone())
            .unwrap();

        Self {
            temp_dir,
            source,
            kind,
            store,
            vault,
            file_generator: FileGenerator::new(42),
            operation_log: Vec::new(),
            expected: BTreeMap::new(),
        }
    }

    /// Create `dirs` nested directories with `files` files each
    pub fn generate_project(&mut self, dirs: usize, files: usize, size: Range<usize>) -> anyhow::Result<()> {
        for d in 0..dirs {
            let dir = self.source.join(format!("dir_{}", d)).join("nested");
            fs::create_dir_all(&dir)?;
            for f in 0..files {
                let path = dir.join(format!("file_{}.bin", f));
                fs::write(&path, self.file_generator.generate_file_content(size.clone()))?;
                self.operation_log.push(TestOperation::CreateFile {
                    path: path.strip_prefix(&self.source)?.to_path_buf(),
                });
            }
        }
        Ok(())
    }

    /// Randomly modify, delete or add files
    pub fn mutate_files(&mut self, mutations: usize) -> anyhow::Result<()> {
        let mut files: Vec<PathBuf> = read_tree(&self.source).into_keys().collect();
        for i in 0..mutations {
            match self.file_generator.rng.random_range(0..3) {
                0 if !files.is_empty() => {
                    let idx = self.file_generator.rng.random_range(0..files.len());
                    let path = files[idx].clone();
                    fs::write(self.source.join(&path), self.file_generator.generate_file_content(1..512))?;
                    self.operation_log.push(TestOperation::ModifyFile { path });
                }
                1 if files.len() > 1 => {
                    let idx = self.file_generator.rng.random_range(0..files.len());
                    let path = files.remove(idx);
                    fs::remove_file(self.source.join(&path))?;
                    self.operation_log.push(TestOperation::DeleteFile { path });
                }
                _ => {
                    let path = PathBuf::from(format!("added/mutation_{}_{}.txt", self.operation_log.len(), i));
                    fs::create_dir_all(self.source.join("added"))?;
                    fs::write(self.source.join(&path), self.file_generator.generate_file_content(1..256))?;
                    files.push(path.clone());
                    self.operation_log.push(TestOperation::CreateFile { path });
                }
            }
        }
        Ok(())
    }

    /// Back up and remember the source tree under the new id
    pub fn backup(&mut self) -> BackupResult {
        let result = self.vault.backup(None).unwrap();
        if let Some(id) = &result.snapshot {
            self.expected.insert(id.clone(), read_tree(&self.source));
        }
        self.operation_log.push(TestOperation::Backup {
            id: result.snapshot.clone(),
        });
        result
    }

    pub fn restore(&mut self, selector: &str) -> RestoreResult {
        self.operation_log.push(TestOperation::Restore {
            selector: selector.to_string(),
        });
        self.vault.restore(selector, None).unwrap()
    }
}

impl Default for VaultTestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Run `scenario` on a fresh harness per available store
pub fn for_each_store(exclude: &[&str], scenario: impl Fn(&mut VaultTestHarness)) {
    let exclude: Vec<String> = exclude.iter().map(|p| p.to_string()).collect();
    for kind in [StoreKind::Memory, StoreKind::Git] {
        if kind == StoreKind::Git && !GitStore::is_available() {
            eprintln!("git not available, skipping git store run");
            continue;
        }
        let mut harness = VaultTestHarness::with_store(kind, exclude.clone());
        scenario(&mut harness);
        info!(?kind, operations = harness.operation_log.len(), "Scenario complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_snapshot_restores_exactly() {
        for_each_store(&[], |harness| {
            harness.generate_project(3, 4, 16..2048).unwrap();
            assert_eq!(harness.backup().status, BackupStatus::Success);

            for _ in 0..5 {
                harness.mutate_files(6).unwrap();
                let result = harness.backup();
                assert!(result.is_committed(), "{:?}", harness.operation_log);
                // Working copy equals the source after every backup
                assert_eq!(read_tree(harness.store.root()), read_tree(&harness.source));
            }

            let snapshots = harness.vault.list(None).unwrap();
            assert_eq!(snapshots.len(), harness.expected.len());
            for meta in snapshots {
                let selector = format!("id:{}", meta.id);
                let restored = harness.restore(&selector);
                assert_eq!(
                    read_tree(&harness.source),
                    harness.expected[&restored.version],
                    "{:?} {:?}",
                    harness.kind,
                    harness.operation_log
                );
            }
        });
    }

    #[test]
    fn test_adjacent_diff_matches_mutations() {
        for_each_store(&[], |harness| {
            fs::write(harness.source.join("keep.txt"), b"keep").unwrap();
            fs::write(harness.source.join("edit.txt"), b"v1").unwrap();
            fs::write(harness.source.join("drop.txt"), b"bye").unwrap();
            harness.backup();

            fs::write(harness.source.join("edit.txt"), b"v2").unwrap();
            fs::remove_file(harness.source.join("drop.txt")).unwrap();
            fs::create_dir_all(harness.source.join("sub")).unwrap();
            fs::write(harness.source.join("sub/new.txt"), b"new").unwrap();
            harness.backup();

            let changes = harness.vault.diff("2", Some("1")).unwrap();
            assert_eq!(
                changes,
                vec![
                    FileChange::new("drop.txt", ChangeKind::Deleted),
                    FileChange::new("edit.txt", ChangeKind::Modified),
                    FileChange::new("sub/new.txt", ChangeKind::Added),
                ]
            );
            assert_eq!(harness.vault.describe("head").unwrap().changes, changes);

            let message = &harness.vault.list(Some(1)).unwrap()[0].message;
            assert!(message.starts_with("Manual backup "));
            assert!(message.contains("(top level): -drop.txt, ~edit.txt"));
            assert!(message.contains("sub: +new.txt"));
            assert!(message.contains("3 files changed"));
        });
    }

    #[test]
    fn test_excluded_paths_never_reach_history() {
        for_each_store(&["**/*.tmp", "cache/**"], |harness| {
            fs::write(harness.source.join("data.json"), b"{}").unwrap();
            fs::write(harness.source.join("scratch.tmp"), b"x").unwrap();
            fs::create_dir_all(harness.source.join("cache")).unwrap();
            fs::write(harness.source.join("cache/blob"), b"x").unwrap();
            let result = harness.backup();
            assert_eq!(result.changed_files, 1);

            let target = harness.temp_dir.path().join("inspect");
            harness.vault.restore("1", Some(&target)).unwrap();
            assert_eq!(
                read_tree(&target).into_keys().collect::<Vec<_>>(),
                vec![PathBuf::from("data.json")]
            );

            // Changing only excluded files is not a change
            fs::write(harness.source.join("scratch.tmp"), b"y").unwrap();
            assert_eq!(harness.backup().status, BackupStatus::NoChanges);
        });
    }

    #[test]
    fn test_source_ignore_files_do_not_hide_content() {
        for_each_store(&[], |harness| {
            fs::write(harness.source.join("a.txt"), b"A").unwrap();
            fs::create_dir_all(harness.source.join("ext")).unwrap();
            fs::write(harness.source.join("ext/.gitignore"), b"*.json\n").unwrap();
            fs::write(harness.source.join("ext/settings.json"), b"{\"on\":true}").unwrap();
            fs::write(harness.source.join(".gitignore"), b"*.txt\n").unwrap();

            let result = harness.backup();
            assert_eq!(result.status, BackupStatus::Success);
            assert_eq!(result.changed_files, 4, "{:?}", harness.kind);

            let target = harness.temp_dir.path().join("inspect");
            harness.vault.restore("1", Some(&target)).unwrap();
            assert_eq!(read_tree(&target), read_tree(&harness.source), "{:?}", harness.kind);

            fs::write(harness.source.join("ext/settings.json"), b"{\"on\":false}").unwrap();
            let second = harness.backup();
            assert_eq!(second.status, BackupStatus::Success, "{:?}", harness.kind);
            assert_eq!(
                harness.vault.describe("1").unwrap().changes,
                vec![FileChange::new("ext/settings.json", ChangeKind::Modified)]
            );
        });
    }

    #[test]
    fn test_restore_into_separate_target_leaves_source_alone() {
        for_each_store(&[], |harness| {
            fs::write(harness.source.join("a.txt"), b"A").unwrap();
            harness.backup();
            fs::write(harness.source.join("a.txt"), b"A2").unwrap();

            let target = harness.temp_dir.path().join("inspect");
            let result = harness.vault.restore("1", Some(&target)).unwrap();
            assert_eq!(result.target, target);
            assert_eq!(fs::read(target.join("a.txt")).unwrap(), b"A");
            assert_eq!(fs::read(harness.source.join("a.txt")).unwrap(), b"A2");
        });
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinks_and_modes_survive_round_trip() {
        use std::os::unix::fs::PermissionsExt;

        for_each_store(&[], |harness| {
            let script = harness.source.join("run.sh");
            fs::write(&script, b"#!/bin/sh\n").unwrap();
            fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
            std::os::unix::fs::symlink("run.sh", harness.source.join("latest")).unwrap();
            harness.backup();

            fs::remove_file(&script).unwrap();
            fs::remove_file(harness.source.join("latest")).unwrap();
            fs::write(harness.source.join("other"), b"x").unwrap();
            harness.backup();

            harness.restore("2");
            let mode = fs::metadata(&script).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o755, "{:?}", harness.kind);
            assert_eq!(
                fs::read_link(harness.source.join("latest")).unwrap(),
                PathBuf::from("run.sh")
            );
            assert!(!harness.source.join("other").exists());
        });
    }

    #[cfg(unix)]
    #[test]
    fn test_private_file_modes_survive_restore() {
        use std::os::unix::fs::PermissionsExt;

        for_each_store(&[], |harness| {
            let secret = harness.source.join("secrets.json");
            fs::write(&secret, b"{\"api_key\":\"k\"}").unwrap();
            fs::write(harness.source.join("public.txt"), b"p").unwrap();
            fs::set_permissions(&secret, fs::Permissions::from_mode(0o600)).unwrap();
            fs::set_permissions(harness.source.join("public.txt"), fs::Permissions::from_mode(0o644)).unwrap();
            harness.backup();

            // Tightening a mode alone is a new snapshot
            fs::set_permissions(harness.source.join("public.txt"), fs::Permissions::from_mode(0o640)).unwrap();
            let chmod = harness.backup();
            assert_eq!(chmod.status, BackupStatus::Success, "{:?}", harness.kind);
            assert_eq!(chmod.changed_files, 1);

            let mode = |p: &Path| fs::metadata(p).unwrap().permissions().mode() & 0o777;
            for (selector, public_mode) in [("1", 0o640), ("2", 0o644)] {
                let target = harness.temp_dir.path().join(format!("inspect-{}", selector));
                harness.vault.restore(selector, Some(&target)).unwrap();
                assert_eq!(mode(&target.join("secrets.json")), 0o600, "{:?}", harness.kind);
                assert_eq!(mode(&target.join("public.txt")), public_mode, "{:?}", harness.kind);
            }
        });
    }

    #[test]
    fn test_compare_with_source_after_edits() {
        for_each_store(&[], |harness| {
            fs::write(harness.source.join("a.txt"), b"A").unwrap();
            fs::write(harness.source.join("b.txt"), b"B").unwrap();
            harness.backup();

            fs::write(harness.source.join("a.txt"), b"changed").unwrap();
            fs::remove_file(harness.source.join("b.txt")).unwrap();
            fs::write(harness.source.join("c.txt"), b"C").unwrap();

            assert_eq!(
                harness.vault.compare(None).unwrap(),
                vec![
                    FileChange::new("a.txt", ChangeKind::Modified),
                    FileChange::new("b.txt", ChangeKind::Deleted),
                    FileChange::new("c.txt", ChangeKind::Added),
                ]
            );
        });
    }
}

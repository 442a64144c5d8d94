//! Chaos testing for snapvault
//!
//! Injects failures into the version store (checkouts, pushes), races
//! concurrent triggers and removes the source underneath the engine, then
//! checks that history and the restore target are never left in a mixed
//! state.

use ::snapvault::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tracing::{info, warn};

use crate::integration::{read_tree, TreeContent};

/// Randomized failure schedule
pub struct ChaosEngine {
    rng: StdRng,
    pub push_failure_rate: f64,
    pub checkout_failure_rate: f64,
}

impl ChaosEngine {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            push_failure_rate: 0.3,
            checkout_failure_rate: 0.3,
        }
    }

    /// Arm the store's failure switches for the next operation
    pub fn arm(&mut self, store: &MemoryStore) {
        let fail_push = self.rng.random_bool(self.push_failure_rate);
        store.fail_pushes(if fail_push { 10 } else { 0 });
        store.fail_checkout(self.rng.random_bool(self.checkout_failure_rate));
    }

    pub fn pick(&mut self, len: usize) -> usize {
        self.rng.random_range(0..len)
    }

    pub fn bytes(&mut self) -> Vec<u8> {
        let len = self.rng.random_range(1..128);
        (0..len).map(|_| self.rng.random()).collect()
    }
}

/// Vault whose store can be made to fail
pub struct VaultChaosTest {
    pub temp_dir: TempDir,
    pub source: PathBuf,
    pub store: Arc<MemoryStore>,
    pub vault: Vault,
    pub chaos_engine: ChaosEngine,
}

impl VaultChaosTest {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("data");
        fs::create_dir_all(&source).unwrap();
        fs::write(source.join("seed.txt"), b"seed").unwrap();
        let store = Arc::new(MemoryStore::new(temp_dir.path().join("work")).with_remote());
        let vault = VaultBuilder::new(VaultConfig::new(&source, "unused"))
            .safety_root(temp_dir.path().join("safety"))
            .retry(RetryPolicy { max_attempts: 2, initial_backoff_ms: 1 })
            .build_with_store(store.clone())
            .unwrap();
        Self {
            temp_dir,
            source,
            store,
            vault,
            chaos_engine: ChaosEngine::new(42),
        }
    }

    pub fn safety_snapshots(&self) -> usize {
        let root = self.temp_dir.path().join("safety");
        fs::read_dir(root).map(|d| d.count()).unwrap_or(0)
    }
}

impl Default for VaultChaosTest {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_checkout_never_touches_target() {
        let chaos = VaultChaosTest::new();
        chaos.vault.backup(None).unwrap();
        fs::write(chaos.source.join("seed.txt"), b"edited").unwrap();
        fs::write(chaos.source.join("new.txt"), b"new").unwrap();
        let before = read_tree(&chaos.source);

        chaos.store.fail_checkout(true);
        let err = chaos.vault.restore("1", None).unwrap_err();
        match &err {
            VaultError::RestoreFailed { safety_snapshot, step, .. } => {
                assert_eq!(*step, RestoreStep::Checkout);
                assert_eq!(read_tree(safety_snapshot), before);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(read_tree(&chaos.source), before);
        assert!(err.user_message().contains("preserved at"));

        chaos.store.fail_checkout(false);
        chaos.vault.restore("1", None).unwrap();
        assert_eq!(fs::read(chaos.source.join("seed.txt")).unwrap(), b"seed");
        assert_eq!(chaos.safety_snapshots(), 2);
    }

    #[test]
    fn test_push_outage_degrades_then_catches_up() {
        let chaos = VaultChaosTest::new();
        chaos.store.fail_pushes(100);
        let degraded = chaos.vault.backup(None).unwrap();
        assert_eq!(degraded.status, BackupStatus::SuccessDegraded);
        assert!(!degraded.pushed);
        assert!(chaos.store.remote_log().is_empty());

        chaos.store.fail_pushes(0);
        fs::write(chaos.source.join("more.txt"), b"more").unwrap();
        let recovered = chaos.vault.backup(None).unwrap();
        assert_eq!(recovered.status, BackupStatus::Success);

        let local: Vec<VersionId> = chaos.vault.list(None).unwrap().into_iter().map(|m| m.id).collect();
        assert_eq!(chaos.store.remote_log(), local);
    }

    #[test]
    fn test_concurrent_triggers_commit_once() {
        let chaos = VaultChaosTest::new();
        let outcomes: Vec<Result<BackupResult>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| chaos.vault.backup(None)))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let mut committed = 0;
        for outcome in &outcomes {
            match outcome {
                Ok(result) if result.is_committed() => committed += 1,
                Ok(result) => assert_eq!(result.status, BackupStatus::NoChanges),
                Err(VaultError::AlreadyRunning { .. }) => {}
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(committed, 1);
        assert_eq!(chaos.vault.list(None).unwrap().len(), 1);
    }

    #[test]
    fn test_restore_blocked_by_running_backup() {
        let chaos = VaultChaosTest::new();
        chaos.vault.backup(None).unwrap();
        fs::write(chaos.source.join("live.txt"), b"live").unwrap();
        let before = read_tree(&chaos.source);

        let _held = lock::WorkspaceLock::acquire(chaos.store.root()).unwrap();
        let err = chaos.vault.restore("1", None).unwrap_err();
        assert!(matches!(err, VaultError::AlreadyRunning { .. }));
        assert_eq!(read_tree(&chaos.source), before);
        assert_eq!(chaos.safety_snapshots(), 0);
    }

    #[test]
    fn test_source_vanishes_between_cycles() {
        let chaos = VaultChaosTest::new();
        chaos.vault.backup(None).unwrap();

        fs::remove_dir_all(&chaos.source).unwrap();
        let failed = chaos.vault.backup(None).unwrap();
        assert_eq!(failed.status, BackupStatus::Failed);
        assert_eq!(failed.error.unwrap().kind, ErrorKind::SourceUnavailable);
        assert_eq!(chaos.vault.list(None).unwrap().len(), 1);
        // The working copy still holds the last mirrored state
        assert!(chaos.store.root().join("seed.txt").exists());

        fs::create_dir_all(&chaos.source).unwrap();
        fs::write(chaos.source.join("seed.txt"), b"back").unwrap();
        assert_eq!(chaos.vault.backup(None).unwrap().status, BackupStatus::Success);
    }

    #[test]
    fn test_prune_with_failing_force_push_is_reported() {
        let chaos = VaultChaosTest::new();
        chaos.vault.backup(None).unwrap();
        fs::write(chaos.source.join("b.txt"), b"B").unwrap();
        chaos.vault.backup(None).unwrap();

        chaos.store.fail_pushes(100);
        let result = chaos.vault.prune().unwrap();
        assert!(result.history_rewritten);
        assert!(!result.pushed);
        assert!(result.error.is_some());
        assert_eq!(chaos.vault.list(None).unwrap().len(), 1);
        assert!(!chaos.store.root().join("b.txt").exists());
    }

    #[test]
    fn test_random_failures_keep_invariants() {
        let mut chaos = VaultChaosTest::new();
        let mut expected: BTreeMap<VersionId, TreeContent> = BTreeMap::new();
        let mut files: Vec<PathBuf> = vec![PathBuf::from("seed.txt")];

        for round in 0..30 {
            chaos.chaos_engine.arm(&chaos.store);
            match chaos.chaos_engine.pick(3) {
                0 => {
                    let path = PathBuf::from(format!("f{}.txt", round));
                    fs::write(chaos.source.join(&path), chaos.chaos_engine.bytes()).unwrap();
                    files.push(path);
                }
                1 => {
                    let idx = chaos.chaos_engine.pick(files.len());
                    let bytes = chaos.chaos_engine.bytes();
                    fs::write(chaos.source.join(&files[idx]), bytes).unwrap();
                }
                _ => {}
            }

            let result = chaos.vault.backup(None).unwrap();
            assert_ne!(result.status, BackupStatus::Failed, "round {}: {:?}", round, result.error);
            if let Some(id) = result.snapshot {
                expected.insert(id, read_tree(&chaos.source));
            }

            if round % 5 == 4 {
                let snapshots = chaos.vault.list(None).unwrap();
                let pick = chaos.chaos_engine.pick(snapshots.len());
                let before = read_tree(&chaos.source);
                match chaos.vault.restore(&(pick + 1).to_string(), None) {
                    Ok(restored) => {
                        assert_eq!(read_tree(&chaos.source), expected[&restored.version]);
                        info!(round, version = restored.version.short(), "restored");
                    }
                    Err(VaultError::RestoreFailed { safety_snapshot, .. }) => {
                        assert_eq!(read_tree(&chaos.source), before);
                        assert_eq!(read_tree(&safety_snapshot), before);
                        warn!(round, "restore failed as injected");
                    }
                    Err(other) => panic!("round {}: unexpected error {other}", round),
                }
                files = read_tree(&chaos.source).into_keys().collect();
                if files.is_empty() {
                    fs::write(chaos.source.join("seed.txt"), b"seed").unwrap();
                    files.push(PathBuf::from("seed.txt"));
                }
            }
        }

        // Every snapshot in history is one we recorded
        for meta in chaos.vault.list(None).unwrap() {
            assert!(expected.contains_key(&meta.id));
        }
        assert!(Path::new(chaos.store.root()).exists());
    }
}

//! Main test module for snapvault
//!
//! This module includes all test suites:
//! - Integration tests for end-to-end scenarios
//! - Chaos tests for failure injection and concurrency
//! - Property-based tests for invariants

pub mod integration;
pub mod chaos;
pub mod property;

#[cfg(test)]
mod edge_cases {
    use ::snapvault::*;
    use std::fs;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Arc<MemoryStore>, Vault) {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("data");
        fs::create_dir_all(&source).unwrap();
        let store = Arc::new(MemoryStore::new(temp_dir.path().join("work")));
        let vault = VaultBuilder::new(VaultConfig::new(&source, "unused"))
            .safety_root(temp_dir.path().join("safety"))
            .build_with_store(store.clone())
            .unwrap();
        (temp_dir, store, vault)
    }

    #[test]
    fn test_empty_source_is_not_backed_up() {
        let (_temp_dir, store, vault) = setup();
        let result = vault.backup(None).unwrap();
        assert_eq!(result.status, BackupStatus::Failed);
        assert_eq!(result.error.unwrap().kind, ErrorKind::SourceUnavailable);
        assert!(store.log(None).unwrap().is_empty());
    }

    #[test]
    fn test_special_filenames() {
        let (temp_dir, _store, vault) = setup();
        let source = temp_dir.path().join("data");
        let special_names = vec![
            "file with spaces.txt",
            "file-with-dashes.txt",
            "file.with.dots.txt",
            "file@with#special$chars.txt",
            "file(with)parens.txt",
            "file[with]brackets.txt",
            "unicodé ñame.txt",
        ];
        let mut written = Vec::new();
        for name in &special_names {
            // Skip names the OS does not support
            if fs::write(source.join(name), format!("Content of {}", name)).is_ok() {
                written.push(*name);
            }
        }

        vault.backup(None).unwrap();
        for name in &written {
            fs::remove_file(source.join(name)).unwrap();
        }
        fs::write(source.join("other.txt"), b"x").unwrap();
        vault.backup(None).unwrap();

        vault.restore("2", None).unwrap();
        for name in &written {
            assert_eq!(
                fs::read_to_string(source.join(name)).unwrap(),
                format!("Content of {}", name)
            );
        }
        assert!(!source.join("other.txt").exists());
    }

    #[test]
    fn test_empty_files_and_deep_nesting() {
        let (temp_dir, _store, vault) = setup();
        let source = temp_dir.path().join("data");
        let deep = source.join("a/b/c/d/e/f/g/h");
        fs::create_dir_all(&deep).unwrap();
        fs::write(deep.join("empty"), b"").unwrap();
        fs::write(source.join("root.txt"), b"r").unwrap();

        let result = vault.backup(None).unwrap();
        assert_eq!(result.changed_files, 2);
        let details = vault.describe("head").unwrap();
        assert!(details
            .changes
            .contains(&FileChange::new("a/b/c/d/e/f/g/h/empty", ChangeKind::Added)));
    }

    #[test]
    fn test_nested_git_directory_in_source_is_skipped() {
        let (temp_dir, store, vault) = setup();
        let source = temp_dir.path().join("data");
        fs::create_dir_all(source.join("plugin/.git")).unwrap();
        fs::write(source.join("plugin/.git/HEAD"), b"ref: refs/heads/main").unwrap();
        fs::write(source.join("plugin/main.js"), b"js").unwrap();

        let id = vault.backup(None).unwrap().snapshot.unwrap();
        assert!(store.file_at(&id, std::path::Path::new("plugin/main.js")).is_some());
        assert!(store.file_at(&id, std::path::Path::new("plugin/.git/HEAD")).is_none());
    }

    #[test]
    fn test_selector_edge_cases() {
        let (temp_dir, _store, vault) = setup();
        fs::write(temp_dir.path().join("data/a.txt"), b"A").unwrap();
        vault.backup(Some("deploy 2026")).unwrap();

        assert!(matches!(vault.resolve("0"), Err(VaultError::NotFound(_))));
        assert!(matches!(vault.resolve("#2"), Err(VaultError::NotFound(_))));
        assert!(matches!(vault.resolve("   "), Err(VaultError::NotFound(_))));
        assert!(matches!(vault.resolve("#x"), Err(VaultError::NotFound(_))));
        assert_eq!(vault.resolve("DEPLOY").unwrap().0, 1);
        assert_eq!(vault.resolve("latest").unwrap().0, 1);
    }

    #[test]
    fn test_amend_with_blank_text_is_rejected() {
        let (temp_dir, _store, vault) = setup();
        fs::write(temp_dir.path().join("data/a.txt"), b"A").unwrap();
        vault.backup(None).unwrap();
        assert!(matches!(
            vault.amend("head", "   "),
            Err(VaultError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_prune_refuses_the_only_snapshot() {
        let (temp_dir, _store, vault) = setup();
        fs::write(temp_dir.path().join("data/a.txt"), b"A").unwrap();
        vault.backup(None).unwrap();
        assert!(vault.prune().is_err());
        assert_eq!(vault.list(None).unwrap().len(), 1);
    }

    #[test]
    fn test_operations_on_empty_history() {
        let (_temp_dir, _store, vault) = setup();
        assert!(vault.list(None).unwrap().is_empty());
        assert!(matches!(vault.describe("head"), Err(VaultError::NotFound(_))));
        assert!(matches!(vault.restore("1", None), Err(VaultError::NotFound(_))));
        assert!(matches!(vault.refresh(), Err(VaultError::InvalidConfiguration(_))));
    }
}

//! Property-based testing for snapvault
//!
//! Uses proptest to check mirror equivalence, listing order, diff
//! correctness and selector parsing over generated inputs.

use ::snapvault::*;
use chrono::{TimeZone, Utc};
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

use crate::integration::read_tree;

/// Generate relative file paths; directories never contain a dot and files always do
fn path_strategy() -> impl Strategy<Value = PathBuf> {
    (
        prop::collection::vec("[a-z]{1,6}", 0..=2),
        "[a-z]{1,8}\\.txt",
    )
        .prop_map(|(dirs, file)| {
            let mut path = PathBuf::new();
            for dir in dirs {
                path.push(dir);
            }
            path.push(file);
            path
        })
}

fn tree_strategy() -> impl Strategy<Value = BTreeMap<PathBuf, Vec<u8>>> {
    prop::collection::btree_map(path_strategy(), prop::collection::vec(any::<u8>(), 0..256), 1..12)
}

fn write_tree(root: &Path, tree: &BTreeMap<PathBuf, Vec<u8>>) {
    if root.exists() {
        fs::remove_dir_all(root).unwrap();
    }
    fs::create_dir_all(root).unwrap();
    for (path, content) in tree {
        let full = root.join(path);
        fs::create_dir_all(full.parent().unwrap()).unwrap();
        fs::write(full, content).unwrap();
    }
}

fn expected_changes(a: &BTreeMap<PathBuf, Vec<u8>>, b: &BTreeMap<PathBuf, Vec<u8>>) -> Vec<FileChange> {
    let mut changes = Vec::new();
    let paths: std::collections::BTreeSet<&PathBuf> = a.keys().chain(b.keys()).collect();
    for path in paths {
        match (a.get(path), b.get(path)) {
            (Some(_), None) => changes.push(FileChange::new(path.clone(), ChangeKind::Deleted)),
            (None, Some(_)) => changes.push(FileChange::new(path.clone(), ChangeKind::Added)),
            (Some(x), Some(y)) if x != y => changes.push(FileChange::new(path.clone(), ChangeKind::Modified)),
            _ => {}
        }
    }
    changes
}

fn setup() -> (TempDir, PathBuf, Arc<MemoryStore>, Vault) {
    let temp_dir = TempDir::new().unwrap();
    let source = temp_dir.path().join("data");
    fs::create_dir_all(&source).unwrap();
    let store = Arc::new(MemoryStore::new(temp_dir.path().join("work")));
    let vault = VaultBuilder::new(VaultConfig::new(&source, "unused"))
        .safety_root(temp_dir.path().join("safety"))
        .without_default_hook()
        .build_with_store(store.clone())
        .unwrap();
    (temp_dir, source, store, vault)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_backup_mirrors_source_exactly(tree in tree_strategy()) {
        let (_temp_dir, source, store, vault) = setup();
        write_tree(&source, &tree);

        let first = vault.backup(None).unwrap();
        prop_assert_eq!(first.status, BackupStatus::Success);
        prop_assert_eq!(read_tree(store.root()), tree.clone());

        let id = first.snapshot.unwrap();
        for (path, content) in &tree {
            prop_assert_eq!(store.file_at(&id, path), Some(content.clone()));
        }

        let second = vault.backup(None).unwrap();
        prop_assert_eq!(second.status, BackupStatus::NoChanges);
    }

    #[test]
    fn prop_adjacent_diff_matches_tree_difference(a in tree_strategy(), b in tree_strategy()) {
        prop_assume!(a != b);
        let (_temp_dir, source, _store, vault) = setup();

        write_tree(&source, &a);
        vault.backup(None).unwrap();
        write_tree(&source, &b);
        let second = vault.backup(None).unwrap();
        prop_assert_eq!(second.status, BackupStatus::Success);

        let expected = expected_changes(&a, &b);
        prop_assert_eq!(second.changed_files, expected.len());
        prop_assert_eq!(vault.diff("2", Some("1")).unwrap(), expected.clone());
        prop_assert_eq!(vault.describe("1").unwrap().changes, expected);
    }

    #[test]
    fn prop_listing_is_newest_first(times in prop::collection::vec(0i64..2_000_000_000, 1..8)) {
        let (_temp_dir, source, store, vault) = setup();
        for (i, secs) in times.iter().enumerate() {
            store.freeze_time(Utc.timestamp_opt(*secs, 0).single());
            fs::write(source.join(format!("f{}.txt", i)), b"x").unwrap();
            prop_assert!(vault.backup(None).unwrap().is_committed());
        }

        let list = vault.list(None).unwrap();
        prop_assert_eq!(list.len(), times.len());
        for pair in list.windows(2) {
            prop_assert!(pair[0].timestamp >= pair[1].timestamp);
        }
        let (position, head) = vault.resolve("1").unwrap();
        prop_assert_eq!(position, 1);
        prop_assert_eq!(&head.id, &list[0].id);
        for (i, meta) in list.iter().enumerate() {
            prop_assert_eq!(&vault.resolve(&format!("#{}", i + 1)).unwrap().1.id, &meta.id);
        }
    }

    #[test]
    fn prop_selector_display_parses_back(n in 1usize..1_000_000, id in "[0-9a-f]{4,40}", text in "[a-zA-Z][a-zA-Z0-9 ]{0,20}[a-zA-Z]") {
        for selector in [
            Selector::Position(n),
            Selector::Id(id.clone()),
            Selector::Text(text.clone()),
            Selector::Head,
        ] {
            let parsed: Selector = selector.to_string().parse().unwrap();
            prop_assert_eq!(parsed, selector);
        }
    }

    #[test]
    fn prop_bare_input_classification(n in 1usize..999_999, word in "[g-z]{3,12}") {
        prop_assert_eq!(n.to_string().parse::<Selector>().unwrap(), Selector::Position(n));
        prop_assert_eq!(word.parse::<Selector>().unwrap(), Selector::Text(word.clone()));
    }
}

//! One-way mirroring of the source tree into the working copy
//!
//! ## Overview
//!
//! [`Mirror::sync`] makes the working copy's content equal to the source's,
//! modulo exclude patterns:
//!
//! - new and changed files are copied (content compared by size, then SHA-256)
//! - entries missing from the source are deleted from the working copy
//! - symbolic links are recreated with the same target and never followed
//! - unix permission bits and file mtimes are carried over
//! - every file is written through a temp file in the destination directory
//!   and renamed into place
//!
//! The source is only ever read. Anything named `.git` is never mirrored,
//! nor is a [`MODE_MANIFEST`] file at the source root, and the working
//! copy's own `.git` is never touched. Whether permission bits survive into
//! a snapshot is up to the store: [`GitStore`](crate::store::GitStore)
//! records them in its manifest.
//!
//! ## Example
//!
//! ```rust,no_run
//! use snapvault::mirror::Mirror;
//! use std::path::Path;
//!
//! # fn example() -> snapvault::Result<()> {
//! let mirror = Mirror::new(&["**/*.tmp".to_string()])?;
//! let summary = mirror.sync(Path::new("/var/app/data"), Path::new("/var/backups/app-data"))?;
//! println!("{} copied, {} updated, {} deleted", summary.copied, summary.updated, summary.deleted);
//! # Ok(())
//! # }
//! ```

use crate::error::{Result, VaultError};
use crate::store::MODE_MANIFEST;
use crate::types::{ChangeKind, ChangeSummary, FileChange};
use crate::utils;
use filetime::FileTime;
use globset::{Glob, GlobSet, GlobSetBuilder};
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, trace};
use walkdir::WalkDir;

/// Kind of a scanned entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    /// Regular file
    File,
    /// Directory
    Directory,
    /// Symbolic link and its target
    Symlink(PathBuf),
}

/// One entry found by [`Mirror::scan`]
#[derive(Debug, Clone)]
pub struct ScannedEntry {
    /// Entry kind
    pub kind: EntryKind,
    /// Size in bytes (files only)
    pub size: u64,
    /// Permission bits
    pub mode: u32,
    /// Last modification time
    pub mtime: FileTime,
}

/// Entries of a tree keyed by path relative to its root
pub type TreeScan = BTreeMap<PathBuf, ScannedEntry>;

/// Source → working copy synchronizer
#[derive(Debug, Clone)]
pub struct Mirror {
    excludes: GlobSet,
    workers: usize,
}

enum FileAction {
    Copy { path: PathBuf, replace: bool },
    Chmod { path: PathBuf, mode: u32 },
    Keep,
}

impl Mirror {
    /// Create a mirror with glob exclude patterns relative to the source root
    pub fn new(patterns: &[String]) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            builder.add(Glob::new(pattern)?);
        }
        Ok(Self {
            excludes: builder.build()?,
            workers: num_cpus::get(),
        })
    }

    /// Set the number of parallel copy workers
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Check whether a relative path is excluded from mirroring
    pub fn is_excluded(&self, relative: &Path) -> bool {
        relative.components().any(|c| c.as_os_str() == ".git")
            || relative == Path::new(MODE_MANIFEST)
            || self.excludes.is_match(relative)
    }

    /// Fail with `SourceUnavailable` unless `source` is a readable directory
    pub fn check_source(source: &Path) -> Result<()> {
        let metadata = fs::metadata(source)
            .map_err(|e| VaultError::source_unavailable(source, format!("cannot stat: {}", e)))?;
        if !metadata.is_dir() {
            return Err(VaultError::source_unavailable(source, "not a directory"));
        }
        fs::read_dir(source)
            .map_err(|e| VaultError::source_unavailable(source, format!("unreadable: {}", e)))?;
        Ok(())
    }

    /// Scan a tree, honoring excludes and skipping `.git`
    pub fn scan(&self, root: &Path) -> Result<TreeScan> {
        let mut entries = TreeScan::new();
        let walker = WalkDir::new(root)
            .follow_links(false)
            .min_depth(1)
            .into_iter()
            .filter_entry(|e| match e.path().strip_prefix(root) {
                Ok(relative) => !self.is_excluded(relative),
                Err(_) => true,
            });

        for entry in walker {
            let (relative, scanned) = scan_entry(&entry?, root)?;
            entries.insert(relative, scanned);
        }
        Ok(entries)
    }

    /// Scan the working copy: everything except its root `.git`, excludes not applied
    fn scan_working_copy(root: &Path) -> Result<TreeScan> {
        let mut entries = TreeScan::new();
        if !root.exists() {
            return Ok(entries);
        }
        let walker = WalkDir::new(root)
            .follow_links(false)
            .min_depth(1)
            .into_iter()
            .filter_entry(|e| !(e.depth() == 1 && e.file_name() == ".git"));
        for entry in walker {
            let (relative, scanned) = scan_entry(&entry?, root)?;
            entries.insert(relative, scanned);
        }
        Ok(entries)
    }

    /// Make `working_copy` mirror `source`
    ///
    /// Counts in the returned summary cover files and symbolic links;
    /// directories are created and removed as needed but not counted.
    ///
    /// # Errors
    ///
    /// - [`VaultError::SourceUnavailable`] if the source is missing, not a
    ///   directory, or cannot be read while scanning
    /// - [`VaultError::Io`] for failures writing the working copy
    #[instrument(skip(self), fields(workers = self.workers))]
    pub fn sync(&self, source: &Path, working_copy: &Path) -> Result<ChangeSummary> {
        Self::check_source(source)?;
        fs::create_dir_all(working_copy)?;

        let source_entries = self.scan(source).map_err(|e| match e {
            VaultError::WalkDir(err) => VaultError::source_unavailable(
                err.path().unwrap_or(source).to_path_buf(),
                format!("unreadable: {}", err),
            ),
            other => other,
        })?;
        let dest_entries = Self::scan_working_copy(working_copy)?;
        let mut summary = ChangeSummary::default();

        // Deletions, deepest first, including entries whose kind changed
        let mut removals: Vec<(&PathBuf, &ScannedEntry)> = dest_entries
            .iter()
            .filter(|(path, dest)| match source_entries.get(*path) {
                None => true,
                Some(src) => !same_kind(&src.kind, &dest.kind),
            })
            .collect();
        removals.sort_by_key(|(path, _)| std::cmp::Reverse(path.components().count()));
        for (relative, entry) in removals {
            let target = working_copy.join(relative);
            let result = match entry.kind {
                EntryKind::Directory => fs::remove_dir_all(&target),
                _ => fs::remove_file(&target),
            };
            match result {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            }
            if entry.kind != EntryKind::Directory && !source_entries.contains_key(relative) {
                summary.deleted += 1;
            }
            trace!(?relative, "Removed from working copy");
        }

        // Directories, parents first
        for (relative, entry) in &source_entries {
            if entry.kind == EntryKind::Directory {
                fs::create_dir_all(working_copy.join(relative))?;
            }
        }

        // Files: compare and copy in parallel
        let files: Vec<(&PathBuf, &ScannedEntry)> = source_entries
            .iter()
            .filter(|(_, e)| e.kind == EntryKind::File)
            .collect();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .build()
            .map_err(|e| VaultError::internal(format!("failed to build copy pool: {}", e)))?;

        let outcomes: Vec<(FileAction, u64)> = pool.install(|| {
            files
                .par_iter()
                .map(|(relative, entry)| {
                    let src = source.join(relative);
                    let dest = working_copy.join(relative);
                    let action = plan_file(&src, &dest, relative, entry, dest_entries.get(*relative))?;
                    let bytes = match &action {
                        FileAction::Copy { .. } => copy_file(&src, &dest, entry)?,
                        FileAction::Chmod { mode, .. } => {
                            utils::set_permissions(&dest, *mode)?;
                            0
                        }
                        FileAction::Keep => 0,
                    };
                    Ok((action, bytes))
                })
                .collect::<Result<Vec<_>>>()
        })?;

        for (action, bytes) in outcomes {
            match action {
                FileAction::Copy { path, replace } => {
                    if replace {
                        summary.updated += 1;
                    } else {
                        summary.copied += 1;
                    }
                    summary.bytes_copied += bytes;
                    trace!(?path, bytes, "Copied file");
                }
                FileAction::Chmod { path, .. } => {
                    summary.updated += 1;
                    trace!(?path, "Updated permissions");
                }
                FileAction::Keep => summary.unchanged += 1,
            }
        }

        // Symbolic links
        for (relative, entry) in &source_entries {
            let EntryKind::Symlink(target) = &entry.kind else {
                continue;
            };
            let dest = working_copy.join(relative);
            match dest_entries.get(relative).map(|d| &d.kind) {
                Some(EntryKind::Symlink(existing)) if existing == target => summary.unchanged += 1,
                Some(EntryKind::Symlink(_)) => {
                    fs::remove_file(&dest)?;
                    utils::create_symlink(target, &dest)?;
                    summary.updated += 1;
                }
                _ => {
                    utils::create_symlink(target, &dest)?;
                    summary.copied += 1;
                }
            }
        }

        // Directory permissions last so read-only directories can be filled first
        for (relative, entry) in source_entries.iter().rev() {
            if entry.kind == EntryKind::Directory {
                let dest = working_copy.join(relative);
                let current = dest_entries.get(relative).map(|d| d.mode);
                if current != Some(entry.mode) {
                    utils::set_permissions(&dest, entry.mode)?;
                }
            }
        }

        info!(
            copied = summary.copied,
            updated = summary.updated,
            deleted = summary.deleted,
            unchanged = summary.unchanged,
            bytes = %utils::format_bytes(summary.bytes_copied),
            "Mirror sync complete"
        );
        Ok(summary)
    }

    /// Compare two trees: changes needed to turn `base` into `other`
    ///
    /// Files are compared by size, then content; directories are ignored.
    pub fn compare(&self, base: &Path, other: &Path) -> Result<Vec<FileChange>> {
        let left = self.scan(base)?;
        let right = self.scan(other)?;
        let mut changes = Vec::new();

        for (path, entry) in &right {
            if entry.kind == EntryKind::Directory {
                continue;
            }
            match left.get(path) {
                None => changes.push(FileChange::new(path.clone(), ChangeKind::Added)),
                Some(old) if old.kind == EntryKind::Directory => {
                    changes.push(FileChange::new(path.clone(), ChangeKind::Added))
                }
                Some(old) => {
                    let differs = match (&old.kind, &entry.kind) {
                        (EntryKind::File, EntryKind::File) => {
                            old.size != entry.size
                                || utils::hash_file_content(&base.join(path))?
                                    != utils::hash_file_content(&other.join(path))?
                        }
                        (a, b) => a != b,
                    };
                    if differs {
                        changes.push(FileChange::new(path.clone(), ChangeKind::Modified));
                    }
                }
            }
        }
        for (path, entry) in &left {
            if entry.kind == EntryKind::Directory {
                continue;
            }
            let gone = match right.get(path) {
                None => true,
                Some(now) => now.kind == EntryKind::Directory,
            };
            if gone {
                changes.push(FileChange::new(path.clone(), ChangeKind::Deleted));
            }
        }

        changes.sort();
        debug!(changes = changes.len(), "Compared trees");
        Ok(changes)
    }
}

fn scan_entry(entry: &walkdir::DirEntry, root: &Path) -> Result<(PathBuf, ScannedEntry)> {
    let relative = utils::make_relative(entry.path(), root)?;
    let metadata = entry.metadata()?;
    let kind = if entry.file_type().is_symlink() {
        EntryKind::Symlink(utils::read_symlink(entry.path())?)
    } else if entry.file_type().is_dir() {
        EntryKind::Directory
    } else {
        EntryKind::File
    };
    let scanned = ScannedEntry {
        size: if kind == EntryKind::File { metadata.len() } else { 0 },
        mode: utils::get_permissions(&metadata),
        mtime: FileTime::from_last_modification_time(&metadata),
        kind,
    };
    Ok((relative, scanned))
}

fn same_kind(a: &EntryKind, b: &EntryKind) -> bool {
    matches!(
        (a, b),
        (EntryKind::File, EntryKind::File)
            | (EntryKind::Directory, EntryKind::Directory)
            | (EntryKind::Symlink(_), EntryKind::Symlink(_))
    )
}

fn plan_file(
    src: &Path,
    dest: &Path,
    relative: &Path,
    entry: &ScannedEntry,
    existing: Option<&ScannedEntry>,
) -> Result<FileAction> {
    let Some(existing) = existing.filter(|e| e.kind == EntryKind::File) else {
        return Ok(FileAction::Copy {
            path: relative.to_path_buf(),
            replace: false,
        });
    };
    if existing.size != entry.size
        || utils::hash_file_content(src)? != utils::hash_file_content(dest)?
    {
        return Ok(FileAction::Copy {
            path: relative.to_path_buf(),
            replace: true,
        });
    }
    if existing.mode != entry.mode {
        return Ok(FileAction::Chmod {
            path: relative.to_path_buf(),
            mode: entry.mode,
        });
    }
    Ok(FileAction::Keep)
}

fn copy_file(src: &Path, dest: &Path, entry: &ScannedEntry) -> Result<u64> {
    let parent = dest
        .parent()
        .ok_or_else(|| VaultError::internal(format!("no parent directory for {:?}", dest)))?;
    let mut temp = tempfile::Builder::new()
        .prefix(".snapvault-tmp-")
        .tempfile_in(parent)?;
    let mut reader = File::open(src)?;
    let bytes = io::copy(&mut reader, temp.as_file_mut())?;
    utils::set_permissions(temp.path(), entry.mode)?;
    temp.persist(dest).map_err(|e| VaultError::Io(e.error))?;
    filetime::set_file_mtime(dest, entry.mtime)?;
    Ok(bytes)
}

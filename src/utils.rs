//! Utility functions for snapvault
//!
//! Helpers shared by the mirror, the restore engine and the version store
//! adapters: content hashing, permission handling, symbolic links, whole-tree
//! copies, atomic writes and credential redaction.
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use crate::utils::{hash_file_content, copy_tree, format_bytes};
//! use std::path::Path;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let hash = hash_file_content(Path::new("settings.json"))?;
//! assert_eq!(hash.len(), 64);
//!
//! let stats = copy_tree(Path::new("data"), Path::new("/backups/data.safety-20260101_030000"))?;
//! println!("copied {} files ({})", stats.files, format_bytes(stats.bytes));
//! # Ok(())
//! # }
//! ```
//!
//! ## Cross-Platform Behavior
//!
//! Permission bits are native on Unix. On Windows only the read-only flag is
//! carried, mapped from the owner write bit.

use crate::error::{Result, VaultError};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::trace;
use walkdir::WalkDir;

/// Hash a file's content using SHA-256
///
/// Reads the file through an 8KB buffer and returns the digest as a
/// 64-character hexadecimal string.
///
/// # Errors
///
/// - [`VaultError::Io`] if the file cannot be opened or read
pub fn hash_file_content(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 8192];

    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Get Unix permissions from metadata
#[cfg(unix)]
pub fn get_permissions(metadata: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

/// Get permissions from metadata (Windows implementation)
#[cfg(windows)]
pub fn get_permissions(metadata: &fs::Metadata) -> u32 {
    let mut mode = if metadata.permissions().readonly() { 0o444 } else { 0o644 };
    if metadata.is_dir() {
        mode |= 0o111;
    }
    mode
}

/// Set Unix permissions
#[cfg(unix)]
pub fn set_permissions(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

/// Set permissions (Windows implementation)
#[cfg(windows)]
pub fn set_permissions(path: &Path, mode: u32) -> Result<()> {
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_readonly(mode & 0o200 == 0);
    fs::set_permissions(path, perms)?;
    Ok(())
}

/// Create a symlink (cross-platform)
#[cfg(unix)]
pub fn create_symlink(target: &Path, link: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, link)?;
    Ok(())
}

/// Create a symlink (Windows)
#[cfg(windows)]
pub fn create_symlink(target: &Path, link: &Path) -> Result<()> {
    use std::os::windows::fs::{symlink_dir, symlink_file};

    if target.is_dir() {
        symlink_dir(target, link)?;
    } else {
        symlink_file(target, link)?;
    }
    Ok(())
}

/// Read symlink target
pub fn read_symlink(path: &Path) -> Result<PathBuf> {
    Ok(fs::read_link(path)?)
}

/// Make a path relative to a base path
///
/// Tries a lexical strip first so symbolic links keep their own path, and
/// only canonicalizes both sides when that fails.
///
/// # Errors
///
/// - [`VaultError::Internal`] if the path is not under the base path
/// - [`VaultError::Io`] if canonicalization fails
pub fn make_relative(path: &Path, base: &Path) -> Result<PathBuf> {
    if let Ok(relative) = path.strip_prefix(base) {
        return Ok(relative.to_path_buf());
    }

    let path_canon = path.canonicalize()?;
    let base_canon = base.canonicalize()?;

    path_canon
        .strip_prefix(&base_canon)
        .map(|p| p.to_path_buf())
        .map_err(|_| {
            VaultError::internal(format!(
                "Path {:?} is not relative to {:?}",
                path_canon, base_canon
            ))
        })
}

/// Check whether one path lies inside (or equals) another, resolving both when possible
pub fn is_within(path: &Path, base: &Path) -> bool {
    let normalize = |p: &Path| -> PathBuf {
        p.canonicalize().unwrap_or_else(|_| p.to_path_buf())
    };
    normalize(path).starts_with(normalize(base))
}

/// Format bytes in human-readable form
///
/// ```rust,ignore
/// assert_eq!(format_bytes(1023), "1023 B");
/// assert_eq!(format_bytes(1536), "1.50 KB");
/// ```
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", size as u64, UNITS[unit_idx])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}

/// Atomic file write (write to a temp file in the same directory, then rename)
///
/// The target is either left as it was or fully replaced; a failed write
/// removes its temp file.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut temp = tempfile::NamedTempFile::new_in(parent)?;
    temp.write_all(content)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| VaultError::Io(e.error))?;
    Ok(())
}

/// Counts from a whole-tree copy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyStats {
    /// Regular files copied
    pub files: usize,
    /// Symbolic links recreated
    pub symlinks: usize,
    /// Directories created
    pub directories: usize,
    /// Bytes copied
    pub bytes: u64,
}

/// Copy a directory tree, recreating symlinks and preserving permissions and mtimes
///
/// `dest` must not exist yet. Symbolic links are copied as links and never
/// followed.
pub fn copy_tree(src: &Path, dest: &Path) -> Result<CopyStats> {
    let mut stats = CopyStats::default();
    let mut dir_modes = Vec::new();

    for entry in WalkDir::new(src).follow_links(false).sort_by_file_name() {
        let entry = entry?;
        let relative = make_relative(entry.path(), src)?;
        let out = dest.join(&relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&out)?;
            dir_modes.push((out, get_permissions(&entry.metadata()?)));
            stats.directories += 1;
        } else if file_type.is_symlink() {
            let target = read_symlink(entry.path())?;
            create_symlink(&target, &out)?;
            stats.symlinks += 1;
        } else {
            let metadata = entry.metadata()?;
            stats.bytes += fs::copy(entry.path(), &out)?;
            let mtime = filetime::FileTime::from_last_modification_time(&metadata);
            filetime::set_file_mtime(&out, mtime)?;
            stats.files += 1;
        }
    }

    // Read-only directories must stay writable until their children exist
    for (dir, mode) in dir_modes.into_iter().rev() {
        set_permissions(&dir, mode)?;
    }

    trace!(?src, ?dest, files = stats.files, "Copied tree");
    Ok(stats)
}

/// Count regular files and symlinks under a directory, skipping `.git`
pub fn count_files(root: &Path) -> Result<usize> {
    let mut count = 0;
    for entry in WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || e.file_name() != ".git")
    {
        if !entry?.file_type().is_dir() {
            count += 1;
        }
    }
    Ok(count)
}

/// Replace every occurrence of a secret in backend output
pub fn redact(text: &str, secret: Option<&str>) -> String {
    match secret {
        Some(s) if !s.is_empty() => text.replace(s, "***"),
        _ => text.to_string(),
    }
}

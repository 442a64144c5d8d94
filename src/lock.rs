//! Advisory pid-file locks for the working copy and restore targets
//!
//! A lock is a file created with `create_new` next to the protected
//! directory, holding the owner's process id. A lock whose pid no longer
//! exists (checked through `/proc`) is reclaimed. Where `/proc` is not
//! available an existing lock is always treated as held.

use crate::error::{Result, VaultError};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const LOCK_SUFFIX: &str = ".snapvault.lock";
const ACQUIRE_ATTEMPTS: usize = 3;

/// Held lock; the lock file is removed on drop
#[derive(Debug)]
pub struct WorkspaceLock {
    path: PathBuf,
}

impl WorkspaceLock {
    /// Lock file path used for a protected directory: `<parent>/.<name>.snapvault.lock`
    pub fn path_for(dir: &Path) -> PathBuf {
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "root".to_string());
        let parent = dir.parent().unwrap_or(dir);
        parent.join(format!(".{}{}", name, LOCK_SUFFIX))
    }

    /// Acquire the lock protecting `dir`
    ///
    /// # Errors
    ///
    /// - [`VaultError::AlreadyRunning`] if a live process holds it
    /// - [`VaultError::Io`] if the lock file cannot be created or inspected
    pub fn acquire(dir: &Path) -> Result<Self> {
        let path = Self::path_for(dir);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        for _ in 0..ACQUIRE_ATTEMPTS {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    writeln!(file, "{}", std::process::id())?;
                    debug!(?path, "Acquired lock");
                    return Ok(Self { path });
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    let pid = match fs::read_to_string(&path) {
                        Ok(text) => text.trim().parse::<u32>().ok(),
                        Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                        Err(err) => return Err(err.into()),
                    };
                    if !is_stale(pid) {
                        return Err(VaultError::AlreadyRunning { path });
                    }
                    warn!(?path, ?pid, "Reclaiming stale lock");
                    match fs::remove_file(&path) {
                        Ok(()) => continue,
                        Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                        Err(err) => return Err(err.into()),
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }

        Err(VaultError::AlreadyRunning { path })
    }

    /// Lock file path
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WorkspaceLock {
    fn drop(&mut self) {
        let ours = fs::read_to_string(&self.path)
            .map(|text| text.trim() == std::process::id().to_string())
            .unwrap_or(false);
        if ours {
            if let Err(err) = fs::remove_file(&self.path) {
                warn!(path = ?self.path, %err, "Failed to remove lock file");
            }
        }
    }
}

fn is_stale(pid: Option<u32>) -> bool {
    let proc_root = Path::new("/proc");
    if !proc_root.is_dir() {
        return false;
    }
    match pid {
        Some(pid) => !proc_root.join(pid.to_string()).exists(),
        // Half-written or foreign content
        None => true,
    }
}

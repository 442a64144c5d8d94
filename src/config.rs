//! Configuration for a vault
//!
//! A [`VaultConfig`] is loaded from a JSON file and then overridden by
//! environment variables; the environment always wins. The resulting value
//! is passed explicitly into every component.
//!
//! ## Example
//!
//! ```json
//! {
//!   "source": "/var/app/data",
//!   "working_copy": "/var/backups/app-data",
//!   "remote": { "url": "https://git.example.com/me/app-backup.git", "branch": "main" },
//!   "schedule": "03:00",
//!   "exclude": ["**/*.tmp", "cache/**"]
//! }
//! ```
//!
//! ## Environment
//!
//! | Variable | Field |
//! |---|---|
//! | `SNAPVAULT_SOURCE` | `source` |
//! | `SNAPVAULT_WORKING_COPY` | `working_copy` |
//! | `SNAPVAULT_REMOTE_URL` | `remote.url` |
//! | `SNAPVAULT_REMOTE_BRANCH` | `remote.branch` |
//! | `SNAPVAULT_TOKEN` | `remote.token` |
//! | `SNAPVAULT_SCHEDULE` | `schedule` |
//! | `SNAPVAULT_AUTO_BACKUP` | `auto_backup` (`true`/`1`/`yes`) |

use crate::error::{Result, VaultError};
use crate::store::RetryPolicy;
use crate::utils;
use chrono::{Duration as ChronoDuration, NaiveDateTime, NaiveTime};
use globset::Glob;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

/// Credential that never appears in `Debug` or `Display` output
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    /// Wrap a credential
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Raw value, for injection at invocation time only
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("***")
    }
}

impl std::fmt::Display for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("***")
    }
}

/// Remote endpoint snapshots are pushed to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Remote URL (`https://`, `ssh://`, `git@host:path`, `file://` or a local path)
    pub url: String,
    /// Branch on the remote
    #[serde(default = "default_branch")]
    pub branch: String,
    /// Access token injected into HTTP(S) URLs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<Secret>,
}

impl RemoteConfig {
    /// Create a remote without credentials on the default branch
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            branch: default_branch(),
            token: None,
        }
    }

    /// URL with the token injected as `oauth2:<token>@`, for HTTP(S) remotes
    pub fn authenticated_url(&self) -> String {
        let Some(token) = self.token.as_ref().filter(|t| !t.expose().is_empty()) else {
            return self.url.clone();
        };
        for scheme in ["https://", "http://"] {
            if let Some(rest) = self.url.strip_prefix(scheme) {
                let authority = rest.split('/').next().unwrap_or("");
                if authority.contains('@') {
                    return self.url.clone();
                }
                return format!("{}oauth2:{}@{}", scheme, token.expose(), rest);
            }
        }
        self.url.clone()
    }

    fn validate(&self) -> Result<()> {
        const SCHEMES: &[&str] = &["https://", "http://", "ssh://", "git@", "file://"];
        if self.url.trim().is_empty() {
            return Err(VaultError::config("remote url is empty"));
        }
        if !SCHEMES.iter().any(|s| self.url.starts_with(s)) && !Path::new(&self.url).is_absolute() {
            return Err(VaultError::config(format!(
                "remote url '{}' must start with https://, http://, ssh://, git@ or file://, or be an absolute path",
                self.url
            )));
        }
        if self.branch.trim().is_empty() || self.branch.contains(char::is_whitespace) {
            return Err(VaultError::config(format!("invalid remote branch '{}'", self.branch)));
        }
        Ok(())
    }
}

/// Identity recorded on snapshots
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorConfig {
    /// Commit author name
    pub name: String,
    /// Commit author email
    pub email: String,
}

impl Default for AuthorConfig {
    fn default() -> Self {
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string());
        Self {
            name: "snapvault".to_string(),
            email: format!("snapvault@{}", host),
        }
    }
}

/// When the scheduler fires
///
/// Serialized as a string: `"03:00"`, `"daily@03:00"` or `"every 6h"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Schedule {
    /// Once a day at a local wall-clock time
    DailyAt(NaiveTime),
    /// Fixed interval after the previous cycle
    Interval(Duration),
}

impl Schedule {
    /// Next fire time strictly after `now`, in local wall-clock time
    pub fn next_fire_after(&self, now: NaiveDateTime) -> NaiveDateTime {
        match self {
            Schedule::DailyAt(time) => {
                let today = now.date().and_time(*time);
                if today > now {
                    today
                } else {
                    today + ChronoDuration::days(1)
                }
            }
            Schedule::Interval(interval) => {
                now + ChronoDuration::from_std(*interval).unwrap_or_else(|_| ChronoDuration::days(1))
            }
        }
    }
}

impl Default for Schedule {
    fn default() -> Self {
        Schedule::DailyAt(NaiveTime::from_hms_opt(3, 0, 0).unwrap_or_default())
    }
}

impl FromStr for Schedule {
    type Err = VaultError;

    fn from_str(raw: &str) -> Result<Self> {
        let s = raw.trim();
        if let Some(rest) = s.strip_prefix("every") {
            let interval = humantime::parse_duration(rest.trim())
                .map_err(|e| VaultError::config(format!("invalid schedule '{}': {}", raw, e)))?;
            if interval.is_zero() {
                return Err(VaultError::config(format!("invalid schedule '{}': interval is zero", raw)));
            }
            return Ok(Schedule::Interval(interval));
        }
        let time = s.strip_prefix("daily@").unwrap_or(s);
        NaiveTime::parse_from_str(time, "%H:%M")
            .map(Schedule::DailyAt)
            .map_err(|_| {
                VaultError::config(format!(
                    "invalid schedule '{}': expected HH:MM, daily@HH:MM or 'every <duration>'",
                    raw
                ))
            })
    }
}

impl TryFrom<String> for Schedule {
    type Error = VaultError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Schedule> for String {
    fn from(schedule: Schedule) -> Self {
        schedule.to_string()
    }
}

impl std::fmt::Display for Schedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Schedule::DailyAt(time) => write!(f, "{}", time.format("%H:%M")),
            Schedule::Interval(interval) => write!(f, "every {}", humantime::format_duration(*interval)),
        }
    }
}

/// Complete configuration of a vault
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Directory being backed up; only ever read
    pub source: PathBuf,
    /// Local mirror plus version history
    pub working_copy: PathBuf,
    /// Remote snapshots are pushed to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote: Option<RemoteConfig>,
    /// When the daemon takes snapshots
    pub schedule: Schedule,
    /// Whether the daemon runs scheduled backups at all
    pub auto_backup: bool,
    /// Glob patterns (relative to the source root) never mirrored
    pub exclude: Vec<String>,
    /// Where safety snapshots are written before a restore
    #[serde(skip_serializing_if = "Option::is_none")]
    pub safety_root: Option<PathBuf>,
    /// Commit identity
    pub author: AuthorConfig,
    /// Push/pull retry policy
    pub retry: RetryPolicy,
    /// Parallel copy workers (defaults to the number of CPUs)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            source: PathBuf::new(),
            working_copy: PathBuf::new(),
            remote: None,
            schedule: Schedule::default(),
            auto_backup: true,
            exclude: Vec::new(),
            safety_root: None,
            author: AuthorConfig::default(),
            retry: RetryPolicy::default(),
            workers: None,
        }
    }
}

impl VaultConfig {
    /// Create a configuration for a source and working copy with defaults elsewhere
    pub fn new(source: impl Into<PathBuf>, working_copy: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            working_copy: working_copy.into(),
            ..Self::default()
        }
    }

    /// Load from a JSON file (defaults if it does not exist), then apply environment overrides
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(path)?;
            info!(?path, "Loaded configuration file");
            serde_json::from_str(&text)?
        } else {
            info!(?path, "Configuration file not found, using environment and defaults");
            Self::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        debug!(source = ?config.source, working_copy = ?config.working_copy, schedule = %config.schedule, "Configuration ready");
        Ok(config)
    }

    /// Apply `SNAPVAULT_*` overrides from a lookup function
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("SNAPVAULT_SOURCE") {
            self.source = PathBuf::from(v);
        }
        if let Some(v) = lookup("SNAPVAULT_WORKING_COPY") {
            self.working_copy = PathBuf::from(v);
        }
        if let Some(v) = lookup("SNAPVAULT_REMOTE_URL") {
            if v.trim().is_empty() {
                self.remote = None;
            } else {
                match self.remote.as_mut() {
                    Some(remote) => remote.url = v,
                    None => self.remote = Some(RemoteConfig::new(v)),
                }
            }
        }
        if let Some(remote) = self.remote.as_mut() {
            if let Some(v) = lookup("SNAPVAULT_REMOTE_BRANCH") {
                remote.branch = v;
            }
            if let Some(v) = lookup("SNAPVAULT_TOKEN") {
                remote.token = Some(Secret::new(v));
            }
        }
        if let Some(v) = lookup("SNAPVAULT_SCHEDULE") {
            self.schedule = v.parse()?;
        }
        if let Some(v) = lookup("SNAPVAULT_AUTO_BACKUP") {
            self.auto_backup = matches!(v.trim().to_lowercase().as_str(), "true" | "1" | "yes");
        }
        Ok(())
    }

    /// Check the configuration before any component is built from it
    pub fn validate(&self) -> Result<()> {
        if self.source.as_os_str().is_empty() {
            return Err(VaultError::config("source directory is not set"));
        }
        if self.working_copy.as_os_str().is_empty() {
            return Err(VaultError::config("working copy directory is not set"));
        }
        if utils::is_within(&self.working_copy, &self.source)
            || utils::is_within(&self.source, &self.working_copy)
        {
            return Err(VaultError::config(format!(
                "source {:?} and working copy {:?} must not contain each other",
                self.source, self.working_copy
            )));
        }
        if let Some(remote) = &self.remote {
            remote.validate()?;
        }
        for pattern in &self.exclude {
            Glob::new(pattern)?;
        }
        if self.retry.max_attempts == 0 {
            return Err(VaultError::config("retry.max_attempts must be at least 1"));
        }
        if self.workers == Some(0) {
            return Err(VaultError::config("workers must be at least 1"));
        }
        Ok(())
    }

    /// Directory safety snapshots go to
    pub fn safety_root(&self) -> PathBuf {
        self.safety_root
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("snapvault-safety"))
    }

    /// Parallel copy workers
    pub fn workers(&self) -> usize {
        self.workers.unwrap_or_else(num_cpus::get).max(1)
    }

    /// Write the configuration as pretty JSON
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        utils::atomic_write(path, json.as_bytes())
    }

    /// Copy with the token blanked, safe to print
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if let Some(remote) = copy.remote.as_mut() {
            if remote.token.is_some() {
                remote.token = Some(Secret::new("***"));
            }
        }
        copy
    }
}

fn default_branch() -> String {
    "main".to_string()
}

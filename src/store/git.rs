//! Version store backed by the `git` command line
//!
//! Every operation is one or more `git` invocations run inside the working
//! copy. Credentials are injected into the remote URL for the duration of a
//! single push or fetch and scrubbed from anything git prints back.
//!
//! Annotations are git notes under `refs/notes/snapvault`, so amending a
//! description never changes a commit id. Notes travel with push and pull.
//!
//! Staging ignores every `.gitignore`, `info/exclude` and `core.excludesFile`:
//! the working copy is the mirrored source and all of it is tracked. Git
//! itself keeps only the executable bit, so each commit also carries a
//! permission manifest ([`MODE_MANIFEST`]) written straight into the index.
//! Checkouts apply it and remove it again, and it never appears in a diff.

use super::{VersionStore, MODE_MANIFEST};
use crate::config::{AuthorConfig, RemoteConfig};
use crate::error::{Result, VaultError};
use crate::types::{ChangeKind, CommitMeta, FileChange, VersionId};
use crate::utils;
use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use tracing::{debug, instrument, trace};
use walkdir::WalkDir;

const NOTES_REF: &str = "refs/notes/snapvault";
const FETCHED_NOTES_REF: &str = "refs/notes/snapvault-fetched";
const DEFAULT_BRANCH: &str = "main";

/// Permission bits of every file and directory in a tree, keyed by `/`-separated path
#[derive(Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
struct ModeManifest {
    files: BTreeMap<String, u32>,
    dirs: BTreeMap<String, u32>,
}

impl ModeManifest {
    fn scan(root: &Path) -> Result<Self> {
        let mut manifest = Self::default();
        let walker = WalkDir::new(root)
            .follow_links(false)
            .min_depth(1)
            .into_iter()
            .filter_entry(|e| !(e.depth() == 1 && (e.file_name() == ".git" || e.file_name() == MODE_MANIFEST)));
        for entry in walker {
            let entry = entry?;
            let file_type = entry.file_type();
            if file_type.is_symlink() {
                continue;
            }
            let Some(relative) = entry.path().strip_prefix(root).ok().and_then(Path::to_str) else {
                continue;
            };
            let relative = relative.replace(std::path::MAIN_SEPARATOR, "/");
            let mode = utils::get_permissions(&entry.metadata()?);
            if file_type.is_dir() {
                manifest.dirs.insert(relative, mode);
            } else {
                manifest.files.insert(relative, mode);
            }
        }
        Ok(manifest)
    }

    /// Set recorded modes on whatever exists under `root`; directories deepest first
    fn apply(&self, root: &Path) -> Result<()> {
        for (relative, mode) in &self.files {
            let path = root.join(relative);
            if fs::symlink_metadata(&path).map(|m| m.is_file()).unwrap_or(false) {
                utils::set_permissions(&path, *mode)?;
            }
        }
        for (relative, mode) in self.dirs.iter().rev() {
            let path = root.join(relative);
            if fs::symlink_metadata(&path).map(|m| m.is_dir()).unwrap_or(false) {
                utils::set_permissions(&path, *mode)?;
            }
        }
        Ok(())
    }

    /// Add `Modified` entries for files whose mode alone changed
    fn mode_changes(&self, newer: &ModeManifest, changes: &mut Vec<FileChange>) {
        for (relative, mode) in &newer.files {
            if self.files.get(relative).is_some_and(|old| old != mode) {
                let path = PathBuf::from(relative);
                if !changes.iter().any(|c| c.path == path) {
                    changes.push(FileChange::new(path, ChangeKind::Modified));
                }
            }
        }
        changes.sort();
    }
}

/// Typed wrapper over the `git` CLI for one working copy
#[derive(Debug, Clone)]
pub struct GitStore {
    root: PathBuf,
    remote: Option<RemoteConfig>,
    author: AuthorConfig,
}

impl GitStore {
    /// Create a store for a working copy, optionally pushing to a remote
    pub fn new(root: impl Into<PathBuf>, remote: Option<RemoteConfig>, author: AuthorConfig) -> Self {
        Self {
            root: root.into(),
            remote,
            author,
        }
    }

    /// Check whether a usable `git` binary is on `PATH`
    pub fn is_available() -> bool {
        Command::new("git")
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    fn branch(&self) -> &str {
        self.remote
            .as_ref()
            .map(|r| r.branch.as_str())
            .unwrap_or(DEFAULT_BRANCH)
    }

    fn token(&self) -> Option<&str> {
        self.remote
            .as_ref()
            .and_then(|r| r.token.as_ref())
            .map(|t| t.expose())
    }

    fn remote(&self) -> Result<&RemoteConfig> {
        self.remote
            .as_ref()
            .ok_or_else(|| VaultError::config("no remote configured"))
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new("git");
        cmd.args(args)
            .current_dir(&self.root)
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("LC_ALL", "C")
            .env("GIT_AUTHOR_NAME", &self.author.name)
            .env("GIT_AUTHOR_EMAIL", &self.author.email)
            .env("GIT_COMMITTER_NAME", &self.author.name)
            .env("GIT_COMMITTER_EMAIL", &self.author.email)
            .stdin(Stdio::null());
        cmd
    }

    fn spawn_error(&self, operation: &str, err: std::io::Error) -> VaultError {
        VaultError::VersionStore {
            operation: operation.to_string(),
            status: None,
            stderr: format!("failed to run git: {}", err),
        }
    }

    fn failure(&self, operation: &str, output: &Output) -> VaultError {
        VaultError::VersionStore {
            operation: operation.to_string(),
            status: output.status.code(),
            stderr: self.stderr_of(output),
        }
    }

    fn stderr_of(&self, output: &Output) -> String {
        utils::redact(String::from_utf8_lossy(&output.stderr).trim(), self.token())
    }

    /// Run git and return its raw output, whatever the exit status
    fn output(&self, operation: &str, cmd: &mut Command) -> Result<Output> {
        trace!(operation, "Running git");
        cmd.output().map_err(|e| self.spawn_error(operation, e))
    }

    /// Run git, failing on a non-zero exit status, and return stdout
    fn run(&self, operation: &str, args: &[&str]) -> Result<String> {
        let output = self.output(operation, &mut self.command(args))?;
        if !output.status.success() {
            return Err(self.failure(operation, &output));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Run git with `input` on stdin, failing on a non-zero exit status
    fn run_with_input(&self, operation: &str, args: &[&str], input: &[u8]) -> Result<String> {
        let mut cmd = self.command(args);
        cmd.stdin(Stdio::piped()).stdout(Stdio::piped()).stderr(Stdio::piped());
        let mut child = cmd.spawn().map_err(|e| self.spawn_error(operation, e))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(input)?;
        }
        let output = child
            .wait_with_output()
            .map_err(|e| self.spawn_error(operation, e))?;
        if !output.status.success() {
            return Err(self.failure(operation, &output));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Run git, reporting only whether it succeeded
    fn check(&self, args: &[&str]) -> Result<bool> {
        let output = self.output(args.first().copied().unwrap_or("git"), &mut self.command(args))?;
        Ok(output.status.success())
    }

    /// Run a transport command; anything but a rejection counts as a network failure
    fn run_remote(&self, operation: &str, args: &[&str]) -> Result<Output> {
        let output = self.output(operation, &mut self.command(args))?;
        if output.status.success() {
            return Ok(output);
        }
        let stderr = self.stderr_of(&output);
        if stderr.contains("[rejected]") || stderr.contains("non-fast-forward") {
            return Err(VaultError::VersionStore {
                operation: operation.to_string(),
                status: output.status.code(),
                stderr,
            });
        }
        Err(VaultError::Network {
            operation: operation.to_string(),
            attempts: 1,
            detail: stderr,
        })
    }

    fn has_ref(&self, reference: &str) -> Result<bool> {
        self.check(&["rev-parse", "-q", "--verify", reference])
    }

    fn resolve_commit(&self, id: &VersionId) -> Result<String> {
        let spec = format!("{}^{{commit}}", id.as_str());
        let output = self.output("rev-parse", &mut self.command(&["rev-parse", "-q", "--verify", &spec]))?;
        if !output.status.success() {
            return Err(VaultError::NotFound(id.to_string()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn empty_tree(&self) -> Result<String> {
        let mut cmd = self.command(&["hash-object", "-t", "tree", "--stdin"]);
        cmd.stdin(Stdio::piped()).stdout(Stdio::piped()).stderr(Stdio::piped());
        let child = cmd.spawn().map_err(|e| self.spawn_error("hash-object", e))?;
        // Dropping stdin right away feeds an empty tree
        let output = child
            .wait_with_output()
            .map_err(|e| self.spawn_error("hash-object", e))?;
        if !output.status.success() {
            return Err(self.failure("hash-object", &output));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn push_refs(&self, force: bool) -> Result<()> {
        let remote = self.remote()?;
        let url = remote.authenticated_url();
        let mut refspecs = vec![format!("HEAD:refs/heads/{}", remote.branch)];
        if self.has_ref(NOTES_REF)? {
            refspecs.push(format!("+{}:{}", NOTES_REF, NOTES_REF));
        }

        let mut args = vec!["push", "-q"];
        if force {
            args.push("--force");
        }
        args.push(&url);
        args.extend(refspecs.iter().map(String::as_str));

        let operation = if force { "force-push" } else { "push" };
        self.run_remote(operation, &args)?;
        debug!(branch = %remote.branch, force, "Pushed to remote");
        Ok(())
    }

    /// Fetch a ref; `Ok(false)` when the remote does not have it
    fn fetch(&self, url: &str, refspec: &str) -> Result<bool> {
        match self.run_remote("pull", &["fetch", "-q", url, refspec]) {
            Ok(_) => Ok(true),
            Err(VaultError::Network { detail, .. }) if detail.contains("couldn't find remote ref") => {
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    /// Manifest recorded at `rev`; `""` reads the index. Empty when absent
    fn manifest_at(&self, rev: &str) -> Result<ModeManifest> {
        let spec = format!("{}:{}", rev, MODE_MANIFEST);
        let output = self.output("show", &mut self.command(&["show", &spec]))?;
        if !output.status.success() {
            return Ok(ModeManifest::default());
        }
        Ok(serde_json::from_slice(&output.stdout)?)
    }

    /// Apply and remove a manifest git wrote into `dir`
    fn settle_manifest(dir: &Path) -> Result<()> {
        let path = dir.join(MODE_MANIFEST);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        fs::remove_file(&path)?;
        let manifest: ModeManifest = serde_json::from_slice(&bytes)?;
        manifest.apply(dir)
    }
}

fn parse_name_status(output: &str) -> Vec<FileChange> {
    let mut changes = Vec::new();
    let mut fields = output.split('\0').filter(|f| !f.is_empty());
    while let (Some(status), Some(path)) = (fields.next(), fields.next()) {
        let kind = match status.chars().next() {
            Some('A') => ChangeKind::Added,
            Some('D') => ChangeKind::Deleted,
            _ => ChangeKind::Modified,
        };
        if path != MODE_MANIFEST {
            changes.push(FileChange::new(path, kind));
        }
    }
    changes.sort();
    changes
}

fn parse_log(output: &str) -> Result<Vec<CommitMeta>> {
    let mut commits = Vec::new();
    for record in output.split('\u{1e}').filter(|r| !r.trim().is_empty()) {
        let fields: Vec<&str> = record.splitn(5, '\u{1f}').collect();
        if fields.len() != 5 {
            return Err(VaultError::internal(format!(
                "unexpected git log record with {} fields",
                fields.len()
            )));
        }
        let seconds: i64 = fields[1]
            .trim()
            .parse()
            .map_err(|_| VaultError::internal(format!("bad commit time '{}'", fields[1])))?;
        let timestamp = Utc
            .timestamp_opt(seconds, 0)
            .single()
            .ok_or_else(|| VaultError::internal(format!("commit time out of range: {}", seconds)))?;
        let note = fields[4].trim();
        commits.push(CommitMeta::new(
            VersionId::new(fields[0].trim()),
            timestamp,
            fields[2],
            fields[3].trim_end(),
            (!note.is_empty()).then(|| note.to_string()),
        ));
    }
    Ok(commits)
}

impl VersionStore for GitStore {
    fn root(&self) -> &Path {
        &self.root
    }

    #[instrument(skip(self), fields(root = ?self.root))]
    fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        if self.root.join(".git").exists() {
            return Ok(());
        }
        self.run("init", &["init", "-q"])?;
        let head = format!("refs/heads/{}", self.branch());
        self.run("init", &["symbolic-ref", "HEAD", &head])?;
        self.run("init", &["config", "core.autocrlf", "false"])?;
        debug!(branch = self.branch(), "Initialized working copy");
        Ok(())
    }

    fn stage_all(&self) -> Result<()> {
        self.run(
            "add",
            &["-c", "core.excludesFile=", "add", "-A", "--force", "--", "."],
        )?;
        let manifest = serde_json::to_vec_pretty(&ModeManifest::scan(&self.root)?)?;
        let blob = self.run_with_input("add", &["hash-object", "-w", "--stdin"], &manifest)?;
        let cacheinfo = format!("100644,{},{}", blob.trim(), MODE_MANIFEST);
        self.run("add", &["update-index", "--add", "--cacheinfo", &cacheinfo])?;
        Ok(())
    }

    fn pending_changes(&self) -> Result<Vec<FileChange>> {
        let out = self.run(
            "status",
            &["diff", "--cached", "--name-status", "-z", "--no-renames"],
        )?;
        let mut changes = parse_name_status(&out);
        let base = match self.head()? {
            Some(_) => self.manifest_at("HEAD")?,
            None => ModeManifest::default(),
        };
        base.mode_changes(&self.manifest_at("")?, &mut changes);
        Ok(changes)
    }

    #[instrument(skip(self, message))]
    fn commit(&self, message: &str) -> Result<VersionId> {
        if !self.has_changes()? {
            return Err(VaultError::NoChanges);
        }
        self.run_with_input(
            "commit",
            &["-c", "commit.gpgsign=false", "commit", "-q", "--no-verify", "-F", "-"],
            message.as_bytes(),
        )?;
        let id = self.run("commit", &["rev-parse", "HEAD"])?;
        Ok(VersionId::new(id.trim()))
    }

    #[instrument(skip(self))]
    fn push(&self) -> Result<()> {
        self.push_refs(false)
    }

    #[instrument(skip(self))]
    fn force_push(&self) -> Result<()> {
        self.push_refs(true)
    }

    #[instrument(skip(self))]
    fn pull(&self) -> Result<()> {
        let remote = self.remote()?;
        let url = remote.authenticated_url();
        let tracking = format!("refs/snapvault/remote/{}", remote.branch);

        if self.fetch(&url, &format!("+refs/heads/{}:{}", remote.branch, tracking))? {
            if self.head()?.is_some() {
                self.run("pull", &["merge", "-q", "--ff-only", &tracking])?;
            } else {
                let branch_ref = format!("refs/heads/{}", self.branch());
                self.run("pull", &["update-ref", &branch_ref, &tracking])?;
                self.run("pull", &["reset", "-q", "--hard"])?;
            }
            Self::settle_manifest(&self.root)?;
        } else {
            debug!(branch = %remote.branch, "Remote branch does not exist yet");
        }

        if self.fetch(&url, &format!("+{}:{}", NOTES_REF, FETCHED_NOTES_REF))? {
            if self.has_ref(NOTES_REF)? {
                self.run(
                    "pull",
                    &["notes", "--ref=snapvault", "merge", "-q", "-s", "ours", FETCHED_NOTES_REF],
                )?;
            } else {
                self.run("pull", &["update-ref", NOTES_REF, FETCHED_NOTES_REF])?;
            }
        }
        Ok(())
    }

    fn log(&self, limit: Option<usize>) -> Result<Vec<CommitMeta>> {
        if self.head()?.is_none() {
            return Ok(Vec::new());
        }
        let limit_arg = limit.map(|n| format!("-n{}", n));
        let mut args = vec![
            "log",
            "--no-color",
            "--no-notes",
            "--notes=snapvault",
            "--format=%x1e%H%x1f%ct%x1f%an%x1f%B%x1f%N",
        ];
        if let Some(arg) = &limit_arg {
            args.push(arg);
        }
        args.push("HEAD");
        parse_log(&self.run("log", &args)?)
    }

    fn diff(&self, from: Option<&VersionId>, to: &VersionId) -> Result<Vec<FileChange>> {
        let to = self.resolve_commit(to)?;
        let (from, base) = match from {
            Some(id) => {
                let commit = self.resolve_commit(id)?;
                let base = self.manifest_at(&commit)?;
                (commit, base)
            }
            None => (self.empty_tree()?, ModeManifest::default()),
        };
        let out = self.run(
            "diff",
            &["diff", "--name-status", "-z", "--no-renames", &from, &to],
        )?;
        let mut changes = parse_name_status(&out);
        base.mode_changes(&self.manifest_at(&to)?, &mut changes);
        Ok(changes)
    }

    #[instrument(skip(self), fields(id = id.short()))]
    fn checkout(&self, id: &VersionId, target: &Path) -> Result<()> {
        let commit = self.resolve_commit(id)?;
        fs::create_dir_all(target)?;
        let target = target.canonicalize()?;
        let index_dir = tempfile::tempdir()?;
        let index = index_dir.path().join("index");

        let mut read_tree = self.command(&["read-tree", &commit]);
        read_tree.env("GIT_INDEX_FILE", &index);
        let output = self.output("checkout", &mut read_tree)?;
        if !output.status.success() {
            return Err(self.failure("checkout", &output));
        }

        let prefix = format!("--prefix={}/", target.display());
        let mut checkout = self.command(&["checkout-index", "-a", "-f", &prefix]);
        checkout.env("GIT_INDEX_FILE", &index);
        let output = self.output("checkout", &mut checkout)?;
        if !output.status.success() {
            return Err(self.failure("checkout", &output));
        }
        Self::settle_manifest(&target)
    }

    fn annotate(&self, id: &VersionId, text: &str) -> Result<()> {
        let commit = self.resolve_commit(id)?;
        self.run(
            "annotate",
            &["notes", "--ref=snapvault", "add", "-f", "-m", text, &commit],
        )?;
        Ok(())
    }

    #[instrument(skip(self))]
    fn drop_head(&self) -> Result<VersionId> {
        if !self.has_ref("HEAD~1")? {
            return Err(VaultError::VersionStore {
                operation: "drop_head".to_string(),
                status: None,
                stderr: "refusing to remove the only snapshot".to_string(),
            });
        }
        self.run("drop_head", &["reset", "-q", "--hard", "HEAD~1"])?;
        self.run("drop_head", &["clean", "-q", "-f", "-d", "-x"])?;
        Self::settle_manifest(&self.root)?;
        self.head()?
            .ok_or_else(|| VaultError::internal("no head after dropping the newest snapshot"))
    }

    fn has_remote(&self) -> bool {
        self.remote.is_some()
    }

    fn head(&self) -> Result<Option<VersionId>> {
        let output = self.output(
            "rev-parse",
            &mut self.command(&["rev-parse", "-q", "--verify", "HEAD^{commit}"]),
        )?;
        if !output.status.success() {
            return Ok(None);
        }
        Ok(Some(VersionId::new(
            String::from_utf8_lossy(&output.stdout).trim(),
        )))
    }
}

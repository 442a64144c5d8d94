//! # Snapvault CLI
//!
//! Operator commands for a snapvault installation. Every subcommand maps
//! onto one library call.
//!
//! ## Usage
//! ```bash
//! # Take a snapshot now
//! snapvault backup -m "before upgrade"
//!
//! # Show the ten newest snapshots
//! snapvault list --limit 10
//!
//! # Roll the data directory back to the second newest snapshot
//! snapvault restore 2 --yes
//!
//! # Run scheduled backups in the foreground
//! snapvault daemon
//! ```

use clap::{Parser, Subcommand};
use colored::*;
use humantime::format_duration;
use indicatif::{ProgressBar, ProgressStyle};
use snapvault::utils::format_bytes;
use snapvault::{
    BackupStatus, ChangeKind, CommitMeta, FileChange, Result, Vault, VaultBuilder, VaultConfig,
    VaultError,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Default configuration file, overridable with `SNAPVAULT_CONFIG`
const DEFAULT_CONFIG: &str = "snapvault.json";

/// Snapvault CLI - scheduled git-backed snapshots with safe restore
#[derive(Parser)]
#[command(name = "snapvault")]
#[command(version)]
#[command(about = "Scheduled git-backed snapshots of a data directory, with safe restore")]
#[command(long_about = None)]
struct Cli {
    /// Configuration file (defaults to $SNAPVAULT_CONFIG or ./snapvault.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Take a snapshot now
    Backup {
        /// Description recorded with the snapshot
        #[arg(short, long)]
        message: Option<String>,
    },

    /// List snapshots, newest first
    #[command(alias = "ls")]
    List {
        /// Limit results
        #[arg(short, long)]
        limit: Option<usize>,

        /// Pull from the remote first
        #[arg(long)]
        fetch: bool,
    },

    /// Show one snapshot and the paths it changed
    Show {
        /// Snapshot selector (position, id prefix or description text)
        selector: String,
    },

    /// Paths changed between two snapshots
    Diff {
        /// Older snapshot
        from: String,

        /// Newer snapshot (defaults to the newest)
        to: Option<String>,
    },

    /// Compare a snapshot with the live data directory
    Compare {
        /// Snapshot selector (defaults to the newest)
        selector: Option<String>,
    },

    /// Replace a snapshot's description
    Amend {
        /// Snapshot selector
        selector: String,

        /// New description
        text: String,
    },

    /// Restore a snapshot
    #[command(alias = "rs")]
    Restore {
        /// Snapshot selector
        selector: String,

        /// Directory to restore into (defaults to the data directory)
        #[arg(short, long)]
        target: Option<PathBuf>,

        /// Confirm replacing the target's content
        #[arg(long)]
        yes: bool,
    },

    /// Remove the newest snapshot (rewrites history)
    Prune {
        /// Confirm the history rewrite
        #[arg(long)]
        yes: bool,
    },

    /// Run scheduled backups in the foreground
    Daemon,

    /// Show the effective configuration
    Config {
        /// Write a configuration template to this path instead
        #[arg(long, value_name = "PATH")]
        init: Option<PathBuf>,
    },
}

fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_writer(std::io::stderr)
        .init();

    if std::env::var("NO_COLOR").is_ok() {
        colored::control::set_override(false);
    }

    if let Err(e) = run(cli) {
        eprintln!("{}: {}", "Error".red().bold(), e.user_message());
        std::process::exit(1);
    }
}

/// Main command runner
fn run(cli: Cli) -> Result<()> {
    let config_path = cli
        .config
        .or_else(|| std::env::var_os("SNAPVAULT_CONFIG").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));

    match cli.command {
        Commands::Config { init } => cmd_config(&config_path, init),
        Commands::Restore { yes: false, .. } => Err(VaultError::config(
            "restore replaces the target directory; re-run with --yes to confirm",
        )),
        Commands::Prune { yes: false } => Err(VaultError::config(
            "prune removes the newest snapshot and rewrites history; re-run with --yes to confirm",
        )),
        command => {
            let vault = open_vault(&config_path)?;
            match command {
                Commands::Backup { message } => cmd_backup(&vault, message),
                Commands::List { limit, fetch } => cmd_list(&vault, limit, fetch),
                Commands::Show { selector } => cmd_show(&vault, &selector),
                Commands::Diff { from, to } => cmd_diff(&vault, &from, to.as_deref()),
                Commands::Compare { selector } => cmd_compare(&vault, selector.as_deref()),
                Commands::Amend { selector, text } => cmd_amend(&vault, &selector, &text),
                Commands::Restore { selector, target, .. } => {
                    cmd_restore(&vault, &selector, target.as_deref())
                }
                Commands::Prune { .. } => cmd_prune(&vault),
                Commands::Daemon => cmd_daemon(&vault),
                Commands::Config { .. } => Ok(()),
            }
        }
    }
}

fn open_vault(config_path: &Path) -> Result<Vault> {
    let config = VaultConfig::load(config_path)?;
    VaultBuilder::new(config).build()
}

fn spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {msg}") {
        pb.set_style(style);
    }
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

/// Take a manual snapshot
fn cmd_backup(vault: &Vault, message: Option<String>) -> Result<()> {
    let pb = spinner("Mirroring and committing...");
    let result = vault.backup(message.as_deref())?;
    pb.finish_and_clear();

    let elapsed = format_duration(Duration::from_millis(result.duration_ms)).to_string();
    match result.status {
        BackupStatus::Success | BackupStatus::SuccessDegraded => {
            let id = result.snapshot.as_ref().map(|id| id.short().to_string()).unwrap_or_default();
            println!("{} Created snapshot {}", "✓".green().bold(), id.yellow().bold());
            println!("  Changed: {} files", result.changed_files.to_string().cyan());
            if let Some(mirror) = &result.mirror {
                println!("  Copied: {}", format_bytes(mirror.bytes_copied).cyan());
            }
            println!("  Time: {}", elapsed.cyan());
            if result.pushed {
                println!("  Pushed: {}", "yes".green());
            } else if result.status == BackupStatus::SuccessDegraded {
                let detail = result.error.as_ref().map(|e| e.message.as_str()).unwrap_or("");
                println!("  Pushed: {} ({})", "no".yellow(), detail);
                println!("  {}", "The snapshot is kept locally and goes out with the next push.".dimmed());
            } else {
                println!("  Pushed: {}", "no remote configured".dimmed());
            }
            Ok(())
        }
        BackupStatus::NoChanges => {
            println!("{} No changes since the last snapshot", "✓".green().bold());
            Ok(())
        }
        BackupStatus::Failed => {
            let detail = result
                .error
                .map(|e| format!("backup failed during {:?}: {}", e.step, e.message))
                .unwrap_or_else(|| "backup failed".to_string());
            Err(VaultError::internal(detail))
        }
    }
}

fn print_meta_line(position: usize, meta: &CommitMeta) {
    let kind = if meta.automated { "auto".dimmed() } else { "manual".cyan() };
    println!(
        "{:>4}  {}  {}  {:<6}  {}",
        position.to_string().bold(),
        meta.id.short().yellow(),
        meta.timestamp.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S"),
        kind,
        meta.description()
    );
}

fn print_changes(changes: &[FileChange]) {
    if changes.is_empty() {
        println!("  {}", "(no differences)".dimmed());
        return;
    }
    for change in changes {
        let path = change.path.display().to_string();
        match change.kind {
            ChangeKind::Added => println!("  {} {}", "+".green(), path.green()),
            ChangeKind::Modified => println!("  {} {}", "~".yellow(), path.yellow()),
            ChangeKind::Deleted => println!("  {} {}", "-".red(), path.red()),
        }
    }
}

/// List snapshots
fn cmd_list(vault: &Vault, limit: Option<usize>, fetch: bool) -> Result<()> {
    if fetch {
        if let Err(e) = vault.refresh() {
            eprintln!("{} Could not fetch from remote: {}", "!".yellow().bold(), e);
        }
    }
    let snapshots = vault.list(limit)?;
    if snapshots.is_empty() {
        println!("No snapshots yet. Run 'snapvault backup' to take one.");
        return Ok(());
    }
    println!("{}", "Snapshots (newest first):".bold());
    for (index, meta) in snapshots.iter().enumerate() {
        print_meta_line(index + 1, meta);
    }
    Ok(())
}

/// Show one snapshot
fn cmd_show(vault: &Vault, selector: &str) -> Result<()> {
    let details = vault.describe(selector)?;
    let meta = &details.meta;
    println!("{} {}", "Snapshot".bold(), meta.id.as_str().yellow());
    println!("  Position: {}", details.position.to_string().cyan());
    println!(
        "  Time: {}",
        meta.timestamp.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S").to_string().cyan()
    );
    println!("  Author: {}", meta.author.cyan());
    let trigger = if meta.automated { "scheduled" } else { "manual" };
    println!("  Trigger: {}", trigger.cyan());
    if let Some(annotation) = &meta.annotation {
        println!("  Description: {}", annotation.cyan());
    }
    println!("\n{}", meta.message.trim_end());
    println!("\n{} ({})", "Changed paths".bold(), details.changes.len());
    print_changes(&details.changes);
    Ok(())
}

/// Diff two snapshots
fn cmd_diff(vault: &Vault, from: &str, to: Option<&str>) -> Result<()> {
    let changes = vault.diff(from, to)?;
    println!(
        "{} {} → {}",
        "Changes".bold(),
        from.yellow(),
        to.unwrap_or("head").yellow()
    );
    print_changes(&changes);
    Ok(())
}

/// Compare a snapshot with the data directory
fn cmd_compare(vault: &Vault, selector: Option<&str>) -> Result<()> {
    let changes = vault.compare(selector)?;
    println!(
        "{} {} → {}",
        "Changes".bold(),
        selector.unwrap_or("head").yellow(),
        vault.config().source.display().to_string().yellow()
    );
    print_changes(&changes);
    Ok(())
}

/// Amend a snapshot's description
fn cmd_amend(vault: &Vault, selector: &str, text: &str) -> Result<()> {
    let meta = vault.amend(selector, text)?;
    println!(
        "{} Description of {} set to {}",
        "✓".green().bold(),
        meta.id.short().yellow(),
        meta.description().cyan()
    );
    Ok(())
}

/// Restore a snapshot
fn cmd_restore(vault: &Vault, selector: &str, target: Option<&Path>) -> Result<()> {
    let (_, meta) = vault.resolve(selector)?;
    println!(
        "{} {} ({})",
        "Restoring snapshot".blue().bold(),
        meta.id.short().yellow(),
        meta.description()
    );

    let pb = spinner("Taking safety snapshot and restoring...");
    let result = vault.restore(meta.id.as_str(), target);
    pb.finish_and_clear();
    let result = result?;

    println!("{} Restoration complete", "✓".green().bold());
    println!("  Target: {}", result.target.display().to_string().cyan());
    println!("  Files restored: {}", result.files_restored.to_string().cyan());
    println!("  Safety snapshot: {}", result.safety_snapshot.display().to_string().cyan());
    println!(
        "  Time: {}",
        format_duration(Duration::from_millis(result.duration_ms)).to_string().cyan()
    );
    for warning in &result.warnings {
        println!("  {} {}", "!".yellow().bold(), warning);
    }
    Ok(())
}

/// Remove the newest snapshot
fn cmd_prune(vault: &Vault) -> Result<()> {
    let result = vault.prune()?;
    println!(
        "{} Removed snapshot {}; newest is now {}",
        "✓".green().bold(),
        result.removed.short().yellow(),
        result.new_head.short().yellow()
    );
    println!("  {}", "History was rewritten; copies of the removed id elsewhere are now dangling.".dimmed());
    match (&result.error, result.pushed) {
        (Some(err), _) => println!("  Remote: {} ({})", "not updated".yellow(), err),
        (None, true) => println!("  Remote: {}", "updated".green()),
        (None, false) => {}
    }
    Ok(())
}

/// Run the scheduler until the process is stopped
fn cmd_daemon(vault: &Vault) -> Result<()> {
    if !vault.config().auto_backup {
        tracing::info!(
            "Automatic backups are disabled (auto_backup = false); use 'snapvault backup' and 'snapvault restore' manually"
        );
        return Ok(());
    }
    println!(
        "{} Scheduled backups of {} ({})",
        "▶".green().bold(),
        vault.config().source.display(),
        vault.config().schedule
    );
    vault.scheduler().run();
    Ok(())
}

/// Print the effective configuration, or write a template
fn cmd_config(config_path: &Path, init: Option<PathBuf>) -> Result<()> {
    if let Some(path) = init {
        if path.exists() {
            return Err(VaultError::config(format!("{} already exists", path.display())));
        }
        let template = VaultConfig::new("/path/to/data", "/path/to/working-copy");
        template.save(&path)?;
        println!("{} Wrote configuration template to {}", "✓".green().bold(), path.display());
        return Ok(());
    }

    let config = VaultConfig::load(config_path)?;
    let json = serde_json::to_string_pretty(&config.redacted())?;
    println!("{}", json);
    if let Err(e) = config.validate() {
        eprintln!("{} {}", "!".yellow().bold(), e);
    }
    Ok(())
}

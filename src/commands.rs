//! Command-line surface over a single `Keepsake` context.

use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};

use crate::config::{ConfigStore, KeepsakeConfig};
use crate::lifecycle::{Keepsake, KeepsakeBuilder, LifecycleEvent, StartupSource};
use crate::recovery::RecoverySource;
use crate::sync::SyncResult;

/// keepsake - survivable progress for anonymous visitors
#[derive(Parser, Debug)]
#[command(name = "keepsake")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to the JSON configuration file
    #[arg(short, long, default_value = "keepsake.json")]
    pub config: PathBuf,

    /// Overrides the configured data directory
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Overrides the configured cloud endpoint
    #[arg(long)]
    pub endpoint: Option<String>,

    /// Raise log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show identity, progress and storage health
    Status,

    /// Record a discovery
    Discover {
        id: String,
        #[arg(long, default_value = "")]
        label: String,
        #[arg(long, default_value = "")]
        message: String,
    },

    /// Take a snapshot now
    Backup,

    /// Push progress to the cloud and retry anything queued
    Sync,

    /// Replace live progress with the newest copy from one source
    Recover {
        #[arg(long, value_enum)]
        source: SourceArg,
    },

    /// Write progress to a file, or stdout without one
    Export { file: Option<PathBuf> },

    /// Adopt progress from an export file
    Import { file: PathBuf },

    /// Discard all stored progress for this identity
    StartFresh {
        /// Required; the reset cannot be undone
        #[arg(long)]
        yes: bool,
    },

    /// Keep the context open with background backups until Ctrl-C
    Run,
}

impl Commands {
    /// Only commands that take part in play count as a visit.
    pub fn counts_as_visit(&self) -> bool {
        matches!(self, Commands::Run | Commands::Discover { .. })
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum SourceArg {
    Emergency,
    Local,
    Cloud,
    Summary,
}

impl From<SourceArg> for RecoverySource {
    fn from(arg: SourceArg) -> Self {
        match arg {
            SourceArg::Emergency => RecoverySource::Emergency,
            SourceArg::Local => RecoverySource::LocalSnapshot,
            SourceArg::Cloud => RecoverySource::Cloud,
            SourceArg::Summary => RecoverySource::Summary,
        }
    }
}

impl Cli {
    /// File config, then environment, then flags.
    pub fn resolve_config(&self) -> Result<KeepsakeConfig> {
        let mut config = ConfigStore::new(self.config.clone())?
            .config()
            .with_env_overrides();
        if let Some(dir) = &self.data_dir {
            config.data_dir = dir.clone();
        }
        if let Some(endpoint) = &self.endpoint {
            config.cloud_endpoint = Some(endpoint.clone());
        }
        Ok(config)
    }
}

pub async fn dispatch(cli: Cli) -> Result<()> {
    let config = cli.resolve_config()?;
    let long_running = matches!(cli.command, Commands::Run);
    let keepsake = KeepsakeBuilder::new(config)
        .start_timers(long_running)
        .count_visit(cli.command.counts_as_visit())
        .start()
        .await
        .context("failed to start keepsake")?;

    if let Some(notice) = keepsake.startup().notice() {
        eprintln!("{notice}");
    }

    let outcome = execute(&keepsake, cli.command).await;
    keepsake.shutdown().await?;
    outcome
}

async fn execute(keepsake: &Keepsake, command: Commands) -> Result<()> {
    match command {
        Commands::Status => {
            let status = keepsake.status().await;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Discover { id, label, message } => {
            let label = if label.is_empty() { id.clone() } else { label };
            if keepsake.record_discovery(&id, &label, &message).await {
                println!("discovered {id}");
            } else {
                println!("{id} was already discovered");
            }
        }
        Commands::Backup => match keepsake.backup_now().await {
            Some(snapshot) => println!("snapshot {} on {}", snapshot.id, snapshot.origin_tier),
            None => bail!("no storage tier accepted the snapshot"),
        },
        Commands::Sync => {
            let retried = keepsake.retry_now().await;
            if retried.attempted > 0 {
                println!(
                    "retried {} queued push(es): {} succeeded",
                    retried.attempted, retried.succeeded
                );
            }
            match keepsake.sync_now().await {
                SyncResult::Synced { identity_used, .. } => println!("synced as {identity_used}"),
                SyncResult::Queued { pending } => {
                    println!("cloud unreachable; {pending} push(es) queued for retry")
                }
                SyncResult::Dropped => bail!("cloud push failed and could not be queued"),
                SyncResult::Disabled => println!("no cloud endpoint configured"),
            }
        }
        Commands::Recover { source } => {
            let source = RecoverySource::from(source);
            match keepsake.recover_from(source).await {
                Some(notice) => println!("{notice}"),
                None => bail!("the {source} holds no usable progress"),
            }
        }
        Commands::Export { file } => {
            let raw = keepsake.export().await.to_json_pretty()?;
            match file {
                Some(path) => {
                    fs::write(&path, raw)
                        .with_context(|| format!("failed to write {}", path.display()))?;
                    println!("exported to {}", path.display());
                }
                None => println!("{raw}"),
            }
        }
        Commands::Import { file } => {
            let raw = fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let notice = keepsake.import(&raw).await?;
            println!("{notice}");
        }
        Commands::StartFresh { yes } => {
            if !yes {
                bail!("start-fresh discards all progress; pass --yes to confirm");
            }
            keepsake.start_fresh().await?;
            println!("progress reset for {}", keepsake.identity().backup_id);
        }
        Commands::Run => {
            match &keepsake.startup().source {
                StartupSource::Loaded { origin } => println!("loaded progress from {origin}"),
                StartupSource::Recovered(_) => {}
                StartupSource::Fresh => println!("starting with fresh progress"),
            }
            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for Ctrl-C")?;
            keepsake.handle_event(LifecycleEvent::Closing).await;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_file_config() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config_path = dir.path().join("keepsake.json");
        fs::write(&config_path, r#"{"maxSnapshots": 9}"#).expect("write");

        let cli = Cli::parse_from([
            "keepsake",
            "--config",
            config_path.to_str().expect("utf-8 path"),
            "--endpoint",
            "http://127.0.0.1:9",
            "recover",
            "--source",
            "local",
        ]);
        let config = cli.resolve_config().expect("resolves");
        assert_eq!(config.max_snapshots, 9);
        assert_eq!(config.cloud_endpoint.as_deref(), Some("http://127.0.0.1:9"));
        assert!(matches!(
            cli.command,
            Commands::Recover {
                source: SourceArg::Local
            }
        ));
    }

    #[test]
    fn only_play_commands_count_as_visits() {
        let counted = |args: &[&str]| {
            let mut argv = vec!["keepsake"];
            argv.extend_from_slice(args);
            Cli::parse_from(argv).command.counts_as_visit()
        };
        assert!(counted(&["run"]));
        assert!(counted(&["discover", "attic"]));
        assert!(!counted(&["status"]));
        assert!(!counted(&["backup"]));
        assert!(!counted(&["export"]));
        assert!(!counted(&["recover", "--source", "cloud"]));
    }

    #[test]
    fn verbosity_counts() {
        let cli = Cli::parse_from(["keepsake", "-vv", "status"]);
        assert_eq!(cli.verbose, 2);
    }
}

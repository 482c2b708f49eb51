//! pipegridd — the pipegrid daemon binary.
//!
//! # Usage
//!
//! ```text
//! pipegridd run --config pipegrid.toml --data-dir /var/lib/pipegrid --replicas 3
//! pipegridd validate --config pipegrid.toml
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use pipegrid_core::PipegridConfig;
use pipegridd::{DaemonOptions, run_daemon, validate_config};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pipegridd", about = "pipegrid scheduler daemon", version)]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run scheduler replicas, the autoscaler and the lease reaper.
    Run {
        /// Path to pipegrid.toml.
        #[arg(long, default_value = "pipegrid.toml")]
        config: PathBuf,

        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/pipegrid")]
        data_dir: PathBuf,

        /// Number of scheduler replicas in this process.
        #[arg(long, default_value = "1")]
        replicas: usize,

        /// Replica id (prefix when running several). Random if unset.
        #[arg(long)]
        replica_id: Option<String>,
    },
    /// Check a configuration file without starting anything.
    Validate {
        #[arg(long, default_value = "pipegrid.toml")]
        config: PathBuf,
    },
}

fn init_tracing(json: bool) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new("info,pipegridd=debug,pipegrid=debug")?,
    };
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json)?;

    match cli.command {
        Command::Run {
            config,
            data_dir,
            replicas,
            replica_id,
        } => {
            let config = PipegridConfig::from_file(&config)?;
            run_daemon(DaemonOptions {
                config,
                data_dir,
                replicas,
                replica_id,
            })
            .await
        }
        Command::Validate { config: path } => {
            let config = PipegridConfig::from_file(&path)?;
            validate_config(&config)?;
            info!(
                path = ?path,
                pipelines = config.pipelines.len(),
                triggers = config.triggers.len(),
                "configuration is valid"
            );
            println!(
                "{}: {} pipelines, {} triggers, ok",
                path.display(),
                config.pipelines.len(),
                config.triggers.len()
            );
            Ok(())
        }
    }
}

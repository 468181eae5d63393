// Strata backup control plane entrypoint
//!
//! `inspect` recovers the handler from the journal and prints every job as
//! JSON. `run` keeps the periodic driver going until Ctrl-C.

mod lifecycle;
mod logging;
mod standalone;

use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Parser, Subcommand};
use log::info;
use strata_configs::ServerConfig;

#[derive(Debug, Parser)]
#[command(name = "strata-server", version, about = "Strata backup/restore control plane")]
struct Cli {
    /// Path to server.toml; defaults are used when the file does not exist
    #[arg(long, short, default_value = "server.toml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Recover from the journal and print job summaries as JSON
    Inspect {
        /// Only print jobs that are still running
        #[arg(long)]
        running: bool,
    },
    /// Recover and run the job driver until Ctrl-C
    Run,
}

fn load_config(path: &Path) -> Result<ServerConfig> {
    let mut config = if path.exists() {
        ServerConfig::from_file(path)?
    } else {
        eprintln!("Config file {} not found, using defaults", path.display());
        ServerConfig::default()
    };
    config.apply_env_overrides()?;
    config.finalize()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = match load_config(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("FATAL: Failed to load {}: {}", cli.config.display(), e);
            std::process::exit(1);
        }
    };

    logging::init_logging(&config.logging, "strata-server.log")?;
    info!(
        "Strata server v{} (journal: {})",
        env!("CARGO_PKG_VERSION"),
        config.backup.journal_dir
    );

    let (handler, report) = lifecycle::bootstrap(&config)?;
    match cli.command {
        Command::Inspect { running } => {
            let jobs: Vec<_> = handler
                .list_jobs()
                .into_iter()
                .filter(|job| !running || job.finished_at.is_none())
                .collect();
            let output = serde_json::json!({
                "repositories": handler.context().repositories.descriptors(),
                "jobs": jobs,
                "recovery": {
                    "restored": report.restored.len(),
                    "replayed": report.replayed,
                    "expired": report.skipped_expired.len(),
                    "dropped": report.dropped.len(),
                },
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Command::Run => lifecycle::run(handler).await?,
    }
    Ok(())
}

//! Command-line interface for the builder daemon.

use crate::config::config::BuilderConfig;
use crate::daemon::BuilderDaemon;
use crate::tester::registry::TesterRegistry;
use anyhow::Context;
use clap::{Parser, Subcommand};
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "buildbox")]
#[command(about = "Code-grading builder: connects worker threads to a central grading server")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the builder daemon in the foreground.
    ///
    /// Reads admin commands from stdin; `shutdown` (or end of input)
    /// stops the daemon gracefully.
    Run {
        /// Path to the JSON configuration file.
        #[arg(short, long, default_value = "builder.json")]
        config: PathBuf,

        /// Override the configured number of worker threads.
        #[arg(short, long)]
        workers: Option<usize>,
    },
    /// Load and validate the configuration, then exit.
    CheckConfig {
        /// Path to the JSON configuration file.
        #[arg(short, long, default_value = "builder.json")]
        config: PathBuf,
    },
}

/// Testers compiled into this build. Language backends register here as
/// they are added; an empty registry still runs and reports builder
/// errors for every submission.
fn built_in_testers() -> Arc<TesterRegistry> {
    Arc::new(TesterRegistry::new())
}

pub fn run() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, workers } => {
            let mut builder_config = BuilderConfig::load(&config)
                .with_context(|| format!("loading {}", config.display()))?;
            if let Some(workers) = workers {
                builder_config.num_workers = workers;
            }
            builder_config.validate().context("invalid configuration")?;

            let mut daemon = BuilderDaemon::new();
            daemon.start(builder_config, built_in_testers())?;

            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let line = line.context("reading admin command")?;
                if daemon.handle_command(&line) {
                    break;
                }
            }
            daemon.shutdown();
            Ok(())
        }
        Commands::CheckConfig { config } => {
            let builder_config = BuilderConfig::load(&config)
                .with_context(|| format!("loading {}", config.display()))?;
            builder_config.validate().context("invalid configuration")?;
            println!(
                "configuration ok: {} workers, server {}:{}, transport {:?}",
                builder_config.num_workers,
                builder_config.app_host,
                builder_config.app_port,
                builder_config.transport
            );
            Ok(())
        }
    }
}

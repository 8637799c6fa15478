//! Daemon lifecycle: owns the worker pool and reacts to admin commands.

use crate::config::config::BuilderConfig;
use crate::config::types::Result;
use crate::tester::registry::TesterRegistry;
use crate::worker::pool::Pool;
use std::sync::Arc;

/// The long-running builder process.
///
/// Commands arrive as lines on an admin channel (stdin when run in the
/// foreground). `shutdown` is the only command that stops the daemon;
/// anything unrecognized is logged and ignored so an operator typo never
/// kills the workers.
pub struct BuilderDaemon {
    pool: Option<Pool>,
}

impl BuilderDaemon {
    pub fn new() -> Self {
        Self { pool: None }
    }

    pub fn start(&mut self, config: BuilderConfig, testers: Arc<TesterRegistry>) -> Result<()> {
        log::info!(
            "builder daemon starting: {} workers, server {}:{}, transport {:?}",
            config.num_workers,
            config.app_host,
            config.app_port,
            config.transport
        );
        let supported = testers.supported_types();
        if supported.is_empty() {
            log::warn!("no testers registered; every submission will be a builder error");
        } else {
            log::info!(
                "registered testers: {}",
                supported
                    .iter()
                    .map(|t| t.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }
        self.pool = Some(Pool::start(config, testers)?);
        Ok(())
    }

    /// Handle one admin command. Returns `true` when the daemon should
    /// shut down.
    pub fn handle_command(&mut self, command: &str) -> bool {
        match command.trim() {
            "shutdown" => true,
            "" => false,
            other => {
                log::warn!("ignoring unknown command: {other}");
                false
            }
        }
    }

    pub fn shutdown(&mut self) {
        if let Some(pool) = self.pool.take() {
            log::info!("builder daemon shutting down");
            pool.shutdown();
        }
    }
}

impl Default for BuilderDaemon {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BuilderDaemon {
    fn drop(&mut self) {
        self.shutdown();
    }
}

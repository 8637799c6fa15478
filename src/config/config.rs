use crate::config::types::{BuilderError, Result};
/// Configuration loading from builder.json
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Transport strategy for reaching the grading server.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum TunnelMode {
    /// Direct encrypted socket to the server port, no tunnel.
    None,
    /// SSH subprocess forwarding a local port; the inner stream (TLS or
    /// plain) connects to the local side of the tunnel.
    SshTunnel,
    /// SSH subprocess with stdio forwarded straight to the remote port.
    /// SSH itself is the security boundary; no TLS is layered on top.
    DirectSshTunnel,
}

/// PEM material for the mutually-authenticated TLS connection.
///
/// The CA certificate verifies the server. When both the client
/// certificate and key are present the worker also authenticates itself;
/// otherwise the connection is made without client auth.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TlsMaterial {
    pub ca_cert_path: Option<PathBuf>,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
}

/// Process-wide sandbox policy knobs handed to the tester boundary.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SandboxSettings {
    pub enabled: bool,
    pub heap_size_bytes: u64,
    /// Scratch directory for per-submission build artifacts.
    /// Defaults to the system temporary directory.
    pub scratch_dir: Option<PathBuf>,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            heap_size_bytes: 8 * 1024 * 1024,
            scratch_dir: None,
        }
    }
}

/// Full builder configuration.
///
/// Every field has a default suitable for running interactively against a
/// grading server on localhost during development.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BuilderConfig {
    /// Grading server host.
    pub app_host: String,
    /// Grading server submission port.
    pub app_port: u16,
    /// Number of worker threads, each holding one connection.
    pub num_workers: usize,
    /// Transport strategy.
    pub transport: TunnelMode,
    /// Whether the (inner) stream is TLS encrypted. Off by default:
    /// there is no usable default for the PEM material, and a config
    /// file enabling TLS must also supply `tls.ca_cert_path`.
    pub use_tls: bool,
    pub tls: TlsMaterial,
    /// Remote username for the SSH tunnel variants.
    pub ssh_remote_user: String,
    /// Idle wait beyond which the watchdog force-closes the transport.
    pub watchdog_timeout_ms: u64,
    /// Watchdog polling interval.
    pub watchdog_poll_interval_ms: u64,
    /// Fixed sleep between reconnection attempts.
    pub reconnect_backoff_ms: u64,
    /// Grace period for an SSH tunnel subprocess to start accepting
    /// connections on the forwarded local port.
    pub ssh_warmup_ms: u64,
    /// First local port handed out for forwarded tunnels.
    pub tunnel_port_range_start: u16,
    /// Exclusive upper bound of the local tunnel-port range; allocation
    /// wraps back to the start when it is reached.
    pub tunnel_port_range_end: u32,
    pub sandbox: SandboxSettings,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            app_host: "localhost".to_string(),
            app_port: 47374,
            num_workers: 2,
            transport: TunnelMode::None,
            use_tls: false,
            tls: TlsMaterial::default(),
            ssh_remote_user: String::new(),
            watchdog_timeout_ms: 60_000,
            watchdog_poll_interval_ms: 10_000,
            reconnect_backoff_ms: 5_000,
            ssh_warmup_ms: 10_000,
            tunnel_port_range_start: 10_000,
            tunnel_port_range_end: 65_536,
            sandbox: SandboxSettings::default(),
        }
    }
}

impl BuilderConfig {
    /// Load configuration from a JSON file, falling back to defaults when
    /// the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::warn!(
                "Could not load {}, using default config",
                path.display()
            );
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(path)?;
        let config: BuilderConfig = serde_json::from_str(&data)
            .map_err(|e| BuilderError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_workers == 0 {
            return Err(BuilderError::Config(
                "num_workers must be at least 1".to_string(),
            ));
        }
        if self.tunnel_port_range_end <= u32::from(self.tunnel_port_range_start) {
            return Err(BuilderError::Config(format!(
                "tunnel port range is empty: {}..{}",
                self.tunnel_port_range_start, self.tunnel_port_range_end
            )));
        }
        if self.tunnel_port_range_end > 65_536 {
            return Err(BuilderError::Config(format!(
                "tunnel_port_range_end {} exceeds the port space",
                self.tunnel_port_range_end
            )));
        }
        // The direct SSH variant cannot layer TLS on top of subprocess
        // stdio; TLS material is only required for the other strategies.
        if self.use_tls
            && self.transport != TunnelMode::DirectSshTunnel
            && self.tls.ca_cert_path.is_none()
        {
            return Err(BuilderError::Config(
                "use_tls requires tls.ca_cert_path".to_string(),
            ));
        }
        if self.tls.cert_path.is_some() != self.tls.key_path.is_some() {
            return Err(BuilderError::Config(
                "tls.cert_path and tls.key_path must be set together".to_string(),
            ));
        }
        if matches!(
            self.transport,
            TunnelMode::SshTunnel | TunnelMode::DirectSshTunnel
        ) && self.ssh_remote_user.is_empty()
        {
            return Err(BuilderError::Config(
                "ssh tunnel transport requires ssh_remote_user".to_string(),
            ));
        }
        Ok(())
    }

    pub fn watchdog_timeout(&self) -> Duration {
        Duration::from_millis(self.watchdog_timeout_ms)
    }

    pub fn watchdog_poll_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_poll_interval_ms)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn ssh_warmup(&self) -> Duration {
        Duration::from_millis(self.ssh_warmup_ms)
    }
}

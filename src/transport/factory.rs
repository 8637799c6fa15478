//! Connection factory: one place that knows how to turn the configured
//! transport strategy into a live connection.

use crate::config::config::{BuilderConfig, TunnelMode};
use crate::config::types::Result;
use crate::transport::ssh::{DirectSshTransport, PortAllocator, SshTunnelTransport};
use crate::transport::tls::{load_client_config, StreamFactory};
use crate::transport::Transport;
use std::sync::Arc;

/// Builds transports per the configured strategy.
///
/// Shared by every worker thread. TLS material is parsed once here, at
/// construction, so a bad certificate path fails the daemon at startup
/// instead of once per reconnect attempt.
pub struct ConnectionFactory {
    config: BuilderConfig,
    streams: StreamFactory,
    ports: Arc<PortAllocator>,
}

impl ConnectionFactory {
    pub fn new(config: BuilderConfig) -> Result<Self> {
        // The direct SSH strategy is its own security layer; TLS material
        // is neither needed nor used there.
        let tls = if config.use_tls && config.transport != TunnelMode::DirectSshTunnel {
            Some(load_client_config(&config.tls)?)
        } else {
            None
        };
        let streams = StreamFactory::new(tls, &config.app_host);
        let ports = Arc::new(PortAllocator::new(
            config.tunnel_port_range_start,
            config.tunnel_port_range_end,
        ));
        Ok(Self {
            config,
            streams,
            ports,
        })
    }

    pub fn config(&self) -> &BuilderConfig {
        &self.config
    }

    /// One blocking connection attempt.
    pub fn connect(&self) -> Result<Box<dyn Transport>> {
        match self.config.transport {
            TunnelMode::None => self
                .streams
                .connect(&self.config.app_host, self.config.app_port),
            TunnelMode::SshTunnel => Ok(Box::new(SshTunnelTransport::connect(
                &self.config,
                &self.streams,
                Arc::clone(&self.ports),
            )?)),
            TunnelMode::DirectSshTunnel => {
                Ok(Box::new(DirectSshTransport::connect(&self.config)?))
            }
        }
    }
}

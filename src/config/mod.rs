/// Configuration module: builder settings and shared data model
pub mod config;
pub mod types;

pub use config::{BuilderConfig, SandboxSettings, TlsMaterial, TunnelMode};
pub use types::{BuilderError, Result};

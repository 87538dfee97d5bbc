//! Floodgate configuration structures to map the floodgate.toml configuration.

#![deny(missing_docs)]

mod alerts;
mod loader;
mod rate_limit;
mod server;
mod telemetry;

use std::path::Path;

pub use alerts::{AlertConfig, EmailConfig};
pub use rate_limit::*;
use serde::Deserialize;
pub use server::{
    AdminConfig, CheckEndpointConfig, ClientIpConfig, HealthConfig, IdentityConfig, ServerConfig, TlsServerConfig,
};
pub use telemetry::{
    TelemetryConfig,
    exporters::{BatchExportConfig, ExportersConfig, OtlpExporterConfig, OtlpProtocol},
};

/// Main configuration structure for the Floodgate application.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// HTTP server configuration settings.
    #[serde(default)]
    pub server: ServerConfig,
    /// Rate limiting configuration settings.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// Abuse alerting configuration settings.
    #[serde(default)]
    pub alerts: AlertConfig,
    /// Telemetry configuration settings.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl Config {
    /// Load configuration from a file path.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
        loader::load(path)
    }

    /// Parse and validate configuration from a TOML string.
    pub fn from_toml(content: &str) -> anyhow::Result<Config> {
        loader::parse(content)
    }

    /// Validates the value ranges of the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        loader::validate(self)
    }
}

use std::collections::BTreeMap;

use serde::Deserialize;

pub mod exporters;

pub use self::exporters::ExportersConfig;
use self::exporters::OtlpExporterConfig;

/// Telemetry configuration for observability
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct TelemetryConfig {
    /// Service name for telemetry identification
    service_name: Option<String>,

    /// Custom resource attributes to attach to all telemetry
    #[serde(default)]
    resource_attributes: BTreeMap<String, String>,

    /// Metrics exporters configuration
    #[serde(default)]
    exporters: ExportersConfig,
}

impl TelemetryConfig {
    /// Get the service name
    pub fn service_name(&self) -> Option<&str> {
        self.service_name.as_deref()
    }

    /// Get the resource attributes
    pub fn resource_attributes(&self) -> &BTreeMap<String, String> {
        &self.resource_attributes
    }

    /// Get the exporters configuration
    pub fn exporters(&self) -> &ExportersConfig {
        &self.exporters
    }

    /// The OTLP exporter for metrics, if one is enabled.
    pub fn metrics_otlp_config(&self) -> Option<&OtlpExporterConfig> {
        let otlp = self.exporters.otlp();
        otlp.enabled.then_some(otlp)
    }
}

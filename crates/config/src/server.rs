//! HTTP server configuration settings.

use std::{borrow::Cow, net::SocketAddr, path::PathBuf};

use secrecy::SecretString;
use serde::Deserialize;

/// HTTP server configuration settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// The socket address the server should listen on.
    pub listen_address: Option<SocketAddr>,
    /// TLS configuration for secure connections.
    pub tls: Option<TlsServerConfig>,
    /// Health endpoint configuration.
    pub health: HealthConfig,
    /// Admission decision endpoint configuration.
    pub check: CheckEndpointConfig,
    /// Administrative API configuration.
    pub admin: AdminConfig,
    /// How the client IP is derived from a request.
    pub client_ip: ClientIpConfig,
    /// How the authenticated user is derived from a request.
    pub identity: IdentityConfig,
    /// Whether limit, remaining and count headers are attached to responses.
    pub diagnostic_headers: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: None,
            tls: None,
            health: HealthConfig::default(),
            check: CheckEndpointConfig::default(),
            admin: AdminConfig::default(),
            client_ip: ClientIpConfig::default(),
            identity: IdentityConfig::default(),
            diagnostic_headers: true,
        }
    }
}

/// Configuration of the endpoint other services call to ask for an admission decision.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CheckEndpointConfig {
    /// Whether the check endpoint is exposed.
    pub enabled: bool,
    /// The path of the check endpoint.
    pub path: Cow<'static, str>,
}

impl Default for CheckEndpointConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: Cow::Borrowed("/v1/check"),
        }
    }
}

/// Administrative API configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AdminConfig {
    /// Whether the administrative API is exposed.
    pub enabled: bool,
    /// The path prefix of the administrative API.
    pub path: Cow<'static, str>,
    /// Bearer token required on every administrative request.
    pub token: Option<SecretString>,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: Cow::Borrowed("/admin"),
            token: None,
        }
    }
}

/// Client IP extraction settings.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientIpConfig {
    /// Take the client IP from `X-Forwarded-For` or `X-Real-IP` before the peer address.
    /// Enable only behind a proxy that sets these headers.
    pub trust_forwarded_headers: bool,
    /// Number of trusted proxies appending to `X-Forwarded-For`. The client IP is the hop
    /// this many entries from the right, so anything the client sent itself is skipped.
    pub trusted_proxies: usize,
}

impl Default for ClientIpConfig {
    fn default() -> Self {
        Self {
            trust_forwarded_headers: false,
            trusted_proxies: 1,
        }
    }
}

/// Authenticated user extraction settings.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IdentityConfig {
    /// Header set by the upstream authentication layer carrying the username.
    pub user_header: Option<String>,
}

/// TLS configuration for the listeners.
#[derive(Default, Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsServerConfig {
    /// Path to the TLS certificate PEM file.
    pub certificate: PathBuf,
    /// Path to the TLS private key PEM file.
    pub key: PathBuf,
}

/// Health endpoint configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HealthConfig {
    /// Whether the health endpoint is enabled.
    pub enabled: bool,
    /// Serve the health endpoint on a separate listener instead of the main one.
    pub listen: Option<SocketAddr>,
    /// The path for the health endpoint.
    pub path: Cow<'static, str>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        HealthConfig {
            enabled: true,
            listen: None,
            path: Cow::Borrowed("/health"),
        }
    }
}

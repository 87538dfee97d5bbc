use std::net::SocketAddr;

use anyhow::anyhow;
use config::{HealthConfig, TlsServerConfig};

use axum::{Json, Router, extract::State, routing::get};
use http::StatusCode;
use rate_limit::CounterStore;

use crate::state::AppState;

const PROBE_KEY: &str = "health:probe";

#[derive(Debug, serde::Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub(crate) enum HealthState {
    /// The counter store answers.
    Healthy,

    /// The counter store is unreachable. Requests are still admitted.
    Unhealthy,
}

/// Reports whether the counter store can be reached.
pub(crate) async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthState>) {
    match state.storage.get(PROBE_KEY).await {
        Ok(_) => (StatusCode::OK, Json(HealthState::Healthy)),
        Err(e) => {
            log::warn!("Health check failed to reach the counter store: {e}");
            (StatusCode::SERVICE_UNAVAILABLE, Json(HealthState::Unhealthy))
        }
    }
}

/// Binds the health check endpoint to the specified address and configuration.
pub(super) async fn bind_health_endpoint(
    addr: SocketAddr,
    tls_config: Option<TlsServerConfig>,
    health_config: HealthConfig,
    state: AppState,
) -> anyhow::Result<()> {
    let scheme = if tls_config.is_some() { "https" } else { "http" };
    let path = &health_config.path;
    let app = Router::new().route(path, get(health)).with_state(state).into_make_service();

    log::info!("Health check endpoint exposed at {scheme}://{addr}{path}");

    match tls_config {
        Some(tls) => {
            let rustls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(&tls.certificate, &tls.key)
                .await
                .map_err(|e| anyhow!("Failed to load TLS certificate and key: {}", e))?;

            axum_server::bind_rustls(addr, rustls_config)
                .serve(app)
                .await
                .map_err(|e| anyhow!("Failed to start HTTP server in the health endpoint: {e}"))?;
        }
        None => axum_server::bind(addr)
            .serve(app)
            .await
            .map_err(|e| anyhow!("Failed to start HTTP server in the health endpoint: {e}"))?,
    }

    Ok(())
}

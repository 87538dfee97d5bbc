//! Floodgate server library.
//!
//! Provides a reusable server function to serve Floodgate either for the binary, or for the integration tests.

#![deny(missing_docs)]

mod admin;
mod check;
mod health;
mod rate_limit;
mod shutdown;
mod state;

use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use ::rate_limit::{AbuseAlertDispatcher, AlertSender, EndpointLimitResolver, RateLimitGate, Storage};
use anyhow::{Context, anyhow};
use axum::{Router, routing::get};
use axum_server::tls_rustls::RustlsConfig;
use config::Config;
use tokio::net::TcpListener;

pub use rate_limit::{RateLimitLayer, RateLimitService};
use state::AppState;

/// Configuration for serving Floodgate.
pub struct ServeConfig {
    /// The socket address (IP and port) the server will bind to
    pub listen_address: SocketAddr,
    /// The deserialized Floodgate TOML configuration.
    pub config: Config,
    /// Application routes served behind the rate limit layer.
    pub guarded_routes: Option<Router>,
}

/// In-flight requests get this long to finish once shutdown starts.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Starts and runs the Floodgate server with the provided configuration until Ctrl+C or SIGTERM.
pub async fn serve(config: ServeConfig) -> anyhow::Result<()> {
    serve_with_shutdown(config, shutdown::shutdown_signal()).await
}

/// Starts the Floodgate server and shuts it down gracefully once `signal` resolves.
pub async fn serve_with_shutdown<F>(
    ServeConfig {
        listen_address,
        config,
        guarded_routes,
    }: ServeConfig,
    signal: F,
) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let storage = Storage::from_config(&config.rate_limit.storage)
        .await
        .context("Failed to initialize the counter store")?;

    let storage = Arc::new(storage);
    let resolver = Arc::new(EndpointLimitResolver::new(storage.clone(), &config.rate_limit));

    let dispatcher = AbuseAlertDispatcher::new(storage.clone(), &config.alerts)
        .context("Failed to initialize abuse alerting")?;

    let dispatcher = Arc::new(dispatcher);

    let alerts = if config.alerts.enabled {
        let (sender, _worker) = dispatcher.clone().spawn(config.alerts.queue_capacity);
        sender
    } else {
        log::debug!("Abuse alerting disabled - events will be discarded");
        AlertSender::disabled()
    };

    let gate = Arc::new(RateLimitGate::new(&config.rate_limit, storage.clone(), resolver, alerts));

    let state = AppState {
        gate,
        dispatcher,
        storage,
        diagnostic_headers: config.server.diagnostic_headers,
    };

    let mut app = Router::new();
    let mut exposed = Vec::new();

    if config.server.check.enabled {
        app = app.merge(check::router(&config.server.check.path, state.clone()));
        exposed.push(("Admission check", config.server.check.path.to_string()));
    }

    if config.server.admin.enabled {
        let Some(token) = config.server.admin.token.clone() else {
            return Err(anyhow!("The administrative API is enabled without a token"));
        };

        app = app.nest(&config.server.admin.path, admin::router(state.clone(), token));
        exposed.push(("Administrative API", config.server.admin.path.to_string()));
    }

    if let Some(routes) = guarded_routes {
        app = app.merge(routes.layer(RateLimitLayer::new(state.gate.clone(), &config.server)));
    }

    // The health endpoint is never rate limited.
    if config.server.health.enabled {
        if let Some(listen) = config.server.health.listen {
            tokio::spawn(health::bind_health_endpoint(
                listen,
                config.server.tls.clone(),
                config.server.health.clone(),
                state.clone(),
            ));
        } else {
            let health_router = Router::new()
                .route(&config.server.health.path, get(health::health))
                .with_state(state.clone());

            app = app.merge(health_router);
        }
    }

    let listener = TcpListener::bind(listen_address)
        .await
        .map_err(|e| anyhow!("Failed to bind to {listen_address}: {e}"))?;

    if exposed.is_empty() {
        log::warn!("Server starting with no functional endpoints. Enable the check endpoint or the administrative API.");
    }

    let app = app.into_make_service_with_connect_info::<SocketAddr>();

    match &config.server.tls {
        Some(tls_config) => {
            let rustls_config = RustlsConfig::from_pem_file(&tls_config.certificate, &tls_config.key)
                .await
                .map_err(|e| anyhow!("Failed to load TLS certificate and key: {e}"))?;

            for (name, path) in &exposed {
                log::info!("{name} available at: https://{listen_address}{path}");
            }

            let handle = axum_server::Handle::new();

            tokio::spawn({
                let handle = handle.clone();

                async move {
                    signal.await;
                    handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
                }
            });

            axum_server::from_tcp_rustls(listener.into_std()?, rustls_config)
                .handle(handle)
                .serve(app)
                .await
                .map_err(|e| anyhow!("Failed to start HTTPS server: {e}"))?;
        }
        None => {
            for (name, path) in &exposed {
                log::info!("{name} available at: http://{listen_address}{path}");
            }

            axum::serve(listener, app)
                .with_graceful_shutdown(signal)
                .await
                .map_err(|e| anyhow!("Failed to start HTTP server: {}", e))?;
        }
    }

    log::info!("Server stopped");

    Ok(())
}

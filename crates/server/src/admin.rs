//! Administrative API: limit overrides, templates, window inspection and abuse statistics.

use std::{net::IpAddr, sync::Arc};

use axum::{
    Json, Router,
    extract::{Path, Query, Request, State},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use http::{StatusCode, header::AUTHORIZATION};
use jiff::civil::Date;
use rate_limit::{CheckError, ConfigError, LimitUpdate, StatsError, StorageError};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;

use crate::state::AppState;

const DEFAULT_TREND_DAYS: usize = 7;

#[derive(Debug, thiserror::Error)]
enum AdminError {
    #[error("missing or invalid bearer token")]
    Unauthorized,
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("counter store unavailable: {0}")]
    Unavailable(String),
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        let status = match &self {
            AdminError::Unauthorized => StatusCode::UNAUTHORIZED,
            AdminError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AdminError::NotFound(_) => StatusCode::NOT_FOUND,
            AdminError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        };

        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

impl From<ConfigError> for AdminError {
    fn from(error: ConfigError) -> Self {
        match error {
            ConfigError::UnknownTemplate(_) => AdminError::NotFound(error.to_string()),
            ConfigError::Storage(e) => AdminError::from(e),
            error => AdminError::BadRequest(error.to_string()),
        }
    }
}

impl From<StorageError> for AdminError {
    fn from(error: StorageError) -> Self {
        log::warn!("Administrative request failed on the counter store: {error}");
        AdminError::Unavailable(error.to_string())
    }
}

impl From<StatsError> for AdminError {
    fn from(error: StatsError) -> Self {
        match error {
            StatsError::Storage(e) => AdminError::from(e),
            error => AdminError::BadRequest(error.to_string()),
        }
    }
}

impl From<CheckError> for AdminError {
    fn from(error: CheckError) -> Self {
        match error {
            CheckError::Storage(e) => AdminError::from(e),
            error => AdminError::BadRequest(error.to_string()),
        }
    }
}

pub(crate) fn router(state: AppState, token: SecretString) -> Router {
    let token = Arc::new(token);

    Router::new()
        .route("/limits/{*endpoint}", get(get_limit).put(update_limit).delete(remove_limit))
        .route("/reload", post(reload))
        .route("/templates", get(list_templates))
        .route("/templates/{name}/apply", post(apply_template))
        .route("/status", get(status))
        .route("/windows", delete(clear_windows))
        .route("/stats/trend", get(trend))
        .route("/stats/{date}", get(stats_for_date))
        .layer(middleware::from_fn_with_state(token, require_token))
        .with_state(state)
}

async fn require_token(State(token): State<Arc<SecretString>>, request: Request, next: Next) -> Response {
    let provided = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));

    match provided {
        Some(provided) if constant_time_eq(provided.as_bytes(), token.expose_secret().as_bytes()) => {
            next.run(request).await
        }
        _ => AdminError::Unauthorized.into_response(),
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// The wildcard segment does not carry the leading slash.
fn endpoint_path(endpoint: &str) -> String {
    format!("/{}", endpoint.trim_start_matches('/'))
}

async fn get_limit(State(state): State<AppState>, Path(endpoint): Path<String>) -> Response {
    let config = state.gate.resolver().get(&endpoint_path(&endpoint)).await;
    Json(config).into_response()
}

async fn update_limit(
    State(state): State<AppState>,
    Path(endpoint): Path<String>,
    Json(update): Json<LimitUpdate>,
) -> Result<Response, AdminError> {
    let config = state.gate.resolver().update(&endpoint_path(&endpoint), update).await?;
    Ok(Json(config).into_response())
}

async fn remove_limit(State(state): State<AppState>, Path(endpoint): Path<String>) -> Result<Response, AdminError> {
    let removed = state.gate.resolver().remove(&endpoint_path(&endpoint)).await?;
    Ok(Json(json!({ "removed": removed })).into_response())
}

async fn reload(State(state): State<AppState>) -> Result<Response, AdminError> {
    let loaded = state.gate.resolver().reload_all().await?;
    Ok(Json(json!({ "loaded": loaded })).into_response())
}

async fn list_templates(State(state): State<AppState>) -> Response {
    Json(state.gate.resolver().templates()).into_response()
}

#[derive(Debug, Deserialize)]
struct ApplyTemplate {
    endpoint: String,
}

async fn apply_template(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<ApplyTemplate>,
) -> Result<Response, AdminError> {
    let config = state.gate.resolver().apply_template(&name, &body.endpoint).await?;
    Ok(Json(config).into_response())
}

#[derive(Debug, Deserialize)]
struct WindowQuery {
    client_ip: String,
    endpoint: String,
    #[serde(default)]
    username: Option<String>,
}

impl WindowQuery {
    fn client_ip(&self) -> Result<String, AdminError> {
        self.client_ip
            .parse::<IpAddr>()
            .map(|ip| ip.to_string())
            .map_err(|_| AdminError::BadRequest(format!("invalid client_ip '{}'", self.client_ip)))
    }
}

async fn status(State(state): State<AppState>, Query(query): Query<WindowQuery>) -> Result<Response, AdminError> {
    let status = state
        .gate
        .status(&query.client_ip()?, &query.endpoint, query.username.as_deref())
        .await?;

    Ok(Json(status).into_response())
}

async fn clear_windows(
    State(state): State<AppState>,
    Query(query): Query<WindowQuery>,
) -> Result<Response, AdminError> {
    let deleted = state
        .gate
        .clear(&query.client_ip()?, &query.endpoint, query.username.as_deref())
        .await?;

    Ok(Json(json!({ "deleted": deleted })).into_response())
}

async fn stats_for_date(State(state): State<AppState>, Path(date): Path<String>) -> Result<Response, AdminError> {
    let date: Date = date
        .parse()
        .map_err(|e| AdminError::BadRequest(format!("invalid date '{date}': {e}")))?;

    let stats = state.dispatcher.stats_for_date(date).await?;
    Ok(Json(stats).into_response())
}

#[derive(Debug, Deserialize)]
struct TrendQuery {
    days: Option<usize>,
}

async fn trend(State(state): State<AppState>, Query(query): Query<TrendQuery>) -> Result<Response, AdminError> {
    let trend = state
        .dispatcher
        .trend(query.days.unwrap_or(DEFAULT_TREND_DAYS))
        .await?;
    Ok(Json(trend).into_response())
}

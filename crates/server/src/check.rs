//! Admission check endpoint for services asking on behalf of their own requests.

use std::net::IpAddr;

use axum::{
    Json, Router,
    extract::State,
    response::{IntoResponse, Response},
    routing::post,
};
use http::StatusCode;
use serde::Deserialize;

use crate::{rate_limit::insert_diagnostic_headers, state::AppState};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CheckRequest {
    client_ip: String,
    endpoint: String,
    #[serde(default)]
    username: Option<String>,
}

pub(crate) fn router(path: &str, state: AppState) -> Router {
    Router::new().route(path, post(check)).with_state(state)
}

async fn check(State(state): State<AppState>, Json(request): Json<CheckRequest>) -> Response {
    let Ok(client_ip) = request.client_ip.parse::<IpAddr>() else {
        let body = serde_json::json!({ "error": format!("invalid client_ip '{}'", request.client_ip) });
        return (StatusCode::BAD_REQUEST, Json(body)).into_response();
    };

    let decision = state
        .gate
        .evaluate(&client_ip.to_string(), &request.endpoint, request.username.as_deref())
        .await;

    let status = if decision.allowed {
        StatusCode::OK
    } else {
        StatusCode::TOO_MANY_REQUESTS
    };

    let mut response = (status, Json(&decision)).into_response();

    if state.diagnostic_headers {
        insert_diagnostic_headers(response.headers_mut(), &decision);
    }

    response
}

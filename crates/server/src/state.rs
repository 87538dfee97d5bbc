use std::sync::Arc;

use rate_limit::{AbuseAlertDispatcher, RateLimitGate, Storage};

/// Shared state of every route.
#[derive(Clone)]
pub(crate) struct AppState {
    pub gate: Arc<RateLimitGate<Storage>>,
    pub dispatcher: Arc<AbuseAlertDispatcher<Storage>>,
    pub storage: Arc<Storage>,
    pub diagnostic_headers: bool,
}

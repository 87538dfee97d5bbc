//! Endpoint normalization and counter key layout.

/// Turns a request path into the endpoint identifier used for limits and counter keys.
///
/// The query string is dropped, and every character outside `[A-Za-z0-9/_-]`
/// becomes `_`. The result is stable under repeated normalization.
pub fn normalize_endpoint(endpoint: &str) -> String {
    let path = endpoint.split_once('?').map_or(endpoint, |(path, _)| path);

    path.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '/' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// The identifier a sliding window is counted against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowScope {
    /// Client IP address.
    Ip,
    /// Authenticated username.
    User,
}

impl WindowScope {
    /// Label used in keys, events and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            WindowScope::Ip => "ip",
            WindowScope::User => "user",
        }
    }
}

/// Counter store key of the sliding window for one identifier on one endpoint.
pub fn window_key(scope: WindowScope, identifier: &str, endpoint: &str) -> String {
    format!("rl:{}:{identifier}:{endpoint}", scope.as_str())
}

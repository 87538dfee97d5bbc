//! Rate limiting middleware for HTTP requests.

use std::{
    fmt::Display,
    future::Future,
    net::{IpAddr, SocketAddr},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use axum::{body::Body, extract::ConnectInfo};
use config::ServerConfig;
use http::{HeaderMap, HeaderName, HeaderValue, Request, Response, StatusCode, header::CONTENT_TYPE};
use rate_limit::{Decision, RateLimitGate, Storage};
use tower::Layer;

const LIMIT_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-limit");
const REMAINING_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
const IP_COUNT_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-ip-count");
const USER_COUNT_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-user-count");

/// Attaches limit, remaining and window counts of an enforced decision.
pub(crate) fn insert_diagnostic_headers(headers: &mut HeaderMap, decision: &Decision) {
    if !decision.enforced {
        return;
    }

    headers.insert(LIMIT_HEADER, HeaderValue::from(decision.limit));
    headers.insert(REMAINING_HEADER, HeaderValue::from(decision.remaining));
    headers.insert(IP_COUNT_HEADER, HeaderValue::from(decision.ip_count));

    if let Some(user_count) = decision.user_count {
        headers.insert(USER_COUNT_HEADER, HeaderValue::from(user_count));
    }
}

#[derive(Clone)]
struct Settings {
    user_header: Option<HeaderName>,
    /// Trusted proxies in front of the server, `None` when forwarding headers are ignored.
    trusted_proxies: Option<usize>,
    diagnostic_headers: bool,
}

/// Tower layer guarding every request of the wrapped service with a [`RateLimitGate`].
#[derive(Clone)]
pub struct RateLimitLayer {
    gate: Arc<RateLimitGate<Storage>>,
    settings: Arc<Settings>,
}

impl RateLimitLayer {
    /// Creates the layer, reading identity and header settings from the server configuration.
    pub fn new(gate: Arc<RateLimitGate<Storage>>, config: &ServerConfig) -> Self {
        Self {
            gate,
            settings: Arc::new(Settings::from_config(config)),
        }
    }
}

impl Settings {
    fn from_config(config: &ServerConfig) -> Self {
        let user_header = config.identity.user_header.as_deref().and_then(|name| {
            HeaderName::try_from(name)
                .inspect_err(|e| log::warn!("Ignoring invalid identity header name '{name}': {e}"))
                .ok()
        });

        Self {
            user_header,
            trusted_proxies: config
                .client_ip
                .trust_forwarded_headers
                .then_some(config.client_ip.trusted_proxies),
            diagnostic_headers: config.diagnostic_headers,
        }
    }
}

impl<Service> Layer<Service> for RateLimitLayer
where
    Service: Send + Clone,
{
    type Service = RateLimitService<Service>;

    fn layer(&self, next: Service) -> Self::Service {
        RateLimitService {
            next,
            gate: self.gate.clone(),
            settings: self.settings.clone(),
        }
    }
}

/// Service produced by [`RateLimitLayer`].
#[derive(Clone)]
pub struct RateLimitService<Service> {
    next: Service,
    gate: Arc<RateLimitGate<Storage>>,
    settings: Arc<Settings>,
}

impl<Service, ReqBody> tower::Service<Request<ReqBody>> for RateLimitService<Service>
where
    Service: tower::Service<Request<ReqBody>, Response = Response<Body>> + Send + Clone + 'static,
    Service::Future: Send,
    Service::Error: Display + 'static,
    ReqBody: http_body::Body + Send + 'static,
{
    type Response = http::Response<Body>;
    type Error = Service::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Response<Body>, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.next.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let mut next = self.next.clone();
        let gate = self.gate.clone();
        let settings = self.settings.clone();

        Box::pin(async move {
            let Some(ip) = extract_client_ip(&req, settings.trusted_proxies) else {
                log::debug!("No client IP for {}, skipping rate limiting", req.uri().path());
                return next.call(req).await;
            };

            let username = settings
                .user_header
                .as_ref()
                .and_then(|name| req.headers().get(name))
                .and_then(|value| value.to_str().ok())
                .map(str::to_string);

            let endpoint = req
                .uri()
                .path_and_query()
                .map(|pq| pq.as_str())
                .unwrap_or_else(|| req.uri().path())
                .to_string();

            let decision = gate.evaluate(&ip.to_string(), &endpoint, username.as_deref()).await;

            if !decision.allowed {
                log::debug!("Request from {ip} to {endpoint} rejected by rate limit");

                let mut response = Response::new(Body::from("Rate limit exceeded"));
                *response.status_mut() = StatusCode::TOO_MANY_REQUESTS;
                response
                    .headers_mut()
                    .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));

                if settings.diagnostic_headers {
                    insert_diagnostic_headers(response.headers_mut(), &decision);
                }

                return Ok(response);
            }

            let mut response = next.call(req).await?;

            if settings.diagnostic_headers {
                insert_diagnostic_headers(response.headers_mut(), &decision);
            }

            Ok(response)
        })
    }
}

/// Extract client IP address from request.
///
/// Behind trusted proxies the forwarding headers name the client, otherwise
/// the peer address of the connection does.
fn extract_client_ip<B>(req: &Request<B>, trusted_proxies: Option<usize>) -> Option<IpAddr> {
    if let Some(trusted_proxies) = trusted_proxies
        && let Some(ip) = forwarded_ip(req.headers(), trusted_proxies)
    {
        return Some(ip);
    }

    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|connect_info| connect_info.0.ip())
}

fn forwarded_ip(headers: &HeaderMap, trusted_proxies: usize) -> Option<IpAddr> {
    // Proxies append, so everything left of the hop added by the outermost
    // trusted proxy is client controlled.
    if let Some(forwarded_for) = headers.get("x-forwarded-for") {
        let value = forwarded_for.to_str().ok()?;
        let ip_str = value.rsplit(',').nth(trusted_proxies.saturating_sub(1))?;

        return ip_str.trim().parse::<IpAddr>().ok();
    }

    let ip_str = headers.get("x-real-ip")?.to_str().ok()?;

    ip_str.trim().parse::<IpAddr>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(headers: &[(&str, &str)], peer: Option<&str>) -> Request<()> {
        let mut builder = Request::builder().uri("/login");

        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }

        let mut request = builder.body(()).unwrap();

        if let Some(peer) = peer {
            request
                .extensions_mut()
                .insert(ConnectInfo(peer.parse::<SocketAddr>().unwrap()));
        }

        request
    }

    #[test]
    fn forwarded_for_takes_the_hop_added_by_the_proxy() {
        let req = request(&[("x-forwarded-for", "198.51.100.1, 203.0.113.7")], Some("10.0.0.1:4000"));
        assert_eq!(extract_client_ip(&req, Some(1)), Some("203.0.113.7".parse().unwrap()));
    }

    #[test]
    fn forwarded_for_skips_trusted_proxy_hops() {
        let req = request(
            &[("x-forwarded-for", "198.51.100.1, 203.0.113.7, 10.0.0.2")],
            Some("10.0.0.1:4000"),
        );

        assert_eq!(extract_client_ip(&req, Some(2)), Some("203.0.113.7".parse().unwrap()));
    }

    #[test]
    fn short_forwarded_for_is_not_trusted() {
        let req = request(&[("x-forwarded-for", "203.0.113.7")], Some("10.0.0.1:4000"));
        assert_eq!(extract_client_ip(&req, Some(2)), Some("10.0.0.1".parse().unwrap()));
    }

    #[test]
    fn real_ip_is_used_without_forwarded_for() {
        let req = request(&[("x-real-ip", "2001:db8::1")], None);
        assert_eq!(extract_client_ip(&req, Some(1)), Some("2001:db8::1".parse().unwrap()));
    }

    #[test]
    fn untrusted_headers_are_ignored() {
        let req = request(&[("x-forwarded-for", "203.0.113.7")], Some("10.0.0.1:4000"));
        assert_eq!(extract_client_ip(&req, None), Some("10.0.0.1".parse().unwrap()));
    }

    #[test]
    fn spoofed_headers_are_ignored_by_default() {
        let settings = Settings::from_config(&ServerConfig::default());

        let peers = ["198.51.100.1", "198.51.100.2", "198.51.100.3"].map(|spoofed| {
            let req = request(&[("x-forwarded-for", spoofed)], Some("203.0.113.9:4000"));
            extract_client_ip(&req, settings.trusted_proxies)
        });

        assert_eq!(peers, [Some("203.0.113.9".parse().unwrap()); 3]);
    }

    #[test]
    fn no_ip_at_all() {
        let req = request(&[("x-forwarded-for", "not-an-ip")], None);
        assert_eq!(extract_client_ip(&req, Some(1)), None);
    }

    #[test]
    fn diagnostic_headers_skip_unenforced_decisions() {
        let mut headers = HeaderMap::new();
        let decision = Decision {
            allowed: true,
            enforced: false,
            endpoint: "/login".to_string(),
            limit: 0,
            ip_count: 0,
            user_count: None,
            remaining: 0,
        };

        insert_diagnostic_headers(&mut headers, &decision);
        assert!(headers.is_empty());

        let decision = Decision {
            enforced: true,
            limit: 5,
            ip_count: 2,
            user_count: Some(3),
            remaining: 2,
            ..decision
        };

        insert_diagnostic_headers(&mut headers, &decision);

        insta::assert_debug_snapshot!(headers, @r#"
        {
            "x-ratelimit-limit": "5",
            "x-ratelimit-remaining": "2",
            "x-ratelimit-ip-count": "2",
            "x-ratelimit-user-count": "3",
        }
        "#);
    }
}

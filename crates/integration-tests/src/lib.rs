use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Once;
use std::time::Duration;

use axum::{Router, routing::get};
use config::Config;
use server::ServeConfig;
use tokio::net::TcpListener;
use tokio::time::timeout;

pub use integration_test_macros::live_test;

/// Bearer token used by tests enabling the administrative API.
pub const ADMIN_TOKEN: &str = "test-admin-token";

static INIT: Once = Once::new();

fn init_crypto_provider() {
    INIT.call_once(|| {
        rustls::crypto::aws_lc_rs::default_provider()
            .install_default()
            .expect("Failed to install default crypto provider");
    });
}

/// Test client for making HTTP requests to the test server
pub struct TestClient {
    base_url: String,
    client: reqwest::Client,
}

impl TestClient {
    /// Create a new test client for the given base URL
    pub fn new(base_url: String) -> Self {
        Self {
            base_url,
            client: reqwest::Client::new(),
        }
    }

    /// Create a new test client that accepts invalid TLS certificates
    pub fn new_with_tls(base_url: String) -> Self {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .expect("Failed to create client with invalid cert acceptance");

        Self { base_url, client }
    }

    /// Build a request against the given path
    pub fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client.request(method, format!("{}{}", self.base_url, path))
    }

    /// Build an administrative request carrying the test token
    pub fn admin(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.request(method, &format!("/admin{path}")).bearer_auth(ADMIN_TOKEN)
    }

    /// Send a POST request to the given path with JSON body
    pub async fn post<T: serde::Serialize>(&self, path: &str, body: &T) -> reqwest::Response {
        self.request(reqwest::Method::POST, path)
            .json(body)
            .send()
            .await
            .unwrap()
    }

    /// Send a GET request to the given path
    pub async fn get(&self, path: &str) -> reqwest::Response {
        self.request(reqwest::Method::GET, path).send().await.unwrap()
    }

    /// Ask the check endpoint for a decision and return the status with the body
    pub async fn check(&self, client_ip: &str, endpoint: &str, username: Option<&str>) -> (u16, serde_json::Value) {
        let mut body = serde_json::json!({
            "client_ip": client_ip,
            "endpoint": endpoint,
        });

        if let Some(username) = username {
            body["username"] = username.into();
        }

        let response = self.post("/v1/check", &body).await;
        let status = response.status().as_u16();

        (status, response.json().await.unwrap())
    }
}

/// A router with a handful of application routes, for testing the rate limit layer.
pub fn application_routes() -> Router {
    Router::new()
        .route("/login", get(|| async { "logged in" }).post(|| async { "logged in" }))
        .route("/search", get(|| async { "results" }))
        .route("/posts", get(|| async { "posts" }))
}

type ShutdownSignal = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Builder for a [`TestServer`]
#[derive(Default)]
pub struct TestServerBuilder {
    guarded_routes: Option<Router>,
    shutdown: Option<ShutdownSignal>,
}

impl TestServerBuilder {
    /// Serve the given routes behind the rate limit layer
    pub fn guarded(mut self, routes: Router) -> Self {
        self.guarded_routes = Some(routes);
        self
    }

    /// Shut the server down gracefully once `signal` resolves
    pub fn shutdown_on(mut self, signal: impl Future<Output = ()> + Send + 'static) -> Self {
        self.shutdown = Some(Box::pin(signal));
        self
    }

    /// Start the server with the given TOML configuration
    pub async fn build(self, config_toml: &str) -> TestServer {
        init_crypto_provider();

        let config = Config::from_toml(config_toml).unwrap();

        // Find an available port
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();

        let has_tls = config.server.tls.is_some();

        let serve_config = ServeConfig {
            listen_address: address,
            config,
            guarded_routes: self.guarded_routes,
        };

        let (tx, mut rx) = tokio::sync::oneshot::channel();
        let handle = tokio::spawn(async move {
            // Drop the listener so the server can bind to the address
            drop(listener);

            let result = match self.shutdown {
                Some(signal) => server::serve_with_shutdown(serve_config, signal).await,
                None => server::serve(serve_config).await,
            };

            let _ = tx.send(result);
        });

        tokio::time::sleep(Duration::from_millis(100)).await;

        if let Ok(Err(e)) = rx.try_recv() {
            eprintln!("Server failed to start: {e:#}");
            std::process::exit(1);
        }

        let protocol = if has_tls { "https" } else { "http" };
        let base_url = format!("{protocol}://{address}");

        let client = if has_tls {
            TestClient::new_with_tls(base_url)
        } else {
            TestClient::new(base_url)
        };

        // Verify the server is actually running by making a simple request
        let mut retries = 10;
        while retries > 0 {
            if timeout(Duration::from_millis(100), client.get("/")).await.is_ok() {
                break;
            }
            retries -= 1;
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        TestServer {
            client,
            address,
            handle,
        }
    }
}

/// Test server that manages the lifecycle of a server instance
pub struct TestServer {
    pub client: TestClient,
    pub address: SocketAddr,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    /// Create a builder for a test server
    pub fn builder() -> TestServerBuilder {
        TestServerBuilder::default()
    }

    /// Wait for the server task to finish, returning whether it did within `limit`
    pub async fn stopped_within(self, limit: Duration) -> bool {
        matches!(timeout(limit, self.handle).await, Ok(Ok(())))
    }
}

/// A Redis key prefix unique to one test run
pub fn unique_prefix(test: &str) -> String {
    format!("floodgate_test_{test}_{}:", uuid::Uuid::new_v4().simple())
}

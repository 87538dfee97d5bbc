use indoc::indoc;
use integration_tests::TestServer;

#[tokio::test]
async fn health_endpoint_enabled() {
    let server = TestServer::builder().build("").await;

    let response = server.client.get("/health").await;
    assert_eq!(response.status(), 200);

    let body = response.text().await.unwrap();
    insta::assert_snapshot!(body, @r#"{"status":"healthy"}"#);
}

#[tokio::test]
async fn health_endpoint_disabled() {
    let config = indoc! {r#"
        [server.health]
        enabled = false
    "#};

    let server = TestServer::builder().build(config).await;

    let response = server.client.get("/health").await;
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn health_endpoint_custom_path() {
    let config = indoc! {r#"
        [server.health]
        path = "/status"
    "#};

    let server = TestServer::builder().build(config).await;

    let response = server.client.get("/status").await;
    assert_eq!(response.status(), 200);

    let response = server.client.get("/health").await;
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn health_endpoint_is_never_rate_limited() {
    let config = indoc! {r#"
        [rate_limit.default]
        max_requests = 1
        window = "60s"
    "#};

    let server = TestServer::builder()
        .guarded(integration_tests::application_routes())
        .build(config)
        .await;

    for _ in 0..5 {
        let response = server.client.get("/health").await;
        assert_eq!(response.status(), 200);
    }
}

#[tokio::test]
async fn health_endpoint_separate_listener() {
    let mut config = config::Config::from_toml("").unwrap();

    let main_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let main_addr = main_listener.local_addr().unwrap();

    let health_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let health_addr = health_listener.local_addr().unwrap();

    config.server.health.listen = Some(health_addr);

    let serve_config = server::ServeConfig {
        listen_address: main_addr,
        config,
        guarded_routes: None,
    };

    drop(main_listener);
    drop(health_listener);

    let _handle = tokio::spawn(async move {
        let _ = server::serve(serve_config).await;
    });

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let client = reqwest::Client::new();

    let response = client.get(format!("http://{main_addr}/health")).send().await.unwrap();
    assert_eq!(response.status(), 404);

    let response = client.get(format!("http://{health_addr}/health")).send().await.unwrap();
    assert_eq!(response.status(), 200);

    let body = response.text().await.unwrap();
    insta::assert_snapshot!(body, @r#"{"status":"healthy"}"#);
}

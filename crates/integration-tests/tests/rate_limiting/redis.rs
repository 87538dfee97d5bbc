use integration_tests::{ADMIN_TOKEN, TestServer, live_test, unique_prefix};
use serde_json::json;

fn redis_config(prefix: &str, extra: &str) -> String {
    indoc::formatdoc! {r#"
        [server.admin]
        enabled = true
        token = "{ADMIN_TOKEN}"

        [rate_limit.storage]
        type = "redis"
        url = "redis://localhost:6379/0"
        key_prefix = "{prefix}"

        {extra}
    "#}
}

#[live_test(redis)]
async fn login_limit() {
    let config = redis_config(&unique_prefix("login"), "");
    let server = TestServer::builder().build(&config).await;

    let mut statuses = Vec::new();

    for _ in 0..6 {
        let (status, _) = server.client.check("203.0.113.20", "/login", None).await;
        statuses.push(status);
    }

    assert_eq!(statuses, vec![200, 200, 200, 200, 200, 429]);
}

#[live_test(redis)]
async fn concurrent_requests_never_over_admit() {
    let config = redis_config(
        &unique_prefix("concurrent"),
        indoc::indoc! {r#"
            [rate_limit.endpoints."/burst"]
            max_requests = 10
            window = "60s"
        "#},
    );

    let server = std::sync::Arc::new(TestServer::builder().build(&config).await);

    let mut handles = Vec::new();

    for _ in 0..40 {
        let server = server.clone();

        handles.push(tokio::spawn(async move {
            server.client.check("203.0.113.21", "/burst", None).await.0
        }));
    }

    let mut admitted = 0;

    for handle in handles {
        if handle.await.unwrap() == 200 {
            admitted += 1;
        }
    }

    assert_eq!(admitted, 10);
}

#[live_test(redis)]
async fn overrides_are_shared_between_instances() {
    let prefix = unique_prefix("shared");
    let config = redis_config(&prefix, "");

    let first = TestServer::builder().build(&config).await;
    let second = TestServer::builder().build(&config).await;

    let response = first
        .client
        .admin(reqwest::Method::PUT, "/limits/reports")
        .json(&json!({ "max_requests": 1, "window_seconds": 60 }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);

    let (status, _) = second.client.check("203.0.113.22", "/reports", None).await;
    assert_eq!(status, 200);

    // Both instances count into the same window.
    let (status, _) = first.client.check("203.0.113.22", "/reports", None).await;
    assert_eq!(status, 429);
}

#[live_test(redis)]
async fn health_reports_healthy() {
    let config = redis_config(&unique_prefix("health"), "");
    let server = TestServer::builder().build(&config).await;

    let response = server.client.get("/health").await;
    assert_eq!(response.status(), 200);
}

use indoc::indoc;
use integration_tests::{TestServer, application_routes};
use serde_json::json;

const CONFIG: &str = indoc! {r#"
    [server.client_ip]
    trust_forwarded_headers = true
    trusted_proxies = 2

    [server.identity]
    user_header = "x-user"

    [rate_limit.endpoints."/posts"]
    max_requests = 2
    window = "60s"
    scope = "both"
"#};

#[tokio::test]
async fn guarded_routes_are_limited_per_forwarded_address() {
    let server = TestServer::builder().guarded(application_routes()).build(CONFIG).await;

    let mut results = Vec::new();

    for (i, ip) in ["10.1.0.1", "10.1.0.1", "10.1.0.1", "10.1.0.2"].into_iter().enumerate() {
        let response = server
            .client
            .request(reqwest::Method::GET, "/posts")
            .header("X-Forwarded-For", format!("198.51.100.{}, {ip}, 172.16.0.1", i + 1))
            .send()
            .await
            .unwrap();

        let status = response.status().as_u16();
        let remaining = response
            .headers()
            .get("x-ratelimit-remaining")
            .and_then(|h| h.to_str().ok())
            .map(str::to_string);

        results.push(json!({
            "request": i + 1,
            "ip": ip,
            "status": status,
            "remaining": remaining,
            "body": response.text().await.unwrap(),
        }));
    }

    insta::assert_json_snapshot!(results, @r#"
    [
      {
        "request": 1,
        "ip": "10.1.0.1",
        "status": 200,
        "remaining": "1",
        "body": "posts"
      },
      {
        "request": 2,
        "ip": "10.1.0.1",
        "status": 200,
        "remaining": "0",
        "body": "posts"
      },
      {
        "request": 3,
        "ip": "10.1.0.1",
        "status": 429,
        "remaining": "0",
        "body": "Rate limit exceeded"
      },
      {
        "request": 4,
        "ip": "10.1.0.2",
        "status": 200,
        "remaining": "1",
        "body": "posts"
      }
    ]
    "#);
}

#[tokio::test]
async fn user_header_is_counted_across_addresses() {
    let server = TestServer::builder().guarded(application_routes()).build(CONFIG).await;

    let mut statuses = Vec::new();

    for ip in ["10.2.0.1", "10.2.0.2", "10.2.0.3"] {
        let response = server
            .client
            .request(reqwest::Method::GET, "/posts")
            .header("X-Real-IP", ip)
            .header("x-user", "carol")
            .send()
            .await
            .unwrap();

        statuses.push(response.status().as_u16());
    }

    assert_eq!(statuses, vec![200, 200, 429]);
}

#[tokio::test]
async fn peer_address_is_used_by_default() {
    let config = indoc! {r#"
        [rate_limit.endpoints."/posts"]
        max_requests = 1
        window = "60s"
    "#};

    let server = TestServer::builder().guarded(application_routes()).build(config).await;

    // Spoofed addresses all collapse onto the loopback peer.
    let mut statuses = Vec::new();

    for ip in ["10.3.0.1", "10.3.0.2"] {
        let response = server
            .client
            .request(reqwest::Method::GET, "/posts")
            .header("X-Forwarded-For", ip)
            .send()
            .await
            .unwrap();

        statuses.push(response.status().as_u16());
    }

    assert_eq!(statuses, vec![200, 429]);
}

#[tokio::test]
async fn diagnostic_headers_can_be_disabled() {
    let config = indoc! {r#"
        [server]
        diagnostic_headers = false
    "#};

    let server = TestServer::builder().guarded(application_routes()).build(config).await;

    let response = server.client.get("/posts").await;

    assert_eq!(response.status(), 200);
    assert!(response.headers().get("x-ratelimit-limit").is_none());
}

use indoc::indoc;
use integration_tests::TestServer;
use serde_json::json;

#[tokio::test]
async fn login_limit_from_one_address() {
    let server = TestServer::builder().build("").await;

    let mut results = Vec::new();

    for i in 1..=6 {
        let (status, body) = server.client.check("203.0.113.10", "/login", None).await;

        results.push(json!({
            "request": i,
            "status": status,
            "allowed": body["allowed"],
            "ip_count": body["ip_count"],
            "remaining": body["remaining"],
        }));
    }

    insta::assert_json_snapshot!(results, @r#"
    [
      {
        "request": 1,
        "status": 200,
        "allowed": true,
        "ip_count": 1,
        "remaining": 4
      },
      {
        "request": 2,
        "status": 200,
        "allowed": true,
        "ip_count": 2,
        "remaining": 3
      },
      {
        "request": 3,
        "status": 200,
        "allowed": true,
        "ip_count": 3,
        "remaining": 2
      },
      {
        "request": 4,
        "status": 200,
        "allowed": true,
        "ip_count": 4,
        "remaining": 1
      },
      {
        "request": 5,
        "status": 200,
        "allowed": true,
        "ip_count": 5,
        "remaining": 0
      },
      {
        "request": 6,
        "status": 429,
        "allowed": false,
        "ip_count": 5,
        "remaining": 0
      }
    ]
    "#);
}

#[tokio::test]
async fn addresses_are_counted_independently() {
    let server = TestServer::builder().build("").await;

    for _ in 0..5 {
        let (status, _) = server.client.check("198.51.100.1", "/login", None).await;
        assert_eq!(status, 200);
    }

    let (status, _) = server.client.check("198.51.100.1", "/login", None).await;
    assert_eq!(status, 429);

    let (status, body) = server.client.check("198.51.100.2", "/login", None).await;
    assert_eq!(status, 200);
    assert_eq!(body["ip_count"], 1);
}

#[tokio::test]
async fn user_window_spans_addresses() {
    let config = indoc! {r#"
        [rate_limit.endpoints."/comment"]
        max_requests = 2
        window = "60s"
        scope = "both"
    "#};

    let server = TestServer::builder().build(config).await;

    let mut results = Vec::new();

    for (i, ip) in ["192.0.2.1", "192.0.2.2", "192.0.2.3"].into_iter().enumerate() {
        let (status, body) = server.client.check(ip, "/comment", Some("alice")).await;
        results.push(json!({ "request": i + 1, "status": status, "decision": body }));
    }

    insta::assert_json_snapshot!(results, @r#"
    [
      {
        "request": 1,
        "status": 200,
        "decision": {
          "allowed": true,
          "enforced": true,
          "endpoint": "/comment",
          "limit": 2,
          "ip_count": 1,
          "user_count": 1,
          "remaining": 1
        }
      },
      {
        "request": 2,
        "status": 200,
        "decision": {
          "allowed": true,
          "enforced": true,
          "endpoint": "/comment",
          "limit": 2,
          "ip_count": 1,
          "user_count": 2,
          "remaining": 0
        }
      },
      {
        "request": 3,
        "status": 429,
        "decision": {
          "allowed": false,
          "enforced": true,
          "endpoint": "/comment",
          "limit": 2,
          "ip_count": 1,
          "user_count": 2,
          "remaining": 0
        }
      }
    ]
    "#);
}

#[tokio::test]
async fn username_is_ignored_for_ip_scoped_limits() {
    let server = TestServer::builder().build("").await;

    let (status, body) = server.client.check("192.0.2.50", "/search", Some("bob")).await;

    assert_eq!(status, 200);
    assert_eq!(body["user_count"], serde_json::Value::Null);
}

#[tokio::test]
async fn query_string_is_not_part_of_the_endpoint() {
    let config = indoc! {r#"
        [rate_limit.endpoints."/search"]
        max_requests = 1
        window = "60s"
    "#};

    let server = TestServer::builder().build(config).await;

    let (status, body) = server.client.check("192.0.2.60", "/search?q=rust", None).await;
    assert_eq!(status, 200);
    assert_eq!(body["endpoint"], "/search");

    let (status, _) = server.client.check("192.0.2.60", "/search?q=other", None).await;
    assert_eq!(status, 429);
}

#[tokio::test]
async fn unknown_endpoints_use_the_default_limit() {
    let config = indoc! {r#"
        [rate_limit.default]
        max_requests = 2
        window = "30s"
    "#};

    let server = TestServer::builder().build(config).await;

    let (_, body) = server.client.check("192.0.2.70", "/profile/42", None).await;
    assert_eq!(body["limit"], 2);

    let (_, _) = server.client.check("192.0.2.70", "/profile/42", None).await;
    let (status, _) = server.client.check("192.0.2.70", "/profile/42", None).await;
    assert_eq!(status, 429);
}

#[tokio::test]
async fn disabled_rate_limiting_admits_everything() {
    let config = indoc! {r#"
        [rate_limit]
        enabled = false
    "#};

    let server = TestServer::builder().build(config).await;

    for _ in 0..10 {
        let (status, body) = server.client.check("192.0.2.80", "/login", None).await;
        assert_eq!(status, 200);
        assert_eq!(body["enforced"], false);
    }
}

#[tokio::test]
async fn disabled_endpoint_admits_everything() {
    let config = indoc! {r#"
        [rate_limit.endpoints."/login"]
        max_requests = 1
        window = "60s"
        enabled = false
    "#};

    let server = TestServer::builder().build(config).await;

    for _ in 0..3 {
        let (status, body) = server.client.check("192.0.2.81", "/login", None).await;
        assert_eq!(status, 200);
        assert_eq!(body["enforced"], false);
    }
}

#[tokio::test]
async fn invalid_client_ip_is_rejected() {
    let server = TestServer::builder().build("").await;

    let (status, body) = server.client.check("not-an-address", "/login", None).await;

    assert_eq!(status, 400);
    insta::assert_json_snapshot!(body, @r#"
    {
      "error": "invalid client_ip 'not-an-address'"
    }
    "#);
}

#[tokio::test]
async fn check_response_carries_diagnostic_headers() {
    let server = TestServer::builder().build("").await;

    let response = server
        .client
        .post(
            "/v1/check",
            &json!({ "client_ip": "192.0.2.90", "endpoint": "/register" }),
        )
        .await;

    let headers = response.headers();

    insta::assert_json_snapshot!(json!({
        "limit": headers.get("x-ratelimit-limit").and_then(|v| v.to_str().ok()),
        "remaining": headers.get("x-ratelimit-remaining").and_then(|v| v.to_str().ok()),
        "ip_count": headers.get("x-ratelimit-ip-count").and_then(|v| v.to_str().ok()),
    }), @r#"
    {
      "limit": "3",
      "remaining": "2",
      "ip_count": "1"
    }
    "#);
}

#[tokio::test]
async fn check_endpoint_can_be_disabled() {
    let config = indoc! {r#"
        [server.check]
        enabled = false
    "#};

    let server = TestServer::builder().build(config).await;

    let response = server
        .client
        .post("/v1/check", &json!({ "client_ip": "192.0.2.91", "endpoint": "/login" }))
        .await;

    assert_eq!(response.status(), 404);
}

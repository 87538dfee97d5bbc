use std::time::Duration;

use indoc::formatdoc;
use integration_tests::{ADMIN_TOKEN, TestServer};
use reqwest::Method;
use serde_json::{Value, json};

fn admin_config() -> String {
    formatdoc! {r#"
        [server.admin]
        enabled = true
        token = "{ADMIN_TOKEN}"
    "#}
}

async fn admin_server() -> TestServer {
    TestServer::builder().build(&admin_config()).await
}

async fn json_body(response: reqwest::Response) -> (u16, Value) {
    let status = response.status().as_u16();
    (status, response.json().await.unwrap())
}

#[tokio::test]
async fn requests_without_token_are_rejected() {
    let server = admin_server().await;

    let response = server.client.get("/admin/templates").await;
    let (status, body) = json_body(response).await;

    assert_eq!(status, 401);
    insta::assert_json_snapshot!(body, @r#"
    {
      "error": "missing or invalid bearer token"
    }
    "#);

    let response = server
        .client
        .request(Method::GET, "/admin/templates")
        .bearer_auth("wrong-token")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 401);
}

#[tokio::test]
async fn admin_api_is_disabled_by_default() {
    let server = TestServer::builder().build("").await;

    let response = server.client.admin(Method::GET, "/templates").send().await.unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn builtin_limit() {
    let server = admin_server().await;

    let response = server.client.admin(Method::GET, "/limits/login").send().await.unwrap();
    let (status, body) = json_body(response).await;

    assert_eq!(status, 200);
    insta::assert_json_snapshot!(body, @r#"
    {
      "endpoint_pattern": "/login",
      "max_requests": 5,
      "window_seconds": 300,
      "scope": "ip",
      "enabled": true,
      "description": "Login attempts",
      "source": "static"
    }
    "#);
}

#[tokio::test]
async fn override_takes_effect_and_can_be_removed() {
    let server = admin_server().await;

    let response = server
        .client
        .admin(Method::PUT, "/limits/login")
        .json(&json!({ "max_requests": 1, "window_seconds": 60, "description": "Under attack" }))
        .send()
        .await
        .unwrap();

    let (status, body) = json_body(response).await;

    assert_eq!(status, 200);
    assert_eq!(body["source"], "override");
    assert_eq!(body["max_requests"], 1);
    assert!(body["updated_at"].is_string());

    let (status, _) = server.client.check("203.0.113.30", "/login", None).await;
    assert_eq!(status, 200);

    let (status, _) = server.client.check("203.0.113.30", "/login", None).await;
    assert_eq!(status, 429);

    let response = server.client.admin(Method::DELETE, "/limits/login").send().await.unwrap();
    let (_, body) = json_body(response).await;
    insta::assert_json_snapshot!(body, @r#"
    {
      "removed": true
    }
    "#);

    // The built-in limit of five applies again.
    let (status, body) = server.client.check("203.0.113.30", "/login", None).await;
    assert_eq!(status, 200);
    assert_eq!(body["limit"], 5);
}

#[tokio::test]
async fn invalid_override_is_rejected() {
    let server = admin_server().await;

    let response = server
        .client
        .admin(Method::PUT, "/limits/login")
        .json(&json!({ "max_requests": 0, "window_seconds": 60 }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 400);

    let response = server.client.admin(Method::GET, "/limits/login").send().await.unwrap();
    let (_, body) = json_body(response).await;

    assert_eq!(body["max_requests"], 5);
}

#[tokio::test]
async fn templates_can_be_listed_and_applied() {
    let server = admin_server().await;

    let response = server.client.admin(Method::GET, "/templates").send().await.unwrap();
    let (status, body) = json_body(response).await;

    assert_eq!(status, 200);

    let names: Vec<&str> = body
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|template| template["name"].as_str())
        .collect();

    insta::assert_json_snapshot!(names, @r#"
    [
      "login",
      "register",
      "search",
      "password-reset",
      "comment",
      "upload",
      "api-default"
    ]
    "#);

    let response = server
        .client
        .admin(Method::POST, "/templates/comment/apply")
        .json(&json!({ "endpoint": "/forum/reply" }))
        .send()
        .await
        .unwrap();

    let (status, body) = json_body(response).await;

    assert_eq!(status, 200);
    assert_eq!(body["endpoint_pattern"], "/forum/reply");
    assert_eq!(body["max_requests"], 10);
    assert_eq!(body["scope"], "both");

    let response = server
        .client
        .admin(Method::POST, "/templates/missing/apply")
        .json(&json!({ "endpoint": "/forum/reply" }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn status_and_clear_windows() {
    let server = admin_server().await;

    for _ in 0..3 {
        server.client.check("203.0.113.40", "/search", Some("dave")).await;
    }

    let query = "client_ip=203.0.113.40&endpoint=/search&username=dave";

    let response = server
        .client
        .admin(Method::GET, &format!("/status?{query}"))
        .send()
        .await
        .unwrap();

    let (status, body) = json_body(response).await;

    assert_eq!(status, 200);
    insta::assert_json_snapshot!(body, @r#"
    {
      "endpoint": "/search",
      "enabled": true,
      "max_requests": 100,
      "window_seconds": 60,
      "ip_count": 3,
      "user_count": null,
      "remaining": 97
    }
    "#);

    let response = server
        .client
        .admin(Method::DELETE, &format!("/windows?{query}"))
        .send()
        .await
        .unwrap();

    let (status, body) = json_body(response).await;

    assert_eq!(status, 200);
    assert_eq!(body["deleted"], 1);

    let response = server
        .client
        .admin(Method::GET, &format!("/status?{query}"))
        .send()
        .await
        .unwrap();

    let (_, body) = json_body(response).await;
    assert_eq!(body["ip_count"], 0);
}

#[tokio::test]
async fn status_rejects_invalid_address() {
    let server = admin_server().await;

    let response = server
        .client
        .admin(Method::GET, "/status?client_ip=nope&endpoint=/login")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn reload_reports_loaded_overrides() {
    let server = admin_server().await;

    for endpoint in ["/a", "/b"] {
        server
            .client
            .admin(Method::PUT, &format!("/limits{endpoint}"))
            .json(&json!({ "max_requests": 3, "window_seconds": 30 }))
            .send()
            .await
            .unwrap();
    }

    let response = server.client.admin(Method::POST, "/reload").send().await.unwrap();
    let (status, body) = json_body(response).await;

    assert_eq!(status, 200);
    insta::assert_json_snapshot!(body, @r#"
    {
      "loaded": 2
    }
    "#);
}

#[tokio::test]
async fn exceeded_limits_show_up_in_statistics() {
    let server = admin_server().await;

    for _ in 0..6 {
        server.client.check("203.0.113.50", "/login", None).await;
    }

    // Alerts are processed in the background.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let response = server.client.admin(Method::GET, "/stats/trend?days=1").send().await.unwrap();
    let (status, trend) = json_body(response).await;

    assert_eq!(status, 200);
    assert_eq!(trend.as_array().unwrap().len(), 1);
    assert_eq!(trend[0]["total"], 1);

    let today = trend[0]["date"].as_str().unwrap().to_string();

    let response = server
        .client
        .admin(Method::GET, &format!("/stats/{today}"))
        .send()
        .await
        .unwrap();

    let (status, mut stats) = json_body(response).await;
    assert_eq!(status, 200);

    stats["date"] = json!("[today]");

    insta::assert_json_snapshot!(stats, @r#"
    {
      "date": "[today]",
      "total": 1,
      "per_ip": {
        "203.0.113.50": 1
      },
      "per_uri": {
        "/login": 1
      },
      "per_user": {}
    }
    "#);
}

#[tokio::test]
async fn statistics_reject_invalid_input() {
    let server = admin_server().await;

    let response = server.client.admin(Method::GET, "/stats/yesterday").send().await.unwrap();
    assert_eq!(response.status(), 400);

    let response = server.client.admin(Method::GET, "/stats/trend?days=0").send().await.unwrap();
    assert_eq!(response.status(), 400);

    let response = server.client.admin(Method::GET, "/stats/trend").send().await.unwrap();
    let (status, trend) = json_body(response).await;

    assert_eq!(status, 200);
    assert_eq!(trend.as_array().unwrap().len(), 7);
}

use std::time::Duration;

use integration_tests::TestServer;
use tokio::sync::oneshot;

#[tokio::test]
async fn server_stops_on_shutdown_signal() {
    let (stop, stopped) = oneshot::channel::<()>();

    let server = TestServer::builder()
        .shutdown_on(async move {
            let _ = stopped.await;
        })
        .build("")
        .await;

    assert_eq!(server.client.get("/health").await.status(), 200);

    stop.send(()).unwrap();

    assert!(server.stopped_within(Duration::from_secs(5)).await);
}

#[tokio::test]
async fn server_keeps_running_without_a_signal() {
    let (_stop, stopped) = oneshot::channel::<()>();

    let server = TestServer::builder()
        .shutdown_on(async move {
            let _ = stopped.await;
        })
        .build("")
        .await;

    let address = server.address;
    let client = reqwest::Client::new();

    assert!(!server.stopped_within(Duration::from_millis(200)).await);
    assert!(client.get(format!("http://{address}/health")).send().await.is_ok());
}

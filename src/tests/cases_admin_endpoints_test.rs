// End-to-end: the admin routes answer independently of any registered
// backend, and the store-health virtual host behaves per its own status.

use crate::support::ProxyProcess;

#[tokio::test]
async fn healthz_reports_ok_once_serving() {
    let proxy = ProxyProcess::start().await;

    let resp = reqwest::get(format!("{}/healthz", proxy.addr)).await.unwrap();
    assert_eq!(resp.status().as_u16(), 200);

    proxy.stop().await;
}

#[tokio::test]
async fn metrics_exposes_prometheus_text_with_request_counters() {
    let proxy = ProxyProcess::start().await;

    // Drive at least one request through the fallback so the counters move.
    let _ = reqwest::get(proxy.addr.as_str()).await;

    let resp = reqwest::get(format!("{}/metrics", proxy.addr)).await.unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let body = resp.text().await.unwrap();
    assert!(body.contains("roxxy_requests_total"));
    assert!(body.contains("roxxy_responses_total"));

    proxy.stop().await;
}

#[tokio::test]
async fn ping_virtual_host_reflects_store_health() {
    let proxy = ProxyProcess::start().await;

    let client = reqwest::Client::new();
    let resp = client
        .get(proxy.addr.as_str())
        .header("host", "__ping__")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(resp.text().await.unwrap(), "ok\n");

    proxy.store.set_healthy(false);

    let resp = client
        .get(proxy.addr.as_str())
        .header("host", "__ping__")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 500);

    proxy.stop().await;
}

// End-to-end: a backend marked dead recovers once the active monitor's
// probe observes it answering healthy again.

use crate::support::{FakeUpstream, ProxyProcess};
use std::time::Duration;

#[tokio::test]
async fn dead_backend_is_cleared_once_it_answers_healthy_again() {
    let upstream = FakeUpstream::start("recovered").await;
    let proxy = ProxyProcess::start().await;

    proxy
        .store
        .set_frontend("127.0.0.1", "only", vec![upstream.addr().to_string()])
        .await;
    proxy
        .store
        .mark_dead("127.0.0.1", upstream.addr(), 0, 1, Duration::from_secs(30))
        .await
        .unwrap();
    assert!(proxy.store.dead_positions("127.0.0.1").await.contains(&0));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if !proxy.store.dead_positions("127.0.0.1").await.contains(&0) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(
        !proxy.store.dead_positions("127.0.0.1").await.contains(&0),
        "expected the active monitor to clear the recovered backend's dead marker"
    );

    let resp = reqwest::get(proxy.addr.as_str()).await.unwrap();
    assert!(resp.status().is_success());

    proxy.stop().await;
    upstream.close().await;
}

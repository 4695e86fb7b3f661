// End-to-end: a single registered backend receives every request.

use crate::support::{FakeUpstream, ProxyProcess};

#[tokio::test]
async fn routes_to_the_only_registered_backend() {
    let upstream = FakeUpstream::start("hello from upstream").await;
    let proxy = ProxyProcess::start().await;

    proxy
        .store
        .set_frontend("127.0.0.1", "only", vec![upstream.addr().to_string()])
        .await;

    let resp = reqwest::get(proxy.addr.as_str()).await.unwrap();
    assert!(resp.status().is_success());
    let body = resp.text().await.unwrap();
    assert_eq!(body, "hello from upstream");
    assert_eq!(upstream.hits(), 1);

    proxy.stop().await;
    upstream.close().await;
}

#[tokio::test]
async fn round_robins_over_two_live_backends() {
    let up_a = FakeUpstream::start("a").await;
    let up_b = FakeUpstream::start("b").await;
    let proxy = ProxyProcess::start().await;

    proxy
        .store
        .set_frontend(
            "127.0.0.1",
            "pair",
            vec![up_a.addr().to_string(), up_b.addr().to_string()],
        )
        .await;

    for _ in 0..10 {
        let resp = reqwest::get(proxy.addr.as_str()).await.unwrap();
        assert!(resp.status().is_success());
    }

    assert_eq!(up_a.hits() + up_b.hits(), 10);
    assert_eq!(up_a.hits(), 5);
    assert_eq!(up_b.hits(), 5);

    proxy.stop().await;
    up_a.close().await;
    up_b.close().await;
}

#[tokio::test]
async fn unknown_host_returns_404() {
    let proxy = ProxyProcess::start().await;

    let resp = reqwest::get(proxy.addr.as_str()).await.unwrap();
    assert_eq!(resp.status().as_u16(), 404);

    proxy.stop().await;
}

//! Restart loops and their ceiling.

use crate::common::{roundtrip, Origin, TestPolicy, TestProxy, TestResult};
use hyper::{Body, Response};
use std::sync::{atomic::AtomicUsize, Arc};

#[tokio::test(flavor = "multi_thread")]
async fn restart_loop_caps_at_synthetic_503() -> TestResult {
    let origin = Origin::serve(|_req| Response::new(Body::from("fine")));
    let policy = Arc::new(TestPolicy {
        deliver_restart: true,
        ..Default::default()
    });
    let proxy = TestProxy::start(&origin, "max_restarts = 2", Some(policy)).await;

    let resp = roundtrip(&proxy, "GET /r HTTP/1.1\r\nHost: t\r\n\r\n").await?;
    assert_eq!(resp.status, 503);
    // Synthetic responses never keep the connection alive.
    assert_eq!(resp.header("connection"), Some("close"));
    assert_eq!(resp.header("server"), Some("legate"));

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn restart_under_the_cap_succeeds() -> TestResult {
    let origin = Origin::serve(|_req| Response::new(Body::from("eventually")));
    let policy = Arc::new(TestPolicy {
        fetch_restarts: AtomicUsize::new(1),
        ..Default::default()
    });
    let proxy = TestProxy::start(&origin, "max_restarts = 2", Some(policy)).await;

    let resp = roundtrip(&proxy, "GET /r HTTP/1.1\r\nHost: t\r\n\r\n").await?;
    assert_eq!(resp.status, 200);
    assert_eq!(resp.body_str(), "eventually");
    assert_eq!(origin.hits(), 2, "one fetch per restart");

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn restarts_beyond_the_cap_fail() -> TestResult {
    let origin = Origin::serve(|_req| Response::new(Body::from("never")));
    let policy = Arc::new(TestPolicy {
        fetch_restarts: AtomicUsize::new(10),
        ..Default::default()
    });
    let proxy = TestProxy::start(&origin, "max_restarts = 2", Some(policy)).await;

    let resp = roundtrip(&proxy, "GET /r HTTP/1.1\r\nHost: t\r\n\r\n").await?;
    assert_eq!(resp.status, 503);

    Ok(())
}

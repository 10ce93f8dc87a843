//! Request coalescing: concurrent lookups for the same key produce one
//! backend fetch; the losers park and are served from the published object.

use crate::common::{roundtrip, Origin, TestProxy, TestResult};
use hyper::{Body, Response};
use std::time::Duration;

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_misses_fetch_once() -> TestResult {
    let origin = Origin::serve_async(|_req| {
        Box::pin(async {
            // Hold the fetch open long enough for the second lookup to
            // arrive and park.
            tokio::time::sleep(Duration::from_millis(300)).await;
            Response::new(Body::from("slow"))
        })
    });
    let proxy = TestProxy::start(&origin, "", None).await;

    let first = {
        let proxy_addr = proxy.addr;
        tokio::spawn(async move {
            let mut stream = tokio::net::TcpStream::connect(proxy_addr).await.unwrap();
            crate::common::send_request(&mut stream, "GET /c HTTP/1.1\r\nHost: t\r\n\r\n").await
        })
    };
    // Let the first request reach the backend before the second probes.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let second = roundtrip(&proxy, "GET /c HTTP/1.1\r\nHost: t\r\n\r\n").await?;
    let first = first.await??;

    assert_eq!(first.status, 200);
    assert_eq!(second.status, 200);
    assert_eq!(first.body_str(), "slow");
    assert_eq!(second.body_str(), "slow");
    assert_eq!(origin.hits(), 1, "only one fetcher per (hash, vary)");

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_fetch_hands_the_obligation_over() -> TestResult {
    use std::sync::atomic::{AtomicUsize, Ordering};
    let attempts = std::sync::Arc::new(AtomicUsize::new(0));
    let origin = {
        let attempts = std::sync::Arc::clone(&attempts);
        Origin::serve_async(move |_req| {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                if n == 0 {
                    // First fetcher gets an uncacheable failure.
                    Response::builder()
                        .status(500)
                        .body(Body::from("boom"))
                        .unwrap()
                } else {
                    Response::new(Body::from("recovered"))
                }
            })
        })
    };
    let proxy = TestProxy::start(&origin, "", None).await;

    let first = {
        let proxy_addr = proxy.addr;
        tokio::spawn(async move {
            let mut stream = tokio::net::TcpStream::connect(proxy_addr).await.unwrap();
            crate::common::send_request(&mut stream, "GET /f HTTP/1.1\r\nHost: t\r\n\r\n").await
        })
    };
    tokio::time::sleep(Duration::from_millis(80)).await;
    let second = roundtrip(&proxy, "GET /f HTTP/1.1\r\nHost: t\r\n\r\n").await?;
    let first = first.await??;

    // The 500 is a hit-for-pass under the builtin policy: the busy entry
    // is published as a pass marker, and the parked peer re-probes and
    // goes to the backend itself.
    assert_eq!(first.status, 500);
    assert_eq!(second.status, 200);
    assert_eq!(second.body_str(), "recovered");
    assert_eq!(origin.hits(), 2);

    Ok(())
}

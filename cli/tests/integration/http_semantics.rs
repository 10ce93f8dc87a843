//! Protocol-level behavior: Expect/100, keep-alive, pipelining, framing
//! fallbacks, malformed requests.

use crate::common::{
    eventually, read_response, roundtrip, send_request, Origin, TestPolicy, TestProxy, TestResult,
};
use hyper::{Body, Response};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[tokio::test(flavor = "multi_thread")]
async fn expect_100_continue_is_answered_before_anything_else() -> TestResult {
    let origin = Origin::serve(|req| Response::new(req.into_body()));
    let proxy = TestProxy::start(&origin, "", None).await;

    let mut stream = proxy.connect().await;
    stream
        .write_all(
            b"POST /e HTTP/1.1\r\nHost: t\r\nExpect: 100-continue\r\nContent-Length: 5\r\n\r\nhello",
        )
        .await?;

    // The interim response comes first.
    let interim = read_response(&mut stream, false).await?;
    assert_eq!(interim.status, 100);

    let resp = read_response(&mut stream, true).await?;
    assert_eq!(resp.status, 200);
    assert_eq!(resp.body_str(), "hello");

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_expect_is_a_417() -> TestResult {
    let origin = Origin::serve(|_req| Response::new(Body::from("unreached")));
    let proxy = TestProxy::start(&origin, "", None).await;

    let resp = roundtrip(
        &proxy,
        "GET /e HTTP/1.1\r\nHost: t\r\nExpect: 200-maybe\r\n\r\n",
    )
    .await?;
    assert_eq!(resp.status, 417);
    assert_eq!(resp.header("connection"), Some("close"));
    assert_eq!(origin.hits(), 0);

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn junk_request_closes_without_a_response() -> TestResult {
    let origin = Origin::serve(|_req| Response::new(Body::from("unreached")));
    let proxy = TestProxy::start(&origin, "", None).await;

    let mut stream = proxy.connect().await;
    stream.write_all(b"total junk\r\n\r\n").await?;
    let mut buf = Vec::new();
    let n = stream.read_to_end(&mut buf).await?;
    assert_eq!(n, 0, "junk gets a close, not a response");

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn keep_alive_serves_sequential_requests() -> TestResult {
    let origin = Origin::serve(|req| {
        Response::new(Body::from(format!("p:{}", req.uri().path())))
    });
    let proxy = TestProxy::start(&origin, "", None).await;

    let mut stream = proxy.connect().await;
    let first = send_request(&mut stream, "GET /1 HTTP/1.1\r\nHost: t\r\n\r\n").await?;
    let second = send_request(&mut stream, "GET /2 HTTP/1.1\r\nHost: t\r\n\r\n").await?;
    assert_eq!(first.body_str(), "p:/1");
    assert_eq!(second.body_str(), "p:/2");

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn pipelined_requests_are_served_in_order() -> TestResult {
    let origin = Origin::serve(|req| {
        Response::new(Body::from(format!("p:{}", req.uri().path())))
    });
    let proxy = TestProxy::start(&origin, "", None).await;

    let mut stream = proxy.connect().await;
    stream
        .write_all(b"GET /1 HTTP/1.1\r\nHost: t\r\n\r\nGET /2 HTTP/1.1\r\nHost: t\r\n\r\n")
        .await?;
    let first = read_response(&mut stream, true).await?;
    let second = read_response(&mut stream, true).await?;
    assert_eq!(first.body_str(), "p:/1");
    assert_eq!(second.body_str(), "p:/2");
    drop(stream);

    let stats = proxy.ctx.stats();
    assert!(
        eventually(|| stats.get(|s| &s.sess_pipeline) >= 1).await,
        "the second request must be picked up from the read buffer"
    );

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn http10_unknown_length_means_eof_framing_and_close() -> TestResult {
    let body = "zeros and ones ".repeat(100);
    let origin = {
        let body = body.clone();
        Origin::serve(move |_req| Response::new(Body::from(body.clone())))
    };
    // Storing compressed while the client speaks HTTP/1.0 without gzip
    // forces delivery through the decompressing path, where the size is
    // unknown and chunked framing is unavailable.
    let policy = Arc::new(TestPolicy {
        do_gzip: true,
        ..Default::default()
    });
    let proxy = TestProxy::start(&origin, "", Some(policy)).await;

    let mut stream = proxy.connect().await;
    stream
        .write_all(b"GET /ten HTTP/1.0\r\nHost: t\r\n\r\n")
        .await?;
    let resp = read_response(&mut stream, true).await?;
    assert_eq!(resp.status, 200);
    assert_eq!(resp.header("content-length"), None);
    assert_eq!(resp.header("transfer-encoding"), None);
    assert_eq!(resp.body, body.as_bytes(), "EOF-framed body runs to close");

    // The connection must actually close.
    let mut rest = [0u8; 1];
    assert_eq!(stream.read(&mut rest).await?, 0);

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn connection_close_is_honored() -> TestResult {
    let origin = Origin::serve(|_req| Response::new(Body::from("bye")));
    let proxy = TestProxy::start(&origin, "", None).await;

    let mut stream = proxy.connect().await;
    let resp = send_request(
        &mut stream,
        "GET /c HTTP/1.1\r\nHost: t\r\nConnection: close\r\n\r\n",
    )
    .await?;
    assert_eq!(resp.status, 200);
    let mut rest = [0u8; 1];
    assert_eq!(stream.read(&mut rest).await?, 0);

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn linger_zero_herds_after_every_request() -> TestResult {
    let origin = Origin::serve(|_req| Response::new(Body::from("x")));
    let proxy = TestProxy::start(&origin, "session_linger_ms = 0", None).await;

    let mut stream = proxy.connect().await;
    let first = send_request(&mut stream, "GET /1 HTTP/1.1\r\nHost: t\r\n\r\n").await?;
    assert_eq!(first.status, 200);

    let stats = proxy.ctx.stats();
    // With linger off, a request boundary with an empty buffer always
    // parks on the waiter. The connection still works afterwards.
    let second = send_request(&mut stream, "GET /1 HTTP/1.1\r\nHost: t\r\n\r\n").await?;
    assert_eq!(second.status, 200);
    drop(stream);
    assert!(
        eventually(|| stats.get(|s| &s.sess_herd) >= 1).await,
        "linger-less sessions herd between requests"
    );

    Ok(())
}

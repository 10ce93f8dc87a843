//! Content-encoding handling: storing gzip, on-the-fly gunzip delivery,
//! and streaming.

use crate::common::{gzip, roundtrip, Origin, TestPolicy, TestProxy, TestResult};
use hyper::{header, Body, Response};
use std::{io::Read, sync::Arc};

fn gunzip(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    flate2::read::GzDecoder::new(data)
        .read_to_end(&mut out)
        .expect("valid gzip body");
    out
}

#[tokio::test(flavor = "multi_thread")]
async fn stored_gzip_serves_both_kinds_of_clients() -> TestResult {
    let body = "a compressible body ".repeat(200);
    let origin = {
        let body = body.clone();
        Origin::serve(move |_req| Response::new(Body::from(body.clone())))
    };
    let policy = Arc::new(TestPolicy {
        do_gzip: true,
        ..Default::default()
    });
    let proxy = TestProxy::start(&origin, "", Some(policy)).await;

    // A gzip-capable client stores and receives the compressed form.
    let compressed = roundtrip(
        &proxy,
        "GET /z HTTP/1.1\r\nHost: t\r\nAccept-Encoding: gzip\r\n\r\n",
    )
    .await?;
    assert_eq!(compressed.status, 200);
    assert_eq!(compressed.header("content-encoding"), Some("gzip"));
    assert_eq!(gunzip(&compressed.body), body.as_bytes());

    // A client that does not accept gzip gets the original bytes back,
    // decompressed on the fly from the same stored object.
    let plain = roundtrip(&proxy, "GET /z HTTP/1.1\r\nHost: t\r\n\r\n").await?;
    assert_eq!(plain.status, 200);
    assert_eq!(plain.header("content-encoding"), None);
    assert_eq!(plain.body, body.as_bytes());
    assert_eq!(origin.hits(), 1, "both forms come from one stored object");

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn gzip_disabled_leaves_encodings_alone() -> TestResult {
    let gz = gzip(b"opaque");
    let origin = {
        let gz = gz.clone();
        Origin::serve(move |_req| {
            Response::builder()
                .header(header::CONTENT_ENCODING, "gzip")
                .body(Body::from(gz.clone()))
                .unwrap()
        })
    };
    let proxy = TestProxy::start(&origin, "http_gzip_support = false", None).await;

    let resp = roundtrip(&proxy, "GET /o HTTP/1.1\r\nHost: t\r\n\r\n").await?;
    assert_eq!(resp.status, 200);
    assert_eq!(resp.header("content-encoding"), Some("gzip"));
    assert_eq!(resp.body, gz);

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn streaming_gunzip_delivery() -> TestResult {
    // A large gzip'ed origin body, streamed: the client gets plain bytes,
    // the stored object keeps the gzip form for capable clients.
    let body: Vec<u8> = (0..=255u8).cycle().take(2 * 1024 * 1024).collect();
    let gz = gzip(&body);
    let origin = {
        let gz = gz.clone();
        Origin::serve(move |_req| {
            Response::builder()
                .header(header::CONTENT_ENCODING, "gzip")
                .body(Body::from(gz.clone()))
                .unwrap()
        })
    };
    let policy = Arc::new(TestPolicy {
        do_stream: true,
        ..Default::default()
    });
    let proxy = TestProxy::start(&origin, "", Some(policy)).await;

    let plain = roundtrip(
        &proxy,
        "GET /s HTTP/1.1\r\nHost: t\r\nAccept-Encoding: identity\r\n\r\n",
    )
    .await?;
    assert_eq!(plain.status, 200);
    assert_eq!(
        plain.header("transfer-encoding"),
        Some("chunked"),
        "the decompressed size is unknown up front"
    );
    assert_eq!(plain.body, body);

    // The stored body remains gzip'ed and is reusable as-is.
    let compressed = roundtrip(
        &proxy,
        "GET /s HTTP/1.1\r\nHost: t\r\nAccept-Encoding: gzip\r\n\r\n",
    )
    .await?;
    assert_eq!(compressed.header("content-encoding"), Some("gzip"));
    assert_eq!(gunzip(&compressed.body), body);
    assert_eq!(origin.hits(), 1);

    Ok(())
}

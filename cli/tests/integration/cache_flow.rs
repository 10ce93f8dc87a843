//! The basic cache lifecycle: miss and store, hit, hit-for-pass,
//! conditionals, HEAD.

use crate::common::{roundtrip, send_request, send_request_no_body, Origin, TestProxy, TestResult};
use hyper::{header, Body, Response};

#[tokio::test(flavor = "multi_thread")]
async fn miss_stores_then_hits() -> TestResult {
    let origin = Origin::serve(|_req| {
        Response::builder()
            .header(header::CONTENT_LENGTH, "5")
            .body(Body::from("hello"))
            .unwrap()
    });
    let proxy = TestProxy::start(&origin, "", None).await;

    let first = roundtrip(&proxy, "GET /a HTTP/1.1\r\nHost: t\r\n\r\n").await?;
    assert_eq!(first.status, 200);
    assert_eq!(first.header("content-length"), Some("5"));
    assert_eq!(first.body_str(), "hello");
    assert_eq!(origin.hits(), 1);

    let second = roundtrip(&proxy, "GET /a HTTP/1.1\r\nHost: t\r\n\r\n").await?;
    assert_eq!(second.status, 200);
    assert_eq!(second.body_str(), "hello");
    assert!(second.header("age").is_some());
    assert_eq!(origin.hits(), 1, "second request must be served from cache");

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn different_paths_do_not_share_objects() -> TestResult {
    let origin = Origin::serve(|req| {
        Response::new(Body::from(format!("path:{}", req.uri().path())))
    });
    let proxy = TestProxy::start(&origin, "", None).await;

    let a = roundtrip(&proxy, "GET /a HTTP/1.1\r\nHost: t\r\n\r\n").await?;
    let b = roundtrip(&proxy, "GET /b HTTP/1.1\r\nHost: t\r\n\r\n").await?;
    assert_eq!(a.body_str(), "path:/a");
    assert_eq!(b.body_str(), "path:/b");
    assert_eq!(origin.hits(), 2);

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn set_cookie_becomes_hit_for_pass() -> TestResult {
    let origin = Origin::serve(|_req| {
        Response::builder()
            .header(header::SET_COOKIE, "s=1")
            .body(Body::from("per-user"))
            .unwrap()
    });
    let proxy = TestProxy::start(&origin, "", None).await;

    let first = roundtrip(&proxy, "GET /b HTTP/1.1\r\nHost: t\r\n\r\n").await?;
    assert_eq!(first.status, 200);
    assert_eq!(origin.hits(), 1);

    // The negative entry forces later lookups straight to the backend.
    let second = roundtrip(&proxy, "GET /b HTTP/1.1\r\nHost: t\r\n\r\n").await?;
    assert_eq!(second.status, 200);
    assert_eq!(origin.hits(), 2, "hit-for-pass must bypass the cache");

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn head_matches_get_without_body() -> TestResult {
    let origin = Origin::serve(|_req| {
        Response::builder()
            .header(header::CONTENT_LENGTH, "7")
            .body(Body::from("content"))
            .unwrap()
    });
    let proxy = TestProxy::start(&origin, "", None).await;

    let get = roundtrip(&proxy, "GET /h HTTP/1.1\r\nHost: t\r\n\r\n").await?;
    assert_eq!(get.status, 200);
    assert_eq!(get.body_str(), "content");

    let mut stream = proxy.connect().await;
    let head = send_request_no_body(&mut stream, "HEAD /h HTTP/1.1\r\nHost: t\r\n\r\n").await?;
    assert_eq!(head.status, 200);
    assert_eq!(head.header("content-length"), get.header("content-length"));
    assert!(head.body.is_empty());
    assert_eq!(origin.hits(), 1, "HEAD must be served from the cached 200");

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn satisfied_conditional_gets_304() -> TestResult {
    let lm = "Tue, 14 Nov 2023 08:00:00 GMT";
    let origin = Origin::serve(move |_req| {
        Response::builder()
            .header(header::LAST_MODIFIED, lm)
            .body(Body::from("stale-friendly"))
            .unwrap()
    });
    let proxy = TestProxy::start(&origin, "", None).await;

    let warm = roundtrip(&proxy, "GET /c HTTP/1.1\r\nHost: t\r\n\r\n").await?;
    assert_eq!(warm.status, 200);

    let mut stream = proxy.connect().await;
    let cond = send_request(
        &mut stream,
        &format!("GET /c HTTP/1.1\r\nHost: t\r\nIf-Modified-Since: {lm}\r\n\r\n"),
    )
    .await?;
    assert_eq!(cond.status, 304);
    assert!(cond.body.is_empty());
    assert_eq!(origin.hits(), 1);

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn vary_selects_variants() -> TestResult {
    let origin = Origin::serve(|req| {
        let lang = req
            .headers()
            .get(header::ACCEPT_LANGUAGE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("none")
            .to_string();
        Response::builder()
            .header(header::VARY, "Accept-Language")
            .body(Body::from(format!("lang:{lang}")))
            .unwrap()
    });
    let proxy = TestProxy::start(&origin, "", None).await;

    let da =
        roundtrip(&proxy, "GET /v HTTP/1.1\r\nHost: t\r\nAccept-Language: da\r\n\r\n").await?;
    let en =
        roundtrip(&proxy, "GET /v HTTP/1.1\r\nHost: t\r\nAccept-Language: en\r\n\r\n").await?;
    assert_eq!(da.body_str(), "lang:da");
    assert_eq!(en.body_str(), "lang:en");
    assert_eq!(origin.hits(), 2);

    // Each variant is independently cached.
    let da2 =
        roundtrip(&proxy, "GET /v HTTP/1.1\r\nHost: t\r\nAccept-Language: da\r\n\r\n").await?;
    assert_eq!(da2.body_str(), "lang:da");
    assert_eq!(origin.hits(), 2);

    Ok(())
}

//! Edge-side include assembly.

use crate::common::{roundtrip, Origin, TestPolicy, TestProxy, TestResult};
use hyper::{Body, Response};
use std::sync::Arc;

fn esi_origin() -> Origin {
    Origin::serve(|req| {
        let body: Body = match req.uri().path() {
            "/page" => "<html><esi:include src=\"/frag\"/></html>".into(),
            "/frag" => "FRAG".into(),
            "/outer" => "[<esi:include src=\"/page\"/>]".into(),
            "/removed" => "a<esi:remove>secret</esi:remove>b".into(),
            other => format!("404:{other}").into(),
        };
        Response::new(body)
    })
}

#[tokio::test(flavor = "multi_thread")]
async fn includes_are_assembled_in_place() -> TestResult {
    let origin = esi_origin();
    let policy = Arc::new(TestPolicy {
        esi_paths: vec!["/page"],
        ..Default::default()
    });
    let proxy = TestProxy::start(&origin, "", Some(policy)).await;

    let resp = roundtrip(&proxy, "GET /page HTTP/1.1\r\nHost: t\r\n\r\n").await?;
    assert_eq!(resp.status, 200);
    assert_eq!(resp.body_str(), "<html>FRAG</html>");
    assert_eq!(origin.hits(), 2, "the page plus its fragment");

    // Both the page and the fragment are cached; assembly repeats without
    // touching the backend.
    let again = roundtrip(&proxy, "GET /page HTTP/1.1\r\nHost: t\r\n\r\n").await?;
    assert_eq!(again.body_str(), "<html>FRAG</html>");
    assert_eq!(origin.hits(), 2);

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn nested_includes_recurse() -> TestResult {
    let origin = esi_origin();
    let policy = Arc::new(TestPolicy {
        esi_paths: vec!["/page", "/outer"],
        ..Default::default()
    });
    let proxy = TestProxy::start(&origin, "", Some(policy)).await;

    let resp = roundtrip(&proxy, "GET /outer HTTP/1.1\r\nHost: t\r\n\r\n").await?;
    assert_eq!(resp.status, 200);
    assert_eq!(resp.body_str(), "[<html>FRAG</html>]");
    assert_eq!(origin.hits(), 3);

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn remove_blocks_are_dropped() -> TestResult {
    let origin = esi_origin();
    let policy = Arc::new(TestPolicy {
        esi_paths: vec!["/removed"],
        ..Default::default()
    });
    let proxy = TestProxy::start(&origin, "", Some(policy)).await;

    let resp = roundtrip(&proxy, "GET /removed HTTP/1.1\r\nHost: t\r\n\r\n").await?;
    assert_eq!(resp.body_str(), "ab");

    Ok(())
}

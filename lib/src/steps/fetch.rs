//! Backend fetch steps: header fetch with the single retry, the storage
//! and delivery pipeline decisions, and the streaming overlap.

use http::header;
use hyper::body::HttpBody as _;
use std::sync::Arc;

use super::{Flow, Step};
use crate::{
    cache::variance::VaryRule,
    clock, freshness,
    headers::{self, FilterRules},
    object::Object,
    policy::{FetchDisposition, FetchScope},
    reqlog::Tag,
    resp,
    service::ProxyCtx,
    session::Session,
    storage::StorageHint,
    upstream::FetchFail,
    vfp::Vfp,
    Error,
};

/// Fetch response headers from the backend (retrying the recycled-
/// connection race once), classify the body, compute the TTL, and ask the
/// fetch hook what to do with it.
pub(super) async fn cnt_fetch(sess: &mut Session, ctx: &ProxyCtx) -> Flow {
    assert!(sess.rctx.busyobj.is_some());
    assert!(sess.rctx.beresp.is_none());
    let director = sess.director.expect("director chosen");

    let body = if sess.sendbody {
        match super::client::take_req_body(sess, ctx.params().client_body_size).await {
            Ok(body) => body,
            Err(_) => {
                sess.rctx.objcore = None;
                sess.rctx.clear_backend();
                sess.close("error");
                sess.step = Step::Done;
                return Flow::Continue;
            }
        }
    } else {
        Vec::new()
    };

    sess.wstats.backend_req += 1;
    let backend = ctx.backend(director);
    let bereq = sess.rctx.bereq.as_ref().expect("bereq built");

    let mut result = backend.fetch_headers(bereq, body.clone()).await;
    if matches!(result, Err(FetchFail::Retryable)) {
        // A recycled backend connection races with the server's idle
        // timeout; a single retry covers it.
        sess.wstats.backend_retry += 1;
        sess.log.record(Tag::BackendRetry, sess.xid, "");
        result = backend.fetch_headers(bereq, body).await;
    }

    let (mut beresp, beresp_body) = match result {
        Ok(ok) => ok,
        Err(_) => {
            sess.err.code = 503;
            sess.rctx.objcore = None;
            sess.rctx.busyobj = None;
            sess.rctx.clear_backend();
            sess.director = None;
            sess.step = Step::Error;
            return Flow::Continue;
        }
    };

    // These two can be spread over multiple header lines and the engine
    // relies on their content, so collapse them before anything reads them.
    headers::collect_header(&mut beresp.headers, header::CACHE_CONTROL);
    headers::collect_header(&mut beresp.headers, header::VARY);

    sess.log.record(
        Tag::Backend,
        sess.xid,
        format!("{} {}", backend.backend().name, beresp.status),
    );

    {
        let req_method = sess.req().method.clone();
        let bo = sess.rctx.busyobj.as_mut().expect("busyobj bound");
        bo.body_status = Some(freshness::body_status(&req_method, &beresp));
        bo.exp.clear();
        bo.exp = freshness::ttl_from_response(clock::now(), &beresp, ctx.params());
        // A pass from the recv hook has no index entry and may never be
        // cached.
        if sess.rctx.objcore.is_none() {
            bo.exp.ttl = -1.0;
        }
        assert!(!bo.do_esi);
        bo.beresp_body = Some(beresp_body);
        sess.log.record(
            Tag::TTL,
            sess.xid,
            format!("{:.0} {:.0} {:.0}", bo.exp.ttl, bo.exp.grace, bo.exp.keep),
        );
    }

    sess.rctx.h_content_length = beresp
        .header_str(header::CONTENT_LENGTH)
        .and_then(|v| v.parse().ok());
    sess.rctx.beresp = Some(beresp);

    let disposition = {
        let mut scope = FetchScope {
            req: sess.req.as_ref().expect("active request"),
            bereq: sess.rctx.bereq.as_ref().expect("bereq built"),
            beresp: sess.rctx.beresp.as_mut().expect("beresp stored"),
            busyobj: sess.rctx.busyobj.as_mut().expect("busyobj bound"),
            err: &mut sess.err,
        };
        ctx.policy().fetch(&mut scope)
    };

    match disposition {
        FetchDisposition::HitForPass => {
            if let Some(guard) = sess.rctx.objcore.as_ref() {
                guard.mark_pass();
            }
            sess.step = Step::FetchBody;
        }
        FetchDisposition::Deliver => {
            sess.step = Step::FetchBody;
        }
        FetchDisposition::Restart => {
            fetch_unwind(sess);
            sess.restarts += 1;
            sess.wstats.restarts += 1;
            sess.step = Step::Recv;
        }
        FetchDisposition::Error => {
            fetch_unwind(sess);
            sess.step = Step::Error;
        }
    }
    Flow::Continue
}

/// Drop everything a failed or abandoned fetch accumulated.
fn fetch_unwind(sess: &mut Session) {
    sess.rctx.objcore = None;
    sess.rctx.busyobj = None;
    sess.rctx.clear_backend();
    sess.director = None;
}

/// Decide the storage and delivery pipelines, allocate the object, and —
/// unless streaming — run the fetch to completion and publish.
pub(super) async fn cnt_fetchbody(sess: &mut Session, ctx: &ProxyCtx) -> Flow {
    let params = ctx.params();

    // This is a pass if there never was an index entry (pass from recv) or
    // if the fetch hook just turned the entry into a hit-for-pass marker.
    let pass = match sess.rctx.objcore.as_ref() {
        None => {
            // The fetch hook may have fiddled the TTL, but that doesn't help.
            sess.rctx.busyobj.as_mut().expect("busyobj bound").exp.ttl = -1.0;
            true
        }
        Some(guard) => guard.core().is_pass(),
    };

    // Encoding selection. The backend Content-Encoding header tells us
    // what we are going to receive; the policy flags tell us what to store.
    {
        let beresp = sess.rctx.beresp.as_mut().expect("beresp stored");
        let bo = sess.rctx.busyobj.as_mut().expect("busyobj bound");

        if !params.http_gzip_support {
            bo.do_gzip = false;
            bo.do_gunzip = false;
        }
        bo.is_gzip = beresp
            .header_str(header::CONTENT_ENCODING)
            .map(|v| v.eq_ignore_ascii_case("gzip"))
            .unwrap_or(false);
        bo.is_gunzip = !beresp.headers.contains_key(header::CONTENT_ENCODING);

        // We won't gunzip unless it is gzip'ed.
        if bo.do_gunzip && !bo.is_gzip {
            bo.do_gunzip = false;
        }
        if bo.do_gunzip {
            beresp.headers.remove(header::CONTENT_ENCODING);
        }
        // We won't gzip unless it is ungzip'ed.
        if bo.do_gzip && !bo.is_gunzip {
            bo.do_gzip = false;
        }
        if bo.do_gzip {
            beresp
                .headers
                .insert(header::CONTENT_ENCODING, "gzip".parse().expect("valid value"));
        }

        // ESI takes precedence and decompresses on its own; the stored
        // body is plain.
        if bo.do_esi && bo.is_gzip {
            beresp.headers.remove(header::CONTENT_ENCODING);
        }
        bo.vfp = bo.pick_vfp();

        if bo.do_esi || sess.esi_level > 0 {
            bo.do_stream = false;
        }
        if !sess.wantbody {
            bo.do_stream = false;
        }
        bo.assert_encoding_invariants();
    }

    let req_headers = sess.req().headers.clone();
    let beresp = sess.rctx.beresp.as_ref().expect("beresp stored");

    // Vary instructions come from the response; the variant key from the
    // request that produced it.
    let vary = if sess.rctx.objcore.is_some() {
        beresp
            .header_str(header::VARY)
            .and_then(|v| v.parse::<VaryRule>().ok())
            .filter(|rule| !rule.is_empty())
            .map(|rule| {
                let variant = rule.variant(&req_headers);
                (rule, variant)
            })
    } else {
        None
    };

    // Estimate the header footprint for the storage charge, with space for
    // a Content-Length and the vary key.
    let filter = if pass {
        FilterRules::Pass
    } else {
        FilterRules::Insert
    };
    let stored_headers = headers::filter_fields(&beresp.headers, filter);
    let mut estimate: usize = stored_headers
        .iter()
        .map(|(name, value)| name.as_str().len() + value.len() + 4)
        .sum();
    estimate += vary.as_ref().map(|(_, v)| v.len()).unwrap_or(0);
    estimate += "Content-Length: XxxXxxXxxXxxXxxXxx".len() + 8;

    let mut hint = StorageHint::Default;
    {
        let bo = sess.rctx.busyobj.as_ref().expect("busyobj bound");
        if bo.exp.ttl < params.shortlived || sess.rctx.objcore.is_none() {
            hint = StorageHint::Transient;
        }
    }

    let mut lease = ctx.storage().lease(hint, estimate as u64);
    if lease.is_none() && hint == StorageHint::Default {
        // Try to salvage the transaction with a shortlived object on
        // transient storage.
        lease = ctx.storage().lease(StorageHint::Transient, estimate as u64);
        if lease.is_some() {
            let bo = sess.rctx.busyobj.as_mut().expect("busyobj bound");
            if bo.exp.ttl > params.shortlived {
                bo.exp.ttl = params.shortlived;
            }
            bo.exp.grace = 0.0;
            bo.exp.keep = 0.0;
        }
    }
    let lease = match lease {
        Some(lease) => lease,
        None => {
            sess.err.code = 503;
            fetch_unwind(sess);
            sess.step = Step::Error;
            return Flow::Continue;
        }
    };

    let (status, last_modified_hdr) = {
        let beresp = sess.rctx.beresp.as_ref().expect("beresp stored");
        (
            beresp.status,
            beresp
                .header_str(header::LAST_MODIFIED)
                .and_then(clock::parse_http_date),
        )
    };

    let obj = {
        let bo = sess.rctx.busyobj.as_ref().expect("busyobj bound");
        let mut obj = Object::new(sess.xid, status, stored_headers, bo.exp, lease);
        obj.gziped =
            !bo.do_esi && (bo.do_gzip || (bo.is_gzip && !bo.do_gunzip));
        obj.vary = vary;
        obj.last_modified = last_modified_hdr.unwrap_or_else(|| bo.exp.entered.floor());
        Arc::new(obj)
    };

    // If we can deliver a 304 reply, we don't bother streaming; the
    // deliver hook may still nuke the headers that allow it.
    {
        let req = sess.req.as_ref().expect("active request");
        if obj.response == http::StatusCode::OK
            && freshness::request_is_conditional(req)
            && freshness::conditional_matches(req, &obj.headers, obj.last_modified)
        {
            sess.rctx.busyobj.as_mut().expect("busyobj bound").do_stream = false;
        }
    }

    sess.rctx.obj = Some(Arc::clone(&obj));

    if sess.rctx.busyobj.as_ref().expect("busyobj bound").do_stream {
        // The fetch continues inside StreamBody, overlapped with delivery.
        sess.step = Step::PrepResp;
        return Flow::Continue;
    }

    // Plain fetch: run the transform to completion into the object.
    let (vfp, body) = {
        let bo = sess.rctx.busyobj.as_mut().expect("busyobj bound");
        (
            Vfp::new(bo.vfp, params.gzip_level, bo.is_gzip),
            bo.beresp_body.take().expect("backend body present"),
        )
    };
    let fetched = fetch_body_into(
        &obj,
        vfp,
        body,
        params.between_bytes_timeout,
        &mut NullSink,
    )
    .await;

    sess.rctx.clear_backend();

    match fetched {
        Err(e) => {
            // Drop the partial object; the busy entry goes with it.
            sess.log.record(Tag::Error, sess.xid, e.to_string());
            sess.wstats.s_fetch_failed += 1;
            sess.rctx.deref_obj();
            sess.rctx.objcore = None;
            sess.rctx.busyobj = None;
            sess.err.code = 503;
            sess.step = Step::Error;
        }
        Ok(()) => {
            if let Some(guard) = sess.rctx.objcore.take() {
                guard.publish(Arc::clone(&obj));
                sess.wstats.n_object += 1;
            }
            sess.rctx.acct.fetch = 1;
            sess.step = Step::PrepResp;
        }
    }
    Flow::Continue
}

/// Stream the body as we fetch it: delivery starts before the fetch ends,
/// on the same task, serialized through the transform.
pub(super) async fn cnt_streambody(sess: &mut Session, ctx: &ProxyCtx) -> Flow {
    let params = ctx.params();
    assert_eq!(sess.esi_level, 0);
    let obj = sess.rctx.obj.as_ref().expect("object allocated").clone();
    {
        let core = sess.rctx.objcore.as_ref();
        assert!(
            core.map(|g| g.core().is_busy() || g.core().is_pass())
                .unwrap_or(true),
            "streaming a settled object"
        );
    }

    let mode = sess.rctx.res_mode;
    let mut resp = sess.rctx.resp.take().expect("response prepared");
    if sess.doclose.is_some() {
        resp.headers
            .insert(header::CONNECTION, "close".parse().expect("valid value"));
    }
    resp::apply_framing(&mut resp, mode, sess.rctx.h_content_length.unwrap_or(0));

    let (vfp, body) = {
        let bo = sess.rctx.busyobj.as_mut().expect("busyobj bound");
        (
            Vfp::new(bo.vfp, params.gzip_level, bo.is_gzip),
            bo.beresp_body.take().expect("backend body present"),
        )
    };

    let gzip_buffer = params.gzip_stack_buffer;
    let between = params.between_bytes_timeout;

    let mut hdrbytes = 0u64;
    let mut bodybytes = 0u64;
    let streamed = {
        let io = &mut sess.io;
        match resp::write_head(io, &resp).await {
            Ok(n) => {
                hdrbytes = n;
                let mut writer = resp::BodyWriter::new(io, mode, gzip_buffer);
                let fetched =
                    fetch_body_into(&obj, vfp, body, between, &mut writer).await;
                // Always end the stream, even after a failed fetch.
                let ended = writer.finish().await;
                bodybytes = writer.bodybytes;
                fetched.and(ended)
            }
            Err(e) => Err(Error::IoError(e)),
        }
    };

    sess.rctx.acct.hdrbytes += hdrbytes;
    sess.rctx.acct.bodybytes += bodybytes;
    sess.rctx.clear_backend();

    match streamed {
        Ok(()) => {
            if let Some(guard) = sess.rctx.objcore.take() {
                guard.publish(Arc::clone(&obj));
                sess.wstats.n_object += 1;
            }
        }
        Err(e) => {
            sess.log.record(Tag::Error, sess.xid, e.to_string());
            sess.rctx.objcore = None;
            sess.doclose = Some("Stream error");
        }
    }
    sess.rctx.acct.fetch = 1;

    sess.director = None;
    sess.restarts = 0;
    sess.rctx.deref_obj();
    sess.rctx.busyobj = None;
    sess.step = Step::Done;
    Flow::Continue
}

/// Where transformed body bytes go besides the object: nowhere (plain
/// fetch) or to the client (streaming).
pub(super) trait FetchSink {
    async fn write(&mut self, data: &[u8]) -> Result<(), Error>;
}

pub(super) struct NullSink;

impl FetchSink for NullSink {
    async fn write(&mut self, _data: &[u8]) -> Result<(), Error> {
        Ok(())
    }
}

impl<W: tokio::io::AsyncWrite + Unpin> FetchSink for resp::BodyWriter<'_, W> {
    async fn write(&mut self, data: &[u8]) -> Result<(), Error> {
        self.write_chunk(data).await
    }
}

/// Pull the backend body through the transform into the object (and the
/// sink), honoring the inter-chunk timeout.
pub(super) async fn fetch_body_into(
    obj: &Object,
    mut vfp: Vfp,
    mut body: hyper::Body,
    between_bytes: std::time::Duration,
    sink: &mut impl FetchSink,
) -> Result<(), Error> {
    loop {
        let chunk = tokio::time::timeout(between_bytes, body.data())
            .await
            .map_err(|_| Error::BodyRead("between-bytes timeout".to_string()))?;
        match chunk {
            None => break,
            Some(Err(e)) => return Err(Error::BodyRead(e.to_string())),
            Some(Ok(bytes)) => {
                let out = vfp.push(&bytes)?;
                if !out.is_empty() {
                    obj.push_body(out.clone())?;
                    sink.write(&out).await?;
                }
            }
        }
    }
    let done = vfp.finish()?;
    if !done.tail.is_empty() {
        obj.push_body(done.tail.clone())?;
        sink.write(&done.tail).await?;
    }
    if let Some(esidata) = done.esidata {
        if esidata.include_count() > 0 || esidata.segments.len() > 1 {
            obj.set_esidata(esidata);
        }
    }
    Ok(())
}

//! Client-side steps: connection setup, request reception, routing, cache
//! probing, error synthesis and request teardown.

use http::{header, HeaderValue, Method, StatusCode, Version};
use tokio::io::AsyncWriteExt;

use super::{Flow, Park, Step};
use crate::{
    cache::LookupOutcome,
    clock,
    headers::{self, FilterRules, ReqHead, RespHead},
    httc::{HttpConn, RxStatus},
    object::{BusyObj, Expiry, Object},
    policy::{
        status_reason, BereqScope, ErrorScope, HitDisposition, MissDisposition, PassDisposition,
        RecvDisposition, RecvScope,
    },
    reqlog::Tag,
    resp::RespMode,
    service::ProxyCtx,
    session::Session,
    storage::StorageHint,
};

/// Once per TCP connection: prime the connection state, take the session
/// workspace watermark, charge the session.
pub(super) async fn cnt_first(sess: &mut Session, _ctx: &ProxyCtx) -> Flow {
    assert_eq!(sess.xid, 0);
    assert_eq!(sess.restarts, 0);
    assert_eq!(sess.esi_level, 0);

    sess.ws_ses = Some(sess.ws.snapshot());
    sess.rctx.acct.sess = 1;
    sess.log
        .record(Tag::SessOpen, 0, sess.remote.to_string());
    sess.step = Step::Wait;
    Flow::Continue
}

/// Wait (briefly) until a full request head is buffered, then either start
/// the request, close a broken connection, or herd the idle session back to
/// the waiter.
pub(super) async fn cnt_wait(sess: &mut Session, ctx: &ProxyCtx) -> Flow {
    assert_eq!(sess.xid, 0);
    assert_eq!(sess.esi_level, 0);
    assert!(sess.rctx.obj.is_none());

    let mut status = sess.htc.complete();
    let linger = ctx.params().session_linger;
    if status == RxStatus::Partial && !linger.is_zero() {
        let deadline = tokio::time::Instant::now() + linger;
        while status == RxStatus::Partial {
            match tokio::time::timeout_at(deadline, sess.htc.rx(&mut sess.io)).await {
                Ok(s) => status = s,
                Err(_) => break,
            }
        }
    }

    match status {
        RxStatus::Complete => {
            sess.step = Step::Start;
            Flow::Continue
        }
        RxStatus::Partial => {
            sess.log.record(Tag::Debug, 0, "herding");
            sess.wstats.sess_herd += 1;
            let (acct, wstats) = (&mut sess.rctx.acct, &mut sess.wstats);
            acct.charge(wstats);
            Flow::Park(Park::Waiter)
        }
        RxStatus::Overflow => {
            sess.close("overflow");
            sess.step = Step::Done;
            Flow::Continue
        }
        RxStatus::Eof if sess.htc.buffered() == 0 => {
            sess.close("EOF");
            sess.step = Step::Done;
            Flow::Continue
        }
        RxStatus::Eof | RxStatus::Error => {
            sess.close("error");
            sess.step = Step::Done;
            Flow::Continue
        }
    }
}

/// Once per request: assign the xid, dissect the head, handle Expect.
pub(super) async fn cnt_start(sess: &mut Session, ctx: &ProxyCtx) -> Flow {
    assert_eq!(sess.restarts, 0);
    assert!(sess.rctx.obj.is_none());
    assert_eq!(sess.esi_level, 0);

    sess.wstats.client_req += 1;
    sess.rctx.acct.req = 1;
    sess.t_req = clock::now();

    sess.xid = ctx.next_xid();
    sess.log.record(
        Tag::ReqStart,
        sess.xid,
        format!("{} {}", sess.remote, sess.xid),
    );

    let mut req = match sess.htc.dissect() {
        Ok(req) => req,
        Err(400) => {
            // Could not even parse the request; just close.
            sess.close("junk");
            sess.step = Step::Done;
            return Flow::Continue;
        }
        Err(code) => {
            sess.err.code = code;
            sess.step = Step::Error;
            return Flow::Continue;
        }
    };

    sess.ws_req = Some(sess.ws.snapshot());
    // Catch the original request before modification.
    sess.http0 = Some(req.clone());
    sess.req_body_done = HttpConn::body_len(&req).unwrap_or(0) == 0;
    sess.req_body = None;

    if sess.doclose.is_none() {
        sess.doclose = headers::connection_close_reason(&req);
    }

    if let Some(expect) = req.headers.get(header::EXPECT).cloned() {
        let is_continue = expect
            .to_str()
            .map(|v| v.eq_ignore_ascii_case("100-continue"))
            .unwrap_or(false);
        if !is_continue {
            sess.req = Some(req);
            sess.err.code = 417;
            sess.step = Step::Error;
            return Flow::Continue;
        }
        // Best effort; failures surface on the next real write.
        let _ = sess.io.write_all(b"HTTP/1.1 100 Continue\r\n\r\n").await;
        req.headers.remove(header::EXPECT);
    }

    sess.req = Some(req);
    sess.step = Step::Recv;
    Flow::Continue
}

/// Route the request: clear per-request flags, run the recv hook, compute
/// the digest, dispatch.
pub(super) async fn cnt_recv(sess: &mut Session, ctx: &ProxyCtx) -> Flow {
    assert!(sess.rctx.obj.is_none());

    // By default we use the first backend.
    sess.director = Some(0);
    sess.disable_esi = false;
    sess.hash_always_miss = false;
    sess.hash_ignore_busy = false;

    headers::collect_header(&mut sess.req_mut().headers, header::CACHE_CONTROL);

    let disposition = {
        let mut scope = RecvScope {
            req: sess.req.as_mut().expect("active request"),
            esi_level: sess.esi_level,
            restarts: sess.restarts,
            hash_always_miss: &mut sess.hash_always_miss,
            hash_ignore_busy: &mut sess.hash_ignore_busy,
            disable_esi: &mut sess.disable_esi,
            err: &mut sess.err,
        };
        ctx.policy().recv(&mut scope)
    };

    if sess.restarts >= ctx.params().max_restarts {
        if sess.err.code == 0 {
            sess.err.code = 503;
        }
        sess.step = Step::Error;
        return Flow::Continue;
    }

    if ctx.params().http_gzip_support
        && disposition != RecvDisposition::Pipe
        && disposition != RecvDisposition::Pass
    {
        // The backend sees a single, canonical encoding negotiation.
        let accepts = crate::freshness::request_accepts_gzip(sess.req());
        let req = sess.req_mut();
        req.headers.remove(header::ACCEPT_ENCODING);
        if accepts {
            req.headers
                .insert(header::ACCEPT_ENCODING, HeaderValue::from_static("gzip"));
        }
    }

    let digest = crate::policy::run_hash_hook(ctx.policy(), sess.req());
    sess.digest = Some(crate::cache::CacheKey::new(digest));

    sess.wantbody = sess.req().method != Method::HEAD;
    sess.sendbody = false;

    match disposition {
        RecvDisposition::Lookup => {
            sess.step = Step::Lookup;
            Flow::Continue
        }
        RecvDisposition::Pipe => {
            if sess.esi_level > 0 {
                sess.log
                    .record(Tag::Error, sess.xid, crate::Error::PipeInEsi.to_string());
                sess.err.set(503, "pipe within ESI");
                sess.step = Step::Error;
                return Flow::Continue;
            }
            sess.step = Step::Pipe;
            Flow::Continue
        }
        RecvDisposition::Pass => {
            sess.step = Step::Pass;
            Flow::Continue
        }
        RecvDisposition::Error => {
            sess.step = Step::Error;
            Flow::Continue
        }
    }
}

/// Probe the cache. Either we get an entry (hit, hit-for-pass), insert a
/// busy one (miss), or lose the race and park on the busy list.
pub(super) async fn cnt_lookup(sess: &mut Session, ctx: &ProxyCtx) -> Flow {
    let digest = sess.digest.expect("hash hook ran");
    let now = clock::now();

    let req_headers = sess.req.as_ref().expect("active request").headers.clone();
    let outcome = ctx.cache().lookup(
        &digest,
        &req_headers,
        &mut sess.ws,
        now,
        sess.hash_always_miss,
        sess.hash_ignore_busy,
    );

    match outcome {
        LookupOutcome::Busy(waiter) => {
            // We lost to a busy peer. Disembark; the wakeup re-enters
            // Lookup.
            sess.busy_waiter = Some(waiter);
            Flow::Park(Park::Busy)
        }
        LookupOutcome::Miss(guard) => {
            sess.wstats.cache_miss += 1;
            sess.log.record(Tag::Miss, sess.xid, "");
            sess.rctx.objcore = Some(guard);
            sess.step = Step::Miss;
            Flow::Continue
        }
        LookupOutcome::HitPass { obj, .. } => {
            sess.wstats.cache_hitpass += 1;
            sess.log
                .record(Tag::HitPass, sess.xid, obj.xid.to_string());
            // Drop our reference, we won't need it.
            drop(obj);
            sess.step = Step::Pass;
            Flow::Continue
        }
        LookupOutcome::Hit { obj, .. } => {
            sess.wstats.cache_hit += 1;
            sess.log.record(Tag::Hit, sess.xid, obj.xid.to_string());
            sess.rctx.obj = Some(obj);
            sess.step = Step::Hit;
            Flow::Continue
        }
    }
}

/// Cache hit: ask the policy, then deliver, pass, error or restart.
pub(super) async fn cnt_hit(sess: &mut Session, ctx: &ProxyCtx) -> Flow {
    assert!(sess.rctx.obj.is_some());

    let disposition = {
        let obj = sess.rctx.obj.as_ref().expect("hit object").clone();
        let mut scope = crate::policy::HitScope {
            req: sess.req.as_mut().expect("active request"),
            obj: &obj,
            err: &mut sess.err,
        };
        ctx.policy().hit(&mut scope)
    };

    if disposition == HitDisposition::Deliver {
        // Dispose of any body part of the request.
        if drain_req_body(sess).await.is_err() {
            sess.rctx.deref_obj();
            sess.close("error");
            sess.step = Step::Done;
            return Flow::Continue;
        }
        sess.step = Step::PrepResp;
        return Flow::Continue;
    }

    // Drop our object, we won't need it.
    sess.rctx.deref_obj();

    match disposition {
        HitDisposition::Pass => sess.step = Step::Pass,
        HitDisposition::Error => sess.step = Step::Error,
        HitDisposition::Restart => {
            sess.director = None;
            sess.restarts += 1;
            sess.wstats.restarts += 1;
            sess.step = Step::Recv;
        }
        HitDisposition::Deliver => unreachable!(),
    }
    Flow::Continue
}

/// Cache miss: build the backend request under the fetch rules and ask the
/// policy.
pub(super) async fn cnt_miss(sess: &mut Session, ctx: &ProxyCtx) -> Flow {
    assert!(sess.rctx.obj.is_none());
    assert!(sess.rctx.objcore.is_some());

    let req = sess.req.as_ref().expect("active request");
    let mut bereq = ReqHead {
        method: Method::GET,
        uri: req.uri.clone(),
        version: Version::HTTP_11,
        headers: headers::filter_fields(&req.headers, FilterRules::Fetch),
    };
    if ctx.params().http_gzip_support {
        // We always ask the backend for gzip, even if the client doesn't
        // grok it. We will uncompress for the minority of clients which
        // don't.
        bereq.headers.remove(header::ACCEPT_ENCODING);
        bereq
            .headers
            .insert(header::ACCEPT_ENCODING, HeaderValue::from_static("gzip"));
    }
    sess.rctx.bereq = Some(bereq);

    let disposition = {
        let mut scope = BereqScope {
            req: sess.req.as_ref().expect("active request"),
            bereq: sess.rctx.bereq.as_mut().expect("bereq built"),
            err: &mut sess.err,
        };
        ctx.policy().miss(&mut scope)
    };

    match disposition {
        MissDisposition::Fetch => {
            sess.rctx.busyobj = Some(BusyObj::new());
            sess.step = Step::Fetch;
        }
        MissDisposition::Pass => {
            sess.rctx.objcore = None;
            sess.rctx.bereq = None;
            sess.step = Step::Pass;
        }
        MissDisposition::Error => {
            sess.rctx.objcore = None;
            sess.rctx.bereq = None;
            sess.step = Step::Error;
        }
        MissDisposition::Restart => {
            // Not supported; fail loudly with its own tag rather than
            // invent semantics.
            sess.rctx.objcore = None;
            sess.rctx.bereq = None;
            sess.log
                .record(Tag::Error, sess.xid, crate::Error::MissRestart.to_string());
            sess.err.set(503, "restart from the miss hook is not supported");
            sess.step = Step::Error;
        }
    }
    Flow::Continue
}

/// Pass-through: backend request under the pass rules, body forwarded.
pub(super) async fn cnt_pass(sess: &mut Session, ctx: &ProxyCtx) -> Flow {
    assert!(sess.rctx.obj.is_none());
    assert!(sess.rctx.objcore.is_none());

    if let Some(mark) = sess.ws_req {
        sess.ws.reset(mark);
    }
    let req = sess.req.as_ref().expect("active request");
    sess.rctx.bereq = Some(ReqHead {
        method: req.method.clone(),
        uri: req.uri.clone(),
        version: Version::HTTP_11,
        headers: headers::filter_fields(&req.headers, FilterRules::Pass),
    });

    let disposition = {
        let mut scope = BereqScope {
            req: sess.req.as_ref().expect("active request"),
            bereq: sess.rctx.bereq.as_mut().expect("bereq built"),
            err: &mut sess.err,
        };
        ctx.policy().pass(&mut scope)
    };

    match disposition {
        PassDisposition::Error => {
            sess.rctx.bereq = None;
            sess.step = Step::Error;
        }
        PassDisposition::Pass => {
            sess.rctx.acct.pass = 1;
            sess.sendbody = true;
            sess.rctx.busyobj = Some(BusyObj::new());
            sess.step = Step::Fetch;
        }
    }
    Flow::Continue
}

/// Pipe: ship the request head unchanged and relay bytes until either side
/// closes.
pub(super) async fn cnt_pipe(sess: &mut Session, ctx: &ProxyCtx) -> Flow {
    sess.rctx.acct.pipe = 1;

    let req = sess.req.as_ref().expect("active request");
    sess.rctx.bereq = Some(ReqHead {
        method: req.method.clone(),
        uri: req.uri.clone(),
        version: req.version,
        headers: headers::filter_fields(&req.headers, FilterRules::Pipe),
    });

    {
        let mut scope = BereqScope {
            req: sess.req.as_ref().expect("active request"),
            bereq: sess.rctx.bereq.as_mut().expect("bereq built"),
            err: &mut sess.err,
        };
        // Only one legal disposition.
        let crate::policy::PipeDisposition::Pipe = ctx.policy().pipe(&mut scope);
    }

    let bereq = sess.rctx.bereq.take().expect("bereq built");
    let buffered = sess.htc.take_all();
    let backend = ctx.backend(sess.director.unwrap_or(0));
    match backend
        .pipe(
            &mut sess.io,
            &bereq,
            &buffered,
            ctx.params().connect_timeout,
        )
        .await
    {
        Ok((up, down)) => {
            sess.rctx.acct.bodybytes += up + down;
        }
        Err(e) => {
            sess.log.record(Tag::Error, sess.xid, e.to_string());
        }
    }
    sess.req_body_done = true;
    sess.close("pipe");
    sess.step = Step::Done;
    Flow::Continue
}

/// Synthesize an error object and deliver it.
pub(super) async fn cnt_error(sess: &mut Session, ctx: &ProxyCtx) -> Flow {
    // Unwind whatever the failing path left behind.
    sess.rctx.objcore = None;
    sess.rctx.busyobj = None;
    sess.rctx.clear_backend();

    if sess.err.code < 100 || sess.err.code > 999 {
        sess.err.code = 501;
    }
    let status =
        StatusCode::from_u16(sess.err.code).unwrap_or(StatusCode::NOT_IMPLEMENTED);

    if sess.rctx.obj.is_none() {
        let lease = ctx
            .storage()
            .lease(StorageHint::Default, 4096)
            .or_else(|| ctx.storage().lease(StorageHint::Transient, 4096));
        let lease = match lease {
            Some(lease) => lease,
            None => {
                sess.close("Out of objects");
                sess.director = None;
                sess.step = Step::Done;
                return Flow::Continue;
            }
        };

        let reason = sess
            .err
            .reason
            .clone()
            .unwrap_or_else(|| status_reason(sess.err.code).to_string());

        let mut resp = RespHead::new(status);
        resp.reason = Some(reason.clone());
        resp.headers.insert(
            header::DATE,
            HeaderValue::from_str(&clock::format_http_date(clock::now()))
                .expect("formatted date is a valid value"),
        );
        resp.headers
            .insert(header::SERVER, HeaderValue::from_static("legate"));

        let mut body = Vec::new();
        let disposition = {
            let mut scope = ErrorScope {
                req: sess.req.as_ref(),
                xid: sess.xid,
                err_code: sess.err.code,
                reason: &reason,
                resp: &mut resp,
                body: &mut body,
            };
            ctx.policy().error(&mut scope)
        };

        if disposition == crate::policy::ErrorDisposition::Restart
            && sess.restarts < ctx.params().max_restarts
        {
            sess.director = None;
            sess.restarts += 1;
            sess.wstats.restarts += 1;
            sess.step = Step::Recv;
            return Flow::Continue;
        }

        let mut exp = Expiry::default();
        exp.entered = if sess.t_req.is_finite() {
            sess.t_req
        } else {
            clock::now()
        };
        let mut obj = Object::new(sess.xid, resp.status, resp.headers, exp, lease);
        obj.reason = resp.reason;
        obj.last_modified = exp.entered.floor();
        if !body.is_empty() && obj.push_body(body.into()).is_err() {
            sess.close("Out of objects");
            sess.director = None;
            sess.step = Step::Done;
            return Flow::Continue;
        }
        sess.rctx.obj = Some(std::sync::Arc::new(obj));
    }

    // We always close when we take this path.
    sess.doclose = Some("error");
    sess.wantbody = true;
    sess.err.code = 0;
    sess.err.reason = None;
    sess.step = Step::PrepResp;
    Flow::Continue
}

/// Terminal per-request step: accounting, logging, connection disposition,
/// and the pipelining cascade.
pub(super) async fn cnt_done(sess: &mut Session, ctx: &ProxyCtx) -> Flow {
    assert!(sess.rctx.obj.is_none());
    assert!(sess.rctx.objcore.is_none());

    sess.director = None;
    sess.restarts = 0;
    sess.rctx.busyobj = None;
    sess.rctx.resp = None;
    sess.rctx.res_mode = RespMode::empty();
    sess.rctx.clear_backend();

    // Unconsumed request body would desynchronize pipelining.
    if !sess.req_body_done && !sess.fd_closed {
        if drain_req_body(sess).await.is_err() {
            sess.close("error");
        }
    }

    {
        let (acct, wstats) = (&mut sess.rctx.acct, &mut sess.wstats);
        acct.charge(wstats);
    }

    // If we did an ESI include, don't mess up our state.
    if sess.esi_level > 0 {
        sess.req = None;
        sess.http0 = None;
        sess.digest = None;
        sess.xid = 0;
        return Flow::Park(Park::EsiDone);
    }

    sess.t_end = clock::now();
    if sess.xid != 0 {
        let dh = sess.t_req - sess.t_open;
        let dp = sess.t_resp - sess.t_req;
        let da = sess.t_end - sess.t_resp;
        if !sess.fd_closed {
            sess.log
                .record(Tag::Length, sess.xid, sess.req_bodybytes.to_string());
        }
        sess.log.record(
            Tag::ReqEnd,
            sess.xid,
            format!(
                "{} {:.9} {:.9} {:.9} {:.9} {:.9}",
                sess.xid, sess.t_req, sess.t_end, dh, dp, da
            ),
        );
    }
    sess.xid = 0;
    sess.log.flush();

    sess.t_open = sess.t_end;
    sess.t_resp = f64::NAN;
    sess.t_req = f64::NAN;
    sess.req_bodybytes = 0;
    sess.hash_always_miss = false;
    sess.hash_ignore_busy = false;
    sess.req = None;
    sess.http0 = None;
    sess.digest = None;
    sess.req_body = None;
    sess.req_body_done = true;
    sess.err = Default::default();

    if sess.doclose.is_some() && !sess.fd_closed {
        // Orderly close; queued data gets transmitted first.
        let reason = sess.doclose.expect("doclose checked");
        let _ = sess.io.shutdown().await;
        sess.fd_closed = true;
        sess.log.record(Tag::SessClose, 0, reason);
        sess.log.flush();
    }

    if sess.fd_closed {
        sess.wstats.sess_closed += 1;
        sess.wstats.flush(ctx.stats());
        return Flow::Park(Park::Gone);
    }

    if sess.wstats.client_req >= ctx.params().wthread_stats_rate {
        sess.wstats.flush(ctx.stats());
    }

    // Reset the workspace to the session watermark.
    if let Some(mark) = sess.ws_ses {
        sess.ws.reset(mark);
    }

    if sess.htc.reinit() {
        sess.wstats.sess_pipeline += 1;
        sess.step = Step::Start;
        return Flow::Continue;
    }
    if sess.htc.buffered() > 0 {
        sess.wstats.sess_readahead += 1;
        sess.step = Step::Wait;
        return Flow::Continue;
    }
    if !ctx.params().session_linger.is_zero() {
        sess.wstats.sess_linger += 1;
        sess.step = Step::Wait;
        return Flow::Continue;
    }
    sess.wstats.sess_herd += 1;
    Flow::Park(Park::Waiter)
}

/// Read and discard the request body, counting it.
pub(super) async fn drain_req_body(sess: &mut Session) -> std::io::Result<()> {
    if sess.req_body_done {
        return Ok(());
    }
    let req = sess.req.as_ref().expect("active request").clone();
    let n = sess.htc.drain_body(&mut sess.io, &req).await?;
    sess.req_bodybytes += n;
    sess.req_body_done = true;
    Ok(())
}

/// Read and keep the request body for forwarding.
pub(super) async fn take_req_body(
    sess: &mut Session,
    cap: usize,
) -> std::io::Result<Vec<u8>> {
    if sess.req_body_done {
        return Ok(sess.req_body.clone().unwrap_or_default());
    }
    let req = sess.req.as_ref().expect("active request").clone();
    let body = sess.htc.read_body(&mut sess.io, &req, cap).await?;
    sess.req_bodybytes += body.len() as u64;
    sess.req_body = Some(body.clone());
    sess.req_body_done = true;
    Ok(body)
}

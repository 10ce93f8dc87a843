//! Response preparation and delivery, including the ESI segment walk.

use http::{header, HeaderValue, Method, StatusCode, Version};

use super::{Flow, Park, Step};
use crate::{
    cache, clock,
    esi::{EsiSeg, MAX_ESI_DEPTH},
    freshness,
    headers::{ReqHead, RespHead},
    object::Object,
    policy::{DeliverDisposition, DeliverScope},
    reqlog::Tag,
    resp::{self, RespMode},
    service::ProxyCtx,
    session::Session,
};

/// Select the response mode, stamp the delivery timestamp, build the
/// response headers and run the deliver hook.
pub(super) async fn cnt_prepresp(sess: &mut Session, ctx: &ProxyCtx) -> Flow {
    let params = ctx.params();
    let obj = sess.rctx.obj.as_ref().expect("object held").clone();

    let do_stream = sess
        .rctx
        .busyobj
        .as_ref()
        .map(|bo| bo.do_stream)
        .unwrap_or(false);
    if do_stream {
        let guard = sess.rctx.objcore.as_ref();
        assert!(
            guard
                .map(|g| g.core().is_busy() || g.core().is_pass())
                .unwrap_or(true),
            "streaming a settled object"
        );
    }

    let mut mode = RespMode::empty();
    {
        let bo = sess.rctx.busyobj.as_ref();

        if bo.is_none() {
            mode |= RespMode::LEN;
        }
        if let Some(bo) = bo {
            if (sess.rctx.h_content_length.is_some() || !bo.do_stream)
                && !bo.do_gzip
                && !bo.do_gunzip
            {
                mode |= RespMode::LEN;
            }
        }
        if !sess.disable_esi && obj.has_esidata() {
            // In ESI mode we don't know the aggregate length.
            mode -= RespMode::LEN;
            mode |= RespMode::ESI;
        }
        if sess.esi_level > 0 {
            mode -= RespMode::LEN;
            mode |= RespMode::ESI_CHILD;
        }
        if params.http_gzip_support
            && obj.gziped
            && !freshness::request_accepts_gzip(sess.req())
        {
            // We don't know what it uncompresses to.
            mode -= RespMode::LEN;
            mode |= RespMode::GUNZIP;
        }
        if mode.framing_count() == 0 {
            if obj.body.is_empty() && !do_stream {
                // An empty object can't change size under ESI or GUNZIP.
                mode |= RespMode::LEN;
            } else if !sess.wantbody {
                // Nothing.
            } else if sess.req().version >= Version::HTTP_11 {
                mode |= RespMode::CHUNKED;
            } else {
                mode |= RespMode::EOF;
                sess.doclose = Some("EOF mode");
            }
        }
    }

    sess.t_resp = clock::now();
    if obj.exp.ttl >= 0.0 {
        cache::touch_lru(&obj, sess.t_resp, params.lru_timeout);
    }

    let mut resp = build_resp(sess, &obj);
    if mode.contains(RespMode::GUNZIP) {
        // The client gets the decompressed form.
        resp.headers.remove(header::CONTENT_ENCODING);
    }

    let disposition = {
        let mut scope = DeliverScope {
            req: sess.req.as_ref().expect("active request"),
            obj: &obj,
            resp: &mut resp,
        };
        ctx.policy().deliver(&mut scope)
    };

    match disposition {
        DeliverDisposition::Restart if sess.restarts < params.max_restarts => {
            sess.rctx.objcore = None;
            sess.rctx.deref_obj();
            sess.rctx.busyobj = None;
            sess.rctx.clear_backend();
            sess.rctx.res_mode = RespMode::empty();
            sess.director = None;
            sess.restarts += 1;
            sess.wstats.restarts += 1;
            sess.step = Step::Recv;
            return Flow::Continue;
        }
        // Above the cap a restart quietly becomes a deliver.
        DeliverDisposition::Restart | DeliverDisposition::Deliver => {}
    }

    sess.rctx.resp = Some(resp);
    sess.rctx.res_mode = mode;
    sess.step = if do_stream {
        Step::StreamBody
    } else {
        Step::Deliver
    };
    Flow::Continue
}

/// Assemble the client-facing headers from the stored object.
fn build_resp(sess: &Session, obj: &Object) -> RespHead {
    let mut resp = RespHead::new(obj.response);
    resp.reason = obj.reason.clone();
    resp.headers = obj.headers.clone();
    if obj.exp.ttl >= 0.0 {
        let age = (sess.t_resp - obj.exp.entered).max(0.0) as u64;
        resp.headers.insert(
            header::AGE,
            HeaderValue::from_str(&age.to_string()).expect("age is a valid value"),
        );
    }
    if !resp.headers.contains_key(header::DATE) {
        resp.headers.insert(
            header::DATE,
            HeaderValue::from_str(&clock::format_http_date(sess.t_resp))
                .expect("formatted date is a valid value"),
        );
    }
    resp.headers
        .insert(header::VIA, HeaderValue::from_static("1.1 legate"));
    let ids = if obj.xid != 0 && obj.xid != sess.xid {
        format!("{} {}", sess.xid, obj.xid)
    } else {
        sess.xid.to_string()
    };
    resp.headers.insert(
        header::HeaderName::from_static("x-legate"),
        HeaderValue::from_str(&ids).expect("xids are valid values"),
    );
    resp
}

/// Deliver an already stored object.
pub(super) async fn cnt_deliver(sess: &mut Session, ctx: &ProxyCtx) -> Flow {
    sess.director = None;
    sess.restarts = 0;

    let obj = sess.rctx.obj.as_ref().expect("object held").clone();
    let mode = sess.rctx.res_mode;

    if sess.esi_level > 0 {
        // Include content goes to the parent's sink; no head, no framing.
        deliver_child(sess, ctx, &obj, mode).await;
        sess.rctx.deref_obj();
        sess.rctx.resp = None;
        sess.step = Step::Done;
        return Flow::Continue;
    }

    let mut resp = sess.rctx.resp.take().expect("response prepared");

    // A satisfied conditional turns the stored 200 into a 304.
    let req = sess.req.as_ref().expect("active request");
    let not_modified = obj.response == StatusCode::OK
        && freshness::request_is_conditional(req)
        && freshness::conditional_matches(req, &obj.headers, obj.last_modified);

    if sess.doclose.is_some() {
        resp.headers
            .insert(header::CONNECTION, HeaderValue::from_static("close"));
    }

    let result = if not_modified {
        resp::make_not_modified(&mut resp);
        resp::write_head(&mut sess.io, &resp)
            .await
            .map(|n| (n, 0u64))
            .map_err(crate::Error::from)
    } else if mode.contains(RespMode::ESI) {
        resp::apply_framing(&mut resp, mode, obj.body.len());
        deliver_esi(sess, ctx, &obj, mode, resp).await
    } else {
        resp::apply_framing(&mut resp, mode, obj.body.len());
        deliver_plain(sess, ctx, &obj, mode, &resp).await
    };

    match result {
        Ok((hdrbytes, bodybytes)) => {
            sess.rctx.acct.hdrbytes += hdrbytes;
            sess.rctx.acct.bodybytes += bodybytes;
        }
        Err(e) => {
            sess.log.record(Tag::Error, sess.xid, e.to_string());
            sess.close("error");
        }
    }

    sess.rctx.deref_obj();
    sess.rctx.resp = None;
    sess.step = Step::Done;
    Flow::Continue
}

/// Plain body write with the selected framing and overlays.
async fn deliver_plain(
    sess: &mut Session,
    ctx: &ProxyCtx,
    obj: &Object,
    mode: RespMode,
    resp: &RespHead,
) -> Result<(u64, u64), crate::Error> {
    let io = &mut sess.io;
    let hdrbytes = resp::write_head(io, resp).await?;
    if !sess.wantbody {
        return Ok((hdrbytes, 0));
    }
    let mut writer = resp::BodyWriter::new(io, mode, ctx.params().gzip_stack_buffer);
    for chunk in obj.body.snapshot() {
        writer.write_chunk(&chunk).await?;
    }
    writer.finish().await?;
    Ok((hdrbytes, writer.bodybytes))
}

/// ESI walk at the top level: literals frame directly onto the socket,
/// includes run as child requests whose output lands in the session's ESI
/// sink.
async fn deliver_esi(
    sess: &mut Session,
    ctx: &ProxyCtx,
    obj: &Object,
    mode: RespMode,
    resp: RespHead,
) -> Result<(u64, u64), crate::Error> {
    let esidata = obj.esidata().expect("ESI mode implies esidata");
    let body = obj.body.to_vec();
    let chunked = mode.contains(RespMode::CHUNKED);

    let hdrbytes = resp::write_head(&mut sess.io, &resp).await?;
    if !sess.wantbody {
        return Ok((hdrbytes, 0));
    }

    let mut bodybytes = 0u64;
    for seg in &esidata.segments {
        match seg {
            EsiSeg::Literal { off, len } => {
                let data = &body[*off..*off + *len];
                resp::write_framed_chunk(&mut sess.io, chunked, data).await?;
                bodybytes += data.len() as u64;
            }
            EsiSeg::Include { src } => {
                esi_include(sess, ctx, src).await;
                if !sess.esi_out.is_empty() {
                    let data = std::mem::take(&mut sess.esi_out);
                    resp::write_framed_chunk(&mut sess.io, chunked, &data).await?;
                    bodybytes += data.len() as u64;
                }
            }
        }
    }
    if chunked {
        resp::write_terminator(&mut sess.io).await?;
    }
    Ok((hdrbytes, bodybytes))
}

/// Child delivery: append the object body (or its ESI walk) to the parent's
/// sink, decompressing when the stored body is gzip.
async fn deliver_child(sess: &mut Session, ctx: &ProxyCtx, obj: &Object, mode: RespMode) {
    if mode.contains(RespMode::ESI) {
        let esidata = obj.esidata().expect("ESI mode implies esidata");
        let body = obj.body.to_vec();
        for seg in &esidata.segments {
            match seg {
                EsiSeg::Literal { off, len } => {
                    sess.esi_out.extend_from_slice(&body[*off..*off + *len]);
                }
                EsiSeg::Include { src } => {
                    let src = src.clone();
                    esi_include(sess, ctx, &src).await;
                }
            }
        }
        return;
    }

    let body = obj.body.to_vec();
    if mode.contains(RespMode::GUNZIP) || obj.gziped {
        match gunzip_all(&body) {
            Ok(plain) => sess.esi_out.extend_from_slice(&plain),
            Err(e) => {
                sess.log.record(Tag::Error, sess.xid, e.to_string());
                sess.wstats.esi_errors += 1;
            }
        }
    } else {
        sess.esi_out.extend_from_slice(&body);
    }
}

fn gunzip_all(data: &[u8]) -> Result<Vec<u8>, crate::Error> {
    use std::io::Write as _;
    let mut decoder = flate2::write::GzDecoder::new(Vec::new());
    decoder
        .write_all(data)
        .and_then(|()| decoder.try_finish())
        .map_err(|e| crate::Error::Gzip(e.to_string()))?;
    decoder
        .finish()
        .map_err(|e| crate::Error::Gzip(e.to_string()))
}

/// Run one include as a child request on this session, at depth + 1.
async fn esi_include(sess: &mut Session, ctx: &ProxyCtx, src: &str) {
    if sess.esi_level >= MAX_ESI_DEPTH {
        sess.log
            .record(Tag::Error, sess.xid, format!("ESI depth exceeded: {src}"));
        sess.wstats.esi_errors += 1;
        return;
    }
    let base = sess
        .http0
        .as_ref()
        .or(sess.req.as_ref())
        .expect("request present")
        .clone();
    let child_req = match include_request(&base, src) {
        Some(req) => req,
        None => {
            sess.log
                .record(Tag::Error, sess.xid, format!("unusable include src: {src}"));
            sess.wstats.esi_errors += 1;
            return;
        }
    };
    sess.wstats.esi_requests += 1;

    let saved = sess.save_req_scope();
    sess.esi_level += 1;
    sess.restarts = 0;
    sess.http0 = Some(child_req.clone());
    sess.req = Some(child_req);
    sess.req_body = None;
    sess.req_body_done = true;
    sess.req_bodybytes = 0;
    sess.err = Default::default();
    sess.step = Step::Recv;

    let park = super::drive(sess, ctx).await;
    debug_assert_eq!(park, Park::EsiDone);

    sess.esi_level -= 1;
    sess.restore_req_scope(saved);
}

/// Build the child request: GET, the resolved URL, the parent's headers
/// minus conditionals, ranges and encoding negotiation (include content is
/// stitched plain into the parent stream).
fn include_request(base: &ReqHead, src: &str) -> Option<ReqHead> {
    let uri = resolve_include(base, src)?;
    let mut headers = base.headers.clone();
    for name in [
        header::IF_MODIFIED_SINCE,
        header::IF_NONE_MATCH,
        header::RANGE,
        header::CONTENT_LENGTH,
        header::TRANSFER_ENCODING,
        header::ACCEPT_ENCODING,
        header::EXPECT,
    ] {
        headers.remove(name);
    }
    Some(ReqHead {
        method: Method::GET,
        uri,
        version: Version::HTTP_11,
        headers,
    })
}

fn resolve_include(base: &ReqHead, src: &str) -> Option<http::Uri> {
    if let Some(rest) = src
        .strip_prefix("http://")
        .or_else(|| src.strip_prefix("https://"))
    {
        // Keep only the path; includes are served through the same engine.
        let path_start = rest.find('/').map(|i| i + src.len() - rest.len());
        let path = path_start.map(|i| &src[i..]).unwrap_or("/");
        return path.parse().ok();
    }
    if src.starts_with('/') {
        return src.parse().ok();
    }
    // Relative: resolve against the parent's directory.
    let parent = base.uri.path();
    let dir = match parent.rfind('/') {
        Some(i) => &parent[..=i],
        None => "/",
    };
    format!("{dir}{src}").parse().ok()
}

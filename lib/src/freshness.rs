//! RFC 2616 derived decisions: default TTLs, body framing classification,
//! encoding negotiation, and conditional-request matching.

use http::{header, HeaderMap, Method, StatusCode};

use crate::{
    clock,
    config::Params,
    headers::{ReqHead, RespHead},
    object::{BodyStatus, Expiry},
};

/// Statuses eligible for the configured default TTL when the response
/// carries no explicit freshness information.
fn status_has_default_ttl(status: StatusCode) -> bool {
    matches!(
        status.as_u16(),
        200 | 203 | 300 | 301 | 302 | 307 | 410
    )
}

fn cache_control_field(headers: &HeaderMap, field: &str) -> Option<f64> {
    let cc = headers.get(header::CACHE_CONTROL)?.to_str().ok()?;
    for directive in cc.split(',') {
        let directive = directive.trim();
        let (name, value) = match directive.split_once('=') {
            Some((n, v)) => (n.trim(), Some(v.trim().trim_matches('"'))),
            None => (directive, None),
        };
        if name.eq_ignore_ascii_case(field) {
            return value.and_then(|v| v.parse::<f64>().ok());
        }
    }
    None
}

/// Compute the expiry bundle for a backend response, the way RFC 2616 reads
/// it: `s-maxage` wins over `max-age`, which wins over `Expires`/`Date`
/// arithmetic, which wins over the status-based default. Uncacheable
/// statuses get a negative TTL.
pub fn ttl_from_response(now: f64, beresp: &RespHead, params: &Params) -> Expiry {
    let mut exp = Expiry {
        entered: now,
        ttl: -1.0,
        grace: params.default_grace,
        keep: params.default_keep,
    };

    if !status_has_default_ttl(beresp.status) {
        return exp;
    }

    let age = beresp
        .header_str(header::AGE)
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(0.0);

    let ttl = if let Some(s_maxage) = cache_control_field(&beresp.headers, "s-maxage") {
        s_maxage - age
    } else if let Some(max_age) = cache_control_field(&beresp.headers, "max-age") {
        max_age - age
    } else if let Some(expires) = beresp
        .header_str(header::EXPIRES)
        .and_then(clock::parse_http_date)
    {
        let date = beresp
            .header_str(header::DATE)
            .and_then(clock::parse_http_date)
            .unwrap_or(now);
        expires - date
    } else {
        params.default_ttl
    };

    exp.ttl = ttl.max(0.0);
    exp
}

/// Classify how the backend body is framed, before the fetch hook can
/// adulterate the headers.
pub fn body_status(req_method: &Method, beresp: &RespHead) -> BodyStatus {
    if *req_method == Method::HEAD {
        return BodyStatus::None;
    }
    match beresp.status.as_u16() {
        100..=199 | 204 | 304 => return BodyStatus::None,
        _ => {}
    }
    if let Some(te) = beresp.header_str(header::TRANSFER_ENCODING) {
        if te
            .split(',')
            .any(|tok| tok.trim().eq_ignore_ascii_case("chunked"))
        {
            return BodyStatus::Chunked;
        }
    }
    if let Some(n) = beresp
        .header_str(header::CONTENT_LENGTH)
        .and_then(|v| v.parse::<u64>().ok())
    {
        return BodyStatus::Length(n);
    }
    BodyStatus::Eof
}

/// Whether the client is willing to receive a gzip'ed body.
pub fn request_accepts_gzip(req: &ReqHead) -> bool {
    let ae = match req.header_str(header::ACCEPT_ENCODING) {
        Some(ae) => ae,
        None => return false,
    };
    for entry in ae.split(',') {
        let mut parts = entry.split(';');
        let coding = parts.next().unwrap_or("").trim();
        if !coding.eq_ignore_ascii_case("gzip") {
            continue;
        }
        let q_zero = parts.any(|p| {
            let p = p.trim();
            p.strip_prefix("q=")
                .map(|q| q.trim().parse::<f64>().map(|q| q == 0.0).unwrap_or(false))
                .unwrap_or(false)
        });
        return !q_zero;
    }
    false
}

/// Whether the request carries conditional headers at all.
pub fn request_is_conditional(req: &ReqHead) -> bool {
    req.headers.contains_key(header::IF_MODIFIED_SINCE)
        || req.headers.contains_key(header::IF_NONE_MATCH)
}

/// Whether the stored object satisfies the request's conditionals, i.e. a
/// 304 may be sent instead of the body.
pub fn conditional_matches(req: &ReqHead, obj_headers: &HeaderMap, last_modified: f64) -> bool {
    if let Some(inm) = req.header_str(header::IF_NONE_MATCH) {
        let etag = obj_headers
            .get(header::ETAG)
            .and_then(|v| v.to_str().ok());
        return match etag {
            Some(etag) => inm
                .split(',')
                .any(|t| t.trim() == etag || t.trim() == "*"),
            None => false,
        };
    }
    if let Some(ims) = req
        .header_str(header::IF_MODIFIED_SINCE)
        .and_then(clock::parse_http_date)
    {
        return last_modified > 0.0 && last_modified <= ims;
    }
    false
}

//! Header containers and the filter rule sets applied when a client request
//! is turned into a backend request, and when a backend response is stored.

use http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, Version};

/// The parsed head of a client or backend request.
#[derive(Debug, Clone)]
pub struct ReqHead {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
}

impl ReqHead {
    pub fn header_str(&self, name: HeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// The head of a backend or synthesized response.
#[derive(Debug, Clone)]
pub struct RespHead {
    pub status: StatusCode,
    pub reason: Option<String>,
    pub version: Version,
    pub headers: HeaderMap,
}

impl RespHead {
    pub fn new(status: StatusCode) -> Self {
        RespHead {
            status,
            reason: None,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
        }
    }

    pub fn header_str(&self, name: HeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Which filter rule set to apply when building a `bereq` or storing a
/// response. The sets differ in how much of the client's request survives
/// the trip to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterRules {
    /// Cache fetch: conditionals and ranges are stripped so the backend
    /// produces a full, unconditional response we can store.
    Fetch,
    /// Pass-through: only hop-by-hop fields are removed.
    Pass,
    /// Pipe: hop-by-hop removal; framing stays untouched.
    Pipe,
    /// Response storage: hop-by-hop fields never enter the cache.
    Insert,
}

/// Hop-by-hop fields, never forwarded in either direction.
const HOP_BY_HOP: &[HeaderName] = &[
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Copy `src` into a new header map under the given rule set.
pub fn filter_fields(src: &HeaderMap, rules: FilterRules) -> HeaderMap {
    let mut dst = src.clone();
    for name in HOP_BY_HOP {
        dst.remove(name);
    }
    dst.remove(HeaderName::from_static("keep-alive"));
    match rules {
        FilterRules::Fetch => {
            dst.remove(header::RANGE);
            dst.remove(header::IF_MODIFIED_SINCE);
            dst.remove(header::IF_NONE_MATCH);
            dst.remove(header::IF_MATCH);
            dst.remove(header::IF_RANGE);
        }
        FilterRules::Pass | FilterRules::Pipe => {}
        FilterRules::Insert => {
            // Framing is recomputed at delivery time; stored headers carry
            // the entity, not the transfer.
            dst.remove(header::CONTENT_LENGTH);
        }
    }
    dst
}

/// Remove framing-related headers from an outgoing backend request; the
/// client library inserts the appropriate framing itself.
pub fn filter_outgoing_headers(headers: &mut HeaderMap) {
    headers.remove(header::CONTENT_LENGTH);
    headers.remove(header::TRANSFER_ENCODING);
}

/// Collapse a header that may be spread over multiple lines into a single
/// comma-joined line, the form the engine relies on outside of policy code.
pub fn collect_header(headers: &mut HeaderMap, name: HeaderName) {
    let values: Vec<HeaderValue> = headers.get_all(&name).iter().cloned().collect();
    if values.len() < 2 {
        return;
    }
    let mut joined = Vec::new();
    for (i, v) in values.iter().enumerate() {
        if i > 0 {
            joined.extend_from_slice(b", ");
        }
        joined.extend_from_slice(v.as_bytes());
    }
    if let Ok(v) = HeaderValue::from_bytes(&joined) {
        headers.remove(&name);
        headers.insert(name, v);
    }
}

/// Determine whether this request forces the connection closed after the
/// response, returning the close reason if so.
pub fn connection_close_reason(head: &ReqHead) -> Option<&'static str> {
    let conn = head
        .headers
        .get(header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let wants_close = conn
        .split(',')
        .any(|tok| tok.trim().eq_ignore_ascii_case("close"));
    let wants_keepalive = conn
        .split(',')
        .any(|tok| tok.trim().eq_ignore_ascii_case("keep-alive"));
    if wants_close {
        Some("Connection: close")
    } else if head.version == Version::HTTP_10 && !wants_keepalive {
        Some("not HTTP/1.1")
    } else {
        None
    }
}

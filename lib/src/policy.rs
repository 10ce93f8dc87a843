//! Per-request policy hooks.
//!
//! The engine calls nine named hooks at fixed points of the request
//! lifecycle. Each hook sees a scope — the slice of session state it is
//! allowed to touch — and returns a disposition. The legal return sets are
//! encoded in the per-hook disposition enums, so most illegal returns are
//! unrepresentable; the two protocol gaps that remain (restart from the
//! miss hook, pipe inside an include) are rejected by the engine with
//! distinct errors.

use http::{header, HeaderValue, Method, StatusCode};
use sha2::{Digest, Sha256};

use crate::{
    headers::{ReqHead, RespHead},
    object::{BusyObj, Object},
};

/// Error state a hook may request.
#[derive(Debug, Default, Clone)]
pub struct ErrInfo {
    pub code: u16,
    pub reason: Option<String>,
}

impl ErrInfo {
    pub fn set(&mut self, code: u16, reason: impl Into<String>) {
        self.code = code;
        self.reason = Some(reason.into());
    }
}

pub struct RecvScope<'a> {
    pub req: &'a mut ReqHead,
    pub esi_level: u32,
    pub restarts: u32,
    pub hash_always_miss: &'a mut bool,
    pub hash_ignore_busy: &'a mut bool,
    pub disable_esi: &'a mut bool,
    pub err: &'a mut ErrInfo,
}

/// Scope of the hash hook: feeds bytes into the request digest.
pub struct HashScope<'a> {
    pub req: &'a ReqHead,
    hasher: &'a mut Sha256,
}

impl<'a> HashScope<'a> {
    pub(crate) fn new(req: &'a ReqHead, hasher: &'a mut Sha256) -> Self {
        HashScope { req, hasher }
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
        self.hasher.update(b"#");
    }
}

pub struct BereqScope<'a> {
    pub req: &'a ReqHead,
    pub bereq: &'a mut ReqHead,
    pub err: &'a mut ErrInfo,
}

pub struct HitScope<'a> {
    pub req: &'a mut ReqHead,
    pub obj: &'a Object,
    pub err: &'a mut ErrInfo,
}

pub struct FetchScope<'a> {
    pub req: &'a ReqHead,
    pub bereq: &'a ReqHead,
    pub beresp: &'a mut RespHead,
    pub busyobj: &'a mut BusyObj,
    pub err: &'a mut ErrInfo,
}

pub struct DeliverScope<'a> {
    pub req: &'a ReqHead,
    pub obj: &'a Object,
    pub resp: &'a mut RespHead,
}

pub struct ErrorScope<'a> {
    pub req: Option<&'a ReqHead>,
    pub xid: u64,
    pub err_code: u16,
    pub reason: &'a str,
    /// Synthetic response headers, pre-populated by the engine.
    pub resp: &'a mut RespHead,
    /// Synthetic body; whatever is here after the hook is delivered.
    pub body: &'a mut Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvDisposition {
    Lookup,
    Pipe,
    Pass,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeDisposition {
    Pipe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassDisposition {
    Pass,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissDisposition {
    Fetch,
    Pass,
    Error,
    /// Present in the hook protocol but not supported by the engine; the
    /// request fails with a distinct tag.
    Restart,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitDisposition {
    Deliver,
    Pass,
    Error,
    Restart,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchDisposition {
    Deliver,
    HitForPass,
    Restart,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliverDisposition {
    Deliver,
    Restart,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDisposition {
    Deliver,
    Restart,
}

/// The nine hooks. Implementations must be cheap and non-blocking; they run
/// inline in the request path.
pub trait Policy: Send + Sync {
    fn recv(&self, scope: &mut RecvScope<'_>) -> RecvDisposition;
    fn hash(&self, scope: &mut HashScope<'_>);
    fn pipe(&self, scope: &mut BereqScope<'_>) -> PipeDisposition;
    fn pass(&self, scope: &mut BereqScope<'_>) -> PassDisposition;
    fn miss(&self, scope: &mut BereqScope<'_>) -> MissDisposition;
    fn hit(&self, scope: &mut HitScope<'_>) -> HitDisposition;
    fn fetch(&self, scope: &mut FetchScope<'_>) -> FetchDisposition;
    fn deliver(&self, scope: &mut DeliverScope<'_>) -> DeliverDisposition;
    fn error(&self, scope: &mut ErrorScope<'_>) -> ErrorDisposition;
}

/// The builtin policy: conservative caching of clean GET/HEAD traffic.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultPolicy;

/// Hit-for-pass entries created by the builtin fetch rules stay around this
/// long.
const HIT_FOR_PASS_TTL: f64 = 120.0;

impl Policy for DefaultPolicy {
    fn recv(&self, scope: &mut RecvScope<'_>) -> RecvDisposition {
        let method = &scope.req.method;
        let known = matches!(
            *method,
            Method::GET
                | Method::HEAD
                | Method::PUT
                | Method::POST
                | Method::TRACE
                | Method::OPTIONS
                | Method::DELETE
        );
        if !known {
            // Unknown methods are best left untouched.
            return RecvDisposition::Pipe;
        }
        if *method != Method::GET && *method != Method::HEAD {
            return RecvDisposition::Pass;
        }
        if scope.req.headers.contains_key(header::AUTHORIZATION)
            || scope.req.headers.contains_key(header::COOKIE)
        {
            return RecvDisposition::Pass;
        }
        RecvDisposition::Lookup
    }

    fn hash(&self, scope: &mut HashScope<'_>) {
        let uri = scope.req.uri.to_string();
        scope.feed(uri.as_bytes());
        if let Some(host) = scope.req.header_str(header::HOST) {
            let host = host.to_ascii_lowercase();
            scope.feed(host.as_bytes());
        }
    }

    fn pipe(&self, _scope: &mut BereqScope<'_>) -> PipeDisposition {
        PipeDisposition::Pipe
    }

    fn pass(&self, _scope: &mut BereqScope<'_>) -> PassDisposition {
        PassDisposition::Pass
    }

    fn miss(&self, _scope: &mut BereqScope<'_>) -> MissDisposition {
        MissDisposition::Fetch
    }

    fn hit(&self, _scope: &mut HitScope<'_>) -> HitDisposition {
        HitDisposition::Deliver
    }

    fn fetch(&self, scope: &mut FetchScope<'_>) -> FetchDisposition {
        let vary_star = scope
            .beresp
            .header_str(header::VARY)
            .map(|v| v.trim() == "*")
            .unwrap_or(false);
        if scope.busyobj.exp.ttl <= 0.0
            || scope.beresp.headers.contains_key(header::SET_COOKIE)
            || vary_star
        {
            scope.busyobj.exp.ttl = HIT_FOR_PASS_TTL;
            return FetchDisposition::HitForPass;
        }
        FetchDisposition::Deliver
    }

    fn deliver(&self, _scope: &mut DeliverScope<'_>) -> DeliverDisposition {
        DeliverDisposition::Deliver
    }

    fn error(&self, scope: &mut ErrorScope<'_>) -> ErrorDisposition {
        scope.resp.headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/html; charset=utf-8"),
        );
        let code = scope.err_code;
        let reason = scope.reason;
        let xid = scope.xid;
        *scope.body = format!(
            "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n\
             <!DOCTYPE html>\n\
             <html>\n  <head>\n    <title>{code} {reason}</title>\n  </head>\n\
             <body>\n    <h1>Error {code} {reason}</h1>\n    <p>{reason}</p>\n\
             <p>XID: {xid}</p>\n    <hr>\n    <p>legate cache server</p>\n\
             </body>\n</html>\n"
        )
        .into_bytes();
        ErrorDisposition::Deliver
    }
}

/// Compute the request digest: initialize the hash context, let the hook
/// feed it, finalize into the cache key.
pub fn run_hash_hook(policy: &dyn Policy, req: &ReqHead) -> [u8; 32] {
    let mut hasher = Sha256::new();
    let mut scope = HashScope::new(req, &mut hasher);
    policy.hash(&mut scope);
    hasher.finalize().into()
}

/// The default reason phrase for a status code.
pub fn status_reason(code: u16) -> &'static str {
    StatusCode::from_u16(code)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("Unknown Error")
}

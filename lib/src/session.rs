//! Session state.
//!
//! A `Session` is one client connection plus the state of its active
//! request. The per-request object ownership (the cached object, the busy
//! index entry, the fetch state, the three header sets) lives in a
//! `ReqContext` owned by the session; ownership transitions are methods on
//! it, and the dispatcher asserts it is empty at every request boundary.

use std::net::SocketAddr;

use tokio::net::TcpStream;

use crate::{
    cache::{BusyGuard, BusyWaiter, CacheKey},
    headers::{ReqHead, RespHead},
    httc::HttpConn,
    object::{BusyObj, Object},
    policy::ErrInfo,
    reqlog::ReqLog,
    resp::RespMode,
    stats::{AcctTmp, WorkerStats},
    steps::Step,
    workspace::{Snapshot, Workspace},
};

/// Everything a single request owns while it moves through the steps.
#[derive(Debug, Default)]
pub struct ReqContext {
    /// The object being delivered; every path to Done releases it.
    pub obj: Option<std::sync::Arc<Object>>,
    /// The busy index entry while we are the fetcher.
    pub objcore: Option<BusyGuard>,
    /// Fetch-time state; present exactly during Fetch/FetchBody/StreamBody
    /// and the hit-for-pass path through them.
    pub busyobj: Option<BusyObj>,
    pub bereq: Option<ReqHead>,
    pub beresp: Option<RespHead>,
    pub resp: Option<RespHead>,
    pub res_mode: RespMode,
    /// Content-Length preserved from the backend response, when usable for
    /// LEN framing.
    pub h_content_length: Option<u64>,
    pub acct: AcctTmp,
}

impl ReqContext {
    /// Release the held object reference.
    pub fn deref_obj(&mut self) {
        self.obj = None;
    }

    /// Drop backend-request state after a fetch concludes or unwinds.
    pub fn clear_backend(&mut self) {
        self.bereq = None;
        self.beresp = None;
        self.h_content_length = None;
        if let Some(busyobj) = self.busyobj.as_mut() {
            busyobj.beresp_body = None;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.obj.is_none() && self.objcore.is_none() && self.busyobj.is_none()
    }
}

/// Saved request scope, stacked away while an ESI include runs as a child
/// request on the same session.
#[derive(Debug)]
pub struct SavedReqScope {
    step: Step,
    xid: u64,
    restarts: u32,
    t_req: f64,
    t_resp: f64,
    req: Option<ReqHead>,
    http0: Option<ReqHead>,
    digest: Option<CacheKey>,
    director: Option<usize>,
    wantbody: bool,
    sendbody: bool,
    hash_always_miss: bool,
    hash_ignore_busy: bool,
    disable_esi: bool,
    err: ErrInfo,
    req_body: Option<Vec<u8>>,
    req_body_done: bool,
    req_bodybytes: u64,
    rctx: ReqContext,
}

pub struct Session {
    pub io: TcpStream,
    pub remote: SocketAddr,
    pub htc: HttpConn,
    pub ws: Workspace,
    /// Watermark taken when the connection was set up; Done resets to it.
    pub ws_ses: Option<Snapshot>,
    /// Watermark taken after request dissection.
    pub ws_req: Option<Snapshot>,

    pub step: Step,
    /// Monotonic request id; 0 means "no active request".
    pub xid: u64,
    pub restarts: u32,
    pub esi_level: u32,

    pub t_open: f64,
    pub t_req: f64,
    pub t_resp: f64,
    pub t_end: f64,

    pub req: Option<ReqHead>,
    /// Pre-modification snapshot of the request, the basis for restarts
    /// and ESI children.
    pub http0: Option<ReqHead>,
    pub digest: Option<CacheKey>,
    /// Index of the chosen backend.
    pub director: Option<usize>,

    pub wantbody: bool,
    pub sendbody: bool,
    pub hash_always_miss: bool,
    pub hash_ignore_busy: bool,
    pub disable_esi: bool,

    /// Close the connection after delivery, with this diagnostic tag.
    pub doclose: Option<&'static str>,
    /// The socket is no longer usable (closed or poisoned by an error).
    pub fd_closed: bool,

    pub err: ErrInfo,
    /// Buffered request body, read when a step needs to forward or drain
    /// it.
    pub req_body: Option<Vec<u8>>,
    /// Whether the request body has been consumed off the socket; Done
    /// drains any leftover so pipelined requests line up.
    pub req_body_done: bool,
    pub req_bodybytes: u64,

    /// Set while parked on a busy index entry.
    pub busy_waiter: Option<BusyWaiter>,

    /// Output sink for include content: children append here, the
    /// top-level request frames it onto the socket.
    pub esi_out: Vec<u8>,

    pub log: ReqLog,
    pub wstats: WorkerStats,
    pub rctx: ReqContext,
}

impl Session {
    pub fn new(io: TcpStream, remote: SocketAddr, req_buf: usize, ws_size: usize) -> Self {
        Session {
            io,
            remote,
            htc: HttpConn::new(req_buf),
            ws: Workspace::new(ws_size),
            ws_ses: None,
            ws_req: None,
            step: Step::First,
            xid: 0,
            restarts: 0,
            esi_level: 0,
            t_open: crate::clock::now(),
            t_req: f64::NAN,
            t_resp: f64::NAN,
            t_end: f64::NAN,
            req: None,
            http0: None,
            digest: None,
            director: None,
            wantbody: false,
            sendbody: false,
            hash_always_miss: false,
            hash_ignore_busy: false,
            disable_esi: false,
            doclose: None,
            fd_closed: false,
            err: ErrInfo::default(),
            req_body: None,
            req_body_done: true,
            req_bodybytes: 0,
            busy_waiter: None,
            esi_out: Vec::new(),
            log: ReqLog::new(),
            wstats: WorkerStats::default(),
            rctx: ReqContext::default(),
        }
    }

    pub fn req(&self) -> &ReqHead {
        self.req.as_ref().expect("active request")
    }

    pub fn req_mut(&mut self) -> &mut ReqHead {
        self.req.as_mut().expect("active request")
    }

    /// Orderly close with a diagnostic tag. Idempotent.
    pub fn close(&mut self, reason: &'static str) {
        if !self.fd_closed {
            self.log
                .record(crate::reqlog::Tag::SessClose, self.xid, reason);
            self.fd_closed = true;
        }
        self.doclose = Some(reason);
    }

    /// Stack the current request scope away for an ESI child.
    pub fn save_req_scope(&mut self) -> SavedReqScope {
        SavedReqScope {
            step: self.step,
            xid: self.xid,
            restarts: self.restarts,
            t_req: self.t_req,
            t_resp: self.t_resp,
            req: self.req.take(),
            http0: self.http0.take(),
            digest: self.digest.take(),
            director: self.director.take(),
            wantbody: self.wantbody,
            sendbody: self.sendbody,
            hash_always_miss: self.hash_always_miss,
            hash_ignore_busy: self.hash_ignore_busy,
            disable_esi: self.disable_esi,
            err: std::mem::take(&mut self.err),
            req_body: self.req_body.take(),
            req_body_done: self.req_body_done,
            req_bodybytes: self.req_bodybytes,
            rctx: std::mem::take(&mut self.rctx),
        }
    }

    /// Restore the parent scope after a child request finished.
    pub fn restore_req_scope(&mut self, saved: SavedReqScope) {
        self.step = saved.step;
        self.xid = saved.xid;
        self.restarts = saved.restarts;
        self.t_req = saved.t_req;
        self.t_resp = saved.t_resp;
        self.req = saved.req;
        self.http0 = saved.http0;
        self.digest = saved.digest;
        self.director = saved.director;
        self.wantbody = saved.wantbody;
        self.sendbody = saved.sendbody;
        self.hash_always_miss = saved.hash_always_miss;
        self.hash_ignore_busy = saved.hash_ignore_busy;
        self.disable_esi = saved.disable_esi;
        self.err = saved.err;
        self.req_body = saved.req_body;
        self.req_body_done = saved.req_body_done;
        self.req_bodybytes = saved.req_bodybytes;
        self.rctx = saved.rctx;
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("remote", &self.remote)
            .field("step", &self.step)
            .field("xid", &self.xid)
            .field("restarts", &self.restarts)
            .field("esi_level", &self.esi_level)
            .finish_non_exhaustive()
    }
}

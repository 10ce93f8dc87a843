//! Common values and types used by the integration tests.
#![allow(dead_code)] // The exported values are used by other modules in the test suite

use std::{
    convert::Infallible,
    net::SocketAddr,
    pin::Pin,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use futures::Future;
use hyper::{
    service::{make_service_fn, service_fn},
    Body as HyperBody, Request, Response, Server,
};
use legate_lib::{policy::Policy, session_task, LegateConfig, ProxyCtx};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

/// A catch-all error, so we can easily use `?` in test cases.
pub type Error = Box<dyn std::error::Error + Send + Sync>;

/// Handy alias for the return type of async tests.
pub type TestResult = Result<(), Error>;

type HandlerFuture = Pin<Box<dyn Future<Output = Response<HyperBody>> + Send>>;
type Handler = Arc<dyn Fn(Request<HyperBody>) -> HandlerFuture + Send + Sync>;

/// A mock origin server, counting the requests it sees.
pub struct Origin {
    pub addr: SocketAddr,
    hits: Arc<AtomicUsize>,
}

impl Origin {
    /// Spawn an origin with a synchronous handler.
    pub fn serve<F>(f: F) -> Origin
    where
        F: Fn(Request<HyperBody>) -> Response<HyperBody> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Origin::serve_async(move |req| {
            let f = Arc::clone(&f);
            Box::pin(async move { f(req) })
        })
    }

    /// Spawn an origin with an async handler (for slow-backend tests).
    pub fn serve_async<F>(f: F) -> Origin
    where
        F: Fn(Request<HyperBody>) -> HandlerFuture + Send + Sync + 'static,
    {
        let hits = Arc::new(AtomicUsize::new(0));
        let handler: Handler = Arc::new(f);
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind origin");
        listener.set_nonblocking(true).expect("nonblocking origin");
        let addr = listener.local_addr().expect("origin addr");

        let make_svc = {
            let hits = Arc::clone(&hits);
            make_service_fn(move |_conn| {
                let handler = Arc::clone(&handler);
                let hits = Arc::clone(&hits);
                async move {
                    Ok::<_, Infallible>(service_fn(move |req| {
                        let handler = Arc::clone(&handler);
                        hits.fetch_add(1, Ordering::SeqCst);
                        async move { Ok::<_, Infallible>(handler(req).await) }
                    }))
                }
            })
        };
        tokio::spawn(async move {
            Server::from_tcp(listener)
                .expect("origin server")
                .serve(make_svc)
                .await
                .expect("origin server run");
        });
        Origin { addr, hits }
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

/// A proxy under test: a real listener wired to a fresh context.
pub struct TestProxy {
    pub addr: SocketAddr,
    pub ctx: ProxyCtx,
}

impl TestProxy {
    pub async fn start(origin: &Origin, params: &str, policy: Option<Arc<dyn Policy>>) -> Self {
        let toml = format!(
            "listen_addr = \"127.0.0.1:0\"\n\
             [backends.origin]\n\
             url = \"http://{}/\"\n\
             [params]\n\
             {params}\n",
            origin.addr
        );
        let config: LegateConfig = toml.parse().expect("test config parses");
        let mut ctx = ProxyCtx::new(&config).expect("context builds");
        if let Some(policy) = policy {
            ctx = ctx.with_policy(policy);
        }
        // Pin the xid counter so transaction ids in assertions are stable.
        ctx.debug_set_xid(1000);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind proxy");
        let addr = listener.local_addr().expect("proxy addr");
        let accept_ctx = ctx.clone();
        tokio::spawn(async move {
            loop {
                let (stream, remote) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(_) => return,
                };
                let ctx = accept_ctx.clone();
                tokio::spawn(session_task(stream, remote, ctx));
            }
        });
        TestProxy { addr, ctx }
    }

    pub async fn connect(&self) -> TcpStream {
        TcpStream::connect(self.addr).await.expect("connect proxy")
    }
}

/// A decoded raw HTTP response.
#[derive(Debug)]
pub struct RawResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn body_str(&self) -> &str {
        std::str::from_utf8(&self.body).expect("body is UTF-8")
    }
}

/// Send one request on the stream and read the full response.
pub async fn send_request(stream: &mut TcpStream, request: &str) -> Result<RawResponse, Error> {
    stream.write_all(request.as_bytes()).await?;
    read_response(stream, true).await
}

/// Like `send_request`, for responses that carry no body (HEAD).
pub async fn send_request_no_body(
    stream: &mut TcpStream,
    request: &str,
) -> Result<RawResponse, Error> {
    stream.write_all(request.as_bytes()).await?;
    read_response(stream, false).await
}

/// One-shot: fresh connection, one request, connection dropped.
pub async fn roundtrip(proxy: &TestProxy, request: &str) -> Result<RawResponse, Error> {
    let mut stream = proxy.connect().await;
    send_request(&mut stream, request).await
}

/// Read a response head plus its body, decoding chunked or length framing.
pub async fn read_response(
    stream: &mut TcpStream,
    want_body: bool,
) -> Result<RawResponse, Error> {
    let mut buf = Vec::new();
    let head_end = loop {
        if let Some(pos) = find(&buf, b"\r\n\r\n") {
            break pos + 4;
        }
        let mut chunk = [0u8; 4096];
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err("connection closed before response head".into());
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = std::str::from_utf8(&buf[..head_end])?.to_string();
    let mut lines = head.split("\r\n");
    let status_line = lines.next().ok_or("missing status line")?;
    let status: u16 = status_line
        .split_whitespace()
        .nth(1)
        .ok_or("missing status code")?
        .parse()?;
    let headers: Vec<(String, String)> = lines
        .filter_map(|line| {
            line.split_once(':')
                .map(|(n, v)| (n.trim().to_string(), v.trim().to_string()))
        })
        .collect();

    let mut rest = buf[head_end..].to_vec();
    let response = RawResponse {
        status,
        headers,
        body: Vec::new(),
    };
    if !want_body || status == 304 || status == 204 {
        return Ok(response);
    }

    let chunked = response
        .header("transfer-encoding")
        .map(|v| v.contains("chunked"))
        .unwrap_or(false);
    let body = if chunked {
        read_chunked(stream, &mut rest).await?
    } else if let Some(len) = response.header("content-length") {
        let len: usize = len.parse()?;
        while rest.len() < len {
            let mut chunk = [0u8; 4096];
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                return Err("connection closed mid-body".into());
            }
            rest.extend_from_slice(&chunk[..n]);
        }
        rest.truncate(len);
        rest
    } else {
        // EOF framing.
        loop {
            let mut chunk = [0u8; 4096];
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            rest.extend_from_slice(&chunk[..n]);
        }
        rest
    };

    Ok(RawResponse { body, ..response })
}

async fn read_chunked(stream: &mut TcpStream, buf: &mut Vec<u8>) -> Result<Vec<u8>, Error> {
    let mut body = Vec::new();
    loop {
        let line_end = loop {
            if let Some(pos) = find(buf, b"\r\n") {
                break pos;
            }
            read_more(stream, buf).await?;
        };
        let size = usize::from_str_radix(std::str::from_utf8(&buf[..line_end])?.trim(), 16)?;
        buf.drain(..line_end + 2);
        if size == 0 {
            // Trailing CRLF of the terminator.
            while buf.len() < 2 {
                read_more(stream, buf).await?;
            }
            buf.drain(..2);
            return Ok(body);
        }
        while buf.len() < size + 2 {
            read_more(stream, buf).await?;
        }
        body.extend_from_slice(&buf[..size]);
        buf.drain(..size + 2);
    }
}

async fn read_more(stream: &mut TcpStream, buf: &mut Vec<u8>) -> Result<(), Error> {
    let mut chunk = [0u8; 4096];
    let n = stream.read(&mut chunk).await?;
    if n == 0 {
        return Err("connection closed mid-chunk".into());
    }
    buf.extend_from_slice(&chunk[..n]);
    Ok(())
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|w| w == needle)
}

/// Poll an assertion until it holds or the deadline passes; counters fold
/// into the global table asynchronously.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

/// A configurable policy for driving specific engine paths. Everything not
/// overridden behaves like the builtin policy.
#[derive(Default)]
pub struct TestPolicy {
    /// Compress identity bodies before storing.
    pub do_gzip: bool,
    /// Overlap fetch and delivery.
    pub do_stream: bool,
    /// Enable ESI processing for these request paths.
    pub esi_paths: Vec<&'static str>,
    /// Restart from the deliver hook, forever (the cap stops it).
    pub deliver_restart: bool,
    /// Restart from the fetch hook this many times, then deliver.
    pub fetch_restarts: AtomicUsize,
}

impl Policy for TestPolicy {
    fn recv(
        &self,
        scope: &mut legate_lib::policy::RecvScope<'_>,
    ) -> legate_lib::policy::RecvDisposition {
        legate_lib::policy::DefaultPolicy.recv(scope)
    }

    fn hash(&self, scope: &mut legate_lib::policy::HashScope<'_>) {
        legate_lib::policy::DefaultPolicy.hash(scope)
    }

    fn pipe(
        &self,
        scope: &mut legate_lib::policy::BereqScope<'_>,
    ) -> legate_lib::policy::PipeDisposition {
        legate_lib::policy::DefaultPolicy.pipe(scope)
    }

    fn pass(
        &self,
        scope: &mut legate_lib::policy::BereqScope<'_>,
    ) -> legate_lib::policy::PassDisposition {
        legate_lib::policy::DefaultPolicy.pass(scope)
    }

    fn miss(
        &self,
        scope: &mut legate_lib::policy::BereqScope<'_>,
    ) -> legate_lib::policy::MissDisposition {
        legate_lib::policy::DefaultPolicy.miss(scope)
    }

    fn hit(
        &self,
        scope: &mut legate_lib::policy::HitScope<'_>,
    ) -> legate_lib::policy::HitDisposition {
        legate_lib::policy::DefaultPolicy.hit(scope)
    }

    fn fetch(
        &self,
        scope: &mut legate_lib::policy::FetchScope<'_>,
    ) -> legate_lib::policy::FetchDisposition {
        if self
            .fetch_restarts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return legate_lib::policy::FetchDisposition::Restart;
        }
        scope.busyobj.do_gzip = self.do_gzip;
        scope.busyobj.do_stream = self.do_stream;
        if self.esi_paths.contains(&scope.req.uri.path()) {
            scope.busyobj.do_esi = true;
        }
        legate_lib::policy::FetchDisposition::Deliver
    }

    fn deliver(
        &self,
        scope: &mut legate_lib::policy::DeliverScope<'_>,
    ) -> legate_lib::policy::DeliverDisposition {
        let _ = scope;
        if self.deliver_restart {
            legate_lib::policy::DeliverDisposition::Restart
        } else {
            legate_lib::policy::DeliverDisposition::Deliver
        }
    }

    fn error(
        &self,
        scope: &mut legate_lib::policy::ErrorScope<'_>,
    ) -> legate_lib::policy::ErrorDisposition {
        legate_lib::policy::DefaultPolicy.error(scope)
    }
}

/// Compress a buffer the way origins do.
pub fn gzip(data: &[u8]) -> Vec<u8> {
    use flate2::{read::GzEncoder, Compression};
    use std::io::Read;
    let mut out = Vec::new();
    GzEncoder::new(data, Compression::default())
        .read_to_end(&mut out)
        .expect("gzip succeeds");
    out
}

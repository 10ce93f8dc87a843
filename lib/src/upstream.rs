//! Backend I/O.
//!
//! Each configured backend gets one pooled HTTP/1.1 client over a custom
//! connector which dials the host from the backend configuration,
//! regardless of what the request URI says. Pipe mode bypasses the client
//! entirely and relays raw bytes over a fresh TCP connection.

use futures::Future;
use http::{header, uri, HeaderValue, Uri, Version};
use hyper::{client::HttpConnector, service::Service, Client, Request};
use std::{
    pin::Pin,
    sync::Arc,
    task::{self, Poll},
    time::Duration,
};
use tokio::net::TcpStream;

use crate::{
    config::{Backend, Params},
    headers::{filter_outgoing_headers, ReqHead, RespHead},
};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A connector that ignores the request URI and dials the configured
/// backend instead.
#[derive(Clone)]
pub struct BackendConnector {
    backend: Arc<Backend>,
    http: HttpConnector,
}

impl BackendConnector {
    pub fn new(backend: Arc<Backend>, connect_timeout: Duration) -> Self {
        let mut http = HttpConnector::new();
        http.set_connect_timeout(Some(connect_timeout));
        Self { backend, http }
    }
}

impl Service<Uri> for BackendConnector {
    type Response = TcpStream;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, BoxError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut task::Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.http.poll_ready(cx).map_err(Into::into)
    }

    // We ignore the URI argument and instead provide the backend's URI.
    // NB this does _not_ affect the URI provided in the request itself.
    fn call(&mut self, _: Uri) -> Self::Future {
        let connect_fut = self.http.call(self.backend.uri.clone());
        Box::pin(async move { connect_fut.await.map_err(Into::into) })
    }
}

/// How a header fetch failed, from the Fetch step's point of view: only the
/// recycled-connection race is worth one retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchFail {
    Retryable,
    Fatal,
}

fn classify(err: &hyper::Error) -> FetchFail {
    use std::error::Error as _;
    if err.is_incomplete_message() || err.is_canceled() {
        return FetchFail::Retryable;
    }
    let reset = err
        .source()
        .and_then(|e| e.downcast_ref::<std::io::Error>())
        .map(|ioe| {
            matches!(
                ioe.kind(),
                std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::BrokenPipe
            )
        })
        .unwrap_or(false);
    if reset {
        FetchFail::Retryable
    } else {
        FetchFail::Fatal
    }
}

/// One backend's fetch/pipe surface.
pub struct BackendIo {
    backend: Arc<Backend>,
    client: Client<BackendConnector, hyper::Body>,
    first_byte_timeout: Duration,
}

impl BackendIo {
    pub fn new(backend: Arc<Backend>, params: &Params) -> Self {
        let connector = BackendConnector::new(Arc::clone(&backend), params.connect_timeout);
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .set_host(false)
            .build(connector);
        BackendIo {
            backend,
            client,
            first_byte_timeout: params.first_byte_timeout,
        }
    }

    pub fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }

    /// Send `bereq` and wait for response headers. The body stream is
    /// handed back untouched; the caller pulls it through the selected
    /// transform.
    pub async fn fetch_headers(
        &self,
        bereq: &ReqHead,
        body: Vec<u8>,
    ) -> Result<(RespHead, hyper::Body), FetchFail> {
        let request = match self.build_request(bereq, body) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(backend = %self.backend.name, error = %e, "bereq assembly failed");
                return Err(FetchFail::Fatal);
            }
        };

        let response = tokio::time::timeout(self.first_byte_timeout, self.client.request(request))
            .await
            .map_err(|_| {
                tracing::warn!(backend = %self.backend.name, "first byte timeout");
                FetchFail::Fatal
            })?
            .map_err(|e| {
                let fail = classify(&e);
                tracing::warn!(backend = %self.backend.name, error = %e, ?fail, "fetch failed");
                fail
            })?;

        let (parts, body) = response.into_parts();
        Ok((
            RespHead {
                status: parts.status,
                reason: None,
                version: parts.version,
                headers: parts.headers,
            },
            body,
        ))
    }

    fn build_request(
        &self,
        bereq: &ReqHead,
        body: Vec<u8>,
    ) -> Result<Request<hyper::Body>, crate::Error> {
        let host = self.canonical_host(bereq);
        let uri = self.canonical_uri(bereq, host.to_str().unwrap_or_default())?;

        let mut headers = bereq.headers.clone();
        filter_outgoing_headers(&mut headers);
        headers.insert(header::HOST, host);

        let mut builder = Request::builder()
            .method(bereq.method.clone())
            .uri(uri)
            .version(Version::HTTP_11);
        if let Some(map) = builder.headers_mut() {
            *map = headers;
        }
        Ok(builder.body(hyper::Body::from(body))?)
    }

    /// Prefer the configured override, then the client's Host header, then
    /// the backend authority.
    fn canonical_host(&self, bereq: &ReqHead) -> HeaderValue {
        self.backend
            .override_host
            .clone()
            .or_else(|| bereq.headers.get(header::HOST).cloned())
            .unwrap_or_else(|| {
                HeaderValue::from_str(&self.backend.authority())
                    .expect("backend authority is a valid header value")
            })
    }

    /// Absolute-form URI for the client library: scheme and authority from
    /// the backend, path and query from the request.
    fn canonical_uri(&self, bereq: &ReqHead, host: &str) -> Result<Uri, crate::Error> {
        let path_and_query = bereq
            .uri
            .path_and_query()
            .map_or("/", uri::PathAndQuery::as_str);
        let mut joined = String::new();
        joined.push_str(self.backend.uri.path().trim_end_matches('/'));
        joined.push_str(path_and_query);
        Ok(Uri::builder()
            .scheme("http")
            .authority(if host.is_empty() {
                self.backend.authority()
            } else {
                host.to_string()
            })
            .path_and_query(joined)
            .build()?)
    }

    /// Pipe mode: ship the request head as-is over a fresh connection and
    /// relay bytes both ways until either side closes. Returns bytes moved
    /// (client-to-backend, backend-to-client).
    pub async fn pipe(
        &self,
        client_io: &mut TcpStream,
        bereq: &ReqHead,
        buffered: &[u8],
        connect_timeout: Duration,
    ) -> std::io::Result<(u64, u64)> {
        let mut backend_io = tokio::time::timeout(
            connect_timeout,
            TcpStream::connect(self.backend.authority()),
        )
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "pipe connect timeout"))??;

        use tokio::io::AsyncWriteExt;
        let head = serialize_req_head(bereq);
        backend_io.write_all(&head).await?;
        if !buffered.is_empty() {
            backend_io.write_all(buffered).await?;
        }
        tokio::io::copy_bidirectional(client_io, &mut backend_io).await
    }
}

fn serialize_req_head(bereq: &ReqHead) -> Vec<u8> {
    let mut out = Vec::with_capacity(256);
    let version = match bereq.version {
        Version::HTTP_10 => "HTTP/1.0",
        _ => "HTTP/1.1",
    };
    let path = bereq
        .uri
        .path_and_query()
        .map_or("/", uri::PathAndQuery::as_str);
    out.extend_from_slice(format!("{} {} {}\r\n", bereq.method, path, version).as_bytes());
    for (name, value) in bereq.headers.iter() {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out
}

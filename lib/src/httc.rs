//! Client connection reading.
//!
//! One `HttpConn` per client connection: an accumulating read buffer with
//! completeness probing (is a full request head buffered?), request
//! dissection, body consumption, and the pipelining probe the Done step
//! uses to decide between Start, Wait and herding.

use bytes::{Buf, BytesMut};
use http::{header, HeaderMap, HeaderName, HeaderValue, Method, Uri, Version};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::headers::ReqHead;

const MAX_HEADERS: usize = 64;

/// Completeness of the buffered request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxStatus {
    /// A full request head is buffered.
    Complete,
    /// More bytes are needed.
    Partial,
    /// The peer closed; `buffered()` tells whether mid-request.
    Eof,
    /// The head outgrew the read buffer.
    Overflow,
    /// A read failed with a real I/O error.
    Error,
}

#[derive(Debug)]
pub struct HttpConn {
    buf: BytesMut,
    limit: usize,
    eof: bool,
    io_err: bool,
}

impl HttpConn {
    pub fn new(limit: usize) -> Self {
        HttpConn {
            buf: BytesMut::with_capacity(2048),
            limit,
            eof: false,
            io_err: false,
        }
    }

    /// Probe the buffer without reading.
    pub fn complete(&self) -> RxStatus {
        if find_head_end(&self.buf).is_some() {
            return RxStatus::Complete;
        }
        if self.buf.len() >= self.limit {
            return RxStatus::Overflow;
        }
        if self.io_err {
            return RxStatus::Error;
        }
        if self.eof {
            return RxStatus::Eof;
        }
        RxStatus::Partial
    }

    /// Read once from the socket and re-probe.
    pub async fn rx(&mut self, io: &mut (impl AsyncRead + Unpin)) -> RxStatus {
        if self.buf.len() >= self.limit {
            return RxStatus::Overflow;
        }
        let mut chunk = [0u8; 2048];
        match io.read(&mut chunk).await {
            Ok(0) => self.eof = true,
            Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => self.eof = true,
            Err(_) => self.io_err = true,
        }
        self.complete()
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Dissect the buffered head into a request, consuming its bytes. The
    /// error value is the status to fail with (400 for junk).
    pub fn dissect(&mut self) -> Result<ReqHead, u16> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parsed = httparse::Request::new(&mut headers);
        let consumed = match parsed.parse(&self.buf) {
            Ok(httparse::Status::Complete(n)) => n,
            Ok(httparse::Status::Partial) => return Err(400),
            Err(_) => return Err(400),
        };

        let method = Method::from_bytes(parsed.method.unwrap_or("").as_bytes())
            .map_err(|_| 400u16)?;
        let uri: Uri = parsed.path.unwrap_or("").parse().map_err(|_| 400u16)?;
        let version = match parsed.version {
            Some(0) => Version::HTTP_10,
            Some(1) => Version::HTTP_11,
            _ => return Err(400),
        };

        let mut map = HeaderMap::with_capacity(parsed.headers.len());
        for h in parsed.headers.iter() {
            let name = HeaderName::from_bytes(h.name.as_bytes()).map_err(|_| 400u16)?;
            let value = HeaderValue::from_bytes(h.value).map_err(|_| 400u16)?;
            map.append(name, value);
        }

        self.buf.advance(consumed);
        Ok(ReqHead {
            method,
            uri,
            version,
            headers: map,
        })
    }

    /// Content-Length of the request body, if the request carries one.
    pub fn body_len(req: &ReqHead) -> Option<u64> {
        req.headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
    }

    /// Read the declared request body, combining buffered bytes with the
    /// socket. Bodies larger than `cap` are refused.
    pub async fn read_body(
        &mut self,
        io: &mut (impl AsyncRead + Unpin),
        req: &ReqHead,
        cap: usize,
    ) -> std::io::Result<Vec<u8>> {
        let len = match Self::body_len(req) {
            Some(len) => len as usize,
            None => return Ok(Vec::new()),
        };
        if len > cap {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "request body too large",
            ));
        }
        let mut body = Vec::with_capacity(len);
        let from_buf = len.min(self.buf.len());
        body.extend_from_slice(&self.buf[..from_buf]);
        self.buf.advance(from_buf);
        while body.len() < len {
            let mut chunk = vec![0u8; (len - body.len()).min(16 * 1024)];
            let n = io.read(&mut chunk).await?;
            if n == 0 {
                return Err(std::io::ErrorKind::UnexpectedEof.into());
            }
            body.extend_from_slice(&chunk[..n]);
        }
        Ok(body)
    }

    /// Discard any request body so the next pipelined request lines up.
    /// Returns the number of bytes dropped.
    pub async fn drain_body(
        &mut self,
        io: &mut (impl AsyncRead + Unpin),
        req: &ReqHead,
    ) -> std::io::Result<u64> {
        let len = match Self::body_len(req) {
            Some(len) => len,
            None => return Ok(0),
        };
        let mut remaining = len;
        let from_buf = (remaining as usize).min(self.buf.len());
        self.buf.advance(from_buf);
        remaining -= from_buf as u64;
        let mut chunk = [0u8; 16 * 1024];
        while remaining > 0 {
            let want = (remaining as usize).min(chunk.len());
            let n = io.read(&mut chunk[..want]).await?;
            if n == 0 {
                return Err(std::io::ErrorKind::UnexpectedEof.into());
            }
            remaining -= n as u64;
        }
        Ok(len)
    }

    /// Pipelining probe, run between requests: true when another complete
    /// request head is already buffered.
    pub fn reinit(&self) -> bool {
        find_head_end(&self.buf).is_some()
    }

    /// Hand over everything buffered; pipe mode ships it to the backend
    /// ahead of the relay.
    pub fn take_all(&mut self) -> Vec<u8> {
        let out = self.buf.to_vec();
        self.buf.clear();
        out
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn_with(bytes: &[u8]) -> HttpConn {
        let mut conn = HttpConn::new(1024);
        conn.buf.extend_from_slice(bytes);
        conn
    }

    #[test]
    fn completeness_probing() {
        assert_eq!(conn_with(b"").complete(), RxStatus::Partial);
        assert_eq!(conn_with(b"GET / HTT").complete(), RxStatus::Partial);
        assert_eq!(
            conn_with(b"GET / HTTP/1.1\r\nHost: a\r\n\r\n").complete(),
            RxStatus::Complete
        );
    }

    #[test]
    fn overflow_at_limit() {
        let mut conn = HttpConn::new(16);
        conn.buf.extend_from_slice(&[b'x'; 16]);
        assert_eq!(conn.complete(), RxStatus::Overflow);
    }

    #[test]
    fn dissect_consumes_the_head() {
        let mut conn = conn_with(b"GET /a?b=c HTTP/1.1\r\nHost: test\r\nX-N: v\r\n\r\nleftover");
        let req = conn.dissect().unwrap();
        assert_eq!(req.method, Method::GET);
        assert_eq!(req.uri.path(), "/a");
        assert_eq!(req.version, Version::HTTP_11);
        assert_eq!(req.headers.get("x-n").unwrap(), "v");
        assert_eq!(conn.buffered(), b"leftover".len());
    }

    #[test]
    fn junk_is_a_400() {
        let mut conn = conn_with(b"total junk\r\n\r\n");
        assert_eq!(conn.dissect().unwrap_err(), 400);
    }

    #[test]
    fn pre_11_version_is_http_10() {
        let mut conn = conn_with(b"GET / HTTP/1.0\r\n\r\n");
        let req = conn.dissect().unwrap();
        assert_eq!(req.version, Version::HTTP_10);
    }

    #[test]
    fn reinit_sees_pipelined_request() {
        let mut conn =
            conn_with(b"GET /1 HTTP/1.1\r\n\r\nGET /2 HTTP/1.1\r\n\r\n");
        conn.dissect().unwrap();
        assert!(conn.reinit());
        conn.dissect().unwrap();
        assert!(!conn.reinit());
        assert_eq!(conn.buffered(), 0);
    }

    #[tokio::test]
    async fn body_read_combines_buffer_and_socket() {
        let mut conn = conn_with(b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\n12345");
        let req = conn.dissect().unwrap();
        let mut rest: &[u8] = b"67890";
        let body = conn.read_body(&mut rest, &req, 1024).await.unwrap();
        assert_eq!(body, b"1234567890");
        assert_eq!(conn.buffered(), 0);
    }

    #[tokio::test]
    async fn drain_skips_the_body() {
        let mut conn = conn_with(
            b"POST / HTTP/1.1\r\nContent-Length: 5\r\n\r\nabcdeGET /n HTTP/1.1\r\n\r\n",
        );
        let req = conn.dissect().unwrap();
        let mut empty: &[u8] = b"";
        assert_eq!(conn.drain_body(&mut empty, &req).await.unwrap(), 5);
        assert!(conn.reinit());
    }
}

//! Response assembly and delivery.
//!
//! The response mode decides framing (exactly one of LEN/CHUNKED/EOF) with
//! ESI and GUNZIP as orthogonal overlays. The body writer frames chunks as
//! they are handed to it, which is what lets StreamBody overlap fetch with
//! delivery, and applies the on-the-fly gunzip overlay for clients that
//! cannot take a stored gzip body.

use bitflags::bitflags;
use bytes::{buf::Writer, BufMut, BytesMut};
use flate2::write::GzDecoder;
use http::{header, HeaderValue, StatusCode, Version};
use std::io::Write as _;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::{headers::RespHead, Error};

bitflags! {
    /// Framing and transform decisions for a delivered response.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RespMode: u8 {
        const LEN = 1 << 0;
        const CHUNKED = 1 << 1;
        const EOF = 1 << 2;
        const ESI = 1 << 3;
        const ESI_CHILD = 1 << 4;
        const GUNZIP = 1 << 5;
    }
}

impl RespMode {
    /// Exactly one framing bit must be set for a response that carries a
    /// body on a top-level request.
    pub fn framing_count(self) -> u32 {
        (self & (RespMode::LEN | RespMode::CHUNKED | RespMode::EOF))
            .bits()
            .count_ones()
    }
}

/// Serialize a response head. The reason phrase falls back to the status'
/// canonical one.
pub fn head_bytes(resp: &RespHead) -> Vec<u8> {
    let mut out = Vec::with_capacity(256);
    let version = match resp.version {
        Version::HTTP_10 => "HTTP/1.0",
        _ => "HTTP/1.1",
    };
    let reason = resp
        .reason
        .as_deref()
        .or_else(|| resp.status.canonical_reason())
        .unwrap_or("");
    out.extend_from_slice(
        format!("{} {} {}\r\n", version, resp.status.as_u16(), reason).as_bytes(),
    );
    for (name, value) in resp.headers.iter() {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out
}

/// Write the head; returns header bytes sent for accounting.
pub async fn write_head(
    io: &mut (impl AsyncWrite + Unpin),
    resp: &RespHead,
) -> std::io::Result<u64> {
    let bytes = head_bytes(resp);
    io.write_all(&bytes).await?;
    Ok(bytes.len() as u64)
}

/// Apply the framing decision to the response headers: set Content-Length
/// or Transfer-Encoding, or neither for EOF framing.
pub fn apply_framing(resp: &mut RespHead, mode: RespMode, body_len: u64) {
    resp.headers.remove(header::CONTENT_LENGTH);
    resp.headers.remove(header::TRANSFER_ENCODING);
    if mode.contains(RespMode::LEN) {
        resp.headers.insert(
            header::CONTENT_LENGTH,
            HeaderValue::from_str(&body_len.to_string()).expect("length is a valid value"),
        );
    } else if mode.contains(RespMode::CHUNKED) {
        resp.headers
            .insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
    }
}

/// Rewrite a response head into the 304 a satisfied conditional gets: no
/// body, no framing, entity validators kept.
pub fn make_not_modified(resp: &mut RespHead) {
    resp.status = StatusCode::NOT_MODIFIED;
    resp.reason = None;
    resp.headers.remove(header::CONTENT_LENGTH);
    resp.headers.remove(header::TRANSFER_ENCODING);
    resp.headers.remove(header::CONTENT_ENCODING);
}

/// Frames body chunks per the response mode and applies the gunzip overlay.
pub struct BodyWriter<'a, W: AsyncWrite + Unpin> {
    io: &'a mut W,
    chunked: bool,
    gunzip: Option<Box<GzDecoder<Writer<BytesMut>>>>,
    /// Decoded bytes are staged here before framing; its size bounds how
    /// much decoder output a single write can carry.
    stage: usize,
    pub bodybytes: u64,
}

impl<'a, W: AsyncWrite + Unpin> BodyWriter<'a, W> {
    pub fn new(io: &'a mut W, mode: RespMode, gunzip_buffer: usize) -> Self {
        BodyWriter {
            io,
            chunked: mode.contains(RespMode::CHUNKED),
            gunzip: mode
                .contains(RespMode::GUNZIP)
                .then(|| Box::new(GzDecoder::new(BytesMut::with_capacity(gunzip_buffer).writer()))),
            stage: gunzip_buffer.max(4096),
            bodybytes: 0,
        }
    }

    pub async fn write_chunk(&mut self, data: &[u8]) -> Result<(), Error> {
        if data.is_empty() {
            return Ok(());
        }
        match &mut self.gunzip {
            Some(decoder) => {
                // Feed in staged pieces so decoder output is flushed out in
                // bounded slices.
                for piece in data.chunks(self.stage) {
                    decoder
                        .write_all(piece)
                        .and_then(|()| decoder.flush())
                        .map_err(|e| Error::Gzip(e.to_string()))?;
                    let out = decoder.get_mut().get_mut().split();
                    if !out.is_empty() {
                        write_framed_chunk(self.io, self.chunked, &out).await?;
                        self.bodybytes += out.len() as u64;
                    }
                }
            }
            None => {
                write_framed_chunk(self.io, self.chunked, data).await?;
                self.bodybytes += data.len() as u64;
            }
        }
        Ok(())
    }

    /// Flush the overlay and write the chunked terminator. Must be called
    /// exactly once, also on error paths.
    pub async fn finish(&mut self) -> Result<(), Error> {
        if let Some(decoder) = &mut self.gunzip {
            decoder
                .try_finish()
                .map_err(|e| Error::Gzip(e.to_string()))?;
            let out = decoder.get_mut().get_mut().split();
            if !out.is_empty() {
                write_framed_chunk(self.io, self.chunked, &out).await?;
                self.bodybytes += out.len() as u64;
            }
        }
        if self.chunked {
            self.io.write_all(b"0\r\n\r\n").await?;
        }
        self.io.flush().await?;
        Ok(())
    }
}

/// Write one body chunk with optional chunked framing. Zero-length chunks
/// are suppressed under chunked framing (a zero-size frame would terminate
/// the body).
pub async fn write_framed_chunk(
    io: &mut (impl AsyncWrite + Unpin),
    chunked: bool,
    data: &[u8],
) -> std::io::Result<()> {
    if data.is_empty() {
        return Ok(());
    }
    if chunked {
        io.write_all(format!("{:X}\r\n", data.len()).as_bytes())
            .await?;
        io.write_all(data).await?;
        io.write_all(b"\r\n").await?;
    } else {
        io.write_all(data).await?;
    }
    Ok(())
}

/// The chunked body terminator.
pub async fn write_terminator(io: &mut (impl AsyncWrite + Unpin)) -> std::io::Result<()> {
    io.write_all(b"0\r\n\r\n").await?;
    io.flush().await
}

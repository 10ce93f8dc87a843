//! Edge-side include scanning.
//!
//! The scanner runs as the body transform of a fetch with ESI enabled: it
//! buffers the (decompressed) backend body, and at end-of-body produces the
//! stored bytes plus an `EsiData` map describing how to deliver them —
//! literal spans of the stored body interleaved with includes. Delivery
//! walks the map; the raw body (markup and all) stays serveable for
//! sessions that have ESI disabled.
//!
//! Recognized markup: `<esi:include src="..."/>`, `<esi:remove>...
//! </esi:remove>`, and the `<!--esi ...-->` unwrap. Other `esi:` elements
//! are dropped.

use bytes::{buf::Writer, BufMut, Bytes, BytesMut};
use flate2::write::GzDecoder;
use std::io::Write;

use crate::Error;

/// Includes deeper than this are delivered as empty segments.
pub const MAX_ESI_DEPTH: u32 = 5;

/// Delivery map for an object that was scanned for includes.
#[derive(Debug, Clone, Default)]
pub struct EsiData {
    pub segments: Vec<EsiSeg>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EsiSeg {
    /// A span of the stored body, delivered verbatim.
    Literal { off: usize, len: usize },
    /// A sub-request, delivered in place at `esi_level + 1`.
    Include { src: String },
}

impl EsiData {
    pub fn include_count(&self) -> usize {
        self.segments
            .iter()
            .filter(|seg| matches!(seg, EsiSeg::Include { .. }))
            .count()
    }
}

/// Accumulating scanner; see module docs.
pub struct EsiScanner {
    gunzip: Option<Box<GzDecoder<Writer<BytesMut>>>>,
    buf: BytesMut,
}

impl EsiScanner {
    pub fn new(input_is_gzip: bool) -> Self {
        EsiScanner {
            gunzip: input_is_gzip
                .then(|| Box::new(GzDecoder::new(BytesMut::new().writer()))),
            buf: BytesMut::new(),
        }
    }

    pub fn push(&mut self, chunk: &[u8]) -> Result<(), Error> {
        match &mut self.gunzip {
            Some(decoder) => {
                decoder
                    .write_all(chunk)
                    .and_then(|()| decoder.flush())
                    .map_err(|e| Error::Gzip(e.to_string()))?;
                let plain = decoder.get_mut().get_mut().split();
                self.buf.extend_from_slice(&plain);
            }
            None => self.buf.extend_from_slice(chunk),
        }
        Ok(())
    }

    /// End of input: flush the decoder and parse the whole body.
    pub fn finish(mut self) -> Result<(Bytes, EsiData), Error> {
        if let Some(mut decoder) = self.gunzip.take() {
            decoder
                .try_finish()
                .map_err(|e| Error::Gzip(e.to_string()))?;
            let plain = decoder.get_mut().get_mut().split();
            self.buf.extend_from_slice(&plain);
        }
        let body = self.buf.freeze();
        let data = parse(&body);
        Ok((body, data))
    }
}

fn find(haystack: &[u8], from: usize, needle: &[u8]) -> Option<usize> {
    if from >= haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

fn parse(body: &[u8]) -> EsiData {
    let mut segments = Vec::new();
    let mut lit_start = 0usize;
    let mut i = 0usize;

    let mut flush_literal = |segments: &mut Vec<EsiSeg>, lit_start: usize, end: usize| {
        if end > lit_start {
            segments.push(EsiSeg::Literal {
                off: lit_start,
                len: end - lit_start,
            });
        }
    };

    while let Some(pos) = find(body, i, b"<") {
        let rest = &body[pos..];
        if rest.starts_with(b"<esi:include") {
            flush_literal(&mut segments, lit_start, pos);
            let tag_end = match find(body, pos, b">") {
                Some(e) => e,
                None => {
                    // Truncated markup: keep the tail verbatim.
                    lit_start = pos;
                    break;
                }
            };
            if let Some(src) = attr_value(&body[pos..tag_end], b"src") {
                segments.push(EsiSeg::Include { src });
            }
            i = tag_end + 1;
            // Tolerate the non-empty-element form.
            if body[i..].starts_with(b"</esi:include>") {
                i += b"</esi:include>".len();
            }
            lit_start = i;
        } else if rest.starts_with(b"<esi:remove") {
            flush_literal(&mut segments, lit_start, pos);
            i = match find(body, pos, b"</esi:remove>") {
                Some(e) => e + b"</esi:remove>".len(),
                None => body.len(),
            };
            lit_start = i;
        } else if rest.starts_with(b"<esi:") {
            // Unknown element: drop it whole.
            flush_literal(&mut segments, lit_start, pos);
            i = match find(body, pos, b">") {
                Some(e) => e + 1,
                None => body.len(),
            };
            lit_start = i;
        } else if rest.starts_with(b"<!--esi") {
            // Unwrap: both markers go, the wrapped content is scanned for
            // markup of its own.
            flush_literal(&mut segments, lit_start, pos);
            let mut inner_start = pos + b"<!--esi".len();
            if body.get(inner_start) == Some(&b' ') {
                inner_start += 1;
            }
            let (inner_end, next) = match find(body, inner_start, b"-->") {
                Some(close) => (close, close + b"-->".len()),
                None => (body.len(), body.len()),
            };
            for seg in parse(&body[inner_start..inner_end]).segments {
                segments.push(match seg {
                    EsiSeg::Literal { off, len } => EsiSeg::Literal {
                        off: off + inner_start,
                        len,
                    },
                    include => include,
                });
            }
            i = next;
            lit_start = i;
        } else {
            i = pos + 1;
        }
    }
    flush_literal(&mut segments, lit_start, body.len());
    EsiData { segments }
}

fn attr_value(tag: &[u8], name: &[u8]) -> Option<String> {
    let mut i = find(tag, 0, name)?;
    i += name.len();
    while tag.get(i) == Some(&b' ') {
        i += 1;
    }
    if tag.get(i) != Some(&b'=') {
        return None;
    }
    i += 1;
    while tag.get(i) == Some(&b' ') {
        i += 1;
    }
    let (value, _) = match tag.get(i) {
        Some(&q @ (b'"' | b'\'')) => {
            let start = i + 1;
            let end = find(tag, start, &[q])?;
            (&tag[start..end], end + 1)
        }
        Some(_) => {
            let start = i;
            let end = tag[start..]
                .iter()
                .position(|&b| b == b' ' || b == b'/' || b == b'>')
                .map(|p| p + start)
                .unwrap_or(tag.len());
            (&tag[start..end], end)
        }
        None => return None,
    };
    std::str::from_utf8(value).ok().map(str::to_owned)
}

//! Body transforms.
//!
//! A `Vfp` sits between the backend body and the stored object: every chunk
//! pulled from the backend is pushed through the transform, and what comes
//! out is what gets stored (and, when streaming, delivered). Exactly one
//! transform is selected per fetch.

use bytes::{buf::Writer, BufMut, Bytes, BytesMut};
use flate2::{
    write::{GzDecoder, GzEncoder},
    Compression,
};
use std::io::Write;

use crate::{esi::EsiScanner, Error};

/// Which transform FetchBody selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VfpKind {
    /// Store the bytes as they arrive.
    #[default]
    Identity,
    /// Compress an identity body before storing.
    Gzip,
    /// Decompress a gzip body before storing.
    Gunzip,
    /// Store the gzip bytes verbatim, but run them through the decoder to
    /// verify integrity.
    TestGzip,
    /// Parse for edge-side includes; supersedes the gzip transforms.
    Esi,
}

type DecoderState = Box<GzDecoder<Writer<BytesMut>>>;
type EncoderState = Box<GzEncoder<Writer<BytesMut>>>;

/// What `finish` hands back: trailing output plus the include map when the
/// transform was ESI.
#[derive(Debug, Default)]
pub struct VfpDone {
    pub tail: Bytes,
    pub esidata: Option<crate::esi::EsiData>,
}

pub enum Vfp {
    Identity,
    Gzip(EncoderState),
    Gunzip(DecoderState),
    TestGzip(DecoderState),
    Esi(EsiScanner),
}

impl std::fmt::Debug for Vfp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Vfp::Identity => "identity",
            Vfp::Gzip(_) => "gzip",
            Vfp::Gunzip(_) => "gunzip",
            Vfp::TestGzip(_) => "testgzip",
            Vfp::Esi(_) => "esi",
        };
        f.write_str(name)
    }
}

impl Vfp {
    /// Instantiate the selected transform. `input_is_gzip` tells the ESI
    /// scanner whether it must decompress before scanning.
    pub fn new(kind: VfpKind, gzip_level: u32, input_is_gzip: bool) -> Self {
        match kind {
            VfpKind::Identity => Vfp::Identity,
            VfpKind::Gzip => Vfp::Gzip(Box::new(GzEncoder::new(
                BytesMut::new().writer(),
                Compression::new(gzip_level),
            ))),
            VfpKind::Gunzip => Vfp::Gunzip(new_decoder()),
            VfpKind::TestGzip => Vfp::TestGzip(new_decoder()),
            VfpKind::Esi => Vfp::Esi(EsiScanner::new(input_is_gzip)),
        }
    }

    /// Feed one backend chunk through, returning the bytes to store. Empty
    /// output is normal (gzip headers, buffered ESI input).
    pub fn push(&mut self, chunk: &[u8]) -> Result<Bytes, Error> {
        match self {
            Vfp::Identity => Ok(Bytes::copy_from_slice(chunk)),
            Vfp::Gzip(encoder) => {
                encoder
                    .write_all(chunk)
                    .and_then(|()| encoder.flush())
                    .map_err(|e| Error::Gzip(e.to_string()))?;
                Ok(encoder.get_mut().get_mut().split().freeze())
            }
            Vfp::Gunzip(decoder) => {
                decoder
                    .write_all(chunk)
                    .and_then(|()| decoder.flush())
                    .map_err(|e| Error::Gzip(e.to_string()))?;
                Ok(decoder.get_mut().get_mut().split().freeze())
            }
            Vfp::TestGzip(decoder) => {
                decoder
                    .write_all(chunk)
                    .and_then(|()| decoder.flush())
                    .map_err(|e| Error::Gzip(e.to_string()))?;
                // Verification only; the stored body keeps the gzip bytes.
                decoder.get_mut().get_mut().clear();
                Ok(Bytes::copy_from_slice(chunk))
            }
            Vfp::Esi(scanner) => {
                scanner.push(chunk)?;
                Ok(Bytes::new())
            }
        }
    }

    /// End of backend body: flush the transform.
    pub fn finish(self) -> Result<VfpDone, Error> {
        match self {
            Vfp::Identity => Ok(VfpDone::default()),
            Vfp::Gzip(encoder) => {
                let writer = encoder
                    .finish()
                    .map_err(|e| Error::Gzip(e.to_string()))?;
                Ok(VfpDone {
                    tail: writer.into_inner().freeze(),
                    esidata: None,
                })
            }
            Vfp::Gunzip(mut decoder) => {
                decoder
                    .try_finish()
                    .map_err(|e| Error::Gzip(e.to_string()))?;
                Ok(VfpDone {
                    tail: decoder.get_mut().get_mut().split().freeze(),
                    esidata: None,
                })
            }
            Vfp::TestGzip(mut decoder) => {
                decoder
                    .try_finish()
                    .map_err(|e| Error::Gzip(e.to_string()))?;
                Ok(VfpDone::default())
            }
            Vfp::Esi(scanner) => {
                let (body, esidata) = scanner.finish()?;
                Ok(VfpDone {
                    tail: body,
                    esidata: Some(esidata),
                })
            }
        }
    }
}

fn new_decoder() -> DecoderState {
    Box::new(GzDecoder::new(BytesMut::new().writer()))
}

//! Negotiates and applies per-message compression via `grpc-encoding` /
//! `grpc-accept-encoding` (§4.8), reduced to the encodings this runtime
//! ships (`identity`, `gzip`) and operating on raw framed bytes rather than
//! a typed `Encoder`/`Decoder` pair, since message serialization itself is
//! external to this crate.

use super::{CallContext, Filter};
use crate::status::{Code, Status};
use async_trait::async_trait;
use std::io::{Read, Write};

const ENCODING_HEADER: &str = "grpc-encoding";
const ACCEPT_ENCODING_HEADER: &str = "grpc-accept-encoding";

/// A compression algorithm this runtime can apply to an individual
/// message body. `Identity` is always implicitly accepted and never
/// listed on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompressionEncoding {
    #[cfg(feature = "gzip")]
    Gzip,
}

impl CompressionEncoding {
    fn as_str(self) -> &'static str {
        match self {
            #[cfg(feature = "gzip")]
            CompressionEncoding::Gzip => "gzip",
        }
    }

    pub(crate) fn from_str(s: &str) -> Option<Self> {
        match s {
            #[cfg(feature = "gzip")]
            "gzip" => Some(CompressionEncoding::Gzip),
            _ => None,
        }
    }
}

/// The filter installed at call-start time: advertises this channel's
/// accepted encodings and, if a send encoding was configured, marks the
/// outgoing message stream as compressed.
pub struct CompressionFilter {
    send_encoding: Option<CompressionEncoding>,
    accept_encodings: Vec<CompressionEncoding>,
}

impl CompressionFilter {
    pub fn new(send_encoding: Option<CompressionEncoding>) -> Self {
        let accept_encodings = {
            #[cfg(feature = "gzip")]
            {
                vec![CompressionEncoding::Gzip]
            }
            #[cfg(not(feature = "gzip"))]
            {
                Vec::new()
            }
        };
        Self {
            send_encoding,
            accept_encodings,
        }
    }

    fn accept_encoding_header(&self) -> String {
        let mut parts: Vec<&str> = self.accept_encodings.iter().map(|e| e.as_str()).collect();
        parts.push("identity");
        parts.join(",")
    }
}

impl Default for CompressionFilter {
    fn default() -> Self {
        Self::new(None)
    }
}

#[async_trait]
impl Filter for CompressionFilter {
    async fn on_start_call(&self, ctx: &mut CallContext) -> Result<(), Status> {
        if let Some(encoding) = self.send_encoding {
            ctx.request.headers_mut().insert(
                ENCODING_HEADER,
                http::HeaderValue::from_static(encoding.as_str()),
            );
        }
        if !self.accept_encodings.is_empty() {
            let value = self.accept_encoding_header();
            ctx.request.headers_mut().insert(
                ACCEPT_ENCODING_HEADER,
                http::HeaderValue::from_str(&value)
                    .map_err(|e| Status::new(Code::Internal, e.to_string()))?,
            );
        }
        Ok(())
    }
}

/// Reads `grpc-encoding` off a response header/trailer map and reports
/// whether this runtime can decompress it; `Ok(None)` means identity (no
/// compression to undo).
pub(crate) fn negotiate_response_encoding(
    headers: &http::HeaderMap,
) -> Result<Option<CompressionEncoding>, Status> {
    let Some(value) = headers.get(ENCODING_HEADER) else {
        return Ok(None);
    };
    let value = value.to_str().unwrap_or_default();
    if value == "identity" {
        return Ok(None);
    }
    CompressionEncoding::from_str(value).map(Some).ok_or_else(|| {
        Status::new(
            Code::Unimplemented,
            format!("unsupported grpc-encoding: {value}"),
        )
    })
}

pub(crate) fn decompress(encoding: CompressionEncoding, payload: &[u8]) -> Result<Vec<u8>, Status> {
    match encoding {
        #[cfg(feature = "gzip")]
        CompressionEncoding::Gzip => {
            let mut out = Vec::new();
            flate2::read::GzDecoder::new(payload)
                .read_to_end(&mut out)
                .map_err(|e| Status::new(Code::Internal, format!("gzip decompress failed: {e}")))?;
            Ok(out)
        }
        #[cfg(not(feature = "gzip"))]
        #[allow(unreachable_patterns)]
        _ => Err(Status::new(Code::Internal, "no compressors enabled")),
    }
}

pub(crate) fn compress(encoding: CompressionEncoding, payload: &[u8]) -> Result<Vec<u8>, Status> {
    match encoding {
        #[cfg(feature = "gzip")]
        CompressionEncoding::Gzip => {
            let mut encoder =
                flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder
                .write_all(payload)
                .map_err(|e| Status::new(Code::Internal, format!("gzip compress failed: {e}")))?;
            encoder
                .finish()
                .map_err(|e| Status::new(Code::Internal, format!("gzip compress failed: {e}")))
        }
        #[cfg(not(feature = "gzip"))]
        #[allow(unreachable_patterns)]
        _ => Err(Status::new(Code::Internal, "no compressors enabled")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sets_accept_encoding_header() {
        let filter = CompressionFilter::default();
        let mut ctx = CallContext {
            request: http::Request::new(()),
            service: "Echo".into(),
            method: "/Echo/Say".into(),
            wait_for_ready: false,
            deadline: None,
            metadata: crate::metadata::MetadataMap::new(),
        };
        filter.on_start_call(&mut ctx).await.unwrap();
        #[cfg(feature = "gzip")]
        assert_eq!(
            ctx.request.headers().get(ACCEPT_ENCODING_HEADER).unwrap(),
            "gzip,identity"
        );
    }

    #[test]
    fn identity_response_encoding_is_none() {
        let mut headers = http::HeaderMap::new();
        headers.insert(ENCODING_HEADER, http::HeaderValue::from_static("identity"));
        assert!(negotiate_response_encoding(&headers).unwrap().is_none());
    }

    #[test]
    fn unknown_response_encoding_is_unimplemented() {
        let mut headers = http::HeaderMap::new();
        headers.insert(ENCODING_HEADER, http::HeaderValue::from_static("brotli"));
        let err = negotiate_response_encoding(&headers).unwrap_err();
        assert_eq!(err.code(), Code::Unimplemented);
    }

    #[cfg(feature = "gzip")]
    #[test]
    fn gzip_round_trips() {
        let payload = b"hello world, this is a test payload for gzip";
        let compressed = compress(CompressionEncoding::Gzip, payload).unwrap();
        let decompressed = decompress(CompressionEncoding::Gzip, &compressed).unwrap();
        assert_eq!(decompressed, payload);
    }
}

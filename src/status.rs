//! The gRPC [`Status`] and [`Code`] taxonomy (§3, §7).

use crate::metadata::MetadataMap;
use http::HeaderValue;
use percent_encoding::{percent_decode_str, percent_encode, NON_ALPHANUMERIC};
use std::{error::Error as StdError, fmt};
use tracing::warn;

const GRPC_STATUS_HEADER: &str = "grpc-status";
const GRPC_MESSAGE_HEADER: &str = "grpc-message";

/// The outcome of an RPC call: `{code, details, metadata}` per §3.
#[derive(Clone)]
pub struct Status {
    code: Code,
    message: String,
    metadata: MetadataMap,
}

/// The standard gRPC status code enumeration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum Code {
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

impl Status {
    /// Create a new `Status` with the given code and message.
    pub fn new(code: Code, message: impl Into<String>) -> Status {
        Status {
            code,
            message: message.into(),
            metadata: MetadataMap::new(),
        }
    }

    pub fn ok(message: impl Into<String>) -> Status {
        Status::new(Code::Ok, message)
    }

    pub fn code(&self) -> Code {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn metadata(&self) -> &MetadataMap {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut MetadataMap {
        &mut self.metadata
    }

    pub fn with_metadata(mut self, metadata: MetadataMap) -> Self {
        self.metadata = metadata;
        self
    }

    /// §4.9, §7: recover an embedded `Status` by downcast-chaining through
    /// an error's `source()` links, and otherwise classify by known
    /// transport error types (h2 stream resets/GOAWAY). Falls back to
    /// `Code::Unknown`.
    pub fn from_error(err: &(dyn StdError + 'static)) -> Status {
        Self::try_from_error(err).unwrap_or_else(|| Status::new(Code::Unknown, err.to_string()))
    }

    fn try_from_error(err: &(dyn StdError + 'static)) -> Option<Status> {
        let mut cause = Some(err);
        while let Some(err) = cause {
            if let Some(status) = err.downcast_ref::<Status>() {
                return Some(status.clone());
            }
            if let Some(h2_err) = err.downcast_ref::<h2::Error>() {
                return Some(Status::from_h2_error(h2_err));
            }
            cause = err.source();
        }
        None
    }

    /// RST_STREAM / GOAWAY error code mapping from §4.9 / §8.
    fn from_h2_error(err: &h2::Error) -> Status {
        let code = match err.reason() {
            Some(h2::Reason::REFUSED_STREAM) => Code::Unavailable,
            Some(h2::Reason::CANCEL) => Code::Cancelled,
            Some(h2::Reason::ENHANCE_YOUR_CALM) => Code::ResourceExhausted,
            Some(h2::Reason::INADEQUATE_SECURITY) => Code::PermissionDenied,
            _ => Code::Internal,
        };
        Status::new(code, format!("h2 protocol error: {err}"))
    }

    /// §4.9: status mapping from an HTTP `:status` when no `grpc-status`
    /// trailer was received.
    pub fn from_http_status(status: http::StatusCode) -> Status {
        let code = match status.as_u16() {
            400 => Code::Internal,
            401 => Code::Unauthenticated,
            403 => Code::PermissionDenied,
            404 => Code::Unimplemented,
            429 | 502 | 503 | 504 => Code::Unavailable,
            _ => Code::Unknown,
        };
        Status::new(code, format!("unmapped http status: {status}"))
    }

    /// Parse a `grpc-status` (+ optional `grpc-message`) pair out of a
    /// header/trailer map, if present.
    pub fn from_header_map(headers: &http::HeaderMap) -> Option<Status> {
        let code = headers.get(GRPC_STATUS_HEADER)?;
        let code = Code::from_bytes(code.as_bytes());
        let message = headers
            .get(GRPC_MESSAGE_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|v| percent_decode_str(v).decode_utf8_lossy().into_owned())
            .unwrap_or_default();
        Some(Status::new(code, message))
    }

    /// Render `grpc-status` + `grpc-message` trailers for this status.
    pub fn to_header_map(&self) -> http::HeaderMap {
        let mut map = http::HeaderMap::with_capacity(2);
        map.insert(GRPC_STATUS_HEADER, self.code.to_header_value());
        if !self.message.is_empty() {
            let needs_encoding = !self.message.is_ascii();
            let value = if needs_encoding {
                percent_encode(self.message.as_bytes(), NON_ALPHANUMERIC).to_string()
            } else {
                self.message.clone()
            };
            if let Ok(header) = HeaderValue::from_str(&value) {
                map.insert(GRPC_MESSAGE_HEADER, header);
            } else {
                warn!("dropping non-encodable grpc-message");
            }
        }
        map
    }
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builder = f.debug_struct("Status");
        builder.field("code", &self.code);
        if !self.message.is_empty() {
            builder.field("message", &self.message);
        }
        builder.finish()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "status: {:?}, message: {:?}", self.code, self.message)
    }
}

impl StdError for Status {}

impl Code {
    pub(crate) fn from_bytes(bytes: &[u8]) -> Code {
        match bytes {
            b"0" => Code::Ok,
            b"1" => Code::Cancelled,
            b"2" => Code::Unknown,
            b"3" => Code::InvalidArgument,
            b"4" => Code::DeadlineExceeded,
            b"5" => Code::NotFound,
            b"6" => Code::AlreadyExists,
            b"7" => Code::PermissionDenied,
            b"8" => Code::ResourceExhausted,
            b"9" => Code::FailedPrecondition,
            b"10" => Code::Aborted,
            b"11" => Code::OutOfRange,
            b"12" => Code::Unimplemented,
            b"13" => Code::Internal,
            b"14" => Code::Unavailable,
            b"15" => Code::DataLoss,
            b"16" => Code::Unauthenticated,
            _ => Code::Unknown,
        }
    }

    fn to_header_value(self) -> HeaderValue {
        HeaderValue::from_static(match self {
            Code::Ok => "0",
            Code::Cancelled => "1",
            Code::Unknown => "2",
            Code::InvalidArgument => "3",
            Code::DeadlineExceeded => "4",
            Code::NotFound => "5",
            Code::AlreadyExists => "6",
            Code::PermissionDenied => "7",
            Code::ResourceExhausted => "8",
            Code::FailedPrecondition => "9",
            Code::Aborted => "10",
            Code::OutOfRange => "11",
            Code::Unimplemented => "12",
            Code::Internal => "13",
            Code::Unavailable => "14",
            Code::DataLoss => "15",
            Code::Unauthenticated => "16",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_404_without_grpc_status_maps_to_unimplemented() {
        let status = Status::from_http_status(http::StatusCode::NOT_FOUND);
        assert_eq!(status.code(), Code::Unimplemented);
    }

    #[test]
    fn rst_stream_reasons_map_per_table() {
        assert_eq!(
            Status::from_h2_error(&h2::Reason::REFUSED_STREAM.into()).code(),
            Code::Unavailable
        );
        assert_eq!(
            Status::from_h2_error(&h2::Reason::CANCEL.into()).code(),
            Code::Cancelled
        );
        assert_eq!(
            Status::from_h2_error(&h2::Reason::ENHANCE_YOUR_CALM.into()).code(),
            Code::ResourceExhausted
        );
        assert_eq!(
            Status::from_h2_error(&h2::Reason::INADEQUATE_SECURITY.into()).code(),
            Code::PermissionDenied
        );
        assert_eq!(
            Status::from_h2_error(&h2::Reason::PROTOCOL_ERROR.into()).code(),
            Code::Internal
        );
    }

    #[test]
    fn header_round_trip_preserves_code_and_message() {
        let status = Status::new(Code::NotFound, "no such method");
        let headers = status.to_header_map();
        let parsed = Status::from_header_map(&headers).unwrap();
        assert_eq!(parsed.code(), Code::NotFound);
        assert_eq!(parsed.message(), "no such method");
    }

    #[test]
    fn from_error_recovers_status_through_source_chain() {
        #[derive(Debug)]
        struct Wrapper(Status);
        impl fmt::Display for Wrapper {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "wrapped")
            }
        }
        impl StdError for Wrapper {
            fn source(&self) -> Option<&(dyn StdError + 'static)> {
                Some(&self.0)
            }
        }

        let wrapped = Wrapper(Status::new(Code::Unavailable, "down"));
        let status = Status::from_error(&wrapped);
        assert_eq!(status.code(), Code::Unavailable);
    }
}

//! The crate's internal/transport error type.
//!
//! This is distinct from [`crate::Status`]: `Error` covers failures below
//! the RPC layer (connect failures, DNS failures, filter failures),
//! `Status` covers the outcome of a call. A `Status` that originated deep
//! in a source chain can still be recovered through [`crate::Status::from_error`].

use std::{error, fmt};

/// A boxed, type-erased source error, as produced by connectors, resolvers
/// and other external collaborators.
pub type Source = Box<dyn error::Error + Send + Sync + 'static>;

/// Coarse classification of where an [`Error`] originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Failed to parse or otherwise establish a channel's target.
    Target,
    /// A DNS or other name resolution failure.
    Resolve,
    /// A transport-level connect/handshake failure.
    Connect,
    /// A filter in the [`crate::filters`] stack failed.
    Filter,
    /// The channel has been closed.
    ChannelClosed,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Target => "invalid target",
            ErrorKind::Resolve => "name resolution failed",
            ErrorKind::Connect => "transport connect failed",
            ErrorKind::Filter => "filter failed",
            ErrorKind::ChannelClosed => "channel is closed",
        };
        f.write_str(s)
    }
}

/// An error originating below the RPC layer.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    source: Option<Source>,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind) -> Self {
        Self { kind, source: None }
    }

    pub(crate) fn from_source(kind: ErrorKind, source: impl Into<Source>) -> Self {
        Self {
            kind,
            source: Some(source.into()),
        }
    }

    /// Construct from a plain message, for collaborators (DNS, parsers)
    /// that don't produce a typed `std::error::Error`.
    pub(crate) fn msg(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::from_source(kind, Message(message.into()))
    }

    /// The coarse category this error falls under.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(source) => write!(f, "{}: {}", self.kind, source),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        self.source.as_deref().map(|e| e as _)
    }
}

#[derive(Debug)]
struct Message(String);

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl error::Error for Message {}

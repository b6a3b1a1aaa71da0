//! The external HTTP/2 wire implementation, behind a narrow `Connector`
//! contract -- the Subchannel state machine never parses frames itself,
//! only drives the `h2` crate's handshake and stream API through this
//! seam, generalized from a single hyper-backed connection into the
//! pluggable per-subchannel connector this runtime needs.

mod connector;

pub use connector::{
    ping_pong_roundtrip, CloseReason, Connector, DefaultConnector, HyperTransport, RequestSender, Transport,
};

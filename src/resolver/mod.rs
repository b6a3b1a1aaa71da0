//! The `Resolver` contract: turns an opaque [`crate::target::Target`] into
//! a lazily-produced, possibly-repeating stream of address lists and
//! optional service config, delivered to a `Listener` rather than
//! returned, since re-resolution can happen at any time (DNS TTL expiry,
//! an explicit `refresh`, a load balancer asking for it after going
//! TRANSIENT_FAILURE).
//!
//! A `DynamicServiceStream` wrapping an `mpsc::Receiver` of `Change` events
//! behind `tower::discover::Discover` is the closest analogue elsewhere;
//! this generalizes that single "endpoint changed" event into a full
//! resolution (addresses + config) and adds the explicit
//! start/refresh/shutdown lifecycle a pluggable resolver needs.

#[cfg(feature = "dns")]
mod dns;
mod r#static;

#[cfg(feature = "dns")]
pub use dns::DnsResolver;
pub use r#static::StaticResolver;

use crate::service_config::ServiceConfig;
use crate::status::Status;
use std::net::IpAddr;

/// One backend address as handed to a load balancer: an `ip:port` (or
/// `[ip]:port`) pair plus opaque per-address attributes a policy may
/// attach (weight, locality, ...), which this runtime does not interpret
/// itself.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Address {
    pub ip: IpAddr,
    pub port: u16,
}

impl Address {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    pub fn to_wire_string(&self) -> String {
        crate::target::format_address(&self.ip, self.port)
    }
}

/// A completed resolution: the address list plus whatever service config
/// accompanied it. A resolver may deliver an update with an empty address
/// list (valid) or fail altogether, which is reported separately via
/// `Listener::on_error`.
///
/// `service_config` and `service_config_error` are mutually exclusive
/// (§4.2 step 7, §4.6): a resolution can succeed on addresses while still
/// failing to produce a usable config, in which case `service_config` is
/// `None` and `service_config_error` carries why.
#[derive(Clone, Debug, Default)]
pub struct ResolutionResult {
    pub addresses: Vec<Address>,
    pub service_config: Option<ServiceConfig>,
    pub service_config_error: Option<Status>,
}

/// Callbacks a resolver invokes as resolutions complete or fail. A
/// `ResolvingLoadBalancer` implements this to drive its inner load
/// balancer and service-config selection.
pub trait Listener: Send + Sync {
    fn on_result(&self, result: ResolutionResult);
    /// A resolution attempt failed (unreachable name servers, NXDOMAIN,
    /// ...); the channel keeps its last good addresses, if any, and the
    /// resolver is expected to keep retrying on its own schedule.
    fn on_error(&self, status: Status);
}

/// Produces address/service-config updates for one target. `start` and
/// `refresh` are both idempotent no-ops once the resolver has shut down;
/// `refresh` before the first `start` behaves like `start`.
pub trait Resolver: Send + Sync {
    /// Begins resolution, delivering results to `listener` asynchronously.
    /// Calling `start` more than once on an already-started resolver is a
    /// no-op -- it does not restart resolution or re-deliver a cached
    /// result.
    fn start(&self, listener: std::sync::Arc<dyn Listener>);

    /// Requests an out-of-band re-resolution (e.g. because a subchannel
    /// went TRANSIENT_FAILURE). Resolvers that have no notion of staleness
    /// may treat this the same as waiting for their normal schedule.
    fn refresh(&self);

    fn shutdown(&self);
}

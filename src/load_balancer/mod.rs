//! The pluggable load balancing seam: a `LoadBalancer` consumes address
//! list updates and produces `Picker`s, pure functions from "pick a
//! subchannel for this call" to a `PickResult`, published to the channel
//! through a `ChannelControlHelper`.
//!
//! A discovery stream feeding a balancing policy that in turn publishes a
//! picker, generalized into an explicit trait two concrete policies
//! (`pick_first`, `round_robin`) implement, rather than `tower::discover`'s
//! fixed `Discover` + `p2c::Balance` pairing.

mod pick_first;
mod round_robin;

pub use pick_first::PickFirst;
pub use round_robin::RoundRobin;

use crate::connectivity::{ConnectivityState, PickResult};
use crate::credentials::ConnectionOptions;
use crate::resolver::Address;
use crate::subchannel::{KeepaliveConfig, Subchannel};
use crate::subchannel_pool::SubchannelKey;
use crate::transport::Connector;
use std::sync::Arc;

/// A pure function from call metadata to a routing decision. Produced
/// fresh by the `LoadBalancer` every time its backing subchannel states
/// change, and immutable for its lifetime -- it must not itself perform
/// I/O or mutate shared state, only inspect what it closed over at
/// construction.
pub trait Picker: Send + Sync {
    fn pick(&self) -> PickResult;
}

/// A `Picker` that always queues -- the correct picker while a
/// `LoadBalancer` has no READY subchannel and is still in CONNECTING or
/// IDLE.
pub struct QueuingPicker;

impl Picker for QueuingPicker {
    fn pick(&self) -> PickResult {
        PickResult::Queue
    }
}

/// A `Picker` that always fails with the given status -- the correct
/// picker once every subchannel has entered TRANSIENT_FAILURE.
pub struct FailingPicker(pub crate::status::Status);

impl Picker for FailingPicker {
    fn pick(&self) -> PickResult {
        PickResult::TransientFailure(self.0.clone())
    }
}

/// The subset of channel functionality a `LoadBalancer` is allowed to
/// touch: creating/discarding subchannels and publishing new pickers. Kept
/// separate from the full `Channel` type so load balancer implementations
/// cannot reach into call dispatch or filters.
pub trait ChannelControlHelper: Send + Sync {
    fn create_subchannel(
        &self,
        address: Address,
        connection_options: ConnectionOptions,
        keepalive: KeepaliveConfig,
    ) -> Subchannel;

    /// Publishes a new aggregate connectivity state and picker. Called
    /// every time either changes so the channel can wake queued calls.
    fn update_state(&self, state: ConnectivityState, picker: Arc<dyn Picker>);

    fn connector(&self) -> Arc<dyn Connector>;

    /// Publishes the service config now in effect (§4.6), so the channel
    /// can apply its `methodConfig` defaults to new calls. Only the
    /// top-level channel helper needs this; a `LoadBalancer`'s own child
    /// helper forwards everything else but never calls it, so the default
    /// no-op covers that case.
    fn update_service_config(&self, _config: Option<crate::service_config::ServiceConfig>) {}
}

/// The policy contract itself: given a fresh address list (and opaque
/// policy config), manage subchannels and publish pickers through the
/// `ChannelControlHelper` it was constructed with.
pub trait LoadBalancer: Send + Sync {
    /// A new address list arrived from the resolver (possibly identical to
    /// the last one, in which case implementations are expected to no-op
    /// rather than reconnect everything).
    fn update_address_list(&self, addresses: Vec<Address>);

    /// Asks any IDLE subchannels to connect immediately, e.g. because a
    /// queued call needs somewhere to go.
    fn exit_idle(&self);

    /// Clears backoff state on every owned subchannel, e.g. because the
    /// resolver just produced a fresh address list after TRANSIENT_FAILURE.
    fn reset_backoff(&self);

    /// Releases every subchannel this policy owns. No further calls are
    /// made after this.
    fn destroy(&self);
}

/// Folds a set of per-subchannel states into one aggregate connectivity
/// state, per the usual precedence: any READY wins outright; otherwise any
/// CONNECTING; otherwise any IDLE; otherwise (all TRANSIENT_FAILURE, or the
/// set is empty) TRANSIENT_FAILURE.
pub fn aggregate_state(states: impl IntoIterator<Item = ConnectivityState>) -> ConnectivityState {
    let mut any_connecting = false;
    let mut any_idle = false;
    let mut any = false;

    for state in states {
        any = true;
        match state {
            ConnectivityState::Ready => return ConnectivityState::Ready,
            ConnectivityState::Connecting => any_connecting = true,
            ConnectivityState::Idle => any_idle = true,
            ConnectivityState::TransientFailure | ConnectivityState::Shutdown => {}
        }
    }

    if any_connecting {
        ConnectivityState::Connecting
    } else if any_idle {
        ConnectivityState::Idle
    } else if any {
        ConnectivityState::TransientFailure
    } else {
        ConnectivityState::TransientFailure
    }
}

pub(crate) fn subchannel_key(channel_target: &str, address: &Address, credentials_identity: &str) -> SubchannelKey {
    SubchannelKey {
        channel_target: channel_target.to_string(),
        address: address.to_wire_string(),
        options: String::new(),
        credentials_identity: credentials_identity.to_string(),
    }
}

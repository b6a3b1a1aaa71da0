//! §3 `ConnectivityState` and `PickResult`.

use crate::{status::Status, subchannel::Subchannel};
use std::fmt;

/// One of {IDLE, CONNECTING, READY, TRANSIENT_FAILURE, SHUTDOWN} (§3).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectivityState {
    Idle,
    Connecting,
    Ready,
    TransientFailure,
    Shutdown,
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectivityState::Idle => "IDLE",
            ConnectivityState::Connecting => "CONNECTING",
            ConnectivityState::Ready => "READY",
            ConnectivityState::TransientFailure => "TRANSIENT_FAILURE",
            ConnectivityState::Shutdown => "SHUTDOWN",
        };
        f.write_str(s)
    }
}

/// The outcome of asking a [`crate::load_balancer::Picker`] to route a call
/// (§3). A pure, side-effect-free sum type (§8).
#[derive(Clone)]
pub enum PickResult {
    /// Route the call to this subchannel, or drop it if `None` ("COMPLETE
    /// with subchannel = null" per §4.7).
    Complete(Option<Subchannel>),
    /// Hold the call until the next picker update.
    Queue,
    /// Fail the call immediately, unless it is `waitForReady`.
    TransientFailure(Status),
}

impl fmt::Debug for PickResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PickResult::Complete(Some(sc)) => write!(f, "Complete({:?})", sc.address()),
            PickResult::Complete(None) => write!(f, "Complete(drop)"),
            PickResult::Queue => write!(f, "Queue"),
            PickResult::TransientFailure(s) => write!(f, "TransientFailure({:?})", s.code()),
        }
    }
}

//! Distributes calls across every READY subchannel in turn, connecting to
//! every address in the list concurrently rather than one at a time like
//! `pick_first`.

use super::{aggregate_state, ChannelControlHelper, PickResult, Picker};
use crate::connectivity::ConnectivityState;
use crate::credentials::ConnectionOptions;
use crate::resolver::Address;
use crate::subchannel::{KeepaliveConfig, Subchannel};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};
use tracing::debug;

struct RoundRobinPicker {
    ready: Vec<Subchannel>,
    next: AtomicUsize,
}

impl Picker for RoundRobinPicker {
    fn pick(&self) -> PickResult {
        if self.ready.is_empty() {
            return PickResult::Queue;
        }
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.ready.len();
        PickResult::Complete(Some(self.ready[i].clone()))
    }
}

struct Entry {
    address: Address,
    subchannel: Subchannel,
    state: ConnectivityState,
    listener_id: u64,
}

struct State {
    entries: Vec<Entry>,
    /// Bumped on every address-list update; listener closures capture the
    /// generation they were attached under and drop callbacks that arrive
    /// after their entry was removed by a later update.
    generation: u64,
}

/// `round_robin`: every address in the most recent list gets its own
/// subchannel, connected concurrently; the published picker cycles through
/// whichever subset is currently READY.
pub struct RoundRobin {
    helper: Arc<dyn ChannelControlHelper>,
    state: Mutex<State>,
}

impl RoundRobin {
    pub fn new(helper: Arc<dyn ChannelControlHelper>) -> Arc<Self> {
        Arc::new(Self {
            helper,
            state: Mutex::new(State {
                entries: Vec::new(),
                generation: 0,
            }),
        })
    }

    fn republish(&self) {
        let state = self.state.lock().unwrap();
        let states: Vec<ConnectivityState> = state.entries.iter().map(|e| e.state).collect();
        let ready: Vec<Subchannel> = state
            .entries
            .iter()
            .filter(|e| e.state == ConnectivityState::Ready)
            .map(|e| e.subchannel.clone())
            .collect();
        let aggregate = aggregate_state(states);

        let picker: Arc<dyn Picker> = if !ready.is_empty() {
            Arc::new(RoundRobinPicker {
                ready,
                next: AtomicUsize::new(0),
            })
        } else if aggregate == ConnectivityState::TransientFailure {
            Arc::new(super::FailingPicker(crate::status::Status::new(
                crate::status::Code::Unavailable,
                "no reachable address",
            )))
        } else {
            Arc::new(super::QueuingPicker)
        };
        self.helper.update_state(aggregate, picker);
    }
}

/// Creates a subchannel for `address`, attaches a listener tagged with the
/// current generation, and requests a connection. Returns the new `Entry`.
fn spawn_entry(this: &Arc<RoundRobin>, generation: u64, address: Address) -> Entry {
    let subchannel =
        this.helper
            .create_subchannel(address.clone(), ConnectionOptions::default(), KeepaliveConfig::default());

    let weak = Arc::downgrade(this);
    let sc_for_listener = subchannel.clone();
    let listener_id = subchannel.add_connectivity_state_listener(Box::new(move |new_state| {
        if let Some(strong) = weak.upgrade() {
            on_subchannel_state(&strong, generation, sc_for_listener.clone(), new_state);
        }
    }));
    subchannel.request_connection();

    Entry {
        address,
        subchannel,
        state: ConnectivityState::Idle,
        listener_id,
    }
}

fn on_subchannel_state(this: &Arc<RoundRobin>, generation: u64, subchannel: Subchannel, new_state: ConnectivityState) {
    let mut state = this.state.lock().unwrap();
    if state.generation != generation {
        return; // this entry was already replaced by a later address-list update
    }
    let Some(entry) = state
        .entries
        .iter_mut()
        .find(|e| e.subchannel.address() == subchannel.address())
    else {
        return;
    };
    debug!(address = %entry.address.to_wire_string(), %new_state, "round_robin: subchannel state changed");
    entry.state = new_state;
    drop(state);
    this.republish();
}

impl super::LoadBalancer for Arc<RoundRobin> {
    /// Diffs against the previous address list: entries whose address is
    /// still present keep their live subchannel untouched (no teardown,
    /// no reconnect); entries for addresses no longer present are
    /// owner-unref'd (never force-shut-down -- the subchannel pool may
    /// still share them with another policy instance) and their listener
    /// removed; new addresses get a freshly created subchannel.
    fn update_address_list(&self, addresses: Vec<Address>) {
        let mut state = self.state.lock().unwrap();
        state.generation += 1;
        let generation = state.generation;

        let mut kept = Vec::with_capacity(addresses.len());
        let mut previous = std::mem::take(&mut state.entries);
        drop(state);

        for address in &addresses {
            if let Some(pos) = previous.iter().position(|e| &e.address == address) {
                kept.push(previous.remove(pos));
            }
        }
        for stale in previous {
            stale.subchannel.remove_connectivity_state_listener(stale.listener_id);
            stale.subchannel.owner_unref();
        }

        let mut entries = Vec::with_capacity(addresses.len());
        for address in addresses {
            if let Some(pos) = kept.iter().position(|e| e.address == address) {
                entries.push(kept.remove(pos));
            } else {
                entries.push(spawn_entry(self, generation, address));
            }
        }

        self.state.lock().unwrap().entries = entries;
        self.republish();
    }

    fn exit_idle(&self) {
        let state = self.state.lock().unwrap();
        for entry in &state.entries {
            if entry.state == ConnectivityState::Idle {
                entry.subchannel.request_connection();
            }
        }
    }

    fn reset_backoff(&self) {
        let state = self.state.lock().unwrap();
        for entry in &state.entries {
            entry.subchannel.reset_backoff();
        }
    }

    fn destroy(&self) {
        let mut state = self.state.lock().unwrap();
        state.generation += 1;
        for entry in state.entries.drain(..) {
            entry.subchannel.remove_connectivity_state_listener(entry.listener_id);
            entry.subchannel.owner_unref();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::LoadBalancer;
    use crate::subchannel_pool::{SubchannelKey, SubchannelPool};
    use crate::transport::{Connector, Transport};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    #[derive(Debug)]
    struct NeverConnects;

    #[async_trait]
    impl Connector for NeverConnects {
        async fn connect(&self, _address: &str, _opts: &ConnectionOptions) -> Result<Transport, crate::error::Error> {
            std::future::pending().await
        }
    }

    struct PoolHelper {
        pool: Arc<SubchannelPool>,
        connector: Arc<dyn Connector>,
        updates: StdMutex<Vec<ConnectivityState>>,
    }

    impl ChannelControlHelper for PoolHelper {
        fn create_subchannel(
            &self,
            address: Address,
            connection_options: ConnectionOptions,
            keepalive: KeepaliveConfig,
        ) -> Subchannel {
            let key = SubchannelKey {
                channel_target: "t".into(),
                address: address.to_wire_string(),
                options: String::new(),
                credentials_identity: "insecure".into(),
            };
            self.pool
                .get_or_create_subchannel(key, self.connector.clone(), connection_options, keepalive)
        }

        fn update_state(&self, state: ConnectivityState, _picker: Arc<dyn Picker>) {
            self.updates.lock().unwrap().push(state);
        }

        fn connector(&self) -> Arc<dyn Connector> {
            self.connector.clone()
        }
    }

    fn addr(s: &str) -> Address {
        let target = crate::target::Target::parse(s).unwrap();
        match target {
            crate::target::Target::Literal { ip, port } => Address::new(ip, port),
            _ => panic!("expected literal"),
        }
    }

    #[tokio::test]
    async fn connects_to_every_address_concurrently() {
        let helper = Arc::new(PoolHelper {
            pool: SubchannelPool::new(),
            connector: Arc::new(NeverConnects),
            updates: StdMutex::new(Vec::new()),
        });
        let rr = RoundRobin::new(helper.clone());
        rr.update_address_list(vec![addr("10.0.0.1:443"), addr("10.0.0.2:443")]);

        let state = rr.state.lock().unwrap();
        assert_eq!(state.entries.len(), 2);
    }

    #[tokio::test]
    async fn keeps_surviving_addresses_across_an_update() {
        let helper = Arc::new(PoolHelper {
            pool: SubchannelPool::new(),
            connector: Arc::new(NeverConnects),
            updates: StdMutex::new(Vec::new()),
        });
        let rr = RoundRobin::new(helper.clone());
        rr.update_address_list(vec![addr("10.0.0.1:443"), addr("10.0.0.2:443")]);
        let before = rr.state.lock().unwrap().entries[0].subchannel.clone();

        rr.update_address_list(vec![addr("10.0.0.1:443"), addr("10.0.0.3:443")]);
        let state = rr.state.lock().unwrap();
        let kept = state.entries.iter().find(|e| e.address == addr("10.0.0.1:443")).unwrap();
        assert_eq!(kept.subchannel.address(), before.address());
        assert_eq!(state.entries.len(), 2);
    }
}

//! The default policy: try addresses in order, stick with the first one
//! that connects, and only move to the next address on failure. Unlike
//! `round_robin`, there is at most one subchannel actively connecting or
//! ready at a time.

use super::{aggregate_state, ChannelControlHelper, PickResult, Picker};
use crate::connectivity::ConnectivityState;
use crate::credentials::ConnectionOptions;
use crate::resolver::Address;
use crate::subchannel::{KeepaliveConfig, Subchannel};
use std::sync::{Arc, Mutex};
use tracing::debug;

struct PickFirstPicker {
    subchannel: Subchannel,
}

impl Picker for PickFirstPicker {
    fn pick(&self) -> PickResult {
        PickResult::Complete(Some(self.subchannel.clone()))
    }
}

struct State {
    addresses: Vec<Address>,
    /// Index into `addresses` of the subchannel currently being tried.
    index: usize,
    /// The one subchannel this policy is currently attached to, if any.
    /// §4.5: pick_first holds at most one live subchannel at a time.
    current: Option<Subchannel>,
    /// Bumped on every address-list update or failure-driven advance so a
    /// listener closure from a torn-down attempt can tell it is stale
    /// (mirrors the generation discipline `Subchannel` itself uses for
    /// transports).
    generation: u64,
    /// The listener id registered on `current`, so it can be removed
    /// before attaching a fresh one instead of accumulating no-op
    /// listeners across address-list updates.
    listener_id: Option<u64>,
}

/// `pick_first`: maintains one subchannel at a time, advancing through the
/// address list on TRANSIENT_FAILURE and wrapping back to the first
/// address once the whole list has failed.
pub struct PickFirst {
    helper: Arc<dyn ChannelControlHelper>,
    state: Mutex<State>,
}

impl PickFirst {
    pub fn new(helper: Arc<dyn ChannelControlHelper>) -> Arc<Self> {
        Arc::new(Self {
            helper,
            state: Mutex::new(State {
                addresses: Vec::new(),
                index: 0,
                current: None,
                generation: 0,
                listener_id: None,
            }),
        })
    }

    fn publish(&self, subchannel: Option<Subchannel>, states: Vec<ConnectivityState>) {
        let aggregate = aggregate_state(states);
        let picker: Arc<dyn Picker> = match (aggregate, subchannel) {
            (ConnectivityState::Ready, Some(sc)) => Arc::new(PickFirstPicker { subchannel: sc }),
            (ConnectivityState::TransientFailure, _) => Arc::new(super::FailingPicker(
                crate::status::Status::new(crate::status::Code::Unavailable, "no reachable address"),
            )),
            _ => Arc::new(super::QueuingPicker),
        };
        self.helper.update_state(aggregate, picker);
    }
}

/// Starts (or restarts) a connection attempt to `addresses[index]`,
/// replacing whatever subchannel this policy previously held. The old
/// subchannel, if any, is only owner-unref'd -- never force-shut-down --
/// since the subchannel pool may still share it with another policy
/// instance (e.g. a hot-swap pending replacement).
fn connect_to(this: &Arc<PickFirst>, index: usize) {
    let address = {
        let mut state = this.state.lock().unwrap();
        state.generation += 1;
        state.index = index;
        if let Some(old) = state.current.take() {
            if let Some(id) = state.listener_id.take() {
                old.remove_connectivity_state_listener(id);
            }
            old.owner_unref();
        }
        state.addresses[index].clone()
    };
    let generation = this.state.lock().unwrap().generation;

    let subchannel =
        this.helper
            .create_subchannel(address, ConnectionOptions::default(), KeepaliveConfig::default());

    let listener_id = attach_listener(this, generation, index, &subchannel);

    let mut state = this.state.lock().unwrap();
    state.current = Some(subchannel.clone());
    state.listener_id = Some(listener_id);
    drop(state);
    subchannel.request_connection();
}

fn attach_listener(this: &Arc<PickFirst>, generation: u64, index: usize, subchannel: &Subchannel) -> u64 {
    let weak = Arc::downgrade(this);
    let sc_for_listener = subchannel.clone();
    subchannel.add_connectivity_state_listener(Box::new(move |new_state| {
        if let Some(strong) = weak.upgrade() {
            on_subchannel_state(&strong, generation, index, sc_for_listener.clone(), new_state);
        }
    }))
}

fn on_subchannel_state(this: &Arc<PickFirst>, generation: u64, index: usize, subchannel: Subchannel, new_state: ConnectivityState) {
    if this.state.lock().unwrap().generation != generation {
        return; // superseded by a newer address list or a later failure-advance
    }
    debug!(index, %new_state, "pick_first: subchannel state changed");
    match new_state {
        ConnectivityState::Ready => {
            this.publish(Some(subchannel), vec![ConnectivityState::Ready]);
        }
        ConnectivityState::TransientFailure => {
            let (next, has_addresses) = {
                let state = this.state.lock().unwrap();
                if state.addresses.is_empty() {
                    (0, false)
                } else {
                    ((index + 1) % state.addresses.len(), true)
                }
            };
            if next <= index {
                // Wrapped around: every address in the list has now failed.
                this.publish(None, vec![ConnectivityState::TransientFailure]);
            }
            if has_addresses {
                connect_to(this, next);
            }
        }
        ConnectivityState::Connecting => {
            this.publish(None, vec![ConnectivityState::Connecting]);
        }
        ConnectivityState::Idle | ConnectivityState::Shutdown => {}
    }
}

impl super::LoadBalancer for Arc<PickFirst> {
    /// §4.5: "On receiving a new address list while CONNECTING, restart
    /// from the beginning; if the current pick's address is still in the
    /// list, keep it; otherwise drop it." Applied uniformly regardless of
    /// whether the current attempt is CONNECTING or already READY: a live
    /// or in-progress connection to an address that's still present is
    /// never disrupted just because the rest of the list reshuffled.
    fn update_address_list(&self, addresses: Vec<Address>) {
        let kept_index = {
            let state = self.state.lock().unwrap();
            state
                .current
                .as_ref()
                .and_then(|sc| addresses.iter().position(|a| a.to_wire_string() == sc.address()))
        };

        {
            let mut state = self.state.lock().unwrap();
            state.addresses = addresses;
        }

        match kept_index {
            Some(index) => {
                // Current pick's address survived the update: keep the
                // live subchannel in place, just relabel its index and
                // re-point its listener at the new index/generation.
                let mut state = self.state.lock().unwrap();
                state.index = index;
                state.generation += 1;
                let generation = state.generation;
                let current = state.current.clone();
                let old_listener = state.listener_id.take();
                drop(state);
                if let Some(sc) = current {
                    if let Some(id) = old_listener {
                        sc.remove_connectivity_state_listener(id);
                    }
                    let listener_id = attach_listener(self, generation, index, &sc);
                    self.state.lock().unwrap().listener_id = Some(listener_id);
                    // Re-publish the current known state so the channel
                    // observes no disruption (the listener above only
                    // fires on a *future* transition).
                    self.publish(
                        (sc.state() == ConnectivityState::Ready).then(|| sc.clone()),
                        vec![sc.state()],
                    );
                }
            }
            None => {
                let has_addresses = !self.state.lock().unwrap().addresses.is_empty();
                if has_addresses {
                    connect_to(self, 0);
                } else {
                    let mut state = self.state.lock().unwrap();
                    state.generation += 1;
                    if let Some(old) = state.current.take() {
                        if let Some(id) = state.listener_id.take() {
                            old.remove_connectivity_state_listener(id);
                        }
                        old.owner_unref();
                    }
                    drop(state);
                    self.publish(None, vec![]);
                }
            }
        }
    }

    fn exit_idle(&self) {
        let state = self.state.lock().unwrap();
        if let Some(sc) = &state.current {
            sc.request_connection();
        }
    }

    fn reset_backoff(&self) {
        let state = self.state.lock().unwrap();
        if let Some(sc) = &state.current {
            sc.reset_backoff();
        }
    }

    fn destroy(&self) {
        let mut state = self.state.lock().unwrap();
        state.generation += 1;
        if let Some(sc) = state.current.take() {
            if let Some(id) = state.listener_id.take() {
                sc.remove_connectivity_state_listener(id);
            }
            sc.owner_unref();
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
    async fn keeps_current_subchannel_when_its_address_survives_an_update() {
        let helper = Arc::new(PoolHelper {
            pool: SubchannelPool::new(),
            connector: Arc::new(NeverConnects),
            updates: StdMutex::new(Vec::new()),
        });
        let pf = PickFirst::new(helper.clone());

        pf.update_address_list(vec![addr("10.0.0.1:443"), addr("10.0.0.2:443")]);
        let first_pick = pf.state.lock().unwrap().current.clone().unwrap();

        // Reshuffled list still contains the current address -- the same
        // subchannel instance must survive, not a freshly created one.
        pf.update_address_list(vec![addr("10.0.0.2:443"), addr("10.0.0.1:443")]);
        let second_pick = pf.state.lock().unwrap().current.clone().unwrap();

        assert_eq!(first_pick.address(), second_pick.address());
    }

    #[tokio::test]
    async fn drops_current_subchannel_when_its_address_is_removed() {
        let helper = Arc::new(PoolHelper {
            pool: SubchannelPool::new(),
            connector: Arc::new(NeverConnects),
            updates: StdMutex::new(Vec::new()),
        });
        let pf = PickFirst::new(helper.clone());

        pf.update_address_list(vec![addr("10.0.0.1:443")]);
        pf.update_address_list(vec![addr("10.0.0.2:443")]);

        let current = pf.state.lock().unwrap().current.clone().unwrap();
        assert_eq!(current.address(), "10.0.0.2:443");
    }
}

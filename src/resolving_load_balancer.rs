//! §4.6 `ResolvingLoadBalancer`: glues a [`crate::resolver::Resolver`] to a
//! [`crate::load_balancer::LoadBalancer`], runs the service-config
//! selection algorithm on every resolution, and hot-swaps the underlying
//! policy when the resolver's chosen config names a different one.
//!
//! State lives behind a `Mutex` with generation counters to drop stale
//! callbacks, the same actor style `Reconnect`/`Connection` state machines
//! use elsewhere in this crate, applied here to a new problem: running two
//! load balancer instances side by side during a policy hot-swap, the way
//! a destination-resolution background task keeps an old and new endpoint
//! set alive across a resolution update.

use crate::connectivity::{ConnectivityState, PickResult};
use crate::credentials::ConnectionOptions;
use crate::load_balancer::{
    ChannelControlHelper, FailingPicker, LoadBalancer, PickFirst, Picker, QueuingPicker, RoundRobin,
};
use crate::resolver::{Address, Listener, ResolutionResult, Resolver};
use crate::service_config::ServiceConfig;
use crate::status::{Code, Status};
use crate::subchannel::{KeepaliveConfig, Subchannel};
use crate::transport::Connector;
use std::sync::{Arc, Mutex};

/// Policy names this runtime has a `LoadBalancer` implementation for, in no
/// particular priority order (priority comes from the service config's own
/// list order, §4.6).
const KNOWN_POLICIES: &[&str] = &["pick_first", "round_robin"];
const DEFAULT_POLICY: &str = "pick_first";

fn instantiate(name: &str, helper: Arc<dyn ChannelControlHelper>) -> Option<Arc<dyn LoadBalancer>> {
    match name {
        "pick_first" => Some(Arc::new(PickFirst::new(helper)) as Arc<dyn LoadBalancer>),
        "round_robin" => Some(Arc::new(RoundRobin::new(helper)) as Arc<dyn LoadBalancer>),
        _ => None,
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Slot {
    Active,
    Pending,
}

struct PolicyHandle {
    name: String,
    lb: Arc<dyn LoadBalancer>,
    generation: u64,
    last_state: ConnectivityState,
    last_picker: Option<Arc<dyn Picker>>,
}

struct State {
    active: Option<PolicyHandle>,
    pending: Option<PolicyHandle>,
    previous_service_config: Option<ServiceConfig>,
    next_generation: u64,
    continue_resolving: bool,
}

/// Forwards each policy instance's `ChannelControlHelper` calls back to
/// the `ResolvingLoadBalancer`, tagged with the generation it was created
/// under so callbacks from a torn-down policy are dropped rather than
/// corrupting a newer one's state (the same stale-event discipline
/// `Subchannel` uses for its transport).
struct ChildHelper {
    rlb: Arc<Inner>,
    generation: u64,
    slot: Slot,
}

impl ChannelControlHelper for ChildHelper {
    fn create_subchannel(
        &self,
        address: Address,
        connection_options: ConnectionOptions,
        keepalive: KeepaliveConfig,
    ) -> Subchannel {
        self.rlb.helper.create_subchannel(address, connection_options, keepalive)
    }

    fn update_state(&self, state: ConnectivityState, picker: Arc<dyn Picker>) {
        self.rlb.on_child_update(self.generation, self.slot, state, picker);
    }

    fn connector(&self) -> Arc<dyn Connector> {
        self.rlb.helper.connector()
    }
}

struct Inner {
    channel_target: String,
    helper: Arc<dyn ChannelControlHelper>,
    default_service_config: Option<ServiceConfig>,
    resolver: Arc<dyn Resolver>,
    state: Mutex<State>,
    backoff: Mutex<crate::backoff::BackoffTimer>,
}

impl Inner {
    fn on_child_update(self: &Arc<Self>, generation: u64, slot: Slot, state: ConnectivityState, picker: Arc<dyn Picker>) {
        let mut st = self.state.lock().unwrap();
        match slot {
            Slot::Active => {
                match &mut st.active {
                    Some(active) if active.generation == generation => {
                        active.last_state = state;
                        active.last_picker = Some(picker.clone());
                    }
                    _ => return,
                }
                if state != ConnectivityState::Ready {
                    if let Some(pending) = st.pending.take() {
                        if let Some(old) = st.active.take() {
                            old.lb.destroy();
                        }
                        let (s, p) = (pending.last_state, pending.last_picker.clone());
                        st.active = Some(pending);
                        drop(st);
                        self.helper.update_state(s, p.unwrap_or_else(|| Arc::new(QueuingPicker)));
                        return;
                    }
                }
                drop(st);
                self.helper.update_state(state, picker);
            }
            Slot::Pending => {
                match &mut st.pending {
                    Some(pending) if pending.generation == generation => {
                        pending.last_state = state;
                        pending.last_picker = Some(picker.clone());
                    }
                    _ => return,
                }
                if state == ConnectivityState::Ready {
                    let pending = st.pending.take().unwrap();
                    if let Some(old) = st.active.take() {
                        old.lb.destroy();
                    }
                    st.active = Some(pending);
                    drop(st);
                    self.helper.update_state(state, picker);
                }
            }
        }
    }

    fn child_helper(self: &Arc<Self>, generation: u64, slot: Slot) -> Arc<dyn ChannelControlHelper> {
        Arc::new(ChildHelper {
            rlb: self.clone(),
            generation,
            slot,
        })
    }

    /// §4.6 service-config selection, given the latest resolution.
    fn select_config(&self, result: &ResolutionResult) -> Result<ServiceConfig, Status> {
        let mut st = self.state.lock().unwrap();
        if let Some(cfg) = &result.service_config {
            st.previous_service_config = Some(cfg.clone());
            return Ok(cfg.clone());
        }
        if result.service_config_error.is_none() {
            st.previous_service_config = None;
            return Ok(self.default_service_config.clone().unwrap_or_default());
        }
        if let Some(prev) = st.previous_service_config.clone() {
            return Ok(prev);
        }
        if let Some(default) = self.default_service_config.clone() {
            return Ok(default);
        }
        Err(result
            .service_config_error
            .clone()
            .unwrap_or_else(|| Status::new(Code::Unavailable, "no service config available")))
    }

    fn choose_policy_name(&self, config: &ServiceConfig) -> Result<String, Status> {
        if config.load_balancing_config.is_empty() {
            return Ok(DEFAULT_POLICY.to_string());
        }
        match config.select_load_balancing_policy(KNOWN_POLICIES) {
            Some(entry) => Ok(entry.policy_name().unwrap_or(DEFAULT_POLICY).to_string()),
            None => Err(Status::new(
                Code::Unavailable,
                "service config named no load balancing policy this channel supports",
            )),
        }
    }

    fn apply_policy(self: &Arc<Self>, name: String, addresses: Vec<Address>) {
        let mut st = self.state.lock().unwrap();

        if let Some(pending) = &st.pending {
            if pending.name == name {
                let lb = pending.lb.clone();
                drop(st);
                lb.update_address_list(addresses);
                return;
            }
        }

        if let Some(active) = &st.active {
            if active.name == name && st.pending.is_none() {
                let lb = active.lb.clone();
                drop(st);
                lb.update_address_list(addresses);
                return;
            }
        }

        let generation = st.next_generation;
        st.next_generation += 1;

        let active_is_ready = st
            .active
            .as_ref()
            .map(|a| a.last_state == ConnectivityState::Ready)
            .unwrap_or(false);

        if active_is_ready {
            // §4.6 hot-swap: build the replacement alongside the still-READY
            // active policy rather than tearing it down immediately.
            if let Some(stale_pending) = st.pending.take() {
                stale_pending.lb.destroy();
            }
            drop(st);
            let helper = self.child_helper(generation, Slot::Pending);
            let Some(lb) = instantiate(&name, helper) else { return };
            let mut st = self.state.lock().unwrap();
            st.pending = Some(PolicyHandle {
                name,
                lb: lb.clone(),
                generation,
                last_state: ConnectivityState::Idle,
                last_picker: None,
            });
            drop(st);
            lb.update_address_list(addresses);
        } else {
            if let Some(old) = st.active.take() {
                old.lb.destroy();
            }
            if let Some(stale_pending) = st.pending.take() {
                stale_pending.lb.destroy();
            }
            drop(st);
            let helper = self.child_helper(generation, Slot::Active);
            let Some(lb) = instantiate(&name, helper) else { return };
            let mut st = self.state.lock().unwrap();
            st.active = Some(PolicyHandle {
                name,
                lb: lb.clone(),
                generation,
                last_state: ConnectivityState::Idle,
                last_picker: None,
            });
            drop(st);
            lb.update_address_list(addresses);
        }
    }

    fn fail(self: &Arc<Self>, status: Status) {
        let has_usable_active = {
            let st = self.state.lock().unwrap();
            st.active
                .as_ref()
                .map(|a| a.last_state != ConnectivityState::Idle)
                .unwrap_or(false)
        };
        if !has_usable_active {
            self.helper
                .update_state(ConnectivityState::TransientFailure, Arc::new(FailingPicker(status)));
        }
        self.start_reresolve_backoff();
    }

    /// Schedules a re-resolution after the backoff delay. A `fail()` that
    /// arrives while a backoff is already running doesn't start a second
    /// timer -- it just flags that another round is wanted once this one
    /// fires, so repeated failures during one backoff window coalesce into
    /// a single refresh followed immediately by a fresh backoff, rather
    /// than a burst of refreshes.
    fn start_reresolve_backoff(self: &Arc<Self>) {
        let mut backoff = self.backoff.lock().unwrap();
        if backoff.is_running() {
            self.state.lock().unwrap().continue_resolving = true;
            return;
        }
        let this = self.clone();
        backoff.run_once(move || {
            let again = {
                let mut state = this.state.lock().unwrap();
                std::mem::take(&mut state.continue_resolving)
            };
            this.resolver.refresh();
            if again {
                this.start_reresolve_backoff();
            }
        });
    }
}

struct ResolverListener(Arc<Inner>);

impl Listener for ResolverListener {
    fn on_result(&self, result: ResolutionResult) {
        let inner = &self.0;
        match inner.select_config(&result) {
            Ok(config) => {
                inner.helper.update_service_config(Some(config.clone()));
                match inner.choose_policy_name(&config) {
                    Ok(name) => {
                        inner.backoff.lock().unwrap().reset();
                        inner.apply_policy(name, result.addresses);
                    }
                    Err(status) => inner.fail(status),
                }
            }
            Err(status) => inner.fail(status),
        }
    }

    fn on_error(&self, status: Status) {
        self.0.fail(status);
    }
}

/// Owns the whole resolve-then-balance pipeline for one `Channel`: starts
/// the resolver, runs service-config selection on each result, and manages
/// the active/pending `LoadBalancer` pair through policy hot-swaps.
pub struct ResolvingLoadBalancer {
    inner: Arc<Inner>,
}

impl ResolvingLoadBalancer {
    pub fn new(
        channel_target: String,
        resolver: Arc<dyn Resolver>,
        helper: Arc<dyn ChannelControlHelper>,
        default_service_config: Option<ServiceConfig>,
    ) -> Self {
        let inner = Arc::new(Inner {
            channel_target,
            helper,
            default_service_config,
            resolver,
            state: Mutex::new(State {
                active: None,
                pending: None,
                previous_service_config: None,
                next_generation: 0,
                continue_resolving: false,
            }),
            backoff: Mutex::new(crate::backoff::BackoffTimer::new()),
        });
        Self { inner }
    }

    pub fn start(&self) {
        self.inner.resolver.start(Arc::new(ResolverListener(self.inner.clone())));
    }

    pub fn exit_idle(&self) {
        let st = self.inner.state.lock().unwrap();
        if let Some(active) = &st.active {
            active.lb.exit_idle();
        } else {
            drop(st);
            self.inner.resolver.refresh();
        }
    }

    pub fn reset_backoff(&self) {
        self.inner.backoff.lock().unwrap().reset();
        let st = self.inner.state.lock().unwrap();
        if let Some(active) = &st.active {
            active.lb.reset_backoff();
        }
        if let Some(pending) = &st.pending {
            pending.lb.reset_backoff();
        }
    }

    pub fn destroy(&self) {
        self.inner.resolver.shutdown();
        self.inner.backoff.lock().unwrap().stop();
        let mut st = self.inner.state.lock().unwrap();
        if let Some(active) = st.active.take() {
            active.lb.destroy();
        }
        if let Some(pending) = st.pending.take() {
            pending.lb.destroy();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Connector, Transport};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Debug)]
    struct NeverConnects;

    #[async_trait]
    impl Connector for NeverConnects {
        async fn connect(&self, _address: &str, _opts: &ConnectionOptions) -> Result<Transport, crate::error::Error> {
            std::future::pending().await
        }
    }

    struct RecordingHelper {
        connector: Arc<dyn Connector>,
        updates: Mutex<Vec<ConnectivityState>>,
        pick_results: Mutex<Vec<PickResult>>,
    }

    impl ChannelControlHelper for RecordingHelper {
        fn create_subchannel(
            &self,
            address: Address,
            connection_options: ConnectionOptions,
            keepalive: KeepaliveConfig,
        ) -> Subchannel {
            Subchannel::new(address.to_wire_string(), self.connector.clone(), connection_options, keepalive)
        }

        fn update_state(&self, state: ConnectivityState, picker: Arc<dyn Picker>) {
            self.updates.lock().unwrap().push(state);
            self.pick_results.lock().unwrap().push(picker.pick());
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

    struct FixedResolver {
        result: Mutex<Option<ResolutionResult>>,
    }

    impl Resolver for FixedResolver {
        fn start(&self, listener: Arc<dyn Listener>) {
            if let Some(result) = self.result.lock().unwrap().take() {
                listener.on_result(result);
            }
        }
        fn refresh(&self) {}
        fn shutdown(&self) {}
    }

    #[tokio::test]
    async fn picks_pick_first_by_default_with_no_service_config() {
        let helper = Arc::new(RecordingHelper {
            connector: Arc::new(NeverConnects),
            updates: Mutex::new(Vec::new()),
            pick_results: Mutex::new(Vec::new()),
        });
        let resolver = Arc::new(FixedResolver {
            result: Mutex::new(Some(ResolutionResult {
                addresses: vec![addr("10.0.0.1:443")],
                service_config: None,
                service_config_error: None,
            })),
        });
        let rlb = ResolvingLoadBalancer::new("t".into(), resolver, helper.clone(), None);
        rlb.start();
        tokio::task::yield_now().await;
        // pick_first enters CONNECTING immediately (NeverConnects never resolves).
        assert!(helper.updates.lock().unwrap().contains(&ConnectivityState::Connecting));
    }

    #[tokio::test]
    async fn resolution_failure_with_no_fallback_publishes_transient_failure() {
        let helper = Arc::new(RecordingHelper {
            connector: Arc::new(NeverConnects),
            updates: Mutex::new(Vec::new()),
            pick_results: Mutex::new(Vec::new()),
        });

        struct FailingResolver;
        impl Resolver for FailingResolver {
            fn start(&self, listener: Arc<dyn Listener>) {
                listener.on_error(Status::new(Code::Unavailable, "name resolution failed"));
            }
            fn refresh(&self) {}
            fn shutdown(&self) {}
        }

        let rlb = ResolvingLoadBalancer::new("t".into(), Arc::new(FailingResolver), helper.clone(), None);
        rlb.start();
        tokio::task::yield_now().await;
        assert_eq!(helper.updates.lock().unwrap().last(), Some(&ConnectivityState::TransientFailure));
        match helper.pick_results.lock().unwrap().last().unwrap() {
            PickResult::TransientFailure(status) => assert_eq!(status.code(), Code::Unavailable),
            other => panic!("expected transient failure pick, got {other:?}"),
        }
    }

    #[test]
    fn config_with_unknown_policies_only_is_unavailable() {
        let json = r#"{"loadBalancingConfig": [{"grpclb": {}}]}"#;
        let config = ServiceConfig::parse(json).unwrap();
        let helper = Arc::new(RecordingHelper {
            connector: Arc::new(NeverConnects),
            updates: Mutex::new(Vec::new()),
            pick_results: Mutex::new(Vec::new()),
        });
        let resolver = Arc::new(FixedResolver { result: Mutex::new(None) });
        let rlb = ResolvingLoadBalancer::new("t".into(), resolver, helper, None);
        let err = rlb.inner.choose_policy_name(&config).unwrap_err();
        assert_eq!(err.code(), Code::Unavailable);
        let _ = AtomicUsize::new(0); // keep import used across cfg combinations
    }

    /// Hands the `Arc<dyn Listener>` passed to `start()` back to the test so
    /// it can push a second resolution on demand, simulating a later
    /// re-resolve rather than only the one-shot result `FixedResolver` gives.
    struct ManualResolver {
        listener: Mutex<Option<Arc<dyn Listener>>>,
    }

    impl ManualResolver {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                listener: Mutex::new(None),
            })
        }

        fn push(&self, result: ResolutionResult) {
            self.listener.lock().unwrap().as_ref().unwrap().on_result(result);
        }
    }

    impl Resolver for ManualResolver {
        fn start(&self, listener: Arc<dyn Listener>) {
            *self.listener.lock().unwrap() = Some(listener);
        }
        fn refresh(&self) {}
        fn shutdown(&self) {}
    }

    /// Accepts one connection and parks it, just enough `h2` handshake for a
    /// subchannel dialing this address to reach READY; never answers a call.
    async fn accept_and_park(listener: tokio::net::TcpListener) {
        let (socket, _) = listener.accept().await.unwrap();
        let mut connection = h2::server::handshake(socket).await.unwrap();
        while connection.accept().await.is_some() {}
    }

    async fn spawn_parked_listener() -> Address {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local = listener.local_addr().unwrap();
        tokio::spawn(accept_and_park(listener));
        addr(&local.to_string())
    }

    #[tokio::test]
    async fn scenario_4_hot_swap_keeps_serving_until_replacement_is_ready() {
        let pick_first_addr = spawn_parked_listener().await;
        let round_robin_addr = spawn_parked_listener().await;

        let helper = Arc::new(RecordingHelper {
            connector: Arc::new(crate::transport::DefaultConnector),
            updates: Mutex::new(Vec::new()),
            pick_results: Mutex::new(Vec::new()),
        });
        let resolver = ManualResolver::new();
        let rlb = ResolvingLoadBalancer::new("t".into(), resolver.clone(), helper.clone(), None);
        rlb.start();

        resolver.push(ResolutionResult {
            addresses: vec![pick_first_addr],
            service_config: None,
            service_config_error: None,
        });

        // Wait for the default pick_first policy to reach READY.
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if helper.updates.lock().unwrap().contains(&ConnectivityState::Ready) {
                    return;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("pick_first never reached ready");
        {
            let st = rlb.inner.state.lock().unwrap();
            assert_eq!(st.active.as_ref().unwrap().name, "pick_first");
        }

        helper.updates.lock().unwrap().clear();

        let json = r#"{"loadBalancingConfig": [{"round_robin": {}}]}"#;
        let service_config = ServiceConfig::parse(json).unwrap();
        resolver.push(ResolutionResult {
            addresses: vec![round_robin_addr],
            service_config: Some(service_config),
            service_config_error: None,
        });
        tokio::task::yield_now().await;

        // The hot-swap must not tear down the still-READY active policy: it
        // keeps serving as `pick_first` while `round_robin` connects in the
        // pending slot.
        {
            let st = rlb.inner.state.lock().unwrap();
            assert_eq!(st.active.as_ref().unwrap().name, "pick_first");
            assert_eq!(st.pending.as_ref().unwrap().name, "round_robin");
        }

        // Once the pending policy reaches READY it's promoted to active and
        // the old one is torn down.
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                {
                    let st = rlb.inner.state.lock().unwrap();
                    if st.active.as_ref().map(|a| a.name.as_str()) == Some("round_robin") && st.pending.is_none() {
                        return;
                    }
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("round_robin was never promoted to active");
    }
}

//! The per-backend state machine: one `Subchannel` tracks a single address,
//! owns the HTTP/2 transport to it once connected, and exposes a
//! connectivity-state contract load balancers observe and a call-stream
//! entry point the channel's pick path uses.
//!
//! A small enum of idle/connecting/connected states driven by explicit
//! events rather than polled continuously, the same shape a
//! `Reconnect<M, Target>` service takes for "reconnect this one service",
//! generalized here into the full connectivity lifecycle (including
//! keepalive and caller refcounting) a load balancer needs to see.

use crate::backoff::BackoffTimer;
use crate::connectivity::ConnectivityState;
use crate::credentials::ConnectionOptions;
use crate::transport::{ping_pong_roundtrip, CloseReason, Connector, RequestSender, Transport};
use std::{
    fmt,
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::sync::{oneshot, Notify};
use tracing::{debug, trace, warn};

/// Keepalive PING cadence and timeout. `time` doubles (saturating) on a
/// GOAWAY with `ENHANCE_YOUR_CALM`, per the usual HTTP/2 keepalive penalty
/// box; `permit_without_calls` mirrors the common "ping even while idle"
/// toggle.
#[derive(Clone, Debug)]
pub struct KeepaliveConfig {
    pub time: Duration,
    pub timeout: Duration,
    pub permit_without_calls: bool,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            time: Duration::from_secs(u64::MAX / 1000),
            timeout: Duration::from_secs(20),
            permit_without_calls: false,
        }
    }
}

/// 31-bit signed millisecond ceiling shared with the backoff timer; GOAWAY
/// penalty doubling saturates here instead of overflowing into a negative
/// duration.
const MAX_KEEPALIVE_MS: i64 = (1i64 << 31) - 1;

type Listener = Box<dyn Fn(ConnectivityState) + Send + Sync>;

struct Shared {
    address: String,
    connector: Arc<dyn Connector>,
    connection_options: ConnectionOptions,
    keepalive: KeepaliveConfig,
    keepalive_time_ms: AtomicI64,
    generation: AtomicU64,
    call_refs: AtomicU64,
    owner_refs: AtomicU64,
    inner: Mutex<Inner>,
    notify: Notify,
}

struct Inner {
    state: ConnectivityState,
    listeners: Vec<(u64, Listener)>,
    next_listener_id: u64,
    /// The cheap, cloneable stream-dispatch handle for the live transport,
    /// if any. The keepalive pinger and close-watcher hold their own
    /// separate handles to the same connection (its `PingPong` and close
    /// notifier) taken once at connect time, so a call dispatch never
    /// fights either of them for ownership of this field.
    request_sender: Option<RequestSender>,
    backoff: BackoffTimer,
    continue_connecting: bool,
    shutdown: bool,
}

/// A cheaply-cloneable handle to one backend's connectivity state machine.
/// Cloning shares the same underlying state; the subchannel itself is only
/// torn down once its owner and call refcounts both reach zero after
/// `shutdown` is requested.
#[derive(Clone)]
pub struct Subchannel(Arc<Shared>);

impl Subchannel {
    /// Constructs a subchannel in IDLE. It does not start connecting until
    /// `request_connection` is called (typically by the load balancer that
    /// just created it, or lazily by the picker on a queued call).
    pub fn new(
        address: String,
        connector: Arc<dyn Connector>,
        connection_options: ConnectionOptions,
        keepalive: KeepaliveConfig,
    ) -> Self {
        let keepalive_time_ms = i64::try_from(keepalive.time.as_millis())
            .unwrap_or(MAX_KEEPALIVE_MS)
            .min(MAX_KEEPALIVE_MS);

        Self(Arc::new(Shared {
            address,
            connector,
            connection_options,
            keepalive,
            keepalive_time_ms: AtomicI64::new(keepalive_time_ms),
            generation: AtomicU64::new(0),
            call_refs: AtomicU64::new(0),
            owner_refs: AtomicU64::new(0),
            inner: Mutex::new(Inner {
                state: ConnectivityState::Idle,
                listeners: Vec::new(),
                next_listener_id: 0,
                request_sender: None,
                backoff: BackoffTimer::new(),
                continue_connecting: false,
                shutdown: false,
            }),
            notify: Notify::new(),
        }))
    }

    pub fn address(&self) -> &str {
        &self.0.address
    }

    pub fn state(&self) -> ConnectivityState {
        self.0.inner.lock().unwrap().state
    }

    /// Registers a listener called synchronously on every state transition,
    /// including the one that happens before this call returns if the
    /// subchannel is already in a state other than IDLE. Returns an id that
    /// can be used to remove the listener later, though in practice
    /// listeners live as long as their owning load balancer.
    pub fn add_connectivity_state_listener(&self, listener: Listener) -> u64 {
        let mut inner = self.0.inner.lock().unwrap();
        let id = inner.next_listener_id;
        inner.next_listener_id += 1;
        inner.listeners.push((id, listener));
        id
    }

    pub fn remove_connectivity_state_listener(&self, id: u64) {
        self.0.inner.lock().unwrap().listeners.retain(|(i, _)| *i != id);
    }

    /// "ExitIdle": if IDLE, begins connecting. A no-op from every other
    /// state -- in particular it does not interrupt an in-progress backoff.
    pub fn request_connection(&self) {
        let mut inner = self.0.inner.lock().unwrap();
        if inner.shutdown || inner.state != ConnectivityState::Idle {
            return;
        }
        self.transition_locked(&mut inner, ConnectivityState::Connecting);
        drop(inner);
        self.spawn_connect(0);
    }

    /// Forces the backoff counter back to its initial value, as if this
    /// were the first attempt. Used when a resolver update suggests
    /// addresses may now be reachable.
    pub fn reset_backoff(&self) {
        let mut inner = self.0.inner.lock().unwrap();
        inner.backoff.reset();
    }

    pub fn call_ref(&self) {
        self.0.call_refs.fetch_add(1, Ordering::SeqCst);
    }

    pub fn call_unref(&self) {
        self.0.call_refs.fetch_sub(1, Ordering::SeqCst);
        self.maybe_finish_shutdown();
    }

    /// Owner refs are held by whichever load balancer(s) still list this
    /// address; the pool tears a subchannel down once both owner and call
    /// refs drop to zero after shutdown.
    pub fn owner_ref(&self) {
        self.0.owner_refs.fetch_add(1, Ordering::SeqCst);
    }

    pub fn owner_unref(&self) {
        self.0.owner_refs.fetch_sub(1, Ordering::SeqCst);
        self.maybe_finish_shutdown();
    }

    pub fn is_unreferenced(&self) -> bool {
        self.0.owner_refs.load(Ordering::SeqCst) == 0 && self.0.call_refs.load(Ordering::SeqCst) == 0
    }

    /// Requests shutdown: cancels any pending backoff, closes a live
    /// transport, and moves to TRANSIENT_FAILURE once outstanding calls
    /// drain (§4.3 has no SHUTDOWN destination for a Subchannel).
    pub fn shutdown(&self) {
        let mut inner = self.0.inner.lock().unwrap();
        if inner.shutdown {
            return;
        }
        inner.shutdown = true;
        inner.backoff.stop();
        inner.request_sender = None;
        self.0.generation.fetch_add(1, Ordering::SeqCst);
        drop(inner);
        self.maybe_finish_shutdown();
    }

    /// §4.3's transition table has no `SHUTDOWN` destination for a
    /// `Subchannel` at all: "both refcounts reach 0" out of
    /// `{CONNECTING, IDLE, READY}` lands on `TRANSIENT_FAILURE`, the pool
    /// then drops the entry entirely rather than keeping it around in a
    /// separate terminal state.
    fn maybe_finish_shutdown(&self) {
        let mut inner = self.0.inner.lock().unwrap();
        if inner.shutdown && self.is_unreferenced() && inner.state != ConnectivityState::TransientFailure {
            self.transition_locked(&mut inner, ConnectivityState::TransientFailure);
        }
    }

    /// Starts a new HTTP/2 stream on this subchannel's live transport.
    /// Returns `None` if there is currently no READY transport -- the
    /// caller (the filter stack) should have already confirmed READY via a
    /// pick, but transports can drop between pick and send, so this stays
    /// fallible.
    pub async fn start_call_stream(
        &self,
        request: http::Request<()>,
    ) -> Result<(h2::client::ResponseFuture, h2::SendStream<bytes::Bytes>), crate::error::Error> {
        let mut sender = {
            let inner = self.0.inner.lock().unwrap();
            if inner.state != ConnectivityState::Ready {
                return Err(crate::error::Error::msg(
                    crate::error::ErrorKind::ChannelClosed,
                    "subchannel is not ready",
                ));
            }
            inner.request_sender.clone().ok_or_else(|| {
                crate::error::Error::msg(crate::error::ErrorKind::ChannelClosed, "transport went away")
            })?
        };
        sender.send_request(request, false).await
    }

    fn transition_locked(&self, inner: &mut Inner, to: ConnectivityState) {
        if inner.state == to {
            return;
        }
        trace!(address = %self.0.address, from = %inner.state, to = %to, "subchannel: transition");
        inner.state = to;
        for (_, listener) in &inner.listeners {
            listener(to);
        }
        self.0.notify.notify_waiters();
    }

    fn spawn_connect(&self, generation: u64) {
        if generation != self.0.generation.load(Ordering::SeqCst) {
            return;
        }
        let this = self.clone();
        tokio::spawn(async move {
            this.connect_once().await;
        });
    }

    async fn connect_once(&self) {
        let generation = self.0.generation.load(Ordering::SeqCst);
        let result = self
            .0
            .connector
            .connect(&self.0.address, &self.0.connection_options)
            .await;

        if generation != self.0.generation.load(Ordering::SeqCst) {
            return; // superseded by a shutdown or a newer connect attempt
        }

        match result {
            Ok(transport) => self.on_connected(generation, transport),
            Err(err) => self.on_connect_failed(generation, err),
        }
    }

    fn on_connected(&self, generation: u64, transport: Transport) {
        let mut inner = self.0.inner.lock().unwrap();
        if inner.shutdown {
            return;
        }
        debug!(address = %self.0.address, "subchannel: connected");
        inner.backoff.reset();
        let (request_sender, ping_pong, closed) = transport.into_parts();
        inner.request_sender = Some(request_sender);
        self.transition_locked(&mut inner, ConnectivityState::Ready);
        drop(inner);
        self.spawn_watch_close(generation, closed);
        if self.0.keepalive.time < Duration::from_secs(u64::MAX / 1000) {
            if let Some(ping_pong) = ping_pong {
                self.spawn_keepalive(generation, ping_pong);
            }
        }
    }

    fn on_connect_failed(&self, _generation: u64, err: crate::error::Error) {
        warn!(address = %self.0.address, error = %err, "subchannel: connect failed");
        let mut inner = self.0.inner.lock().unwrap();
        if inner.shutdown {
            return;
        }
        inner.request_sender = None;
        self.transition_locked(&mut inner, ConnectivityState::TransientFailure);
        let generation = self.0.generation.load(Ordering::SeqCst);
        let this = self.clone();
        inner.backoff.run_once(move || {
            let mut inner = this.0.inner.lock().unwrap();
            if inner.shutdown || generation != this.0.generation.load(Ordering::SeqCst) {
                return;
            }
            this.transition_locked(&mut inner, ConnectivityState::Connecting);
            drop(inner);
            this.spawn_connect(generation);
        });
    }

    /// Owns the close-notifier for this connect generation's whole
    /// lifetime -- the one thing this task needs, leaving call dispatch
    /// free to use its own cloned `RequestSender`.
    fn spawn_watch_close(&self, generation: u64, closed: oneshot::Receiver<CloseReason>) {
        let this = self.clone();
        tokio::spawn(async move {
            let reason = match closed.await {
                Ok(reason) => reason,
                Err(_) => CloseReason::Closed(None),
            };
            if generation != this.0.generation.load(Ordering::SeqCst) {
                return;
            }
            this.on_transport_closed(generation, reason);
        });
    }

    fn on_transport_closed(&self, generation: u64, reason: CloseReason) {
        match &reason {
            CloseReason::GoAway {
                reason: r, ..
            } if *r == h2::Reason::ENHANCE_YOUR_CALM => {
                let doubled = self
                    .0
                    .keepalive_time_ms
                    .load(Ordering::SeqCst)
                    .saturating_mul(2)
                    .min(MAX_KEEPALIVE_MS);
                self.0.keepalive_time_ms.store(doubled, Ordering::SeqCst);
                warn!(address = %self.0.address, new_keepalive_ms = doubled, "subchannel: ENHANCE_YOUR_CALM, doubling keepalive interval");
            }
            CloseReason::GoAway { reason: r, .. } => {
                debug!(address = %self.0.address, reason = ?r, "subchannel: GOAWAY");
            }
            CloseReason::Closed(err) => {
                debug!(address = %self.0.address, error = ?err, "subchannel: transport closed");
            }
        }

        let mut inner = self.0.inner.lock().unwrap();
        if inner.shutdown {
            return;
        }
        inner.request_sender = None;
        self.transition_locked(&mut inner, ConnectivityState::Idle);
        if inner.continue_connecting {
            inner.continue_connecting = false;
            self.transition_locked(&mut inner, ConnectivityState::Connecting);
            drop(inner);
            self.spawn_connect(generation);
        }
    }

    /// Owns this connect generation's `PingPong` handle outright -- never
    /// shared with call dispatch or the close-watcher, so a slow or
    /// in-flight ping can't block either of them.
    fn spawn_keepalive(&self, generation: u64, mut ping_pong: h2::PingPong) {
        let this = self.clone();
        let permit_without_calls = self.0.keepalive.permit_without_calls;
        let timeout = self.0.keepalive.timeout;
        tokio::spawn(async move {
            loop {
                let interval_ms = this.0.keepalive_time_ms.load(Ordering::SeqCst).max(0) as u64;
                tokio::time::sleep(Duration::from_millis(interval_ms)).await;

                if generation != this.0.generation.load(Ordering::SeqCst) {
                    return;
                }
                if this.state() != ConnectivityState::Ready {
                    return;
                }
                if !permit_without_calls && this.0.call_refs.load(Ordering::SeqCst) == 0 {
                    continue;
                }

                let outcome = tokio::time::timeout(timeout, ping_pong_roundtrip(&mut ping_pong)).await;
                match outcome {
                    Ok(Ok(())) => {}
                    _ => {
                        warn!(address = %this.0.address, "subchannel: keepalive ping timed out");
                        this.on_transport_closed(
                            generation,
                            CloseReason::Closed(Some(crate::error::Error::msg(
                                crate::error::ErrorKind::Connect,
                                "keepalive timeout",
                            ))),
                        );
                        return;
                    }
                }
            }
        });
    }
}

impl fmt::Debug for Subchannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subchannel")
            .field("address", &self.0.address)
            .field("state", &self.state())
            .finish()
    }
}

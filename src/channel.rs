//! §4.7 `Channel`: the public entry point. Owns the subchannel pool, the
//! `ResolvingLoadBalancer`, and the current picker; turns `create_call`
//! into either an immediate subchannel handoff or a queued wait for the
//! next picker update.
//!
//! A `tower::Buffer` wrapping a `tower_balance::p2c::Balance` would absorb
//! queuing and picking elsewhere; this module implements that dispatch loop
//! explicitly against the `LoadBalancer`/`Picker` seam above, since there is
//! no `tower::Service` in this runtime's request path.

use crate::connectivity::{ConnectivityState, PickResult};
use crate::credentials::{ConnectionOptions, Credentials};
use crate::filters::{CallContext, CompressionEncoding, CompressionFilter, FilterStack};
use crate::load_balancer::{ChannelControlHelper, FailingPicker, Picker, QueuingPicker};
use crate::metadata::MetadataMap;
#[cfg(feature = "dns")]
use crate::resolver::DnsResolver;
use crate::resolver::{Address, Resolver, StaticResolver};
use crate::resolving_load_balancer::ResolvingLoadBalancer;
use crate::service_config::{MethodConfig, ServiceConfig};
use crate::status::{Code, Status};
use crate::subchannel::{KeepaliveConfig, Subchannel};
use crate::subchannel_pool::SubchannelPool;
use crate::target::Target;
use crate::transport::{Connector, DefaultConnector};
use http::header::{CONTENT_TYPE, TE, USER_AGENT};
use http::HeaderValue;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::debug;

/// §6 "Wire headers emitted per call": the fixed core token in the
/// `user-agent` string, alongside the caller's primary/secondary overrides.
const CORE_USER_AGENT: &str = concat!("grpc-rpc-channel/", env!("CARGO_PKG_VERSION"));

/// Construction-time knobs for a [`Channel`]. Every field has a sensible
/// default via [`ChannelOptions::default`]; callers only override what
/// they need.
pub struct ChannelOptions {
    pub credentials: Arc<dyn Credentials>,
    pub connector: Option<Arc<dyn Connector>>,
    pub default_service_config: Option<ServiceConfig>,
    pub default_timeout: Option<Duration>,
    pub keepalive: KeepaliveConfig,
    pub send_compression: Option<CompressionEncoding>,
    /// §3 `primary_user_agent`/`secondary_user_agent`: prepended/appended
    /// around the core `user-agent` token (§6), whitespace-joined with
    /// empty parts dropped.
    pub primary_user_agent: Option<String>,
    pub secondary_user_agent: Option<String>,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            credentials: Arc::new(crate::credentials::Insecure),
            connector: None,
            default_service_config: None,
            default_timeout: None,
            keepalive: KeepaliveConfig::default(),
            send_compression: None,
            primary_user_agent: None,
            secondary_user_agent: None,
        }
    }
}

/// §6: `"<primary> grpc-x/<ver> <secondary>"`, whitespace-separated with
/// empty parts dropped.
fn build_user_agent(primary: Option<&str>, secondary: Option<&str>) -> String {
    [primary, Some(CORE_USER_AGENT), secondary]
        .into_iter()
        .flatten()
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// §4.3/§6: builds the bare outgoing request for one call -- scheme and
/// `:authority` from the caller, `content-type`, `te`, and `user-agent` from
/// the wire header table -- independent of picking so it can be composed (and
/// tested) without a live subchannel.
fn build_request(
    scheme: http::uri::Scheme,
    authority: &str,
    user_agent: &HeaderValue,
    service: &str,
    method: &str,
) -> Result<http::Request<()>, Status> {
    let path_and_query = format!("/{service}/{method}");
    let uri = http::Uri::builder()
        .scheme(scheme)
        .authority(authority)
        .path_and_query(path_and_query)
        .build()
        .map_err(|e| Status::new(Code::Internal, format!("invalid call uri: {e}")))?;

    let mut request = http::Request::builder()
        .method(http::Method::POST)
        .uri(uri)
        .body(())
        .expect("a POST request with a valid scheme+authority+path always builds");

    let headers = request.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/grpc"));
    headers.insert(TE, HeaderValue::from_static("trailers"));
    headers.insert(USER_AGENT, user_agent.clone());

    Ok(request)
}

struct State {
    connectivity: ConnectivityState,
    picker: Arc<dyn Picker>,
    shutdown: bool,
    /// The service config currently in effect (§4.6), if any; supplies
    /// per-method defaults (`timeout`, `waitForReady`) applied in
    /// `create_call` when the caller doesn't override them.
    service_config: Option<ServiceConfig>,
}

/// Shared state behind every clone of a `Channel`; `Channel` itself is a
/// thin `Arc<Inner>` handle, mirroring how `Subchannel` is a cheap handle
/// over its own shared state.
struct Inner {
    target: Target,
    credentials: Arc<dyn Credentials>,
    connector: Arc<dyn Connector>,
    pool: Arc<SubchannelPool>,
    filters: FilterStack,
    state: Mutex<State>,
    notify: Notify,
    /// §6's fixed `user-agent` string for every call on this channel,
    /// computed once from the caller's primary/secondary overrides.
    user_agent: HeaderValue,
}

impl ChannelControlHelper for Inner {
    fn create_subchannel(
        &self,
        address: Address,
        connection_options: ConnectionOptions,
        keepalive: KeepaliveConfig,
    ) -> Subchannel {
        let key = crate::load_balancer::subchannel_key(
            &self.target.default_authority(),
            &address,
            self.credentials_identity(),
        );
        self.pool
            .get_or_create_subchannel(key, self.connector.clone(), connection_options, keepalive)
    }

    fn update_state(&self, state: ConnectivityState, picker: Arc<dyn Picker>) {
        debug!(%state, "channel: publishing new connectivity state");
        let mut st = self.state.lock().unwrap();
        st.connectivity = state;
        st.picker = picker;
        drop(st);
        self.notify.notify_waiters();
    }

    fn connector(&self) -> Arc<dyn Connector> {
        self.connector.clone()
    }

    fn update_service_config(&self, config: Option<ServiceConfig>) {
        self.state.lock().unwrap().service_config = config;
    }
}

impl Inner {
    fn credentials_identity(&self) -> &'static str {
        if self.credentials.connection_options().secure {
            "secure"
        } else {
            "insecure"
        }
    }

    /// §4.3 "Transport construction": the scheme and `:authority` a call's
    /// request URI carries, derived from whether `Credentials` calls for a
    /// secure scheme and from `ssl_target_name_override`
    /// (`server_name_override`) if one is set, the same override the
    /// subchannel itself uses for SNI.
    fn scheme_and_authority(&self) -> (http::uri::Scheme, String) {
        let options = self.credentials.connection_options();
        let scheme = if options.secure {
            http::uri::Scheme::HTTPS
        } else {
            http::uri::Scheme::HTTP
        };
        let authority = options
            .server_name_override
            .unwrap_or_else(|| self.target.default_authority());
        (scheme, authority)
    }
}

/// A client channel to one logical backend (possibly many addresses behind
/// a load balancing policy). Cheaply cloneable; every clone shares the
/// same resolver, pool, and picker.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<Inner>,
    rlb: Arc<ResolvingLoadBalancer>,
}

impl Channel {
    pub fn new(target: &str, options: ChannelOptions) -> Result<Self, crate::error::Error> {
        let parsed_target = Target::parse(target)?;
        let connector = options
            .connector
            .clone()
            .unwrap_or_else(|| Arc::new(DefaultConnector) as Arc<dyn Connector>);

        let user_agent = build_user_agent(
            options.primary_user_agent.as_deref(),
            options.secondary_user_agent.as_deref(),
        );
        let user_agent = HeaderValue::from_str(&user_agent).unwrap_or_else(|_| HeaderValue::from_static(CORE_USER_AGENT));

        let inner = Arc::new(Inner {
            target: parsed_target.clone(),
            credentials: options.credentials.clone(),
            connector,
            pool: SubchannelPool::new(),
            filters: FilterStack::default_stack(
                options.credentials.call_credentials(),
                options.default_timeout,
                CompressionFilter::new(options.send_compression),
            ),
            state: Mutex::new(State {
                connectivity: ConnectivityState::Idle,
                picker: Arc::new(QueuingPicker),
                shutdown: false,
                service_config: options.default_service_config.clone(),
            }),
            notify: Notify::new(),
            user_agent,
        });

        let resolver: Arc<dyn Resolver> = match &parsed_target {
            Target::Literal { .. } => Arc::new(
                StaticResolver::new(&parsed_target)
                    .expect("StaticResolver::new only returns None for Dns targets"),
            ),
            #[cfg(feature = "dns")]
            Target::Dns { host, port, .. } => Arc::new(DnsResolver::new(host.clone(), *port).map_err(|status| {
                crate::error::Error::msg(crate::error::ErrorKind::Resolve, status.message().to_string())
            })?),
            #[cfg(not(feature = "dns"))]
            Target::Dns { .. } => {
                return Err(crate::error::Error::msg(
                    crate::error::ErrorKind::Resolve,
                    "dns targets require the `dns` feature",
                ))
            }
        };

        let rlb = Arc::new(ResolvingLoadBalancer::new(
            parsed_target.default_authority(),
            resolver,
            inner.clone() as Arc<dyn ChannelControlHelper>,
            options.default_service_config,
        ));
        rlb.start();

        Ok(Self { inner, rlb })
    }

    /// The aggregate connectivity state, optionally nudging an IDLE channel
    /// to start connecting first.
    pub fn get_state(&self, try_to_connect: bool) -> ConnectivityState {
        let state = self.inner.state.lock().unwrap().connectivity;
        if try_to_connect && state == ConnectivityState::Idle {
            self.rlb.exit_idle();
        }
        state
    }

    /// Blocks until the connectivity state differs from `current`, or
    /// `deadline` passes. Returns whether it changed.
    pub async fn watch_connectivity_state(&self, current: ConnectivityState, deadline: Option<Instant>) -> bool {
        loop {
            {
                let state = self.inner.state.lock().unwrap();
                if state.connectivity != current {
                    return true;
                }
            }
            let notified = self.inner.notify.notified();
            match deadline {
                Some(d) => {
                    let remaining = d.saturating_duration_since(Instant::now());
                    if tokio::time::timeout(remaining, notified).await.is_err() {
                        return false;
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Runs the outbound filter stack, then picks (queuing and retrying
    /// across picker updates as needed) a subchannel to carry the call.
    /// Returns the picked subchannel, already call-ref'd, plus the
    /// filter-populated call context. The caller is responsible for
    /// releasing the call ref once the call stream ends.
    pub async fn create_call(
        &self,
        service: &str,
        method: &str,
        wait_for_ready: bool,
        deadline: Option<Instant>,
        metadata: MetadataMap,
    ) -> Result<(Subchannel, CallContext), Status> {
        let (shutdown, method_config) = {
            let state = self.inner.state.lock().unwrap();
            (
                state.shutdown,
                state
                    .service_config
                    .as_ref()
                    .and_then(|config| config.method_config_for(service, method))
                    .cloned(),
            )
        };
        if shutdown {
            return Err(Status::new(Code::Unavailable, "channel is closed"));
        }
        let (wait_for_ready, deadline) = apply_method_config_defaults(wait_for_ready, deadline, method_config.as_ref());

        // §4.3 "Composes request headers": `:authority`/scheme from the
        // target (or ssl_target_name_override), `content-type`, `te`, and
        // `user-agent` -- composed here, ahead of the filter chain, so an
        // `h2` client sees a URI with a scheme and authority (it otherwise
        // rejects the request outright) and every call carries the headers
        // §6 requires regardless of which filters are installed.
        let (scheme, authority) = self.inner.scheme_and_authority();
        let request = build_request(scheme, &authority, &self.inner.user_agent, service, method)?;

        let mut ctx = CallContext {
            request,
            service: service.to_string(),
            method: method.to_string(),
            wait_for_ready,
            deadline,
            metadata,
        };

        self.inner
            .filters
            .run_start_call(&mut ctx)
            .await
            .map_err(|status| self.inner.filters.run_on_close(&http::HeaderMap::new(), status))?;

        loop {
            if self.inner.state.lock().unwrap().shutdown {
                return Err(Status::new(Code::Unavailable, "channel is closed"));
            }

            let pick = {
                let picker = self.inner.state.lock().unwrap().picker.clone();
                picker.pick()
            };

            match pick {
                PickResult::Complete(Some(subchannel)) => {
                    subchannel.call_ref();
                    return Ok((subchannel, ctx));
                }
                PickResult::Complete(None) => {
                    return Err(Status::new(Code::Unavailable, "load balancer dropped the call"));
                }
                PickResult::TransientFailure(status) if !ctx.wait_for_ready => {
                    return Err(status);
                }
                PickResult::TransientFailure(_) | PickResult::Queue => {
                    self.rlb.exit_idle();
                    let notified = self.inner.notify.notified();
                    match ctx.deadline {
                        Some(d) => {
                            let remaining = d.saturating_duration_since(Instant::now());
                            if remaining.is_zero() {
                                return Err(Status::new(Code::DeadlineExceeded, "deadline exceeded while queued"));
                            }
                            if tokio::time::timeout(remaining, notified).await.is_err() {
                                return Err(Status::new(Code::DeadlineExceeded, "deadline exceeded while queued"));
                            }
                        }
                        None => notified.await,
                    }
                }
            }
        }
    }

    /// Shuts the channel down: tears down the resolving load balancer
    /// (which releases every subchannel it owns), publishes SHUTDOWN, and
    /// wakes every caller blocked in `create_call`/`watch_connectivity_state`
    /// so they observe the channel is closed rather than hanging forever.
    /// Idempotent.
    pub fn close(&self) {
        let mut state = self.inner.state.lock().unwrap();
        if state.shutdown {
            return;
        }
        state.shutdown = true;
        state.connectivity = ConnectivityState::Shutdown;
        state.picker = Arc::new(FailingPicker(Status::new(Code::Unavailable, "channel is closed")));
        drop(state);

        self.rlb.destroy();
        self.inner.notify.notify_waiters();
    }

    pub fn target(&self) -> &Target {
        &self.inner.target
    }
}

/// Fills in a call's `wait_for_ready`/`deadline` from the resolved service
/// config's per-method defaults (§4.6), but only where the caller left them
/// unset: an explicit per-call deadline or `wait_for_ready` always wins over
/// the config's default.
fn apply_method_config_defaults(
    wait_for_ready: bool,
    deadline: Option<Instant>,
    method_config: Option<&MethodConfig>,
) -> (bool, Option<Instant>) {
    let Some(method_config) = method_config else {
        return (wait_for_ready, deadline);
    };

    let wait_for_ready = wait_for_ready || method_config.wait_for_ready.unwrap_or(false);
    let deadline = deadline.or_else(|| method_config.timeout.map(|timeout| Instant::now() + timeout));
    (wait_for_ready, deadline)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Transport;
    use async_trait::async_trait;

    #[derive(Debug)]
    struct NeverConnects;

    #[async_trait]
    impl Connector for NeverConnects {
        async fn connect(&self, _address: &str, _opts: &ConnectionOptions) -> Result<Transport, crate::error::Error> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn starts_idle_and_transitions_to_connecting() {
        let channel = Channel::new(
            "10.0.0.1:443",
            ChannelOptions {
                connector: Some(Arc::new(NeverConnects)),
                ..ChannelOptions::default()
            },
        )
        .unwrap();
        assert!(channel
            .watch_connectivity_state(ConnectivityState::Idle, Some(Instant::now() + Duration::from_secs(1)))
            .await);
        assert_eq!(channel.get_state(false), ConnectivityState::Connecting);
    }

    #[tokio::test]
    async fn create_call_without_wait_for_ready_times_out_on_deadline() {
        let channel = Channel::new(
            "10.0.0.1:443",
            ChannelOptions {
                connector: Some(Arc::new(NeverConnects)),
                ..ChannelOptions::default()
            },
        )
        .unwrap();
        let deadline = Instant::now() + Duration::from_millis(50);
        let result = channel
            .create_call("Echo", "Say", false, Some(deadline), MetadataMap::new())
            .await;
        assert_eq!(result.unwrap_err().code(), Code::DeadlineExceeded);
    }

    #[tokio::test]
    async fn close_fails_pending_calls_with_unavailable() {
        let channel = Channel::new(
            "10.0.0.1:443",
            ChannelOptions {
                connector: Some(Arc::new(NeverConnects)),
                ..ChannelOptions::default()
            },
        )
        .unwrap();
        channel.close();
        let result = channel
            .create_call("Echo", "Say", false, None, MetadataMap::new())
            .await;
        assert_eq!(result.unwrap_err().code(), Code::Unavailable);
    }

    #[test]
    fn method_config_defaults_only_fill_in_unset_fields() {
        let (wait_for_ready, deadline) = apply_method_config_defaults(false, None, None);
        assert!(!wait_for_ready);
        assert!(deadline.is_none());

        let mc = MethodConfig {
            wait_for_ready: Some(true),
            timeout: Some(Duration::from_secs(5)),
            ..MethodConfig::default()
        };

        let (wait_for_ready, deadline) = apply_method_config_defaults(false, None, Some(&mc));
        assert!(wait_for_ready);
        assert!(deadline.unwrap() > Instant::now());

        // An explicit per-call deadline always wins over the config default.
        let explicit = Instant::now() + Duration::from_millis(10);
        let (wait_for_ready, deadline) = apply_method_config_defaults(true, Some(explicit), Some(&mc));
        assert!(wait_for_ready);
        assert_eq!(deadline, Some(explicit));
    }

    #[tokio::test]
    async fn create_call_applies_service_config_wait_for_ready_default() {
        let mut service_config = ServiceConfig::default();
        service_config.method_config.push(MethodConfig {
            name: vec![crate::service_config::MethodName {
                service: Some("Echo".to_string()),
                method: None,
            }],
            wait_for_ready: Some(true),
            timeout: Some(Duration::from_millis(50)),
            ..MethodConfig::default()
        });

        let channel = Channel::new(
            "10.0.0.1:443",
            ChannelOptions {
                connector: Some(Arc::new(NeverConnects)),
                default_service_config: Some(service_config),
                ..ChannelOptions::default()
            },
        )
        .unwrap();

        // `wait_for_ready: false` is overridden by the config's default, so
        // the call queues instead of failing immediately, and the config's
        // timeout eventually expires it.
        let result = channel
            .create_call("Echo", "Say", false, None, MetadataMap::new())
            .await;
        assert_eq!(result.unwrap_err().code(), Code::DeadlineExceeded);
    }

    #[test]
    fn build_request_sets_grpc_wire_headers_and_scheme_authority() {
        let user_agent = HeaderValue::from_str(&build_user_agent(Some("my-app/1.0"), None)).unwrap();
        let request = build_request(
            http::uri::Scheme::HTTP,
            "10.0.0.1:443",
            &user_agent,
            "Echo",
            "Say",
        )
        .unwrap();

        assert_eq!(request.uri().scheme_str(), Some("http"));
        assert_eq!(request.uri().authority().map(|a| a.as_str()), Some("10.0.0.1:443"));
        assert_eq!(request.uri().path(), "/Echo/Say");
        assert_eq!(request.headers().get(CONTENT_TYPE).unwrap(), "application/grpc");
        assert_eq!(request.headers().get(TE).unwrap(), "trailers");
        assert!(request.headers().get(USER_AGENT).unwrap().to_str().unwrap().contains("my-app/1.0"));
    }

    #[test]
    fn build_user_agent_joins_primary_and_secondary_around_the_core_token() {
        let agent = build_user_agent(Some("my-app/1.0"), Some("extra/2.0"));
        assert!(agent.starts_with("my-app/1.0 "));
        assert!(agent.ends_with(" extra/2.0"));
        assert!(agent.contains(CORE_USER_AGENT));
    }
}

//! DNS-backed resolution: A/AAAA lookup for addresses, optional TXT lookup
//! for a `grpc_config=` service config record, on a periodic schedule plus
//! on-demand `refresh`.
//!
//! Pulls in a purpose-built resolver crate (`hickory-resolver`) rather than
//! hand-rolling UDP/TCP DNS framing, the same way this crate reaches for
//! `h2` instead of hand-rolling HTTP/2.

use super::{Address, Listener, ResolutionResult, Resolver};
use crate::service_config::ServiceConfig;
use crate::status::{Code, Status};
use hickory_resolver::TokioAsyncResolver;
use rand::Rng;
use std::{
    net::IpAddr,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::sync::Notify;
use tracing::{debug, warn};

const MIN_RESOLUTION_INTERVAL: Duration = Duration::from_secs(30);
const SERVICE_CONFIG_TXT_PREFIX: &str = "grpc_config=";

struct Shared {
    host: String,
    port: u16,
    resolver: TokioAsyncResolver,
    refresh_notify: Notify,
    shutdown: Mutex<bool>,
    /// §4.2 step 6: a uniform percentage in `[0, 1)` drawn once at
    /// construction and reused for every resolution, so which TXT candidate
    /// gets selected is stable for this resolver's lifetime even as the
    /// candidate set's size varies across queries.
    service_config_selector: f64,
}

/// A resolver for `dns:host[:port]` targets. Each call to `start` spawns a
/// background loop that resolves once immediately, then waits for either
/// `MIN_RESOLUTION_INTERVAL` to elapse or an explicit `refresh` before
/// resolving again, until `shutdown`.
pub struct DnsResolver(Arc<Shared>);

impl DnsResolver {
    pub fn new(host: String, port: u16) -> Result<Self, Status> {
        let resolver = TokioAsyncResolver::tokio_from_system_conf().map_err(|e| {
            Status::new(
                Code::Unavailable,
                format!("failed to initialize DNS resolver: {e}"),
            )
        })?;
        Ok(Self(Arc::new(Shared {
            host,
            port,
            resolver,
            refresh_notify: Notify::new(),
            shutdown: Mutex::new(false),
            service_config_selector: rand::thread_rng().gen::<f64>(),
        })))
    }

    async fn resolve_once(&self) -> Result<ResolutionResult, Status> {
        let target_for_error = format!("{}:{}", self.0.host, self.0.port);
        let unavailable = |_| {
            Status::new(
                Code::Unavailable,
                format!("Name resolution failed for target dns:{target_for_error}"),
            )
        };

        // §4.2 step 3: the A+AAAA address lookup and the TXT service-config
        // lookup are independent queries against the same name server, run
        // concurrently rather than one after the other.
        let (lookup, (service_config, service_config_error)) =
            tokio::join!(self.0.resolver.lookup_ip(self.0.host.as_str()), self.lookup_service_config());
        let lookup = lookup.map_err(unavailable)?;

        // A-before-AAAA round-robin interleaving (§4.2 step 4, §8 boundary
        // example: A=[a1,a2], AAAA=[b1] -> [a1, b1, a2]): walk both lists in
        // lockstep rather than concatenating, so a single AAAA record isn't
        // starved behind a long A list.
        let mut v4: Vec<IpAddr> = Vec::new();
        let mut v6: Vec<IpAddr> = Vec::new();
        for ip in lookup.iter() {
            match ip {
                IpAddr::V4(_) => v4.push(ip),
                IpAddr::V6(_) => v6.push(ip),
            }
        }
        let addresses: Vec<Address> = interleave(v4, v6)
            .into_iter()
            .map(|ip| Address::new(ip, self.0.port))
            .collect();

        if addresses.is_empty() {
            return Err(Status::new(
                Code::Unavailable,
                format!("Name resolution failed for target dns:{target_for_error}"),
            ));
        }

        Ok(ResolutionResult {
            addresses,
            service_config,
            service_config_error,
        })
    }

    /// Looks up `_grpc_config.<host>` TXT records. Per §4.2 step 6/7: a
    /// successful TXT lookup with a parseable record yields
    /// `(Some(config), None)`; a failed TXT query yields `(None,
    /// Some(UNAVAILABLE))` so the caller still reports a successful address
    /// resolution with a service-config error attached, rather than failing
    /// the whole resolution.
    async fn lookup_service_config(&self) -> (Option<ServiceConfig>, Option<Status>) {
        let name = format!("_grpc_config.{}", self.0.host);
        let txt = match self.0.resolver.txt_lookup(name.as_str()).await {
            Ok(txt) => txt,
            Err(e) => {
                debug!(host = %self.0.host, error = %e, "dns: TXT query failed");
                return (
                    None,
                    Some(Status::new(Code::Unavailable, "TXT query failed")),
                );
            }
        };

        let candidates: Vec<String> = txt
            .iter()
            .flat_map(|record| record.txt_data().iter())
            .filter_map(|bytes| std::str::from_utf8(bytes).ok())
            .filter_map(|s| s.strip_prefix(SERVICE_CONFIG_TXT_PREFIX))
            .map(str::to_owned)
            .collect();

        if candidates.is_empty() {
            return (None, None);
        }

        // §4.2 step 6: the record to use is chosen by a random percentage
        // drawn once at construction time and reused here, so repeated
        // resolutions over this resolver's lifetime keep picking the same
        // candidate rather than redrawing on every query.
        let choice = &candidates[select_candidate(self.0.service_config_selector, candidates.len())];

        match ServiceConfig::parse(choice) {
            Ok(sc) => (Some(sc), None),
            Err(e) => {
                warn!(host = %self.0.host, error = %e, "dns: malformed service config TXT record, ignoring");
                (None, None)
            }
        }
    }
}

/// Maps a selector drawn uniformly from `[0, 1)` onto an index into a
/// `len`-candidate list. Pure so the same selector always resolves to the
/// same index for a given candidate count.
fn select_candidate(selector: f64, len: usize) -> usize {
    ((selector * len as f64) as usize).min(len.saturating_sub(1))
}

/// Round-robin-interleaves two address lists, `a` first on ties (§4.2 step
/// 4): `interleave([a1, a2], [b1])` -> `[a1, b1, a2]`.
fn interleave(a: Vec<IpAddr>, b: Vec<IpAddr>) -> Vec<IpAddr> {
    let mut out = Vec::with_capacity(a.len() + b.len());
    let mut a = a.into_iter();
    let mut b = b.into_iter();
    loop {
        match (a.next(), b.next()) {
            (Some(x), Some(y)) => {
                out.push(x);
                out.push(y);
            }
            (Some(x), None) => {
                out.push(x);
                out.extend(a.by_ref());
                break;
            }
            (None, Some(y)) => {
                out.push(y);
                out.extend(b.by_ref());
                break;
            }
            (None, None) => break,
        }
    }
    out
}

impl Resolver for DnsResolver {
    fn start(&self, listener: Arc<dyn Listener>) {
        let shared = self.0.clone();
        let this = DnsResolver(shared.clone());
        tokio::spawn(async move {
            loop {
                if *shared.shutdown.lock().unwrap() {
                    return;
                }
                match this.resolve_once().await {
                    Ok(result) => listener.on_result(result),
                    Err(status) => listener.on_error(status),
                }

                tokio::select! {
                    _ = tokio::time::sleep(MIN_RESOLUTION_INTERVAL) => {}
                    _ = shared.refresh_notify.notified() => {}
                }
            }
        });
    }

    fn refresh(&self) {
        self.0.refresh_notify.notify_one();
    }

    fn shutdown(&self) {
        *self.0.shutdown.lock().unwrap() = true;
        self.0.refresh_notify.notify_one();
    }
}

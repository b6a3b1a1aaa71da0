//! Shares `Subchannel`s with identical identity -- same channel target,
//! address, channel options, and credentials -- across load balancer
//! instances, so address-list churn on re-resolution doesn't tear down and
//! reconnect backends that are still present in the new list.
//!
//! A `Change<K, Endpoint>` stream of additions/removals covers one-shot
//! diffing elsewhere; this module generalizes that into a keyed store with
//! refcounting and a periodic sweep.

use crate::credentials::ConnectionOptions;
use crate::subchannel::{KeepaliveConfig, Subchannel};
use crate::transport::Connector;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};
use tracing::trace;

const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Identifies one logical subchannel: a `Subchannel` is shared between two
/// load balancer instances only if every field here matches exactly.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SubchannelKey {
    pub channel_target: String,
    pub address: String,
    /// A normalized rendering of whatever per-address channel options were
    /// supplied (e.g. TCP user timeout) -- callers are responsible for
    /// producing a canonical string so that equivalent options compare
    /// equal.
    pub options: String,
    /// Identifies the `Credentials` in effect, so subchannels using
    /// different call-credential plugins are never shared.
    pub credentials_identity: String,
}

struct Entry {
    subchannel: Subchannel,
}

/// A shared store of subchannels keyed by `SubchannelKey`. A process
/// typically has one pool per unique (target, credentials) pair, though
/// nothing prevents a single global pool.
pub struct SubchannelPool {
    entries: Mutex<HashMap<SubchannelKey, Entry>>,
    /// §4.4: the periodic sweep only runs while the pool has members, so an
    /// idle pool costs nothing; this flags whether the loop is currently
    /// scheduled so `get_or_create_subchannel` only spawns one.
    sweeping: Mutex<bool>,
}

impl SubchannelPool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            sweeping: Mutex::new(false),
        })
    }

    /// Returns the existing subchannel for `key` if present, taking an
    /// owner ref on it; otherwise constructs and inserts a new one in IDLE,
    /// also with an owner ref already applied. Either way the caller owns
    /// exactly one ref and must `unref` it when done.
    pub fn get_or_create_subchannel(
        self: &Arc<Self>,
        key: SubchannelKey,
        connector: Arc<dyn Connector>,
        connection_options: ConnectionOptions,
        keepalive: KeepaliveConfig,
    ) -> Subchannel {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get(&key) {
            entry.subchannel.owner_ref();
            return entry.subchannel.clone();
        }

        let subchannel = Subchannel::new(key.address.clone(), connector, connection_options, keepalive);
        subchannel.owner_ref();
        trace!(address = %key.address, "subchannel_pool: created new subchannel");
        entries.insert(key, Entry { subchannel: subchannel.clone() });
        drop(entries);
        self.ensure_sweeping();
        subchannel
    }

    /// Drops owner refs on every pooled subchannel not present in
    /// `keep_addresses` for the given channel target, shutting down (and
    /// later sweeping) any that become wholly unreferenced. Called by a
    /// load balancer after processing a fresh address list.
    ///
    /// §4.4: forces an immediate sweep so dropped entries don't linger
    /// until the next periodic tick.
    pub fn unref_unused_subchannels(&self, channel_target: &str, keep: &[SubchannelKey]) {
        {
            let entries = self.entries.lock().unwrap();
            for (key, entry) in entries.iter() {
                if key.channel_target == channel_target && !keep.contains(key) {
                    entry.subchannel.owner_unref();
                }
            }
        }
        self.sweep();
    }

    fn sweep(&self) {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|_, entry| {
            if entry.subchannel.is_unreferenced() {
                entry.subchannel.shutdown();
                false
            } else {
                true
            }
        });
        let removed = before - entries.len();
        if removed > 0 {
            trace!(removed, "subchannel_pool: swept unreferenced subchannels");
        }
        if entries.is_empty() {
            *self.sweeping.lock().unwrap() = false;
        }
    }

    /// Starts the periodic sweep loop if it isn't already running. The loop
    /// stops itself (§4.4 "halts the periodic task once empty") the next
    /// time `sweep` finds the pool empty, rather than running forever on an
    /// idle pool.
    fn ensure_sweeping(self: &Arc<Self>) {
        let mut sweeping = self.sweeping.lock().unwrap();
        if *sweeping {
            return;
        }
        *sweeping = true;
        drop(sweeping);

        let this = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(SWEEP_INTERVAL).await;
                this.sweep();
                if !*this.sweeping.lock().unwrap() {
                    return;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Connector, Transport};
    use async_trait::async_trait;

    #[derive(Debug)]
    struct NeverConnects;

    #[async_trait]
    impl Connector for NeverConnects {
        async fn connect(
            &self,
            _address: &str,
            _opts: &ConnectionOptions,
        ) -> Result<Transport, crate::error::Error> {
            std::future::pending().await
        }
    }

    fn key(addr: &str) -> SubchannelKey {
        SubchannelKey {
            channel_target: "dns:example.com".into(),
            address: addr.into(),
            options: String::new(),
            credentials_identity: "insecure".into(),
        }
    }

    #[tokio::test]
    async fn reuses_subchannel_for_identical_key() {
        let pool = SubchannelPool::new();
        let k = key("10.0.0.1:443");
        let a = pool.get_or_create_subchannel(
            k.clone(),
            Arc::new(NeverConnects),
            ConnectionOptions::default(),
            KeepaliveConfig::default(),
        );
        let b = pool.get_or_create_subchannel(
            k,
            Arc::new(NeverConnects),
            ConnectionOptions::default(),
            KeepaliveConfig::default(),
        );
        assert_eq!(a.address(), b.address());
    }

    #[tokio::test]
    async fn unref_unused_shuts_down_dropped_addresses() {
        let pool = SubchannelPool::new();
        let k = key("10.0.0.1:443");
        let sc = pool.get_or_create_subchannel(
            k.clone(),
            Arc::new(NeverConnects),
            ConnectionOptions::default(),
            KeepaliveConfig::default(),
        );
        pool.unref_unused_subchannels("dns:example.com", &[]);
        assert!(sc.is_unreferenced());
    }
}

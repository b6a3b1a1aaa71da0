//! §3 `Credentials`: `{getConnectionOptions() -> transport options or none;
//! getCallCredentials() -> metadata producer}`, composable.
//!
//! The wire TLS handshake itself is an external collaborator (§1
//! non-goals: "transport security primitives"); this module specifies only
//! the contract a [`crate::subchannel::Subchannel`] consumes to pick a
//! scheme and SNI (§4.3 "Transport construction"), plus the call-credential
//! hook the `call-credentials` filter (§4.8) invokes per call.

use crate::{metadata::MetadataMap, status::Status};
use async_trait::async_trait;
use std::{fmt, sync::Arc};

/// Connection-level options a `Credentials` implementation may impose on
/// the transport: whether to use a secure scheme, and under what identity
/// to validate the peer.
#[derive(Clone, Debug, Default)]
pub struct ConnectionOptions {
    pub secure: bool,
    /// SNI / identity override, independent of `ssl_target_name_override`
    /// on the channel (§4.3 takes the more specific of the two).
    pub server_name_override: Option<String>,
}

/// Produces per-call metadata (bearer tokens and the like) asynchronously;
/// the external "metadata plugin" (§1).
#[async_trait]
pub trait CallCredentials: Send + Sync {
    async fn get_request_metadata(&self) -> Result<MetadataMap, Status>;
}

/// The composable credentials contract consumed by the channel (§3, §4.3).
pub trait Credentials: Send + Sync + fmt::Debug {
    fn connection_options(&self) -> ConnectionOptions;
    fn call_credentials(&self) -> Option<Arc<dyn CallCredentials>> {
        None
    }
}

/// Plaintext HTTP/2, no per-call credentials.
#[derive(Debug, Clone, Copy, Default)]
pub struct Insecure;

impl Credentials for Insecure {
    fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions::default()
    }
}

/// Secure transport: defers the actual handshake to the caller-supplied
/// connector (§1 non-goal), but drives scheme/SNI selection itself, the
/// same split `ClientTlsConfig`/`Endpoint::tls_config` make elsewhere.
#[derive(Clone)]
pub struct Tls {
    domain_override: Option<String>,
    call_credentials: Option<Arc<dyn CallCredentials>>,
}

impl Tls {
    pub fn new() -> Self {
        Self {
            domain_override: None,
            call_credentials: None,
        }
    }

    /// Mirrors `ClientTlsConfig::domain_name`: overrides the SNI / identity
    /// check target independent of `ssl_target_name_override`.
    pub fn domain_name(mut self, domain: impl Into<String>) -> Self {
        self.domain_override = Some(domain.into());
        self
    }

    pub fn with_call_credentials(mut self, creds: Arc<dyn CallCredentials>) -> Self {
        self.call_credentials = Some(creds);
        self
    }
}

impl Default for Tls {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Tls {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tls")
            .field("domain_override", &self.domain_override)
            .finish()
    }
}

impl Credentials for Tls {
    fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            secure: true,
            server_name_override: self.domain_override.clone(),
        }
    }

    fn call_credentials(&self) -> Option<Arc<dyn CallCredentials>> {
        self.call_credentials.clone()
    }
}

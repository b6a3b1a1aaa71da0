//! The per-call middleware pipeline a `Channel` runs a request through
//! before handing it to a picked subchannel, and a response through before
//! handing it back to the caller.
//!
//! A fixed, ordered composition of small single-purpose layers (call
//! credentials, deadline, compression, metadata/status), the same shape a
//! `ServiceBuilder` stack of `tower::Layer`s would produce, but run through
//! an explicit `Filter` trait so the ordering works without a
//! `tower_service::Service` in the loop.

mod call_credentials;
pub(crate) mod compression;
mod deadline;
mod metadata_status;

pub use call_credentials::CallCredentialsFilter;
pub use compression::{CompressionEncoding, CompressionFilter};
pub use deadline::DeadlineFilter;
pub use metadata_status::MetadataStatusFilter;

use crate::metadata::MetadataMap;
use crate::status::Status;
use async_trait::async_trait;
use http::{HeaderMap, Request};
use std::sync::Arc;

/// The per-call context threaded through the filter stack: the outbound
/// request metadata, the method name, and whatever deadline applies,
/// mutated in place by each filter in turn.
pub struct CallContext {
    pub request: Request<()>,
    pub service: String,
    pub method: String,
    pub wait_for_ready: bool,
    pub deadline: Option<std::time::Instant>,
    /// Application metadata the caller attached to this call (§3), merged
    /// into `request`'s headers before any filter runs.
    pub metadata: MetadataMap,
}

/// One stage of the outbound pipeline. Filters run in the order they are
/// pushed onto the `FilterStack` and may short-circuit the call by
/// returning `Err`.
#[async_trait]
pub trait Filter: Send + Sync {
    async fn on_start_call(&self, ctx: &mut CallContext) -> Result<(), Status>;

    /// Inspects (and may rewrite) the status derived from response
    /// trailers/headers before it reaches the caller. The default
    /// implementation passes the status through unchanged.
    fn on_close(&self, _trailers: &HeaderMap, status: Status) -> Status {
        status
    }
}

/// A fixed, ordered composition of filters: call-credentials first (so
/// later filters see the metadata they add), then deadline, then
/// compression negotiation, then the metadata/status translation that
/// always runs last.
pub struct FilterStack {
    filters: Vec<Arc<dyn Filter>>,
}

impl FilterStack {
    pub fn new(filters: Vec<Arc<dyn Filter>>) -> Self {
        Self { filters }
    }

    /// The default ordering this runtime ships with: call-credentials,
    /// deadline, compression, metadata-status.
    pub fn default_stack(
        call_credentials: Option<Arc<dyn crate::credentials::CallCredentials>>,
        default_timeout: Option<std::time::Duration>,
        compression: CompressionFilter,
    ) -> Self {
        let mut filters: Vec<Arc<dyn Filter>> = Vec::new();
        if let Some(creds) = call_credentials {
            filters.push(Arc::new(CallCredentialsFilter::new(creds)));
        }
        filters.push(Arc::new(DeadlineFilter::new(default_timeout)));
        filters.push(Arc::new(compression));
        filters.push(Arc::new(MetadataStatusFilter));
        Self::new(filters)
    }

    pub async fn run_start_call(&self, ctx: &mut CallContext) -> Result<(), Status> {
        // §3's "application metadata" leg of the filter stack: fold the
        // caller's metadata into the outgoing headers before any filter
        // (call-credentials, deadline, ...) adds its own, so a filter never
        // sees a request with some metadata present and some still pending.
        let caller_metadata = std::mem::take(&mut ctx.metadata);
        for (name, value) in caller_metadata.into_headers() {
            if let Some(name) = name {
                ctx.request.headers_mut().append(name, value);
            }
        }

        for filter in &self.filters {
            filter.on_start_call(ctx).await?;
        }
        Ok(())
    }

    pub fn run_on_close(&self, trailers: &HeaderMap, status: Status) -> Status {
        self.filters
            .iter()
            .rev()
            .fold(status, |status, filter| filter.on_close(trailers, status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blank_ctx() -> CallContext {
        CallContext {
            request: Request::builder().body(()).unwrap(),
            service: "Echo".to_string(),
            method: "Say".to_string(),
            wait_for_ready: false,
            deadline: None,
            metadata: MetadataMap::new(),
        }
    }

    #[tokio::test]
    async fn run_start_call_merges_caller_metadata_into_request_headers() {
        let mut ctx = blank_ctx();
        ctx.metadata.insert("x-trace-id", "abc123");

        let stack = FilterStack::new(Vec::new());
        stack.run_start_call(&mut ctx).await.unwrap();

        assert_eq!(ctx.request.headers().get("x-trace-id").unwrap(), "abc123");
        assert!(ctx.metadata.iter().next().is_none());
    }
}

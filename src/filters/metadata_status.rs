//! If incoming metadata carries a `grpc-status` (the call's real outcome),
//! that always wins over whatever status the transport layer derived from
//! the HTTP `:status` or an RST_STREAM (§4.8, §7: "Trailer-derived status
//! takes precedence over transport-derived status whenever trailers were
//! received"). Runs first among the receive-side filters since it is the
//! last one pushed onto the `FilterStack` (§4.8 ordering).

use super::{CallContext, Filter};
use crate::status::Status;
use async_trait::async_trait;
use http::HeaderMap;

pub struct MetadataStatusFilter;

#[async_trait]
impl Filter for MetadataStatusFilter {
    async fn on_start_call(&self, _ctx: &mut CallContext) -> Result<(), Status> {
        Ok(())
    }

    fn on_close(&self, trailers: &HeaderMap, status: Status) -> Status {
        Status::from_header_map(trailers).unwrap_or(status)
    }
}

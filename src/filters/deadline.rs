//! Converts a caller-supplied deadline (or the method's configured default
//! timeout) into a `grpc-timeout` header, the way a `GrpcTimeout` tower
//! layer does for a fixed per-endpoint timeout.

use super::{CallContext, Filter};
use crate::status::Status;
use async_trait::async_trait;
use std::time::{Duration, Instant};

const GRPC_TIMEOUT_HEADER: &str = "grpc-timeout";

pub struct DeadlineFilter {
    default_timeout: Option<Duration>,
}

impl DeadlineFilter {
    pub fn new(default_timeout: Option<Duration>) -> Self {
        Self { default_timeout }
    }
}

#[async_trait]
impl Filter for DeadlineFilter {
    async fn on_start_call(&self, ctx: &mut CallContext) -> Result<(), Status> {
        let timeout = ctx
            .deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
            .or(self.default_timeout);

        let Some(timeout) = timeout else { return Ok(()) };

        if ctx.deadline.is_none() {
            ctx.deadline = Some(Instant::now() + timeout);
        }

        let header_value = encode_timeout(timeout);
        ctx.request.headers_mut().insert(
            GRPC_TIMEOUT_HEADER,
            http::HeaderValue::from_str(&header_value)
                .map_err(|e| Status::new(crate::status::Code::Internal, e.to_string()))?,
        );
        Ok(())
    }
}

/// Encodes a duration as `<value><unit>` using the largest unit that keeps
/// the value under the 8-digit limit the wire format allows, preferring
/// hours/minutes/seconds/milliseconds/microseconds/nanoseconds in that
/// order of coarseness.
fn encode_timeout(d: Duration) -> String {
    let nanos = d.as_nanos();
    if nanos % 3_600_000_000_000 == 0 && nanos / 3_600_000_000_000 < 100_000_000 {
        format!("{}H", nanos / 3_600_000_000_000)
    } else if nanos % 60_000_000_000 == 0 && nanos / 60_000_000_000 < 100_000_000 {
        format!("{}M", nanos / 60_000_000_000)
    } else if nanos % 1_000_000_000 == 0 && nanos / 1_000_000_000 < 100_000_000 {
        format!("{}S", nanos / 1_000_000_000)
    } else if nanos % 1_000_000 == 0 && nanos / 1_000_000 < 100_000_000 {
        format!("{}m", nanos / 1_000_000)
    } else if nanos % 1_000 == 0 && nanos / 1_000 < 100_000_000 {
        format!("{}u", nanos / 1_000)
    } else {
        format!("{}n", nanos.min(99_999_999))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_whole_seconds() {
        assert_eq!(encode_timeout(Duration::from_secs(5)), "5S");
    }

    #[test]
    fn encodes_sub_second_as_milliseconds() {
        assert_eq!(encode_timeout(Duration::from_millis(250)), "250m");
    }
}

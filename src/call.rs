//! §4.9 `CallStream`: drives one RPC end to end once a subchannel has been
//! picked -- attaches the HTTP/2 stream, frames outgoing messages, decodes
//! incoming ones, and resolves exactly once to a `finalStatus` however the
//! call ends (trailers, a bare HTTP status, or a transport error).
//!
//! The per-message framing loop works over the opaque byte frames
//! `codec::FrameDecoder` already produces rather than a typed
//! `Encoder`/`Decoder`, and folds a stream error into a `Status` through
//! `status::Status::from_error`'s downcast chain the same way a unary
//! response path would.

use crate::channel::Channel;
use crate::codec::{encode_frame, FrameDecoder};
use crate::filters::compression::negotiate_response_encoding;
use crate::filters::CallContext;
use crate::metadata::MetadataMap;
use crate::status::{Code, Status};
use crate::subchannel::Subchannel;
use bytes::Bytes;
use std::sync::Mutex;
use std::time::Instant;

/// A single RPC in flight. Dropping a `CallStream` before it reaches a
/// final status cancels it (§4.9 "Cancellation": dropping the caller's
/// handle is equivalent to `cancelWithStatus(CANCELLED, ...)`).
pub struct CallStream {
    subchannel: Subchannel,
    send: h2::SendStream<Bytes>,
    recv: RecvState,
    decoder: FrameDecoder,
    response_encoding: Option<crate::filters::CompressionEncoding>,
    send_encoding: Option<crate::filters::CompressionEncoding>,
    response_metadata: Option<MetadataMap>,
    final_status: Mutex<Option<Status>>,
    call_unreffed: bool,
    /// §4.8 "deadline": the point past which this call is cancelled with
    /// DEADLINE_EXCEEDED even if the server never answers. The
    /// `grpc-timeout` header only tells the *peer* about this; enforcing it
    /// locally is this field's job, raced against every await on the wire
    /// in `recv_message` (§8 scenario 6).
    deadline: Option<Instant>,
}

/// What one iteration of the receive loop accomplished, distinguishing
/// "decoder may now have a frame" from "the response is fully drained" so
/// `recv_message` knows whether to loop again or return `None`.
enum RecvTick {
    Continue,
    Finished,
}

enum RecvState {
    AwaitingHeaders(h2::client::ResponseFuture),
    Streaming(h2::RecvStream),
    Done,
}

impl CallStream {
    /// Picks a subchannel via `channel.create_call` and attaches an HTTP/2
    /// stream to it.
    pub async fn start(
        channel: &Channel,
        service: &str,
        method: &str,
        wait_for_ready: bool,
        deadline: Option<Instant>,
        metadata: MetadataMap,
    ) -> Result<Self, Status> {
        let (subchannel, ctx) = channel
            .create_call(service, method, wait_for_ready, deadline, metadata)
            .await?;
        Self::attach(subchannel, ctx).await
    }

    async fn attach(subchannel: Subchannel, ctx: CallContext) -> Result<Self, Status> {
        let deadline = ctx.deadline;
        let send_encoding = negotiate_send_encoding(&ctx);
        let (response_future, send_stream) = subchannel
            .start_call_stream(ctx.request)
            .await
            .map_err(|e| Status::from_error(&e))?;

        Ok(Self {
            subchannel,
            send: send_stream,
            recv: RecvState::AwaitingHeaders(response_future),
            decoder: FrameDecoder::new(),
            response_encoding: None,
            send_encoding,
            response_metadata: None,
            final_status: Mutex::new(None),
            call_unreffed: false,
            deadline,
        })
    }

    /// Frames and sends one outbound message. `end_of_stream` half-closes
    /// the send side, signalling no more messages will follow.
    pub fn send_message(&mut self, payload: &[u8], end_of_stream: bool) -> Result<(), Status> {
        let (compressed, bytes) = match self.send_encoding {
            Some(encoding) => (
                true,
                crate::filters::compression::compress(encoding, payload).map(Bytes::from)?,
            ),
            None => (false, Bytes::copy_from_slice(payload)),
        };
        let frame = encode_frame(&bytes, compressed);
        self.send
            .send_data(frame, end_of_stream)
            .map_err(|e| Status::from_error(&e))
    }

    /// Half-closes the send side with no further messages.
    pub fn finish_sending(&mut self) -> Result<(), Status> {
        self.send.send_data(Bytes::new(), true).map_err(|e| Status::from_error(&e))
    }

    /// The response headers' metadata, available once the first message
    /// (or the final status, for a headers-only response) has been
    /// observed.
    pub fn response_metadata(&self) -> Option<&MetadataMap> {
        self.response_metadata.as_ref()
    }

    /// Pulls the next complete message off the wire, `Ok(None)` once the
    /// server has finished sending (the caller should then await
    /// `final_status`).
    pub async fn recv_message(&mut self) -> Result<Option<Vec<u8>>, Status> {
        loop {
            if let Some(frame) = self.decoder.next_frame()? {
                return Ok(Some(self.decode_frame(frame)?));
            }

            if matches!(self.recv, RecvState::Done) {
                return Ok(None);
            }

            // §4.8/§8 scenario 6: a slow server that never answers must not
            // hang this call past its deadline. Races every wire await
            // against the deadline rather than a one-shot background
            // timer, so there is nothing to cancel/join on drop.
            let deadline_sleep = sleep_until_deadline(self.deadline);
            tokio::select! {
                biased;
                _ = deadline_sleep => {
                    self.cancel_with_status(Code::DeadlineExceeded, "deadline exceeded");
                    return Err(self.final_status().expect("cancel_with_status always sets final_status"));
                }
                tick = self.tick_recv() => {
                    match tick? {
                        RecvTick::Continue => {}
                        RecvTick::Finished => return Ok(None),
                    }
                }
            }
        }
    }

    /// One iteration of the receive state machine: advances past the
    /// response headers, or pulls and buffers the next body chunk, or
    /// drains trailers once the body is exhausted.
    async fn tick_recv(&mut self) -> Result<RecvTick, Status> {
        match &mut self.recv {
            RecvState::AwaitingHeaders(_) => {
                self.await_headers().await?;
                Ok(RecvTick::Continue)
            }
            RecvState::Streaming(body) => match body.data().await {
                Some(Ok(chunk)) => {
                    let len = chunk.len();
                    self.decoder.push(&chunk);
                    let _ = body.flow_control().release_capacity(len);
                    Ok(RecvTick::Continue)
                }
                Some(Err(e)) => {
                    let status = Status::from_error(&e);
                    self.recv = RecvState::Done;
                    self.set_final_status(status.clone());
                    Err(status)
                }
                None => {
                    self.finish_receiving().await;
                    Ok(RecvTick::Finished)
                }
            },
            RecvState::Done => Ok(RecvTick::Finished),
        }
    }

    async fn await_headers(&mut self) -> Result<(), Status> {
        let RecvState::AwaitingHeaders(_) = &self.recv else {
            return Ok(());
        };
        let RecvState::AwaitingHeaders(response_future) =
            std::mem::replace(&mut self.recv, RecvState::Done)
        else {
            unreachable!()
        };

        match response_future.await {
            Ok(response) => {
                let (parts, body) = response.into_parts();
                self.response_encoding = negotiate_response_encoding(&parts.headers)?;
                self.response_metadata = Some(MetadataMap::from_headers(parts.headers));

                if parts.status != http::StatusCode::OK {
                    let status = Status::from_http_status(parts.status);
                    self.recv = RecvState::Done;
                    self.set_final_status(status.clone());
                    return Err(status);
                }
                self.recv = RecvState::Streaming(body);
                Ok(())
            }
            Err(e) => {
                let status = Status::from_error(&e);
                self.recv = RecvState::Done;
                self.set_final_status(status.clone());
                Err(status)
            }
        }
    }

    async fn finish_receiving(&mut self) {
        let RecvState::Streaming(body) = std::mem::replace(&mut self.recv, RecvState::Done) else {
            return;
        };
        let trailers = body.trailers().await.ok().flatten().unwrap_or_default();

        // Trailer-derived status (§4.8, §7) wins over anything the HTTP
        // transport implied; a headers-only OK response with no
        // `grpc-status` trailer falls back to OK so a server that only
        // ever sends trailers on success doesn't spuriously fail.
        let base = Status::from_header_map(&trailers).unwrap_or_else(|| Status::ok(""));
        self.set_final_status(base);
        if let Some(metadata) = &mut self.response_metadata {
            metadata.merge(MetadataMap::from_headers(trailers));
        }
    }

    fn decode_frame(&mut self, (compressed, payload): (bool, Bytes)) -> Result<Vec<u8>, Status> {
        if compressed {
            let encoding = self
                .response_encoding
                .ok_or_else(|| Status::new(Code::Internal, "received compressed frame with no grpc-encoding"))?;
            crate::filters::compression::decompress(encoding, &payload)
        } else {
            Ok(payload.to_vec())
        }
    }

    /// Aborts the call immediately, resetting the HTTP/2 stream and
    /// latching `final_status` if it has not already been set. Further
    /// calls are no-ops (§4.9 "finalStatus is set exactly once").
    pub fn cancel_with_status(&mut self, code: Code, details: impl Into<String>) {
        let status = Status::new(code, details);
        if self.final_status.lock().unwrap().is_none() {
            self.send.send_reset(h2::Reason::CANCEL);
            self.set_final_status(status);
        }
        self.recv = RecvState::Done;
    }

    fn set_final_status(&mut self, status: Status) {
        let mut slot = self.final_status.lock().unwrap();
        if slot.is_none() {
            *slot = Some(status);
        }
    }

    /// The call's outcome, if it has concluded. `None` while still
    /// in-flight.
    pub fn final_status(&self) -> Option<Status> {
        self.final_status.lock().unwrap().clone()
    }
}

/// Resolves once `deadline` has passed, or never if there is none. Used to
/// race every blocking wire-await in `recv_message` against the call's
/// deadline without a separate background task to cancel on early return.
async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
        None => std::future::pending().await,
    }
}

fn negotiate_send_encoding(ctx: &CallContext) -> Option<crate::filters::CompressionEncoding> {
    ctx.request
        .headers()
        .get("grpc-encoding")
        .and_then(|v| v.to_str().ok())
        .and_then(crate::filters::CompressionEncoding::from_str)
}

impl Drop for CallStream {
    fn drop(&mut self) {
        if !self.call_unreffed {
            self.call_unreffed = true;
            if self.final_status().is_none() {
                self.send.send_reset(h2::Reason::CANCEL);
            }
            self.subchannel.call_unref();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::Code;

    #[test]
    fn final_status_is_set_exactly_once() {
        // A lightweight check of the latch semantics independent of a real
        // h2 stream: the same guard `set_final_status` uses.
        let slot: Mutex<Option<Status>> = Mutex::new(None);
        let set = |status: Status| {
            let mut s = slot.lock().unwrap();
            if s.is_none() {
                *s = Some(status);
            }
        };
        set(Status::new(Code::Unavailable, "first"));
        set(Status::new(Code::Ok, "second"));
        assert_eq!(slot.lock().unwrap().as_ref().unwrap().message(), "first");
    }
}

//! §8 end-to-end scenario 1: a literal-address target reaches READY and a
//! unary call completes with the server's trailer status, driven against a
//! real `h2` server rather than a mock `Connector` (every other test in
//! `src/` exercises the state machines against fakes; this one drives the
//! actual wire path once).

use bytes::Bytes;
use rpc_channel::channel::{Channel, ChannelOptions};
use rpc_channel::connectivity::ConnectivityState;
use rpc_channel::status::Code;
use rpc_channel::{CallStream, MetadataMap};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;

/// Serves every stream on one connection, echoing back whatever message
/// frame it received and closing with `grpc-status: 0`. Mirrors the usual
/// `h2` server shape: the outer loop keeps polling `accept()` for as long as
/// the connection lives, which is what actually drives queued writes (a
/// response built but never polled for never reaches the socket).
async fn serve_one_ok_unary(listener: TcpListener) {
    let (socket, _) = listener.accept().await.unwrap();
    let mut connection = h2::server::handshake(socket).await.unwrap();

    while let Some(result) = connection.accept().await {
        let (request, mut respond) = result.unwrap();
        tokio::spawn(async move {
            let mut body = request.into_body();
            let mut received = Vec::new();
            while let Some(chunk) = body.data().await {
                let chunk = chunk.unwrap();
                let len = chunk.len();
                received.extend_from_slice(&chunk);
                let _ = body.flow_control().release_capacity(len);
            }

            let response = http::Response::builder()
                .status(200)
                .header("content-type", "application/grpc")
                .body(())
                .unwrap();
            let mut send = respond.send_response(response, false).unwrap();
            send.send_data(Bytes::from(received), false).unwrap();

            let mut trailers = http::HeaderMap::new();
            trailers.insert("grpc-status", "0".parse().unwrap());
            send.send_trailers(trailers).unwrap();
        });
    }
}

#[tokio::test]
async fn unary_call_over_real_h2_completes_ok() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(serve_one_ok_unary(listener));

    let channel = Channel::new(&addr.to_string(), ChannelOptions::default()).unwrap();

    // Scenario 1: IDLE -> CONNECTING -> READY against a real listener.
    assert!(
        channel
            .watch_connectivity_state(
                ConnectivityState::Idle,
                Some(Instant::now() + Duration::from_secs(5))
            )
            .await
    );

    let mut call = CallStream::start(
        &channel,
        "Echo",
        "Say",
        false,
        Some(Instant::now() + Duration::from_secs(5)),
        MetadataMap::new(),
    )
    .await
    .unwrap();

    call.send_message(b"hello", true).unwrap();

    let echoed = call.recv_message().await.unwrap();
    assert_eq!(echoed.as_deref(), Some(&b"hello"[..]));

    let end = call.recv_message().await.unwrap();
    assert!(end.is_none());
    assert_eq!(call.final_status().unwrap().code(), Code::Ok);

    channel.close();
}

/// Accepts the stream and sends response headers, then never answers --
/// simulating a server that has stalled mid-request.
async fn serve_one_slow_unary(listener: TcpListener) {
    let (socket, _) = listener.accept().await.unwrap();
    let mut connection = h2::server::handshake(socket).await.unwrap();

    if let Some(result) = connection.accept().await {
        let (_request, mut respond) = result.unwrap();
        let response = http::Response::builder()
            .status(200)
            .header("content-type", "application/grpc")
            .body(())
            .unwrap();
        // Headers only, body/trailers never sent: the client must give up on
        // its own deadline rather than wait forever.
        let _send = respond.send_response(response, false).unwrap();
        std::future::pending::<()>().await;
    }
}

#[tokio::test]
async fn scenario_6_deadline_exceeded_while_server_is_slow() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(serve_one_slow_unary(listener));

    let channel = Channel::new(&addr.to_string(), ChannelOptions::default()).unwrap();
    assert!(
        channel
            .watch_connectivity_state(
                ConnectivityState::Idle,
                Some(Instant::now() + Duration::from_secs(5))
            )
            .await
    );

    let mut call = CallStream::start(
        &channel,
        "Echo",
        "Say",
        false,
        Some(Instant::now() + Duration::from_millis(50)),
        MetadataMap::new(),
    )
    .await
    .unwrap();

    call.send_message(b"hello", true).unwrap();

    let result = call.recv_message().await;
    assert_eq!(result.unwrap_err().code(), Code::DeadlineExceeded);
    assert_eq!(call.final_status().unwrap().code(), Code::DeadlineExceeded);

    // §4.9: a second cancel after the deadline already latched the status
    // is a no-op.
    call.cancel_with_status(Code::Cancelled, "late cancel");
    assert_eq!(call.final_status().unwrap().code(), Code::DeadlineExceeded);

    channel.close();
}

#[tokio::test]
async fn connecting_to_a_closed_port_reaches_transient_failure() {
    // Bind then immediately drop the listener so the port refuses connections.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let channel = Channel::new(&addr.to_string(), ChannelOptions::default()).unwrap();

    let reached_failure = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if channel.get_state(false) == ConnectivityState::TransientFailure {
                return;
            }
            channel
                .watch_connectivity_state(
                    channel.get_state(false),
                    Some(Instant::now() + Duration::from_secs(5)),
                )
                .await;
        }
    })
    .await;

    assert!(reached_failure.is_ok());
    channel.close();
}

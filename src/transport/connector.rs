use crate::credentials::ConnectionOptions;
use crate::error::{Error, ErrorKind};
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::oneshot;

/// §4.3 "Connect timing": a connect attempt is given at least this long to
/// reach READY before it is declared failed, so a dial that refuses or
/// errors out quickly still falls straight through to TRANSIENT_FAILURE,
/// while a dial that hangs (a black-holed address, a slow TLS handshake) is
/// eventually bounded instead of stalling the subchannel forever.
const MIN_CONNECT_BUDGET: Duration = Duration::from_secs(20);

/// Why a [`Transport`] stopped serving new streams.
#[derive(Debug)]
pub enum CloseReason {
    /// The peer sent GOAWAY with the given last-stream-id and debug data.
    GoAway {
        reason: h2::Reason,
        debug_data: Bytes,
    },
    /// The connection driver future ended without an explicit GOAWAY (reset,
    /// EOF, I/O error).
    Closed(Option<Error>),
}

/// Cheap, cloneable handle used to dispatch new HTTP/2 streams on a live
/// connection. `h2::client::SendRequest` clones are backed by the same
/// underlying connection, so concurrent calls each get their own handle
/// instead of fighting the connection-lifetime watchers below for
/// ownership of a single shared value.
#[derive(Clone)]
pub struct RequestSender(h2::client::SendRequest<Bytes>);

impl RequestSender {
    /// Waits for the connection to be ready to accept another stream, then
    /// starts a new request. The framing of that request/response body is
    /// the caller's responsibility (`crate::call_stream` non-goal: we do not
    /// parse HTTP/2 frames here, only hand out streams).
    pub async fn send_request(
        &mut self,
        request: http::Request<()>,
        end_of_stream: bool,
    ) -> Result<(h2::client::ResponseFuture, h2::SendStream<Bytes>), Error> {
        self.0
            .ready()
            .await
            .map_err(|e| Error::from_source(ErrorKind::Connect, e))?;
        self.0
            .send_request(request, end_of_stream)
            .map_err(|e| Error::from_source(ErrorKind::Connect, e))
    }
}

/// Sends a keepalive PING on `pp` and waits for the matching PONG. A
/// timeout on this future is the caller's signal of a keepalive failure.
pub async fn ping_pong_roundtrip(pp: &mut h2::PingPong) -> Result<(), Error> {
    let ping = h2::Ping::opaque();
    pp.send_ping(ping).map_err(|e| Error::from_source(ErrorKind::Connect, e))?;
    pp.recv_pong().await.map_err(|e| Error::from_source(ErrorKind::Connect, e))?;
    Ok(())
}

/// A live HTTP/2 connection to one address. Consumed once via
/// `into_parts`: the cloneable stream-dispatch handle goes to call
/// dispatch, while the keepalive pinger and close-watcher each take
/// exclusive ownership of the one piece they need for the connection's
/// entire lifetime, rather than all three sharing a single `Option<Transport>`
/// fought over via take/replace.
pub struct Transport {
    send_request: h2::client::SendRequest<Bytes>,
    ping_pong: Option<h2::PingPong>,
    closed: oneshot::Receiver<CloseReason>,
}

impl Transport {
    pub fn into_parts(self) -> (RequestSender, Option<h2::PingPong>, oneshot::Receiver<CloseReason>) {
        (RequestSender(self.send_request), self.ping_pong, self.closed)
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport").finish_non_exhaustive()
    }
}

/// Establishes a [`Transport`] to one address. The default implementation
/// speaks plaintext HTTP/2 over TCP; a TLS-capable connector wraps it and is
/// selected by the channel's `Credentials::connection_options`.
#[async_trait]
pub trait Connector: Send + Sync + fmt::Debug {
    async fn connect(&self, address: &str, opts: &ConnectionOptions) -> Result<Transport, Error>;
}

/// `h2::client::handshake` over a plain `TcpStream`. TLS is layered on top
/// by a caller-supplied connector (transport security is an external
/// collaborator); this is the connector a channel gets by default when its
/// `Credentials` reports a plaintext scheme.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultConnector;

#[async_trait]
impl Connector for DefaultConnector {
    async fn connect(&self, address: &str, _opts: &ConnectionOptions) -> Result<Transport, Error> {
        match tokio::time::timeout(MIN_CONNECT_BUDGET, Self::dial(address)).await {
            Ok(result) => result,
            Err(_) => Err(Error::msg(
                ErrorKind::Connect,
                "connect did not complete within the minimum connect budget",
            )),
        }
    }
}

impl DefaultConnector {
    async fn dial(address: &str) -> Result<Transport, Error> {
        let tcp = TcpStream::connect(address)
            .await
            .map_err(|e| Error::from_source(ErrorKind::Connect, e))?;
        tcp.set_nodelay(true)
            .map_err(|e| Error::from_source(ErrorKind::Connect, e))?;

        let (send_request, connection) = h2::client::Builder::new()
            .enable_push(false)
            .handshake(tcp)
            .await
            .map_err(|e| Error::from_source(ErrorKind::Connect, e))?;

        Ok(HyperTransport::spawn(send_request, connection))
    }
}

/// Drives an `h2::client::Connection` to completion on a background task
/// and converts its terminal state into a `CloseReason` delivered through a
/// oneshot, so `Transport` itself stays a plain value the Subchannel can
/// hold without also polling a driver future.
pub struct HyperTransport;

impl HyperTransport {
    pub fn spawn<T>(
        send_request: h2::client::SendRequest<Bytes>,
        mut connection: h2::client::Connection<T>,
    ) -> Transport
    where
        T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let ping_pong = connection.ping_pong();
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let result = std::future::poll_fn(|cx| connection.poll_closed(cx)).await;
            let reason = match result {
                Ok(()) => CloseReason::Closed(None),
                Err(e) if e.is_go_away() => CloseReason::GoAway {
                    reason: e.reason().unwrap_or(h2::Reason::NO_ERROR),
                    debug_data: Bytes::new(),
                },
                Err(e) => CloseReason::Closed(Some(Error::from_source(ErrorKind::Connect, e))),
            };
            let _ = tx.send(reason);
        });

        Transport {
            send_request,
            ping_pong,
            closed: rx,
        }
    }
}

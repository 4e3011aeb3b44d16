//! Forwarding public traffic over borrowed tunnel sockets

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use burrow_broker::{BrokerEvent, SocketBroker};
use bytes::Bytes;
use futures::FutureExt;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::state::{BridgeInput, BridgeState};

/// How long a tunnel survives with no client socket connected
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(1);

/// Raw request line and headers, as read off the wire
///
/// Header names keep their original case and order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
    /// Minor HTTP/1 version
    pub version: u8,
    pub headers: Vec<(String, Vec<u8>)>,
}

impl RequestHead {
    /// First header with this name, compared case-insensitively
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_slice())
    }

    /// Serialize back to `METHOD PATH HTTP/1.x`, headers, blank line
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(
            format!("{} {} HTTP/1.{}\r\n", self.method, self.path, self.version).as_bytes(),
        );
        for (name, value) in &self.headers {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value);
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out
    }
}

/// Forwards requests and upgraded connections for one tunnel
///
/// Also owns the tunnel's presence state: once the client has no socket
/// left, the bridge closes itself unless one comes back within the grace
/// period.
pub struct RequestBridge {
    tunnel_id: String,
    broker: Arc<SocketBroker>,
    state: watch::Receiver<BridgeState>,
    closed: CancellationToken,
}

impl RequestBridge {
    /// Must be called from within a tokio runtime
    pub fn new(broker: Arc<SocketBroker>, grace_period: Duration) -> Self {
        let events = broker.take_events();
        if events.is_none() {
            warn!(
                "Tunnel {}: broker events already taken, presence will not be tracked",
                broker.tunnel_id()
            );
        }
        Self::with_events(broker, events, grace_period)
    }

    pub(crate) fn with_events(
        broker: Arc<SocketBroker>,
        events: Option<mpsc::UnboundedReceiver<BrokerEvent>>,
        grace_period: Duration,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(BridgeState::Created);
        let closed = CancellationToken::new();
        let tunnel_id = broker.tunnel_id().to_string();

        tokio::spawn(supervise(
            tunnel_id.clone(),
            broker.clone(),
            events,
            state_tx,
            grace_period,
            closed.clone(),
        ));

        Self {
            tunnel_id,
            broker,
            state: state_rx,
            closed,
        }
    }

    pub fn tunnel_id(&self) -> &str {
        &self.tunnel_id
    }

    pub fn state(&self) -> BridgeState {
        *self.state.borrow()
    }

    /// Watch presence transitions
    pub fn subscribe(&self) -> watch::Receiver<BridgeState> {
        self.state.clone()
    }

    /// Resolves once the bridge is closed, for whatever reason
    pub fn closed(&self) -> impl Future<Output = ()> + Send + 'static {
        let token = self.closed.clone();
        async move { token.cancelled().await }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Close the bridge and its broker; repeated calls are no-ops
    pub fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        debug!("Tunnel {}: closing bridge", self.tunnel_id);
        self.closed.cancel();
        self.broker.shutdown();
    }

    /// Replay `req` over a borrowed socket and stream the answer back
    ///
    /// Any failure before response headers arrive yields `502 Bad Gateway`.
    pub async fn handle_request<B>(&self, req: Request<B>) -> Response<Body>
    where
        B: hyper::body::Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let socket = match self.broker.borrow().await {
            Ok(socket) => socket,
            Err(e) => {
                debug!("Tunnel {}: no socket for request: {}", self.tunnel_id, e);
                return bad_gateway();
            }
        };

        trace!(
            "Tunnel {}: {} {} over socket {}",
            self.tunnel_id,
            req.method(),
            req.uri(),
            socket.id()
        );

        let (mut sender, conn) = match hyper::client::conn::http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(true)
            .handshake(TokioIo::new(socket))
            .await
        {
            Ok(parts) => parts,
            Err(e) => {
                debug!("Tunnel {}: handshake failed: {}", self.tunnel_id, e);
                return bad_gateway();
            }
        };

        let tunnel_id = self.tunnel_id.clone();
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("Tunnel {}: upstream connection error: {}", tunnel_id, e);
            }
        });

        match sender.send_request(req).await {
            Ok(response) => response.map(Body::new),
            Err(e) => {
                debug!("Tunnel {}: upstream failed before response: {}", self.tunnel_id, e);
                bad_gateway()
            }
        }
    }

    /// Splice an upgraded public connection onto a borrowed socket
    ///
    /// `leftover` holds bytes the caller sent after the request head.
    pub async fn handle_upgrade(&self, head: &RequestHead, leftover: Bytes, mut caller: TcpStream) {
        let mut peek_buf = [0u8; 1];
        let mut watching = true;

        let borrow = self.broker.borrow();
        tokio::pin!(borrow);

        let borrowed = loop {
            tokio::select! {
                biased;
                borrowed = &mut borrow => break borrowed,
                peeked = caller.peek(&mut peek_buf), if watching => match peeked {
                    Ok(0) | Err(_) => {
                        debug!("Tunnel {}: caller left while waiting for a socket", self.tunnel_id);
                        return;
                    }
                    Ok(_) => watching = false,
                },
            }
        };

        let mut socket = match borrowed {
            Ok(socket) => socket,
            Err(e) => {
                debug!("Tunnel {}: no socket for upgrade: {}", self.tunnel_id, e);
                return;
            }
        };

        if watching {
            if let Some(Ok(0) | Err(_)) = caller.peek(&mut peek_buf).now_or_never() {
                debug!("Tunnel {}: caller gone, discarding socket {}", self.tunnel_id, socket.id());
                return;
            }
        }

        if let Err(e) = socket.write_all(&head.encode()).await {
            debug!("Tunnel {}: failed to write upgrade head: {}", self.tunnel_id, e);
            return;
        }
        if !leftover.is_empty() {
            if let Err(e) = socket.write_all(&leftover).await {
                debug!("Tunnel {}: failed to write upgrade body: {}", self.tunnel_id, e);
                return;
            }
        }

        match tokio::io::copy_bidirectional(&mut caller, &mut socket).await {
            Ok((up, down)) => trace!(
                "Tunnel {}: upgraded connection done ({} bytes up, {} down)",
                self.tunnel_id,
                up,
                down
            ),
            Err(e) => debug!("Tunnel {}: upgraded connection error: {}", self.tunnel_id, e),
        }
    }
}

impl Drop for RequestBridge {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

fn bad_gateway() -> Response<Body> {
    let mut response = Response::new(Body::from("Bad Gateway"));
    *response.status_mut() = StatusCode::BAD_GATEWAY;
    response
}

async fn next_event(events: &mut Option<mpsc::UnboundedReceiver<BrokerEvent>>) -> Option<BrokerEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Drive the presence state machine until the bridge closes
async fn supervise(
    tunnel_id: String,
    broker: Arc<SocketBroker>,
    mut events: Option<mpsc::UnboundedReceiver<BrokerEvent>>,
    state: watch::Sender<BridgeState>,
    grace_period: Duration,
    closed: CancellationToken,
) {
    let mut grace_deadline: Option<Instant> = None;

    loop {
        let input = tokio::select! {
            _ = closed.cancelled() => BridgeInput::Close,
            _ = tokio::time::sleep_until(grace_deadline.unwrap_or_else(Instant::now)),
                if grace_deadline.is_some() => BridgeInput::GraceExpired,
            event = next_event(&mut events) => match event {
                Some(BrokerEvent::Online) => BridgeInput::SocketOnline,
                Some(BrokerEvent::Offline) => BridgeInput::SocketOffline,
                Some(BrokerEvent::End) | None => BridgeInput::BrokerEnd,
            },
        };

        let current = *state.borrow();
        let next = match current.next(input) {
            Ok(next) => next,
            Err(e) => {
                debug!("Tunnel {}: {}", tunnel_id, e);
                continue;
            }
        };

        if next != current {
            state.send_replace(next);
        }

        match next {
            BridgeState::Online => {
                if current == BridgeState::Offline {
                    info!("Tunnel {}: client back online", tunnel_id);
                }
                grace_deadline = None;
            }
            BridgeState::Offline => {
                info!(
                    "Tunnel {}: client offline, closing in {:?} unless it reconnects",
                    tunnel_id, grace_period
                );
                grace_deadline = Some(Instant::now() + grace_period);
            }
            BridgeState::Closed => {
                if input == BridgeInput::GraceExpired {
                    info!("Tunnel {}: client did not reconnect, closing", tunnel_id);
                }
                break;
            }
            BridgeState::Created => {}
        }
    }

    broker.shutdown();
    closed.cancel();
}

//! Socket pool lending client connections to the request bridge
//!
//! Every socket owned by a broker is in exactly one place: idle in the pool
//! (watched for disconnects), lent to a borrower, or gone. Bytes a client
//! sends while idle are buffered and replayed to the borrower. The connected
//! count follows accepted sockets minus dropped ones and never exceeds
//! `max_sockets`.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use bytes::{Buf, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::port::{PortFinder, RangePortFinder};

/// Socket broker errors
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker already started")]
    AlreadyStarted,

    #[error("broker closed")]
    Closed,

    #[error("no free port in range {start}-{end}")]
    NoFreePort { start: u16, end: u16 },

    #[error("failed to bind broker listener on {address}: {source}")]
    Bind {
        address: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Presence transitions reported by a broker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerEvent {
    /// The connected count went from 0 to 1
    Online,
    /// The connected count dropped to 0
    Offline,
    /// The listener is gone; no socket will ever be accepted again
    End,
}

/// Broker configuration
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Tunnel id, used in logs
    pub tunnel_id: String,
    /// Maximum number of sockets held at once
    pub max_sockets: usize,
    /// Address the listener binds to
    pub bind_ip: IpAddr,
    /// Inclusive port range to bind in; any free port when `None`
    pub port_range: Option<(u16, u16)>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            tunnel_id: String::new(),
            max_sockets: DEFAULT_MAX_SOCKETS,
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port_range: None,
        }
    }
}

const DEFAULT_MAX_SOCKETS: usize = 10;

type Reply = oneshot::Sender<Result<BrokeredSocket, BrokerError>>;

/// Pool entry for an idle socket; the socket itself lives in its watcher task
struct IdleSocket {
    id: u64,
    claim: oneshot::Sender<Reply>,
}

struct PoolState {
    connected: usize,
    available: VecDeque<IdleSocket>,
    pending: VecDeque<Reply>,
    closed: bool,
}

struct BrokerInner {
    tunnel_id: String,
    max_sockets: usize,
    state: Mutex<PoolState>,
    events: mpsc::UnboundedSender<BrokerEvent>,
    next_socket_id: AtomicU64,
    shutdown: CancellationToken,
}

impl BrokerInner {
    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: BrokerEvent) {
        // Nobody listening is fine
        let _ = self.events.send(event);
    }

    fn on_connection(self: &Arc<Self>, stream: TcpStream, peer_addr: SocketAddr) {
        let id = {
            let mut state = self.state();

            if state.closed {
                debug!("Tunnel {}: broker closed, dropping {}", self.tunnel_id, peer_addr);
                return;
            }

            if state.connected >= self.max_sockets {
                warn!(
                    "Tunnel {}: no more sockets allowed ({} connected), dropping {}",
                    self.tunnel_id, state.connected, peer_addr
                );
                return;
            }

            if state.connected == 0 {
                self.emit(BrokerEvent::Online);
            }
            state.connected += 1;

            debug!(
                "Tunnel {}: new connection from {} [{}]",
                self.tunnel_id, peer_addr, state.connected
            );

            self.next_socket_id.fetch_add(1, Ordering::Relaxed)
        };

        let socket = BrokeredSocket {
            stream,
            pending: BytesMut::new(),
            lease: SocketLease {
                id,
                broker: self.clone(),
            },
        };

        self.place(socket);
    }

    /// Hand a socket to the oldest live borrower, or park it in the pool
    fn place(self: &Arc<Self>, socket: BrokeredSocket) {
        let mut state = self.state();

        if state.closed {
            // Dropping the socket takes the lock again
            drop(state);
            drop(socket);
            return;
        }

        while let Some(reply) = state.pending.pop_front() {
            if reply.is_closed() {
                continue;
            }
            drop(state);

            trace!(
                "Tunnel {}: giving socket {} to queued borrower",
                self.tunnel_id,
                socket.id()
            );

            // Delivered from a fresh task, never from inside the accept path
            let inner = self.clone();
            tokio::spawn(async move {
                if let Err(Ok(socket)) = reply.send(Ok(socket)) {
                    inner.place(socket);
                }
            });
            return;
        }

        let (claim_tx, claim_rx) = oneshot::channel();
        state.available.push_back(IdleSocket {
            id: socket.id(),
            claim: claim_tx,
        });
        drop(state);

        tokio::spawn(watch_idle(self.clone(), socket, claim_rx));
    }

    /// Serve a borrower from the pool or queue it
    fn request(&self, mut reply: Reply, front: bool) {
        let mut state = self.state();

        if state.closed {
            drop(state);
            let _ = reply.send(Err(BrokerError::Closed));
            return;
        }

        while let Some(idle) = state.available.pop_front() {
            match idle.claim.send(reply) {
                Ok(()) => {
                    trace!("Tunnel {}: socket {} given", self.tunnel_id, idle.id);
                    return;
                }
                // Watcher already gone, try the next idle socket
                Err(returned) => reply = returned,
            }
        }

        if front {
            state.pending.push_front(reply);
        } else {
            state.pending.push_back(reply);
        }

        debug!(
            "Tunnel {}: waiting for a socket ({} connected, {} waiting)",
            self.tunnel_id,
            state.connected,
            state.pending.len()
        );
    }

    /// Remove an idle entry; false when a borrower already claimed it
    fn remove_idle(&self, id: u64) -> bool {
        let mut state = self.state();
        match state.available.iter().position(|idle| idle.id == id) {
            Some(index) => {
                state.available.remove(index);
                true
            }
            None => false,
        }
    }

    fn release(&self, id: u64) {
        let mut state = self.state();

        state.connected = state.connected.saturating_sub(1);
        if let Some(index) = state.available.iter().position(|idle| idle.id == id) {
            state.available.remove(index);
        }

        debug!(
            "Tunnel {}: socket {} closed, {} connected",
            self.tunnel_id, id, state.connected
        );

        if state.connected == 0 {
            debug!("Tunnel {}: all sockets disconnected", self.tunnel_id);
            self.emit(BrokerEvent::Offline);
        }
    }

    fn close(&self) {
        let (idle, pending) = {
            let mut state = self.state();
            if state.closed {
                return;
            }
            state.closed = true;
            (
                std::mem::take(&mut state.available),
                std::mem::take(&mut state.pending),
            )
        };

        self.shutdown.cancel();

        for reply in pending {
            let _ = reply.send(Err(BrokerError::Closed));
        }

        // Watchers see their claim channel drop and release the sockets
        drop(idle);

        info!("Tunnel {}: broker closed", self.tunnel_id);
        self.emit(BrokerEvent::End);
    }
}

/// Most unsolicited bytes an idle socket may hold before it is dropped
const MAX_IDLE_BUFFER: usize = 64 * 1024;

enum IdleEvent {
    Claimed(Result<Reply, oneshot::error::RecvError>),
    Read(io::Result<usize>),
}

/// Own an idle socket until a borrower claims it or the client hangs up
async fn watch_idle(
    inner: Arc<BrokerInner>,
    mut socket: BrokeredSocket,
    mut claim: oneshot::Receiver<Reply>,
) {
    loop {
        let event = tokio::select! {
            biased;
            claimed = &mut claim => IdleEvent::Claimed(claimed),
            read = socket.stream.read_buf(&mut socket.pending) => IdleEvent::Read(read),
        };

        match event {
            IdleEvent::Claimed(Ok(reply)) => {
                if let Err(Ok(socket)) = reply.send(Ok(socket)) {
                    inner.place(socket);
                }
                return;
            }
            // Pool drained on shutdown
            IdleEvent::Claimed(Err(_)) => return,
            IdleEvent::Read(Ok(n)) if n > 0 && socket.pending.len() <= MAX_IDLE_BUFFER => {
                trace!(
                    "Tunnel {}: idle socket {} buffered {} bytes",
                    inner.tunnel_id,
                    socket.id(),
                    socket.pending.len()
                );
            }
            IdleEvent::Read(read) => {
                if matches!(read, Ok(n) if n > 0) {
                    warn!(
                        "Tunnel {}: idle socket {} sent more than {} bytes, dropping",
                        inner.tunnel_id,
                        socket.id(),
                        MAX_IDLE_BUFFER
                    );
                }
                if !inner.remove_idle(socket.id()) {
                    // Claimed while we noticed the hangup; requeue the borrower first in line
                    if let Ok(reply) = claim.try_recv() {
                        drop(socket);
                        inner.request(reply, true);
                        return;
                    }
                }
                return;
            }
        }
    }
}

/// Returns the socket's slot to the broker when dropped
struct SocketLease {
    id: u64,
    broker: Arc<BrokerInner>,
}

impl Drop for SocketLease {
    fn drop(&mut self) {
        self.broker.release(self.id);
    }
}

/// A client socket lent out by a [`SocketBroker`]
///
/// Dropping it closes the connection and frees its slot in the broker.
pub struct BrokeredSocket {
    stream: TcpStream,
    /// Read while idle, served before the stream
    pending: BytesMut,
    lease: SocketLease,
}

impl BrokeredSocket {
    /// Broker-local socket number
    pub fn id(&self) -> u64 {
        self.lease.id
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }
}

impl fmt::Debug for BrokeredSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokeredSocket")
            .field("id", &self.lease.id)
            .field("tunnel", &self.lease.broker.tunnel_id)
            .finish()
    }
}

impl AsyncRead for BrokeredSocket {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.pending.has_remaining() {
            let n = this.pending.len().min(buf.remaining());
            buf.put_slice(&this.pending[..n]);
            this.pending.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for BrokeredSocket {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.stream.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}

/// Errors from killed client connections; nothing to act on
fn is_churn(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::TimedOut
            | io::ErrorKind::BrokenPipe
    )
}

/// TCP listener plus pool of client sockets for one tunnel
pub struct SocketBroker {
    inner: Arc<BrokerInner>,
    config: BrokerConfig,
    port_finder: Arc<dyn PortFinder>,
    started: AtomicBool,
    port: AtomicU16,
    events: Mutex<Option<mpsc::UnboundedReceiver<BrokerEvent>>>,
}

impl SocketBroker {
    pub fn new(config: BrokerConfig) -> Self {
        let finder = Arc::new(RangePortFinder::new(config.bind_ip));
        Self::with_port_finder(config, finder)
    }

    pub fn with_port_finder(config: BrokerConfig, port_finder: Arc<dyn PortFinder>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(BrokerInner {
            tunnel_id: config.tunnel_id.clone(),
            max_sockets: config.max_sockets,
            state: Mutex::new(PoolState {
                connected: 0,
                available: VecDeque::new(),
                pending: VecDeque::new(),
                closed: false,
            }),
            events: events_tx,
            next_socket_id: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        });

        Self {
            inner,
            config,
            port_finder,
            started: AtomicBool::new(false),
            port: AtomicU16::new(0),
            events: Mutex::new(Some(events_rx)),
        }
    }

    /// Take the presence event stream; only the first caller gets it
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<BrokerEvent>> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Bind the listener and start accepting client sockets
    ///
    /// Returns the bound port.
    pub async fn listen(&self) -> Result<u16, BrokerError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(BrokerError::AlreadyStarted);
        }

        if self.is_closed() {
            return Err(BrokerError::Closed);
        }

        let port = match self.config.port_range {
            Some((start, end)) => self
                .port_finder
                .find_port((start, end))
                .ok_or(BrokerError::NoFreePort { start, end })?,
            None => 0,
        };

        let address = SocketAddr::new(self.config.bind_ip, port);
        let listener = TcpListener::bind(address)
            .await
            .map_err(|source| BrokerError::Bind { address, source })?;
        let port = listener.local_addr()?.port();
        self.port.store(port, Ordering::SeqCst);

        info!(
            "Tunnel {}: broker listening on port {}",
            self.inner.tunnel_id, port
        );

        tokio::spawn(accept_loop(self.inner.clone(), listener));

        Ok(port)
    }

    /// Borrow a socket, waiting for the client to open one if the pool is empty
    ///
    /// Waiting borrowers are served first come, first served.
    pub async fn borrow(&self) -> Result<BrokeredSocket, BrokerError> {
        let (reply, socket) = oneshot::channel();
        self.inner.request(reply, false);
        socket.await.unwrap_or(Err(BrokerError::Closed))
    }

    /// Close the listener and idle sockets and fail every waiting borrower
    pub fn shutdown(&self) {
        self.inner.close();
    }

    pub fn tunnel_id(&self) -> &str {
        &self.inner.tunnel_id
    }

    pub fn max_sockets(&self) -> usize {
        self.inner.max_sockets
    }

    /// Bound port, 0 before `listen`
    pub fn port(&self) -> u16 {
        self.port.load(Ordering::SeqCst)
    }

    pub fn connected_sockets(&self) -> usize {
        self.inner.state().connected
    }

    pub fn available_sockets(&self) -> usize {
        self.inner.state().available.len()
    }

    pub fn pending_borrowers(&self) -> usize {
        self.inner.state().pending.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state().closed
    }
}

impl Drop for SocketBroker {
    fn drop(&mut self) {
        self.inner.close();
    }
}

async fn accept_loop(inner: Arc<BrokerInner>, listener: TcpListener) {
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => inner.on_connection(stream, peer_addr),
                Err(e) if is_churn(&e) => {
                    debug!("Tunnel {}: accept interrupted: {}", inner.tunnel_id, e);
                }
                Err(e) => {
                    error!("Tunnel {}: failed to accept connection: {}", inner.tunnel_id, e);
                }
            },
        }
    }

    drop(listener);
    inner.close();
}

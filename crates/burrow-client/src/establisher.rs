//! One tunnel socket: broker port on one side, local service on the other
//!
//! A session opens a TCP connection to the broker and waits for the server
//! to lend it out. When bytes arrive it connects to the local service,
//! retrying while the service refuses, and splices the two until the
//! remote side is done. The session then ends as [`SessionState::Dead`];
//! restarting it is the owner's job.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::host_rewrite::{sniff_request, HostRewriteFilter};
use crate::tls::LocalTls;
use crate::tunnel::TunnelEvent;
use crate::ClientError;

/// Delay between attempts while the local service refuses connections
pub const LOCAL_RETRY_DELAY: Duration = Duration::from_secs(1);

const CHUNK_SIZE: usize = 16 * 1024;

/// Progress of one session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Connected,
    LocalConnecting,
    LocalConnected,
    Dead,
}

/// How a session that reached the broker ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOutcome {
    /// Whether any request came through before the remote went away
    pub served: bool,
}

/// Where and how to reach the proxied service
#[derive(Debug, Clone)]
pub struct LocalTarget {
    pub host: String,
    pub port: u16,
    pub rewrite_host: Option<String>,
    pub tls: Option<LocalTls>,
}

trait LocalStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> LocalStream for T {}

/// Runs tunnel sessions against one broker port
#[derive(Debug, Clone)]
pub struct ConnectionEstablisher {
    remote_host: String,
    remote_port: u16,
    local: Arc<LocalTarget>,
    events: Option<mpsc::UnboundedSender<TunnelEvent>>,
    state: Arc<watch::Sender<SessionState>>,
}

impl ConnectionEstablisher {
    pub fn new(remote_host: impl Into<String>, remote_port: u16, local: LocalTarget) -> Self {
        Self {
            remote_host: remote_host.into(),
            remote_port,
            local: Arc::new(local),
            events: None,
            state: Arc::new(watch::channel(SessionState::Dead).0),
        }
    }

    /// Report sniffed requests on `events`
    pub fn with_events(mut self, events: mpsc::UnboundedSender<TunnelEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Run one session to completion
    ///
    /// A refused broker connection is fatal (`ClientError::Refused`): the
    /// tunnel no longer exists on the server. Any other connect error is
    /// returned for the owner to retry. Once connected the session always
    /// ends in `Ok`, when the remote goes away or `cancel` fires.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<SessionOutcome, ClientError> {
        let outcome = self.run_session(cancel).await;
        self.state.send_replace(SessionState::Dead);
        outcome
    }

    async fn run_session(
        &self,
        cancel: &CancellationToken,
    ) -> Result<SessionOutcome, ClientError> {
        self.state.send_replace(SessionState::Connecting);

        let remote = tokio::select! {
            _ = cancel.cancelled() => return Ok(SessionOutcome { served: false }),
            connected = TcpStream::connect((self.remote_host.as_str(), self.remote_port)) => connected,
        };
        let mut remote = match remote {
            Ok(stream) => stream,
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                return Err(ClientError::Refused {
                    host: self.remote_host.clone(),
                    port: self.remote_port,
                });
            }
            Err(e) => return Err(ClientError::Io(e)),
        };
        let _ = remote.set_nodelay(true);

        self.state.send_replace(SessionState::Connected);
        trace!(
            "Tunnel socket connected to {}:{}",
            self.remote_host,
            self.remote_port
        );

        // Idle until the server lends this socket out
        let mut peek_buf = [0u8; 1];
        let first = tokio::select! {
            _ = cancel.cancelled() => return Ok(SessionOutcome { served: false }),
            peeked = remote.peek(&mut peek_buf) => peeked,
        };
        match first {
            Ok(0) => {
                debug!("Tunnel socket closed by server while idle");
                return Ok(SessionOutcome { served: false });
            }
            Ok(_) => {}
            Err(e) => {
                debug!("Tunnel socket error while idle: {}", e);
                return Ok(SessionOutcome { served: false });
            }
        }

        self.state.send_replace(SessionState::LocalConnecting);
        let Some(local) = self.connect_local(cancel).await else {
            let _ = remote.shutdown().await;
            return Ok(SessionOutcome { served: false });
        };

        self.state.send_replace(SessionState::LocalConnected);
        self.splice(remote, local, cancel).await;
        Ok(SessionOutcome { served: true })
    }

    /// Connect to the local service, waiting out refusals
    async fn connect_local(&self, cancel: &CancellationToken) -> Option<Box<dyn LocalStream>> {
        let target = &self.local;

        loop {
            let attempt = tokio::select! {
                _ = cancel.cancelled() => return None,
                attempt = self.open_local() => attempt,
            };

            match attempt {
                Ok(stream) => return Some(stream),
                Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                    warn!(
                        "Local service {}:{} refused the connection, retrying in {:?}",
                        target.host, target.port, LOCAL_RETRY_DELAY
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return None,
                        _ = tokio::time::sleep(LOCAL_RETRY_DELAY) => {}
                    }
                }
                Err(e) => {
                    warn!(
                        "Failed to reach local service {}:{}: {}",
                        target.host, target.port, e
                    );
                    return None;
                }
            }
        }
    }

    async fn open_local(&self) -> io::Result<Box<dyn LocalStream>> {
        let target = &self.local;
        let stream = TcpStream::connect((target.host.as_str(), target.port)).await?;
        let _ = stream.set_nodelay(true);

        match &target.tls {
            Some(tls) => {
                let stream = tls
                    .connector
                    .connect(tls.server_name.clone(), stream)
                    .await?;
                Ok(Box::new(stream))
            }
            None => Ok(Box::new(stream)),
        }
    }

    /// Pump both directions until the remote side is finished
    async fn splice(
        &self,
        remote: TcpStream,
        local: Box<dyn LocalStream>,
        cancel: &CancellationToken,
    ) {
        let (mut remote_read, mut remote_write) = remote.into_split();
        let (mut local_read, mut local_write) = tokio::io::split(local);

        let upstream = self.forward_remote(&mut remote_read, &mut local_write);
        let downstream = async {
            let result = tokio::io::copy(&mut local_read, &mut remote_write).await;
            let _ = remote_write.shutdown().await;
            result
        };
        tokio::pin!(upstream);
        tokio::pin!(downstream);

        tokio::select! {
            _ = cancel.cancelled() => {}
            result = &mut upstream => {
                if let Err(e) = result {
                    debug!("Tunnel stream to local service ended: {}", e);
                }
            }
            result = &mut downstream => {
                if let Err(e) = result {
                    debug!("Local stream to tunnel ended: {}", e);
                }
                // The server closes its end once the response is through
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = &mut upstream => {}
                }
            }
        }
    }

    /// Remote to local, sniffing request lines and rewriting `Host` if asked
    async fn forward_remote<R, W>(&self, remote: &mut R, local: &mut W) -> io::Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut filter = self.local.rewrite_host.as_ref().map(HostRewriteFilter::new);
        let mut buf = BytesMut::with_capacity(CHUNK_SIZE);

        loop {
            buf.clear();
            if remote.read_buf(&mut buf).await? == 0 {
                let _ = local.shutdown().await;
                return Ok(());
            }

            if let Some((method, path)) = sniff_request(&buf) {
                debug!("{} {}", method, path);
                if let Some(events) = &self.events {
                    let _ = events.send(TunnelEvent::Request { method, path });
                }
            }

            match filter.as_mut() {
                Some(filter) => local.write_all(&filter.transform(&buf)).await?,
                None => local.write_all(&buf).await?,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> String {
        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        while !buf.ends_with(b"\r\n\r\n") {
            assert_eq!(stream.read(&mut byte).await.unwrap(), 1, "closed mid-head");
            buf.push(byte[0]);
        }
        String::from_utf8(buf).unwrap()
    }

    fn local_target(port: u16, rewrite_host: Option<&str>) -> LocalTarget {
        LocalTarget {
            host: "127.0.0.1".to_string(),
            port,
            rewrite_host: rewrite_host.map(str::to_string),
            tls: None,
        }
    }

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_remote_refused_is_fatal() {
        let port = closed_port().await;
        let establisher = ConnectionEstablisher::new("127.0.0.1", port, local_target(1, None));

        let result = establisher.run(&CancellationToken::new()).await;
        match result {
            Err(ClientError::Refused { host, port: p }) => {
                assert_eq!(host, "127.0.0.1");
                assert_eq!(p, port);
            }
            other => panic!("expected refusal, got {:?}", other),
        }
        assert_eq!(establisher.state(), SessionState::Dead);
    }

    #[tokio::test]
    async fn test_forwards_and_rewrites_host() {
        let broker = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let service = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();

        let establisher = ConnectionEstablisher::new(
            "127.0.0.1",
            broker.local_addr().unwrap().port(),
            local_target(service.local_addr().unwrap().port(), Some("localhost")),
        )
        .with_events(events_tx);
        let mut states = establisher.subscribe();
        let session = tokio::spawn({
            let establisher = establisher.clone();
            async move { establisher.run(&CancellationToken::new()).await }
        });

        let (mut tunnel, _) = broker.accept().await.unwrap();
        states
            .wait_for(|s| *s == SessionState::Connected)
            .await
            .unwrap();

        tunnel
            .write_all(b"GET /hello HTTP/1.1\r\nHost: abcd.example.com\r\nAccept: */*\r\n\r\n")
            .await
            .unwrap();

        let (mut local, _) = timeout(Duration::from_secs(5), service.accept())
            .await
            .unwrap()
            .unwrap();
        let head = read_head(&mut local).await;
        assert_eq!(
            head,
            "GET /hello HTTP/1.1\r\nHost: localhost\r\nAccept: */*\r\n\r\n"
        );

        local
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
            .await
            .unwrap();
        drop(local);

        let mut response = Vec::new();
        tunnel.read_to_end(&mut response).await.unwrap();
        assert!(response.ends_with(b"\r\n\r\nok"));
        drop(tunnel);

        let outcome = timeout(Duration::from_secs(5), session)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(outcome.served);
        assert_eq!(establisher.state(), SessionState::Dead);

        match events_rx.recv().await {
            Some(TunnelEvent::Request { method, path }) => {
                assert_eq!(method, "GET");
                assert_eq!(path, "/hello");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_local_refusal_is_retried() {
        let broker = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local_port = closed_port().await;

        let establisher = ConnectionEstablisher::new(
            "127.0.0.1",
            broker.local_addr().unwrap().port(),
            local_target(local_port, None),
        );
        let mut states = establisher.subscribe();
        tokio::spawn({
            let establisher = establisher.clone();
            async move { establisher.run(&CancellationToken::new()).await }
        });

        let (mut tunnel, _) = broker.accept().await.unwrap();
        tunnel
            .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();
        states
            .wait_for(|s| *s == SessionState::LocalConnecting)
            .await
            .unwrap();

        // Service comes up after the first refusal
        tokio::time::sleep(Duration::from_millis(200)).await;
        let service = TcpListener::bind(("127.0.0.1", local_port)).await.unwrap();

        let (mut local, _) = timeout(Duration::from_secs(5), service.accept())
            .await
            .unwrap()
            .unwrap();
        let head = read_head(&mut local).await;
        assert!(head.contains("Host: x"));
        states
            .wait_for(|s| *s == SessionState::LocalConnected)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_idle_close_is_not_served() {
        let broker = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let establisher = ConnectionEstablisher::new(
            "127.0.0.1",
            broker.local_addr().unwrap().port(),
            local_target(1, None),
        );

        let session = tokio::spawn({
            let establisher = establisher.clone();
            async move { establisher.run(&CancellationToken::new()).await }
        });

        let (tunnel, _) = broker.accept().await.unwrap();
        drop(tunnel);

        let outcome = timeout(Duration::from_secs(5), session)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(!outcome.served);
    }

    #[tokio::test]
    async fn test_cancel_while_idle() {
        let broker = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let establisher = ConnectionEstablisher::new(
            "127.0.0.1",
            broker.local_addr().unwrap().port(),
            local_target(1, None),
        );
        let cancel = CancellationToken::new();

        let session = tokio::spawn({
            let establisher = establisher.clone();
            let cancel = cancel.clone();
            async move { establisher.run(&cancel).await }
        });

        let (_tunnel, _) = broker.accept().await.unwrap();
        cancel.cancel();

        let outcome = timeout(Duration::from_secs(5), session)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(!outcome.served);
        assert_eq!(establisher.state(), SessionState::Dead);
    }
}

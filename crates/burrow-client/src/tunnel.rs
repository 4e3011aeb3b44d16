//! Tunnel negotiation and the pool of establishers behind it

use std::time::Duration;

use burrow_proto::{ErrorBody, TunnelInfo};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::TunnelConfig;
use crate::establisher::{ConnectionEstablisher, LocalTarget};
use crate::reconnect::{ReconnectConfig, ReconnectError, ReconnectManager};
use crate::tls::LocalTls;
use crate::ClientError;

/// Delay before asking an unreachable server again
const NEGOTIATION_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Activity reported by an open tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelEvent {
    /// A request line went through one of the tunnel sockets
    Request { method: String, path: String },
    /// The tunnel stopped for good
    Error { message: String },
}

/// An open tunnel: the negotiated identity plus its running sockets
pub struct Tunnel {
    info: TunnelInfo,
    cancel: CancellationToken,
    events: Mutex<mpsc::UnboundedReceiver<TunnelEvent>>,
    tasks: Mutex<JoinSet<()>>,
}

impl Tunnel {
    /// Negotiate with the server and start `max_conn_count` sockets
    pub async fn open(config: TunnelConfig) -> Result<Self, ClientError> {
        let local_tls = LocalTls::from_config(&config)?;
        let info = negotiate(&config).await?;

        let remote_host = match &info.ip {
            Some(ip) => ip.clone(),
            None => config
                .server
                .host_str()
                .ok_or_else(|| ClientError::Config("server URL has no host".to_string()))?
                .to_string(),
        };

        info!(
            "Tunnel {} open at {}, {} sockets to {}:{}",
            info.id, info.url, info.max_conn_count, remote_host, info.port
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let local = LocalTarget {
            host: config.local_host.clone(),
            port: config.local_port,
            rewrite_host: config.rewrite_host.clone(),
            tls: local_tls,
        };

        let cancel = CancellationToken::new();
        let mut tasks = JoinSet::new();
        for slot in 0..info.max_conn_count.max(1) {
            let establisher =
                ConnectionEstablisher::new(remote_host.clone(), info.port, local.clone())
                    .with_events(events_tx.clone());
            tasks.spawn(maintain(
                slot,
                establisher,
                config.reconnect.clone(),
                cancel.clone(),
                events_tx.clone(),
            ));
        }

        Ok(Self {
            info,
            cancel,
            events: Mutex::new(events_rx),
            tasks: Mutex::new(tasks),
        })
    }

    pub fn id(&self) -> &str {
        &self.info.id
    }

    /// Public URL of the tunnel
    pub fn url(&self) -> &str {
        &self.info.url
    }

    pub fn info(&self) -> &TunnelInfo {
        &self.info
    }

    /// Next tunnel event, `None` once the tunnel is closed
    pub async fn next_event(&self) -> Option<TunnelEvent> {
        let mut events = self.events.lock().await;
        tokio::select! {
            biased;
            event = events.recv() => event,
            _ = self.cancel.cancelled() => None,
        }
    }

    /// Stop every socket
    pub fn close(&self) {
        if !self.cancel.is_cancelled() {
            info!("Closing tunnel {}", self.info.id);
            self.cancel.cancel();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait until every socket task has finished
    pub async fn closed(&self) {
        let mut tasks = self.tasks.lock().await;
        while tasks.join_next().await.is_some() {}
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Ask the server for a tunnel, retrying while it is unreachable
async fn negotiate(config: &TunnelConfig) -> Result<TunnelInfo, ClientError> {
    let url = negotiation_url(&config.server, config.subdomain.as_deref())?;
    let client = reqwest::Client::new();
    let mut attempt = 0;

    loop {
        attempt += 1;
        debug!("Requesting tunnel from {}", url);

        match client.get(url.clone()).send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return Ok(response.json::<TunnelInfo>().await?);
                }

                let body = response.text().await.unwrap_or_default();
                let message = serde_json::from_str::<ErrorBody>(&body)
                    .map(|b| b.message)
                    .unwrap_or_else(|_| status.to_string());
                return Err(ClientError::Server {
                    status: status.as_u16(),
                    message,
                });
            }
            Err(e) => {
                if config.negotiation_attempts.is_some_and(|max| attempt >= max) {
                    return Err(ClientError::Http(e));
                }
                warn!(
                    "Tunnel server offline: {}, retrying in {:?}",
                    e, NEGOTIATION_RETRY_DELAY
                );
                tokio::time::sleep(NEGOTIATION_RETRY_DELAY).await;
            }
        }
    }
}

/// `<server>/?new` for a random id, `<server>/<subdomain>` otherwise
fn negotiation_url(server: &Url, subdomain: Option<&str>) -> Result<Url, ClientError> {
    let mut url = server.clone();
    url.set_query(None);

    match subdomain {
        Some(subdomain) => {
            url.path_segments_mut()
                .map_err(|_| ClientError::Config(format!("cannot use {} as a server", server)))?
                .pop_if_empty()
                .push(subdomain);
        }
        None => url.set_query(Some("new")),
    }

    Ok(url)
}

/// Keep one socket slot connected until the tunnel closes
async fn maintain(
    slot: usize,
    establisher: ConnectionEstablisher,
    reconnect: ReconnectConfig,
    cancel: CancellationToken,
    events: mpsc::UnboundedSender<TunnelEvent>,
) {
    let mut backoff = ReconnectManager::new(reconnect);

    while !cancel.is_cancelled() {
        match establisher.run(&cancel).await {
            Ok(outcome) if outcome.served => {
                backoff.reset();
                continue;
            }
            Ok(_) => debug!("Socket {} closed before carrying traffic", slot),
            Err(e) if e.is_fatal() => {
                error!("Tunnel socket {} failed: {}", slot, e);
                let _ = events.send(TunnelEvent::Error {
                    message: e.to_string(),
                });
                cancel.cancel();
                return;
            }
            Err(e) => warn!("Socket {} failed to connect: {}", slot, e),
        }

        match backoff.wait(&cancel).await {
            Ok(()) => {}
            Err(ReconnectError::Cancelled) => return,
            Err(e @ ReconnectError::MaxAttemptsReached(_)) => {
                error!("Tunnel socket {}: {}", slot, e);
                let _ = events.send(TunnelEvent::Error {
                    message: e.to_string(),
                });
                cancel.cancel();
                return;
            }
        }
    }
}

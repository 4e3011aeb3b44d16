//! Public listener routing traffic to tunnels by subdomain

use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::Router;
use burrow_control::TunnelRegistry;
use hyper::body::Incoming;
use hyper::header::HOST;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use tracing::{debug, error, info, trace};

use crate::api::{self, ApiState};
use crate::config::{ConfigError, ServerConfig};
use crate::head::{is_upgrade, read_head, ParsedHead, PrefixedIo};
use crate::host::HostResolver;

/// Tunnel server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to bind to {address}: {source}")]
    Bind {
        address: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("malformed request head: {0}")]
    Parse(#[from] httparse::Error),

    #[error("request head too large")]
    HeadTooLarge,

    #[error("timed out waiting for request head")]
    HeadTimeout,

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),
}

struct Dispatcher {
    registry: TunnelRegistry,
    resolver: HostResolver,
    api: Router,
    head_timeout: Duration,
}

/// Public HTTP front of the broker
pub struct TunnelServer {
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
}

impl TunnelServer {
    /// Validate `config` and bind the public listener
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        config.validate()?;

        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(|source| ServerError::Bind {
                address: config.bind_addr,
                source,
            })?;

        let registry = TunnelRegistry::new(config.registry_config());
        let api = api::router(ApiState {
            registry: registry.clone(),
            scheme: config.scheme(),
            landing_page: config.landing_page.clone(),
        });

        Ok(Self {
            listener,
            dispatcher: Arc::new(Dispatcher {
                registry,
                resolver: HostResolver::new(&config.domains),
                api,
                head_timeout: config.head_timeout,
            }),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn registry(&self) -> &TunnelRegistry {
        &self.dispatcher.registry
    }

    /// Accept public connections until `shutdown` fires, then close every tunnel
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), ServerError> {
        info!("Tunnel server listening on {}", self.local_addr()?);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        trace!("Accepted public connection from {}", peer_addr);
                        let dispatcher = self.dispatcher.clone();
                        tokio::spawn(async move {
                            if let Err(e) = dispatcher.handle_connection(stream).await {
                                debug!("Connection from {} ended with error: {}", peer_addr, e);
                            }
                        });
                    }
                    Err(e) => error!("Failed to accept connection: {}", e),
                },
            }
        }

        info!("Tunnel server shutting down");
        self.dispatcher.registry.close_all();
        Ok(())
    }
}

impl Dispatcher {
    async fn handle_connection(self: Arc<Self>, mut stream: TcpStream) -> Result<(), ServerError> {
        let head = timeout(self.head_timeout, read_head(&mut stream)).await;
        let parsed = match head.unwrap_or(Err(ServerError::HeadTimeout)) {
            Ok(Some(parsed)) => parsed,
            Ok(None) => return Ok(()),
            Err(ServerError::HeadTimeout) => {
                reject(&mut stream, "408 Request Timeout").await;
                return Err(ServerError::HeadTimeout);
            }
            Err(ServerError::HeadTooLarge) => {
                reject(&mut stream, "431 Request Header Fields Too Large").await;
                return Err(ServerError::HeadTooLarge);
            }
            Err(ServerError::Parse(e)) => {
                reject(&mut stream, "400 Bad Request").await;
                return Err(ServerError::Parse(e));
            }
            Err(e) => return Err(e),
        };

        if is_upgrade(&parsed.head) {
            self.handle_upgrade(parsed, stream).await;
            return Ok(());
        }

        let io = PrefixedIo::new(parsed.buffered, stream);
        let dispatcher = self.clone();
        let service = service_fn(move |req| {
            let dispatcher = dispatcher.clone();
            async move { Ok::<_, Infallible>(dispatcher.route(req).await) }
        });

        http1::Builder::new()
            .preserve_header_case(true)
            .keep_alive(false)
            .serve_connection(TokioIo::new(io), service)
            .await?;

        Ok(())
    }

    /// Route one plain request: tunnel traffic, management API, or an error
    async fn route(&self, req: Request<Incoming>) -> Response<Body> {
        let Some(host) = req.headers().get(HOST).and_then(|v| v.to_str().ok()) else {
            return text_response(StatusCode::BAD_REQUEST, "Host header is required");
        };

        let Some(id) = self.resolver.subdomain(host) else {
            return match self.api.clone().oneshot(req).await {
                Ok(response) => response,
                Err(never) => match never {},
            };
        };

        match self.registry.get(&id) {
            Some(tunnel) => {
                trace!("Tunnel {}: {} {}", id, req.method(), req.uri());
                tunnel.bridge().handle_request(req).await
            }
            None => {
                debug!("No tunnel for {}", id);
                text_response(StatusCode::NOT_FOUND, "404")
            }
        }
    }

    /// Upgrades bypass hyper; a request we cannot place just loses its socket
    async fn handle_upgrade(&self, parsed: ParsedHead, stream: TcpStream) {
        let Some(host) = parsed
            .head
            .header("host")
            .and_then(|v| std::str::from_utf8(v).ok())
        else {
            debug!("Upgrade without Host header, dropping");
            return;
        };

        let Some(id) = self.resolver.subdomain(host) else {
            debug!("Upgrade for bare host {}, dropping", host);
            return;
        };

        let Some(tunnel) = self.registry.get(&id) else {
            debug!("Upgrade for unknown tunnel {}, dropping", id);
            return;
        };

        trace!("Tunnel {}: upgrade {} {}", id, parsed.head.method, parsed.head.path);
        tunnel
            .bridge()
            .handle_upgrade(&parsed.head, parsed.leftover(), stream)
            .await;
    }
}

fn text_response(status: StatusCode, body: &'static str) -> Response<Body> {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response
}

async fn reject(stream: &mut TcpStream, status: &str) {
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        status
    );
    if let Err(e) = stream.write_all(response.as_bytes()).await {
        debug!("Failed to send {}: {}", status, e);
    }
}

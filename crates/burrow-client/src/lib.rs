//! Client side of the burrow tunnel
//!
//! [`Tunnel::open`] negotiates a tunnel with the server, then keeps
//! `max_conn_count` [`ConnectionEstablisher`]s connected to the broker port,
//! each forwarding one remote stream at a time to the local service.

pub mod config;
pub mod establisher;
pub mod host_rewrite;
pub mod reconnect;
pub mod tls;
pub mod tunnel;

use std::io;

use thiserror::Error;

pub use config::{TunnelConfig, TunnelConfigBuilder, DEFAULT_SERVER};
pub use establisher::{ConnectionEstablisher, LocalTarget, SessionOutcome, SessionState};
pub use host_rewrite::HostRewriteFilter;
pub use reconnect::{ReconnectConfig, ReconnectError, ReconnectManager};
pub use tunnel::{Tunnel, TunnelEvent};

/// Client errors
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connection refused: {host}:{port} (check your firewall settings)")]
    Refused { host: String, port: u16 },

    #[error("server refused tunnel ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("negotiation failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("tunnel closed")]
    Closed,
}

impl ClientError {
    /// Whether retrying cannot help
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ClientError::Refused { .. }
                | ClientError::Server { .. }
                | ClientError::Config(_)
                | ClientError::Tls(_)
                | ClientError::Closed
        )
    }
}

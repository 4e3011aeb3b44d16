//! Tunnel client configuration

use std::path::PathBuf;

use burrow_proto::validate_requested_id;
use url::Url;

use crate::reconnect::ReconnectConfig;
use crate::ClientError;

/// Tunnel server used when none is given
pub const DEFAULT_SERVER: &str = "https://localtunnel.me";

/// Everything needed to open a tunnel to a local service
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Tunnel server negotiated with over HTTP(S)
    pub server: Url,
    /// Requested public subdomain; a random one is assigned when absent
    pub subdomain: Option<String>,
    pub local_host: String,
    pub local_port: u16,
    /// Value written into the first `Host` header of every forwarded request
    pub rewrite_host: Option<String>,
    /// Reach the local service over TLS
    pub local_https: bool,
    /// Client certificate presented to the local service (PEM)
    pub local_cert: Option<PathBuf>,
    /// Key for `local_cert` (PEM)
    pub local_key: Option<PathBuf>,
    /// Certificate authority trusted for the local service (PEM)
    pub local_ca: Option<PathBuf>,
    /// Accept any certificate from the local service
    pub allow_invalid_cert: bool,
    pub reconnect: ReconnectConfig,
    /// Negotiation attempts when the server is unreachable (None = unlimited)
    pub negotiation_attempts: Option<usize>,
}

impl TunnelConfig {
    pub fn builder() -> TunnelConfigBuilder {
        TunnelConfigBuilder::default()
    }
}

#[derive(Debug, Default)]
pub struct TunnelConfigBuilder {
    server: Option<Url>,
    subdomain: Option<String>,
    local_host: Option<String>,
    local_port: Option<u16>,
    local_https: bool,
    local_cert: Option<PathBuf>,
    local_key: Option<PathBuf>,
    local_ca: Option<PathBuf>,
    allow_invalid_cert: bool,
    reconnect: Option<ReconnectConfig>,
    negotiation_attempts: Option<usize>,
}

impl TunnelConfigBuilder {
    pub fn server(mut self, server: Url) -> Self {
        self.server = Some(server);
        self
    }

    pub fn subdomain(mut self, subdomain: impl Into<String>) -> Self {
        self.subdomain = Some(subdomain.into());
        self
    }

    /// Proxy to this host instead of `localhost`, also rewriting `Host` to it
    pub fn local_host(mut self, host: impl Into<String>) -> Self {
        self.local_host = Some(host.into());
        self
    }

    pub fn local_port(mut self, port: u16) -> Self {
        self.local_port = Some(port);
        self
    }

    pub fn local_https(mut self, enabled: bool) -> Self {
        self.local_https = enabled;
        self
    }

    pub fn local_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.local_cert = Some(path.into());
        self
    }

    pub fn local_key(mut self, path: impl Into<PathBuf>) -> Self {
        self.local_key = Some(path.into());
        self
    }

    pub fn local_ca(mut self, path: impl Into<PathBuf>) -> Self {
        self.local_ca = Some(path.into());
        self
    }

    pub fn allow_invalid_cert(mut self, allow: bool) -> Self {
        self.allow_invalid_cert = allow;
        self
    }

    pub fn reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = Some(reconnect);
        self
    }

    pub fn negotiation_attempts(mut self, attempts: usize) -> Self {
        self.negotiation_attempts = Some(attempts);
        self
    }

    pub fn build(self) -> Result<TunnelConfig, ClientError> {
        let local_port = self
            .local_port
            .filter(|port| *port != 0)
            .ok_or_else(|| ClientError::Config("local_port is required".to_string()))?;

        let server = match self.server {
            Some(server) => server,
            None => Url::parse(DEFAULT_SERVER)
                .map_err(|e| ClientError::Config(format!("bad default server: {}", e)))?,
        };
        if !matches!(server.scheme(), "http" | "https") || server.host_str().is_none() {
            return Err(ClientError::Config(format!(
                "server must be an http(s) URL with a host, got {}",
                server
            )));
        }

        if let Some(subdomain) = &self.subdomain {
            validate_requested_id(subdomain).map_err(|e| ClientError::Config(e.to_string()))?;
        }

        if self.local_cert.is_some() != self.local_key.is_some() {
            return Err(ClientError::Config(
                "local_cert and local_key must be given together".to_string(),
            ));
        }

        if self.negotiation_attempts == Some(0) {
            return Err(ClientError::Config(
                "negotiation_attempts must be at least 1".to_string(),
            ));
        }

        Ok(TunnelConfig {
            server,
            subdomain: self.subdomain,
            rewrite_host: self.local_host.clone(),
            local_host: self.local_host.unwrap_or_else(|| "localhost".to_string()),
            local_port,
            local_https: self.local_https,
            local_cert: self.local_cert,
            local_key: self.local_key,
            local_ca: self.local_ca,
            allow_invalid_cert: self.allow_invalid_cert,
            reconnect: self.reconnect.unwrap_or_default(),
            negotiation_attempts: self.negotiation_attempts,
        })
    }
}

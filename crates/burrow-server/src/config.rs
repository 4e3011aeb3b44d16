//! Server configuration
//!
//! Values come from built-in defaults, then an optional JSON file, then
//! whatever the binary collects from its flags and environment.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use burrow_control::{RegistryConfig, DEFAULT_GRACE_PERIOD};
use burrow_proto::DEFAULT_MAX_SOCKETS;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("max sockets must be at least 1")]
    InvalidMaxSockets,

    #[error("invalid port range {0}-{1}: start must not exceed end")]
    InvalidPortRange(u16, u16),

    #[error("invalid domain: {0:?}")]
    InvalidDomain(String),
}

pub const DEFAULT_HEAD_TIMEOUT: Duration = Duration::from_secs(30);

/// Tunnel server settings
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Public HTTP listener
    pub bind_addr: SocketAddr,
    /// Address tunnel brokers bind to
    pub broker_addr: IpAddr,
    /// Advertise `https://` tunnel URLs
    pub secure: bool,
    /// Base domains tunnels are served under
    pub domains: Vec<String>,
    /// Where `GET /` on the base domain redirects to
    pub landing_page: Option<String>,
    /// Inclusive range broker ports are picked from
    pub port_range: Option<(u16, u16)>,
    /// Sockets each client may open against its broker
    pub max_sockets: usize,
    /// How long a tunnel survives with no client socket
    pub grace_period: Duration,
    /// How long a public connection may take to send its request head
    pub head_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 80),
            broker_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            secure: false,
            domains: Vec::new(),
            landing_page: None,
            port_range: None,
            max_sockets: DEFAULT_MAX_SOCKETS,
            grace_period: DEFAULT_GRACE_PERIOD,
            head_timeout: DEFAULT_HEAD_TIMEOUT,
        }
    }
}

impl ServerConfig {
    /// Defaults overlaid with `path`, if any
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(path) = path {
            config.merge(FileConfig::from_file(path)?);
        }

        Ok(config)
    }

    /// Overlay every value set in `file`
    pub fn merge(&mut self, file: FileConfig) {
        if let Some(secure) = file.secure {
            self.secure = secure;
        }
        if let Some(address) = file.address {
            self.bind_addr.set_ip(address);
        }
        if let Some(port) = file.port {
            self.bind_addr.set_port(port);
        }
        if let Some([start, end]) = file.port_range {
            self.port_range = Some((start, end));
        }
        if let Some(max_sockets) = file.max_sockets {
            self.max_sockets = max_sockets;
        }
        if let Some(domains) = file.domains {
            self.domains = domains;
        }
        if let Some(landing_page) = file.landing_page {
            self.landing_page = Some(landing_page);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_sockets == 0 {
            return Err(ConfigError::InvalidMaxSockets);
        }

        if let Some((start, end)) = self.port_range {
            if start > end {
                return Err(ConfigError::InvalidPortRange(start, end));
            }
        }

        for domain in &self.domains {
            if !is_valid_domain(domain) {
                return Err(ConfigError::InvalidDomain(domain.clone()));
            }
        }

        Ok(())
    }

    pub fn scheme(&self) -> &'static str {
        if self.secure {
            "https"
        } else {
            "http"
        }
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            max_sockets: self.max_sockets,
            bind_ip: self.broker_addr,
            port_range: self.port_range,
            grace_period: self.grace_period,
        }
    }
}

/// Optional settings, as found in the JSON config file
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct FileConfig {
    #[serde(rename = "SECURE_PROTOCOL")]
    pub secure: Option<bool>,
    #[serde(rename = "SERVER_ADDRESS")]
    pub address: Option<IpAddr>,
    #[serde(rename = "SERVER_PORT")]
    pub port: Option<u16>,
    #[serde(rename = "PORT_RANGE")]
    pub port_range: Option<[u16; 2]>,
    #[serde(rename = "MAX_SOCKETS")]
    pub max_sockets: Option<usize>,
    #[serde(rename = "DOMAINS")]
    pub domains: Option<Vec<String>>,
    #[serde(rename = "LANDING_PAGE")]
    pub landing_page: Option<String>,
}

impl FileConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// `START-END`, inclusive
pub fn parse_port_range(value: &str) -> Option<[u16; 2]> {
    let (start, end) = value.split_once('-')?;
    Some([start.trim().parse().ok()?, end.trim().parse().ok()?])
}

fn is_valid_domain(domain: &str) -> bool {
    if domain.is_empty() || domain.len() > 253 {
        return false;
    }

    domain.trim_end_matches('.').split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_sockets, 10);
        assert_eq!(config.grace_period, Duration::from_secs(1));
        assert_eq!(config.scheme(), "http");
    }

    #[test]
    fn test_file_keys() {
        let file: FileConfig = serde_json::from_str(
            r#"{
                "SECURE_PROTOCOL": true,
                "SERVER_ADDRESS": "127.0.0.1",
                "SERVER_PORT": 8080,
                "PORT_RANGE": [20000, 20100],
                "MAX_SOCKETS": 4,
                "DOMAINS": ["tunnel.example.com"],
                "LANDING_PAGE": "https://example.com"
            }"#,
        )
        .unwrap();

        let mut config = ServerConfig::default();
        config.merge(file);

        assert!(config.secure);
        assert_eq!(config.scheme(), "https");
        assert_eq!(config.bind_addr, "127.0.0.1:8080".parse::<SocketAddr>().unwrap());
        assert_eq!(config.port_range, Some((20000, 20100)));
        assert_eq!(config.max_sockets, 4);
        assert_eq!(config.domains, vec!["tunnel.example.com".to_string()]);
        assert_eq!(config.landing_page.as_deref(), Some("https://example.com"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_later_layer_wins() {
        let mut config = ServerConfig::default();
        config.merge(FileConfig {
            max_sockets: Some(4),
            secure: Some(true),
            domains: Some(vec!["a.com".to_string()]),
            ..Default::default()
        });
        config.merge(FileConfig {
            max_sockets: Some(20),
            secure: Some(false),
            port_range: Some([10000, 10010]),
            ..Default::default()
        });

        assert_eq!(config.max_sockets, 20);
        assert!(!config.secure);
        assert_eq!(config.domains, vec!["a.com".to_string()]);
        assert_eq!(config.port_range, Some((10000, 10010)));
    }

    #[test]
    fn test_load_reads_file() {
        let path = std::env::temp_dir().join(format!("burrow-config-{}.json", std::process::id()));
        std::fs::write(&path, r#"{"SERVER_PORT": 8081, "DOMAINS": ["t.example.com"]}"#).unwrap();

        let config = ServerConfig::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.bind_addr.port(), 8081);
        assert_eq!(config.domains, vec!["t.example.com".to_string()]);
        assert_eq!(config.max_sockets, 10);
    }

    #[test]
    fn test_validation() {
        let config = ServerConfig {
            max_sockets: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::InvalidMaxSockets)));

        let config = ServerConfig {
            port_range: Some((2000, 1000)),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidPortRange(2000, 1000))
        ));

        let config = ServerConfig {
            domains: vec!["bad_domain.com".to_string()],
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::InvalidDomain(_))));
    }

    #[test]
    fn test_parse_port_range() {
        assert_eq!(parse_port_range("10000-20000"), Some([10000, 20000]));
        assert_eq!(parse_port_range("5 - 6"), Some([5, 6]));
        assert_eq!(parse_port_range("10000"), None);
        assert_eq!(parse_port_range("a-b"), None);
    }
}

//! Management API message bodies

use serde::{Deserialize, Serialize};

/// Answer to a successful tunnel negotiation (`GET /?new` or `GET /<id>`)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TunnelInfo {
    /// Public subdomain assigned to the tunnel
    pub id: String,
    /// Broker port the client must open its sockets against
    pub port: u16,
    /// Maximum number of sockets the broker accepts from the client
    pub max_conn_count: usize,
    /// Public URL (`scheme://<id>.<host>`)
    pub url: String,
    /// Broker address, when the server wants clients to prefer an IP over its hostname
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
}

/// Error body returned by the management API
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorBody {
    pub message: String,
}

impl ErrorBody {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Process memory figures, in bytes
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MemoryUsage {
    pub rss: u64,
    pub virt: u64,
}

/// `GET /api/status`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerStatus {
    pub tunnels: usize,
    pub mem: MemoryUsage,
}

/// `GET /api/tunnels/{id}/status`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TunnelStatus {
    pub connected_sockets: usize,
}

/// `GET /api/tunnels`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TunnelList {
    pub tunnels: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tunnel_info_omits_missing_ip() {
        let info = TunnelInfo {
            id: "happy-otter".to_string(),
            port: 40123,
            max_conn_count: 10,
            url: "http://happy-otter.example.com".to_string(),
            ip: None,
        };

        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "id": "happy-otter",
                "port": 40123,
                "max_conn_count": 10,
                "url": "http://happy-otter.example.com",
            })
        );
    }

    #[test]
    fn test_tunnel_info_accepts_ip() {
        let info: TunnelInfo = serde_json::from_str(
            r#"{"id":"abcd","port":1,"max_conn_count":2,"url":"https://abcd.x.io","ip":"10.0.0.1"}"#,
        )
        .unwrap();
        assert_eq!(info.ip.as_deref(), Some("10.0.0.1"));
    }

    #[test]
    fn test_tunnel_status_shape() {
        let body = serde_json::to_string(&TunnelStatus {
            connected_sockets: 0,
        })
        .unwrap();
        assert_eq!(body, r#"{"connected_sockets":0}"#);
    }
}

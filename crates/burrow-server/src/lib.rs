//! Public side of the burrow tunnel broker
//!
//! Accepts public HTTP and WebSocket traffic, routes it by subdomain to the
//! matching tunnel, and serves the management API (tunnel negotiation and
//! status) on the bare base domain.

pub mod api;
pub mod config;
pub mod head;
pub mod host;
pub mod memory;
pub mod server;

pub use config::{ConfigError, FileConfig, ServerConfig};
pub use host::HostResolver;
pub use server::{ServerError, TunnelServer};

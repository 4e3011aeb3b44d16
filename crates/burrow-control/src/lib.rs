//! Tunnel lifecycle management
//!
//! The [`TunnelRegistry`] owns every live tunnel, keyed by its public id.
//! Each tunnel pairs a [`SocketBroker`](burrow_broker::SocketBroker) with a
//! [`RequestBridge`] that forwards public traffic over borrowed sockets and
//! tears the tunnel down when its client stays away too long.

pub mod bridge;
pub mod registry;
pub mod state;

pub use bridge::{RequestBridge, RequestHead, DEFAULT_GRACE_PERIOD};
pub use registry::{Allocation, RegistryConfig, RegistryError, RegistryStats, Tunnel, TunnelRegistry};
pub use state::{BridgeInput, BridgeState, TransitionError};

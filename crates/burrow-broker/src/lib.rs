//! Per-tunnel socket broker
//!
//! A client behind NAT opens a handful of TCP connections to its broker port.
//! The broker keeps them in a pool and lends them out, one per forwarded
//! request or upgraded connection, queueing borrowers while the pool is empty.

pub mod broker;
pub mod port;

pub use broker::{BrokerConfig, BrokerError, BrokerEvent, BrokeredSocket, SocketBroker};
pub use port::{PortFinder, RangePortFinder};

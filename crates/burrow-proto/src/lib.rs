//! Shared types for the burrow tunnel broker
//!
//! Defines the JSON bodies exchanged on the management API and the rules
//! for public tunnel identifiers (subdomains).

pub mod id;
pub mod messages;

pub use id::{generate_id, validate_requested_id, IdError, INVALID_ID_MESSAGE};
pub use messages::*;

/// Default number of sockets a client may keep open against its broker
pub const DEFAULT_MAX_SOCKETS: usize = 10;

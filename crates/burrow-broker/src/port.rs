//! Free port discovery for broker listeners

use std::net::{IpAddr, SocketAddr, TcpListener};
use tracing::{debug, trace};

/// Finds a port a broker can bind to
pub trait PortFinder: Send + Sync {
    /// Return a free port in the inclusive `(start, end)` range, or `None`
    /// when every port in it is taken
    fn find_port(&self, range: (u16, u16)) -> Option<u16>;
}

/// Probes each port of the range in order by binding it
#[derive(Debug, Clone)]
pub struct RangePortFinder {
    ip: IpAddr,
}

impl RangePortFinder {
    pub fn new(ip: IpAddr) -> Self {
        Self { ip }
    }
}

impl PortFinder for RangePortFinder {
    fn find_port(&self, (start, end): (u16, u16)) -> Option<u16> {
        trace!("Looking for a free port in {}-{}", start, end);

        for port in start..=end {
            if TcpListener::bind(SocketAddr::new(self.ip, port)).is_ok() {
                debug!("Found free port {}", port);
                return Some(port);
            }
        }

        debug!("No free port in {}-{}", start, end);
        None
    }
}

//! Registry of live tunnels keyed by public id

use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use burrow_broker::{BrokerConfig, BrokerError, SocketBroker};
use burrow_proto::{generate_id, DEFAULT_MAX_SOCKETS};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::bridge::{RequestBridge, DEFAULT_GRACE_PERIOD};

/// Registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to start tunnel broker: {0}")]
    Broker(#[from] BrokerError),
}

/// Settings applied to every tunnel the registry creates
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub max_sockets: usize,
    pub bind_ip: IpAddr,
    pub port_range: Option<(u16, u16)>,
    pub grace_period: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_sockets: DEFAULT_MAX_SOCKETS,
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port_range: None,
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }
}

/// Result of a successful allocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub id: String,
    pub port: u16,
    pub max_connections: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub tunnels: usize,
}

/// One public tunnel: a socket broker and the bridge forwarding over it
pub struct Tunnel {
    id: String,
    broker: Arc<SocketBroker>,
    bridge: RequestBridge,
    /// Set once the broker is listening and the tunnel counts as active
    counted: AtomicBool,
}

impl Tunnel {
    fn new(id: String, config: &RegistryConfig) -> Self {
        let broker = Arc::new(SocketBroker::new(BrokerConfig {
            tunnel_id: id.clone(),
            max_sockets: config.max_sockets,
            bind_ip: config.bind_ip,
            port_range: config.port_range,
        }));
        let bridge = RequestBridge::new(broker.clone(), config.grace_period);

        Self {
            id,
            broker,
            bridge,
            counted: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn bridge(&self) -> &RequestBridge {
        &self.bridge
    }

    pub fn broker(&self) -> &SocketBroker {
        &self.broker
    }

    pub fn port(&self) -> u16 {
        self.broker.port()
    }

    pub fn connected_sockets(&self) -> usize {
        self.broker.connected_sockets()
    }

    pub fn close(&self) {
        self.bridge.close();
    }
}

struct RegistryInner {
    config: RegistryConfig,
    tunnels: DashMap<String, Arc<Tunnel>>,
    active: AtomicUsize,
}

impl RegistryInner {
    /// Drop `tunnel` from the map if it is still the entry under its id
    fn unregister(&self, tunnel: &Arc<Tunnel>) -> bool {
        let removed = self
            .tunnels
            .remove_if(&tunnel.id, |_, current| Arc::ptr_eq(current, tunnel))
            .is_some();

        if tunnel.counted.swap(false, Ordering::SeqCst) {
            self.active.fetch_sub(1, Ordering::SeqCst);
        }

        removed
    }
}

/// Owns every live tunnel
///
/// Cloning is cheap; clones share the same map.
#[derive(Clone)]
pub struct TunnelRegistry {
    inner: Arc<RegistryInner>,
}

impl TunnelRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                config,
                tunnels: DashMap::new(),
                active: AtomicUsize::new(0),
            }),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    /// Create a tunnel, under `requested` when that id is free
    ///
    /// A taken id silently falls back to a random one. The entry is in the
    /// map before the broker binds and is rolled back if binding fails.
    pub async fn allocate(&self, requested: Option<&str>) -> Result<Allocation, RegistryError> {
        let mut candidate = requested.map(str::to_string).unwrap_or_else(generate_id);

        let tunnel = loop {
            match self.inner.tunnels.entry(candidate.clone()) {
                Entry::Occupied(_) => {
                    debug!("Tunnel id {} taken, picking another", candidate);
                    candidate = generate_id();
                }
                Entry::Vacant(slot) => {
                    let tunnel = Arc::new(Tunnel::new(candidate.clone(), &self.inner.config));
                    slot.insert(tunnel.clone());
                    break tunnel;
                }
            }
        };

        let port = match tunnel.broker.listen().await {
            Ok(port) => port,
            Err(e) => {
                warn!("Tunnel {}: failed to start broker: {}", tunnel.id, e);
                self.inner.unregister(&tunnel);
                tunnel.close();
                return Err(e.into());
            }
        };

        tunnel.counted.store(true, Ordering::SeqCst);
        self.inner.active.fetch_add(1, Ordering::SeqCst);

        if tunnel.bridge.is_closed() {
            // Removed while binding
            self.inner.unregister(&tunnel);
            return Err(BrokerError::Closed.into());
        }

        let registry = Arc::downgrade(&self.inner);
        let watched = Arc::downgrade(&tunnel);
        let closed = tunnel.bridge.closed();
        tokio::spawn(async move {
            closed.await;
            release(registry, watched);
        });

        info!("Tunnel {} created, broker on port {}", tunnel.id, port);

        Ok(Allocation {
            id: tunnel.id.clone(),
            port,
            max_connections: self.inner.config.max_sockets,
        })
    }

    /// Remove and close a tunnel; unknown ids are ignored
    pub fn remove(&self, id: &str) {
        let Some((_, tunnel)) = self.inner.tunnels.remove(id) else {
            return;
        };

        if tunnel.counted.swap(false, Ordering::SeqCst) {
            self.inner.active.fetch_sub(1, Ordering::SeqCst);
        }

        info!("Tunnel {} removed", id);
        tunnel.close();
    }

    pub fn get(&self, id: &str) -> Option<Arc<Tunnel>> {
        self.inner.tunnels.get(id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.tunnels.contains_key(id)
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            tunnels: self.inner.active.load(Ordering::SeqCst),
        }
    }

    /// Sorted ids of every registered tunnel
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inner
            .tunnels
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        ids
    }

    /// Remove and close every tunnel
    pub fn close_all(&self) {
        for id in self.ids() {
            self.remove(&id);
        }
    }
}

fn release(registry: Weak<RegistryInner>, tunnel: Weak<Tunnel>) {
    let (Some(registry), Some(tunnel)) = (registry.upgrade(), tunnel.upgrade()) else {
        return;
    };

    if registry.unregister(&tunnel) {
        info!("Tunnel {} closed and unregistered", tunnel.id);
    }
}

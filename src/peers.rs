use crate::error::ConfigurationError;
use crate::types::{ConnectionState, NodeId};
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

/// One configured peer. `id` is learned from the peer's `Hello` the first
/// time a dial to `addr` completes its handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEndpoint {
    pub addr: SocketAddr,
    pub id: Option<NodeId>,
    pub state: ConnectionState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Added,
    AlreadyKnown,
}

/// Cluster membership as configured through `add_peer`, shared between the
/// node façade, the dialers and the processing loop.
#[derive(Debug, Clone)]
pub struct PeerRegistry {
    inner: Arc<RwLock<Vec<PeerEndpoint>>>,
    limit: usize,
}

impl PeerRegistry {
    /// A registry for a cluster of `cluster_size` nodes, which admits at
    /// most `cluster_size - 1` peers.
    pub fn new(cluster_size: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Vec::new())),
            limit: cluster_size.saturating_sub(1),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn add(&self, addr: SocketAddr) -> Result<AddOutcome, ConfigurationError> {
        let mut peers = self.inner.write().unwrap();
        if peers.iter().any(|p| p.addr == addr) {
            return Ok(AddOutcome::AlreadyKnown);
        }
        if peers.len() >= self.limit {
            return Err(ConfigurationError::TooManyPeers {
                cluster_size: self.limit + 1,
                limit: self.limit,
            });
        }
        peers.push(PeerEndpoint {
            addr,
            id: None,
            state: ConnectionState::Disconnected,
        });
        Ok(AddOutcome::Added)
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, addr: SocketAddr) -> Option<PeerEndpoint> {
        self.inner
            .read()
            .unwrap()
            .iter()
            .find(|p| p.addr == addr)
            .cloned()
    }

    pub fn list(&self) -> Vec<PeerEndpoint> {
        self.inner.read().unwrap().clone()
    }

    pub fn addresses(&self) -> Vec<SocketAddr> {
        self.inner.read().unwrap().iter().map(|p| p.addr).collect()
    }

    /// Binds `id` to the endpoint at `addr`. Fails with the address already
    /// claiming `id` when another endpoint holds it.
    pub fn learn_id(&self, addr: SocketAddr, id: NodeId) -> Result<(), SocketAddr> {
        let mut peers = self.inner.write().unwrap();
        if let Some(other) = peers
            .iter()
            .find(|p| p.addr != addr && p.id == Some(id))
        {
            return Err(other.addr);
        }
        if let Some(peer) = peers.iter_mut().find(|p| p.addr == addr) {
            peer.id = Some(id);
        }
        Ok(())
    }

    pub fn set_state(&self, addr: SocketAddr, state: ConnectionState) {
        let mut peers = self.inner.write().unwrap();
        if let Some(peer) = peers.iter_mut().find(|p| p.addr == addr) {
            peer.state = state;
        }
    }

    /// Updates every endpoint bound to `id`. Returns whether one was found.
    pub fn set_state_by_id(&self, id: NodeId, state: ConnectionState) -> bool {
        let mut found = false;
        for peer in self
            .inner
            .write()
            .unwrap()
            .iter_mut()
            .filter(|p| p.id == Some(id))
        {
            peer.state = state;
            found = true;
        }
        found
    }

    pub fn is_connected(&self, addr: SocketAddr) -> bool {
        self.get(addr)
            .map_or(false, |p| p.state == ConnectionState::Connected)
    }

    pub fn connected(&self) -> usize {
        self.inner
            .read()
            .unwrap()
            .iter()
            .filter(|p| p.state == ConnectionState::Connected)
            .count()
    }

    pub fn clear(&self) {
        self.inner.write().unwrap().clear();
    }
}

/// Parses a literal `host:port` or `[v6]:port` address.
pub fn parse_address(address: &str) -> Result<SocketAddr, ConfigurationError> {
    address
        .trim()
        .parse()
        .map_err(|_| ConfigurationError::InvalidAddress(address.to_string()))
}

/// Like [`parse_address`] but also resolves host names. The first resolved
/// address wins.
pub async fn resolve(address: &str) -> Result<SocketAddr, ConfigurationError> {
    let address = address.trim();
    if let Ok(addr) = address.parse::<SocketAddr>() {
        return Ok(addr);
    }

    let valid = match address.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok(),
        None => false,
    };
    if !valid {
        return Err(ConfigurationError::InvalidAddress(address.to_string()));
    }

    let mut addrs = tokio::net::lookup_host(address).await.map_err(|e| {
        ConfigurationError::ConnectFailure {
            address: address.to_string(),
            source: e,
        }
    })?;
    addrs
        .next()
        .ok_or_else(|| ConfigurationError::ConnectFailure {
            address: address.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses resolved"),
        })
}

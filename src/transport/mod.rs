//! Encrypted, length-delimited TCP links between peers.
//!
//! Links are spawned tasks. The processing loop owns the [`Links`] table and
//! is the only place a link becomes routable; tasks report to it through the
//! [`Inbound`] queue.

pub mod codec;
pub(crate) mod link;

pub use codec::{CodecError, FrameCipher};
pub use link::LinkError;

use crate::message::Message;
use crate::peers::PeerRegistry;
use crate::types::{ConnectionState, NodeId};
use link::LinkContext;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// What link tasks report to the processing loop.
#[derive(Debug)]
pub(crate) enum Inbound {
    Connected {
        peer: NodeId,
        conn_id: u64,
        dialed_by: NodeId,
        sender: mpsc::UnboundedSender<Message>,
    },
    Disconnected {
        peer: NodeId,
        conn_id: u64,
    },
    Message {
        peer: NodeId,
        message: Message,
    },
}

#[derive(Debug)]
struct LinkHandle {
    conn_id: u64,
    dialed_by: NodeId,
    sender: mpsc::UnboundedSender<Message>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    New,
    Replaced,
    Rejected,
}

/// Routable links, at most one per peer.
///
/// When both ends dial each other, the connection dialed by the lower id is
/// kept on both sides. Dropping a handle closes its connection.
#[derive(Debug)]
pub(crate) struct Links {
    id: NodeId,
    links: HashMap<NodeId, LinkHandle>,
}

impl Links {
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            links: HashMap::new(),
        }
    }

    pub fn admit(
        &mut self,
        peer: NodeId,
        conn_id: u64,
        dialed_by: NodeId,
        sender: mpsc::UnboundedSender<Message>,
    ) -> Admission {
        let preferred = self.id.min(peer);
        let admission = match self.links.get(&peer) {
            None => Admission::New,
            Some(existing) if existing.dialed_by == preferred && dialed_by != preferred => {
                Admission::Rejected
            }
            Some(_) => Admission::Replaced,
        };

        if admission != Admission::Rejected {
            self.links.insert(
                peer,
                LinkHandle {
                    conn_id,
                    dialed_by,
                    sender,
                },
            );
        }
        admission
    }

    /// Drops the link for `peer` if it is still connection `conn_id`.
    pub fn remove(&mut self, peer: NodeId, conn_id: u64) -> bool {
        match self.links.get(&peer) {
            Some(link) if link.conn_id == conn_id => {
                self.links.remove(&peer);
                true
            }
            _ => false,
        }
    }

    pub fn send(&self, peer: NodeId, message: Message) {
        if let Some(link) = self.links.get(&peer) {
            let _ = link.sender.send(message);
        }
    }

    pub fn broadcast(&self, message: &Message) {
        for link in self.links.values() {
            let _ = link.sender.send(message.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn clear(&mut self) {
        self.links.clear();
    }
}

pub(crate) fn spawn_acceptor(listener: TcpListener, ctx: LinkContext) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut shutdown = ctx.shutdown.clone();
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        let ctx = ctx.clone();
                        tokio::spawn(async move {
                            accept_link(stream, remote, ctx).await;
                        });
                    }
                    Err(e) => {
                        error!("node {} accept error: {}", ctx.id, e);
                        tokio::time::sleep(Duration::from_millis(200)).await;
                    }
                },
            }
        }
        debug!("node {} stopped accepting", ctx.id);
    })
}

async fn accept_link(stream: TcpStream, remote: SocketAddr, ctx: LinkContext) {
    match link::establish(stream, &ctx).await {
        Ok((peer, reader, writer)) => {
            debug!("node {} accepted peer {} from {}", ctx.id, peer, remote);
            let _ = link::serve(peer, peer, reader, writer, ctx).await;
        }
        Err(e) => {
            warn!("node {} dropped inbound connection from {}: {}", ctx.id, remote, e);
        }
    }
}

/// Keeps a connection to `addr` alive, redialing with exponential backoff
/// while no link to that peer exists.
pub(crate) fn spawn_dialer(
    addr: SocketAddr,
    registry: PeerRegistry,
    ctx: LinkContext,
    initial: Duration,
    max: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut shutdown = ctx.shutdown.clone();
        let mut backoff = initial;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let wait = if registry.is_connected(addr) || dial(addr, &registry, &ctx).await {
                backoff = initial;
                initial
            } else {
                let wait = backoff;
                backoff = (backoff * 2).min(max);
                wait
            };

            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }
        debug!("node {} stopped dialing {}", ctx.id, addr);
    })
}

/// One dial attempt. Returns whether a link was served until it closed.
async fn dial(addr: SocketAddr, registry: &PeerRegistry, ctx: &LinkContext) -> bool {
    registry.set_state(addr, ConnectionState::Connecting);

    let stream = match TcpStream::connect(addr).await {
        Ok(stream) => stream,
        Err(e) => {
            debug!("node {} cannot reach {}: {}", ctx.id, addr, e);
            registry.set_state(addr, ConnectionState::Disconnected);
            return false;
        }
    };

    let (peer, reader, writer) = match link::establish(stream, ctx).await {
        Ok(established) => established,
        Err(e) => {
            warn!("node {} handshake with {} failed: {}", ctx.id, addr, e);
            registry.set_state(addr, ConnectionState::Disconnected);
            return false;
        }
    };

    if let Err(claimed_by) = registry.learn_id(addr, peer) {
        warn!(
            "node {} ignoring {}: peer id {} already belongs to {}",
            ctx.id, addr, peer, claimed_by
        );
        registry.set_state(addr, ConnectionState::Disconnected);
        return false;
    }

    info!("node {} connected to peer {} at {}", ctx.id, peer, addr);
    if let Err(e) = link::serve(peer, ctx.id, reader, writer, ctx.clone()).await {
        debug!("node {} link to {} ended: {}", ctx.id, addr, e);
    }
    true
}

use crate::dispatch::Dispatcher;
use crate::engine::{Engine, Target};
use crate::error::{Error, LifecycleError, Result};
use crate::node::{Command, NodeShared};
use crate::transport::link::LinkContext;
use crate::transport::{self, Admission, FrameCipher, Inbound, Links};
use crate::types::ConnectionState;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// The node's single processing loop. It alone owns the engine and the link
/// table; everything else reaches it through queues.
pub(crate) struct Runtime {
    shared: Arc<NodeShared>,
    engine: Engine,
    links: Links,
    dispatcher: Dispatcher,
}

impl Runtime {
    pub fn new(shared: Arc<NodeShared>) -> Self {
        let engine = Engine::new(
            shared.id,
            shared.cluster_size,
            shared.config.clone(),
            Instant::now(),
        );
        let links = Links::new(shared.id);
        let dispatcher = Dispatcher::new(shared.handle);
        Self {
            shared,
            engine,
            links,
            dispatcher,
        }
    }

    pub async fn run(
        mut self,
        listener: TcpListener,
        mut commands: mpsc::UnboundedReceiver<Command>,
        cipher: FrameCipher,
    ) -> Result<()> {
        let config = self.shared.config.clone();
        let (inbound_tx, mut inbound) = mpsc::channel(config.inbound_queue);
        let mut shutdown = self.shared.shutdown.subscribe();

        let ctx = LinkContext {
            id: self.shared.id,
            cluster_size: self.shared.cluster_size,
            cipher,
            max_frame_len: config.max_frame_len,
            inbound: inbound_tx,
            shutdown: shutdown.clone(),
        };

        let mut tasks = vec![transport::spawn_acceptor(listener, ctx.clone())];
        for addr in self.shared.peers.addresses() {
            tasks.push(transport::spawn_dialer(
                addr,
                self.shared.peers.clone(),
                ctx.clone(),
                config.reconnect_initial(),
                config.reconnect_max(),
            ));
        }
        drop(ctx);

        let mut ticker = tokio::time::interval(config.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        while !*shutdown.borrow() {
            tokio::select! {
                _ = shutdown.changed() => break,
                Some(command) = commands.recv() => self.handle_command(command),
                Some(event) = inbound.recv() => self.handle_inbound(event),
                _ = ticker.tick() => self.engine.tick(Instant::now()),
            }
            self.flush();
        }

        self.engine.shutdown();
        self.links.clear();
        for task in tasks {
            task.abort();
        }
        info!("node {} processing loop stopped", self.shared.id);
        Err(Error::Lifecycle(LifecycleError::Destroyed))
    }

    fn handle_command(&mut self, command: Command) {
        let now = Instant::now();
        match command {
            Command::Propose { payload, reply } => self.engine.propose(payload, reply, now),
            Command::Confirm(round) => self.engine.confirm(round, now),
        }
    }

    fn handle_inbound(&mut self, event: Inbound) {
        let now = Instant::now();
        match event {
            Inbound::Connected {
                peer,
                conn_id,
                dialed_by,
                sender,
            } => match self.links.admit(peer, conn_id, dialed_by, sender) {
                Admission::Rejected => {
                    debug!(
                        "node {} keeps its existing link to peer {}, dropping conn {}",
                        self.shared.id, peer, conn_id
                    );
                }
                admission => {
                    if admission == Admission::New {
                        info!(
                            "node {} connected to peer {} ({} links)",
                            self.shared.id,
                            peer,
                            self.links.len()
                        );
                    }
                    self.shared
                        .peers
                        .set_state_by_id(peer, ConnectionState::Connected);
                    self.engine.peer_connected(peer, now);
                }
            },
            Inbound::Disconnected { peer, conn_id } => {
                if self.links.remove(peer, conn_id) {
                    info!("node {} lost connection to peer {}", self.shared.id, peer);
                    self.shared
                        .peers
                        .set_state_by_id(peer, ConnectionState::Disconnected);
                    self.engine.peer_disconnected(peer);
                }
            }
            Inbound::Message { peer, message } => self.engine.step(peer, message, now),
        }
    }

    /// Sends the engine's pending messages, hands its events to the
    /// dispatcher and publishes the status snapshot.
    fn flush(&mut self) {
        let output = self.engine.take_output();

        for outgoing in output.messages {
            match outgoing.to {
                Target::All => self.links.broadcast(&outgoing.message),
                Target::Peer(peer) => self.links.send(peer, outgoing.message),
            }
        }
        for event in output.events {
            self.dispatcher.dispatch(event);
        }

        let status = self.engine.status();
        self.shared.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
    }
}

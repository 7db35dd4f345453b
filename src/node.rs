use crate::config::EngineConfig;
use crate::engine::ProposalReply;
use crate::error::{ConfigurationError, Error, LifecycleError, Result};
use crate::peers::{self, AddOutcome, PeerEndpoint, PeerRegistry};
use crate::registry::{self, NodeHandle};
use crate::runtime::Runtime;
use crate::transport::FrameCipher;
use crate::types::*;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info};

/// Application callbacks. Every method runs on a task of its own lane, never
/// on the processing loop, so calling [`Node::confirm`] from `on_append` is
/// expected and safe.
#[async_trait]
pub trait CallbackHandler: Send + Sync + 'static {
    /// A round replicated from the leader. Persist it, then call
    /// [`Node::confirm`].
    async fn on_append(&self, node: &Node, round: Round, payload: Vec<u8>);

    /// `round` reached quorum. Called in round order after its `on_append`.
    async fn on_commit(&self, _node: &Node, _round: Round) {}

    async fn gained_leadership(&self, node: &Node);

    async fn lost_leadership(&self, node: &Node);

    /// The node's belief about the current leader changed. `None` means no
    /// leader is known.
    async fn on_leader_change(&self, node: &Node, leader: Option<NodeId>);
}

/// A handler that ignores every event. Rounds are never confirmed.
pub struct NoopHandler;

#[async_trait]
impl CallbackHandler for NoopHandler {
    async fn on_append(&self, _node: &Node, _round: Round, _payload: Vec<u8>) {}
    async fn gained_leadership(&self, _node: &Node) {}
    async fn lost_leadership(&self, _node: &Node) {}
    async fn on_leader_change(&self, _node: &Node, _leader: Option<NodeId>) {}
}

/// Application requests funneled into the processing loop.
pub(crate) enum Command {
    Propose {
        payload: Vec<u8>,
        reply: ProposalReply,
    },
    Confirm(Round),
}

struct Lifecycle {
    state: LifecycleState,
    cipher: Option<FrameCipher>,
    listener: Option<TcpListener>,
    commands: Option<mpsc::UnboundedReceiver<Command>>,
}

pub(crate) struct NodeShared {
    pub(crate) id: NodeId,
    pub(crate) cluster_size: usize,
    pub(crate) config: EngineConfig,
    pub(crate) handle: NodeHandle,
    pub(crate) local_addr: SocketAddr,
    pub(crate) peers: PeerRegistry,
    pub(crate) status: watch::Sender<NodeStatus>,
    pub(crate) shutdown: watch::Sender<bool>,
    handler: Arc<dyn CallbackHandler>,
    commands: mpsc::UnboundedSender<Command>,
    lifecycle: Mutex<Lifecycle>,
}

/// One member of an atomic broadcast cluster. Cheap to clone; clones share
/// the same node.
#[derive(Clone)]
pub struct Node {
    shared: Arc<NodeShared>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.shared.id)
            .field("handle", &self.shared.handle)
            .field("local_addr", &self.shared.local_addr)
            .field("state", &self.state())
            .finish()
    }
}

impl Node {
    /// Creates a node with default engine settings and binds its listen
    /// address. The node is returned in the `Listening` state.
    pub async fn new<H: CallbackHandler>(
        id: NodeId,
        listen_addr: &str,
        cluster_size: usize,
        handler: H,
    ) -> Result<Self> {
        Self::with_config(id, listen_addr, cluster_size, handler, EngineConfig::default()).await
    }

    pub async fn with_config<H: CallbackHandler>(
        id: NodeId,
        listen_addr: &str,
        cluster_size: usize,
        handler: H,
        config: EngineConfig,
    ) -> Result<Self> {
        if id == 0 {
            return Err(ConfigurationError::InvalidNodeId.into());
        }
        if cluster_size == 0 {
            return Err(ConfigurationError::InvalidClusterSize(cluster_size).into());
        }
        config.validate()?;

        let addr = peers::resolve(listen_addr).await?;
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(NodeStatus::new(id));
        let (shutdown, _) = watch::channel(false);
        let handle = registry::next_handle();

        let shared = Arc::new(NodeShared {
            id,
            cluster_size,
            config,
            handle,
            local_addr,
            peers: PeerRegistry::new(cluster_size),
            status,
            shutdown,
            handler: Arc::new(handler),
            commands: commands_tx,
            lifecycle: Mutex::new(Lifecycle {
                state: LifecycleState::Created,
                cipher: None,
                listener: Some(listener),
                commands: Some(commands_rx),
            }),
        });
        shared.lifecycle.lock().unwrap().state = LifecycleState::Listening;
        registry::insert(handle, &shared);

        info!(
            "node {} listening on {} (cluster size {})",
            id, local_addr, cluster_size
        );
        Ok(Self { shared })
    }

    pub(crate) fn from_shared(shared: Arc<NodeShared>) -> Self {
        Self { shared }
    }

    pub(crate) fn handler(&self) -> Arc<dyn CallbackHandler> {
        self.shared.handler.clone()
    }

    pub fn id(&self) -> NodeId {
        self.shared.id
    }

    pub fn cluster_size(&self) -> usize {
        self.shared.cluster_size
    }

    pub fn handle(&self) -> NodeHandle {
        self.shared.handle
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    pub fn state(&self) -> LifecycleState {
        self.shared.lifecycle.lock().unwrap().state
    }

    pub fn status(&self) -> NodeStatus {
        self.shared.status.borrow().clone()
    }

    /// Watches status changes published by the processing loop.
    pub fn subscribe(&self) -> watch::Receiver<NodeStatus> {
        self.shared.status.subscribe()
    }

    pub fn is_leader(&self) -> bool {
        self.shared.status.borrow().is_leader()
    }

    pub fn leader_id(&self) -> Option<NodeId> {
        self.shared.status.borrow().leader
    }

    pub fn peers(&self) -> Vec<PeerEndpoint> {
        self.shared.peers.list()
    }

    /// Sets the shared cluster key used to seal every frame. Valid only
    /// before `run`.
    pub fn set_key(&self, key: impl AsRef<[u8]>) -> Result<()> {
        let key = key.as_ref();
        let mut lifecycle = self.shared.lifecycle.lock().unwrap();
        ensure_configurable(lifecycle.state)?;

        if key.is_empty() {
            return Err(ConfigurationError::InvalidKey("key is empty".to_string()).into());
        }
        let max = self.shared.config.max_key_len;
        if key.len() > max {
            return Err(ConfigurationError::InvalidKey(format!(
                "key is {} bytes, at most {} allowed",
                key.len(),
                max
            ))
            .into());
        }

        lifecycle.cipher = Some(FrameCipher::new(key));
        debug!("node {} key set", self.shared.id);
        Ok(())
    }

    /// Registers a peer to connect to once running. Re-adding a known
    /// address is a no-op.
    pub async fn add_peer(&self, address: &str) -> Result<()> {
        ensure_configurable(self.state())?;

        let addr = peers::resolve(address).await?;
        if addr == self.shared.local_addr {
            return Err(ConfigurationError::SelfPeer(address.to_string()).into());
        }

        let lifecycle = self.shared.lifecycle.lock().unwrap();
        ensure_configurable(lifecycle.state)?;
        match self.shared.peers.add(addr)? {
            AddOutcome::Added => info!("node {} added peer {}", self.shared.id, addr),
            AddOutcome::AlreadyKnown => debug!("node {} already knows peer {}", self.shared.id, addr),
        }
        Ok(())
    }

    /// Runs the processing loop until the node is destroyed, which is
    /// reported as `Err(Lifecycle(Destroyed))`.
    pub async fn run(&self) -> Result<()> {
        let (listener, commands, cipher) = {
            let mut lifecycle = self.shared.lifecycle.lock().unwrap();
            match lifecycle.state {
                LifecycleState::Listening => {}
                LifecycleState::Running => return Err(LifecycleError::AlreadyRunning.into()),
                LifecycleState::Destroyed => return Err(LifecycleError::Destroyed.into()),
                state => return Err(LifecycleError::NotRunning(state).into()),
            }

            let cipher = lifecycle
                .cipher
                .clone()
                .ok_or(ConfigurationError::MissingKey)?;
            let (Some(listener), Some(commands)) =
                (lifecycle.listener.take(), lifecycle.commands.take())
            else {
                return Err(LifecycleError::AlreadyRunning.into());
            };
            lifecycle.state = LifecycleState::Running;
            (listener, commands, cipher)
        };

        info!(
            "node {} running with {} configured peers",
            self.shared.id,
            self.shared.peers.len()
        );
        Runtime::new(self.shared.clone())
            .run(listener, commands, cipher)
            .await
    }

    /// Broadcasts `payload` and waits until a majority confirmed it.
    /// Returns the round it was assigned.
    pub async fn propose(&self, payload: impl Into<Vec<u8>>) -> Result<Round> {
        match self.state() {
            LifecycleState::Running => {}
            LifecycleState::Destroyed => return Err(LifecycleError::Destroyed.into()),
            state => return Err(LifecycleError::NotRunning(state).into()),
        }

        let (reply, rx) = oneshot::channel();
        let command = Command::Propose {
            payload: payload.into(),
            reply,
        };
        if self.shared.commands.send(command).is_err() {
            return Err(LifecycleError::Destroyed.into());
        }

        rx.await
            .unwrap_or(Err(Error::Lifecycle(LifecycleError::Destroyed)))
    }

    /// Reports that `round` is durably stored locally.
    pub fn confirm(&self, round: Round) {
        let _ = self.shared.commands.send(Command::Confirm(round));
    }

    /// Stops the node for good: the loop exits, links close, a pending
    /// proposal fails and `run` returns.
    pub fn destroy(&self) -> Result<()> {
        {
            let mut lifecycle = self.shared.lifecycle.lock().unwrap();
            if lifecycle.state == LifecycleState::Destroyed {
                return Err(LifecycleError::AlreadyDestroyed.into());
            }
            lifecycle.state = LifecycleState::Destroyed;
            lifecycle.listener = None;
            lifecycle.commands = None;
            lifecycle.cipher = None;
        }

        self.shared.shutdown.send_replace(true);
        registry::remove(self.shared.handle);
        self.shared.peers.clear();
        info!("node {} destroyed", self.shared.id);
        Ok(())
    }
}

fn ensure_configurable(state: LifecycleState) -> Result<(), LifecycleError> {
    match state {
        LifecycleState::Created | LifecycleState::Listening => Ok(()),
        LifecycleState::Destroyed => Err(LifecycleError::Destroyed),
        state => Err(LifecycleError::NotConfigurable(state)),
    }
}

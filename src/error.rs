use crate::types::LifecycleState;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("this node is not the leader")]
    NotLeader,

    #[error("a proposal is already in progress on this node")]
    ProposalInProgress,

    #[error("append failed: {0}")]
    AppendFailed(AppendFailure),

    #[error("lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
}

impl Error {
    /// Errors the caller can retry after waiting for a leadership event.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::NotLeader | Error::AppendFailed(_))
    }
}

#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("invalid address {0:?}")]
    InvalidAddress(String),

    #[error("cannot reach {address}: {source}")]
    ConnectFailure {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("a shared key must be set before running")]
    MissingKey,

    #[error("cluster size must be at least 1, got {0}")]
    InvalidClusterSize(usize),

    #[error("node id 0 is reserved")]
    InvalidNodeId,

    #[error("cluster of {cluster_size} accepts at most {limit} peers")]
    TooManyPeers { cluster_size: usize, limit: usize },

    #[error("peer address {0} is this node's own listen address")]
    SelfPeer(String),

    #[error("invalid engine config: {0}")]
    InvalidEngineConfig(String),
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum AppendFailure {
    #[error("leadership lost before the round reached quorum")]
    LeadershipLost,

    #[error("round did not reach quorum in time")]
    QuorumTimeout,
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("cannot configure a node in state {0}")]
    NotConfigurable(LifecycleState),

    #[error("node is not running (state {0})")]
    NotRunning(LifecycleState),

    #[error("node is already running")]
    AlreadyRunning,

    #[error("node has been destroyed")]
    Destroyed,

    #[error("node was already destroyed")]
    AlreadyDestroyed,
}

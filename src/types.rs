use serde::{Deserialize, Serialize};
use std::fmt;

/// Cluster-unique node identifier. `0` is reserved to mean "no node".
pub type NodeId = u64;

/// Election generation. Advances only when a node starts an election or
/// learns of a newer one.
pub type Term = u64;

/// Position of one broadcast message in the cluster's total order.
/// Round `0` is the empty prefix; the first proposal gets round `1`.
pub type Round = u64;

/// Number of nodes that form a strict majority of `cluster_size`,
/// i.e. `⌈(N+1)/2⌉`.
pub fn quorum(cluster_size: usize) -> usize {
    cluster_size / 2 + 1
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum LeadershipState {
    Follower,
    Candidate,
    Leader,
}

impl fmt::Display for LeadershipState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LeadershipState::Follower => write!(f, "follower"),
            LeadershipState::Candidate => write!(f, "candidate"),
            LeadershipState::Leader => write!(f, "leader"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    Created,
    Listening,
    Running,
    Destroyed,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleState::Created => write!(f, "created"),
            LifecycleState::Listening => write!(f, "listening"),
            LifecycleState::Running => write!(f, "running"),
            LifecycleState::Destroyed => write!(f, "destroyed"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// One round as it travels between nodes and sits in the round log.
///
/// `term` is the term of the leader that last stamped the entry, `origin` is
/// the term in which it was first proposed. Two entries at the same round with
/// the same origin carry the same payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Entry {
    pub round: Round,
    pub term: Term,
    pub origin: Term,
    pub payload: Vec<u8>,
}

impl Entry {
    pub fn new(round: Round, term: Term, payload: Vec<u8>) -> Self {
        Self {
            round,
            term,
            origin: term,
            payload,
        }
    }
}

/// Point-in-time view of a node's consensus state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeStatus {
    pub id: NodeId,
    pub term: Term,
    pub leadership: LeadershipState,
    pub leader: Option<NodeId>,
    pub last_round: Round,
    pub commit_round: Round,
}

impl NodeStatus {
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            term: 0,
            leadership: LeadershipState::Follower,
            leader: None,
            last_round: 0,
            commit_round: 0,
        }
    }

    pub fn is_leader(&self) -> bool {
        self.leadership == LeadershipState::Leader
    }
}

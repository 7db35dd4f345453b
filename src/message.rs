use crate::types::{Entry, NodeId, Round, Term};
use serde::{Deserialize, Serialize};

/// Frames exchanged between peers. The sender is attributed by the link the
/// frame arrived on, which is bound to an id by the `Hello` handshake.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Message {
    Hello { id: NodeId, cluster_size: u64 },
    VoteRequest(VoteRequest),
    VoteResponse(VoteResponse),
    Append(AppendRequest),
    AppendAck(AppendAck),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VoteRequest {
    pub term: Term,
    pub candidate: NodeId,
    pub last_round: Round,
    pub last_term: Term,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VoteResponse {
    pub term: Term,
    pub granted: bool,
}

/// Replication and heartbeat in one: an empty `entries` is a heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppendRequest {
    pub term: Term,
    pub leader: NodeId,
    pub prev_round: Round,
    pub prev_term: Term,
    pub entries: Vec<Entry>,
    pub commit: Round,
}

/// Follower reply to `Append`, also sent unsolicited after a local confirm.
///
/// On success `last_round` is the highest round known to match the leader.
/// On failure it is a hint of where the leader should resume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppendAck {
    pub term: Term,
    pub success: bool,
    pub last_round: Round,
    pub confirmed: Round,
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Hello { .. } => "hello",
            Message::VoteRequest(_) => "vote_request",
            Message::VoteResponse(_) => "vote_response",
            Message::Append(_) => "append",
            Message::AppendAck(_) => "append_ack",
        }
    }
}

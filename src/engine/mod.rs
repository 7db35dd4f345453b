//! Sans-IO consensus core.
//!
//! The engine owns term, leadership, the round log and the proposal slot.
//! It never touches sockets or clocks: callers feed it peer messages,
//! application commands and the current instant, then drain the resulting
//! [`Output`] (messages to send and events to dispatch).

mod broadcast;
mod election;
pub mod log;

pub use log::{LogError, RoundLog};

use crate::config::EngineConfig;
use crate::error::{Error, LifecycleError};
use crate::message::Message;
use crate::types::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// Completion signal of one proposal: the committed round or the failure.
pub type ProposalReply = oneshot::Sender<Result<Round, Error>>;

/// Externally observable state changes, in the order the engine decided them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Append { round: Round, payload: Vec<u8> },
    Commit { round: Round },
    GainedLeadership,
    LostLeadership,
    LeaderChange(Option<NodeId>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    All,
    Peer(NodeId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    pub to: Target,
    pub message: Message,
}

#[derive(Debug, Default)]
pub struct Output {
    pub messages: Vec<Outgoing>,
    pub events: Vec<Event>,
}

/// The node's single proposal slot. `payload` is still present while the
/// proposal waits for the leader to finish recovering an earlier round.
pub(crate) struct PendingProposal {
    payload: Option<Vec<u8>>,
    round: Option<Round>,
    reply: ProposalReply,
    submitted: Instant,
}

#[derive(Debug, Clone, Copy)]
struct Inflight {
    round: Round,
    started: Instant,
}

#[derive(Debug, Clone)]
struct Progress {
    next: Round,
    matched: Round,
    confirmed: Round,
    last_contact: Option<Instant>,
    stalled: bool,
}

impl Progress {
    fn new(next: Round) -> Self {
        Self {
            next,
            matched: 0,
            confirmed: 0,
            last_contact: None,
            stalled: false,
        }
    }
}

struct LeaderState {
    progress: HashMap<NodeId, Progress>,
    since: Instant,
    last_heartbeat: Instant,
    inflight: Option<Inflight>,
}

enum Role {
    Follower,
    Candidate { votes: HashSet<NodeId> },
    Leader(LeaderState),
}

pub struct Engine {
    id: NodeId,
    cluster_size: usize,
    config: EngineConfig,
    term: Term,
    voted_for: Option<NodeId>,
    role: Role,
    leader: Option<NodeId>,
    leader_match: Round,
    log: RoundLog,
    election_deadline: Instant,
    proposal: Option<PendingProposal>,
    peers: BTreeSet<NodeId>,
    rng: StdRng,
    output: Output,
}

impl Engine {
    pub fn new(id: NodeId, cluster_size: usize, config: EngineConfig, now: Instant) -> Self {
        let log = RoundLog::new(config.retained_rounds);
        let mut engine = Self {
            id,
            cluster_size,
            config,
            term: 0,
            voted_for: None,
            role: Role::Follower,
            leader: None,
            leader_match: 0,
            log,
            election_deadline: now,
            proposal: None,
            peers: BTreeSet::new(),
            rng: StdRng::from_entropy(),
            output: Output::default(),
        };
        engine.reset_election_deadline(now);
        engine
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn cluster_size(&self) -> usize {
        self.cluster_size
    }

    pub fn term(&self) -> Term {
        self.term
    }

    pub fn leader(&self) -> Option<NodeId> {
        self.leader
    }

    pub fn leadership(&self) -> LeadershipState {
        match self.role {
            Role::Follower => LeadershipState::Follower,
            Role::Candidate { .. } => LeadershipState::Candidate,
            Role::Leader(_) => LeadershipState::Leader,
        }
    }

    pub fn is_leader(&self) -> bool {
        matches!(self.role, Role::Leader(_))
    }

    pub fn log(&self) -> &RoundLog {
        &self.log
    }

    pub fn has_pending_proposal(&self) -> bool {
        self.proposal.is_some()
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            id: self.id,
            term: self.term,
            leadership: self.leadership(),
            leader: self.leader,
            last_round: self.log.last_round(),
            commit_round: self.log.commit(),
        }
    }

    pub fn take_output(&mut self) -> Output {
        std::mem::take(&mut self.output)
    }

    /// Drives timers: election timeouts, heartbeats, leader lease and
    /// proposal timeout.
    pub fn tick(&mut self, now: Instant) {
        if self.is_leader() {
            self.tick_leader(now);
        } else if now >= self.election_deadline {
            self.campaign(now);
        }
    }

    pub fn step(&mut self, from: NodeId, message: Message, now: Instant) {
        if from != self.id {
            self.peers.insert(from);
        }
        match message {
            Message::Hello { .. } => {}
            Message::VoteRequest(req) => self.handle_vote_request(from, req, now),
            Message::VoteResponse(resp) => self.handle_vote_response(from, resp, now),
            Message::Append(req) => self.handle_append(from, req, now),
            Message::AppendAck(ack) => self.handle_append_ack(from, ack, now),
        }
    }

    pub fn peer_connected(&mut self, peer: NodeId, now: Instant) {
        if peer == self.id {
            return;
        }
        self.peers.insert(peer);
        if let Role::Leader(ls) = &mut self.role {
            let next = self.log.last_round() + 1;
            ls.progress.entry(peer).or_insert_with(|| Progress::new(next));
            self.update_retain_floor();
            self.send_append(peer, now);
        }
    }

    pub fn peer_disconnected(&mut self, peer: NodeId) {
        self.peers.remove(&peer);
    }

    /// Fails the outstanding proposal, if any. The engine must not be driven
    /// afterwards.
    pub fn shutdown(&mut self) {
        self.fail_proposal(Error::Lifecycle(LifecycleError::Destroyed));
    }

    fn send(&mut self, to: Target, message: Message) {
        self.output.messages.push(Outgoing { to, message });
    }

    fn emit(&mut self, event: Event) {
        self.output.events.push(event);
    }

    fn set_leader(&mut self, leader: Option<NodeId>) {
        if self.leader != leader {
            self.leader = leader;
            self.leader_match = 0;
            self.emit(Event::LeaderChange(leader));
        }
    }

    fn fail_proposal(&mut self, err: Error) {
        if let Some(p) = self.proposal.take() {
            let _ = p.reply.send(Err(err));
        }
    }

    fn reset_election_deadline(&mut self, now: Instant) {
        let timeout = self
            .rng
            .gen_range(self.config.election_timeout_min_ms..=self.config.election_timeout_max_ms);
        self.election_deadline = now + Duration::from_millis(timeout);
    }

    fn quorum(&self) -> usize {
        quorum(self.cluster_size)
    }
}

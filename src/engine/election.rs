use super::{Engine, Event, Inflight, LeaderState, Progress, Role, Target};
use crate::error::{AppendFailure, Error};
use crate::message::{Message, VoteRequest, VoteResponse};
use crate::types::{NodeId, Round, Term};
use std::collections::{HashMap, HashSet};
use std::time::Instant;
use tracing::{debug, info, warn};

impl Engine {
    /// Starts an election for the next term. No-op on a leader.
    pub fn campaign(&mut self, now: Instant) {
        if self.is_leader() {
            return;
        }

        self.term += 1;
        self.voted_for = Some(self.id);
        self.set_leader(None);

        let mut votes = HashSet::new();
        votes.insert(self.id);
        self.role = Role::Candidate { votes };
        self.reset_election_deadline(now);

        info!("node {} starting election for term {}", self.id, self.term);

        if self.quorum() <= 1 {
            self.become_leader(now);
            return;
        }

        let req = VoteRequest {
            term: self.term,
            candidate: self.id,
            last_round: self.log.last_round(),
            last_term: self.log.last_term(),
        };
        self.send(Target::All, Message::VoteRequest(req));
    }

    pub(super) fn handle_vote_request(&mut self, from: NodeId, req: VoteRequest, now: Instant) {
        if req.term > self.term {
            self.become_follower(req.term, None, now);
        }

        let ours = (self.log.last_term(), self.log.last_round());
        let up_to_date = (req.last_term, req.last_round) >= ours;
        let free = self.voted_for.map_or(true, |v| v == req.candidate);
        let granted = req.term == self.term
            && matches!(self.role, Role::Follower)
            && free
            && up_to_date;

        if granted {
            self.voted_for = Some(req.candidate);
            self.reset_election_deadline(now);
            debug!(
                "node {} votes for {} in term {}",
                self.id, req.candidate, self.term
            );
        }

        let resp = VoteResponse {
            term: self.term,
            granted,
        };
        self.send(Target::Peer(from), Message::VoteResponse(resp));
    }

    pub(super) fn handle_vote_response(&mut self, from: NodeId, resp: VoteResponse, now: Instant) {
        if resp.term > self.term {
            self.become_follower(resp.term, None, now);
            return;
        }
        if resp.term < self.term || !resp.granted {
            return;
        }

        let quorum = self.quorum();
        let won = match &mut self.role {
            Role::Candidate { votes } => {
                votes.insert(from);
                votes.len() >= quorum
            }
            _ => false,
        };
        if won {
            self.become_leader(now);
        }
    }

    pub(super) fn become_leader(&mut self, now: Instant) {
        let recovering = self.log.restamp_uncommitted(self.term);
        let next = self.log.last_round() + 1;
        let progress: HashMap<NodeId, Progress> = self
            .peers
            .iter()
            .map(|&peer| (peer, Progress::new(next)))
            .collect();

        self.role = Role::Leader(LeaderState {
            progress,
            since: now,
            last_heartbeat: now,
            inflight: recovering.map(|round| Inflight {
                round,
                started: now,
            }),
        });

        info!(
            "node {} became leader for term {} (last round {}, commit {})",
            self.id,
            self.term,
            self.log.last_round(),
            self.log.commit()
        );
        if let Some(round) = recovering {
            info!("node {} recovering uncommitted rounds up to {}", self.id, round);
        }

        // Rounds proposed here in an earlier term and never committed.
        for entry in self.log.take_undelivered() {
            self.emit(Event::Append {
                round: entry.round,
                payload: entry.payload,
            });
        }

        self.emit(Event::GainedLeadership);
        self.set_leader(Some(self.id));
        self.broadcast_append(now);
        self.advance_commit(now);
    }

    /// Falls back to follower, adopting `term` if it is newer. A leader
    /// emits `LostLeadership` and fails its in-flight proposal.
    pub(super) fn become_follower(&mut self, term: Term, leader: Option<NodeId>, now: Instant) {
        if term > self.term {
            self.term = term;
            self.voted_for = None;
        }

        let was_leader = self.is_leader();
        self.role = Role::Follower;
        if was_leader {
            info!("node {} lost leadership in term {}", self.id, self.term);
            self.emit(Event::LostLeadership);
            self.fail_proposal(Error::AppendFailed(AppendFailure::LeadershipLost));
            self.log.rewind_local();
            self.log.set_retain_floor(Round::MAX);
        }

        self.reset_election_deadline(now);
        self.set_leader(leader);
    }

    pub(super) fn step_down(&mut self, reason: AppendFailure, now: Instant) {
        self.fail_proposal(Error::AppendFailed(reason));
        self.become_follower(self.term, None, now);
    }

    /// Whether a leader has gone a full lease without hearing from a
    /// majority.
    pub(super) fn lease_expired(&self, now: Instant) -> bool {
        let Role::Leader(ls) = &self.role else {
            return false;
        };
        let lease = self.config.leader_lease();
        if now.saturating_duration_since(ls.since) < lease {
            return false;
        }
        let recent = ls
            .progress
            .values()
            .filter(|p| {
                p.last_contact
                    .map_or(false, |t| now.saturating_duration_since(t) < lease)
            })
            .count();
        recent + 1 < self.quorum()
    }

    pub(super) fn tick_leader(&mut self, now: Instant) {
        if self.lease_expired(now) {
            warn!(
                "node {} has not heard from a majority within the lease, stepping down",
                self.id
            );
            self.step_down(AppendFailure::LeadershipLost, now);
            return;
        }

        if self.proposal_expired(now) {
            warn!(
                "node {} could not commit its in-flight round in time, stepping down",
                self.id
            );
            self.step_down(AppendFailure::QuorumTimeout, now);
            return;
        }

        let due = match &self.role {
            Role::Leader(ls) => {
                now.saturating_duration_since(ls.last_heartbeat) >= self.config.heartbeat_interval()
            }
            _ => false,
        };
        if due {
            self.broadcast_append(now);
        }
    }
}

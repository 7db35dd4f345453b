use super::{Engine, Event, Inflight, PendingProposal, ProposalReply, Progress, Role, Target};
use crate::error::Error;
use crate::message::{AppendAck, AppendRequest, Message};
use crate::types::{NodeId, Round};
use std::time::Instant;
use tracing::{debug, warn};

impl Engine {
    /// Submits `payload` for broadcast. The reply resolves once the assigned
    /// round is confirmed by a majority, or fails.
    pub fn propose(&mut self, payload: Vec<u8>, reply: ProposalReply, now: Instant) {
        if self.proposal.is_some() {
            let _ = reply.send(Err(Error::ProposalInProgress));
            return;
        }
        if !self.is_leader() {
            let _ = reply.send(Err(Error::NotLeader));
            return;
        }

        self.proposal = Some(PendingProposal {
            payload: Some(payload),
            round: None,
            reply,
            submitted: now,
        });
        self.start_waiting_proposal(now);
    }

    /// Assigns a round to the waiting proposal once nothing else is in flight.
    fn start_waiting_proposal(&mut self, now: Instant) {
        let idle = match &self.role {
            Role::Leader(ls) => ls.inflight.is_none(),
            _ => false,
        };
        if !idle {
            return;
        }
        let Some(pending) = self.proposal.as_mut() else {
            return;
        };
        let Some(payload) = pending.payload.take() else {
            return;
        };

        let round = self.log.append(self.term, payload);
        pending.round = Some(round);
        self.log.mark_delivered(round);
        self.log.confirm(round);

        if let Role::Leader(ls) = &mut self.role {
            ls.inflight = Some(Inflight {
                round,
                started: now,
            });
        }

        debug!("node {} proposing round {} in term {}", self.id, round, self.term);
        self.broadcast_append(now);
        self.advance_commit(now);
    }

    /// Records that the application durably stored `round`.
    pub fn confirm(&mut self, round: Round, now: Instant) {
        let advanced = self.log.confirm(round);

        if self.is_leader() {
            self.advance_commit(now);
            return;
        }

        if advanced {
            if let Some(leader) = self.leader {
                let ack = self.ack(true, self.leader_match);
                self.send(Target::Peer(leader), Message::AppendAck(ack));
            }
        }
    }

    fn ack(&self, success: bool, last_round: Round) -> AppendAck {
        AppendAck {
            term: self.term,
            success,
            last_round,
            confirmed: self.log.confirmed().min(self.leader_match),
        }
    }

    pub(super) fn handle_append(&mut self, from: NodeId, req: AppendRequest, now: Instant) {
        if req.term < self.term {
            let ack = AppendAck {
                term: self.term,
                success: false,
                last_round: self.log.last_round(),
                confirmed: self.log.confirmed(),
            };
            self.send(Target::Peer(from), Message::AppendAck(ack));
            return;
        }

        if req.term > self.term || !matches!(self.role, Role::Follower) {
            self.become_follower(req.term, Some(req.leader), now);
        } else {
            self.set_leader(Some(req.leader));
        }
        self.reset_election_deadline(now);

        if !self.log.matches(req.prev_round, req.prev_term) {
            let hint = self.log.last_round().min(req.prev_round.saturating_sub(1));
            debug!(
                "node {} missing rounds before {}, asking leader to resume at {}",
                self.id,
                req.prev_round + 1,
                hint + 1
            );
            let ack = self.ack(false, hint);
            self.send(Target::Peer(from), Message::AppendAck(ack));
            return;
        }

        let matched = req.prev_round + req.entries.len() as Round;
        if let Err(e) = self.log.merge(req.entries) {
            warn!("node {} rejected rounds from leader {}: {}", self.id, req.leader, e);
            let ack = self.ack(false, self.log.commit());
            self.send(Target::Peer(from), Message::AppendAck(ack));
            return;
        }
        self.leader_match = self.leader_match.max(matched);

        for entry in self.log.take_undelivered() {
            self.emit(Event::Append {
                round: entry.round,
                payload: entry.payload,
            });
        }

        let commit = req.commit.min(self.leader_match);
        for round in self.log.commit_to(commit) {
            self.emit(Event::Commit { round });
        }

        let ack = self.ack(true, self.leader_match);
        self.send(Target::Peer(from), Message::AppendAck(ack));
    }

    pub(super) fn handle_append_ack(&mut self, from: NodeId, ack: AppendAck, now: Instant) {
        if ack.term > self.term {
            self.become_follower(ack.term, None, now);
            return;
        }
        if ack.term < self.term {
            return;
        }

        let last = self.log.last_round();
        let Role::Leader(ls) = &mut self.role else {
            return;
        };
        let progress = ls
            .progress
            .entry(from)
            .or_insert_with(|| Progress::new(last + 1));
        progress.last_contact = Some(now);

        let resend = if ack.success {
            progress.matched = progress.matched.max(ack.last_round.min(last));
            progress.next = progress.next.max(progress.matched + 1);
            progress.confirmed = progress.confirmed.max(ack.confirmed.min(progress.matched));
            progress.next <= last
        } else {
            progress.next = (ack.last_round + 1)
                .min(progress.next.saturating_sub(1))
                .max(1);
            true
        };

        if resend {
            self.send_append(from, now);
        }
        self.update_retain_floor();
        self.advance_commit(now);
    }

    /// A leader keeps every round some peer has not matched yet, so a peer
    /// that falls behind the retention window can still catch up.
    pub(super) fn update_retain_floor(&mut self) {
        let floor = match &self.role {
            Role::Leader(ls) => ls
                .progress
                .values()
                .map(|p| p.matched)
                .min()
                .unwrap_or(Round::MAX),
            _ => Round::MAX,
        };
        self.log.set_retain_floor(floor);
    }

    pub(super) fn send_append(&mut self, peer: NodeId, _now: Instant) {
        let Role::Leader(ls) = &mut self.role else {
            return;
        };
        let Some(progress) = ls.progress.get_mut(&peer) else {
            return;
        };

        let prev_round = progress.next - 1;
        let (prev_term, entries) = match (
            self.log.term_at(prev_round),
            self.log.entries_from(progress.next, self.config.max_batch_rounds),
        ) {
            (Some(term), Some(entries)) => (term, entries),
            _ => {
                if !progress.stalled {
                    warn!(
                        "peer {} needs round {} which is no longer retained by node {}",
                        peer, progress.next, self.id
                    );
                    progress.stalled = true;
                }
                return;
            }
        };
        progress.stalled = false;

        let req = AppendRequest {
            term: self.term,
            leader: self.id,
            prev_round,
            prev_term,
            entries,
            commit: self.log.commit(),
        };
        self.send(Target::Peer(peer), Message::Append(req));
    }

    pub(super) fn broadcast_append(&mut self, now: Instant) {
        let next = self.log.last_round() + 1;
        let peers: Vec<NodeId> = match &mut self.role {
            Role::Leader(ls) => {
                ls.last_heartbeat = now;
                for &peer in &self.peers {
                    ls.progress.entry(peer).or_insert_with(|| Progress::new(next));
                }
                ls.progress.keys().copied().collect()
            }
            _ => return,
        };
        self.update_retain_floor();
        for peer in peers {
            self.send_append(peer, now);
        }
    }

    /// Commits every round a majority has confirmed and completes the
    /// proposal whose round became durable.
    pub(super) fn advance_commit(&mut self, now: Instant) {
        let quorum = self.quorum();
        let commit = self.log.commit();
        let new_commit = match &self.role {
            Role::Leader(ls) => {
                let mut best = commit;
                for round in commit + 1..=self.log.last_round() {
                    if self.log.term_at(round) != Some(self.term) {
                        continue;
                    }
                    let peers = ls.progress.values().filter(|p| p.confirmed >= round).count();
                    let own = usize::from(self.log.is_confirmed(round));
                    if peers + own >= quorum {
                        best = round;
                    }
                }
                best
            }
            _ => return,
        };
        if new_commit <= commit {
            return;
        }

        for round in self.log.commit_to(new_commit) {
            self.emit(Event::Commit { round });
        }
        debug!("node {} committed through round {}", self.id, new_commit);

        if let Role::Leader(ls) = &mut self.role {
            if ls.inflight.map_or(false, |i| i.round <= new_commit) {
                ls.inflight = None;
            }
        }

        let done = self
            .proposal
            .as_ref()
            .and_then(|p| p.round)
            .map_or(false, |round| round <= new_commit);
        if done {
            if let Some(p) = self.proposal.take() {
                let round = p.round.unwrap_or(new_commit);
                let _ = p.reply.send(Ok(round));
            }
        }

        self.start_waiting_proposal(now);
        self.broadcast_append(now);
    }

    pub(super) fn proposal_expired(&self, now: Instant) -> bool {
        let timeout = self.config.proposal_timeout();
        let inflight = match &self.role {
            Role::Leader(ls) => ls
                .inflight
                .map_or(false, |i| now.saturating_duration_since(i.started) >= timeout),
            _ => false,
        };
        let waiting = self.proposal.as_ref().map_or(false, |p| {
            p.round.is_none() && now.saturating_duration_since(p.submitted) >= timeout
        });
        inflight || waiting
    }
}

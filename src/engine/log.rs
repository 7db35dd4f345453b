use crate::types::{Entry, Round, Term};
use std::collections::{BTreeSet, VecDeque};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LogError {
    #[error("round {0} is committed and cannot be replaced")]
    CommittedConflict(Round),

    #[error("expected round {expected}, got {got}")]
    Gap { expected: Round, got: Round },
}

/// Contiguous sequence of rounds known to this node, together with the
/// commit, delivery and local confirmation watermarks.
///
/// Invariants: `confirmed <= delivered <= last_round()` and
/// `commit <= last_round()`. Committed rounds are never replaced. Only
/// committed and delivered rounds at or below the retain floor are ever
/// compacted away.
#[derive(Debug)]
pub struct RoundLog {
    entries: VecDeque<Entry>,
    compacted_round: Round,
    compacted_term: Term,
    commit: Round,
    delivered: Round,
    confirmed: Round,
    early_confirms: BTreeSet<Round>,
    local_from: Option<Round>,
    retain_floor: Round,
    retained: usize,
}

impl RoundLog {
    pub fn new(retained: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            compacted_round: 0,
            compacted_term: 0,
            commit: 0,
            delivered: 0,
            confirmed: 0,
            early_confirms: BTreeSet::new(),
            local_from: None,
            retain_floor: Round::MAX,
            retained,
        }
    }

    pub fn first_round(&self) -> Round {
        self.compacted_round + 1
    }

    pub fn last_round(&self) -> Round {
        self.compacted_round + self.entries.len() as Round
    }

    pub fn last_term(&self) -> Term {
        self.entries
            .back()
            .map(|e| e.term)
            .unwrap_or(self.compacted_term)
    }

    pub fn commit(&self) -> Round {
        self.commit
    }

    pub fn delivered(&self) -> Round {
        self.delivered
    }

    /// Highest round up to which every round has been confirmed locally.
    pub fn confirmed(&self) -> Round {
        self.confirmed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn index_of(&self, round: Round) -> Option<usize> {
        if round <= self.compacted_round || round > self.last_round() {
            return None;
        }
        Some((round - self.compacted_round - 1) as usize)
    }

    pub fn get(&self, round: Round) -> Option<&Entry> {
        self.index_of(round).and_then(|i| self.entries.get(i))
    }

    pub fn term_at(&self, round: Round) -> Option<Term> {
        if round == 0 {
            return Some(0);
        }
        if round == self.compacted_round {
            return Some(self.compacted_term);
        }
        self.get(round).map(|e| e.term)
    }

    /// Whether this log agrees with a leader whose log holds `prev_term` at
    /// `prev_round`. The committed prefix always agrees.
    pub fn matches(&self, prev_round: Round, prev_term: Term) -> bool {
        if prev_round == 0 || prev_round <= self.commit {
            return true;
        }
        self.term_at(prev_round) == Some(prev_term)
    }

    /// Appends a freshly proposed round and returns its number.
    pub fn append(&mut self, term: Term, payload: Vec<u8>) -> Round {
        let round = self.last_round() + 1;
        self.entries.push_back(Entry::new(round, term, payload));
        round
    }

    /// Merges rounds replicated by the leader. Rounds already held with the
    /// same origin only take the new term stamp; a conflicting uncommitted
    /// suffix is dropped and replaced.
    pub fn merge(&mut self, entries: Vec<Entry>) -> Result<(), LogError> {
        for entry in entries {
            if entry.round <= self.compacted_round {
                continue;
            }

            match self.index_of(entry.round) {
                Some(i) if self.entries[i].origin == entry.origin => {
                    self.entries[i].term = entry.term;
                }
                Some(_) => {
                    if entry.round <= self.commit {
                        return Err(LogError::CommittedConflict(entry.round));
                    }
                    self.truncate_from(entry.round);
                    self.entries.push_back(entry);
                }
                None => {
                    let expected = self.last_round() + 1;
                    if entry.round != expected {
                        return Err(LogError::Gap {
                            expected,
                            got: entry.round,
                        });
                    }
                    self.entries.push_back(entry);
                }
            }
        }
        Ok(())
    }

    fn truncate_from(&mut self, round: Round) {
        if let Some(i) = self.index_of(round) {
            self.entries.truncate(i);
        }
        let keep = round - 1;
        self.delivered = self.delivered.min(keep);
        self.confirmed = self.confirmed.min(keep);
        self.early_confirms.retain(|r| *r < round);
        if self.local_from.map_or(false, |r| r >= round) {
            self.local_from = None;
        }
    }

    /// Re-stamps every uncommitted round with `term`. Returns the last
    /// re-stamped round, if any.
    pub fn restamp_uncommitted(&mut self, term: Term) -> Option<Round> {
        let commit = self.commit;
        let mut last = None;
        for entry in self.entries.iter_mut().filter(|e| e.round > commit) {
            entry.term = term;
            last = Some(entry.round);
        }
        last
    }

    /// Rounds not yet handed to the application, in order. Marks them
    /// delivered.
    pub fn take_undelivered(&mut self) -> Vec<Entry> {
        let from = self.delivered + 1;
        let out: Vec<Entry> = self
            .entries
            .iter()
            .filter(|e| e.round >= from)
            .cloned()
            .collect();
        self.delivered = self.last_round();
        out
    }

    /// Marks rounds up to `round` as delivered without handing them out.
    /// Used by the leader for rounds it proposed itself.
    pub fn mark_delivered(&mut self, round: Round) {
        if round > self.commit && self.local_from.map_or(true, |r| r <= self.commit) {
            self.local_from = Some(round);
        }
        self.delivered = self.delivered.max(round.min(self.last_round()));
    }

    /// Withdraws delivery and confirmation of uncommitted rounds marked
    /// through [`mark_delivered`](Self::mark_delivered), so
    /// [`take_undelivered`](Self::take_undelivered) hands them out again.
    pub fn rewind_local(&mut self) {
        let Some(from) = self.local_from.take() else {
            return;
        };
        if from <= self.commit {
            return;
        }
        let keep = from - 1;
        self.delivered = self.delivered.min(keep);
        self.confirmed = self.confirmed.min(keep);
        self.early_confirms.retain(|r| *r < from);
    }

    /// Records the application's confirmation of `round`. Returns whether
    /// the contiguous confirmation watermark moved.
    pub fn confirm(&mut self, round: Round) -> bool {
        if round <= self.confirmed || round > self.delivered {
            return false;
        }
        self.early_confirms.insert(round);

        let before = self.confirmed;
        while self.early_confirms.remove(&(self.confirmed + 1)) {
            self.confirmed += 1;
        }
        self.confirmed > before
    }

    pub fn is_confirmed(&self, round: Round) -> bool {
        round <= self.confirmed || self.early_confirms.contains(&round)
    }

    /// Advances the commit watermark to `round` (bounded by the last round)
    /// and returns the newly committed rounds in order.
    pub fn commit_to(&mut self, round: Round) -> Vec<Round> {
        let target = round.min(self.last_round());
        if target <= self.commit {
            return Vec::new();
        }
        let newly: Vec<Round> = (self.commit + 1..=target).collect();
        self.commit = target;
        self.compact();
        newly
    }

    /// Keeps every round above `round` retained regardless of the retention
    /// window. `Round::MAX` lifts the floor.
    pub fn set_retain_floor(&mut self, round: Round) {
        self.retain_floor = round;
        self.compact();
    }

    fn compact(&mut self) {
        let limit = self.commit.min(self.delivered).min(self.retain_floor);
        while self.entries.len() > self.retained {
            match self.entries.front() {
                Some(front) if front.round <= limit => {}
                _ => break,
            }
            if let Some(front) = self.entries.pop_front() {
                self.compacted_round = front.round;
                self.compacted_term = front.term;
            }
        }
    }

    /// Up to `max` rounds starting at `from`. `None` when `from` has been
    /// compacted away.
    pub fn entries_from(&self, from: Round, max: usize) -> Option<Vec<Entry>> {
        if from <= self.compacted_round {
            return None;
        }
        Some(
            self.entries
                .iter()
                .filter(|e| e.round >= from)
                .take(max)
                .cloned()
                .collect(),
        )
    }
}

use crate::types::Round;
use anyhow::Result;
use std::path::Path;

const KEY_COMMIT: &[u8] = b"commit";

/// Durable record of delivered rounds, keyed by round number.
///
/// A round is stored before it is confirmed. An uncommitted round may later
/// be superseded by a different payload under the same number; storing it
/// again overwrites the old one.
pub struct Journal {
    db: sled::Db,
    rounds: sled::Tree,
    meta: sled::Tree,
}

impl Journal {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(path)?;
        let rounds = db.open_tree("rounds")?;
        let meta = db.open_tree("meta")?;
        Ok(Self { db, rounds, meta })
    }

    fn key(round: Round) -> [u8; 8] {
        round.to_be_bytes()
    }

    /// Stores `payload` under `round` and flushes before returning.
    pub fn store(&self, round: Round, payload: &[u8]) -> Result<()> {
        self.rounds.insert(Self::key(round), payload)?;
        self.rounds.flush()?;
        Ok(())
    }

    pub fn get(&self, round: Round) -> Result<Option<Vec<u8>>> {
        Ok(self.rounds.get(Self::key(round))?.map(|v| v.to_vec()))
    }

    pub fn last_round(&self) -> Result<Round> {
        match self.rounds.last()? {
            Some((key, _)) => Ok(decode_round(&key)),
            None => Ok(0),
        }
    }

    pub fn len(&self) -> usize {
        self.rounds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rounds.is_empty()
    }

    /// Rounds from `from` onwards, in order.
    pub fn rounds_from(&self, from: Round) -> Result<Vec<(Round, Vec<u8>)>> {
        let mut out = Vec::new();
        for item in self.rounds.range(Self::key(from)..) {
            let (key, value) = item?;
            out.push((decode_round(&key), value.to_vec()));
        }
        Ok(out)
    }

    /// Moves the commit mark forward to `round`. Returns whether it moved.
    pub fn mark_committed(&self, round: Round) -> Result<bool> {
        let previous = self.meta.fetch_and_update(KEY_COMMIT, |old| {
            let current = old.map(decode_round).unwrap_or(0);
            if round > current {
                Some(Self::key(round).to_vec())
            } else {
                old.map(|v| v.to_vec())
            }
        })?;
        let previous = previous.map(|v| decode_round(&v)).unwrap_or(0);
        Ok(round > previous)
    }

    /// Marks `round` committed only if its payload is stored. Returns the
    /// payload the first time the mark reaches `round`.
    pub fn commit_stored(&self, round: Round) -> Result<Option<Vec<u8>>> {
        let Some(payload) = self.get(round)? else {
            return Ok(None);
        };
        Ok(self.mark_committed(round)?.then_some(payload))
    }

    pub fn committed(&self) -> Result<Round> {
        Ok(self
            .meta
            .get(KEY_COMMIT)?
            .map(|v| decode_round(&v))
            .unwrap_or(0))
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

fn decode_round(bytes: &[u8]) -> Round {
    let mut buf = [0u8; 8];
    let n = bytes.len().min(8);
    buf[8 - n..].copy_from_slice(&bytes[bytes.len() - n..]);
    Round::from_be_bytes(buf)
}

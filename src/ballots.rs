use rusqlite::{params, OptionalExtension};
use serde::Serialize;

use crate::error::{EngineError, EngineResult};
use crate::registry::{self, CandidateId};
use crate::store::Store;

pub type VoterId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CastOutcome {
    Accepted,
    Replaced,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Ballot {
    pub voter_id: VoterId,
    pub candidate_id: CandidateId,
    /// Epoch milliseconds
    pub cast_at: i64,
}

/// One ballot joined to its candidate's name, for export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportRow {
    pub voter_id: VoterId,
    pub candidate_id: CandidateId,
    pub candidate_name: String,
    pub cast_at: i64,
}

/// One row per voter, ever. The source of truth for tallies.
#[derive(Clone)]
pub struct BallotStore {
    store: Store,
}

impl BallotStore {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Insert or replace the voter's ballot.
    ///
    /// The candidate check, the prior-ballot lookup and the upsert share one
    /// immediate transaction, so concurrent casts by the same voter are
    /// applied one after the other and never leave two rows.
    pub fn cast(
        &self,
        voter_id: VoterId,
        candidate_id: CandidateId,
        cast_at: i64,
    ) -> EngineResult<CastOutcome> {
        self.store.write(|tx| {
            if registry::get_in(tx, candidate_id)?.is_none() {
                return Err(EngineError::NoSuchCandidate);
            }
            let existed = tx
                .query_row(
                    "SELECT 1 FROM ballots WHERE voter_id = ?1",
                    params![voter_id],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();
            tx.execute(
                "INSERT INTO ballots (voter_id, candidate_id, cast_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(voter_id) DO UPDATE SET
                    candidate_id = excluded.candidate_id,
                    cast_at = MAX(excluded.cast_at, ballots.cast_at)",
                params![voter_id, candidate_id, cast_at],
            )?;
            Ok(if existed { CastOutcome::Replaced } else { CastOutcome::Accepted })
        })
    }

    pub fn get(&self, voter_id: VoterId) -> EngineResult<Option<Ballot>> {
        self.store.read(|tx| {
            Ok(tx
                .query_row(
                    "SELECT voter_id, candidate_id, cast_at FROM ballots WHERE voter_id = ?1",
                    params![voter_id],
                    |r| Ok(Ballot { voter_id: r.get(0)?, candidate_id: r.get(1)?, cast_at: r.get(2)? }),
                )
                .optional()?)
        })
    }

    pub fn count(&self) -> EngineResult<u64> {
        self.store.read(|tx| {
            let n: i64 = tx.query_row("SELECT COUNT(*) FROM ballots", [], |r| r.get(0))?;
            Ok(n as u64)
        })
    }

    /// Delete every ballot. Returns how many were removed.
    pub fn truncate(&self) -> EngineResult<usize> {
        self.store.write(|tx| Ok(tx.execute("DELETE FROM ballots", [])?))
    }

    /// All ballots with candidate names, newest first.
    pub fn export(&self) -> EngineResult<Vec<ExportRow>> {
        self.store.read(|tx| {
            let mut stmt = tx.prepare(
                "SELECT b.voter_id, b.candidate_id, c.name, b.cast_at
                 FROM ballots b JOIN candidates c ON c.id = b.candidate_id
                 ORDER BY b.cast_at DESC, b.voter_id ASC",
            )?;
            let rows = stmt.query_map([], |r| {
                Ok(ExportRow {
                    voter_id: r.get(0)?,
                    candidate_id: r.get(1)?,
                    candidate_name: r.get(2)?,
                    cast_at: r.get(3)?,
                })
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;

    fn setup() -> (Registry, BallotStore) {
        let store = Store::open_in_memory().unwrap();
        store.init().unwrap();
        (Registry::new(store.clone()), BallotStore::new(store))
    }

    #[test]
    fn test_cast_then_replace() {
        let (reg, ballots) = setup();
        let a = reg.add("A").unwrap();
        let b = reg.add("B").unwrap();
        assert_eq!(ballots.cast(1, a, 100).unwrap(), CastOutcome::Accepted);
        assert_eq!(ballots.cast(1, b, 200).unwrap(), CastOutcome::Replaced);
        assert_eq!(ballots.count().unwrap(), 1);
        let ballot = ballots.get(1).unwrap().unwrap();
        assert_eq!(ballot.candidate_id, b);
        assert_eq!(ballot.cast_at, 200);
    }

    #[test]
    fn test_cast_unknown_candidate() {
        let (_reg, ballots) = setup();
        assert!(matches!(ballots.cast(1, 42, 100), Err(EngineError::NoSuchCandidate)));
        assert_eq!(ballots.count().unwrap(), 0);
    }

    #[test]
    fn test_cast_at_never_moves_backwards() {
        let (reg, ballots) = setup();
        let a = reg.add("A").unwrap();
        ballots.cast(1, a, 500).unwrap();
        ballots.cast(1, a, 400).unwrap();
        assert_eq!(ballots.get(1).unwrap().unwrap().cast_at, 500);
    }

    #[test]
    fn test_candidate_delete_cascades() {
        let (reg, ballots) = setup();
        let a = reg.add("A").unwrap();
        let b = reg.add("B").unwrap();
        ballots.cast(1, a, 100).unwrap();
        ballots.cast(2, b, 100).unwrap();
        reg.remove_by_id(a).unwrap();
        assert_eq!(ballots.get(1).unwrap(), None);
        assert_eq!(ballots.count().unwrap(), 1);
    }

    #[test]
    fn test_truncate_and_export_order() {
        let (reg, ballots) = setup();
        let a = reg.add("A").unwrap();
        ballots.cast(1, a, 100).unwrap();
        ballots.cast(2, a, 300).unwrap();
        ballots.cast(3, a, 200).unwrap();
        let voters: Vec<_> = ballots.export().unwrap().iter().map(|r| r.voter_id).collect();
        assert_eq!(voters, vec![2, 3, 1]);
        assert_eq!(ballots.truncate().unwrap(), 3);
        assert!(ballots.export().unwrap().is_empty());
    }
}

use serde::Serialize;

use crate::error::EngineResult;
use crate::registry::Candidate;
use crate::store::Store;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TallyRow {
    pub candidate: Candidate,
    pub count: u64,
}

/// Live vote counts for every candidate, zero-vote ones included.
///
/// Rows are held in ascending-id order; [`Tally::by_count`] gives the
/// leader-first view.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Tally {
    rows: Vec<TallyRow>,
    total: u64,
}

impl Tally {
    pub fn from_rows(rows: Vec<TallyRow>) -> Self {
        let total = rows.iter().map(|r| r.count).sum();
        let mut rows = rows;
        rows.sort_by_key(|r| r.candidate.id);
        Self { rows, total }
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// Stable order for the voting keyboard.
    pub fn by_id(&self) -> &[TallyRow] {
        &self.rows
    }

    /// Descending by count, ties broken by ascending id.
    pub fn by_count(&self) -> Vec<TallyRow> {
        let mut rows = self.rows.clone();
        rows.sort_by(|a, b| b.count.cmp(&a.count).then(a.candidate.id.cmp(&b.candidate.id)));
        rows
    }

    /// `count / total * 100`, or 0 when nobody has voted.
    pub fn percentage(&self, count: u64) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            count as f64 / self.total as f64 * 100.0
        }
    }

    pub fn count_for(&self, candidate_id: i64) -> Option<u64> {
        self.rows.iter().find(|r| r.candidate.id == candidate_id).map(|r| r.count)
    }
}

/// Derives tallies straight from the ballots table on every call.
#[derive(Clone)]
pub struct TallyEngine {
    store: Store,
}

impl TallyEngine {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub fn tally(&self) -> EngineResult<Tally> {
        self.store.read(|tx| {
            let mut stmt = tx.prepare(
                "SELECT c.id, c.name, COUNT(b.voter_id)
                 FROM candidates c LEFT JOIN ballots b ON b.candidate_id = c.id
                 GROUP BY c.id, c.name
                 ORDER BY c.id ASC",
            )?;
            let rows = stmt.query_map([], |r| {
                Ok(TallyRow {
                    candidate: Candidate { id: r.get(0)?, name: r.get(1)? },
                    count: r.get::<_, i64>(2)? as u64,
                })
            })?;
            Ok(Tally::from_rows(rows.collect::<Result<Vec<_>, _>>()?))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: i64, count: u64) -> TallyRow {
        TallyRow { candidate: Candidate { id, name: format!("c{}", id) }, count }
    }

    #[test]
    fn test_by_count_breaks_ties_by_id() {
        let tally = Tally::from_rows(vec![row(3, 1), row(1, 1), row(2, 4)]);
        let ids: Vec<_> = tally.by_count().iter().map(|r| r.candidate.id).collect();
        assert_eq!(ids, vec![2, 1, 3]);
        let ids: Vec<_> = tally.by_id().iter().map(|r| r.candidate.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_percentage_with_no_votes() {
        let tally = Tally::from_rows(vec![row(1, 0)]);
        assert_eq!(tally.total(), 0);
        assert_eq!(tally.percentage(0), 0.0);
    }

    #[test]
    fn test_percentage() {
        let tally = Tally::from_rows(vec![row(1, 1), row(2, 3)]);
        assert_eq!(tally.percentage(3), 75.0);
    }
}

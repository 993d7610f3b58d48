use std::collections::HashSet;

use rusqlite::{params, OptionalExtension, Transaction};
use serde::Serialize;

use crate::error::{EngineError, EngineResult};
use crate::store::Store;

pub type CandidateId = i64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Candidate {
    pub id: CandidateId,
    pub name: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BulkAddReport {
    pub added: usize,
    pub skipped: usize,
}

/// How an administrator points at a candidate to remove.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CandidateSelector {
    Id(CandidateId),
    /// 1-indexed position in ascending-id order
    Rank(usize),
    Name(String),
}

impl CandidateSelector {
    /// `#3` is a rank, a bare integer is an id, anything else is a name.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        if let Some(rank) = raw.strip_prefix('#') {
            return rank.trim().parse().ok().filter(|r| *r > 0).map(CandidateSelector::Rank);
        }
        match raw.parse::<CandidateId>() {
            Ok(id) => Some(CandidateSelector::Id(id)),
            Err(_) => Some(CandidateSelector::Name(raw.to_string())),
        }
    }
}

/// The set of selectable choices, kept in ascending-id order.
#[derive(Clone)]
pub struct Registry {
    store: Store,
}

impl Registry {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub fn add(&self, name: &str) -> EngineResult<CandidateId> {
        let name = name.trim();
        if name.is_empty() {
            return Err(EngineError::EmptyName);
        }
        self.store.write(|tx| insert(tx, name))
    }

    /// Add one candidate per non-blank line, skipping names that already
    /// exist (case-insensitively), including ones added earlier in the batch.
    ///
    /// The whole batch runs in one immediate transaction, so two concurrent
    /// batches naming the same new candidate cannot both insert it.
    pub fn bulk_add(&self, text: &str) -> EngineResult<BulkAddReport> {
        let names: Vec<&str> = text.lines().map(str::trim).filter(|n| !n.is_empty()).collect();
        self.store.write(|tx| {
            let mut seen: HashSet<String> =
                list_in(tx)?.into_iter().map(|c| fold(&c.name)).collect();
            let mut report = BulkAddReport::default();
            for name in names {
                if seen.insert(fold(name)) {
                    insert(tx, name)?;
                    report.added += 1;
                } else {
                    report.skipped += 1;
                }
            }
            Ok(report)
        })
    }

    pub fn remove_by_id(&self, id: CandidateId) -> EngineResult<Candidate> {
        self.store.write(|tx| {
            let candidate = get_in(tx, id)?.ok_or(EngineError::NotFound)?;
            delete(tx, id)?;
            Ok(candidate)
        })
    }

    pub fn remove_by_rank(&self, rank: usize) -> EngineResult<Candidate> {
        self.store.write(|tx| {
            let idx = rank.checked_sub(1).ok_or(EngineError::NotFound)?;
            let candidate = list_in(tx)?.into_iter().nth(idx).ok_or(EngineError::NotFound)?;
            delete(tx, candidate.id)?;
            Ok(candidate)
        })
    }

    /// Case-insensitive exact match. With duplicate names the lowest id goes.
    pub fn remove_by_name(&self, name: &str) -> EngineResult<Candidate> {
        let wanted = fold(name.trim());
        self.store.write(|tx| {
            let candidate = list_in(tx)?
                .into_iter()
                .find(|c| fold(&c.name) == wanted)
                .ok_or(EngineError::NotFound)?;
            delete(tx, candidate.id)?;
            Ok(candidate)
        })
    }

    pub fn remove(&self, selector: &CandidateSelector) -> EngineResult<Candidate> {
        match selector {
            CandidateSelector::Id(id) => self.remove_by_id(*id),
            CandidateSelector::Rank(rank) => self.remove_by_rank(*rank),
            CandidateSelector::Name(name) => self.remove_by_name(name),
        }
    }

    pub fn list(&self) -> EngineResult<Vec<Candidate>> {
        self.store.read(list_in)
    }

    pub fn get(&self, id: CandidateId) -> EngineResult<Option<Candidate>> {
        self.store.read(|tx| get_in(tx, id))
    }

    pub fn is_empty(&self) -> EngineResult<bool> {
        self.store.read(|tx| {
            let n: i64 = tx.query_row("SELECT COUNT(*) FROM candidates", [], |r| r.get(0))?;
            Ok(n == 0)
        })
    }
}

fn fold(name: &str) -> String {
    name.to_lowercase()
}

fn insert(tx: &Transaction<'_>, name: &str) -> EngineResult<CandidateId> {
    tx.execute("INSERT INTO candidates (name) VALUES (?1)", params![name])?;
    Ok(tx.last_insert_rowid())
}

fn delete(tx: &Transaction<'_>, id: CandidateId) -> EngineResult<()> {
    // ballots referencing this id go with it (ON DELETE CASCADE)
    tx.execute("DELETE FROM candidates WHERE id = ?1", params![id])?;
    Ok(())
}

pub(crate) fn get_in(tx: &Transaction<'_>, id: CandidateId) -> EngineResult<Option<Candidate>> {
    Ok(tx
        .query_row(
            "SELECT id, name FROM candidates WHERE id = ?1",
            params![id],
            |r| Ok(Candidate { id: r.get(0)?, name: r.get(1)? }),
        )
        .optional()?)
}

pub(crate) fn list_in(tx: &Transaction<'_>) -> EngineResult<Vec<Candidate>> {
    let mut stmt = tx.prepare("SELECT id, name FROM candidates ORDER BY id ASC")?;
    let rows = stmt.query_map([], |r| Ok(Candidate { id: r.get(0)?, name: r.get(1)? }))?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Registry {
        let store = Store::open_in_memory().unwrap();
        store.init().unwrap();
        Registry::new(store)
    }

    fn names(reg: &Registry) -> Vec<String> {
        reg.list().unwrap().into_iter().map(|c| c.name).collect()
    }

    #[test]
    fn test_add_assigns_increasing_ids() {
        let reg = registry();
        let a = reg.add("Ali").unwrap();
        let b = reg.add("Ali").unwrap();
        assert!(b > a);
        assert_eq!(names(&reg), vec!["Ali", "Ali"]);
    }

    #[test]
    fn test_add_rejects_blank() {
        let reg = registry();
        assert!(matches!(reg.add("   "), Err(EngineError::EmptyName)));
    }

    #[test]
    fn test_ids_not_reused_after_delete() {
        let reg = registry();
        let a = reg.add("Ali").unwrap();
        reg.remove_by_id(a).unwrap();
        let b = reg.add("Vali").unwrap();
        assert!(b > a);
    }

    #[test]
    fn test_bulk_add_skips_case_insensitive_duplicates() {
        let reg = registry();
        reg.add("Ali").unwrap();
        let report = reg.bulk_add("ali\n\n  Vali  \nVALI\nSoli\n").unwrap();
        assert_eq!(report, BulkAddReport { added: 2, skipped: 2 });
        assert_eq!(names(&reg), vec!["Ali", "Vali", "Soli"]);
    }

    #[test]
    fn test_remove_by_rank() {
        let reg = registry();
        let ali = reg.add("Ali").unwrap();
        let vali = reg.add("Vali").unwrap();
        let removed = reg.remove_by_rank(2).unwrap();
        assert_eq!(removed.id, vali);
        assert!(matches!(reg.remove_by_rank(2), Err(EngineError::NotFound)));
        assert!(matches!(reg.remove_by_rank(0), Err(EngineError::NotFound)));
        assert_eq!(reg.list().unwrap()[0].id, ali);
    }

    #[test]
    fn test_remove_by_name_takes_lowest_id() {
        let reg = registry();
        let first = reg.add("Ali").unwrap();
        let second = reg.add("ALI").unwrap();
        assert_eq!(reg.remove_by_name("ali").unwrap().id, first);
        assert_eq!(reg.list().unwrap()[0].id, second);
        assert!(matches!(reg.remove_by_name("nobody"), Err(EngineError::NotFound)));
    }

    #[test]
    fn test_selector_parse() {
        assert_eq!(CandidateSelector::parse("#2"), Some(CandidateSelector::Rank(2)));
        assert_eq!(CandidateSelector::parse("9"), Some(CandidateSelector::Id(9)));
        assert_eq!(CandidateSelector::parse(" Ali "), Some(CandidateSelector::Name("Ali".into())));
        assert_eq!(CandidateSelector::parse("#0"), None);
        assert_eq!(CandidateSelector::parse(""), None);
    }
}

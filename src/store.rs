use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};

use crate::error::EngineResult;

/// Settings key holding the voting deadline in epoch milliseconds.
pub const END_TIME_KEY: &str = "end_time";

/// Shared handle to the SQLite database.
///
/// Every engine operation runs inside one transaction on this connection, so
/// a check and the write that depends on it are never interleaved with
/// another operation.
///
/// Calls block on the mutex and on disk I/O. Async callers with real work to
/// do (admin writes, exports) hop onto `spawn_blocking` first.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open(path: &str) -> anyhow::Result<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> anyhow::Result<Self> {
        conn.pragma_update(None, "foreign_keys", true)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    pub fn init(&self) -> anyhow::Result<()> {
        self.lock().execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS candidates (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS ballots (
                voter_id INTEGER PRIMARY KEY,
                candidate_id INTEGER NOT NULL REFERENCES candidates(id) ON DELETE CASCADE,
                cast_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS ballots_candidate ON ballots(candidate_id);
            CREATE TABLE IF NOT EXISTS gate_groups (
                position INTEGER PRIMARY KEY AUTOINCREMENT,
                group_id TEXT NOT NULL UNIQUE,
                join_hint TEXT
            );
            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            COMMIT;",
        )?;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        // A panic mid-operation drops its transaction, which rolls back, so
        // the connection behind a poisoned lock is still consistent.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `f` inside a write transaction, committing only if it succeeds.
    pub fn write<T, F>(&self, f: F) -> EngineResult<T>
    where
        F: FnOnce(&Transaction<'_>) -> EngineResult<T>,
    {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// Run `f` inside a read transaction for a consistent snapshot.
    pub fn read<T, F>(&self, f: F) -> EngineResult<T>
    where
        F: FnOnce(&Transaction<'_>) -> EngineResult<T>,
    {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    pub fn get_setting(&self, key: &str) -> EngineResult<Option<String>> {
        self.read(|tx| {
            Ok(tx
                .query_row("SELECT value FROM settings WHERE key = ?1", params![key], |r| r.get(0))
                .optional()?)
        })
    }

    pub fn put_setting(&self, key: &str, value: &str) -> EngineResult<()> {
        self.write(|tx| {
            tx.execute(
                "INSERT INTO settings (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )?;
            Ok(())
        })
    }

    pub fn delete_setting(&self, key: &str) -> EngineResult<bool> {
        self.write(|tx| Ok(tx.execute("DELETE FROM settings WHERE key = ?1", params![key])? > 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        store.init().unwrap();
        store.init().unwrap();
    }

    #[test]
    fn test_settings_upsert_and_delete() {
        let store = Store::open_in_memory().unwrap();
        store.init().unwrap();
        assert_eq!(store.get_setting(END_TIME_KEY).unwrap(), None);
        store.put_setting(END_TIME_KEY, "100").unwrap();
        store.put_setting(END_TIME_KEY, "200").unwrap();
        assert_eq!(store.get_setting(END_TIME_KEY).unwrap().as_deref(), Some("200"));
        assert!(store.delete_setting(END_TIME_KEY).unwrap());
        assert!(!store.delete_setting(END_TIME_KEY).unwrap());
    }

    #[test]
    fn test_failed_write_rolls_back() {
        let store = Store::open_in_memory().unwrap();
        store.init().unwrap();
        let res: EngineResult<()> = store.write(|tx| {
            tx.execute("INSERT INTO settings (key, value) VALUES ('a', 'b')", [])?;
            Err(crate::error::EngineError::NotFound)
        });
        assert!(res.is_err());
        assert_eq!(store.get_setting("a").unwrap(), None);
    }
}

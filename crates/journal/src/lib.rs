//! # Journal
//!
//! SQLite-backed [`StackStore`] for the orchestrator.
//!
//! This crate persists:
//! - Stack records, one row per stack
//! - The append-only operation journal, ordered by an autoincrement sequence
//! - Planned change sets
//! - Per-stack leases, so two processes sharing a database cannot run
//!   against the same stack at once
//!
//! Records are stored as JSON next to a few indexed columns.
//!
//! ## Example
//!
//! ```no_run
//! use journal::SqliteStore;
//! use orchestrator::StackStore;
//! use std::path::Path;
//!
//! let store = SqliteStore::open(Path::new("/var/lib/strata/strata.db"))?;
//! for stack_id in store.list_stacks()? {
//!     println!("{stack_id}");
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod error;

pub use error::{Error, Result};

use chrono::Utc;
use orchestrator::{ChangeSet, Operation, Stack, StackStore, StoreError};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// A stack store in a single SQLite database file
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a store at the given path
    ///
    /// Creates the database file and necessary tables if they don't exist.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))?;
        Self::init(conn)
    }

    /// Open a throwaway store
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS stacks (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                version INTEGER NOT NULL,
                updated_at TEXT NOT NULL,
                body TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS operations (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                stack_id TEXT NOT NULL,
                run_id TEXT NOT NULL,
                body TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_operations_stack ON operations(stack_id, seq);

            CREATE TABLE IF NOT EXISTS change_sets (
                id TEXT PRIMARY KEY,
                stack_id TEXT NOT NULL,
                created_at TEXT NOT NULL,
                body TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_change_sets_stack ON change_sets(stack_id);

            CREATE TABLE IF NOT EXISTS leases (
                stack_id TEXT PRIMARY KEY,
                holder TEXT NOT NULL,
                acquired_at TEXT NOT NULL
            );
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Remove a lease regardless of holder.
    ///
    /// Only for leases left behind by a process that died. Returns whether
    /// a lease was held.
    pub fn break_lease(&self, stack_id: &str) -> Result<bool> {
        let removed = self
            .conn()
            .execute("DELETE FROM leases WHERE stack_id = ?1", params![stack_id])?;
        if removed > 0 {
            log::warn!("broke lease on stack {stack_id}");
        }
        Ok(removed > 0)
    }

    /// Current lease holder of a stack, if any
    pub fn lease_holder(&self, stack_id: &str) -> Result<Option<String>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT holder FROM leases WHERE stack_id = ?1",
                params![stack_id],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn load_stack_row(&self, stack_id: &str) -> Result<Option<Stack>> {
        let body: Option<String> = self
            .conn()
            .query_row("SELECT body FROM stacks WHERE id = ?1", params![stack_id], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(body.map(|b| serde_json::from_str(&b)).transpose()?)
    }

    fn save_stack_row(&self, stack: &Stack) -> Result<()> {
        let body = serde_json::to_string(stack)?;
        self.conn().execute(
            "INSERT INTO stacks (id, status, version, updated_at, body)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                version = excluded.version,
                updated_at = excluded.updated_at,
                body = excluded.body",
            params![
                stack.id,
                stack.status.as_str(),
                stack.version as i64,
                stack.updated_at.to_rfc3339(),
                body
            ],
        )?;
        Ok(())
    }

    fn delete_stack_row(&self, stack_id: &str) -> Result<()> {
        self.conn()
            .execute("DELETE FROM stacks WHERE id = ?1", params![stack_id])?;
        Ok(())
    }

    fn stack_ids(&self) -> Result<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT id FROM stacks ORDER BY id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(ids)
    }

    fn append(&self, operation: &Operation) -> Result<u64> {
        let body = serde_json::to_string(operation)?;
        let conn = self.conn();
        conn.execute(
            "INSERT INTO operations (stack_id, run_id, body) VALUES (?1, ?2, ?3)",
            params![operation.stack_id, operation.run_id, body],
        )?;
        Ok(conn.last_insert_rowid() as u64)
    }

    fn journal(&self, stack_id: &str) -> Result<Vec<Operation>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT seq, body FROM operations WHERE stack_id = ?1 ORDER BY seq")?;
        let rows = stmt
            .query_map(params![stack_id], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(seq, body)| {
                let mut operation: Operation = serde_json::from_str(&body)?;
                operation.sequence = seq as u64;
                Ok(operation)
            })
            .collect()
    }

    fn save_change_set_row(&self, change_set: &ChangeSet) -> Result<()> {
        let body = serde_json::to_string(change_set)?;
        self.conn().execute(
            "INSERT OR REPLACE INTO change_sets (id, stack_id, created_at, body) VALUES (?1, ?2, ?3, ?4)",
            params![
                change_set.id,
                change_set.stack_id,
                change_set.created_at.to_rfc3339(),
                body
            ],
        )?;
        Ok(())
    }

    fn load_change_set_row(&self, id: &str) -> Result<Option<ChangeSet>> {
        let body: Option<String> = self
            .conn()
            .query_row("SELECT body FROM change_sets WHERE id = ?1", params![id], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(body.map(|b| serde_json::from_str(&b)).transpose()?)
    }

    fn delete_change_set_row(&self, id: &str) -> Result<()> {
        self.conn()
            .execute("DELETE FROM change_sets WHERE id = ?1", params![id])?;
        Ok(())
    }

    fn change_sets_for(&self, stack_id: &str) -> Result<Vec<ChangeSet>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT body FROM change_sets WHERE stack_id = ?1 ORDER BY created_at, id",
        )?;
        let bodies = stmt
            .query_map(params![stack_id], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        bodies
            .iter()
            .map(|b| serde_json::from_str(b).map_err(Error::from))
            .collect()
    }

    fn acquire(&self, stack_id: &str, holder: &str) -> Result<bool> {
        let inserted = self.conn().execute(
            "INSERT OR IGNORE INTO leases (stack_id, holder, acquired_at) VALUES (?1, ?2, ?3)",
            params![stack_id, holder, Utc::now().to_rfc3339()],
        )?;
        Ok(inserted == 1)
    }

    fn release(&self, stack_id: &str, holder: &str) -> Result<()> {
        self.conn().execute(
            "DELETE FROM leases WHERE stack_id = ?1 AND holder = ?2",
            params![stack_id, holder],
        )?;
        Ok(())
    }
}

impl StackStore for SqliteStore {
    fn load_stack(&self, stack_id: &str) -> std::result::Result<Option<Stack>, StoreError> {
        Ok(self.load_stack_row(stack_id)?)
    }

    fn save_stack(&self, stack: &Stack) -> std::result::Result<(), StoreError> {
        Ok(self.save_stack_row(stack)?)
    }

    fn delete_stack(&self, stack_id: &str) -> std::result::Result<(), StoreError> {
        Ok(self.delete_stack_row(stack_id)?)
    }

    fn list_stacks(&self) -> std::result::Result<Vec<String>, StoreError> {
        Ok(self.stack_ids()?)
    }

    fn append_operation(&self, operation: &Operation) -> std::result::Result<u64, StoreError> {
        Ok(self.append(operation)?)
    }

    fn operations(&self, stack_id: &str) -> std::result::Result<Vec<Operation>, StoreError> {
        Ok(self.journal(stack_id)?)
    }

    fn save_change_set(&self, change_set: &ChangeSet) -> std::result::Result<(), StoreError> {
        Ok(self.save_change_set_row(change_set)?)
    }

    fn load_change_set(&self, id: &str) -> std::result::Result<Option<ChangeSet>, StoreError> {
        Ok(self.load_change_set_row(id)?)
    }

    fn delete_change_set(&self, id: &str) -> std::result::Result<(), StoreError> {
        Ok(self.delete_change_set_row(id)?)
    }

    fn list_change_sets(&self, stack_id: &str) -> std::result::Result<Vec<ChangeSet>, StoreError> {
        Ok(self.change_sets_for(stack_id)?)
    }

    fn try_acquire_lease(&self, stack_id: &str, holder: &str) -> std::result::Result<bool, StoreError> {
        Ok(self.acquire(stack_id, holder)?)
    }

    fn release_lease(&self, stack_id: &str, holder: &str) -> std::result::Result<(), StoreError> {
        Ok(self.release(stack_id, holder)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestrator::{
        Error as EngineError, OperationKind, OperationResult, Phase, Properties, StackLease, StackStatus,
        Template, plan, ProviderRegistry, ResourceDeclaration,
    };
    use tempfile::TempDir;

    fn intent(stack: &str, run: &str, id: &str) -> Operation {
        Operation::intent(stack, run, Phase::Forward, 0, id, OperationKind::Create, "token")
    }

    #[test]
    fn test_stack_persists_across_reopen() {
        let tmp = TempDir::new().unwrap();
        let db_path = tmp.path().join("state").join("strata.db");

        {
            let store = SqliteStore::open(&db_path).unwrap();
            let mut stack = Stack::new("prod");
            stack.status = StackStatus::CreateComplete;
            stack.version = 3;
            store.save_stack(&stack).unwrap();
        }

        let store = SqliteStore::open(&db_path).unwrap();
        let stack = store.load_stack("prod").unwrap().unwrap();
        assert_eq!(stack.status, StackStatus::CreateComplete);
        assert_eq!(stack.version, 3);
        assert!(store.load_stack("staging").unwrap().is_none());
    }

    #[test]
    fn test_save_overwrites_and_lists_sorted() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut stack = Stack::new("prod");
        store.save_stack(&stack).unwrap();
        stack.version = 1;
        store.save_stack(&stack).unwrap();
        store.save_stack(&Stack::new("dev")).unwrap();

        assert_eq!(store.list_stacks().unwrap(), vec!["dev", "prod"]);
        assert_eq!(store.load_stack("prod").unwrap().unwrap().version, 1);

        store.delete_stack("prod").unwrap();
        assert_eq!(store.list_stacks().unwrap(), vec!["dev"]);
    }

    #[test]
    fn test_journal_is_append_only_and_ordered() {
        let store = SqliteStore::open_in_memory().unwrap();
        let first = store.append_operation(&intent("prod", "run-1", "A")).unwrap();
        let other = store.append_operation(&intent("staging", "run-2", "A")).unwrap();
        let outcome = intent("prod", "run-1", "A").outcome(
            OperationResult::Succeeded,
            Some("phys-a".to_string()),
            Properties::new(),
        );
        let second = store.append_operation(&outcome).unwrap();
        assert!(first < other && other < second);

        let entries = store.operations("prod").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].sequence, first);
        assert!(entries[0].result.is_pending());
        assert_eq!(entries[1].sequence, second);
        assert_eq!(entries[1].physical_id.as_deref(), Some("phys-a"));

        // Deleting the stack keeps its history
        store.delete_stack("prod").unwrap();
        assert_eq!(store.operations("prod").unwrap().len(), 2);
    }

    #[test]
    fn test_change_sets_round_trip() {
        let store = SqliteStore::open_in_memory().unwrap();
        let template = Template::new(vec![ResourceDeclaration::new("Hook", "Custom::Hook").service_token("https://hooks")]);
        let change_set = plan("prod", None, &template, &ProviderRegistry::new()).unwrap();

        store.save_change_set(&change_set).unwrap();
        assert_eq!(store.load_change_set(&change_set.id).unwrap(), Some(change_set.clone()));
        assert_eq!(store.list_change_sets("prod").unwrap().len(), 1);
        assert!(store.list_change_sets("staging").unwrap().is_empty());

        store.delete_change_set(&change_set.id).unwrap();
        assert!(store.load_change_set(&change_set.id).unwrap().is_none());
    }

    #[test]
    fn test_lease_is_exclusive_across_connections() {
        let tmp = TempDir::new().unwrap();
        let db_path = tmp.path().join("strata.db");
        let first = SqliteStore::open(&db_path).unwrap();
        let second = SqliteStore::open(&db_path).unwrap();

        let lease = StackLease::acquire(&first, "prod").unwrap();
        let err = StackLease::acquire(&second, "prod").err().unwrap();
        assert!(matches!(err, EngineError::StackLocked(_)));
        assert!(StackLease::acquire(&second, "staging").is_ok());
        assert!(second.lease_holder("prod").unwrap().is_some());

        drop(lease);
        assert!(second.lease_holder("prod").unwrap().is_none());
        assert!(StackLease::acquire(&second, "prod").is_ok());
    }

    #[test]
    fn test_break_stale_lease() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store.try_acquire_lease("prod", "dead-process").unwrap());
        assert!(!store.try_acquire_lease("prod", "me").unwrap());

        assert!(store.break_lease("prod").unwrap());
        assert!(!store.break_lease("prod").unwrap());
        assert!(store.try_acquire_lease("prod", "me").unwrap());
    }
}

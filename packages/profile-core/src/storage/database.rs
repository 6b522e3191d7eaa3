//! # Database
//!
//! SQLite database wrapper with closure-scoped transactions.
//!
//! ## Transaction Flow
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        WRITE TRANSACTION                                │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  lock connection                                                        │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  BEGIN IMMEDIATE ──► closure(&mut WriteTransaction)                     │
//! │                            │                                            │
//! │              ┌─────────────┴─────────────┐                              │
//! │              ▼ Ok                        ▼ Err                          │
//! │          COMMIT                      ROLLBACK                           │
//! │              │                           │                              │
//! │              ▼                           ▼                              │
//! │   bump write generation            return error                         │
//! │   (still under the lock)                                                │
//! │              │                                                          │
//! │              ▼                                                          │
//! │   unlock, return (value, Committed)                                     │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Callers run cache invalidation and event delivery on the returned
//! [`Committed`] before reporting success.

use parking_lot::Mutex;
use rusqlite::{params, Connection, TransactionBehavior};

use super::schema;
use super::transaction::{ChangeSet, ReadTransaction, WriteGeneration, WriteTransaction};
use crate::error::{Error, Result};

/// Outcome of a committed write transaction
#[derive(Debug, Clone)]
pub struct Committed {
    /// Generation after the commit; unchanged if no profile was touched
    pub generation: u64,
    /// What the transaction changed
    pub changes: ChangeSet,
}

/// The profile database handle
///
/// One SQLite connection behind a mutex. Reads and writes both hold the
/// lock for the length of their transaction.
pub struct Database {
    conn: Mutex<Connection>,
    generation: WriteGeneration,
}

impl Database {
    /// Open or create a database
    ///
    /// If path is None, creates an in-memory database (useful for testing).
    pub fn open(path: Option<&str>) -> Result<Self> {
        let conn = match path {
            Some(p) => Connection::open(p)
                .map_err(|e| Error::Database(format!("Failed to open database: {}", e)))?,
            None => Connection::open_in_memory().map_err(|e| {
                Error::Database(format!("Failed to create in-memory database: {}", e))
            })?,
        };

        let db = Self {
            conn: Mutex::new(conn),
            generation: WriteGeneration::default(),
        };

        db.init_schema()?;

        Ok(db)
    }

    /// Initialize the database schema
    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        let version: Option<i32> = conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
                row.get(0)
            })
            .ok();

        match version {
            None => {
                conn.execute_batch(schema::CREATE_TABLES)
                    .map_err(|e| Error::Database(format!("Failed to create tables: {}", e)))?;

                conn.execute(
                    "INSERT INTO schema_version (version) VALUES (?)",
                    params![schema::SCHEMA_VERSION],
                )
                .map_err(|e| Error::Database(format!("Failed to set schema version: {}", e)))?;

                tracing::info!("Database schema created (version {})", schema::SCHEMA_VERSION);
            }
            Some(v) if v > schema::SCHEMA_VERSION => {
                return Err(Error::Database(format!(
                    "Database schema version {} is newer than supported {}",
                    v,
                    schema::SCHEMA_VERSION
                )));
            }
            Some(v) => {
                tracing::debug!("Database schema version: {}", v);
            }
        }

        Ok(())
    }

    /// Shared handle to the write generation counter
    pub fn generation(&self) -> &WriteGeneration {
        &self.generation
    }

    /// Run a closure inside a deferred read transaction
    pub fn read<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&ReadTransaction<'_>) -> Result<T>,
    {
        let mut conn = self.conn.lock();
        let generation = self.generation.current();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Deferred)
            .map_err(|e| Error::Database(format!("Failed to begin read: {}", e)))?;

        let rtx = ReadTransaction::new(tx, generation);
        let value = f(&rtx)?;

        // Nothing to keep; finish the snapshot without a write
        rtx.into_inner()
            .finish()
            .map_err(|e| Error::Database(format!("Failed to end read: {}", e)))?;
        Ok(value)
    }

    /// Run a closure inside an immediate write transaction
    ///
    /// Commits if the closure returns `Ok`, rolls back otherwise. SQLite
    /// failures inside the closure surface as `PersistFailure`; a failed
    /// commit surfaces as `TransactionAborted`.
    pub fn write<T, F>(&self, f: F) -> Result<(T, Committed)>
    where
        F: FnOnce(&mut WriteTransaction<'_>) -> Result<T>,
    {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| Error::PersistFailure(format!("Failed to begin write: {}", e)))?;

        let mut wtx = WriteTransaction::new(tx, self.generation.current());
        let value = match f(&mut wtx) {
            Ok(value) => value,
            Err(Error::Database(msg)) => return Err(Error::PersistFailure(msg)),
            Err(e) => return Err(e),
        };

        let (rtx, changes) = wtx.into_parts();
        rtx.into_inner()
            .commit()
            .map_err(|e| Error::TransactionAborted(e.to_string()))?;

        let generation = if changes.touched.is_empty() {
            self.generation.current()
        } else {
            self.generation.advance()
        };
        drop(conn);

        Ok((value, Committed { generation, changes }))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn insert_profile(tx: &WriteTransaction<'_>, key: &str) -> Result<()> {
        tx.conn().execute(
            "INSERT INTO profiles (address_key, uuid, created_at, updated_at) VALUES (?, ?, 0, 0)",
            params![key, key],
        )?;
        Ok(())
    }

    fn count_profiles(db: &Database) -> i64 {
        db.read(|tx| {
            Ok(tx
                .conn()
                .query_row("SELECT count(*) FROM profiles", [], |row| row.get(0))?)
        })
        .unwrap()
    }

    #[test]
    fn test_database_creation() {
        let db = Database::open(None).unwrap();
        assert_eq!(count_profiles(&db), 0);
        assert_eq!(db.generation().current(), 0);
    }

    #[test]
    fn test_commit_bumps_generation_when_touched() {
        let db = Database::open(None).unwrap();

        let ((), committed) = db
            .write(|tx| {
                insert_profile(tx, "a")?;
                tx.touch(["uuid:a".to_string()]);
                Ok(())
            })
            .unwrap();
        assert_eq!(committed.generation, 1);
        assert_eq!(count_profiles(&db), 1);

        let ((), committed) = db.write(|_| Ok(())).unwrap();
        assert_eq!(committed.generation, 1);
    }

    #[test]
    fn test_error_rolls_back() {
        let db = Database::open(None).unwrap();

        let result: Result<((), Committed)> = db.write(|tx| {
            insert_profile(tx, "a")?;
            tx.touch(["uuid:a".to_string()]);
            Err(Error::InvalidProfile("nope".into()))
        });

        assert!(matches!(result, Err(Error::InvalidProfile(_))));
        assert_eq!(count_profiles(&db), 0);
        assert_eq!(db.generation().current(), 0);
    }

    #[test]
    fn test_sqlite_failure_is_persist_failure() {
        let db = Database::open(None).unwrap();

        let result = db.write(|tx| {
            insert_profile(tx, "a")?;
            insert_profile(tx, "a")?;
            Ok(())
        });

        assert!(matches!(result, Err(Error::PersistFailure(_))));
        assert_eq!(count_profiles(&db), 0);
    }

    #[test]
    fn test_reopen_keeps_committed_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profiles.db");
        let path = path.to_str().unwrap();

        {
            let db = Database::open(Some(path)).unwrap();
            db.write(|tx| insert_profile(tx, "a")).unwrap();
        }

        let db = Database::open(Some(path)).unwrap();
        assert_eq!(count_profiles(&db), 1);
    }

    #[test]
    fn test_newer_schema_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profiles.db");
        let path = path.to_str().unwrap();

        drop(Database::open(Some(path)).unwrap());
        {
            let conn = rusqlite::Connection::open(path).unwrap();
            conn.execute(
                "UPDATE schema_version SET version = ?",
                params![schema::SCHEMA_VERSION + 1],
            )
            .unwrap();
        }

        assert!(matches!(Database::open(Some(path)), Err(Error::Database(_))));
    }
}

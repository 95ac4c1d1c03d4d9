//! Database connection and initialization.
//!
//! Provides a thread-safe wrapper around rusqlite for async operations, and the
//! per-pass [`UnitOfWork`] every sync mutation is funneled through.

use std::path::Path;
use std::sync::Arc;

use rusqlite::Connection;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

use super::schema;

/// Errors that can occur during database operations.
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("blocking task failed: {0}")]
    TaskFailed(String),

    #[error("value out of range: {0}")]
    OutOfRange(String),

    #[error("unit of work already finished")]
    NoActiveTransaction,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for database operations.
pub type Result<T> = std::result::Result<T, DatabaseError>;

/// Thread-safe database connection wrapper.
///
/// Uses a Mutex to ensure only one operation accesses the connection at a time.
/// All operations are run via `spawn_blocking` to avoid blocking the async runtime.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Opens a database at the given path, creating it if necessary.
    ///
    /// Runs migrations to ensure the schema is up to date.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let conn = tokio::task::spawn_blocking(move || -> Result<Connection> {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            let conn = Connection::open(&path)?;
            conn.execute_batch("PRAGMA foreign_keys = ON;")?;
            conn.execute_batch("PRAGMA journal_mode = WAL;")?;
            conn.busy_timeout(std::time::Duration::from_secs(5))?;
            Ok(conn)
        })
        .await
        .map_err(|e| DatabaseError::TaskFailed(e.to_string()))??;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.run_migrations().await?;

        Ok(db)
    }

    /// Opens an in-memory database for testing.
    pub async fn open_in_memory() -> Result<Self> {
        let conn = tokio::task::spawn_blocking(|| -> Result<Connection> {
            let conn = Connection::open_in_memory()?;
            conn.execute_batch("PRAGMA foreign_keys = ON;")?;
            Ok(conn)
        })
        .await
        .map_err(|e| DatabaseError::TaskFailed(e.to_string()))??;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.run_migrations().await?;

        Ok(db)
    }

    /// Runs all schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        self.with_conn(|conn| {
            for migration in schema::all_migrations() {
                conn.execute_batch(migration)?;
            }
            Ok(())
        })
        .await
    }

    /// Executes a function with access to the database connection.
    ///
    /// The function runs in a blocking task to avoid blocking the async runtime.
    /// While a [`UnitOfWork`] is open this waits for it to finish, so the call
    /// never joins or observes the pass transaction.
    pub async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone().lock_owned().await;

        tokio::task::spawn_blocking(move || f(&conn))
            .await
            .map_err(|e| DatabaseError::TaskFailed(e.to_string()))?
    }

    /// Opens the serialized unit of work for one sync pass.
    ///
    /// The unit owns the connection until it is committed, rolled back or
    /// dropped. A transaction left open by a panicked task is rolled back
    /// first, so a pass always starts from the last committed state.
    pub async fn begin_unit(&self) -> Result<UnitOfWork> {
        let conn = self.conn.clone().lock_owned().await;

        let conn = tokio::task::spawn_blocking(move || -> Result<OwnedMutexGuard<Connection>> {
            if !conn.is_autocommit() {
                warn!("rolling back transaction left open by an earlier pass");
                conn.execute_batch("ROLLBACK")?;
            }
            conn.execute_batch("BEGIN IMMEDIATE")?;
            Ok(conn)
        })
        .await
        .map_err(|e| DatabaseError::TaskFailed(e.to_string()))??;

        debug!("unit of work started");
        Ok(UnitOfWork {
            conn: Some(Arc::new(Mutex::new(conn))),
        })
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

type HeldConnection = Arc<Mutex<OwnedMutexGuard<Connection>>>;

/// A pass-long write transaction.
///
/// The unit holds the connection for its whole lifetime. Other
/// [`Database::with_conn`] callers wait until it ends and then commit on
/// their own. A commit that fails leaves the transaction open so it can be
/// retried; give up with [`UnitOfWork::rollback`]. Dropping an open unit
/// rolls it back.
pub struct UnitOfWork {
    conn: Option<HeldConnection>,
}

impl UnitOfWork {
    fn held(&self) -> Result<HeldConnection> {
        self.conn.clone().ok_or(DatabaseError::NoActiveTransaction)
    }

    /// Runs store work inside the open transaction.
    pub async fn run<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let held = self.held()?;
        tokio::task::spawn_blocking(move || {
            let conn = held.blocking_lock();
            f(&conn)
        })
        .await
        .map_err(|e| DatabaseError::TaskFailed(e.to_string()))?
    }

    /// Attempts to commit. On error the transaction stays open.
    pub async fn commit(&mut self) -> Result<()> {
        let held = self.held()?;
        tokio::task::spawn_blocking(move || {
            held.blocking_lock().execute_batch("COMMIT")?;
            Ok::<_, DatabaseError>(())
        })
        .await
        .map_err(|e| DatabaseError::TaskFailed(e.to_string()))??;

        self.conn = None;
        debug!("unit of work committed");
        Ok(())
    }

    /// Discards every write made in this unit of work.
    pub async fn rollback(&mut self) -> Result<()> {
        let Some(held) = self.conn.take() else {
            return Ok(());
        };
        tokio::task::spawn_blocking(move || rollback_open(&held.blocking_lock()))
            .await
            .map_err(|e| DatabaseError::TaskFailed(e.to_string()))??;
        debug!("unit of work rolled back");
        Ok(())
    }

    /// Returns true until the unit is committed or rolled back.
    pub fn is_active(&self) -> bool {
        self.conn.is_some()
    }
}

fn rollback_open(conn: &Connection) -> Result<()> {
    if !conn.is_autocommit() {
        conn.execute_batch("ROLLBACK")?;
    }
    Ok(())
}

impl Drop for UnitOfWork {
    fn drop(&mut self) {
        let Some(held) = self.conn.take() else {
            return;
        };
        warn!("unit of work dropped without commit or rollback, rolling back");

        // The connection is released once the rollback has run.
        let rollback = move || {
            let conn = held.blocking_lock();
            if let Err(e) = rollback_open(&conn) {
                warn!(error = %e, "rollback of dropped unit of work failed");
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(rollback);
            }
            Err(_) => rollback(),
        }
    }
}

impl std::fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("active", &self.is_active())
            .finish()
    }
}

pub mod transactions;

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info};

/// SQLite-backed storage. Listeners are only brought up once it is ready.
#[derive(Clone)]
pub struct Storage {
    conn: Option<Arc<Mutex<Connection>>>,
}

impl Storage {
    /// Open or create the database at the given path. Failure is logged and
    /// leaves the storage not ready rather than aborting startup.
    pub fn open(path: &Path) -> Self {
        match Self::connect(path) {
            Ok(conn) => {
                info!("Storage initialized at: {}", path.display());
                Self {
                    conn: Some(Arc::new(Mutex::new(conn))),
                }
            }
            Err(e) => {
                error!("Storage unavailable: {:#}", e);
                Self::unavailable()
            }
        }
    }

    /// Open an in-memory database (for testing)
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::run_migrations(&conn)?;
        Ok(Self {
            conn: Some(Arc::new(Mutex::new(conn))),
        })
    }

    /// Storage that never became ready.
    pub fn unavailable() -> Self {
        Self { conn: None }
    }

    pub fn ready(&self) -> bool {
        self.conn.is_some()
    }

    pub fn connection(&self) -> Option<Arc<Mutex<Connection>>> {
        self.conn.clone()
    }

    fn connect(path: &Path) -> Result<Connection> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;

        // journal_mode PRAGMA always returns the resulting mode, so use query_row
        let _: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;

        Self::run_migrations(&conn)?;
        Ok(conn)
    }

    fn run_migrations(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "
            -- Operator command transactions
            CREATE TABLE IF NOT EXISTS transactions (
                id TEXT PRIMARY KEY,
                uid TEXT NOT NULL,
                input TEXT NOT NULL,
                bot_username TEXT NOT NULL,
                reply TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_transactions_created
                ON transactions(created_at);
            ",
        )
        .context("Failed to run storage migrations")?;
        Ok(())
    }
}

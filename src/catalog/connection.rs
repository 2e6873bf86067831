//! Open catalog connections and the scanner's pulsed write transaction.

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::utils::config::TimingConsts;

use super::{BUSY_TIMEOUT_PRAGMA, SCHEMA, WAL_PRAGMAS};

/// Shared catalog descriptor. Cheap to clone; each pipeline thread calls
/// [`Catalog::connect`] to get its own connection.
#[derive(Clone, Debug)]
pub struct Catalog {
    path: PathBuf,
}

impl Catalog {
    pub fn at(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open a new connection to the catalog and ensure schema + WAL.
    pub fn connect(&self) -> Result<CatalogConn> {
        let conn = Connection::open(&self.path)
            .with_context(|| format!("open catalog at {}", self.path.display()))?;
        apply_wal_and_schema(&conn, Some(&self.path))?;
        Ok(CatalogConn { conn })
    }
}

/// One thread's connection to the catalog. All typed operations live on this
/// (see `ops.rs`).
pub struct CatalogConn {
    pub(crate) conn: Connection,
}

impl CatalogConn {
    /// In-memory catalog with the same schema. Adapter unit tests only; the
    /// pipeline always shares a file catalog across its threads.
    pub fn open_in_memory() -> Result<CatalogConn> {
        let conn = Connection::open_in_memory().context("open in-memory catalog")?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .context("enable foreign keys")?;
        conn.execute_batch(SCHEMA).context("create schema")?;
        Ok(CatalogConn { conn })
    }

    /// Begin a short write transaction. IMMEDIATE so the write lock is taken
    /// up front instead of upgrading mid-transaction.
    pub fn begin(&self) -> Result<()> {
        self.conn
            .execute_batch("BEGIN IMMEDIATE")
            .context("begin write transaction")
    }

    pub fn commit(&self) -> Result<()> {
        self.conn
            .execute_batch("COMMIT")
            .context("commit write transaction")
    }

    pub fn rollback(&self) -> Result<()> {
        self.conn
            .execute_batch("ROLLBACK")
            .context("rollback write transaction")
    }
}

/// Enable WAL and apply schema to an open connection (idempotent).
/// `db_path` is used in error messages when present.
fn apply_wal_and_schema(conn: &Connection, db_path: Option<&Path>) -> Result<()> {
    let path_ctx = db_path
        .map(|p| format!(" at {}", p.display()))
        .unwrap_or_default();
    conn.execute_batch(BUSY_TIMEOUT_PRAGMA)
        .with_context(|| format!("set busy timeout{}", path_ctx))?;
    conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))
        .with_context(|| format!("enable WAL{}", path_ctx))?;
    conn.execute_batch(WAL_PRAGMAS)
        .with_context(|| format!("set WAL pragmas{}", path_ctx))?;
    conn.execute_batch(SCHEMA)
        .with_context(|| format!("create schema{}", path_ctx))?;
    Ok(())
}

/// The scanner's long-lived write transaction, committed and reopened once per
/// [`TimingConsts::SCAN_TX_PULSE`] to bound WAL growth. Call [`PulseTx::tick`]
/// between rows and [`PulseTx::finish`] when the walk is done.
pub struct PulseTx<'c> {
    conn: &'c CatalogConn,
    last_commit: Instant,
    open: bool,
}

impl<'c> PulseTx<'c> {
    pub fn begin(conn: &'c CatalogConn) -> Result<Self> {
        conn.begin()?;
        Ok(Self {
            conn,
            last_commit: Instant::now(),
            open: true,
        })
    }

    /// Commit and reopen when the pulse interval has elapsed.
    pub fn tick(&mut self) -> Result<()> {
        if self.last_commit.elapsed() >= TimingConsts::SCAN_TX_PULSE {
            self.conn.commit()?;
            self.conn.begin()?;
            self.last_commit = Instant::now();
        }
        Ok(())
    }

    /// Commit the final increment.
    pub fn finish(mut self) -> Result<()> {
        self.open = false;
        self.conn.commit()
    }
}

impl Drop for PulseTx<'_> {
    fn drop(&mut self) {
        if self.open {
            let _ = self.conn.rollback();
        }
    }
}

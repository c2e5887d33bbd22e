pub mod schema;

use color_eyre::{eyre::eyre, eyre::WrapErr, Result};
use rusqlite::{Connection, Transaction};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

pub use schema::MigrationReport;

/// Local store of one environment: a single SQLite connection shared by
/// the object store and the offline resource cache.
pub struct Database {
  conn: Mutex<Connection>,
  path: Option<PathBuf>,
}

impl Database {
  /// Open or create the database file and bring its tables up to date.
  pub fn open(path: &Path) -> Result<Self> {
    Self::open_with_report(path).map(|(db, _)| db)
  }

  /// Like [`Database::open`], also returning what the schema check changed.
  pub fn open_with_report(path: &Path) -> Result<(Self, MigrationReport)> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create database directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open database at {}: {}", path.display(), e))?;
    conn
      .execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
      .map_err(|e| eyre!("Failed to configure database: {}", e))?;

    let db = Self {
      conn: Mutex::new(conn),
      path: Some(path.to_path_buf()),
    };
    let report = db.verify_schema()?;
    info!(path = %path.display(), created = report.created.len(), upgraded = report.upgraded.len(), "local store opened");

    Ok((db, report))
  }

  /// Open a private in-memory database with the current schema.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;

    let db = Self {
      conn: Mutex::new(conn),
      path: None,
    };
    db.verify_schema()?;

    Ok(db)
  }

  /// Location of the database file, `None` for in-memory stores.
  pub fn path(&self) -> Option<&Path> {
    self.path.as_deref()
  }

  /// Verify the embedded table scripts against the stored revisions and
  /// migrate outdated tables.
  pub fn verify_schema(&self) -> Result<MigrationReport> {
    let scripts = schema::embedded_scripts()?;
    let mut conn = self.lock()?;
    schema::verify(&mut conn, &scripts)
  }

  /// Lock the connection for a sequence of statements.
  pub fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Run `f` inside one transaction, committing on `Ok` and rolling back on
  /// `Err`.
  ///
  /// Helpers that take `&Connection` accept the transaction as well, so a
  /// caller composes several of them into one unit of work by calling them
  /// from inside `f`. SQLite has no nested transactions; there is exactly
  /// one open transaction per call.
  pub fn transaction<T, F>(&self, f: F) -> Result<T>
  where
    F: FnOnce(&Transaction<'_>) -> Result<T>,
  {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .wrap_err("Failed to begin transaction")?;

    let value = f(&tx)?;

    tx.commit().wrap_err("Failed to commit transaction")?;
    debug!("transaction committed");
    Ok(value)
  }
}

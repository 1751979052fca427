pub mod schema;

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Shared SQLite handle for the cache tables and the offline queue.
///
/// Thread-safe via internal Mutex. Every operation holds the lock for the
/// duration of one statement or transaction, which is what makes cache
/// refreshes atomic for readers.
pub struct Database {
  conn: Mutex<Connection>,
}

impl Database {
  /// Open or create the database at the given path
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|e| {
        Error::Config(format!(
          "Failed to create database directory {}: {}",
          parent.display(),
          e
        ))
      })?;
    }

    let conn = Connection::open(path)?;
    let db = Self {
      conn: Mutex::new(conn),
    };
    db.run_migrations()?;

    tracing::debug!("Opened database at {}", path.display());
    Ok(db)
  }

  /// Create an in-memory database. Useful for testing.
  pub fn in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()?;
    let db = Self {
      conn: Mutex::new(conn),
    };
    db.run_migrations()?;
    Ok(db)
  }

  /// Get the default database path
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| Error::Config("Could not determine data directory".to_string()))?;

    Ok(data_dir.join("agentsync").join("agentsync.db"))
  }

  /// Run database migrations
  fn run_migrations(&self) -> Result<()> {
    self.conn()?.execute_batch(schema::SCHEMA)?;
    Ok(())
  }

  /// Lock the connection
  pub fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| Error::Corrupt(format!("Lock poisoned: {}", e)))
  }
}

/// Parse an RFC 3339 timestamp written by this crate.
pub fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| Error::Corrupt(format!("Failed to parse datetime '{}': {}", s, e)))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_migrations_are_repeatable() {
    let db = Database::in_memory().unwrap();
    db.run_migrations().unwrap();

    let conn = db.conn().unwrap();
    let tables: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name LIKE 'cached_%'",
        [],
        |row| row.get(0),
      )
      .unwrap();
    assert_eq!(tables, 4);
  }
}

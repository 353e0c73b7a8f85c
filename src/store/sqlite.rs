//! SQLite-backed credential store.

use super::CredentialStore;
use anyhow::Result;
use parking_lot::Mutex;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Single-table SQLite store for opaque per-session credential blobs.
pub struct SqliteCredentialStore {
    conn: Mutex<rusqlite::Connection>,
}

impl SqliteCredentialStore {
    /// Open (or create) the credential database at the given path.
    pub fn open(db_path: &Path) -> Result<Self> {
        let conn = rusqlite::Connection::open(db_path)?;

        // WAL mode for concurrent reads + crash safety
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;

             CREATE TABLE IF NOT EXISTS session_credentials (
                session_id TEXT PRIMARY KEY,
                blob BLOB NOT NULL,
                updated_at INTEGER NOT NULL
             );",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl CredentialStore for SqliteCredentialStore {
    fn put(&self, session_id: &str, blob: &[u8]) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO session_credentials (session_id, blob, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(session_id) DO UPDATE SET
                blob = excluded.blob,
                updated_at = excluded.updated_at",
            rusqlite::params![session_id, blob, epoch_secs() as i64],
        )?;
        Ok(())
    }

    fn get(&self, session_id: &str) -> Result<Option<Vec<u8>>> {
        let conn = self.conn.lock();
        let row = conn.query_row(
            "SELECT blob FROM session_credentials WHERE session_id = ?1",
            rusqlite::params![session_id],
            |row| row.get::<_, Vec<u8>>(0),
        );

        match row {
            Ok(blob) => Ok(Some(blob)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn delete(&self, session_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM session_credentials WHERE session_id = ?1",
            rusqlite::params![session_id],
        )?;
        Ok(())
    }
}

/// Current Unix epoch in seconds.
fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

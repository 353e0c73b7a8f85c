//! Session credential persistence.
//!
//! Engine objects park their authentication artifacts here, keyed by session
//! id, so a restarted process can restore a paired session without showing a
//! new pairing code. The lifecycle manager never touches this store; only
//! engine objects do.

pub mod sqlite;

use anyhow::Result;

/// Durable key/value store for per-session authentication artifacts.
pub trait CredentialStore: Send + Sync {
    fn put(&self, session_id: &str, blob: &[u8]) -> Result<()>;

    /// Returns `None` when nothing is stored for this session id.
    fn get(&self, session_id: &str) -> Result<Option<Vec<u8>>>;

    fn delete(&self, session_id: &str) -> Result<()>;
}

pub use sqlite::SqliteCredentialStore;

//! SQLite-backed user and token store.
//!
//! Tables:
//! - `users`: credentials plus the session projection columns
//!   (`messaging_session_id`, `session_ready`, `first_login`,
//!   `last_session_state`)
//! - `auth_tokens`: token_hash, user_id, expires_at

use crate::session::{ProjectionPatch, ProjectionStore, UserProjection};
use anyhow::{bail, Result};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Default bearer-token lifetime: 30 days (seconds).
const DEFAULT_TOKEN_TTL_SECS: u64 = 30 * 24 * 3600;

/// Token byte length before hex encoding (32 bytes = 64 hex chars).
const TOKEN_BYTES: usize = 32;

/// Salt byte length for password hashing.
const SALT_BYTES: usize = 16;

/// Number of SHA-256 iterations for password stretching.
const HASH_ITERATIONS: u32 = 100_000;

/// A registered user.
#[derive(Debug, Clone)]
pub struct User {
    pub id: String,
    pub username: String,
    pub created_at: i64,
}

/// A validated bearer token.
#[derive(Debug, Clone)]
pub struct TokenAuth {
    pub user_id: String,
    pub expires_at: i64,
}

/// SQLite-backed authentication store. Doubles as the durable
/// [`ProjectionStore`] since the projection columns live on the user row.
pub struct AuthStore {
    conn: Mutex<rusqlite::Connection>,
    token_ttl_secs: u64,
}

impl AuthStore {
    /// Open (or create) the auth database at the given path.
    pub fn new(db_path: &Path, token_ttl_secs: Option<u64>) -> Result<Self> {
        let conn = rusqlite::Connection::open(db_path)?;

        // WAL mode for concurrent reads + crash safety
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;",
        )?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                username TEXT NOT NULL UNIQUE COLLATE NOCASE,
                password_hash TEXT NOT NULL,
                salt TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                messaging_session_id TEXT,
                session_ready INTEGER NOT NULL DEFAULT 0,
                first_login INTEGER NOT NULL DEFAULT 1,
                last_session_state TEXT
            );

            CREATE TABLE IF NOT EXISTS auth_tokens (
                token_hash TEXT PRIMARY KEY,
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_auth_tokens_user ON auth_tokens(user_id);
            CREATE INDEX IF NOT EXISTS idx_auth_tokens_expires ON auth_tokens(expires_at);",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            token_ttl_secs: token_ttl_secs.unwrap_or(DEFAULT_TOKEN_TTL_SECS),
        })
    }

    // ── User Management ─────────────────────────────────────────────

    /// Register a new user. Returns the user ID.
    pub fn register(&self, username: &str, password: &str) -> Result<String> {
        let trimmed = username.trim();
        if trimmed.is_empty() {
            bail!("Username cannot be empty");
        }
        if trimmed.len() > 64 {
            bail!("Username too long (max 64 characters)");
        }
        if password.len() < 8 {
            bail!("Password must be at least 8 characters");
        }

        let user_id = uuid::Uuid::new_v4().to_string();
        let salt = generate_salt();
        let password_hash = hash_password(password, &salt);
        let now = epoch_secs();

        let conn = self.conn.lock();
        let result = conn.execute(
            "INSERT INTO users (id, username, password_hash, salt, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![user_id, trimmed, password_hash, salt, now as i64],
        );

        match result {
            Ok(_) => Ok(user_id),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                bail!("Username '{}' is already taken", trimmed)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Authenticate a user by username + password.
    /// Returns the `User` on success.
    pub fn authenticate(&self, username: &str, password: &str) -> Result<User> {
        let conn = self.conn.lock();
        let row: Result<(String, String, String, i64), _> = conn.query_row(
            "SELECT id, password_hash, salt, created_at FROM users WHERE username = ?1 COLLATE NOCASE",
            rusqlite::params![username.trim()],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        );

        match row {
            Ok((id, stored_hash, salt, created_at)) => {
                let attempt_hash = hash_password(password, &salt);
                if !constant_time_eq(stored_hash.as_bytes(), attempt_hash.as_bytes()) {
                    bail!("Invalid username or password");
                }
                Ok(User {
                    id,
                    username: username.trim().to_string(),
                    created_at,
                })
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => {
                // Perform dummy hash to prevent timing side-channel
                let _ = hash_password(password, "0000000000000000");
                bail!("Invalid username or password");
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Look up a user by ID.
    pub fn get_user(&self, user_id: &str) -> Result<Option<User>> {
        let conn = self.conn.lock();
        let row = conn.query_row(
            "SELECT id, username, created_at FROM users WHERE id = ?1",
            rusqlite::params![user_id],
            |row| {
                Ok(User {
                    id: row.get(0)?,
                    username: row.get(1)?,
                    created_at: row.get(2)?,
                })
            },
        );

        match row {
            Ok(user) => Ok(Some(user)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Count registered users.
    pub fn user_count(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    // ── Token Management ────────────────────────────────────────────

    /// Issue a bearer token for an authenticated user.
    /// Returns the plaintext token (only revealed once).
    pub fn issue_token(&self, user_id: &str) -> Result<String> {
        let token = generate_token();
        let token_hash = hash_token(&token);
        let now = epoch_secs();
        let expires_at = now + self.token_ttl_secs;

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO auth_tokens (token_hash, user_id, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![token_hash, user_id, now as i64, expires_at as i64],
        )?;

        Ok(token)
    }

    /// Validate a bearer token.
    /// Returns `None` if the token is unknown or expired.
    pub fn validate_token(&self, token: &str) -> Option<TokenAuth> {
        let token_hash = hash_token(token);
        let now = epoch_secs() as i64;

        let conn = self.conn.lock();
        conn.query_row(
            "SELECT user_id, expires_at
             FROM auth_tokens
             WHERE token_hash = ?1 AND expires_at > ?2",
            rusqlite::params![token_hash, now],
            |row| {
                Ok(TokenAuth {
                    user_id: row.get(0)?,
                    expires_at: row.get(1)?,
                })
            },
        )
        .ok()
    }

    /// Revoke a specific token.
    pub fn revoke_token(&self, token: &str) -> Result<bool> {
        let token_hash = hash_token(token);
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM auth_tokens WHERE token_hash = ?1",
            rusqlite::params![token_hash],
        )?;
        Ok(deleted > 0)
    }

    /// Clean up expired tokens. The gateway runs this periodically; nothing
    /// else ever deletes by expiry.
    pub fn cleanup_expired_tokens(&self) -> Result<u64> {
        let now = epoch_secs() as i64;
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM auth_tokens WHERE expires_at <= ?1",
            rusqlite::params![now],
        )?;
        Ok(deleted as u64)
    }
}

impl ProjectionStore for AuthStore {
    fn projection(&self, user_id: &str) -> Result<Option<UserProjection>> {
        let conn = self.conn.lock();
        let row = conn.query_row(
            "SELECT id, messaging_session_id, session_ready, first_login, last_session_state
             FROM users WHERE id = ?1",
            rusqlite::params![user_id],
            |row| {
                Ok(UserProjection {
                    user_id: row.get(0)?,
                    session_id: row.get(1)?,
                    ready: row.get::<_, i64>(2)? != 0,
                    first_login: row.get::<_, i64>(3)? != 0,
                    last_session_state: row.get(4)?,
                })
            },
        );

        match row {
            Ok(projection) => Ok(Some(projection)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn update_projection(&self, user_id: &str, patch: ProjectionPatch) -> Result<()> {
        // Single COALESCE update so the patch applies atomically; NULL
        // placeholders leave the stored column untouched.
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE users SET
                messaging_session_id = COALESCE(?2, messaging_session_id),
                session_ready = COALESCE(?3, session_ready),
                first_login = COALESCE(?4, first_login),
                last_session_state = COALESCE(?5, last_session_state)
             WHERE id = ?1",
            rusqlite::params![
                user_id,
                patch.session_id,
                patch.ready.map(i64::from),
                patch.first_login.map(i64::from),
                patch.last_session_state,
            ],
        )?;
        if updated == 0 {
            bail!("No user row for id '{}'", user_id);
        }
        Ok(())
    }
}

// ── Cryptographic Helpers ───────────────────────────────────────────

/// Generate a random salt (hex-encoded).
fn generate_salt() -> String {
    hex::encode(rand::random::<[u8; SALT_BYTES]>())
}

/// Generate a random bearer token (hex-encoded).
fn generate_token() -> String {
    hex::encode(rand::random::<[u8; TOKEN_BYTES]>())
}

/// Hash a password with salt using iterated SHA-256.
fn hash_password(password: &str, salt: &str) -> String {
    let mut hash = Sha256::new();
    hash.update(salt.as_bytes());
    hash.update(password.as_bytes());
    let mut result = hash.finalize();

    // Iterated hashing for key stretching
    for _ in 1..HASH_ITERATIONS {
        let mut h = Sha256::new();
        h.update(result);
        h.update(salt.as_bytes());
        result = h.finalize();
    }

    hex::encode(result)
}

/// Hash a bearer token (SHA-256, single pass — tokens are already high-entropy).
fn hash_token(token: &str) -> String {
    let mut h = Sha256::new();
    h.update(token.as_bytes());
    hex::encode(h.finalize())
}

/// Constant-time byte comparison to prevent timing attacks.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Current Unix epoch in seconds.
fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// ── Tests ───────────────────────────────────────────────────────────

//! User accounts and bearer-token authentication.
//!
//! Provides:
//! - User registration with username/password (iterated SHA-256, 100k rounds + per-user salt)
//! - Opaque bearer tokens (random hex, SHA-256 hashed at rest, time-limited)
//! - The durable user-status projection: the `users` table carries the
//!   messaging session id, readiness, first-login, and last-state columns
//!   the session core writes through [`ProjectionStore`]
//!
//! ## Design Decisions
//! - No external JWT dependency — tokens are opaque random hex strings with
//!   server-side SHA-256 hashed lookup.
//! - Password hashing uses iterated SHA-256 (100k rounds) + per-user salt (using
//!   the existing `sha2` crate) to avoid new dependencies while maintaining
//!   security.
//! - The projection lives on the user row, so readiness and first-login
//!   survive process restarts and session teardown.
//!
//! [`ProjectionStore`]: crate::session::ProjectionStore

pub mod store;

pub use store::{AuthStore, TokenAuth, User};

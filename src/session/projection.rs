//! Durable user-status projection.
//!
//! The projection is the small set of core-owned fields persisted on the
//! external user record: the assigned session id, a readiness flag, the
//! one-way `first_login` flag, and the label of the last projected phase.
//! The lifecycle manager reads it for fast-path answers; the engine adapter
//! writes it on the transitions that affect readiness. Any durable backend
//! qualifies; the crate ships a SQLite implementation on the auth store.

use anyhow::Result;

/// Core-owned status fields of one user.
#[derive(Debug, Clone)]
pub struct UserProjection {
    pub user_id: String,
    /// Assigned on the first pairing request; never changes afterwards.
    pub session_id: Option<String>,
    /// True only while the underlying session is `Ready`.
    pub ready: bool,
    /// Starts true; flips false the first time the session reaches `Ready`
    /// and never flips back.
    pub first_login: bool,
    /// Label of the last projected phase. Terminal labels stay readable
    /// after the registry entry is removed; anything else reads back as
    /// not initialized.
    pub last_session_state: Option<String>,
}

/// Partial projection update. `None` leaves the field unchanged.
#[derive(Debug, Clone, Default)]
pub struct ProjectionPatch {
    pub session_id: Option<String>,
    pub ready: Option<bool>,
    pub first_login: Option<bool>,
    pub last_session_state: Option<String>,
}

/// Durable store for user projections.
pub trait ProjectionStore: Send + Sync {
    /// Returns `None` when no such user exists.
    fn projection(&self, user_id: &str) -> Result<Option<UserProjection>>;

    /// Applies the patch atomically to the user's record.
    fn update_projection(&self, user_id: &str, patch: ProjectionPatch) -> Result<()>;
}

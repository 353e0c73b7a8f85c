//! Per-user messaging session lifecycle.
//!
//! One authenticated user owns at most one messaging session. The session is
//! paired once via a scannable code, kept alive by the engine, persisted
//! across restarts through the credential store, and used to dispatch
//! outbound messages.
//!
//! ## Architecture
//! ```text
//!   gateway ──> SessionManager ──> SessionRegistry (in-memory truth)
//!                    │                   ▲
//!                    ▼                   │ serialized updates
//!               EngineAdapter ───── engine events
//!                    │
//!                    ▼
//!              ProjectionStore (durable user status)
//! ```
//! - `registry` — authoritative `session_id → entry` map with per-entry
//!   locking and generation-guarded updates
//! - `manager` — public operations: request pairing, status, send
//! - `projection` — durable readiness/first-login view on the user record

pub mod manager;
pub mod projection;
pub mod registry;

use std::time::Instant;
use thiserror::Error;

/// Lifecycle phase of one messaging session.
///
/// Forward order: `Uninitialized → Initializing → AwaitingPairing →
/// Authenticated → Ready`, ending in `AuthFailed` or `Disconnected`.
/// Engines may skip `Authenticated` and report `Ready` directly.
#[derive(Debug, Clone)]
pub enum SessionPhase {
    /// Entry exists but no engine cycle has been started yet.
    Uninitialized,
    /// An engine object is being constructed and connected.
    Initializing,
    /// The engine produced a pairing code awaiting an out-of-band scan.
    AwaitingPairing { code: String, issued_at: Instant },
    /// Pairing accepted, engine not yet fully operational.
    Authenticated,
    /// Fully operational; sends are accepted.
    Ready,
    /// Terminal: pairing or restore was rejected. Entry is removed.
    AuthFailed,
    /// Terminal: the remote end dropped the session. Entry is removed.
    Disconnected,
}

impl SessionPhase {
    /// Wire-facing label, also stored in the projection's
    /// `last_session_state` column.
    pub fn label(&self) -> &'static str {
        match self {
            SessionPhase::Uninitialized => "not_initialized",
            SessionPhase::Initializing => "initializing",
            SessionPhase::AwaitingPairing { .. } => "awaiting_pairing",
            SessionPhase::Authenticated => "authenticated",
            SessionPhase::Ready => "ready",
            SessionPhase::AuthFailed => "auth_failed",
            SessionPhase::Disconnected => "disconnected",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionPhase::AuthFailed | SessionPhase::Disconnected)
    }

    /// Ordering used to reject regressing updates within one cycle.
    /// Equal-rank re-application is only allowed for `AwaitingPairing`
    /// (the engine refreshes time-limited codes).
    pub(crate) fn rank(&self) -> u8 {
        match self {
            SessionPhase::Uninitialized => 0,
            SessionPhase::Initializing => 1,
            SessionPhase::AwaitingPairing { .. } => 2,
            SessionPhase::Authenticated => 3,
            SessionPhase::Ready => 4,
            SessionPhase::AuthFailed | SessionPhase::Disconnected => 5,
        }
    }
}

/// Point-in-time copy of a registry entry.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub owner_user_id: String,
    pub phase: SessionPhase,
    /// Cycle number of the engine object currently driving this entry.
    pub generation: u64,
}

/// Failures of the send path. `Engine` wraps the single transport attempt;
/// the core never retries a send (at-most-once).
#[derive(Debug, Error)]
pub enum SendError {
    #[error("user has no ready session")]
    UserNotReady,
    #[error("no session found for {session_id}")]
    SessionNotFound { session_id: String },
    #[error("session {session_id} is not ready (state: {state})")]
    SessionNotReady {
        session_id: String,
        state: &'static str,
    },
    #[error("engine send failed")]
    Engine(#[source] anyhow::Error),
}

/// Failures of pairing/status operations. Engine trouble never surfaces
/// here: initialization failures become the `AuthFailed` phase instead.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("unknown user {user_id}")]
    UnknownUser { user_id: String },
    #[error("projection store failure")]
    Projection(#[source] anyhow::Error),
}

pub use manager::{PairingStatus, SessionManager, UserStatus};
pub use projection::{ProjectionPatch, ProjectionStore, UserProjection};
pub use registry::{PhaseUpdate, SessionEntry, SessionRegistry};

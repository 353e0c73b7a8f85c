//! Public operations of the session lifecycle.
//!
//! The manager is what the gateway talks to. Three operations:
//!
//! - [`request_pairing`](SessionManager::request_pairing) — resolves the
//!   user's session id (assigning and persisting `user_<id>` on first use),
//!   idempotently starts an engine cycle, and answers from the current
//!   snapshot. Never blocks on pairing completion; clients poll.
//! - [`get_status`](SessionManager::get_status) — pure read. A live
//!   registry entry wins; otherwise the persisted terminal label passes
//!   through, and anything else reads as not initialized.
//! - [`send_message`](SessionManager::send_message) — projection fast path
//!   (a user the projection calls not-ready is rejected without touching
//!   the registry or the transport), then one delivery attempt through the
//!   adapter.
//!
//! Pairing codes are time-limited on the read side: an expired code reads
//! as absent while the session stays pollable, and the next engine-emitted
//! code shows up on a later poll.

use super::{LifecycleError, SendError, SessionPhase, SessionRegistry, UserProjection};
use crate::engine::EngineAdapter;
use crate::session::{ProjectionPatch, ProjectionStore};
use std::sync::Arc;
use std::time::Duration;

/// Answer to a pairing request.
#[derive(Debug, Clone)]
pub struct PairingStatus {
    /// Present only while the session awaits pairing and the code is still
    /// fresh.
    pub pairing_code: Option<String>,
    pub state: &'static str,
}

/// Answer to a status request.
#[derive(Debug, Clone)]
pub struct UserStatus {
    /// True only while a live session is `Ready`.
    pub ready: bool,
    pub state: &'static str,
    pub first_login: bool,
}

pub struct SessionManager {
    registry: Arc<SessionRegistry>,
    adapter: EngineAdapter,
    projection: Arc<dyn ProjectionStore>,
    pairing_code_ttl: Duration,
}

impl SessionManager {
    pub fn new(
        registry: Arc<SessionRegistry>,
        adapter: EngineAdapter,
        projection: Arc<dyn ProjectionStore>,
        pairing_code_ttl: Duration,
    ) -> Self {
        Self {
            registry,
            adapter,
            projection,
            pairing_code_ttl,
        }
    }

    /// Deterministic session id for a user. One user, one session.
    pub fn session_id_for(user_id: &str) -> String {
        format!("user_{user_id}")
    }

    /// Number of sessions currently tracked in memory.
    pub fn active_sessions(&self) -> usize {
        self.registry.active_count()
    }

    /// Ensures an engine cycle is running for the user's session and
    /// reports where pairing stands. Safe to poll; only the first call
    /// after process start (or after a terminal phase) actually starts a
    /// cycle.
    pub fn request_pairing(&self, user_id: &str) -> Result<PairingStatus, LifecycleError> {
        let record = self.user_record(user_id)?;
        let session_id = self.resolve_session_id(&record)?;
        self.adapter.start(&session_id, user_id);

        match self.registry.snapshot(&session_id) {
            Some(snapshot) => {
                let pairing_code = match &snapshot.phase {
                    SessionPhase::AwaitingPairing { code, issued_at }
                        if issued_at.elapsed() <= self.pairing_code_ttl =>
                    {
                        Some(code.clone())
                    }
                    _ => None,
                };
                Ok(PairingStatus {
                    pairing_code,
                    state: snapshot.phase.label(),
                })
            }
            // The cycle can already have ended terminally; report what the
            // projection recorded for it.
            None => {
                let record = self.user_record(user_id)?;
                Ok(PairingStatus {
                    pairing_code: None,
                    state: Self::stored_state(&record),
                })
            }
        }
    }

    /// Reports the user's session status without side effects. Does not
    /// start or resume anything.
    pub fn get_status(&self, user_id: &str) -> Result<UserStatus, LifecycleError> {
        let record = self.user_record(user_id)?;
        let live = record
            .session_id
            .as_deref()
            .and_then(|session_id| self.registry.snapshot(session_id));

        let (ready, state) = match live {
            Some(snapshot) => (
                matches!(snapshot.phase, SessionPhase::Ready),
                snapshot.phase.label(),
            ),
            None => (false, Self::stored_state(&record)),
        };

        Ok(UserStatus {
            ready,
            state,
            first_login: record.first_login,
        })
    }

    /// Sends one message through the user's session. At most one transport
    /// attempt; a user whose projection is not ready is rejected before the
    /// registry or the engine is consulted.
    pub async fn send_message(
        &self,
        user_id: &str,
        recipient: &str,
        body: &str,
    ) -> Result<(), SendError> {
        match self.projection.projection(user_id) {
            Ok(Some(record)) => {
                if !record.ready {
                    return Err(SendError::UserNotReady);
                }
                let session_id = record
                    .session_id
                    .unwrap_or_else(|| Self::session_id_for(user_id));
                self.adapter.send(&session_id, recipient, body).await
            }
            Ok(None) => Err(SendError::UserNotReady),
            Err(err) => {
                // Fast path unavailable; the adapter's own checks decide.
                tracing::warn!(user_id = %user_id, error = %err, "projection read failed on send");
                self.adapter
                    .send(&Self::session_id_for(user_id), recipient, body)
                    .await
            }
        }
    }

    fn user_record(&self, user_id: &str) -> Result<UserProjection, LifecycleError> {
        self.projection
            .projection(user_id)
            .map_err(LifecycleError::Projection)?
            .ok_or_else(|| LifecycleError::UnknownUser {
                user_id: user_id.to_string(),
            })
    }

    /// Assigns and persists the session id the first time it is needed.
    /// The id never changes afterwards, which is what lets a later cycle
    /// find the stored credentials again.
    fn resolve_session_id(&self, record: &UserProjection) -> Result<String, LifecycleError> {
        if let Some(session_id) = &record.session_id {
            return Ok(session_id.clone());
        }
        let session_id = Self::session_id_for(&record.user_id);
        self.projection
            .update_projection(
                &record.user_id,
                ProjectionPatch {
                    session_id: Some(session_id.clone()),
                    ..ProjectionPatch::default()
                },
            )
            .map_err(LifecycleError::Projection)?;
        tracing::info!(user_id = %record.user_id, session_id = %session_id, "session id assigned");
        Ok(session_id)
    }

    /// Status label when no live entry exists. Only terminal labels
    /// survive removal; anything else means the session has to be set up
    /// again, so it reads as not initialized.
    fn stored_state(record: &UserProjection) -> &'static str {
        match record.last_session_state.as_deref() {
            Some(label) if label == SessionPhase::AuthFailed.label() => {
                SessionPhase::AuthFailed.label()
            }
            Some(label) if label == SessionPhase::Disconnected.label() => {
                SessionPhase::Disconnected.label()
            }
            _ => SessionPhase::Uninitialized.label(),
        }
    }
}

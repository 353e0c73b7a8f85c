//! Drives engine objects and owns every side effect of their lifecycle.
//!
//! The adapter is the only component that starts engine objects, and the
//! only consumer of their event streams. Each successful
//! [`SessionRegistry::begin_cycle`] claim spawns one `run_session` task that
//! initializes the engine (with bounded retries), pumps events until a
//! terminal one, and tears the object down. Every event is translated into
//! at most one guarded phase transition plus, where the table below says so,
//! one projection write. Projection writes happen only when the transition
//! actually applied, so superseded cycles leave no trace.
//!
//! ## Architecture
//!
//! ```text
//!   begin_cycle ──► run_session (one task per cycle)
//!                      │ initialize (retry w/ backoff)
//!                      │ install client slot
//!                      ▼
//!                 event pump ──► apply_event ──► registry.update_phase
//!                      │                            │ (Applied only)
//!                      │ terminal / stream close    ▼
//!                      ▼                        projection write
//!                  teardown (slot removal + engine shutdown)
//! ```
//!
//! Event table: `PairingCode → AwaitingPairing`, `Authenticated →
//! Authenticated`, `CredentialsSaved → log only`, `Ready → Ready +
//! {ready, first_login}`, `AuthFailed`/`Disconnected → terminal phase,
//! entry removal, `last_session_state`.

use crate::engine::{EngineClient, EngineEvent, MessagingEngine};
use crate::session::{
    PhaseUpdate, ProjectionPatch, ProjectionStore, SendError, SessionPhase, SessionRegistry,
};
use crate::store::CredentialStore;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Send surface of the cycle that currently owns a session.
struct ClientSlot {
    generation: u64,
    client: Arc<dyn EngineClient>,
}

/// Bridges the session registry to whatever [`MessagingEngine`] is wired in.
///
/// Cloning is cheap; all clones share the same registry, client table, and
/// engine.
#[derive(Clone)]
pub struct EngineAdapter {
    engine: Arc<dyn MessagingEngine>,
    registry: Arc<SessionRegistry>,
    projection: Arc<dyn ProjectionStore>,
    credentials: Arc<dyn CredentialStore>,
    clients: Arc<RwLock<HashMap<String, ClientSlot>>>,
    max_init_attempts: u32,
    init_retry_backoff: Duration,
}

impl EngineAdapter {
    pub fn new(
        engine: Arc<dyn MessagingEngine>,
        registry: Arc<SessionRegistry>,
        projection: Arc<dyn ProjectionStore>,
        credentials: Arc<dyn CredentialStore>,
        max_init_attempts: u32,
        init_retry_backoff: Duration,
    ) -> Self {
        Self {
            engine,
            registry,
            projection,
            credentials,
            clients: Arc::new(RwLock::new(HashMap::new())),
            max_init_attempts: max_init_attempts.max(1),
            init_retry_backoff,
        }
    }

    /// Starts an engine cycle for the session unless one is already live.
    /// Returns whether this call started one. Safe to call on every
    /// request; racing callers resolve through the registry claim.
    pub fn start(&self, session_id: &str, owner_user_id: &str) -> bool {
        let Some(generation) = self.registry.begin_cycle(session_id, owner_user_id) else {
            return false;
        };
        tracing::info!(session_id = %session_id, generation, "starting engine cycle");

        let adapter = self.clone();
        let session_id = session_id.to_string();
        let owner = owner_user_id.to_string();
        tokio::spawn(async move { adapter.run_session(session_id, owner, generation).await });
        true
    }

    /// Delivers one message through the session's live engine object.
    /// Exactly one attempt; callers decide whether to retry.
    pub async fn send(
        &self,
        session_id: &str,
        recipient: &str,
        body: &str,
    ) -> Result<(), SendError> {
        let Some(snapshot) = self.registry.snapshot(session_id) else {
            return Err(SendError::SessionNotFound {
                session_id: session_id.to_string(),
            });
        };
        if !matches!(snapshot.phase, SessionPhase::Ready) {
            return Err(SendError::SessionNotReady {
                session_id: session_id.to_string(),
                state: snapshot.phase.label(),
            });
        }

        // The slot can only lag the registry, so a missing or mismatched
        // slot means the cycle died after the snapshot above.
        let client = {
            let clients = self.clients.read();
            match clients.get(session_id) {
                Some(slot) if slot.generation == snapshot.generation => Arc::clone(&slot.client),
                _ => {
                    return Err(SendError::SessionNotFound {
                        session_id: session_id.to_string(),
                    })
                }
            }
        };

        client.send_text(recipient, body).await.map_err(|err| {
            tracing::error!(session_id = %session_id, error = %err, "message delivery failed");
            SendError::Engine(err)
        })
    }

    // ── Cycle task ──────────────────────────────────────────────────────

    async fn run_session(self, session_id: String, owner_user_id: String, generation: u64) {
        let mut handle = None;
        for attempt in 1..=self.max_init_attempts {
            match self
                .engine
                .initialize(&session_id, Arc::clone(&self.credentials))
                .await
            {
                Ok(h) => {
                    handle = Some(h);
                    break;
                }
                Err(err) => {
                    tracing::warn!(
                        session_id = %session_id,
                        attempt,
                        max_attempts = self.max_init_attempts,
                        error = %err,
                        "engine initialization failed"
                    );
                    if attempt < self.max_init_attempts {
                        tokio::time::sleep(self.init_retry_backoff * attempt).await;
                    }
                }
            }
        }
        let Some(handle) = handle else {
            self.apply_event(
                &session_id,
                &owner_user_id,
                generation,
                EngineEvent::AuthFailed {
                    reason: "engine initialization failed".to_string(),
                },
            );
            return;
        };

        let client = Arc::clone(&handle.client);
        self.install_client(&session_id, generation, Arc::clone(&client));

        let mut events = handle.events;
        let mut saw_terminal = false;
        while let Some(event) = events.recv().await {
            let terminal = event.is_terminal();
            self.apply_event(&session_id, &owner_user_id, generation, event);
            if terminal {
                saw_terminal = true;
                break;
            }
        }
        if !saw_terminal {
            // Stream closed without a goodbye; treat it as a remote drop.
            self.apply_event(
                &session_id,
                &owner_user_id,
                generation,
                EngineEvent::Disconnected {
                    reason: "engine event stream closed".to_string(),
                },
            );
        }

        self.teardown(&session_id, generation, client).await;
    }

    fn install_client(&self, session_id: &str, generation: u64, client: Arc<dyn EngineClient>) {
        let mut clients = self.clients.write();
        if let Some(slot) = clients.get(session_id) {
            if slot.generation > generation {
                return;
            }
        }
        clients.insert(session_id.to_string(), ClientSlot { generation, client });
    }

    async fn teardown(&self, session_id: &str, generation: u64, client: Arc<dyn EngineClient>) {
        {
            let mut clients = self.clients.write();
            if clients
                .get(session_id)
                .is_some_and(|slot| slot.generation == generation)
            {
                clients.remove(session_id);
            }
        }
        if let Err(err) = client.shutdown().await {
            tracing::debug!(session_id = %session_id, error = %err, "engine shutdown reported an error");
        }
        tracing::debug!(session_id = %session_id, generation, "engine cycle finished");
    }

    // ── Event table ─────────────────────────────────────────────────────

    fn apply_event(
        &self,
        session_id: &str,
        owner_user_id: &str,
        generation: u64,
        event: EngineEvent,
    ) {
        match event {
            EngineEvent::PairingCode { code } => {
                let phase = SessionPhase::AwaitingPairing {
                    code,
                    issued_at: Instant::now(),
                };
                if self.registry.update_phase(session_id, generation, phase) == PhaseUpdate::Applied
                {
                    tracing::info!(session_id = %session_id, "pairing code issued");
                }
            }
            EngineEvent::Authenticated => {
                if self
                    .registry
                    .update_phase(session_id, generation, SessionPhase::Authenticated)
                    == PhaseUpdate::Applied
                {
                    tracing::info!(session_id = %session_id, "session authenticated");
                }
            }
            EngineEvent::CredentialsSaved => {
                tracing::debug!(session_id = %session_id, "engine credentials persisted");
            }
            EngineEvent::Ready => {
                if self
                    .registry
                    .update_phase(session_id, generation, SessionPhase::Ready)
                    == PhaseUpdate::Applied
                {
                    tracing::info!(session_id = %session_id, "session ready");
                    self.write_projection(
                        owner_user_id,
                        ProjectionPatch {
                            ready: Some(true),
                            first_login: Some(false),
                            last_session_state: Some(SessionPhase::Ready.label().to_string()),
                            ..ProjectionPatch::default()
                        },
                    );
                }
            }
            EngineEvent::AuthFailed { reason } => {
                if self
                    .registry
                    .update_phase(session_id, generation, SessionPhase::AuthFailed)
                    == PhaseUpdate::Applied
                {
                    tracing::warn!(session_id = %session_id, reason = %reason, "session authentication failed");
                    // Annotate before removal so status readers never see
                    // the entry gone but the record unmarked.
                    self.write_projection(
                        owner_user_id,
                        ProjectionPatch {
                            last_session_state: Some(SessionPhase::AuthFailed.label().to_string()),
                            ..ProjectionPatch::default()
                        },
                    );
                    self.registry.remove_if_current(session_id, generation);
                }
            }
            EngineEvent::Disconnected { reason } => {
                if self
                    .registry
                    .update_phase(session_id, generation, SessionPhase::Disconnected)
                    == PhaseUpdate::Applied
                {
                    tracing::info!(session_id = %session_id, reason = %reason, "session disconnected");
                    self.write_projection(
                        owner_user_id,
                        ProjectionPatch {
                            ready: Some(false),
                            last_session_state: Some(
                                SessionPhase::Disconnected.label().to_string(),
                            ),
                            ..ProjectionPatch::default()
                        },
                    );
                    self.registry.remove_if_current(session_id, generation);
                }
            }
        }
    }

    /// The projection is best-effort; a failed write must never stall the
    /// event pump or poison the registry.
    fn write_projection(&self, user_id: &str, patch: ProjectionPatch) {
        if let Err(err) = self.projection.update_projection(user_id, patch) {
            tracing::error!(user_id = %user_id, error = %err, "projection update failed");
        }
    }
}

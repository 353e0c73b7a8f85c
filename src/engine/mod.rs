//! Messaging engine seam.
//!
//! The actual messaging protocol is a black box behind two small traits:
//! [`MessagingEngine`] constructs one engine object per session, and the
//! returned [`EngineHandle`] exposes that object's send surface plus the
//! event stream its lifecycle is observed through. The adapter consumes the
//! stream and is the only component allowed to start or stop engine objects.
//!
//! ## Design
//! - Engine-agnostic lifecycle events (`EngineEvent`), one channel per object
//! - Initialization is fire-and-forget: pairing progress arrives as events,
//!   never as a synchronous result
//! - A closed event channel means the engine object is gone
//! - `SimEngine` drives the full lifecycle in-process for dev and tests

pub mod adapter;
pub mod sim;

use crate::store::CredentialStore;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Lifecycle signal emitted by an engine object.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A pairing code to present out-of-band. Engines re-emit this with a
    /// fresh code while the previous one sits unscanned.
    PairingCode { code: String },
    /// Pairing (or credential restore) was accepted; not yet operational.
    Authenticated,
    /// The engine persisted its auth artifacts in the credential store.
    CredentialsSaved,
    /// Fully operational; sends are accepted from here on.
    Ready,
    /// Pairing or restore was rejected. The engine object is finished.
    AuthFailed { reason: String },
    /// The remote end dropped the session. The engine object is finished.
    Disconnected { reason: String },
}

impl EngineEvent {
    /// True for events after which the engine object emits nothing more.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EngineEvent::AuthFailed { .. } | EngineEvent::Disconnected { .. }
        )
    }
}

/// Live handle to one engine object.
pub struct EngineHandle {
    pub client: Arc<dyn EngineClient>,
    pub events: mpsc::Receiver<EngineEvent>,
}

/// Factory for engine objects.
#[async_trait]
pub trait MessagingEngine: Send + Sync {
    /// Constructs and starts one engine object for `session_id`, configured
    /// to persist its authentication artifacts under that id in
    /// `credentials`. Returns as soon as the object is running; pairing
    /// completion is observed only through the event stream.
    async fn initialize(
        &self,
        session_id: &str,
        credentials: Arc<dyn CredentialStore>,
    ) -> anyhow::Result<EngineHandle>;
}

/// Send surface of a live engine object.
#[async_trait]
pub trait EngineClient: Send + Sync {
    /// One delivery attempt. No layer above retries a failed send.
    async fn send_text(&self, recipient: &str, body: &str) -> anyhow::Result<()>;

    /// Stops the engine object. Idempotent.
    async fn shutdown(&self) -> anyhow::Result<()>;
}

pub use adapter::EngineAdapter;
pub use sim::SimEngine;

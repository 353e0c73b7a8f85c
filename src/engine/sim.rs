//! In-process engine used by the dev profile and the test suite.
//!
//! `SimEngine` plays both sides of the pairing handshake. Each initialized
//! object emits a pairing code and then waits for the "remote" half, which a
//! test drives explicitly ([`SimEngine::scan`], [`SimEngine::reject`],
//! [`SimEngine::drop_remote`]) and the dev profile drives on a timer
//! (`with_auto_pair`). Credentials round-trip through the real store, so the
//! restore path is exercised exactly as it would be against a live engine.

use super::{EngineClient, EngineEvent, EngineHandle, MessagingEngine};
use crate::store::CredentialStore;
use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// One delivered message, as recorded by the sim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub session_id: String,
    pub recipient: String,
    pub body: String,
}

/// Delivery bookkeeping shared by every client the sim hands out.
#[derive(Default)]
struct SimLedger {
    outbox: Mutex<Vec<SentMessage>>,
    send_attempts: AtomicU32,
    fail_sends: AtomicBool,
}

/// Remote-side handle for one live engine object.
struct SimSessionControl {
    tx: mpsc::Sender<EngineEvent>,
    credentials: Arc<dyn CredentialStore>,
}

pub struct SimEngine {
    auto_pair: bool,
    auto_pair_delay: Duration,
    sessions: Mutex<HashMap<String, SimSessionControl>>,
    ledger: Arc<SimLedger>,
    init_calls: AtomicU32,
    fail_next_inits: AtomicU32,
}

impl SimEngine {
    /// Sim that waits for an explicit [`scan`](Self::scan).
    pub fn new() -> Self {
        Self {
            auto_pair: false,
            auto_pair_delay: Duration::ZERO,
            sessions: Mutex::new(HashMap::new()),
            ledger: Arc::new(SimLedger::default()),
            init_calls: AtomicU32::new(0),
            fail_next_inits: AtomicU32::new(0),
        }
    }

    /// Sim that scans its own pairing code after `delay`. This is what the
    /// dev profile runs so a session reaches `Ready` without a phone.
    pub fn with_auto_pair(delay: Duration) -> Self {
        Self {
            auto_pair: true,
            auto_pair_delay: delay,
            ..Self::new()
        }
    }

    // ── Remote-side controls ────────────────────────────────────────────

    /// Completes pairing for `session_id` as if the code had been scanned:
    /// authenticates, persists credentials, and reports ready.
    pub async fn scan(&self, session_id: &str) -> Result<()> {
        let (tx, credentials) = self.control(session_id)?;
        Self::complete_pairing(&tx, credentials, session_id).await;
        Ok(())
    }

    /// Rejects pairing or restore for `session_id`.
    pub async fn reject(&self, session_id: &str, reason: &str) -> Result<()> {
        let (tx, _) = self.control(session_id)?;
        self.deliver(
            session_id,
            &tx,
            EngineEvent::AuthFailed {
                reason: reason.to_string(),
            },
        )
        .await
    }

    /// Kills the session from the remote side.
    pub async fn drop_remote(&self, session_id: &str, reason: &str) -> Result<()> {
        let (tx, _) = self.control(session_id)?;
        self.deliver(
            session_id,
            &tx,
            EngineEvent::Disconnected {
                reason: reason.to_string(),
            },
        )
        .await
    }

    /// Re-issues a pairing code, as engines do while one sits unscanned.
    pub async fn emit_pairing_code(&self, session_id: &str, code: &str) -> Result<()> {
        let (tx, _) = self.control(session_id)?;
        self.deliver(
            session_id,
            &tx,
            EngineEvent::PairingCode {
                code: code.to_string(),
            },
        )
        .await
    }

    // ── Test instrumentation ────────────────────────────────────────────

    /// Every message any client delivered, in order.
    pub fn outbox(&self) -> Vec<SentMessage> {
        self.ledger.outbox.lock().clone()
    }

    /// Delivery attempts, including failed ones.
    pub fn send_attempts(&self) -> u32 {
        self.ledger.send_attempts.load(Ordering::SeqCst)
    }

    pub fn init_calls(&self) -> u32 {
        self.init_calls.load(Ordering::SeqCst)
    }

    /// Makes the next `n` `initialize` calls fail.
    pub fn fail_next_inits(&self, n: u32) {
        self.fail_next_inits.store(n, Ordering::SeqCst);
    }

    /// Makes every delivery attempt fail until cleared.
    pub fn set_fail_sends(&self, fail: bool) {
        self.ledger.fail_sends.store(fail, Ordering::SeqCst);
    }

    // ── Internals ───────────────────────────────────────────────────────

    fn control(
        &self,
        session_id: &str,
    ) -> Result<(mpsc::Sender<EngineEvent>, Arc<dyn CredentialStore>)> {
        let sessions = self.sessions.lock();
        let Some(control) = sessions.get(session_id) else {
            bail!("no live engine object for {session_id}");
        };
        Ok((control.tx.clone(), Arc::clone(&control.credentials)))
    }

    async fn deliver(
        &self,
        session_id: &str,
        tx: &mpsc::Sender<EngineEvent>,
        event: EngineEvent,
    ) -> Result<()> {
        if tx.send(event).await.is_err() {
            self.sessions.lock().remove(session_id);
            bail!("engine object for {session_id} is gone");
        }
        Ok(())
    }

    async fn complete_pairing(
        tx: &mpsc::Sender<EngineEvent>,
        credentials: Arc<dyn CredentialStore>,
        session_id: &str,
    ) {
        // Mirrors the live-engine order: auth first, then the credential
        // write, then operational.
        let _ = tx.send(EngineEvent::Authenticated).await;
        let blob = format!("sim-session:{session_id}");
        match credentials.put(session_id, blob.as_bytes()) {
            Ok(()) => {
                let _ = tx.send(EngineEvent::CredentialsSaved).await;
            }
            Err(err) => {
                tracing::warn!(session_id = %session_id, error = %err, "sim credential write failed");
            }
        }
        let _ = tx.send(EngineEvent::Ready).await;
    }
}

impl Default for SimEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessagingEngine for SimEngine {
    async fn initialize(
        &self,
        session_id: &str,
        credentials: Arc<dyn CredentialStore>,
    ) -> Result<EngineHandle> {
        self.init_calls.fetch_add(1, Ordering::SeqCst);
        let failure_armed = self
            .fail_next_inits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failure_armed {
            bail!("simulated initialize failure for {session_id}");
        }

        let (tx, rx) = mpsc::channel(32);
        self.sessions.lock().insert(
            session_id.to_string(),
            SimSessionControl {
                tx: tx.clone(),
                credentials: Arc::clone(&credentials),
            },
        );

        if credentials.get(session_id)?.is_some() {
            // Stored credentials short-circuit pairing entirely.
            let _ = tx.send(EngineEvent::Authenticated).await;
            let _ = tx.send(EngineEvent::Ready).await;
        } else {
            let code = hex::encode(rand::random::<[u8; 4]>()).to_uppercase();
            let _ = tx.send(EngineEvent::PairingCode { code }).await;
            if self.auto_pair {
                let delay = self.auto_pair_delay;
                let session_id = session_id.to_string();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    Self::complete_pairing(&tx, credentials, &session_id).await;
                });
            }
        }

        Ok(EngineHandle {
            client: Arc::new(SimClient {
                session_id: session_id.to_string(),
                ledger: Arc::clone(&self.ledger),
            }),
            events: rx,
        })
    }
}

struct SimClient {
    session_id: String,
    ledger: Arc<SimLedger>,
}

#[async_trait]
impl EngineClient for SimClient {
    async fn send_text(&self, recipient: &str, body: &str) -> Result<()> {
        self.ledger.send_attempts.fetch_add(1, Ordering::SeqCst);
        if self.ledger.fail_sends.load(Ordering::SeqCst) {
            bail!("simulated delivery failure");
        }
        self.ledger.outbox.lock().push(SentMessage {
            session_id: self.session_id.clone(),
            recipient: recipient.to_string(),
            body: body.to_string(),
        });
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteCredentialStore;
    use tempfile::TempDir;

    fn test_store() -> (TempDir, Arc<SqliteCredentialStore>) {
        let dir = TempDir::new().unwrap();
        let store = SqliteCredentialStore::open(&dir.path().join("creds.db")).unwrap();
        (dir, Arc::new(store))
    }

    #[tokio::test]
    async fn pairing_flow_reaches_ready_after_scan() {
        let (_dir, store) = test_store();
        let engine = SimEngine::new();

        let mut handle = engine
            .initialize("user_1", store.clone() as Arc<dyn CredentialStore>)
            .await
            .unwrap();

        let code = match handle.events.recv().await.unwrap() {
            EngineEvent::PairingCode { code } => code,
            other => panic!("expected pairing code, got {other:?}"),
        };
        assert_eq!(code.len(), 8);

        engine.scan("user_1").await.unwrap();
        assert!(matches!(
            handle.events.recv().await.unwrap(),
            EngineEvent::Authenticated
        ));
        assert!(matches!(
            handle.events.recv().await.unwrap(),
            EngineEvent::CredentialsSaved
        ));
        assert!(matches!(handle.events.recv().await.unwrap(), EngineEvent::Ready));
        assert!(store.get("user_1").unwrap().is_some());
    }

    #[tokio::test]
    async fn stored_credentials_skip_pairing() {
        let (_dir, store) = test_store();
        store.put("user_1", b"sim-session:user_1").unwrap();
        let engine = SimEngine::new();

        let mut handle = engine
            .initialize("user_1", store as Arc<dyn CredentialStore>)
            .await
            .unwrap();

        assert!(matches!(
            handle.events.recv().await.unwrap(),
            EngineEvent::Authenticated
        ));
        assert!(matches!(handle.events.recv().await.unwrap(), EngineEvent::Ready));
    }

    #[tokio::test]
    async fn injected_init_failures_are_consumed_in_order() {
        let (_dir, store) = test_store();
        let engine = SimEngine::new();
        engine.fail_next_inits(2);

        for _ in 0..2 {
            assert!(engine
                .initialize("user_1", store.clone() as Arc<dyn CredentialStore>)
                .await
                .is_err());
        }
        assert!(engine
            .initialize("user_1", store as Arc<dyn CredentialStore>)
            .await
            .is_ok());
        assert_eq!(engine.init_calls(), 3);
    }

    #[tokio::test]
    async fn ledger_records_deliveries_and_failures() {
        let (_dir, store) = test_store();
        let engine = SimEngine::new();
        let handle = engine
            .initialize("user_1", store as Arc<dyn CredentialStore>)
            .await
            .unwrap();

        handle.client.send_text("+15550001111", "hello").await.unwrap();
        engine.set_fail_sends(true);
        assert!(handle.client.send_text("+15550001111", "again").await.is_err());

        let outbox = engine.outbox();
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox[0].recipient, "+15550001111");
        assert_eq!(outbox[0].body, "hello");
        assert_eq!(engine.send_attempts(), 2);
    }
}

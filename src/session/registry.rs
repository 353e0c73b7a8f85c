//! Authoritative in-memory map of live sessions.
//!
//! Many caller requests and many asynchronous engine callbacks mutate this
//! map concurrently. The map lock is held only for lookup/insert/remove;
//! every entry carries its own lock for phase updates, so independent
//! sessions never contend on the update path.
//!
//! Each engine cycle gets a process-wide unique generation number stamped by
//! [`SessionRegistry::begin_cycle`]. Updates carry the generation of the
//! cycle that produced them; anything from a superseded cycle, a removed
//! entry, or arriving out of order is a silent no-op. That is what keeps a
//! `Ready` from ever being overwritten by a stale `Initializing`.

use super::{SessionPhase, SessionSnapshot};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Outcome of a guarded phase update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseUpdate {
    /// Transition accepted and now visible.
    Applied,
    /// Stale generation, duplicate, or regressing phase; state unchanged.
    Stale,
    /// No entry for this session id (late event after removal).
    Missing,
}

#[derive(Debug)]
struct SessionCell {
    phase: SessionPhase,
    /// Generation of the cycle that owns this entry; 0 = no cycle yet.
    generation: u64,
}

/// One tracked session.
#[derive(Debug)]
pub struct SessionEntry {
    session_id: String,
    owner_user_id: String,
    cell: Mutex<SessionCell>,
}

impl SessionEntry {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn owner_user_id(&self) -> &str {
        &self.owner_user_id
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let cell = self.cell.lock();
        SessionSnapshot {
            session_id: self.session_id.clone(),
            owner_user_id: self.owner_user_id.clone(),
            phase: cell.phase.clone(),
            generation: cell.generation,
        }
    }
}

/// Process-wide `session_id → SessionEntry` map.
pub struct SessionRegistry {
    entries: RwLock<HashMap<String, Arc<SessionEntry>>>,
    /// Never reused, even across entry removal and recreation.
    next_generation: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Returns the existing entry or atomically inserts a fresh
    /// `Uninitialized` one. Concurrent calls for the same id observe
    /// exactly one entry.
    pub fn get_or_create(&self, session_id: &str, owner_user_id: &str) -> Arc<SessionEntry> {
        if let Some(entry) = self.entries.read().get(session_id) {
            return Arc::clone(entry);
        }

        let mut entries = self.entries.write();
        let entry = entries
            .entry(session_id.to_string())
            .or_insert_with(|| {
                Arc::new(SessionEntry {
                    session_id: session_id.to_string(),
                    owner_user_id: owner_user_id.to_string(),
                    cell: Mutex::new(SessionCell {
                        phase: SessionPhase::Uninitialized,
                        generation: 0,
                    }),
                })
            });
        Arc::clone(entry)
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<SessionEntry>> {
        self.entries.read().get(session_id).map(Arc::clone)
    }

    pub fn snapshot(&self, session_id: &str) -> Option<SessionSnapshot> {
        self.get(session_id).map(|entry| entry.snapshot())
    }

    /// Atomically claims the session for a new engine cycle: inserts the
    /// entry if absent, transitions `Uninitialized → Initializing`, and
    /// stamps a fresh generation. Returns `None` when a cycle is already
    /// live, which makes this the exactly-once gate for engine starts under
    /// racing callers.
    ///
    /// Polls against a live cycle answer under the shared map lock.
    /// Creation and claim happen under one map write lock so a concurrent
    /// removal can never leave a claimed entry detached from the map.
    pub fn begin_cycle(&self, session_id: &str, owner_user_id: &str) -> Option<u64> {
        // Polled on every pairing request. While a cycle is live the claim
        // can only fail, so answer that from the shared lock; only a
        // plausible claim takes the write lock below.
        {
            let entries = self.entries.read();
            if let Some(entry) = entries.get(session_id) {
                if !matches!(entry.cell.lock().phase, SessionPhase::Uninitialized) {
                    return None;
                }
            }
        }

        let mut entries = self.entries.write();
        let entry = entries.entry(session_id.to_string()).or_insert_with(|| {
            Arc::new(SessionEntry {
                session_id: session_id.to_string(),
                owner_user_id: owner_user_id.to_string(),
                cell: Mutex::new(SessionCell {
                    phase: SessionPhase::Uninitialized,
                    generation: 0,
                }),
            })
        });

        let mut cell = entry.cell.lock();
        match cell.phase {
            SessionPhase::Uninitialized => {
                let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                cell.generation = generation;
                cell.phase = SessionPhase::Initializing;
                Some(generation)
            }
            _ => None,
        }
    }

    /// Applies a phase transition for the given cycle. Per-session
    /// serialization comes from the entry lock; staleness from the
    /// generation and rank guards.
    pub fn update_phase(
        &self,
        session_id: &str,
        generation: u64,
        phase: SessionPhase,
    ) -> PhaseUpdate {
        let Some(entry) = self.get(session_id) else {
            return PhaseUpdate::Missing;
        };

        let mut cell = entry.cell.lock();
        if cell.generation != generation {
            tracing::debug!(
                session_id = %session_id,
                event_generation = generation,
                current_generation = cell.generation,
                "phase update from superseded cycle ignored"
            );
            return PhaseUpdate::Stale;
        }

        let refresh = matches!(
            (&cell.phase, &phase),
            (
                SessionPhase::AwaitingPairing { .. },
                SessionPhase::AwaitingPairing { .. }
            )
        );
        if phase.rank() < cell.phase.rank() || (phase.rank() == cell.phase.rank() && !refresh) {
            tracing::debug!(
                session_id = %session_id,
                from = cell.phase.label(),
                to = phase.label(),
                "out-of-order phase update ignored"
            );
            return PhaseUpdate::Stale;
        }

        cell.phase = phase;
        PhaseUpdate::Applied
    }

    /// Removes the entry, but only while the given cycle still owns it.
    /// Terminal transitions call this so the next request starts a brand-new
    /// cycle instead of reusing a dead engine object.
    pub fn remove_if_current(&self, session_id: &str, generation: u64) -> bool {
        let mut entries = self.entries.write();
        let Some(entry) = entries.get(session_id) else {
            return false;
        };
        if entry.cell.lock().generation != generation {
            return false;
        }
        entries.remove(session_id);
        tracing::debug!(session_id = %session_id, generation, "session entry removed");
        true
    }

    pub fn active_count(&self) -> usize {
        self.entries.read().len()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

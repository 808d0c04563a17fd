//! In-memory authority for which models have a live session.
//!
//! Every start/stop/pause decision goes through atomic per-entry operations
//! on a concurrent map, so two racing starts for one model cannot both win.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

use super::types::{ModelId, SessionId, SessionStatus};
use crate::engine::CancelToken;
use crate::error::{Error, Result};

/// Live slot for a model with a non-terminal session
#[derive(Debug, Clone)]
pub struct ActiveSession {
    /// Session currently holding the model
    pub session_id: SessionId,
    /// Cooperative cancellation handle shared with the epoch loop
    pub cancel: CancelToken,
    /// Running or Paused; terminal sessions leave the registry
    pub status: SessionStatus,
}

/// Registry enforcing one active session per model
#[derive(Default)]
pub struct SessionRegistry {
    active: DashMap<ModelId, ActiveSession>,
}

impl SessionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the model for `session_id`.
    ///
    /// Fails with [`Error::AlreadyTraining`] while any non-terminal session
    /// (running or paused) holds the slot. Returns the cancellation token
    /// the claiming session's epoch loop must observe.
    pub fn claim(&self, model_id: ModelId, session_id: SessionId) -> Result<CancelToken> {
        match self.active.entry(model_id) {
            Entry::Occupied(_) => Err(Error::AlreadyTraining(model_id)),
            Entry::Vacant(slot) => {
                let cancel = CancelToken::new();
                slot.insert(ActiveSession {
                    session_id,
                    cancel: cancel.clone(),
                    status: SessionStatus::Running,
                });
                debug!(%model_id, %session_id, "registry slot claimed");
                Ok(cancel)
            }
        }
    }

    /// Snapshot of the model's slot, if occupied
    pub fn get(&self, model_id: ModelId) -> Option<ActiveSession> {
        self.active.get(&model_id).map(|entry| entry.value().clone())
    }

    /// Remove the slot only while it still belongs to `session_id`.
    ///
    /// A late outcome from a session that was already stopped or superseded
    /// misses here and must be discarded by the caller.
    pub fn take_if_current(&self, model_id: ModelId, session_id: SessionId) -> bool {
        let removed = self
            .active
            .remove_if(&model_id, |_, entry| entry.session_id == session_id)
            .is_some();
        if removed {
            debug!(%model_id, %session_id, "registry slot released");
        }
        removed
    }

    /// Remove the slot unconditionally
    pub fn remove(&self, model_id: ModelId) -> Option<ActiveSession> {
        self.active.remove(&model_id).map(|(_, entry)| entry)
    }

    /// True while the slot still belongs to `session_id`
    pub fn is_current(&self, model_id: ModelId, session_id: SessionId) -> bool {
        self.active
            .get(&model_id)
            .map(|entry| entry.session_id == session_id)
            .unwrap_or(false)
    }

    /// Park a running session; the slot stays occupied so new starts keep
    /// failing with `AlreadyTraining` until a resume or stop.
    pub fn mark_paused(&self, model_id: ModelId, session_id: SessionId) -> bool {
        match self.active.get_mut(&model_id) {
            Some(mut entry) if entry.session_id == session_id => {
                entry.status = SessionStatus::Paused;
                debug!(%model_id, %session_id, "registry slot parked");
                true
            }
            _ => false,
        }
    }

    /// Models with a live session, in no particular order
    pub fn active_models(&self) -> Vec<ModelId> {
        self.active.iter().map(|entry| *entry.key()).collect()
    }

    /// Number of live sessions
    pub fn len(&self) -> usize {
        self.active.len()
    }

    /// True when no model has a live session
    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_is_exclusive_per_model() {
        let registry = SessionRegistry::new();
        let first = SessionId::new();
        registry.claim(ModelId(1), first).unwrap();

        let err = registry.claim(ModelId(1), SessionId::new()).unwrap_err();
        assert!(matches!(err, Error::AlreadyTraining(ModelId(1))));

        // other models are unaffected
        registry.claim(ModelId(2), SessionId::new()).unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn take_if_current_ignores_superseded_sessions() {
        let registry = SessionRegistry::new();
        let current = SessionId::new();
        registry.claim(ModelId(1), current).unwrap();

        assert!(!registry.take_if_current(ModelId(1), SessionId::new()));
        assert_eq!(registry.len(), 1);
        assert!(registry.take_if_current(ModelId(1), current));
        assert!(registry.is_empty());
    }

    #[test]
    fn paused_slot_still_blocks_new_claims() {
        let registry = SessionRegistry::new();
        let session = SessionId::new();
        registry.claim(ModelId(1), session).unwrap();
        assert!(registry.mark_paused(ModelId(1), session));

        let snapshot = registry.get(ModelId(1)).unwrap();
        assert_eq!(snapshot.status, SessionStatus::Paused);
        assert!(matches!(
            registry.claim(ModelId(1), SessionId::new()),
            Err(Error::AlreadyTraining(_))
        ));
    }

    #[test]
    fn mark_paused_requires_the_owning_session() {
        let registry = SessionRegistry::new();
        let session = SessionId::new();
        registry.claim(ModelId(1), session).unwrap();

        assert!(!registry.mark_paused(ModelId(1), SessionId::new()));
        assert_eq!(registry.get(ModelId(1)).unwrap().status, SessionStatus::Running);
    }

    #[test]
    fn stop_flag_reaches_the_cloned_token() {
        let registry = SessionRegistry::new();
        let session = SessionId::new();
        let loop_token = registry.claim(ModelId(1), session).unwrap();

        let snapshot = registry.get(ModelId(1)).unwrap();
        snapshot.cancel.request_stop();
        assert!(loop_token.is_stop_requested());
    }
}

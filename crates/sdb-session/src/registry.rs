use std::collections::HashMap;

use parking_lot::RwLock;

use crate::session::SessionHandle;
use crate::state::{SessionId, TerminationReason};

/// Sessions a host is tracking, keyed by id.
///
/// Hosts that run several games at once keep their handles here; the
/// registry itself never talks to a session except in [`detach_all`].
///
/// [`detach_all`]: SessionRegistry::detach_all
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, SessionHandle>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, handle: SessionHandle) {
        self.sessions.write().insert(handle.id(), handle);
    }

    pub fn get(&self, id: SessionId) -> Option<SessionHandle> {
        self.sessions.read().get(&id).cloned()
    }

    pub fn remove(&self, id: SessionId) -> Option<SessionHandle> {
        self.sessions.write().remove(&id)
    }

    /// Ids in ascending order.
    pub fn ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<_> = self.sessions.read().keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Drop handles whose session has ended and return their ids.
    pub fn prune_terminated(&self) -> Vec<SessionId> {
        let mut sessions = self.sessions.write();
        let mut pruned: Vec<_> = sessions
            .iter()
            .filter(|(_, handle)| handle.termination_reason().is_some())
            .map(|(id, _)| *id)
            .collect();
        pruned.sort();
        for id in &pruned {
            sessions.remove(id);
        }
        pruned
    }

    /// Detach every tracked session and wait for each to end.
    pub async fn detach_all(&self) -> Vec<(SessionId, TerminationReason)> {
        let handles: Vec<_> = {
            let mut sessions = self.sessions.write();
            sessions.drain().map(|(_, handle)| handle).collect()
        };
        let mut outcomes = Vec::with_capacity(handles.len());
        for handle in handles {
            let reason = handle.detach().await;
            outcomes.push((handle.id(), reason));
        }
        outcomes.sort_by_key(|(id, _)| *id);
        outcomes
    }
}

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::conversation::Turn;

type SessionSlot = Arc<AsyncMutex<Vec<Turn>>>;

/// Process-lifetime turn history keyed by session identifier.
///
/// Each session sits behind its own async lock. A request holds the lease for
/// its whole agent loop, so two requests on the same session run one after the
/// other while different sessions never wait on each other.
#[derive(Default)]
pub struct SessionStore {
    sessions: Mutex<HashMap<String, SessionSlot>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to `session_id`, creating an empty session if unseen.
    pub async fn lease(&self, session_id: &str) -> SessionLease {
        let slot = {
            let mut sessions = self.sessions.lock();
            sessions.entry(session_id.to_string()).or_default().clone()
        };
        SessionLease {
            session_id: session_id.to_string(),
            turns: slot.lock_owned().await,
        }
    }

    /// Copy of the committed history; empty for unknown sessions.
    pub async fn history(&self, session_id: &str) -> Vec<Turn> {
        let slot = self.sessions.lock().get(session_id).cloned();
        match slot {
            Some(slot) => slot.lock().await.clone(),
            None => Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct SessionLease {
    session_id: String,
    turns: OwnedMutexGuard<Vec<Turn>>,
}

impl SessionLease {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn history(&self) -> &[Turn] {
        &self.turns
    }

    /// Appends `turns` to the committed history and releases the lease.
    pub fn commit(mut self, turns: Vec<Turn>) {
        self.turns.extend(turns);
    }
}

//! Client-id to session map.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info};

use crate::session::Session;

/// Registry of authenticated sessions, keyed by client id.
///
/// A reconnecting client authenticates under its existing id; registering
/// the new session displaces the old instance, which is shut down in the
/// background. The displaced session's id is cleared before its shutdown is
/// scheduled so its eventual unregister cannot remove the new incumbent.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, session: Arc<Session>) {
        let id = session.id();
        debug!(client_id = %id, "registering session");
        if let Some(displaced) = self.sessions.insert(id.clone(), session) {
            info!(client_id = %id, "displacing previous session instance");
            displaced.clear_id();
            tokio::spawn(async move { displaced.shutdown().await });
        }
    }

    pub(crate) fn unregister(&self, session: &Arc<Session>) {
        let id = session.id();
        if id.is_empty() {
            // this instance was displaced; the id now belongs to its successor
            return;
        }
        self.sessions
            .remove_if(&id, |_, stored| Arc::ptr_eq(stored, session));
    }

    /// Look up a session by client id.
    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|s| s.clone())
    }

    /// Number of registered sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

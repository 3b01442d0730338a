//! Registry of authenticated sessions.
//!
//! Maps each client identity to the writer of the connection that
//! currently owns it. Insertion is first-wins: a CONNECT carrying an
//! identity that is already registered is rejected, and the existing
//! session is untouched.
//!
//! Removal is guarded by connection id so a session that lost the
//! identity race can never evict the winner during its own cleanup.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::writer::ConnectionWriter;

/// A registered session's delivery endpoint.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    /// Id of the underlying connection, unique per accept.
    pub connection_id: String,
    /// Serialized writer for the connection's socket.
    pub writer: Arc<ConnectionWriter>,
}

/// Shared client identity -> session map.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, SessionHandle>>,
}

impl SessionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session under a client identity.
    ///
    /// Returns `false` without modifying the map if the identity is
    /// already held by another session.
    pub async fn try_insert(&self, client_id: &str, handle: SessionHandle) -> bool {
        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(client_id) {
            debug!(
                target: "relay.registry",
                client_id = %client_id,
                connection_id = %handle.connection_id,
                "Identity already registered, insert refused"
            );
            return false;
        }
        sessions.insert(client_id.to_string(), handle);
        true
    }

    /// Remove a registration, but only if it still belongs to the
    /// given connection.
    ///
    /// Returns `true` if an entry was removed.
    pub async fn remove(&self, client_id: &str, connection_id: &str) -> bool {
        let mut sessions = self.sessions.lock().await;
        let owned = sessions
            .get(client_id)
            .is_some_and(|handle| handle.connection_id == connection_id);
        if owned {
            sessions.remove(client_id);
        }
        owned
    }

    /// Look up a single session by client identity.
    pub async fn get(&self, client_id: &str) -> Option<SessionHandle> {
        let sessions = self.sessions.lock().await;
        sessions.get(client_id).cloned()
    }

    /// Resolve a snapshot of identities to their current writers.
    ///
    /// Identities that disconnected since the snapshot was taken are
    /// silently skipped.
    pub async fn writers_for(&self, client_ids: &[String]) -> Vec<(String, Arc<ConnectionWriter>)> {
        let sessions = self.sessions.lock().await;
        client_ids
            .iter()
            .filter_map(|id| {
                sessions
                    .get(id)
                    .map(|handle| (id.clone(), Arc::clone(&handle.writer)))
            })
            .collect()
    }

    /// Identities of all currently registered sessions.
    pub async fn client_ids(&self) -> Vec<String> {
        let sessions = self.sessions.lock().await;
        sessions.keys().cloned().collect()
    }

    /// Whether an identity is currently registered.
    pub async fn contains(&self, client_id: &str) -> bool {
        let sessions = self.sessions.lock().await;
        sessions.contains_key(client_id)
    }
}

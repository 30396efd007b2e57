//! Session registry: the three indexes tying connections to sessions

use crate::error::{RelayError, Result};
use crate::session::Session;
use crate::wire::{ConnectionId, SessionId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

struct Indexes {
    sessions_by_id: HashMap<SessionId, Arc<Session>>,
    host_to_session: HashMap<ConnectionId, Arc<Session>>,
    client_to_host: HashMap<ConnectionId, ConnectionId>,
}

/// Holds the active sessions and keeps the three indexes mutually
/// consistent. Add/remove operations fail loudly on duplicate or absent
/// keys; the caller treats that as a server-side error and drops the
/// offending connection.
pub struct SessionRegistry {
    inner: RwLock<Indexes>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Indexes {
                sessions_by_id: HashMap::new(),
                host_to_session: HashMap::new(),
                client_to_host: HashMap::new(),
            }),
        }
    }

    /// Index a freshly created session under both its id and its host
    pub async fn try_add_session(&self, session: Arc<Session>) -> Result<()> {
        let mut inner = self.inner.write().await;
        let session_id = session.session_id();
        let host = session.host_connection_id();
        if inner.sessions_by_id.contains_key(&session_id) {
            return Err(RelayError::registry(format!(
                "session id {session_id} already indexed"
            )));
        }
        if inner.host_to_session.contains_key(&host) {
            return Err(RelayError::registry(format!(
                "connection {host} already hosts a session"
            )));
        }
        inner.sessions_by_id.insert(session_id, session.clone());
        inner.host_to_session.insert(host, session);
        Ok(())
    }

    /// Drop a session from both indexes, keyed by its host connection
    pub async fn try_remove_session(&self, host: ConnectionId) -> Result<Arc<Session>> {
        let mut inner = self.inner.write().await;
        let session = inner
            .host_to_session
            .remove(&host)
            .ok_or_else(|| RelayError::registry(format!("connection {host} hosts no session")))?;
        if inner
            .sessions_by_id
            .remove(&session.session_id())
            .is_none()
        {
            return Err(RelayError::registry(format!(
                "session id {} missing from id index",
                session.session_id()
            )));
        }
        Ok(session)
    }

    pub async fn session_by_id(&self, session_id: SessionId) -> Option<Arc<Session>> {
        self.inner.read().await.sessions_by_id.get(&session_id).cloned()
    }

    pub async fn session_by_host(&self, host: ConnectionId) -> Option<Arc<Session>> {
        self.inner.read().await.host_to_session.get(&host).cloned()
    }

    /// Record which host a client connection belongs to
    pub async fn try_add_client(&self, client: ConnectionId, host: ConnectionId) -> Result<()> {
        let mut inner = self.inner.write().await;
        if !inner.host_to_session.contains_key(&host) {
            return Err(RelayError::registry(format!(
                "client {client} maps to unknown host {host}"
            )));
        }
        if inner.client_to_host.contains_key(&client) {
            return Err(RelayError::registry(format!(
                "connection {client} is already a client"
            )));
        }
        inner.client_to_host.insert(client, host);
        Ok(())
    }

    /// Remove a client mapping; `None` when it was already gone
    pub async fn remove_client(&self, client: ConnectionId) -> Option<ConnectionId> {
        self.inner.write().await.client_to_host.remove(&client)
    }

    pub async fn host_of_client(&self, client: ConnectionId) -> Option<ConnectionId> {
        self.inner.read().await.client_to_host.get(&client).copied()
    }

    /// Snapshot of every active session, for listing
    pub async fn sessions(&self) -> Vec<Arc<Session>> {
        self.inner.read().await.sessions_by_id.values().cloned().collect()
    }

    pub async fn session_count(&self) -> usize {
        self.inner.read().await.sessions_by_id.len()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::SessionInfo;

    fn session(id: SessionId, host: ConnectionId) -> Arc<Session> {
        Arc::new(Session::new(id, host, SessionInfo::new("room", 4)))
    }

    #[tokio::test]
    async fn add_and_lookup_both_ways() {
        let registry = SessionRegistry::new();
        registry.try_add_session(session(1, 100)).await.unwrap();
        assert_eq!(registry.session_by_id(1).await.unwrap().session_id(), 1);
        assert_eq!(
            registry.session_by_host(100).await.unwrap().session_id(),
            1
        );
        assert_eq!(registry.session_count().await, 1);
    }

    #[tokio::test]
    async fn duplicate_session_id_rejected() {
        let registry = SessionRegistry::new();
        registry.try_add_session(session(1, 100)).await.unwrap();
        assert!(registry.try_add_session(session(1, 200)).await.is_err());
        // The failed add must not have touched the host index.
        assert!(registry.session_by_host(200).await.is_none());
    }

    #[tokio::test]
    async fn duplicate_host_rejected() {
        let registry = SessionRegistry::new();
        registry.try_add_session(session(1, 100)).await.unwrap();
        assert!(registry.try_add_session(session(2, 100)).await.is_err());
        assert!(registry.session_by_id(2).await.is_none());
    }

    #[tokio::test]
    async fn remove_clears_both_indexes() {
        let registry = SessionRegistry::new();
        registry.try_add_session(session(1, 100)).await.unwrap();
        let removed = registry.try_remove_session(100).await.unwrap();
        assert_eq!(removed.session_id(), 1);
        assert!(registry.session_by_id(1).await.is_none());
        assert!(registry.try_remove_session(100).await.is_err());
    }

    #[tokio::test]
    async fn client_mapping_requires_live_host() {
        let registry = SessionRegistry::new();
        assert!(registry.try_add_client(200, 100).await.is_err());
        registry.try_add_session(session(1, 100)).await.unwrap();
        registry.try_add_client(200, 100).await.unwrap();
        assert!(registry.try_add_client(200, 100).await.is_err());
        assert_eq!(registry.host_of_client(200).await, Some(100));
        assert_eq!(registry.remove_client(200).await, Some(100));
        assert_eq!(registry.remove_client(200).await, None);
    }
}

//! The session registry: one live backend per identifier.
//!
//! The registry is the single owner of backend lifetimes. Installing a
//! backend under an identifier that is already taken tears the old backend
//! down first (kill the process / end the connection); that is the
//! reconnect contract. Adapters retire their own entries on terminal events through
//! [`SessionRegistry::remove_if_instance`], which cannot race against a
//! replacement that happened in between.

use std::sync::Arc;

use dashmap::DashMap;
use uuid::Uuid;

use termhub_protocol::SessionId;

use crate::session::local::LocalSession;
use crate::session::remote::RemoteSession;

/// A backend of either kind, owned by exactly one registry entry.
///
/// Clones are handles to the same underlying session.
#[derive(Clone)]
pub enum Backend {
    Local(Arc<LocalSession>),
    Remote(Arc<RemoteSession>),
}

impl Backend {
    /// The marker distinguishing this backend from any other that ever
    /// held the same identifier.
    pub fn instance(&self) -> Uuid {
        match self {
            Backend::Local(s) => s.instance(),
            Backend::Remote(s) => s.instance(),
        }
    }

    /// Releases the backend's process or connection. Idempotent.
    pub async fn teardown(&self) {
        match self {
            Backend::Local(s) => s.teardown(),
            Backend::Remote(s) => s.teardown().await,
        }
    }

    pub fn as_local(&self) -> Option<&Arc<LocalSession>> {
        match self {
            Backend::Local(s) => Some(s),
            Backend::Remote(_) => None,
        }
    }

    pub fn as_remote(&self) -> Option<&Arc<RemoteSession>> {
        match self {
            Backend::Remote(s) => Some(s),
            Backend::Local(_) => None,
        }
    }
}

/// Concurrency-safe map from session identifier to its live backend.
#[derive(Default)]
pub struct SessionRegistry {
    entries: DashMap<SessionId, Backend>,
}

impl SessionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Installs a backend under `id`, tearing down any previous holder
    /// first. The old backend's resources are released before this
    /// returns, so a reconnect never overlaps the stale connection.
    pub async fn upsert(&self, id: SessionId, backend: Backend) {
        if let Some((_, old)) = self.entries.remove(&id) {
            tracing::info!(session_id = %id, "Replacing existing backend");
            old.teardown().await;
        }
        self.entries.insert(id, backend);
    }

    /// Returns the backend registered under `id`, if any.
    pub fn get(&self, id: &SessionId) -> Option<Backend> {
        self.entries.get(id).map(|entry| entry.value().clone())
    }

    /// Removes and returns the backend registered under `id`.
    ///
    /// Teardown stays with the caller: adapters invoking this on their own
    /// terminal events have already released their resources.
    pub fn remove(&self, id: &SessionId) -> Option<Backend> {
        self.entries.remove(id).map(|(_, backend)| backend)
    }

    /// Removes the entry only if it still holds the given backend
    /// instance. Used by adapters retiring themselves, so that a
    /// replacement installed meanwhile is never evicted by its
    /// predecessor's death.
    pub fn remove_if_instance(&self, id: &SessionId, instance: Uuid) -> bool {
        self.entries
            .remove_if(id, |_, backend| backend.instance() == instance)
            .is_some()
    }

    /// Returns whether a backend is registered under `id`.
    pub fn contains(&self, id: &SessionId) -> bool {
        self.entries.contains_key(id)
    }

    /// Number of registered sessions.
    pub fn count(&self) -> usize {
        self.entries.len()
    }

    /// Identifiers of all registered sessions.
    pub fn ids(&self) -> Vec<SessionId> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::remote::ConnectParams;

    fn remote_backend(id: &str) -> Backend {
        let (session, _cmd_rx) = RemoteSession::new(
            id.to_string(),
            ConnectParams {
                host: "localhost".to_string(),
                port: 22,
                username: "tester".to_string(),
                password: String::new(),
            },
        );
        Backend::Remote(Arc::new(session))
    }

    #[tokio::test]
    async fn upsert_and_get() {
        let registry = SessionRegistry::new();
        let backend = remote_backend("a");

        registry.upsert("a".to_string(), backend.clone()).await;
        assert!(registry.contains(&"a".to_string()));
        assert_eq!(registry.count(), 1);

        let fetched = registry.get(&"a".to_string()).unwrap();
        assert_eq!(fetched.instance(), backend.instance());
    }

    #[tokio::test]
    async fn upsert_tears_down_previous_backend() {
        let registry = SessionRegistry::new();
        let first = remote_backend("a");
        let second = remote_backend("a");

        registry.upsert("a".to_string(), first.clone()).await;
        registry.upsert("a".to_string(), second.clone()).await;

        assert!(first.as_remote().unwrap().is_torn_down());
        assert!(!second.as_remote().unwrap().is_torn_down());

        let current = registry.get(&"a".to_string()).unwrap();
        assert_eq!(current.instance(), second.instance());
        assert_eq!(registry.count(), 1);
    }

    #[tokio::test]
    async fn remove_returns_backend() {
        let registry = SessionRegistry::new();
        registry.upsert("a".to_string(), remote_backend("a")).await;

        assert!(registry.remove(&"a".to_string()).is_some());
        assert!(!registry.contains(&"a".to_string()));
        assert!(registry.remove(&"a".to_string()).is_none());
    }

    #[tokio::test]
    async fn remove_if_instance_spares_replacements() {
        let registry = SessionRegistry::new();
        let first = remote_backend("a");
        let second = remote_backend("a");

        registry.upsert("a".to_string(), first.clone()).await;
        registry.upsert("a".to_string(), second.clone()).await;

        // The first backend's late self-removal must not evict its successor.
        assert!(!registry.remove_if_instance(&"a".to_string(), first.instance()));
        assert!(registry.contains(&"a".to_string()));

        assert!(registry.remove_if_instance(&"a".to_string(), second.instance()));
        assert!(!registry.contains(&"a".to_string()));
    }

    #[tokio::test]
    async fn ids_lists_all_sessions() {
        let registry = SessionRegistry::new();
        registry.upsert("a".to_string(), remote_backend("a")).await;
        registry.upsert("b".to_string(), remote_backend("b")).await;

        let mut ids = registry.ids();
        ids.sort();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
    }
}

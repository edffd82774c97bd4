//! Session lifecycle management.
//!
//! A session is a logical client attachment created by the engine on
//! `initialize` and destroyed on disconnect, explicit `DELETE`, or engine
//! disposal. Connect and disconnect events are published on a broadcast
//! channel so subscribers (operation cleanup, observability hooks) see each
//! event at least once; slow subscribers may observe lag on the bounded
//! buffer.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

/// Bounded capacity of the session event channel.
const EVENT_CAPACITY: usize = 64;

/// A connected client session. Immutable after creation.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: Uuid,
    pub connected_at: DateTime<Utc>,
    /// Opaque client-supplied identity map.
    pub client_info: Value,
    pub protocol_version: String,
}

/// Session lifecycle events.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Connected(Session),
    Disconnected(Uuid),
}

/// Tracks active sessions and their transport bindings.
pub struct SessionManager {
    sessions: RwLock<HashMap<Uuid, Session>>,
    /// Many-to-one transport-id to session-id bindings.
    transports: RwLock<HashMap<String, Uuid>>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionManager {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            sessions: RwLock::new(HashMap::new()),
            transports: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Allocate a fresh session and publish a connect event.
    pub async fn create(&self, client_info: Value, protocol_version: impl Into<String>) -> Session {
        let session = Session {
            id: Uuid::new_v4(),
            connected_at: Utc::now(),
            client_info,
            protocol_version: protocol_version.into(),
        };

        self.sessions
            .write()
            .await
            .insert(session.id, session.clone());
        let _ = self.events.send(SessionEvent::Connected(session.clone()));

        info!(session_id = %session.id, "session created");
        session
    }

    /// Bind a transport connection to a session. Later messages tagged with
    /// `transport_id` resolve to this session.
    pub async fn map_transport(&self, transport_id: &str, session_id: Uuid) {
        debug!(%transport_id, %session_id, "transport bound to session");
        self.transports
            .write()
            .await
            .insert(transport_id.to_string(), session_id);
    }

    /// End a session: remove it, drop every transport binding pointing at
    /// it, and publish a disconnect event. Ending an unknown id is a no-op.
    pub async fn end(&self, session_id: Uuid) {
        let removed = self.sessions.write().await.remove(&session_id);
        if removed.is_none() {
            return;
        }

        self.transports
            .write()
            .await
            .retain(|_, sid| *sid != session_id);
        let _ = self.events.send(SessionEvent::Disconnected(session_id));

        info!(%session_id, "session ended");
    }

    pub async fn get(&self, session_id: Uuid) -> Option<Session> {
        self.sessions.read().await.get(&session_id).cloned()
    }

    pub async fn get_by_transport(&self, transport_id: &str) -> Option<Session> {
        let session_id = *self.transports.read().await.get(transport_id)?;
        self.get(session_id).await
    }

    pub async fn contains(&self, session_id: Uuid) -> bool {
        self.sessions.read().await.contains_key(&session_id)
    }

    /// Validate a raw session-id header value. Anything that is not a UUID
    /// of a live session is unknown.
    pub async fn contains_raw(&self, raw: &str) -> bool {
        match Uuid::parse_str(raw) {
            Ok(id) => self.contains(id).await,
            Err(_) => false,
        }
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Snapshot of the live session ids.
    pub async fn session_ids(&self) -> Vec<Uuid> {
        self.sessions.read().await.keys().copied().collect()
    }

    /// Subscribe to connect/disconnect events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_create_and_get() {
        let manager = SessionManager::new();
        let session = manager.create(json!({"name": "x"}), "2025-03-26").await;

        let found = manager.get(session.id).await.unwrap();
        assert_eq!(found.id, session.id);
        assert_eq!(found.protocol_version, "2025-03-26");
        assert_eq!(manager.session_count().await, 1);
    }

    #[tokio::test]
    async fn test_session_ids_unique() {
        let manager = SessionManager::new();
        let a = manager.create(Value::Null, "2025-03-26").await;
        let b = manager.create(Value::Null, "2025-03-26").await;
        assert_ne!(a.id, b.id);
    }

    #[tokio::test]
    async fn test_transport_binding_resolves() {
        let manager = SessionManager::new();
        let session = manager.create(Value::Null, "2025-03-26").await;
        manager.map_transport("conn-1", session.id).await;
        manager.map_transport("conn-2", session.id).await;

        let found = manager.get_by_transport("conn-1").await.unwrap();
        assert_eq!(found.id, session.id);
        assert!(manager.get_by_transport("conn-3").await.is_none());
    }

    #[tokio::test]
    async fn test_end_removes_transport_bindings() {
        let manager = SessionManager::new();
        let session = manager.create(Value::Null, "2025-03-26").await;
        manager.map_transport("conn-1", session.id).await;

        manager.end(session.id).await;

        assert!(manager.get(session.id).await.is_none());
        assert!(manager.get_by_transport("conn-1").await.is_none());
    }

    #[tokio::test]
    async fn test_end_unknown_is_noop() {
        let manager = SessionManager::new();
        let mut events = manager.subscribe();

        manager.end(Uuid::new_v4()).await;

        // No event published for an unknown id.
        assert!(matches!(
            events.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn test_events_published() {
        let manager = SessionManager::new();
        let mut events = manager.subscribe();

        let session = manager.create(Value::Null, "2025-03-26").await;
        manager.end(session.id).await;

        match events.recv().await.unwrap() {
            SessionEvent::Connected(s) => assert_eq!(s.id, session.id),
            other => panic!("expected Connected, got {other:?}"),
        }
        match events.recv().await.unwrap() {
            SessionEvent::Disconnected(id) => assert_eq!(id, session.id),
            other => panic!("expected Disconnected, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_contains_raw() {
        let manager = SessionManager::new();
        let session = manager.create(Value::Null, "2025-03-26").await;

        assert!(manager.contains_raw(&session.id.to_string()).await);
        assert!(!manager.contains_raw("00000000-0000-0000-0000-000000000000").await);
        assert!(!manager.contains_raw("not-a-uuid").await);
    }
}

//! Per-client connection state and primary-ownership bookkeeping
//! (§4.4.2).

use std::collections::HashMap;

use axum::extract::ws::Message;
use tokio::sync::mpsc;

use crate::protocol::{ClientMode, DeviceType};

/// Handle a broker task uses to push a frame to one client's socket.
pub struct ClientHandle {
    /// Stable id assigned at auth time.
    pub id: String,
    /// Outbound channel to this client's writer task.
    pub sender: mpsc::UnboundedSender<Message>,
    /// The session this client is currently viewing.
    pub active_session_id: Option<String>,
    /// `chat` or `terminal`; gates `raw` delivery.
    pub mode: ClientMode,
    /// Declared device name, if any.
    pub device_name: Option<String>,
    /// Declared device type.
    pub device_type: DeviceType,
}

/// Tracks every connected client and, per session, which client is primary.
#[derive(Default)]
pub struct ClientRegistry {
    clients: HashMap<String, ClientHandle>,
    primary_by_session: HashMap<String, String>,
}

impl ClientRegistry {
    /// Build an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a newly authenticated client.
    pub fn insert(&mut self, client: ClientHandle) {
        self.clients.insert(client.id.clone(), client);
    }

    /// Remove a client on disconnect, clearing any primary ownership it
    /// held. Returns the sessions whose primary just cleared.
    pub fn remove(&mut self, client_id: &str) -> Vec<String> {
        self.clients.remove(client_id);
        let cleared: Vec<String> = self
            .primary_by_session
            .iter()
            .filter(|(_, owner)| owner.as_str() == client_id)
            .map(|(session_id, _)| session_id.clone())
            .collect();
        for session_id in &cleared {
            self.primary_by_session.remove(session_id);
        }
        cleared
    }

    /// Set `client_id` as primary for `session_id`, displacing any prior owner.
    pub fn set_primary(&mut self, session_id: &str, client_id: &str) {
        self.primary_by_session
            .insert(session_id.to_string(), client_id.to_string());
    }

    /// The current primary for `session_id`, if any.
    #[must_use]
    pub fn primary_of(&self, session_id: &str) -> Option<&str> {
        self.primary_by_session.get(session_id).map(String::as_str)
    }

    /// True iff `client_id` is primary for `session_id` — governs whether
    /// `input`/`interrupt` from that client are accepted (§4.4.2).
    #[must_use]
    pub fn is_primary(&self, session_id: &str, client_id: &str) -> bool {
        self.primary_of(session_id) == Some(client_id)
    }

    /// Every connected client's handle.
    pub fn iter(&self) -> impl Iterator<Item = &ClientHandle> {
        self.clients.values()
    }

    /// Mutable access to one client, for updating `active_session_id`/`mode`.
    pub fn get_mut(&mut self, client_id: &str) -> Option<&mut ClientHandle> {
        self.clients.get_mut(client_id)
    }

    /// Number of connected clients.
    #[must_use]
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// True if no clients are connected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(id: &str) -> ClientHandle {
        let (tx, _rx) = mpsc::unbounded_channel();
        ClientHandle {
            id: id.to_string(),
            sender: tx,
            active_session_id: None,
            mode: ClientMode::Chat,
            device_name: None,
            device_type: DeviceType::Unknown,
        }
    }

    #[test]
    fn set_primary_then_is_primary_reflects_ownership() {
        let mut registry = ClientRegistry::new();
        registry.insert(handle("c1"));
        registry.set_primary("s1", "c1");
        assert!(registry.is_primary("s1", "c1"));
        assert!(!registry.is_primary("s1", "c2"));
    }

    #[test]
    fn remove_clears_primary_ownership() {
        let mut registry = ClientRegistry::new();
        registry.insert(handle("c1"));
        registry.set_primary("s1", "c1");
        let cleared = registry.remove("c1");
        assert_eq!(cleared, vec!["s1".to_string()]);
        assert_eq!(registry.primary_of("s1"), None);
    }

    #[test]
    fn no_client_is_primary_once_ownership_is_cleared() {
        let mut registry = ClientRegistry::new();
        registry.insert(handle("c1"));
        registry.insert(handle("c2"));
        registry.set_primary("s1", "c1");
        registry.remove("c1");
        assert!(!registry.is_primary("s1", "c1"));
        assert!(!registry.is_primary("s1", "c2"));
        registry.set_primary("s1", "c2");
        assert!(registry.is_primary("s1", "c2"));
    }

    #[test]
    fn set_primary_displaces_previous_owner() {
        let mut registry = ClientRegistry::new();
        registry.insert(handle("c1"));
        registry.insert(handle("c2"));
        registry.set_primary("s1", "c1");
        registry.set_primary("s1", "c2");
        assert!(!registry.is_primary("s1", "c1"));
        assert!(registry.is_primary("s1", "c2"));
    }
}

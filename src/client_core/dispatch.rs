//! Resilient inbound message dispatcher (§4.5.3): a single table mapping
//! `type` to a handler, never panicking on a malformed frame.

use std::collections::HashMap;

use serde_json::Value;

/// A client-store mutation triggered by one inbound message. Intentionally
/// coarse — the concrete UI store on the other side owns interpreting it.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientAction {
    /// Replace the legacy single-session primary client id.
    SetLegacyPrimaryClientId(Option<String>),
    /// Update `sessionId`-scoped primary client id.
    SetSessionPrimaryClientId { session_id: String, client_id: Option<String> },
    /// A client joined; dedup-keyed by `clientId`.
    ClientJoined { client_id: String, device_name: Option<String> },
    /// A client left.
    ClientLeft { client_id: String },
    /// A directory listing arrived; invoke the one-shot callback.
    DirectoryListing { entries: Vec<String>, error: Option<String> },
    /// Anything else: forwarded verbatim for the store to interpret.
    Forward { event_type: String, payload: Value },
}

/// Signature for a per-type handler.
pub type InboundHandler = fn(&Value) -> Option<ClientAction>;

/// Maps inbound `type` strings to handlers, tolerating anything
/// malformed by producing no action rather than erroring.
pub struct Dispatcher {
    handlers: HashMap<&'static str, InboundHandler>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::with_default_handlers()
    }
}

impl Dispatcher {
    /// Build an empty dispatcher.
    #[must_use]
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register `handler` for `message_type`.
    pub fn register(&mut self, message_type: &'static str, handler: InboundHandler) {
        self.handlers.insert(message_type, handler);
    }

    /// Dispatch one already-deserialized JSON frame. A missing or
    /// non-string `type` produces `None`; a `type` with no registered
    /// handler falls back to [`ClientAction::Forward`] rather than being
    /// dropped, so agent/session event types the table doesn't special-case
    /// still reach the store.
    #[must_use]
    pub fn dispatch(&self, frame: &Value) -> Option<ClientAction> {
        let message_type = frame.get("type")?.as_str()?;
        match self.handlers.get(message_type) {
            Some(handler) => handler(frame),
            None => Some(ClientAction::Forward {
                event_type: message_type.to_string(),
                payload: frame.clone(),
            }),
        }
    }

    /// A dispatcher pre-registered with the handlers named in §4.5.3.
    #[must_use]
    pub fn with_default_handlers() -> Self {
        let mut d = Self::new();
        d.register("primary_changed", handle_primary_changed);
        d.register("client_joined", handle_client_joined);
        d.register("client_left", handle_client_left);
        d.register("directory_listing", handle_directory_listing);
        d
    }
}

fn handle_primary_changed(frame: &Value) -> Option<ClientAction> {
    let session_id = frame.get("sessionId").and_then(Value::as_str);
    let client_id = frame
        .get("clientId")
        .and_then(|v| if v.is_null() { Some(None) } else { v.as_str().map(|s| Some(s.to_string())) })
        .flatten();

    match session_id {
        None | Some("default") => Some(ClientAction::SetLegacyPrimaryClientId(client_id)),
        Some(other) => Some(ClientAction::SetSessionPrimaryClientId {
            session_id: other.to_string(),
            client_id,
        }),
    }
}

fn handle_client_joined(frame: &Value) -> Option<ClientAction> {
    let client_id = frame.get("clientId")?.as_str()?.to_string();
    let device_name = frame
        .get("deviceName")
        .and_then(Value::as_str)
        .map(str::to_string);
    Some(ClientAction::ClientJoined {
        client_id,
        device_name,
    })
}

fn handle_client_left(frame: &Value) -> Option<ClientAction> {
    // A non-string clientId is a no-op, not a crash (§4.5.3).
    let client_id = frame.get("clientId")?.as_str()?.to_string();
    Some(ClientAction::ClientLeft { client_id })
}

fn handle_directory_listing(frame: &Value) -> Option<ClientAction> {
    let entries = frame
        .get("entries")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    let error = frame
        .get("error")
        .and_then(Value::as_str)
        .map(str::to_string);
    Some(ClientAction::DirectoryListing { entries, error })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_type_is_silently_skipped() {
        let dispatcher = Dispatcher::with_default_handlers();
        assert_eq!(dispatcher.dispatch(&json!({"clientId": "c1"})), None);
    }

    #[test]
    fn unknown_type_is_forwarded_verbatim() {
        let dispatcher = Dispatcher::with_default_handlers();
        let frame = json!({"type": "something_new", "foo": "bar"});
        let action = dispatcher.dispatch(&frame).expect("forwarded");
        assert_eq!(
            action,
            ClientAction::Forward {
                event_type: "something_new".to_string(),
                payload: frame
            }
        );
    }

    #[test]
    fn client_left_with_non_string_client_id_is_a_no_op() {
        let dispatcher = Dispatcher::with_default_handlers();
        assert_eq!(
            dispatcher.dispatch(&json!({"type": "client_left", "clientId": 42})),
            None
        );
    }

    #[test]
    fn primary_changed_absent_session_id_maps_to_legacy_field() {
        let dispatcher = Dispatcher::with_default_handlers();
        let action = dispatcher
            .dispatch(&json!({"type": "primary_changed", "clientId": "c1"}))
            .expect("handled");
        assert_eq!(action, ClientAction::SetLegacyPrimaryClientId(Some("c1".to_string())));
    }

    #[test]
    fn primary_changed_with_default_session_id_maps_to_legacy_field() {
        let dispatcher = Dispatcher::with_default_handlers();
        let action = dispatcher
            .dispatch(&json!({"type": "primary_changed", "sessionId": "default", "clientId": null}))
            .expect("handled");
        assert_eq!(action, ClientAction::SetLegacyPrimaryClientId(None));
    }

    #[test]
    fn primary_changed_with_other_session_id_does_not_clobber_legacy_state() {
        let dispatcher = Dispatcher::with_default_handlers();
        let action = dispatcher
            .dispatch(&json!({"type": "primary_changed", "sessionId": "sess-2", "clientId": "c9"}))
            .expect("handled");
        assert_eq!(
            action,
            ClientAction::SetSessionPrimaryClientId {
                session_id: "sess-2".to_string(),
                client_id: Some("c9".to_string())
            }
        );
    }

    #[test]
    fn client_joined_dedup_key_is_client_id() {
        let dispatcher = Dispatcher::with_default_handlers();
        let action = dispatcher
            .dispatch(&json!({"type": "client_joined", "clientId": "c1", "deviceName": "phone"}))
            .expect("handled");
        assert_eq!(
            action,
            ClientAction::ClientJoined {
                client_id: "c1".to_string(),
                device_name: Some("phone".to_string())
            }
        );
    }

    #[test]
    fn directory_listing_type_coerces_entries_and_error() {
        let dispatcher = Dispatcher::with_default_handlers();
        let action = dispatcher
            .dispatch(&json!({"type": "directory_listing", "entries": ["a", 1, "b"]}))
            .expect("handled");
        assert_eq!(
            action,
            ClientAction::DirectoryListing {
                entries: vec!["a".to_string(), "b".to_string()],
                error: None
            }
        );
    }
}

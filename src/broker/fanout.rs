//! Pure fan-out routing decisions (§4.4.4), kept free of any socket I/O
//! so the policy table is unit-testable.

/// A minimal view of one connected client, enough to decide fan-out.
#[derive(Debug, Clone, Copy)]
pub struct ClientView<'a> {
    /// The session this client is currently viewing.
    pub active_session_id: Option<&'a str>,
    /// Whether this client is in `terminal` mode (receives `raw`).
    pub is_terminal_mode: bool,
}

/// Broad classification of an outbound agent event, enough to decide
/// who it's delivered to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanoutClass {
    /// `message`, `stream_*`, `tool_*`, `result`, `error`,
    /// `permission_request`, `user_question`: every authenticated client.
    Broadcast,
    /// `raw`: only the foreground terminal client for that session.
    RawForegroundOnly,
    /// `agent_busy`/`agent_idle`: every client, plus a `session_list` re-broadcast.
    BusyIdleTransition,
    /// `status_update`: every authenticated client.
    StatusUpdate,
}

/// Classify a Session Manager event name per the §4.4.4 table.
#[must_use]
pub fn classify(event_name: &str) -> FanoutClass {
    match event_name {
        "raw" => FanoutClass::RawForegroundOnly,
        "agent_busy" | "agent_idle" => FanoutClass::BusyIdleTransition,
        "status_update" => FanoutClass::StatusUpdate,
        _ => FanoutClass::Broadcast,
    }
}

/// Decide whether `client` should receive an event of `class` for `session_id`.
#[must_use]
pub fn should_deliver(class: FanoutClass, session_id: &str, client: ClientView<'_>) -> bool {
    match class {
        FanoutClass::RawForegroundOnly => {
            client.is_terminal_mode && client.active_session_id == Some(session_id)
        }
        FanoutClass::Broadcast | FanoutClass::BusyIdleTransition | FanoutClass::StatusUpdate => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_only_reaches_foreground_terminal_clients() {
        let foreground_terminal = ClientView {
            active_session_id: Some("s1"),
            is_terminal_mode: true,
        };
        let foreground_chat = ClientView {
            active_session_id: Some("s1"),
            is_terminal_mode: false,
        };
        let background_terminal = ClientView {
            active_session_id: Some("s2"),
            is_terminal_mode: true,
        };

        let class = classify("raw");
        assert!(should_deliver(class, "s1", foreground_terminal));
        assert!(!should_deliver(class, "s1", foreground_chat));
        assert!(!should_deliver(class, "s1", background_terminal));
    }

    #[test]
    fn everything_else_broadcasts_to_all_clients() {
        let any_client = ClientView {
            active_session_id: None,
            is_terminal_mode: false,
        };
        for event in ["message", "stream_delta", "tool_call", "result", "error"] {
            assert!(should_deliver(classify(event), "s1", any_client));
        }
    }

    #[test]
    fn busy_idle_and_status_update_always_broadcast() {
        let any_client = ClientView {
            active_session_id: None,
            is_terminal_mode: false,
        };
        assert_eq!(classify("agent_busy"), FanoutClass::BusyIdleTransition);
        assert_eq!(classify("agent_idle"), FanoutClass::BusyIdleTransition);
        assert_eq!(classify("status_update"), FanoutClass::StatusUpdate);
        assert!(should_deliver(classify("agent_busy"), "s1", any_client));
        assert!(should_deliver(classify("status_update"), "s1", any_client));
    }
}

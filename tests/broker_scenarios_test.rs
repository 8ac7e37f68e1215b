//! Composed scenario tests over the broker's pure decision tables
//! (`ClientRegistry` ownership, `fanout::classify`/`should_deliver`)
//! without standing up a real `axum` server — these exercise the same
//! logic `ws.rs` drives, just without the socket plumbing.

use tokio::sync::mpsc;

use stationhub::broker::client::{ClientHandle, ClientRegistry};
use stationhub::broker::fanout::{classify, should_deliver, ClientView};
use stationhub::protocol::{ClientMode, DeviceType};

fn handle(id: &str, mode: ClientMode, active_session_id: Option<&str>) -> ClientHandle {
    let (tx, _rx) = mpsc::unbounded_channel();
    ClientHandle {
        id: id.to_string(),
        sender: tx,
        active_session_id: active_session_id.map(str::to_string),
        mode,
        device_name: None,
        device_type: DeviceType::Unknown,
    }
}

/// Primary gating end to end: the creator drives the session, a second
/// client is rejected until the first disconnects and hands off.
#[test]
fn primary_gating_across_a_disconnect_and_handoff() {
    let mut registry = ClientRegistry::new();
    registry.insert(handle("creator", ClientMode::Chat, Some("sess-1")));
    registry.insert(handle("watcher", ClientMode::Chat, Some("sess-1")));

    // Session creation grants primary automatically.
    registry.set_primary("sess-1", "creator");
    assert!(registry.is_primary("sess-1", "creator"));
    assert!(!registry.is_primary("sess-1", "watcher"));

    // The creator disconnects: ownership clears for everyone, not just them.
    let cleared = registry.remove("creator");
    assert_eq!(cleared, vec!["sess-1".to_string()]);
    assert!(!registry.is_primary("sess-1", "watcher"));

    // The watcher explicitly claims primary via `set_primary`.
    registry.set_primary("sess-1", "watcher");
    assert!(registry.is_primary("sess-1", "watcher"));
}

/// `raw` terminal output only reaches the one foreground client that is
/// in terminal mode and viewing the emitting session; everyone else
/// (chat-mode clients, clients viewing a different session) is skipped,
/// while a non-`raw` event like `message` reaches every connected client.
#[test]
fn raw_fanout_reaches_only_the_foreground_terminal_client() {
    let foreground_terminal = handle("term-1", ClientMode::Terminal, Some("sess-1"));
    let foreground_chat = handle("chat-1", ClientMode::Chat, Some("sess-1"));
    let background_terminal = handle("term-2", ClientMode::Terminal, Some("sess-2"));

    let views = [&foreground_terminal, &foreground_chat, &background_terminal].map(|c| ClientView {
        active_session_id: c.active_session_id.as_deref(),
        is_terminal_mode: c.mode == ClientMode::Terminal,
    });

    let raw_class = classify("raw");
    let deliveries: Vec<bool> = views
        .iter()
        .map(|v| should_deliver(raw_class, "sess-1", *v))
        .collect();
    assert_eq!(deliveries, vec![true, false, false]);

    let broadcast_class = classify("message");
    let broadcasts: Vec<bool> = views
        .iter()
        .map(|v| should_deliver(broadcast_class, "sess-1", *v))
        .collect();
    assert_eq!(broadcasts, vec![true, true, true]);
}

/// Two sessions with independent primaries: owning one session confers
/// no rights over the other.
#[test]
fn primary_ownership_is_scoped_per_session() {
    let mut registry = ClientRegistry::new();
    registry.insert(handle("alice", ClientMode::Chat, Some("sess-1")));
    registry.insert(handle("bob", ClientMode::Chat, Some("sess-2")));

    registry.set_primary("sess-1", "alice");
    registry.set_primary("sess-2", "bob");

    assert!(registry.is_primary("sess-1", "alice"));
    assert!(!registry.is_primary("sess-2", "alice"));
    assert!(registry.is_primary("sess-2", "bob"));
    assert!(!registry.is_primary("sess-1", "bob"));

    // Bob disconnecting only clears sess-2's ownership.
    let cleared = registry.remove("bob");
    assert_eq!(cleared, vec!["sess-2".to_string()]);
    assert!(registry.is_primary("sess-1", "alice"));
}

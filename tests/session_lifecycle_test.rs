//! End-to-end session lifecycle: attach, busy/idle fan-out, replay
//! history, persist/restore across a simulated restart, destroy_all.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;
use stationhub::protocol::SessionKind;
use stationhub::session::{
    AgentEvent, FakeAgentSourceFactory, SessionManager, SpawnSpec, EVENT_AGENT_BUSY,
    EVENT_AGENT_IDLE,
};

fn spec(source: &str) -> SpawnSpec {
    SpawnSpec {
        external_source: source.to_string(),
        name: format!("session-{source}"),
        cwd: PathBuf::from("/tmp"),
        kind: SessionKind::InteractiveAgent,
        model: Some("default".to_string()),
        permission_mode: Some("acceptEdits".to_string()),
        resume_token: None,
    }
}

#[tokio::test]
async fn multiple_sessions_track_busy_state_independently_and_fan_out_events() {
    let mgr = SessionManager::new(5, Arc::new(FakeAgentSourceFactory));
    let mut subscriber = mgr.subscribe();

    let a = mgr.attach_session(spec("a")).await.expect("attach a");
    let b = mgr.attach_session(spec("b")).await.expect("attach b");
    assert_eq!(mgr.list_sessions().await.len(), 2);

    mgr.record_event(AgentEvent {
        session_id: a.clone(),
        event_name: EVENT_AGENT_BUSY.to_string(),
        payload: Value::Null,
    })
    .await;

    let sessions = mgr.list_sessions().await;
    let a_snapshot = sessions.iter().find(|s| s.id == a).unwrap();
    let b_snapshot = sessions.iter().find(|s| s.id == b).unwrap();
    assert!(a_snapshot.is_busy, "a went busy");
    assert!(!b_snapshot.is_busy, "b is unaffected by a's transition");
    assert!(!mgr.all_idle().await);

    let received = subscriber.recv().await.expect("fan-out delivers the event");
    assert_eq!(received.session_id, a);
    assert_eq!(received.event_name, EVENT_AGENT_BUSY);

    mgr.record_event(AgentEvent {
        session_id: a,
        event_name: EVENT_AGENT_IDLE.to_string(),
        payload: Value::Null,
    })
    .await;
    assert!(mgr.all_idle().await);
}

#[tokio::test]
async fn attach_session_rejects_duplicate_source_and_limit_across_the_manager() {
    let mgr = SessionManager::new(1, Arc::new(FakeAgentSourceFactory));
    mgr.attach_session(spec("a")).await.expect("first attach succeeds");

    let limited = mgr.attach_session(spec("b")).await;
    assert!(limited.is_err(), "a second session exceeds max_sessions");

    mgr.destroy_all().await;
    assert!(mgr.list_sessions().await.is_empty());
    // The slot is free again after destroy_all.
    mgr.attach_session(spec("b")).await.expect("slot freed after destroy_all");
}

#[tokio::test]
async fn session_state_persists_across_a_simulated_restart() {
    let mgr = SessionManager::new(5, Arc::new(FakeAgentSourceFactory));
    mgr.attach_session(spec("a")).await.expect("attach");

    let dir = tempfile::tempdir().expect("tempdir");
    let state_path = dir.path().join("session-state.json");
    mgr.serialize_state(&state_path).await.expect("serialize");

    let restored = SessionManager::restore_state(&state_path).expect("state file readable");
    assert_eq!(restored.sessions.len(), 1);
    assert_eq!(restored.sessions[0].name, "session-a");
    assert_eq!(restored.sessions[0].model.as_deref(), Some("default"));

    // A fresh manager (as if the process had just restarted) can use the
    // restored token to re-attach the same external source.
    let fresh = SessionManager::new(5, Arc::new(FakeAgentSourceFactory));
    let mut resumed_spec = spec("a");
    resumed_spec.resume_token = restored.sessions[0].external_resume_token.clone();
    fresh.attach_session(resumed_spec).await.expect("re-attach after restart");
    assert_eq!(fresh.list_sessions().await.len(), 1);
}

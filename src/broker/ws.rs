//! The `/ws` upgrade endpoint: auth handshake, the per-connection
//! read/write loop, and agent-event fan-out (§4.4.1–§4.4.5).

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::{Stream, SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::protocol::{
    self, ClientMode, ConnectedClient, Inbound, Outbound, PermissionDecision, ServerMode,
    SessionSummary, CLOSE_SERVER_SHUTTING_DOWN,
};
use crate::session::{AgentEvent, SpawnSpec};

use super::client::ClientHandle;
use super::fanout::{classify, should_deliver, ClientView};
use super::validate::is_valid_external_source;
use super::AppState;

/// `GET /ws` — upgrade to a WebSocket and hand off to [`handle_socket`].
pub async fn upgrade(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

fn encode(message: &Outbound) -> Message {
    Message::Text(serde_json::to_string(message).expect("Outbound always serializes"))
}

/// Send `message` to one client, dropping silently if it has disconnected.
pub async fn send_to(state: &AppState, client_id: &str, message: &Outbound) {
    let registry = state.registry.lock().await;
    if let Some(client) = registry.iter().find(|c| c.id == client_id) {
        let _ = client.sender.send(encode(message));
    }
}

/// Send `message` to every connected client.
pub async fn broadcast_to_all(state: &AppState, message: &Outbound) {
    let registry = state.registry.lock().await;
    let frame = encode(message);
    for client in registry.iter() {
        let _ = client.sender.send(frame.clone());
    }
}

async fn session_list(state: &AppState) -> Vec<SessionSummary> {
    state
        .sessions
        .list_sessions()
        .await
        .into_iter()
        .map(|s| SessionSummary {
            id: s.id,
            name: s.name,
            cwd: s.cwd.display().to_string(),
            kind: s.kind,
            is_busy: s.is_busy,
        })
        .collect()
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let mut shutdown_rx = state.shutdown_tx.subscribe();

    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Some(msg) => { if sink.send(msg).await.is_err() { break; } }
                        None => break,
                    }
                }
                _ = shutdown_rx.recv() => {
                    let _ = sink.send(encode(&Outbound::ServerShuttingDown {})).await;
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code: CLOSE_SERVER_SHUTTING_DOWN,
                            reason: "server restarting".into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    let Some(client_id) = authenticate(&state, &mut stream, &tx).await else {
        let _ = tx.send(Message::Close(None));
        writer.abort();
        return;
    };

    register_client(&state, &client_id, tx).await;
    send_post_auth_sequence(&state, &client_id).await;
    broadcast_to_all(
        &state,
        &Outbound::ClientJoined {
            client_id: client_id.clone(),
            device_name: String::new(),
            device_type: protocol::DeviceType::Unknown,
        },
    )
    .await;

    while let Some(Ok(msg)) = stream.next().await {
        match msg {
            Message::Text(text) => handle_inbound_text(&state, &client_id, &text).await,
            Message::Close(_) => break,
            _ => {}
        }
    }

    let cleared_sessions = {
        let mut registry = state.registry.lock().await;
        registry.remove(&client_id)
    };
    for session_id in cleared_sessions {
        broadcast_to_all(
            &state,
            &Outbound::PrimaryChanged {
                session_id,
                client_id: None,
            },
        )
        .await;
    }
    broadcast_to_all(&state, &Outbound::ClientLeft { client_id }).await;
    writer.abort();
}

async fn authenticate(
    state: &AppState,
    stream: &mut (impl Stream<Item = Result<Message, axum::Error>> + Unpin),
    tx: &mpsc::UnboundedSender<Message>,
) -> Option<String> {
    if !state.config.auth_required {
        return Some(state.alloc_client_id());
    }

    let Some(Ok(Message::Text(text))) = stream.next().await else {
        let _ = tx.send(encode(&Outbound::AuthFail {
            reason: "auth_required".to_string(),
        }));
        return None;
    };

    match protocol::parse_inbound(&text) {
        Some(Inbound::Auth { token }) => {
            if state.config.api_token.as_deref() == Some(token.as_str()) {
                Some(state.alloc_client_id())
            } else {
                let _ = tx.send(encode(&Outbound::AuthFail {
                    reason: "invalid_token".to_string(),
                }));
                None
            }
        }
        _ => {
            let _ = tx.send(encode(&Outbound::AuthFail {
                reason: "auth_required".to_string(),
            }));
            None
        }
    }
}

async fn register_client(state: &AppState, client_id: &str, sender: mpsc::UnboundedSender<Message>) {
    let mut registry = state.registry.lock().await;
    registry.insert(ClientHandle {
        id: client_id.to_string(),
        sender,
        active_session_id: None,
        mode: ClientMode::Chat,
        device_name: None,
        device_type: protocol::DeviceType::Unknown,
    });
}

async fn send_post_auth_sequence(state: &AppState, client_id: &str) {
    let connected_clients: Vec<ConnectedClient> = {
        let registry = state.registry.lock().await;
        registry
            .iter()
            .map(|c| ConnectedClient {
                client_id: c.id.clone(),
                device_name: c.device_name.clone().unwrap_or_default(),
                device_type: c.device_type,
            })
            .collect()
    };

    send_to(
        state,
        client_id,
        &Outbound::AuthOk {
            client_id: client_id.to_string(),
            server_mode: ServerMode::Cli,
            server_version: state.server_version.clone(),
            cwd: state
                .config
                .cwd
                .clone()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            connected_clients,
            protocol_version: protocol::PROTOCOL_VERSION,
        },
    )
    .await;

    send_to(state, client_id, &Outbound::ServerMode { mode: ServerMode::Cli }).await;
    send_to(
        state,
        client_id,
        &Outbound::Status {
            fields: serde_json::json!({}),
        },
    )
    .await;

    let sessions = session_list(state).await;
    if sessions.len() > 1 {
        send_to(state, client_id, &Outbound::SessionList { sessions: sessions.clone() }).await;
    }
    if let Some(first) = sessions.first() {
        send_to(
            state,
            client_id,
            &Outbound::SessionSwitched {
                session_id: first.id.clone(),
            },
        )
        .await;
    }

    send_to(
        state,
        client_id,
        &Outbound::AvailableModels {
            models: vec!["default".to_string()],
        },
    )
    .await;
    send_to(
        state,
        client_id,
        &Outbound::AvailablePermissionModes {
            modes: vec!["default".to_string()],
        },
    )
    .await;
}

async fn handle_inbound_text(state: &Arc<AppState>, client_id: &str, text: &str) {
    let Some(message) = protocol::parse_inbound(text) else {
        log::debug!("[broker] dropping malformed inbound frame from {client_id}");
        return;
    };

    match message {
        Inbound::Auth { .. } => {
            // Only meaningful as the first message; a later one is ignored (§4.4.1).
        }
        Inbound::Input { session_id, text } => {
            if let Some(session_id) = resolve_session(state, client_id, session_id).await {
                if !client_is_primary(state, &session_id, client_id).await {
                    send_to(state, client_id, &Outbound::Error {
                        message: "not_primary".to_string(),
                    })
                    .await;
                    return;
                }
                if let Err(e) = state.sessions.send_input(&session_id, &text).await {
                    send_to(state, client_id, &Outbound::SessionError { message: e.to_string() }).await;
                }
            }
        }
        Inbound::Interrupt { session_id } => {
            if let Some(session_id) = resolve_session(state, client_id, session_id).await {
                if !client_is_primary(state, &session_id, client_id).await {
                    send_to(state, client_id, &Outbound::Error {
                        message: "not_primary".to_string(),
                    })
                    .await;
                    return;
                }
                if let Err(e) = state.sessions.interrupt(&session_id).await {
                    send_to(state, client_id, &Outbound::SessionError { message: e.to_string() }).await;
                }
            }
        }
        Inbound::PermissionResponse { request_id, decision } => {
            resolve_permission(state, &request_id, decision).await;
        }
        Inbound::UserQuestionResponse { .. } => {
            // Forwarded to the owning session's agent by the out-of-process
            // agent bridge; no broker-local state to mutate.
        }
        Inbound::SetModel { model } => {
            if let Some(session_id) = active_session(state, client_id).await {
                let _ = state.sessions.set_model(&session_id, model).await;
            }
        }
        Inbound::SetPermissionMode { mode } => {
            if let Some(session_id) = active_session(state, client_id).await {
                let _ = state.sessions.set_permission_mode(&session_id, mode).await;
            }
        }
        Inbound::SetPrimary { session_id } => {
            {
                let mut registry = state.registry.lock().await;
                registry.set_primary(&session_id, client_id);
            }
            broadcast_to_all(
                state,
                &Outbound::PrimaryChanged {
                    session_id,
                    client_id: Some(client_id.to_string()),
                },
            )
            .await;
        }
        Inbound::SwitchSession { session_id } => {
            let mut registry = state.registry.lock().await;
            if let Some(client) = registry.get_mut(client_id) {
                client.active_session_id = Some(session_id);
            }
        }
        Inbound::AttachSession { external_source, name } => {
            attach_session(state, client_id, external_source, name).await;
        }
        Inbound::Resize { cols, rows } => {
            if let Some(session_id) = active_session(state, client_id).await {
                let _ = state.sessions.resize(&session_id, cols, rows).await;
            }
        }
        Inbound::Mode { mode } => {
            let mut registry = state.registry.lock().await;
            if let Some(client) = registry.get_mut(client_id) {
                client.mode = mode;
            }
        }
        Inbound::Unknown => {}
    }
}

async fn resolve_session(state: &Arc<AppState>, client_id: &str, explicit: Option<String>) -> Option<String> {
    match explicit {
        Some(id) => Some(id),
        None => active_session(state, client_id).await,
    }
}

async fn active_session(state: &Arc<AppState>, client_id: &str) -> Option<String> {
    let registry = state.registry.lock().await;
    registry
        .iter()
        .find(|c| c.id == client_id)
        .and_then(|c| c.active_session_id.clone())
}

async fn client_is_primary(state: &Arc<AppState>, session_id: &str, client_id: &str) -> bool {
    let registry = state.registry.lock().await;
    registry.is_primary(session_id, client_id)
}

async fn resolve_permission(state: &Arc<AppState>, request_id: &str, decision: PermissionDecision) {
    let waiter = state.permission_waiters.lock().await.remove(request_id);
    if let Some(waiter) = waiter {
        let _ = waiter.send(decision);
    }
    // Unknown request id: silently no-ops (§4.4.3).
}

async fn attach_session(
    state: &Arc<AppState>,
    client_id: &str,
    external_source: String,
    name: Option<String>,
) {
    if !is_valid_external_source(&external_source) {
        send_to(
            state,
            client_id,
            &Outbound::SessionError {
                message: "Invalid tmux session name".to_string(),
            },
        )
        .await;
        return;
    }

    let spec = SpawnSpec {
        external_source: external_source.clone(),
        name: name.unwrap_or(external_source),
        cwd: state.config.cwd.clone().unwrap_or_else(|| ".".into()),
        kind: crate::protocol::SessionKind::InteractiveAgent,
        model: state.config.model.clone(),
        permission_mode: state.config.permission_mode.clone(),
        resume_token: None,
    };

    match state.sessions.attach_session(spec).await {
        Ok(session_id) => {
            let mut registry = state.registry.lock().await;
            if let Some(client) = registry.get_mut(client_id) {
                client.active_session_id = Some(session_id.clone());
            }
            // The client that created the session drives it until it
            // disconnects or explicitly hands off via `set_primary`.
            registry.set_primary(&session_id, client_id);
            drop(registry);
            broadcast_to_all(state, &Outbound::SessionList { sessions: session_list(state).await }).await;
            send_to(state, client_id, &Outbound::SessionSwitched { session_id }).await;
        }
        Err(e) => {
            send_to(state, client_id, &Outbound::SessionError { message: e.to_string() }).await;
        }
    }
}

/// Map one [`AgentEvent`] onto the wire shape it fans out as. Split out
/// from [`dispatch_agent_event`] so the mapping is testable without a
/// live `AppState`.
#[must_use]
fn outbound_for_agent_event(event: &AgentEvent) -> Outbound {
    match event.event_name.as_str() {
        "raw" => Outbound::Raw {
            session_id: event.session_id.clone(),
            data: event.payload.as_str().unwrap_or_default().to_string(),
        },
        "agent_busy" => Outbound::AgentBusy {
            session_id: event.session_id.clone(),
        },
        "agent_idle" => Outbound::AgentIdle {
            session_id: event.session_id.clone(),
        },
        "status_update" => Outbound::StatusUpdate {
            fields: event.payload.clone(),
        },
        "user_question" => Outbound::UserQuestion {
            session_id: event.session_id.clone(),
            question: event
                .payload
                .get("question")
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default()
                .to_string(),
        },
        other => Outbound::Agent {
            session_id: event.session_id.clone(),
            event: other.to_string(),
            payload: event.payload.clone(),
        },
    }
}

/// Fan an [`AgentEvent`] out to the clients the §4.4.4 policy names.
pub async fn dispatch_agent_event(state: &Arc<AppState>, event: AgentEvent) {
    let class = classify(&event.event_name);
    let outbound = outbound_for_agent_event(&event);

    let registry = state.registry.lock().await;
    let frame = encode(&outbound);
    for client in registry.iter() {
        let view = ClientView {
            active_session_id: client.active_session_id.as_deref(),
            is_terminal_mode: client.mode == ClientMode::Terminal,
        };
        if should_deliver(class, &event.session_id, view) {
            let _ = client.sender.send(frame.clone());
        }
    }
    drop(registry);

    if matches!(class, super::fanout::FanoutClass::BusyIdleTransition) {
        broadcast_to_all(state, &Outbound::SessionList { sessions: session_list(state).await }).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn user_question_events_map_to_the_dedicated_wire_variant() {
        let event = AgentEvent {
            session_id: "s1".to_string(),
            event_name: "user_question".to_string(),
            payload: json!({"question": "overwrite the file?"}),
        };
        match outbound_for_agent_event(&event) {
            Outbound::UserQuestion { session_id, question } => {
                assert_eq!(session_id, "s1");
                assert_eq!(question, "overwrite the file?");
            }
            other => panic!("expected UserQuestion, got {other:?}"),
        }
    }

    #[test]
    fn unrecognized_event_names_still_fall_back_to_the_generic_agent_wrapper() {
        let event = AgentEvent {
            session_id: "s1".to_string(),
            event_name: "tool_start".to_string(),
            payload: json!({"tool": "grep"}),
        };
        match outbound_for_agent_event(&event) {
            Outbound::Agent { session_id, event, payload } => {
                assert_eq!(session_id, "s1");
                assert_eq!(event, "tool_start");
                assert_eq!(payload, json!({"tool": "grep"}));
            }
            other => panic!("expected Agent, got {other:?}"),
        }
    }
}

//! HTTP surface on the server port (§6): liveness, health, and the
//! permission out-of-band bridge.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::oneshot;

use crate::protocol::{Outbound, PermissionDecision};

use super::ws::broadcast_to_all;
use super::AppState;

/// `GET /` — always 200, reports whether a child/session surface is up.
pub async fn liveness(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let status = if state.ready.load(Ordering::Relaxed) {
        "ok"
    } else {
        "restarting"
    };
    Json(json!({
        "status": status,
        "metrics": {
            "uptimeSecs": state.started_at.elapsed().as_secs(),
            "connectedClients": state.registry.lock().await.len(),
        }
    }))
}

/// `GET /health` — 200 iff the WS listener is accepting connections.
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if state.ready.load(Ordering::Relaxed) {
        (StatusCode::OK, Json(json!({"ok": true})))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(json!({"ok": false})))
    }
}

/// `POST /permission` request body.
#[derive(Debug, Deserialize)]
pub struct PermissionRequestBody {
    /// Session the request concerns; defaults to `"default"`.
    #[serde(default = "default_session_id")]
    pub session_id: String,
    /// Tool name under consideration.
    pub tool_name: String,
    /// Tool input payload.
    pub tool_input: serde_json::Value,
}

fn default_session_id() -> String {
    "default".to_string()
}

/// How long the HTTP caller waits for a matching `permission_response`
/// before the bridge returns `deny` (§5 Cancellation and timeouts).
pub const PERMISSION_TIMEOUT: Duration = Duration::from_secs(300);

fn is_authorized(state: &AppState, headers: &HeaderMap) -> bool {
    if !state.config.auth_required {
        return true;
    }
    let Some(token) = state.config.api_token.as_deref() else {
        return false;
    };
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|presented| presented == token)
}

/// `POST /permission` — turns into a broadcast `permission_request` and
/// blocks until the matching `permission_response` arrives or times out.
pub async fn permission(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<PermissionRequestBody>,
) -> impl IntoResponse {
    if !is_authorized(&state, &headers) {
        return (StatusCode::FORBIDDEN, Json(json!({"decision": "deny"}))).into_response();
    }

    let request_id = state.alloc_request_id();
    let (tx, rx) = oneshot::channel();
    state
        .permission_waiters
        .lock()
        .await
        .insert(request_id.clone(), tx);

    broadcast_to_all(
        &state,
        &Outbound::PermissionRequest {
            session_id: body.session_id,
            request_id: request_id.clone(),
            tool_name: body.tool_name,
            tool_input: body.tool_input,
        },
    )
    .await;

    let decision = match tokio::time::timeout(PERMISSION_TIMEOUT, rx).await {
        Ok(Ok(decision)) => decision,
        _ => {
            state.permission_waiters.lock().await.remove(&request_id);
            PermissionDecision::Deny
        }
    };

    let body = match decision {
        PermissionDecision::Allow => json!({"decision": "allow"}),
        PermissionDecision::Deny => json!({"decision": "deny"}),
    };
    (StatusCode::OK, Json(body)).into_response()
}

//! WebSocket Broker: the authenticated per-client surface over a running
//! child server (§4.4).
//!
//! Built on `axum`: one `Router`, one `AppState`, handlers resolved via
//! `State<Arc<AppState>>` extraction.

pub mod client;
pub mod fanout;
mod http;
mod validate;
mod ws;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use axum::routing::{get, post};
use axum::Router;
use tokio::sync::{broadcast, oneshot, Mutex};

use crate::config::Config;
use crate::protocol::PermissionDecision;
use crate::session::SessionManager;

use client::ClientRegistry;

/// Shared state every broker handler reads or mutates.
pub struct AppState {
    /// Merged configuration (token, auth policy, cwd default, ...).
    pub config: Config,
    /// Owns every live session.
    pub sessions: Arc<SessionManager>,
    /// Every connected client and per-session primary ownership.
    pub registry: Mutex<ClientRegistry>,
    /// Pending `POST /permission` callers, keyed by request id.
    pub permission_waiters: Mutex<HashMap<String, oneshot::Sender<PermissionDecision>>>,
    /// Fires once at supervisor-initiated drain; `ws::handle_socket` closes on it.
    pub shutdown_tx: broadcast::Sender<()>,
    /// Build/version string echoed in `auth_ok`.
    pub server_version: String,
    /// Process start time, for the `/` liveness payload.
    pub started_at: Instant,
    /// Flips true once the WS listener is accepting connections.
    pub ready: std::sync::atomic::AtomicBool,
}

impl AppState {
    /// Build fresh broker state around an already-loaded config and
    /// session manager.
    #[must_use]
    pub fn new(config: Config, sessions: Arc<SessionManager>, server_version: String) -> Self {
        let (shutdown_tx, _rx) = broadcast::channel(4);
        Self {
            config,
            sessions,
            registry: Mutex::new(ClientRegistry::new()),
            permission_waiters: Mutex::new(HashMap::new()),
            shutdown_tx,
            server_version,
            started_at: Instant::now(),
            ready: std::sync::atomic::AtomicBool::new(false),
        }
    }

    fn alloc_client_id(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }

    fn alloc_request_id(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }
}

/// Build the broker's `Router`, mounting the HTTP surface and the `/ws`
/// upgrade endpoint (§6).
#[must_use]
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(http::liveness))
        .route("/health", get(http::health))
        .route("/permission", post(http::permission))
        .route("/ws", get(ws::upgrade))
        .with_state(state)
}

/// Broadcast `server_shutting_down` to every client and close every
/// socket with [`crate::protocol::CLOSE_SERVER_SHUTTING_DOWN`] (§4.4.5).
/// Called by the supervisor right before it sends `drain` to the child.
pub async fn begin_graceful_shutdown(state: &Arc<AppState>) {
    let _ = state.shutdown_tx.send(());
}

/// Forward every [`crate::session::AgentEvent`] from the session manager
/// onto connected clients per the fan-out policy (§4.4.4). Runs for the
/// lifetime of the broker; spawn it once alongside [`router`].
pub async fn run_fanout(state: Arc<AppState>) {
    let mut events = state.sessions.subscribe();
    loop {
        match events.recv().await {
            Ok(event) => ws::dispatch_agent_event(&state, event).await,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                log::warn!("[broker] fan-out lagged, dropped {skipped} events");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

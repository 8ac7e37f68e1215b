//! Wire protocol: JSON text frames exchanged between the broker and
//! clients, and the parent↔child IPC frames between supervisor and child.
//!
//! Inbound frames are parsed leniently: a missing or unrecognized `type`
//! never produces an error, only a value the caller drops (§7 "Malformed
//! inbound message: silently dropped").

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The device class a client reports at auth time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    /// Handheld phone client.
    Phone,
    /// Tablet client.
    Tablet,
    /// Desktop client.
    Desktop,
    /// Device class not reported or not recognized.
    #[serde(other)]
    Unknown,
}

impl Default for DeviceType {
    fn default() -> Self {
        DeviceType::Unknown
    }
}

/// Whether a client currently wants `raw` terminal frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientMode {
    /// Chat-style view; `raw` events are never delivered.
    Chat,
    /// Terminal view; `raw` events are delivered when this client is foreground.
    Terminal,
}

/// A session's underlying kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionKind {
    /// An interactive AI agent session.
    InteractiveAgent,
    /// A plain terminal session.
    Terminal,
}

/// Client → server inbound messages (§4.4.3).
///
/// `Unknown` absorbs any `type` value the broker doesn't recognize so
/// deserialization never fails on a forward-incompatible client.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Inbound {
    /// First message under `authRequired=true`.
    Auth {
        /// Shared-secret token to check against the configured one.
        token: String,
    },
    /// Drive the active session's agent.
    Input {
        /// Session to target; defaults to the sender's `activeSessionId`.
        #[serde(default, rename = "sessionId")]
        session_id: Option<String>,
        /// Raw text to forward.
        text: String,
    },
    /// Interrupt the active session's agent.
    Interrupt {
        /// Session to target; defaults to the sender's `activeSessionId`.
        #[serde(default, rename = "sessionId")]
        session_id: Option<String>,
    },
    /// Resolve a pending permission request.
    PermissionResponse {
        /// Request id to resolve.
        #[serde(rename = "requestId")]
        request_id: String,
        /// The user's decision.
        decision: PermissionDecision,
    },
    /// Resolve a pending interactive-agent question.
    UserQuestionResponse {
        /// The user's free-text answer.
        answer: String,
    },
    /// Change the active session's model (no-op while busy).
    SetModel {
        /// Model identifier.
        model: String,
    },
    /// Change the active session's permission mode (no-op while busy).
    SetPermissionMode {
        /// Permission mode identifier.
        mode: String,
    },
    /// Claim primary (driving) ownership of a session.
    SetPrimary {
        /// Session to claim.
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    /// Change which session this client is viewing.
    SwitchSession {
        /// Session to switch to.
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    /// Create a new session.
    AttachSession {
        /// External source identifier (e.g. a tmux session name).
        #[serde(rename = "externalSource")]
        external_source: String,
        /// Optional display name.
        #[serde(default)]
        name: Option<String>,
    },
    /// Resize a terminal-kind session.
    Resize {
        /// Terminal columns.
        cols: u16,
        /// Terminal rows.
        rows: u16,
    },
    /// Switch whether this client receives `raw` events.
    Mode {
        /// The new client mode.
        mode: ClientMode,
    },
    /// Any `type` value not listed above.
    #[serde(other)]
    Unknown,
}

/// Decision carried by `permission_response` and returned by the HTTP bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionDecision {
    /// Allow the tool call.
    Allow,
    /// Deny the tool call.
    Deny,
}

/// Parse a raw JSON text frame into an [`Inbound`] message.
///
/// Returns `None` (never an error) when the frame has no `type` field or
/// fails to parse as JSON at all — both are "malformed inbound message,
/// silently dropped" per the error-handling design.
#[must_use]
pub fn parse_inbound(text: &str) -> Option<Inbound> {
    let value: Value = serde_json::from_str(text).ok()?;
    if !value.is_object() || value.get("type").is_none() {
        return None;
    }
    serde_json::from_value(value).ok()
}

/// Server → client outbound messages (§4.4.1, §4.4.4, §4.5.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound {
    /// Successful auth handshake result.
    AuthOk {
        /// Assigned client id (UUID).
        #[serde(rename = "clientId")]
        client_id: String,
        /// Server operating mode.
        #[serde(rename = "serverMode")]
        server_mode: ServerMode,
        /// Server build/version string.
        #[serde(rename = "serverVersion")]
        server_version: String,
        /// Server-side default working directory.
        cwd: String,
        /// Snapshot of currently-connected clients.
        #[serde(rename = "connectedClients")]
        connected_clients: Vec<ConnectedClient>,
        /// Wire protocol version.
        #[serde(rename = "protocolVersion")]
        protocol_version: u32,
    },
    /// Auth failed; the broker closes the socket immediately after.
    AuthFail {
        /// Machine-readable reason (`invalid_token`, `auth_required`).
        reason: String,
    },
    /// Echoes the server's operating mode.
    ServerMode {
        /// `cli` or `terminal`.
        mode: ServerMode,
    },
    /// Free-form server status payload.
    Status {
        /// Arbitrary status fields.
        #[serde(flatten)]
        fields: Value,
    },
    /// Snapshot of all sessions.
    SessionList {
        /// All known sessions.
        sessions: Vec<SessionSummary>,
    },
    /// Acknowledges a `switch_session` (or the implicit one on connect).
    SessionSwitched {
        /// The session now active for this client.
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    /// Models the server can assign via `set_model`.
    AvailableModels {
        /// Model identifiers.
        models: Vec<String>,
    },
    /// Permission modes the server can assign via `set_permission_mode`.
    AvailablePermissionModes {
        /// Permission mode identifiers.
        modes: Vec<String>,
    },
    /// Primary ownership changed for a session.
    PrimaryChanged {
        /// The session whose primary changed.
        #[serde(rename = "sessionId")]
        session_id: String,
        /// The new primary client, or `None` if cleared.
        #[serde(rename = "clientId")]
        client_id: Option<String>,
    },
    /// A request this client sent was rejected because it isn't primary.
    Error {
        /// Human-readable message.
        message: String,
    },
    /// A `session_error` response (attach failures, validation failures).
    SessionError {
        /// Human-readable message.
        message: String,
    },
    /// A fatal, broker-wide error (tunnel failure before exit, etc).
    ServerError {
        /// Broad error category (`"tunnel"`, ...).
        category: String,
        /// Whether the process will keep retrying.
        recoverable: bool,
        /// Human-readable message.
        message: String,
    },
    /// An agent event fanned out to all authenticated clients.
    Agent {
        /// Originating session.
        #[serde(rename = "sessionId")]
        session_id: String,
        /// Event name (`message`, `stream_delta`, `tool_start`, ...).
        event: String,
        /// Event payload, shape depends on `event`.
        payload: Value,
    },
    /// Raw terminal bytes/text, only for foreground terminal-mode clients.
    Raw {
        /// Originating session.
        #[serde(rename = "sessionId")]
        session_id: String,
        /// Raw payload (already decoded to a JSON string by the PTY layer).
        data: String,
    },
    /// Busy/idle transition for a session.
    AgentBusy {
        /// The session that became busy.
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    /// Busy/idle transition for a session.
    AgentIdle {
        /// The session that became idle.
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    /// Out-of-band status update (tunnel, host, anything ambient).
    StatusUpdate {
        /// Free-form status fields.
        #[serde(flatten)]
        fields: Value,
    },
    /// An out-of-band permission request, also POSTed via `/permission`.
    PermissionRequest {
        /// Originating session.
        #[serde(rename = "sessionId")]
        session_id: String,
        /// Correlates with the eventual `permission_response`.
        #[serde(rename = "requestId")]
        request_id: String,
        /// Tool being requested.
        #[serde(rename = "toolName")]
        tool_name: String,
        /// Tool input payload.
        #[serde(rename = "toolInput")]
        tool_input: Value,
    },
    /// An interactive-agent session is asking the user a free-text question.
    UserQuestion {
        /// Originating session.
        #[serde(rename = "sessionId")]
        session_id: String,
        /// The question text.
        question: String,
    },
    /// A client joined (for roster display); deduplicated by `clientId`.
    ClientJoined {
        /// New client's id.
        #[serde(rename = "clientId")]
        client_id: String,
        /// Reported device name.
        #[serde(rename = "deviceName")]
        device_name: String,
        /// Reported device type.
        #[serde(rename = "deviceType")]
        device_type: DeviceType,
    },
    /// A client disconnected.
    ClientLeft {
        /// The client id that left.
        #[serde(rename = "clientId")]
        client_id: String,
    },
    /// Broadcast immediately before a drain-triggered close.
    ServerShuttingDown {},
    /// One-shot response to a directory-browse request (mobile UI feature
    /// outside this core's scope; handler rules are still specified in
    /// §4.5.3 so the dispatcher stays resilient to it).
    DirectoryListing {
        /// Directory entries.
        #[serde(default)]
        entries: Vec<String>,
        /// Error message, if the listing failed.
        #[serde(default)]
        error: Option<String>,
    },
}

/// The server's operating mode, echoed in `auth_ok`/`server_mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerMode {
    /// Driving a CLI-backed coding agent.
    Cli,
    /// Driving a plain terminal.
    Terminal,
}

/// A connected-client entry in `auth_ok.connectedClients`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectedClient {
    /// Client id.
    #[serde(rename = "clientId")]
    pub client_id: String,
    /// Reported device name.
    #[serde(rename = "deviceName")]
    pub device_name: String,
    /// Reported device type.
    #[serde(rename = "deviceType")]
    pub device_type: DeviceType,
}

/// A session summary entry in `session_list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    /// Session id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Working directory.
    pub cwd: String,
    /// Session kind.
    pub kind: SessionKind,
    /// Whether the agent is currently busy.
    #[serde(rename = "isBusy")]
    pub is_busy: bool,
}

/// The application-reserved close code for intentional server restarts (§6).
pub const CLOSE_SERVER_SHUTTING_DOWN: u16 = 4000;

/// Current wire protocol version, echoed in `auth_ok.protocolVersion`.
pub const PROTOCOL_VERSION: u32 = 1;

// ─── Parent ↔ child supervisor IPC (§4.1) ──────────────────────────────────

/// Messages the child sends to the supervisor over the IPC channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChildMessage {
    /// The child has finished startup and is accepting connections.
    Ready,
    /// The child has finished draining and is ready to be terminated.
    DrainComplete,
}

/// Messages the supervisor sends to the child over the IPC channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParentMessage {
    /// Stop accepting new work and report back once idle.
    Drain,
    /// Terminate immediately.
    Shutdown,
}

//! Session Manager — creates, lists, and destroys sessions; forwards
//! tagged agent events to subscribers; bounds the total session count.
//!
//! The real agent subprocess is an external collaborator (§1 Out of
//! scope): this module only needs a streaming-event interface and a
//! `--resume`-style opaque token, modeled here as the [`AgentSource`]
//! trait so the manager's lifecycle logic is independent of whatever
//! spawns the actual process.

mod discovery;
mod pty_source;
mod state;

pub use discovery::{discover_candidates, Candidate};
pub use pty_source::{PtyAgentSource, PtyAgentSourceFactory};
pub use state::{PersistedSession, SessionState, STALE_STATE_MAX_AGE};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::{broadcast, Mutex};

use crate::error::SessionError;
use crate::protocol::SessionKind;
use crate::settings_lock::SettingsLock;

/// Default ring-buffer length for a session's replay history.
pub const DEFAULT_HISTORY_CAPACITY: usize = 200;

/// Default maximum concurrent sessions (overridable via [`crate::config::Config`]).
pub const DEFAULT_MAX_SESSIONS: usize = 5;

/// Sentinel hook name every `InteractiveAgent` session registers in the
/// shared host settings file for permission callbacks (§5). Funnelled
/// through the one [`SettingsLock`] on [`SessionManager`] rather than each
/// session writing the settings file directly.
const PERMISSION_HOOK_NAME: &str = "stationhub_permission_hook";

/// An event emitted by a session's agent, tagged with its origin.
///
/// Matches §4.3: "every event is emitted with the tuple
/// `(sessionId, eventName, payload)`".
#[derive(Debug, Clone)]
pub struct AgentEvent {
    /// The session the event originated in.
    pub session_id: String,
    /// One of the fixed event names in §4.3.
    pub event_name: String,
    /// Event-specific payload.
    pub payload: Value,
}

/// Transitions the Session Manager itself recognizes out of the event
/// stream to flip `is_busy` and, for `agent_busy`/`agent_idle`, to signal
/// the broker to re-broadcast `session_list`.
pub const EVENT_AGENT_BUSY: &str = "agent_busy";
/// See [`EVENT_AGENT_BUSY`].
pub const EVENT_AGENT_IDLE: &str = "agent_idle";

/// Minimal control surface over a running agent/terminal process.
///
/// The concrete implementation (PTY-backed agent subprocess, tmux pane,
/// etc.) lives outside this core; tests use [`FakeAgentSource`].
pub trait AgentSource: Send + Sync {
    /// Forward driving input to the process.
    fn send_input(&self, text: &str) -> anyhow::Result<()>;
    /// Forward an interrupt signal.
    fn interrupt(&self) -> anyhow::Result<()>;
    /// Resize a terminal-kind process's PTY.
    fn resize(&self, cols: u16, rows: u16) -> anyhow::Result<()>;
}

/// Parameters needed to spawn a new session's backing process.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    /// External source identifier (tmux session name, etc).
    pub external_source: String,
    /// Display name.
    pub name: String,
    /// Working directory.
    pub cwd: PathBuf,
    /// Session kind.
    pub kind: SessionKind,
    /// Model identifier, if `kind == InteractiveAgent`.
    pub model: Option<String>,
    /// Permission mode, if `kind == InteractiveAgent`.
    pub permission_mode: Option<String>,
    /// Opaque resume token from a prior [`SessionState`], if resuming.
    pub resume_token: Option<String>,
}

/// Spawns the backing process for a new session.
pub trait AgentSourceFactory: Send + Sync {
    /// Spawn a process for `spec`, wiring its event stream into `events`.
    fn spawn(
        &self,
        spec: &SpawnSpec,
        events: broadcast::Sender<AgentEvent>,
    ) -> anyhow::Result<Arc<dyn AgentSource>>;
}

/// A bounded FIFO ring of recent events, for replaying recent activity to
/// a client that just switched onto a session.
#[derive(Debug, Default)]
pub struct RingHistory {
    capacity: usize,
    events: std::collections::VecDeque<AgentEvent>,
}

impl RingHistory {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            events: std::collections::VecDeque::with_capacity(capacity),
        }
    }

    fn push(&mut self, event: AgentEvent) {
        if self.events.len() == self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    /// Snapshot the current history, oldest first.
    pub fn snapshot(&self) -> Vec<AgentEvent> {
        self.events.iter().cloned().collect()
    }
}

/// A live session, owned exclusively by the [`SessionManager`].
pub struct Session {
    /// Opaque session id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Working directory.
    pub cwd: PathBuf,
    /// External source identifier this session is attached to.
    pub external_source: String,
    /// Session kind.
    pub kind: SessionKind,
    /// Whether the agent is currently processing.
    pub is_busy: bool,
    /// The client currently permitted to drive this session, if any.
    pub primary_client_id: Option<String>,
    /// Current model, for interactive-agent sessions.
    pub model: Option<String>,
    /// Current permission mode, for interactive-agent sessions.
    pub permission_mode: Option<String>,
    /// Opaque resume token, vendor-specific and not guaranteed to work (§9).
    pub external_resume_token: Option<String>,
    /// Wall-clock creation time.
    pub created_at: Instant,
    /// Recent-event replay buffer.
    pub history: RingHistory,
    /// Handle to the backing process.
    pub source: Arc<dyn AgentSource>,
}

/// Read-only snapshot returned by [`SessionManager::list_sessions`].
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    /// Session id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Working directory.
    pub cwd: PathBuf,
    /// Session kind.
    pub kind: SessionKind,
    /// Whether the agent is currently busy.
    pub is_busy: bool,
}

/// Owns every [`Session`], dispatches attach/list/destroy operations, and
/// fans agent events out to subscribers (the broker).
pub struct SessionManager {
    sessions: Mutex<HashMap<String, Session>>,
    max_sessions: usize,
    events_tx: broadcast::Sender<AgentEvent>,
    factory: Arc<dyn AgentSourceFactory>,
    next_id: std::sync::atomic::AtomicU64,
    settings_lock: SettingsLock,
}

impl SessionManager {
    /// Build a new, empty manager.
    #[must_use]
    pub fn new(max_sessions: usize, factory: Arc<dyn AgentSourceFactory>) -> Self {
        let (events_tx, _rx) = broadcast::channel(1024);
        Self {
            sessions: Mutex::new(HashMap::new()),
            max_sessions,
            events_tx,
            factory,
            next_id: std::sync::atomic::AtomicU64::new(1),
            settings_lock: SettingsLock::new(),
        }
    }

    /// Subscribe to the fan-out channel of all agent events across sessions.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.events_tx.subscribe()
    }

    fn alloc_id(&self) -> String {
        let n = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        format!("sess-{n}")
    }

    /// Attach a new session. See §4.3 for error semantics.
    pub async fn attach_session(&self, spec: SpawnSpec) -> Result<String, SessionError> {
        let mut sessions = self.sessions.lock().await;

        if sessions.len() >= self.max_sessions {
            return Err(SessionError::LimitReached(self.max_sessions));
        }
        if sessions
            .values()
            .any(|s| s.external_source == spec.external_source)
        {
            return Err(SessionError::AlreadyExists(spec.external_source.clone()));
        }

        if spec.kind == SessionKind::InteractiveAgent {
            self.settings_lock.register(PERMISSION_HOOK_NAME);
        }

        let source = self
            .factory
            .spawn(&spec, self.events_tx.clone())
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        let id = self.alloc_id();
        let session = Session {
            id: id.clone(),
            name: spec.name,
            cwd: spec.cwd,
            external_source: spec.external_source,
            kind: spec.kind,
            is_busy: false,
            primary_client_id: None,
            model: spec.model,
            permission_mode: spec.permission_mode,
            external_resume_token: spec.resume_token,
            created_at: Instant::now(),
            history: RingHistory::new(DEFAULT_HISTORY_CAPACITY),
            source,
        };
        sessions.insert(id.clone(), session);
        log::info!("[session] attached {id} (total {})", sessions.len());
        Ok(id)
    }

    /// `switchTo` is a broker-side concern (it mutates a client's
    /// `activeSessionId`, not manager state); this exists only to assert
    /// the session is known, per §4.3.
    pub async fn switch_to(&self, session_id: &str) -> Result<(), SessionError> {
        let sessions = self.sessions.lock().await;
        if sessions.contains_key(session_id) {
            Ok(())
        } else {
            Err(SessionError::NotFound(session_id.to_string()))
        }
    }

    /// Snapshot every session's public fields.
    pub async fn list_sessions(&self) -> Vec<SessionSnapshot> {
        let sessions = self.sessions.lock().await;
        sessions
            .values()
            .map(|s| SessionSnapshot {
                id: s.id.clone(),
                name: s.name.clone(),
                cwd: s.cwd.clone(),
                kind: s.kind,
                is_busy: s.is_busy,
            })
            .collect()
    }

    /// Forward driving input to `session_id`'s agent.
    pub async fn send_input(&self, session_id: &str, text: &str) -> Result<(), SessionError> {
        let sessions = self.sessions.lock().await;
        let session = sessions
            .get(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        session
            .source
            .send_input(text)
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))
    }

    /// Forward an interrupt to `session_id`'s agent.
    pub async fn interrupt(&self, session_id: &str) -> Result<(), SessionError> {
        let sessions = self.sessions.lock().await;
        let session = sessions
            .get(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        session
            .source
            .interrupt()
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))
    }

    /// Resize `session_id`'s terminal.
    pub async fn resize(&self, session_id: &str, cols: u16, rows: u16) -> Result<(), SessionError> {
        let sessions = self.sessions.lock().await;
        let session = sessions
            .get(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        session
            .source
            .resize(cols, rows)
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))
    }

    /// Change `session_id`'s model. Silently no-ops while the session is
    /// busy (§4.4.3).
    pub async fn set_model(&self, session_id: &str, model: String) -> Result<(), SessionError> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        if !session.is_busy {
            session.model = Some(model);
        }
        Ok(())
    }

    /// Change `session_id`'s permission mode. Silently no-ops while busy.
    pub async fn set_permission_mode(&self, session_id: &str, mode: String) -> Result<(), SessionError> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        if !session.is_busy {
            session.permission_mode = Some(mode);
        }
        Ok(())
    }

    /// Interrupt and drop every session. Used at shutdown.
    pub async fn destroy_all(&self) {
        let mut sessions = self.sessions.lock().await;
        for (id, session) in sessions.drain() {
            if let Err(e) = session.source.interrupt() {
                log::warn!("[session] interrupt {id} during destroy_all: {e}");
            }
        }
        self.settings_lock.unregister(PERMISSION_HOOK_NAME);
    }

    /// True iff no session is currently busy; the supervisor uses this to
    /// decide whether draining is safe.
    pub async fn all_idle(&self) -> bool {
        let sessions = self.sessions.lock().await;
        sessions.values().all(|s| !s.is_busy)
    }

    /// Record a session transitioning busy/idle and push the event onto
    /// the fan-out channel. Returns `true` if this was a busy/idle
    /// transition, so the broker knows to also broadcast `session_list`.
    pub async fn record_event(&self, event: AgentEvent) -> bool {
        let mut transitioned = false;
        {
            let mut sessions = self.sessions.lock().await;
            if let Some(session) = sessions.get_mut(&event.session_id) {
                match event.event_name.as_str() {
                    EVENT_AGENT_BUSY if !session.is_busy => {
                        session.is_busy = true;
                        transitioned = true;
                    }
                    EVENT_AGENT_IDLE if session.is_busy => {
                        session.is_busy = false;
                        transitioned = true;
                    }
                    _ => {}
                }
                session.history.push(event.clone());
            }
        }
        let _ = self.events_tx.send(event);
        transitioned
    }

    /// Serialize resumable state for every session to `path` (§4.3,
    /// §6 `session-state.json`).
    pub async fn serialize_state(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let sessions = self.sessions.lock().await;
        let persisted: Vec<PersistedSession> = sessions
            .values()
            .map(|s| PersistedSession {
                name: s.name.clone(),
                cwd: s.cwd.clone(),
                model: s.model.clone(),
                permission_mode: s.permission_mode.clone(),
                external_resume_token: s.external_resume_token.clone(),
            })
            .collect();
        state::write_state(path, persisted)
    }

    /// Load persisted session state from `path`, discarding it if stale
    /// (>5 min) or unparseable (§4.3).
    pub fn restore_state(path: &std::path::Path) -> Option<SessionState> {
        state::read_state(path)
    }

    #[cfg(test)]
    fn is_permission_hook_registered(&self) -> bool {
        self.settings_lock.is_registered(PERMISSION_HOOK_NAME)
    }
}

/// A no-op [`AgentSource`]/[`AgentSourceFactory`] used by unit and
/// integration tests that don't need a real process.
#[derive(Debug, Default)]
pub struct FakeAgentSource {
    /// Every call recorded, in order, for test assertions.
    pub calls: Mutex<Vec<String>>,
}

impl AgentSource for FakeAgentSource {
    fn send_input(&self, text: &str) -> anyhow::Result<()> {
        if let Ok(mut calls) = self.calls.try_lock() {
            calls.push(format!("input:{text}"));
        }
        Ok(())
    }
    fn interrupt(&self) -> anyhow::Result<()> {
        if let Ok(mut calls) = self.calls.try_lock() {
            calls.push("interrupt".to_string());
        }
        Ok(())
    }
    fn resize(&self, cols: u16, rows: u16) -> anyhow::Result<()> {
        if let Ok(mut calls) = self.calls.try_lock() {
            calls.push(format!("resize:{cols}x{rows}"));
        }
        Ok(())
    }
}

/// Factory that always hands out a fresh [`FakeAgentSource`], and fails
/// to spawn when `external_source == "fail-spawn"` — a test hook for
/// `SessionSpawnError`.
#[derive(Debug, Default)]
pub struct FakeAgentSourceFactory;

impl AgentSourceFactory for FakeAgentSourceFactory {
    fn spawn(
        &self,
        spec: &SpawnSpec,
        _events: broadcast::Sender<AgentEvent>,
    ) -> anyhow::Result<Arc<dyn AgentSource>> {
        if spec.external_source == "fail-spawn" {
            anyhow::bail!("simulated spawn failure");
        }
        Ok(Arc::new(FakeAgentSource::default()))
    }
}

/// Wraps [`discover_candidates`] on a fixed interval, publishing newly
/// seen candidates without auto-attaching them (§4.3 Auto-discovery).
pub async fn run_auto_discovery(
    interval: Duration,
    known: impl Fn() -> Vec<String> + Send + Sync + 'static,
    mut on_discovered: impl FnMut(Candidate) + Send + 'static,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let attached: std::collections::HashSet<String> = known().into_iter().collect();
        for candidate in discover_candidates() {
            if !attached.contains(&candidate.external_source) {
                on_discovered(candidate);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(max: usize) -> SessionManager {
        SessionManager::new(max, Arc::new(FakeAgentSourceFactory))
    }

    fn spec(source: &str) -> SpawnSpec {
        SpawnSpec {
            external_source: source.to_string(),
            name: source.to_string(),
            cwd: PathBuf::from("/tmp"),
            kind: SessionKind::InteractiveAgent,
            model: None,
            permission_mode: None,
            resume_token: None,
        }
    }

    #[tokio::test]
    async fn attach_session_enforces_limit() {
        let mgr = manager(1);
        mgr.attach_session(spec("a")).await.expect("first attach");
        let err = mgr.attach_session(spec("b")).await.expect_err("second should fail");
        assert!(matches!(err, SessionError::LimitReached(1)));
    }

    #[tokio::test]
    async fn attach_session_rejects_duplicate_source() {
        let mgr = manager(5);
        mgr.attach_session(spec("a")).await.expect("first attach");
        let err = mgr
            .attach_session(spec("a"))
            .await
            .expect_err("duplicate should fail");
        assert!(matches!(err, SessionError::AlreadyExists(ref s) if s == "a"));
    }

    #[tokio::test]
    async fn attach_session_surfaces_spawn_error() {
        let mgr = manager(5);
        let err = mgr
            .attach_session(spec("fail-spawn"))
            .await
            .expect_err("spawn should fail");
        assert!(matches!(err, SessionError::SpawnFailed(_)));
    }

    #[tokio::test]
    async fn all_idle_true_until_busy_event_recorded() {
        let mgr = manager(5);
        let id = mgr.attach_session(spec("a")).await.expect("attach");
        assert!(mgr.all_idle().await);

        mgr.record_event(AgentEvent {
            session_id: id.clone(),
            event_name: EVENT_AGENT_BUSY.to_string(),
            payload: Value::Null,
        })
        .await;
        assert!(!mgr.all_idle().await);

        mgr.record_event(AgentEvent {
            session_id: id,
            event_name: EVENT_AGENT_IDLE.to_string(),
            payload: Value::Null,
        })
        .await;
        assert!(mgr.all_idle().await);
    }

    #[tokio::test]
    async fn busy_idle_transition_detected_exactly_on_change() {
        let mgr = manager(5);
        let id = mgr.attach_session(spec("a")).await.expect("attach");

        let first = mgr
            .record_event(AgentEvent {
                session_id: id.clone(),
                event_name: EVENT_AGENT_BUSY.to_string(),
                payload: Value::Null,
            })
            .await;
        assert!(first, "first busy event is a transition");

        let second = mgr
            .record_event(AgentEvent {
                session_id: id,
                event_name: EVENT_AGENT_BUSY.to_string(),
                payload: Value::Null,
            })
            .await;
        assert!(!second, "repeated busy event is not a transition");
    }

    #[tokio::test]
    async fn list_sessions_reflects_attached_sessions() {
        let mgr = manager(5);
        mgr.attach_session(spec("a")).await.expect("attach");
        let listed = mgr.list_sessions().await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "sess-1");
    }

    #[tokio::test]
    async fn destroy_all_empties_the_manager() {
        let mgr = manager(5);
        mgr.attach_session(spec("a")).await.expect("attach");
        mgr.destroy_all().await;
        assert!(mgr.list_sessions().await.is_empty());
    }

    #[tokio::test]
    async fn set_model_no_ops_while_session_is_busy() {
        let mgr = manager(5);
        let id = mgr.attach_session(spec("a")).await.expect("attach");
        mgr.record_event(AgentEvent {
            session_id: id.clone(),
            event_name: EVENT_AGENT_BUSY.to_string(),
            payload: Value::Null,
        })
        .await;

        mgr.set_model(&id, "opus".to_string()).await.expect("no-op ok");
        let sessions = mgr.sessions.lock().await;
        assert_eq!(sessions.get(&id).unwrap().model, None);
    }

    #[tokio::test]
    async fn send_input_reaches_the_session_source() {
        let mgr = manager(5);
        let id = mgr.attach_session(spec("a")).await.expect("attach");
        mgr.send_input(&id, "hello").await.expect("send reaches the source");
    }

    #[tokio::test]
    async fn attaching_interactive_agent_sessions_registers_the_permission_hook_once() {
        let mgr = manager(5);
        assert!(!mgr.is_permission_hook_registered());

        mgr.attach_session(spec("a")).await.expect("attach a");
        assert!(mgr.is_permission_hook_registered());

        // A second concurrent session funnels through the same lock: still
        // exactly one entry, not a duplicate registration.
        mgr.attach_session(spec("b")).await.expect("attach b");
        assert!(mgr.is_permission_hook_registered());

        mgr.destroy_all().await;
        assert!(!mgr.is_permission_hook_registered());
    }

    #[tokio::test]
    async fn send_input_to_unknown_session_is_not_found() {
        let mgr = manager(5);
        let err = mgr
            .send_input("sess-missing", "hello")
            .await
            .expect_err("should fail");
        assert!(matches!(err, SessionError::NotFound(_)));
    }
}

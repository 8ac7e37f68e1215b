//! Supervisor: owns the child server process's lifecycle — start,
//! graceful restart, drain-then-kill shutdown, and deploy-crash-loop
//! detection with rollback (§4.1).
//!
//! Reuses the hub daemon's PID-file locking idiom ([`daemon`]) and a
//! length-delimited JSON channel over the child's stdio ([`ipc`]) for
//! the `drain`/`drainComplete`/`ready` handshake.

pub mod daemon;
pub mod ipc;

use std::collections::VecDeque;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::process::{Child, Command};
use tokio::sync::{broadcast, oneshot};

use crate::protocol::{ChildMessage, ParentMessage};

/// Backoff delays between consecutive restart attempts (§4.1).
pub const BACKOFF_SCHEDULE: [Duration; 5] = [
    Duration::from_secs(2),
    Duration::from_secs(5),
    Duration::from_secs(10),
    Duration::from_secs(30),
    Duration::from_secs(60),
];

/// After this many consecutive crashes (no intervening `Ready`), the
/// supervisor stops trying and stays on the standby server.
pub const MAX_CONSECUTIVE_RESTARTS: u32 = 10;

/// A deploy followed by this many crashes within [`DEPLOY_CRASH_WINDOW`]
/// triggers a rollback rather than continued retries.
pub const DEPLOY_CRASH_THRESHOLD: usize = 3;

/// Window after a deploy marker in which crashes count toward the
/// deploy-crash-loop detector.
pub const DEPLOY_CRASH_WINDOW: Duration = Duration::from_secs(60);

/// How long `shutdown` waits for `drainComplete` before hard-killing.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// The supervisor's view of the child process (§4.1 state machine).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// Child spawned, no `ready` message yet.
    Starting,
    /// Child published `ready`; traffic may be routed to it.
    Ready,
    /// Graceful shutdown in progress: `drain` sent, awaiting `drainComplete`.
    Draining,
    /// No child process exists (not yet started, or given up after exhausting restarts).
    Gone,
}

/// Supervisor-level lifecycle events, for logs and the standby server.
#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    /// Transitioned to a new state.
    StateChanged(SupervisorState),
    /// The child crashed; a restart will follow per the backoff schedule.
    Crashed { restart_count: u32 },
    /// [`MAX_CONSECUTIVE_RESTARTS`] was exceeded; giving up.
    MaxRestartsExceeded,
    /// The deploy-crash-loop detector fired; rolling back.
    RollingBack,
}

/// Decides what to do given a crash, independent of any actual process
/// I/O — kept pure so the backoff/rollback policy is unit-testable.
pub struct CrashPolicy {
    restart_count: u32,
    crash_times: VecDeque<Instant>,
    deployed_at: Option<Instant>,
}

impl Default for CrashPolicy {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of [`CrashPolicy::record_crash`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashOutcome {
    /// Restart after this delay.
    RestartAfter(Duration),
    /// Stop trying; too many consecutive crashes.
    GiveUp,
    /// Roll back to the last known-good version; a deploy caused a crash loop.
    RollBack,
}

impl CrashPolicy {
    /// Build a fresh policy with no history.
    #[must_use]
    pub fn new() -> Self {
        Self {
            restart_count: 0,
            crash_times: VecDeque::new(),
            deployed_at: None,
        }
    }

    /// Mark that a deploy just completed, resetting the crash-loop window.
    pub fn record_deploy(&mut self, at: Instant) {
        self.deployed_at = Some(at);
        self.crash_times.clear();
    }

    /// A successful `Ready` resets the consecutive-restart counter: only
    /// crashes with no intervening success count toward the cap.
    pub fn record_ready(&mut self) {
        self.restart_count = 0;
    }

    /// Record the outcome of an attempted rollback. On success the
    /// deploy counters reset entirely; on failure the deploy marker is
    /// kept so normal backoff continues to apply.
    pub fn record_rollback_result(&mut self, success: bool) {
        if success {
            self.deployed_at = None;
            self.crash_times.clear();
            self.restart_count = 0;
        }
    }

    /// Record a crash at `at` and decide what happens next.
    pub fn record_crash(&mut self, at: Instant) -> CrashOutcome {
        self.restart_count += 1;
        self.crash_times.push_back(at);
        while let Some(&front) = self.crash_times.front() {
            if at.duration_since(front) > DEPLOY_CRASH_WINDOW {
                self.crash_times.pop_front();
            } else {
                break;
            }
        }

        if let Some(deployed_at) = self.deployed_at {
            let crashes_since_deploy = self
                .crash_times
                .iter()
                .filter(|&&t| t >= deployed_at)
                .count();
            if crashes_since_deploy >= DEPLOY_CRASH_THRESHOLD {
                // Fires exactly once per deploy: clear the window so a
                // fourth crash before the rollback outcome is known
                // doesn't re-trigger it.
                self.crash_times.clear();
                return CrashOutcome::RollBack;
            }
        }

        if self.restart_count > MAX_CONSECUTIVE_RESTARTS {
            return CrashOutcome::GiveUp;
        }

        let index = (self.restart_count - 1) as usize;
        let delay = BACKOFF_SCHEDULE
            .get(index)
            .copied()
            .unwrap_or(*BACKOFF_SCHEDULE.last().expect("schedule is non-empty"));
        CrashOutcome::RestartAfter(delay)
    }
}

/// Command line used to spawn the child server.
#[derive(Debug, Clone)]
pub struct ChildCommand {
    /// Executable path.
    pub program: String,
    /// Arguments passed to the child.
    pub args: Vec<String>,
}

impl ChildCommand {
    fn to_tokio_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        cmd
    }
}

/// Owns the child process handle and drives its lifecycle.
pub struct Supervisor {
    command: ChildCommand,
    policy: CrashPolicy,
    state: SupervisorState,
    child: Option<Child>,
    events_tx: broadcast::Sender<SupervisorEvent>,
}

impl Supervisor {
    /// Build a supervisor for `command`, not yet started.
    #[must_use]
    pub fn new(command: ChildCommand) -> Self {
        let (events_tx, _rx) = broadcast::channel(64);
        Self {
            command,
            policy: CrashPolicy::new(),
            state: SupervisorState::Gone,
            child: None,
            events_tx,
        }
    }

    /// Subscribe to lifecycle events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events_tx.subscribe()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SupervisorState {
        self.state
    }

    fn set_state(&mut self, state: SupervisorState) {
        self.state = state;
        let _ = self.events_tx.send(SupervisorEvent::StateChanged(state));
    }

    /// Spawn the child and wait (via the IPC channel) for its `ready`
    /// message before returning.
    pub async fn start(&mut self) -> anyhow::Result<()> {
        self.set_state(SupervisorState::Starting);
        let mut child = self.command.to_tokio_command().spawn()?;

        let mut stdout = child.stdout.take().expect("piped stdout");
        let message: Option<ChildMessage> = ipc::read_message(&mut stdout).await?;
        child.stdout = Some(stdout);

        match message {
            Some(ChildMessage::Ready) => {
                self.policy.record_ready();
                self.child = Some(child);
                self.set_state(SupervisorState::Ready);
                Ok(())
            }
            _ => {
                let _ = child.kill().await;
                anyhow::bail!("child exited before publishing ready")
            }
        }
    }

    /// Wait for the running child to exit on its own. Never returns if
    /// no child is currently tracked (a graceful `shutdown` takes
    /// `child` before this would be called again, so this only
    /// resolves on an actual crash).
    pub async fn wait_for_child(&mut self) {
        match self.child.as_mut() {
            Some(child) => {
                let _ = child.wait().await;
            }
            None => std::future::pending::<()>().await,
        }
    }

    /// Handle a child crash: consult the backoff/rollback policy and
    /// either sleep-then-restart, give up, or roll back.
    pub async fn handle_crash(&mut self, at: Instant) -> CrashOutcome {
        self.child = None;
        let outcome = self.policy.record_crash(at);
        match outcome {
            CrashOutcome::RestartAfter(_) => {
                self.set_state(SupervisorState::Gone);
                let _ = self.events_tx.send(SupervisorEvent::Crashed {
                    restart_count: self.policy.restart_count,
                });
            }
            CrashOutcome::GiveUp => {
                let _ = self.events_tx.send(SupervisorEvent::MaxRestartsExceeded);
                self.set_state(SupervisorState::Gone);
            }
            CrashOutcome::RollBack => {
                let _ = self.events_tx.send(SupervisorEvent::RollingBack);
                self.set_state(SupervisorState::Gone);
            }
        }
        outcome
    }

    /// Mark that a deploy just landed, resetting the crash-loop window
    /// (`deployCompleted` in §4.1).
    pub fn deploy_completed(&mut self, at: Instant) {
        self.policy.record_deploy(at);
    }

    /// Point subsequent `start()` calls at a different command — used by
    /// `rollbackToKnownGood()` to swap in a previously known-good build.
    pub fn set_command(&mut self, command: ChildCommand) {
        self.command = command;
    }

    #[cfg(test)]
    fn command_program(&self) -> &str {
        &self.command.program
    }

    /// Record whether an attempted `rollbackToKnownGood()` succeeded.
    pub fn rollback_completed(&mut self, success: bool) {
        self.policy.record_rollback_result(success);
    }

    /// Gracefully drain the child: send `drain`, wait up to
    /// [`DRAIN_TIMEOUT`] for `drainComplete`, then kill if it hasn't
    /// exited on its own.
    pub async fn shutdown(&mut self) -> anyhow::Result<()> {
        self.set_state(SupervisorState::Draining);
        let Some(mut child) = self.child.take() else {
            self.set_state(SupervisorState::Gone);
            return Ok(());
        };

        if let Some(mut stdin) = child.stdin.take() {
            let _ = ipc::write_message(&mut stdin, &ParentMessage::Drain).await;
        }

        let drained = tokio::time::timeout(DRAIN_TIMEOUT, child.wait()).await;
        if drained.is_err() {
            log::warn!("[supervisor] drain timed out after {DRAIN_TIMEOUT:?}, killing child");
            let _ = child.kill().await;
        }
        self.set_state(SupervisorState::Gone);
        Ok(())
    }
}

/// A small HTTP listener the supervisor itself binds on the external
/// port whenever no child is READY, so a reconnecting client sees
/// `{status:"restarting"}` instead of a connection refusal (§4.1).
pub struct StandbyServer {
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: tokio::task::JoinHandle<()>,
}

impl StandbyServer {
    /// Bind `port` and start answering `GET /` with the restarting payload.
    pub async fn start(port: u16, started_at: Instant) -> anyhow::Result<Self> {
        use axum::routing::get;
        use axum::{Json, Router};

        let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let app = Router::new().route(
            "/",
            get(move || async move {
                Json(serde_json::json!({
                    "status": "restarting",
                    "metrics": { "uptimeSecs": started_at.elapsed().as_secs() }
                }))
            }),
        );
        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
        });
        Ok(Self {
            shutdown_tx: Some(shutdown_tx),
            handle,
        })
    }

    /// Stop the standby listener, freeing the port for the real child.
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_command_redirects_subsequent_starts() {
        let mut supervisor = Supervisor::new(ChildCommand {
            program: "current-build".to_string(),
            args: Vec::new(),
        });
        assert_eq!(supervisor.command_program(), "current-build");
        supervisor.set_command(ChildCommand {
            program: "known-good-build".to_string(),
            args: Vec::new(),
        });
        assert_eq!(supervisor.command_program(), "known-good-build");
    }

    #[test]
    fn crash_policy_follows_backoff_schedule() {
        let mut policy = CrashPolicy::new();
        let base = Instant::now();
        for (i, expected) in BACKOFF_SCHEDULE.iter().enumerate() {
            let outcome = policy.record_crash(base + Duration::from_secs(i as u64 * 120));
            assert_eq!(outcome, CrashOutcome::RestartAfter(*expected));
        }
    }

    #[test]
    fn crash_policy_gives_up_after_max_consecutive_restarts() {
        let mut policy = CrashPolicy::new();
        let base = Instant::now();
        for i in 0..MAX_CONSECUTIVE_RESTARTS {
            policy.record_crash(base + Duration::from_secs(i as u64 * 120));
        }
        let outcome = policy.record_crash(base + Duration::from_secs(MAX_CONSECUTIVE_RESTARTS as u64 * 120));
        assert_eq!(outcome, CrashOutcome::GiveUp);
    }

    #[test]
    fn a_ready_signal_resets_the_consecutive_restart_counter() {
        let mut policy = CrashPolicy::new();
        let base = Instant::now();
        for i in 0..3 {
            policy.record_crash(base + Duration::from_secs(i as u64 * 120));
        }
        policy.record_ready();
        let outcome = policy.record_crash(base + Duration::from_secs(1000));
        assert_eq!(outcome, CrashOutcome::RestartAfter(BACKOFF_SCHEDULE[0]));
    }

    #[test]
    fn deploy_crash_loop_triggers_rollback() {
        let mut policy = CrashPolicy::new();
        let deployed = Instant::now();
        policy.record_deploy(deployed);
        let outcome1 = policy.record_crash(deployed + Duration::from_secs(5));
        assert!(matches!(outcome1, CrashOutcome::RestartAfter(_)));
        let outcome2 = policy.record_crash(deployed + Duration::from_secs(15));
        assert!(matches!(outcome2, CrashOutcome::RestartAfter(_)));
        let outcome3 = policy.record_crash(deployed + Duration::from_secs(25));
        assert_eq!(outcome3, CrashOutcome::RollBack);
    }

    #[test]
    fn crashes_outside_the_deploy_window_do_not_count_toward_rollback() {
        let mut policy = CrashPolicy::new();
        let deployed = Instant::now();
        policy.record_deploy(deployed);
        policy.record_crash(deployed + Duration::from_secs(5));
        let outcome = policy.record_crash(deployed + DEPLOY_CRASH_WINDOW + Duration::from_secs(30));
        assert!(matches!(outcome, CrashOutcome::RestartAfter(_)));
    }

    #[test]
    fn rollback_fires_exactly_once_and_clears_on_success() {
        let mut policy = CrashPolicy::new();
        let deployed = Instant::now();
        policy.record_deploy(deployed);

        policy.record_crash(deployed + Duration::from_secs(5));
        policy.record_crash(deployed + Duration::from_secs(15));
        let third = policy.record_crash(deployed + Duration::from_secs(25));
        assert_eq!(third, CrashOutcome::RollBack);

        // A fourth crash before the rollback outcome is known must not
        // re-fire RollBack.
        let fourth = policy.record_crash(deployed + Duration::from_secs(26));
        assert!(matches!(fourth, CrashOutcome::RestartAfter(_)));

        policy.record_rollback_result(true);
        // Successful rollback resets the deploy window entirely: a fresh
        // deploy is required before three more crashes can roll back again.
        let after_reset = policy.record_crash(deployed + Duration::from_secs(27));
        assert!(matches!(after_reset, CrashOutcome::RestartAfter(_)));
    }
}

//! `stationhub` binary entry point.
//!
//! This executable plays two roles depending on how it's invoked:
//! - the **supervisor** (the normal `stationhub serve` invocation): owns
//!   the PID lock, the tunnel, and re-execs itself as the child.
//! - the **child**: set by the supervisor via `STATIONHUB_CHILD=1` in the
//!   environment; runs the broker's HTTP+WS surface directly and talks
//!   `ready`/`drain`/`drainComplete` back over stdio.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use stationhub::broker::{self, AppState};
use stationhub::config::Config;
use stationhub::protocol::{ChildMessage, ParentMessage, SessionKind};
use stationhub::session::{PtyAgentSourceFactory, SessionManager, SpawnSpec};
use stationhub::supervisor::{
    daemon, ipc, ChildCommand, CrashOutcome, StandbyServer, Supervisor, BACKOFF_SCHEDULE,
    DEPLOY_CRASH_WINDOW,
};
use stationhub::tunnel::TunnelManager;

/// Env var the supervisor sets on its own child invocation.
const CHILD_MARKER: &str = "STATIONHUB_CHILD";

#[derive(Parser, Debug)]
#[command(name = "stationhub", version, about = "Expose a local coding agent over a stable public URL")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Override the configured port.
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Override the configured API token.
    #[arg(long, global = true)]
    token: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the supervisor (default if no subcommand is given).
    Serve,
    /// Print the resolved configuration and exit.
    Config,
}

fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}

fn apply_cli_overrides(config: &mut Config, cli: &Cli) {
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(token) = &cli.token {
        config.api_token = Some(token.clone());
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    let mut config = Config::load().context("load configuration")?;
    apply_cli_overrides(&mut config, &cli);

    if std::env::var(CHILD_MARKER).is_ok() {
        return run_child(config).await;
    }

    match cli.command.unwrap_or(Command::Serve) {
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Command::Serve => run_supervisor(config).await,
    }
}

/// The child process: binds the broker's HTTP+WS surface and reports
/// `ready` to the supervisor over stdout, draining on `drain` from stdin.
async fn run_child(config: Config) -> Result<()> {
    config.require_token().context("cannot serve without a token")?;

    let sessions = Arc::new(SessionManager::new(
        config.max_sessions,
        Arc::new(PtyAgentSourceFactory),
    ));
    restore_sessions(&sessions).await;

    let state = Arc::new(AppState::new(config.clone(), Arc::clone(&sessions), env!("CARGO_PKG_VERSION").to_string()));

    tokio::spawn(broker::run_fanout(Arc::clone(&state)));

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("bind port {}", config.port))?;
    state.ready.store(true, std::sync::atomic::Ordering::Relaxed);

    let mut stdout = tokio::io::stdout();
    ipc::write_message(&mut stdout, &ChildMessage::Ready).await?;

    let app = broker::router(Arc::clone(&state));
    let mut serve_task = tokio::spawn(async move { axum::serve(listener, app).await });

    let mut stdin = tokio::io::stdin();
    tokio::select! {
        result = &mut serve_task => {
            match result {
                Ok(inner) => inner.context("broker server exited")?,
                Err(e) => return Err(e.into()),
            }
        }
        message = ipc::read_message::<_, ParentMessage>(&mut stdin) => {
            if let Ok(Some(ParentMessage::Drain | ParentMessage::Shutdown)) = message {
                log::info!("[child] draining");
                broker::begin_graceful_shutdown(&state).await;
                persist_sessions(&sessions).await;
                sessions.destroy_all().await;
                serve_task.abort();
                let mut stdout = tokio::io::stdout();
                let _ = ipc::write_message(&mut stdout, &ChildMessage::DrainComplete).await;
            }
        }
    }
    Ok(())
}

fn session_state_path() -> Result<std::path::PathBuf> {
    Ok(Config::config_dir()?.join("session-state.json"))
}

/// Re-attach every session persisted across the last shutdown/restart, if
/// any. Consumed once: the file is removed after a successful read so a
/// crash loop doesn't keep replaying a stale session set (§4.3, §6).
async fn restore_sessions(sessions: &SessionManager) {
    let Ok(path) = session_state_path() else {
        return;
    };
    let Some(state) = SessionManager::restore_state(&path) else {
        return;
    };
    for persisted in state.sessions {
        let spec = SpawnSpec {
            external_source: persisted.name.clone(),
            name: persisted.name.clone(),
            cwd: persisted.cwd,
            kind: SessionKind::InteractiveAgent,
            model: persisted.model,
            permission_mode: persisted.permission_mode,
            resume_token: persisted.external_resume_token,
        };
        if let Err(e) = sessions.attach_session(spec).await {
            log::warn!("[session] failed to restore '{}': {e}", persisted.name);
        }
    }
    let _ = std::fs::remove_file(&path);
}

/// Persist every live session's resumable fields ahead of a drain, so
/// [`restore_sessions`] can re-attach them after the next restart.
async fn persist_sessions(sessions: &SessionManager) {
    let Ok(path) = session_state_path() else {
        return;
    };
    if let Err(e) = sessions.serialize_state(&path).await {
        log::warn!("[session] failed to persist session state: {e}");
    }
}

fn known_good_ref_path() -> Result<PathBuf> {
    Ok(Config::config_dir()?.join("known-good-ref"))
}

fn known_good_bin_path() -> Result<PathBuf> {
    Ok(Config::config_dir()?.join("known-good-bin"))
}

/// A cheap, file-metadata fingerprint for the running executable: good
/// enough to tell "this is the same build as last run" from "something
/// got deployed since", without hashing the whole binary on every start.
fn exe_fingerprint(path: &Path) -> Result<String> {
    let meta = std::fs::metadata(path).with_context(|| format!("stat {}", path.display()))?;
    let modified = meta
        .modified()
        .with_context(|| format!("mtime of {}", path.display()))?
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    Ok(format!("{}:{}", modified.as_secs(), meta.len()))
}

/// Copy `exe` over the recorded known-good build and persist its
/// fingerprint, promoting it as the rollback target for any future
/// deploy-crash-loop.
fn save_known_good(exe: &Path, fingerprint: &str, known_good_bin: &Path, known_good_ref: &Path) {
    if let Err(e) = std::fs::copy(exe, known_good_bin) {
        log::warn!("[supervisor] failed to save known-good build: {e}");
        return;
    }
    if let Err(e) = stationhub::atomic::write_atomic(known_good_ref, fingerprint.as_bytes()) {
        log::warn!("[supervisor] failed to record known-good ref: {e}");
    }
}

/// Promote the current build to known-good once it has run for
/// [`DEPLOY_CRASH_WINDOW`] without a rollback invalidating `generation`.
fn schedule_known_good_promotion(
    generation: Arc<AtomicU64>,
    expected_generation: u64,
    exe: PathBuf,
    fingerprint: String,
    known_good_bin: PathBuf,
    known_good_ref: PathBuf,
) {
    tokio::spawn(async move {
        tokio::time::sleep(DEPLOY_CRASH_WINDOW).await;
        if generation.load(Ordering::SeqCst) == expected_generation {
            save_known_good(&exe, &fingerprint, &known_good_bin, &known_good_ref);
            log::info!("[supervisor] current build survived the deploy window, recorded as known-good");
        }
    });
}

/// `rollbackToKnownGood()`: point the supervisor at the last recorded
/// known-good build. Returns `false` (and leaves the command unchanged)
/// if no known-good build has ever been recorded, in which case the
/// caller falls through to normal backoff instead (§4.1).
fn attempt_rollback(supervisor: &mut Supervisor, known_good_bin: &Path) -> bool {
    if known_good_bin.exists() {
        log::warn!("[supervisor] rolling back to known-good build at {}", known_good_bin.display());
        supervisor.set_command(ChildCommand {
            program: known_good_bin.to_string_lossy().into_owned(),
            args: Vec::new(),
        });
        supervisor.rollback_completed(true);
        true
    } else {
        log::error!("[supervisor] rollback triggered but no known-good build is recorded; continuing with backoff");
        supervisor.rollback_completed(false);
        false
    }
}

/// The supervisor: acquires the PID lock, starts the tunnel, and keeps a
/// child alive, restarting it with backoff across crashes. While no
/// child is READY a standby HTTP server answers on the same port so a
/// reconnecting client can tell "restarting" apart from "tunnel dead".
async fn run_supervisor(config: Config) -> Result<()> {
    daemon::acquire().context("acquire pid lock")?;
    scopeguard::defer! {
        daemon::release();
    };

    config.require_tunnel_hostname().context("tunnel configuration")?;

    let current_exe = std::env::current_exe().context("resolve current executable")?;
    let mut tunnel = TunnelManager::new(
        "cloudflared".to_string(),
        config.tunnel_mode,
        config.tunnel_hostname.clone(),
        config.port,
    );
    let urls = tunnel.start().await.context("start tunnel")?;
    log::info!("[supervisor] public URL: {}", urls.http_url);

    let command = ChildCommand {
        program: current_exe.to_string_lossy().into_owned(),
        args: Vec::new(),
    };
    let mut supervisor = Supervisor::new(command);
    std::env::set_var(CHILD_MARKER, "1");

    // Every supervisor launch counts as a deploy for crash-loop-window
    // purposes; `known-good-ref` distinguishes "this is the same build
    // as last run" (nothing to roll back to yet) from "a new build
    // landed" (a target the rollback below can fall back on).
    let known_good_bin = known_good_bin_path().context("resolve known-good build path")?;
    let known_good_ref = known_good_ref_path().context("resolve known-good ref path")?;
    let current_fingerprint = exe_fingerprint(&current_exe).context("fingerprint current executable")?;
    let previously_known_good = std::fs::read_to_string(&known_good_ref).ok();
    let is_fresh_deploy = previously_known_good.as_deref() != Some(current_fingerprint.as_str());
    supervisor.deploy_completed(Instant::now());

    let generation = Arc::new(AtomicU64::new(0));
    let mut pending_promotion = is_fresh_deploy;
    if !known_good_bin.exists() {
        // Nothing recorded yet: trust this build as the baseline, there's
        // no earlier revision to roll back to regardless.
        save_known_good(&current_exe, &current_fingerprint, &known_good_bin, &known_good_ref);
        pending_promotion = false;
    }

    let started_at = Instant::now();
    let mut standby = Some(
        StandbyServer::start(config.port, started_at)
            .await
            .context("bind standby server")?,
    );

    let mut signals = signal_stream()?;

    loop {
        // The child binds the same external port the standby server
        // just held; free it first or the bind races and loses.
        if let Some(s) = standby.take() {
            s.stop().await;
        }

        if let Err(e) = supervisor.start().await {
            log::warn!("[supervisor] child failed to start: {e}");
            standby = Some(
                StandbyServer::start(config.port, started_at)
                    .await
                    .context("rebind standby server after failed start")?,
            );
            match supervisor.handle_crash(Instant::now()).await {
                CrashOutcome::RestartAfter(delay) => {
                    tokio::time::sleep(delay).await;
                    continue;
                }
                CrashOutcome::GiveUp => break,
                CrashOutcome::RollBack => {
                    generation.fetch_add(1, Ordering::SeqCst);
                    if attempt_rollback(&mut supervisor, &known_good_bin) {
                        pending_promotion = false;
                    } else {
                        tokio::time::sleep(BACKOFF_SCHEDULE[0]).await;
                    }
                    continue;
                }
            }
        }

        if pending_promotion {
            pending_promotion = false;
            schedule_known_good_promotion(
                Arc::clone(&generation),
                generation.load(Ordering::SeqCst),
                current_exe.clone(),
                current_fingerprint.clone(),
                known_good_bin.clone(),
                known_good_ref.clone(),
            );
        }

        tokio::select! {
            _ = signals.recv() => {
                log::info!("[supervisor] shutting down");
                supervisor.shutdown().await?;
                break;
            }
            () = supervisor.wait_for_child() => {
                log::warn!("[supervisor] child exited unexpectedly");
                standby = Some(
                    StandbyServer::start(config.port, started_at)
                        .await
                        .context("rebind standby server after crash")?,
                );
                match supervisor.handle_crash(Instant::now()).await {
                    CrashOutcome::RestartAfter(delay) => tokio::time::sleep(delay).await,
                    CrashOutcome::GiveUp => break,
                    CrashOutcome::RollBack => {
                        generation.fetch_add(1, Ordering::SeqCst);
                        if attempt_rollback(&mut supervisor, &known_good_bin) {
                            pending_promotion = false;
                        } else {
                            tokio::time::sleep(BACKOFF_SCHEDULE[0]).await;
                        }
                    }
                }
            }
        }
    }

    if let Some(s) = standby.take() {
        s.stop().await;
    }
    tunnel.stop().await;
    Ok(())
}

fn signal_stream() -> Result<tokio::sync::mpsc::Receiver<()>> {
    let (tx, rx) = tokio::sync::mpsc::channel(1);
    ctrlc::set_handler(move || {
        let _ = tx.blocking_send(());
    })
    .context("install signal handler")?;
    Ok(rx)
}

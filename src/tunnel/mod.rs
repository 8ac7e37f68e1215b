//! Tunnel Manager: runs the external tunnel binary as a child process,
//! harvests the public URL it prints, and recovers from drops with a
//! bounded retry schedule (§4.2).
//!
//! The tunnel binary itself (e.g. a `cloudflared`-style executable) is
//! an external collaborator out of scope here (§1); this module only
//! spawns it, scans its output, and supervises its lifecycle.

mod scan;

pub use scan::scan_for_url;

use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::broadcast;

use crate::error::TunnelError;

/// Quick vs named tunnel mode (§3 DATA MODEL, §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelMode {
    /// Ephemeral tunnel with a provider-assigned random hostname.
    Quick,
    /// Stable hostname, requires `tunnel_hostname` to be configured.
    Named,
}

impl Default for TunnelMode {
    fn default() -> Self {
        TunnelMode::Quick
    }
}

impl TunnelMode {
    /// Parse a mode from a config/env string, case-insensitively.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "quick" => Some(TunnelMode::Quick),
            "named" => Some(TunnelMode::Named),
            _ => None,
        }
    }
}

/// The two public URLs a tunnel publishes once connected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelUrls {
    /// `https://` URL clients browse to.
    pub http_url: String,
    /// `wss://` URL the broker's WebSocket endpoint is reachable at.
    pub ws_url: String,
}

/// Lifecycle events published on the tunnel manager's broadcast channel.
/// Matches the event names in §4.2.
#[derive(Debug, Clone)]
pub enum TunnelEvent {
    /// The tunnel connection dropped; recovery is about to begin.
    Lost,
    /// A recovery attempt (1-indexed) is starting.
    Recovering { attempt: u32 },
    /// Recovery succeeded and the tunnel is back up, same URL.
    Recovered,
    /// Recovery succeeded but the provider assigned a new URL (quick mode).
    UrlChanged { urls: TunnelUrls },
    /// Recovery attempts were exhausted; the tunnel is down for good.
    Failed { message: String },
}

/// Recovery backoff schedule: 3 attempts, spaced out per §4.2.
pub const RECOVERY_SCHEDULE: [Duration; 3] = [
    Duration::from_secs(5),
    Duration::from_secs(15),
    Duration::from_secs(45),
];

/// Spawns and supervises the tunnel child process.
pub struct TunnelManager {
    binary: String,
    mode: TunnelMode,
    hostname: Option<String>,
    local_port: u16,
    events_tx: broadcast::Sender<TunnelEvent>,
    child: Option<Child>,
}

impl TunnelManager {
    /// Build a manager for a tunnel binary at `binary` (resolved via `PATH`),
    /// forwarding `local_port` to the outside world.
    #[must_use]
    pub fn new(binary: String, mode: TunnelMode, hostname: Option<String>, local_port: u16) -> Self {
        let (events_tx, _rx) = broadcast::channel(64);
        Self {
            binary,
            mode,
            hostname,
            local_port,
            events_tx,
            child: None,
        }
    }

    /// Subscribe to tunnel lifecycle events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.events_tx.subscribe()
    }

    fn build_command(&self) -> Result<Command, TunnelError> {
        if self.mode == TunnelMode::Named && self.hostname.is_none() {
            return Err(TunnelError::MissingHostname);
        }
        let mut cmd = Command::new(&self.binary);
        cmd.arg("--url")
            .arg(format!("http://127.0.0.1:{}", self.local_port));
        if self.mode == TunnelMode::Named {
            if let Some(hostname) = &self.hostname {
                cmd.arg("--hostname").arg(hostname);
            }
        }
        cmd.stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null());
        Ok(cmd)
    }

    /// Spawn the tunnel process and wait for it to publish a URL.
    ///
    /// Returns [`TunnelError::StartFailed`] if the child exits (or its
    /// pipes close) before a URL line is ever seen.
    pub async fn start(&mut self) -> Result<TunnelUrls, TunnelError> {
        let mut cmd = self.build_command()?;
        let mut child = cmd.spawn().map_err(|_| TunnelError::StartFailed)?;

        let stdout = child.stdout.take().ok_or(TunnelError::StartFailed)?;
        let stderr = child.stderr.take().ok_or(TunnelError::StartFailed)?;
        let urls = wait_for_url(stdout, stderr, self.mode, self.hostname.as_deref())
            .await
            .ok_or(TunnelError::StartFailed)?;

        log::info!("[tunnel] connected: {}", urls.http_url);
        self.child = Some(child);
        Ok(urls)
    }

    /// Kill the child process, if running.
    pub async fn stop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill().await;
        }
    }

    /// Run the recovery schedule after the tunnel is detected as lost:
    /// respawn at each backoff interval, publishing events along the way.
    /// Gives up and publishes [`TunnelEvent::Failed`] after exhausting
    /// [`RECOVERY_SCHEDULE`].
    pub async fn recover(&mut self, last_urls: &TunnelUrls) -> Result<TunnelUrls, TunnelError> {
        let _ = self.events_tx.send(TunnelEvent::Lost);

        for (index, delay) in RECOVERY_SCHEDULE.iter().enumerate() {
            let attempt = index as u32 + 1;
            tokio::time::sleep(*delay).await;
            let _ = self.events_tx.send(TunnelEvent::Recovering { attempt });

            match self.start().await {
                Ok(urls) => {
                    if urls == *last_urls {
                        let _ = self.events_tx.send(TunnelEvent::Recovered);
                    } else {
                        let _ = self
                            .events_tx
                            .send(TunnelEvent::UrlChanged { urls: urls.clone() });
                    }
                    return Ok(urls);
                }
                Err(e) => {
                    log::warn!("[tunnel] recovery attempt {attempt} failed: {e}");
                }
            }
        }

        let message = format!(
            "exhausted {} recovery attempts",
            RECOVERY_SCHEDULE.len()
        );
        let _ = self.events_tx.send(TunnelEvent::Failed {
            message: message.clone(),
        });
        Err(TunnelError::RecoveryExhausted {
            attempts: RECOVERY_SCHEDULE.len() as u32,
            message,
        })
    }
}

/// Waits for the tunnel child to signal readiness, per-mode:
/// `quick` scrapes the first `https://` URL out of either stream;
/// `named` ignores whatever URL-shaped text scrolls by and instead waits
/// for the child's own "registered tunnel connection" line, then returns
/// the pre-configured hostname rather than anything scraped (§4.2).
async fn wait_for_url(
    stdout: tokio::process::ChildStdout,
    stderr: tokio::process::ChildStderr,
    mode: TunnelMode,
    hostname: Option<&str>,
) -> Option<TunnelUrls> {
    let mut out_lines = BufReader::new(stdout).lines();
    let mut err_lines = BufReader::new(stderr).lines();
    loop {
        tokio::select! {
            line = out_lines.next_line() => {
                match line {
                    Ok(Some(line)) => if let Some(urls) = match_readiness_line(&line, mode, hostname) { return Some(urls); },
                    _ => return None,
                }
            }
            line = err_lines.next_line() => {
                match line {
                    Ok(Some(line)) => if let Some(urls) = match_readiness_line(&line, mode, hostname) { return Some(urls); },
                    _ => return None,
                }
            }
        }
    }
}

fn match_readiness_line(line: &str, mode: TunnelMode, hostname: Option<&str>) -> Option<TunnelUrls> {
    match mode {
        TunnelMode::Quick => scan_for_url(line),
        TunnelMode::Named => {
            if scan::line_signals_named_registration(line) {
                hostname.map(synthesize_named_urls)
            } else {
                None
            }
        }
    }
}

fn synthesize_named_urls(hostname: &str) -> TunnelUrls {
    TunnelUrls {
        http_url: format!("https://{hostname}"),
        ws_url: format!("wss://{hostname}"),
    }
}

//! Persisted session state (`session-state.json`): written on every
//! graceful shutdown/restart and read back on startup, discarded if
//! older than [`STALE_STATE_MAX_AGE`] (§4.3).

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// State older than this is treated as if it didn't exist.
pub const STALE_STATE_MAX_AGE: Duration = Duration::from_secs(5 * 60);

/// One session's resumable fields, as written to disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedSession {
    /// Display name.
    pub name: String,
    /// Working directory.
    pub cwd: PathBuf,
    /// Model, for interactive-agent sessions.
    pub model: Option<String>,
    /// Permission mode, for interactive-agent sessions.
    pub permission_mode: Option<String>,
    /// Opaque resume token handed back by the agent vendor, if any.
    pub external_resume_token: Option<String>,
}

/// The full contents of `session-state.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    /// Unix seconds at write time, used for staleness checks on read.
    pub written_at: u64,
    /// Every session that was live at write time.
    pub sessions: Vec<PersistedSession>,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub(super) fn write_state(path: &Path, sessions: Vec<PersistedSession>) -> Result<()> {
    let state = SessionState {
        written_at: unix_now(),
        sessions,
    };
    let json = serde_json::to_string_pretty(&state).context("serialize session state")?;
    crate::atomic::write_atomic(path, json.as_bytes())
}

pub(super) fn read_state(path: &Path) -> Option<SessionState> {
    let contents = std::fs::read_to_string(path).ok()?;
    let state: SessionState = serde_json::from_str(&contents).ok()?;
    let age = unix_now().saturating_sub(state.written_at);
    if age > STALE_STATE_MAX_AGE.as_secs() {
        log::info!(
            "[session] ignoring stale session-state.json ({}s old)",
            age
        );
        return None;
    }
    Some(state)
}

//! PID-file locking: ensures at most one supervisor instance runs at a
//! time, and detects stale lock files left behind by a crash.
//!
//! Grounded on the hub daemon's PID file handling: a PID file recording
//! the owning process, liveness checked via `kill(pid, 0)`.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::config::Config;
use crate::error::ConfigError;

fn pid_file_path() -> Result<PathBuf> {
    Ok(Config::config_dir()?.join("stationhub.pid"))
}

/// Read the PID recorded in the lock file, if any.
#[must_use]
pub fn read_pid_file() -> Option<u32> {
    let path = pid_file_path().ok()?;
    fs::read_to_string(&path).ok()?.trim().parse().ok()
}

/// True if the recorded PID is alive (`kill(pid, 0) == 0`).
#[must_use]
pub fn is_running() -> bool {
    let Some(pid) = read_pid_file() else {
        return false;
    };
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

/// Acquire the PID-file lock for this process.
///
/// Returns [`ConfigError::AlreadyRunning`] if another live process
/// already holds it; otherwise writes (or overwrites a stale) lock and
/// returns `Ok`.
pub fn acquire() -> Result<(), ConfigError> {
    if let Some(pid) = read_pid_file() {
        if unsafe { libc::kill(pid as libc::pid_t, 0) == 0 } {
            return Err(ConfigError::AlreadyRunning(pid));
        }
        log::info!("[supervisor] clearing stale pid file for dead pid {pid}");
    }
    let path = pid_file_path().map_err(|_| ConfigError::AlreadyRunning(0))?;
    let _ = fs::write(&path, std::process::id().to_string());
    Ok(())
}

/// Release the lock on graceful shutdown.
pub fn release() {
    if let Ok(path) = pid_file_path() {
        let _ = fs::remove_file(&path);
    }
}

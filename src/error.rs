//! Error taxonomy shared across the supervisor, tunnel manager, session
//! manager, and broker.
//!
//! These are the abstract kinds from the design doc's error-handling
//! section, not a catch-all. Anything that doesn't belong to an explicit
//! failure mode a caller needs to branch on stays as `anyhow::Error` at
//! the call site, same as the rest of the crate.

use thiserror::Error;

/// Fatal startup misconfiguration. The process exits non-zero after logging.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No API token configured (env, file, or CLI).
    #[error("no API token configured")]
    MissingToken,
    /// Named tunnel mode selected without a hostname.
    #[error("named tunnel mode requires a hostname")]
    MissingTunnelHostname,
    /// A PID file exists and its recorded PID is alive.
    #[error("stationhub is already running (pid {0})")]
    AlreadyRunning(u32),
}

/// Tunnel child process failed to establish or lost its connection for good.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// The child exited before publishing a URL.
    #[error("tunnel process exited before publishing a URL")]
    StartFailed,
    /// `named` mode is missing its hostname.
    #[error("named tunnel requires a configured hostname")]
    MissingHostname,
    /// All recovery attempts were exhausted.
    #[error("tunnel recovery exhausted after {attempts} attempts: {message}")]
    RecoveryExhausted {
        /// Number of attempts made.
        attempts: u32,
        /// Last failure message.
        message: String,
    },
}

/// Session Manager failures, always non-fatal to the broker.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The configured maximum session count has been reached.
    #[error("session limit reached ({0} sessions)")]
    LimitReached(usize),
    /// Two attachments targeted the same external source.
    #[error("a session is already attached to '{0}'")]
    AlreadyExists(String),
    /// Spawn-time setup failed for any other reason.
    #[error("failed to spawn session: {0}")]
    SpawnFailed(String),
    /// The requested session id is not known to the manager.
    #[error("unknown session '{0}'")]
    NotFound(String),
}

/// Authentication failure reasons, surfaced verbatim in `auth_fail.reason`.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    /// Token did not match the configured token.
    #[error("invalid_token")]
    InvalidToken,
    /// First message was not an `auth` frame.
    #[error("auth_required")]
    AuthRequired,
}

impl AuthFailure {
    /// The `reason` string sent to the client.
    #[must_use]
    pub fn reason(self) -> &'static str {
        match self {
            AuthFailure::InvalidToken => "invalid_token",
            AuthFailure::AuthRequired => "auth_required",
        }
    }
}

/// Inbound message validation failures. The connection always stays open.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A required field was missing or the wrong type.
    #[error("missing or malformed field: {0}")]
    BadField(&'static str),
    /// `externalSource` failed the restrictive name regex.
    #[error("Invalid tmux session name")]
    InvalidExternalSource,
}

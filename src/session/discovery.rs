//! Auto-discovery probe: periodically lists external sources (tmux
//! sessions) that aren't yet attached, so the broker can surface them to
//! clients as attachable candidates without attaching them automatically
//! (§4.3 Auto-discovery).

use std::process::Command;

/// A discoverable external source not currently attached to a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// The identifier to pass as `externalSource` in an `attach_session` frame.
    pub external_source: String,
}

/// Default interval between discovery probes.
pub const DISCOVERY_INTERVAL_SECS: u64 = 45;

/// List live tmux sessions via `tmux list-sessions -F '#S'`.
///
/// Returns an empty list (rather than erroring) when tmux isn't
/// installed or no server is running — discovery is best-effort.
#[must_use]
pub fn discover_candidates() -> Vec<Candidate> {
    let output = match Command::new("tmux")
        .args(["list-sessions", "-F", "#S"])
        .output()
    {
        Ok(output) if output.status.success() => output,
        _ => return Vec::new(),
    };

    String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| Candidate {
            external_source: line.to_string(),
        })
        .collect()
}

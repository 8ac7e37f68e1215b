//! Connection state machine (§4.5.1).

use std::time::Duration;

/// The five states a client connection can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No socket, no pending retry. Saved credentials may still be present.
    Disconnected,
    /// A connect attempt is in flight, awaiting `auth_ok`.
    Connecting,
    /// Authenticated and receiving traffic.
    Connected,
    /// The socket closed with a non-4000 code; backing off before retrying.
    Reconnecting,
    /// The socket closed with code 4000 (intentional server restart).
    ServerRestarting,
}

/// Ascending, capped reconnect backoff (§4.5.1).
pub const RECONNECT_BACKOFF: [Duration; 5] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(4),
    Duration::from_secs(8),
    Duration::from_secs(15),
];

/// Consecutive failed attempts after which the client gives up and
/// returns to `disconnected`, still holding onto saved credentials.
pub const MAX_RECONNECT_FAILURES: u32 = 8;

/// A reason the socket closed, driving which state follows `connected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Close code 4000: the server is intentionally restarting.
    ServerRestart,
    /// Any other close code or a network failure.
    Unexpected,
}

/// Drives [`ConnectionState`] transitions; pure, so it can be unit tested
/// without a real socket.
#[derive(Debug)]
pub struct StateMachine {
    state: ConnectionState,
    consecutive_failures: u32,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    /// Start in `disconnected`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            consecutive_failures: 0,
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// `selectShowSession` in §8 property 5: the session view stays
    /// mounted for every state except `disconnected`.
    #[must_use]
    pub fn should_show_session(&self) -> bool {
        self.state != ConnectionState::Disconnected
    }

    /// User or code called `connect()`.
    pub fn on_connect(&mut self) {
        self.state = ConnectionState::Connecting;
    }

    /// The server replied `auth_ok`.
    pub fn on_auth_ok(&mut self) {
        self.state = ConnectionState::Connected;
        self.consecutive_failures = 0;
    }

    /// The socket closed while connected.
    pub fn on_close(&mut self, reason: CloseReason) {
        self.state = match reason {
            CloseReason::ServerRestart => ConnectionState::ServerRestarting,
            CloseReason::Unexpected => ConnectionState::Reconnecting,
        };
    }

    /// A reconnect attempt (from `reconnecting` or `server_restarting`)
    /// is starting.
    pub fn on_reconnect_attempt(&mut self) {
        self.state = ConnectionState::Connecting;
    }

    /// A reconnect attempt itself failed (dial error, timeout). Tracks
    /// toward [`MAX_RECONNECT_FAILURES`]; past the cap, falls back to
    /// `disconnected` without touching saved credentials.
    pub fn on_reconnect_failed(&mut self) {
        self.consecutive_failures += 1;
        if self.consecutive_failures >= MAX_RECONNECT_FAILURES {
            self.state = ConnectionState::Disconnected;
        } else {
            self.state = match self.state {
                ConnectionState::Connecting => ConnectionState::Reconnecting,
                other => other,
            };
        }
    }

    /// Explicit user-initiated disconnect: clears the queue and session
    /// state (the caller owns doing that; this just resets the phase).
    pub fn on_disconnect(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.consecutive_failures = 0;
    }

    /// The backoff delay for the next reconnect attempt, capped at the
    /// schedule's last entry.
    #[must_use]
    pub fn next_backoff(&self) -> Duration {
        let index = (self.consecutive_failures as usize).min(RECONNECT_BACKOFF.len() - 1);
        RECONNECT_BACKOFF[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn show_session_is_true_for_every_state_but_disconnected() {
        let mut sm = StateMachine::new();
        assert!(!sm.should_show_session());
        sm.on_connect();
        assert!(sm.should_show_session());
        sm.on_auth_ok();
        assert!(sm.should_show_session());
        sm.on_close(CloseReason::ServerRestart);
        assert!(sm.should_show_session());
        sm.on_close(CloseReason::Unexpected);
        assert!(sm.should_show_session());
    }

    #[test]
    fn close_with_4000_goes_to_server_restarting() {
        let mut sm = StateMachine::new();
        sm.on_connect();
        sm.on_auth_ok();
        sm.on_close(CloseReason::ServerRestart);
        assert_eq!(sm.state(), ConnectionState::ServerRestarting);
    }

    #[test]
    fn close_with_other_code_goes_to_reconnecting() {
        let mut sm = StateMachine::new();
        sm.on_connect();
        sm.on_auth_ok();
        sm.on_close(CloseReason::Unexpected);
        assert_eq!(sm.state(), ConnectionState::Reconnecting);
    }

    #[test]
    fn repeated_reconnect_failures_fall_back_to_disconnected() {
        let mut sm = StateMachine::new();
        sm.on_connect();
        sm.on_auth_ok();
        sm.on_close(CloseReason::Unexpected);
        for _ in 0..MAX_RECONNECT_FAILURES {
            sm.on_reconnect_attempt();
            sm.on_reconnect_failed();
        }
        assert_eq!(sm.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn explicit_disconnect_always_returns_to_disconnected() {
        let mut sm = StateMachine::new();
        sm.on_connect();
        sm.on_auth_ok();
        sm.on_disconnect();
        assert_eq!(sm.state(), ConnectionState::Disconnected);
        assert!(!sm.should_show_session());
    }

    #[test]
    fn backoff_ascends_then_caps() {
        let mut sm = StateMachine::new();
        sm.on_connect();
        sm.on_auth_ok();
        sm.on_close(CloseReason::Unexpected);
        assert_eq!(sm.next_backoff(), RECONNECT_BACKOFF[0]);
        for _ in 0..10 {
            sm.on_reconnect_attempt();
            sm.on_reconnect_failed();
        }
        assert_eq!(sm.next_backoff(), *RECONNECT_BACKOFF.last().unwrap());
    }
}

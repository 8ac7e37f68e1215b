//! Inbound field validation (§4.4.3 security validation).

use regex::Regex;
use std::sync::OnceLock;

/// `externalSource` must be alphanumeric plus `-_.`, 1 to 64 characters.
fn external_source_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9._-]{1,64}$").expect("valid regex"))
}

/// True iff `source` is safe to pass through to the session spawner.
#[must_use]
pub fn is_valid_external_source(source: &str) -> bool {
    external_source_re().is_match(source)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_typical_tmux_session_names() {
        assert!(is_valid_external_source("main"));
        assert!(is_valid_external_source("agent-1"));
        assert!(is_valid_external_source("proj_1.worker"));
    }

    #[test]
    fn rejects_shell_metacharacters() {
        assert!(!is_valid_external_source("main; rm -rf /"));
        assert!(!is_valid_external_source("$(whoami)"));
        assert!(!is_valid_external_source("a b"));
    }

    #[test]
    fn rejects_empty_and_overlong_names() {
        assert!(!is_valid_external_source(""));
        let too_long = "a".repeat(65);
        assert!(!is_valid_external_source(&too_long));
    }
}

//! Process-wide guard around registering hooks into a shared settings
//! file (§5 shared-resource discipline).
//!
//! §9 calls out an existing real bug in the system being modeled: two
//! concurrent registrations can race and double-register a hook. This
//! module exists to make that race structurally impossible here: every
//! register/unregister goes through one mutex, and registration is
//! idempotent (registering twice is a no-op, not a duplicate entry).

use std::collections::HashSet;
use std::sync::Mutex;

/// Tracks which hook names are currently registered, guarded by a single
/// process-wide lock so register/unregister pairs can't interleave.
pub struct SettingsLock {
    registered: Mutex<HashSet<String>>,
}

impl Default for SettingsLock {
    fn default() -> Self {
        Self::new()
    }
}

impl SettingsLock {
    /// Build an empty lock.
    #[must_use]
    pub fn new() -> Self {
        Self {
            registered: Mutex::new(HashSet::new()),
        }
    }

    /// Register `hook`. Returns `true` if this call actually added it,
    /// `false` if it was already registered (idempotent no-op).
    pub fn register(&self, hook: &str) -> bool {
        let mut registered = self.registered.lock().expect("settings lock poisoned");
        registered.insert(hook.to_string())
    }

    /// Unregister `hook`. Returns `true` if it was present.
    pub fn unregister(&self, hook: &str) -> bool {
        let mut registered = self.registered.lock().expect("settings lock poisoned");
        registered.remove(hook)
    }

    /// True if `hook` is currently registered.
    #[must_use]
    pub fn is_registered(&self, hook: &str) -> bool {
        let registered = self.registered.lock().expect("settings lock poisoned");
        registered.contains(hook)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn register_is_idempotent() {
        let lock = SettingsLock::new();
        assert!(lock.register("on_exit"));
        assert!(!lock.register("on_exit"));
        assert!(lock.is_registered("on_exit"));
    }

    #[test]
    fn unregister_then_register_succeeds_again() {
        let lock = SettingsLock::new();
        lock.register("on_exit");
        assert!(lock.unregister("on_exit"));
        assert!(lock.register("on_exit"));
    }

    #[test]
    fn concurrent_registration_never_double_registers() {
        let lock = Arc::new(SettingsLock::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let lock = Arc::clone(&lock);
            handles.push(std::thread::spawn(move || lock.register("hook")));
        }
        let successes = handles
            .into_iter()
            .map(|h| h.join().expect("thread"))
            .filter(|&ok| ok)
            .count();
        assert_eq!(successes, 1);
    }
}

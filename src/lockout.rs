//! In-memory ledger of failed logins with rolling-window lockout
//!
//! Process-local by design: each replica tracks its own attempts. Horizontal
//! scaling requires promoting this to a shared store.

use std::{
    collections::HashMap,
    sync::Mutex,
};

#[derive(Debug, Clone)]
struct LockoutEntry {
    failures: u32,
    window_start: i64,
    locked_until: Option<i64>,
}

/// Failed-login bookkeeping keyed by username. All operations are O(1) under
/// a single mutex; timestamps are unix seconds supplied by the caller so the
/// logic stays clock-independent and testable.
pub struct LockoutLedger {
    entries: Mutex<HashMap<String, LockoutEntry>>,
    threshold: u32,
    window_secs: i64,
    lockout_secs: i64,
}

impl LockoutLedger {
    pub fn new(threshold: u32, window_secs: i64, lockout_secs: i64) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            threshold,
            window_secs,
            lockout_secs,
        }
    }

    /// Is this username currently refused, regardless of password correctness?
    pub fn is_locked(&self, username: &str, now: i64) -> bool {
        let entries = self.entries.lock().unwrap();
        entries
            .get(username)
            .and_then(|e| e.locked_until)
            .map_or(false, |until| now < until)
    }

    /// Record a failed attempt; trips the lock once the threshold is reached
    /// within the rolling window.
    pub fn record_failure(&self, username: &str, now: i64) {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries
            .entry(username.to_string())
            .or_insert(LockoutEntry {
                failures: 0,
                window_start: now,
                locked_until: None,
            });

        // A stale window starts over.
        if now - entry.window_start > self.window_secs {
            entry.failures = 0;
            entry.window_start = now;
        }

        entry.failures += 1;
        if entry.failures >= self.threshold {
            entry.locked_until = Some(now + self.lockout_secs);
        }
    }

    /// A successful login clears the slate for this username.
    pub fn record_success(&self, username: &str) {
        self.entries.lock().unwrap().remove(username);
    }

    /// Drop entries that can no longer influence a decision: expired locks
    /// and failure windows that have rolled past. Called from the cleanup task.
    pub fn prune(&self, now: i64) -> usize {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|_, e| {
            let lock_live = e.locked_until.map_or(false, |until| now < until);
            let window_live = now - e.window_start <= self.window_secs;
            lock_live || window_live
        });
        before - entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger() -> LockoutLedger {
        // threshold 5, window 600s, lockout 900s - the defaults.
        LockoutLedger::new(5, 600, 900)
    }

    #[test]
    fn locks_after_threshold_failures() {
        let l = ledger();
        for _ in 0..4 {
            l.record_failure("mallory", 100);
        }
        assert!(!l.is_locked("mallory", 100));
        l.record_failure("mallory", 100);
        assert!(l.is_locked("mallory", 100));
        // And the lock expires after the lockout duration.
        assert!(!l.is_locked("mallory", 100 + 900));
    }

    #[test]
    fn stale_window_resets_the_count() {
        let l = ledger();
        for _ in 0..4 {
            l.record_failure("alice", 100);
        }
        // Fifth failure far outside the window starts a new count.
        l.record_failure("alice", 100 + 601);
        assert!(!l.is_locked("alice", 100 + 601));
    }

    #[test]
    fn success_clears_the_entry() {
        let l = ledger();
        for _ in 0..5 {
            l.record_failure("bob", 100);
        }
        assert!(l.is_locked("bob", 100));
        l.record_success("bob");
        assert!(!l.is_locked("bob", 100));
    }

    #[test]
    fn usernames_are_tracked_independently() {
        let l = ledger();
        for _ in 0..5 {
            l.record_failure("mallory", 100);
        }
        assert!(l.is_locked("mallory", 100));
        assert!(!l.is_locked("alice", 100));
    }

    #[test]
    fn prune_drops_dormant_entries() {
        let l = ledger();
        l.record_failure("old", 100);
        for _ in 0..5 {
            l.record_failure("locked", 100);
        }
        // Past the window but within the lock duration.
        let dropped = l.prune(100 + 700);
        assert_eq!(dropped, 1);
        assert!(l.is_locked("locked", 100 + 700));
        // Once the lock lapses too, everything goes.
        let dropped = l.prune(100 + 2000);
        assert_eq!(dropped, 1);
    }
}

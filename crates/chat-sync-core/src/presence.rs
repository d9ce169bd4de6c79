//! Typing presence: who is composing, and when to tell others we are.

use std::collections::HashMap;

use tokio::time::{Duration, Instant};

use crate::model::UserId;

/// Users currently composing in the current session.
///
/// Each entry expires on its own if no "stopped" notification arrives.
#[derive(Debug, Clone)]
pub struct TypingSet {
    expiry: Duration,
    entries: HashMap<UserId, Instant>,
}

impl TypingSet {
    /// Create an empty set whose entries live for `expiry`.
    #[must_use]
    pub fn new(expiry: Duration) -> Self {
        Self {
            expiry,
            entries: HashMap::new(),
        }
    }

    /// Apply a typing notification. Returns true if the set changed.
    pub fn apply(&mut self, user: UserId, is_typing: bool, now: Instant) -> bool {
        if is_typing {
            self.entries.insert(user, now + self.expiry).is_none()
        } else {
            self.entries.remove(&user).is_some()
        }
    }

    /// Drop entries whose deadline has passed. Returns true if any were dropped.
    pub fn expire(&mut self, now: Instant) -> bool {
        let before = self.entries.len();
        self.entries.retain(|_, deadline| *deadline > now);
        self.entries.len() != before
    }

    /// Earliest pending expiry.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().min().copied()
    }

    /// Active users, sorted for stable display.
    #[must_use]
    pub fn active(&self) -> Vec<UserId> {
        let mut users: Vec<_> = self.entries.keys().cloned().collect();
        users.sort();
        users
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Human-readable indicator, e.g. `"alice, bob are typing..."`.
    #[must_use]
    pub fn label(&self) -> Option<String> {
        let users = self.active();
        match users.len() {
            0 => None,
            1 => Some(format!("{} is typing...", users[0])),
            _ => {
                let names: Vec<&str> = users.iter().map(UserId::as_str).collect();
                Some(format!("{} are typing...", names.join(", ")))
            }
        }
    }
}

/// Outbound typing notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypingSignal {
    Started,
    Stopped,
}

impl TypingSignal {
    #[must_use]
    pub const fn is_typing(self) -> bool {
        matches!(self, Self::Started)
    }
}

/// Coalesces keystrokes into one "started" and one "stopped" signal.
#[derive(Debug, Clone)]
pub struct TypingDebouncer {
    idle: Duration,
    deadline: Option<Instant>,
}

impl TypingDebouncer {
    /// Create a debouncer that reports "stopped" after `idle` without keystrokes.
    #[must_use]
    pub const fn new(idle: Duration) -> Self {
        Self {
            idle,
            deadline: None,
        }
    }

    /// Register a keystroke. Returns `Started` only for the first one of a burst.
    pub fn keystroke(&mut self, now: Instant) -> Option<TypingSignal> {
        let started = self.deadline.is_none();
        self.deadline = Some(now + self.idle);
        started.then_some(TypingSignal::Started)
    }

    /// Returns `Stopped` once the idle period has elapsed.
    pub fn poll(&mut self, now: Instant) -> Option<TypingSignal> {
        match self.deadline {
            Some(deadline) if deadline <= now => {
                self.deadline = None;
                Some(TypingSignal::Stopped)
            }
            _ => None,
        }
    }

    /// End the burst immediately (e.g. the message was sent).
    pub fn flush(&mut self) -> Option<TypingSignal> {
        self.deadline.take().map(|_| TypingSignal::Stopped)
    }

    #[must_use]
    pub const fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.deadline.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_started_then_stopped_empties_set() {
        let now = Instant::now();
        let mut set = TypingSet::new(Duration::from_secs(5));
        assert!(set.apply("u2".into(), true, now));
        assert!(set.apply("u2".into(), false, now + Duration::from_millis(1500)));
        assert!(set.is_empty());
        assert_eq!(set.label(), None);
    }

    #[test]
    fn test_repeated_started_is_not_a_change() {
        let now = Instant::now();
        let mut set = TypingSet::new(Duration::from_secs(5));
        assert!(set.apply("u2".into(), true, now));
        assert!(!set.apply("u2".into(), true, now + Duration::from_secs(1)));
        assert_eq!(set.next_deadline(), Some(now + Duration::from_secs(6)));
    }

    #[test]
    fn test_entries_expire() {
        let now = Instant::now();
        let mut set = TypingSet::new(Duration::from_secs(2));
        set.apply("u2".into(), true, now);
        set.apply("u3".into(), true, now + Duration::from_secs(1));

        assert!(set.expire(now + Duration::from_secs(2)));
        assert_eq!(set.active(), vec![UserId::from("u3")]);
        assert!(!set.expire(now + Duration::from_secs(2)));
    }

    #[test]
    fn test_label() {
        let now = Instant::now();
        let mut set = TypingSet::new(Duration::from_secs(5));
        set.apply("bob".into(), true, now);
        assert_eq!(set.label().as_deref(), Some("bob is typing..."));
        set.apply("alice".into(), true, now);
        assert_eq!(set.label().as_deref(), Some("alice, bob are typing..."));
    }

    #[test]
    fn test_debouncer_coalesces_keystrokes() {
        let now = Instant::now();
        let idle = Duration::from_secs(2);
        let mut debouncer = TypingDebouncer::new(idle);

        assert_eq!(debouncer.keystroke(now), Some(TypingSignal::Started));
        assert_eq!(debouncer.keystroke(now + Duration::from_millis(500)), None);
        assert_eq!(debouncer.keystroke(now + Duration::from_millis(900)), None);

        assert_eq!(debouncer.poll(now + Duration::from_millis(2800)), None);
        assert_eq!(
            debouncer.poll(now + Duration::from_millis(2900)),
            Some(TypingSignal::Stopped)
        );
        assert_eq!(debouncer.poll(now + Duration::from_secs(10)), None);
    }

    #[test]
    fn test_debouncer_flush() {
        let mut debouncer = TypingDebouncer::new(Duration::from_secs(2));
        assert_eq!(debouncer.flush(), None);
        debouncer.keystroke(Instant::now());
        assert_eq!(debouncer.flush(), Some(TypingSignal::Stopped));
        assert!(!debouncer.is_active());
    }
}

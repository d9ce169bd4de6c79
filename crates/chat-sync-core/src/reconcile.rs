//! Message reconciliation.
//!
//! Merges optimistic local entries and server-delivered entries into one
//! ordered, duplicate-free log per session. The reconciler holds no state of
//! its own; every call operates on the log it is handed.
//!
//! Rules applied by [`merge`]:
//! - entries are ordered by timestamp, ties keep insertion order;
//! - a confirmed entry that echoes a pending one (same author, identical
//!   content, timestamps within the [`DedupPolicy`] window) replaces it in
//!   place instead of being appended;
//! - an entry for another session is rejected;
//! - re-applying an entry that is already present changes nothing.

use thiserror::Error;

use crate::model::{Message, Origin, SessionId};

/// Reconciler error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReconcileError {
    #[error("Message for session {actual} cannot be merged into session {expected}")]
    SessionMismatch {
        expected: SessionId,
        actual: SessionId,
    },
    #[error("Message content is empty")]
    EmptyContent,
}

/// What a merge did to the log. Each variant carries the entry's final index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// A new entry was inserted.
    Inserted(usize),
    /// A pending entry was confirmed in place.
    Confirmed(usize),
    /// The entry was already present; the log is unchanged.
    Duplicate(usize),
}

impl MergeOutcome {
    /// Index of the affected entry.
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Inserted(i) | Self::Confirmed(i) | Self::Duplicate(i) => i,
        }
    }

    /// Whether the log changed.
    #[must_use]
    pub const fn changed(self) -> bool {
        !matches!(self, Self::Duplicate(_))
    }
}

/// Timestamp window used when matching a server echo to a pending entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DedupPolicy {
    /// Maximum absolute timestamp difference in milliseconds.
    pub tolerance_ms: u64,
}

impl DedupPolicy {
    /// Require the echoed timestamp to equal the client stamp.
    #[must_use]
    pub const fn exact() -> Self {
        Self { tolerance_ms: 0 }
    }

    #[must_use]
    pub const fn within(tolerance_ms: u64) -> Self {
        Self { tolerance_ms }
    }

    const fn accepts(self, a: i64, b: i64) -> bool {
        a.abs_diff(b) <= self.tolerance_ms
    }
}

fn same_local(a: &Message, b: &Message) -> bool {
    matches!((a.local_id, b.local_id), (Some(x), Some(y)) if x == y)
}

fn same_confirmed(a: &Message, b: &Message) -> bool {
    if a.origin != Origin::Confirmed || b.origin != Origin::Confirmed {
        return false;
    }
    match (&a.server_id, &b.server_id) {
        (Some(x), Some(y)) => x == y,
        _ => a.author == b.author && a.content == b.content && a.timestamp == b.timestamp,
    }
}

fn echoes(pending: &Message, confirmed: &Message, policy: DedupPolicy) -> bool {
    pending.author == confirmed.author
        && pending.content == confirmed.content
        && policy.accepts(pending.timestamp, confirmed.timestamp)
}

fn insert_sorted(log: &mut Vec<Message>, msg: Message) -> usize {
    let at = log.partition_point(|m| m.timestamp <= msg.timestamp);
    log.insert(at, msg);
    at
}

/// Move `log[i]` if a timestamp change broke the ordering.
fn restore_order(log: &mut Vec<Message>, i: usize) -> usize {
    let ts = log[i].timestamp;
    let before_ok = i == 0 || log[i - 1].timestamp <= ts;
    let after_ok = i + 1 >= log.len() || log[i + 1].timestamp >= ts;
    if before_ok && after_ok {
        return i;
    }
    let msg = log.remove(i);
    insert_sorted(log, msg)
}

/// Merge `incoming` into the sorted `log` of `session_id`.
///
/// # Errors
/// Returns `SessionMismatch` if `incoming` belongs to another session and
/// `EmptyContent` if it carries no text. The log is untouched on error.
pub fn merge(
    log: &mut Vec<Message>,
    session_id: &SessionId,
    incoming: Message,
    policy: DedupPolicy,
) -> Result<MergeOutcome, ReconcileError> {
    if incoming.session_id != *session_id {
        return Err(ReconcileError::SessionMismatch {
            expected: session_id.clone(),
            actual: incoming.session_id,
        });
    }
    if !incoming.has_content() {
        return Err(ReconcileError::EmptyContent);
    }

    match incoming.origin {
        Origin::Confirmed => {
            if let Some(i) = log.iter().position(|m| same_confirmed(m, &incoming)) {
                return Ok(MergeOutcome::Duplicate(i));
            }
            if let Some(i) = log
                .iter()
                .position(|m| m.is_pending() && echoes(m, &incoming, policy))
            {
                let local_id = log[i].local_id;
                log[i] = Message {
                    local_id,
                    ..incoming
                };
                return Ok(MergeOutcome::Confirmed(restore_order(log, i)));
            }
            Ok(MergeOutcome::Inserted(insert_sorted(log, incoming)))
        }
        Origin::LocalPending => {
            if let Some(i) = log.iter().position(|m| same_local(m, &incoming)) {
                return Ok(MergeOutcome::Duplicate(i));
            }
            // The echo can overtake the optimistic append.
            if let Some(i) = log.iter().position(|m| {
                m.origin == Origin::Confirmed && m.local_id.is_none() && echoes(&incoming, m, policy)
            }) {
                log[i].local_id = incoming.local_id;
                return Ok(MergeOutcome::Duplicate(i));
            }
            Ok(MergeOutcome::Inserted(insert_sorted(log, incoming)))
        }
    }
}

/// Ordered message log of one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transcript {
    session_id: SessionId,
    entries: Vec<Message>,
}

impl Transcript {
    /// Create an empty transcript.
    #[must_use]
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            entries: Vec::new(),
        }
    }

    /// Build a transcript from a fetched log, skipping entries that do not merge.
    #[must_use]
    pub fn from_messages(
        session_id: SessionId,
        messages: impl IntoIterator<Item = Message>,
        policy: DedupPolicy,
    ) -> Self {
        let mut transcript = Self::new(session_id);
        transcript.merge_all(messages, policy);
        transcript
    }

    /// Merge one message.
    ///
    /// # Errors
    /// See [`merge`].
    pub fn merge(
        &mut self,
        message: Message,
        policy: DedupPolicy,
    ) -> Result<MergeOutcome, ReconcileError> {
        merge(&mut self.entries, &self.session_id, message, policy)
    }

    /// Merge a batch, logging and skipping entries that are rejected.
    pub fn merge_all(&mut self, messages: impl IntoIterator<Item = Message>, policy: DedupPolicy) {
        for message in messages {
            if let Err(e) = self.merge(message, policy) {
                tracing::warn!(session_id = %self.session_id, "Skipping message: {e}");
            }
        }
    }

    /// Move the transcript and all its entries to another session identifier.
    pub fn rekey(&mut self, session_id: SessionId) {
        for entry in &mut self.entries {
            entry.session_id = session_id.clone();
        }
        self.session_id = session_id;
    }

    #[must_use]
    pub const fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    #[must_use]
    pub fn entries(&self) -> &[Message] {
        &self.entries
    }

    #[must_use]
    pub fn last(&self) -> Option<&Message> {
        self.entries.last()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries still awaiting confirmation.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.entries.iter().filter(|m| m.is_pending()).count()
    }
}

//! Session store.
//!
//! Owns the session collection (most recent first), the current-session
//! pointer and every resident message log. Mutations apply locally first;
//! calls to the backing collaborator are handed back as [`Pending`] futures
//! whose [`Completion`] the owner feeds into [`SessionStore::apply`]. The
//! store itself never awaits, so a single task can drive it without locks.

use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use chat_sync_core::{
    CollaboratorError, DedupPolicy, MergeOutcome, Message, ReconcileError, SessionBackend,
    SessionId, SessionInfo, Transcript, UserId, model::now_millis, view::SessionSummary,
};
use futures::{FutureExt, future::BoxFuture};
use thiserror::Error;

/// Session store error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("Session not found: {0}")]
    NotFound(SessionId),
    #[error("No session is selected")]
    NoCurrentSession,
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),
}

/// A backing-collaborator call in flight.
pub type Pending = BoxFuture<'static, Completion>;

/// Identifies one log fetch; only the latest ticket per session is honored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchTicket {
    pub session_id: SessionId,
    seq: u64,
}

/// Result of a backing-collaborator call.
#[derive(Debug)]
pub enum Completion {
    Listed(Result<Vec<SessionInfo>, CollaboratorError>),
    Created {
        local_id: SessionId,
        result: Result<SessionInfo, CollaboratorError>,
    },
    Fetched {
        ticket: FetchTicket,
        result: Result<Vec<Message>, CollaboratorError>,
    },
    Deleted {
        id: SessionId,
        result: Result<(), CollaboratorError>,
    },
    Saved {
        id: SessionId,
        result: Result<(), CollaboratorError>,
    },
}

struct Entry {
    info: SessionInfo,
    transcript: Transcript,
    /// The collaborator's log has been merged in.
    loaded: bool,
}

/// Latest unsaved log per session. Save tasks always write the newest
/// snapshot, so completion order cannot regress the stored log.
#[derive(Default)]
struct SaveSlots {
    latest: Mutex<HashMap<SessionId, Vec<Message>>>,
    write: tokio::sync::Mutex<()>,
}

async fn with_deadline<T>(
    deadline: Option<Duration>,
    call: impl Future<Output = Result<T, CollaboratorError>>,
) -> Result<T, CollaboratorError> {
    match deadline {
        Some(d) => tokio::time::timeout(d, call)
            .await
            .unwrap_or(Err(CollaboratorError::Timeout)),
        None => call.await,
    }
}

/// Session collection with optimistic local mutation.
pub struct SessionStore<B: SessionBackend + 'static> {
    backend: Arc<B>,
    user_id: UserId,
    policy: DedupPolicy,
    deadline: Option<Duration>,
    entries: Vec<Entry>,
    current: Option<SessionId>,
    /// Client-minted id -> server-assigned id.
    aliases: HashMap<SessionId, SessionId>,
    /// Latest fetch sequence per session.
    fetches: HashMap<SessionId, u64>,
    next_seq: u64,
    saves: Arc<SaveSlots>,
}

impl<B: SessionBackend + 'static> SessionStore<B> {
    /// Create an empty store acting for `user_id`.
    #[must_use]
    pub fn new(backend: Arc<B>, user_id: UserId, policy: DedupPolicy) -> Self {
        Self {
            backend,
            user_id,
            policy,
            deadline: None,
            entries: Vec::new(),
            current: None,
            aliases: HashMap::new(),
            fetches: HashMap::new(),
            next_seq: 0,
            saves: Arc::new(SaveSlots::default()),
        }
    }

    /// Treat collaborator calls slower than `deadline` as failed.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Fetch the persisted session list.
    #[must_use]
    pub fn load(&self) -> Pending {
        let backend = Arc::clone(&self.backend);
        let user = self.user_id.clone();
        let deadline = self.deadline;
        async move {
            let result = with_deadline(deadline, backend.list_sessions(&user)).await;
            Completion::Listed(result)
        }
        .boxed()
    }

    /// Create a session, make it current and persist it.
    pub fn create_session(&mut self, name: Option<&str>) -> (SessionInfo, Pending) {
        let draft = SessionInfo::draft(name, now_millis());
        tracing::info!(session_id = %draft.id, name = %draft.name, "Creating session");

        self.entries.insert(
            0,
            Entry {
                info: draft.clone(),
                transcript: Transcript::new(draft.id.clone()),
                loaded: true,
            },
        );
        self.current = Some(draft.id.clone());

        let backend = Arc::clone(&self.backend);
        let user = self.user_id.clone();
        let deadline = self.deadline;
        let sent = draft.clone();
        let pending = async move {
            let result = with_deadline(deadline, backend.create_session(&user, &sent)).await;
            Completion::Created {
                local_id: sent.id,
                result,
            }
        }
        .boxed();

        (draft, pending)
    }

    /// Make `id` current, fetching its log if it is not resident.
    ///
    /// # Errors
    /// Returns `NotFound` if no such session exists; the store is unchanged.
    pub fn select_session(&mut self, id: &SessionId) -> Result<Option<Pending>, StoreError> {
        let id = self
            .resolve(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        self.current = Some(id.clone());
        Ok(self.ensure_loaded(&id))
    }

    /// Remove a session and its log.
    ///
    /// If it was current, the most recent remaining session becomes current.
    /// The local removal stands even if the collaborator later fails.
    ///
    /// # Errors
    /// Returns `NotFound` if no such session exists.
    pub fn delete_session(&mut self, id: &SessionId) -> Result<Vec<Pending>, StoreError> {
        let id = self
            .resolve(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        self.entries.retain(|e| e.info.id != id);
        self.fetches.remove(&id);
        self.aliases.retain(|_, target| *target != id);
        self.saves
            .latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        tracing::info!(session_id = %id, "Deleted session");

        let mut pending = vec![self.delete_remote(id.clone())];
        if self.current.as_ref() == Some(&id) {
            self.current = self.entries.first().map(|e| e.info.id.clone());
            if let Some(next) = self.current.clone() {
                pending.extend(self.ensure_loaded(&next));
            }
        }
        Ok(pending)
    }

    /// Merge a message into a session's log.
    ///
    /// # Errors
    /// Returns `NotFound` for unknown sessions and `Reconcile` if the
    /// reconciler rejects the message. The log is unchanged on error.
    pub fn append_message(
        &mut self,
        session_id: &SessionId,
        mut message: Message,
    ) -> Result<(MergeOutcome, Option<Pending>), StoreError> {
        let id = self
            .resolve(session_id)
            .ok_or_else(|| StoreError::NotFound(session_id.clone()))?;
        if let Some(target) = self.aliases.get(&message.session_id) {
            message.session_id = target.clone();
        }

        let policy = self.policy;
        let entry = self
            .entry_mut(&id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        let outcome = entry.transcript.merge(message, policy)?;
        let snapshot = (outcome.changed() && entry.loaded)
            .then(|| entry.transcript.entries().to_vec());

        let save = snapshot
            .filter(|_| self.backend.requires_incremental_sync())
            .map(|messages| self.save(id, messages));
        Ok((outcome, save))
    }

    /// Fold a collaborator result back into the store.
    ///
    /// Returns follow-up calls to run. Fetch results for a session that is no
    /// longer current, or superseded by a newer fetch, are discarded.
    ///
    /// # Errors
    /// Returns `Collaborator` if the call failed. Local state that was applied
    /// optimistically is kept.
    pub fn apply(&mut self, completion: Completion) -> Result<Vec<Pending>, StoreError> {
        match completion {
            Completion::Listed(result) => {
                let listed = result?;
                Ok(self.merge_listing(listed).into_iter().collect())
            }
            Completion::Created { local_id, result } => {
                let server = result?;
                Ok(self.adopt_created(&local_id, server).into_iter().collect())
            }
            Completion::Fetched { ticket, result } => {
                let latest = self.fetches.get(&ticket.session_id) == Some(&ticket.seq);
                if latest {
                    self.fetches.remove(&ticket.session_id);
                }
                if !latest || self.current.as_ref() != Some(&ticket.session_id) {
                    tracing::debug!(session_id = %ticket.session_id, "Discarding stale fetch result");
                    return Ok(Vec::new());
                }

                let messages = result?;
                let policy = self.policy;
                let Some(entry) = self.entry_mut(&ticket.session_id) else {
                    return Ok(Vec::new());
                };
                let fetched = messages.clone();
                entry.transcript.merge_all(messages, policy);
                entry.loaded = true;
                // Messages merged before the fetch have not been saved yet.
                let snapshot = (entry.transcript.entries() != fetched.as_slice())
                    .then(|| entry.transcript.entries().to_vec());

                Ok(snapshot
                    .filter(|_| self.backend.requires_incremental_sync())
                    .map(|messages| self.save(ticket.session_id, messages))
                    .into_iter()
                    .collect())
            }
            Completion::Deleted { id, result } => match result {
                Ok(()) => Ok(Vec::new()),
                Err(CollaboratorError::NotFound(_)) => {
                    tracing::debug!(session_id = %id, "Session already absent at collaborator");
                    Ok(Vec::new())
                }
                Err(e) => Err(e.into()),
            },
            Completion::Saved { result, .. } => result.map(|()| Vec::new()).map_err(Into::into),
        }
    }

    fn merge_listing(&mut self, listed: Vec<SessionInfo>) -> Option<Pending> {
        for info in listed {
            if self.resolve(&info.id).is_some() {
                continue;
            }
            self.entries.push(Entry {
                transcript: Transcript::new(info.id.clone()),
                info,
                loaded: false,
            });
        }
        self.entries
            .sort_by(|a, b| b.info.created_at.cmp(&a.info.created_at));

        if self.current.is_none() {
            self.current = self.entries.first().map(|e| e.info.id.clone());
        }
        let current = self.current.clone()?;
        self.ensure_loaded(&current)
    }

    fn adopt_created(&mut self, local_id: &SessionId, server: SessionInfo) -> Option<Pending> {
        if server.id == *local_id {
            return None;
        }
        let Some(entry) = self.entry_mut(local_id) else {
            // Deleted locally before the collaborator answered.
            return Some(self.delete_remote(server.id));
        };

        tracing::debug!(local = %local_id, server = %server.id, "Adopting server session id");
        entry.transcript.rekey(server.id.clone());
        entry.info = server.clone();
        if self.current.as_ref() == Some(local_id) {
            self.current = Some(server.id.clone());
        }
        if let Some(seq) = self.fetches.remove(local_id) {
            self.fetches.insert(server.id.clone(), seq);
        }
        self.aliases.insert(local_id.clone(), server.id);
        None
    }

    fn ensure_loaded(&mut self, id: &SessionId) -> Option<Pending> {
        let loaded = self.entries.iter().any(|e| e.info.id == *id && e.loaded);
        if loaded || self.fetches.contains_key(id) {
            return None;
        }

        self.next_seq += 1;
        let ticket = FetchTicket {
            session_id: id.clone(),
            seq: self.next_seq,
        };
        self.fetches.insert(id.clone(), ticket.seq);

        let backend = Arc::clone(&self.backend);
        let user = self.user_id.clone();
        let deadline = self.deadline;
        Some(
            async move {
                let result = with_deadline(
                    deadline,
                    backend.list_messages(&ticket.session_id, &user),
                )
                .await;
                Completion::Fetched { ticket, result }
            }
            .boxed(),
        )
    }

    fn delete_remote(&self, id: SessionId) -> Pending {
        let backend = Arc::clone(&self.backend);
        let deadline = self.deadline;
        async move {
            let result = with_deadline(deadline, async {
                // A session with no stored messages may have no log to delete.
                match backend.delete_messages(&id).await {
                    Ok(()) | Err(CollaboratorError::NotFound(_)) => {}
                    Err(e) => return Err(e),
                }
                backend.delete_session(&id).await
            })
            .await;
            Completion::Deleted { id, result }
        }
        .boxed()
    }

    fn save(&self, id: SessionId, messages: Vec<Message>) -> Pending {
        self.saves
            .latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), messages);

        let slots = Arc::clone(&self.saves);
        let backend = Arc::clone(&self.backend);
        let deadline = self.deadline;
        async move {
            let _write = slots.write.lock().await;
            let latest = slots
                .latest
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&id);
            let result = match latest {
                Some(messages) => {
                    with_deadline(deadline, backend.save_messages(&id, &messages)).await
                }
                None => Ok(()),
            };
            Completion::Saved { id, result }
        }
        .boxed()
    }

    fn entry(&self, id: &SessionId) -> Option<&Entry> {
        self.entries.iter().find(|e| e.info.id == *id)
    }

    fn entry_mut(&mut self, id: &SessionId) -> Option<&mut Entry> {
        self.entries.iter_mut().find(|e| e.info.id == *id)
    }

    /// Canonical identifier for `id`, following server re-keys.
    #[must_use]
    pub fn resolve(&self, id: &SessionId) -> Option<SessionId> {
        if self.entry(id).is_some() {
            return Some(id.clone());
        }
        self.aliases
            .get(id)
            .filter(|target| self.entry(target).is_some())
            .cloned()
    }

    #[must_use]
    pub const fn current(&self) -> Option<&SessionId> {
        self.current.as_ref()
    }

    #[must_use]
    pub const fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Sessions, most recent first.
    pub fn sessions(&self) -> impl Iterator<Item = &SessionInfo> {
        self.entries.iter().map(|e| &e.info)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resident log of a session; may be partial until loaded.
    #[must_use]
    pub fn transcript(&self, id: &SessionId) -> Option<&Transcript> {
        self.entry(id).map(|e| &e.transcript)
    }

    #[must_use]
    pub fn current_transcript(&self) -> Option<&Transcript> {
        self.current.as_ref().and_then(|id| self.transcript(id))
    }

    /// Whether the collaborator's log for `id` has been merged in.
    #[must_use]
    pub fn is_loaded(&self, id: &SessionId) -> bool {
        self.entry(id).is_some_and(|e| e.loaded)
    }

    /// Whether a log fetch for `id` is in flight.
    #[must_use]
    pub fn is_loading(&self, id: &SessionId) -> bool {
        self.fetches.contains_key(id)
    }

    /// Sidebar summaries, most recent first.
    #[must_use]
    pub fn summaries(&self) -> Vec<SessionSummary> {
        self.entries
            .iter()
            .map(|e| {
                let is_current = self.current.as_ref() == Some(&e.info.id);
                let mut summary = SessionSummary::new(&e.info, Some(&e.transcript), is_current);
                if !e.loaded {
                    summary.message_count = None;
                }
                summary
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chat_sync_core::Origin;
    use tokio_test::assert_err;

    use super::*;
    use crate::storage::MemoryBackend;

    fn store(backend: &Arc<MemoryBackend>) -> SessionStore<MemoryBackend> {
        SessionStore::new(Arc::clone(backend), "u1".into(), DedupPolicy::exact())
    }

    /// Run pending calls (and their follow-ups) to completion.
    async fn drive<B: SessionBackend + 'static>(store: &mut SessionStore<B>, pending: Vec<Pending>) {
        let mut queue = pending;
        while let Some(call) = queue.pop() {
            let completion = call.await;
            queue.extend(store.apply(completion).unwrap());
        }
    }

    /// Memory backend that counts saves and can act as an API that has no
    /// message log for any session.
    #[derive(Default)]
    struct CountingSaves {
        inner: MemoryBackend,
        saves: AtomicUsize,
        missing_logs: bool,
    }

    #[async_trait]
    impl SessionBackend for CountingSaves {
        async fn list_sessions(&self, user_id: &UserId) -> Result<Vec<SessionInfo>, CollaboratorError> {
            self.inner.list_sessions(user_id).await
        }

        async fn create_session(
            &self,
            user_id: &UserId,
            draft: &SessionInfo,
        ) -> Result<SessionInfo, CollaboratorError> {
            self.inner.create_session(user_id, draft).await
        }

        async fn delete_session(&self, id: &SessionId) -> Result<(), CollaboratorError> {
            self.inner.delete_session(id).await
        }

        async fn list_messages(
            &self,
            session_id: &SessionId,
            user_id: &UserId,
        ) -> Result<Vec<Message>, CollaboratorError> {
            self.inner.list_messages(session_id, user_id).await
        }

        async fn delete_messages(&self, session_id: &SessionId) -> Result<(), CollaboratorError> {
            if self.missing_logs {
                return Err(CollaboratorError::NotFound(session_id.to_string()));
            }
            self.inner.delete_messages(session_id).await
        }

        fn requires_incremental_sync(&self) -> bool {
            true
        }

        async fn save_messages(
            &self,
            session_id: &SessionId,
            messages: &[Message],
        ) -> Result<(), CollaboratorError> {
            self.saves.fetch_add(1, Ordering::SeqCst);
            self.inner.save_messages(session_id, messages).await
        }
    }

    fn seeded() -> Arc<MemoryBackend> {
        let backend = MemoryBackend::new();
        backend.insert_session(&"u1".into(), SessionInfo::new("A".into(), "Alpha", 100));
        backend.insert_session(&"u1".into(), SessionInfo::new("B".into(), "Beta", 200));
        backend.insert_messages(
            &"A".into(),
            vec![Message::confirmed("A".into(), "u2".into(), "from A", 10)],
        );
        backend.insert_messages(
            &"B".into(),
            vec![Message::confirmed("B".into(), "u2".into(), "from B", 20)],
        );
        Arc::new(backend)
    }

    #[tokio::test]
    async fn test_load_selects_most_recent() {
        let backend = seeded();
        let mut store = store(&backend);
        let load = store.load();
        drive(&mut store, vec![load]).await;

        let ids: Vec<_> = store.sessions().map(|s| s.id.as_str().to_string()).collect();
        assert_eq!(ids, ["B", "A"]);
        assert_eq!(store.current(), Some(&SessionId::from("B")));
        assert!(store.is_loaded(&"B".into()));
        assert!(!store.is_loaded(&"A".into()));
        assert_eq!(store.current_transcript().unwrap().entries()[0].content, "from B");
    }

    #[tokio::test]
    async fn test_create_session_goes_first_and_is_persisted() {
        let backend = seeded();
        let mut store = store(&backend);
        let load = store.load();
        drive(&mut store, vec![load]).await;

        let (info, pending) = store.create_session(Some("Fresh"));
        assert_eq!(store.current(), Some(&info.id));
        assert_eq!(store.sessions().next().unwrap().id, info.id);

        drive(&mut store, vec![pending]).await;
        let persisted = backend.list_sessions(&"u1".into()).await.unwrap();
        assert!(persisted.iter().any(|s| s.id == info.id && s.name == "Fresh"));
    }

    #[tokio::test]
    async fn test_local_send_then_echo_yields_one_confirmed_message() {
        let backend = Arc::new(MemoryBackend::new());
        let mut store = store(&backend);
        let (s1, pending) = store.create_session(None);
        drive(&mut store, vec![pending]).await;

        let local = Message::local(s1.id.clone(), "u1".into(), "hi", 1000);
        let (_, save) = store.append_message(&s1.id, local).unwrap();
        drive(&mut store, save.into_iter().collect()).await;

        let echo = Message::confirmed(s1.id.clone(), "u1".into(), "hi", 1000);
        let (outcome, save) = store.append_message(&s1.id, echo).unwrap();
        assert!(matches!(outcome, MergeOutcome::Confirmed(0)));
        drive(&mut store, save.into_iter().collect()).await;

        let log = store.transcript(&s1.id).unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log.entries()[0].origin, Origin::Confirmed);

        let stored = backend.list_messages(&s1.id, &"u1".into()).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].origin, Origin::Confirmed);
    }

    #[tokio::test]
    async fn test_select_unknown_session_leaves_state() {
        let backend = seeded();
        let mut store = store(&backend);
        let load = store.load();
        drive(&mut store, vec![load]).await;

        let err = assert_err!(store.select_session(&"nope".into()).map(|_| ()));
        assert_eq!(err, StoreError::NotFound("nope".into()));
        assert_eq!(store.current(), Some(&SessionId::from("B")));
    }

    #[tokio::test]
    async fn test_select_resident_session_does_not_refetch() {
        let backend = seeded();
        let mut store = store(&backend);
        let load = store.load();
        drive(&mut store, vec![load]).await;

        assert!(store.select_session(&"A".into()).unwrap().is_some());
        assert!(store.select_session(&"B".into()).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stale_fetch_is_discarded_after_switch() {
        let backend = seeded();
        let mut store = store(&backend);
        let listed = store.load().await;
        // Apply the listing but hold back B's fetch.
        let fetch_b = store.apply(listed).unwrap().pop().unwrap();

        let fetch_a = store.select_session(&"A".into()).unwrap().unwrap();
        let back_to_b = store.select_session(&"B".into()).unwrap();
        assert!(back_to_b.is_none(), "B fetch still in flight");

        // A's result resolves after the switch back to B.
        let a_done = fetch_a.await;
        assert!(store.apply(a_done).unwrap().is_empty());
        assert!(!store.is_loaded(&"A".into()));
        assert!(store.transcript(&"A".into()).unwrap().is_empty());

        let b_done = fetch_b.await;
        store.apply(b_done).unwrap();
        assert_eq!(store.current(), Some(&SessionId::from("B")));
        let contents: Vec<_> = store
            .current_transcript()
            .unwrap()
            .entries()
            .iter()
            .map(|m| m.content.as_str())
            .collect();
        assert_eq!(contents, ["from B"]);

        // A is fetched afresh on the next visit.
        assert!(store.select_session(&"A".into()).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_fetch_merges_with_messages_appended_meanwhile() {
        let backend = seeded();
        let mut store = store(&backend);
        let listed = store.load().await;
        let fetch_b = store.apply(listed).unwrap().pop().unwrap();

        let local = Message::local("B".into(), "u1".into(), "typed early", 30);
        let (_, save) = store.append_message(&"B".into(), local).unwrap();
        assert!(save.is_none(), "partial logs are not saved");

        drive(&mut store, vec![fetch_b]).await;
        let log = store.current_transcript().unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log.pending_count(), 1);

        let stored = backend.list_messages(&"B".into(), &"u1".into()).await.unwrap();
        let contents: Vec<_> = stored.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["from B", "typed early"]);
    }

    #[tokio::test]
    async fn test_message_for_unvisited_session_is_saved_once_fetched() {
        let backend = seeded();
        let mut store = store(&backend);
        let load = store.load();
        drive(&mut store, vec![load]).await;

        let broadcast = Message::confirmed("A".into(), "u2".into(), "hello A", 50);
        let (outcome, save) = store.append_message(&"A".into(), broadcast).unwrap();
        assert!(outcome.changed());
        assert!(save.is_none());

        let fetch = store.select_session(&"A".into()).unwrap();
        drive(&mut store, fetch.into_iter().collect()).await;

        let stored = backend.list_messages(&"A".into(), &"u1".into()).await.unwrap();
        let contents: Vec<_> = stored.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["from A", "hello A"]);
    }

    #[tokio::test]
    async fn test_fetch_with_nothing_new_is_not_saved_back() {
        let backend = Arc::new(CountingSaves::default());
        backend
            .inner
            .insert_session(&"u1".into(), SessionInfo::new("A".into(), "Alpha", 100));
        backend.inner.insert_messages(
            &"A".into(),
            vec![Message::confirmed("A".into(), "u2".into(), "from A", 10)],
        );
        let mut store = SessionStore::new(Arc::clone(&backend), "u1".into(), DedupPolicy::exact());
        let load = store.load();
        drive(&mut store, vec![load]).await;

        assert!(store.is_loaded(&"A".into()));
        assert_eq!(backend.saves.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_delete_current_selects_remaining_and_loads_it() {
        let backend = seeded();
        let mut store = store(&backend);
        let load = store.load();
        drive(&mut store, vec![load]).await;

        let pending = store.delete_session(&"B".into()).unwrap();
        assert_eq!(store.current(), Some(&SessionId::from("A")));
        drive(&mut store, pending).await;

        assert!(store.is_loaded(&"A".into()));
        assert_eq!(store.current_transcript().unwrap().len(), 1);
        let remaining = backend.list_sessions(&"u1".into()).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert!(
            backend
                .list_messages(&"B".into(), &"u1".into())
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_delete_without_message_log_still_deletes_session() {
        let backend = Arc::new(CountingSaves {
            missing_logs: true,
            ..CountingSaves::default()
        });
        backend
            .inner
            .insert_session(&"u1".into(), SessionInfo::new("A".into(), "Alpha", 100));
        let mut store = SessionStore::new(Arc::clone(&backend), "u1".into(), DedupPolicy::exact());
        let load = store.load();
        drive(&mut store, vec![load]).await;

        let pending = store.delete_session(&"A".into()).unwrap();
        for call in pending {
            let follow_ups = store.apply(call.await).unwrap();
            assert!(follow_ups.is_empty());
        }
        assert!(backend.list_sessions(&"u1".into()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_last_session_clears_current() {
        let backend = Arc::new(MemoryBackend::new());
        let mut store = store(&backend);
        let (only, pending) = store.create_session(None);
        drive(&mut store, vec![pending]).await;

        let pending = store.delete_session(&only.id).unwrap();
        drive(&mut store, pending).await;

        assert_eq!(store.current(), None);
        assert!(store.current_transcript().is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_append_to_unknown_session() {
        let backend = Arc::new(MemoryBackend::new());
        let mut store = store(&backend);
        let msg = Message::confirmed("ghost".into(), "u2".into(), "boo", 1);
        let err = assert_err!(store.append_message(&"ghost".into(), msg).map(|_| ()));
        assert_eq!(err, StoreError::NotFound("ghost".into()));
    }

    #[tokio::test]
    async fn test_append_rejects_cross_session_message() {
        let backend = seeded();
        let mut store = store(&backend);
        let load = store.load();
        drive(&mut store, vec![load]).await;

        let stray = Message::confirmed("A".into(), "u2".into(), "wrong place", 1);
        let err = assert_err!(store.append_message(&"B".into(), stray).map(|_| ()));
        assert!(matches!(
            err,
            StoreError::Reconcile(ReconcileError::SessionMismatch { .. })
        ));
        assert_eq!(store.current_transcript().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_server_assigned_id_is_adopted() {
        let backend = Arc::new(MemoryBackend::new().assigning_ids());
        let mut store = store(&backend);
        let (draft, pending) = store.create_session(Some("Remote"));
        let local = Message::local(draft.id.clone(), "u1".into(), "early", 5);
        store.append_message(&draft.id, local).unwrap();

        drive(&mut store, vec![pending]).await;

        let current = store.current().unwrap().clone();
        assert_ne!(current, draft.id);
        assert_eq!(store.resolve(&draft.id), Some(current.clone()));
        assert_eq!(store.transcript(&current).unwrap().entries()[0].session_id, current);

        // A late echo addressed to the client id still lands.
        let echo = Message::confirmed(draft.id.clone(), "u1".into(), "early", 5);
        let (outcome, _) = store.append_message(&draft.id, echo).unwrap();
        assert!(matches!(outcome, MergeOutcome::Confirmed(0)));
    }

    #[tokio::test]
    async fn test_summaries() {
        let backend = seeded();
        let mut store = store(&backend);
        let load = store.load();
        drive(&mut store, vec![load]).await;

        let summaries = store.summaries();
        assert_eq!(summaries[0].preview, "from B");
        assert_eq!(summaries[0].message_count, Some(1));
        assert!(summaries[0].is_current);
        assert_eq!(summaries[1].preview, "No messages");
        assert_eq!(summaries[1].message_count, None);
    }
}

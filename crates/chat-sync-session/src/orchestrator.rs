//! Synchronization orchestrator.
//!
//! One task owns the channel, the session store and the typing state, and
//! serializes everything that mutates them: channel events (forwarded by
//! listeners into a queue), collaborator completions, timers and UI intents.

use std::sync::Arc;

use chat_sync_core::{
    ClientConfig, ClientIdentity, CollaboratorError, ConnectionState, ErrorKind, Message, Notice,
    ReconcileError, SessionBackend, SessionId, SyncUpdate, TypingDebouncer, TypingSet,
    TypingSignal, ViewFeed, ViewModel, model::now_millis, view::MessageView,
};
use chat_sync_transport::{
    ChannelEvent, ClientEvent, EventChannel, EventKind, ListenerId, TransportError, TypingEvent,
};
use futures::stream::BoxStream;
use thiserror::Error;
use tokio::{
    sync::mpsc,
    task::{JoinError, JoinSet},
    time::{Instant, sleep_until},
};

use crate::store::{Completion, Pending, SessionStore, StoreError};

/// Orchestrator error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("Cannot send an empty message")]
    EmptyMessage,
    #[error("Synchronizer is shut down")]
    ShutDown,
}

impl SyncError {
    /// User-facing failure class.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport(TransportError::Auth(_))
            | Self::Store(StoreError::Collaborator(CollaboratorError::Unauthorized)) => {
                ErrorKind::Auth
            }
            Self::Transport(_) => ErrorKind::Transport,
            Self::Store(StoreError::NotFound(_)) => ErrorKind::NotFound,
            Self::Store(StoreError::Reconcile(ReconcileError::SessionMismatch { .. })) => {
                ErrorKind::SessionMismatch
            }
            Self::Store(StoreError::Collaborator(_)) => ErrorKind::Collaborator,
            Self::Store(StoreError::NoCurrentSession | StoreError::Reconcile(_))
            | Self::EmptyMessage
            | Self::ShutDown => ErrorKind::Usage,
        }
    }

    #[must_use]
    pub const fn is_auth(&self) -> bool {
        matches!(self.kind(), ErrorKind::Auth)
    }
}

/// A user action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    /// Send a message to the current session.
    Send(String),
    /// The user typed in the composer.
    Keystroke,
    SwitchSession(SessionId),
    NewSession(Option<String>),
    DeleteSession(SessionId),
    /// Reconnect now and reset the automatic reconnect budget.
    Reconnect,
}

enum Wake {
    Channel(ChannelEvent),
    Completed(Completion),
    TaskFailed(JoinError),
    TypingExpiry,
    TypingIdle,
    ReconnectDue,
    Intent(Option<Intent>),
}

/// Drives a channel and a session store from a single task.
pub struct SyncOrchestrator<C: EventChannel, B: SessionBackend + 'static> {
    config: ClientConfig,
    identity: ClientIdentity,
    channel: C,
    store: SessionStore<B>,
    typing: TypingSet,
    debouncer: TypingDebouncer,
    /// Session the outbound "typing started" was sent for.
    typing_session: Option<SessionId>,
    events_tx: mpsc::UnboundedSender<ChannelEvent>,
    events_rx: mpsc::UnboundedReceiver<ChannelEvent>,
    listener_ids: Vec<ListenerId>,
    tasks: JoinSet<Completion>,
    feed: Arc<ViewFeed>,
    /// Last connection state seen through the event queue.
    connection: ConnectionState,
    auth_required: bool,
    attempts_left: u32,
    reconnect_at: Option<Instant>,
    last_view: Option<ViewModel>,
    closed: bool,
}

impl<C: EventChannel, B: SessionBackend + 'static> SyncOrchestrator<C, B> {
    #[must_use]
    pub fn new(config: ClientConfig, identity: ClientIdentity, channel: C, backend: Arc<B>) -> Self {
        let store = SessionStore::new(backend, identity.user_id.clone(), config.dedup_policy())
            .with_deadline(config.collaborator_timeout());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            typing: TypingSet::new(config.typing_expiry()),
            debouncer: TypingDebouncer::new(config.typing_idle()),
            feed: Arc::new(ViewFeed::new(config.notice_history)),
            attempts_left: config.reconnect.max_attempts,
            config,
            identity,
            channel,
            store,
            typing_session: None,
            events_tx,
            events_rx,
            listener_ids: Vec::new(),
            tasks: JoinSet::new(),
            connection: ConnectionState::Disconnected,
            auth_required: false,
            reconnect_at: None,
            last_view: None,
            closed: false,
        }
    }

    /// Register channel listeners, load persisted sessions and connect.
    ///
    /// Sessions keep loading even if the connection fails.
    ///
    /// # Errors
    /// Returns the connection error (also published as a notice).
    pub async fn start(&mut self) -> Result<(), SyncError> {
        if self.closed {
            return Err(SyncError::ShutDown);
        }
        if self.listener_ids.is_empty() {
            for kind in [EventKind::Message, EventKind::Typing, EventKind::ConnectionChange] {
                let tx = self.events_tx.clone();
                let id = self.channel.on_event(kind, move |event| {
                    // Fails only once the orchestrator is gone.
                    let _ = tx.send(event.clone());
                });
                self.listener_ids.push(id);
            }
        }

        let load = self.store.load();
        self.spawn(load);

        let result = self.connect().await;
        if let Err(e) = &result {
            self.report(e);
        }
        self.publish_view();
        result
    }

    /// Apply one user intent.
    ///
    /// # Errors
    /// Returns the failure, which is also published as a notice. State is
    /// left as it was before the intent, apart from optimistic mutations.
    pub async fn handle_intent(&mut self, intent: Intent) -> Result<(), SyncError> {
        let result = self.dispatch(intent).await;
        if let Err(e) = &result {
            self.report(e);
        }
        self.publish_view();
        result
    }

    async fn dispatch(&mut self, intent: Intent) -> Result<(), SyncError> {
        if self.closed {
            return Err(SyncError::ShutDown);
        }
        match intent {
            Intent::Send(text) => self.send_message(&text),
            Intent::Keystroke => {
                let Some(current) = self.store.current().cloned() else {
                    return Ok(());
                };
                if let Some(signal) = self.debouncer.keystroke(Instant::now()) {
                    self.send_typing(&current, signal);
                    self.typing_session = Some(current);
                }
                Ok(())
            }
            Intent::SwitchSession(id) => {
                let fetch = self.store.select_session(&id)?;
                self.spawn_all(fetch);
                self.after_session_change();
                Ok(())
            }
            Intent::NewSession(name) => {
                let (info, pending) = self.store.create_session(name.as_deref());
                tracing::debug!(session_id = %info.id, "New session is current");
                self.spawn(pending);
                self.after_session_change();
                Ok(())
            }
            Intent::DeleteSession(id) => {
                let pending = self.store.delete_session(&id)?;
                self.spawn_all(pending);
                self.after_session_change();
                Ok(())
            }
            Intent::Reconnect => {
                self.attempts_left = self.config.reconnect.max_attempts;
                let result = self.connect().await;
                if result.is_err() {
                    self.schedule_reconnect();
                }
                result
            }
        }
    }

    fn send_message(&mut self, text: &str) -> Result<(), SyncError> {
        let content = text.trim();
        if content.is_empty() {
            return Err(SyncError::EmptyMessage);
        }
        let current = self
            .store
            .current()
            .cloned()
            .ok_or(StoreError::NoCurrentSession)?;

        let message = Message::local(
            current.clone(),
            self.identity.user_id.clone(),
            content,
            now_millis(),
        );
        let outbound = ClientEvent::message(&message);
        let (_, save) = self.store.append_message(&current, message)?;
        self.spawn_all(save);

        if self.channel.state() == ConnectionState::Connected {
            self.channel.send(outbound);
        } else {
            // Stays pending; no rollback.
            self.feed.push_notice(Notice::error(
                ErrorKind::Transport,
                "Not connected; message kept as pending",
                now_millis(),
            ));
        }
        self.stop_typing();
        Ok(())
    }

    /// Wait for the next event and process it.
    ///
    /// Returns false once shut down. Blocks while nothing is pending.
    pub async fn step(&mut self) -> bool {
        if self.closed {
            return false;
        }
        let wake = self.wait(None).await;
        self.process(wake).await;
        true
    }

    /// Process queued channel events and in-flight collaborator calls until
    /// both are exhausted. Timers are left alone.
    pub async fn drain(&mut self) {
        loop {
            while let Ok(event) = self.events_rx.try_recv() {
                self.process(Wake::Channel(event)).await;
            }
            match self.tasks.join_next().await {
                Some(Ok(completion)) => self.process(Wake::Completed(completion)).await,
                Some(Err(e)) => self.process(Wake::TaskFailed(e)).await,
                None => break,
            }
        }
    }

    /// Serve `intents` until its senders are dropped, then shut down.
    pub async fn run(&mut self, mut intents: mpsc::Receiver<Intent>) {
        while !self.closed {
            match self.wait(Some(&mut intents)).await {
                Wake::Intent(None) => break,
                wake => self.process(wake).await,
            }
        }
        self.shutdown();
    }

    async fn wait(&mut self, intents: Option<&mut mpsc::Receiver<Intent>>) -> Wake {
        let expiry = self.typing.next_deadline();
        let idle = self.debouncer.deadline();
        let reconnect = self.reconnect_at;
        let has_tasks = !self.tasks.is_empty();
        let has_intents = intents.is_some();

        tokio::select! {
            Some(event) = self.events_rx.recv() => Wake::Channel(event),
            Some(joined) = self.tasks.join_next(), if has_tasks => match joined {
                Ok(completion) => Wake::Completed(completion),
                Err(e) => Wake::TaskFailed(e),
            },
            () = sleep_until(expiry.unwrap_or_else(Instant::now)), if expiry.is_some() => Wake::TypingExpiry,
            () = sleep_until(idle.unwrap_or_else(Instant::now)), if idle.is_some() => Wake::TypingIdle,
            () = sleep_until(reconnect.unwrap_or_else(Instant::now)), if reconnect.is_some() => Wake::ReconnectDue,
            intent = async {
                match intents {
                    Some(rx) => rx.recv().await,
                    None => std::future::pending().await,
                }
            }, if has_intents => Wake::Intent(intent),
        }
    }

    async fn process(&mut self, wake: Wake) {
        match wake {
            Wake::Channel(event) => self.on_channel_event(event),
            Wake::Completed(completion) => self.on_completion(completion),
            Wake::TaskFailed(e) => tracing::error!(error = %e, "Collaborator task failed"),
            Wake::TypingExpiry => {
                self.typing.expire(Instant::now());
            }
            Wake::TypingIdle => {
                if let Some(signal) = self.debouncer.poll(Instant::now()) {
                    self.end_typing(signal);
                }
            }
            Wake::ReconnectDue => {
                self.reconnect_at = None;
                tracing::info!(attempts_left = self.attempts_left, "Reconnecting");
                if let Err(e) = self.connect().await {
                    self.report(&e);
                    self.schedule_reconnect();
                }
            }
            Wake::Intent(Some(intent)) => {
                // Failures are published as notices.
                let _ = self.handle_intent(intent).await;
            }
            Wake::Intent(None) => {}
        }
        self.publish_view();
    }

    fn on_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Message(message) => self.on_message(message),
            ChannelEvent::Typing(typing) => self.on_typing(typing),
            ChannelEvent::ConnectionChange(state) => self.on_connection_change(state),
        }
    }

    fn on_message(&mut self, message: Message) {
        let Some(session) = self.store.resolve(&message.session_id) else {
            tracing::warn!(session_id = %message.session_id, "Dropping message for unknown session");
            return;
        };
        let author = message.author.clone();
        match self.store.append_message(&session, message) {
            Ok((_, save)) => self.spawn_all(save),
            Err(e) => {
                tracing::warn!(session_id = %session, error = %e, "Rejected inbound message");
                return;
            }
        }
        if self.store.current() == Some(&session) {
            self.typing.apply(author, false, Instant::now());
        }
    }

    fn on_typing(&mut self, event: TypingEvent) {
        if event.author == self.identity.user_id {
            return;
        }
        let Some(current) = self.store.current() else {
            return;
        };
        let elsewhere = event
            .session_id
            .as_ref()
            .is_some_and(|session| self.store.resolve(session).as_ref() != Some(current));
        if elsewhere {
            return;
        }
        self.typing
            .apply(event.author, event.is_typing, Instant::now());
    }

    fn on_connection_change(&mut self, state: ConnectionState) {
        let previous = std::mem::replace(&mut self.connection, state);
        tracing::info!(from = %previous, to = %state, "Connection state changed");
        match state {
            ConnectionState::Connected => {
                self.auth_required = false;
                self.attempts_left = self.config.reconnect.max_attempts;
                self.reconnect_at = None;
            }
            ConnectionState::Disconnected if previous == ConnectionState::Connected => {
                self.typing.clear();
                self.feed.push_notice(Notice::error(
                    ErrorKind::Transport,
                    "Connection lost",
                    now_millis(),
                ));
                self.schedule_reconnect();
            }
            _ => {}
        }
    }

    fn on_completion(&mut self, completion: Completion) {
        match self.store.apply(completion) {
            Ok(follow_ups) => self.spawn_all(follow_ups),
            Err(e) => {
                if matches!(e, StoreError::Collaborator(CollaboratorError::Unauthorized)) {
                    self.auth_required = true;
                }
                self.report(&SyncError::Store(e));
            }
        }
    }

    async fn connect(&mut self) -> Result<(), SyncError> {
        self.reconnect_at = None;
        match self.channel.connect(&self.identity.credential).await {
            Ok(handle) => {
                tracing::debug!(?handle, "Channel connected");
                self.auth_required = false;
                Ok(())
            }
            Err(e) => {
                if e.is_auth() {
                    self.auth_required = true;
                    self.attempts_left = 0;
                }
                Err(e.into())
            }
        }
    }

    fn schedule_reconnect(&mut self) {
        if self.closed || self.auth_required {
            return;
        }
        if self.attempts_left == 0 {
            if self.config.reconnect.max_attempts > 0 {
                self.feed.push_notice(Notice::error(
                    ErrorKind::Transport,
                    "Reconnect attempts exhausted",
                    now_millis(),
                ));
            }
            return;
        }
        self.attempts_left -= 1;
        self.reconnect_at = Some(Instant::now() + self.config.reconnect.backoff());
    }

    fn after_session_change(&mut self) {
        if self.typing_session.as_ref() != self.store.current() {
            self.stop_typing();
        }
        self.typing.clear();
    }

    fn stop_typing(&mut self) {
        if let Some(signal) = self.debouncer.flush() {
            self.end_typing(signal);
        }
    }

    fn end_typing(&mut self, signal: TypingSignal) {
        if let Some(session) = self.typing_session.take() {
            self.send_typing(&session, signal);
        }
    }

    fn send_typing(&self, session: &SessionId, signal: TypingSignal) {
        self.channel.send(ClientEvent::typing(
            session.clone(),
            self.identity.user_id.clone(),
            signal.is_typing(),
        ));
    }

    fn spawn(&mut self, pending: Pending) {
        self.tasks.spawn(pending);
    }

    fn spawn_all(&mut self, pending: impl IntoIterator<Item = Pending>) {
        for p in pending {
            self.spawn(p);
        }
    }

    fn report(&self, error: &SyncError) {
        tracing::warn!(error = %error, kind = ?error.kind(), "Operation failed");
        self.feed
            .push_notice(Notice::error(error.kind(), error.to_string(), now_millis()));
    }

    fn build_view(&self) -> ViewModel {
        let current = self.store.current().cloned();
        let me = &self.identity.user_id;
        ViewModel {
            connection: self.channel.state(),
            auth_required: self.auth_required,
            sessions: self.store.summaries(),
            loading: current.as_ref().is_some_and(|id| self.store.is_loading(id)),
            transcript: self
                .store
                .current_transcript()
                .map(|t| t.entries().iter().map(|m| MessageView::new(m, me)).collect())
                .unwrap_or_default(),
            typing: self.typing.label(),
            current,
        }
    }

    fn publish_view(&mut self) {
        let view = self.build_view();
        if self.last_view.as_ref() == Some(&view) {
            return;
        }
        self.feed.publish_view(view.clone());
        self.last_view = Some(view);
    }

    /// Deregister listeners, end any typing burst and disconnect.
    ///
    /// In-flight collaborator calls are left to finish. Idempotent.
    pub fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        for id in self.listener_ids.drain(..) {
            self.channel.off(id);
        }
        self.stop_typing();
        self.channel.disconnect();
        self.tasks.detach_all();
        self.reconnect_at = None;
        self.typing.clear();
        self.closed = true;
        self.publish_view();
        tracing::info!("Synchronizer shut down");
    }

    /// Updates: retained notices and the latest view first, then live.
    #[must_use]
    pub fn subscribe(&self) -> BoxStream<'static, SyncUpdate> {
        self.feed.history_plus_stream()
    }

    #[must_use]
    pub fn feed(&self) -> Arc<ViewFeed> {
        Arc::clone(&self.feed)
    }

    /// Latest published view.
    #[must_use]
    pub fn view(&self) -> Option<Arc<ViewModel>> {
        self.feed.latest()
    }

    #[must_use]
    pub const fn store(&self) -> &SessionStore<B> {
        &self.store
    }

    #[must_use]
    pub const fn channel(&self) -> &C {
        &self.channel
    }

    #[must_use]
    pub const fn typing(&self) -> &TypingSet {
        &self.typing
    }

    #[must_use]
    pub const fn is_shut_down(&self) -> bool {
        self.closed
    }
}

impl<C: EventChannel, B: SessionBackend + 'static> Drop for SyncOrchestrator<C, B> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

//! In-process channel for offline use and tests.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chat_sync_core::{ConnectionState, Credential};

use crate::{
    channel::{ConnectionHandle, EventChannel, TransportError},
    listeners::ListenerRegistry,
    protocol::{ChannelEvent, ClientEvent, ServerEvent},
};

#[derive(Default)]
struct State {
    connection: ConnectionState,
    handle: Option<ConnectionHandle>,
    credential: Option<Credential>,
    accepted: Option<Credential>,
    fail_next: Option<TransportError>,
    echo: bool,
    sent: Vec<ClientEvent>,
    connect_attempts: usize,
}

/// Channel whose "server" is the host process.
///
/// Clones share the same connection, so a test can keep one clone to inject
/// inbound events while another is owned by the code under test.
#[derive(Clone, Default)]
pub struct LoopbackChannel {
    state: Arc<Mutex<State>>,
    listeners: ListenerRegistry,
}

impl LoopbackChannel {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every credential except `credential`.
    #[must_use]
    pub fn accepting(self, credential: Credential) -> Self {
        self.lock().accepted = Some(credential);
        self
    }

    /// Echo outbound messages back as confirmed server messages.
    #[must_use]
    pub fn with_echo(self) -> Self {
        self.lock().echo = true;
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, to: ConnectionState) {
        let changed = {
            let mut state = self.lock();
            let changed = state.connection != to;
            state.connection = to;
            if to == ConnectionState::Disconnected {
                state.handle = None;
            }
            changed
        };
        if changed {
            self.listeners.dispatch(&ChannelEvent::ConnectionChange(to));
        }
    }

    /// Make the next `connect` fail with `err`.
    pub fn fail_next_connect(&self, err: TransportError) {
        self.lock().fail_next = Some(err);
    }

    /// Deliver a server event to listeners. Ignored while disconnected.
    pub fn inject(&self, event: ServerEvent) {
        if self.lock().connection != ConnectionState::Connected {
            tracing::debug!("Loopback not connected; dropping injected event");
            return;
        }
        self.listeners.dispatch(&ChannelEvent::from(event));
    }

    /// Simulate the remote end dropping the connection.
    pub fn drop_connection(&self) {
        self.transition(ConnectionState::Disconnected);
    }

    /// Events sent so far.
    #[must_use]
    pub fn sent(&self) -> Vec<ClientEvent> {
        self.lock().sent.clone()
    }

    /// Drain recorded outbound events.
    pub fn take_sent(&self) -> Vec<ClientEvent> {
        std::mem::take(&mut self.lock().sent)
    }

    /// Number of `connect` calls that reached the "network".
    #[must_use]
    pub fn connect_attempts(&self) -> usize {
        self.lock().connect_attempts
    }
}

#[async_trait]
impl EventChannel for LoopbackChannel {
    async fn connect(&mut self, credential: &Credential) -> Result<ConnectionHandle, TransportError> {
        {
            let state = self.lock();
            if state.connection == ConnectionState::Connected
                && state.credential.as_ref() == Some(credential)
            {
                if let Some(handle) = state.handle {
                    return Ok(handle);
                }
            }
        }

        self.transition(ConnectionState::Connecting);
        let outcome = {
            let mut state = self.lock();
            state.connect_attempts += 1;
            if let Some(err) = state.fail_next.take() {
                Err(err)
            } else if state.accepted.as_ref().is_some_and(|a| a != credential) {
                Err(TransportError::Auth("credential rejected".into()))
            } else {
                let handle = ConnectionHandle::new();
                state.handle = Some(handle);
                state.credential = Some(credential.clone());
                Ok(handle)
            }
        };

        match outcome {
            Ok(handle) => {
                self.transition(ConnectionState::Connected);
                Ok(handle)
            }
            Err(e) => {
                self.transition(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    fn send(&self, event: ClientEvent) {
        let echo = {
            let mut state = self.lock();
            if state.connection != ConnectionState::Connected {
                tracing::warn!("Dropping outbound event: channel disconnected");
                return;
            }
            state.sent.push(event.clone());
            state.echo
        };

        if let (true, ClientEvent::Message(m)) = (echo, event) {
            self.inject(ServerEvent::Message {
                session_id: m.session_id,
                author_id: m.author_id,
                content: m.content,
                timestamp: m.timestamp,
                id: None,
            });
        }
    }

    fn disconnect(&mut self) {
        self.transition(ConnectionState::Disconnected);
    }

    fn state(&self) -> ConnectionState {
        self.lock().connection
    }

    fn handle(&self) -> Option<ConnectionHandle> {
        self.lock().handle
    }

    fn listeners(&self) -> &ListenerRegistry {
        &self.listeners
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio_test::{assert_err, assert_ok};

    use super::*;
    use crate::protocol::EventKind;

    #[tokio::test]
    async fn test_connect_is_idempotent_per_credential() {
        let mut channel = LoopbackChannel::new();
        let credential = Credential::new("t");

        let a = assert_ok!(channel.connect(&credential).await);
        let b = assert_ok!(channel.connect(&credential).await);
        assert_eq!(a, b);
        assert_eq!(channel.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn test_rejected_credential() {
        let mut channel = LoopbackChannel::new().accepting(Credential::new("good"));
        let err = assert_err!(channel.connect(&Credential::new("bad")).await);
        assert!(err.is_auth());
        assert_eq!(channel.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_echo_and_recording() {
        let mut channel = LoopbackChannel::new().with_echo();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        channel.on_event(EventKind::Message, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        let msg = chat_sync_core::Message::local("S1".into(), "u1".into(), "hi", 1);
        channel.send(ClientEvent::message(&msg));
        assert!(channel.sent().is_empty());

        channel.connect(&Credential::new("t")).await.unwrap();
        channel.send(ClientEvent::message(&msg));
        assert_eq!(channel.take_sent().len(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_drop_connection_notifies() {
        let mut channel = LoopbackChannel::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        channel.on_event(EventKind::ConnectionChange, move |e| {
            s.lock().unwrap().push(e.clone());
        });

        channel.connect(&Credential::new("t")).await.unwrap();
        channel.clone().drop_connection();

        assert_eq!(channel.handle(), None);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                ChannelEvent::ConnectionChange(ConnectionState::Connecting),
                ChannelEvent::ConnectionChange(ConnectionState::Connected),
                ChannelEvent::ConnectionChange(ConnectionState::Disconnected),
            ]
        );
    }
}

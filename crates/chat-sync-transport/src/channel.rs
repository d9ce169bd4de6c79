//! Transport channel contract.

use async_trait::async_trait;
use chat_sync_core::{ConnectionState, Credential};
use thiserror::Error;
use uuid::Uuid;

use crate::{
    listeners::{ListenerId, ListenerRegistry},
    protocol::{ChannelEvent, ClientEvent, EventKind},
};

/// Transport error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The endpoint rejected the credential. Not retried.
    #[error("Authentication rejected: {0}")]
    Auth(String),
    #[error("Connection failed: {0}")]
    Connect(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Channel closed")]
    Closed,
}

impl TransportError {
    #[must_use]
    pub const fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }
}

/// Identifies one established connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionHandle(Uuid);

impl ConnectionHandle {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// A duplex connection to the message stream.
///
/// State machine: `Disconnected -> Connecting -> Connected -> Disconnected`,
/// with `Connecting -> Disconnected` on failure. Every transition is
/// delivered to `ConnectionChange` listeners. Reconnection is never
/// automatic at this layer.
#[async_trait]
pub trait EventChannel: Send {
    /// Establish a connection authenticated by `credential`.
    ///
    /// Calling this while already connected with the same credential returns
    /// the existing handle.
    ///
    /// # Errors
    /// Returns `Auth` if the credential is rejected, `Connect` on network failure.
    async fn connect(&mut self, credential: &Credential) -> Result<ConnectionHandle, TransportError>;

    /// Enqueue an outbound event without waiting. Dropped (and logged) when
    /// not connected.
    fn send(&self, event: ClientEvent);

    /// Release the connection.
    fn disconnect(&mut self);

    /// Current connection state.
    fn state(&self) -> ConnectionState;

    /// Handle of the live connection, if any.
    fn handle(&self) -> Option<ConnectionHandle>;

    /// Listener registry backing `on_event`/`off`.
    fn listeners(&self) -> &ListenerRegistry;

    /// Register a listener for one event kind.
    fn on_event<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&ChannelEvent) + Send + Sync + 'static,
        Self: Sized,
    {
        self.listeners().add(kind, listener)
    }

    /// Remove a listener.
    fn off(&self, id: ListenerId) -> bool {
        self.listeners().remove(id)
    }
}

//! WebSocket transport channel.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chat_sync_core::{ConnectionState, Credential};
use futures::{SinkExt, StreamExt};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_tungstenite::tungstenite::{
    self, Message,
    client::IntoClientRequest,
    http::{HeaderValue, header::AUTHORIZATION},
};

use crate::{
    channel::{ConnectionHandle, EventChannel, TransportError},
    listeners::ListenerRegistry,
    protocol::{ChannelEvent, ClientEvent, ServerEvent},
};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Map a handshake failure onto the transport taxonomy.
fn classify(err: tungstenite::Error) -> TransportError {
    match err {
        tungstenite::Error::Http(response)
            if matches!(response.status().as_u16(), 401 | 403) =>
        {
            TransportError::Auth(format!("server responded {}", response.status()))
        }
        tungstenite::Error::Url(e) => TransportError::Protocol(e.to_string()),
        other => TransportError::Connect(other.to_string()),
    }
}

struct Live {
    handle: ConnectionHandle,
    credential: Credential,
    outbound: mpsc::UnboundedSender<ClientEvent>,
    reader: JoinHandle<()>,
}

/// Connection state shared with the socket tasks.
#[derive(Clone)]
struct Shared {
    state: Arc<watch::Sender<ConnectionState>>,
    listeners: ListenerRegistry,
    generation: Arc<AtomicU64>,
}

impl Shared {
    fn transition(&self, to: ConnectionState) {
        let changed = self.state.send_if_modified(|s| {
            if *s == to {
                false
            } else {
                *s = to;
                true
            }
        });
        if changed {
            tracing::info!(state = %to, "Connection state changed");
            self.listeners.dispatch(&ChannelEvent::ConnectionChange(to));
        }
    }
}

/// WebSocket channel to the message stream endpoint.
///
/// The bearer credential travels in the `Authorization` header of the
/// upgrade request.
pub struct WsChannel {
    url: String,
    connect_timeout: Duration,
    shared: Shared,
    live: Option<Live>,
}

impl WsChannel {
    /// Create a disconnected channel for `url`.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            url: url.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            shared: Shared {
                state: Arc::new(state),
                listeners: ListenerRegistry::new(),
                generation: Arc::new(AtomicU64::new(0)),
            },
            live: None,
        }
    }

    /// Give up on a handshake that has not completed within `timeout`.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Watch connection state changes.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    fn request(
        &self,
        credential: &Credential,
    ) -> Result<tungstenite::handshake::client::Request, TransportError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        let value = HeaderValue::from_str(&credential.bearer())
            .map_err(|_| TransportError::Auth("credential is not a valid header value".into()))?;
        request.headers_mut().insert(AUTHORIZATION, value);
        Ok(request)
    }

    /// Tear down the live connection without touching the state.
    fn release(&mut self) -> bool {
        let Some(live) = self.live.take() else {
            return false;
        };
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        live.reader.abort();
        // Dropping `outbound` lets the writer send a close frame and exit.
        drop(live.outbound);
        true
    }
}

#[async_trait]
impl EventChannel for WsChannel {
    async fn connect(&mut self, credential: &Credential) -> Result<ConnectionHandle, TransportError> {
        if let Some(live) = &self.live {
            if self.state() == ConnectionState::Connected && live.credential == *credential {
                return Ok(live.handle);
            }
        }
        self.release();

        self.shared.transition(ConnectionState::Connecting);
        let request = match self.request(credential) {
            Ok(r) => r,
            Err(e) => {
                self.shared.transition(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        let handshake =
            tokio::time::timeout(self.connect_timeout, tokio_tungstenite::connect_async(request));
        let result = match handshake.await {
            Ok(result) => result.map_err(classify),
            Err(_) => Err(TransportError::Connect(format!(
                "handshake timed out after {:?}",
                self.connect_timeout
            ))),
        };
        let stream = match result {
            Ok((stream, _)) => stream,
            Err(err) => {
                tracing::warn!(url = %self.url, "Connect failed: {err}");
                self.shared.transition(ConnectionState::Disconnected);
                return Err(err);
            }
        };

        // Connected before the reader starts, so an immediate hangup lands last.
        self.shared.transition(ConnectionState::Connected);

        let (mut sink, mut source) = stream.split();
        let (outbound, mut rx) = mpsc::unbounded_channel::<ClientEvent>();

        // Writer: forward queued events until the sender is dropped.
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let json = match serde_json::to_string(&event) {
                    Ok(j) => j,
                    Err(e) => {
                        tracing::error!("Failed to serialize event: {e}");
                        continue;
                    }
                };
                if sink.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let generation = self.shared.generation.load(Ordering::SeqCst);
        let shared = self.shared.clone();
        let reader = tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text.as_str().to_owned(),
                    Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                        Ok(s) => s,
                        Err(_) => continue,
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        tracing::warn!("WebSocket error: {e}");
                        break;
                    }
                };

                match serde_json::from_str::<ServerEvent>(&text) {
                    Ok(event) => shared.listeners.dispatch(&ChannelEvent::from(event)),
                    Err(e) => tracing::warn!("Invalid server event: {e}"),
                }
            }

            if shared.generation.load(Ordering::SeqCst) == generation {
                shared.transition(ConnectionState::Disconnected);
            }
        });

        let handle = ConnectionHandle::new();
        self.live = Some(Live {
            handle,
            credential: credential.clone(),
            outbound,
            reader,
        });
        Ok(handle)
    }

    fn send(&self, event: ClientEvent) {
        match &self.live {
            Some(live) if self.state() == ConnectionState::Connected => {
                if live.outbound.send(event).is_err() {
                    tracing::warn!("Dropping outbound event: writer closed");
                }
            }
            _ => tracing::warn!("Dropping outbound event: channel disconnected"),
        }
    }

    fn disconnect(&mut self) {
        if self.release() {
            tracing::debug!(url = %self.url, "Disconnecting");
        }
        self.shared.transition(ConnectionState::Disconnected);
    }

    fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    fn handle(&self) -> Option<ConnectionHandle> {
        self.live.as_ref().map(|l| l.handle)
    }

    fn listeners(&self) -> &ListenerRegistry {
        &self.shared.listeners
    }
}

impl Drop for WsChannel {
    fn drop(&mut self) {
        self.release();
    }
}

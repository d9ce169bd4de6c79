//! Transport channel for the chat message stream.
//!
//! Provides:
//! - Wire protocol (JSON)
//! - `EventChannel` contract and listener registry
//! - WebSocket channel (feature: websocket)
//! - In-process loopback channel

pub mod channel;
pub mod listeners;
pub mod loopback;
pub mod protocol;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use channel::{ConnectionHandle, EventChannel, TransportError};
pub use listeners::{ListenerId, ListenerRegistry};
pub use loopback::LoopbackChannel;
pub use protocol::{ChannelEvent, ClientEvent, EventKind, ServerEvent, TypingEvent};

#[cfg(feature = "websocket")]
pub use websocket::WsChannel;

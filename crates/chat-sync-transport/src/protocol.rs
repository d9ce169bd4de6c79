//! Wire protocol for the message stream.

use std::fmt;

use chat_sync_core::{ConnectionState, Message, SessionId, Timestamp, UserId};
use serde::{Deserialize, Serialize};

/// Server-side message identifier; numeric or textual on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireId {
    Number(i64),
    Text(String),
}

impl fmt::Display for WireId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

/// Event from server to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ServerEvent {
    /// A message broadcast or echoed by the server.
    #[serde(rename_all = "camelCase")]
    Message {
        session_id: SessionId,
        author_id: UserId,
        content: String,
        timestamp: Timestamp,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<WireId>,
    },
    /// Someone started or stopped composing.
    #[serde(rename_all = "camelCase")]
    Typing {
        author_id: UserId,
        is_typing: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
    },
}

/// Outbound chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    pub content: String,
    pub session_id: SessionId,
    pub author_id: UserId,
    pub timestamp: Timestamp,
}

/// Outbound typing notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundTyping {
    pub session_id: SessionId,
    pub author_id: UserId,
    pub is_typing: bool,
}

/// Event from client to server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClientEvent {
    Message(OutboundMessage),
    Typing(OutboundTyping),
}

impl ClientEvent {
    /// Outbound form of a locally stamped message.
    #[must_use]
    pub fn message(message: &Message) -> Self {
        Self::Message(OutboundMessage {
            content: message.content.clone(),
            session_id: message.session_id.clone(),
            author_id: message.author.clone(),
            timestamp: message.timestamp,
        })
    }

    #[must_use]
    pub const fn typing(session_id: SessionId, author_id: UserId, is_typing: bool) -> Self {
        Self::Typing(OutboundTyping {
            session_id,
            author_id,
            is_typing,
        })
    }
}

/// Listener categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Message,
    Typing,
    ConnectionChange,
}

/// Typing notification as delivered to listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingEvent {
    pub author: UserId,
    pub is_typing: bool,
    pub session_id: Option<SessionId>,
}

/// Event delivered to channel listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// A confirmed message.
    Message(Message),
    Typing(TypingEvent),
    ConnectionChange(ConnectionState),
}

impl ChannelEvent {
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::Message(_) => EventKind::Message,
            Self::Typing(_) => EventKind::Typing,
            Self::ConnectionChange(_) => EventKind::ConnectionChange,
        }
    }
}

impl From<ServerEvent> for ChannelEvent {
    fn from(event: ServerEvent) -> Self {
        match event {
            ServerEvent::Message {
                session_id,
                author_id,
                content,
                timestamp,
                id,
            } => {
                let message = Message::confirmed(session_id, author_id, content, timestamp);
                Self::Message(match id {
                    Some(id) => message.with_server_id(id.to_string()),
                    None => message,
                })
            }
            ServerEvent::Typing {
                author_id,
                is_typing,
                session_id,
            } => Self::Typing(TypingEvent {
                author: author_id,
                is_typing,
                session_id,
            }),
        }
    }
}

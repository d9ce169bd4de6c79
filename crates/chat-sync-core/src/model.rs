//! Sessions, messages and identifiers.

use std::{
    fmt,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Milliseconds since the Unix epoch.
pub type Timestamp = i64;

/// Current wall-clock time in milliseconds.
#[must_use]
pub fn now_millis() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap an existing identifier.
            #[must_use]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Borrow the raw identifier.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(
    /// Session identifier, client-minted or server-assigned.
    SessionId
);

string_id!(
    /// Author identity of a message or typing notification.
    UserId
);

impl SessionId {
    /// Mint a fresh client-side identifier.
    #[must_use]
    pub fn mint() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl UserId {
    /// Sentinel author for server-originated messages.
    #[must_use]
    pub fn system() -> Self {
        Self("system".to_string())
    }

    /// Whether this is the server sentinel.
    #[must_use]
    pub fn is_system(&self) -> bool {
        self.0 == "system"
    }
}

/// Where a message entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Origin {
    /// Optimistically applied before the server echoed it.
    LocalPending,
    /// Delivered or echoed by the server.
    Confirmed,
}

/// One chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Session this message belongs to.
    pub session_id: SessionId,
    /// Author identity.
    pub author: UserId,
    /// Message text; never blank.
    pub content: String,
    /// Client-stamped (local) or server-echoed timestamp.
    pub timestamp: Timestamp,
    /// Pending or confirmed.
    pub origin: Origin,
    /// Server-side identifier, when the server supplies one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    /// Client-side identifier for optimistic entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_id: Option<Uuid>,
}

impl Message {
    /// Build an optimistic local message.
    #[must_use]
    pub fn local(
        session_id: SessionId,
        author: UserId,
        content: impl Into<String>,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            session_id,
            author,
            content: content.into(),
            timestamp,
            origin: Origin::LocalPending,
            server_id: None,
            local_id: Some(Uuid::new_v4()),
        }
    }

    /// Build a server-confirmed message.
    #[must_use]
    pub fn confirmed(
        session_id: SessionId,
        author: UserId,
        content: impl Into<String>,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            session_id,
            author,
            content: content.into(),
            timestamp,
            origin: Origin::Confirmed,
            server_id: None,
            local_id: None,
        }
    }

    /// Attach the server's identifier.
    #[must_use]
    pub fn with_server_id(mut self, id: impl Into<String>) -> Self {
        self.server_id = Some(id.into());
        self
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.origin == Origin::LocalPending
    }

    /// Whether the content has any non-whitespace text.
    #[must_use]
    pub fn has_content(&self) -> bool {
        !self.content.trim().is_empty()
    }
}

/// Transport connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        })
    }
}

/// Session metadata, without its message log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    /// Unique identifier.
    pub id: SessionId,
    /// Display name.
    pub name: String,
    /// Creation timestamp.
    pub created_at: Timestamp,
}

/// Name given to sessions created without one.
pub const DEFAULT_SESSION_NAME: &str = "New Chat";

impl SessionInfo {
    #[must_use]
    pub fn new(id: SessionId, name: impl Into<String>, created_at: Timestamp) -> Self {
        Self {
            id,
            name: name.into(),
            created_at,
        }
    }

    /// A client-minted session, named `name` or the default.
    #[must_use]
    pub fn draft(name: Option<&str>, created_at: Timestamp) -> Self {
        let name = name
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or(DEFAULT_SESSION_NAME);
        Self::new(SessionId::mint(), name, created_at)
    }
}

//! Render-ready view model and user-facing notices.

use serde::Serialize;

use crate::{
    model::{ConnectionState, Message, SessionId, SessionInfo, Timestamp, UserId},
    reconcile::Transcript,
};

/// Preview shown for sessions without messages.
pub const EMPTY_PREVIEW: &str = "No messages";

/// Failure classes surfaced to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Credential rejected; re-authentication required.
    Auth,
    /// Connection dropped or could not be established.
    Transport,
    /// Message routed to the wrong session.
    SessionMismatch,
    /// Unknown session.
    NotFound,
    /// Backing store call failed.
    Collaborator,
    /// Invalid request from the UI (e.g. blank message).
    Usage,
}

/// Non-fatal notification published alongside view updates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notice {
    /// Failure class, or `None` for informational notices.
    pub kind: Option<ErrorKind>,
    pub message: String,
    pub at: Timestamp,
}

impl Notice {
    #[must_use]
    pub fn info(message: impl Into<String>, at: Timestamp) -> Self {
        Self {
            kind: None,
            message: message.into(),
            at,
        }
    }

    #[must_use]
    pub fn error(kind: ErrorKind, message: impl Into<String>, at: Timestamp) -> Self {
        Self {
            kind: Some(kind),
            message: message.into(),
            at,
        }
    }
}

/// Sidebar entry for one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: SessionId,
    pub name: String,
    /// Last message text, or [`EMPTY_PREVIEW`].
    pub preview: String,
    /// Message count, `None` while the log is not loaded.
    pub message_count: Option<usize>,
    pub is_current: bool,
}

impl SessionSummary {
    #[must_use]
    pub fn new(info: &SessionInfo, transcript: Option<&Transcript>, is_current: bool) -> Self {
        let preview = transcript
            .and_then(Transcript::last)
            .map_or_else(|| EMPTY_PREVIEW.to_string(), |m| m.content.clone());
        Self {
            id: info.id.clone(),
            name: info.name.clone(),
            preview,
            message_count: transcript.map(Transcript::len),
            is_current,
        }
    }
}

/// One transcript line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageView {
    pub author: UserId,
    pub content: String,
    pub timestamp: Timestamp,
    /// Written by the local user.
    pub is_own: bool,
    /// Not yet confirmed by the server.
    pub pending: bool,
}

impl MessageView {
    #[must_use]
    pub fn new(message: &Message, me: &UserId) -> Self {
        Self {
            author: message.author.clone(),
            content: message.content.clone(),
            timestamp: message.timestamp,
            is_own: message.author == *me,
            pending: message.is_pending(),
        }
    }
}

/// Everything a UI needs to render the chat screen.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewModel {
    pub connection: ConnectionState,
    /// The credential was rejected; the UI should re-authenticate.
    pub auth_required: bool,
    /// Most recent first.
    pub sessions: Vec<SessionSummary>,
    pub current: Option<SessionId>,
    /// The current session's log is being fetched.
    pub loading: bool,
    pub transcript: Vec<MessageView>,
    /// Typing indicator for the current session.
    pub typing: Option<String>,
}

impl ViewModel {
    /// Summary of the current session, if any.
    #[must_use]
    pub fn current_summary(&self) -> Option<&SessionSummary> {
        self.sessions.iter().find(|s| s.is_current)
    }
}

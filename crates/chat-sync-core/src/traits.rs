//! Backing-collaborator trait for session persistence.

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{Message, SessionId, SessionInfo, UserId};

/// Backing-collaborator error.
///
/// Never fatal: the store keeps its in-memory state and reports these as
/// notices.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CollaboratorError {
    #[error("Credential rejected by collaborator")]
    Unauthorized,
    #[error("Collaborator call timed out")]
    Timeout,
    #[error("Collaborator unavailable: {0}")]
    Unavailable(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Collaborator error: {0}")]
    Internal(String),
}

/// Durable storage the session store delegates to.
///
/// Local storage and a remote sessions API are both valid implementations.
#[async_trait]
pub trait SessionBackend: Send + Sync {
    /// List a user's sessions.
    async fn list_sessions(&self, user_id: &UserId) -> Result<Vec<SessionInfo>, CollaboratorError>;

    /// Persist a new session.
    ///
    /// The returned session may carry a server-assigned identifier that
    /// differs from the draft's.
    async fn create_session(
        &self,
        user_id: &UserId,
        draft: &SessionInfo,
    ) -> Result<SessionInfo, CollaboratorError>;

    /// Remove a session.
    async fn delete_session(&self, id: &SessionId) -> Result<(), CollaboratorError>;

    /// Fetch a session's message log.
    async fn list_messages(
        &self,
        session_id: &SessionId,
        user_id: &UserId,
    ) -> Result<Vec<Message>, CollaboratorError>;

    /// Remove a session's message log.
    async fn delete_messages(&self, session_id: &SessionId) -> Result<(), CollaboratorError>;

    /// Whether the store must push its log after every append.
    ///
    /// Remote backends receive messages through the transport and return false.
    fn requires_incremental_sync(&self) -> bool {
        false
    }

    /// Replace the stored log of a session.
    async fn save_messages(
        &self,
        _session_id: &SessionId,
        _messages: &[Message],
    ) -> Result<(), CollaboratorError> {
        Ok(())
    }
}

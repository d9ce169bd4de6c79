//! In-memory session backend.

use std::{
    collections::HashMap,
    sync::{
        PoisonError, RwLock,
        atomic::{AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use chat_sync_core::{CollaboratorError, Message, SessionBackend, SessionId, SessionInfo, UserId};

struct Stored {
    owner: UserId,
    info: SessionInfo,
}

/// In-memory backend.
///
/// Useful for development and tests. Data is lost on restart.
#[derive(Default)]
pub struct MemoryBackend {
    sessions: RwLock<HashMap<SessionId, Stored>>,
    messages: RwLock<HashMap<SessionId, Vec<Message>>>,
    assign_ids: bool,
    next_id: AtomicU64,
}

impl MemoryBackend {
    /// Create an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace client-minted session ids with `srv-N`, like a remote API.
    #[must_use]
    pub fn assigning_ids(mut self) -> Self {
        self.assign_ids = true;
        self
    }

    /// Seed a session owned by `owner`.
    pub fn insert_session(&self, owner: &UserId, info: SessionInfo) {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                info.id.clone(),
                Stored {
                    owner: owner.clone(),
                    info,
                },
            );
    }

    /// Seed a session's log.
    pub fn insert_messages(&self, session_id: &SessionId, messages: Vec<Message>) {
        self.messages
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session_id.clone(), messages);
    }
}

#[async_trait]
impl SessionBackend for MemoryBackend {
    async fn list_sessions(&self, user_id: &UserId) -> Result<Vec<SessionInfo>, CollaboratorError> {
        let sessions = self
            .sessions
            .read()
            .map_err(|e| CollaboratorError::Internal(e.to_string()))?;

        let mut result: Vec<SessionInfo> = sessions
            .values()
            .filter(|s| s.owner == *user_id)
            .map(|s| s.info.clone())
            .collect();

        // Sort by created_at descending
        result.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(result)
    }

    async fn create_session(
        &self,
        user_id: &UserId,
        draft: &SessionInfo,
    ) -> Result<SessionInfo, CollaboratorError> {
        let mut info = draft.clone();
        if self.assign_ids {
            let n = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
            info.id = SessionId::new(format!("srv-{n}"));
        }

        self.sessions
            .write()
            .map_err(|e| CollaboratorError::Internal(e.to_string()))?
            .insert(
                info.id.clone(),
                Stored {
                    owner: user_id.clone(),
                    info: info.clone(),
                },
            );
        Ok(info)
    }

    async fn delete_session(&self, id: &SessionId) -> Result<(), CollaboratorError> {
        self.sessions
            .write()
            .map_err(|e| CollaboratorError::Internal(e.to_string()))?
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| CollaboratorError::NotFound(id.to_string()))
    }

    async fn list_messages(
        &self,
        session_id: &SessionId,
        _user_id: &UserId,
    ) -> Result<Vec<Message>, CollaboratorError> {
        Ok(self
            .messages
            .read()
            .map_err(|e| CollaboratorError::Internal(e.to_string()))?
            .get(session_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn delete_messages(&self, session_id: &SessionId) -> Result<(), CollaboratorError> {
        self.messages
            .write()
            .map_err(|e| CollaboratorError::Internal(e.to_string()))?
            .remove(session_id);
        Ok(())
    }

    fn requires_incremental_sync(&self) -> bool {
        true
    }

    async fn save_messages(
        &self,
        session_id: &SessionId,
        messages: &[Message],
    ) -> Result<(), CollaboratorError> {
        self.messages
            .write()
            .map_err(|e| CollaboratorError::Internal(e.to_string()))?
            .insert(session_id.clone(), messages.to_vec());
        Ok(())
    }
}

//! JSON file session backend.
//!
//! Layout under the root directory:
//! - `sessions.json`: every user's session metadata
//! - `messages/<session>.json`: one log per session

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chat_sync_core::{CollaboratorError, Message, SessionBackend, SessionId, SessionInfo, UserId};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredSession {
    user_id: UserId,
    #[serde(flatten)]
    info: SessionInfo,
}

fn io_error(path: &Path, e: &std::io::Error) -> CollaboratorError {
    CollaboratorError::Internal(format!("{}: {e}", path.display()))
}

/// Durable local backend writing JSON files.
pub struct FileBackend {
    root: PathBuf,
    /// Serializes read-modify-write cycles.
    write_lock: Mutex<()>,
}

impl FileBackend {
    /// Store data under `root`. Directories are created on first write.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn sessions_path(&self) -> PathBuf {
        self.root.join("sessions.json")
    }

    /// Percent-encoded, so distinct ids never share a file.
    fn messages_path(&self, id: &SessionId) -> PathBuf {
        let name = urlencoding::encode(id.as_str());
        self.root.join("messages").join(format!("{name}.json"))
    }

    async fn read_json<T: DeserializeOwned + Default>(path: &Path) -> Result<T, CollaboratorError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                CollaboratorError::Internal(format!("{}: {e}", path.display()))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
            Err(e) => Err(io_error(path, &e)),
        }
    }

    /// Write via a temporary file and rename, so readers never see a torn file.
    async fn write_json<T: Serialize + Sync>(path: &Path, value: &T) -> Result<(), CollaboratorError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(parent, &e))?;
        }
        let bytes = serde_json::to_vec_pretty(value)
            .map_err(|e| CollaboratorError::Internal(e.to_string()))?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| io_error(&tmp, &e))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| io_error(path, &e))
    }

    async fn remove_file(path: &Path) -> Result<bool, CollaboratorError> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_error(path, &e)),
        }
    }
}

#[async_trait]
impl SessionBackend for FileBackend {
    async fn list_sessions(&self, user_id: &UserId) -> Result<Vec<SessionInfo>, CollaboratorError> {
        let stored: Vec<StoredSession> = Self::read_json(&self.sessions_path()).await?;
        let mut result: Vec<SessionInfo> = stored
            .into_iter()
            .filter(|s| s.user_id == *user_id)
            .map(|s| s.info)
            .collect();
        result.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(result)
    }

    async fn create_session(
        &self,
        user_id: &UserId,
        draft: &SessionInfo,
    ) -> Result<SessionInfo, CollaboratorError> {
        let _guard = self.write_lock.lock().await;
        let path = self.sessions_path();
        let mut stored: Vec<StoredSession> = Self::read_json(&path).await?;
        stored.retain(|s| s.info.id != draft.id);
        stored.push(StoredSession {
            user_id: user_id.clone(),
            info: draft.clone(),
        });
        Self::write_json(&path, &stored).await?;
        tracing::debug!(session_id = %draft.id, path = %path.display(), "Stored session");
        Ok(draft.clone())
    }

    async fn delete_session(&self, id: &SessionId) -> Result<(), CollaboratorError> {
        let _guard = self.write_lock.lock().await;
        let path = self.sessions_path();
        let mut stored: Vec<StoredSession> = Self::read_json(&path).await?;
        let before = stored.len();
        stored.retain(|s| s.info.id != *id);
        if stored.len() == before {
            return Err(CollaboratorError::NotFound(id.to_string()));
        }
        Self::write_json(&path, &stored).await
    }

    async fn list_messages(
        &self,
        session_id: &SessionId,
        _user_id: &UserId,
    ) -> Result<Vec<Message>, CollaboratorError> {
        Self::read_json(&self.messages_path(session_id)).await
    }

    async fn delete_messages(&self, session_id: &SessionId) -> Result<(), CollaboratorError> {
        let _guard = self.write_lock.lock().await;
        Self::remove_file(&self.messages_path(session_id)).await?;
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
        let _guard = self.write_lock.lock().await;
        Self::write_json(&self.messages_path(session_id), &messages).await
    }
}

//! Client configuration and identity.

use std::{fmt, path::{Path, PathBuf}, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{model::UserId, reconcile::DedupPolicy};

/// Configuration load error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Automatic reconnect budget after an unexpected disconnect.
///
/// `max_attempts = 0` leaves reconnection entirely to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            backoff_ms: 1000,
        }
    }
}

impl ReconnectPolicy {
    #[must_use]
    pub const fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

/// Client configuration. Every field has a default, so an empty file is valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// WebSocket endpoint of the message stream.
    pub stream_url: String,
    /// Base URL of the sessions/messages HTTP API.
    pub api_base_url: String,
    /// Idle time after the last keystroke before "typing stopped" is sent.
    pub typing_idle_ms: u64,
    /// Lifetime of an inbound typing entry without a follow-up.
    pub typing_expiry_ms: u64,
    /// Timestamp window for matching server echoes to pending messages.
    pub dedup_tolerance_ms: u64,
    /// Deadline for each backing-collaborator call.
    pub collaborator_timeout_ms: u64,
    pub reconnect: ReconnectPolicy,
    /// Notices retained for late view subscribers.
    pub notice_history: usize,
    /// Directory for the JSON file backend. Defaults to the platform data dir.
    pub storage_dir: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            stream_url: "ws://localhost:1337/ws".to_string(),
            api_base_url: "http://localhost:1337".to_string(),
            typing_idle_ms: 2000,
            typing_expiry_ms: 5000,
            dedup_tolerance_ms: 0,
            collaborator_timeout_ms: 10_000,
            reconnect: ReconnectPolicy::default(),
            notice_history: 64,
            storage_dir: None,
        }
    }
}

impl ClientConfig {
    /// Parse a TOML document.
    ///
    /// # Errors
    /// Returns error if the document is not valid TOML for this schema.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    /// Load a TOML file.
    ///
    /// # Errors
    /// Returns error if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    #[must_use]
    pub const fn typing_idle(&self) -> Duration {
        Duration::from_millis(self.typing_idle_ms)
    }

    #[must_use]
    pub const fn typing_expiry(&self) -> Duration {
        Duration::from_millis(self.typing_expiry_ms)
    }

    #[must_use]
    pub const fn collaborator_timeout(&self) -> Duration {
        Duration::from_millis(self.collaborator_timeout_ms)
    }

    #[must_use]
    pub const fn dedup_policy(&self) -> DedupPolicy {
        DedupPolicy::within(self.dedup_tolerance_ms)
    }

    /// Directory for local durable storage.
    #[must_use]
    pub fn storage_dir(&self) -> PathBuf {
        self.storage_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("chat-sync")
        })
    }
}

/// Opaque bearer token issued by the authentication collaborator.
///
/// Never parsed or validated here; `Debug` does not reveal it.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Credential(String);

impl Credential {
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The raw token, for forwarding.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// `Authorization` header value.
    #[must_use]
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.0)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

/// The signed-in user on whose behalf the client acts.
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    pub user_id: UserId,
    pub credential: Credential,
}

impl ClientIdentity {
    #[must_use]
    pub fn new(user_id: impl Into<UserId>, credential: Credential) -> Self {
        Self {
            user_id: user_id.into(),
            credential,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = ClientConfig::from_toml_str("").unwrap();
        assert_eq!(config, ClientConfig::default());
        assert_eq!(config.typing_idle(), Duration::from_secs(2));
        assert_eq!(config.dedup_policy(), DedupPolicy::exact());
    }

    #[test]
    fn test_partial_document() {
        let config = ClientConfig::from_toml_str(
            r#"
            stream_url = "wss://chat.example.com/ws"
            dedup_tolerance_ms = 250

            [reconnect]
            max_attempts = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.stream_url, "wss://chat.example.com/ws");
        assert_eq!(config.dedup_policy(), DedupPolicy::within(250));
        assert_eq!(config.reconnect.max_attempts, 3);
        assert_eq!(config.reconnect.backoff_ms, 1000);
        assert_eq!(config.typing_expiry_ms, 5000);
    }

    #[test]
    fn test_invalid_document() {
        let err = ClientConfig::from_toml_str("typing_idle_ms = \"soon\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));

        let err = ClientConfig::from_toml_str("dedup_tolerance_ms = -9223372036854775808")
            .unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.toml");
        std::fs::write(&path, "notice_history = 8\n").unwrap();

        let config = ClientConfig::load(&path).unwrap();
        assert_eq!(config.notice_history, 8);

        let missing = ClientConfig::load(dir.path().join("nope.toml")).unwrap_err();
        assert!(matches!(missing, ConfigError::Io { .. }));
    }

    #[test]
    fn test_credential_debug_is_redacted() {
        let credential = Credential::new("secret-token");
        assert_eq!(format!("{credential:?}"), "Credential(***)");
        assert_eq!(credential.bearer(), "Bearer secret-token");
    }
}

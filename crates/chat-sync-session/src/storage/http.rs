//! Remote sessions API backend.
//!
//! Routes, relative to the base URL:
//! - `GET    /api/sessions?userId=`
//! - `POST   /api/sessions`
//! - `DELETE /api/sessions/{id}`
//! - `GET    /api/messages?sessionId=&userId=`
//! - `DELETE /api/messages?sessionId=`
//!
//! Responses may be bare or wrapped in a `{ "data": ... }` envelope.

use std::time::Duration;

use async_trait::async_trait;
use chat_sync_core::{
    CollaboratorError, Credential, Message, SessionBackend, SessionId, SessionInfo, Timestamp,
    UserId, model::now_millis,
};
use chat_sync_transport::protocol::WireId;
use reqwest::{Client, RequestBuilder, Response, StatusCode, header::AUTHORIZATION};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

#[derive(Deserialize)]
#[serde(untagged)]
enum Envelope<T> {
    Wrapped { data: T },
    Bare(T),
}

impl<T> Envelope<T> {
    fn into_inner(self) -> T {
        match self {
            Self::Wrapped { data } | Self::Bare(data) => data,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionDto {
    id: WireId,
    name: String,
    #[serde(default)]
    created_at: Option<Timestamp>,
}

impl SessionDto {
    fn into_info(self, fallback_created_at: Timestamp) -> SessionInfo {
        SessionInfo::new(
            SessionId::new(self.id.to_string()),
            self.name,
            self.created_at.unwrap_or(fallback_created_at),
        )
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageDto {
    #[serde(default)]
    id: Option<WireId>,
    session_id: WireId,
    author_id: UserId,
    content: String,
    timestamp: Timestamp,
}

impl From<MessageDto> for Message {
    fn from(dto: MessageDto) -> Self {
        let message = Self::confirmed(
            SessionId::new(dto.session_id.to_string()),
            dto.author_id,
            dto.content,
            dto.timestamp,
        );
        match dto.id {
            Some(id) => message.with_server_id(id.to_string()),
            None => message,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateSession<'a> {
    user_id: &'a UserId,
    name: &'a str,
    created_at: Timestamp,
    client_id: &'a SessionId,
}

fn from_reqwest(err: &reqwest::Error) -> CollaboratorError {
    if err.is_timeout() {
        CollaboratorError::Timeout
    } else if err.is_connect() {
        CollaboratorError::Unavailable(err.to_string())
    } else {
        CollaboratorError::Internal(err.to_string())
    }
}

fn check_status(response: Response) -> Result<Response, CollaboratorError> {
    let status = response.status();
    match status {
        s if s.is_success() => Ok(response),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(CollaboratorError::Unauthorized),
        StatusCode::NOT_FOUND => Err(CollaboratorError::NotFound(response.url().path().to_string())),
        s => Err(CollaboratorError::Internal(format!("HTTP {s}"))),
    }
}

/// Backend speaking to a remote sessions API with a bearer credential.
///
/// Messages arrive through the transport, so no incremental sync is needed.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: Client,
    base_url: String,
    credential: Credential,
}

impl HttpBackend {
    /// Create a backend for `base_url` with a per-request `timeout`.
    ///
    /// # Errors
    /// Returns `Internal` if the HTTP client cannot be built.
    pub fn new(
        base_url: impl Into<String>,
        credential: Credential,
        timeout: Duration,
    ) -> Result<Self, CollaboratorError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| from_reqwest(&e))?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self {
            client,
            base_url,
            credential,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, CollaboratorError> {
        let response = request
            .header(AUTHORIZATION, self.credential.bearer())
            .send()
            .await
            .map_err(|e| from_reqwest(&e))?;
        check_status(response)
    }

    async fn fetch<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, CollaboratorError> {
        let envelope: Envelope<T> = self
            .send(request)
            .await?
            .json()
            .await
            .map_err(|e| CollaboratorError::Internal(format!("Malformed response: {e}")))?;
        Ok(envelope.into_inner())
    }
}

#[async_trait]
impl SessionBackend for HttpBackend {
    async fn list_sessions(&self, user_id: &UserId) -> Result<Vec<SessionInfo>, CollaboratorError> {
        let request = self
            .client
            .get(self.url("/api/sessions"))
            .query(&[("userId", user_id.as_str())]);
        let sessions: Vec<SessionDto> = self.fetch(request).await?;
        let now = now_millis();
        Ok(sessions.into_iter().map(|s| s.into_info(now)).collect())
    }

    async fn create_session(
        &self,
        user_id: &UserId,
        draft: &SessionInfo,
    ) -> Result<SessionInfo, CollaboratorError> {
        let body = CreateSession {
            user_id,
            name: &draft.name,
            created_at: draft.created_at,
            client_id: &draft.id,
        };
        let request = self.client.post(self.url("/api/sessions")).json(&body);
        let created: SessionDto = self.fetch(request).await?;
        let info = created.into_info(draft.created_at);
        tracing::debug!(client_id = %draft.id, session_id = %info.id, "Session created remotely");
        Ok(info)
    }

    async fn delete_session(&self, id: &SessionId) -> Result<(), CollaboratorError> {
        let path = format!("/api/sessions/{}", urlencoding::encode(id.as_str()));
        let request = self.client.delete(self.url(&path));
        self.send(request).await?;
        Ok(())
    }

    async fn list_messages(
        &self,
        session_id: &SessionId,
        user_id: &UserId,
    ) -> Result<Vec<Message>, CollaboratorError> {
        let request = self.client.get(self.url("/api/messages")).query(&[
            ("sessionId", session_id.as_str()),
            ("userId", user_id.as_str()),
        ]);
        let messages: Vec<MessageDto> = self.fetch(request).await?;
        Ok(messages.into_iter().map(Message::from).collect())
    }

    async fn delete_messages(&self, session_id: &SessionId) -> Result<(), CollaboratorError> {
        let request = self
            .client
            .delete(self.url("/api/messages"))
            .query(&[("sessionId", session_id.as_str())]);
        self.send(request).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::{Arc, Mutex},
    };

    use axum::{
        Json, Router,
        extract::{Path, Query, Request, State},
        http::{HeaderMap, StatusCode},
        middleware::{self, Next},
        response::{IntoResponse, Response as AxumResponse},
        routing::{delete, get},
    };
    use serde_json::{Value, json};

    use super::*;

    const TOKEN: &str = "api-token";

    #[derive(Clone, Default)]
    struct Api {
        deleted: Arc<Mutex<Vec<String>>>,
    }

    async fn require_bearer(headers: HeaderMap, request: Request, next: Next) -> AxumResponse {
        let expected = format!("Bearer {TOKEN}");
        let presented = headers.get("authorization").and_then(|v| v.to_str().ok());
        if presented != Some(expected.as_str()) {
            return StatusCode::UNAUTHORIZED.into_response();
        }
        next.run(request).await
    }

    async fn list_sessions(Query(q): Query<HashMap<String, String>>) -> Json<Value> {
        assert_eq!(q.get("userId").map(String::as_str), Some("u1"));
        Json(json!({
            "data": [
                { "id": 2, "name": "Second", "createdAt": 200 },
                { "id": "first", "name": "First", "createdAt": 100 }
            ]
        }))
    }

    async fn create_session(Json(body): Json<Value>) -> Json<Value> {
        Json(json!({
            "data": { "id": 42, "name": body["name"], "createdAt": body["createdAt"] }
        }))
    }

    async fn delete_session(State(api): State<Api>, Path(id): Path<String>) -> StatusCode {
        if id == "missing" {
            return StatusCode::NOT_FOUND;
        }
        api.deleted.lock().unwrap().push(format!("session:{id}"));
        StatusCode::NO_CONTENT
    }

    async fn list_messages(Query(q): Query<HashMap<String, String>>) -> impl IntoResponse {
        match q.get("sessionId").map(String::as_str) {
            Some("broken") => (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({}))),
            Some(sid) => (
                StatusCode::OK,
                Json(json!([
                    { "id": 7, "sessionId": sid, "authorId": "u2", "content": "hello", "timestamp": 10 }
                ])),
            ),
            None => (StatusCode::BAD_REQUEST, Json(json!({}))),
        }
    }

    async fn delete_messages(
        State(api): State<Api>,
        Query(q): Query<HashMap<String, String>>,
    ) -> StatusCode {
        let sid = q.get("sessionId").cloned().unwrap_or_default();
        api.deleted.lock().unwrap().push(format!("messages:{sid}"));
        StatusCode::NO_CONTENT
    }

    async fn spawn_api() -> (String, Api) {
        let api = Api::default();
        let app = Router::new()
            .route("/api/sessions", get(list_sessions).post(create_session))
            .route("/api/sessions/{id}", delete(delete_session))
            .route("/api/messages", get(list_messages).delete(delete_messages))
            .layer(middleware::from_fn(require_bearer))
            .with_state(api.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}/"), api)
    }

    fn backend(base: &str, token: &str) -> HttpBackend {
        HttpBackend::new(base, Credential::new(token), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_list_sessions_unwraps_envelope() {
        let (base, _) = spawn_api().await;
        let sessions = backend(&base, TOKEN).list_sessions(&"u1".into()).await.unwrap();
        assert_eq!(
            sessions,
            vec![
                SessionInfo::new("2".into(), "Second", 200),
                SessionInfo::new("first".into(), "First", 100),
            ]
        );
    }

    #[tokio::test]
    async fn test_create_returns_server_id() {
        let (base, _) = spawn_api().await;
        let draft = SessionInfo::new("local-1".into(), "Mine", 123);
        let created = backend(&base, TOKEN)
            .create_session(&"u1".into(), &draft)
            .await
            .unwrap();
        assert_eq!(created, SessionInfo::new("42".into(), "Mine", 123));
    }

    #[tokio::test]
    async fn test_list_messages_bare_array() {
        let (base, _) = spawn_api().await;
        let messages = backend(&base, TOKEN)
            .list_messages(&"s1".into(), &"u1".into())
            .await
            .unwrap();
        assert_eq!(
            messages,
            vec![Message::confirmed("s1".into(), "u2".into(), "hello", 10).with_server_id("7")]
        );
    }

    #[tokio::test]
    async fn test_delete_calls_both_routes() {
        let (base, api) = spawn_api().await;
        let backend = backend(&base, TOKEN);
        backend.delete_messages(&"s1".into()).await.unwrap();
        backend.delete_session(&"s1".into()).await.unwrap();
        assert_eq!(
            *api.deleted.lock().unwrap(),
            ["messages:s1".to_string(), "session:s1".to_string()]
        );
    }

    #[tokio::test]
    async fn test_session_id_is_one_path_segment() {
        let (base, api) = spawn_api().await;
        let backend = backend(&base, TOKEN);
        backend.delete_session(&"team/1?x#y".into()).await.unwrap();
        assert_eq!(*api.deleted.lock().unwrap(), ["session:team/1?x#y".to_string()]);
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let (base, _) = spawn_api().await;
        let err = backend(&base, "wrong")
            .list_sessions(&"u1".into())
            .await
            .unwrap_err();
        assert_eq!(err, CollaboratorError::Unauthorized);

        let good = backend(&base, TOKEN);
        let err = good.delete_session(&"missing".into()).await.unwrap_err();
        assert!(matches!(err, CollaboratorError::NotFound(_)));

        let err = good
            .list_messages(&"broken".into(), &"u1".into())
            .await
            .unwrap_err();
        assert!(matches!(err, CollaboratorError::Internal(_)));
    }

    #[tokio::test]
    async fn test_unreachable_api_is_unavailable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = backend(&format!("http://{addr}"), TOKEN)
            .list_sessions(&"u1".into())
            .await
            .unwrap_err();
        assert!(matches!(err, CollaboratorError::Unavailable(_)));
    }
}

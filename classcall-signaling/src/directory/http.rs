//! REST-backed session directory

use super::{JoinStatus, ParticipantRecord, SessionDirectory, SessionRecord};
use async_trait::async_trait;
use classcall_core::{ClassCallError, Result, RoomId, SessionId, UserId};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};
use url::Url;

/// Error body returned by the backend
#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    detail: Option<serde_json::Value>,
}

/// Directory over the classroom backend's `/calls/` routes
#[derive(Debug, Clone)]
pub struct HttpSessionDirectory {
    client: Client,
    api_url: Url,
    token: Option<String>,
}

impl HttpSessionDirectory {
    /// Directory rooted at `api_url`, authenticating with a bearer token
    pub fn new(api_url: &str, token: Option<String>) -> Result<Self> {
        let mut api_url = Url::parse(api_url).map_err(|e| ClassCallError::Directory {
            operation: "configure".to_string(),
            reason: format!("invalid api url {api_url}: {e}"),
            status: None,
        })?;
        if !api_url.path().ends_with('/') {
            let path = format!("{}/", api_url.path());
            api_url.set_path(&path);
        }
        Ok(Self {
            client: Client::new(),
            api_url,
            token,
        })
    }

    /// Use a preconfigured HTTP client
    pub fn with_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    fn url(&self, operation: &str, path: &str) -> Result<Url> {
        self.api_url
            .join(path)
            .map_err(|e| ClassCallError::Directory {
                operation: operation.to_string(),
                reason: e.to_string(),
                status: None,
            })
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, operation: &str, request: RequestBuilder) -> Result<Response> {
        self.authorized(request)
            .send()
            .await
            .map_err(|e| ClassCallError::Directory {
                operation: operation.to_string(),
                reason: e.to_string(),
                status: e.status().map(|s| s.as_u16()),
            })
    }

    async fn decode<T: DeserializeOwned>(operation: &str, response: Response) -> Result<T> {
        let status = response.status();
        if !status.is_success() {
            return Err(Self::failure(operation, response).await);
        }
        response.json::<T>().await.map_err(|e| ClassCallError::Directory {
            operation: operation.to_string(),
            reason: format!("malformed response: {e}"),
            status: Some(status.as_u16()),
        })
    }

    async fn failure(operation: &str, response: Response) -> ClassCallError {
        let status = response.status();
        let detail = Self::detail(response).await;
        ClassCallError::Directory {
            operation: operation.to_string(),
            reason: detail.unwrap_or_else(|| status.to_string()),
            status: Some(status.as_u16()),
        }
    }

    async fn detail(response: Response) -> Option<String> {
        let body = response.json::<ErrorBody>().await.ok()?;
        match body.detail? {
            serde_json::Value::String(text) => Some(text),
            other => Some(other.to_string()),
        }
    }
}

#[async_trait]
impl SessionDirectory for HttpSessionDirectory {
    async fn list_sessions(&self, room_id: &RoomId) -> Result<Vec<SessionRecord>> {
        let url = self.url("list_sessions", "calls/")?;
        let request = self
            .client
            .get(url)
            .query(&[("classroom_id", room_id.as_str())]);
        let response = self.send("list_sessions", request).await?;
        let sessions: Vec<SessionRecord> = Self::decode("list_sessions", response).await?;
        debug!("Room {} has {} sessions", room_id, sessions.len());
        Ok(sessions)
    }

    async fn create_session(&self, room_id: &RoomId) -> Result<SessionRecord> {
        let url = self.url("create_session", "calls/")?;
        // The backend keys classrooms by integer where it can
        let classroom_id = match room_id.as_str().parse::<i64>() {
            Ok(numeric) => json!(numeric),
            Err(_) => json!(room_id.as_str()),
        };
        let request = self
            .client
            .post(url)
            .json(&json!({ "classroom_id": classroom_id, "status": "active" }));
        let response = self.send("create_session", request).await?;
        if response.status() == StatusCode::FORBIDDEN {
            return Err(ClassCallError::NotAuthorized {
                user_id: "current user".to_string(),
                operation: "create_session".to_string(),
            });
        }
        Self::decode("create_session", response).await
    }

    async fn list_participants(&self, session_id: &SessionId) -> Result<Vec<ParticipantRecord>> {
        let url = self.url(
            "list_participants",
            &format!("calls/{session_id}/participants"),
        )?;
        let response = self.send("list_participants", self.client.get(url)).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(ClassCallError::SessionNotFound {
                session_id: session_id.to_string(),
            });
        }
        Self::decode("list_participants", response).await
    }

    async fn join(&self, session_id: &SessionId, user_id: &UserId) -> Result<JoinStatus> {
        let url = self.url("join", &format!("calls/{session_id}/join"))?;
        let response = self
            .send("join", self.client.post(url).json(&json!({})))
            .await?;
        let status = response.status();
        if status.is_success() {
            return Ok(JoinStatus::Joined);
        }
        if status == StatusCode::CONFLICT {
            return Ok(JoinStatus::AlreadyJoined);
        }
        let detail = Self::detail(response).await.unwrap_or_default();
        let lowered = detail.to_ascii_lowercase();
        if status == StatusCode::BAD_REQUEST && lowered.contains("already") {
            debug!("User {} already in session {}", user_id, session_id);
            return Ok(JoinStatus::AlreadyJoined);
        }
        if status == StatusCode::BAD_REQUEST && lowered.contains("not active") {
            return Err(ClassCallError::SessionNotActive {
                session_id: session_id.to_string(),
            });
        }
        warn!("Join of session {} rejected with {}", session_id, status);
        Err(ClassCallError::Directory {
            operation: "join".to_string(),
            reason: if detail.is_empty() {
                status.to_string()
            } else {
                detail
            },
            status: Some(status.as_u16()),
        })
    }

    async fn leave(&self, session_id: &SessionId, user_id: &UserId) -> Result<()> {
        let url = self.url("leave", &format!("calls/{session_id}/leave"))?;
        let response = self.send("leave", self.client.delete(url)).await?;
        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            debug!("User {} no longer in session {} ({})", user_id, session_id, status);
            return Ok(());
        }
        Err(Self::failure("leave", response).await)
    }
}

//! Call session directory
//!
//! The classroom backend keeps one call session per classroom and a
//! membership row per participant. [`SessionDirectory`] is the seam over
//! those REST operations; [`SessionDirectoryClient`] builds the call-setup
//! steps on top of it (find or create the session, make sure we are a
//! member, leave best-effort).

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use classcall_core::{Result, Role, RoomId, SessionId, UserId};
use serde::{Deserialize, Deserializer, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub mod http;
pub mod memory;

pub use http::HttpSessionDirectory;
pub use memory::InMemorySessionDirectory;

/// Lifecycle status of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Accepting participants
    Active,
    /// Finished
    Ended,
}

/// Session as reported by the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Session ID
    pub id: SessionId,
    /// Classroom the session belongs to
    #[serde(rename = "classroom_id")]
    pub room_id: RoomId,
    /// Current status
    pub status: SessionStatus,
    /// Creation time
    #[serde(deserialize_with = "timestamp::deserialize")]
    pub created_at: DateTime<Utc>,
}

impl SessionRecord {
    /// Whether the session accepts participants
    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }
}

/// Membership of a user in a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantRecord {
    /// Session the membership belongs to
    #[serde(rename = "call_id")]
    pub session_id: SessionId,
    /// Member
    pub user_id: UserId,
    /// Backend role label (`teacher`, `student`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// When the user (re)joined
    #[serde(deserialize_with = "timestamp::deserialize")]
    pub joined_at: DateTime<Utc>,
    /// When the user left; `None` while active
    #[serde(default, deserialize_with = "timestamp::deserialize_option")]
    pub left_at: Option<DateTime<Utc>>,
}

impl ParticipantRecord {
    /// Whether the membership is current
    pub fn is_active(&self) -> bool {
        self.left_at.is_none()
    }
}

/// Result of a join request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinStatus {
    /// A membership was created or reactivated
    Joined,
    /// The user was already an active member
    AlreadyJoined,
}

/// Session the local user is about to use
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRef {
    /// Session ID
    pub id: SessionId,
    /// Owning classroom
    pub room_id: RoomId,
    /// Whether this client created the session
    pub created_by_us: bool,
}

/// Outcome of session resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionResolution {
    /// A usable session exists
    Ready(SessionRef),
    /// No active session and the local role may not create one
    WaitingForHost,
}

/// Outcome of [`SessionDirectoryClient::ensure_joined`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    /// The user already held an active membership
    pub already_joined: bool,
    /// Other active members at the time of joining
    pub others: Vec<UserId>,
}

/// REST operations on call sessions
#[async_trait]
pub trait SessionDirectory: Send + Sync {
    /// Sessions of a classroom
    async fn list_sessions(&self, room_id: &RoomId) -> Result<Vec<SessionRecord>>;

    /// Create an active session for a classroom
    async fn create_session(&self, room_id: &RoomId) -> Result<SessionRecord>;

    /// Memberships of a session, active and past
    async fn list_participants(&self, session_id: &SessionId) -> Result<Vec<ParticipantRecord>>;

    /// Add or reactivate a membership
    async fn join(&self, session_id: &SessionId, user_id: &UserId) -> Result<JoinStatus>;

    /// End a membership
    async fn leave(&self, session_id: &SessionId, user_id: &UserId) -> Result<()>;
}

/// Call-setup operations over a [`SessionDirectory`]
#[derive(Clone)]
pub struct SessionDirectoryClient {
    directory: Arc<dyn SessionDirectory>,
}

impl std::fmt::Debug for SessionDirectoryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionDirectoryClient").finish_non_exhaustive()
    }
}

impl SessionDirectoryClient {
    /// Wrap a directory
    pub fn new(directory: Arc<dyn SessionDirectory>) -> Self {
        Self { directory }
    }

    /// Find the classroom's active session, creating one when allowed.
    ///
    /// A participant who finds no active session gets `WaitingForHost`; that
    /// is a normal outcome, not an error.
    pub async fn resolve_or_create_session(
        &self,
        room_id: &RoomId,
        role: Role,
    ) -> Result<SessionResolution> {
        let sessions = self.directory.list_sessions(room_id).await?;
        let active = sessions
            .into_iter()
            .filter(SessionRecord::is_active)
            .max_by_key(|s| s.created_at);

        if let Some(session) = active {
            debug!("Found active session {} for room {}", session.id, room_id);
            return Ok(SessionResolution::Ready(SessionRef {
                id: session.id,
                room_id: room_id.clone(),
                created_by_us: false,
            }));
        }

        if !role.is_elevated() {
            info!("⏳ No active session in room {}, waiting for host", room_id);
            return Ok(SessionResolution::WaitingForHost);
        }

        let created = self.directory.create_session(room_id).await?;
        info!("📞 Session {} created for room {}", created.id, room_id);
        Ok(SessionResolution::Ready(SessionRef {
            id: created.id,
            room_id: room_id.clone(),
            created_by_us: true,
        }))
    }

    /// Make sure `user_id` is an active member; calling it twice is harmless
    pub async fn ensure_joined(&self, session_id: &SessionId, user_id: &UserId) -> Result<JoinOutcome> {
        let participants = self.directory.list_participants(session_id).await?;
        let mut already_joined = participants
            .iter()
            .any(|p| &p.user_id == user_id && p.is_active());

        if !already_joined {
            match self.directory.join(session_id, user_id).await? {
                JoinStatus::Joined => info!("User {} joined session {}", user_id, session_id),
                JoinStatus::AlreadyJoined => {
                    debug!("User {} was already in session {}", user_id, session_id);
                    already_joined = true;
                }
            }
        }

        let mut others: Vec<UserId> = Vec::new();
        for participant in participants.iter().filter(|p| p.is_active()) {
            if &participant.user_id != user_id && !others.contains(&participant.user_id) {
                others.push(participant.user_id.clone());
            }
        }
        Ok(JoinOutcome {
            already_joined,
            others,
        })
    }

    /// Leave the session; failures are logged and swallowed
    pub async fn leave(&self, session_id: &SessionId, user_id: &UserId) {
        match self.directory.leave(session_id, user_id).await {
            Ok(()) => info!("User {} left session {}", user_id, session_id),
            Err(e) => warn!("Leaving session {} failed (ignored): {}", session_id, e),
        }
    }
}

/// Backend timestamps are naive UTC; RFC 3339 is accepted too
mod timestamp {
    use super::*;

    fn parse(text: &str) -> Option<DateTime<Utc>> {
        if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
            return Some(parsed.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
            .ok()
            .map(|naive| Utc.from_utc_datetime(&naive))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        parse(&text).ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp {text}")))
    }

    pub fn deserialize_option<'de, D>(
        deserializer: D,
    ) -> std::result::Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<String>::deserialize(deserializer)? {
            Some(text) => parse(&text)
                .map(Some)
                .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp {text}"))),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_session_payload() {
        let session: SessionRecord = serde_json::from_str(
            r#"{"id":7,"classroom_id":3,"status":"active","created_at":"2024-05-02T09:30:00.123456"}"#,
        )
        .unwrap();
        assert_eq!(session.id, SessionId::from(7));
        assert_eq!(session.room_id, RoomId::from(3));
        assert!(session.is_active());
    }

    #[test]
    fn test_backend_participant_payload() {
        let participant: ParticipantRecord = serde_json::from_str(
            r#"{"id":1,"call_id":7,"user_id":42,"role":"student","joined_at":"2024-05-02T09:31:00",
                "left_at":null,"mic_status":true,"camera_status":true,"screen_sharing":false,
                "video_quality":"medium"}"#,
        )
        .unwrap();
        assert_eq!(participant.user_id, UserId::from(42));
        assert!(participant.is_active());

        let left: ParticipantRecord = serde_json::from_str(
            r#"{"call_id":7,"user_id":42,"joined_at":"2024-05-02T09:31:00Z","left_at":"2024-05-02T10:00:00Z"}"#,
        )
        .unwrap();
        assert!(!left.is_active());
    }
}

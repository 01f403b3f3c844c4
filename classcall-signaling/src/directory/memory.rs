//! Process-local session directory

use super::{JoinStatus, ParticipantRecord, SessionDirectory, SessionRecord, SessionStatus};
use async_trait::async_trait;
use chrono::Utc;
use classcall_core::{ClassCallError, Result, RoomId, SessionId, UserId};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Default)]
struct DirectoryState {
    sessions: Vec<SessionRecord>,
    participants: Vec<ParticipantRecord>,
    join_requests: usize,
}

/// Directory kept in memory with the backend's membership rules.
///
/// Leaving marks the membership with `left_at`; the session ends once no
/// active member remains.
#[derive(Debug, Clone, Default)]
pub struct InMemorySessionDirectory {
    state: Arc<RwLock<DirectoryState>>,
    next_id: Arc<AtomicU64>,
    fail_leave: Arc<AtomicBool>,
}

impl InMemorySessionDirectory {
    /// Empty directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `leave` fail, to exercise best-effort teardown
    pub fn fail_leave(&self, fail: bool) {
        self.fail_leave.store(fail, Ordering::SeqCst);
    }

    /// Snapshot of a session
    pub fn session(&self, session_id: &SessionId) -> Option<SessionRecord> {
        self.state
            .read()
            .sessions
            .iter()
            .find(|s| &s.id == session_id)
            .cloned()
    }

    /// Every session, oldest first
    pub fn sessions(&self) -> Vec<SessionRecord> {
        self.state.read().sessions.clone()
    }

    /// Active members of a session
    pub fn active_members(&self, session_id: &SessionId) -> Vec<UserId> {
        self.state
            .read()
            .participants
            .iter()
            .filter(|p| &p.session_id == session_id && p.is_active())
            .map(|p| p.user_id.clone())
            .collect()
    }

    /// Number of join requests received
    pub fn join_requests(&self) -> usize {
        self.state.read().join_requests
    }
}

#[async_trait]
impl SessionDirectory for InMemorySessionDirectory {
    async fn list_sessions(&self, room_id: &RoomId) -> Result<Vec<SessionRecord>> {
        Ok(self
            .state
            .read()
            .sessions
            .iter()
            .filter(|s| &s.room_id == room_id)
            .cloned()
            .collect())
    }

    async fn create_session(&self, room_id: &RoomId) -> Result<SessionRecord> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let session = SessionRecord {
            id: SessionId::from(id.to_string()),
            room_id: room_id.clone(),
            status: SessionStatus::Active,
            created_at: Utc::now(),
        };
        self.state.write().sessions.push(session.clone());
        info!("In-memory session {} created for room {}", session.id, room_id);
        Ok(session)
    }

    async fn list_participants(&self, session_id: &SessionId) -> Result<Vec<ParticipantRecord>> {
        let state = self.state.read();
        if !state.sessions.iter().any(|s| &s.id == session_id) {
            return Err(ClassCallError::SessionNotFound {
                session_id: session_id.to_string(),
            });
        }
        Ok(state
            .participants
            .iter()
            .filter(|p| &p.session_id == session_id)
            .cloned()
            .collect())
    }

    async fn join(&self, session_id: &SessionId, user_id: &UserId) -> Result<JoinStatus> {
        let mut state = self.state.write();
        state.join_requests += 1;
        let active = state
            .sessions
            .iter()
            .find(|s| &s.id == session_id)
            .map(SessionRecord::is_active);
        match active {
            None => {
                return Err(ClassCallError::SessionNotFound {
                    session_id: session_id.to_string(),
                })
            }
            Some(false) => {
                return Err(ClassCallError::SessionNotActive {
                    session_id: session_id.to_string(),
                })
            }
            Some(true) => {}
        }

        let existing = state
            .participants
            .iter_mut()
            .find(|p| &p.session_id == session_id && &p.user_id == user_id);
        match existing {
            Some(participant) if participant.is_active() => Ok(JoinStatus::AlreadyJoined),
            Some(participant) => {
                participant.joined_at = Utc::now();
                participant.left_at = None;
                Ok(JoinStatus::Joined)
            }
            None => {
                state.participants.push(ParticipantRecord {
                    session_id: session_id.clone(),
                    user_id: user_id.clone(),
                    role: None,
                    joined_at: Utc::now(),
                    left_at: None,
                });
                Ok(JoinStatus::Joined)
            }
        }
    }

    async fn leave(&self, session_id: &SessionId, user_id: &UserId) -> Result<()> {
        if self.fail_leave.load(Ordering::SeqCst) {
            return Err(ClassCallError::Directory {
                operation: "leave".to_string(),
                reason: "directory unavailable".to_string(),
                status: Some(503),
            });
        }

        let mut state = self.state.write();
        let now = Utc::now();
        let mut found = false;
        for participant in state
            .participants
            .iter_mut()
            .filter(|p| &p.session_id == session_id && &p.user_id == user_id && p.is_active())
        {
            participant.left_at = Some(now);
            found = true;
        }
        if !found {
            return Err(ClassCallError::Directory {
                operation: "leave".to_string(),
                reason: format!("{user_id} is not in session {session_id}"),
                status: Some(404),
            });
        }

        let still_active = state
            .participants
            .iter()
            .any(|p| &p.session_id == session_id && p.is_active());
        if !still_active {
            if let Some(session) = state.sessions.iter_mut().find(|s| &s.id == session_id) {
                session.status = SessionStatus::Ended;
                info!("In-memory session {} ended", session_id);
            }
        }
        Ok(())
    }
}

//! In-memory signaling relay
//!
//! Mirrors the classroom backend's call socket: a member connecting to a
//! session is greeted with `Open` and a `peers` snapshot, everybody (the
//! newcomer included) receives a `join` notice, every frame a member sends is
//! forwarded to all members including the sender, and a disconnect is
//! announced to the remaining members with `leave`.

use crate::channel::{ChannelConnector, ChannelEvent, Outbound, SignalingChannel, SignalingSender};
use async_trait::async_trait;
use classcall_core::{Result, SessionId, SignalingMessage, UserId};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Connected member of a relayed session
#[derive(Debug, Clone)]
struct Member {
    user: UserId,
    connection_id: String,
    events: mpsc::UnboundedSender<ChannelEvent>,
}

/// Relay state of one session
#[derive(Debug)]
struct RelayRoom {
    members: Vec<Member>,
    history: Vec<SignalingMessage>,
    created_at: chrono::DateTime<chrono::Utc>,
}

impl RelayRoom {
    fn new() -> Self {
        Self {
            members: Vec::new(),
            history: Vec::new(),
            created_at: chrono::Utc::now(),
        }
    }

    fn users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = Vec::new();
        for member in &self.members {
            if !users.contains(&member.user) {
                users.push(member.user.clone());
            }
        }
        users
    }
}

/// Process-local relay shared by every member of every session
#[derive(Debug, Clone, Default)]
pub struct MemoryRelay {
    rooms: Arc<RwLock<HashMap<SessionId, RelayRoom>>>,
}

impl MemoryRelay {
    /// Create an empty relay
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a member to a session
    pub fn join(&self, session_id: &SessionId, user_id: &UserId) -> SignalingChannel {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let member = Member {
            user: user_id.clone(),
            connection_id: Uuid::new_v4().to_string(),
            events: events_tx.clone(),
        };

        let recipients = {
            let mut rooms = self.rooms.write();
            let room = rooms
                .entry(session_id.clone())
                .or_insert_with(RelayRoom::new);
            room.members.push(member.clone());
            let _ = events_tx.send(ChannelEvent::Open);
            let _ = events_tx.send(ChannelEvent::Message(SignalingMessage::Peers {
                peers: room.users(),
            }));
            room.members.clone()
        };

        let join = SignalingMessage::Join {
            user: user_id.clone(),
        };
        for recipient in &recipients {
            let _ = recipient.events.send(ChannelEvent::Message(join.clone()));
        }
        info!(
            "User {} joined relayed session {} ({} members)",
            user_id,
            session_id,
            recipients.len()
        );

        tokio::spawn(self.clone().pump(session_id.clone(), member, out_rx));
        SignalingChannel::new(SignalingSender::new(out_tx), events_rx)
    }

    async fn pump(
        self,
        session_id: SessionId,
        member: Member,
        mut outbound: mpsc::UnboundedReceiver<Outbound>,
    ) {
        let mut reason = "sender dropped".to_string();
        while let Some(command) = outbound.recv().await {
            match command {
                Outbound::Frame(message) => self.broadcast(&session_id, message),
                Outbound::Close => {
                    reason = "closed by client".to_string();
                    break;
                }
            }
        }
        self.disconnect(&session_id, &member, &reason);
    }

    /// Deliver a frame to every member of the session, sender included
    fn broadcast(&self, session_id: &SessionId, message: SignalingMessage) {
        let members = {
            let mut rooms = self.rooms.write();
            match rooms.get_mut(session_id) {
                Some(room) => {
                    room.history.push(message.clone());
                    room.members.clone()
                }
                None => return,
            }
        };
        debug!(
            "Relaying {} to {} members of {}",
            message.action(),
            members.len(),
            session_id
        );
        for member in members {
            let _ = member.events.send(ChannelEvent::Message(message.clone()));
        }
    }

    /// Deliver a raw text frame, decoding it per member like a socket would
    pub fn inject_raw(&self, session_id: &SessionId, text: &str) {
        let members = match self.rooms.read().get(session_id) {
            Some(room) => room.members.clone(),
            None => return,
        };
        for member in members {
            match SignalingMessage::from_json(text) {
                Ok(message) => {
                    let _ = member.events.send(ChannelEvent::Message(message));
                }
                Err(e) => warn!(
                    "Dropping malformed frame for connection {}: {}",
                    member.connection_id, e
                ),
            }
        }
    }

    fn disconnect(&self, session_id: &SessionId, member: &Member, reason: &str) {
        let remaining = {
            let mut rooms = self.rooms.write();
            let Some(room) = rooms.get_mut(session_id) else {
                return;
            };
            room.members
                .retain(|m| m.connection_id != member.connection_id);
            room.members.clone()
        };
        let _ = member.events.send(ChannelEvent::Closed {
            reason: reason.to_string(),
        });

        let leave = SignalingMessage::Leave {
            user: member.user.clone(),
        };
        for other in remaining {
            let _ = other.events.send(ChannelEvent::Message(leave.clone()));
        }
        info!(
            "User {} left relayed session {} ({})",
            member.user, session_id, reason
        );
    }

    /// Close every member's channel, as a server shutdown would
    pub fn close_session(&self, session_id: &SessionId, reason: &str) {
        let room = self.rooms.write().remove(session_id);
        if let Some(room) = room {
            for member in room.members {
                let _ = member.events.send(ChannelEvent::Closed {
                    reason: reason.to_string(),
                });
            }
            info!("Relayed session {} closed: {}", session_id, reason);
        }
    }

    /// Report a socket failure on every connection of `user_id`
    pub fn fail_connection(&self, session_id: &SessionId, user_id: &UserId, error: &str) {
        let members: Vec<Member> = match self.rooms.read().get(session_id) {
            Some(room) => room
                .members
                .iter()
                .filter(|m| &m.user == user_id)
                .cloned()
                .collect(),
            None => return,
        };
        for member in members {
            warn!(
                "Connection {} of user {} failed: {}",
                member.connection_id, user_id, error
            );
            let _ = member.events.send(ChannelEvent::Error(error.to_string()));
        }
    }

    /// Users currently connected to a session
    pub fn members(&self, session_id: &SessionId) -> Vec<UserId> {
        self.rooms
            .read()
            .get(session_id)
            .map(RelayRoom::users)
            .unwrap_or_default()
    }

    /// Every frame relayed in a session so far, in order
    pub fn history(&self, session_id: &SessionId) -> Vec<SignalingMessage> {
        self.rooms
            .read()
            .get(session_id)
            .map(|room| room.history.clone())
            .unwrap_or_default()
    }

    /// When the session was first joined
    pub fn created_at(&self, session_id: &SessionId) -> Option<chrono::DateTime<chrono::Utc>> {
        self.rooms.read().get(session_id).map(|room| room.created_at)
    }
}

#[async_trait]
impl ChannelConnector for MemoryRelay {
    async fn connect(&self, session_id: &SessionId, user_id: &UserId) -> Result<SignalingChannel> {
        Ok(self.join(session_id, user_id))
    }
}

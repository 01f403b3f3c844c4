//! Signaling protocol messages
//!
//! JSON objects discriminated by an `action` field. Identifiers accept both
//! numbers and strings on input because the classroom backend uses integer
//! primary keys; they always serialise as strings.

use crate::media::TrackKind;
use crate::transport::{IceCandidate, SessionDescription};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Number(i64),
    Text(String),
}

impl RawId {
    fn into_string(self) -> String {
        match self {
            RawId::Number(n) => n.to_string(),
            RawId::Text(s) => s,
        }
    }
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap an identifier
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Borrow the identifier text
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: Deserializer<'de>,
            {
                RawId::deserialize(deserializer).map(|raw| Self(raw.into_string()))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }

        impl From<i64> for $name {
            fn from(id: i64) -> Self {
                Self(id.to_string())
            }
        }
    };
}

string_id!(
    /// Participant identifier
    UserId
);
string_id!(
    /// Call session identifier
    SessionId
);
string_id!(
    /// Classroom identifier
    RoomId
);

/// Messages exchanged over the signaling channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum SignalingMessage {
    /// Presence snapshot delivered on join
    Peers {
        /// Users currently connected to the session
        peers: Vec<UserId>,
    },
    /// A participant connected
    Join {
        /// Joining user
        user: UserId,
    },
    /// A participant disconnected
    Leave {
        /// Leaving user
        user: UserId,
    },
    /// Session offer
    Offer {
        /// Offer description
        offer: SessionDescription,
        /// Sender
        user: UserId,
        /// Addressed participant, absent for broadcast
        #[serde(default, skip_serializing_if = "Option::is_none")]
        recipient_id: Option<UserId>,
    },
    /// Session answer
    Answer {
        /// Answer description
        answer: SessionDescription,
        /// Sender
        user: UserId,
        /// Addressed participant, absent for broadcast
        #[serde(default, skip_serializing_if = "Option::is_none")]
        recipient_id: Option<UserId>,
    },
    /// Trickled ICE candidate
    IceCandidate {
        /// Candidate; `null` marks end of candidates and is ignored
        candidate: Option<IceCandidate>,
        /// Sender
        user: UserId,
        /// Addressed participant, absent for broadcast
        #[serde(default, skip_serializing_if = "Option::is_none")]
        recipient_id: Option<UserId>,
    },
    /// Local microphone toggled (informational)
    ToggleMic {
        /// New microphone state
        status: bool,
        /// Sender, when the relay stamps it
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user: Option<UserId>,
    },
    /// Local camera toggled (informational)
    ToggleCamera {
        /// New camera state
        status: bool,
        /// Sender, when the relay stamps it
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user: Option<UserId>,
    },
    /// Backend broadcast of a participant's microphone state
    MicStatus {
        /// Participant
        user: UserId,
        /// Microphone state
        status: bool,
    },
    /// Backend broadcast of a participant's camera state
    CameraStatus {
        /// Participant
        user: UserId,
        /// Camera state
        status: bool,
    },
    /// Request to end the call
    EndCall {
        /// Sender, when known
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user: Option<UserId>,
    },
    /// The call was ended
    CallEnded {
        /// Who ended it, when known
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user: Option<UserId>,
    },
}

impl SignalingMessage {
    /// The `action` discriminator of this message
    pub fn action(&self) -> &'static str {
        match self {
            SignalingMessage::Peers { .. } => "peers",
            SignalingMessage::Join { .. } => "join",
            SignalingMessage::Leave { .. } => "leave",
            SignalingMessage::Offer { .. } => "offer",
            SignalingMessage::Answer { .. } => "answer",
            SignalingMessage::IceCandidate { .. } => "ice_candidate",
            SignalingMessage::ToggleMic { .. } => "toggle_mic",
            SignalingMessage::ToggleCamera { .. } => "toggle_camera",
            SignalingMessage::MicStatus { .. } => "mic_status",
            SignalingMessage::CameraStatus { .. } => "camera_status",
            SignalingMessage::EndCall { .. } => "end_call",
            SignalingMessage::CallEnded { .. } => "call_ended",
        }
    }

    /// Sender of the message, when it carries one
    pub fn sender(&self) -> Option<&UserId> {
        match self {
            SignalingMessage::Join { user }
            | SignalingMessage::Leave { user }
            | SignalingMessage::Offer { user, .. }
            | SignalingMessage::Answer { user, .. }
            | SignalingMessage::IceCandidate { user, .. }
            | SignalingMessage::MicStatus { user, .. }
            | SignalingMessage::CameraStatus { user, .. } => Some(user),
            SignalingMessage::ToggleMic { user, .. }
            | SignalingMessage::ToggleCamera { user, .. }
            | SignalingMessage::EndCall { user }
            | SignalingMessage::CallEnded { user } => user.as_ref(),
            SignalingMessage::Peers { .. } => None,
        }
    }

    /// Addressed participant, when the message is directed
    pub fn recipient(&self) -> Option<&UserId> {
        match self {
            SignalingMessage::Offer { recipient_id, .. }
            | SignalingMessage::Answer { recipient_id, .. }
            | SignalingMessage::IceCandidate { recipient_id, .. } => recipient_id.as_ref(),
            _ => None,
        }
    }

    /// Media toggle carried by this message, if any
    pub fn media_toggle(&self) -> Option<(TrackKind, bool)> {
        match self {
            SignalingMessage::ToggleMic { status, .. } | SignalingMessage::MicStatus { status, .. } => {
                Some((TrackKind::Audio, *status))
            }
            SignalingMessage::ToggleCamera { status, .. }
            | SignalingMessage::CameraStatus { status, .. } => Some((TrackKind::Video, *status)),
            _ => None,
        }
    }

    /// Decode a text frame
    pub fn from_json(text: &str) -> crate::error::Result<Self> {
        serde_json::from_str(text).map_err(|e| crate::error::ClassCallError::InvalidMessage {
            message: text.to_string(),
            source: e.into(),
        })
    }

    /// Encode as a text frame
    pub fn to_json(&self) -> String {
        // Serialising plain data with string keys cannot fail
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_join_with_numeric_user() {
        let msg = SignalingMessage::from_json(
            r#"{"action":"join","user":42,"mic_status":true,"camera_status":true}"#,
        )
        .unwrap();
        assert_eq!(msg, SignalingMessage::Join { user: UserId::from(42) });
        assert_eq!(msg.sender().unwrap().as_str(), "42");
    }

    #[test]
    fn test_offer_wire_shape() {
        let msg = SignalingMessage::Offer {
            offer: SessionDescription::offer("v=0\r\n"),
            user: UserId::new("7"),
            recipient_id: None,
        };
        let json: serde_json::Value = serde_json::from_str(&msg.to_json()).unwrap();
        assert_eq!(json["action"], "offer");
        assert_eq!(json["offer"]["type"], "offer");
        assert_eq!(json["user"], "7");
        assert!(json.get("recipient_id").is_none());
    }

    #[test]
    fn test_ice_candidate_with_null_candidate() {
        let msg =
            SignalingMessage::from_json(r#"{"action":"ice_candidate","candidate":null,"user":"3"}"#)
                .unwrap();
        match msg {
            SignalingMessage::IceCandidate { candidate, .. } => assert!(candidate.is_none()),
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn test_toggle_messages_are_informational() {
        let msg = SignalingMessage::from_json(r#"{"action":"toggle_camera","status":false}"#).unwrap();
        assert_eq!(msg.media_toggle(), Some((TrackKind::Video, false)));
        assert!(msg.sender().is_none());

        let status =
            SignalingMessage::from_json(r#"{"action":"mic_status","user":5,"status":true}"#).unwrap();
        assert_eq!(status.media_toggle(), Some((TrackKind::Audio, true)));
    }

    #[test]
    fn test_unknown_action_is_rejected() {
        let err = SignalingMessage::from_json(r#"{"action":"share_screen","status":true}"#)
            .unwrap_err();
        assert_eq!(err.error_code(), "INVALID_MESSAGE");
        assert!(SignalingMessage::from_json("not json").is_err());
    }

    #[test]
    fn test_end_call_without_user() {
        let msg = SignalingMessage::from_json(r#"{"action":"end_call"}"#).unwrap();
        assert_eq!(msg, SignalingMessage::EndCall { user: None });
        assert_eq!(msg.action(), "end_call");
    }
}

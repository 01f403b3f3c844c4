//! Media transport endpoint abstraction
//!
//! The negotiation engine never talks to a concrete peer connection. It drives
//! a [`MediaTransport`] (the local end of the media session: SDP state, ICE
//! agent, RTP senders) and listens to the [`TransportEvent`]s the endpoint
//! reports. Concrete endpoints are produced by a [`TransportFactory`] so the
//! call controller can build a fresh one per call.

use crate::error::Result;
use crate::media::LocalTrack;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Kind of session description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    /// Offer from the initiating side
    Offer,
    /// Final answer
    Answer,
    /// Provisional answer
    Pranswer,
    /// Rollback of a pending local offer
    Rollback,
}

impl fmt::Display for SdpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SdpType::Offer => "offer",
            SdpType::Answer => "answer",
            SdpType::Pranswer => "pranswer",
            SdpType::Rollback => "rollback",
        };
        f.write_str(name)
    }
}

/// Session description in the browser's `{type, sdp}` shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Description kind
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    /// Raw SDP body
    #[serde(default)]
    pub sdp: String,
}

impl SessionDescription {
    /// Build an offer description
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    /// Build an answer description
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    /// Build a rollback description
    pub fn rollback() -> Self {
        Self {
            sdp_type: SdpType::Rollback,
            sdp: String::new(),
        }
    }
}

/// ICE candidate in the browser's `RTCIceCandidateInit` JSON shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate attribute line (`candidate:...`)
    pub candidate: String,
    /// Media stream identification tag
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    /// Index of the media description this candidate belongs to
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    /// ICE username fragment
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    /// Create a candidate for the first media section
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    /// Candidate type inferred from the `typ` token of the candidate line
    pub fn candidate_type(&self) -> CandidateType {
        CandidateType::from_candidate_line(&self.candidate)
    }

    /// An empty candidate line marks the end of gathering
    pub fn is_end_of_candidates(&self) -> bool {
        self.candidate.trim().is_empty()
    }
}

/// Network path class of an ICE candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateType {
    /// Local interface address
    Host,
    /// Address learned from a STUN server
    ServerReflexive,
    /// Address learned from connectivity checks
    PeerReflexive,
    /// Address allocated on a TURN relay
    Relay,
    /// Missing or unrecognised `typ` token
    Unknown,
}

impl CandidateType {
    /// Parse the `typ <type>` token of a candidate line
    pub fn from_candidate_line(line: &str) -> Self {
        let mut tokens = line.split_whitespace();
        while let Some(token) = tokens.next() {
            if token == "typ" {
                return match tokens.next() {
                    Some("host") => CandidateType::Host,
                    Some("srflx") => CandidateType::ServerReflexive,
                    Some("prflx") => CandidateType::PeerReflexive,
                    Some("relay") => CandidateType::Relay,
                    _ => CandidateType::Unknown,
                };
            }
        }
        CandidateType::Unknown
    }
}

/// SDP exchange phase of the local endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalingState {
    /// No exchange in progress
    Stable,
    /// Local offer applied, waiting for the answer
    HaveLocalOffer,
    /// Remote offer applied, answer not yet produced
    HaveRemoteOffer,
    /// Endpoint closed
    Closed,
}

impl fmt::Display for SignalingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SignalingState::Stable => "stable",
            SignalingState::HaveLocalOffer => "have-local-offer",
            SignalingState::HaveRemoteOffer => "have-remote-offer",
            SignalingState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Aggregate connection state of the media session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Nothing attempted yet
    New,
    /// Connectivity checks running
    Connecting,
    /// At least one working path
    Connected,
    /// ICE finished with a selected pair
    Completed,
    /// Lost connectivity, may recover
    Disconnected,
    /// Connectivity checks failed
    Failed,
    /// Endpoint closed
    Closed,
}

impl ConnectionState {
    /// Connected or completed
    pub fn is_stable(&self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Completed)
    }
}

/// ICE gathering progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IceGatheringState {
    /// Not started
    New,
    /// Gathering candidates
    Gathering,
    /// All candidates gathered
    Complete,
}

/// STUN/TURN server entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    /// Server URLs (`stun:`, `turn:`, `turns:`)
    pub urls: Vec<String>,
    /// TURN username
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// TURN credential
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    /// STUN server without credentials
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    /// TURN server with credentials
    pub fn turn(
        url: impl Into<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            urls: vec![url.into()],
            username: Some(username.into()),
            credential: Some(credential.into()),
        }
    }

    /// Whether any URL points at a TURN relay
    pub fn is_relay(&self) -> bool {
        self.urls.iter().any(|url| is_relay_url(url))
    }
}

/// `turn:` and `turns:` URLs designate relays
pub fn is_relay_url(url: &str) -> bool {
    let lower = url.to_ascii_lowercase();
    lower.starts_with("turn:") || lower.starts_with("turns:")
}

/// ICE failure reported by the endpoint or by a failed candidate operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidateError {
    /// STUN/TURN server URL the error is attributed to, when known
    pub url: Option<String>,
    /// STUN error code (e.g. 401, 701)
    pub error_code: Option<u16>,
    /// Human-readable reason
    pub error_text: String,
}

impl IceCandidateError {
    /// Error not attributed to any server
    pub fn local(error_text: impl Into<String>) -> Self {
        Self {
            url: None,
            error_code: None,
            error_text: error_text.into(),
        }
    }

    /// Whether the failing server is a TURN relay
    pub fn is_relay_attributed(&self) -> bool {
        self.url.as_deref().map(is_relay_url).unwrap_or(false)
    }

    /// Whether the failure looks like rejected relay credentials
    pub fn looks_like_auth_failure(&self) -> bool {
        if matches!(self.error_code, Some(401) | Some(403) | Some(441)) {
            return true;
        }
        let text = self.error_text.to_ascii_lowercase();
        ["unauthorized", "auth", "credential", "forbidden"]
            .iter()
            .any(|needle| text.contains(needle))
    }
}

/// Callback from the transport endpoint
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Local media changed; a new offer is wanted
    NegotiationNeeded,
    /// Locally gathered candidate; `None` ends gathering
    LocalCandidate(Option<IceCandidate>),
    /// Connection state changed
    ConnectionStateChanged(ConnectionState),
    /// Gathering state changed
    IceGatheringStateChanged(IceGatheringState),
    /// STUN/TURN server error during gathering
    IceCandidateError(IceCandidateError),
    /// Remote media arrived
    RemoteTrack {
        /// Remote track identifier
        track_id: String,
        /// Media kind
        kind: crate::media::TrackKind,
    },
}

/// Receiver side of a transport's callbacks
pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

/// Local media-transport endpoint (one per call)
#[async_trait]
pub trait MediaTransport: Send + Sync + fmt::Debug {
    /// Generate an offer for the current local media
    async fn create_offer(&self) -> Result<SessionDescription>;

    /// Generate an answer to the applied remote offer
    async fn create_answer(&self) -> Result<SessionDescription>;

    /// Apply a local description
    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;

    /// Apply a remote description
    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    /// Abandon a pending local offer and return to `stable`
    async fn rollback(&self) -> Result<()>;

    /// Add a remote candidate; fails when no remote description is set
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Start sending a local track
    async fn add_track(&self, track: &LocalTrack) -> Result<()>;

    /// Current SDP exchange phase
    fn signaling_state(&self) -> SignalingState;

    /// Type of the current local description, if any
    fn local_description_type(&self) -> Option<SdpType>;

    /// Whether a remote description is applied
    fn has_remote_description(&self) -> bool;

    /// Release the endpoint
    async fn close(&self) -> Result<()>;
}

/// Settings a factory applies to each new endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportSettings {
    /// STUN/TURN servers
    pub ice_servers: Vec<IceServer>,
    /// Only gather relay candidates
    pub force_relay: bool,
}

/// Builds transport endpoints for new calls
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Create an endpoint and the receiver of its callbacks
    async fn create(
        &self,
        settings: &TransportSettings,
    ) -> Result<(Arc<dyn MediaTransport>, TransportEvents)>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_type_parsing() {
        let host = IceCandidate::new("candidate:1 1 udp 2122260223 192.168.1.5 54400 typ host generation 0");
        let srflx = IceCandidate::new(
            "candidate:2 1 udp 1686052607 203.0.113.9 54400 typ srflx raddr 192.168.1.5 rport 54400",
        );
        let relay = IceCandidate::new(
            "candidate:3 1 udp 41885439 198.51.100.7 3478 typ relay raddr 203.0.113.9 rport 54400",
        );

        assert_eq!(host.candidate_type(), CandidateType::Host);
        assert_eq!(srflx.candidate_type(), CandidateType::ServerReflexive);
        assert_eq!(relay.candidate_type(), CandidateType::Relay);
        assert_eq!(
            IceCandidate::new("candidate:4 1 udp 1 10.0.0.1 9").candidate_type(),
            CandidateType::Unknown
        );
        assert!(IceCandidate::new("  ").is_end_of_candidates());
    }

    #[test]
    fn test_candidate_json_shape() {
        let json = r#"{"candidate":"candidate:1 1 udp 1 10.0.0.1 9 typ host","sdpMid":"0","sdpMLineIndex":0}"#;
        let candidate: IceCandidate = serde_json::from_str(json).unwrap();
        assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
        assert_eq!(candidate.sdp_mline_index, Some(0));
        assert!(candidate.username_fragment.is_none());

        let back = serde_json::to_value(&candidate).unwrap();
        assert_eq!(back["sdpMLineIndex"], 0);
        assert!(back.get("usernameFragment").is_none());
    }

    #[test]
    fn test_session_description_shape() {
        let offer = SessionDescription::offer("v=0");
        let json = serde_json::to_value(&offer).unwrap();
        assert_eq!(json["type"], "offer");
        assert_eq!(json["sdp"], "v=0");

        let rollback: SessionDescription = serde_json::from_str(r#"{"type":"rollback"}"#).unwrap();
        assert_eq!(rollback, SessionDescription::rollback());
    }

    #[test]
    fn test_relay_attribution() {
        let auth = IceCandidateError {
            url: Some("turn:turn.example.org:3478?transport=udp".to_string()),
            error_code: Some(401),
            error_text: "Unauthorized".to_string(),
        };
        assert!(auth.is_relay_attributed());
        assert!(auth.looks_like_auth_failure());

        let stun = IceCandidateError {
            url: Some("stun:stun.l.google.com:19302".to_string()),
            error_code: Some(701),
            error_text: "STUN host lookup received error.".to_string(),
        };
        assert!(!stun.is_relay_attributed());
        assert!(!stun.looks_like_auth_failure());

        assert!(IceServer::turn("turns:relay.example.org", "u", "p").is_relay());
        assert!(!IceServer::stun("stun:stun.l.google.com:19302").is_relay());
    }

    #[test]
    fn test_connection_state_stability() {
        assert!(ConnectionState::Connected.is_stable());
        assert!(ConnectionState::Completed.is_stable());
        assert!(!ConnectionState::Disconnected.is_stable());
        assert_eq!(
            serde_json::to_string(&SignalingState::HaveLocalOffer).unwrap(),
            "\"have-local-offer\""
        );
    }
}

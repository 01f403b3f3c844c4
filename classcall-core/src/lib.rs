//! # ClassCall Core
//!
//! Negotiation engine and media-transport abstraction for one-to-one
//! classroom video calls. This crate owns the offer/answer state machine,
//! the signaling message model and the local media handles; concrete peer
//! connections plug in through [`MediaTransport`].

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod loopback;
pub mod media;
pub mod negotiation;
pub mod protocol;
pub mod role;
pub mod transport;
#[cfg(feature = "webrtc")]
pub mod peer_connection;

// Re-export main types
pub use error::{ClassCallError, Result};
pub use loopback::{LoopbackFactory, LoopbackTransport};
pub use media::{LocalMediaSource, LocalTrack, TrackKind};
pub use negotiation::{
    NegotiationConfig, NegotiationEngine, NegotiationEvent, NegotiationEvents, SignalSink,
};
pub use protocol::{RoomId, SessionId, SignalingMessage, UserId};
pub use role::{Politeness, PolitenessPolicy, Role};
pub use transport::{
    CandidateType, ConnectionState, IceCandidate, IceCandidateError, IceGatheringState, IceServer,
    MediaTransport, SdpType, SessionDescription, SignalingState, TransportEvent, TransportEvents,
    TransportFactory, TransportSettings,
};
#[cfg(feature = "webrtc")]
pub use peer_connection::{WebRtcFactory, WebRtcTransport};

//! # ClassCall - Peer-to-Peer Classroom Calls
//!
//! ClassCall sets up a two-party call between classroom participants: it finds
//! or creates the room's call session, joins it, opens a signaling channel and
//! negotiates the peer connection with the polite/impolite convention, so
//! simultaneous offers never deadlock. A diagnostics window classifies the
//! first seconds of every call (relay needed, relay misconfigured, signaling
//! stalled, autoplay blocked).
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use classcall::{CallConfig, CallController, LocalMediaSource, LocalTrack, LoopbackFactory, Role};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     classcall::init_logging(classcall::DEFAULT_FILTER);
//!
//!     let media = LocalMediaSource::with_tracks(vec![
//!         LocalTrack::audio("mic"),
//!         LocalTrack::video("camera"),
//!     ]);
//!     let call = CallController::builder(CallConfig::from_env()?)
//!         .transport_factory(Arc::new(LoopbackFactory::new()))
//!         .media(media)
//!         .on_complete(|| println!("call finished"))
//!         .build()?;
//!
//!     let mut events = call.events();
//!     call.start("42".into(), "7".into(), Role::Host).await?;
//!
//!     while let Some(event) = events.next().await {
//!         println!("Call event: {:?}", event);
//!         if event.is_terminal() {
//!             break;
//!         }
//!     }
//!     call.leave().await;
//!     Ok(())
//! }
//! ```

#![deny(missing_docs)]
#![warn(clippy::all)]

// Re-export core types for easy access
pub use classcall_core::{
    CandidateType, ClassCallError, ConnectionState, IceCandidate, IceCandidateError, IceServer,
    LocalMediaSource, LocalTrack, LoopbackFactory, LoopbackTransport, MediaTransport,
    NegotiationConfig, NegotiationEvent, Politeness, PolitenessPolicy, Result, Role, RoomId,
    SessionId, SignalingMessage, TrackKind, TransportFactory, TransportSettings, UserId,
};

#[cfg(feature = "webrtc")]
pub use classcall_core::{WebRtcFactory, WebRtcTransport};

pub use classcall_signaling::{
    ChannelConnector, ChannelEvent, HttpSessionDirectory, InMemorySessionDirectory, MemoryRelay,
    SessionDirectory, SessionRef, SessionStatus, SignalingChannel, WebSocketConnector,
};

pub use classcall_diagnostics::{
    classify, init_logging, DiagnosticEvent, DiagnosticSnapshot, DiagnosticsSink, TracingSink,
    Verdict, DEFAULT_FILTER,
};

// Public API modules
pub mod call;
pub mod config;
pub mod event;

// Re-export main API types
pub use call::{CallBuilder, CallController, CallState, CompletionCallback};
pub use config::CallConfig;
pub use event::{CallEvent, EventStream};

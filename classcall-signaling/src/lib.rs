//! # ClassCall Signaling
//!
//! Signaling channels and the call session directory for classroom calls.
//! Provides the WebSocket channel to the classroom backend, an in-memory
//! relay with the backend's forwarding semantics, and the REST session
//! directory with its in-memory counterpart.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod channel;
pub mod directory;
pub mod relay;
pub mod websocket;

// Re-export main types
pub use channel::{ChannelConnector, ChannelEvent, SignalingChannel, SignalingSender};
pub use classcall_core::ClassCallError;
pub use directory::{
    HttpSessionDirectory, InMemorySessionDirectory, JoinOutcome, JoinStatus, ParticipantRecord,
    SessionDirectory, SessionDirectoryClient, SessionRecord, SessionRef, SessionResolution,
    SessionStatus,
};
pub use relay::MemoryRelay;
pub use websocket::WebSocketConnector;

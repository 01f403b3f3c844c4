//! Event system for call and participant events

use crate::{CallState, ConnectionState, TrackKind, UserId, Verdict};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Events that can occur during a call
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CallEvent {
    /// Lifecycle state changed
    StateChanged {
        /// New state
        state: CallState,
    },
    /// The remote participant became known
    PeerJoined {
        /// Remote participant
        user: UserId,
    },
    /// The remote participant disconnected
    PeerLeft {
        /// Remote participant
        user: UserId,
    },
    /// Peer connection state changed
    ConnectionChanged {
        /// New connection state
        state: ConnectionState,
    },
    /// Remote media arrived
    TrackReceived {
        /// Remote track identifier
        track_id: String,
        /// Media kind
        kind: TrackKind,
    },
    /// The remote participant toggled a device
    RemoteMediaToggled {
        /// Participant, when known
        user: Option<UserId>,
        /// Device kind
        kind: TrackKind,
        /// New device state
        enabled: bool,
    },
    /// Local media never became available for this exchange
    MediaUnavailable {
        /// Reason
        reason: String,
    },
    /// The diagnostics window closed
    Diagnostics {
        /// Connection-health verdict
        verdict: Verdict,
    },
    /// Another participant ended the call
    CallEnded {
        /// Who ended it, when known
        by: Option<UserId>,
    },
    /// The signaling channel closed; start a new call to retry
    ChannelClosed {
        /// Reason for closure
        reason: String,
    },
    /// No endpoint could be created for a returning peer
    TransportFailed {
        /// Factory error
        reason: String,
    },
}

impl CallEvent {
    /// Get the event type as a string
    pub fn event_type(&self) -> &'static str {
        match self {
            CallEvent::StateChanged { .. } => "state_changed",
            CallEvent::PeerJoined { .. } => "peer_joined",
            CallEvent::PeerLeft { .. } => "peer_left",
            CallEvent::ConnectionChanged { .. } => "connection_changed",
            CallEvent::TrackReceived { .. } => "track_received",
            CallEvent::RemoteMediaToggled { .. } => "remote_media_toggled",
            CallEvent::MediaUnavailable { .. } => "media_unavailable",
            CallEvent::Diagnostics { .. } => "diagnostics",
            CallEvent::CallEnded { .. } => "call_ended",
            CallEvent::ChannelClosed { .. } => "channel_closed",
            CallEvent::TransportFailed { .. } => "transport_failed",
        }
    }

    /// Check if this event ends the call
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallEvent::CallEnded { .. }
                | CallEvent::ChannelClosed { .. }
                | CallEvent::TransportFailed { .. }
                | CallEvent::StateChanged {
                    state: CallState::Ended
                }
        )
    }
}

/// Stream of call events for async iteration
#[derive(Debug)]
pub struct EventStream {
    receiver: mpsc::UnboundedReceiver<CallEvent>,
}

impl EventStream {
    /// Create a new event stream with a receiver
    pub fn new(receiver: mpsc::UnboundedReceiver<CallEvent>) -> Self {
        Self { receiver }
    }

    /// Get the next event from the stream
    pub async fn next(&mut self) -> Option<CallEvent> {
        self.receiver.recv().await
    }

    /// Try to get the next event without blocking
    pub fn try_next(&mut self) -> Result<Option<CallEvent>, mpsc::error::TryRecvError> {
        match self.receiver.try_recv() {
            Ok(event) => Ok(Some(event)),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => {
                Err(mpsc::error::TryRecvError::Disconnected)
            }
        }
    }

    /// Close the event stream
    pub fn close(&mut self) {
        self.receiver.close();
    }
}

/// Fan-out of call events to every live [`EventStream`]
#[derive(Debug, Clone, Default)]
pub(crate) struct EventHub {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<CallEvent>>>>,
}

impl EventHub {
    pub(crate) fn subscribe(&self) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        EventStream::new(rx)
    }

    pub(crate) fn emit(&self, event: CallEvent) {
        debug!("📡 Call event: {}", event.event_type());
        self.subscribers
            .lock()
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_hub_fans_out_and_prunes() {
        let hub = EventHub::default();
        let mut first = hub.subscribe();
        let mut second = hub.subscribe();

        hub.emit(CallEvent::PeerJoined {
            user: UserId::from(2),
        });
        assert_eq!(first.next().await.unwrap().event_type(), "peer_joined");
        assert_eq!(second.next().await.unwrap().event_type(), "peer_joined");

        second.close();
        drop(second);
        hub.emit(CallEvent::ChannelClosed {
            reason: "gone".to_string(),
        });
        assert!(first.try_next().unwrap().unwrap().is_terminal());
        assert_eq!(hub.subscribers.lock().len(), 1);
    }

    #[test]
    fn test_events_serialize_with_tag() {
        let json = serde_json::to_value(CallEvent::Diagnostics {
            verdict: Verdict::NeedsRelay,
        })
        .unwrap();
        assert_eq!(json["event"], "diagnostics");
        assert_eq!(json["verdict"], "needs-relay");
    }
}

//! Signaling channel handles
//!
//! A [`SignalingChannel`] is a cloneable [`SignalingSender`] plus an ordered
//! stream of [`ChannelEvent`]s. Sending never fails at the call site; delivery
//! problems surface as `Error`/`Closed` events. Both end the call.

use async_trait::async_trait;
use classcall_core::{Result, SessionId, SignalSink, SignalingMessage, UserId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Event observed on a signaling channel
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// Channel is open; always the first event
    Open,
    /// Decoded inbound message
    Message(SignalingMessage),
    /// Channel closed; no further events follow
    Closed {
        /// Close reason
        reason: String,
    },
    /// Socket failure; the channel cannot be trusted afterwards
    Error(String),
}

/// Command for the task that owns the underlying connection
#[derive(Debug, Clone)]
pub(crate) enum Outbound {
    Frame(SignalingMessage),
    Close,
}

/// Outbound half of a channel
#[derive(Debug, Clone)]
pub struct SignalingSender {
    tx: mpsc::UnboundedSender<Outbound>,
    closed: Arc<AtomicBool>,
}

impl SignalingSender {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Outbound>) -> Self {
        Self {
            tx,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Queue a message; dropped with a log line once the channel is closed
    pub fn send(&self, message: SignalingMessage) {
        if self.closed.load(Ordering::SeqCst) {
            debug!("Channel closed, dropping outbound {}", message.action());
            return;
        }
        if self.tx.send(Outbound::Frame(message)).is_err() {
            debug!("Channel task gone, dropping outbound frame");
        }
    }

    /// Close the channel; later calls are no-ops
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.tx.send(Outbound::Close);
    }

    /// Whether `close` was called on any clone
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.tx.is_closed()
    }
}

impl SignalSink for SignalingSender {
    fn send(&self, message: SignalingMessage) {
        SignalingSender::send(self, message);
    }
}

/// Bidirectional signaling channel
#[derive(Debug)]
pub struct SignalingChannel {
    sender: SignalingSender,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
}

impl SignalingChannel {
    pub(crate) fn new(sender: SignalingSender, events: mpsc::UnboundedReceiver<ChannelEvent>) -> Self {
        Self { sender, events }
    }

    /// Two in-memory channels wired back to back.
    ///
    /// Each side sees `Open` first, then the other side's frames in order;
    /// closing either side delivers `Closed` to both.
    pub fn pair() -> (SignalingChannel, SignalingChannel) {
        let (a_out_tx, a_out_rx) = mpsc::unbounded_channel();
        let (b_out_tx, b_out_rx) = mpsc::unbounded_channel();
        let (a_events_tx, a_events_rx) = mpsc::unbounded_channel();
        let (b_events_tx, b_events_rx) = mpsc::unbounded_channel();

        let _ = a_events_tx.send(ChannelEvent::Open);
        let _ = b_events_tx.send(ChannelEvent::Open);

        let a_sender = SignalingSender::new(a_out_tx);
        let b_sender = SignalingSender::new(b_out_tx);
        tokio::spawn(forward(a_out_rx, b_events_tx.clone(), a_events_tx.clone(), b_sender.closed.clone()));
        tokio::spawn(forward(b_out_rx, a_events_tx, b_events_tx, a_sender.closed.clone()));

        (
            SignalingChannel::new(a_sender, a_events_rx),
            SignalingChannel::new(b_sender, b_events_rx),
        )
    }

    /// Cloneable outbound half
    pub fn sender(&self) -> SignalingSender {
        self.sender.clone()
    }

    /// Next event; `None` once the channel is gone
    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        self.events.recv().await
    }

    /// Split into the outbound half and the event receiver
    pub fn into_parts(self) -> (SignalingSender, mpsc::UnboundedReceiver<ChannelEvent>) {
        (self.sender, self.events)
    }
}

async fn forward(
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    remote: mpsc::UnboundedSender<ChannelEvent>,
    local: mpsc::UnboundedSender<ChannelEvent>,
    remote_closed: Arc<AtomicBool>,
) {
    while let Some(command) = outbound.recv().await {
        match command {
            Outbound::Frame(message) => {
                if remote.send(ChannelEvent::Message(message)).is_err() {
                    warn!("In-memory peer gone");
                    break;
                }
            }
            Outbound::Close => break,
        }
    }
    remote_closed.store(true, Ordering::SeqCst);
    let reason = "peer closed the channel".to_string();
    let _ = remote.send(ChannelEvent::Closed {
        reason: reason.clone(),
    });
    let _ = local.send(ChannelEvent::Closed {
        reason: "closed locally".to_string(),
    });
}

/// Opens signaling channels for call sessions
#[async_trait]
pub trait ChannelConnector: Send + Sync {
    /// Open the channel of `session_id` on behalf of `user_id`
    async fn connect(&self, session_id: &SessionId, user_id: &UserId) -> Result<SignalingChannel>;
}

//! Offer/answer negotiation engine
//!
//! One engine drives one [`MediaTransport`] for the lifetime of a call. It is
//! fed signaling messages and transport callbacks one at a time through
//! `&mut self` handlers, so an offer in progress always completes (including
//! the send) before the next input is looked at.
//!
//! Collisions are resolved with the polite/impolite convention: when both
//! sides offer at once the impolite side ignores the remote offer and the
//! polite side rolls its own offer back and answers. Remote candidates are
//! queued until a remote description exists and then applied in arrival order.

use crate::media::{LocalMediaSource, LocalTrack, TrackKind};
use crate::protocol::{SignalingMessage, UserId};
use crate::role::Politeness;
use crate::transport::{
    CandidateType, ConnectionState, IceCandidate, IceCandidateError, IceGatheringState,
    MediaTransport, SdpType, SessionDescription, SignalingState, TransportEvent,
};
use crate::ClassCallError;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Outbound side of the signaling channel as seen by the engine.
///
/// Sending is fire-and-forget; delivery problems surface as channel events.
pub trait SignalSink: Send + Sync {
    /// Queue a message for the remote peer
    fn send(&self, message: SignalingMessage);
}

impl SignalSink for mpsc::UnboundedSender<SignalingMessage> {
    fn send(&self, message: SignalingMessage) {
        if mpsc::UnboundedSender::send(self, message).is_err() {
            debug!("Signal sink closed, dropping outbound message");
        }
    }
}

/// Engine tuning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiationConfig {
    /// Delay between checks for late local media
    pub media_retry_interval: Duration,
    /// Number of checks before giving up on local media for this attempt
    pub media_retry_attempts: u32,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            media_retry_interval: Duration::from_millis(500),
            media_retry_attempts: 20,
        }
    }
}

/// Observable step of the negotiation
#[derive(Debug, Clone, PartialEq)]
pub enum NegotiationEvent {
    /// The remote participant became known
    PeerJoined(UserId),
    /// The remote participant disconnected
    PeerLeft(UserId),
    /// Local tracks attached to the transport
    MediaAttached {
        /// Number of tracks attached
        tracks: usize,
    },
    /// Local media could not be attached
    MediaUnavailable {
        /// Reason
        reason: String,
    },
    /// Local offer applied and sent
    OfferSent,
    /// Remote offer arrived
    RemoteOfferReceived {
        /// Sender
        from: UserId,
    },
    /// Colliding remote offer ignored (impolite side)
    OfferIgnored {
        /// Sender of the ignored offer
        from: UserId,
    },
    /// Local offer abandoned in favour of the remote one (polite side)
    OfferRolledBack,
    /// Local answer applied and sent
    AnswerSent,
    /// Remote description applied
    RemoteDescriptionApplied {
        /// Description kind
        sdp_type: SdpType,
    },
    /// Local candidate sent
    LocalCandidate {
        /// Candidate type
        candidate_type: CandidateType,
    },
    /// Remote candidate received
    RemoteCandidate {
        /// Candidate type
        candidate_type: CandidateType,
        /// Whether it waits for a remote description
        queued: bool,
    },
    /// Queued remote candidates applied
    CandidatesFlushed {
        /// Number of candidates applied
        count: usize,
    },
    /// Transport connection state changed
    ConnectionStateChanged(ConnectionState),
    /// Gathering state changed
    IceGatheringStateChanged(IceGatheringState),
    /// ICE or description failure, recorded for diagnostics
    IceError(IceCandidateError),
    /// Remote media arrived
    RemoteTrack {
        /// Remote track identifier
        track_id: String,
        /// Media kind
        kind: TrackKind,
    },
    /// Remote participant toggled a device (informational)
    RemoteMediaToggled {
        /// Participant, when the message names one
        user: Option<UserId>,
        /// Device kind
        kind: TrackKind,
        /// New state
        enabled: bool,
    },
    /// Out-of-context message dropped
    ProtocolViolation {
        /// Message action
        action: String,
        /// Why it was dropped
        reason: String,
    },
    /// Another participant ended the call
    CallEnded {
        /// Who ended it, when known
        by: Option<UserId>,
    },
    /// Engine torn down
    Closed,
}

/// Receiver of engine events
pub type NegotiationEvents = mpsc::UnboundedReceiver<NegotiationEvent>;

/// Polite/impolite offer-answer state machine bound to one transport
pub struct NegotiationEngine {
    local_user: UserId,
    politeness: Politeness,
    transport: Arc<dyn MediaTransport>,
    signals: Arc<dyn SignalSink>,
    media: LocalMediaSource,
    config: NegotiationConfig,
    events: mpsc::UnboundedSender<NegotiationEvent>,
    shutdown: Option<watch::Receiver<bool>>,
    remote_peer: Option<UserId>,
    making_offer: bool,
    ignore_offer: bool,
    negotiation_pending: bool,
    attached_tracks: HashSet<String>,
    tracks_attached: usize,
    tracks_negotiated: usize,
    pending_candidates: VecDeque<IceCandidate>,
    closed: bool,
}

impl std::fmt::Debug for NegotiationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NegotiationEngine")
            .field("local_user", &self.local_user)
            .field("politeness", &self.politeness)
            .field("remote_peer", &self.remote_peer)
            .field("making_offer", &self.making_offer)
            .field("pending_candidates", &self.pending_candidates.len())
            .field("closed", &self.closed)
            .finish()
    }
}

impl NegotiationEngine {
    /// Create an engine and the receiver of its events
    pub fn new(
        local_user: UserId,
        politeness: Politeness,
        transport: Arc<dyn MediaTransport>,
        signals: Arc<dyn SignalSink>,
        media: LocalMediaSource,
        config: NegotiationConfig,
    ) -> (Self, NegotiationEvents) {
        let (events, receiver) = mpsc::unbounded_channel();
        let engine = Self {
            local_user,
            politeness,
            transport,
            signals,
            media,
            config,
            events,
            shutdown: None,
            remote_peer: None,
            making_offer: false,
            ignore_offer: false,
            // A fresh endpoint always needs its first exchange
            negotiation_pending: true,
            attached_tracks: HashSet::new(),
            tracks_attached: 0,
            tracks_negotiated: 0,
            pending_candidates: VecDeque::new(),
            closed: false,
        };
        (engine, receiver)
    }

    /// Cancel media retries when `shutdown` flips to `true`
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Local user ID
    pub fn local_user(&self) -> &UserId {
        &self.local_user
    }

    /// Collision role, fixed for the engine's lifetime
    pub fn politeness(&self) -> Politeness {
        self.politeness
    }

    /// Current SDP exchange phase
    pub fn signaling_state(&self) -> SignalingState {
        if self.closed {
            SignalingState::Closed
        } else {
            self.transport.signaling_state()
        }
    }

    /// Whether an offer is being produced right now
    pub fn is_making_offer(&self) -> bool {
        self.making_offer
    }

    /// Whether the remote participant is known
    pub fn peer_known(&self) -> bool {
        self.remote_peer.is_some()
    }

    /// Remote participant, once known
    pub fn remote_peer(&self) -> Option<&UserId> {
        self.remote_peer.as_ref()
    }

    /// Remote candidates waiting for a remote description
    pub fn pending_candidate_count(&self) -> usize {
        self.pending_candidates.len()
    }

    /// Whether local tracks are attached to the transport
    pub fn media_attached(&self) -> bool {
        !self.attached_tracks.is_empty()
    }

    /// Whether the engine was torn down
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Process one message from the signaling channel
    pub async fn handle_signal(&mut self, message: SignalingMessage) {
        if self.closed {
            debug!("Engine closed, dropping {} message", message.action());
            return;
        }

        if message.sender() == Some(&self.local_user) {
            // The relay echoes our own frames back
            return;
        }
        if let Some(recipient) = message.recipient() {
            if recipient != &self.local_user {
                debug!("Dropping {} addressed to {}", message.action(), recipient);
                return;
            }
        }

        if let Some((kind, enabled)) = message.media_toggle() {
            self.emit(NegotiationEvent::RemoteMediaToggled {
                user: message.sender().cloned(),
                kind,
                enabled,
            });
            return;
        }

        match message {
            SignalingMessage::Peers { peers } => {
                let other = peers.into_iter().find(|p| p != &self.local_user);
                match other {
                    Some(peer) => {
                        if self.note_peer(peer) {
                            self.maybe_offer().await;
                        }
                    }
                    None => debug!("Presence snapshot contains no remote peer"),
                }
            }
            SignalingMessage::Join { user } => {
                if self.note_peer(user) {
                    self.maybe_offer().await;
                }
            }
            SignalingMessage::Leave { user } => {
                if self.remote_peer.as_ref() == Some(&user) {
                    info!("👋 Remote peer {} left", user);
                    self.remote_peer = None;
                    self.emit(NegotiationEvent::PeerLeft(user));
                } else {
                    debug!("Leave notice for unknown participant {}", user);
                }
            }
            SignalingMessage::Offer { offer, user, .. } => {
                self.handle_remote_offer(user, offer).await;
            }
            SignalingMessage::Answer { answer, user, .. } => {
                self.handle_remote_answer(user, answer).await;
            }
            SignalingMessage::IceCandidate { candidate, .. } => match candidate {
                Some(candidate) if !candidate.is_end_of_candidates() => {
                    self.handle_remote_candidate(candidate).await;
                }
                _ => debug!("Remote end of candidates"),
            },
            SignalingMessage::EndCall { user } | SignalingMessage::CallEnded { user } => {
                info!("📴 Call ended by {:?}", user);
                self.emit(NegotiationEvent::CallEnded { by: user });
            }
            // Toggles are handled above
            SignalingMessage::ToggleMic { .. }
            | SignalingMessage::ToggleCamera { .. }
            | SignalingMessage::MicStatus { .. }
            | SignalingMessage::CameraStatus { .. } => {}
        }
    }

    /// Process one callback from the transport endpoint
    pub async fn handle_transport_event(&mut self, event: TransportEvent) {
        if self.closed {
            return;
        }

        match event {
            TransportEvent::NegotiationNeeded => {
                if self.making_offer || self.signaling_state() != SignalingState::Stable {
                    debug!("Negotiation needed during an exchange, skipping");
                    return;
                }
                if self.media_attached() && self.tracks_negotiated >= self.tracks_attached {
                    // Raised by an attach the last exchange already carried
                    debug!("Stale negotiation-needed, skipping");
                    return;
                }
                self.negotiation_pending = true;
                if self.peer_known() {
                    self.maybe_offer().await;
                } else {
                    debug!("Negotiation needed but no remote peer yet");
                }
            }
            TransportEvent::LocalCandidate(Some(candidate)) if !candidate.is_end_of_candidates() => {
                let candidate_type = candidate.candidate_type();
                debug!("📤 Local {:?} candidate", candidate_type);
                self.signals.send(SignalingMessage::IceCandidate {
                    candidate: Some(candidate),
                    user: self.local_user.clone(),
                    recipient_id: self.remote_peer.clone(),
                });
                self.emit(NegotiationEvent::LocalCandidate { candidate_type });
            }
            TransportEvent::LocalCandidate(_) => {
                debug!("Local candidate gathering complete");
            }
            TransportEvent::ConnectionStateChanged(state) => {
                info!("🔗 Connection state {:?}", state);
                self.emit(NegotiationEvent::ConnectionStateChanged(state));
            }
            TransportEvent::IceGatheringStateChanged(state) => {
                debug!("🧊 Gathering state {:?}", state);
                self.emit(NegotiationEvent::IceGatheringStateChanged(state));
            }
            TransportEvent::IceCandidateError(error) => {
                warn!(
                    "ICE candidate error from {:?} ({:?}): {}",
                    error.url, error.error_code, error.error_text
                );
                self.emit(NegotiationEvent::IceError(error));
            }
            TransportEvent::RemoteTrack { track_id, kind } => {
                info!("📡 Remote {:?} track {}", kind, track_id);
                self.emit(NegotiationEvent::RemoteTrack { track_id, kind });
            }
        }
    }

    /// Local media was published; attach every track the transport does not
    /// carry yet and offer if an exchange is due
    pub async fn on_media_ready(&mut self) {
        if self.closed {
            return;
        }
        let tracks = self.media.tracks();
        if tracks.is_empty() {
            return;
        }
        self.attach_tracks(tracks).await;
        if self.negotiation_pending && self.peer_known() {
            self.maybe_offer().await;
        }
    }

    /// Start over on a fresh endpoint after the remote peer went away.
    ///
    /// The old transport is closed and every per-peer fact is forgotten, so
    /// the next `join` or `peers` notice negotiates from scratch. Local media
    /// is re-attached to the new endpoint.
    pub async fn replace_transport(&mut self, transport: Arc<dyn MediaTransport>) {
        if self.closed {
            if let Err(e) = transport.close().await {
                warn!("Transport close failed: {}", e);
            }
            return;
        }
        let old = std::mem::replace(&mut self.transport, transport);
        if let Err(e) = old.close().await {
            warn!("Transport close failed: {}", e);
        }
        self.remote_peer = None;
        self.making_offer = false;
        self.ignore_offer = false;
        self.negotiation_pending = true;
        self.attached_tracks.clear();
        self.tracks_attached = 0;
        self.tracks_negotiated = 0;
        self.pending_candidates.clear();
        info!("🔄 Negotiation for {} restarted on a fresh endpoint", self.local_user);
        self.on_media_ready().await;
    }

    /// Tear down; later calls are no-ops
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.making_offer = false;
        let dropped = self.pending_candidates.len();
        self.pending_candidates.clear();
        if let Err(e) = self.transport.close().await {
            warn!("Transport close failed: {}", e);
        }
        info!(
            "Negotiation engine for {} closed ({} queued candidates dropped)",
            self.local_user, dropped
        );
        self.emit(NegotiationEvent::Closed);
    }

    /// Record the remote participant. Returns `true` when it was new.
    fn note_peer(&mut self, peer: UserId) -> bool {
        match &self.remote_peer {
            None => {
                info!("🆕 Remote peer {} known", peer);
                self.remote_peer = Some(peer.clone());
                self.emit(NegotiationEvent::PeerJoined(peer));
                true
            }
            Some(known) if known == &peer => {
                debug!("Duplicate presence notice for {}", peer);
                false
            }
            Some(known) => {
                warn!("Ignoring third participant {} (already paired with {})", peer, known);
                self.violation("join", format!("already paired with {known}"));
                false
            }
        }
    }

    async fn maybe_offer(&mut self) {
        if self.closed || !self.negotiation_pending || !self.peer_known() {
            return;
        }
        if self.making_offer || self.signaling_state() != SignalingState::Stable {
            debug!("Offer deferred: exchange in progress ({})", self.signaling_state());
            return;
        }
        if !self.ensure_media_attached().await {
            debug!("Offer deferred until local media is available");
            return;
        }
        // Waiting for media may have overlapped a teardown
        if self.closed || self.signaling_state() != SignalingState::Stable {
            return;
        }

        self.negotiation_pending = false;
        self.making_offer = true;
        let result = self.send_offer().await;
        self.making_offer = false;

        match result {
            Ok(()) => {
                info!("📞 Offer sent to {:?}", self.remote_peer);
                self.emit(NegotiationEvent::OfferSent);
            }
            Err(e) => {
                self.negotiation_pending = true;
                self.report_failure("offer", &e);
            }
        }
    }

    async fn send_offer(&mut self) -> crate::error::Result<()> {
        let offer = self.transport.create_offer().await?;
        self.transport.set_local_description(offer.clone()).await?;
        self.tracks_negotiated = self.tracks_attached;
        self.signals.send(SignalingMessage::Offer {
            offer,
            user: self.local_user.clone(),
            recipient_id: self.remote_peer.clone(),
        });
        Ok(())
    }

    async fn handle_remote_offer(&mut self, from: UserId, offer: SessionDescription) {
        if offer.sdp_type != SdpType::Offer {
            self.violation("offer", format!("description type is {}", offer.sdp_type));
            return;
        }
        if let Some(known) = &self.remote_peer {
            if known != &from {
                self.violation("offer", format!("sender {from} is not the paired peer {known}"));
                return;
            }
        } else {
            self.note_peer(from.clone());
        }
        self.emit(NegotiationEvent::RemoteOfferReceived { from: from.clone() });

        let state = self.signaling_state();
        let ready = !self.making_offer
            && matches!(
                state,
                SignalingState::Stable | SignalingState::HaveRemoteOffer
            );
        self.ignore_offer = !ready && !self.politeness.is_polite();

        if self.ignore_offer {
            info!("⚔️ Offer collision with {}, keeping our offer", from);
            self.emit(NegotiationEvent::OfferIgnored { from });
            return;
        }
        if !ready {
            info!("⚔️ Offer collision with {}, rolling back our offer", from);
            if let Err(e) = self.transport.rollback().await {
                self.report_failure("rollback", &e);
                return;
            }
            self.emit(NegotiationEvent::OfferRolledBack);
        }

        if let Err(e) = self.transport.set_remote_description(offer).await {
            self.report_failure("set_remote_description", &e);
            return;
        }
        self.emit(NegotiationEvent::RemoteDescriptionApplied {
            sdp_type: SdpType::Offer,
        });

        if !self.ensure_media_attached().await {
            debug!("Answering without local media");
        }
        if self.closed {
            return;
        }

        match self.send_answer().await {
            Ok(()) => {
                // The answer carries our current tracks
                self.negotiation_pending = false;
                info!("📨 Answer sent to {}", from);
                self.emit(NegotiationEvent::AnswerSent);
            }
            Err(e) => self.report_failure("answer", &e),
        }

        self.flush_pending_candidates().await;
    }

    async fn send_answer(&mut self) -> crate::error::Result<()> {
        let answer = self.transport.create_answer().await?;
        self.transport.set_local_description(answer.clone()).await?;
        self.tracks_negotiated = self.tracks_attached;
        self.signals.send(SignalingMessage::Answer {
            answer,
            user: self.local_user.clone(),
            recipient_id: self.remote_peer.clone(),
        });
        Ok(())
    }

    async fn handle_remote_answer(&mut self, from: UserId, answer: SessionDescription) {
        if answer.sdp_type != SdpType::Answer {
            self.violation("answer", format!("description type is {}", answer.sdp_type));
            return;
        }
        let awaiting_answer = self.transport.local_description_type() == Some(SdpType::Offer)
            && self.signaling_state() == SignalingState::HaveLocalOffer;
        if !awaiting_answer {
            self.violation(
                "answer",
                format!("no local offer pending (state {})", self.signaling_state()),
            );
            return;
        }

        if let Err(e) = self.transport.set_remote_description(answer).await {
            self.report_failure("set_remote_description", &e);
            return;
        }
        self.ignore_offer = false;
        info!("✅ Answer from {} applied", from);
        self.emit(NegotiationEvent::RemoteDescriptionApplied {
            sdp_type: SdpType::Answer,
        });
        self.flush_pending_candidates().await;

        // Tracks published while our offer was in flight
        if self.negotiation_pending {
            self.maybe_offer().await;
        }
    }

    async fn handle_remote_candidate(&mut self, candidate: IceCandidate) {
        let candidate_type = candidate.candidate_type();
        if self.transport.has_remote_description() {
            self.emit(NegotiationEvent::RemoteCandidate {
                candidate_type,
                queued: false,
            });
            self.apply_candidate(candidate).await;
        } else {
            debug!(
                "❄️ Queueing {:?} candidate until a remote description is set",
                candidate_type
            );
            self.pending_candidates.push_back(candidate);
            self.emit(NegotiationEvent::RemoteCandidate {
                candidate_type,
                queued: true,
            });
        }
    }

    async fn flush_pending_candidates(&mut self) {
        if self.pending_candidates.is_empty() || !self.transport.has_remote_description() {
            return;
        }
        let mut count = 0;
        while let Some(candidate) = self.pending_candidates.pop_front() {
            self.apply_candidate(candidate).await;
            count += 1;
        }
        debug!("Flushed {} queued candidates", count);
        self.emit(NegotiationEvent::CandidatesFlushed { count });
    }

    async fn apply_candidate(&mut self, candidate: IceCandidate) {
        if let Err(e) = self.transport.add_ice_candidate(candidate).await {
            if self.ignore_offer {
                // Candidates belonging to the offer we ignored
                debug!("Dropping candidate for ignored offer: {}", e);
            } else {
                self.report_failure("add_ice_candidate", &e);
            }
        }
    }

    async fn ensure_media_attached(&mut self) -> bool {
        if self.media_attached() {
            return true;
        }
        let attempts = self.config.media_retry_attempts;
        for attempt in 0..=attempts {
            if self.closed {
                return false;
            }
            let tracks = self.media.tracks();
            if !tracks.is_empty() {
                self.attach_tracks(tracks).await;
                return self.media_attached();
            }
            if attempt == attempts {
                break;
            }
            if attempt == 0 {
                debug!("Waiting for local media");
            }
            if !self.wait_for_retry().await {
                debug!("Media wait cancelled");
                return false;
            }
        }
        let reason = format!("no local tracks after {} checks", attempts + 1);
        warn!("Local media unavailable: {}", reason);
        self.emit(NegotiationEvent::MediaUnavailable { reason });
        false
    }

    async fn attach_tracks(&mut self, tracks: Vec<LocalTrack>) {
        let mut attached = 0;
        for track in &tracks {
            if self.attached_tracks.contains(track.id()) {
                continue;
            }
            match self.transport.add_track(track).await {
                Ok(()) => {
                    self.attached_tracks.insert(track.id().to_string());
                    attached += 1;
                }
                Err(e) => {
                    warn!("Failed to attach local {:?} track {}: {}", track.kind(), track.id(), e);
                    self.emit(NegotiationEvent::MediaUnavailable {
                        reason: e.to_string(),
                    });
                }
            }
        }
        if attached > 0 {
            info!("🎞️ Attached {} local tracks", attached);
            self.tracks_attached += attached;
            self.negotiation_pending = true;
            self.emit(NegotiationEvent::MediaAttached { tracks: attached });
        }
    }

    async fn wait_for_retry(&mut self) -> bool {
        let interval = self.config.media_retry_interval;
        match self.shutdown.as_mut() {
            Some(shutdown) => {
                if *shutdown.borrow() {
                    return false;
                }
                tokio::select! {
                    _ = tokio::time::sleep(interval) => !*shutdown.borrow(),
                    _ = shutdown.changed() => false,
                }
            }
            None => {
                tokio::time::sleep(interval).await;
                true
            }
        }
    }

    fn report_failure(&self, operation: &str, error: &ClassCallError) {
        warn!("Negotiation step {} failed: {}", operation, error);
        self.emit(NegotiationEvent::IceError(IceCandidateError::local(format!(
            "{operation}: {error}"
        ))));
    }

    fn violation(&self, action: &str, reason: String) {
        warn!("Ignoring out-of-context {}: {}", action, reason);
        self.emit(NegotiationEvent::ProtocolViolation {
            action: action.to_string(),
            reason,
        });
    }

    fn emit(&self, event: NegotiationEvent) {
        // Nobody listening is fine
        let _ = self.events.send(event);
    }
}

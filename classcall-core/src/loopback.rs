//! In-memory transport endpoint
//!
//! [`LoopbackTransport`] models the SDP state machine of a peer connection
//! without touching the network: it rejects a remote offer while holding a
//! local one, refuses candidates before a remote description exists, emits a
//! configurable set of local candidates once a local description is applied,
//! and reports `Connected` once both descriptions and a remote candidate are
//! in place. Every accepted operation is appended to a log for inspection.

use crate::error::{ClassCallError, Result};
use crate::media::LocalTrack;
use crate::transport::{
    ConnectionState, IceCandidate, IceGatheringState, MediaTransport, SdpType, SessionDescription,
    SignalingState, TransportEvent, TransportEvents, TransportFactory, TransportSettings,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug)]
struct LoopbackState {
    signaling: SignalingState,
    connection: ConnectionState,
    local: Option<SessionDescription>,
    stable_local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    tracks: Vec<String>,
    applied_candidates: Vec<IceCandidate>,
    offers_created: u32,
    answers_created: u32,
    candidates_emitted: bool,
    closed: bool,
    log: Vec<String>,
}

/// Network-free [`MediaTransport`]
#[derive(Debug)]
pub struct LoopbackTransport {
    label: String,
    local_candidates: Vec<IceCandidate>,
    state: Mutex<LoopbackState>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl LoopbackTransport {
    /// Endpoint that gathers a single host candidate
    pub fn new(label: impl Into<String>) -> (Arc<Self>, TransportEvents) {
        let label = label.into();
        let host = IceCandidate::new(format!(
            "candidate:1 1 udp 2122260223 10.0.0.{} 50000 typ host",
            label.len() % 250 + 1
        ));
        Self::with_candidates(label, vec![host])
    }

    /// Endpoint that gathers the given local candidates
    pub fn with_candidates(
        label: impl Into<String>,
        local_candidates: Vec<IceCandidate>,
    ) -> (Arc<Self>, TransportEvents) {
        let (events, receiver) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            label: label.into(),
            local_candidates,
            state: Mutex::new(LoopbackState {
                signaling: SignalingState::Stable,
                connection: ConnectionState::New,
                local: None,
                stable_local: None,
                remote: None,
                tracks: Vec::new(),
                applied_candidates: Vec::new(),
                offers_created: 0,
                answers_created: 0,
                candidates_emitted: false,
                closed: false,
                log: Vec::new(),
            }),
            events,
        });
        (transport, receiver)
    }

    /// Endpoint label
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Remote candidates accepted so far, in order
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().applied_candidates.clone()
    }

    /// IDs of the attached local tracks
    pub fn track_ids(&self) -> Vec<String> {
        self.state.lock().tracks.clone()
    }

    /// Number of offers generated
    pub fn offers_created(&self) -> u32 {
        self.state.lock().offers_created
    }

    /// Number of answers generated
    pub fn answers_created(&self) -> u32 {
        self.state.lock().answers_created
    }

    /// Current connection state
    pub fn connection_state(&self) -> ConnectionState {
        self.state.lock().connection
    }

    /// Current remote description
    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().remote.clone()
    }

    /// Whether `close` was called
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Accepted operations in order, e.g. `set_remote_description(offer)`
    pub fn operations(&self) -> Vec<String> {
        self.state.lock().log.clone()
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    fn ensure_open(state: &LoopbackState, operation: &str) -> Result<()> {
        if state.closed {
            Err(ClassCallError::transport(operation, "transport is closed"))
        } else {
            Ok(())
        }
    }

    /// Emit gathered candidates the first time a local description lands
    fn gather_if_needed(&self, state: &mut LoopbackState) -> Vec<TransportEvent> {
        if state.candidates_emitted {
            return Vec::new();
        }
        state.candidates_emitted = true;
        let mut events = vec![TransportEvent::IceGatheringStateChanged(
            IceGatheringState::Gathering,
        )];
        events.extend(
            self.local_candidates
                .iter()
                .cloned()
                .map(|c| TransportEvent::LocalCandidate(Some(c))),
        );
        events.push(TransportEvent::LocalCandidate(None));
        events.push(TransportEvent::IceGatheringStateChanged(
            IceGatheringState::Complete,
        ));
        events
    }

    fn connect_if_ready(state: &mut LoopbackState) -> Vec<TransportEvent> {
        let ready = state.signaling == SignalingState::Stable
            && state.local.is_some()
            && state.remote.is_some()
            && !state.applied_candidates.is_empty()
            && !state.connection.is_stable();
        if !ready {
            return Vec::new();
        }
        state.connection = ConnectionState::Connected;
        vec![
            TransportEvent::ConnectionStateChanged(ConnectionState::Connecting),
            TransportEvent::ConnectionStateChanged(ConnectionState::Connected),
        ]
    }
}

#[async_trait]
impl MediaTransport for LoopbackTransport {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let mut state = self.state.lock();
        Self::ensure_open(&state, "create_offer")?;
        state.offers_created += 1;
        Ok(SessionDescription::offer(format!(
            "v=0\r\no={} {} 1 IN IP4 127.0.0.1\r\na=tracks:{}\r\n",
            self.label,
            state.offers_created,
            state.tracks.len()
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let mut state = self.state.lock();
        Self::ensure_open(&state, "create_answer")?;
        if state.signaling != SignalingState::HaveRemoteOffer {
            return Err(ClassCallError::transport(
                "create_answer",
                format!("no remote offer (state {})", state.signaling),
            ));
        }
        state.answers_created += 1;
        Ok(SessionDescription::answer(format!(
            "v=0\r\no={} {} 1 IN IP4 127.0.0.1\r\na=tracks:{}\r\n",
            self.label,
            state.answers_created,
            state.tracks.len()
        )))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        if description.sdp_type == SdpType::Rollback {
            return self.rollback().await;
        }
        let events = {
            let mut state = self.state.lock();
            Self::ensure_open(&state, "set_local_description")?;
            let next = match (description.sdp_type, state.signaling) {
                (SdpType::Offer, SignalingState::Stable | SignalingState::HaveLocalOffer) => {
                    SignalingState::HaveLocalOffer
                }
                (SdpType::Answer | SdpType::Pranswer, SignalingState::HaveRemoteOffer) => {
                    SignalingState::Stable
                }
                (sdp_type, current) => {
                    return Err(ClassCallError::transport(
                        "set_local_description",
                        format!("cannot apply local {sdp_type} in {current}"),
                    ));
                }
            };
            if state.signaling == SignalingState::Stable {
                state.stable_local = state.local.clone();
            }
            state.log.push(format!("set_local_description({})", description.sdp_type));
            state.signaling = next;
            state.local = Some(description);
            let mut events = self.gather_if_needed(&mut state);
            events.extend(Self::connect_if_ready(&mut state));
            events
        };
        for event in events {
            self.emit(event);
        }
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let events = {
            let mut state = self.state.lock();
            Self::ensure_open(&state, "set_remote_description")?;
            let next = match (description.sdp_type, state.signaling) {
                (SdpType::Offer, SignalingState::Stable | SignalingState::HaveRemoteOffer) => {
                    SignalingState::HaveRemoteOffer
                }
                (SdpType::Answer | SdpType::Pranswer, SignalingState::HaveLocalOffer) => {
                    SignalingState::Stable
                }
                (sdp_type, current) => {
                    return Err(ClassCallError::transport(
                        "set_remote_description",
                        format!("cannot apply remote {sdp_type} in {current}"),
                    ));
                }
            };
            state
                .log
                .push(format!("set_remote_description({})", description.sdp_type));
            state.signaling = next;
            state.remote = Some(description);
            Self::connect_if_ready(&mut state)
        };
        for event in events {
            self.emit(event);
        }
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        let mut state = self.state.lock();
        Self::ensure_open(&state, "rollback")?;
        if state.signaling != SignalingState::HaveLocalOffer {
            return Err(ClassCallError::transport(
                "rollback",
                format!("nothing to roll back in {}", state.signaling),
            ));
        }
        state.log.push("rollback".to_string());
        state.signaling = SignalingState::Stable;
        state.local = state.stable_local.take();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let events = {
            let mut state = self.state.lock();
            Self::ensure_open(&state, "add_ice_candidate")?;
            if state.remote.is_none() {
                return Err(ClassCallError::transport(
                    "add_ice_candidate",
                    "no remote description",
                ));
            }
            state
                .log
                .push(format!("add_ice_candidate({})", candidate.candidate));
            state.applied_candidates.push(candidate);
            Self::connect_if_ready(&mut state)
        };
        for event in events {
            self.emit(event);
        }
        Ok(())
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<()> {
        let stable = {
            let mut state = self.state.lock();
            Self::ensure_open(&state, "add_track")?;
            if state.tracks.iter().any(|t| t == track.id()) {
                return Ok(());
            }
            state.log.push(format!("add_track({})", track.id()));
            state.tracks.push(track.id().to_string());
            state.signaling == SignalingState::Stable
        };
        if stable {
            self.emit(TransportEvent::NegotiationNeeded);
        }
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        let state = self.state.lock();
        if state.closed {
            SignalingState::Closed
        } else {
            state.signaling
        }
    }

    fn local_description_type(&self) -> Option<SdpType> {
        self.state.lock().local.as_ref().map(|d| d.sdp_type)
    }

    fn has_remote_description(&self) -> bool {
        self.state.lock().remote.is_some()
    }

    async fn close(&self) -> Result<()> {
        let changed = {
            let mut state = self.state.lock();
            if state.closed {
                false
            } else {
                state.closed = true;
                state.signaling = SignalingState::Closed;
                state.connection = ConnectionState::Closed;
                state.log.push("close".to_string());
                true
            }
        };
        if changed {
            self.emit(TransportEvent::ConnectionStateChanged(ConnectionState::Closed));
        }
        Ok(())
    }
}

/// Factory handing out [`LoopbackTransport`]s and remembering them
#[derive(Debug, Clone, Default)]
pub struct LoopbackFactory {
    local_candidates: Option<Vec<IceCandidate>>,
    created: Arc<Mutex<Vec<Arc<LoopbackTransport>>>>,
}

impl LoopbackFactory {
    /// Factory whose endpoints gather one host candidate
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory whose endpoints gather the given candidates
    pub fn with_candidates(local_candidates: Vec<IceCandidate>) -> Self {
        Self {
            local_candidates: Some(local_candidates),
            created: Arc::default(),
        }
    }

    /// Endpoints created so far
    pub fn created(&self) -> Vec<Arc<LoopbackTransport>> {
        self.created.lock().clone()
    }
}

#[async_trait]
impl TransportFactory for LoopbackFactory {
    async fn create(
        &self,
        settings: &TransportSettings,
    ) -> Result<(Arc<dyn MediaTransport>, TransportEvents)> {
        let label = format!("loopback-{}", uuid::Uuid::new_v4().simple());
        let candidates = match &self.local_candidates {
            Some(candidates) => candidates.clone(),
            None if settings.force_relay => Vec::new(),
            None => vec![IceCandidate::new(format!(
                "candidate:1 1 udp 2122260223 10.0.0.{} 50000 typ host",
                self.created.lock().len() + 1
            ))],
        };
        let (transport, events) = LoopbackTransport::with_candidates(label, candidates);
        self.created.lock().push(transport.clone());
        Ok((transport as Arc<dyn MediaTransport>, events))
    }
}

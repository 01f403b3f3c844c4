//! [`MediaTransport`] backed by a webrtc-rs peer connection

use crate::error::{ClassCallError, Result};
use crate::media::{LocalTrack, TrackKind};
use crate::transport::{
    ConnectionState, IceCandidate, IceGatheringState, IceServer, MediaTransport, SdpType,
    SessionDescription, SignalingState, TransportEvent, TransportEvents, TransportFactory,
    TransportSettings,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

const STREAM_ID: &str = "classcall";

/// Peer connection endpoint
pub struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
    local_type: Mutex<Option<SdpType>>,
    has_remote: AtomicBool,
    senders: Mutex<HashMap<String, Arc<TrackLocalStaticSample>>>,
}

impl fmt::Debug for WebRtcTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebRtcTransport")
            .field("signaling_state", &self.pc.signaling_state())
            .field("local_type", &*self.local_type.lock())
            .field("has_remote", &self.has_remote.load(Ordering::SeqCst))
            .finish()
    }
}

impl WebRtcTransport {
    /// Build a peer connection for the given settings and wire its callbacks
    pub async fn connect(settings: &TransportSettings) -> Result<(Arc<Self>, TransportEvents)> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| ClassCallError::Initialization {
                reason: format!("codec registration failed: {e}"),
            })?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| ClassCallError::Initialization {
                reason: format!("interceptor registration failed: {e}"),
            })?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: settings.ice_servers.iter().map(rtc_ice_server).collect(),
            ice_transport_policy: if settings.force_relay {
                RTCIceTransportPolicy::Relay
            } else {
                RTCIceTransportPolicy::All
            },
            ..Default::default()
        };
        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|e| ClassCallError::Initialization {
                    reason: format!("peer connection creation failed: {e}"),
                })?,
        );

        let (events, receiver) = mpsc::unbounded_channel();
        Self::wire_callbacks(&pc, events);
        info!(
            "🔧 Peer connection ready ({} ICE servers, relay only: {})",
            settings.ice_servers.len(),
            settings.force_relay
        );

        let transport = Arc::new(Self {
            pc,
            local_type: Mutex::new(None),
            has_remote: AtomicBool::new(false),
            senders: Mutex::new(HashMap::new()),
        });
        Ok((transport, receiver))
    }

    /// Sample writer for an attached local track, for the capture layer to feed
    pub fn sample_writer(&self, track_id: &str) -> Option<Arc<TrackLocalStaticSample>> {
        self.senders.lock().get(track_id).cloned()
    }

    fn wire_callbacks(pc: &Arc<RTCPeerConnection>, events: mpsc::UnboundedSender<TransportEvent>) {
        let tx = events.clone();
        pc.on_negotiation_needed(Box::new(move || {
            let _ = tx.send(TransportEvent::NegotiationNeeded);
            Box::pin(async {})
        }));

        let tx = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let event = match candidate.map(|c| c.to_json()) {
                Some(Ok(init)) => TransportEvent::LocalCandidate(Some(IceCandidate {
                    candidate: init.candidate,
                    sdp_mid: init.sdp_mid,
                    sdp_mline_index: init.sdp_mline_index,
                    username_fragment: init.username_fragment,
                })),
                Some(Err(e)) => {
                    warn!("Failed to serialise local candidate: {}", e);
                    return Box::pin(async {});
                }
                None => TransportEvent::LocalCandidate(None),
            };
            let _ = tx.send(event);
            Box::pin(async {})
        }));

        let tx = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let mapped = match state {
                RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => {
                    ConnectionState::New
                }
                RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
                RTCPeerConnectionState::Connected => ConnectionState::Connected,
                RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
                RTCPeerConnectionState::Failed => ConnectionState::Failed,
                RTCPeerConnectionState::Closed => ConnectionState::Closed,
            };
            let _ = tx.send(TransportEvent::ConnectionStateChanged(mapped));
            Box::pin(async {})
        }));

        let tx = events.clone();
        pc.on_ice_gathering_state_change(Box::new(move |state: RTCIceGathererState| {
            let mapped = match state {
                RTCIceGathererState::Gathering => Some(IceGatheringState::Gathering),
                RTCIceGathererState::Complete => Some(IceGatheringState::Complete),
                RTCIceGathererState::New => Some(IceGatheringState::New),
                _ => None,
            };
            if let Some(mapped) = mapped {
                let _ = tx.send(TransportEvent::IceGatheringStateChanged(mapped));
            }
            Box::pin(async {})
        }));

        let tx = events;
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let kind = match track.kind() {
                RTPCodecType::Audio => TrackKind::Audio,
                _ => TrackKind::Video,
            };
            let _ = tx.send(TransportEvent::RemoteTrack {
                track_id: track.id(),
                kind,
            });
            Box::pin(async {})
        }));
    }

    async fn refresh_descriptions(&self) {
        let local = self
            .pc
            .local_description()
            .await
            .and_then(|d| sdp_type(d.sdp_type));
        *self.local_type.lock() = local;
        let has_remote = self.pc.remote_description().await.is_some();
        self.has_remote.store(has_remote, Ordering::SeqCst);
    }
}

fn rtc_ice_server(server: &IceServer) -> RTCIceServer {
    RTCIceServer {
        urls: server.urls.clone(),
        username: server.username.clone().unwrap_or_default(),
        credential: server.credential.clone().unwrap_or_default(),
        ..Default::default()
    }
}

fn sdp_type(rtc: RTCSdpType) -> Option<SdpType> {
    match rtc {
        RTCSdpType::Offer => Some(SdpType::Offer),
        RTCSdpType::Answer => Some(SdpType::Answer),
        RTCSdpType::Pranswer => Some(SdpType::Pranswer),
        RTCSdpType::Rollback => Some(SdpType::Rollback),
        RTCSdpType::Unspecified => None,
    }
}

fn from_rtc(operation: &str, rtc: RTCSessionDescription) -> Result<SessionDescription> {
    let sdp_type = sdp_type(rtc.sdp_type).ok_or_else(|| {
        ClassCallError::transport(operation, "peer connection produced an untyped description")
    })?;
    Ok(SessionDescription {
        sdp_type,
        sdp: rtc.sdp,
    })
}

fn to_rtc(operation: &str, description: &SessionDescription) -> Result<RTCSessionDescription> {
    // Both sides share the browser's {type, sdp} JSON shape
    serde_json::to_value(description)
        .and_then(serde_json::from_value)
        .map_err(|e| ClassCallError::transport(operation, e))
}

#[async_trait]
impl MediaTransport for WebRtcTransport {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| ClassCallError::transport("create_offer", e))?;
        from_rtc("create_offer", offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| ClassCallError::transport("create_answer", e))?;
        from_rtc("create_answer", answer)
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        let rtc = to_rtc("set_local_description", &description)?;
        let result = self
            .pc
            .set_local_description(rtc)
            .await
            .map_err(|e| ClassCallError::transport("set_local_description", e));
        self.refresh_descriptions().await;
        result
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let rtc = to_rtc("set_remote_description", &description)?;
        let result = self
            .pc
            .set_remote_description(rtc)
            .await
            .map_err(|e| ClassCallError::transport("set_remote_description", e));
        self.refresh_descriptions().await;
        result
    }

    async fn rollback(&self) -> Result<()> {
        debug!("Rolling back local offer");
        self.set_local_description(SessionDescription::rollback()).await
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| ClassCallError::transport("add_ice_candidate", e))
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<()> {
        if self.senders.lock().contains_key(track.id()) {
            return Ok(());
        }
        let mime_type = match track.kind() {
            TrackKind::Audio => MIME_TYPE_OPUS,
            TrackKind::Video => MIME_TYPE_VP8,
        };
        let sample = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            track.id().to_owned(),
            STREAM_ID.to_owned(),
        ));
        self.pc
            .add_track(Arc::clone(&sample) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| ClassCallError::transport("add_track", e))?;
        self.senders.lock().insert(track.id().to_string(), sample);
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        match self.pc.signaling_state() {
            RTCSignalingState::HaveLocalOffer | RTCSignalingState::HaveRemotePranswer => {
                SignalingState::HaveLocalOffer
            }
            RTCSignalingState::HaveRemoteOffer | RTCSignalingState::HaveLocalPranswer => {
                SignalingState::HaveRemoteOffer
            }
            RTCSignalingState::Closed => SignalingState::Closed,
            RTCSignalingState::Stable | RTCSignalingState::Unspecified => SignalingState::Stable,
        }
    }

    fn local_description_type(&self) -> Option<SdpType> {
        *self.local_type.lock()
    }

    fn has_remote_description(&self) -> bool {
        self.has_remote.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        self.pc
            .close()
            .await
            .map_err(|e| ClassCallError::transport("close", e))
    }
}

/// Factory producing [`WebRtcTransport`]s
#[derive(Debug, Clone, Copy, Default)]
pub struct WebRtcFactory;

#[async_trait]
impl TransportFactory for WebRtcFactory {
    async fn create(
        &self,
        settings: &TransportSettings,
    ) -> Result<(Arc<dyn MediaTransport>, TransportEvents)> {
        let (transport, events) = WebRtcTransport::connect(settings).await?;
        Ok((transport as Arc<dyn MediaTransport>, events))
    }
}

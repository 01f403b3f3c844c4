//! Diagnostics window: records events and produces a single verdict

use crate::connection_analyzer::{classify, Verdict};
use crate::snapshot::DiagnosticSnapshot;
use classcall_core::{CandidateType, ConnectionState, IceCandidateError, NegotiationEvent, SdpType};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Default length of the observation window
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(20);

/// How long a stabilized call waits for the UI's playback report
pub const PLAYBACK_GRACE: Duration = Duration::from_secs(2);

/// Fact fed into the aggregator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DiagnosticEvent {
    /// Signaling channel opened
    ChannelOpened,
    /// Signaling message received
    MessageReceived,
    /// Local offer sent
    OfferSent,
    /// Local answer sent
    AnswerSent,
    /// Remote offer arrived
    RemoteOfferReceived,
    /// Remote description applied
    RemoteDescriptionApplied,
    /// Local candidate gathered
    LocalCandidate {
        /// Candidate type
        candidate_type: CandidateType,
    },
    /// Remote candidate received
    RemoteCandidate {
        /// Candidate type
        candidate_type: CandidateType,
    },
    /// Connection state changed
    ConnectionState {
        /// New state
        state: ConnectionState,
    },
    /// ICE or description failure
    IceError {
        /// Failure details
        error: IceCandidateError,
    },
    /// UI rendered the first remote frame
    FirstFrameRendered,
    /// UI reported the autoplay outcome
    Autoplay {
        /// Whether playback started
        succeeded: bool,
    },
}

impl DiagnosticEvent {
    /// Diagnostic fact carried by an engine event, if any
    pub fn from_negotiation(event: &NegotiationEvent) -> Option<Self> {
        match event {
            NegotiationEvent::OfferSent => Some(DiagnosticEvent::OfferSent),
            NegotiationEvent::AnswerSent => Some(DiagnosticEvent::AnswerSent),
            NegotiationEvent::RemoteOfferReceived { .. } => {
                Some(DiagnosticEvent::RemoteOfferReceived)
            }
            NegotiationEvent::RemoteDescriptionApplied { sdp_type } => match sdp_type {
                SdpType::Offer | SdpType::Answer | SdpType::Pranswer => {
                    Some(DiagnosticEvent::RemoteDescriptionApplied)
                }
                SdpType::Rollback => None,
            },
            NegotiationEvent::LocalCandidate { candidate_type } => {
                Some(DiagnosticEvent::LocalCandidate {
                    candidate_type: *candidate_type,
                })
            }
            NegotiationEvent::RemoteCandidate { candidate_type, .. } => {
                Some(DiagnosticEvent::RemoteCandidate {
                    candidate_type: *candidate_type,
                })
            }
            NegotiationEvent::ConnectionStateChanged(state) => {
                Some(DiagnosticEvent::ConnectionState { state: *state })
            }
            NegotiationEvent::IceError(error) => Some(DiagnosticEvent::IceError {
                error: error.clone(),
            }),
            _ => None,
        }
    }
}

/// Observer of diagnostics output
pub trait DiagnosticsSink: Send + Sync {
    /// A fact was recorded
    fn on_event(&self, _event: &DiagnosticEvent, _snapshot: &DiagnosticSnapshot) {}

    /// The window closed with a verdict; called once per aggregator
    fn on_verdict(&self, verdict: Verdict, snapshot: &DiagnosticSnapshot);
}

/// Sink that writes through `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl DiagnosticsSink for TracingSink {
    fn on_event(&self, event: &DiagnosticEvent, _snapshot: &DiagnosticSnapshot) {
        debug!("Diagnostic event: {:?}", event);
    }

    fn on_verdict(&self, verdict: Verdict, snapshot: &DiagnosticSnapshot) {
        if verdict.is_healthy() {
            info!("Call diagnostics verdict: {}", verdict);
        } else {
            warn!(
                "Call diagnostics verdict: {} (states {:?}, local {:?}, remote {:?}, {} ice errors)",
                verdict,
                snapshot.connection_states,
                snapshot.local_candidate_types,
                snapshot.remote_candidate_types,
                snapshot.ice_errors.len()
            );
        }
    }
}

/// Accumulates a [`DiagnosticSnapshot`] and finalizes it exactly once
pub struct DiagnosticsAggregator {
    snapshot: DiagnosticSnapshot,
    deadline: Instant,
    playback_grace: Duration,
    stabilized_at: Option<Instant>,
    verdict: Option<Verdict>,
    sink: Arc<dyn DiagnosticsSink>,
}

impl DiagnosticsAggregator {
    /// Start a window of `window` from now
    pub fn new(window: Duration, relay_forced: bool, sink: Arc<dyn DiagnosticsSink>) -> Self {
        Self {
            snapshot: DiagnosticSnapshot::new(relay_forced),
            deadline: Instant::now() + window,
            playback_grace: PLAYBACK_GRACE,
            stabilized_at: None,
            verdict: None,
            sink,
        }
    }

    /// Wait at most `grace` after stabilization for playback facts.
    /// A zero grace closes the window as soon as the connection is stable.
    pub fn with_playback_grace(mut self, grace: Duration) -> Self {
        self.playback_grace = grace;
        self
    }

    /// Record a fact. Returns `true` when the window may close early.
    ///
    /// Facts arriving after finalization are ignored.
    pub fn record(&mut self, event: DiagnosticEvent) -> bool {
        if self.verdict.is_some() {
            return false;
        }

        let snapshot = &mut self.snapshot;
        match &event {
            DiagnosticEvent::ChannelOpened => snapshot.channel_open = true,
            DiagnosticEvent::MessageReceived => {
                snapshot.messages_received = snapshot.messages_received.saturating_add(1)
            }
            DiagnosticEvent::OfferSent => snapshot.offer_sent = true,
            DiagnosticEvent::AnswerSent => snapshot.answer_sent = true,
            DiagnosticEvent::RemoteOfferReceived => snapshot.remote_offer_received = true,
            DiagnosticEvent::RemoteDescriptionApplied => {
                snapshot.remote_description_applied = true
            }
            DiagnosticEvent::LocalCandidate { candidate_type } => {
                snapshot.note_candidate(true, *candidate_type)
            }
            DiagnosticEvent::RemoteCandidate { candidate_type } => {
                snapshot.note_candidate(false, *candidate_type)
            }
            DiagnosticEvent::ConnectionState { state } => {
                snapshot.connection_states.push(*state);
                if state.is_stable() && self.stabilized_at.is_none() {
                    self.stabilized_at = Some(Instant::now());
                }
            }
            DiagnosticEvent::IceError { error } => snapshot.ice_errors.push(error.clone()),
            DiagnosticEvent::FirstFrameRendered => snapshot.first_frame_rendered = true,
            DiagnosticEvent::Autoplay { succeeded } => {
                snapshot.autoplay_succeeded = Some(*succeeded)
            }
        }
        self.sink.on_event(&event, &self.snapshot);

        self.ready_to_finalize()
    }

    /// The connection stabilized and either playback has been reported or
    /// the playback grace has run out
    pub fn ready_to_finalize(&self) -> bool {
        match self.stabilized_at {
            Some(at) if self.verdict.is_none() => {
                self.snapshot.autoplay_succeeded.is_some()
                    || Instant::now() >= at + self.playback_grace
            }
            _ => false,
        }
    }

    /// When the window closes: the end of the window, or the end of the
    /// playback grace once the connection has stabilized
    pub fn deadline(&self) -> Instant {
        match self.stabilized_at {
            Some(at) => self.deadline.min(at + self.playback_grace),
            None => self.deadline,
        }
    }

    /// Facts recorded so far
    pub fn snapshot(&self) -> &DiagnosticSnapshot {
        &self.snapshot
    }

    /// Stored verdict, once finalized
    pub fn verdict(&self) -> Option<Verdict> {
        self.verdict
    }

    /// Whether the window has closed
    pub fn is_finalized(&self) -> bool {
        self.verdict.is_some()
    }

    /// Close the window. The first call classifies and notifies the sink;
    /// later calls return the stored verdict.
    pub fn finalize(&mut self) -> Verdict {
        if let Some(verdict) = self.verdict {
            return verdict;
        }
        let verdict = classify(&self.snapshot);
        self.verdict = Some(verdict);
        self.sink.on_verdict(verdict, &self.snapshot);
        verdict
    }
}

impl std::fmt::Debug for DiagnosticsAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiagnosticsAggregator")
            .field("snapshot", &self.snapshot)
            .field("deadline", &self.deadline)
            .field("stabilized_at", &self.stabilized_at)
            .field("verdict", &self.verdict)
            .finish()
    }
}

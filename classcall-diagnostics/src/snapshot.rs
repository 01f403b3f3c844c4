//! Accumulated connection facts for one observation window

use chrono::{DateTime, Utc};
use classcall_core::{CandidateType, ConnectionState, IceCandidateError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Everything observed about a call during the diagnostics window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticSnapshot {
    /// When observation started
    pub started_at: DateTime<Utc>,
    /// Signaling channel opened
    pub channel_open: bool,
    /// Signaling messages received
    pub messages_received: u32,
    /// A local offer was sent
    pub offer_sent: bool,
    /// A local answer was sent
    pub answer_sent: bool,
    /// A remote offer arrived
    pub remote_offer_received: bool,
    /// A remote description was applied
    pub remote_description_applied: bool,
    /// The UI rendered a remote frame
    pub first_frame_rendered: bool,
    /// Autoplay outcome, once reported
    pub autoplay_succeeded: Option<bool>,
    /// Types of locally gathered candidates
    pub local_candidate_types: BTreeSet<CandidateType>,
    /// Types of candidates received from the peer
    pub remote_candidate_types: BTreeSet<CandidateType>,
    /// Connection states in the order observed
    pub connection_states: Vec<ConnectionState>,
    /// ICE and description failures
    pub ice_errors: Vec<IceCandidateError>,
    /// A relay candidate was seen on either side
    pub relay_seen: bool,
    /// The transport was restricted to relay candidates
    pub relay_forced: bool,
}

impl DiagnosticSnapshot {
    /// Empty snapshot starting now
    pub fn new(relay_forced: bool) -> Self {
        Self {
            started_at: Utc::now(),
            channel_open: false,
            messages_received: 0,
            offer_sent: false,
            answer_sent: false,
            remote_offer_received: false,
            remote_description_applied: false,
            first_frame_rendered: false,
            autoplay_succeeded: None,
            local_candidate_types: BTreeSet::new(),
            remote_candidate_types: BTreeSet::new(),
            connection_states: Vec::new(),
            ice_errors: Vec::new(),
            relay_seen: false,
            relay_forced,
        }
    }

    /// Connection reached `Connected` or `Completed` at some point
    pub fn stabilized(&self) -> bool {
        self.connection_states
            .iter()
            .any(|state| matches!(state, ConnectionState::Connected | ConnectionState::Completed))
    }

    /// Most recent connection state
    pub fn last_connection_state(&self) -> Option<ConnectionState> {
        self.connection_states.last().copied()
    }

    /// ICE errors attributed to a TURN endpoint
    pub fn relay_errors(&self) -> impl Iterator<Item = &IceCandidateError> {
        self.ice_errors.iter().filter(|e| e.is_relay_attributed())
    }

    pub(crate) fn note_candidate(&mut self, local: bool, candidate_type: CandidateType) {
        if candidate_type == CandidateType::Relay {
            self.relay_seen = true;
        }
        if local {
            self.local_candidate_types.insert(candidate_type);
        } else {
            self.remote_candidate_types.insert(candidate_type);
        }
    }
}

//! Connection-health classification

use crate::snapshot::DiagnosticSnapshot;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome of a diagnostics window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Verdict {
    /// Connected with remote media playing
    Ok,
    /// No relay path and no direct connectivity; a TURN server is needed
    NeedsRelay,
    /// The forced relay rejected our credentials
    RelayAuthFailure,
    /// The forced relay could not be reached
    RelayUnreachable,
    /// The offer/answer exchange never completed
    SignalingFailure,
    /// Remote media arrived but playback was blocked
    AutoplayBlocked,
    /// Nothing conclusive
    Unknown,
}

impl Verdict {
    /// Stable identifier, matching the serialized form
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Ok => "ok",
            Verdict::NeedsRelay => "needs-relay",
            Verdict::RelayAuthFailure => "relay-auth-failure",
            Verdict::RelayUnreachable => "relay-unreachable",
            Verdict::SignalingFailure => "signaling-failure",
            Verdict::AutoplayBlocked => "autoplay-blocked",
            Verdict::Unknown => "unknown",
        }
    }

    /// Whether the call is considered healthy
    pub fn is_healthy(&self) -> bool {
        matches!(self, Verdict::Ok)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify a snapshot. Depends on nothing but its argument.
///
/// Rules are evaluated in priority order:
///
/// 1. [`Verdict::Ok`]: stabilized, a remote frame rendered and autoplay succeeded
/// 2. [`Verdict::AutoplayBlocked`]: a remote frame rendered but autoplay failed
/// 3. [`Verdict::RelayAuthFailure`] / [`Verdict::RelayUnreachable`]: relay-only mode,
///    never stabilized, and at least one ICE error names a TURN endpoint
/// 4. [`Verdict::NeedsRelay`]: no relay candidate on either side and never stabilized
/// 5. [`Verdict::SignalingFailure`]: the channel opened but no offer was exchanged
///    or no remote description was applied
/// 6. [`Verdict::Unknown`]
pub fn classify(snapshot: &DiagnosticSnapshot) -> Verdict {
    let stabilized = snapshot.stabilized();

    if stabilized && snapshot.first_frame_rendered && snapshot.autoplay_succeeded == Some(true) {
        return Verdict::Ok;
    }

    if snapshot.first_frame_rendered && snapshot.autoplay_succeeded == Some(false) {
        return Verdict::AutoplayBlocked;
    }

    if snapshot.relay_forced && !stabilized {
        let mut relay_errors = snapshot.relay_errors().peekable();
        if relay_errors.peek().is_some() {
            if relay_errors.any(|e| e.looks_like_auth_failure()) {
                return Verdict::RelayAuthFailure;
            }
            return Verdict::RelayUnreachable;
        }
    }

    if !snapshot.relay_seen && !stabilized {
        return Verdict::NeedsRelay;
    }

    let offer_exchanged = snapshot.offer_sent || snapshot.remote_offer_received;
    if snapshot.channel_open && (!offer_exchanged || !snapshot.remote_description_applied) {
        return Verdict::SignalingFailure;
    }

    Verdict::Unknown
}

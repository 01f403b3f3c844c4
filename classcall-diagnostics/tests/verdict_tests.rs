//! Verdict classification and aggregator windowing

use classcall_core::{CandidateType, ConnectionState, IceCandidateError};
use classcall_diagnostics::{
    classify, DiagnosticEvent, DiagnosticSnapshot, DiagnosticsAggregator, DiagnosticsSink,
    Verdict,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct RecordingSink {
    events: Mutex<usize>,
    verdicts: Mutex<Vec<Verdict>>,
}

impl DiagnosticsSink for RecordingSink {
    fn on_event(&self, _event: &DiagnosticEvent, _snapshot: &DiagnosticSnapshot) {
        *self.events.lock() += 1;
    }

    fn on_verdict(&self, verdict: Verdict, _snapshot: &DiagnosticSnapshot) {
        self.verdicts.lock().push(verdict);
    }
}

fn negotiated() -> DiagnosticSnapshot {
    let mut snapshot = DiagnosticSnapshot::new(false);
    snapshot.channel_open = true;
    snapshot.messages_received = 6;
    snapshot.offer_sent = true;
    snapshot.remote_description_applied = true;
    snapshot
}

fn relay_error(code: Option<u16>, text: &str) -> IceCandidateError {
    IceCandidateError {
        url: Some("turn:turn.school.example:3478?transport=udp".to_string()),
        error_code: code,
        error_text: text.to_string(),
    }
}

#[test]
fn test_healthy_call_is_ok() {
    let mut snapshot = negotiated();
    snapshot.connection_states = vec![ConnectionState::Connecting, ConnectionState::Connected];
    snapshot.first_frame_rendered = true;
    snapshot.autoplay_succeeded = Some(true);
    assert_eq!(classify(&snapshot), Verdict::Ok);
}

#[test]
fn test_autoplay_blocked_regardless_of_transport() {
    let mut snapshot = negotiated();
    snapshot.first_frame_rendered = true;
    snapshot.autoplay_succeeded = Some(false);
    assert_eq!(classify(&snapshot), Verdict::AutoplayBlocked);

    snapshot.connection_states.push(ConnectionState::Connected);
    assert_eq!(classify(&snapshot), Verdict::AutoplayBlocked);
}

#[test]
fn test_no_relay_and_never_stable_needs_relay() {
    let mut snapshot = negotiated();
    snapshot.local_candidate_types.insert(CandidateType::Host);
    snapshot.local_candidate_types.insert(CandidateType::ServerReflexive);
    snapshot.remote_candidate_types.insert(CandidateType::Host);
    snapshot.connection_states = vec![ConnectionState::Connecting, ConnectionState::Failed];
    assert_eq!(classify(&snapshot), Verdict::NeedsRelay);
}

#[test]
fn test_forced_relay_failures_are_attributed() {
    let mut snapshot = negotiated();
    snapshot.relay_forced = true;
    snapshot.connection_states = vec![ConnectionState::Connecting, ConnectionState::Failed];

    snapshot.ice_errors = vec![relay_error(Some(701), "STUN host lookup received error")];
    assert_eq!(classify(&snapshot), Verdict::RelayUnreachable);

    snapshot
        .ice_errors
        .push(relay_error(Some(401), "Unauthorized"));
    assert_eq!(classify(&snapshot), Verdict::RelayAuthFailure);

    snapshot.ice_errors = vec![relay_error(None, "invalid credential")];
    assert_eq!(classify(&snapshot), Verdict::RelayAuthFailure);
}

#[test]
fn test_relay_errors_ignored_without_forced_relay() {
    let mut snapshot = negotiated();
    snapshot.ice_errors = vec![relay_error(Some(401), "Unauthorized")];
    snapshot.connection_states = vec![ConnectionState::Failed];
    assert_eq!(classify(&snapshot), Verdict::NeedsRelay);
}

#[test]
fn test_non_relay_errors_fall_through() {
    let mut snapshot = negotiated();
    snapshot.relay_forced = true;
    snapshot.ice_errors = vec![IceCandidateError {
        url: Some("stun:stun.l.google.com:19302".to_string()),
        error_code: Some(701),
        error_text: "timeout".to_string(),
    }];
    assert_eq!(classify(&snapshot), Verdict::NeedsRelay);
}

#[test]
fn test_signaling_failure_when_nothing_negotiated() {
    let mut snapshot = DiagnosticSnapshot::new(true);
    snapshot.channel_open = true;
    snapshot.local_candidate_types.insert(CandidateType::Relay);
    snapshot.relay_seen = true;
    assert_eq!(classify(&snapshot), Verdict::SignalingFailure);

    // An offer went out but no answer ever came back
    snapshot.offer_sent = true;
    assert_eq!(classify(&snapshot), Verdict::SignalingFailure);

    snapshot.remote_description_applied = true;
    assert_eq!(classify(&snapshot), Verdict::Unknown);
}

#[test]
fn test_stable_without_playback_report_is_unknown() {
    let mut snapshot = negotiated();
    snapshot.connection_states = vec![ConnectionState::Connected];
    assert_eq!(classify(&snapshot), Verdict::Unknown);
}

#[test]
fn test_classification_is_pure() {
    let mut snapshot = negotiated();
    snapshot.relay_forced = true;
    snapshot.ice_errors = vec![relay_error(Some(403), "Forbidden IP")];

    let recorded = serde_json::to_string(&snapshot).unwrap();
    let replayed: DiagnosticSnapshot = serde_json::from_str(&recorded).unwrap();

    let first = classify(&snapshot);
    let second = classify(&snapshot);
    assert_eq!(first, second);
    assert_eq!(classify(&replayed), first);
    assert_eq!(first, Verdict::RelayAuthFailure);
}

#[test]
fn test_aggregator_finalizes_once() {
    let sink = Arc::new(RecordingSink::default());
    let mut aggregator = DiagnosticsAggregator::new(Duration::from_secs(20), false, sink.clone());

    assert!(!aggregator.record(DiagnosticEvent::ChannelOpened));
    aggregator.record(DiagnosticEvent::LocalCandidate {
        candidate_type: CandidateType::Host,
    });
    aggregator.record(DiagnosticEvent::ConnectionState {
        state: ConnectionState::Failed,
    });

    assert_eq!(aggregator.finalize(), Verdict::NeedsRelay);
    assert!(aggregator.is_finalized());

    // Late facts do not change the stored verdict
    assert!(!aggregator.record(DiagnosticEvent::ConnectionState {
        state: ConnectionState::Connected,
    }));
    assert_eq!(aggregator.finalize(), Verdict::NeedsRelay);
    assert_eq!(aggregator.verdict(), Some(Verdict::NeedsRelay));

    assert_eq!(*sink.verdicts.lock(), vec![Verdict::NeedsRelay]);
    assert_eq!(*sink.events.lock(), 3);
}

#[test]
fn test_aggregator_early_finalization() {
    let sink = Arc::new(RecordingSink::default());
    let mut aggregator = DiagnosticsAggregator::new(Duration::from_secs(20), false, sink.clone());

    for event in [
        DiagnosticEvent::ChannelOpened,
        DiagnosticEvent::MessageReceived,
        DiagnosticEvent::OfferSent,
        DiagnosticEvent::RemoteDescriptionApplied,
        DiagnosticEvent::FirstFrameRendered,
    ] {
        assert!(!aggregator.record(event));
    }
    // Stable, but the playback report is still within its grace
    assert!(!aggregator.record(DiagnosticEvent::ConnectionState {
        state: ConnectionState::Connected,
    }));
    assert!(aggregator.record(DiagnosticEvent::Autoplay { succeeded: true }));

    assert_eq!(aggregator.finalize(), Verdict::Ok);
    assert_eq!(aggregator.snapshot().messages_received, 1);
    assert!(!aggregator.ready_to_finalize());
}

#[test]
fn test_stable_connection_closes_window_without_playback() {
    let sink = Arc::new(RecordingSink::default());
    let mut aggregator = DiagnosticsAggregator::new(Duration::from_secs(20), false, sink.clone())
        .with_playback_grace(Duration::ZERO);

    assert!(!aggregator.record(DiagnosticEvent::ChannelOpened));
    assert!(aggregator.record(DiagnosticEvent::ConnectionState {
        state: ConnectionState::Completed,
    }));
    assert_eq!(aggregator.finalize(), Verdict::Unknown);
    assert_eq!(*sink.verdicts.lock(), vec![Verdict::Unknown]);
}

#[test]
fn test_stabilization_pulls_deadline_in() {
    let mut aggregator = DiagnosticsAggregator::new(
        Duration::from_secs(20),
        false,
        Arc::new(RecordingSink::default()),
    )
    .with_playback_grace(Duration::from_secs(2));

    let before = tokio::time::Instant::now();
    aggregator.record(DiagnosticEvent::ConnectionState {
        state: ConnectionState::Connecting,
    });
    assert!(aggregator.deadline() - before > Duration::from_secs(19));

    aggregator.record(DiagnosticEvent::ConnectionState {
        state: ConnectionState::Connected,
    });
    let remaining = aggregator.deadline() - before;
    assert!(remaining >= Duration::from_secs(2));
    assert!(remaining < Duration::from_secs(3));
    assert!(!aggregator.ready_to_finalize());
}

#[test]
fn test_deadline_follows_window() {
    let before = tokio::time::Instant::now();
    let aggregator = DiagnosticsAggregator::new(
        Duration::from_secs(5),
        false,
        Arc::new(RecordingSink::default()),
    );
    let window = aggregator.deadline() - before;
    assert!(window >= Duration::from_secs(5));
    assert!(window < Duration::from_secs(6));
}

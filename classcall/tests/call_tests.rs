//! End-to-end calls over the in-memory relay, directory and loopback transports

use async_trait::async_trait;
use classcall::{
    CallConfig, CallController, CallEvent, CallState, EventStream, InMemorySessionDirectory,
    LocalMediaSource, LocalTrack, LoopbackFactory, MemoryRelay, Result, Role, RoomId,
    SessionDirectory, SessionId, SessionStatus, SignalingMessage, TrackKind, UserId, Verdict,
};
use classcall_signaling::{JoinStatus, ParticipantRecord, SessionRecord};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

struct Harness {
    relay: MemoryRelay,
    directory: InMemorySessionDirectory,
}

struct Participant {
    call: CallController,
    events: EventStream,
    completions: Arc<AtomicUsize>,
}

impl Harness {
    fn new() -> Self {
        Self {
            relay: MemoryRelay::new(),
            directory: InMemorySessionDirectory::new(),
        }
    }

    fn participant(&self, media: LocalMediaSource) -> Participant {
        self.participant_with(media, Arc::new(self.directory.clone()))
    }

    fn participant_with(
        &self,
        media: LocalMediaSource,
        directory: Arc<dyn SessionDirectory>,
    ) -> Participant {
        let config = CallConfig {
            media_retry_interval: Duration::from_millis(10),
            media_retry_attempts: 5,
            diagnostics_window: Duration::from_secs(30),
            ..CallConfig::default()
        };
        let completions = Arc::new(AtomicUsize::new(0));
        let counter = completions.clone();
        let call = CallController::builder(config)
            .directory(directory)
            .connector(Arc::new(self.relay.clone()))
            .transport_factory(Arc::new(LoopbackFactory::new()))
            .media(media)
            .on_complete(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .build()
            .unwrap();
        let events = call.events();
        Participant {
            call,
            events,
            completions,
        }
    }
}

fn av_media(prefix: &str) -> LocalMediaSource {
    LocalMediaSource::with_tracks(vec![
        LocalTrack::audio(format!("{prefix}-mic")),
        LocalTrack::video(format!("{prefix}-camera")),
    ])
}

async fn wait_for_state(call: &CallController, expected: CallState) {
    let mut state = call.watch_state();
    timeout(WAIT, state.wait_for(|s| *s == expected))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {expected}, still {}", call.state()))
        .unwrap();
}

async fn wait_for_event<F>(events: &mut EventStream, mut matches: F) -> CallEvent
where
    F: FnMut(&CallEvent) -> bool,
{
    timeout(WAIT, async {
        loop {
            let event = events.next().await.expect("event stream closed");
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn wait_until<F>(what: &str, mut done: F)
where
    F: FnMut() -> bool,
{
    timeout(WAIT, async {
        while !done() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting until {what}"));
}

/// Directory whose lookups and joins take a while
struct SlowDirectory {
    inner: InMemorySessionDirectory,
    lookup_delay: Duration,
    join_delay: Duration,
}

#[async_trait]
impl SessionDirectory for SlowDirectory {
    async fn list_sessions(&self, room_id: &RoomId) -> Result<Vec<SessionRecord>> {
        tokio::time::sleep(self.lookup_delay).await;
        self.inner.list_sessions(room_id).await
    }

    async fn create_session(&self, room_id: &RoomId) -> Result<SessionRecord> {
        self.inner.create_session(room_id).await
    }

    async fn list_participants(&self, session_id: &SessionId) -> Result<Vec<ParticipantRecord>> {
        self.inner.list_participants(session_id).await
    }

    async fn join(&self, session_id: &SessionId, user_id: &UserId) -> Result<JoinStatus> {
        tokio::time::sleep(self.join_delay).await;
        self.inner.join(session_id, user_id).await
    }

    async fn leave(&self, session_id: &SessionId, user_id: &UserId) -> Result<()> {
        self.inner.leave(session_id, user_id).await
    }
}

/// Host and guest in the same room, both connected
async fn connected_pair(harness: &Harness) -> (Participant, Participant) {
    let room = RoomId::from(10);
    let host = harness.participant(av_media("host"));
    let guest = harness.participant(av_media("guest"));

    host.call
        .start(room.clone(), UserId::from(1), Role::Host)
        .await
        .unwrap();
    guest
        .call
        .start(room, UserId::from(2), Role::Participant)
        .await
        .unwrap();

    wait_for_state(&host.call, CallState::Connected).await;
    wait_for_state(&guest.call, CallState::Connected).await;
    (host, guest)
}

fn count_actions(harness: &Harness, call: &CallController, action: &str) -> usize {
    let session = call.session().expect("call has a session");
    harness
        .relay
        .history(&session.id)
        .iter()
        .filter(|m| m.action() == action)
        .count()
}

#[tokio::test]
async fn test_two_party_call_connects_with_one_answer() {
    let harness = Harness::new();
    let (mut host, guest) = connected_pair(&harness).await;

    let host_session = host.call.session().unwrap();
    let guest_session = guest.call.session().unwrap();
    assert!(host_session.created_by_us);
    assert!(!guest_session.created_by_us);
    assert_eq!(host_session.id, guest_session.id);

    // Both sides offered at once; only the polite guest answered
    assert_eq!(count_actions(&harness, &host.call, "answer"), 1);
    let answer_sender = harness
        .relay
        .history(&host_session.id)
        .into_iter()
        .find_map(|m| match m {
            SignalingMessage::Answer { user, .. } => Some(user),
            _ => None,
        });
    assert_eq!(answer_sender, Some(UserId::from(2)));

    let joined = wait_for_event(&mut host.events, |e| matches!(e, CallEvent::PeerJoined { .. })).await;
    assert_eq!(
        joined,
        CallEvent::PeerJoined {
            user: UserId::from(2)
        }
    );

    host.call.report_first_frame();
    host.call.report_autoplay(true);
    let verdict = wait_for_event(&mut host.events, |e| matches!(e, CallEvent::Diagnostics { .. })).await;
    assert_eq!(
        verdict,
        CallEvent::Diagnostics {
            verdict: Verdict::Ok
        }
    );

    host.call.leave().await;
    guest.call.leave().await;
}

#[tokio::test]
async fn test_leave_is_idempotent() {
    let harness = Harness::new();
    let (host, mut guest) = connected_pair(&harness).await;
    let session = host.call.session().unwrap();

    tokio::join!(host.call.leave(), host.call.leave());
    host.call.leave().await;

    assert_eq!(host.call.state(), CallState::Ended);
    assert_eq!(host.completions.load(Ordering::SeqCst), 1);
    assert!(host.call.media().tracks().iter().all(|t| t.is_stopped()));

    // The guest tears down on the end-of-call notice
    let ended = wait_for_event(&mut guest.events, |e| matches!(e, CallEvent::CallEnded { .. })).await;
    assert_eq!(
        ended,
        CallEvent::CallEnded {
            by: Some(UserId::from(1))
        }
    );
    wait_for_state(&guest.call, CallState::Ended).await;
    assert_eq!(guest.completions.load(Ordering::SeqCst), 1);

    guest.call.leave().await;
    assert_eq!(guest.completions.load(Ordering::SeqCst), 1);

    assert_eq!(count_actions(&harness, &host.call, "end_call"), 1);
    assert!(harness.directory.active_members(&session.id).is_empty());
    assert_eq!(
        harness.directory.session(&session.id).unwrap().status,
        SessionStatus::Ended
    );
}

#[tokio::test]
async fn test_participant_waits_for_host() {
    let harness = Harness::new();
    let student = harness.participant(av_media("student"));

    let state = student
        .call
        .start(RoomId::from(77), UserId::from(5), Role::Participant)
        .await
        .unwrap();
    assert_eq!(state, CallState::WaitingForHost);
    assert!(student.call.session().is_none());
    assert!(harness.directory.sessions().is_empty());

    student.call.leave().await;
    student.call.leave().await;
    assert_eq!(student.call.state(), CallState::Ended);
    assert_eq!(student.completions.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_channel_closure_ends_both_calls() {
    let harness = Harness::new();
    let (mut host, mut guest) = connected_pair(&harness).await;
    let session = host.call.session().unwrap();

    harness.relay.close_session(&session.id, "server restart");

    for participant in [&mut host, &mut guest] {
        let closed = wait_for_event(&mut participant.events, |e| {
            matches!(e, CallEvent::ChannelClosed { .. })
        })
        .await;
        assert_eq!(
            closed,
            CallEvent::ChannelClosed {
                reason: "server restart".to_string()
            }
        );
        wait_for_state(&participant.call, CallState::Ended).await;
        assert_eq!(participant.completions.load(Ordering::SeqCst), 1);
    }

    // Nothing left to send on a closed channel
    host.call.leave().await;
    assert_eq!(count_actions(&harness, &host.call, "end_call"), 0);
}

#[tokio::test]
async fn test_toggles_are_informational() {
    let harness = Harness::new();
    let (host, mut guest) = connected_pair(&harness).await;

    assert_eq!(host.call.toggle_mic(), Some(false));
    let mic = host.call.media().track(TrackKind::Audio).unwrap();
    assert!(!mic.is_enabled());

    let toggled = wait_for_event(&mut guest.events, |e| {
        matches!(e, CallEvent::RemoteMediaToggled { .. })
    })
    .await;
    assert_eq!(
        toggled,
        CallEvent::RemoteMediaToggled {
            user: Some(UserId::from(1)),
            kind: TrackKind::Audio,
            enabled: false,
        }
    );

    // No renegotiation follows a toggle
    assert_eq!(count_actions(&harness, &host.call, "answer"), 1);
    assert_eq!(guest.call.state(), CallState::Connected);

    assert_eq!(host.call.toggle_camera(), Some(false));
    assert_eq!(host.call.toggle_camera(), Some(true));

    host.call.leave().await;
    guest.call.leave().await;
}

#[tokio::test]
async fn test_toggle_without_track() {
    let harness = Harness::new();
    let host = harness.participant(LocalMediaSource::with_tracks(vec![LocalTrack::audio("mic")]));
    assert_eq!(host.call.toggle_camera(), None);
    assert_eq!(host.call.toggle_mic(), Some(false));
}

#[tokio::test]
async fn test_controller_starts_once() {
    let harness = Harness::new();
    let student = harness.participant(LocalMediaSource::new());
    student
        .call
        .start(RoomId::from(1), UserId::from(9), Role::Participant)
        .await
        .unwrap();

    let err = student
        .call
        .start(RoomId::from(1), UserId::from(9), Role::Participant)
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "INVALID_STATE");
}

#[test]
fn test_build_without_transport_factory() {
    let result = CallController::builder(CallConfig::default())
        .directory(Arc::new(InMemorySessionDirectory::new()))
        .connector(Arc::new(MemoryRelay::new()))
        .build();
    if cfg!(feature = "webrtc") {
        assert!(result.is_ok());
    } else {
        tokio_test::assert_err!(result);
    }
}

#[tokio::test]
async fn test_leave_during_setup_abandons_the_call() {
    let slow_lookup = (Duration::from_millis(100), Duration::ZERO);
    let slow_join = (Duration::ZERO, Duration::from_millis(100));

    for (lookup_delay, join_delay) in [slow_lookup, slow_join] {
        let harness = Harness::new();
        let directory = SlowDirectory {
            inner: harness.directory.clone(),
            lookup_delay,
            join_delay,
        };
        let media = av_media("host");
        let host = harness.participant_with(media.clone(), Arc::new(directory));

        let (started, ()) = tokio::join!(
            host.call.start(RoomId::from(30), UserId::from(1), Role::Host),
            async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                host.call.leave().await;
            }
        );
        assert_eq!(started.unwrap(), CallState::Ended);

        // Give a stray task the chance to show up
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(host.call.state(), CallState::Ended);
        assert_eq!(host.completions.load(Ordering::SeqCst), 1);
        assert!(media.tracks().iter().all(|t| t.is_stopped()));
        for session in harness.directory.sessions() {
            assert!(harness.directory.active_members(&session.id).is_empty());
            assert!(harness.relay.members(&session.id).is_empty());
        }
    }
}

#[tokio::test]
async fn test_channel_error_ends_the_call() {
    let harness = Harness::new();
    let (mut host, mut guest) = connected_pair(&harness).await;
    let session = host.call.session().unwrap();

    harness
        .relay
        .fail_connection(&session.id, &UserId::from(1), "connection reset");

    let closed = wait_for_event(&mut host.events, |e| matches!(e, CallEvent::ChannelClosed { .. })).await;
    assert_eq!(
        closed,
        CallEvent::ChannelClosed {
            reason: "connection reset".to_string()
        }
    );
    wait_for_state(&host.call, CallState::Ended).await;
    assert_eq!(host.completions.load(Ordering::SeqCst), 1);
    assert_eq!(count_actions(&harness, &host.call, "end_call"), 0);

    // The guest sees the host disconnect and waits for the next peer
    let left = wait_for_event(&mut guest.events, |e| matches!(e, CallEvent::PeerLeft { .. })).await;
    assert_eq!(
        left,
        CallEvent::PeerLeft {
            user: UserId::from(1)
        }
    );
    assert_eq!(guest.call.state(), CallState::ChannelOpen);
    guest.call.leave().await;
}

#[tokio::test]
async fn test_peer_can_drop_and_rejoin() {
    let harness = Harness::new();
    let (mut host, guest) = connected_pair(&harness).await;

    let Participant {
        call, completions, ..
    } = guest;
    drop(call);

    let left = wait_for_event(&mut host.events, |e| matches!(e, CallEvent::PeerLeft { .. })).await;
    assert_eq!(
        left,
        CallEvent::PeerLeft {
            user: UserId::from(2)
        }
    );
    wait_until("the dropped guest completed", || {
        completions.load(Ordering::SeqCst) == 1
    })
    .await;
    assert_eq!(host.call.state(), CallState::ChannelOpen);

    let returning = harness.participant(av_media("guest-again"));
    returning
        .call
        .start(RoomId::from(10), UserId::from(2), Role::Participant)
        .await
        .unwrap();

    let joined = wait_for_event(&mut host.events, |e| matches!(e, CallEvent::PeerJoined { .. })).await;
    assert_eq!(
        joined,
        CallEvent::PeerJoined {
            user: UserId::from(2)
        }
    );
    wait_for_state(&returning.call, CallState::Connected).await;
    wait_for_state(&host.call, CallState::Connected).await;
    assert_eq!(count_actions(&harness, &host.call, "answer"), 2);

    host.call.leave().await;
    returning.call.leave().await;
}

#[tokio::test]
async fn test_dropped_controller_releases_the_call() {
    let harness = Harness::new();
    let media = av_media("host");
    let host = harness.participant(media.clone());
    host.call
        .start(RoomId::from(40), UserId::from(1), Role::Host)
        .await
        .unwrap();
    let session = host.call.session().unwrap();
    assert_eq!(harness.directory.active_members(&session.id), vec![UserId::from(1)]);

    let Participant {
        call, completions, ..
    } = host;
    drop(call);

    wait_until("the dropped call completed", || {
        completions.load(Ordering::SeqCst) == 1
    })
    .await;
    assert!(media.tracks().iter().all(|t| t.is_stopped()));
    assert!(harness.directory.active_members(&session.id).is_empty());
    wait_until("the relay forgot the host", || {
        harness.relay.members(&session.id).is_empty()
    })
    .await;
}

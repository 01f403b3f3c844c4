//! Two-party call demo
//!
//! A host and a student join the same classroom through the in-memory relay
//! and directory, negotiate over loopback transports and report what the
//! diagnostics window concluded. No network access is needed.
//!
//! Run with `cargo run -p classcall --example two_party_loopback`.

use classcall::{
    CallConfig, CallController, CallEvent, CallState, InMemorySessionDirectory, LocalMediaSource,
    LocalTrack, LoopbackFactory, MemoryRelay, Role, RoomId, UserId,
};
use std::sync::Arc;
use std::time::Duration;

fn participant(
    name: &'static str,
    relay: &MemoryRelay,
    directory: &InMemorySessionDirectory,
) -> Result<CallController, Box<dyn std::error::Error>> {
    let media = LocalMediaSource::with_tracks(vec![
        LocalTrack::audio(format!("{name}-mic")),
        LocalTrack::video(format!("{name}-camera")),
    ]);
    let call = CallController::builder(CallConfig::default())
        .directory(Arc::new(directory.clone()))
        .connector(Arc::new(relay.clone()))
        .transport_factory(Arc::new(LoopbackFactory::new()))
        .media(media)
        .on_complete(move || println!("✅ {name} finished the call"))
        .build()?;
    Ok(call)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    classcall::init_logging(classcall::DEFAULT_FILTER);

    println!("🚀 Two-party loopback call");
    println!("==========================");

    let relay = MemoryRelay::new();
    let directory = InMemorySessionDirectory::new();
    let room = RoomId::from(101);

    let host = participant("teacher", &relay, &directory)?;
    let student = participant("student", &relay, &directory)?;
    let mut host_events = host.events();

    let state = host.start(room.clone(), UserId::from(1), Role::Host).await?;
    println!("📋 Host started: {state}");
    let state = student.start(room, UserId::from(2), Role::Participant).await?;
    println!("📋 Student started: {state}");

    // Both sides rendered and played the remote media
    for call in [&host, &student] {
        call.report_first_frame();
        call.report_autoplay(true);
    }

    let outcome = tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(event) = host_events.next().await {
            match event {
                CallEvent::StateChanged { state } => println!("📞 Host state: {state}"),
                CallEvent::TrackReceived { track_id, kind } => {
                    println!("🎥 Host received {kind:?} track {track_id}")
                }
                CallEvent::Diagnostics { verdict } => return Some(verdict),
                event if event.is_terminal() => break,
                _ => {}
            }
        }
        None
    })
    .await;

    match outcome {
        Ok(Some(verdict)) => println!("🩺 Diagnostics verdict: {verdict}"),
        Ok(None) => println!("❌ Call ended before diagnostics"),
        Err(_) => println!("❌ No diagnostics within 10s (host is {})", host.state()),
    }

    if host.state() == CallState::Connected {
        println!("✅ Peers connected");
    }

    host.leave().await;
    student.leave().await;
    println!("👋 Student state after host left: {}", student.state());
    Ok(())
}

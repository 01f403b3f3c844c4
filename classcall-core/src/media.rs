//! Local media source and track handles
//!
//! Capture itself happens outside this crate. The application publishes the
//! captured tracks into a [`LocalMediaSource`] whenever they become available,
//! which may be well after the call has started. Track handles are cheap
//! clones sharing the same `enabled`/`stopped` flags, so the local preview and
//! the transport senders always observe the same state.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

/// Media kind of a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    /// Microphone audio
    Audio,
    /// Camera video
    Video,
}

/// Handle to one captured local track
#[derive(Debug, Clone)]
pub struct LocalTrack {
    id: String,
    kind: TrackKind,
    enabled: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
}

impl LocalTrack {
    /// Wrap a captured track
    pub fn new(id: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            id: id.into(),
            kind,
            enabled: Arc::new(AtomicBool::new(true)),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Captured audio track
    pub fn audio(id: impl Into<String>) -> Self {
        Self::new(id, TrackKind::Audio)
    }

    /// Captured video track
    pub fn video(id: impl Into<String>) -> Self {
        Self::new(id, TrackKind::Video)
    }

    /// Track ID
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Track kind
    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    /// Whether the track currently transmits media
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Enable or mute the track without removing it from the transport.
    /// Only the call controller flips this flag.
    pub fn set_enabled(&self, enabled: bool) {
        let previous = self.enabled.swap(enabled, Ordering::SeqCst);
        if previous != enabled {
            debug!("Local {:?} track {} enabled={}", self.kind, self.id, enabled);
        }
    }

    /// Whether capture has been stopped
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Stop capture; terminal
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            debug!("Stopped local {:?} track {}", self.kind, self.id);
        }
    }
}

/// Shared set of local tracks, filled asynchronously by the capture layer
#[derive(Debug, Clone)]
pub struct LocalMediaSource {
    tracks: Arc<RwLock<Vec<LocalTrack>>>,
    generation: Arc<watch::Sender<u64>>,
}

impl LocalMediaSource {
    /// Empty source, tracks published later
    pub fn new() -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            tracks: Arc::new(RwLock::new(Vec::new())),
            generation: Arc::new(generation),
        }
    }

    /// Source that already holds captured tracks
    pub fn with_tracks(tracks: Vec<LocalTrack>) -> Self {
        let source = Self::new();
        source.publish(tracks);
        source
    }

    /// Make newly captured tracks available and wake observers
    pub fn publish(&self, tracks: Vec<LocalTrack>) {
        if tracks.is_empty() {
            return;
        }
        {
            let mut guard = self.tracks.write();
            for track in tracks {
                if guard.iter().any(|t| t.id() == track.id()) {
                    continue;
                }
                info!("🎞️ Local {:?} track {} available", track.kind(), track.id());
                guard.push(track);
            }
        }
        self.generation.send_modify(|g| *g += 1);
    }

    /// Snapshot of the current tracks
    pub fn tracks(&self) -> Vec<LocalTrack> {
        self.tracks.read().clone()
    }

    /// Whether any track has been published
    pub fn has_tracks(&self) -> bool {
        !self.tracks.read().is_empty()
    }

    /// First track of the given kind
    pub fn track(&self, kind: TrackKind) -> Option<LocalTrack> {
        self.tracks.read().iter().find(|t| t.kind() == kind).cloned()
    }

    /// Subscribe to publication changes
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }

    /// Stop every track
    pub fn stop_all(&self) {
        for track in self.tracks.read().iter() {
            track.stop();
        }
    }
}

impl Default for LocalMediaSource {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_track_flags_are_shared_between_clones() {
        let track = LocalTrack::audio("mic-1");
        let sender_view = track.clone();

        track.set_enabled(false);
        assert!(!sender_view.is_enabled());

        sender_view.stop();
        assert!(track.is_stopped());
    }

    #[tokio::test]
    async fn test_publish_notifies_subscribers() {
        let source = LocalMediaSource::new();
        let mut changes = source.subscribe();
        assert!(!source.has_tracks());

        source.publish(vec![LocalTrack::audio("mic"), LocalTrack::video("cam")]);
        changes.changed().await.unwrap();

        assert_eq!(source.tracks().len(), 2);
        assert_eq!(source.track(TrackKind::Video).unwrap().id(), "cam");
    }

    #[test]
    fn test_publish_ignores_duplicates() {
        let source = LocalMediaSource::with_tracks(vec![LocalTrack::audio("mic")]);
        source.publish(vec![LocalTrack::audio("mic")]);
        assert_eq!(source.tracks().len(), 1);

        source.stop_all();
        assert!(source.tracks().iter().all(|t| t.is_stopped()));
    }
}

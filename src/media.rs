//! Media session collaborator interface.
//!
//! The call core never touches cameras, codecs, or ICE itself; a
//! [`MediaEngine`] implementation (WebRTC stack, native capture layer, or a
//! test double) owns all of that behind this seam. The engine reports back
//! asynchronously through [`MediaEvent`]s, which re-enter the call state
//! machine as ordinary queued events.
//!
//! Negotiation is deliberately non-trickle: an engine must produce exactly
//! one [`MediaEvent::SignalReady`] per session, bundling all connectivity
//! data into a single opaque payload. That keeps the relay protocol to one
//! invite/answer round-trip at the cost of a little setup latency.

use crate::calls::CallError;
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

/// Opaque negotiation blob exchanged exactly once per side.
pub type SignalPayload = serde_json::Value;

/// Events emitted by a media session as negotiation progresses.
#[derive(Debug, Clone)]
pub enum MediaEvent {
    /// The local signal payload is ready to be sent to the peer.
    SignalReady(SignalPayload),
    /// The remote audio/video stream arrived; negotiation is complete.
    RemoteStream(RemoteStream),
    /// The session failed internally and is unusable.
    Error(String),
}

/// Handle to the remote party's media stream, owned by the call session
/// for the lifetime of the call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStream {
    pub id: String,
}

/// Kind of a local media track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// A single local capture track.
#[derive(Debug)]
pub struct MediaTrack {
    kind: TrackKind,
    label: String,
    stopped: AtomicBool,
}

impl MediaTrack {
    pub fn new(kind: TrackKind, label: impl Into<String>) -> Self {
        Self {
            kind,
            label: label.into(),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// The locally acquired capture stream.
///
/// Acquired and owned by the embedding application; the call core only
/// borrows it (via `Arc`) to hand to media sessions, and never releases the
/// underlying devices. Shared across successive calls.
#[derive(Debug, Default)]
pub struct LocalMedia {
    tracks: Vec<MediaTrack>,
}

impl LocalMedia {
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        Self { tracks }
    }

    /// A standard camera-plus-microphone stream.
    pub fn audio_video() -> Self {
        Self::new(vec![
            MediaTrack::new(TrackKind::Video, "camera"),
            MediaTrack::new(TrackKind::Audio, "microphone"),
        ])
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    /// Stop every track tied to the ended call, except the first video
    /// track: that one keeps feeding the user's own preview after hangup.
    pub fn stop_session_tracks(&self) {
        let preview = self
            .tracks
            .iter()
            .position(|t| t.kind() == TrackKind::Video);
        for (i, track) in self.tracks.iter().enumerate() {
            if Some(i) != preview {
                track.stop();
            }
        }
    }
}

/// An active peer media connection, exclusively owned by the call session.
#[async_trait]
pub trait MediaSession: Send + Sync {
    /// Feed the peer's signal payload into this session.
    async fn feed_remote_signal(&self, payload: SignalPayload) -> Result<(), CallError>;

    /// Release all underlying network and media resources. Safe to call
    /// once per session; the handle is unusable afterwards.
    async fn destroy(&self);
}

/// Factory for media sessions.
///
/// This is the primary integration point between the call core and
/// external media handling code.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Create a session. `initiator` selects which side produces the first
    /// signal payload. `local` is the borrowed capture stream; `None` is a
    /// degraded receive-only mode, not an error.
    ///
    /// The returned receiver delivers this session's [`MediaEvent`]s; the
    /// caller is expected to pump it into its own event loop.
    async fn create_session(
        &self,
        initiator: bool,
        local: Option<Arc<LocalMedia>>,
    ) -> Result<(Box<dyn MediaSession>, mpsc::UnboundedReceiver<MediaEvent>), CallError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_session_tracks_preserves_preview() {
        let media = LocalMedia::audio_video();
        media.stop_session_tracks();

        let video = &media.tracks()[0];
        let audio = &media.tracks()[1];
        assert_eq!(video.kind(), TrackKind::Video);
        assert!(!video.is_stopped(), "preview video track must keep running");
        assert!(audio.is_stopped());
    }

    #[test]
    fn test_stop_session_tracks_preserves_only_first_video() {
        let media = LocalMedia::new(vec![
            MediaTrack::new(TrackKind::Audio, "microphone"),
            MediaTrack::new(TrackKind::Video, "camera"),
            MediaTrack::new(TrackKind::Video, "screen"),
        ]);
        media.stop_session_tracks();

        assert!(media.tracks()[0].is_stopped());
        assert!(!media.tracks()[1].is_stopped());
        assert!(media.tracks()[2].is_stopped());
    }

    #[test]
    fn test_stop_session_tracks_without_video() {
        let media = LocalMedia::new(vec![MediaTrack::new(TrackKind::Audio, "microphone")]);
        media.stop_session_tracks();
        assert!(media.tracks()[0].is_stopped());
    }
}

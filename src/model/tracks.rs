//! Media track management
//!
//! Tracks are created by the media engine and owned by the peer connection
//! handle. Everything else refers to them by [`TrackId`].

use std::fmt;

/// Identity of a track within one peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrackId(pub u64);

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The kind of media (audio or video)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => f.write_str("audio"),
            TrackKind::Video => f.write_str("video"),
        }
    }
}

/// Which side of the connection produces the media.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackOrigin {
    /// Attached by this side with `add_audio_track`/`add_video_track`.
    Local,
    /// Announced by the remote peer during negotiation.
    Remote,
}

/// Lifecycle of a track. `Ended` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackState {
    Live,
    Muted,
    Ended,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Track {
    pub id: TrackId,
    pub kind: TrackKind,
    pub label: String,
    pub origin: TrackOrigin,
    pub state: TrackState,
}

impl Track {
    pub fn new(id: TrackId, kind: TrackKind, label: impl Into<String>, origin: TrackOrigin) -> Self {
        Track {
            id,
            kind,
            label: label.into(),
            origin,
            state: TrackState::Live,
        }
    }

    pub fn is_ended(&self) -> bool {
        self.state == TrackState::Ended
    }

    /// Moves the track to `next` unless it has already ended.
    pub(crate) fn transition(&mut self, next: TrackState) {
        if !self.is_ended() {
            self.state = next;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioTrackOptions {
    pub label: String,
}

impl Default for AudioTrackOptions {
    fn default() -> Self {
        AudioTrackOptions {
            label: "audio".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoTrackOptions {
    pub label: String,
    pub max_frames_per_second: u32,
}

impl Default for VideoTrackOptions {
    fn default() -> Self {
        VideoTrackOptions {
            label: "video".to_string(),
            max_frames_per_second: 30,
        }
    }
}

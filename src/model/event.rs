//! Events emitted by a peer connection
//!
//! The native engine reports its callbacks as [`PeerEvent`] values pushed onto
//! one ordered channel per connection. The coordinator consumes that channel
//! on the same logical thread as the inbound signaling messages.

use tokio::sync::mpsc;

use crate::model::envelope::IceCandidate;
use crate::model::tracks::{Track, TrackId};

/// Sending half of a connection's event channel, handed to the engine.
pub type EventSender = mpsc::UnboundedSender<PeerEvent>;

/// Receiving half of a connection's event channel, held by the handle.
pub type EventReceiver = mpsc::UnboundedReceiver<PeerEvent>;

#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    /// A local candidate was gathered. `None` marks end-of-candidates.
    IceCandidate(Option<IceCandidate>),

    IceGatheringStateChanged(IceGatheringState),

    IceConnectionStateChanged(IceConnectionState),

    /// Gathering a candidate failed, e.g. a STUN server could not be reached.
    IceCandidateError { code: u16, text: String },

    /// The remote peer announced a new track.
    TrackAdded(Track),

    TrackMuted(TrackId),

    TrackUnmuted(TrackId),

    TrackEnded(TrackId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceGatheringState {
    New,
    Gathering,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl IceConnectionState {
    /// Whether media can flow in this state.
    pub fn is_connected(&self) -> bool {
        matches!(self, IceConnectionState::Connected | IceConnectionState::Completed)
    }

    /// Whether the ICE agent has given up on the current transport.
    pub fn is_lost(&self) -> bool {
        matches!(
            self,
            IceConnectionState::Disconnected | IceConnectionState::Failed | IceConnectionState::Closed
        )
    }
}

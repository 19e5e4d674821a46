//! Data models for the signaling session
//!
//! This module contains the wire envelopes exchanged with the remote peer,
//! the media tracks attached to a connection, the events a peer connection
//! emits and the per-session bookkeeping types.

pub mod envelope;
pub mod event;
pub mod session;
pub mod tracks;

pub use envelope::{Envelope, IceCandidate, PointerEvent, PointerKind, SdpType, SessionDescription};
pub use event::{IceConnectionState, IceGatheringState, PeerEvent};
pub use session::{ConnectionState, SessionId, SessionInfo};
pub use tracks::{AudioTrackOptions, Track, TrackId, TrackKind, TrackOrigin, TrackState, VideoTrackOptions};

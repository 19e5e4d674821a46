//! Media engine collaborator
//!
//! The engine owns the native connection object: ICE, DTLS, SRTP and the
//! media pipelines all live behind [`EngineConnection`]. The rest of the crate
//! only drives it through these operations and listens to the events it
//! pushes onto the connection's [`EventSender`].
//!
//! [`rtc::Str0mEngine`] is the implementation used by the binaries.

pub mod rtc;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::event::EventSender;
use crate::model::{IceCandidate, SessionDescription, TrackId, TrackKind};

pub use rtc::Str0mEngine;

/// Options for answering a remote offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnswerOptions {
    pub offer_to_receive_audio: bool,
    pub offer_to_receive_video: bool,
}

impl Default for AnswerOptions {
    fn default() -> Self {
        AnswerOptions {
            offer_to_receive_audio: true,
            offer_to_receive_video: true,
        }
    }
}

/// Options for creating a local offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OfferOptions {
    pub receive_audio: bool,
    pub receive_video: bool,
}

impl Default for OfferOptions {
    fn default() -> Self {
        OfferOptions {
            receive_audio: true,
            receive_video: true,
        }
    }
}

/// Factory for native connections.
#[async_trait]
pub trait MediaEngine: Send + Sync + 'static {
    /// Creates a new native connection that reports its events on `events`.
    async fn connect(&self, events: EventSender) -> Result<Box<dyn EngineConnection>>;
}

/// One native connection object.
///
/// Calls are never issued concurrently on the same connection; the owning
/// handle serializes them.
#[async_trait]
pub trait EngineConnection: Send {
    async fn set_remote_description(&mut self, desc: SessionDescription) -> Result<()>;

    async fn create_offer(&mut self, options: OfferOptions) -> Result<SessionDescription>;

    async fn create_answer(&mut self, options: AnswerOptions) -> Result<SessionDescription>;

    async fn set_local_description(&mut self, desc: SessionDescription) -> Result<()>;

    /// `None` is the end-of-candidates marker.
    async fn add_ice_candidate(&mut self, candidate: Option<IceCandidate>) -> Result<()>;

    async fn add_track(&mut self, kind: TrackKind, label: String) -> Result<TrackId>;

    async fn remove_track(&mut self, id: TrackId) -> Result<()>;

    /// Releases all native resources. Must be safe to call more than once.
    async fn close(&mut self);
}

//! Peer connection handle
//!
//! [`PeerConnection`] owns one native engine connection and the receiving end
//! of its event channel. It tracks the negotiation phase so that calls the
//! engine would mishandle fail fast with a typed error instead:
//!
//! * `create_answer` needs a remote offer.
//! * Audio tracks must be attached before the first offer/answer exchange
//!   completes; afterwards `add_audio_track` fails with `UnsupportedOperation`.
//! * After `close` every operation fails with `InvalidState` and no further
//!   events are delivered.
//!
//! `set_local_description` strips bandwidth restrictions from the SDP before
//! committing it.

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::engine::{AnswerOptions, EngineConnection, MediaEngine, OfferOptions};
use crate::error::{Result, SignalingError};
use crate::model::event::{EventReceiver, PeerEvent};
use crate::model::{
    AudioTrackOptions, IceCandidate, SdpType, SessionDescription, SessionId, Track, TrackId, TrackKind,
    TrackOrigin, TrackState, VideoTrackOptions,
};
use crate::sdp::remove_bandwidth_restriction;

/// Where the offer/answer exchange currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SignalingPhase {
    /// No exchange in flight.
    Stable,
    HaveRemoteOffer,
    HaveLocalOffer,
    Closed,
}

pub struct PeerConnection {
    session: SessionId,
    engine: Box<dyn EngineConnection>,
    events: EventReceiver,
    phase: SignalingPhase,
    negotiated: bool,
    local: Option<SessionDescription>,
    tracks: Vec<Track>,
}

impl PeerConnection {
    /// Creates a native connection on `engine` for `session`.
    pub async fn open(session: SessionId, engine: &dyn MediaEngine) -> Result<PeerConnection> {
        let (tx, rx) = mpsc::unbounded_channel();
        let engine = engine.connect(tx).await?;
        debug!("Session({}) peer connection created", session);

        Ok(PeerConnection {
            session,
            engine,
            events: rx,
            phase: SignalingPhase::Stable,
            negotiated: false,
            local: None,
            tracks: vec![],
        })
    }

    pub fn is_closed(&self) -> bool {
        self.phase == SignalingPhase::Closed
    }

    /// Whether at least one offer/answer exchange has completed.
    pub fn is_negotiated(&self) -> bool {
        self.negotiated
    }

    pub fn local_description(&self) -> Option<&SessionDescription> {
        self.local.as_ref()
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn track(&self, id: TrackId) -> Option<&Track> {
        self.tracks.iter().find(|t| t.id == id)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(SignalingError::invalid_state("peer connection is closed"));
        }
        Ok(())
    }

    pub async fn set_remote_description(&mut self, desc: SessionDescription) -> Result<()> {
        self.ensure_open()?;

        let next = match (desc.kind, self.phase) {
            (SdpType::Offer, SignalingPhase::Stable) => SignalingPhase::HaveRemoteOffer,
            (SdpType::Answer, SignalingPhase::HaveLocalOffer) => SignalingPhase::Stable,
            (kind, phase) => {
                return Err(SignalingError::invalid_state(format!(
                    "cannot apply a remote {kind:?} while {phase:?}"
                )))
            }
        };

        let kind = desc.kind;
        self.engine.set_remote_description(desc).await?;

        if kind == SdpType::Answer {
            self.negotiated = true;
        }
        self.phase = next;
        Ok(())
    }

    pub async fn create_offer(&mut self, options: OfferOptions) -> Result<SessionDescription> {
        self.ensure_open()?;
        if self.phase != SignalingPhase::Stable {
            return Err(SignalingError::invalid_state(format!(
                "cannot create an offer while {:?}",
                self.phase
            )));
        }
        self.engine.create_offer(options).await
    }

    pub async fn create_answer(&mut self, options: AnswerOptions) -> Result<SessionDescription> {
        self.ensure_open()?;
        if self.phase != SignalingPhase::HaveRemoteOffer {
            return Err(SignalingError::invalid_state(
                "an answer needs a remote offer to be set first",
            ));
        }
        self.engine.create_answer(options).await
    }

    /// Commits `desc` as the local description, minus any `b=AS:`/`b=TIAS:`
    /// lines. Returns the description as committed.
    pub async fn set_local_description(&mut self, desc: SessionDescription) -> Result<SessionDescription> {
        self.ensure_open()?;

        let next = match (desc.kind, self.phase) {
            (SdpType::Answer, SignalingPhase::HaveRemoteOffer) => SignalingPhase::Stable,
            (SdpType::Offer, SignalingPhase::Stable) => SignalingPhase::HaveLocalOffer,
            (kind, phase) => {
                return Err(SignalingError::invalid_state(format!(
                    "cannot apply a local {kind:?} while {phase:?}"
                )))
            }
        };

        let desc = SessionDescription {
            kind: desc.kind,
            sdp: remove_bandwidth_restriction(&desc.sdp),
        };
        self.engine.set_local_description(desc.clone()).await?;

        if desc.kind == SdpType::Answer {
            self.negotiated = true;
        }
        self.phase = next;
        self.local = Some(desc.clone());
        Ok(desc)
    }

    /// Adds a remote candidate. `None` or an empty candidate line marks
    /// end-of-candidates.
    pub async fn add_ice_candidate(&mut self, candidate: Option<IceCandidate>) -> Result<()> {
        self.ensure_open()?;
        let candidate = candidate.filter(|c| !c.is_end_of_candidates());
        self.engine.add_ice_candidate(candidate).await
    }

    pub async fn add_audio_track(&mut self, options: AudioTrackOptions) -> Result<TrackId> {
        self.ensure_open()?;
        if self.negotiated {
            return Err(SignalingError::unsupported(
                "audio tracks must be added before the offer/answer exchange completes",
            ));
        }
        self.add_track(TrackKind::Audio, options.label).await
    }

    pub async fn add_video_track(&mut self, options: VideoTrackOptions) -> Result<TrackId> {
        self.ensure_open()?;
        debug!(
            "Session({}) video track '{}' capped at {} fps",
            self.session, options.label, options.max_frames_per_second
        );
        self.add_track(TrackKind::Video, options.label).await
    }

    async fn add_track(&mut self, kind: TrackKind, label: String) -> Result<TrackId> {
        let id = self.engine.add_track(kind, label.clone()).await?;
        info!("Session({}) attached {} track {} '{}'", self.session, kind, id, label);
        self.tracks.push(Track::new(id, kind, label, TrackOrigin::Local));
        Ok(id)
    }

    /// Detaches a local track. The track ends; remote tracks cannot be removed.
    pub async fn remove_track(&mut self, id: TrackId) -> Result<()> {
        self.ensure_open()?;
        match self.track(id) {
            Some(t) if t.origin == TrackOrigin::Local && !t.is_ended() => {}
            _ => {
                return Err(SignalingError::invalid_state(format!(
                    "no live local track {id}"
                )))
            }
        }

        self.engine.remove_track(id).await?;
        if let Some(track) = self.tracks.iter_mut().find(|t| t.id == id) {
            track.transition(TrackState::Ended);
        }
        info!("Session({}) detached track {}", self.session, id);
        Ok(())
    }

    /// Next engine event, `None` once the handle is closed or the engine has
    /// gone away. Cancel safe.
    pub async fn next_event(&mut self) -> Option<PeerEvent> {
        if self.is_closed() {
            return None;
        }
        let event = self.events.recv().await?;
        self.observe(&event);
        Some(event)
    }

    fn observe(&mut self, event: &PeerEvent) {
        let (id, next) = match event {
            PeerEvent::TrackAdded(track) => {
                self.tracks.push(track.clone());
                return;
            }
            PeerEvent::TrackMuted(id) => (id, TrackState::Muted),
            PeerEvent::TrackUnmuted(id) => (id, TrackState::Live),
            PeerEvent::TrackEnded(id) => (id, TrackState::Ended),
            _ => return,
        };
        if let Some(track) = self.tracks.iter_mut().find(|t| t.id == *id) {
            track.transition(next);
        }
    }

    /// Releases the native connection. Closing twice is a no-op.
    pub async fn close(&mut self) {
        if self.is_closed() {
            return;
        }
        self.phase = SignalingPhase::Closed;
        self.engine.close().await;
        self.events.close();
        for track in &mut self.tracks {
            track.transition(TrackState::Ended);
        }
        info!("Session({}) peer connection closed", self.session);
    }
}

//! Testing utilities
//!
//! [`FakeEngine`] is an in-process [`MediaEngine`] that answers every offer
//! with a fixed SDP and records each call it receives, so tests can drive the
//! peer connection, coordinator and supervisor without sockets.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::engine::{AnswerOptions, EngineConnection, MediaEngine, OfferOptions};
use crate::error::{Result, SignalingError};
use crate::model::event::{EventSender, PeerEvent};
use crate::model::{IceCandidate, SdpType, SessionDescription, TrackId, TrackKind};

/// Offer a browser would send, bandwidth lines included.
pub const BROWSER_OFFER: &str = "v=0\r\n\
o=- 5011297539410476138 2 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
a=group:BUNDLE 0 1\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
c=IN IP4 0.0.0.0\r\n\
b=AS:30\r\n\
a=mid:0\r\n\
a=recvonly\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
c=IN IP4 0.0.0.0\r\n\
b=AS:30\r\n\
a=mid:1\r\n\
a=recvonly\r\n";

/// Unfiltered answer returned by [`FakeEngine`] unless configured otherwise.
pub const ENGINE_ANSWER: &str = "v=0\r\n\
o=- 1 2 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
a=group:BUNDLE 0 1\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
c=IN IP4 0.0.0.0\r\n\
b=AS:30\r\n\
b=TIAS:30000\r\n\
a=mid:0\r\n\
a=sendonly\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
c=IN IP4 0.0.0.0\r\n\
b=AS:2000\r\n\
a=mid:1\r\n\
a=sendonly\r\n";

/// A host candidate line as browsers trickle it.
pub const HOST_CANDIDATE: &str =
    "candidate:842163049 1 udp 1677729535 192.168.1.20 50000 typ host generation 0";

#[derive(Debug, Clone)]
pub struct FakeEngineConfig {
    pub offer_sdp: String,
    pub answer_sdp: String,
    /// Fail `add_ice_candidate` with `InvalidCandidate` until a remote
    /// description is set, like engines that do not buffer early candidates.
    pub reject_early_candidates: bool,
    /// Fail `create_answer` with an engine error.
    pub fail_answer: bool,
    /// Fail `connect` itself.
    pub fail_connect: bool,
    /// Stall `connect` this long before the connection exists.
    pub connect_delay: Option<Duration>,
}

impl Default for FakeEngineConfig {
    fn default() -> Self {
        FakeEngineConfig {
            offer_sdp: BROWSER_OFFER.to_string(),
            answer_sdp: ENGINE_ANSWER.to_string(),
            reject_early_candidates: false,
            fail_answer: false,
            fail_connect: false,
            connect_delay: None,
        }
    }
}

/// One call as the engine saw it.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineCall {
    SetRemote(SessionDescription),
    CreateOffer(OfferOptions),
    CreateAnswer(AnswerOptions),
    SetLocal(SessionDescription),
    AddCandidate(Option<IceCandidate>),
    AddTrack(TrackKind, String),
    RemoveTrack(TrackId),
    Close,
}

#[derive(Clone, Default)]
pub struct FakeEngine {
    config: FakeEngineConfig,
    connections: Arc<Mutex<Vec<FakeConnectionView>>>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: FakeEngineConfig) -> Self {
        FakeEngine {
            config,
            connections: Arc::default(),
        }
    }

    /// Views of every connection created so far, oldest first.
    pub fn connections(&self) -> Vec<FakeConnectionView> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn last_connection(&self) -> Option<FakeConnectionView> {
        self.connections().pop()
    }
}

#[async_trait]
impl MediaEngine for FakeEngine {
    async fn connect(&self, events: EventSender) -> Result<Box<dyn EngineConnection>> {
        if let Some(delay) = self.config.connect_delay {
            tokio::time::sleep(delay).await;
        }
        if self.config.fail_connect {
            return Err(SignalingError::Engine("connect refused".into()));
        }

        let conn = FakeConnectionView {
            state: Arc::new(Mutex::new(ViewState {
                calls: vec![],
                closed: false,
                events: Some(events),
            })),
        };
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(conn.clone());

        Ok(Box::new(FakeConnection {
            config: self.config.clone(),
            conn,
            remote: None,
            tracks: vec![],
            next_track: 0,
        }))
    }
}

/// Test-side view of one fake connection.
#[derive(Clone)]
pub struct FakeConnectionView {
    state: Arc<Mutex<ViewState>>,
}

struct ViewState {
    calls: Vec<EngineCall>,
    closed: bool,
    events: Option<EventSender>,
}

impl FakeConnectionView {
    fn lock(&self) -> MutexGuard<'_, ViewState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.lock().calls.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Pushes an engine event. Returns `false` once the connection closed.
    pub fn emit(&self, event: PeerEvent) -> bool {
        match &self.lock().events {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    /// The last description passed to `set_local_description`.
    pub fn local_description(&self) -> Option<SessionDescription> {
        self.lock().calls.iter().rev().find_map(|c| match c {
            EngineCall::SetLocal(desc) => Some(desc.clone()),
            _ => None,
        })
    }
}

struct FakeConnection {
    config: FakeEngineConfig,
    conn: FakeConnectionView,
    remote: Option<SdpType>,
    tracks: Vec<TrackId>,
    next_track: u64,
}

impl FakeConnection {
    fn record(&self, call: EngineCall) -> Result<()> {
        let mut state = self.conn.lock();
        if state.closed {
            return Err(SignalingError::invalid_state("fake connection closed"));
        }
        state.calls.push(call);
        Ok(())
    }
}

#[async_trait]
impl EngineConnection for FakeConnection {
    async fn set_remote_description(&mut self, desc: SessionDescription) -> Result<()> {
        self.record(EngineCall::SetRemote(desc.clone()))?;
        if !desc.sdp.starts_with("v=0") {
            return Err(SignalingError::Engine("malformed SDP".into()));
        }
        self.remote = Some(desc.kind);
        Ok(())
    }

    async fn create_offer(&mut self, options: OfferOptions) -> Result<SessionDescription> {
        self.record(EngineCall::CreateOffer(options))?;
        Ok(SessionDescription::offer(self.config.offer_sdp.clone()))
    }

    async fn create_answer(&mut self, options: AnswerOptions) -> Result<SessionDescription> {
        self.record(EngineCall::CreateAnswer(options))?;
        if self.remote != Some(SdpType::Offer) {
            return Err(SignalingError::invalid_state("no remote offer"));
        }
        if self.config.fail_answer {
            return Err(SignalingError::Engine("answer failed".into()));
        }
        Ok(SessionDescription::answer(self.config.answer_sdp.clone()))
    }

    async fn set_local_description(&mut self, desc: SessionDescription) -> Result<()> {
        self.record(EngineCall::SetLocal(desc))
    }

    async fn add_ice_candidate(&mut self, candidate: Option<IceCandidate>) -> Result<()> {
        self.record(EngineCall::AddCandidate(candidate.clone()))?;
        let Some(candidate) = candidate else {
            return Ok(());
        };
        if !candidate.candidate.starts_with("candidate:") {
            return Err(SignalingError::InvalidCandidate(candidate.candidate));
        }
        if self.config.reject_early_candidates && self.remote.is_none() {
            return Err(SignalingError::InvalidCandidate(
                "no remote description yet".into(),
            ));
        }
        Ok(())
    }

    async fn add_track(&mut self, kind: TrackKind, label: String) -> Result<TrackId> {
        self.record(EngineCall::AddTrack(kind, label))?;
        self.next_track += 1;
        let id = TrackId(self.next_track);
        self.tracks.push(id);
        Ok(id)
    }

    async fn remove_track(&mut self, id: TrackId) -> Result<()> {
        self.record(EngineCall::RemoveTrack(id))?;
        let i = self
            .tracks
            .iter()
            .position(|t| *t == id)
            .ok_or_else(|| SignalingError::invalid_state(format!("unknown track {id}")))?;
        self.tracks.remove(i);
        Ok(())
    }

    async fn close(&mut self) {
        let mut state = self.conn.lock();
        if state.closed {
            return;
        }
        state.calls.push(EngineCall::Close);
        state.closed = true;
        state.events = None;
    }
}

//! Negotiation coordinator
//!
//! A [`Coordinator`] pairs one signaling transport with one peer connection
//! for the lifetime of a client connection. Inbound envelopes, engine events,
//! control requests and the shutdown signal are consumed by a single
//! `select!` loop, so the offer/answer chain never interleaves with candidate
//! handling on the same connection.
//!
//! This side only ever answers. The remote peer always sends the offer, so
//! there is no glare to resolve.

use std::future::Future;

use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::engine::{AnswerOptions, MediaEngine};
use crate::error::{Result, SignalingError};
use crate::model::event::PeerEvent;
use crate::model::{
    AudioTrackOptions, ConnectionState, Envelope, IceCandidate, PointerEvent, SdpType, SessionDescription,
    SessionId, Track, TrackId, VideoTrackOptions,
};
use crate::peer::PeerConnection;
use crate::sdp::remove_bandwidth_restriction;
use crate::transport::SignalingTransport;

const CONTROL_QUEUE: usize = 16;

/// What a new session attaches and how it answers.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Audio track attached before the first envelope is read.
    pub audio: Option<AudioTrackOptions>,
    /// Video track attached before the first envelope is read.
    pub video: Option<VideoTrackOptions>,
    pub answer: AnswerOptions,
}

impl Default for SessionOptions {
    fn default() -> Self {
        SessionOptions {
            audio: Some(AudioTrackOptions::default()),
            video: Some(VideoTrackOptions::default()),
            answer: AnswerOptions::default(),
        }
    }
}

/// Pointer input routed to the application layer.
#[derive(Debug, Clone, PartialEq)]
pub struct PointerInput {
    pub session: SessionId,
    pub event: PointerEvent,
}

pub type PointerSender = mpsc::UnboundedSender<PointerInput>;

enum Control {
    AddAudioTrack(AudioTrackOptions, oneshot::Sender<Result<TrackId>>),
    AddVideoTrack(VideoTrackOptions, oneshot::Sender<Result<TrackId>>),
    RemoveTrack(TrackId, oneshot::Sender<Result<()>>),
    Tracks(oneshot::Sender<Result<Vec<Track>>>),
    Close,
}

/// How the loop continues after one input.
enum Flow {
    Continue,
    /// The transport or the media path went away: Disconnected, then Closed.
    Disconnect,
    /// Unrecoverable for this connection: straight to Closed.
    Fail(SignalingError),
}

/// Application-side handle to a running coordinator.
///
/// Requests are queued on the coordinator's own event loop. Once the
/// coordinator has closed they fail with `InvalidState`; `close` becomes a
/// no-op.
#[derive(Clone)]
pub struct CoordinatorHandle {
    id: SessionId,
    state: watch::Receiver<ConnectionState>,
    control: mpsc::Sender<Control>,
}

impl CoordinatorHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Resolves once the coordinator reached `Closed`.
    pub async fn closed(&self) {
        let mut state = self.state.clone();
        let _ = state.wait_for(ConnectionState::is_closed).await;
    }

    /// Resolves once the coordinator reached `state` (or closed).
    pub async fn reached(&self, wanted: ConnectionState) -> ConnectionState {
        let mut state = self.state.clone();
        let reached = match state.wait_for(|s| *s == wanted || s.is_closed()).await {
            Ok(s) => *s,
            Err(_) => ConnectionState::Closed,
        };
        reached
    }

    pub async fn add_audio_track(&self, options: AudioTrackOptions) -> Result<TrackId> {
        self.request(|reply| Control::AddAudioTrack(options, reply)).await
    }

    pub async fn add_video_track(&self, options: VideoTrackOptions) -> Result<TrackId> {
        self.request(|reply| Control::AddVideoTrack(options, reply)).await
    }

    pub async fn remove_track(&self, id: TrackId) -> Result<()> {
        self.request(|reply| Control::RemoveTrack(id, reply)).await
    }

    pub async fn tracks(&self) -> Result<Vec<Track>> {
        self.request(Control::Tracks).await
    }

    pub async fn close(&self) {
        let _ = self.control.send(Control::Close).await;
    }

    async fn request<R>(&self, make: impl FnOnce(oneshot::Sender<Result<R>>) -> Control) -> Result<R> {
        let (tx, rx) = oneshot::channel();
        self.control
            .send(make(tx))
            .await
            .map_err(|_| SignalingError::invalid_state("session closed"))?;
        rx.await
            .map_err(|_| SignalingError::invalid_state("session closed"))?
    }
}

pub struct Coordinator<T: SignalingTransport> {
    id: SessionId,
    transport: T,
    peer: PeerConnection,
    state: watch::Sender<ConnectionState>,
    control: mpsc::Receiver<Control>,
    cancel: CancellationToken,
    pointer: Option<PointerSender>,
    options: SessionOptions,
}

impl<T: SignalingTransport> Coordinator<T> {
    /// Sets up a session for a freshly accepted transport: creates the peer
    /// connection, attaches the configured tracks and moves to `Negotiating`.
    ///
    /// On failure or cancellation the transport is closed before the error
    /// is returned.
    pub async fn open(
        id: SessionId,
        mut transport: T,
        engine: &dyn MediaEngine,
        options: SessionOptions,
        cancel: CancellationToken,
        pointer: Option<PointerSender>,
    ) -> Result<(Coordinator<T>, CoordinatorHandle)> {
        let (state, state_rx) = watch::channel(ConnectionState::New);

        let mut peer = match until_cancelled(&cancel, PeerConnection::open(id, engine)).await {
            Ok(peer) => peer,
            Err(e) => {
                transport.close().await;
                return Err(e);
            }
        };

        if let Err(e) = until_cancelled(&cancel, attach_tracks(&mut peer, &options)).await {
            peer.close().await;
            transport.close().await;
            return Err(e);
        }

        state.send_replace(ConnectionState::Negotiating);

        let (control_tx, control_rx) = mpsc::channel(CONTROL_QUEUE);
        let handle = CoordinatorHandle {
            id,
            state: state_rx,
            control: control_tx,
        };

        Ok((
            Coordinator {
                id,
                transport,
                peer,
                state,
                control: control_rx,
                cancel,
                pointer,
                options,
            },
            handle,
        ))
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Runs the session until it is `Closed` and returns that state.
    pub async fn run(mut self) -> ConnectionState {
        info!("Session({}) negotiating", self.id);

        loop {
            let flow = tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    info!("Session({}) shutdown requested", self.id);
                    Flow::Fail(SignalingError::Cancelled)
                }

                inbound = self.transport.recv() => match inbound {
                    Some(Ok(envelope)) => self.handle_envelope(envelope).await,
                    Some(Err(e)) if !e.is_fatal() => {
                        warn!("Session({}) dropping malformed message: {}", self.id, e);
                        Flow::Continue
                    }
                    Some(Err(e)) => {
                        info!("Session({}) transport read failed: {}", self.id, e);
                        Flow::Disconnect
                    }
                    None => {
                        info!("Session({}) transport closed", self.id);
                        Flow::Disconnect
                    }
                },

                event = self.peer.next_event() => match event {
                    Some(event) => self.handle_peer_event(event).await,
                    None => {
                        warn!("Session({}) media engine stopped", self.id);
                        Flow::Disconnect
                    }
                },

                Some(control) = self.control.recv() => self.handle_control(control).await,
            };

            match flow {
                Flow::Continue => continue,
                Flow::Disconnect => {
                    self.set_state(ConnectionState::Disconnected);
                    self.release().await;
                }
                Flow::Fail(SignalingError::Cancelled) => self.release().await,
                Flow::Fail(e) => {
                    error!("Session({}) closing after fatal error: {}", self.id, e);
                    self.release().await;
                }
            }
            break;
        }

        self.state()
    }

    async fn handle_envelope(&mut self, envelope: Envelope) -> Flow {
        debug!("Session({}) received {}", self.id, envelope.action());

        match envelope {
            Envelope::Sdp(offer) => match self.answer(offer).await {
                Ok(()) => Flow::Continue,
                Err(e) => Flow::Fail(e),
            },
            Envelope::Ice(candidate) => {
                self.add_remote_candidate(candidate).await;
                Flow::Continue
            }
            Envelope::Pos(event) => {
                self.route_pointer(event);
                Flow::Continue
            }
        }
    }

    /// setRemoteDescription → createAnswer → filter → setLocalDescription →
    /// send. Any failure ends the connection.
    async fn answer(&mut self, offer: SessionDescription) -> Result<()> {
        if offer.kind != SdpType::Offer {
            return Err(SignalingError::invalid_state(
                "remote sent an answer; this side never offers",
            ));
        }

        let cancel = self.cancel.clone();

        until_cancelled(&cancel, self.peer.set_remote_description(offer)).await?;
        debug!("Session({}) setRemoteDescription", self.id);

        let answer = until_cancelled(&cancel, self.peer.create_answer(self.options.answer)).await?;
        debug!("Session({}) createAnswer", self.id);

        let answer = SessionDescription {
            kind: answer.kind,
            sdp: remove_bandwidth_restriction(&answer.sdp),
        };
        let answer = until_cancelled(&cancel, self.peer.set_local_description(answer)).await?;
        debug!("Session({}) setLocalDescription", self.id);

        // the remote may have hung up while the chain ran
        if self.transport.is_closed().await {
            return Err(SignalingError::TransportClosed);
        }
        until_cancelled(&cancel, self.transport.send(&Envelope::Sdp(answer))).await?;
        info!("Session({}) answer sent", self.id);
        Ok(())
    }

    async fn add_remote_candidate(&mut self, candidate: Option<IceCandidate>) {
        match self.peer.add_ice_candidate(candidate).await {
            Ok(()) => debug!("Session({}) addIceCandidate", self.id),
            Err(e) => warn!("Session({}) ignoring remote candidate: {}", self.id, e),
        }
    }

    fn route_pointer(&self, event: PointerEvent) {
        let input = PointerInput {
            session: self.id,
            event,
        };
        let delivered = match &self.pointer {
            Some(tx) => tx.send(input).is_ok(),
            None => false,
        };
        if !delivered {
            debug!("Session({}) no pointer consumer, dropping {:?}", self.id, event);
        }
    }

    async fn handle_peer_event(&mut self, event: PeerEvent) -> Flow {
        match event {
            PeerEvent::IceCandidate(candidate) => {
                match self.transport.send(&Envelope::Ice(candidate)).await {
                    Ok(()) => Flow::Continue,
                    Err(e) if e.is_fatal() => {
                        info!("Session({}) transport lost: {}", self.id, e);
                        Flow::Disconnect
                    }
                    Err(e) => {
                        warn!("Session({}) could not forward local candidate: {}", self.id, e);
                        Flow::Continue
                    }
                }
            }
            PeerEvent::IceConnectionStateChanged(ice) => {
                info!("Session({}) ice connection state = {:?}", self.id, ice);
                if ice.is_connected() {
                    self.set_state(ConnectionState::Connected);
                    Flow::Continue
                } else if ice.is_lost() {
                    Flow::Disconnect
                } else {
                    Flow::Continue
                }
            }
            PeerEvent::IceGatheringStateChanged(gathering) => {
                info!("Session({}) ice gathering state = {:?}", self.id, gathering);
                Flow::Continue
            }
            PeerEvent::IceCandidateError { code, text } => {
                warn!("Session({}) ice candidate error = {}#{}", self.id, text, code);
                Flow::Continue
            }
            PeerEvent::TrackAdded(track) => {
                info!(
                    "Session({}) received {} track {} '{}'",
                    self.id, track.kind, track.id, track.label
                );
                Flow::Continue
            }
            PeerEvent::TrackMuted(id) => {
                info!("Session({}) track {} muted", self.id, id);
                Flow::Continue
            }
            PeerEvent::TrackUnmuted(id) => {
                info!("Session({}) track {} unmuted", self.id, id);
                Flow::Continue
            }
            PeerEvent::TrackEnded(id) => {
                info!("Session({}) track {} ended", self.id, id);
                Flow::Continue
            }
        }
    }

    async fn handle_control(&mut self, control: Control) -> Flow {
        match control {
            Control::AddAudioTrack(options, reply) => {
                let result = self.peer.add_audio_track(options).await;
                if let Err(e) = &result {
                    warn!("Session({}) audio track rejected: {}", self.id, e);
                }
                let _ = reply.send(result);
            }
            Control::AddVideoTrack(options, reply) => {
                let result = self.peer.add_video_track(options).await;
                if let Err(e) = &result {
                    warn!("Session({}) video track rejected: {}", self.id, e);
                }
                let _ = reply.send(result);
            }
            Control::RemoveTrack(id, reply) => {
                let _ = reply.send(self.peer.remove_track(id).await);
            }
            Control::Tracks(reply) => {
                let _ = reply.send(Ok(self.peer.tracks().to_vec()));
            }
            Control::Close => {
                info!("Session({}) close requested", self.id);
                return Flow::Fail(SignalingError::Cancelled);
            }
        }
        Flow::Continue
    }

    /// Moves to `next` unless already there or closed.
    fn set_state(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|state| {
            if *state == next || state.is_closed() {
                return false;
            }
            *state = next;
            true
        });
        if changed {
            info!("Session({}) {:?}", self.id, next);
        }
    }

    /// Closes the handle, then the transport, then marks the session closed.
    async fn release(&mut self) {
        if self.state().is_closed() {
            return;
        }
        self.peer.close().await;
        self.transport.close().await;
        self.set_state(ConnectionState::Closed);
    }
}

async fn attach_tracks(peer: &mut PeerConnection, options: &SessionOptions) -> Result<()> {
    if let Some(audio) = &options.audio {
        peer.add_audio_track(audio.clone()).await?;
    }
    if let Some(video) = &options.video {
        peer.add_video_track(video.clone()).await?;
    }
    Ok(())
}

/// Runs `fut` unless `cancel` fires first.
async fn until_cancelled<F, R>(cancel: &CancellationToken, fut: F) -> Result<R>
where
    F: Future<Output = Result<R>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SignalingError::Cancelled),
        result = fut => result,
    }
}

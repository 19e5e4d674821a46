//! str0m-backed media engine
//!
//! Every connection gets its own [`Rtc`] instance, one UDP socket bound to the
//! host address and a tokio task that drives both. The task owns the `Rtc`
//! exclusively; [`Str0mConnection`] talks to it over a command channel with
//! oneshot replies, so engine calls are never reentrant.

use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use async_trait::async_trait;
use str0m::change::{SdpAnswer, SdpOffer, SdpPendingOffer};
use str0m::media::{Direction, MediaAdded, MediaKind, Mid};
use str0m::net::{Protocol, Receive};
use str0m::{Candidate, Event, Input, Output, Rtc};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::{AnswerOptions, EngineConnection, MediaEngine, OfferOptions};
use crate::error::{Result, SignalingError};
use crate::model::event::{EventSender, IceConnectionState, IceGatheringState, PeerEvent};
use crate::model::{IceCandidate, SdpType, SessionDescription, Track, TrackId, TrackKind, TrackOrigin, TrackState};

/// ICE candidate error code browsers use for STUN/TURN failures.
const ICE_SOCKET_ERROR: u16 = 701;

const COMMAND_QUEUE: usize = 32;

/// Engine that creates one str0m [`Rtc`] per connection.
#[derive(Debug, Clone)]
pub struct Str0mEngine {
    host: IpAddr,
}

impl Str0mEngine {
    /// `host` is the address advertised as the host ICE candidate.
    pub fn new(host: IpAddr) -> Self {
        Str0mEngine { host }
    }
}

#[async_trait]
impl MediaEngine for Str0mEngine {
    async fn connect(&self, events: EventSender) -> Result<Box<dyn EngineConnection>> {
        let socket = UdpSocket::bind(SocketAddr::new(self.host, 0)).await?;
        let local_addr = socket.local_addr()?;
        info!("Bound UDP port: {}", local_addr);

        let mut rtc = Rtc::builder().build();

        let candidate = Candidate::host(local_addr, "udp")
            .map_err(|e| SignalingError::Engine(format!("host candidate: {e}")))?;
        let advertised = candidate.to_sdp_string();
        rtc.add_local_candidate(candidate);

        let (tx, rx) = mpsc::channel(COMMAND_QUEUE);

        let driver = Driver {
            rtc,
            socket,
            local_addr,
            commands: rx,
            events,
            candidates: vec![advertised],
            candidates_sent: false,
            remote_offer: None,
            pending_offer: None,
            negotiated: false,
            local: vec![],
            free_mids: vec![],
            remote: vec![],
            next_track: 0,
            buf: vec![0; 2000],
        };
        tokio::spawn(driver.run());

        Ok(Box::new(Str0mConnection {
            commands: tx,
            closed: false,
        }))
    }
}

type Reply<T> = oneshot::Sender<Result<T>>;

enum Command {
    SetRemote(SessionDescription, Reply<()>),
    CreateOffer(OfferOptions, Reply<SessionDescription>),
    CreateAnswer(AnswerOptions, Reply<SessionDescription>),
    SetLocal(SessionDescription, Reply<()>),
    AddCandidate(Option<IceCandidate>, Reply<()>),
    AddTrack(TrackKind, String, Reply<TrackId>),
    RemoveTrack(TrackId, Reply<()>),
    Close(oneshot::Sender<()>),
}

/// Proxy for one driver task.
pub struct Str0mConnection {
    commands: mpsc::Sender<Command>,
    closed: bool,
}

impl Str0mConnection {
    async fn call<T, F>(&self, make: F) -> Result<T>
    where
        F: FnOnce(Reply<T>) -> Command + Send,
        T: Send,
    {
        if self.closed {
            return Err(SignalingError::invalid_state("native connection closed"));
        }
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| SignalingError::invalid_state("native connection is gone"))?;
        rx.await
            .map_err(|_| SignalingError::invalid_state("native connection is gone"))?
    }
}

#[async_trait]
impl EngineConnection for Str0mConnection {
    async fn set_remote_description(&mut self, desc: SessionDescription) -> Result<()> {
        self.call(|r| Command::SetRemote(desc, r)).await
    }

    async fn create_offer(&mut self, options: OfferOptions) -> Result<SessionDescription> {
        self.call(|r| Command::CreateOffer(options, r)).await
    }

    async fn create_answer(&mut self, options: AnswerOptions) -> Result<SessionDescription> {
        self.call(|r| Command::CreateAnswer(options, r)).await
    }

    async fn set_local_description(&mut self, desc: SessionDescription) -> Result<()> {
        self.call(|r| Command::SetLocal(desc, r)).await
    }

    async fn add_ice_candidate(&mut self, candidate: Option<IceCandidate>) -> Result<()> {
        self.call(|r| Command::AddCandidate(candidate, r)).await
    }

    async fn add_track(&mut self, kind: TrackKind, label: String) -> Result<TrackId> {
        self.call(|r| Command::AddTrack(kind, label, r)).await
    }

    async fn remove_track(&mut self, id: TrackId) -> Result<()> {
        self.call(|r| Command::RemoveTrack(id, r)).await
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Close(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }
}

/// A track attached by this side, bound to a media line once one is negotiated.
struct LocalTrack {
    id: TrackId,
    kind: TrackKind,
    label: String,
    mid: Option<Mid>,
}

struct Driver {
    rtc: Rtc,
    socket: UdpSocket,
    local_addr: SocketAddr,
    commands: mpsc::Receiver<Command>,
    events: EventSender,
    candidates: Vec<String>,
    candidates_sent: bool,
    remote_offer: Option<SdpOffer>,
    pending_offer: Option<SdpPendingOffer>,
    negotiated: bool,
    local: Vec<LocalTrack>,
    /// Negotiated media lines we may send on that carry no local track yet.
    free_mids: Vec<(Mid, TrackKind)>,
    remote: Vec<(Mid, Track)>,
    next_track: u64,
    buf: Vec<u8>,
}

impl Driver {
    async fn run(mut self) {
        let closed_by_owner = loop {
            // Drain transmits and events, then wait for whichever comes first:
            // a command, a datagram or the next str0m timeout.
            let Some(timeout) = self.poll_until_timeout().await else {
                break false;
            };
            let deadline = tokio::time::Instant::from_std(timeout);

            // Scale up buffer to receive an entire UDP packet.
            self.buf.resize(2000, 0);

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Close(done)) => {
                        self.rtc.disconnect();
                        let _ = done.send(());
                        break true;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        self.rtc.disconnect();
                        break true;
                    }
                },
                received = self.socket.recv_from(&mut self.buf) => match received {
                    Ok((n, source)) => {
                        // Parse data to a DatagramRecv, which help preparse network data to
                        // figure out the multiplexing of all protocols on one UDP port.
                        let datagram: &[u8] = &self.buf[..n];
                        let Ok(contents) = datagram.try_into() else {
                            debug!("Dropping unparseable datagram from {}", source);
                            continue;
                        };
                        let input = Input::Receive(
                            Instant::now(),
                            Receive {
                                proto: Protocol::Udp,
                                source,
                                destination: self.local_addr,
                                contents,
                            },
                        );
                        if let Err(e) = self.rtc.handle_input(input) {
                            warn!("Rtc rejected input, disconnecting: {:?}", e);
                            self.rtc.disconnect();
                        }
                    }
                    // Windows reports ICMP port unreachable as a reset on the next read.
                    Err(e) if e.kind() == ErrorKind::ConnectionReset => {
                        debug!("UDP read reset: {}", e);
                    }
                    Err(e) => {
                        warn!("UdpSocket read failed: {:?}", e);
                        self.rtc.disconnect();
                    }
                },
                _ = tokio::time::sleep_until(deadline) => {
                    if let Err(e) = self.rtc.handle_input(Input::Timeout(Instant::now())) {
                        warn!("Rtc timeout handling failed: {:?}", e);
                        self.rtc.disconnect();
                    }
                }
            }
        };

        if !closed_by_owner {
            self.end_remote_tracks();
        }
        debug!("Rtc driver on {} stopped", self.local_addr);
    }

    /// Poll all the output from the rtc until it returns a timeout.
    /// Returns `None` once the rtc is no longer alive.
    async fn poll_until_timeout(&mut self) -> Option<Instant> {
        loop {
            if !self.rtc.is_alive() {
                return None;
            }

            match self.rtc.poll_output() {
                Ok(Output::Timeout(t)) => return Some(t),
                Ok(Output::Transmit(transmit)) => {
                    if let Err(e) = self
                        .socket
                        .send_to(&transmit.contents, transmit.destination)
                        .await
                    {
                        self.emit(PeerEvent::IceCandidateError {
                            code: ICE_SOCKET_ERROR,
                            text: e.to_string(),
                        });
                    }
                }
                Ok(Output::Event(event)) => self.handle_event(event),
                Err(e) => {
                    warn!("Rtc poll_output failed: {:?}", e);
                    self.rtc.disconnect();
                    return None;
                }
            }
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::IceConnectionStateChange(state) => {
                info!("ICE connection state = {:?}", state);
                self.emit(PeerEvent::IceConnectionStateChanged(ice_state(state)));
            }
            Event::MediaAdded(media) => self.handle_media_added(media),
            Event::StreamPaused(paused) => {
                let Some((_, track)) = self.remote.iter_mut().find(|(m, _)| *m == paused.mid) else {
                    return;
                };
                let (next, event) = if paused.paused {
                    (TrackState::Muted, PeerEvent::TrackMuted(track.id))
                } else {
                    (TrackState::Live, PeerEvent::TrackUnmuted(track.id))
                };
                track.transition(next);
                self.emit(event);
            }
            // Decoding incoming media is left to the application pipeline.
            Event::MediaData(_) => {}
            Event::Connected => info!("Rtc connected"),
            other => debug!("Event: {:?}", other),
        }
    }

    fn handle_media_added(&mut self, media: MediaAdded) {
        let kind = track_kind(media.kind);

        if matches!(media.direction, Direction::SendOnly | Direction::SendRecv) {
            let already_bound = self.local.iter().any(|t| t.mid == Some(media.mid));
            if !already_bound {
                match self.local.iter_mut().find(|t| t.kind == kind && t.mid.is_none()) {
                    Some(track) => {
                        info!("Local {} track {} '{}' bound to {:?}", kind, track.id, track.label, media.mid);
                        track.mid = Some(media.mid);
                    }
                    None => self.free_mids.push((media.mid, kind)),
                }
            }
        }

        if matches!(media.direction, Direction::RecvOnly | Direction::SendRecv) {
            let id = self.next_track_id();
            let track = Track::new(id, kind, format!("remote-{kind}-{}", id.0), TrackOrigin::Remote);
            self.remote.push((media.mid, track.clone()));
            self.emit(PeerEvent::TrackAdded(track));
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::SetRemote(desc, reply) => {
                let _ = reply.send(self.set_remote(desc));
            }
            Command::CreateOffer(options, reply) => {
                let _ = reply.send(self.create_offer(options));
            }
            Command::CreateAnswer(options, reply) => {
                let _ = reply.send(self.create_answer(options));
            }
            Command::SetLocal(desc, reply) => {
                // str0m commits the local side while accepting the offer or
                // applying the change; nothing is left to apply here.
                debug!("Local {:?} committed ({} bytes)", desc.kind, desc.sdp.len());
                let _ = reply.send(Ok(()));
            }
            Command::AddCandidate(candidate, reply) => {
                let _ = reply.send(self.add_candidate(candidate));
            }
            Command::AddTrack(kind, label, reply) => {
                let _ = reply.send(self.add_track(kind, label));
            }
            Command::RemoveTrack(id, reply) => {
                let _ = reply.send(self.remove_track(id));
            }
            // Intercepted by the run loop before dispatch.
            Command::Close(done) => {
                let _ = done.send(());
            }
        }
    }

    fn set_remote(&mut self, desc: SessionDescription) -> Result<()> {
        match desc.kind {
            SdpType::Offer => {
                let offer = SdpOffer::from_sdp_string(&desc.sdp)
                    .map_err(|e| SignalingError::Engine(format!("malformed offer: {e}")))?;
                self.remote_offer = Some(offer);
                Ok(())
            }
            SdpType::Answer => {
                let pending = self
                    .pending_offer
                    .take()
                    .ok_or_else(|| SignalingError::invalid_state("answer without a local offer"))?;
                let answer = SdpAnswer::from_sdp_string(&desc.sdp)
                    .map_err(|e| SignalingError::Engine(format!("malformed answer: {e}")))?;
                self.rtc
                    .sdp_api()
                    .accept_answer(pending, answer)
                    .map_err(|e| SignalingError::Engine(format!("answer rejected: {e}")))?;
                self.negotiated = true;
                Ok(())
            }
        }
    }

    fn create_offer(&mut self, options: OfferOptions) -> Result<SessionDescription> {
        let mut change = self.rtc.sdp_api();

        for kind in [TrackKind::Audio, TrackKind::Video] {
            let receive = match kind {
                TrackKind::Audio => options.receive_audio,
                TrackKind::Video => options.receive_video,
            };
            let track = self.local.iter_mut().find(|t| t.kind == kind && t.mid.is_none());
            let direction = match (&track, receive) {
                (Some(_), true) => Direction::SendRecv,
                (Some(_), false) => Direction::SendOnly,
                (None, true) => Direction::RecvOnly,
                (None, false) => continue,
            };
            let mid = change.add_media(media_kind(kind), direction, None, None, None);
            if let Some(track) = track {
                track.mid = Some(mid);
            }
        }

        let (offer, pending) = change
            .apply()
            .ok_or_else(|| SignalingError::invalid_state("nothing to offer"))?;
        self.pending_offer = Some(pending);
        self.announce_candidates();

        Ok(SessionDescription::offer(offer.to_sdp_string()))
    }

    fn create_answer(&mut self, options: AnswerOptions) -> Result<SessionDescription> {
        let offer = self
            .remote_offer
            .take()
            .ok_or_else(|| SignalingError::invalid_state("no remote offer to answer"))?;

        // The answer mirrors every media line of the offer; the options only
        // matter to engines that can add receive-only lines of their own.
        debug!("Answering with {:?}", options);

        let answer = self
            .rtc
            .sdp_api()
            .accept_offer(offer)
            .map_err(|e| SignalingError::Engine(format!("offer rejected: {e}")))?;
        self.negotiated = true;
        self.announce_candidates();

        Ok(SessionDescription::answer(answer.to_sdp_string()))
    }

    fn add_candidate(&mut self, candidate: Option<IceCandidate>) -> Result<()> {
        let Some(candidate) = candidate.filter(|c| !c.is_end_of_candidates()) else {
            debug!("Remote end-of-candidates");
            return Ok(());
        };

        let line = candidate.candidate.trim();
        let line = line.strip_prefix("a=").unwrap_or(line);
        let parsed = Candidate::from_sdp_string(line)
            .map_err(|e| SignalingError::InvalidCandidate(format!("{line}: {e}")))?;
        self.rtc.add_remote_candidate(parsed);
        Ok(())
    }

    fn add_track(&mut self, kind: TrackKind, label: String) -> Result<TrackId> {
        let mid = match self.free_mids.iter().position(|(_, k)| *k == kind) {
            Some(i) => Some(self.free_mids.remove(i).0),
            None if self.negotiated => {
                return Err(SignalingError::unsupported(format!(
                    "no negotiated {kind} media line left to carry a new track"
                )))
            }
            None => None,
        };

        let id = self.next_track_id();
        self.local.push(LocalTrack { id, kind, label, mid });
        Ok(id)
    }

    fn remove_track(&mut self, id: TrackId) -> Result<()> {
        let i = self
            .local
            .iter()
            .position(|t| t.id == id)
            .ok_or_else(|| SignalingError::invalid_state(format!("unknown track {id}")))?;
        let track = self.local.remove(i);
        if let Some(mid) = track.mid {
            self.free_mids.push((mid, track.kind));
        }
        Ok(())
    }

    /// Host candidates are known up front; they are trickled once the first
    /// description exists so the remote side can match them to it.
    fn announce_candidates(&mut self) {
        if self.candidates_sent {
            return;
        }
        self.candidates_sent = true;

        self.emit(PeerEvent::IceGatheringStateChanged(IceGatheringState::Gathering));
        for line in self.candidates.clone() {
            self.emit(PeerEvent::IceCandidate(Some(IceCandidate::new(line))));
        }
        self.emit(PeerEvent::IceGatheringStateChanged(IceGatheringState::Complete));
        self.emit(PeerEvent::IceCandidate(None));
    }

    fn end_remote_tracks(&mut self) {
        let ended: Vec<TrackId> = self
            .remote
            .iter_mut()
            .filter(|(_, t)| !t.is_ended())
            .map(|(_, t)| {
                t.transition(TrackState::Ended);
                t.id
            })
            .collect();
        for id in ended {
            self.emit(PeerEvent::TrackEnded(id));
        }
        self.emit(PeerEvent::IceConnectionStateChanged(IceConnectionState::Closed));
    }

    fn next_track_id(&mut self) -> TrackId {
        self.next_track += 1;
        TrackId(self.next_track)
    }

    fn emit(&self, event: PeerEvent) {
        // The receiver is gone once the handle closed; late events are dropped.
        let _ = self.events.send(event);
    }
}

fn ice_state(state: str0m::IceConnectionState) -> IceConnectionState {
    match state {
        str0m::IceConnectionState::New => IceConnectionState::New,
        str0m::IceConnectionState::Checking => IceConnectionState::Checking,
        str0m::IceConnectionState::Connected => IceConnectionState::Connected,
        str0m::IceConnectionState::Completed => IceConnectionState::Completed,
        str0m::IceConnectionState::Disconnected => IceConnectionState::Disconnected,
    }
}

fn track_kind(kind: MediaKind) -> TrackKind {
    match kind {
        MediaKind::Audio => TrackKind::Audio,
        MediaKind::Video => TrackKind::Video,
    }
}

fn media_kind(kind: TrackKind) -> MediaKind {
    match kind {
        TrackKind::Audio => MediaKind::Audio,
        TrackKind::Video => MediaKind::Video,
    }
}

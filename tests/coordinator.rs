use std::time::Duration;

use rtc_signal::coordinator::{Coordinator, CoordinatorHandle, PointerInput, SessionOptions};
use rtc_signal::error::SignalingError;
use rtc_signal::model::{
    AudioTrackOptions, ConnectionState, Envelope, IceCandidate, IceConnectionState, PeerEvent, PointerEvent,
    PointerKind, SdpType, SessionDescription, SessionId, Track, TrackId, TrackKind, TrackOrigin,
    VideoTrackOptions,
};
use rtc_signal::testing::{
    EngineCall, FakeConnectionView, FakeEngine, FakeEngineConfig, BROWSER_OFFER, ENGINE_ANSWER, HOST_CANDIDATE,
};
use rtc_signal::transport::{memory_pair, MemoryPeer};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(2);

struct Harness {
    handle: CoordinatorHandle,
    remote: MemoryPeer,
    conn: FakeConnectionView,
    cancel: CancellationToken,
    pointer: mpsc::UnboundedReceiver<PointerInput>,
    task: JoinHandle<ConnectionState>,
}

async fn start(config: FakeEngineConfig) -> Harness {
    let engine = FakeEngine::with_config(config);
    let (transport, remote) = memory_pair();
    let cancel = CancellationToken::new();
    let (pointer_tx, pointer) = mpsc::unbounded_channel();

    let (coordinator, handle) = Coordinator::open(
        SessionId::next(),
        transport,
        &engine,
        SessionOptions::default(),
        cancel.child_token(),
        Some(pointer_tx),
    )
    .await
    .unwrap();
    assert_eq!(handle.state(), ConnectionState::Negotiating);

    let conn = engine.last_connection().unwrap();
    let task = tokio::spawn(coordinator.run());

    Harness {
        handle,
        remote,
        conn,
        cancel,
        pointer,
        task,
    }
}

async fn next_envelope(remote: &mut MemoryPeer) -> Envelope {
    timeout(WAIT, remote.recv())
        .await
        .expect("timed out waiting for an envelope")
        .expect("transport closed")
        .expect("undecodable envelope")
}

async fn assert_closed(h: Harness) -> (MemoryPeer, FakeConnectionView) {
    timeout(WAIT, h.handle.closed()).await.expect("session did not close");
    let state = timeout(WAIT, h.task).await.unwrap().unwrap();
    assert_eq!(state, ConnectionState::Closed);
    assert!(h.conn.is_closed());
    (h.remote, h.conn)
}

fn offer() -> Envelope {
    Envelope::Sdp(SessionDescription::offer(BROWSER_OFFER))
}

#[tokio::test]
async fn answers_offer_without_bandwidth_caps() {
    let mut h = start(FakeEngineConfig::default()).await;
    h.remote.send(&offer()).unwrap();

    let Envelope::Sdp(answer) = next_envelope(&mut h.remote).await else {
        panic!("expected an sdp answer");
    };
    assert_eq!(answer.kind, SdpType::Answer);
    assert!(!answer.sdp.contains("b=AS:"));
    assert!(!answer.sdp.contains("b=TIAS:"));
    assert!(answer.sdp.contains("a=mid:1\r\n"));
    assert_eq!(
        ENGINE_ANSWER.lines().count() - 3,
        answer.sdp.lines().count()
    );

    let calls = h.conn.calls();
    assert!(matches!(calls[0], EngineCall::AddTrack(TrackKind::Audio, _)));
    assert!(matches!(calls[1], EngineCall::AddTrack(TrackKind::Video, _)));
    assert!(matches!(calls[2], EngineCall::SetRemote(_)));
    assert!(matches!(calls[3], EngineCall::CreateAnswer(_)));
    assert_eq!(calls[4], EngineCall::SetLocal(answer));
    assert_eq!(h.handle.state(), ConnectionState::Negotiating);
}

#[tokio::test]
async fn pointer_input_is_routed_unchanged() {
    let mut h = start(FakeEngineConfig::default()).await;
    let event = PointerEvent {
        kind: PointerKind::Move,
        x: 0.25,
        y: 0.75,
    };
    h.remote.send(&Envelope::Pos(event)).unwrap();

    let input = timeout(WAIT, h.pointer.recv()).await.unwrap().unwrap();
    assert_eq!(input.session, h.handle.id());
    assert_eq!(input.event, event);
    assert!(h.conn.calls().iter().all(|c| matches!(c, EngineCall::AddTrack(..))));
}

#[tokio::test]
async fn malformed_message_is_dropped() {
    let mut h = start(FakeEngineConfig::default()).await;
    h.remote.send_raw("definitely not json").unwrap();
    h.remote.send_raw(r#"{"action":"jump","payload":{}}"#).unwrap();
    h.remote.send(&offer()).unwrap();

    assert!(matches!(next_envelope(&mut h.remote).await, Envelope::Sdp(_)));
    assert_eq!(h.handle.state(), ConnectionState::Negotiating);
}

#[tokio::test]
async fn early_candidate_is_not_fatal() {
    let mut h = start(FakeEngineConfig {
        reject_early_candidates: true,
        ..Default::default()
    })
    .await;

    h.remote
        .send(&Envelope::Ice(Some(IceCandidate::new(HOST_CANDIDATE))))
        .unwrap();
    h.remote.send(&offer()).unwrap();

    assert!(matches!(next_envelope(&mut h.remote).await, Envelope::Sdp(_)));
    assert!(h.conn.calls().contains(&EngineCall::AddCandidate(Some(IceCandidate::new(HOST_CANDIDATE)))));
}

#[tokio::test]
async fn empty_remote_candidate_means_end_of_candidates() {
    let mut h = start(FakeEngineConfig::default()).await;
    h.remote.send(&offer()).unwrap();
    next_envelope(&mut h.remote).await;

    h.remote.send(&Envelope::Ice(Some(IceCandidate::new("")))).unwrap();
    h.remote.send(&Envelope::Ice(None)).unwrap();

    // inbound messages are handled before control requests
    h.handle.tracks().await.unwrap();
    let ends = h
        .conn
        .calls()
        .iter()
        .filter(|c| **c == EngineCall::AddCandidate(None))
        .count();
    assert_eq!(ends, 2);
    assert_eq!(h.handle.state(), ConnectionState::Negotiating);
}

#[tokio::test]
async fn local_candidates_are_forwarded_with_end_marker() {
    let mut h = start(FakeEngineConfig::default()).await;
    h.remote.send(&offer()).unwrap();
    next_envelope(&mut h.remote).await;

    let candidate = IceCandidate::new(HOST_CANDIDATE);
    assert!(h.conn.emit(PeerEvent::IceCandidate(Some(candidate.clone()))));
    assert!(h.conn.emit(PeerEvent::IceCandidate(None)));

    assert_eq!(next_envelope(&mut h.remote).await, Envelope::Ice(Some(candidate)));
    assert_eq!(next_envelope(&mut h.remote).await, Envelope::Ice(None));
}

#[tokio::test]
async fn ice_connected_moves_to_connected() {
    let mut h = start(FakeEngineConfig::default()).await;
    h.remote.send(&offer()).unwrap();
    next_envelope(&mut h.remote).await;

    h.conn
        .emit(PeerEvent::IceConnectionStateChanged(IceConnectionState::Checking));
    h.conn
        .emit(PeerEvent::IceConnectionStateChanged(IceConnectionState::Connected));

    let state = timeout(WAIT, h.handle.reached(ConnectionState::Connected)).await.unwrap();
    assert_eq!(state, ConnectionState::Connected);
}

#[tokio::test]
async fn ice_failure_tears_the_session_down() {
    let mut h = start(FakeEngineConfig::default()).await;
    h.remote.send(&offer()).unwrap();
    next_envelope(&mut h.remote).await;

    h.conn
        .emit(PeerEvent::IceConnectionStateChanged(IceConnectionState::Failed));

    let (mut remote, _) = assert_closed(h).await;
    assert!(remote.recv().await.is_none());
}

#[tokio::test]
async fn late_audio_track_is_unsupported() {
    let mut h = start(FakeEngineConfig::default()).await;
    h.remote.send(&offer()).unwrap();
    next_envelope(&mut h.remote).await;

    let result = h.handle.add_audio_track(AudioTrackOptions::default()).await;
    assert!(matches!(result, Err(SignalingError::UnsupportedOperation(_))));
    assert_eq!(h.handle.state(), ConnectionState::Negotiating);

    let video = h
        .handle
        .add_video_track(VideoTrackOptions {
            label: "screen".into(),
            max_frames_per_second: 15,
        })
        .await
        .unwrap();
    let tracks = h.handle.tracks().await.unwrap();
    assert!(tracks.iter().any(|t| t.id == video && t.label == "screen"));

    h.handle.remove_track(video).await.unwrap();
    assert!(h.handle.remove_track(video).await.is_err());
}

#[tokio::test]
async fn late_audio_track_is_unsupported_once_connected() {
    let mut h = start(FakeEngineConfig::default()).await;
    h.remote.send(&offer()).unwrap();
    next_envelope(&mut h.remote).await;

    h.conn
        .emit(PeerEvent::IceConnectionStateChanged(IceConnectionState::Connected));
    let state = timeout(WAIT, h.handle.reached(ConnectionState::Connected)).await.unwrap();
    assert_eq!(state, ConnectionState::Connected);

    let result = h.handle.add_audio_track(AudioTrackOptions::default()).await;
    assert!(matches!(result, Err(SignalingError::UnsupportedOperation(_))));
    assert_eq!(h.handle.state(), ConnectionState::Connected);
    assert!(!h.conn.is_closed());
}

#[tokio::test]
async fn remote_tracks_are_tracked() {
    let h = start(FakeEngineConfig::default()).await;
    let track = Track::new(TrackId(100), TrackKind::Video, "remote-video-1", TrackOrigin::Remote);
    h.conn.emit(PeerEvent::TrackAdded(track));

    let tracks = h.handle.tracks().await.unwrap();
    assert!(tracks.iter().any(|t| t.id == TrackId(100) && t.origin == TrackOrigin::Remote));
}

#[tokio::test]
async fn transport_close_closes_the_session() {
    let h = start(FakeEngineConfig::default()).await;
    let Harness {
        handle,
        remote,
        conn,
        task,
        ..
    } = h;
    drop(remote);

    timeout(WAIT, handle.closed()).await.unwrap();
    assert_eq!(timeout(WAIT, task).await.unwrap().unwrap(), ConnectionState::Closed);
    assert!(conn.is_closed());
    assert!(conn.calls().ends_with(&[EngineCall::Close]));

    // requests after close fail, close itself is a no-op
    assert!(matches!(
        handle.add_video_track(VideoTrackOptions::default()).await,
        Err(SignalingError::InvalidState(_))
    ));
    handle.close().await;
}

#[tokio::test]
async fn transport_close_mid_negotiation() {
    let h = start(FakeEngineConfig::default()).await;
    h.remote.send(&offer()).unwrap();
    let Harness {
        handle,
        remote,
        conn,
        task,
        ..
    } = h;
    drop(remote);

    timeout(WAIT, handle.closed()).await.unwrap();
    assert_eq!(timeout(WAIT, task).await.unwrap().unwrap(), ConnectionState::Closed);
    assert!(conn.is_closed());
}

#[tokio::test]
async fn hangup_after_offer_sends_no_answer() {
    let h = start(FakeEngineConfig::default()).await;
    let Harness {
        handle,
        remote,
        conn,
        task,
        ..
    } = h;
    let (tx, mut rx) = remote.into_parts();
    tx.send(offer().encode().unwrap()).unwrap();
    // the remote stops sending but still listens
    drop(tx);

    timeout(WAIT, handle.closed()).await.unwrap();
    assert_eq!(timeout(WAIT, task).await.unwrap().unwrap(), ConnectionState::Closed);
    assert!(conn.is_closed());
    assert!(conn.calls().iter().any(|c| matches!(c, EngineCall::SetRemote(_))));
    assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn remote_answer_is_fatal() {
    let h = start(FakeEngineConfig::default()).await;
    h.remote
        .send(&Envelope::Sdp(SessionDescription::answer(ENGINE_ANSWER)))
        .unwrap();

    let (mut remote, conn) = assert_closed(h).await;
    assert!(remote.recv().await.is_none());
    assert!(!conn.calls().iter().any(|c| matches!(c, EngineCall::SetRemote(_))));
}

#[tokio::test]
async fn answer_failure_is_fatal() {
    let h = start(FakeEngineConfig {
        fail_answer: true,
        ..Default::default()
    })
    .await;
    h.remote.send(&offer()).unwrap();

    let (mut remote, conn) = assert_closed(h).await;
    assert!(remote.recv().await.is_none());
    assert!(conn.local_description().is_none());
}

#[tokio::test]
async fn cancellation_closes_handle_then_transport() {
    let h = start(FakeEngineConfig::default()).await;
    h.cancel.cancel();

    let (mut remote, conn) = assert_closed(h).await;
    assert!(remote.recv().await.is_none());
    assert!(conn.calls().ends_with(&[EngineCall::Close]));
}

#[tokio::test]
async fn handle_close_ends_the_session() {
    let h = start(FakeEngineConfig::default()).await;
    h.handle.close().await;

    let (mut remote, _) = assert_closed(h).await;
    assert!(remote.recv().await.is_none());
}

#[tokio::test]
async fn engine_connect_failure_closes_transport() {
    let engine = FakeEngine::with_config(FakeEngineConfig {
        fail_connect: true,
        ..Default::default()
    });
    let (transport, mut remote) = memory_pair();

    let result = Coordinator::open(
        SessionId::next(),
        transport,
        &engine,
        SessionOptions::default(),
        CancellationToken::new(),
        None,
    )
    .await;
    assert!(matches!(result, Err(SignalingError::Engine(_))));
    assert!(remote.recv().await.is_none());
}

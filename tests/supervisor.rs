use std::sync::Arc;
use std::time::Duration;

use rtc_signal::coordinator::SessionOptions;
use rtc_signal::error::SignalingError;
use rtc_signal::model::{ConnectionState, Envelope, PointerEvent, PointerKind, SdpType, SessionDescription};
use rtc_signal::supervisor::Supervisor;
use rtc_signal::testing::{FakeEngine, FakeEngineConfig, BROWSER_OFFER};
use rtc_signal::transport::{memory_pair, MemoryPeer};
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(2);

async fn next_envelope(remote: &mut MemoryPeer) -> Envelope {
    timeout(WAIT, remote.recv()).await.unwrap().unwrap().unwrap()
}

async fn wait_for_len(supervisor: &Supervisor, len: usize) {
    timeout(WAIT, async {
        while supervisor.len().await != len {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn sessions_negotiate_independently() {
    let engine = FakeEngine::new();
    let supervisor = Supervisor::new(Arc::new(engine.clone()), SessionOptions::default());

    let mut remotes = vec![];
    for _ in 0..3 {
        let (transport, remote) = memory_pair();
        supervisor.accept(transport).await.unwrap();
        remotes.push(remote);
    }
    assert_eq!(engine.connections().len(), 3);

    for remote in &remotes {
        remote
            .send(&Envelope::Sdp(SessionDescription::offer(BROWSER_OFFER)))
            .unwrap();
    }
    for remote in &mut remotes {
        let Envelope::Sdp(answer) = next_envelope(remote).await else {
            panic!("expected an answer");
        };
        assert_eq!(answer.kind, SdpType::Answer);
    }

    // one client leaving does not disturb the others
    drop(remotes.remove(0));
    wait_for_len(&supervisor, 2).await;
    let infos = supervisor.sessions().await;
    assert!(infos.iter().all(|i| i.state == ConnectionState::Negotiating));

    let connections = engine.connections();
    assert!(connections[0].is_closed());
    assert!(!connections[1].is_closed());
    assert!(!connections[2].is_closed());

    supervisor.shutdown().await;
}

#[tokio::test]
async fn pointer_input_carries_its_session() {
    let (pointer_tx, mut pointer_rx) = mpsc::unbounded_channel();
    let supervisor = Supervisor::new(Arc::new(FakeEngine::new()), SessionOptions::default())
        .with_pointer_sink(pointer_tx);

    let (a, remote_a) = memory_pair();
    let (b, remote_b) = memory_pair();
    let id_a = supervisor.accept(a).await.unwrap();
    let id_b = supervisor.accept(b).await.unwrap();

    let down = PointerEvent {
        kind: PointerKind::Down,
        x: 10.0,
        y: 20.0,
    };
    remote_b.send(&Envelope::Pos(down)).unwrap();
    let input = timeout(WAIT, pointer_rx.recv()).await.unwrap().unwrap();
    assert_eq!(input.session, id_b);
    assert_eq!(input.event, down);

    remote_a.send(&Envelope::Pos(down)).unwrap();
    let input = timeout(WAIT, pointer_rx.recv()).await.unwrap().unwrap();
    assert_eq!(input.session, id_a);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn shutdown_closes_every_session() {
    let engine = FakeEngine::new();
    let supervisor = Supervisor::new(Arc::new(engine.clone()), SessionOptions::default());

    let mut remotes = vec![];
    for _ in 0..4 {
        let (transport, remote) = memory_pair();
        supervisor.accept(transport).await.unwrap();
        remotes.push(remote);
    }

    let handles = {
        let mut handles = vec![];
        for info in supervisor.sessions().await {
            handles.push(supervisor.session(info.id).await.unwrap());
        }
        handles
    };

    let closed = timeout(WAIT, supervisor.shutdown()).await.unwrap();
    assert_eq!(closed, 4);
    assert!(supervisor.is_empty().await);
    assert!(handles.iter().all(|h| h.state() == ConnectionState::Closed));
    assert!(engine.connections().iter().all(|c| c.is_closed()));

    for remote in &mut remotes {
        assert!(remote.recv().await.is_none());
    }
}

#[tokio::test]
async fn shutdown_waits_for_sessions_still_opening() {
    let engine = FakeEngine::with_config(FakeEngineConfig {
        connect_delay: Some(Duration::from_millis(100)),
        ..Default::default()
    });
    let supervisor = Supervisor::new(Arc::new(engine.clone()), SessionOptions::default());

    let (transport, mut remote) = memory_pair();
    let accepting = tokio::spawn({
        let supervisor = supervisor.clone();
        async move { supervisor.accept(transport).await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    let closed = timeout(WAIT, supervisor.shutdown()).await.unwrap();
    assert_eq!(closed, 0);
    assert!(supervisor.is_empty().await);
    assert!(engine.connections().iter().all(|c| c.is_closed()));

    let result = timeout(WAIT, accepting).await.unwrap().unwrap();
    assert!(matches!(result, Err(SignalingError::Cancelled)));
    assert!(remote.recv().await.is_none());
}

#[tokio::test]
async fn sessions_record_accept_time() {
    let supervisor = Supervisor::new(Arc::new(FakeEngine::new()), SessionOptions::default());
    let before = chrono::Utc::now();

    let (transport, _remote) = memory_pair();
    let id = supervisor.accept(transport).await.unwrap();

    let infos = supervisor.sessions().await;
    assert_eq!(infos.len(), 1);
    assert_eq!(infos[0].id, id);
    assert!(infos[0].accepted_at >= before);

    supervisor.shutdown().await;
}

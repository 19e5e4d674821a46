//! Native signaling client
//!
//! Connects to a signaling server, offers to receive audio and video and
//! trickles candidates in both directions. When the connection drops the
//! peer connection and transport are thrown away and a fresh session starts
//! after a fixed backoff.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::engine::{MediaEngine, OfferOptions, Str0mEngine};
use crate::error::{Result, SignalingError};
use crate::model::{Envelope, PeerEvent, SdpType, SessionId};
use crate::peer::PeerConnection;
use crate::transport::{ClientWebSocketTransport, SignalingTransport};
use crate::util::select_host_address;

pub async fn run(config: ClientConfig, cancel: CancellationToken) -> anyhow::Result<()> {
    let host_addr = match config.host_addr {
        Some(addr) => addr,
        None => select_host_address()?,
    };
    let engine = Str0mEngine::new(host_addr);
    let url = config.url.as_str();

    run_reconnecting(
        move || async move {
            let (stream, _) = tokio_tungstenite::connect_async(url).await?;
            info!("Connected to {}", url);
            anyhow::Ok(ClientWebSocketTransport::new(stream))
        },
        &engine,
        config.retry_backoff(),
        cancel,
    )
    .await;

    Ok(())
}

/// Runs sessions back to back until `cancel` fires, waiting `backoff`
/// between a closed session and the next connection attempt.
pub async fn run_reconnecting<F, Fut, T>(
    mut connect: F,
    engine: &dyn MediaEngine,
    backoff: Duration,
    cancel: CancellationToken,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
    T: SignalingTransport,
{
    while !cancel.is_cancelled() {
        let attempt = async {
            let transport = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                transport = connect() => transport?,
            };
            let session = ClientSession::open(SessionId::next(), transport, engine).await?;
            session.run(&cancel).await?;
            anyhow::Ok(())
        };

        match attempt.await {
            Ok(()) => info!("Signaling session ended"),
            Err(e) => warn!("Signaling session failed: {:#}", e),
        }

        if cancel.is_cancelled() {
            break;
        }

        info!("Reconnecting in {:?}", backoff);
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(backoff) => {}
        }
    }
}

/// One offerer session over one transport.
pub struct ClientSession<T: SignalingTransport> {
    id: SessionId,
    transport: T,
    peer: PeerConnection,
}

impl<T: SignalingTransport> ClientSession<T> {
    pub async fn open(id: SessionId, mut transport: T, engine: &dyn MediaEngine) -> Result<Self> {
        match PeerConnection::open(id, engine).await {
            Ok(peer) => Ok(ClientSession { id, transport, peer }),
            Err(e) => {
                transport.close().await;
                Err(e)
            }
        }
    }

    /// Offers, then handles the answer and candidates until the transport
    /// closes, ICE is lost or `cancel` fires. Both ends are closed on return.
    pub async fn run(mut self, cancel: &CancellationToken) -> Result<()> {
        let result = self.negotiate(cancel).await;
        self.peer.close().await;
        self.transport.close().await;
        result
    }

    async fn negotiate(&mut self, cancel: &CancellationToken) -> Result<()> {
        let offer = self.peer.create_offer(OfferOptions::default()).await?;
        let offer = self.peer.set_local_description(offer).await?;
        self.transport.send(&Envelope::Sdp(offer)).await?;
        info!("Session({}) offer sent", self.id);

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => return Ok(()),

                inbound = self.transport.recv() => match inbound {
                    Some(Ok(envelope)) => self.handle_envelope(envelope).await?,
                    Some(Err(e)) if !e.is_fatal() => {
                        warn!("Session({}) dropping malformed message: {}", self.id, e);
                    }
                    Some(Err(e)) => return Err(e),
                    None => {
                        info!("Session({}) transport closed", self.id);
                        return Ok(());
                    }
                },

                event = self.peer.next_event() => match event {
                    Some(PeerEvent::IceCandidate(candidate)) => {
                        self.transport.send(&Envelope::Ice(candidate)).await?;
                    }
                    Some(PeerEvent::IceConnectionStateChanged(ice)) => {
                        info!("Session({}) ice connection state = {:?}", self.id, ice);
                        if ice.is_lost() {
                            return Ok(());
                        }
                    }
                    Some(PeerEvent::TrackAdded(track)) => {
                        info!("Session({}) receiving {} track {}", self.id, track.kind, track.id);
                    }
                    Some(event) => debug!("Session({}) {:?}", self.id, event),
                    None => return Ok(()),
                },
            }
        }
    }

    async fn handle_envelope(&mut self, envelope: Envelope) -> Result<()> {
        match envelope {
            Envelope::Sdp(desc) if desc.kind == SdpType::Answer => {
                self.peer.set_remote_description(desc).await?;
                info!("Session({}) answer applied", self.id);
            }
            Envelope::Sdp(_) => {
                return Err(SignalingError::invalid_state(
                    "remote sent an offer; this side always offers",
                ));
            }
            Envelope::Ice(candidate) => {
                if let Err(e) = self.peer.add_ice_candidate(candidate).await {
                    warn!("Session({}) ignoring remote candidate: {}", self.id, e);
                }
            }
            Envelope::Pos(event) => debug!("Session({}) ignoring pointer input {:?}", self.id, event),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::model::SessionDescription;
    use crate::testing::{FakeEngine, ENGINE_ANSWER};
    use crate::transport::{memory_pair, MemoryPeer, MemoryTransport};

    #[tokio::test]
    async fn offers_then_applies_answer() {
        let engine = FakeEngine::new();
        let (transport, mut server) = memory_pair();
        let cancel = CancellationToken::new();

        let session = ClientSession::open(SessionId::next(), transport, &engine).await.unwrap();
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { session.run(&cancel).await }
        });

        let Some(Ok(Envelope::Sdp(offer))) = server.recv().await else {
            panic!("expected an offer");
        };
        assert_eq!(offer.kind, SdpType::Offer);
        assert!(!offer.sdp.contains("b=AS:"));

        server.send(&Envelope::Sdp(SessionDescription::answer(ENGINE_ANSWER))).unwrap();
        drop(server);

        task.await.unwrap().unwrap();
        let conn = engine.last_connection().unwrap();
        assert!(conn.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_with_a_fresh_connection() {
        let engine = FakeEngine::new();
        let cancel = CancellationToken::new();
        let kept: Arc<Mutex<Vec<MemoryPeer>>> = Arc::default();
        let attempts = Arc::new(AtomicUsize::new(0));

        let connect = {
            let kept = kept.clone();
            let attempts = attempts.clone();
            let cancel = cancel.clone();
            move || {
                let kept = kept.clone();
                let cancel = cancel.clone();
                let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    let (transport, server) = memory_pair();
                    if attempt == 1 {
                        // hang up right away
                        drop(server);
                    } else {
                        kept.lock().unwrap().push(server);
                        cancel.cancel();
                    }
                    anyhow::Ok::<MemoryTransport>(transport)
                }
            }
        };

        run_reconnecting(connect, &engine, Duration::from_secs(1), cancel).await;

        let connections = engine.connections();
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(connections.len(), 2);
        assert!(connections.iter().all(|c| c.is_closed()));
    }
}

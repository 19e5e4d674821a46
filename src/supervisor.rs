//! Session supervisor
//!
//! Owns every live session. Each accepted transport gets its own coordinator
//! task; the task removes its entry once the coordinator has closed. Sessions
//! share nothing except the engine and the pointer sink.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::coordinator::{Coordinator, CoordinatorHandle, PointerSender, SessionOptions};
use crate::engine::MediaEngine;
use crate::error::{Result, SignalingError};
use crate::model::{SessionId, SessionInfo};
use crate::transport::SignalingTransport;

struct SessionEntry {
    accepted_at: DateTime<Utc>,
    handle: CoordinatorHandle,
    task: JoinHandle<()>,
}

#[derive(Clone)]
pub struct Supervisor {
    engine: Arc<dyn MediaEngine>,
    options: SessionOptions,
    pointer: Option<PointerSender>,
    cancel: CancellationToken,
    /// Every accept in flight and every coordinator task.
    tracker: TaskTracker,
    sessions: Arc<Mutex<HashMap<SessionId, SessionEntry>>>,
}

impl Supervisor {
    pub fn new(engine: Arc<dyn MediaEngine>, options: SessionOptions) -> Self {
        Supervisor {
            engine,
            options,
            pointer: None,
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            sessions: Arc::default(),
        }
    }

    /// Routes pointer input from every session to `sink`.
    pub fn with_pointer_sink(mut self, sink: PointerSender) -> Self {
        self.pointer = Some(sink);
        self
    }

    /// Cancelling this token shuts every session down.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Starts a session on a newly accepted transport.
    ///
    /// The coordinator runs on its own task until it closes. After shutdown
    /// the transport is closed right away and `Cancelled` is returned.
    pub async fn accept<T>(&self, mut transport: T) -> Result<SessionId>
    where
        T: SignalingTransport + 'static,
    {
        // shutdown waits for this accept until the session is registered
        let _in_flight = self.tracker.token();

        if self.cancel.is_cancelled() {
            transport.close().await;
            return Err(SignalingError::Cancelled);
        }

        let id = SessionId::next();
        let (coordinator, handle) = Coordinator::open(
            id,
            transport,
            self.engine.as_ref(),
            self.options.clone(),
            self.cancel.child_token(),
            self.pointer.clone(),
        )
        .await?;

        let mut sessions = self.sessions.lock().await;
        if self.cancel.is_cancelled() {
            // shutdown already drained the map; unwind here instead
            drop(sessions);
            coordinator.run().await;
            return Err(SignalingError::Cancelled);
        }

        let registry = self.sessions.clone();
        let task = self.tracker.spawn(async move {
            let state = coordinator.run().await;
            debug!("Session({}) finished in state {:?}", id, state);
            if registry.lock().await.remove(&id).is_some() {
                info!("Session({}) removed", id);
            }
        });

        sessions.insert(
            id,
            SessionEntry {
                accepted_at: Utc::now(),
                handle,
                task,
            },
        );
        info!("Session({}) accepted, {} live", id, sessions.len());
        Ok(id)
    }

    /// Snapshot of every live session, oldest first.
    pub async fn sessions(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.lock().await;
        let mut infos: Vec<SessionInfo> = sessions
            .iter()
            .map(|(id, entry)| SessionInfo {
                id: *id,
                accepted_at: entry.accepted_at,
                state: entry.handle.state(),
            })
            .collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    pub async fn session(&self, id: SessionId) -> Option<CoordinatorHandle> {
        self.sessions.lock().await.get(&id).map(|entry| entry.handle.clone())
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Signals every coordinator to stop and waits until all have closed,
    /// including sessions still being opened. Returns how many registered
    /// sessions were torn down.
    pub async fn shutdown(&self) -> usize {
        self.cancel.cancel();
        self.tracker.close();

        let drained: Vec<(SessionId, SessionEntry)> = self.sessions.lock().await.drain().collect();
        let count = drained.len();
        info!("Shutting down {} sessions", count);

        for (id, entry) in drained {
            if let Err(e) = entry.task.await {
                warn!("Session({}) task failed: {}", id, e);
            }
        }

        self.tracker.wait().await;
        info!("All sessions closed");
        count
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;
    use crate::model::ConnectionState;
    use crate::testing::FakeEngine;
    use crate::transport::memory_pair;

    fn supervisor(engine: &FakeEngine) -> Supervisor {
        Supervisor::new(Arc::new(engine.clone()), SessionOptions::default())
    }

    #[tokio::test]
    async fn lists_accepted_sessions() {
        let engine = FakeEngine::new();
        let supervisor = supervisor(&engine);

        let (a, _peer_a) = memory_pair();
        let (b, _peer_b) = memory_pair();
        let first = supervisor.accept(a).await.unwrap();
        let second = supervisor.accept(b).await.unwrap();

        let infos = supervisor.sessions().await;
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].id, first);
        assert_eq!(infos[1].id, second);
        assert!(infos.iter().all(|i| i.state == ConnectionState::Negotiating));

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn closed_session_removes_itself() {
        let engine = FakeEngine::new();
        let supervisor = supervisor(&engine);

        let (transport, peer) = memory_pair();
        let id = supervisor.accept(transport).await.unwrap();
        let handle = supervisor.session(id).await.unwrap();
        drop(peer);

        timeout(Duration::from_secs(1), handle.closed()).await.unwrap();
        timeout(Duration::from_secs(1), async {
            while !supervisor.is_empty().await {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn accept_after_shutdown_closes_transport() {
        let engine = FakeEngine::new();
        let supervisor = supervisor(&engine);
        assert_eq!(supervisor.shutdown().await, 0);

        let (transport, mut peer) = memory_pair();
        let result = supervisor.accept(transport).await;
        assert!(matches!(result, Err(SignalingError::Cancelled)));
        assert!(peer.recv().await.is_none());
        assert!(engine.connections().is_empty());
    }
}

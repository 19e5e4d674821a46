//! Per-session bookkeeping shared by the coordinator and the supervisor.

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    pub fn next() -> SessionId {
        static ID_COUNTER: AtomicU64 = AtomicU64::new(0);
        SessionId(ID_COUNTER.fetch_add(1, Ordering::SeqCst))
    }
}

impl Deref for SessionId {
    type Target = u64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Negotiation state of one coordinator.
///
/// `Closed` is terminal: the handle and the transport have been released and
/// no further operations are accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Negotiating,
    Connected,
    Disconnected,
    Closed,
}

impl ConnectionState {
    pub fn is_closed(&self) -> bool {
        *self == ConnectionState::Closed
    }
}

/// Snapshot of a live session, as listed by the supervisor.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: SessionId,
    pub accepted_at: DateTime<Utc>,
    pub state: ConnectionState,
}

//! Error taxonomy for signaling and peer connection operations.

use thiserror::Error;

/// Errors raised by transports, peer connection handles and coordinators.
#[derive(Debug, Error)]
pub enum SignalingError {
    /// The signaling transport is closed; sends can no longer be delivered.
    #[error("signaling transport closed")]
    TransportClosed,

    /// Inbound data could not be decoded into an envelope.
    #[error("failed to decode envelope: {0}")]
    Decode(#[from] serde_json::Error),

    /// The operation is not valid in the current connection state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A remote ICE candidate was malformed or rejected by the engine.
    #[error("invalid ICE candidate: {0}")]
    InvalidCandidate(String),

    /// The engine cannot perform this operation at this point of the session.
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// The media engine failed in a way that does not map to the above.
    #[error("media engine error: {0}")]
    Engine(String),

    /// Shutdown was requested while the operation was pending.
    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SignalingError {
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        SignalingError::InvalidState(msg.into())
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        SignalingError::UnsupportedOperation(msg.into())
    }

    /// Whether this error ends the connection when it surfaces from
    /// anything other than a remote ICE candidate.
    ///
    /// Decode errors and rejected candidates only drop the offending message.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            SignalingError::Decode(_) | SignalingError::InvalidCandidate(_)
        )
    }
}

pub type Result<T, E = SignalingError> = std::result::Result<T, E>;

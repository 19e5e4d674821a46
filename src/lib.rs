//! WebRTC signaling over WebSocket.
//!
//! A browser connects to the signaling endpoint and sends an SDP offer. The
//! server answers through a native WebRTC engine with the bandwidth caps
//! removed, and both sides trickle ICE candidates over the same socket.
//! Pointer input from the browser is routed to the application unchanged.

pub mod client;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod model;
pub mod peer;
pub mod sdp;
pub mod server;
pub mod supervisor;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod transport;
pub mod util;

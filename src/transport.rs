//! Signaling transports
//!
//! A transport carries [`Envelope`]s in both directions for one client.
//! Sends are delivered in FIFO order. [`SignalingTransport::recv`] yields
//! inbound envelopes until the connection closes; a message that fails to
//! decode comes back as [`SignalingError::Decode`] and the stream continues.

use std::collections::VecDeque;

use async_trait::async_trait;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures_util::{FutureExt, SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::error::{Result, SignalingError};
use crate::model::Envelope;

#[async_trait]
pub trait SignalingTransport: Send {
    /// Queues `envelope` for delivery. Fails with `TransportClosed` once the
    /// connection is gone.
    async fn send(&mut self, envelope: &Envelope) -> Result<()>;

    /// Next inbound envelope, or `None` once the connection has closed.
    ///
    /// Must be cancel safe: dropping the future loses no message.
    async fn recv(&mut self) -> Option<Result<Envelope>>;

    /// Whether the remote has hung up or the connection was closed.
    /// Frames that already arrived stay queued for `recv`.
    async fn is_closed(&mut self) -> bool;

    /// Closes the connection. Closing twice is a no-op.
    async fn close(&mut self);
}

/// One frame read off a WebSocket.
enum Frame {
    Envelope(Result<Envelope>),
    Control,
    End(Option<SignalingError>),
}

/// Frames read ahead of `recv` while checking for a hang-up.
#[derive(Default)]
struct ReadAhead {
    queued: VecDeque<Result<Envelope>>,
    ended: bool,
}

impl ReadAhead {
    fn push(&mut self, frame: Frame) {
        match frame {
            Frame::Envelope(envelope) => self.queued.push_back(envelope),
            Frame::Control => {}
            Frame::End(error) => {
                if let Some(e) = error {
                    self.queued.push_back(Err(e));
                }
                self.ended = true;
            }
        }
    }
}

fn server_frame(frame: Option<std::result::Result<WsMessage, axum::Error>>) -> Frame {
    match frame {
        Some(Ok(WsMessage::Text(text))) => Frame::Envelope(Envelope::decode(&text)),
        Some(Ok(WsMessage::Binary(data))) => Frame::Envelope(Envelope::decode_slice(&data)),
        Some(Ok(WsMessage::Close(_))) | None => Frame::End(None),
        // Ping and pong are answered by the socket itself.
        Some(Ok(_)) => Frame::Control,
        Some(Err(e)) => {
            debug!("WebSocket read failed: {}", e);
            Frame::End(Some(SignalingError::TransportClosed))
        }
    }
}

fn client_frame(frame: Option<std::result::Result<Message, tokio_tungstenite::tungstenite::Error>>) -> Frame {
    match frame {
        Some(Ok(Message::Text(text))) => Frame::Envelope(Envelope::decode(&text)),
        Some(Ok(Message::Binary(data))) => Frame::Envelope(Envelope::decode_slice(&data)),
        Some(Ok(Message::Close(_))) | None => Frame::End(None),
        Some(Ok(_)) => Frame::Control,
        Some(Err(e)) => {
            debug!("WebSocket read failed: {}", e);
            Frame::End(Some(SignalingError::TransportClosed))
        }
    }
}

/// Server side of a browser WebSocket accepted by the HTTP host.
pub struct WebSocketTransport {
    socket: Option<WebSocket>,
    ahead: ReadAhead,
}

impl WebSocketTransport {
    pub fn new(socket: WebSocket) -> Self {
        WebSocketTransport {
            socket: Some(socket),
            ahead: ReadAhead::default(),
        }
    }
}

#[async_trait]
impl SignalingTransport for WebSocketTransport {
    async fn send(&mut self, envelope: &Envelope) -> Result<()> {
        let socket = self.socket.as_mut().ok_or(SignalingError::TransportClosed)?;
        let text = envelope.encode()?;
        socket
            .send(WsMessage::Text(text))
            .await
            .map_err(|_| SignalingError::TransportClosed)
    }

    async fn recv(&mut self) -> Option<Result<Envelope>> {
        if let Some(queued) = self.ahead.queued.pop_front() {
            return Some(queued);
        }
        if self.ahead.ended {
            self.socket = None;
            return None;
        }
        loop {
            let socket = self.socket.as_mut()?;
            match server_frame(socket.recv().await) {
                Frame::Envelope(envelope) => return Some(envelope),
                Frame::Control => continue,
                Frame::End(error) => {
                    self.socket = None;
                    return error.map(Err);
                }
            }
        }
    }

    async fn is_closed(&mut self) -> bool {
        let Some(socket) = self.socket.as_mut() else {
            return true;
        };
        while !self.ahead.ended {
            let Some(frame) = socket.next().now_or_never() else {
                break;
            };
            self.ahead.push(server_frame(frame));
        }
        self.ahead.ended
    }

    async fn close(&mut self) {
        self.ahead.ended = true;
        if let Some(mut socket) = self.socket.take() {
            let _ = socket.send(WsMessage::Close(None)).await;
        }
    }
}

/// Client side of the signaling WebSocket, as opened by `connect_async`.
pub struct ClientWebSocketTransport {
    stream: Option<WebSocketStream<MaybeTlsStream<TcpStream>>>,
    ahead: ReadAhead,
}

impl ClientWebSocketTransport {
    pub fn new(stream: WebSocketStream<MaybeTlsStream<TcpStream>>) -> Self {
        ClientWebSocketTransport {
            stream: Some(stream),
            ahead: ReadAhead::default(),
        }
    }
}

#[async_trait]
impl SignalingTransport for ClientWebSocketTransport {
    async fn send(&mut self, envelope: &Envelope) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(SignalingError::TransportClosed)?;
        let text = envelope.encode()?;
        stream
            .send(Message::Text(text))
            .await
            .map_err(|_| SignalingError::TransportClosed)
    }

    async fn recv(&mut self) -> Option<Result<Envelope>> {
        if let Some(queued) = self.ahead.queued.pop_front() {
            return Some(queued);
        }
        if self.ahead.ended {
            self.stream = None;
            return None;
        }
        loop {
            let stream = self.stream.as_mut()?;
            match client_frame(stream.next().await) {
                Frame::Envelope(envelope) => return Some(envelope),
                Frame::Control => continue,
                Frame::End(error) => {
                    self.stream = None;
                    return error.map(Err);
                }
            }
        }
    }

    async fn is_closed(&mut self) -> bool {
        let Some(stream) = self.stream.as_mut() else {
            return true;
        };
        while !self.ahead.ended {
            let Some(frame) = stream.next().now_or_never() else {
                break;
            };
            self.ahead.push(client_frame(frame));
        }
        self.ahead.ended
    }

    async fn close(&mut self) {
        self.ahead.ended = true;
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.close(None).await;
        }
    }
}

/// In-process transport. The other end is a [`MemoryPeer`] that speaks raw
/// text frames, so malformed input can be injected.
pub struct MemoryTransport {
    inbound: mpsc::UnboundedReceiver<String>,
    outbound: Option<mpsc::UnboundedSender<String>>,
}

/// Remote end of a [`MemoryTransport`].
pub struct MemoryPeer {
    tx: mpsc::UnboundedSender<String>,
    rx: mpsc::UnboundedReceiver<String>,
}

pub fn memory_pair() -> (MemoryTransport, MemoryPeer) {
    let (to_local, inbound) = mpsc::unbounded_channel();
    let (outbound, from_local) = mpsc::unbounded_channel();
    (
        MemoryTransport {
            inbound,
            outbound: Some(outbound),
        },
        MemoryPeer {
            tx: to_local,
            rx: from_local,
        },
    )
}

#[async_trait]
impl SignalingTransport for MemoryTransport {
    async fn send(&mut self, envelope: &Envelope) -> Result<()> {
        let outbound = self.outbound.as_ref().ok_or(SignalingError::TransportClosed)?;
        outbound
            .send(envelope.encode()?)
            .map_err(|_| SignalingError::TransportClosed)
    }

    async fn recv(&mut self) -> Option<Result<Envelope>> {
        self.inbound.recv().await.map(|text| Envelope::decode(&text))
    }

    async fn is_closed(&mut self) -> bool {
        match &self.outbound {
            Some(outbound) => outbound.is_closed() || self.inbound.is_closed(),
            None => true,
        }
    }

    async fn close(&mut self) {
        self.outbound = None;
        self.inbound.close();
    }
}

impl MemoryPeer {
    pub fn send(&self, envelope: &Envelope) -> Result<()> {
        self.send_raw(envelope.encode()?)
    }

    pub fn send_raw(&self, text: impl Into<String>) -> Result<()> {
        self.tx
            .send(text.into())
            .map_err(|_| SignalingError::TransportClosed)
    }

    /// Next envelope sent by the local side, `None` once it closed.
    pub async fn recv(&mut self) -> Option<Result<Envelope>> {
        self.rx.recv().await.map(|text| Envelope::decode(&text))
    }

    /// Splits into the raw sending and receiving halves, so a test can drop
    /// either direction on its own.
    pub fn into_parts(
        self,
    ) -> (
        mpsc::UnboundedSender<String>,
        mpsc::UnboundedReceiver<String>,
    ) {
        (self.tx, self.rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SessionDescription;

    #[tokio::test]
    async fn fifo_in_both_directions() {
        let (mut local, mut remote) = memory_pair();

        remote.send(&Envelope::Ice(None)).unwrap();
        remote
            .send(&Envelope::Sdp(SessionDescription::offer("v=0\r\n")))
            .unwrap();
        assert_eq!(local.recv().await.unwrap().unwrap(), Envelope::Ice(None));
        assert!(matches!(local.recv().await, Some(Ok(Envelope::Sdp(_)))));

        local.send(&Envelope::Ice(None)).await.unwrap();
        assert_eq!(remote.recv().await.unwrap().unwrap(), Envelope::Ice(None));
    }

    #[tokio::test]
    async fn malformed_frame_does_not_end_the_stream() {
        let (mut local, remote) = memory_pair();
        remote.send_raw("{").unwrap();
        remote.send(&Envelope::Ice(None)).unwrap();

        assert!(matches!(local.recv().await, Some(Err(SignalingError::Decode(_)))));
        assert_eq!(local.recv().await.unwrap().unwrap(), Envelope::Ice(None));
    }

    #[tokio::test]
    async fn send_after_close_fails() {
        let (mut local, mut remote) = memory_pair();
        local.close().await;
        local.close().await;

        assert!(matches!(
            local.send(&Envelope::Ice(None)).await,
            Err(SignalingError::TransportClosed)
        ));
        assert!(remote.recv().await.is_none());
    }

    #[tokio::test]
    async fn hangup_is_seen_before_queued_frames_are_read() {
        let (mut local, remote) = memory_pair();
        assert!(!local.is_closed().await);

        let (tx, _rx) = remote.into_parts();
        tx.send(Envelope::Ice(None).encode().unwrap()).unwrap();
        drop(tx);

        assert!(local.is_closed().await);
        assert_eq!(local.recv().await.unwrap().unwrap(), Envelope::Ice(None));
        assert!(local.recv().await.is_none());
    }

    #[tokio::test]
    async fn remote_hangup_ends_the_stream() {
        let (mut local, remote) = memory_pair();
        drop(remote);
        assert!(local.recv().await.is_none());
        assert!(matches!(
            local.send(&Envelope::Ice(None)).await,
            Err(SignalingError::TransportClosed)
        ));
    }
}

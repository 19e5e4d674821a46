//! Wire format of the signaling channel
//!
//! Every message is a JSON object `{"action": ..., "payload": ...}` where the
//! action selects the payload shape.

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// One message on the signaling channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "payload", rename_all = "lowercase")]
pub enum Envelope {
    /// A session description (offer from the client, answer from the server).
    Sdp(SessionDescription),
    /// A trickled ICE candidate; `None` marks end-of-candidates.
    Ice(Option<IceCandidate>),
    /// Pointer input for the application layer. Not part of negotiation.
    Pos(PointerEvent),
}

impl Envelope {
    pub fn decode(text: &str) -> Result<Envelope> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn decode_slice(data: &[u8]) -> Result<Envelope> {
        Ok(serde_json::from_slice(data)?)
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Short name of the action, for logging.
    pub fn action(&self) -> &'static str {
        match self {
            Envelope::Sdp(_) => "sdp",
            Envelope::Ice(_) => "ice",
            Envelope::Pos(_) => "pos",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        SessionDescription {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        SessionDescription {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// A trickled ICE candidate as browsers serialize `RTCIceCandidate`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default)]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        IceCandidate {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: Some(0),
            username_fragment: None,
        }
    }

    /// Browsers signal end-of-candidates either with `null` or with an
    /// empty candidate line.
    pub fn is_end_of_candidates(&self) -> bool {
        self.candidate.trim().is_empty()
    }
}

/// Pointer input, coordinates normalized to the target surface's bounding box.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PointerEvent {
    pub kind: PointerKind,
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum PointerKind {
    Down,
    Move,
    Up,
}

impl TryFrom<u8> for PointerKind {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(PointerKind::Down),
            1 => Ok(PointerKind::Move),
            2 => Ok(PointerKind::Up),
            v => Err(format!("unknown pointer kind {v}")),
        }
    }
}

impl From<PointerKind> for u8 {
    fn from(kind: PointerKind) -> u8 {
        match kind {
            PointerKind::Down => 0,
            PointerKind::Move => 1,
            PointerKind::Up => 2,
        }
    }
}

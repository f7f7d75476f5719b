use serde::Serialize;
use std::fmt;
use std::sync::Arc;

use crate::image_stream::DecodedImage;
use crate::protocol::Camera;

/// State of the link to the server. Owned by the session, never by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Lost,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting...",
            ConnectionState::Connected => "established",
            ConnectionState::Lost => "lost",
        };
        f.write_str(text)
    }
}

/// Whether the capture device is present behind the server.
/// Independent of [`ConnectionState`]: the link can be up with no peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerPresence {
    Unknown,
    Connected,
    Disconnected,
}

impl fmt::Display for PeerPresence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            PeerPresence::Unknown => "unknown",
            PeerPresence::Connected => "connected",
            PeerPresence::Disconnected => "disconnected",
        };
        f.write_str(text)
    }
}

/// Everything the UI gets to see. Push-only; the consumer keeps the last value.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum SessionEvent {
    ConnectionStatus(ConnectionState),
    PeerStatus(PeerPresence),
    /// Server refused us; it is expected to drop the link shortly
    LimitReached,
    /// Whether commands to the peer make sense right now
    SendEnabled(bool),
    TransferStarted {
        expected_chars: usize,
        size_kb: u64,
    },
    TransferProgress(u8),
    ImageDecoded(Arc<DecodedImage>),
    /// Previous image withdrawn because a new one was requested
    ImageCleared,
    TransferFailed(String),
    /// Always follows a transfer, whatever its outcome
    TransferComplete,
    /// Any server line without special meaning
    Message(String),
    CamerasChanged(Vec<Camera>),
}

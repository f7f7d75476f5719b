//! Wire vocabulary of the control link.
//!
//! Everything is newline-terminated text, one directive per line. Outbound
//! lines are rendered from [`Command`]; inbound control lines are recognised
//! by [`Directive::classify`]. Image payload framing lives in `image_stream`.

use serde::Serialize;

pub const IDENTIFY: &str = "ID:CONTROL";
pub const PING: &str = "PING";
pub const PONG: &str = "PONG";
pub const LIST_CAMERAS: &str = "camList";
pub const TAKE_PHOTO_PREFIX: &str = "TAKE_PHOTO_";

pub const PEER_CONNECTED: &str = "SERVER_STATUS: PEER_CONNECTED";
pub const PEER_DISCONNECTED: &str = "SERVER_STATUS: PEER_DISCONNECTED";
pub const LIMIT_REACHED: &str = "SERVER_ERROR: CONNECTION_LIMIT_REACHED";

/// Separator between camera id and description in a registry entry.
pub const CAMERA_DELIMITER: &str = " -- ";

/// Outbound directives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Role announcement, sent once per established link
    Identify,
    /// Liveness check
    Ping,
    /// Ask the peer for its camera registry
    ListCameras,
    /// Capture a still from one camera
    TakePhoto(i32),
    /// Anything typed by the user, passed through untouched
    Raw(String),
}

impl Command {
    pub fn to_line(&self) -> String {
        match self {
            Command::Identify => IDENTIFY.to_string(),
            Command::Ping => PING.to_string(),
            Command::ListCameras => LIST_CAMERAS.to_string(),
            Command::TakePhoto(id) => format!("{TAKE_PHOTO_PREFIX}{id}"),
            Command::Raw(text) => text.clone(),
        }
    }
}

/// Inbound lines that drive session state rather than being shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    Heartbeat,
    PeerConnected,
    PeerDisconnected,
    LimitReached,
}

impl Directive {
    /// Recognise a control line. `line` is expected to be trimmed already.
    pub fn classify(line: &str) -> Option<Self> {
        if line.eq_ignore_ascii_case(PING) || line.eq_ignore_ascii_case(PONG) {
            Some(Directive::Heartbeat)
        } else if line.starts_with(PEER_CONNECTED) {
            Some(Directive::PeerConnected)
        } else if line.starts_with(PEER_DISCONNECTED) {
            Some(Directive::PeerDisconnected)
        } else if line.starts_with(LIMIT_REACHED) {
            Some(Directive::LimitReached)
        } else {
            None
        }
    }
}

/// One camera as announced by the peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Camera {
    pub id: i32,
    pub description: String,
}

/// Outcome of looking at a line as a possible camera entry.
#[derive(Debug, PartialEq, Eq)]
pub enum CameraLine {
    /// No delimiter, so not a camera entry at all
    NotCamera,
    /// Has the delimiter but does not parse
    Malformed,
    Entry(Camera),
}

/// Parse `<id> -- <description>`. Exactly two parts, integer id, both trimmed.
pub fn parse_camera_line(line: &str) -> CameraLine {
    if !line.contains(CAMERA_DELIMITER) {
        return CameraLine::NotCamera;
    }

    let parts: Vec<&str> = line.split(CAMERA_DELIMITER).collect();
    if parts.len() != 2 {
        return CameraLine::Malformed;
    }

    match parts[0].trim().parse::<i32>() {
        Ok(id) => CameraLine::Entry(Camera {
            id,
            description: parts[1].trim().to_string(),
        }),
        Err(_) => CameraLine::Malformed,
    }
}

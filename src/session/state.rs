//! The session state machine, free of I/O.
//!
//! Every input (user request, transport event, timer expiry, decode outcome)
//! goes through one method that mutates the state and returns the [`Effect`]s
//! the driver must carry out. Timers are tracked here as armed/disarmed so the
//! heartbeat/reconnect exclusivity can be checked without a clock.

use log::{debug, info, warn};
use std::sync::Arc;

use super::events::{ConnectionState, PeerPresence, SessionEvent};
use super::registry::CameraRegistry;
use crate::config::Endpoint;
use crate::error::DecodeError;
use crate::image_stream::{Consume, DecodedImage, ImageStreamDecoder, Payload, TransferStep};
use crate::protocol::{parse_camera_line, CameraLine, Command, Directive};
use crate::transport::{TransportEvent, TransportEventKind};

/// Server status lines are handled as directives or ignored, never shown.
const SERVER_STATUS_PREFIX: &str = "SERVER_STATUS:";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timer {
    /// One-shot, sends the identification line
    Identify,
    /// One-shot, starts the heartbeat
    HeartbeatStart,
    /// Periodic ping, first tick immediately
    Heartbeat,
    /// One-shot, fires a single reconnect attempt
    Reconnect,
}

#[derive(Debug)]
pub enum Effect {
    Emit(SessionEvent),
    Send(Command),
    /// Close whatever transport exists and start this attempt
    OpenTransport { endpoint: Endpoint, attempt: u64 },
    CloseTransport,
    Arm(Timer),
    Cancel(Timer),
    /// Decode off the session task and report back through `on_decoded`
    Decode(Payload),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ArmedTimers {
    pub identify: bool,
    pub heartbeat_start: bool,
    pub heartbeat: bool,
    pub reconnect: bool,
}

impl ArmedTimers {
    fn slot(&mut self, timer: Timer) -> &mut bool {
        match timer {
            Timer::Identify => &mut self.identify,
            Timer::HeartbeatStart => &mut self.heartbeat_start,
            Timer::Heartbeat => &mut self.heartbeat,
            Timer::Reconnect => &mut self.reconnect,
        }
    }
}

pub struct SessionState {
    connection: ConnectionState,
    peer: PeerPresence,
    endpoint: Option<Endpoint>,
    attempt: u64,
    registry: CameraRegistry,
    decoder: ImageStreamDecoder,
    decodes_in_flight: usize,
    photo_requested: bool,
    send_enabled: bool,
    timers: ArmedTimers,
    shut_down: bool,
}

impl SessionState {
    pub fn new(decoder: ImageStreamDecoder) -> Self {
        Self {
            connection: ConnectionState::Disconnected,
            peer: PeerPresence::Unknown,
            endpoint: None,
            attempt: 0,
            registry: CameraRegistry::new(),
            decoder,
            decodes_in_flight: 0,
            photo_requested: false,
            send_enabled: false,
            timers: ArmedTimers::default(),
            shut_down: false,
        }
    }

    // --- requests ---

    /// Explicit connect. Records the endpoint even when already connected.
    pub fn connect(&mut self, endpoint: Endpoint) -> Vec<Effect> {
        let mut fx = Vec::new();
        if self.shut_down {
            return fx;
        }

        self.endpoint = Some(endpoint);
        if self.connection == ConnectionState::Connected {
            debug!("connect requested while connected, ignoring");
            return fx;
        }

        self.begin_attempt(&mut fx);
        fx
    }

    /// Forward a command to the server. No-op unless connected.
    pub fn send_command(&mut self, command: Command) -> Vec<Effect> {
        let mut fx = Vec::new();
        if self.connection != ConnectionState::Connected {
            debug!("not connected, dropping {:?}", command);
            return fx;
        }
        fx.push(Effect::Send(command));
        fx
    }

    /// Ask the peer for a photo and withdraw the currently shown one.
    pub fn request_photo(&mut self, camera_id: i32) -> Vec<Effect> {
        let mut fx = self.send_command(Command::TakePhoto(camera_id));
        if fx.is_empty() {
            return fx;
        }
        self.photo_requested = true;
        fx.push(Effect::Emit(SessionEvent::ImageCleared));
        self.refresh_send_enabled(&mut fx);
        fx
    }

    pub fn shutdown(&mut self) -> Vec<Effect> {
        let mut fx = Vec::new();
        if self.shut_down {
            return fx;
        }
        self.shut_down = true;

        for timer in [
            Timer::Identify,
            Timer::HeartbeatStart,
            Timer::Heartbeat,
            Timer::Reconnect,
        ] {
            self.cancel(timer, &mut fx);
        }
        fx.push(Effect::CloseTransport);
        self.decoder.abort();

        if self.connection != ConnectionState::Disconnected {
            self.connection = ConnectionState::Disconnected;
            fx.push(Effect::Emit(SessionEvent::ConnectionStatus(
                ConnectionState::Disconnected,
            )));
        }
        info!("session shut down");
        fx
    }

    // --- timers ---

    pub fn on_identify_due(&mut self) -> Vec<Effect> {
        let mut fx = Vec::new();
        self.timers.identify = false;
        if self.connection == ConnectionState::Connected {
            fx.push(Effect::Send(Command::Identify));
        }
        fx
    }

    pub fn on_heartbeat_start_due(&mut self) -> Vec<Effect> {
        let mut fx = Vec::new();
        self.timers.heartbeat_start = false;
        if self.connection == ConnectionState::Connected {
            self.arm(Timer::Heartbeat, &mut fx);
        }
        fx
    }

    pub fn on_heartbeat_tick(&mut self) -> Vec<Effect> {
        let mut fx = Vec::new();
        if self.connection == ConnectionState::Connected {
            fx.push(Effect::Send(Command::Ping));
        }
        fx
    }

    pub fn on_reconnect_due(&mut self) -> Vec<Effect> {
        let mut fx = Vec::new();
        self.timers.reconnect = false;
        if self.shut_down || self.connection != ConnectionState::Lost {
            return fx;
        }
        if let Some(endpoint) = &self.endpoint {
            info!("reconnecting to {}", endpoint);
        }
        self.begin_attempt(&mut fx);
        fx
    }

    // --- transport ---

    pub fn on_transport(&mut self, event: TransportEvent) -> Vec<Effect> {
        let mut fx = Vec::new();
        if self.shut_down {
            return fx;
        }
        if event.attempt != self.attempt {
            debug!("stale event from attempt {}: {:?}", event.attempt, event.kind);
            return fx;
        }

        match event.kind {
            TransportEventKind::Established => self.on_established(&mut fx),
            TransportEventKind::Line(line) => {
                if self.connection == ConnectionState::Connected {
                    self.route_line(&line, &mut fx);
                }
            }
            TransportEventKind::Lost => self.on_lost(&mut fx),
            TransportEventKind::Closed => {
                debug!("attempt {} closed", event.attempt);
            }
        }
        fx
    }

    fn begin_attempt(&mut self, fx: &mut Vec<Effect>) {
        let Some(endpoint) = self.endpoint.clone() else {
            return;
        };

        self.cancel(Timer::Reconnect, fx);
        self.attempt += 1;
        self.connection = ConnectionState::Connecting;
        fx.push(Effect::Emit(SessionEvent::ConnectionStatus(
            ConnectionState::Connecting,
        )));
        fx.push(Effect::OpenTransport {
            endpoint,
            attempt: self.attempt,
        });
    }

    fn on_established(&mut self, fx: &mut Vec<Effect>) {
        if self.connection != ConnectionState::Connecting {
            return;
        }
        self.connection = ConnectionState::Connected;
        fx.push(Effect::Emit(SessionEvent::ConnectionStatus(
            ConnectionState::Connected,
        )));
        self.cancel(Timer::Reconnect, fx);
        self.arm(Timer::Identify, fx);
        self.arm(Timer::HeartbeatStart, fx);
    }

    fn on_lost(&mut self, fx: &mut Vec<Effect>) {
        if !matches!(
            self.connection,
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            return;
        }

        self.connection = ConnectionState::Lost;
        fx.push(Effect::Emit(SessionEvent::ConnectionStatus(
            ConnectionState::Lost,
        )));
        // The peer sits behind the server, so assume it is gone too
        self.peer = PeerPresence::Disconnected;
        fx.push(Effect::Emit(SessionEvent::PeerStatus(
            PeerPresence::Disconnected,
        )));

        if self.decoder.abort() {
            warn!("connection lost during an image transfer");
            fx.push(Effect::Emit(SessionEvent::TransferFailed(
                "connection lost during transfer".to_string(),
            )));
            fx.push(Effect::Emit(SessionEvent::TransferComplete));
        }
        self.photo_requested = false;

        self.cancel(Timer::Identify, fx);
        self.cancel(Timer::HeartbeatStart, fx);
        self.cancel(Timer::Heartbeat, fx);
        fx.push(Effect::CloseTransport);
        self.arm(Timer::Reconnect, fx);
        self.refresh_send_enabled(fx);
    }

    // --- inbound lines ---

    fn route_line(&mut self, raw: &str, fx: &mut Vec<Effect>) {
        let line = raw.trim();

        if let Some(directive) = Directive::classify(line) {
            self.on_directive(directive, fx);
            return;
        }

        match self.decoder.consume(line) {
            Consume::Consumed(step) => {
                if let Some(step) = step {
                    self.on_transfer_step(step, fx);
                }
                return;
            }
            Consume::NotConsumed => {}
        }

        match parse_camera_line(line) {
            CameraLine::Entry(camera) => {
                let id = camera.id;
                if self.registry.insert(camera) {
                    fx.push(Effect::Emit(SessionEvent::CamerasChanged(
                        self.registry.cameras().to_vec(),
                    )));
                } else {
                    debug!("camera {} already known", id);
                }
            }
            CameraLine::Malformed => warn!("malformed camera entry: {:?}", line),
            CameraLine::NotCamera => {
                if line.starts_with(SERVER_STATUS_PREFIX) {
                    debug!("unhandled server status: {}", line);
                } else {
                    fx.push(Effect::Emit(SessionEvent::Message(line.to_string())));
                }
            }
        }
    }

    fn on_directive(&mut self, directive: Directive, fx: &mut Vec<Effect>) {
        match directive {
            Directive::Heartbeat => {}
            Directive::PeerConnected => {
                info!("peer connected");
                self.peer = PeerPresence::Connected;
                // A fresh peer announces its cameras again
                if !self.registry.is_empty() {
                    self.registry.clear();
                    fx.push(Effect::Emit(SessionEvent::CamerasChanged(Vec::new())));
                }
                fx.push(Effect::Emit(SessionEvent::PeerStatus(PeerPresence::Connected)));
                fx.push(Effect::Send(Command::ListCameras));
                self.refresh_send_enabled(fx);
            }
            Directive::PeerDisconnected => {
                info!("peer disconnected");
                self.peer = PeerPresence::Disconnected;
                self.photo_requested = false;
                fx.push(Effect::Emit(SessionEvent::PeerStatus(
                    PeerPresence::Disconnected,
                )));
                self.refresh_send_enabled(fx);
            }
            Directive::LimitReached => {
                warn!("server connection limit reached");
                fx.push(Effect::Emit(SessionEvent::LimitReached));
            }
        }
    }

    fn on_transfer_step(&mut self, step: TransferStep, fx: &mut Vec<Effect>) {
        match step {
            TransferStep::Started {
                expected_chars,
                size_kb,
            } => {
                fx.push(Effect::Emit(SessionEvent::TransferStarted {
                    expected_chars,
                    size_kb,
                }));
                self.refresh_send_enabled(fx);
            }
            TransferStep::Progress(percent) => {
                fx.push(Effect::Emit(SessionEvent::TransferProgress(percent)));
            }
            TransferStep::Finished(payload) => {
                if payload.is_empty() {
                    debug!("empty payload, skipping decode");
                    self.complete_transfer(fx);
                } else {
                    self.decodes_in_flight += 1;
                    fx.push(Effect::Decode(payload));
                }
            }
        }
    }

    // --- decode ---

    pub fn on_decoded(&mut self, outcome: Result<DecodedImage, DecodeError>) -> Vec<Effect> {
        let mut fx = Vec::new();
        self.decodes_in_flight = self.decodes_in_flight.saturating_sub(1);

        match outcome {
            Ok(image) => {
                info!(
                    "snapshot decoded: {}x{} {} ({} bytes)",
                    image.width(),
                    image.height(),
                    image.extension(),
                    image.encoded_len()
                );
                fx.push(Effect::Emit(SessionEvent::ImageDecoded(Arc::new(image))));
            }
            Err(e) => {
                warn!("snapshot decode failed: {}", e);
                fx.push(Effect::Emit(SessionEvent::TransferFailed(e.to_string())));
            }
        }
        self.complete_transfer(&mut fx);
        fx
    }

    fn complete_transfer(&mut self, fx: &mut Vec<Effect>) {
        self.decoder.finish_transfer();
        self.photo_requested = false;
        fx.push(Effect::Emit(SessionEvent::TransferComplete));
        self.refresh_send_enabled(fx);
    }

    // --- helpers ---

    fn arm(&mut self, timer: Timer, fx: &mut Vec<Effect>) {
        *self.timers.slot(timer) = true;
        fx.push(Effect::Arm(timer));
    }

    fn cancel(&mut self, timer: Timer, fx: &mut Vec<Effect>) {
        let slot = self.timers.slot(timer);
        if *slot {
            *slot = false;
            fx.push(Effect::Cancel(timer));
        }
    }

    fn refresh_send_enabled(&mut self, fx: &mut Vec<Effect>) {
        let enabled = self.peer == PeerPresence::Connected
            && !self.photo_requested
            && !self.decoder.is_receiving()
            && self.decodes_in_flight == 0;
        if enabled != self.send_enabled {
            self.send_enabled = enabled;
            fx.push(Effect::Emit(SessionEvent::SendEnabled(enabled)));
        }
    }
}

/// Read-only views for assertions.
#[cfg(test)]
impl SessionState {
    pub fn connection(&self) -> ConnectionState {
        self.connection
    }

    pub fn peer(&self) -> PeerPresence {
        self.peer
    }

    pub fn endpoint(&self) -> Option<&Endpoint> {
        self.endpoint.as_ref()
    }

    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    pub fn registry(&self) -> &CameraRegistry {
        &self.registry
    }

    pub fn timers(&self) -> ArmedTimers {
        self.timers
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }
}

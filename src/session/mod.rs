//! Session controller: the one component the UI talks to.
//!
//! A single task owns the [`SessionState`], every timer and the current
//! [`Transport`]. Requests from the UI, transport events and decode outcomes
//! all arrive on channels and are handled one at a time, so nothing here needs
//! a lock. Timers are plain owned values; cancelling one drops it, so an
//! expiry can never leak into a later connection.

pub mod events;
pub mod registry;
pub mod state;

pub use events::SessionEvent;
pub use state::{Effect, SessionState, Timer};

use log::{debug, warn};
use std::future::pending;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{interval, sleep, Interval, MissedTickBehavior, Sleep};

use crate::config::{Endpoint, SessionConfig};
use crate::error::DecodeError;
use crate::image_stream::{spawn_decode_worker, DecodedImage, ImageStreamDecoder, Payload};
use crate::protocol::Command;
use crate::transport::{Transport, TransportEvent};

#[derive(Debug)]
enum Request {
    Connect(Endpoint),
    Send(Command),
    RequestPhoto(i32),
    Shutdown,
}

/// Cheap, cloneable way into the session task. Every call is fire-and-forget
/// and silently does nothing once the session has stopped.
#[derive(Clone)]
pub struct SessionHandle {
    requests: mpsc::UnboundedSender<Request>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl SessionHandle {
    pub fn connect(&self, endpoint: Endpoint) {
        self.request(Request::Connect(endpoint));
    }

    /// Send a line to the server. Dropped unless connected.
    pub fn send_command(&self, text: impl Into<String>) {
        self.request(Request::Send(Command::Raw(text.into())));
    }

    pub fn request_photo(&self, camera_id: i32) {
        self.request(Request::RequestPhoto(camera_id));
    }

    /// Stop timers, close the link and end the session task. Idempotent.
    pub fn shutdown(&self) {
        self.request(Request::Shutdown);
    }

    /// Wait for the session task to end. Only the first caller observes a
    /// panic; later calls return once the task is gone.
    pub async fn join(&self) -> Result<(), JoinError> {
        let mut task = self.task.lock().await;
        match task.take() {
            Some(running) => running.await,
            None => Ok(()),
        }
    }

    fn request(&self, request: Request) {
        if self.requests.send(request).is_err() {
            debug!("session already stopped");
        }
    }
}

/// Start a session task around `decoder`. It stays idle until
/// [`SessionHandle::connect`] and ends on shutdown or when every handle is dropped.
pub fn spawn(
    config: SessionConfig,
    decoder: ImageStreamDecoder,
) -> (SessionHandle, mpsc::UnboundedReceiver<SessionEvent>) {
    let (request_tx, request_rx) = mpsc::unbounded_channel::<Request>();
    let (event_tx, event_rx) = mpsc::unbounded_channel::<SessionEvent>();
    let (transport_tx, transport_rx) = mpsc::unbounded_channel::<TransportEvent>();
    let (decoded_tx, decoded_rx) = mpsc::unbounded_channel::<Result<DecodedImage, DecodeError>>();
    let decode_queue = spawn_decode_worker(decoded_tx);

    let driver = Driver {
        config,
        state: SessionState::new(decoder),
        requests: request_rx,
        events: event_tx,
        transport_tx,
        transport_rx,
        decode_queue,
        decoded_rx,
        transport: None,
        timers: Timers::default(),
    };
    let task = tokio::spawn(driver.run());

    let handle = SessionHandle {
        requests: request_tx,
        task: Arc::new(Mutex::new(Some(task))),
    };
    (handle, event_rx)
}

#[derive(Default)]
struct Timers {
    identify: Option<Pin<Box<Sleep>>>,
    heartbeat_start: Option<Pin<Box<Sleep>>>,
    heartbeat: Option<Interval>,
    reconnect: Option<Pin<Box<Sleep>>>,
}

enum Step {
    Request(Request),
    Transport(TransportEvent),
    Decoded(Result<DecodedImage, DecodeError>),
    IdentifyDue,
    HeartbeatStartDue,
    HeartbeatTick,
    ReconnectDue,
}

struct Driver {
    config: SessionConfig,
    state: SessionState,
    requests: mpsc::UnboundedReceiver<Request>,
    events: mpsc::UnboundedSender<SessionEvent>,
    transport_tx: mpsc::UnboundedSender<TransportEvent>,
    transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    /// Finished payloads, decoded strictly in arrival order
    decode_queue: mpsc::UnboundedSender<Payload>,
    decoded_rx: mpsc::UnboundedReceiver<Result<DecodedImage, DecodeError>>,
    transport: Option<Transport>,
    timers: Timers,
}

impl Driver {
    async fn run(mut self) {
        loop {
            let step = self.next_step().await;
            let stopping = matches!(step, Step::Request(Request::Shutdown));

            let effects = match step {
                Step::Request(Request::Connect(endpoint)) => self.state.connect(endpoint),
                Step::Request(Request::Send(command)) => self.state.send_command(command),
                Step::Request(Request::RequestPhoto(id)) => self.state.request_photo(id),
                Step::Request(Request::Shutdown) => self.state.shutdown(),
                Step::Transport(event) => self.state.on_transport(event),
                Step::Decoded(outcome) => self.state.on_decoded(outcome),
                Step::IdentifyDue => self.state.on_identify_due(),
                Step::HeartbeatStartDue => self.state.on_heartbeat_start_due(),
                Step::HeartbeatTick => self.state.on_heartbeat_tick(),
                Step::ReconnectDue => self.state.on_reconnect_due(),
            };
            for effect in effects {
                self.apply(effect);
            }

            if stopping {
                break;
            }
        }
        debug!("session task finished");
    }

    async fn next_step(&mut self) -> Step {
        tokio::select! {
            // All handles gone means nobody can shut us down any more
            request = self.requests.recv() => Step::Request(request.unwrap_or(Request::Shutdown)),
            Some(event) = self.transport_rx.recv() => Step::Transport(event),
            Some(outcome) = self.decoded_rx.recv() => Step::Decoded(outcome),
            _ = expire(&mut self.timers.identify) => Step::IdentifyDue,
            _ = expire(&mut self.timers.heartbeat_start) => Step::HeartbeatStartDue,
            _ = tick(&mut self.timers.heartbeat) => Step::HeartbeatTick,
            _ = expire(&mut self.timers.reconnect) => Step::ReconnectDue,
        }
    }

    fn apply(&mut self, effect: Effect) {
        match effect {
            Effect::Emit(event) => {
                let _ = self.events.send(event);
            }
            Effect::Send(command) => {
                if let Some(transport) = &self.transport {
                    transport.send(command.to_line());
                }
            }
            Effect::OpenTransport { endpoint, attempt } => {
                self.close_transport();
                self.transport = Some(Transport::connect(
                    endpoint,
                    attempt,
                    self.config.transport,
                    self.transport_tx.clone(),
                ));
            }
            Effect::CloseTransport => self.close_transport(),
            Effect::Arm(timer) => self.arm(timer),
            Effect::Cancel(timer) => match timer {
                Timer::Identify => self.timers.identify = None,
                Timer::HeartbeatStart => self.timers.heartbeat_start = None,
                Timer::Heartbeat => self.timers.heartbeat = None,
                Timer::Reconnect => self.timers.reconnect = None,
            },
            Effect::Decode(payload) => {
                if self.decode_queue.send(payload).is_err() {
                    warn!("decode worker gone, dropping snapshot");
                }
            }
        }
    }

    fn arm(&mut self, timer: Timer) {
        match timer {
            Timer::Identify => {
                self.timers.identify = Some(Box::pin(sleep(self.config.identify_delay)));
            }
            Timer::HeartbeatStart => {
                self.timers.heartbeat_start =
                    Some(Box::pin(sleep(self.config.heartbeat_start_delay)));
            }
            Timer::Heartbeat => {
                let mut heartbeat = interval(self.config.heartbeat_interval);
                heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
                self.timers.heartbeat = Some(heartbeat);
            }
            Timer::Reconnect => {
                debug!("reconnect in {:?}", self.config.reconnect_delay);
                self.timers.reconnect = Some(Box::pin(sleep(self.config.reconnect_delay)));
            }
        }
    }

    fn close_transport(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            debug!("closing attempt {}", transport.attempt());
            transport.close();
        }
    }
}

/// Completes when the one-shot timer fires and disarms it. Never completes if unarmed.
async fn expire(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer.as_mut() {
        Some(deadline) => {
            deadline.as_mut().await;
            *timer = None;
        }
        None => pending().await,
    }
}

async fn tick(timer: &mut Option<Interval>) {
    match timer.as_mut() {
        Some(heartbeat) => {
            heartbeat.tick().await;
        }
        None => pending().await,
    }
}

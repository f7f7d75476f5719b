//! Raw TCP link to the server.
//!
//! One worker task per connection attempt owns the socket for its whole life:
//! it connects, reads newline-delimited lines and performs every write. The
//! owner talks to it only through channels, so neither side ever waits on the
//! other. No protocol semantics live here.

use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

use crate::config::{Endpoint, TransportConfig};
use crate::error::TransportError;

/// Lifecycle of one attempt, in order: `Established`, any number of `Line`,
/// then exactly one of `Lost` / `Closed`. A failed connect yields a lone `Lost`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEventKind {
    Established,
    /// One non-blank line, terminator stripped, otherwise untouched
    Line(String),
    /// Any fault: connect failure, socket error, EOF
    Lost,
    /// Worker stopped because the owner called `close()`
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportEvent {
    pub attempt: u64,
    pub kind: TransportEventKind,
}

/// Handle to a single connection attempt.
pub struct Transport {
    attempt: u64,
    outgoing: mpsc::UnboundedSender<String>,
    stop: watch::Sender<bool>,
    connected: Arc<AtomicBool>,
}

impl Transport {
    /// Start an attempt in the background. Events for it are tagged with `attempt`.
    pub fn connect(
        endpoint: Endpoint,
        attempt: u64,
        config: TransportConfig,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Self {
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel::<String>();
        let (stop_tx, stop_rx) = watch::channel(false);
        let connected = Arc::new(AtomicBool::new(false));

        let worker = Worker {
            attempt,
            config,
            events,
            outgoing: outgoing_rx,
            stop: stop_rx,
            connected: connected.clone(),
        };
        tokio::spawn(worker.run(endpoint));

        Self {
            attempt,
            outgoing: outgoing_tx,
            stop: stop_tx,
            connected,
        }
    }

    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    /// True between `Established` and the terminal event.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Fire-and-forget. Dropped when not connected; write failures are swallowed by the worker.
    pub fn send(&self, line: impl Into<String>) {
        let line = line.into();
        if !self.is_connected() {
            debug!("attempt {}: not connected, dropping {:?}", self.attempt, line);
            return;
        }
        let _ = self.outgoing.send(line);
    }

    /// Stop the worker and release the socket. Idempotent.
    pub fn close(&mut self) {
        self.connected.store(false, Ordering::SeqCst);
        self.stop.send_replace(true);
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.close();
    }
}

struct Worker {
    attempt: u64,
    config: TransportConfig,
    events: mpsc::UnboundedSender<TransportEvent>,
    outgoing: mpsc::UnboundedReceiver<String>,
    stop: watch::Receiver<bool>,
    connected: Arc<AtomicBool>,
}

impl Worker {
    async fn run(mut self, endpoint: Endpoint) {
        let opened = tokio::select! {
            opened = open(&endpoint, self.config.connect_timeout) => opened,
            _ = stopped(&mut self.stop) => {
                self.emit(TransportEventKind::Closed);
                return;
            }
        };

        let stream = match opened {
            Ok(stream) => stream,
            Err(e) => {
                warn!("attempt {}: connect to {} failed: {}", self.attempt, endpoint, e);
                self.emit(TransportEventKind::Lost);
                return;
            }
        };

        // close() may have raced the connect
        if *self.stop.borrow() {
            self.emit(TransportEventKind::Closed);
            return;
        }

        info!("attempt {}: connected to {}", self.attempt, endpoint);
        self.connected.store(true, Ordering::SeqCst);
        self.emit(TransportEventKind::Established);

        let outcome = self.pump(stream).await;
        self.connected.store(false, Ordering::SeqCst);

        match outcome {
            Ok(()) => {
                debug!("attempt {}: closed", self.attempt);
                self.emit(TransportEventKind::Closed);
            }
            Err(e) => {
                warn!("attempt {}: connection to {} lost: {}", self.attempt, endpoint, e);
                self.emit(TransportEventKind::Lost);
            }
        }
    }

    /// Read and write until stopped (`Ok`) or the link fails (`Err`).
    async fn pump(&mut self, stream: TcpStream) -> Result<(), TransportError> {
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        // Survives read timeouts so a line split across them is not lost
        let mut pending: Vec<u8> = Vec::new();

        loop {
            tokio::select! {
                _ = stopped(&mut self.stop) => return Ok(()),
                Some(line) = self.outgoing.recv() => {
                    if let Err(e) = write_line(&mut writer, &line).await {
                        debug!("attempt {}: send of {:?} failed: {}", self.attempt, line, e);
                    }
                }
                read = timeout(self.config.read_timeout, reader.read_until(b'\n', &mut pending)) => {
                    match read {
                        // Read timeout: no data yet
                        Err(_) => continue,
                        Ok(Err(e)) => return Err(e.into()),
                        Ok(Ok(0)) => return Err(TransportError::Eof),
                        Ok(Ok(_)) => {
                            let line = take_line(&mut pending);
                            if line.trim().is_empty() {
                                continue;
                            }
                            self.emit(TransportEventKind::Line(line));
                        }
                    }
                }
            }
        }
    }

    fn emit(&self, kind: TransportEventKind) {
        let _ = self.events.send(TransportEvent {
            attempt: self.attempt,
            kind,
        });
    }
}

/// Resolves once `close()` is called or the handle is dropped.
async fn stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}

async fn open(endpoint: &Endpoint, connect_timeout: Duration) -> Result<TcpStream, TransportError> {
    let connecting = async {
        let addr = lookup_host((endpoint.host.as_str(), endpoint.port))
            .await?
            .next()
            .ok_or_else(|| TransportError::Resolve(endpoint.to_string()))?;

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_keepalive(true)?;
        Ok::<_, TransportError>(socket.connect(addr).await?)
    };

    timeout(connect_timeout, connecting)
        .await
        .map_err(|_| TransportError::ConnectTimeout(connect_timeout))?
}

async fn write_line(writer: &mut OwnedWriteHalf, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

/// Drain `pending` into a string without its `\n` / `\r\n` terminator.
fn take_line(pending: &mut Vec<u8>) -> String {
    if pending.last() == Some(&b'\n') {
        pending.pop();
        if pending.last() == Some(&b'\r') {
            pending.pop();
        }
    }
    let line = String::from_utf8_lossy(pending).into_owned();
    pending.clear();
    line
}

//! Line-oriented front-end: prints session events to stdout and turns stdin
//! lines into session requests.

use anyhow::{Context, Result};
use chrono::Local;
use log::{debug, error, info, warn};
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use crate::cli::ConnectOptions;
use crate::config::Endpoint;
use crate::image_stream::{DecodedImage, ImageStreamDecoder, KeepAwake};
use crate::protocol::Camera;
use crate::session::{self, SessionEvent, SessionHandle};

#[derive(Debug, PartialEq)]
pub enum Input {
    Photo(i32),
    Cameras,
    Connect(Endpoint),
    Quit,
    /// Sent to the server as typed
    Raw(String),
    /// Recognised command with unusable arguments
    Invalid(String),
    Empty,
}

pub fn parse_input(line: &str) -> Input {
    let line = line.trim();
    let mut words = line.split_whitespace();

    match words.next() {
        None => Input::Empty,
        Some("quit") | Some("exit") => Input::Quit,
        Some("cams") => Input::Cameras,
        Some("photo") => match words.next().map(str::parse::<i32>) {
            Some(Ok(id)) => Input::Photo(id),
            _ => Input::Invalid("usage: photo <camera id>".to_string()),
        },
        Some("connect") => {
            let host = words.next();
            let port = words.next().map(str::parse::<u16>);
            match (host, port) {
                (Some(host), Some(Ok(port))) => Input::Connect(Endpoint::new(host, port)),
                _ => Input::Invalid("usage: connect <host> <port>".to_string()),
            }
        }
        Some(_) => Input::Raw(line.to_string()),
    }
}

/// Human-readable line for an event, or `None` for events not worth a line.
pub fn describe(event: &SessionEvent) -> Option<String> {
    let text = match event {
        SessionEvent::ConnectionStatus(state) => format!("connection {state}"),
        SessionEvent::PeerStatus(presence) => format!("camera device {presence}"),
        SessionEvent::LimitReached => "server refused: connection limit reached".to_string(),
        SessionEvent::SendEnabled(true) => "ready for photo requests".to_string(),
        SessionEvent::SendEnabled(false) => return None,
        SessionEvent::TransferStarted { size_kb, .. } => {
            format!("receiving snapshot (~{size_kb} KB)")
        }
        SessionEvent::TransferProgress(percent) => format!("receiving snapshot {percent}%"),
        SessionEvent::ImageDecoded(image) => format!(
            "snapshot {}x{} {} ({} bytes)",
            image.width(),
            image.height(),
            image.extension(),
            image.encoded_len()
        ),
        SessionEvent::ImageCleared => return None,
        SessionEvent::TransferFailed(reason) => format!("snapshot failed: {reason}"),
        SessionEvent::TransferComplete => return None,
        SessionEvent::Message(text) => format!("< {text}"),
        SessionEvent::CamerasChanged(cameras) => format!("{} camera(s) available", cameras.len()),
    };
    Some(text)
}

pub fn format_cameras(cameras: &[Camera]) -> String {
    if cameras.is_empty() {
        return "no cameras announced yet".to_string();
    }
    cameras
        .iter()
        .map(|c| format!("  [{}] {}", c.id, c.description))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Write the snapshot bytes as received to `snapshot-<timestamp>.<ext>`.
pub async fn save_snapshot(dir: &Path, image: &DecodedImage) -> Result<PathBuf> {
    let name = format!(
        "snapshot-{}.{}",
        Local::now().format("%Y%m%d-%H%M%S-%3f"),
        image.extension()
    );
    let path = dir.join(name);
    tokio::fs::write(&path, &image.bytes)
        .await
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}

/// A terminal has nothing to keep awake, so transfers are only noted in the log.
struct TransferNotice;

impl KeepAwake for TransferNotice {
    fn acquire(&mut self) {
        info!("snapshot transfer in progress");
    }

    fn release(&mut self) {
        debug!("snapshot transfer settled");
    }
}

struct Console {
    json: bool,
    save_dir: PathBuf,
    cameras: Vec<Camera>,
}

impl Console {
    fn new(json: bool, save_dir: PathBuf) -> Self {
        Self {
            json,
            save_dir,
            cameras: Vec::new(),
        }
    }

    async fn show(&mut self, event: &SessionEvent) {
        if let SessionEvent::CamerasChanged(cameras) = event {
            self.cameras = cameras.clone();
        }

        if self.json {
            match serde_json::to_string(event) {
                Ok(line) => println!("{line}"),
                Err(e) => warn!("could not serialise event: {}", e),
            }
        } else if let Some(line) = describe(event) {
            println!("{line}");
        }

        if let SessionEvent::ImageDecoded(image) = event {
            match save_snapshot(&self.save_dir, image).await {
                Ok(path) => info!("snapshot saved to {}", path.display()),
                Err(e) => error!("{:#}", e),
            }
        }
    }

    /// Returns false once the user asked to leave.
    fn handle_input(&self, handle: &SessionHandle, line: &str) -> bool {
        match parse_input(line) {
            Input::Empty => {}
            Input::Quit => return false,
            Input::Photo(id) => handle.request_photo(id),
            Input::Cameras => println!("{}", format_cameras(&self.cameras)),
            Input::Connect(endpoint) => handle.connect(endpoint),
            Input::Raw(text) => handle.send_command(text),
            Input::Invalid(usage) => eprintln!("{usage}"),
        }
        true
    }

    /// Pump events and input until `quit`, end of input or `interrupt`
    /// resolves, then shut the session down and show what it emits on the way out.
    async fn drive<R, I>(
        &mut self,
        handle: &SessionHandle,
        mut events: mpsc::UnboundedReceiver<SessionEvent>,
        input: R,
        interrupt: I,
    ) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        I: Future<Output = io::Result<()>>,
    {
        let mut lines = input.lines();
        // Created once so a signal between iterations is not lost
        tokio::pin!(interrupt);
        let mut interrupt_armed = true;

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.show(&event).await,
                    None => break,
                },
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if !self.handle_input(handle, &line) {
                            break;
                        }
                    }
                    Ok(None) => {
                        info!("input closed");
                        break;
                    }
                    Err(e) => {
                        warn!("input read failed: {}", e);
                        break;
                    }
                },
                signal = &mut interrupt, if interrupt_armed => match signal {
                    Ok(()) => {
                        info!("interrupted");
                        break;
                    }
                    Err(e) => {
                        warn!("cannot listen for Ctrl-C: {}", e);
                        interrupt_armed = false;
                    }
                },
            }
        }

        handle.shutdown();
        while let Some(event) = events.recv().await {
            self.show(&event).await;
        }
        handle.join().await.context("session task panicked")?;
        Ok(())
    }
}

/// Run one interactive session until `quit`, end of stdin or Ctrl-C.
pub async fn run(options: ConnectOptions) -> Result<()> {
    tokio::fs::create_dir_all(&options.save_dir)
        .await
        .with_context(|| {
            format!(
                "failed to create snapshot directory {}",
                options.save_dir.display()
            )
        })?;

    let decoder = ImageStreamDecoder::new().with_keep_awake(Box::new(TransferNotice));
    let (handle, events) = session::spawn(options.session, decoder);
    info!("connecting to {}", options.endpoint);
    handle.connect(options.endpoint);

    let mut console = Console::new(options.json, options.save_dir);
    let stdin = BufReader::new(tokio::io::stdin());
    console
        .drive(&handle, events, stdin, tokio::signal::ctrl_c())
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SessionConfig, TransportConfig};
    use crate::image_stream::decode::decode_payload;
    use crate::image_stream::decode::tests::sample_png;
    use crate::session::events::ConnectionState;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;
    use tokio::time::timeout;

    #[test]
    fn test_parse_input() {
        assert_eq!(parse_input("photo 3"), Input::Photo(3));
        assert_eq!(parse_input("  cams "), Input::Cameras);
        assert_eq!(parse_input("quit"), Input::Quit);
        assert_eq!(parse_input(""), Input::Empty);
        assert_eq!(
            parse_input("connect 10.0.0.2 8080"),
            Input::Connect(Endpoint::new("10.0.0.2", 8080))
        );
        assert_eq!(parse_input("camList"), Input::Raw("camList".to_string()));
        assert_eq!(
            parse_input("hello  there"),
            Input::Raw("hello  there".to_string())
        );
    }

    #[test]
    fn test_parse_input_bad_arguments() {
        assert!(matches!(parse_input("photo"), Input::Invalid(_)));
        assert!(matches!(parse_input("photo front"), Input::Invalid(_)));
        assert!(matches!(parse_input("connect host"), Input::Invalid(_)));
        assert!(matches!(parse_input("connect host 99999"), Input::Invalid(_)));
    }

    #[test]
    fn test_describe() {
        assert_eq!(
            describe(&SessionEvent::ConnectionStatus(ConnectionState::Connecting)).as_deref(),
            Some("connection connecting...")
        );
        assert_eq!(
            describe(&SessionEvent::Message("hi".into())).as_deref(),
            Some("< hi")
        );
        assert!(describe(&SessionEvent::TransferComplete).is_none());
    }

    #[test]
    fn test_event_json_shape() {
        let json = serde_json::to_value(SessionEvent::TransferProgress(42)).unwrap();
        assert_eq!(json["event"], "transfer_progress");
        assert_eq!(json["data"], 42);

        let json = serde_json::to_value(SessionEvent::ConnectionStatus(ConnectionState::Lost))
            .unwrap();
        assert_eq!(json["data"], "lost");
    }

    #[test]
    fn test_format_cameras() {
        let cameras = vec![
            Camera {
                id: 1,
                description: "Front door".into(),
            },
            Camera {
                id: 4,
                description: "Yard".into(),
            },
        ];
        assert_eq!(format_cameras(&cameras), "  [1] Front door\n  [4] Yard");
        assert_eq!(format_cameras(&[]), "no cameras announced yet");
    }

    #[tokio::test]
    async fn test_save_snapshot_keeps_received_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let png = sample_png();
        let image = decode_payload(&STANDARD.encode(&png)).unwrap();

        let path = save_snapshot(dir.path(), &image).await.unwrap();
        assert_eq!(path.extension().unwrap(), "png");
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("snapshot-"));
        assert_eq!(std::fs::read(&path).unwrap(), png);
    }

    #[tokio::test]
    async fn test_save_snapshot_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let png = sample_png();
        let image = decode_payload(&STANDARD.encode(&png)).unwrap();
        assert!(save_snapshot(&dir.path().join("nope"), &image)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_show_saves_snapshot_and_tracks_cameras() {
        let dir = tempfile::tempdir().unwrap();
        let image = decode_payload(&STANDARD.encode(sample_png())).unwrap();
        let mut console = Console::new(false, dir.path().to_path_buf());

        console
            .show(&SessionEvent::ImageDecoded(Arc::new(image)))
            .await;
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);

        console
            .show(&SessionEvent::CamerasChanged(vec![Camera {
                id: 2,
                description: "Yard".into(),
            }]))
            .await;
        assert_eq!(console.cameras.len(), 1);
    }

    fn busy_config() -> SessionConfig {
        SessionConfig {
            transport: TransportConfig {
                connect_timeout: Duration::from_secs(1),
                read_timeout: Duration::from_millis(50),
            },
            reconnect_delay: Duration::from_millis(20),
            ..SessionConfig::default()
        }
    }

    #[tokio::test]
    async fn test_quit_ends_session() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, events) = session::spawn(SessionConfig::default(), ImageStreamDecoder::new());
        let mut console = Console::new(false, dir.path().to_path_buf());

        let input: &[u8] = b"cams\nphoto front\nquit\nnever read\n";
        let interrupt = std::future::pending::<io::Result<()>>();
        timeout(
            Duration::from_secs(5),
            console.drive(&handle, events, input, interrupt),
        )
        .await
        .unwrap()
        .unwrap();

        // session is gone; late requests are dropped quietly
        handle.request_photo(1);
    }

    #[tokio::test]
    async fn test_end_of_input_ends_session() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, events) = session::spawn(SessionConfig::default(), ImageStreamDecoder::new());
        let mut console = Console::new(true, dir.path().to_path_buf());

        let input: &[u8] = b"";
        let interrupt = std::future::pending::<io::Result<()>>();
        timeout(
            Duration::from_secs(5),
            console.drive(&handle, events, input, interrupt),
        )
        .await
        .unwrap()
        .unwrap();
    }

    #[tokio::test]
    async fn test_interrupt_stops_busy_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let dir = tempfile::tempdir().unwrap();
        let (handle, events) = session::spawn(busy_config(), ImageStreamDecoder::new());
        // refused connects keep the event loop spinning until the interrupt
        handle.connect(Endpoint::new("127.0.0.1", port));

        let (_open_end, input) = tokio::io::duplex(64);
        let (fire, fired) = oneshot::channel::<()>();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            let _ = fire.send(());
        });
        let interrupt = async move {
            let _ = fired.await;
            Ok::<(), io::Error>(())
        };

        let mut console = Console::new(true, dir.path().to_path_buf());
        timeout(
            Duration::from_secs(5),
            console.drive(&handle, events, BufReader::new(input), interrupt),
        )
        .await
        .unwrap()
        .unwrap();
    }

    #[tokio::test]
    async fn test_unavailable_interrupt_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, events) = session::spawn(SessionConfig::default(), ImageStreamDecoder::new());
        let mut console = Console::new(false, dir.path().to_path_buf());

        let input: &[u8] = b"cams\ncams\nquit\n";
        let interrupt = async { Err(io::Error::new(io::ErrorKind::Unsupported, "no signals")) };
        timeout(
            Duration::from_secs(5),
            console.drive(&handle, events, input, interrupt),
        )
        .await
        .unwrap()
        .unwrap();
    }
}

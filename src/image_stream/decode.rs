//! Turning a finished payload into pixels.
//!
//! Runs off the session task: base64 and image decoding are CPU-bound and a
//! multi-megabyte snapshot would otherwise stall line ingestion.

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use image::{DynamicImage, ImageFormat};
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use tokio::sync::mpsc;

use crate::error::DecodeError;

/// Standard alphabet, tolerant of missing padding.
const PAYLOAD_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Accumulated base64 text of one transfer. Moved out of the decoder on completion.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Payload(String);

impl Payload {
    pub fn new(text: String) -> Self {
        Self(text)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A snapshot as received: the encoded bytes exactly as the peer sent them,
/// plus the decoded pixels.
#[derive(Debug, Clone)]
pub struct DecodedImage {
    pub format: ImageFormat,
    pub bytes: Vec<u8>,
    pub image: DynamicImage,
}

impl DecodedImage {
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Size of the encoded image in bytes
    pub fn encoded_len(&self) -> usize {
        self.bytes.len()
    }

    pub fn extension(&self) -> &'static str {
        self.format.extensions_str().first().copied().unwrap_or("img")
    }
}

/// Summary only; the pixels and raw bytes stay out of event dumps.
impl Serialize for DecodedImage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut summary = serializer.serialize_struct("DecodedImage", 4)?;
        summary.serialize_field("width", &self.width())?;
        summary.serialize_field("height", &self.height())?;
        summary.serialize_field("encoded_len", &self.encoded_len())?;
        summary.serialize_field("extension", self.extension())?;
        summary.end()
    }
}

/// Decode base64 text into an image. ASCII whitespace in the text is ignored.
pub fn decode_payload(text: &str) -> Result<DecodedImage, DecodeError> {
    let cleaned: Vec<u8> = text
        .bytes()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    let bytes = PAYLOAD_ENGINE.decode(cleaned)?;

    let format = image::guess_format(&bytes).map_err(|_| DecodeError::UnknownFormat)?;
    let image = image::load_from_memory_with_format(&bytes, format)?;

    Ok(DecodedImage {
        format,
        bytes,
        image,
    })
}

/// [`decode_payload`] on the blocking pool. The payload is moved, never shared.
pub async fn decode_in_background(payload: Payload) -> Result<DecodedImage, DecodeError> {
    tokio::task::spawn_blocking(move || decode_payload(payload.as_str()))
        .await
        .map_err(|e| DecodeError::Worker(e.to_string()))?
}

/// Start the decode worker. Payloads sent to the returned queue are decoded
/// one at a time, and their outcomes arrive on `outcomes` in queue order, so a
/// small snapshot never overtakes a larger one sent before it. The worker
/// stops once the queue is dropped or nobody listens for outcomes.
pub fn spawn_decode_worker(
    outcomes: mpsc::UnboundedSender<Result<DecodedImage, DecodeError>>,
) -> mpsc::UnboundedSender<Payload> {
    let (queue_tx, mut queue_rx) = mpsc::unbounded_channel::<Payload>();
    tokio::spawn(async move {
        while let Some(payload) = queue_rx.recv().await {
            if outcomes.send(decode_in_background(payload).await).is_err() {
                break;
            }
        }
    });
    queue_tx
}

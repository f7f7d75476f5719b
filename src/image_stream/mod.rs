//! Reassembly of a snapshot streamed as base64 text lines.
//!
//! Framing on the wire:
//!
//! ```text
//! SIZE:<chars>        announces the payload length in base64 characters
//! IMAGE               optional bootstrap line, carries no data
//! <base64 chunk>      any number of these
//! <last chunk>END123  completion marker; anything after it is dropped
//! ```
//!
//! [`ImageStreamDecoder`] is fed one line at a time and only tracks framing.
//! Decoding the finished [`Payload`] is done by [`spawn_decode_worker`].

pub mod decode;

pub use decode::{spawn_decode_worker, DecodedImage, Payload};

use log::{debug, warn};

pub const SIZE_MARKER: &str = "SIZE:";
pub const END_MARKER: &str = "END123";
pub const BOOTSTRAP_TOKEN: &str = "IMAGE";

/// Keeps the host awake while a transfer is running.
/// Acquired when a transfer starts, released once it is fully processed.
pub trait KeepAwake: Send {
    fn acquire(&mut self);
    fn release(&mut self);
}

#[derive(Debug, PartialEq)]
pub enum TransferStep {
    Started {
        expected_chars: usize,
        /// Estimated decoded size in KB (base64 inflates by 4/3)
        size_kb: u64,
    },
    /// Percentage received, never above 99
    Progress(u8),
    /// Completion marker seen; decoder is already back to idle
    Finished(Payload),
}

#[derive(Debug, PartialEq)]
pub enum Consume {
    /// Not part of a transfer, the caller should route it elsewhere
    NotConsumed,
    Consumed(Option<TransferStep>),
}

enum TransferState {
    Idle,
    Receiving {
        expected_chars: usize,
        received_chars: usize,
        buffer: String,
    },
}

pub struct ImageStreamDecoder {
    state: TransferState,
    keep_awake: Option<Box<dyn KeepAwake>>,
    awake: bool,
}

impl Default for ImageStreamDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageStreamDecoder {
    pub fn new() -> Self {
        Self {
            state: TransferState::Idle,
            keep_awake: None,
            awake: false,
        }
    }

    pub fn with_keep_awake(mut self, keep_awake: Box<dyn KeepAwake>) -> Self {
        self.keep_awake = Some(keep_awake);
        self
    }

    pub fn is_receiving(&self) -> bool {
        matches!(self.state, TransferState::Receiving { .. })
    }

    /// Characters buffered for the transfer in flight (0 when idle).
    #[cfg(test)]
    pub fn buffered_len(&self) -> usize {
        match &self.state {
            TransferState::Idle => 0,
            TransferState::Receiving { buffer, .. } => buffer.len(),
        }
    }

    /// Offer one line to the decoder.
    pub fn consume(&mut self, line: &str) -> Consume {
        if self.is_receiving() {
            self.consume_chunk(line)
        } else {
            self.consume_announcement(line)
        }
    }

    fn consume_announcement(&mut self, line: &str) -> Consume {
        if !line.contains(SIZE_MARKER) {
            return Consume::NotConsumed;
        }

        let Some(expected_chars) = parse_size(line) else {
            warn!("unparseable size announcement: {:?}", line);
            return Consume::NotConsumed;
        };

        self.state = TransferState::Receiving {
            expected_chars,
            received_chars: 0,
            buffer: String::with_capacity(expected_chars.min(16 * 1024 * 1024)),
        };
        if let Some(lock) = self.keep_awake.as_mut() {
            if !self.awake {
                lock.acquire();
                self.awake = true;
            }
        }

        let size_kb = (expected_chars as f64 * 0.75 / 1024.0) as u64;
        debug!("transfer started: {} chars (~{} KB)", expected_chars, size_kb);
        Consume::Consumed(Some(TransferStep::Started {
            expected_chars,
            size_kb,
        }))
    }

    fn consume_chunk(&mut self, line: &str) -> Consume {
        let TransferState::Receiving {
            expected_chars,
            received_chars,
            buffer,
        } = &mut self.state
        else {
            return Consume::NotConsumed;
        };

        // One transfer at a time: a second announcement does not restart the buffer
        if line.contains(SIZE_MARKER) {
            warn!("size announcement during a transfer, not consumed: {:?}", line);
            return Consume::NotConsumed;
        }

        if let Some(at) = line.find(END_MARKER) {
            let last = &line[..at];
            if !last.is_empty() && last != BOOTSTRAP_TOKEN {
                buffer.push_str(last);
            }
            let payload = Payload::new(std::mem::take(buffer));
            self.state = TransferState::Idle;
            debug!("transfer finished: {} chars buffered", payload.len());
            return Consume::Consumed(Some(TransferStep::Finished(payload)));
        }

        if line == BOOTSTRAP_TOKEN {
            return Consume::Consumed(None);
        }

        buffer.push_str(line);
        *received_chars += line.len();

        if *expected_chars == 0 {
            return Consume::Consumed(None);
        }
        let percent = (*received_chars as u64 * 100 / *expected_chars as u64).min(99) as u8;
        Consume::Consumed(Some(TransferStep::Progress(percent)))
    }

    /// Drop a half-received transfer. Returns whether one was in flight.
    pub fn abort(&mut self) -> bool {
        let was_receiving = self.is_receiving();
        self.state = TransferState::Idle;
        self.finish_transfer();
        was_receiving
    }

    /// Cleanup after a finished payload has been processed. Releases the
    /// keep-awake hook unless a newer transfer has started meanwhile.
    pub fn finish_transfer(&mut self) {
        if self.is_receiving() || !self.awake {
            return;
        }
        if let Some(lock) = self.keep_awake.as_mut() {
            lock.release();
        }
        self.awake = false;
    }
}

/// Digits following the size marker; anything else glued on is stripped.
fn parse_size(line: &str) -> Option<usize> {
    let at = line.find(SIZE_MARKER)?;
    let digits: String = line[at + SIZE_MARKER.len()..]
        .chars()
        .filter(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::decode::decode_payload;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::sync::Arc;

    fn started(decoder: &mut ImageStreamDecoder, line: &str) -> (usize, u64) {
        match decoder.consume(line) {
            Consume::Consumed(Some(TransferStep::Started {
                expected_chars,
                size_kb,
            })) => (expected_chars, size_kb),
            other => panic!("expected Started, got {other:?}"),
        }
    }

    fn finished(step: Consume) -> Payload {
        match step {
            Consume::Consumed(Some(TransferStep::Finished(payload))) => payload,
            other => panic!("expected Finished, got {other:?}"),
        }
    }

    #[test]
    fn test_hundred_chars_in_fifty_lines() {
        let mut decoder = ImageStreamDecoder::new();
        assert_eq!(started(&mut decoder, "SIZE:100"), (100, 0));

        let mut progress = Vec::new();
        for i in 0..50 {
            let line = format!("{:02}", i);
            match decoder.consume(&line) {
                Consume::Consumed(Some(TransferStep::Progress(p))) => progress.push(p),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(progress.first(), Some(&2));
        assert!(progress.iter().all(|p| *p <= 99));
        assert!(progress.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(progress.last(), Some(&99));

        let payload = finished(decoder.consume("END123"));
        assert_eq!(payload.len(), 100);
        assert!(!decoder.is_receiving());
        assert_eq!(decoder.buffered_len(), 0);
    }

    #[test]
    fn test_size_estimate_in_kb() {
        let mut decoder = ImageStreamDecoder::new();
        // 200_000 * 0.75 / 1024 = 146.48
        assert_eq!(started(&mut decoder, "SIZE:200000"), (200_000, 146));
    }

    #[test]
    fn test_size_digits_are_extracted() {
        let mut decoder = ImageStreamDecoder::new();
        assert_eq!(started(&mut decoder, "SIZE: 1 024\u{feff}x"), (1024, 0));
    }

    #[test]
    fn test_bad_size_not_consumed() {
        let mut decoder = ImageStreamDecoder::new();
        assert_eq!(decoder.consume("SIZE:unknown"), Consume::NotConsumed);
        assert_eq!(decoder.consume("SIZE:99999999999999999999999"), Consume::NotConsumed);
        assert!(!decoder.is_receiving());
    }

    #[test]
    fn test_idle_lines_not_consumed() {
        let mut decoder = ImageStreamDecoder::new();
        assert_eq!(decoder.consume("hello"), Consume::NotConsumed);
        assert_eq!(decoder.consume("abcEND123"), Consume::NotConsumed);
        assert_eq!(decoder.consume("IMAGE"), Consume::NotConsumed);
    }

    #[test]
    fn test_bootstrap_token_discarded() {
        let mut decoder = ImageStreamDecoder::new();
        started(&mut decoder, "SIZE:8");
        assert_eq!(decoder.consume("IMAGE"), Consume::Consumed(None));
        assert_eq!(decoder.buffered_len(), 0);

        decoder.consume("AAAA");
        let payload = finished(decoder.consume("IMAGEEND123"));
        assert_eq!(payload.as_str(), "AAAA");
    }

    #[test]
    fn test_end_marker_keeps_prefix_drops_suffix() {
        let mut decoder = ImageStreamDecoder::new();
        started(&mut decoder, "SIZE:8");
        decoder.consume("AAAA");
        let payload = finished(decoder.consume("BBBBEND123trailing"));
        assert_eq!(payload.as_str(), "AAAABBBB");
    }

    #[test]
    fn test_second_announcement_rejected_mid_transfer() {
        let mut decoder = ImageStreamDecoder::new();
        started(&mut decoder, "SIZE:8");
        decoder.consume("AAAA");

        assert_eq!(decoder.consume("SIZE:4096"), Consume::NotConsumed);
        assert!(decoder.is_receiving());
        assert_eq!(decoder.buffered_len(), 4);

        assert_eq!(
            decoder.consume("BBBB"),
            Consume::Consumed(Some(TransferStep::Progress(99)))
        );
        assert_eq!(finished(decoder.consume("END123")).as_str(), "AAAABBBB");
    }

    #[test]
    fn test_zero_size_reports_no_progress() {
        let mut decoder = ImageStreamDecoder::new();
        started(&mut decoder, "SIZE:0");
        assert_eq!(decoder.consume("AAAA"), Consume::Consumed(None));
        assert_eq!(finished(decoder.consume("END123")).as_str(), "AAAA");
    }

    #[test]
    fn test_empty_payload() {
        let mut decoder = ImageStreamDecoder::new();
        started(&mut decoder, "SIZE:10");
        assert!(finished(decoder.consume("END123")).is_empty());
    }

    #[test]
    fn test_abort() {
        let mut decoder = ImageStreamDecoder::new();
        assert!(!decoder.abort());
        started(&mut decoder, "SIZE:10");
        decoder.consume("AAAA");
        assert!(decoder.abort());
        assert!(!decoder.is_receiving());
        assert_eq!(decoder.buffered_len(), 0);
    }

    struct CountingLock(Arc<AtomicI32>);

    impl KeepAwake for CountingLock {
        fn acquire(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
        fn release(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_keep_awake_held_until_finish() {
        let held = Arc::new(AtomicI32::new(0));
        let mut decoder =
            ImageStreamDecoder::new().with_keep_awake(Box::new(CountingLock(held.clone())));

        started(&mut decoder, "SIZE:4");
        assert_eq!(held.load(Ordering::SeqCst), 1);
        finished(decoder.consume("AAAAEND123"));
        // still held until the payload has been decoded
        assert_eq!(held.load(Ordering::SeqCst), 1);

        // a new transfer started before the previous decode finished keeps it held
        started(&mut decoder, "SIZE:4");
        decoder.finish_transfer();
        assert_eq!(held.load(Ordering::SeqCst), 1);

        finished(decoder.consume("BBBBEND123"));
        decoder.finish_transfer();
        decoder.finish_transfer();
        assert_eq!(held.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_round_trip_through_framing() {
        let png = decode::tests::sample_png();
        let encoded = STANDARD.encode(&png);

        let mut decoder = ImageStreamDecoder::new();
        started(&mut decoder, &format!("SIZE:{}", encoded.len()));
        assert_eq!(decoder.consume("IMAGE"), Consume::Consumed(None));

        let chunks: Vec<&str> = encoded
            .as_bytes()
            .chunks(76)
            .map(|c| std::str::from_utf8(c).unwrap())
            .collect();
        let (last, body) = chunks.split_last().unwrap();
        for chunk in body {
            assert!(matches!(
                decoder.consume(chunk),
                Consume::Consumed(Some(TransferStep::Progress(_)))
            ));
        }
        let payload = finished(decoder.consume(&format!("{last}END123")));

        let decoded = decode_payload(payload.as_str()).unwrap();
        assert_eq!(decoded.bytes, png);
        let original = image::load_from_memory(&png).unwrap();
        assert_eq!(decoded.image.to_rgb8(), original.to_rgb8());
    }
}

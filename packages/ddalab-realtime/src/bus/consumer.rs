// Bus consumer
//
// Sequential per-delivery pipeline: decompress, decode, read metadata, hand
// off to the sink, then ack. Structurally broken messages are acked and
// dropped so they cannot loop; transient sink failures are nacked with
// requeue and the connection is rebuilt after a fixed backoff.

use crate::bus::headers::{MessageMetadata, MetadataError, DEVICE_ID_HEADER};
use crate::bus::{BusError, BusResult, BusTransport, FrameSink, InboundMessage};
use crate::telemetry::{decode_frame, DecodeError, RawFrame};
use serde::Serialize;
use std::io::{ErrorKind, Read};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Upper bound on a decompressed frame
pub const MAX_DECOMPRESSED_FRAME_SIZE: u64 = 16 * 1024 * 1024;

const DEFAULT_BACKOFF: Duration = Duration::from_secs(5);

const TRANSIENT_TOKENS: &[&str] = &[
    "timeout",
    "timed out",
    "temporarily",
    "connection reset",
    "connection refused",
    "broken pipe",
    "service unavailable",
    "connection aborted",
];

/// Per-message failures that drop the message
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("Decompression failed: {0}")]
    Decompress(#[source] std::io::Error),

    #[error("Decompressed frame exceeds {limit} bytes")]
    TooLarge { limit: u64 },

    #[error("Frame decode failed: {0}")]
    Decode(#[from] DecodeError),

    #[error("Invalid message metadata: {0}")]
    Metadata(#[from] MetadataError),
}

/// What to tell the broker about one delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Requeue,
}

/// Live consumer counters, shared across consumer relaunches
#[derive(Debug, Default)]
pub struct ConsumerMetrics {
    received: AtomicU64,
    ingested: AtomicU64,
    empty_frames: AtomicU64,
    decompress_failures: AtomicU64,
    decode_failures: AtomicU64,
    metadata_failures: AtomicU64,
    sink_failures: AtomicU64,
    requeued: AtomicU64,
    reconnects: AtomicU64,
}

/// Point-in-time copy of [`ConsumerMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConsumerStats {
    pub received: u64,
    pub ingested: u64,
    pub empty_frames: u64,
    pub decompress_failures: u64,
    pub decode_failures: u64,
    pub metadata_failures: u64,
    pub sink_failures: u64,
    pub requeued: u64,
    pub reconnects: u64,
}

impl ConsumerMetrics {
    pub fn snapshot(&self) -> ConsumerStats {
        ConsumerStats {
            received: self.received.load(Ordering::Relaxed),
            ingested: self.ingested.load(Ordering::Relaxed),
            empty_frames: self.empty_frames.load(Ordering::Relaxed),
            decompress_failures: self.decompress_failures.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            metadata_failures: self.metadata_failures.load(Ordering::Relaxed),
            sink_failures: self.sink_failures.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

enum SessionEnd {
    Cancelled,
    StreamEnded,
    Requeued,
}

pub struct BusConsumer {
    transport: Box<dyn BusTransport>,
    sink: Arc<dyn FrameSink>,
    connected: Arc<AtomicBool>,
    metrics: Arc<ConsumerMetrics>,
    backoff: Duration,
}

impl BusConsumer {
    pub fn new(transport: Box<dyn BusTransport>, sink: Arc<dyn FrameSink>) -> Self {
        Self {
            transport,
            sink,
            connected: Arc::new(AtomicBool::new(false)),
            metrics: Arc::new(ConsumerMetrics::default()),
            backoff: DEFAULT_BACKOFF,
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Share the "connection established" flag with a health reporter
    pub fn with_connected_flag(mut self, connected: Arc<AtomicBool>) -> Self {
        self.connected = connected;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<ConsumerMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> Arc<ConsumerMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Run one delivery through the pipeline and decide its disposition
    pub fn process_message(&self, message: &InboundMessage) -> Disposition {
        ConsumerMetrics::bump(&self.metrics.received);
        let body_len = message.body.len();

        let (metadata, frame) = match prepare(message) {
            Ok(prepared) => prepared,
            Err(e) => {
                let counter = match &e {
                    MessageError::Decompress(_) | MessageError::TooLarge { .. } => {
                        &self.metrics.decompress_failures
                    }
                    MessageError::Decode(_) => &self.metrics.decode_failures,
                    MessageError::Metadata(_) => &self.metrics.metadata_failures,
                };
                ConsumerMetrics::bump(counter);
                warn!(
                    "Dropping message from {} ({} bytes): {}",
                    device_hint(message),
                    body_len,
                    e
                );
                return Disposition::Ack;
            }
        };

        if frame.is_empty() {
            ConsumerMetrics::bump(&self.metrics.empty_frames);
            debug!(
                "Frame from {} has no complete samples ({} bytes); skipping",
                metadata.device_id, body_len
            );
            return Disposition::Ack;
        }

        match self.sink.accept(&metadata, &frame) {
            Ok(()) => {
                ConsumerMetrics::bump(&self.metrics.ingested);
                Disposition::Ack
            }
            Err(e) if is_transient(&e) => {
                ConsumerMetrics::bump(&self.metrics.requeued);
                warn!(
                    "Transient failure ingesting frame from {} ({} bytes): {:#}; requeueing",
                    metadata.device_id, body_len, e
                );
                Disposition::Requeue
            }
            Err(e) => {
                ConsumerMetrics::bump(&self.metrics.sink_failures);
                error!(
                    "Permanent failure ingesting frame from {} ({} bytes): {:#}; dropping",
                    metadata.device_id, body_len, e
                );
                Disposition::Ack
            }
        }
    }

    async fn run_session(&mut self, cancel: &CancellationToken) -> BusResult<SessionEnd> {
        self.transport.connect().await?;
        self.connected.store(true, Ordering::SeqCst);
        info!("Bus consumer connected to {}", self.transport.describe());

        loop {
            let next = tokio::select! {
                biased;

                _ = cancel.cancelled() => return Ok(SessionEnd::Cancelled),

                next = self.transport.next_message() => next?,
            };

            let Some(message) = next else {
                return Ok(SessionEnd::StreamEnded);
            };

            match self.process_message(&message) {
                Disposition::Ack => self.transport.ack(message.delivery_tag).await?,
                Disposition::Requeue => {
                    self.transport.nack(message.delivery_tag, true).await?;
                    return Ok(SessionEnd::Requeued);
                }
            }
        }
    }

    /// Consume until cancelled, reconnecting after every connection loss
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("Bus consumer starting ({})", self.transport.describe());

        loop {
            let outcome = self.run_session(&cancel).await;
            self.connected.store(false, Ordering::SeqCst);
            self.transport.close().await;

            match outcome {
                Ok(SessionEnd::Cancelled) => break,
                Ok(SessionEnd::StreamEnded) => {
                    warn!(
                        "Broker ended the delivery stream; reconnecting in {:?}",
                        self.backoff
                    );
                }
                Ok(SessionEnd::Requeued) => {
                    warn!(
                        "Rebuilding bus connection after transient failure in {:?}",
                        self.backoff
                    );
                }
                Err(e) => {
                    error!("Bus connection failed: {}; retrying in {:?}", e, self.backoff);
                }
            }
            ConsumerMetrics::bump(&self.metrics.reconnects);

            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                _ = tokio::time::sleep(self.backoff) => {}
            }
        }

        info!("Bus consumer stopped");
    }
}

fn prepare(message: &InboundMessage) -> Result<(MessageMetadata, RawFrame), MessageError> {
    let payload = decompress(&message.body)?;
    let frame = decode_frame(&payload)?;
    let metadata = MessageMetadata::from_headers(&message.headers)?;
    Ok((metadata, frame))
}

/// zstd-decompress a message body, refusing output beyond the frame size cap
pub fn decompress(body: &[u8]) -> Result<Vec<u8>, MessageError> {
    let decoder =
        zstd::stream::read::Decoder::with_buffer(body).map_err(MessageError::Decompress)?;

    let mut payload = Vec::new();
    decoder
        .take(MAX_DECOMPRESSED_FRAME_SIZE + 1)
        .read_to_end(&mut payload)
        .map_err(MessageError::Decompress)?;

    if payload.len() as u64 > MAX_DECOMPRESSED_FRAME_SIZE {
        return Err(MessageError::TooLarge {
            limit: MAX_DECOMPRESSED_FRAME_SIZE,
        });
    }
    Ok(payload)
}

fn device_hint(message: &InboundMessage) -> &str {
    message
        .headers
        .get(DEVICE_ID_HEADER)
        .and_then(|value| value.as_str())
        .unwrap_or("<unknown device>")
}

/// Whether a sink failure is network-class and worth a redelivery
pub fn is_transient(error: &anyhow::Error) -> bool {
    error.chain().any(|cause| {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            if matches!(
                io.kind(),
                ErrorKind::ConnectionRefused
                    | ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::NotConnected
                    | ErrorKind::BrokenPipe
                    | ErrorKind::TimedOut
                    | ErrorKind::NetworkDown
                    | ErrorKind::NetworkUnreachable
            ) {
                return true;
            }
        }

        if let Some(bus) = cause.downcast_ref::<BusError>() {
            if !matches!(bus, BusError::Protocol(_)) {
                return true;
            }
        }

        if cause.is::<tokio::time::error::Elapsed>() {
            return true;
        }

        let message = cause.to_string().to_lowercase();
        TRANSIENT_TOKENS.iter().any(|token| message.contains(token))
    })
}

// Message bus ingestion
//
// `BusTransport` abstracts the broker connection (AMQP in production, an
// in-memory queue in tests); `BusConsumer` drives it and turns each delivery
// into a decoded frame handed to a `FrameSink`.

pub mod amqp;
pub mod consumer;
pub mod headers;

pub use amqp::AmqpTransport;
pub use consumer::{
    decompress, is_transient, BusConsumer, ConsumerMetrics, ConsumerStats, Disposition,
    MessageError, MAX_DECOMPRESSED_FRAME_SIZE,
};
pub use headers::{coerce_float, HeaderValue, MessageMetadata, MetadataError};

use crate::telemetry::RawFrame;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Result type for transport operations
pub type BusResult<T> = Result<T, BusError>;

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Transport is not connected")]
    Closed,
}

/// One delivery from the broker
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Broker-assigned tag used to ack or nack this delivery
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub headers: HashMap<String, HeaderValue>,
    pub body: Vec<u8>,
}

/// Broker connection used by the consumer
///
/// `connect` must leave the transport bound to the frame exchange with a
/// prefetch of one unacknowledged delivery.
#[async_trait]
pub trait BusTransport: Send {
    async fn connect(&mut self) -> BusResult<()>;

    /// Next delivery; `Ok(None)` when the broker ended the stream
    async fn next_message(&mut self) -> BusResult<Option<InboundMessage>>;

    async fn ack(&mut self, delivery_tag: u64) -> BusResult<()>;

    async fn nack(&mut self, delivery_tag: u64, requeue: bool) -> BusResult<()>;

    /// Close channel and connection if open; safe to call repeatedly
    async fn close(&mut self);

    /// Endpoint description for logs, without credentials
    fn describe(&self) -> String;
}

/// Builds a fresh transport each time the consumer task is (re)launched
pub type TransportFactory = Arc<dyn Fn() -> Box<dyn BusTransport> + Send + Sync>;

/// Receives every successfully decoded, non-empty frame
///
/// Errors are classified with [`is_transient`]: transient ones requeue the
/// message and rebuild the connection, anything else drops it.
pub trait FrameSink: Send + Sync {
    fn accept(&self, metadata: &MessageMetadata, frame: &RawFrame) -> anyhow::Result<()>;
}

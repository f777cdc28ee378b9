use async_trait::async_trait;
use ddalab_realtime::applications;
use ddalab_realtime::bus::{
    BusConsumer, BusResult, BusTransport, ConsumerMetrics, Disposition, FrameSink, HeaderValue,
    InboundMessage, MessageMetadata, TransportFactory,
};
use ddalab_realtime::host::StateSink;
use ddalab_realtime::telemetry::{ChannelType, FrameEncoder, MotionSample, RawFrame};
use ddalab_realtime::{RealtimeConfig, RealtimeHost};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::f64::consts::PI;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const SAMPLING_RATE: f64 = 256.0;
const MESSAGE_ID_HEADER: &str = "message_id";

#[derive(Debug, Clone, PartialEq)]
enum BrokerEvent {
    Connected,
    Acked { id: String, redelivered: bool },
    Nacked { id: String, requeue: bool },
}

/// Queue shared by every transport the test hands out, mimicking a broker
#[derive(Default)]
struct Broker {
    ready: VecDeque<InboundMessage>,
    unacked: HashMap<u64, InboundMessage>,
    next_tag: u64,
    events: Vec<BrokerEvent>,
}

impl Broker {
    fn publish(&mut self, message: InboundMessage) {
        self.ready.push_back(message);
    }

    fn requeue(&mut self, mut message: InboundMessage) {
        message.redelivered = true;
        self.ready.push_front(message);
    }

    fn acked_ids(&self) -> Vec<String> {
        self.events
            .iter()
            .filter_map(|event| match event {
                BrokerEvent::Acked { id, .. } => Some(id.clone()),
                _ => None,
            })
            .collect()
    }
}

fn message_id(message: &InboundMessage) -> String {
    message
        .headers
        .get(MESSAGE_ID_HEADER)
        .and_then(HeaderValue::as_str)
        .unwrap_or_default()
        .to_string()
}

struct InMemoryTransport {
    broker: Arc<Mutex<Broker>>,
    /// Delivery tags handed out on the current connection
    outstanding: Vec<u64>,
    connected: bool,
}

impl InMemoryTransport {
    fn new(broker: Arc<Mutex<Broker>>) -> Self {
        Self {
            broker,
            outstanding: Vec::new(),
            connected: false,
        }
    }
}

#[async_trait]
impl BusTransport for InMemoryTransport {
    async fn connect(&mut self) -> BusResult<()> {
        self.connected = true;
        self.broker.lock().events.push(BrokerEvent::Connected);
        Ok(())
    }

    async fn next_message(&mut self) -> BusResult<Option<InboundMessage>> {
        loop {
            {
                let mut broker = self.broker.lock();
                if let Some(mut message) = broker.ready.pop_front() {
                    broker.next_tag += 1;
                    message.delivery_tag = broker.next_tag;
                    broker.unacked.insert(message.delivery_tag, message.clone());
                    self.outstanding.push(message.delivery_tag);
                    return Ok(Some(message));
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn ack(&mut self, delivery_tag: u64) -> BusResult<()> {
        let mut broker = self.broker.lock();
        if let Some(message) = broker.unacked.remove(&delivery_tag) {
            let event = BrokerEvent::Acked {
                id: message_id(&message),
                redelivered: message.redelivered,
            };
            broker.events.push(event);
        }
        self.outstanding.retain(|tag| *tag != delivery_tag);
        Ok(())
    }

    async fn nack(&mut self, delivery_tag: u64, requeue: bool) -> BusResult<()> {
        let mut broker = self.broker.lock();
        if let Some(message) = broker.unacked.remove(&delivery_tag) {
            broker.events.push(BrokerEvent::Nacked {
                id: message_id(&message),
                requeue,
            });
            if requeue {
                broker.requeue(message);
            }
        }
        self.outstanding.retain(|tag| *tag != delivery_tag);
        Ok(())
    }

    async fn close(&mut self) {
        if !self.connected {
            return;
        }
        self.connected = false;
        // Unacknowledged deliveries return to the queue when a connection drops
        let mut broker = self.broker.lock();
        for tag in self.outstanding.drain(..) {
            if let Some(message) = broker.unacked.remove(&tag) {
                broker.requeue(message);
            }
        }
    }

    fn describe(&self) -> String {
        "in-memory broker".to_string()
    }
}

/// Fails the first `failures` frames with a connection reset, then delegates
struct FlakySink {
    inner: StateSink,
    failures: AtomicUsize,
}

impl FrameSink for FlakySink {
    fn accept(&self, metadata: &MessageMetadata, frame: &RawFrame) -> anyhow::Result<()> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(io::Error::new(io::ErrorKind::ConnectionReset, "connection reset by peer").into());
        }
        self.inner.accept(metadata, frame)
    }
}

fn test_config() -> RealtimeConfig {
    RealtimeConfig {
        analysis_window_seconds: 2.0,
        analysis_interval: Duration::from_secs(3600),
        retention_seconds: 10.0,
        reconnect_backoff: Duration::from_millis(20),
        ..RealtimeConfig::default()
    }
}

/// Zstd-compressed frame of per-channel sines starting at sample `offset`
fn sine_frame(channels: &[&str], offset: usize, samples: usize) -> Vec<u8> {
    let mut encoder = FrameEncoder::new();
    for name in channels {
        encoder = encoder.channel(name, ChannelType::Eeg);
    }
    let impedances = vec![10u8; channels.len()];

    for i in offset..offset + samples {
        let t = i as f64 / SAMPLING_RATE;
        let row: Vec<i16> = (0..channels.len())
            .map(|ch| {
                let freq = 8.0 + 2.0 * ch as f64;
                (1500.0 * (2.0 * PI * freq * t).sin() + 40.0 * (2.0 * PI * 3.0 * t).cos()) as i16
            })
            .collect();
        encoder = encoder.sample(&row, &impedances, MotionSample::default());
    }

    zstd::stream::encode_all(encoder.encode().as_slice(), 0).unwrap()
}

fn message(id: &str, device: &str, body: Vec<u8>) -> InboundMessage {
    let mut headers = HashMap::new();
    headers.insert(MESSAGE_ID_HEADER.to_string(), HeaderValue::Text(id.into()));
    headers.insert("user_id".to_string(), HeaderValue::Text(device.into()));
    headers.insert("sampling_rate".to_string(), HeaderValue::Int(SAMPLING_RATE as i64));
    headers.insert(
        "lsb_to_volts_str".to_string(),
        HeaderValue::Text("0.0000001".into()),
    );
    InboundMessage {
        delivery_tag: 0,
        redelivered: false,
        headers,
        body,
    }
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached within 5s");
}

#[tokio::test]
async fn test_transient_failure_requeues_and_redelivers_after_reconnect() {
    let host = RealtimeHost::new(test_config(), Vec::new());
    let broker = Arc::new(Mutex::new(Broker::default()));
    broker
        .lock()
        .publish(message("m1", "dev-1", sine_frame(&["C3", "C4"], 0, 64)));

    let metrics = Arc::new(ConsumerMetrics::default());
    let sink = Arc::new(FlakySink {
        inner: host.sink(),
        failures: AtomicUsize::new(1),
    });
    let consumer = BusConsumer::new(Box::new(InMemoryTransport::new(broker.clone())), sink)
        .with_backoff(Duration::from_millis(20))
        .with_metrics(metrics.clone());

    let cancel = CancellationToken::new();
    let task = tokio::spawn(consumer.run(cancel.clone()));

    wait_until(|| broker.lock().acked_ids().contains(&"m1".to_string())).await;
    cancel.cancel();
    task.await.unwrap();

    let events = broker.lock().events.clone();
    assert_eq!(
        events,
        vec![
            BrokerEvent::Connected,
            BrokerEvent::Nacked {
                id: "m1".into(),
                requeue: true
            },
            BrokerEvent::Connected,
            BrokerEvent::Acked {
                id: "m1".into(),
                redelivered: true
            },
        ]
    );

    let stats = metrics.snapshot();
    assert_eq!(stats.requeued, 1);
    assert_eq!(stats.ingested, 1);
    assert!(stats.reconnects >= 1);
    assert_eq!(host.store().buffered_rows("dev-1"), Some(64));
}

#[tokio::test]
async fn test_broken_messages_are_acked_and_dropped() {
    let host = RealtimeHost::new(test_config(), Vec::new());
    let broker = Arc::new(Mutex::new(Broker::default()));
    {
        let mut broker = broker.lock();
        broker.publish(message("garbage", "dev-1", b"not zstd at all".to_vec()));

        let bad_version = zstd::stream::encode_all(&[9u8, 0, 0, 0][..], 0).unwrap();
        broker.publish(message("bad-version", "dev-1", bad_version));

        let mut anonymous = message("anonymous", "dev-1", sine_frame(&["C3"], 0, 16));
        anonymous.headers.remove("user_id");
        broker.publish(anonymous);

        broker.publish(message("good", "dev-1", sine_frame(&["C3"], 0, 16)));
    }

    let metrics = Arc::new(ConsumerMetrics::default());
    let consumer = BusConsumer::new(
        Box::new(InMemoryTransport::new(broker.clone())),
        Arc::new(host.sink()),
    )
    .with_metrics(metrics.clone());

    let cancel = CancellationToken::new();
    let task = tokio::spawn(consumer.run(cancel.clone()));
    wait_until(|| broker.lock().acked_ids().len() == 4).await;
    cancel.cancel();
    task.await.unwrap();

    assert_eq!(
        broker.lock().acked_ids(),
        vec!["garbage", "bad-version", "anonymous", "good"]
    );
    let stats = metrics.snapshot();
    assert_eq!(stats.decompress_failures, 1);
    assert_eq!(stats.decode_failures, 1);
    assert_eq!(stats.metadata_failures, 1);
    assert_eq!(stats.ingested, 1);
    assert_eq!(stats.requeued, 0);
    assert_eq!(host.store().device_ids(), vec!["dev-1".to_string()]);
}

#[test]
fn test_ingest_then_cycle_produces_builtin_results() {
    let host = RealtimeHost::new(test_config(), applications::builtin());
    let consumer = BusConsumer::new(
        Box::new(InMemoryTransport::new(Arc::new(Mutex::new(Broker::default())))),
        Arc::new(host.sink()),
    );
    let channels = ["Fp1", "Fp2", "O1", "O2"];

    // 3 s of data in 0.25 s frames
    for (idx, offset) in (0..768).step_by(64).enumerate() {
        let msg = message(&format!("m{}", idx), "dev-1", sine_frame(&channels, offset, 64));
        assert_eq!(consumer.process_message(&msg), Disposition::Ack);
    }
    assert_eq!(host.store().buffered_rows("dev-1"), Some(768));

    let summary = host.scheduler().run_cycle();
    assert_eq!(summary.analyzed, 1);
    assert_eq!(summary.failures, 0);

    let results = host.get_user_results("dev-1");
    let mut app_ids: Vec<&String> = results.keys().collect();
    app_ids.sort();
    assert_eq!(app_ids, vec!["channel_stats", "psd_coherence"]);

    let psd = &results["psd_coherence"];
    assert_eq!(psd["analysis_channels"], serde_json::json!(channels));
    assert_eq!(psd["window_samples"], 512);
    assert_eq!(psd["coherence"]["matrix"].as_array().unwrap().len(), 4);
    assert_eq!(results["channel_stats"]["channels"].as_array().unwrap().len(), 4);

    // A new channel layout resets the profile and discards cached results
    let msg = message("layout", "dev-1", sine_frame(&["Cz"], 0, 64));
    assert_eq!(consumer.process_message(&msg), Disposition::Ack);
    assert!(host.get_user_results("dev-1").is_empty());
    assert_eq!(host.store().buffered_rows("dev-1"), Some(64));

    // Not enough samples for a window: previous (empty) state stays
    let summary = host.scheduler().run_cycle();
    assert_eq!(summary.skipped, 1);
    assert!(host.get_user_results("dev-1").is_empty());
}

#[tokio::test]
async fn test_host_background_tasks_consume_from_bus() {
    let host = RealtimeHost::new(test_config(), applications::builtin());
    let broker = Arc::new(Mutex::new(Broker::default()));

    let factory: TransportFactory = {
        let broker = broker.clone();
        Arc::new(move || Box::new(InMemoryTransport::new(broker.clone())) as Box<dyn BusTransport>)
    };
    host.start_background_tasks(factory);
    assert_eq!(
        host.running_tasks(),
        vec!["analysis_scheduler", "bus_consumer"]
    );

    for (idx, offset) in (0..512).step_by(128).enumerate() {
        broker.lock().publish(message(
            &format!("m{}", idx),
            "dev-7",
            sine_frame(&["C3", "C4"], offset, 128),
        ));
    }

    wait_until(|| host.health().consumer.ingested == 4).await;
    assert_eq!(host.store().buffered_rows("dev-7"), Some(512));
    let health = host.health();
    assert_eq!(health.status, "ok");
    assert!(health.bus_connected);
    assert_eq!(health.devices, 1);
    assert_eq!(health.applications, 2);
    assert_eq!(health.consumer.ingested, 4);

    host.shutdown().await;
    assert!(!host.bus_connected());
    assert!(host.running_tasks().is_empty());
    assert_eq!(host.health().status, "unhealthy");
}

// Realtime application host
//
// Owns the device state store, the result table and the registered
// applications, and supervises the two background workers: the bus consumer
// and the analysis scheduler. Collaborators query it for per-device results,
// the application list and a health report.

pub mod application;
pub mod results;
pub mod scheduler;

pub use application::{AnalysisResult, ApplicationSet, ApplicationSummary, RealtimeApplication};
pub use results::ResultTable;
pub use scheduler::{AnalysisScheduler, CycleSummary};

use crate::bus::{
    BusConsumer, ConsumerMetrics, ConsumerStats, FrameSink, MessageMetadata, TransportFactory,
};
use crate::config::RealtimeConfig;
use crate::state::DeviceStateStore;
use crate::telemetry::RawFrame;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const CONSUMER_TASK: &str = "bus_consumer";
const SCHEDULER_TASK: &str = "analysis_scheduler";

/// Frame sink that applies frames to the state store
///
/// Cached results of a device are purged after its profile resets, once the
/// state lock has been released. The result table also remembers the new
/// generation so that cycles still running on the old profile cannot write
/// their results back afterwards.
#[derive(Clone)]
pub struct StateSink {
    store: Arc<DeviceStateStore>,
    results: Arc<ResultTable>,
}

impl StateSink {
    pub fn new(store: Arc<DeviceStateStore>, results: Arc<ResultTable>) -> Self {
        Self { store, results }
    }
}

impl FrameSink for StateSink {
    fn accept(&self, metadata: &MessageMetadata, frame: &RawFrame) -> anyhow::Result<()> {
        let outcome = self.store.ingest(
            &metadata.device_id,
            metadata.sampling_rate,
            metadata.scale_factor,
            frame,
        )?;

        if outcome.profile_reset
            && self
                .results
                .reset_device(&metadata.device_id, outcome.generation)
        {
            info!(
                "Discarded cached results for {} after profile reset",
                metadata.device_id
            );
        }
        Ok(())
    }
}

/// Liveness summary for collaborators
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// "ok" while the bus connection is established, otherwise "unhealthy"
    pub status: &'static str,
    pub bus_connected: bool,
    pub devices: usize,
    pub applications: usize,
    pub uptime_seconds: f64,
    pub consumer: ConsumerStats,
    pub checked_at: DateTime<Utc>,
}

pub struct RealtimeHost {
    config: RealtimeConfig,
    applications: ApplicationSet,
    store: Arc<DeviceStateStore>,
    results: Arc<ResultTable>,
    scheduler: Arc<AnalysisScheduler>,
    bus_connected: Arc<AtomicBool>,
    consumer_metrics: Arc<ConsumerMetrics>,
    cancel: CancellationToken,
    tasks: Mutex<HashMap<&'static str, JoinHandle<()>>>,
    transport_factory: Mutex<Option<TransportFactory>>,
    started_at: Instant,
}

impl RealtimeHost {
    /// Register applications in dispatch order and build the shared state
    pub fn new(config: RealtimeConfig, applications: Vec<Arc<dyn RealtimeApplication>>) -> Self {
        for app in &applications {
            app.on_registered();
            info!("Registered realtime application {}", app.app_id());
        }
        let applications: ApplicationSet = applications.into();

        let store = Arc::new(DeviceStateStore::new(
            config.quality,
            config.retention_seconds,
            Arc::clone(&applications),
        ));
        let results = Arc::new(ResultTable::new());
        let scheduler = Arc::new(
            AnalysisScheduler::new(
                Arc::clone(&store),
                Arc::clone(&results),
                Arc::clone(&applications),
                config.analysis_window_seconds,
                config.analysis_interval,
            )
            .with_parallel_devices(config.parallel_device_analysis),
        );

        Self {
            config,
            applications,
            store,
            results,
            scheduler,
            bus_connected: Arc::new(AtomicBool::new(false)),
            consumer_metrics: Arc::new(ConsumerMetrics::default()),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(HashMap::new()),
            transport_factory: Mutex::new(None),
            started_at: Instant::now(),
        }
    }

    pub fn config(&self) -> &RealtimeConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<DeviceStateStore> {
        &self.store
    }

    pub fn results(&self) -> &Arc<ResultTable> {
        &self.results
    }

    pub fn scheduler(&self) -> &Arc<AnalysisScheduler> {
        &self.scheduler
    }

    pub fn sink(&self) -> StateSink {
        StateSink::new(Arc::clone(&self.store), Arc::clone(&self.results))
    }

    /// Launch the consumer and scheduler; must be called inside a tokio runtime
    pub fn start_background_tasks(&self, transport_factory: TransportFactory) {
        *self.transport_factory.lock() = Some(transport_factory);
        let launched = self.ensure_background_tasks();
        info!("Started background tasks: {}", launched.join(", "));
    }

    /// Relaunch any worker whose task has ended; returns the relaunched task names
    pub fn ensure_background_tasks(&self) -> Vec<&'static str> {
        if self.cancel.is_cancelled() {
            return Vec::new();
        }
        let Some(factory) = self.transport_factory.lock().clone() else {
            warn!("Background tasks requested before a transport was configured");
            return Vec::new();
        };

        let mut tasks = self.tasks.lock();
        let mut launched = Vec::new();

        for name in [CONSUMER_TASK, SCHEDULER_TASK] {
            let alive = tasks.get(name).is_some_and(|handle| !handle.is_finished());
            if alive {
                continue;
            }
            if tasks.contains_key(name) {
                warn!("Background task {} stopped; restarting", name);
            }

            let handle = match name {
                CONSUMER_TASK => self.spawn_consumer(&factory),
                _ => self.spawn_scheduler(),
            };
            tasks.insert(name, handle);
            launched.push(name);
        }

        launched
    }

    fn spawn_consumer(&self, factory: &TransportFactory) -> JoinHandle<()> {
        // A consumer that died mid-session never cleared the flag
        self.bus_connected.store(false, Ordering::SeqCst);
        let consumer = BusConsumer::new((**factory)(), Arc::new(self.sink()))
            .with_backoff(self.config.reconnect_backoff)
            .with_connected_flag(Arc::clone(&self.bus_connected))
            .with_metrics(Arc::clone(&self.consumer_metrics));
        tokio::spawn(consumer.run(self.cancel.child_token()))
    }

    fn spawn_scheduler(&self) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(&self.scheduler).run(self.cancel.child_token()))
    }

    /// Names of background tasks that are currently running
    pub fn running_tasks(&self) -> Vec<&'static str> {
        let tasks = self.tasks.lock();
        let mut running: Vec<&'static str> = tasks
            .iter()
            .filter(|(_, handle)| !handle.is_finished())
            .map(|(name, _)| *name)
            .collect();
        running.sort_unstable();
        running
    }

    /// Latest result per application for a device; empty before its first completed cycle
    pub fn get_user_results(&self, device_id: &str) -> HashMap<String, AnalysisResult> {
        self.results.device_results(device_id)
    }

    pub fn applications_summary(&self) -> Vec<ApplicationSummary> {
        self.applications
            .iter()
            .map(|app| ApplicationSummary::of(app.as_ref()))
            .collect()
    }

    pub fn bus_connected(&self) -> bool {
        self.bus_connected.load(Ordering::SeqCst)
    }

    pub fn health(&self) -> HealthReport {
        let bus_connected = self.bus_connected();
        HealthReport {
            status: if bus_connected { "ok" } else { "unhealthy" },
            bus_connected,
            devices: self.store.device_count(),
            applications: self.applications.len(),
            uptime_seconds: self.started_at.elapsed().as_secs_f64(),
            consumer: self.consumer_metrics.snapshot(),
            checked_at: Utc::now(),
        }
    }

    /// Cancel both workers and wait for them to finish
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handles: Vec<(&'static str, JoinHandle<()>)> = self.tasks.lock().drain().collect();

        for (name, handle) in handles {
            if let Err(e) = handle.await {
                warn!("Background task {} ended abnormally: {}", name, e);
            }
        }
        info!("Realtime host stopped");
    }
}

// Analysis cycle scheduler
//
// Idle between ticks of a fixed-period timer; on each tick one analysis pass
// runs on the blocking pool:
// - before-cycle hooks on every application
// - snapshot of every device, taken under the state lock and released at once
// - trailing window per device, dispatched to applications in registration order
// - non-empty results written to the result table unless the device's
//   profile was reset after the snapshot
// - after-cycle hooks

use crate::host::application::ApplicationSet;
use crate::host::results::ResultTable;
use crate::state::{DeviceSnapshot, DeviceStateStore};
use rayon::prelude::*;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Outcome counts for one analysis pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleSummary {
    /// Devices whose window was handed to applications
    pub analyzed: usize,
    /// Devices without a full analysis window yet
    pub skipped: usize,
    pub results_stored: usize,
    /// Application calls that returned an error or panicked
    pub failures: usize,
}

impl CycleSummary {
    fn merge(self, other: Self) -> Self {
        Self {
            analyzed: self.analyzed + other.analyzed,
            skipped: self.skipped + other.skipped,
            results_stored: self.results_stored + other.results_stored,
            failures: self.failures + other.failures,
        }
    }
}

pub struct AnalysisScheduler {
    store: Arc<DeviceStateStore>,
    results: Arc<ResultTable>,
    applications: ApplicationSet,
    window_seconds: f64,
    interval: Duration,
    parallel: bool,
}

impl AnalysisScheduler {
    pub fn new(
        store: Arc<DeviceStateStore>,
        results: Arc<ResultTable>,
        applications: ApplicationSet,
        window_seconds: f64,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            results,
            applications,
            window_seconds,
            interval,
            parallel: false,
        }
    }

    /// Fan devices out over the rayon pool; applications of one device stay sequential
    pub fn with_parallel_devices(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Rows needed before a device at `sampling_rate` is analyzed
    pub fn window_samples(&self, sampling_rate: f64) -> usize {
        (sampling_rate * self.window_seconds).floor().max(0.0) as usize
    }

    /// Run one analysis pass synchronously
    pub fn run_cycle(&self) -> CycleSummary {
        for app in self.applications.iter() {
            if catch_unwind(AssertUnwindSafe(|| app.before_analysis_cycle())).is_err() {
                error!("Application {} panicked in before-cycle hook", app.app_id());
            }
        }

        let snapshots = self.store.snapshot();
        let summary = if self.parallel {
            snapshots
                .par_iter()
                .map(|snapshot| self.analyze_device(snapshot))
                .reduce(CycleSummary::default, CycleSummary::merge)
        } else {
            snapshots
                .iter()
                .map(|snapshot| self.analyze_device(snapshot))
                .fold(CycleSummary::default(), CycleSummary::merge)
        };

        for app in self.applications.iter() {
            if catch_unwind(AssertUnwindSafe(|| app.after_analysis_cycle())).is_err() {
                error!("Application {} panicked in after-cycle hook", app.app_id());
            }
        }

        summary
    }

    fn analyze_device(&self, snapshot: &DeviceSnapshot) -> CycleSummary {
        let mut summary = CycleSummary::default();
        let device_id = snapshot.device_id.as_str();
        let window_samples = self.window_samples(snapshot.profile.sampling_rate);

        let window = match snapshot.window(window_samples) {
            Some(window) if window_samples > 0 => window,
            _ => {
                debug!(
                    "Skipping {}: {} of {} window samples buffered",
                    device_id,
                    snapshot.buffered_rows(),
                    window_samples
                );
                summary.skipped = 1;
                return summary;
            }
        };
        summary.analyzed = 1;

        for app in self.applications.iter() {
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                app.analyze(device_id, snapshot, window.view())
            }));

            match outcome {
                Ok(Ok(Some(result))) => {
                    if self
                        .results
                        .store(device_id, snapshot.generation, app.app_id(), result)
                    {
                        summary.results_stored += 1;
                    } else {
                        debug!(
                            "Discarding {} result for {}: profile reset during the cycle",
                            app.app_id(),
                            device_id
                        );
                    }
                }
                Ok(Ok(None)) => {
                    debug!("{} produced no result for {}", app.app_id(), device_id);
                }
                Ok(Err(e)) => {
                    warn!("{} failed for {}: {:#}", app.app_id(), device_id, e);
                    summary.failures += 1;
                }
                Err(panic) => {
                    error!(
                        "{} panicked for {}: {}",
                        app.app_id(),
                        device_id,
                        panic_message(panic.as_ref())
                    );
                    summary.failures += 1;
                }
            }
        }

        summary
    }

    /// Tick until cancelled; the first cycle runs one interval after start
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Analysis scheduler started: window {}s, interval {:?}, {} applications",
            self.window_seconds,
            self.interval,
            self.applications.len()
        );

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    info!("Analysis scheduler cancelled");
                    break;
                }

                _ = ticker.tick() => {
                    let scheduler = Arc::clone(&self);
                    match tokio::task::spawn_blocking(move || scheduler.run_cycle()).await {
                        Ok(summary) => debug!(
                            "Analysis cycle: {} analyzed, {} skipped, {} stored, {} failures",
                            summary.analyzed,
                            summary.skipped,
                            summary.results_stored,
                            summary.failures
                        ),
                        Err(e) => error!("Analysis cycle task failed: {}", e),
                    }
                }
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

// Device profile and state store
//
// One `UserState` per device identity behind a single mutex. Every ingest is a
// complete read-modify-write under that lock, so snapshot readers never see a
// half-applied frame.

use crate::host::application::ApplicationSet;
use crate::state::profile::{DeviceProfile, DeviceSnapshot, UserState};
use crate::telemetry::{
    BufferError, ChannelQualityTracker, QualityThresholds, RawFrame, SampleRing,
};
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::{debug, error, info};

#[derive(Debug, Error, PartialEq)]
pub enum StateError {
    #[error("Invalid sampling rate for device {device_id}: {rate}")]
    InvalidSamplingRate { device_id: String, rate: f64 },

    #[error("Frame layout is inconsistent: {names} names, {types} types, {columns} signal columns, impedance shape {impedance_shape:?}")]
    InconsistentFrame {
        names: usize,
        types: usize,
        columns: usize,
        impedance_shape: (usize, usize),
    },

    #[error("Buffer error: {0}")]
    Buffer(#[from] BufferError),
}

/// What a single ingest did to the device state
#[derive(Debug, Clone, PartialEq)]
pub struct IngestOutcome {
    /// A new profile was created (first frame or configuration change)
    pub profile_reset: bool,
    /// Profile generation the frame was applied to
    pub generation: u64,
    pub buffered_rows: usize,
    pub bad_channels: Vec<String>,
}

pub struct DeviceStateStore {
    devices: Mutex<HashMap<String, UserState>>,
    thresholds: QualityThresholds,
    retention_seconds: f64,
    applications: ApplicationSet,
    /// Last generation handed out; shared by all devices so it never repeats
    generation: AtomicU64,
}

impl DeviceStateStore {
    pub fn new(
        thresholds: QualityThresholds,
        retention_seconds: f64,
        applications: ApplicationSet,
    ) -> Self {
        Self {
            devices: Mutex::new(HashMap::new()),
            thresholds,
            retention_seconds,
            applications,
            generation: AtomicU64::new(0),
        }
    }

    pub fn thresholds(&self) -> &QualityThresholds {
        &self.thresholds
    }

    pub fn retention_seconds(&self) -> f64 {
        self.retention_seconds
    }

    /// Apply one decoded frame to the device's state
    ///
    /// Resets the profile, tracker and buffer when the channel layout or
    /// sampling rate changed, and moves the device to a new generation.
    /// Cached analysis results live outside the store: `StateSink` is the
    /// public ingest path and purges them when `profile_reset` is set.
    pub(crate) fn ingest(
        &self,
        device_id: &str,
        sampling_rate: f64,
        scale_factor: f64,
        frame: &RawFrame,
    ) -> Result<IngestOutcome, StateError> {
        if !sampling_rate.is_finite() || sampling_rate <= 0.0 {
            return Err(StateError::InvalidSamplingRate {
                device_id: device_id.to_string(),
                rate: sampling_rate,
            });
        }
        validate_frame(frame)?;

        let mut devices = self.devices.lock();
        let mut profile_reset = false;

        let state = match devices.entry(device_id.to_string()) {
            Entry::Occupied(entry)
                if entry.get().profile.matches_layout(
                    &frame.channel_names,
                    &frame.channel_types,
                    sampling_rate,
                ) =>
            {
                entry.into_mut()
            }
            entry => {
                profile_reset = true;
                let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
                let fresh = self
                    .initialize_state(device_id, sampling_rate, scale_factor, frame)
                    .with_generation(generation);
                match entry {
                    Entry::Occupied(mut occupied) => {
                        occupied.insert(fresh);
                        occupied.into_mut()
                    }
                    Entry::Vacant(vacant) => vacant.insert(fresh),
                }
            }
        };

        state.profile.scale_factor = scale_factor;

        let report = {
            let mut tracker = state.tracker.lock();
            tracker.update(frame.signals.view(), frame.impedances.view());
            tracker.build_report().clone()
        };
        state.profile.apply_quality(&report);
        state.buffer.push_rows(frame.signals.view())?;

        debug!(
            "Ingested {} samples for {} ({} buffered, {} bad channels)",
            frame.num_samples(),
            device_id,
            state.buffer.len(),
            state.profile.bad_channels.len()
        );

        Ok(IngestOutcome {
            profile_reset,
            generation: state.generation,
            buffered_rows: state.buffer.len(),
            bad_channels: state.profile.bad_channels.clone(),
        })
    }

    fn initialize_state(
        &self,
        device_id: &str,
        sampling_rate: f64,
        scale_factor: f64,
        frame: &RawFrame,
    ) -> UserState {
        let profile = DeviceProfile::new(
            frame.channel_names.clone(),
            frame.channel_types.clone(),
            sampling_rate,
            scale_factor,
        );
        let tracker = ChannelQualityTracker::new(
            frame.channel_names.clone(),
            frame.channel_types.clone(),
            self.thresholds,
        );
        let buffer =
            SampleRing::for_retention(frame.num_channels(), sampling_rate, self.retention_seconds);

        info!(
            "Initialized profile for {}: {} channels at {} Hz ({} rows retained)",
            device_id,
            profile.num_channels(),
            sampling_rate,
            buffer.capacity()
        );

        for app in self.applications.iter() {
            let hook = catch_unwind(AssertUnwindSafe(|| {
                app.on_profile_initialized(device_id, &profile)
            }));
            if hook.is_err() {
                error!(
                    "Application {} panicked in profile hook for {}",
                    app.app_id(),
                    device_id
                );
            }
        }

        UserState::new(profile, tracker, buffer)
    }

    /// Independent copies of every device's state, ordered by device id
    pub fn snapshot(&self) -> Vec<DeviceSnapshot> {
        let devices = self.devices.lock();
        let mut snapshots: Vec<DeviceSnapshot> = devices
            .iter()
            .map(|(device_id, state)| state.snapshot(device_id))
            .collect();
        drop(devices);

        snapshots.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        snapshots
    }

    pub fn device_count(&self) -> usize {
        self.devices.lock().len()
    }

    pub fn device_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.devices.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn profile(&self, device_id: &str) -> Option<DeviceProfile> {
        self.devices
            .lock()
            .get(device_id)
            .map(|state| state.profile.clone())
    }

    pub fn buffered_rows(&self, device_id: &str) -> Option<usize> {
        self.devices
            .lock()
            .get(device_id)
            .map(|state| state.buffer.len())
    }
}

fn validate_frame(frame: &RawFrame) -> Result<(), StateError> {
    let names = frame.channel_names.len();
    let types = frame.channel_types.len();
    let columns = frame.signals.ncols();
    let impedance_shape = frame.impedances.dim();

    if names != types || columns != names || impedance_shape != frame.signals.dim() {
        return Err(StateError::InconsistentFrame {
            names,
            types,
            columns,
            impedance_shape,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::application::{AnalysisResult, RealtimeApplication};
    use crate::telemetry::{ChannelStatus, ChannelType, MotionSample};
    use ndarray::{Array2, ArrayView2};
    use std::sync::Arc;

    #[derive(Default)]
    struct HookRecorder {
        initialized: Mutex<Vec<(String, usize)>>,
    }

    impl RealtimeApplication for HookRecorder {
        fn app_id(&self) -> &str {
            "recorder"
        }

        fn display_name(&self) -> &str {
            "Recorder"
        }

        fn analyze(
            &self,
            _device_id: &str,
            _snapshot: &DeviceSnapshot,
            _window: ArrayView2<'_, i16>,
        ) -> anyhow::Result<Option<AnalysisResult>> {
            Ok(None)
        }

        fn on_profile_initialized(&self, device_id: &str, profile: &DeviceProfile) {
            self.initialized
                .lock()
                .push((device_id.to_string(), profile.num_channels()));
        }
    }

    fn frame(names: &[&str], rows: usize, value: i16) -> RawFrame {
        let n = names.len();
        RawFrame {
            channel_names: names.iter().map(|s| s.to_string()).collect(),
            channel_types: vec![ChannelType::Eeg; n],
            signals: Array2::from_elem((rows, n), value),
            impedances: Array2::from_elem((rows, n), 10),
            motion: vec![MotionSample::default(); rows],
        }
    }

    fn store_with(app: Arc<HookRecorder>, retention_seconds: f64) -> DeviceStateStore {
        let applications: ApplicationSet = vec![app as Arc<dyn RealtimeApplication>].into();
        DeviceStateStore::new(QualityThresholds::default(), retention_seconds, applications)
    }

    #[test]
    fn test_first_frame_creates_profile() {
        let recorder = Arc::new(HookRecorder::default());
        let store = store_with(recorder.clone(), 60.0);

        let outcome = store.ingest("dev-1", 256.0, 1e-6, &frame(&["C1", "C2"], 10, 5)).unwrap();
        assert!(outcome.profile_reset);
        assert_eq!(outcome.generation, 1);
        assert_eq!(outcome.buffered_rows, 10);
        assert!(outcome.bad_channels.is_empty());

        let outcome = store.ingest("dev-1", 256.0, 1e-6, &frame(&["C1", "C2"], 6, 5)).unwrap();
        assert!(!outcome.profile_reset);
        assert_eq!(outcome.generation, 1);
        assert_eq!(outcome.buffered_rows, 16);

        assert_eq!(
            *recorder.initialized.lock(),
            vec![("dev-1".to_string(), 2)]
        );
        assert_eq!(store.device_ids(), vec!["dev-1"]);
    }

    #[test]
    fn test_channel_change_resets_quality() {
        let store = store_with(Arc::new(HookRecorder::default()), 60.0);

        let outcome = store.ingest("dev", 256.0, 1.0, &frame(&["C1", "C2"], 20, 0)).unwrap();
        assert_eq!(outcome.bad_channels, vec!["C1", "C2"]);

        let outcome = store.ingest("dev", 256.0, 1.0, &frame(&["C1", "C3"], 4, 9)).unwrap();
        assert!(outcome.profile_reset);
        assert!(outcome.bad_channels.is_empty());
        assert_eq!(outcome.buffered_rows, 4);

        let profile = store.profile("dev").unwrap();
        assert_eq!(profile.channel_names, vec!["C1", "C3"]);
        assert!(profile
            .channel_report
            .iter()
            .all(|meta| meta.status == ChannelStatus::Good && meta.zero_ratio == 0.0));
    }

    #[test]
    fn test_sampling_rate_tolerance() {
        let store = store_with(Arc::new(HookRecorder::default()), 60.0);
        store.ingest("dev", 256.0, 1.0, &frame(&["C1"], 2, 3)).unwrap();

        let same = store.ingest("dev", 256.0 + 1e-9, 1.0, &frame(&["C1"], 2, 3)).unwrap();
        assert!(!same.profile_reset);

        let changed = store.ingest("dev", 512.0, 1.0, &frame(&["C1"], 2, 3)).unwrap();
        assert!(changed.profile_reset);
        assert!(changed.generation > same.generation);
        assert_eq!(changed.buffered_rows, 2);
    }

    #[test]
    fn test_scale_factor_tracks_latest_frame() {
        let store = store_with(Arc::new(HookRecorder::default()), 60.0);
        store.ingest("dev", 128.0, 1.0, &frame(&["C1"], 2, 3)).unwrap();
        let outcome = store.ingest("dev", 128.0, 0.5, &frame(&["C1"], 2, 3)).unwrap();

        assert!(!outcome.profile_reset);
        assert_eq!(store.profile("dev").unwrap().scale_factor, 0.5);
    }

    #[test]
    fn test_buffer_trimmed_to_retention() {
        // 10 Hz x 2 s
        let store = store_with(Arc::new(HookRecorder::default()), 2.0);
        for _ in 0..5 {
            store.ingest("dev", 10.0, 1.0, &frame(&["C1"], 7, 3)).unwrap();
        }
        assert_eq!(store.buffered_rows("dev"), Some(20));
    }

    #[test]
    fn test_snapshot_is_independent() {
        let store = store_with(Arc::new(HookRecorder::default()), 60.0);
        store.ingest("b", 4.0, 1.0, &frame(&["C1"], 3, 1)).unwrap();
        store.ingest("a", 4.0, 1.0, &frame(&["C1"], 2, 1)).unwrap();

        let snapshots = store.snapshot();
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].device_id, "a");
        assert_eq!(snapshots[1].buffered_rows(), 3);

        store.ingest("b", 4.0, 1.0, &frame(&["C1"], 5, 1)).unwrap();
        assert_eq!(snapshots[1].buffered_rows(), 3);
        assert_eq!(store.buffered_rows("b"), Some(8));
    }

    #[test]
    fn test_invalid_input_rejected() {
        let store = store_with(Arc::new(HookRecorder::default()), 60.0);
        assert!(matches!(
            store.ingest("dev", 0.0, 1.0, &frame(&["C1"], 2, 3)),
            Err(StateError::InvalidSamplingRate { .. })
        ));

        let mut broken = frame(&["C1", "C2"], 2, 3);
        broken.channel_types.pop();
        assert!(matches!(
            store.ingest("dev", 128.0, 1.0, &broken),
            Err(StateError::InconsistentFrame { .. })
        ));
        assert_eq!(store.device_count(), 0);
    }

    #[test]
    fn test_generation_is_monotonic_across_devices_and_resets() {
        let store = store_with(Arc::new(HookRecorder::default()), 60.0);
        let a1 = store.ingest("a", 4.0, 1.0, &frame(&["C1"], 2, 1)).unwrap();
        let b1 = store.ingest("b", 4.0, 1.0, &frame(&["C1"], 2, 1)).unwrap();
        let a2 = store.ingest("a", 4.0, 1.0, &frame(&["C2"], 2, 1)).unwrap();

        assert!(a1.generation < b1.generation);
        assert!(b1.generation < a2.generation);

        let snapshots = store.snapshot();
        assert_eq!(snapshots[0].generation, a2.generation);
        assert_eq!(snapshots[1].generation, b1.generation);
    }

    #[test]
    fn test_concurrent_snapshots_never_see_partial_ingest() {
        let store = store_with(Arc::new(HookRecorder::default()), 1000.0);
        const FRAMES: usize = 200;
        const ROWS: usize = 3;

        std::thread::scope(|scope| {
            scope.spawn(|| {
                for i in 0..FRAMES {
                    // Each frame carries its own index as the sample value
                    store.ingest("dev", 100.0, 1.0, &frame(&["C1", "C2"], ROWS, i as i16)).unwrap();
                }
            });

            scope.spawn(|| {
                let mut observed = 0;
                while observed < FRAMES * ROWS {
                    for snapshot in store.snapshot() {
                        let rows = snapshot.buffered_rows();
                        assert_eq!(rows % ROWS, 0, "snapshot holds a partial frame");

                        let frames = rows / ROWS;
                        let tracked = snapshot.tracker.lock().total_samples(0);
                        assert!(tracked.unwrap_or(0) >= rows as u64);
                        let expected: Vec<i16> = (0..frames)
                            .flat_map(|i| std::iter::repeat(i as i16).take(ROWS))
                            .collect();
                        assert_eq!(snapshot.buffer.column(0).to_vec(), expected);
                        assert_eq!(snapshot.buffer.column(1).to_vec(), expected);
                        observed = rows;
                    }
                }
            });
        });

        assert_eq!(store.buffered_rows("dev"), Some(FRAMES * ROWS));
    }
}

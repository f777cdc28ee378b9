use crate::telemetry::{
    ChannelQualityMeta, ChannelQualityTracker, ChannelType, QualityReport, SampleRing,
};
use ndarray::{s, Array2, ArrayView2};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;

/// Sampling rates closer than this are treated as the same configuration
pub const SAMPLING_RATE_TOLERANCE: f64 = 1e-6;

/// Configuration of one device as observed on the bus
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceProfile {
    pub channel_names: Vec<String>,
    pub channel_types: Vec<ChannelType>,
    pub sampling_rate: f64,
    /// Multiplier converting raw i16 counts to volts
    pub scale_factor: f64,
    pub bad_channels: Vec<String>,
    pub channel_report: Vec<ChannelQualityMeta>,
}

impl DeviceProfile {
    pub fn new(
        channel_names: Vec<String>,
        channel_types: Vec<ChannelType>,
        sampling_rate: f64,
        scale_factor: f64,
    ) -> Self {
        Self {
            channel_names,
            channel_types,
            sampling_rate,
            scale_factor,
            bad_channels: Vec::new(),
            channel_report: Vec::new(),
        }
    }

    pub fn num_channels(&self) -> usize {
        self.channel_names.len()
    }

    /// Whether a frame with this layout and rate belongs to the same profile
    pub fn matches_layout(
        &self,
        channel_names: &[String],
        channel_types: &[ChannelType],
        sampling_rate: f64,
    ) -> bool {
        self.channel_names == channel_names
            && self.channel_types == channel_types
            && (self.sampling_rate - sampling_rate).abs() <= SAMPLING_RATE_TOLERANCE
    }

    /// Column indices of analysis-eligible channels not currently marked bad
    pub fn analysis_channel_indices(&self) -> Vec<usize> {
        self.channel_names
            .iter()
            .zip(&self.channel_types)
            .enumerate()
            .filter(|(_, (name, channel_type))| {
                channel_type.is_analysis_eligible() && !self.bad_channels.contains(name)
            })
            .map(|(idx, _)| idx)
            .collect()
    }

    /// Replace the cached classification with a fresh report
    pub fn apply_quality(&mut self, report: &QualityReport) {
        self.bad_channels = report.bad_channels.clone();
        self.channel_report = report.channels.clone();
    }
}

/// Live per-device state, owned by the state store
#[derive(Debug)]
pub struct UserState {
    pub profile: DeviceProfile,
    pub buffer: SampleRing,
    pub tracker: Arc<Mutex<ChannelQualityTracker>>,
    /// Bumped by the store every time the device's profile is reset
    pub generation: u64,
}

impl UserState {
    pub fn new(profile: DeviceProfile, tracker: ChannelQualityTracker, buffer: SampleRing) -> Self {
        Self {
            profile,
            buffer,
            tracker: Arc::new(Mutex::new(tracker)),
            generation: 0,
        }
    }

    pub fn with_generation(mut self, generation: u64) -> Self {
        self.generation = generation;
        self
    }

    /// Independent copy for readers; the tracker handle is shared
    pub fn snapshot(&self, device_id: &str) -> DeviceSnapshot {
        DeviceSnapshot {
            device_id: device_id.to_string(),
            profile: self.profile.clone(),
            buffer: self.buffer.to_array(),
            tracker: Arc::clone(&self.tracker),
            generation: self.generation,
        }
    }
}

/// Point-in-time copy of one device's state handed to analysis
#[derive(Debug, Clone)]
pub struct DeviceSnapshot {
    pub device_id: String,
    pub profile: DeviceProfile,
    /// (samples, channels), oldest first
    pub buffer: Array2<i16>,
    pub tracker: Arc<Mutex<ChannelQualityTracker>>,
    /// Profile generation the copy was taken from
    pub generation: u64,
}

impl DeviceSnapshot {
    pub fn buffered_rows(&self) -> usize {
        self.buffer.nrows()
    }

    /// The trailing `rows` rows of the buffer, if that many are held
    pub fn window(&self, rows: usize) -> Option<ArrayView2<'_, i16>> {
        let len = self.buffer.nrows();
        if rows > len {
            return None;
        }
        Some(self.buffer.slice(s![len - rows.., ..]))
    }
}

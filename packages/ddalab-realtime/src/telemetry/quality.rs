// Streaming channel quality tracking
//
// Accumulates per-channel counters across an unbounded sequence of frames and
// classifies each channel as good or bad on demand. The classification is
// memoized behind a dirty flag: `build_report` only recomputes after `update`
// has changed the counters.

use crate::telemetry::frame::ChannelType;
use ndarray::ArrayView2;
use serde::{Deserialize, Serialize};

/// Impedance code reserved for "impedance not measured"
pub const UNKNOWN_IMPEDANCE_CODE: u8 = 255;

/// Thresholds used to classify channels
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityThresholds {
    /// Zero-fill ratio at or above which a channel is bad
    pub zero_ratio: f64,
    /// A batch whose peak-to-peak amplitude is at or below this (raw LSB) flags flatline
    pub flatline_ptp: f64,
    /// Impedance codes at or above this are high (the unknown code excluded)
    pub bad_impedance_code: u8,
    /// High-impedance ratio at or above which a channel is bad
    pub bad_impedance_ratio: f64,
    /// Unknown-impedance ratio at or above which a warning is recorded
    pub unknown_impedance_ratio: f64,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            zero_ratio: 0.98,
            flatline_ptp: 1.0,
            bad_impedance_code: 200,
            bad_impedance_ratio: 0.5,
            unknown_impedance_ratio: 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelStatus {
    Good,
    Bad,
}

/// Quality classification for one channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelQualityMeta {
    pub name: String,
    pub status: ChannelStatus,
    pub reasons: Vec<String>,
    pub zero_ratio: f64,
    pub bad_impedance_ratio: f64,
    pub unknown_impedance_ratio: f64,
    pub flatline: bool,
    #[serde(rename = "type")]
    pub channel_type: ChannelType,
    /// Reasons were recorded but the channel is not bad
    pub has_warning: bool,
}

/// Classification of every channel, in declaration order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    pub bad_channels: Vec<String>,
    pub channels: Vec<ChannelQualityMeta>,
}

impl QualityReport {
    pub fn channel(&self, name: &str) -> Option<&ChannelQualityMeta> {
        self.channels.iter().find(|meta| meta.name == name)
    }

    pub fn is_bad(&self, name: &str) -> bool {
        self.bad_channels.iter().any(|bad| bad == name)
    }
}

#[derive(Debug, Clone, Default)]
struct ChannelCounters {
    total_samples: u64,
    zero_samples: u64,
    high_impedance_samples: u64,
    unknown_impedance_samples: u64,
    flatline_detected: bool,
}

/// Per-device accumulator of channel quality statistics
#[derive(Debug, Clone)]
pub struct ChannelQualityTracker {
    channel_names: Vec<String>,
    channel_types: Vec<ChannelType>,
    thresholds: QualityThresholds,
    counters: Vec<ChannelCounters>,
    dirty: bool,
    cached: QualityReport,
}

impl ChannelQualityTracker {
    pub fn new(
        channel_names: Vec<String>,
        channel_types: Vec<ChannelType>,
        thresholds: QualityThresholds,
    ) -> Self {
        let counters = vec![ChannelCounters::default(); channel_names.len()];
        Self {
            channel_names,
            channel_types,
            thresholds,
            counters,
            dirty: true,
            cached: QualityReport::default(),
        }
    }

    pub fn num_channels(&self) -> usize {
        self.channel_names.len()
    }

    pub fn thresholds(&self) -> &QualityThresholds {
        &self.thresholds
    }

    /// True when counters changed since the last `build_report`
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Total samples seen on a channel
    pub fn total_samples(&self, channel: usize) -> Option<u64> {
        self.counters.get(channel).map(|c| c.total_samples)
    }

    /// Fold one batch of (samples, channels) data into the counters
    ///
    /// Batches that are empty or whose width does not match the channel layout
    /// are ignored. Impedance statistics are only taken when the impedance
    /// matrix has the same shape as the signal matrix.
    ///
    /// Flatline is judged per batch and only for batches of at least two
    /// samples; a single-sample batch never sets the flatline flag.
    pub fn update(&mut self, signals: ArrayView2<'_, i16>, impedances: ArrayView2<'_, u8>) {
        let num_channels = self.num_channels();
        if signals.nrows() == 0 || signals.ncols() != num_channels {
            return;
        }

        let batch_len = signals.nrows() as u64;
        let impedances_usable = impedances.dim() == signals.dim();

        for (idx, counters) in self.counters.iter_mut().enumerate() {
            counters.total_samples += batch_len;

            if !self.channel_types[idx].is_analysis_eligible() {
                continue;
            }

            let column = signals.column(idx);
            let mut min = i16::MAX;
            let mut max = i16::MIN;
            for &value in column.iter() {
                if value == 0 {
                    counters.zero_samples += 1;
                }
                min = min.min(value);
                max = max.max(value);
            }

            // Peak-to-peak is meaningless for a single sample
            if batch_len >= 2 {
                let ptp = f64::from(max) - f64::from(min);
                if ptp <= self.thresholds.flatline_ptp {
                    counters.flatline_detected = true;
                }
            }

            if impedances_usable {
                for &code in impedances.column(idx).iter() {
                    if code == UNKNOWN_IMPEDANCE_CODE {
                        counters.unknown_impedance_samples += 1;
                    } else if code >= self.thresholds.bad_impedance_code {
                        counters.high_impedance_samples += 1;
                    }
                }
            }
        }

        self.dirty = true;
    }

    /// Classify every channel; cached until the next `update`
    pub fn build_report(&mut self) -> &QualityReport {
        if self.dirty {
            self.cached = self.classify();
            self.dirty = false;
        }
        &self.cached
    }

    fn classify(&self) -> QualityReport {
        let thresholds = &self.thresholds;
        let mut report = QualityReport {
            bad_channels: Vec::new(),
            channels: Vec::with_capacity(self.num_channels()),
        };

        for (idx, name) in self.channel_names.iter().enumerate() {
            let channel_type = self.channel_types[idx];
            let counters = &self.counters[idx];
            let mut status = ChannelStatus::Good;
            let mut reasons = Vec::new();

            if !channel_type.is_analysis_eligible() {
                report.channels.push(ChannelQualityMeta {
                    name: name.clone(),
                    status,
                    reasons,
                    zero_ratio: 0.0,
                    bad_impedance_ratio: 0.0,
                    unknown_impedance_ratio: 0.0,
                    flatline: false,
                    channel_type,
                    has_warning: false,
                });
                continue;
            }

            let total = counters.total_samples.max(1) as f64;
            let zero_ratio = counters.zero_samples as f64 / total;
            let high_ratio = counters.high_impedance_samples as f64 / total;
            let unknown_ratio = counters.unknown_impedance_samples as f64 / total;

            if zero_ratio >= thresholds.zero_ratio {
                status = ChannelStatus::Bad;
                reasons.push(format!("zero-fill {}", percent(zero_ratio)));
            }

            if high_ratio >= thresholds.bad_impedance_ratio {
                status = ChannelStatus::Bad;
                reasons.push(format!("impedance high {}", percent(high_ratio)));
            } else if unknown_ratio >= thresholds.unknown_impedance_ratio {
                reasons.push(format!("impedance unknown {}", percent(unknown_ratio)));
            }

            if counters.flatline_detected {
                reasons.push("flatline amplitude".to_string());
            }

            if status == ChannelStatus::Bad {
                report.bad_channels.push(name.clone());
            }

            let has_warning = status != ChannelStatus::Bad && !reasons.is_empty();
            report.channels.push(ChannelQualityMeta {
                name: name.clone(),
                status,
                reasons,
                zero_ratio,
                bad_impedance_ratio: high_ratio,
                unknown_impedance_ratio: unknown_ratio,
                flatline: counters.flatline_detected,
                channel_type,
                has_warning,
            });
        }

        report
    }
}

fn percent(ratio: f64) -> String {
    format!("{:.0}%", ratio * 100.0)
}

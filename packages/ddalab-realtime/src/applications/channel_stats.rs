use crate::applications::{physical_channels, sorted_bad_channels};
use crate::host::{AnalysisResult, RealtimeApplication};
use crate::state::DeviceSnapshot;
use crate::telemetry::ChannelQualityMeta;
use chrono::{DateTime, Utc};
use ndarray::ArrayView2;
use serde::{Deserialize, Serialize};

/// Per-channel descriptive statistics of the analysis window
#[derive(Debug, Default, Clone, Copy)]
pub struct ChannelStatsApplication;

/// Statistics for one channel, in volts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelStats {
    pub channel: String,
    pub mean: f64,
    pub std: f64,
    pub min: f64,
    pub max: f64,
    pub ptp: f64,
    pub rms: f64,
}

impl ChannelStats {
    fn compute(channel: String, values: &[f64]) -> Self {
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let rms = (values.iter().map(|v| v * v).sum::<f64>() / n).sqrt();

        Self {
            channel,
            mean,
            std: variance.sqrt(),
            min,
            max,
            ptp: max - min,
            rms,
        }
    }
}

#[derive(Debug, Serialize)]
struct ChannelStatsResult {
    timestamp: DateTime<Utc>,
    window_samples: usize,
    bad_channels: Vec<String>,
    channels: Vec<ChannelStats>,
    channel_quality: Vec<ChannelQualityMeta>,
}

impl RealtimeApplication for ChannelStatsApplication {
    fn app_id(&self) -> &str {
        "channel_stats"
    }

    fn display_name(&self) -> &str {
        "Channel Statistics"
    }

    fn description(&self) -> &str {
        "Amplitude statistics and signal quality per channel."
    }

    fn analyze(
        &self,
        _device_id: &str,
        snapshot: &DeviceSnapshot,
        window: ArrayView2<'_, i16>,
    ) -> anyhow::Result<Option<AnalysisResult>> {
        let Some(channels) = physical_channels(snapshot, window) else {
            return Ok(None);
        };

        let stats = channels
            .names
            .into_iter()
            .zip(&channels.signals)
            .map(|(name, values)| ChannelStats::compute(name, values))
            .collect();

        let result = ChannelStatsResult {
            timestamp: Utc::now(),
            window_samples: window.nrows(),
            bad_channels: sorted_bad_channels(snapshot),
            channels: stats,
            channel_quality: snapshot.profile.channel_report.clone(),
        };

        Ok(Some(serde_json::to_value(result)?))
    }
}

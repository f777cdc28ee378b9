// Built-in realtime analysis applications

pub mod channel_stats;
pub mod psd_coherence;

pub use channel_stats::ChannelStatsApplication;
pub use psd_coherence::{PsdCoherenceApplication, SpectralParams};

use crate::host::RealtimeApplication;
use crate::state::DeviceSnapshot;
use ndarray::ArrayView2;
use std::sync::Arc;

/// Applications registered by the analyzer binary, in dispatch order
pub fn builtin() -> Vec<Arc<dyn RealtimeApplication>> {
    vec![
        Arc::new(PsdCoherenceApplication::default()),
        Arc::new(ChannelStatsApplication),
    ]
}

/// Good, analysis-eligible channels of the window converted to physical units
pub(crate) struct PhysicalChannels {
    pub names: Vec<String>,
    pub signals: Vec<Vec<f64>>,
}

/// `None` when the scale factor is zero or no usable channel remains
pub(crate) fn physical_channels(
    snapshot: &DeviceSnapshot,
    window: ArrayView2<'_, i16>,
) -> Option<PhysicalChannels> {
    let profile = &snapshot.profile;
    if profile.scale_factor == 0.0 || !profile.scale_factor.is_finite() || window.nrows() == 0 {
        return None;
    }

    let indices: Vec<usize> = profile
        .analysis_channel_indices()
        .into_iter()
        .filter(|&idx| idx < window.ncols())
        .collect();
    if indices.is_empty() {
        return None;
    }

    let names = indices
        .iter()
        .map(|&idx| profile.channel_names[idx].clone())
        .collect();
    let signals = indices
        .iter()
        .map(|&idx| {
            window
                .column(idx)
                .iter()
                .map(|&raw| f64::from(raw) * profile.scale_factor)
                .collect()
        })
        .collect();

    Some(PhysicalChannels { names, signals })
}

/// Bad channel names in lexical order
pub(crate) fn sorted_bad_channels(snapshot: &DeviceSnapshot) -> Vec<String> {
    let mut bad = snapshot.profile.bad_channels.clone();
    bad.sort();
    bad
}

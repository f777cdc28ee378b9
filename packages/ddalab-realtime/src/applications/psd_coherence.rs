use crate::applications::{physical_channels, sorted_bad_channels};
use crate::host::{AnalysisResult, RealtimeApplication};
use crate::state::DeviceSnapshot;
use crate::telemetry::ChannelQualityMeta;
use chrono::{DateTime, Utc};
use ndarray::ArrayView2;
use rayon::prelude::*;
use rustfft::{num_complex::Complex, FftPlanner};
use serde::Serialize;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::f64::consts::PI;
use tracing::debug;

// Per-thread planner; devices may be analyzed on rayon workers
thread_local! {
    static FFT_PLANNER: RefCell<FftPlanner<f64>> = RefCell::new(FftPlanner::new());
}

/// Classic EEG bands in Hz; the last band includes its upper edge
pub const BANDS: [(&str, f64, f64); 5] = [
    ("delta", 1.0, 4.0),
    ("theta", 4.0, 8.0),
    ("alpha", 8.0, 13.0),
    ("beta", 13.0, 30.0),
    ("gamma", 30.0, 45.0),
];

/// Welch estimator and reporting parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpectralParams {
    /// Lowest reported frequency (Hz)
    pub fmin: f64,
    /// Highest reported frequency (Hz)
    pub fmax: f64,
    pub segment_seconds: f64,
    /// Fraction of a segment shared with the next one
    pub overlap: f64,
    /// Band averaged for the coherence matrix (Hz)
    pub coherence_band: (f64, f64),
    /// Channels with a smaller standard deviation (volts) are excluded
    pub min_std: f64,
}

impl Default for SpectralParams {
    fn default() -> Self {
        Self {
            fmin: 1.0,
            fmax: 45.0,
            segment_seconds: 1.0,
            overlap: 0.5,
            coherence_band: (8.0, 13.0),
            min_std: 1e-9,
        }
    }
}

/// Welch power spectral density, band powers and alpha-band coherence
#[derive(Debug, Default)]
pub struct PsdCoherenceApplication {
    params: SpectralParams,
}

#[derive(Debug, Serialize)]
struct PsdCoherenceResult {
    timestamp: DateTime<Utc>,
    sampling_rate: f64,
    window_samples: usize,
    segment_samples: usize,
    bad_channels: Vec<String>,
    analysis_channels: Vec<String>,
    excluded_low_variance: Vec<String>,
    frequencies: Vec<f64>,
    /// One row per analysis channel, V²/Hz
    psd: Vec<Vec<f64>>,
    band_powers: Vec<ChannelBandPowers>,
    coherence: CoherenceMatrix,
    channel_quality: Vec<ChannelQualityMeta>,
}

#[derive(Debug, Serialize)]
struct ChannelBandPowers {
    channel: String,
    absolute: BTreeMap<&'static str, f64>,
    relative: BTreeMap<&'static str, f64>,
}

#[derive(Debug, Serialize)]
struct CoherenceMatrix {
    band: [f64; 2],
    channels: Vec<String>,
    matrix: Vec<Vec<f64>>,
}

impl PsdCoherenceApplication {
    pub fn new(params: SpectralParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &SpectralParams {
        &self.params
    }
}

impl RealtimeApplication for PsdCoherenceApplication {
    fn app_id(&self) -> &str {
        "psd_coherence"
    }

    fn display_name(&self) -> &str {
        "PSD & Coherence"
    }

    fn description(&self) -> &str {
        "Power spectral density and coherence visualisation."
    }

    fn analyze(
        &self,
        device_id: &str,
        snapshot: &DeviceSnapshot,
        window: ArrayView2<'_, i16>,
    ) -> anyhow::Result<Option<AnalysisResult>> {
        let Some(channels) = physical_channels(snapshot, window) else {
            debug!("No usable channels for device {}", device_id);
            return Ok(None);
        };

        let sampling_rate = snapshot.profile.sampling_rate;
        let Some(plan) = WelchPlan::new(sampling_rate, window.nrows(), &self.params) else {
            debug!(
                "Window of {} samples too short for spectral analysis on device {}",
                window.nrows(),
                device_id
            );
            return Ok(None);
        };

        let mut names = Vec::new();
        let mut signals = Vec::new();
        let mut excluded_low_variance = Vec::new();
        for (name, signal) in channels.names.into_iter().zip(channels.signals) {
            if std_dev(&signal) < self.params.min_std {
                excluded_low_variance.push(name);
            } else {
                names.push(name);
                signals.push(signal);
            }
        }
        if names.is_empty() {
            debug!(
                "All channels on device {} below variance floor: {:?}",
                device_id, excluded_low_variance
            );
            return Ok(None);
        }

        let spectra: Vec<Vec<Vec<Complex<f64>>>> = signals
            .par_iter()
            .map(|signal| plan.segment_spectra(signal))
            .collect();

        let frequencies = plan.frequencies();
        let resolution = plan.resolution();
        let reported: Vec<usize> = bins_within(&frequencies, self.params.fmin, self.params.fmax);
        let coherence_bins = bins_within(
            &frequencies,
            self.params.coherence_band.0,
            self.params.coherence_band.1,
        );

        let mut psd = Vec::with_capacity(names.len());
        let mut band_powers = Vec::with_capacity(names.len());
        for (name, channel_spectra) in names.iter().zip(&spectra) {
            let density = plan.psd(channel_spectra);
            band_powers.push(band_powers_of(
                name,
                &density,
                &frequencies,
                resolution,
                &self.params,
            ));
            psd.push(reported.iter().map(|&k| density[k]).collect());
        }

        let n = names.len();
        let mut matrix = vec![vec![0.0; n]; n];
        for i in 0..n {
            matrix[i][i] = 1.0;
            for j in (i + 1)..n {
                let value = band_coherence(&spectra[i], &spectra[j], &coherence_bins);
                matrix[i][j] = value;
                matrix[j][i] = value;
            }
        }

        let result = PsdCoherenceResult {
            timestamp: Utc::now(),
            sampling_rate,
            window_samples: window.nrows(),
            segment_samples: plan.nperseg,
            bad_channels: sorted_bad_channels(snapshot),
            analysis_channels: names.clone(),
            excluded_low_variance,
            frequencies: reported.iter().map(|&k| frequencies[k]).collect(),
            psd,
            band_powers,
            coherence: CoherenceMatrix {
                band: [self.params.coherence_band.0, self.params.coherence_band.1],
                channels: names,
                matrix,
            },
            channel_quality: snapshot.profile.channel_report.clone(),
        };

        Ok(Some(serde_json::to_value(result)?))
    }
}

/// Segmenting and scaling for one window length
struct WelchPlan {
    nperseg: usize,
    step: usize,
    window: Vec<f64>,
    /// Density normalisation 1 / (fs · Σw²)
    scale: f64,
    sampling_rate: f64,
}

impl WelchPlan {
    fn new(sampling_rate: f64, len: usize, params: &SpectralParams) -> Option<Self> {
        let nperseg = ((sampling_rate * params.segment_seconds).floor() as usize).min(len);
        if nperseg < 4 {
            return None;
        }
        let noverlap = ((nperseg as f64 * params.overlap).floor() as usize).min(nperseg - 1);

        // Periodic Hann
        let window: Vec<f64> = (0..nperseg)
            .map(|i| 0.5 * (1.0 - (2.0 * PI * i as f64 / nperseg as f64).cos()))
            .collect();
        let power: f64 = window.iter().map(|w| w * w).sum();

        Some(Self {
            nperseg,
            step: nperseg - noverlap,
            window,
            scale: 1.0 / (sampling_rate * power),
            sampling_rate,
        })
    }

    fn num_bins(&self) -> usize {
        self.nperseg / 2 + 1
    }

    fn resolution(&self) -> f64 {
        self.sampling_rate / self.nperseg as f64
    }

    fn frequencies(&self) -> Vec<f64> {
        let resolution = self.resolution();
        (0..self.num_bins())
            .map(|k| k as f64 * resolution)
            .collect()
    }

    /// Positive-frequency FFT of every mean-removed, windowed segment
    fn segment_spectra(&self, signal: &[f64]) -> Vec<Vec<Complex<f64>>> {
        let bins = self.num_bins();
        let mut spectra = Vec::new();

        FFT_PLANNER.with(|planner| {
            let fft = planner.borrow_mut().plan_fft_forward(self.nperseg);
            let mut start = 0;
            while start + self.nperseg <= signal.len() {
                let segment = &signal[start..start + self.nperseg];
                let mean = segment.iter().sum::<f64>() / self.nperseg as f64;
                let mut buffer: Vec<Complex<f64>> = segment
                    .iter()
                    .zip(&self.window)
                    .map(|(&x, &w)| Complex::new((x - mean) * w, 0.0))
                    .collect();
                fft.process(&mut buffer);
                buffer.truncate(bins);
                spectra.push(buffer);
                start += self.step;
            }
        });

        spectra
    }

    fn psd(&self, spectra: &[Vec<Complex<f64>>]) -> Vec<f64> {
        let count = spectra.len().max(1) as f64;
        let last = self.num_bins() - 1;
        (0..self.num_bins())
            .map(|k| {
                let mean = spectra.iter().map(|s| s[k].norm_sqr()).sum::<f64>() / count;
                // One-sided: fold negative frequencies except DC and an even-length Nyquist bin
                let fold = if k == 0 || (k == last && self.nperseg % 2 == 0) {
                    1.0
                } else {
                    2.0
                };
                mean * self.scale * fold
            })
            .collect()
    }
}

fn bins_within(frequencies: &[f64], low: f64, high: f64) -> Vec<usize> {
    frequencies
        .iter()
        .enumerate()
        .filter(|&(_, &f)| f >= low && f <= high)
        .map(|(k, _)| k)
        .collect()
}

fn band_powers_of(
    channel: &str,
    density: &[f64],
    frequencies: &[f64],
    resolution: f64,
    params: &SpectralParams,
) -> ChannelBandPowers {
    let integrate = |low: f64, high: f64, inclusive: bool| -> f64 {
        density
            .iter()
            .zip(frequencies)
            .filter(|&(_, &f)| f >= low && (f < high || (inclusive && f <= high)))
            .map(|(p, _)| p * resolution)
            .sum()
    };

    let total = integrate(params.fmin, params.fmax, true);
    let mut absolute = BTreeMap::new();
    let mut relative = BTreeMap::new();
    for (idx, (band, low, high)) in BANDS.iter().enumerate() {
        let power = integrate(*low, *high, idx == BANDS.len() - 1);
        absolute.insert(*band, power);
        relative.insert(*band, if total > 0.0 { power / total } else { 0.0 });
    }

    ChannelBandPowers {
        channel: channel.to_string(),
        absolute,
        relative,
    }
}

/// Magnitude-squared coherence averaged over `bins`
fn band_coherence(a: &[Vec<Complex<f64>>], b: &[Vec<Complex<f64>>], bins: &[usize]) -> f64 {
    if bins.is_empty() {
        return 0.0;
    }

    let total: f64 = bins
        .iter()
        .map(|&k| {
            let mut cross = Complex::new(0.0, 0.0);
            let mut power_a = 0.0;
            let mut power_b = 0.0;
            for (sa, sb) in a.iter().zip(b) {
                cross += sa[k].conj() * sb[k];
                power_a += sa[k].norm_sqr();
                power_b += sb[k].norm_sqr();
            }
            if power_a <= 0.0 || power_b <= 0.0 {
                0.0
            } else {
                (cross.norm_sqr() / (power_a * power_b)).min(1.0)
            }
        })
        .sum();

    total / bins.len() as f64
}

fn std_dev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt()
}

use std::sync::Arc;

use ndarray::Array1;
use rustfft::{num_complex::Complex64, Fft, FftPlanner};

use crate::drivers::TimeSeriesFrame;
use crate::types::BandDefinition;

/// One-sided power spectral density for each channel.
#[derive(Clone, Debug)]
pub struct FrequencySpectrum {
    pub sample_rate_hz: f64,
    pub frequencies_hz: Vec<f64>,
    pub densities: Vec<Vec<f64>>, // channel -> bins
    pub channel_labels: Vec<String>,
}

impl FrequencySpectrum {
    pub fn band_power(&self, channel: usize, band: &BandDefinition) -> f64 {
        self.densities
            .get(channel)
            .map(|bins| band_mean(&self.frequencies_hz, bins, band))
            .unwrap_or(0.0)
    }
}

/// Mean density over the bins inside `band`. A band narrower than the bin
/// spacing falls back to the bin nearest its center.
pub fn band_mean(frequencies_hz: &[f64], density: &[f64], band: &BandDefinition) -> f64 {
    let mut sum = 0.0;
    let mut count = 0usize;
    for (freq, value) in frequencies_hz.iter().zip(density) {
        if band.contains(*freq) {
            sum += value;
            count += 1;
        }
    }
    if count > 0 {
        return sum / count as f64;
    }
    let center = (band.low_hz + band.high_hz) / 2.0;
    frequencies_hz
        .iter()
        .zip(density)
        .min_by(|a, b| (a.0 - center).abs().total_cmp(&(b.0 - center).abs()))
        .map(|(_, v)| *v)
        .unwrap_or(0.0)
}

/// Periodic Hann taper.
pub fn hann(len: usize) -> Array1<f64> {
    if len <= 1 {
        return Array1::ones(len);
    }
    Array1::from_shape_fn(len, |k| {
        0.5 - 0.5 * (2.0 * std::f64::consts::PI * k as f64 / len as f64).cos()
    })
}

/// Computes tapered periodograms for a fixed window size. The FFT plan and
/// the taper are built once and reused for every window.
pub struct SpectrumBuilder {
    fft_size: usize,
    sample_rate_hz: f64,
    fft: Arc<dyn Fft<f64>>,
    taper: Array1<f64>,
    scale: f64,
}

impl SpectrumBuilder {
    pub fn new(fft_size: usize, sample_rate_hz: f64) -> Self {
        let fft_size = fft_size.max(1);
        let mut planner = FftPlanner::<f64>::new();
        let fft = planner.plan_fft_forward(fft_size);
        let taper = hann(fft_size);
        let taper_energy = taper.mapv(|w| w * w).sum();
        let scale = if taper_energy > 0.0 && sample_rate_hz > 0.0 {
            1.0 / (sample_rate_hz * taper_energy)
        } else {
            0.0
        };
        Self {
            fft_size,
            sample_rate_hz,
            fft,
            taper,
            scale,
        }
    }

    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    /// Bin centers from DC up to and including Nyquist.
    pub fn frequencies(&self) -> Vec<f64> {
        let resolution = self.sample_rate_hz / self.fft_size as f64;
        (0..=self.fft_size / 2).map(|k| k as f64 * resolution).collect()
    }

    /// Density of one channel. Shorter inputs are zero padded after tapering.
    pub fn channel_density(&self, values: &[f32]) -> Vec<f64> {
        let used = values.len().min(self.fft_size);
        let signal = Array1::from_iter(values[..used].iter().map(|v| *v as f64));
        let mean = signal.mean().unwrap_or(0.0);
        let mut buffer: Vec<Complex64> = signal
            .iter()
            .zip(self.taper.iter())
            .map(|(v, w)| Complex64::new((v - mean) * w, 0.0))
            .collect();
        buffer.resize(self.fft_size, Complex64::new(0.0, 0.0));
        self.fft.process(&mut buffer);

        let nyquist = self.fft_size / 2;
        buffer
            .iter()
            .take(nyquist + 1)
            .enumerate()
            .map(|(k, c)| {
                let power = c.norm_sqr() * self.scale;
                let mirrored = k > 0 && !(self.fft_size % 2 == 0 && k == nyquist);
                if mirrored {
                    power * 2.0
                } else {
                    power
                }
            })
            .collect()
    }

    pub fn compute(&self, frame: &TimeSeriesFrame) -> FrequencySpectrum {
        FrequencySpectrum {
            sample_rate_hz: self.sample_rate_hz,
            frequencies_hz: self.frequencies(),
            densities: frame
                .samples
                .iter()
                .map(|channel| self.channel_density(channel))
                .collect(),
            channel_labels: frame.channel_labels.clone(),
        }
    }
}

// src/types.rs
use serde::{Deserialize, Serialize};

// === 原始数据：样本与会话元数据 ===

/// One timestamped multi-channel voltage reading.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Monotonic seconds.
    pub timestamp: f64,
    pub channels: Vec<f32>,
}

impl Sample {
    pub fn new(timestamp: f64, channels: Vec<f32>) -> Self {
        Self {
            timestamp,
            channels,
        }
    }

    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }
}

/// Immutable description of a live or recorded session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub channel_names: Vec<String>,
    pub nominal_sample_rate: f64,
    pub start_time: f64,
}

impl SessionMetadata {
    pub fn new(channel_names: Vec<String>, nominal_sample_rate: f64, start_time: f64) -> Self {
        Self {
            channel_names,
            nominal_sample_rate,
            start_time,
        }
    }

    pub fn num_channels(&self) -> usize {
        self.channel_names.len()
    }

    /// Seconds between two nominal samples; zero for a degenerate rate.
    pub fn sample_period(&self) -> f64 {
        if self.nominal_sample_rate > 0.0 {
            1.0 / self.nominal_sample_rate
        } else {
            0.0
        }
    }

    pub fn channel_index(&self, name: &str) -> Option<usize> {
        self.channel_names.iter().position(|c| c == name)
    }
}

/// Muse headband electrode layout (TP9, AF7, AF8, TP10).
pub fn muse_channel_names() -> Vec<String> {
    ["TP9", "AF7", "AF8", "TP10"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

pub const MUSE_SAMPLE_RATE_HZ: f64 = 256.0;

// === 频段定义：左闭右开 [low, high) ===

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Band {
    Delta,
    Theta,
    Alpha,
    Beta,
    Gamma,
}

impl Band {
    pub const ALL: [Band; 5] = [Band::Delta, Band::Theta, Band::Alpha, Band::Beta, Band::Gamma];

    pub fn name(&self) -> &'static str {
        match self {
            Band::Delta => "Delta",
            Band::Theta => "Theta",
            Band::Alpha => "Alpha",
            Band::Beta => "Beta",
            Band::Gamma => "Gamma",
        }
    }

    /// Canonical frequency range in Hz.
    pub fn range_hz(&self) -> (f64, f64) {
        match self {
            Band::Delta => (0.5, 4.0),
            Band::Theta => (4.0, 8.0),
            Band::Alpha => (8.0, 13.0),
            Band::Beta => (13.0, 30.0),
            Band::Gamma => (30.0, 45.0),
        }
    }
}

impl std::fmt::Display for Band {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (low, high) = self.range_hz();
        write!(f, "{}({}-{}Hz)", self.name(), low, high)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BandDefinition {
    pub band: Band,
    pub low_hz: f64,
    pub high_hz: f64,
}

impl BandDefinition {
    pub fn canonical(band: Band) -> Self {
        let (low_hz, high_hz) = band.range_hz();
        Self {
            band,
            low_hz,
            high_hz,
        }
    }

    /// Half-open membership test: `low_hz <= freq < high_hz`.
    pub fn contains(&self, freq_hz: f64) -> bool {
        freq_hz >= self.low_hz && freq_hz < self.high_hz
    }
}

pub fn canonical_bands() -> Vec<BandDefinition> {
    Band::ALL.iter().map(|b| BandDefinition::canonical(*b)).collect()
}

// === 分析输出：频段功率与平滑趋势 ===

/// Power of one band on one channel for one window.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BandPowerEstimate {
    /// Start time of the window the estimate was computed from.
    pub timestamp: f64,
    pub channel: usize,
    pub band: Band,
    pub power: f64,
}

/// Output of one smoothing regime for one estimate.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SmoothedPoint {
    pub timestamp: f64,
    pub channel: usize,
    pub band: Band,
    pub value: f64,
    /// Filter has not reached steady state yet; treat as low confidence.
    pub warming_up: bool,
}

/// Envelope and lazy trend derived from the same estimate.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrendPoint {
    pub envelope: SmoothedPoint,
    pub lazy: SmoothedPoint,
}

/// `log10(power + 1e-6)`, the scale the band trends are usually read in.
pub fn log_power(power: f64) -> f64 {
    (power + 1e-6).log10()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_bands_are_ordered_and_non_empty() {
        let bands = canonical_bands();
        assert_eq!(bands.len(), 5);
        for def in &bands {
            assert!(def.low_hz < def.high_hz, "{} has an empty range", def.band);
        }
        for pair in bands.windows(2) {
            assert_eq!(pair[0].high_hz, pair[1].low_hz);
        }
    }

    #[test]
    fn band_edges_belong_to_the_upper_band() {
        let alpha = BandDefinition::canonical(Band::Alpha);
        let beta = BandDefinition::canonical(Band::Beta);
        assert!(!alpha.contains(13.0));
        assert!(beta.contains(13.0));
        assert!(alpha.contains(8.0));
    }

    #[test]
    fn sample_period_handles_zero_rate() {
        let meta = SessionMetadata::new(muse_channel_names(), 0.0, 0.0);
        assert_eq!(meta.sample_period(), 0.0);
        let meta = SessionMetadata::new(muse_channel_names(), 256.0, 0.0);
        assert!((meta.sample_period() - 1.0 / 256.0).abs() < 1e-12);
        assert_eq!(meta.channel_index("AF8"), Some(2));
    }
}

// src/compare.rs
use serde::{Deserialize, Serialize};

use crate::drivers::{window_series, AnalyzerConfig, SignalError, SignalResult};
use crate::stats::{mean, remove_outliers, welch_t_test};
use crate::storage::{Recording, RecordingRef};
use crate::types::{log_power, Band, BandDefinition, BandPowerEstimate};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerScale {
    /// `log10(power + 1e-6)`
    Log10,
    Linear,
}

impl PowerScale {
    pub fn apply(&self, power: f64) -> f64 {
        match self {
            PowerScale::Log10 => log_power(power),
            PowerScale::Linear => power,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComparisonConfig {
    pub alpha: f64,
    /// Robust deviations from the median beyond which a window is dropped.
    pub outlier_threshold: f64,
    /// Largest relative sample-rate difference accepted between recordings.
    pub rate_tolerance: f64,
    /// Channels averaged per window. `None` uses every channel both share.
    pub channels: Option<Vec<String>>,
    pub scale: PowerScale,
    pub analyzer: AnalyzerConfig,
}

impl Default for ComparisonConfig {
    fn default() -> Self {
        Self {
            alpha: 0.05,
            outlier_threshold: 3.0,
            rate_tolerance: 0.01,
            channels: None,
            scale: PowerScale::Log10,
            analyzer: AnalyzerConfig::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BandComparison {
    pub band: Band,
    pub low_hz: f64,
    pub high_hz: f64,
    pub mean_a: f64,
    pub mean_b: f64,
    /// `mean_b - mean_a`
    pub mean_diff: f64,
    pub t_statistic: f64,
    pub degrees_of_freedom: f64,
    pub p_value: f64,
    pub significant: bool,
    pub windows_a: usize,
    pub windows_b: usize,
    pub outliers_removed_a: usize,
    pub outliers_removed_b: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ComparisonReport {
    pub recording_a: RecordingRef,
    pub recording_b: RecordingRef,
    pub channels: Vec<String>,
    pub scale: PowerScale,
    pub alpha: f64,
    pub bands: Vec<BandComparison>,
}

impl ComparisonReport {
    pub fn band(&self, band: Band) -> Option<&BandComparison> {
        self.bands.iter().find(|b| b.band == band)
    }
}

/// Compares the band power distributions of two finished recordings.
///
/// Pure: the same inputs always give the same report, and any failure
/// returns an error instead of a partial report.
pub fn compare(
    a: &Recording,
    b: &Recording,
    bands: &[BandDefinition],
    config: &ComparisonConfig,
) -> SignalResult<ComparisonReport> {
    let incompatible = |reason: String| SignalError::IncompatibleSessions {
        a: a.id.to_string(),
        b: b.id.to_string(),
        reason,
    };
    if bands.is_empty() {
        return Err(SignalError::InvalidConfig("no bands to compare".into()));
    }
    // 1. 前置检查：采样率必须一致 (容差内)
    let (rate_a, rate_b) = (a.metadata.nominal_sample_rate, b.metadata.nominal_sample_rate);
    if !(rate_a > 0.0) || !(rate_b > 0.0) {
        return Err(incompatible(format!("sample rates {rate_a} Hz and {rate_b} Hz")));
    }
    let relative = (rate_a - rate_b).abs() / rate_a.max(rate_b);
    if relative > config.rate_tolerance {
        return Err(incompatible(format!(
            "sample rates {rate_a} Hz and {rate_b} Hz differ by more than {:.1}%",
            config.rate_tolerance * 100.0
        )));
    }

    // 2. 选通道 + 逐窗计算频段功率
    let channels = select_channels(a, b, config.channels.as_deref()).map_err(incompatible)?;
    let analyzer = AnalyzerConfig {
        bands: bands.to_vec(),
        ..config.analyzer.clone()
    };
    let series_a = band_series(a, &channels, &analyzer, config.scale)?;
    let series_b = band_series(b, &channels, &analyzer, config.scale)?;

    let mut results = Vec::with_capacity(bands.len());
    // 3. 逐频段：剔除离群值 -> Welch t 检验
    for (index, band) in bands.iter().enumerate() {
        let split_a = remove_outliers(&series_a[index], config.outlier_threshold);
        let split_b = remove_outliers(&series_b[index], config.outlier_threshold);
        for (split, recording) in [(&split_a, a), (&split_b, b)] {
            if split.kept.len() < 2 {
                return Err(SignalError::InsufficientData {
                    band: band.band.to_string(),
                    session: recording.id.to_string(),
                    remaining: split.kept.len(),
                });
            }
        }
        let (Some(mean_a), Some(mean_b), Some(test)) = (
            mean(&split_a.kept),
            mean(&split_b.kept),
            welch_t_test(&split_a.kept, &split_b.kept),
        ) else {
            return Err(SignalError::InsufficientData {
                band: band.band.to_string(),
                session: a.id.to_string(),
                remaining: split_a.kept.len().min(split_b.kept.len()),
            });
        };
        let significant = test.p_value < config.alpha;
        log::info!(
            "{}: mean_a={mean_a:.4} mean_b={mean_b:.4} p={:.4}{}",
            band.band,
            test.p_value,
            if significant { " (significant)" } else { "" }
        );
        results.push(BandComparison {
            band: band.band,
            low_hz: band.low_hz,
            high_hz: band.high_hz,
            mean_a,
            mean_b,
            mean_diff: mean_b - mean_a,
            t_statistic: test.t_statistic,
            degrees_of_freedom: test.degrees_of_freedom,
            p_value: test.p_value,
            significant,
            windows_a: series_a[index].len(),
            windows_b: series_b[index].len(),
            outliers_removed_a: split_a.removed,
            outliers_removed_b: split_b.removed,
        });
    }

    Ok(ComparisonReport {
        recording_a: a.id.clone(),
        recording_b: b.id.clone(),
        channels,
        scale: config.scale,
        alpha: config.alpha,
        bands: results,
    })
}

fn select_channels(a: &Recording, b: &Recording, wanted: Option<&[String]>) -> Result<Vec<String>, String> {
    let names_a = &a.metadata.channel_names;
    let names_b = &b.metadata.channel_names;
    let selected: Vec<String> = match wanted {
        Some(wanted) => {
            for name in wanted {
                if !names_a.contains(name) {
                    return Err(format!("channel {name} missing from {}", a.id));
                }
                if !names_b.contains(name) {
                    return Err(format!("channel {name} missing from {}", b.id));
                }
            }
            wanted.to_vec()
        }
        None if names_a == names_b => names_a.clone(),
        None => {
            // Order independent of argument order, so swapping A and B sums
            // the channels identically.
            let mut shared: Vec<String> = names_a.iter().filter(|n| names_b.contains(n)).cloned().collect();
            shared.sort();
            shared
        }
    };
    if selected.is_empty() {
        return Err("no channels in common".into());
    }
    Ok(selected)
}

/// Per band, the per-window value averaged over `channels` and scaled.
fn band_series(
    recording: &Recording,
    channels: &[String],
    analyzer: &AnalyzerConfig,
    scale: PowerScale,
) -> SignalResult<Vec<Vec<f64>>> {
    let indices: Vec<usize> = channels
        .iter()
        .filter_map(|name| recording.metadata.channel_index(name))
        .collect();
    let estimates = window_series(&recording.metadata, &recording.samples, analyzer)?;
    let num_bands = analyzer.bands.len();
    let per_window = recording.metadata.num_channels() * num_bands;
    let mut series = vec![Vec::new(); num_bands];
    for window in estimates.chunks(per_window) {
        for (band_index, values) in series.iter_mut().enumerate() {
            let total: f64 = indices
                .iter()
                .map(|ch| window_power(window, *ch, band_index, num_bands))
                .sum();
            values.push(scale.apply(total / indices.len() as f64));
        }
    }
    Ok(series)
}

fn window_power(window: &[BandPowerEstimate], channel: usize, band_index: usize, num_bands: usize) -> f64 {
    window
        .get(channel * num_bands + band_index)
        .map(|e| e.power)
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synth::SyntheticSignal;
    use crate::types::{canonical_bands, muse_channel_names};

    fn session(id: &str, alpha_amplitude: f64, seed: u64, secs: f64) -> Recording {
        SyntheticSignal::silent(muse_channel_names(), 256.0)
            .with_tone(0, 10.0, alpha_amplitude)
            .with_tone(1, 10.0, alpha_amplitude)
            .with_tone(2, 20.0, 3.0)
            .with_noise(4.0)
            .with_seed(seed)
            .recording(id, secs)
    }

    #[test]
    fn identical_recordings_show_no_difference() {
        let a = session("a", 10.0, 1, 20.0);
        let report = compare(&a, &a, &canonical_bands(), &ComparisonConfig::default()).unwrap();
        assert_eq!(report.bands.len(), 5);
        for band in &report.bands {
            assert_eq!(band.mean_diff, 0.0);
            assert!(band.p_value > 0.999, "{} p = {}", band.band, band.p_value);
            assert!(!band.significant);
        }
    }

    #[test]
    fn stronger_alpha_is_significant() {
        let calm = session("calm", 30.0, 1, 20.0);
        let busy = session("busy", 5.0, 2, 20.0);
        let report = compare(&calm, &busy, &canonical_bands(), &ComparisonConfig::default()).unwrap();
        let alpha = report.band(Band::Alpha).unwrap();
        assert!(alpha.significant);
        assert!(alpha.mean_a > alpha.mean_b);
        assert!(alpha.mean_diff < 0.0);
        assert!(alpha.p_value < 1e-6);
    }

    #[test]
    fn swapping_inputs_mirrors_the_report() {
        let a = session("a", 12.0, 3, 15.0);
        let b = session("b", 9.0, 4, 25.0);
        let config = ComparisonConfig::default();
        let ab = compare(&a, &b, &canonical_bands(), &config).unwrap();
        let ba = compare(&b, &a, &canonical_bands(), &config).unwrap();
        for (x, y) in ab.bands.iter().zip(&ba.bands) {
            assert_eq!(x.mean_a, y.mean_b);
            assert_eq!(x.mean_b, y.mean_a);
            assert_eq!(x.mean_diff, -y.mean_diff);
            assert_eq!(x.p_value, y.p_value);
            assert_eq!(x.significant, y.significant);
            assert_eq!(x.outliers_removed_a, y.outliers_removed_b);
        }
    }

    #[test]
    fn repeated_runs_are_identical() {
        let a = session("a", 12.0, 3, 10.0);
        let b = session("b", 9.0, 4, 10.0);
        let config = ComparisonConfig::default();
        let first = compare(&a, &b, &canonical_bands(), &config).unwrap();
        let second = compare(&a, &b, &canonical_bands(), &config).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn differing_rates_are_incompatible() {
        let a = session("a", 10.0, 1, 5.0);
        let b = SyntheticSignal::silent(muse_channel_names(), 128.0)
            .with_noise(1.0)
            .recording("b", 5.0);
        let err = compare(&a, &b, &canonical_bands(), &ComparisonConfig::default()).unwrap_err();
        match err {
            SignalError::IncompatibleSessions { a, b, reason } => {
                assert_eq!((a.as_str(), b.as_str()), ("a", "b"));
                assert!(reason.contains("sample rates"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn short_recording_names_band_and_session() {
        let a = session("long", 10.0, 1, 5.0);
        let b = session("short", 10.0, 2, 1.05);
        let err = compare(&a, &b, &canonical_bands(), &ComparisonConfig::default()).unwrap_err();
        match err {
            SignalError::InsufficientData { band, session, remaining } => {
                assert!(band.starts_with("Delta"));
                assert_eq!(session, "short");
                assert_eq!(remaining, 1);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn channel_selection_restricts_the_average() {
        let a = session("a", 30.0, 1, 10.0);
        let b = session("b", 30.0, 2, 10.0);
        let only_tp10 = ComparisonConfig {
            channels: Some(vec!["TP10".into()]),
            ..ComparisonConfig::default()
        };
        let report = compare(&a, &b, &canonical_bands(), &only_tp10).unwrap();
        assert_eq!(report.channels, vec!["TP10".to_string()]);
        // TP10 carries noise only, so the alpha tones do not show up.
        let alpha = report.band(Band::Alpha).unwrap();
        let beta = report.band(Band::Beta).unwrap();
        assert!((alpha.mean_a - beta.mean_a).abs() < 1.0);

        let missing = ComparisonConfig {
            channels: Some(vec!["Fz".into()]),
            ..ComparisonConfig::default()
        };
        assert!(matches!(
            compare(&a, &b, &canonical_bands(), &missing),
            Err(SignalError::IncompatibleSessions { .. })
        ));
    }
}

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::types::{Band, BandPowerEstimate, SmoothedPoint, TrendPoint};

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SmoothingMode {
    /// First-order low-pass with the given cutoff.
    Exponential { cutoff_hz: f64 },
    /// Plain mean of the last `span` inputs.
    MovingAverage { span: usize },
}

impl SmoothingMode {
    fn time_constant(&self) -> Option<f64> {
        match self {
            SmoothingMode::Exponential { cutoff_hz } if *cutoff_hz > 0.0 => {
                Some(1.0 / (2.0 * std::f64::consts::PI * cutoff_hz))
            }
            _ => None,
        }
    }
}

/// How a band power is mapped before it enters a filter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputTransform {
    Identity,
    /// `sqrt(power)`
    Amplitude,
    /// `ln(1 + power)`
    Log1p,
}

impl InputTransform {
    pub fn apply(&self, power: f64) -> f64 {
        match self {
            InputTransform::Identity => power,
            InputTransform::Amplitude => power.max(0.0).sqrt(),
            InputTransform::Log1p => power.max(0.0).ln_1p(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegimeConfig {
    pub mode: SmoothingMode,
    pub transform: InputTransform,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmoothingConfig {
    pub envelope: RegimeConfig,
    pub lazy: RegimeConfig,
}

impl Default for SmoothingConfig {
    fn default() -> Self {
        Self {
            envelope: RegimeConfig {
                mode: SmoothingMode::Exponential { cutoff_hz: 1.0 },
                transform: InputTransform::Amplitude,
            },
            lazy: RegimeConfig {
                mode: SmoothingMode::Exponential { cutoff_hz: 0.1 },
                transform: InputTransform::Log1p,
            },
        }
    }
}

impl SmoothingConfig {
    /// Lazy trend as a moving average over `span` windows.
    pub fn with_lazy_trendline(mut self, span: usize) -> Self {
        self.lazy.mode = SmoothingMode::MovingAverage { span };
        self
    }
}

/// Single-series filter. Seeds from its first input so warm-up output never
/// leaves the range of the inputs seen so far.
#[derive(Clone, Debug)]
pub struct Smoother {
    mode: SmoothingMode,
    value: Option<f64>,
    last_timestamp: Option<f64>,
    /// Filtered time accumulated since the seed.
    settled_secs: f64,
    window: VecDeque<f64>,
    window_sum: f64,
}

impl Smoother {
    pub fn new(mode: SmoothingMode) -> Self {
        Self {
            mode,
            value: None,
            last_timestamp: None,
            settled_secs: 0.0,
            window: VecDeque::new(),
            window_sum: 0.0,
        }
    }

    pub fn mode(&self) -> SmoothingMode {
        self.mode
    }

    /// Back to the state of a freshly built filter.
    pub fn reset(&mut self) {
        self.value = None;
        self.last_timestamp = None;
        self.settled_secs = 0.0;
        self.window.clear();
        self.window_sum = 0.0;
    }

    pub fn is_warm(&self) -> bool {
        match self.mode {
            SmoothingMode::Exponential { .. } => match self.mode.time_constant() {
                Some(tau) => self.value.is_some() && self.settled_secs + 1e-9 >= 3.0 * tau,
                None => self.value.is_some(),
            },
            SmoothingMode::MovingAverage { span } => self.window.len() >= span.max(1),
        }
    }

    /// Feeds one input observed at `timestamp`; returns the output and whether
    /// the filter is still warming up.
    pub fn update(&mut self, timestamp: f64, input: f64) -> (f64, bool) {
        let output = match self.mode {
            SmoothingMode::Exponential { .. } => {
                let next = match (self.value, self.last_timestamp) {
                    (Some(prev), Some(last)) => {
                        let dt = (timestamp - last).max(0.0);
                        self.settled_secs += dt;
                        let alpha = match self.mode.time_constant() {
                            Some(tau) => 1.0 - (-dt / tau).exp(),
                            None => 1.0,
                        };
                        prev + alpha * (input - prev)
                    }
                    _ => input,
                };
                self.value = Some(next);
                next
            }
            SmoothingMode::MovingAverage { span } => {
                self.window.push_back(input);
                self.window_sum += input;
                while self.window.len() > span.max(1) {
                    if let Some(old) = self.window.pop_front() {
                        self.window_sum -= old;
                    }
                }
                let mean = self.window_sum / self.window.len() as f64;
                self.value = Some(mean);
                mean
            }
        };
        self.last_timestamp = Some(timestamp);
        (output, !self.is_warm())
    }
}

struct Regimes {
    envelope: Smoother,
    lazy: Smoother,
}

/// Envelope and lazy trend for every (channel, band) series. The two regimes
/// own separate filter state and reset independently.
pub struct TrendTracker {
    config: SmoothingConfig,
    series: HashMap<(usize, Band), Regimes>,
}

impl TrendTracker {
    pub fn new(config: SmoothingConfig) -> Self {
        Self {
            config,
            series: HashMap::new(),
        }
    }

    pub fn config(&self) -> &SmoothingConfig {
        &self.config
    }

    pub fn update(&mut self, estimate: &BandPowerEstimate) -> TrendPoint {
        let config = &self.config;
        let regimes = self
            .series
            .entry((estimate.channel, estimate.band))
            .or_insert_with(|| Regimes {
                envelope: Smoother::new(config.envelope.mode),
                lazy: Smoother::new(config.lazy.mode),
            });
        let point = |value: f64, warming_up: bool| SmoothedPoint {
            timestamp: estimate.timestamp,
            channel: estimate.channel,
            band: estimate.band,
            value,
            warming_up,
        };
        let (env, env_warming) = regimes.envelope.update(
            estimate.timestamp,
            config.envelope.transform.apply(estimate.power),
        );
        let (lazy, lazy_warming) = regimes
            .lazy
            .update(estimate.timestamp, config.lazy.transform.apply(estimate.power));
        TrendPoint {
            envelope: point(env, env_warming),
            lazy: point(lazy, lazy_warming),
        }
    }

    pub fn reset_envelope(&mut self) {
        for regimes in self.series.values_mut() {
            regimes.envelope.reset();
        }
    }

    pub fn reset_lazy(&mut self) {
        for regimes in self.series.values_mut() {
            regimes.lazy.reset();
        }
    }

    pub fn reset(&mut self) {
        self.reset_envelope();
        self.reset_lazy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn estimates(powers: &[f64]) -> Vec<BandPowerEstimate> {
        powers
            .iter()
            .enumerate()
            .map(|(i, p)| BandPowerEstimate {
                timestamp: i as f64 * 0.1,
                channel: 0,
                band: Band::Alpha,
                power: *p,
            })
            .collect()
    }

    #[test]
    fn exponential_warm_up_length_follows_time_constant() {
        let mut fast = Smoother::new(SmoothingMode::Exponential { cutoff_hz: 1.0 });
        // 3 tau = 0.477 s, i.e. five 0.1 s hops after the seed.
        let flags: Vec<bool> = (0..8).map(|i| fast.update(i as f64 * 0.1, 1.0).1).collect();
        assert_eq!(flags, vec![true, true, true, true, true, false, false, false]);
    }

    #[test]
    fn warm_up_output_stays_within_input_range() {
        let mut tracker = TrendTracker::new(SmoothingConfig::default());
        let powers: Vec<f64> = (0..200).map(|i| if i % 7 == 0 { 40.0 } else { 10.0 + (i % 3) as f64 }).collect();
        for estimate in estimates(&powers) {
            let trend = tracker.update(&estimate);
            assert!(trend.envelope.value >= 10f64.sqrt() - 1e-9);
            assert!(trend.envelope.value <= 40f64.sqrt() + 1e-9);
            assert!(trend.lazy.value >= 10f64.ln_1p() - 1e-9);
            assert!(trend.lazy.value <= 40f64.ln_1p() + 1e-9);
        }
    }

    #[test]
    fn first_output_equals_first_input() {
        let mut tracker = TrendTracker::new(SmoothingConfig::default());
        let trend = tracker.update(&estimates(&[25.0])[0]);
        assert!((trend.envelope.value - 5.0).abs() < 1e-12);
        assert!(trend.envelope.warming_up);
        assert!(trend.lazy.warming_up);
    }

    #[test]
    fn lazy_reset_reproduces_series_and_leaves_envelope_alone() {
        let powers: Vec<f64> = (0..80).map(|i| 5.0 + (i as f64 * 0.3).sin().abs() * 20.0).collect();
        let input = estimates(&powers);
        let mut tracker = TrendTracker::new(SmoothingConfig::default());
        let first: Vec<TrendPoint> = input.iter().map(|e| tracker.update(e)).collect();

        tracker.reset_lazy();
        let second: Vec<TrendPoint> = input.iter().map(|e| tracker.update(e)).collect();
        let lazy_first: Vec<f64> = first.iter().map(|t| t.lazy.value).collect();
        let lazy_second: Vec<f64> = second.iter().map(|t| t.lazy.value).collect();
        assert_eq!(lazy_first, lazy_second);
        // The envelope kept its state, so its warm-up is not repeated.
        assert!(!second[0].envelope.warming_up);
        assert!(second[0].lazy.warming_up);
    }

    #[test]
    fn moving_average_trendline_warms_when_span_is_full() {
        let config = SmoothingConfig::default().with_lazy_trendline(30);
        let mut tracker = TrendTracker::new(config);
        let input = estimates(&vec![2.0; 40]);
        let trend: Vec<TrendPoint> = input.iter().map(|e| tracker.update(e)).collect();
        assert!(trend[28].lazy.warming_up);
        assert!(!trend[29].lazy.warming_up);
        assert!((trend[39].lazy.value - 2f64.ln_1p()).abs() < 1e-12);
    }

    #[test]
    fn slow_regime_lags_a_step_more_than_the_fast_one() {
        let mut tracker = TrendTracker::new(SmoothingConfig {
            envelope: RegimeConfig {
                mode: SmoothingMode::Exponential { cutoff_hz: 1.0 },
                transform: InputTransform::Identity,
            },
            lazy: RegimeConfig {
                mode: SmoothingMode::Exponential { cutoff_hz: 0.1 },
                transform: InputTransform::Identity,
            },
        });
        let mut powers = vec![0.0; 10];
        powers.extend(vec![1.0; 10]);
        let last = estimates(&powers).iter().map(|e| tracker.update(e)).last().unwrap();
        assert!(last.envelope.value > 0.9);
        assert!(last.lazy.value < 0.7);
    }
}

// src/config.rs
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::compare::ComparisonConfig;
use crate::drivers::{AnalyzerConfig, BufferConfig, LiveConfig, PlaybackConfig, SignalError, SignalResult, SmoothingConfig};
use crate::recorder::RecorderConfig;

/// Every tunable in one place. Missing fields take their defaults, so an
/// empty JSON object is a valid configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub live: LiveConfig,
    pub playback: PlaybackConfig,
    pub buffer: BufferConfig,
    pub analyzer: AnalyzerConfig,
    pub smoothing: SmoothingConfig,
    pub recorder: RecorderConfig,
    pub comparison: ComparisonConfig,
    /// Directory the CSV store writes to.
    pub recordings_dir: String,
}

impl AppConfig {
    pub fn load(path: &Path) -> SignalResult<Self> {
        let file = File::open(path)?;
        let config: AppConfig = serde_json::from_reader(BufReader::new(file))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(text: &str) -> SignalResult<Self> {
        let config: AppConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> SignalResult<()> {
        if !(self.buffer.history_seconds > self.analyzer.window_secs + self.recorder.flush_interval_secs) {
            return Err(SignalError::InvalidConfig(format!(
                "buffer history of {}s must exceed the {}s window plus the {}s flush interval",
                self.buffer.history_seconds, self.analyzer.window_secs, self.recorder.flush_interval_secs
            )));
        }
        if !(self.comparison.alpha > 0.0 && self.comparison.alpha < 1.0) {
            return Err(SignalError::InvalidConfig(format!(
                "alpha must lie in (0, 1), got {}",
                self.comparison.alpha
            )));
        }
        if !(self.playback.speed > 0.0) {
            return Err(SignalError::InvalidConfig(format!(
                "playback speed must be positive, got {}",
                self.playback.speed
            )));
        }
        Ok(())
    }

    pub fn recordings_dir(&self) -> &str {
        if self.recordings_dir.is_empty() {
            "recordings"
        } else {
            &self.recordings_dir
        }
    }
}

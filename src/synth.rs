// src/synth.rs
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::storage::{Recording, RecordingRef};
use crate::types::{muse_channel_names, Sample, SessionMetadata, MUSE_SAMPLE_RATE_HZ};

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tone {
    pub channel: usize,
    pub frequency_hz: f64,
    pub amplitude: f64,
}

/// Seeded sine-plus-noise generator. Same settings, same samples.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyntheticSignal {
    pub channel_names: Vec<String>,
    pub sample_rate: f64,
    pub tones: Vec<Tone>,
    /// Peak of the uniform noise added to every channel.
    pub noise_amplitude: f64,
    pub seed: u64,
    pub start_time: f64,
}

impl Default for SyntheticSignal {
    // 模拟 Muse 头环: 4 通道 256 Hz，每个通道叠加 10 Hz alpha 波
    fn default() -> Self {
        let channel_names = muse_channel_names();
        let tones = (0..channel_names.len())
            .map(|channel| Tone {
                channel,
                frequency_hz: 10.0,
                amplitude: 20.0,
            })
            .collect();
        Self {
            channel_names,
            sample_rate: MUSE_SAMPLE_RATE_HZ,
            tones,
            noise_amplitude: 5.0,
            seed: 7,
            start_time: 0.0,
        }
    }
}

impl SyntheticSignal {
    /// No tones and no noise.
    pub fn silent(channel_names: Vec<String>, sample_rate: f64) -> Self {
        Self {
            channel_names,
            sample_rate,
            tones: Vec::new(),
            noise_amplitude: 0.0,
            seed: 7,
            start_time: 0.0,
        }
    }

    pub fn with_tone(mut self, channel: usize, frequency_hz: f64, amplitude: f64) -> Self {
        self.tones.push(Tone {
            channel,
            frequency_hz,
            amplitude,
        });
        self
    }

    pub fn with_noise(mut self, amplitude: f64) -> Self {
        self.noise_amplitude = amplitude;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn starting_at(mut self, start_time: f64) -> Self {
        self.start_time = start_time;
        self
    }

    pub fn metadata(&self) -> SessionMetadata {
        SessionMetadata::new(self.channel_names.clone(), self.sample_rate, self.start_time)
    }

    pub fn samples(&self, count: usize) -> Vec<Sample> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let tau = 2.0 * std::f64::consts::PI;
        let channels = self.channel_names.len();
        (0..count)
            .map(|i| {
                let t = i as f64 / self.sample_rate;
                let mut values = vec![0.0f64; channels];
                for tone in self.tones.iter().filter(|tone| tone.channel < channels) {
                    values[tone.channel] += tone.amplitude * (tau * tone.frequency_hz * t).sin();
                }
                if self.noise_amplitude > 0.0 {
                    for v in values.iter_mut() {
                        *v += rng.gen_range(-1.0..1.0) * self.noise_amplitude;
                    }
                }
                Sample::new(self.start_time + t, values.into_iter().map(|v| v as f32).collect())
            })
            .collect()
    }

    pub fn recording(&self, id: impl Into<RecordingRef>, duration_secs: f64) -> Recording {
        let count = (duration_secs * self.sample_rate).round().max(0.0) as usize;
        Recording::new(id, self.metadata(), self.samples(count))
    }
}

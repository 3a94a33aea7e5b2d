use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::drivers::source::{CloseHandle, SessionId, StreamSource};
use crate::drivers::{SignalError, SignalResult};
use crate::storage::Recording;
use crate::types::{Sample, SessionMetadata};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Restart from the first sample instead of ending.
    #[serde(rename = "loop")]
    pub loop_playback: bool,
    /// Playback rate relative to the original timing.
    pub speed: f64,
    /// Allowed lateness before the timing reference is re-anchored. Defaults
    /// to one nominal sample period.
    pub jitter_tolerance_secs: Option<f64>,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            loop_playback: true,
            speed: 1.0,
            jitter_tolerance_secs: None,
        }
    }
}

/// Replays a [`Recording`] at its original inter-sample spacing.
pub struct PlaybackSource {
    recording: Recording,
    config: PlaybackConfig,
    session: SessionId,
    closer: CloseHandle,
    position: usize,
    pass: u64,
    /// Wall-clock instant matching `reference_ts` for the current pass.
    reference: Option<Instant>,
    reference_ts: f64,
    /// Added to recorded timestamps so looped passes stay monotonic.
    offset: f64,
    late_events: u64,
}

impl PlaybackSource {
    pub fn open(recording: Recording, config: PlaybackConfig) -> SignalResult<Self> {
        if !(config.speed > 0.0) || !config.speed.is_finite() {
            return Err(SignalError::InvalidConfig(format!(
                "playback speed must be positive, got {}",
                config.speed
            )));
        }
        let session = SessionId::new();
        log::info!(
            "playback of {} opened: {} samples, {} Hz, loop={}, session {}",
            recording.id,
            recording.samples.len(),
            recording.metadata.nominal_sample_rate,
            config.loop_playback,
            session
        );
        Ok(Self {
            recording,
            config,
            session,
            closer: CloseHandle::new(),
            position: 0,
            pass: 0,
            reference: None,
            reference_ts: 0.0,
            offset: 0.0,
            late_events: 0,
        })
    }

    /// Completed passes over the recording.
    pub fn passes(&self) -> u64 {
        self.pass
    }

    /// Times the reader fell behind by more than the jitter tolerance.
    pub fn late_events(&self) -> u64 {
        self.late_events
    }

    fn tolerance(&self) -> Duration {
        let secs = self
            .config
            .jitter_tolerance_secs
            .unwrap_or_else(|| self.recording.metadata.sample_period() / self.config.speed);
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// Starts the next pass. The timing reference is re-seeded so the first
    /// sample of the pass follows the last one by one sample period.
    fn restart(&mut self) {
        let samples = &self.recording.samples;
        let (first_ts, span) = match (samples.first(), samples.last()) {
            (Some(first), Some(last)) => (first.timestamp, last.timestamp - first.timestamp),
            _ => (0.0, 0.0),
        };
        let period = self.recording.metadata.sample_period();
        self.offset += span + period;
        self.position = 0;
        self.pass += 1;
        self.reference = Some(Instant::now() + Duration::from_secs_f64(period / self.config.speed));
        self.reference_ts = first_ts;
        log::info!("playback of {} restarting (pass {})", self.recording.id, self.pass);
    }

    /// Suspends until the wall clock catches up with `recorded_ts`.
    fn pace(&mut self, recorded_ts: f64) -> SignalResult<()> {
        let Some(reference) = self.reference else {
            self.reference = Some(Instant::now());
            self.reference_ts = recorded_ts;
            return Ok(());
        };
        let delta = ((recorded_ts - self.reference_ts) / self.config.speed).max(0.0);
        let deadline = reference + Duration::from_secs_f64(delta);
        let now = Instant::now();
        if now < deadline {
            if self.closer.wait_until(deadline) {
                return Err(self.closed_error());
            }
        } else if now - deadline > self.tolerance() {
            self.late_events += 1;
            log::debug!(
                "playback of {} is {:?} behind, re-anchoring",
                self.recording.id,
                now - deadline
            );
            self.reference = Some(now);
            self.reference_ts = recorded_ts;
        }
        Ok(())
    }

    fn closed_error(&self) -> SignalError {
        SignalError::SourceClosed {
            session: self.session.to_string(),
        }
    }
}

impl StreamSource for PlaybackSource {
    fn metadata(&self) -> &SessionMetadata {
        &self.recording.metadata
    }

    fn session_id(&self) -> SessionId {
        self.session
    }

    fn next(&mut self) -> SignalResult<Sample> {
        if self.closer.is_closed() {
            return Err(self.closed_error());
        }
        let ended = || SignalError::SourceEnded {
            session: self.session.to_string(),
        };
        if self.recording.samples.is_empty() {
            return Err(ended());
        }
        if self.position >= self.recording.samples.len() {
            if !self.config.loop_playback {
                return Err(ended());
            }
            self.restart();
        }
        let recorded_ts = self.recording.samples[self.position].timestamp;
        self.pace(recorded_ts)?;
        let recorded = &self.recording.samples[self.position];
        self.position += 1;
        Ok(Sample::new(recorded.timestamp + self.offset, recorded.channels.clone()))
    }

    fn close_handle(&self) -> CloseHandle {
        self.closer.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synth::SyntheticSignal;
    use crate::types::muse_channel_names;

    fn ten_sample_recording() -> Recording {
        let meta = SessionMetadata::new(muse_channel_names(), 256.0, 0.0);
        let samples = (0..10)
            .map(|i| Sample::new(i as f64 / 256.0, vec![i as f32; 4]))
            .collect();
        Recording::new("ten", meta, samples)
    }

    #[test]
    fn ends_after_last_sample_without_loop() {
        let config = PlaybackConfig {
            loop_playback: false,
            ..PlaybackConfig::default()
        };
        let mut source = PlaybackSource::open(ten_sample_recording(), config).unwrap();
        for i in 0..10 {
            assert_eq!(source.next().unwrap().channels[0], i as f32);
        }
        assert!(matches!(source.next(), Err(SignalError::SourceEnded { .. })));
        assert!(matches!(source.next(), Err(SignalError::SourceEnded { .. })));
    }

    #[test]
    fn loop_restarts_with_first_sample_and_same_session() {
        let config = PlaybackConfig {
            loop_playback: true,
            ..PlaybackConfig::default()
        };
        let mut source = PlaybackSource::open(ten_sample_recording(), config).unwrap();
        let session = source.session_id();
        let mut last = None;
        for _ in 0..10 {
            last = Some(source.next().unwrap());
        }
        let eleventh = source.next().unwrap();
        assert_eq!(eleventh.channels, vec![0.0; 4]);
        assert!(eleventh.timestamp > last.unwrap().timestamp);
        assert_eq!(source.passes(), 1);
        assert_eq!(source.session_id(), session);
    }

    #[test]
    fn loop_pass_is_paced_from_a_fresh_reference() {
        let meta = SessionMetadata::new(muse_channel_names(), 50.0, 0.0);
        let samples = (0..10)
            .map(|i| Sample::new(i as f64 / 50.0, vec![i as f32; 4]))
            .collect();
        let mut source = PlaybackSource::open(Recording::new("fifty", meta, samples), PlaybackConfig::default()).unwrap();
        for _ in 0..10 {
            source.next().unwrap();
        }
        // A stale reference from the first pass would let the second one burst.
        std::thread::sleep(Duration::from_millis(200));
        let started = Instant::now();
        let first = source.next().unwrap();
        let first_wait = started.elapsed();
        for _ in 0..9 {
            source.next().unwrap();
        }
        let pass = started.elapsed().as_secs_f64();

        assert_eq!(first.channels, vec![0.0; 4]);
        assert_eq!(source.passes(), 1);
        assert_eq!(source.late_events(), 0);
        assert!(first_wait >= Duration::from_millis(18), "first sample after {first_wait:?}");
        // One period before the first sample plus nine between the rest.
        assert!(pass >= 10.0 / 50.0 - 0.01, "second pass took {pass}s");
        assert!(pass < 10.0 / 50.0 + 0.3);
    }

    #[test]
    fn reproduces_original_spacing() {
        let recording = SyntheticSignal::default().recording("timing", 0.25);
        let count = recording.samples.len();
        let span = recording.samples[count - 1].timestamp - recording.samples[0].timestamp;
        let config = PlaybackConfig {
            loop_playback: false,
            ..PlaybackConfig::default()
        };
        let mut source = PlaybackSource::open(recording, config).unwrap();
        let started = Instant::now();
        while source.next().is_ok() {}
        let elapsed = started.elapsed().as_secs_f64();
        assert!(elapsed >= span - 1.0 / 256.0, "played {span}s of data in {elapsed}s");
        assert!(elapsed < span + 0.5);
    }

    #[test]
    fn empty_and_single_sample_recordings() {
        let meta = SessionMetadata::new(muse_channel_names(), 256.0, 0.0);
        let mut empty =
            PlaybackSource::open(Recording::new("empty", meta.clone(), vec![]), PlaybackConfig::default())
                .unwrap();
        assert!(matches!(empty.next(), Err(SignalError::SourceEnded { .. })));

        let single = Recording::new("one", meta, vec![Sample::new(5.0, vec![1.0; 4])]);
        let mut once = PlaybackSource::open(
            single.clone(),
            PlaybackConfig {
                loop_playback: false,
                ..PlaybackConfig::default()
            },
        )
        .unwrap();
        assert!(once.next().is_ok());
        assert!(matches!(once.next(), Err(SignalError::SourceEnded { .. })));

        let mut looping = PlaybackSource::open(single, PlaybackConfig::default()).unwrap();
        let mut previous = f64::MIN;
        for _ in 0..3 {
            let sample = looping.next().unwrap();
            assert!(sample.timestamp.is_finite());
            assert!(sample.timestamp > previous);
            previous = sample.timestamp;
        }
    }

    #[test]
    fn close_interrupts_pacing_wait() {
        let meta = SessionMetadata::new(muse_channel_names(), 1.0, 0.0);
        let recording = Recording::new(
            "slow",
            meta,
            vec![Sample::new(0.0, vec![0.0; 4]), Sample::new(600.0, vec![0.0; 4])],
        );
        let mut source = PlaybackSource::open(recording, PlaybackConfig::default()).unwrap();
        source.next().unwrap();
        let closer = source.close_handle();
        let reader = std::thread::spawn(move || {
            let started = Instant::now();
            (source.next(), started.elapsed())
        });
        std::thread::sleep(Duration::from_millis(30));
        closer.close();
        let (result, waited) = reader.join().unwrap();
        assert!(matches!(result, Err(SignalError::SourceClosed { .. })));
        assert!(waited < Duration::from_secs(5));
    }

    #[test]
    fn rejects_non_positive_speed() {
        let config = PlaybackConfig {
            speed: 0.0,
            ..PlaybackConfig::default()
        };
        assert!(PlaybackSource::open(ten_sample_recording(), config).is_err());
    }
}

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{unbounded, Receiver, Sender};
use serde::{Deserialize, Serialize};

use crate::drivers::buffer::{BufferEvent, Cursor, Gap};
use crate::drivers::fft::{band_mean, SpectrumBuilder};
use crate::drivers::smoothing::{SmoothingConfig, TrendTracker};
use crate::drivers::{SignalError, SignalResult};
use crate::types::{canonical_bands, BandDefinition, BandPowerEstimate, Sample, SessionMetadata, TrendPoint};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    pub window_secs: f64,
    pub hop_secs: f64,
    pub bands: Vec<BandDefinition>,
    /// Largest timestamp step, in nominal sample periods, still treated as
    /// contiguous. Live transports deliver chunked, jittery timestamps; real
    /// breaks arrive as buffer gaps.
    pub max_step_periods: f64,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            window_secs: 1.0,
            hop_secs: 0.1,
            bands: canonical_bands(),
            max_step_periods: 8.0,
        }
    }
}

impl AnalyzerConfig {
    /// Window and hop in whole samples at `sample_rate`.
    pub fn lengths(&self, sample_rate: f64) -> SignalResult<(usize, usize)> {
        if !(sample_rate > 0.0) || !sample_rate.is_finite() {
            return Err(SignalError::InvalidSampleRate);
        }
        let window = (self.window_secs * sample_rate + 1e-9).floor() as usize;
        let hop = (self.hop_secs * sample_rate + 1e-9).floor() as usize;
        if window < 2 {
            return Err(SignalError::InvalidConfig(format!(
                "window of {}s holds fewer than two samples at {sample_rate} Hz",
                self.window_secs
            )));
        }
        if hop == 0 || hop >= window {
            return Err(SignalError::InvalidConfig(format!(
                "hop of {}s must be at least one sample and shorter than the {}s window",
                self.hop_secs, self.window_secs
            )));
        }
        if self.bands.is_empty() {
            return Err(SignalError::InvalidConfig("no bands configured".into()));
        }
        if !(self.max_step_periods >= 1.0) {
            return Err(SignalError::InvalidConfig(format!(
                "max_step_periods must be at least one period, got {}",
                self.max_step_periods
            )));
        }
        Ok((window, hop))
    }
}

/// Turns a sample stream into per-channel, per-band power estimates over
/// overlapping windows.
///
/// Windows never straddle a discontinuity: an explicit gap event, or a
/// timestamp jump beyond `max_step_periods`, drops the partial window and
/// starts accumulating again.
pub struct SpectralAnalyzer {
    metadata: SessionMetadata,
    bands: Vec<BandDefinition>,
    window_len: usize,
    hop_len: usize,
    builder: SpectrumBuilder,
    max_step_secs: f64,
    window: VecDeque<Sample>,
    since_emit: usize,
    emitted_since_reset: bool,
    last_timestamp: Option<f64>,
    discontinuities: u64,
    windows: u64,
}

impl SpectralAnalyzer {
    pub fn new(metadata: SessionMetadata, config: &AnalyzerConfig) -> SignalResult<Self> {
        let (window_len, hop_len) = config.lengths(metadata.nominal_sample_rate)?;
        let builder = SpectrumBuilder::new(window_len, metadata.nominal_sample_rate);
        let max_step_secs = config.max_step_periods * metadata.sample_period();
        Ok(Self {
            metadata,
            bands: config.bands.clone(),
            window_len,
            hop_len,
            builder,
            max_step_secs,
            window: VecDeque::with_capacity(window_len),
            since_emit: 0,
            emitted_since_reset: false,
            last_timestamp: None,
            discontinuities: 0,
            windows: 0,
        })
    }

    pub fn metadata(&self) -> &SessionMetadata {
        &self.metadata
    }

    pub fn window_len(&self) -> usize {
        self.window_len
    }

    pub fn hop_len(&self) -> usize {
        self.hop_len
    }

    pub fn windows_emitted(&self) -> u64 {
        self.windows
    }

    pub fn discontinuities(&self) -> u64 {
        self.discontinuities
    }

    /// Drops the partial window.
    pub fn reset(&mut self) {
        self.window.clear();
        self.since_emit = 0;
        self.emitted_since_reset = false;
        self.last_timestamp = None;
    }

    fn break_stream(&mut self) {
        self.discontinuities += 1;
        self.reset();
    }

    pub fn feed(&mut self, sample: &Sample) -> Vec<BandPowerEstimate> {
        if sample.num_channels() != self.metadata.num_channels() {
            log::warn!(
                "dropping sample with {} channels, expected {}",
                sample.num_channels(),
                self.metadata.num_channels()
            );
            return Vec::new();
        }
        if let Some(last) = self.last_timestamp {
            let step = sample.timestamp - last;
            if step > self.max_step_secs || step < 0.0 {
                log::debug!("timestamp jump of {step:.4}s, restarting window");
                self.break_stream();
            }
        }
        self.last_timestamp = Some(sample.timestamp);
        self.window.push_back(sample.clone());
        if self.window.len() > self.window_len {
            self.window.pop_front();
        }
        self.since_emit += 1;

        let due = if self.emitted_since_reset {
            self.since_emit >= self.hop_len
        } else {
            true
        };
        if self.window.len() < self.window_len || !due {
            return Vec::new();
        }
        self.since_emit = 0;
        self.emitted_since_reset = true;
        self.windows += 1;
        self.estimate_window()
    }

    /// Buffer events, with gaps breaking the current window.
    pub fn handle(&mut self, event: &BufferEvent) -> Vec<BandPowerEstimate> {
        match event {
            BufferEvent::Sample(sample) => self.feed(sample),
            BufferEvent::Gap(gap) => {
                log::debug!("analyzer saw {gap:?}, restarting window");
                self.break_stream();
                Vec::new()
            }
        }
    }

    fn estimate_window(&self) -> Vec<BandPowerEstimate> {
        let Some(start) = self.window.front().map(|s| s.timestamp) else {
            return Vec::new();
        };
        let frequencies = self.builder.frequencies();
        let mut out = Vec::with_capacity(self.metadata.num_channels() * self.bands.len());
        let mut column = Vec::with_capacity(self.window_len);
        for channel in 0..self.metadata.num_channels() {
            column.clear();
            column.extend(self.window.iter().map(|s| s.channels[channel]));
            let density = self.builder.channel_density(&column);
            for band in &self.bands {
                out.push(BandPowerEstimate {
                    timestamp: start,
                    channel,
                    band: band.band,
                    power: band_mean(&frequencies, &density, band),
                });
            }
        }
        out
    }
}

/// Offline form of the analyzer over a finished sample sequence.
pub fn window_series(
    metadata: &SessionMetadata,
    samples: &[Sample],
    config: &AnalyzerConfig,
) -> SignalResult<Vec<BandPowerEstimate>> {
    let mut analyzer = SpectralAnalyzer::new(metadata.clone(), config)?;
    let mut out = Vec::new();
    for sample in samples {
        out.extend(analyzer.feed(sample));
    }
    Ok(out)
}

#[derive(Clone, Debug)]
pub enum AnalysisEvent {
    /// One window's estimates with their smoothed trends, index aligned.
    Window {
        estimates: Vec<BandPowerEstimate>,
        trends: Vec<TrendPoint>,
    },
    Gap(Gap),
    /// The buffer closed and was drained.
    Finished,
}

/// Which smoothed view a consumer wants restarted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrendReset {
    Envelope,
    Lazy,
    All,
}

/// Background analyzer bound to one buffer cursor.
pub struct AnalysisHandle {
    events: Receiver<AnalysisEvent>,
    control: Sender<TrendReset>,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl AnalysisHandle {
    pub fn events(&self) -> &Receiver<AnalysisEvent> {
        &self.events
    }

    /// Reseeds the envelope from the next window on. The lazy trend keeps
    /// its state.
    pub fn reset_envelope(&self) {
        self.send_reset(TrendReset::Envelope);
    }

    pub fn reset_lazy(&self) {
        self.send_reset(TrendReset::Lazy);
    }

    pub fn reset_trends(&self) {
        self.send_reset(TrendReset::All);
    }

    fn send_reset(&self, reset: TrendReset) {
        if self.control.send(reset).is_err() {
            log::debug!("analysis worker already gone, {reset:?} ignored");
        }
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("analysis worker panicked");
            }
        }
    }
}

impl Drop for AnalysisHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

const READ_BATCH: usize = 256;
const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Runs an analyzer and trend tracker on their own thread, pushing results
/// through a channel. Any number of these can share one buffer.
pub fn spawn_analysis(
    mut cursor: Cursor,
    config: AnalyzerConfig,
    smoothing: SmoothingConfig,
) -> SignalResult<AnalysisHandle> {
    let mut analyzer = SpectralAnalyzer::new(cursor.metadata().clone(), &config)?;
    let mut trends = TrendTracker::new(smoothing);
    let (tx, rx) = unbounded();
    let (control, resets) = unbounded::<TrendReset>();
    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = stop.clone();

    let worker = thread::Builder::new()
        .name("bandwave-analysis".into())
        .spawn(move || {
            while !stop_flag.load(Ordering::Relaxed) {
                let events = match cursor.read(READ_BATCH, READ_TIMEOUT) {
                    Ok(events) => events,
                    Err(SignalError::BufferClosed) => {
                        let _ = tx.send(AnalysisEvent::Finished);
                        break;
                    }
                    Err(e) => {
                        log::error!("analysis worker stopped: {e}");
                        break;
                    }
                };
                // 重置请求在本批数据之前生效
                for reset in resets.try_iter() {
                    log::debug!("analysis worker applying {reset:?}");
                    match reset {
                        TrendReset::Envelope => trends.reset_envelope(),
                        TrendReset::Lazy => trends.reset_lazy(),
                        TrendReset::All => trends.reset(),
                    }
                }
                if !forward(&events, &mut analyzer, &mut trends, &tx) {
                    log::debug!("analysis receiver dropped, stopping worker");
                    break;
                }
            }
        })?;

    Ok(AnalysisHandle {
        events: rx,
        control,
        stop,
        worker: Some(worker),
    })
}

fn forward(
    events: &[BufferEvent],
    analyzer: &mut SpectralAnalyzer,
    trends: &mut TrendTracker,
    tx: &Sender<AnalysisEvent>,
) -> bool {
    for event in events {
        if let BufferEvent::Gap(gap) = event {
            if tx.send(AnalysisEvent::Gap(*gap)).is_err() {
                return false;
            }
        }
        let estimates = analyzer.handle(event);
        if estimates.is_empty() {
            continue;
        }
        let points = estimates.iter().map(|e| trends.update(e)).collect();
        let window = AnalysisEvent::Window {
            estimates,
            trends: points,
        };
        if tx.send(window).is_err() {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::buffer::SampleBuffer;
    use crate::drivers::playback::{PlaybackConfig, PlaybackSource};
    use crate::drivers::source::StreamSource;
    use crate::synth::SyntheticSignal;
    use crate::types::{muse_channel_names, Band};

    fn meta() -> SessionMetadata {
        SessionMetadata::new(muse_channel_names(), 256.0, 0.0)
    }

    #[test]
    fn hop_and_window_lengths_follow_rate() {
        let config = AnalyzerConfig::default();
        assert_eq!(config.lengths(256.0).unwrap(), (256, 25));
        assert!(config.lengths(0.0).is_err());
        let bad = AnalyzerConfig {
            hop_secs: 2.0,
            ..AnalyzerConfig::default()
        };
        assert!(matches!(bad.lengths(256.0), Err(SignalError::InvalidConfig(_))));
    }

    #[test]
    fn consecutive_windows_start_exactly_one_hop_apart() {
        let recording = SyntheticSignal::default().recording("hops", 5.0);
        let estimates = window_series(&recording.metadata, &recording.samples, &AnalyzerConfig::default()).unwrap();
        let starts: Vec<f64> = estimates
            .iter()
            .filter(|e| e.channel == 0 && e.band == Band::Delta)
            .map(|e| e.timestamp)
            .collect();
        // (1280 - 256) / 25 hops after the first full window.
        assert_eq!(starts.len(), 1 + (1280 - 256) / 25);
        for pair in starts.windows(2) {
            assert!((pair[1] - pair[0] - 25.0 / 256.0).abs() < 1e-9);
        }
        assert_eq!(estimates.len(), starts.len() * 4 * 5);
    }

    #[test]
    fn alpha_dominates_for_a_ten_hertz_channel() {
        let recording = SyntheticSignal::silent(muse_channel_names(), 256.0)
            .with_tone(1, 10.0, 40.0)
            .with_noise(1.0)
            .recording("alpha", 60.0);
        let estimates =
            window_series(&recording.metadata, &recording.samples, &AnalyzerConfig::default()).unwrap();
        let mut windows = 0;
        for window in estimates.chunks(4 * 5) {
            let channel: Vec<&BandPowerEstimate> = window.iter().filter(|e| e.channel == 1).collect();
            let best = channel
                .iter()
                .max_by(|a, b| a.power.total_cmp(&b.power))
                .map(|e| e.band);
            assert_eq!(best, Some(Band::Alpha), "window at {}", window[0].timestamp);
            windows += 1;
        }
        assert!(windows > 500);
    }

    #[test]
    fn timestamp_jump_restarts_the_window() {
        let mut analyzer = SpectralAnalyzer::new(meta(), &AnalyzerConfig::default()).unwrap();
        let mut emitted = 0;
        for i in 0..200 {
            emitted += analyzer.feed(&Sample::new(i as f64 / 256.0, vec![0.0; 4])).len();
        }
        for i in 0..255 {
            let ts = 10.0 + i as f64 / 256.0;
            emitted += analyzer.feed(&Sample::new(ts, vec![0.0; 4])).len();
        }
        assert_eq!(emitted, 0);
        assert_eq!(analyzer.discontinuities(), 1);
        let last = analyzer.feed(&Sample::new(10.0 + 255.0 / 256.0, vec![0.0; 4]));
        assert_eq!(last.len(), 20);
        assert!((last[0].timestamp - 10.0).abs() < 1e-12);
    }

    #[test]
    fn playback_feeds_the_same_estimates_as_direct_samples() {
        let recording = SyntheticSignal::default().with_seed(11).recording("replay", 1.5);
        let config = AnalyzerConfig::default();
        let direct = window_series(&recording.metadata, &recording.samples, &config).unwrap();

        let mut source = PlaybackSource::open(
            recording.clone(),
            PlaybackConfig {
                loop_playback: false,
                speed: 50.0,
                ..PlaybackConfig::default()
            },
        )
        .unwrap();
        let mut analyzer = SpectralAnalyzer::new(source.metadata().clone(), &config).unwrap();
        let mut replayed = Vec::new();
        while let Ok(sample) = source.next() {
            replayed.extend(analyzer.feed(&sample));
        }
        assert_eq!(direct, replayed);
    }

    #[test]
    fn worker_streams_windows_until_buffer_closes() {
        let recording = SyntheticSignal::default().recording("worker", 2.0);
        let buffer = SampleBuffer::with_history_seconds(recording.metadata.clone(), 30.0).unwrap();
        let handle = spawn_analysis(buffer.subscribe(), AnalyzerConfig::default(), SmoothingConfig::default()).unwrap();
        for sample in recording.samples.iter() {
            buffer.append(sample.clone()).unwrap();
        }
        buffer.close();

        let mut windows = 0;
        let mut finished = false;
        while let Ok(event) = handle.events().recv_timeout(Duration::from_secs(5)) {
            match event {
                AnalysisEvent::Window { estimates, trends } => {
                    assert_eq!(estimates.len(), trends.len());
                    windows += 1;
                }
                AnalysisEvent::Gap(_) => {}
                AnalysisEvent::Finished => {
                    finished = true;
                    break;
                }
            }
        }
        assert!(finished);
        assert_eq!(windows, 1 + (512 - 256) / 25);
        handle.stop();
    }

    #[test]
    fn chunked_jittery_timestamps_keep_windows_flowing() {
        let period = 1.0 / 256.0;
        // 12-sample chunks: 1.6 periods across each boundary, tighter inside,
        // so the mean rate stays 256 Hz.
        let inner = (12.0 - 1.6) * period / 11.0;
        let mut analyzer = SpectralAnalyzer::new(meta(), &AnalyzerConfig::default()).unwrap();
        let mut ts = 0.0;
        let mut windows = 0;
        for i in 0..2560 {
            if i > 0 {
                ts += if i % 12 == 0 { 1.6 * period } else { inner };
            }
            if !analyzer.feed(&Sample::new(ts, vec![0.0; 4])).is_empty() {
                windows += 1;
            }
        }
        assert_eq!(analyzer.discontinuities(), 0);
        assert_eq!(windows, 1 + (2560 - 256) / 25);

        let strict = AnalyzerConfig {
            max_step_periods: 1.5,
            ..AnalyzerConfig::default()
        };
        let series: Vec<Sample> = (0..600)
            .map(|i| Sample::new(i as f64 * period + (i / 12) as f64 * 0.6 * period, vec![0.0; 4]))
            .collect();
        let mut analyzer = SpectralAnalyzer::new(meta(), &strict).unwrap();
        let emitted: usize = series.iter().map(|s| analyzer.feed(s).len()).sum();
        assert_eq!(emitted, 0);
        assert!(analyzer.discontinuities() > 0);
    }

    #[test]
    fn lazy_trend_resets_on_a_running_worker() {
        let signal = SyntheticSignal::default();
        let samples = signal.samples(512 + 50);
        let buffer = SampleBuffer::with_history_seconds(signal.metadata(), 30.0).unwrap();
        let handle = spawn_analysis(buffer.subscribe(), AnalyzerConfig::default(), SmoothingConfig::default()).unwrap();

        let mut next_window = || loop {
            match handle.events().recv_timeout(Duration::from_secs(5)) {
                Ok(AnalysisEvent::Window { estimates, trends }) => return (estimates, trends),
                Ok(_) => continue,
                Err(e) => panic!("no window: {e}"),
            }
        };
        for sample in &samples[..512] {
            buffer.append(sample.clone()).unwrap();
        }
        for _ in 0..1 + (512 - 256) / 25 {
            let (estimates, trends) = next_window();
            // Not reset yet, so the lazy trend has moved off its seed.
            if estimates[0].timestamp > 0.0 {
                assert!((trends[0].lazy.value - estimates[0].power.ln_1p()).abs() > 1e-9);
            }
        }

        handle.reset_lazy();
        for sample in &samples[512..] {
            buffer.append(sample.clone()).unwrap();
        }
        let (estimates, trends) = next_window();
        for (estimate, trend) in estimates.iter().zip(&trends) {
            assert!(trend.lazy.warming_up);
            assert!((trend.lazy.value - estimate.power.ln_1p()).abs() < 1e-12);
            assert!(!trend.envelope.warming_up);
        }
        buffer.close();
        handle.stop();
    }
}

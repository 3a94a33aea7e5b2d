// src/main.rs
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use bandwave::acquisition::Acquisition;
use bandwave::clock;
use bandwave::compare::compare;
use bandwave::config::AppConfig;
use bandwave::drivers::{
    open_source, publish, spawn_analysis, window_series, AnalysisEvent, LiveSource, MemoryTransport,
    SampleBuffer, SourceConfig, StreamAdvert, StreamQuery, StreamSource, Transport,
};
use bandwave::recorder::Recorder;
use bandwave::storage::{CsvStore, RecordingRef, RecordingSink, RecordingStore};
use bandwave::synth::SyntheticSignal;
use bandwave::types::{log_power, muse_channel_names, Band, MUSE_SAMPLE_RATE_HZ};

/// Overrides the live stream name, like the headset tooling's MUSE_STREAM_NAME.
const STREAM_NAME_ENV: &str = "BANDWAVE_STREAM_NAME";

#[derive(Parser, Debug)]
#[command(name = "bandwave")]
#[command(about = "EEG band power streaming, recording and session comparison", long_about = None)]
struct Args {
    /// JSON configuration file; missing fields use defaults
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Directory recordings are read from and written to
    #[arg(long, value_name = "DIR", global = true)]
    recordings_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write a synthetic Muse-like recording
    Synth {
        #[arg(long, default_value = "synthetic")]
        label: String,
        #[arg(long, value_name = "SECONDS", default_value = "60")]
        seconds: f64,
        /// Amplitude of the 10 Hz component on every channel
        #[arg(long, default_value = "20")]
        alpha: f64,
        #[arg(long, default_value = "7")]
        seed: u64,
    },
    /// Record a live stream, or a replayed recording, to CSV
    Record {
        #[arg(long)]
        label: String,
        #[arg(long, value_name = "SECONDS", default_value = "30")]
        seconds: f64,
        /// Replay this recording instead of resolving a live stream
        #[arg(long, value_name = "RECORDING")]
        replay: Option<String>,
        /// Advertise a simulated headset in the stream namespace
        #[arg(long)]
        simulate: bool,
    },
    /// Replay a recording at its original timing and print band trends
    Replay {
        recording: String,
        /// Re-publish the replay as a stream and analyze it through discovery
        #[arg(long)]
        publish: bool,
        /// Base name of the published stream
        #[arg(long, default_value = "Muse")]
        name: String,
    },
    /// Print the band power series of a recording as JSON
    Analyze { recording: String },
    /// Compare two recordings band by band and print the report as JSON
    Compare {
        a: String,
        b: String,
        /// Comma separated channel names to average
        #[arg(long, value_delimiter = ',')]
        channels: Option<Vec<String>>,
        #[arg(long)]
        alpha: Option<f64>,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    // 1. 加载配置 (文件 -> 环境变量覆盖)
    let mut config = match &args.config {
        Some(path) => AppConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => AppConfig::default(),
    };
    if let Ok(name) = std::env::var(STREAM_NAME_ENV) {
        log::info!("{STREAM_NAME_ENV} set, resolving stream '{name}'");
        config.live.query = StreamQuery::by_name(&name);
    }
    // 2. 录制文件目录
    let dir = args
        .recordings_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from(config.recordings_dir()));
    let store = CsvStore::new(dir);

    match args.command {
        Command::Synth {
            label,
            seconds,
            alpha,
            seed,
        } => synth(&store, &label, seconds, alpha, seed),
        Command::Record {
            label,
            seconds,
            replay,
            simulate,
        } => record(&config, &store, &label, seconds, replay, simulate),
        Command::Replay {
            recording,
            publish,
            name,
        } => replay(&config, &store, &recording, publish, &name),
        Command::Analyze { recording } => analyze(&config, &store, &recording),
        Command::Compare {
            a,
            b,
            channels,
            alpha,
        } => {
            if channels.is_some() {
                config.comparison.channels = channels;
            }
            if let Some(alpha) = alpha {
                config.comparison.alpha = alpha;
            }
            let a = store.load(&RecordingRef::new(a))?;
            let b = store.load(&RecordingRef::new(b))?;
            let bands = config.comparison.analyzer.bands.clone();
            let report = compare(&a, &b, &bands, &config.comparison)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}

fn synth(store: &CsvStore, label: &str, seconds: f64, alpha: f64, seed: u64) -> Result<()> {
    let mut signal = SyntheticSignal::silent(muse_channel_names(), MUSE_SAMPLE_RATE_HZ)
        .with_noise(5.0)
        .with_seed(seed);
    for channel in 0..signal.channel_names.len() {
        signal = signal.with_tone(channel, 10.0, alpha);
    }
    let recording = signal.recording(label, seconds);
    let mut sink = store.create(label, &recording.metadata)?;
    sink.append(&recording.samples)?;
    sink.finalize()?;
    println!("{}", sink.id());
    Ok(())
}

/// Pushes synthetic samples into an advertised device stream in real time.
fn spawn_simulated_device(transport: &MemoryTransport, stop: Arc<AtomicBool>) -> thread::JoinHandle<()> {
    let signal = SyntheticSignal::default().starting_at(clock::monotonic_now());
    let mut device_meta = signal.metadata();
    // Headsets report an AUX channel that the live source trims away.
    device_meta.channel_names.push("Right AUX".into());
    let outlet = transport.advertise(StreamAdvert::device("Muse", "simulated-muse", &device_meta));
    thread::spawn(move || {
        let started = Instant::now();
        let mut sent = 0usize;
        let chunk = signal.samples(256 * 600);
        while !stop.load(Ordering::Relaxed) && sent < chunk.len() {
            let due = ((started.elapsed().as_secs_f64() * signal.sample_rate) as usize).min(chunk.len());
            for sample in &chunk[sent..due] {
                let mut with_aux = sample.clone();
                with_aux.channels.push(0.0);
                outlet.push(&with_aux);
            }
            sent = due;
            thread::sleep(Duration::from_millis(20));
        }
    })
}

/// Joins a helper thread, logging instead of discarding a panic.
fn join_logged(handle: thread::JoinHandle<()>, what: &str) -> bool {
    match handle.join() {
        Ok(()) => true,
        Err(_) => {
            log::error!("{what} thread panicked");
            false
        }
    }
}

fn record(
    config: &AppConfig,
    store: &CsvStore,
    label: &str,
    seconds: f64,
    replay: Option<String>,
    simulate: bool,
) -> Result<()> {
    let memory = MemoryTransport::new();
    let transport: Arc<dyn Transport> = Arc::new(memory.clone());
    let stop_device = Arc::new(AtomicBool::new(false));
    let device = simulate.then(|| spawn_simulated_device(&memory, stop_device.clone()));

    let source_config = match replay {
        Some(recording) => SourceConfig::Playback {
            recording: RecordingRef::new(recording),
            config: config.playback.clone(),
        },
        None => SourceConfig::Live(config.live.clone()),
    };
    // 1. 打开数据源 (实时或回放)
    let source = open_source(&source_config, &transport, store).context("opening source")?;
    let buffer = SampleBuffer::with_history_seconds(source.metadata().clone(), config.buffer.history_seconds)?;
    // 2. 消费者先订阅，再启动生产者，避免丢掉开头的样本
    let analysis = spawn_analysis(buffer.subscribe(), config.analyzer.clone(), config.smoothing.clone())?;
    let mut recording = Recorder::start(&buffer, label, Arc::new(store.clone()), config.recorder.clone())?;
    let acquisition = Acquisition::spawn(source, buffer.clone())?;

    let deadline = Instant::now() + Duration::from_secs_f64(seconds.max(0.0));
    while Instant::now() < deadline && !acquisition.is_finished() {
        drain_trends(analysis.events(), Duration::from_millis(200));
    }
    // 3. 按顺序收尾：生产者 -> 录制 -> 分析 -> 模拟设备
    let summary = acquisition.stop();
    log::info!("acquisition: {summary:?}");
    let stopped = recording.stop()?;
    analysis.stop();
    stop_device.store(true, Ordering::Relaxed);
    if let Some(device) = device {
        join_logged(device, "simulated device");
    }

    if let Some(err) = stopped.durability_error() {
        log::warn!("{err}");
    }
    let metrics = buffer.metrics();
    if metrics.overruns > 0 {
        log::warn!("{} buffer overruns, {} samples missed", metrics.overruns, metrics.missed_samples);
    }
    println!("{} ({} samples)", stopped.recording.id, stopped.recording.len());
    Ok(())
}

fn replay(config: &AppConfig, store: &CsvStore, recording: &str, publish_stream: bool, name: &str) -> Result<()> {
    let recording = store.load(&RecordingRef::new(recording))?;
    let playback = SourceConfig::Playback {
        recording: recording.id.clone(),
        config: config.playback.clone(),
    };
    let memory = MemoryTransport::new();
    let transport: Arc<dyn Transport> = Arc::new(memory.clone());
    let mut source = open_source(&playback, &transport, store)?;

    let mut publisher = None;
    if publish_stream {
        let advert = StreamAdvert::playback(name, source.session_id(), source.metadata());
        let outlet = memory.advertise(advert.clone());
        publisher = Some(publish(source, outlet));
        let mut live = config.live.clone();
        live.query = StreamQuery {
            name: Some(advert.name.clone()),
            kind: None,
            include_playback: true,
        };
        source = Box::new(LiveSource::open(live, transport.clone())?);
    }

    let buffer = SampleBuffer::with_history_seconds(source.metadata().clone(), config.buffer.history_seconds)?;
    let analysis = spawn_analysis(buffer.subscribe(), config.analyzer.clone(), config.smoothing.clone())?;
    let acquisition = Acquisition::spawn(source, buffer)?;
    while !acquisition.is_finished() {
        drain_trends(analysis.events(), Duration::from_millis(200));
    }
    let summary = acquisition.join();
    if let Some(publisher) = publisher {
        publisher.stop();
    }
    analysis.stop();
    log::info!("replay finished: {summary:?}");
    Ok(())
}

/// Prints the alpha envelope of every channel once per window.
fn drain_trends(events: &crossbeam::channel::Receiver<AnalysisEvent>, wait: Duration) {
    let Ok(first) = events.recv_timeout(wait) else {
        return;
    };
    for event in std::iter::once(first).chain(events.try_iter()) {
        match event {
            AnalysisEvent::Window { trends, .. } => {
                let alpha: Vec<String> = trends
                    .iter()
                    .filter(|t| t.envelope.band == Band::Alpha)
                    .map(|t| {
                        let marker = if t.envelope.warming_up { "~" } else { "" };
                        format!("{marker}{:.3}", t.envelope.value)
                    })
                    .collect();
                if let Some(first) = trends.first() {
                    println!("{:>10.2}s alpha envelope [{}]", first.envelope.timestamp, alpha.join(", "));
                }
            }
            AnalysisEvent::Gap(gap) => println!("gap: {gap:?}"),
            AnalysisEvent::Finished => println!("stream finished"),
        }
    }
}

fn analyze(config: &AppConfig, store: &CsvStore, recording: &str) -> Result<()> {
    let recording = store.load(&RecordingRef::new(recording))?;
    if recording.is_empty() {
        bail!("recording {} is empty", recording.id);
    }
    let estimates = window_series(&recording.metadata, &recording.samples, &config.analyzer)?;
    let rows: Vec<serde_json::Value> = estimates
        .iter()
        .map(|e| {
            serde_json::json!({
                "timestamp": e.timestamp,
                "channel": recording.metadata.channel_names.get(e.channel),
                "band": e.band.name(),
                "power": e.power,
                "log_power": log_power(e.power),
            })
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&rows)?);
    Ok(())
}

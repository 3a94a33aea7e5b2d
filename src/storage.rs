// src/storage.rs
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::clock;
use crate::drivers::{SignalError, SignalResult};
use crate::types::{Sample, SessionMetadata, MUSE_SAMPLE_RATE_HZ};

/// Opaque handle naming a stored recording.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordingRef(String);

impl RecordingRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RecordingRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordingRef {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for RecordingRef {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&Path> for RecordingRef {
    fn from(value: &Path) -> Self {
        Self(value.to_string_lossy().into_owned())
    }
}

/// Finished, immutable sample sequence with its session metadata.
#[derive(Clone, Debug)]
pub struct Recording {
    pub id: RecordingRef,
    pub metadata: SessionMetadata,
    pub samples: Arc<Vec<Sample>>,
}

impl Recording {
    pub fn new(id: impl Into<RecordingRef>, metadata: SessionMetadata, samples: Vec<Sample>) -> Self {
        Self {
            id: id.into(),
            metadata,
            samples: Arc::new(samples),
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration_secs(&self) -> f64 {
        match (self.samples.first(), self.samples.last()) {
            (Some(first), Some(last)) => last.timestamp - first.timestamp + self.metadata.sample_period(),
            _ => 0.0,
        }
    }
}

/// Append-only destination of one recording.
pub trait RecordingSink: Send {
    fn id(&self) -> &RecordingRef;

    /// Takes a leading run of `samples` and returns how many it took. A short
    /// count means storage failed after that many; the rest must be offered
    /// again. An error means none were taken.
    fn append(&mut self, samples: &[Sample]) -> SignalResult<usize>;

    /// Makes everything appended so far durable. A failed flush keeps the
    /// unwritten part and resumes from it on the next call.
    fn flush(&mut self) -> SignalResult<()>;

    fn finalize(&mut self) -> SignalResult<()>;
}

/// Where recordings live. Injected into the recorder and the source factory.
pub trait RecordingStore: Send + Sync {
    fn create(&self, label: &str, metadata: &SessionMetadata) -> SignalResult<Box<dyn RecordingSink>>;

    fn load(&self, id: &RecordingRef) -> SignalResult<Recording>;
}

/// Keeps alphanumerics, `_` and `-`; spaces become `_`. Empty labels become
/// `recording`.
pub fn sanitize_label(label: &str) -> String {
    let kept: String = label
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '_' | '-'))
        .collect();
    let trimmed = kept.trim();
    if trimmed.is_empty() {
        "recording".to_owned()
    } else {
        trimmed.replace(' ', "_")
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Sidecar {
    label: String,
    created_unix: u64,
    metadata: SessionMetadata,
}

/// CSV files with a `timestamp,<channels...>` header and a JSON sidecar
/// holding the session metadata.
#[derive(Clone, Debug)]
pub struct CsvStore {
    dir: PathBuf,
    /// Rate assumed when neither a sidecar nor usable timestamps exist.
    fallback_rate: f64,
}

impl CsvStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            fallback_rate: MUSE_SAMPLE_RATE_HZ,
        }
    }

    pub fn with_fallback_rate(mut self, rate: f64) -> Self {
        self.fallback_rate = rate;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Recordings in the store directory, oldest name first.
    pub fn list(&self) -> SignalResult<Vec<RecordingRef>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut found: Vec<RecordingRef> = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().map_or(false, |ext| ext == "csv"))
            .map(|path| RecordingRef::from(path.as_path()))
            .collect();
        found.sort();
        Ok(found)
    }

    fn resolve(&self, id: &RecordingRef) -> PathBuf {
        let direct = PathBuf::from(id.as_str());
        let candidates = [
            direct.clone(),
            direct.with_extension("csv"),
            self.dir.join(&direct),
            self.dir.join(&direct).with_extension("csv"),
        ];
        candidates
            .iter()
            .find(|p| p.is_file())
            .cloned()
            .unwrap_or(direct)
    }

    fn unique_stem(&self, label: &str) -> String {
        let base = format!("{}_{}", sanitize_label(label), clock::unix_now());
        let mut stem = base.clone();
        let mut n = 2;
        while self.dir.join(format!("{stem}.csv")).exists() {
            stem = format!("{base}_{n}");
            n += 1;
        }
        stem
    }
}

impl RecordingStore for CsvStore {
    fn create(&self, label: &str, metadata: &SessionMetadata) -> SignalResult<Box<dyn RecordingSink>> {
        fs::create_dir_all(&self.dir)?;
        let stem = self.unique_stem(label);
        let path = self.dir.join(format!("{stem}.csv"));
        let id = RecordingRef::from(path.as_path());
        let write_err = |message: String| SignalError::StorageWrite {
            recording: id.to_string(),
            message,
        };

        let sidecar = Sidecar {
            label: label.to_owned(),
            created_unix: clock::unix_now(),
            metadata: metadata.clone(),
        };
        let sidecar_file = File::create(path.with_extension("json")).map_err(|e| write_err(e.to_string()))?;
        serde_json::to_writer_pretty(sidecar_file, &sidecar).map_err(|e| write_err(e.to_string()))?;

        let mut header = Vec::with_capacity(metadata.num_channels() + 1);
        header.push("timestamp".to_owned());
        header.extend(metadata.channel_names.iter().cloned());
        let header = encode_rows(std::iter::once(header)).map_err(|e| write_err(e))?;
        let mut file = File::create(&path).map_err(|e| write_err(e.to_string()))?;
        file.write_all(&header).map_err(|e| write_err(e.to_string()))?;
        log::info!("recording to {}", path.display());

        Ok(Box::new(CsvSink {
            id,
            file: Some(file),
            staged: Vec::new(),
            rows: 0,
        }))
    }

    fn load(&self, id: &RecordingRef) -> SignalResult<Recording> {
        let path = self.resolve(id);
        let id = RecordingRef::from(path.as_path());
        let format_err = |message: String| SignalError::RecordingFormat {
            recording: id.to_string(),
            message,
        };
        // 1. 元数据文件可选，缺失时从时间戳推断采样率
        let sidecar: Option<Sidecar> = match File::open(path.with_extension("json")) {
            Ok(file) => match serde_json::from_reader(file) {
                Ok(sidecar) => Some(sidecar),
                Err(e) => {
                    log::warn!("ignoring unreadable metadata for {id}: {e}");
                    None
                }
            },
            Err(_) => None,
        };

        let mut reader = csv::Reader::from_path(&path).map_err(|e| match e.into_kind() {
            csv::ErrorKind::Io(io) => SignalError::Io(io),
            other => format_err(format!("{other:?}")),
        })?;
        let header = reader.headers().map_err(|e| format_err(e.to_string()))?.clone();
        if header.len() < 2 {
            return Err(format_err("expected a timestamp column and at least one channel".into()));
        }
        let channel_names: Vec<String> = header.iter().skip(1).map(|s| s.trim().to_owned()).collect();

        let mut raw_timestamps = Vec::new();
        let mut rows = Vec::new();
        for (line, record) in reader.records().enumerate() {
            let record = record.map_err(|e| format_err(e.to_string()))?;
            if record.len() != header.len() {
                return Err(format_err(format!(
                    "row {} has {} fields, header has {}",
                    line + 1,
                    record.len(),
                    header.len()
                )));
            }
            raw_timestamps.push(record[0].trim().parse::<f64>().ok().filter(|t| t.is_finite()));
            let values = record
                .iter()
                .skip(1)
                .map(|v| v.trim().parse::<f32>())
                .collect::<Result<Vec<f32>, _>>()
                .map_err(|e| format_err(format!("row {}: {e}", line + 1)))?;
            rows.push(values);
        }

        // 2. 采样率：元数据 > 时间戳中位间隔 > 默认值
        let numeric: Option<Vec<f64>> = raw_timestamps.iter().copied().collect();
        let rate = sidecar
            .as_ref()
            .map(|s| s.metadata.nominal_sample_rate)
            .filter(|r| *r > 0.0)
            .or_else(|| numeric.as_deref().and_then(infer_rate))
            .unwrap_or(self.fallback_rate);

        let timestamps = match numeric {
            Some(ts) => {
                if let Some(pair) = ts.windows(2).find(|p| p[1] < p[0]) {
                    return Err(format_err(format!(
                        "timestamps go backwards ({} after {})",
                        pair[1], pair[0]
                    )));
                }
                ts
            }
            None => {
                log::warn!("{id} has non-numeric timestamps, assuming {rate} Hz from row index");
                (0..rows.len()).map(|i| i as f64 / rate).collect()
            }
        };

        let metadata = match sidecar {
            Some(s) => SessionMetadata::new(channel_names, rate, s.metadata.start_time),
            None => SessionMetadata::new(channel_names, rate, timestamps.first().copied().unwrap_or(0.0)),
        };
        let samples = timestamps
            .into_iter()
            .zip(rows)
            .map(|(t, values)| Sample::new(t, values))
            .collect();
        Ok(Recording::new(id.clone(), metadata, samples))
    }
}

/// Rate from the median spacing of the first rows.
fn infer_rate(timestamps: &[f64]) -> Option<f64> {
    let mut gaps: Vec<f64> = timestamps
        .windows(2)
        .take(64)
        .map(|p| p[1] - p[0])
        .filter(|d| *d > 0.0)
        .collect();
    if gaps.is_empty() {
        return None;
    }
    gaps.sort_by(|a, b| a.total_cmp(b));
    let median = gaps[gaps.len() / 2];
    Some(1.0 / median)
}

/// CSV bytes for `rows`, one line each.
fn encode_rows(rows: impl IntoIterator<Item = Vec<String>>) -> Result<Vec<u8>, String> {
    let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(Vec::new());
    for row in rows {
        writer.write_record(&row).map_err(|e| e.to_string())?;
    }
    writer.into_inner().map_err(|e| e.to_string())
}

/// Batches are encoded whole into `staged` and only `flush` touches the
/// file, draining exactly the bytes the OS took. A failed write therefore
/// never leaves half a batch behind to be written twice.
struct CsvSink {
    id: RecordingRef,
    file: Option<File>,
    staged: Vec<u8>,
    rows: u64,
}

impl CsvSink {
    fn write_err(&self, message: impl ToString) -> SignalError {
        SignalError::StorageWrite {
            recording: self.id.to_string(),
            message: message.to_string(),
        }
    }

    fn write_staged(&mut self) -> io::Result<()> {
        let Some(file) = self.file.as_mut() else {
            return Ok(());
        };
        while !self.staged.is_empty() {
            match file.write(&self.staged) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.staged.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        file.flush()
    }
}

impl RecordingSink for CsvSink {
    fn id(&self) -> &RecordingRef {
        &self.id
    }

    fn append(&mut self, samples: &[Sample]) -> SignalResult<usize> {
        if self.file.is_none() {
            return Err(self.write_err("recording already finalized"));
        }
        let rows = samples.iter().map(|sample| {
            let mut row = Vec::with_capacity(sample.channels.len() + 1);
            row.push(sample.timestamp.to_string());
            row.extend(sample.channels.iter().map(|v| v.to_string()));
            row
        });
        let bytes = encode_rows(rows).map_err(|e| self.write_err(e))?;
        self.staged.extend_from_slice(&bytes);
        self.rows += samples.len() as u64;
        Ok(samples.len())
    }

    fn flush(&mut self) -> SignalResult<()> {
        self.write_staged().map_err(|e| self.write_err(e))?;
        log::debug!("flushed {} rows to {}", self.rows, self.id);
        Ok(())
    }

    fn finalize(&mut self) -> SignalResult<()> {
        self.flush()?;
        if let Some(file) = self.file.take() {
            file.sync_all().map_err(|e| self.write_err(e))?;
        }
        Ok(())
    }
}

/// Process-local store. Writes can be made to fail on demand.
#[derive(Clone, Default)]
pub struct MemoryStore {
    recordings: Arc<Mutex<HashMap<RecordingRef, Recording>>>,
    fail_writes: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, recording: Recording) {
        self.recordings.lock().insert(recording.id.clone(), recording);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    pub fn ids(&self) -> Vec<RecordingRef> {
        let mut ids: Vec<RecordingRef> = self.recordings.lock().keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl RecordingStore for MemoryStore {
    fn create(&self, label: &str, metadata: &SessionMetadata) -> SignalResult<Box<dyn RecordingSink>> {
        let mut recordings = self.recordings.lock();
        let base = sanitize_label(label);
        let mut id = RecordingRef::new(base.clone());
        let mut n = 2;
        while recordings.contains_key(&id) {
            id = RecordingRef::new(format!("{base}_{n}"));
            n += 1;
        }
        recordings.insert(id.clone(), Recording::new(id.clone(), metadata.clone(), Vec::new()));
        Ok(Box::new(MemorySink {
            id,
            recordings: self.recordings.clone(),
            fail_writes: self.fail_writes.clone(),
            pending: Vec::new(),
        }))
    }

    fn load(&self, id: &RecordingRef) -> SignalResult<Recording> {
        self.recordings
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| SignalError::RecordingFormat {
                recording: id.to_string(),
                message: "no such recording".into(),
            })
    }
}

struct MemorySink {
    id: RecordingRef,
    recordings: Arc<Mutex<HashMap<RecordingRef, Recording>>>,
    fail_writes: Arc<AtomicBool>,
    pending: Vec<Sample>,
}

impl RecordingSink for MemorySink {
    fn id(&self) -> &RecordingRef {
        &self.id
    }

    fn append(&mut self, samples: &[Sample]) -> SignalResult<usize> {
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(SignalError::StorageWrite {
                recording: self.id.to_string(),
                message: "store rejected write".into(),
            });
        }
        self.pending.extend_from_slice(samples);
        Ok(samples.len())
    }

    fn flush(&mut self) -> SignalResult<()> {
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(SignalError::StorageWrite {
                recording: self.id.to_string(),
                message: "store rejected flush".into(),
            });
        }
        let mut recordings = self.recordings.lock();
        if let Some(recording) = recordings.get_mut(&self.id) {
            Arc::make_mut(&mut recording.samples).append(&mut self.pending);
        }
        Ok(())
    }

    fn finalize(&mut self) -> SignalResult<()> {
        self.flush()
    }
}

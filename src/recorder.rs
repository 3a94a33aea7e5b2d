// src/recorder.rs
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::drivers::{BufferEvent, Cursor, SampleBuffer, SignalError, SignalResult};
use crate::storage::{Recording, RecordingRef, RecordingSink, RecordingStore};
use crate::types::{Sample, SessionMetadata};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    /// A crash loses at most this much of the tail.
    pub flush_interval_secs: f64,
    pub read_batch: usize,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            flush_interval_secs: 3.0,
            read_batch: 256,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RecorderStatus {
    pub samples: u64,
    pub flushed: u64,
    pub gaps: u64,
    pub write_errors: u64,
    pub last_error: Option<String>,
    /// Samples held in memory until storage confirms them.
    pub pending: u64,
}

impl RecorderStatus {
    /// False once a write failed and the data has not been persisted since.
    pub fn durable(&self) -> bool {
        self.last_error.is_none()
    }
}

/// Result of [`RecordingHandle::stop`].
#[derive(Clone, Debug)]
pub struct StoppedRecording {
    /// Everything captured. Read back from storage, plus whatever storage
    /// never confirmed.
    pub recording: Recording,
    pub status: RecorderStatus,
}

impl StoppedRecording {
    pub fn durable(&self) -> bool {
        self.status.durable()
    }

    /// The storage failure that put durability at risk, if any.
    pub fn durability_error(&self) -> Option<SignalError> {
        self.status.last_error.as_ref().map(|message| SignalError::StorageWrite {
            recording: self.recording.id.to_string(),
            message: message.clone(),
        })
    }
}

pub struct Recorder;

impl Recorder {
    /// Starts capturing every sample appended to `buffer` from now on.
    pub fn start(
        buffer: &SampleBuffer,
        label: &str,
        store: Arc<dyn RecordingStore>,
        config: RecorderConfig,
    ) -> SignalResult<RecordingHandle> {
        let metadata = buffer.metadata().clone();
        let sink = store.create(label, &metadata)?;
        let id = sink.id().clone();
        let cursor = buffer.subscribe();
        let status = Arc::new(Mutex::new(RecorderStatus::default()));
        let stop = Arc::new(AtomicBool::new(false));

        let worker = Worker {
            cursor,
            sink,
            store,
            metadata,
            config,
            status: status.clone(),
            stop: stop.clone(),
            tail: Vec::new(),
            offered: 0,
            durable: 0,
        };
        let join = thread::Builder::new()
            .name("bandwave-recorder".into())
            .spawn(move || worker.run())?;
        log::info!("recorder started: {id}");

        Ok(RecordingHandle {
            id,
            status,
            stop,
            worker: Some(join),
            finished: None,
        })
    }
}

struct Worker {
    cursor: Cursor,
    sink: Box<dyn RecordingSink>,
    store: Arc<dyn RecordingStore>,
    metadata: SessionMetadata,
    config: RecorderConfig,
    status: Arc<Mutex<RecorderStatus>>,
    stop: Arc<AtomicBool>,
    /// Samples not yet confirmed durable. Cleared by every successful flush,
    /// so it only grows while storage is failing.
    tail: Vec<Sample>,
    /// Leading part of `tail` the sink already took.
    offered: usize,
    /// Samples confirmed durable before `tail[0]`.
    durable: u64,
}

impl Worker {
    fn run(mut self) -> StoppedRecording {
        let interval = Duration::from_secs_f64(self.config.flush_interval_secs.max(0.0));
        let mut last_flush = Instant::now();
        let batch = self.config.read_batch.max(1);

        // 1. 录制循环：读取私有游标，按间隔落盘
        while !self.stop.load(Ordering::Relaxed) {
            match self.cursor.read(batch, Duration::from_millis(100)) {
                Ok(events) => self.capture(events),
                Err(SignalError::BufferClosed) => break,
                Err(e) => {
                    log::error!("recorder {} stopped reading: {e}", self.sink.id());
                    break;
                }
            }
            if last_flush.elapsed() >= interval {
                self.persist(false);
                last_flush = Instant::now();
            }
        }
        // 2. stop() 之前进入缓冲区的样本都属于本次录制
        while let Ok(events) = self.cursor.read(batch, Duration::ZERO) {
            if events.is_empty() {
                break;
            }
            self.capture(events);
        }
        self.persist(true);

        // 3. 生成最终录制结果
        let status = self.status.lock().clone();
        let recording = self.finished_recording(&status);
        if status.durable() {
            log::info!("recording {} finalized with {} samples", self.sink.id(), status.samples);
        } else {
            log::warn!(
                "recording {} kept {} samples in memory, storage holds {}",
                self.sink.id(),
                status.samples,
                status.flushed
            );
        }
        StoppedRecording { recording, status }
    }

    fn capture(&mut self, events: Vec<BufferEvent>) {
        let mut added = 0u64;
        let mut gaps = 0u64;
        for event in events {
            match event {
                BufferEvent::Sample(sample) => {
                    self.tail.push((*sample).clone());
                    added += 1;
                }
                BufferEvent::Gap(gap) => {
                    log::warn!("recording {} has a gap: {gap:?}", self.sink.id());
                    gaps += 1;
                }
            }
        }
        let mut status = self.status.lock();
        status.samples += added;
        status.gaps += gaps;
        status.pending = self.tail.len() as u64;
    }

    /// Offers the part of the tail the sink has not taken yet.
    fn offer(&mut self) -> SignalResult<()> {
        let pending = &self.tail[self.offered..];
        if pending.is_empty() {
            return Ok(());
        }
        let wanted = pending.len();
        let taken = self.sink.append(pending)?.min(wanted);
        self.offered += taken;
        if taken < wanted {
            return Err(SignalError::StorageWrite {
                recording: self.sink.id().to_string(),
                message: format!("storage took {taken} of {wanted} samples"),
            });
        }
        Ok(())
    }

    /// Writes and flushes the tail. On failure the tail stays in memory and
    /// the next call resumes where the sink stopped.
    fn persist(&mut self, finalize: bool) {
        let result = self.offer().and_then(|()| {
            if finalize {
                self.sink.finalize()
            } else {
                self.sink.flush()
            }
        });
        let mut status = self.status.lock();
        match result {
            Ok(()) => {
                self.durable += self.tail.len() as u64;
                self.tail.clear();
                self.offered = 0;
                status.flushed = self.durable;
                status.last_error = None;
                status.pending = 0;
            }
            Err(e) => {
                log::error!("{e}");
                status.write_errors += 1;
                status.last_error = Some(e.to_string());
            }
        }
    }

    /// Reads the stored recording back. When storage fell behind, the part it
    /// confirmed is joined with the tail still held in memory.
    fn finished_recording(&self, status: &RecorderStatus) -> Recording {
        let id = self.sink.id().clone();
        let stored = match self.store.load(&id) {
            Ok(recording) => Some(recording),
            Err(e) => {
                log::warn!("could not read back {id}: {e}");
                None
            }
        };
        if status.durable() {
            if let Some(recording) = stored {
                return recording;
            }
        }
        let mut samples: Vec<Sample> = stored
            .map(|r| r.samples.iter().take(self.durable as usize).cloned().collect())
            .unwrap_or_default();
        samples.extend_from_slice(&self.tail);
        Recording::new(id, self.metadata.clone(), samples)
    }
}

/// Running recording. Dropping it stops the recorder.
pub struct RecordingHandle {
    id: RecordingRef,
    status: Arc<Mutex<RecorderStatus>>,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<StoppedRecording>>,
    finished: Option<StoppedRecording>,
}

impl RecordingHandle {
    pub fn id(&self) -> &RecordingRef {
        &self.id
    }

    pub fn status(&self) -> RecorderStatus {
        self.status.lock().clone()
    }

    pub fn is_active(&self) -> bool {
        self.finished.is_none()
    }

    /// Stops capturing and returns the finalized recording. Calling it again
    /// returns the same result without touching storage.
    pub fn stop(&mut self) -> SignalResult<StoppedRecording> {
        if let Some(done) = &self.finished {
            return Ok(done.clone());
        }
        self.stop.store(true, Ordering::Relaxed);
        let Some(worker) = self.worker.take() else {
            return Err(SignalError::StorageWrite {
                recording: self.id.to_string(),
                message: "recorder worker is gone".into(),
            });
        };
        let done = worker.join().map_err(|_| SignalError::StorageWrite {
            recording: self.id.to_string(),
            message: "recorder worker panicked".into(),
        })?;
        self.finished = Some(done.clone());
        Ok(done)
    }
}

impl Drop for RecordingHandle {
    fn drop(&mut self) {
        if self.finished.is_none() {
            if let Err(e) = self.stop() {
                log::error!("{e}");
            }
        }
    }
}

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::drivers::live::{LiveConfig, LiveSource};
use crate::drivers::playback::{PlaybackConfig, PlaybackSource};
use crate::drivers::transport::Transport;
use crate::drivers::{SignalError, SignalResult};
use crate::storage::{RecordingRef, RecordingStore};
use crate::types::{Sample, SessionMetadata};

/// Unique tag of one opened source. Survives playback loops.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Shared close flag that wakes any thread suspended inside `next()`.
#[derive(Clone, Default)]
pub struct CloseHandle {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CloseHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn close(&self) {
        let (flag, cvar) = &*self.inner;
        *flag.lock() = true;
        cvar.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.0.lock()
    }

    /// Sleeps until `deadline` unless closed first. Returns `true` when closed.
    pub fn wait_until(&self, deadline: Instant) -> bool {
        let (flag, cvar) = &*self.inner;
        let mut closed = flag.lock();
        while !*closed {
            if cvar.wait_until(&mut closed, deadline).timed_out() {
                break;
            }
        }
        *closed
    }

    pub fn wait_for(&self, timeout: Duration) -> bool {
        self.wait_until(Instant::now() + timeout)
    }
}

/// Producer of samples. Live and playback variants share this contract so the
/// buffer and analyzer never know which one feeds them.
pub trait StreamSource: Send {
    fn metadata(&self) -> &SessionMetadata;

    fn session_id(&self) -> SessionId;

    /// Blocks until the next sample is available.
    ///
    /// Fails with `SourceEnded` when a finite source is exhausted,
    /// `ConnectionLost` when a live stream drops and `SourceClosed` once
    /// `close()` was called.
    fn next(&mut self) -> SignalResult<Sample>;

    fn close(&mut self) {
        self.close_handle().close();
    }

    /// Handle another thread can use to unblock a pending `next()`.
    fn close_handle(&self) -> CloseHandle;
}

impl<S: StreamSource + ?Sized> StreamSource for Box<S> {
    fn metadata(&self) -> &SessionMetadata {
        (**self).metadata()
    }
    fn session_id(&self) -> SessionId {
        (**self).session_id()
    }
    fn next(&mut self) -> SignalResult<Sample> {
        (**self).next()
    }
    fn close(&mut self) {
        (**self).close()
    }
    fn close_handle(&self) -> CloseHandle {
        (**self).close_handle()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SourceConfig {
    #[serde(rename = "live")]
    Live(LiveConfig),
    #[serde(rename = "playback")]
    Playback {
        recording: RecordingRef,
        #[serde(default)]
        config: PlaybackConfig,
    },
}

/// Opens whichever variant `config` names.
pub fn open_source(
    config: &SourceConfig,
    transport: &Arc<dyn Transport>,
    store: &dyn RecordingStore,
) -> SignalResult<Box<dyn StreamSource>> {
    match config {
        SourceConfig::Live(live) => Ok(Box::new(LiveSource::open(live.clone(), transport.clone())?)),
        SourceConfig::Playback { recording, config } => {
            let recording = store.load(recording)?;
            Ok(Box::new(PlaybackSource::open(recording, config.clone())?))
        }
    }
}

/// In-memory source useful for tests and deterministic feeding.
pub struct ManualSource {
    metadata: SessionMetadata,
    queue: VecDeque<Sample>,
    session: SessionId,
    closer: CloseHandle,
}

impl ManualSource {
    pub fn new(metadata: SessionMetadata, samples: impl IntoIterator<Item = Sample>) -> Self {
        Self {
            metadata,
            queue: samples.into_iter().collect(),
            session: SessionId::new(),
            closer: CloseHandle::new(),
        }
    }
}

impl StreamSource for ManualSource {
    fn metadata(&self) -> &SessionMetadata {
        &self.metadata
    }

    fn session_id(&self) -> SessionId {
        self.session
    }

    fn next(&mut self) -> SignalResult<Sample> {
        if self.closer.is_closed() {
            return Err(SignalError::SourceClosed {
                session: self.session.to_string(),
            });
        }
        self.queue.pop_front().ok_or_else(|| SignalError::SourceEnded {
            session: self.session.to_string(),
        })
    }

    fn close_handle(&self) -> CloseHandle {
        self.closer.clone()
    }
}

//! Discovery namespace that live sources resolve streams from.
//!
//! Streams are announced by an [`Outlet`] with a [`StreamAdvert`] and picked up
//! by subscribers through an [`Inlet`]. Every advert carries the session id of
//! its producer and whether it originates from a device or from a replayed
//! recording, so a replay published into the same namespace is never taken for
//! a headset.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::drivers::source::{CloseHandle, SessionId, StreamSource};
use crate::drivers::SignalError;
use crate::types::{Sample, SessionMetadata};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Origin {
    Device,
    Playback,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamAdvert {
    pub name: String,
    pub kind: String,
    pub source_id: String,
    pub origin: Origin,
    pub session_id: SessionId,
    pub channel_names: Vec<String>,
    pub nominal_sample_rate: f64,
}

impl StreamAdvert {
    pub fn device(name: &str, source_id: &str, metadata: &SessionMetadata) -> Self {
        Self {
            name: name.to_string(),
            kind: "EEG".to_string(),
            source_id: source_id.to_string(),
            origin: Origin::Device,
            session_id: SessionId::new(),
            channel_names: metadata.channel_names.clone(),
            nominal_sample_rate: metadata.nominal_sample_rate,
        }
    }

    /// Advert for a replayed recording, e.g. `MusePlayback` / `PlaybackSource`.
    pub fn playback(base_name: &str, session_id: SessionId, metadata: &SessionMetadata) -> Self {
        Self {
            name: format!("{base_name}Playback"),
            kind: "EEG".to_string(),
            source_id: "PlaybackSource".to_string(),
            origin: Origin::Playback,
            session_id,
            channel_names: metadata.channel_names.clone(),
            nominal_sample_rate: metadata.nominal_sample_rate,
        }
    }
}

/// Resolution predicate: by name when given, otherwise by stream type.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamQuery {
    pub name: Option<String>,
    pub kind: Option<String>,
    /// Accept streams re-published from recordings.
    pub include_playback: bool,
}

impl Default for StreamQuery {
    fn default() -> Self {
        Self {
            name: None,
            kind: Some("EEG".to_string()),
            include_playback: false,
        }
    }
}

impl StreamQuery {
    pub fn by_name(name: &str) -> Self {
        Self {
            name: Some(name.to_string()),
            ..Self::default()
        }
    }

    pub fn matches(&self, advert: &StreamAdvert) -> bool {
        if advert.origin == Origin::Playback && !self.include_playback {
            return false;
        }
        match &self.name {
            Some(name) => &advert.name == name,
            None => self.kind.as_ref().map_or(true, |kind| &advert.kind == kind),
        }
    }
}

impl std::fmt::Display for StreamQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.name, &self.kind) {
            (Some(name), _) => write!(f, "name='{name}'")?,
            (None, Some(kind)) => write!(f, "type='{kind}'")?,
            (None, None) => write!(f, "any")?,
        }
        if self.include_playback {
            write!(f, " (playback allowed)")?;
        }
        Ok(())
    }
}

/// The producer behind an inlet went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Disconnected;

pub trait Inlet: Send {
    /// Waits up to `timeout` for one sample. `Ok(None)` means nothing arrived yet.
    fn pull(&mut self, timeout: Duration) -> Result<Option<Sample>, Disconnected>;
}

pub trait Transport: Send + Sync {
    fn resolve(&self, query: &StreamQuery) -> Vec<StreamAdvert>;

    /// `None` when the advertised stream is no longer present.
    fn subscribe(&self, advert: &StreamAdvert) -> Option<Box<dyn Inlet>>;
}

struct Entry {
    advert: StreamAdvert,
    subscribers: Vec<Sender<Sample>>,
}

/// In-process namespace, shared by cloning.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    entries: Arc<Mutex<Vec<Entry>>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advertise(&self, advert: StreamAdvert) -> Outlet {
        log::info!(
            "advertising stream '{}' ({:?}, session {})",
            advert.name,
            advert.origin,
            advert.session_id
        );
        self.entries.lock().push(Entry {
            advert: advert.clone(),
            subscribers: Vec::new(),
        });
        Outlet {
            advert,
            entries: self.entries.clone(),
        }
    }
}

impl Transport for MemoryTransport {
    fn resolve(&self, query: &StreamQuery) -> Vec<StreamAdvert> {
        self.entries
            .lock()
            .iter()
            .filter(|e| query.matches(&e.advert))
            .map(|e| e.advert.clone())
            .collect()
    }

    fn subscribe(&self, advert: &StreamAdvert) -> Option<Box<dyn Inlet>> {
        let mut entries = self.entries.lock();
        let entry = entries
            .iter_mut()
            .find(|e| e.advert.session_id == advert.session_id)?;
        let (tx, rx) = channel::unbounded();
        entry.subscribers.push(tx);
        Some(Box::new(MemoryInlet { rx }))
    }
}

struct MemoryInlet {
    rx: Receiver<Sample>,
}

impl Inlet for MemoryInlet {
    fn pull(&mut self, timeout: Duration) -> Result<Option<Sample>, Disconnected> {
        match self.rx.recv_timeout(timeout) {
            Ok(sample) => Ok(Some(sample)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(Disconnected),
        }
    }
}

/// Publishing end of an advertised stream. Dropping it withdraws the advert
/// and disconnects every subscriber.
pub struct Outlet {
    advert: StreamAdvert,
    entries: Arc<Mutex<Vec<Entry>>>,
}

impl Outlet {
    pub fn advert(&self) -> &StreamAdvert {
        &self.advert
    }

    pub fn push(&self, sample: &Sample) {
        self.push_chunk(std::slice::from_ref(sample));
    }

    pub fn push_chunk(&self, samples: &[Sample]) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries
            .iter_mut()
            .find(|e| e.advert.session_id == self.advert.session_id)
        {
            entry
                .subscribers
                .retain(|tx| samples.iter().all(|s| tx.send(s.clone()).is_ok()));
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.entries
            .lock()
            .iter()
            .find(|e| e.advert.session_id == self.advert.session_id)
            .map_or(0, |e| e.subscribers.len())
    }
}

impl Drop for Outlet {
    fn drop(&mut self) {
        let session = self.advert.session_id;
        self.entries.lock().retain(|e| e.advert.session_id != session);
        log::info!("withdrew stream '{}' (session {})", self.advert.name, session);
    }
}

/// Background pump that re-publishes a source onto an outlet.
pub struct Publisher {
    closer: CloseHandle,
    handle: Option<JoinHandle<u64>>,
}

impl Publisher {
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Stops the pump and returns the number of samples published.
    pub fn stop(mut self) -> u64 {
        self.closer.close();
        self.join_inner()
    }

    /// Waits for the source to end on its own.
    pub fn join(mut self) -> u64 {
        self.join_inner()
    }

    fn join_inner(&mut self) -> u64 {
        self.handle
            .take()
            .and_then(|h| h.join().ok())
            .unwrap_or(0)
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.closer.close();
            self.join_inner();
        }
    }
}

/// Pushes every sample of `source` into `outlet` until the source ends or the
/// publisher is stopped. The outlet is withdrawn when the pump exits.
pub fn publish(mut source: Box<dyn StreamSource>, outlet: Outlet) -> Publisher {
    let closer = source.close_handle();
    let handle = thread::spawn(move || {
        let mut published = 0u64;
        loop {
            match source.next() {
                Ok(sample) => {
                    outlet.push(&sample);
                    published += 1;
                    if published % 2560 == 0 {
                        log::debug!("published {published} samples on '{}'", outlet.advert.name);
                    }
                }
                Err(SignalError::SourceEnded { .. }) | Err(SignalError::SourceClosed { .. }) => {
                    break;
                }
                Err(err) => {
                    log::warn!("publisher for '{}' stopped: {err}", outlet.advert.name);
                    break;
                }
            }
        }
        published
    });
    Publisher {
        closer,
        handle: Some(handle),
    }
}

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::clock;
use crate::drivers::source::{CloseHandle, SessionId, StreamSource};
use crate::drivers::transport::{Inlet, StreamAdvert, StreamQuery, Transport};
use crate::drivers::{SignalError, SignalResult};
use crate::types::{Sample, SessionMetadata};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveConfig {
    pub query: StreamQuery,
    pub discovery_timeout_secs: f64,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub pull_timeout_ms: u64,
    /// Muse streams carry an AUX channel after the four electrodes.
    pub max_channels: Option<usize>,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            query: StreamQuery::default(),
            discovery_timeout_secs: 5.0,
            initial_backoff_ms: 100,
            max_backoff_ms: 2000,
            pull_timeout_ms: 200,
            max_channels: Some(4),
        }
    }
}

/// Source bound to a device stream found on a [`Transport`].
///
/// A dropped connection is reported, never papered over: after
/// `ConnectionLost` the caller re-opens to re-acquire the stream.
pub struct LiveSource {
    config: LiveConfig,
    advert: StreamAdvert,
    inlet: Box<dyn Inlet>,
    metadata: SessionMetadata,
    session: SessionId,
    closer: CloseHandle,
    lost: bool,
}

impl std::fmt::Debug for LiveSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveSource")
            .field("stream", &self.advert.name)
            .field("session", &self.session)
            .field("lost", &self.lost)
            .finish()
    }
}

impl LiveSource {
    /// Polls the transport with exponential backoff until a matching stream
    /// shows up or the discovery timeout elapses.
    pub fn open(config: LiveConfig, transport: Arc<dyn Transport>) -> SignalResult<Self> {
        let started = Instant::now();
        let timeout = Duration::from_secs_f64(config.discovery_timeout_secs.max(0.0));
        let mut backoff = Duration::from_millis(config.initial_backoff_ms.max(1));
        let max_backoff = Duration::from_millis(config.max_backoff_ms.max(1));
        log::info!("resolving stream: {}", config.query);

        // 发现流：指数退避重试，直到超时
        loop {
            let mut found = transport.resolve(&config.query);
            if found.len() > 1 {
                log::warn!("{} streams match {}, using the first", found.len(), config.query);
            }
            if !found.is_empty() {
                let advert = found.remove(0);
                if let Some(inlet) = transport.subscribe(&advert) {
                    return Ok(Self::bind(config, advert, inlet));
                }
                log::debug!("stream '{}' vanished before subscribing", advert.name);
            }

            let elapsed = started.elapsed();
            if elapsed >= timeout {
                return Err(SignalError::SourceUnavailable {
                    query: config.query.to_string(),
                    timeout_secs: config.discovery_timeout_secs,
                });
            }
            let wait = backoff.min(timeout - elapsed);
            log::debug!("no stream for {} yet, retrying in {:?}", config.query, wait);
            std::thread::sleep(wait);
            backoff = (backoff * 2).min(max_backoff);
        }
    }

    fn bind(config: LiveConfig, advert: StreamAdvert, inlet: Box<dyn Inlet>) -> Self {
        let mut channel_names = advert.channel_names.clone();
        if let Some(max) = config.max_channels {
            channel_names.truncate(max);
        }
        let metadata = SessionMetadata::new(
            channel_names,
            advert.nominal_sample_rate,
            clock::monotonic_now(),
        );
        let session = SessionId::new();
        log::info!(
            "connected to '{}' ({} channels, {} Hz) as session {}",
            advert.name,
            metadata.num_channels(),
            metadata.nominal_sample_rate,
            session
        );
        Self {
            config,
            advert,
            inlet,
            metadata,
            session,
            closer: CloseHandle::new(),
            lost: false,
        }
    }

    pub fn advert(&self) -> &StreamAdvert {
        &self.advert
    }

    fn lost_error(&self) -> SignalError {
        SignalError::ConnectionLost {
            session: format!("{} ('{}')", self.session, self.advert.name),
        }
    }
}

impl StreamSource for LiveSource {
    fn metadata(&self) -> &SessionMetadata {
        &self.metadata
    }

    fn session_id(&self) -> SessionId {
        self.session
    }

    fn next(&mut self) -> SignalResult<Sample> {
        let pull_timeout = Duration::from_millis(self.config.pull_timeout_ms.max(1));
        loop {
            if self.closer.is_closed() {
                return Err(SignalError::SourceClosed {
                    session: self.session.to_string(),
                });
            }
            if self.lost {
                return Err(self.lost_error());
            }
            match self.inlet.pull(pull_timeout) {
                Ok(Some(mut sample)) => {
                    let expected = self.metadata.num_channels();
                    if sample.channels.len() < expected {
                        return Err(SignalError::ChannelMismatch {
                            expected,
                            actual: sample.channels.len(),
                        });
                    }
                    sample.channels.truncate(expected);
                    return Ok(sample);
                }
                Ok(None) => continue,
                Err(_) => {
                    log::warn!("stream '{}' dropped (session {})", self.advert.name, self.session);
                    self.lost = true;
                    return Err(self.lost_error());
                }
            }
        }
    }

    fn close_handle(&self) -> CloseHandle {
        self.closer.clone()
    }
}

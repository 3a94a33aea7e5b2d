// src/acquisition.rs
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use serde::{Deserialize, Serialize};

use crate::drivers::{CloseHandle, SampleBuffer, SessionId, SignalError, SignalResult, StreamSource};

/// Why the producer thread exited.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AcquisitionEnd {
    /// Finite source exhausted; the buffer is closed.
    SourceEnded,
    /// Stopped on request; the buffer is closed.
    Closed,
    /// The live stream dropped. The buffer stays open with a discontinuity
    /// marked, so a re-opened source can keep feeding it.
    ConnectionLost,
    /// Some other error; the buffer is closed.
    Failed(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquisitionSummary {
    pub session: String,
    pub samples: u64,
    pub rejected: u64,
    pub end: AcquisitionEnd,
}

/// The single producer context: pulls from a source, appends to the buffer.
pub struct Acquisition {
    session: SessionId,
    closer: CloseHandle,
    appended: Arc<AtomicU64>,
    worker: Option<JoinHandle<AcquisitionSummary>>,
}

impl Acquisition {
    pub fn spawn(mut source: Box<dyn StreamSource>, buffer: SampleBuffer) -> SignalResult<Self> {
        let expected = buffer.metadata().num_channels();
        if source.metadata().num_channels() != expected {
            return Err(SignalError::ChannelMismatch {
                expected,
                actual: source.metadata().num_channels(),
            });
        }
        let session = source.session_id();
        let closer = source.close_handle();
        let appended = Arc::new(AtomicU64::new(0));
        let counter = appended.clone();

        let worker = thread::Builder::new()
            .name(format!("bandwave-acquisition-{session}"))
            .spawn(move || {
                let mut rejected = 0u64;
                // ============================================================
                // 采集循环：source -> buffer，唯一的写入者
                // ============================================================
                let end = loop {
                    match source.next() {
                        Ok(sample) => match buffer.append(sample) {
                            Ok(()) => {
                                counter.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(SignalError::BufferClosed) => break AcquisitionEnd::Closed,
                            Err(e) => {
                                // 坏样本只丢弃，不影响后续数据
                                rejected += 1;
                                log::warn!("session {session}: dropped sample: {e}");
                            }
                        },
                        Err(SignalError::SourceEnded { .. }) => break AcquisitionEnd::SourceEnded,
                        Err(SignalError::SourceClosed { .. }) => break AcquisitionEnd::Closed,
                        Err(SignalError::ConnectionLost { .. }) => {
                            // 断线：缓冲区保持打开，重连后的数据前插入断点标记
                            buffer.mark_discontinuity();
                            break AcquisitionEnd::ConnectionLost;
                        }
                        Err(e) => {
                            log::error!("session {session}: acquisition failed: {e}");
                            break AcquisitionEnd::Failed(e.to_string());
                        }
                    }
                };
                if end != AcquisitionEnd::ConnectionLost {
                    buffer.close();
                }
                let samples = counter.load(Ordering::Relaxed);
                log::info!("session {session}: acquisition ended ({end:?}) after {samples} samples");
                AcquisitionSummary {
                    session: session.to_string(),
                    samples,
                    rejected,
                    end,
                }
            })?;

        Ok(Self {
            session,
            closer,
            appended,
            worker: Some(worker),
        })
    }

    pub fn session_id(&self) -> SessionId {
        self.session
    }

    pub fn samples_appended(&self) -> u64 {
        self.appended.load(Ordering::Relaxed)
    }

    pub fn is_finished(&self) -> bool {
        self.worker.as_ref().map_or(true, |w| w.is_finished())
    }

    /// Closes the source, which unblocks its pending `next()`, and waits.
    pub fn stop(mut self) -> AcquisitionSummary {
        self.closer.close();
        self.finish()
    }

    /// Waits for the source to end on its own.
    pub fn join(mut self) -> AcquisitionSummary {
        self.finish()
    }

    fn finish(&mut self) -> AcquisitionSummary {
        let joined = self.worker.take().map(|w| w.join());
        let fallback = |end: AcquisitionEnd| AcquisitionSummary {
            session: self.session.to_string(),
            samples: self.samples_appended(),
            rejected: 0,
            end,
        };
        match joined {
            Some(Ok(summary)) => summary,
            Some(Err(_)) => fallback(AcquisitionEnd::Failed("acquisition thread panicked".into())),
            None => fallback(AcquisitionEnd::Closed),
        }
    }
}

impl Drop for Acquisition {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.closer.close();
            self.finish();
        }
    }
}

use thiserror::Error;

pub type SignalResult<T> = Result<T, SignalError>;

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("no stream matching {query} found within {timeout_secs:.1}s")]
    SourceUnavailable { query: String, timeout_secs: f64 },
    #[error("connection lost on stream session {session}")]
    ConnectionLost { session: String },
    #[error("stream session {session} has no more samples")]
    SourceEnded { session: String },
    #[error("stream session {session} was closed")]
    SourceClosed { session: String },
    #[error("failed to write recording {recording}: {message}")]
    StorageWrite { recording: String, message: String },
    #[error("recordings {a} and {b} cannot be compared: {reason}")]
    IncompatibleSessions {
        a: String,
        b: String,
        reason: String,
    },
    #[error("band {band} of recording {session} has only {remaining} values after outlier removal")]
    InsufficientData {
        band: String,
        session: String,
        remaining: usize,
    },
    #[error("sample rate must be greater than zero")]
    InvalidSampleRate,
    #[error("channel count mismatch: expected {expected}, got {actual}")]
    ChannelMismatch { expected: usize, actual: usize },
    #[error("sample at {actual:.6}s arrived after {last:.6}s")]
    OutOfOrder { last: f64, actual: f64 },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("recording {recording} is malformed: {message}")]
    RecordingFormat { recording: String, message: String },
    #[error("buffer is closed")]
    BufferClosed,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SignalError {
    /// Errors a caller can recover from by re-opening the source.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SignalError::SourceUnavailable { .. } | SignalError::ConnectionLost { .. }
        )
    }
}

impl From<csv::Error> for SignalError {
    fn from(value: csv::Error) -> Self {
        SignalError::RecordingFormat {
            recording: "csv".into(),
            message: value.to_string(),
        }
    }
}

impl From<serde_json::Error> for SignalError {
    fn from(value: serde_json::Error) -> Self {
        SignalError::InvalidConfig(value.to_string())
    }
}

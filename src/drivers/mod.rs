// src/drivers/mod.rs
// 声明同级目录下的子模块文件
pub mod buffer;
pub mod error;
pub mod fft;
pub mod live;
pub mod pipeline;
pub mod playback;
pub mod smoothing;
pub mod source;
pub mod transport;
// 公开导出这些模块里的结构体，方便外部调用
pub use buffer::{BufferConfig, BufferEvent, BufferMetrics, Cursor, Gap, SampleBuffer, TimeSeriesFrame};
pub use error::{SignalError, SignalResult};
pub use fft::{FrequencySpectrum, SpectrumBuilder};
pub use live::{LiveConfig, LiveSource};
pub use pipeline::{spawn_analysis, window_series, AnalysisEvent, AnalysisHandle, AnalyzerConfig, SpectralAnalyzer, TrendReset};
pub use playback::{PlaybackConfig, PlaybackSource};
pub use smoothing::{Smoother, SmoothingConfig, SmoothingMode, TrendTracker};
pub use source::{open_source, CloseHandle, ManualSource, SessionId, SourceConfig, StreamSource};
pub use transport::{publish, MemoryTransport, Origin, Outlet, Publisher, StreamAdvert, StreamQuery, Transport};

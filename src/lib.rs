//! Band power streaming and comparison for multi-channel EEG headsets.
//!
//! A [`drivers::StreamSource`] (live or playback) feeds one
//! [`drivers::SampleBuffer`] through an [`acquisition::Acquisition`] thread.
//! Any number of analyzers and a [`recorder::Recorder`] read the buffer
//! through private cursors. Finished recordings are compared offline with
//! [`compare::compare`].
pub mod acquisition;
pub mod clock;
pub mod compare;
pub mod config;
pub mod drivers;
pub mod recorder;
pub mod stats;
pub mod storage;
pub mod synth;
pub mod types;

//! # Pull-Source Interface
//!
//! The seam between the engine and whatever delivers samples (an LSL inlet,
//! a vendor SDK, a replay file, a test fixture). The engine only ever:
//!
//! 1. resolves a named stream with a timeout ([`SourceResolver::resolve`]),
//! 2. reads its metadata once,
//! 3. pulls timestamped chunks without blocking,
//! 4. closes it.
//!
//! Implementations live outside this crate; tests use a scripted mock.

use std::time::Duration;

use crate::error::EngineResult;

/// Stream metadata discovered at connect time.
#[derive(Debug, Clone)]
pub struct SourceMetadata {
    /// Number of channels per sample.
    pub channel_count: usize,
    /// Channel labels in stream order (e.g. `["TP9", "AF7", "AF8", "TP10"]`).
    pub channel_labels: Vec<String>,
    /// Nominal sample rate in Hz.
    pub nominal_rate: f64,
}

/// A batch of samples pulled from a source.
///
/// `samples[i]` is one sample of `channel_count` values and pairs with
/// `timestamps[i]`. An empty chunk means no data was available.
#[derive(Debug, Clone, Default)]
pub struct SampleChunk {
    pub samples: Vec<Vec<f64>>,
    pub timestamps: Vec<f64>,
}

impl SampleChunk {
    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }
}

/// A connected sample stream. Pulls must not block: when no data is queued
/// the source returns an empty chunk immediately.
pub trait SampleSource: Send {
    /// Stream metadata (stable for the lifetime of the connection).
    fn metadata(&self) -> SourceMetadata;

    /// Pull up to `max_samples` queued samples without blocking.
    fn pull_chunk(&mut self, max_samples: usize) -> EngineResult<SampleChunk>;

    /// Release the underlying stream. Called once on ingest stop.
    fn close(&mut self);
}

/// Resolves stream names to connected sources.
pub trait SourceResolver: Send + Sync {
    /// Resolve a stream by name, waiting up to `timeout` for it to appear.
    ///
    /// Returns [`EngineError::SourceUnavailable`](crate::error::EngineError::SourceUnavailable)
    /// if the stream does not show up in time.
    fn resolve(&self, stream_name: &str, timeout: Duration) -> EngineResult<Box<dyn SampleSource>>;
}

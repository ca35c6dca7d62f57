//! # Error Types
//!
//! Semantic error types for the neurofeedback engine. Every variant carries
//! enough context to diagnose the problem without digging through logs.
//!
//! The live processing path is lossy by design: a device that cannot produce
//! a frame this tick is skipped, not retried. Those conditions
//! ([`EngineError::InsufficientData`], [`EngineError::MissingChannel`]) are
//! modeled as errors so callers can observe them, but the orchestrator treats
//! them as skip signals rather than failures.

use thiserror::Error;

/// Convenient Result alias for engine operations.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// All errors that can occur inside the neurofeedback engine.
#[derive(Error, Debug)]
pub enum EngineError {
    // ─── Sources ────────────────────────────────────────────────────

    /// The named sample stream could not be resolved within the timeout.
    #[error("Stream '{name}' not found within {timeout_secs}s. Is the device streaming?")]
    SourceUnavailable { name: String, timeout_secs: u64 },

    /// A single chunk pull failed; the ingest loop continues after backoff.
    #[error("Transient pull failure on '{device}': {reason}")]
    IngestTransient { device: String, reason: String },

    /// The source died or failed repeatedly; the ingestor has stopped.
    #[error("Ingest for '{device}' failed permanently after {consecutive_failures} consecutive errors")]
    IngestFatal {
        device: String,
        consecutive_failures: u32,
    },

    // ─── Devices ────────────────────────────────────────────────────

    /// A device with this stream name is already connected.
    #[error("Device '{device}' is already connected")]
    DeviceAlreadyConnected { device: String },

    /// No connected device with this stream name.
    #[error("Device '{device}' is not connected")]
    DeviceNotConnected { device: String },

    // ─── Compute ────────────────────────────────────────────────────

    /// A device buffer has not filled enough for a stable window.
    /// The compute tick skips the device; this is not a caller-facing failure.
    #[error("Device '{device}' has insufficient buffered data ({available} of {required} samples)")]
    InsufficientData {
        device: String,
        available: usize,
        required: usize,
    },

    /// A required frontal channel is absent from the device's stream.
    #[error("Device '{device}' is missing required channel '{channel}'")]
    MissingChannel { device: String, channel: String },

    /// A compute-tick iteration overran its wall-time budget.
    #[error("Compute tick took {elapsed_ms:.1}ms (budget {budget_ms}ms)")]
    BudgetExceeded { elapsed_ms: f64, budget_ms: u64 },

    // ─── Sessions ───────────────────────────────────────────────────

    /// `session_start` while a session is active, or `session_stop` while idle.
    #[error("Session conflict: {reason}")]
    SessionConflict { reason: String },

    /// The named protocol does not exist in the protocol library.
    #[error("Unknown protocol '{name}'")]
    UnknownProtocol { name: String },

    /// Protocol validation failed (bad phase durations, device bounds, ...).
    #[error("Invalid protocol '{name}': {reason}")]
    InvalidProtocol { name: String, reason: String },

    // ─── Recording ──────────────────────────────────────────────────

    /// Filesystem error while flushing or finalizing a recording.
    /// The recorder stays started; the affected device is marked degraded
    /// and the batch is retried on the next flush.
    #[error("Recorder I/O error for '{device}': {reason}")]
    RecorderIo { device: String, reason: String },

    /// `Recorder::start` while a recording is already active.
    #[error("Recording already active for session '{session_id}'")]
    RecordingActive { session_id: String },

    /// Recorder operation that requires an active recording.
    #[error("No active recording")]
    RecordingInactive,

    // ─── Config ─────────────────────────────────────────────────────

    /// Configuration error (missing file, malformed values, bad env vars).
    #[error("Configuration error: {reason}")]
    ConfigError { reason: String },

    // ─── I/O ────────────────────────────────────────────────────────

    /// Filesystem or I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV writer error.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl EngineError {
    /// Returns `true` if this error is transient: the producing loop keeps
    /// running and the condition is expected to clear on its own.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::IngestTransient { .. }
                | EngineError::InsufficientData { .. }
                | EngineError::BudgetExceeded { .. }
        )
    }

    /// Returns `true` if this error means the device's data path is dead
    /// and the orchestrator should remove the device.
    pub fn is_device_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::IngestFatal { .. } | EngineError::SourceUnavailable { .. }
        )
    }
}

#[cfg(feature = "config-toml")]
impl From<toml::de::Error> for EngineError {
    fn from(err: toml::de::Error) -> Self {
        EngineError::ConfigError {
            reason: err.to_string(),
        }
    }
}

//! # Configuration
//!
//! [`EngineConfig`] holds everything needed to run the processing pipeline.
//!
//! ## Loading Priority
//!
//! Configuration is loaded from the first source that provides a value:
//!
//! 1. Explicit struct fields (programmatic construction)
//! 2. Environment variables (`NEUROLOOP_SAMPLE_RATE`, `NEUROLOOP_DATA_DIR`, ...)
//! 3. TOML config file at an explicit path
//! 4. `./neuroloop.toml` in the current directory
//!
//! Individual fields can always be overridden by environment variables,
//! even when loading from a file.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{EngineError, EngineResult};

/// Default EEG sample rate in Hz (Muse S streams at 256 Hz).
pub const DEFAULT_SAMPLE_RATE: f64 = 256.0;

/// Default rolling window in seconds (the longest analysis timescale).
pub const DEFAULT_WINDOW_SECS: f64 = 4.0;

/// Default number of FFT worker threads.
const DEFAULT_FFT_WORKERS: usize = 4;

/// Default compute tick rate in Hz.
const DEFAULT_COMPUTE_RATE_HZ: f64 = 10.0;

/// Default publish tick rate in Hz.
const DEFAULT_PUBLISH_RATE_HZ: f64 = 10.0;

/// Default ingest loop rate in Hz.
const DEFAULT_INGEST_RATE_HZ: f64 = 20.0;

/// Default stream resolve timeout in seconds.
const DEFAULT_RESOLVE_TIMEOUT_SECS: u64 = 10;

/// Default consecutive pull failures before an ingestor gives up.
const DEFAULT_MAX_CONSECUTIVE_PULL_FAILURES: u32 = 10;

/// Default recorder batch size in samples (~1 s at 256 Hz).
const DEFAULT_RECORDER_BATCH: usize = 256;

/// Default base directory for session recordings.
const DEFAULT_DATA_DIR: &str = "./data/sessions";

/// Default data age after which a device's published frame is evicted, in ms.
const DEFAULT_STALE_AFTER_MS: u64 = 5_000;

/// Buffer fill ratio required before a device participates in compute ticks.
pub const READY_FILL_RATIO: f64 = 0.9;

/// Configuration for the neurofeedback engine.
///
/// # Examples
///
/// ```
/// use neuroloop_engine::config::EngineConfig;
///
/// let config = EngineConfig::default();
/// assert_eq!(config.sample_rate, 256.0);
/// assert_eq!(config.frontal_channels, ["AF7", "AF8"]);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Nominal EEG sample rate in Hz. Devices reporting a different rate
    /// use their own rate for buffer sizing; this is the planning default.
    #[serde(default = "default_sample_rate")]
    pub sample_rate: f64,

    /// Rolling buffer window in seconds (must cover the longest timescale).
    #[serde(default = "default_window_secs")]
    pub window_secs: f64,

    /// Number of worker threads in the feature-extraction pool.
    #[serde(default = "default_fft_workers")]
    pub fft_workers: usize,

    /// The two frontal channels used for the relaxation metric.
    #[serde(default = "default_frontal_channels")]
    pub frontal_channels: [String; 2],

    /// Base directory where session recordings are written.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Loop timing configuration.
    #[serde(default)]
    pub timing: TimingConfig,

    /// Recorder configuration.
    #[serde(default)]
    pub recorder: RecorderConfig,

    /// Frequency band table.
    #[serde(default)]
    pub bands: BandTable,
}

/// Rates and timeouts for the three independent loops.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Ingest loop rate in Hz.
    #[serde(default = "default_ingest_rate")]
    pub ingest_rate_hz: f64,

    /// Compute tick rate in Hz.
    #[serde(default = "default_compute_rate")]
    pub compute_rate_hz: f64,

    /// Publish tick rate in Hz.
    #[serde(default = "default_publish_rate")]
    pub publish_rate_hz: f64,

    /// Timeout for resolving a named stream, in seconds.
    #[serde(default = "default_resolve_timeout")]
    pub resolve_timeout_secs: u64,

    /// Consecutive pull failures before an ingestor marks itself dead.
    #[serde(default = "default_max_pull_failures")]
    pub max_consecutive_pull_failures: u32,

    /// Data age beyond which a device's published frame is evicted, in ms.
    #[serde(default = "default_stale_after")]
    pub stale_after_ms: u64,
}

/// Recorder batching configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecorderConfig {
    /// Samples buffered per device before a flush to disk.
    #[serde(default = "default_recorder_batch")]
    pub batch_size: usize,
}

/// EEG frequency band boundaries in Hz. Each band covers `lo <= f < hi`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BandTable {
    pub delta: (f64, f64),
    pub theta: (f64, f64),
    pub alpha: (f64, f64),
    pub beta: (f64, f64),
    pub gamma: (f64, f64),
}

// ─── Defaults ───────────────────────────────────────────────────────────

fn default_sample_rate() -> f64 {
    DEFAULT_SAMPLE_RATE
}

fn default_window_secs() -> f64 {
    DEFAULT_WINDOW_SECS
}

fn default_fft_workers() -> usize {
    DEFAULT_FFT_WORKERS
}

fn default_frontal_channels() -> [String; 2] {
    ["AF7".to_string(), "AF8".to_string()]
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(DEFAULT_DATA_DIR)
}

fn default_ingest_rate() -> f64 {
    DEFAULT_INGEST_RATE_HZ
}

fn default_compute_rate() -> f64 {
    DEFAULT_COMPUTE_RATE_HZ
}

fn default_publish_rate() -> f64 {
    DEFAULT_PUBLISH_RATE_HZ
}

fn default_resolve_timeout() -> u64 {
    DEFAULT_RESOLVE_TIMEOUT_SECS
}

fn default_max_pull_failures() -> u32 {
    DEFAULT_MAX_CONSECUTIVE_PULL_FAILURES
}

fn default_stale_after() -> u64 {
    DEFAULT_STALE_AFTER_MS
}

fn default_recorder_batch() -> usize {
    DEFAULT_RECORDER_BATCH
}

// ─── Default impls ──────────────────────────────────────────────────────

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            window_secs: DEFAULT_WINDOW_SECS,
            fft_workers: DEFAULT_FFT_WORKERS,
            frontal_channels: default_frontal_channels(),
            data_dir: default_data_dir(),
            timing: TimingConfig::default(),
            recorder: RecorderConfig::default(),
            bands: BandTable::default(),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            ingest_rate_hz: DEFAULT_INGEST_RATE_HZ,
            compute_rate_hz: DEFAULT_COMPUTE_RATE_HZ,
            publish_rate_hz: DEFAULT_PUBLISH_RATE_HZ,
            resolve_timeout_secs: DEFAULT_RESOLVE_TIMEOUT_SECS,
            max_consecutive_pull_failures: DEFAULT_MAX_CONSECUTIVE_PULL_FAILURES,
            stale_after_ms: DEFAULT_STALE_AFTER_MS,
        }
    }
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_RECORDER_BATCH,
        }
    }
}

impl Default for BandTable {
    fn default() -> Self {
        Self {
            delta: (0.5, 4.0),
            theta: (4.0, 8.0),
            alpha: (8.0, 13.0),
            beta: (13.0, 30.0),
            gamma: (30.0, 50.0),
        }
    }
}

// ─── EngineConfig impl ──────────────────────────────────────────────────

impl EngineConfig {
    /// Load config from environment variables, starting from defaults.
    ///
    /// Recognized: `NEUROLOOP_SAMPLE_RATE`, `NEUROLOOP_DATA_DIR`,
    /// `NEUROLOOP_FFT_WORKERS`, `NEUROLOOP_COMPUTE_RATE_HZ`.
    pub fn from_env() -> EngineResult<Self> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Load config from a TOML file, with environment variable overrides.
    #[cfg(feature = "config-toml")]
    pub fn from_file(path: impl AsRef<std::path::Path>) -> EngineResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| EngineError::ConfigError {
            reason: format!("Failed to read config file '{}': {}", path.display(), e),
        })?;
        let mut config: Self = toml::from_str(&contents)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Discover and load config from the standard search path:
    ///
    /// 1. Explicit path (if `Some`)
    /// 2. `NEUROLOOP_CONFIG` environment variable
    /// 3. `./neuroloop.toml`
    ///
    /// Falls back to environment-variable-only config if no file is found.
    #[cfg(feature = "config-toml")]
    pub fn discover(explicit_path: Option<&std::path::Path>) -> EngineResult<Self> {
        if let Some(path) = explicit_path {
            return Self::from_file(path);
        }

        if let Ok(path) = std::env::var("NEUROLOOP_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Self::from_file(&path);
            }
        }

        let local_path = PathBuf::from("neuroloop.toml");
        if local_path.exists() {
            return Self::from_file(&local_path);
        }

        Self::from_env()
    }

    fn apply_env_overrides(&mut self) -> EngineResult<()> {
        if let Ok(rate) = std::env::var("NEUROLOOP_SAMPLE_RATE") {
            self.sample_rate = rate.parse().map_err(|_| EngineError::ConfigError {
                reason: format!("NEUROLOOP_SAMPLE_RATE is not a number: '{rate}'"),
            })?;
        }
        if let Ok(dir) = std::env::var("NEUROLOOP_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Ok(workers) = std::env::var("NEUROLOOP_FFT_WORKERS") {
            self.fft_workers = workers.parse().map_err(|_| EngineError::ConfigError {
                reason: format!("NEUROLOOP_FFT_WORKERS is not an integer: '{workers}'"),
            })?;
        }
        if let Ok(rate) = std::env::var("NEUROLOOP_COMPUTE_RATE_HZ") {
            self.timing.compute_rate_hz = rate.parse().map_err(|_| EngineError::ConfigError {
                reason: format!("NEUROLOOP_COMPUTE_RATE_HZ is not a number: '{rate}'"),
            })?;
        }
        Ok(())
    }

    /// Sanity-check field combinations that would break the pipeline.
    pub fn validate(&self) -> EngineResult<()> {
        if self.sample_rate <= 0.0 {
            return Err(EngineError::ConfigError {
                reason: format!("sample_rate must be positive, got {}", self.sample_rate),
            });
        }
        if self.window_secs <= 0.0 {
            return Err(EngineError::ConfigError {
                reason: format!("window_secs must be positive, got {}", self.window_secs),
            });
        }
        if self.fft_workers == 0 {
            return Err(EngineError::ConfigError {
                reason: "fft_workers must be at least 1".into(),
            });
        }
        if self.timing.compute_rate_hz <= 0.0
            || self.timing.publish_rate_hz <= 0.0
            || self.timing.ingest_rate_hz <= 0.0
        {
            return Err(EngineError::ConfigError {
                reason: "loop rates must be positive".into(),
            });
        }
        Ok(())
    }

    /// Rolling ring capacity in samples for a device at `device_rate` Hz.
    pub fn ring_capacity(&self, device_rate: f64) -> usize {
        (self.window_secs * device_rate).floor().max(1.0) as usize
    }
}

impl BandTable {
    /// Bands in canonical order with their names.
    pub fn named(&self) -> [(&'static str, (f64, f64)); 5] {
        [
            ("delta", self.delta),
            ("theta", self.theta),
            ("alpha", self.alpha),
            ("beta", self.beta),
            ("gamma", self.gamma),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.sample_rate, 256.0);
        assert_eq!(config.window_secs, 4.0);
        assert_eq!(config.fft_workers, 4);
        assert_eq!(config.timing.ingest_rate_hz, 20.0);
        assert_eq!(config.timing.compute_rate_hz, 10.0);
        assert_eq!(config.timing.publish_rate_hz, 10.0);
        assert_eq!(config.recorder.batch_size, 256);
        assert_eq!(config.bands.alpha, (8.0, 13.0));
        assert_eq!(config.bands.gamma, (30.0, 50.0));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_ring_capacity() {
        let config = EngineConfig::default();
        assert_eq!(config.ring_capacity(256.0), 1024);
        assert_eq!(config.ring_capacity(128.0), 512);
        // Degenerate rates never produce a zero-capacity ring
        assert_eq!(config.ring_capacity(0.1), 1);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = EngineConfig::default();
        config.sample_rate = 0.0;
        assert!(matches!(
            config.validate(),
            Err(EngineError::ConfigError { .. })
        ));

        let mut config = EngineConfig::default();
        config.fft_workers = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.timing.compute_rate_hz = -1.0;
        assert!(config.validate().is_err());
    }

    #[cfg(feature = "config-toml")]
    #[test]
    fn test_deserialize_toml() {
        let toml_str = r#"
            sample_rate = 128.0
            fft_workers = 2
            frontal_channels = ["Fp1", "Fp2"]

            [timing]
            compute_rate_hz = 5.0
            stale_after_ms = 2000

            [recorder]
            batch_size = 128

            [bands]
            delta = [0.5, 4.0]
            theta = [4.0, 8.0]
            alpha = [8.0, 12.0]
            beta = [12.0, 30.0]
            gamma = [30.0, 45.0]
        "#;

        let config: EngineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.sample_rate, 128.0);
        assert_eq!(config.fft_workers, 2);
        assert_eq!(config.frontal_channels, ["Fp1", "Fp2"]);
        assert_eq!(config.timing.compute_rate_hz, 5.0);
        // Unspecified timing fields fall back to defaults
        assert_eq!(config.timing.publish_rate_hz, 10.0);
        assert_eq!(config.timing.stale_after_ms, 2000);
        assert_eq!(config.recorder.batch_size, 128);
        assert_eq!(config.bands.alpha, (8.0, 12.0));
    }

    #[test]
    fn test_band_table_named_order() {
        let bands = BandTable::default();
        let named = bands.named();
        assert_eq!(named[0].0, "delta");
        assert_eq!(named[4].0, "gamma");
        // Bands tile [0.5, 50) with no gaps
        for pair in named.windows(2) {
            assert_eq!(pair[0].1.1, pair[1].1.0);
        }
    }
}

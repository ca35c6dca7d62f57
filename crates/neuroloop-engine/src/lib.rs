//! # neuroloop-engine
//!
//! A real-time, multi-device EEG neurofeedback engine.
//!
//! The engine ingests continuous sample streams from up to four wearable
//! headbands, keeps per-device rolling windows, computes band-power features
//! at three timescales (1 s / 2 s / 4 s) on a strict 10 Hz schedule, and
//! publishes the resulting feedback frames to subscribers at 10 Hz.
//!
//! ## Quick Start
//!
//! ```ignore
//! use neuroloop_engine::{EngineConfig, FeedbackEngine};
//!
//! #[tokio::main]
//! async fn main() -> neuroloop_engine::EngineResult<()> {
//!     let config = EngineConfig::discover(None)?;
//!     let engine = FeedbackEngine::new(config, Box::new(my_lsl_resolver()))?;
//!
//!     engine.start();             // 10 Hz compute thread
//!     engine.start_publisher();   // 10 Hz publish task on this runtime
//!
//!     engine.device_connect("muse-1")?;
//!
//!     let mut feed = engine.subscribe_feedback();
//!     let session = engine.session_start(
//!         "Meditation Baseline",
//!         [("muse-1".into(), "P001".into())].into(),
//!         "first session",
//!         "dr-a",
//!     )?;
//!
//!     while let Ok(frames) = feed.recv().await {
//!         println!("{frames}");
//!     }
//!
//!     engine.session_stop()?;
//!     engine.shutdown();
//!     let _ = session;
//!     Ok(())
//! }
//! ```
//!
//! ## Three Independent Rates
//!
//! | Loop | Rate | World | Why |
//! |------|------|-------|-----|
//! | Ingest (per device) | 20 Hz | OS thread | the pull source is blocking |
//! | Compute | 10 Hz | OS thread + worker pool | CPU-bound FFTs |
//! | Publish | 10 Hz | tokio task | cooperative fan-out |
//!
//! The loops never block each other: ingest writes mutex-protected buffers,
//! compute reads buffer snapshots and writes a latest-frame slot, publish
//! reads slot snapshots. The slot replaces rather than queues — for
//! neurofeedback a stale frame has no value.
//!
//! ## Live vs. recorded data
//!
//! The live path is lossy by design (an unready device is skipped, not
//! awaited). The recording path is lossless: every pulled batch lands in an
//! unbounded per-device log and, during a session, in per-device CSV files
//! with fsync'd batch flushes.

pub mod buffers;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod features;
pub mod ingest;
pub mod metrics;
pub mod quality;
pub mod rate;
pub mod recorder;
pub mod session;
pub mod source;
pub mod spectral;
pub mod streams;

// ─── Public re-exports ──────────────────────────────────────────────────

pub use buffers::{BufferState, DeviceBuffers};
pub use config::EngineConfig;
pub use engine::{DeviceDiagnostics, EngineHealth, FeedbackEngine};
pub use error::{EngineError, EngineResult};
pub use features::MultiScaleProcessor;
pub use ingest::StreamIngestor;
pub use metrics::{FeatureFrame, Timescale, TimescaleMetrics, Trend, WireFrame};
pub use rate::{LatestFrames, PerfStats, RateController};
pub use recorder::{RecordingInfo, SessionRecorder};
pub use session::{Protocol, ProtocolPhase, SessionManager, SessionStatus};
pub use source::{SampleChunk, SampleSource, SourceMetadata, SourceResolver};
pub use spectral::{BandPowers, SpectralKernel};
pub use streams::FeedbackStream;

//! # Engine Facade
//!
//! [`FeedbackEngine`] owns the whole pipeline: one ingestor per connected
//! device, the shared feature processor and its worker pool, the session
//! recorder, the session manager, and the rate controller. External
//! controllers (an HTTP/WebSocket layer, a CLI, tests) drive it through the
//! idempotent, synchronous request surface and subscribe to feedback via
//! the broadcast channel or the typed [`FeedbackStream`].
//!
//! ## Teardown ordering
//!
//! [`shutdown`](FeedbackEngine::shutdown) stops the pipeline back-to-front
//! so nothing reads from a torn-down stage: publish task → compute thread →
//! ingest threads → recorder flush/close.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::features::MultiScaleProcessor;
use crate::ingest::StreamIngestor;
use crate::metrics::FeatureFrame;
use crate::rate::{PerfStats, RateController};
use crate::recorder::{RecorderStatus, RecordingInfo, SessionRecorder};
use crate::session::{Protocol, ProtocolSummary, SessionManager, SessionStatus};
use crate::source::SourceResolver;
use crate::spectral::SpectralKernel;
use crate::streams::FeedbackStream;

/// Aggregate health snapshot for the request surface.
#[derive(Debug, Clone, Serialize)]
pub struct EngineHealth {
    pub feedback_subscribers: usize,
    pub connected_devices: Vec<String>,
    pub session_active: bool,
    pub performance: PerfStats,
}

/// Diagnostic snapshot for one connected device.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceDiagnostics {
    pub stream_name: String,
    pub sample_rate: f64,
    pub channel_labels: Vec<String>,
    pub fill_ratio: f64,
    pub latest_age_ms: Option<f64>,
    pub running: bool,
    pub healthy: bool,
    /// Samples discarded by the startup flush.
    pub flushed_samples: u64,
}

/// The top-level neurofeedback engine.
pub struct FeedbackEngine {
    config: EngineConfig,
    resolver: Box<dyn SourceResolver>,
    recorder: Arc<SessionRecorder>,
    session: Arc<SessionManager>,
    rate: Arc<RateController>,
    shut_down: AtomicBool,
}

impl FeedbackEngine {
    /// Build the engine. Validates the config and allocates the worker
    /// pool, but starts no loops — see [`start`](Self::start).
    pub fn new(config: EngineConfig, resolver: Box<dyn SourceResolver>) -> EngineResult<Self> {
        config.validate()?;

        let kernel = Arc::new(SpectralKernel::new(
            config.sample_rate,
            config.bands.clone(),
        ));
        let processor = Arc::new(MultiScaleProcessor::new(
            kernel,
            config.frontal_channels.clone(),
            config.fft_workers,
        )?);
        let recorder = Arc::new(SessionRecorder::new(
            config.data_dir.clone(),
            config.recorder.batch_size,
        ));
        let session = Arc::new(SessionManager::new());
        let rate = Arc::new(RateController::new(
            processor,
            Arc::clone(&session),
            Arc::clone(&recorder),
            &config,
        ));

        Ok(Self {
            config,
            resolver,
            recorder,
            session,
            rate,
            shut_down: AtomicBool::new(false),
        })
    }

    /// Start the compute thread. Call once after construction; devices can
    /// connect before or after.
    pub fn start(&self) {
        self.rate.start_compute();
    }

    /// Spawn the publish task on the current tokio runtime.
    pub fn start_publisher(&self) {
        self.rate.spawn_publisher();
    }

    // ─── Devices ────────────────────────────────────────────────────

    /// Resolve and start ingesting the named stream.
    ///
    /// Performs the startup flush before any sample reaches the buffers,
    /// so the first feedback reflects the user's state now rather than
    /// the source's queued backlog.
    pub fn device_connect(&self, stream_name: &str) -> EngineResult<()> {
        if self.rate.device(stream_name).is_some() {
            return Err(EngineError::DeviceAlreadyConnected {
                device: stream_name.to_string(),
            });
        }

        let ingestor = StreamIngestor::start(
            stream_name,
            self.resolver.as_ref(),
            Arc::clone(&self.recorder),
            &self.config,
        )?;
        self.rate.insert_device(Arc::new(ingestor));
        Ok(())
    }

    /// Stop ingesting the named stream and drop its published frame.
    pub fn device_disconnect(&self, stream_name: &str) -> EngineResult<()> {
        let ingestor =
            self.rate
                .remove_device(stream_name)
                .ok_or_else(|| EngineError::DeviceNotConnected {
                    device: stream_name.to_string(),
                })?;
        ingestor.stop();
        Ok(())
    }

    /// Names of currently connected devices, sorted.
    pub fn connected_devices(&self) -> Vec<String> {
        self.rate.device_names()
    }

    /// Diagnostics for one connected device.
    pub fn device_diagnostics(&self, stream_name: &str) -> Option<DeviceDiagnostics> {
        let ingestor = self.rate.device(stream_name)?;
        Some(DeviceDiagnostics {
            stream_name: ingestor.stream_name().to_string(),
            sample_rate: ingestor.sample_rate(),
            channel_labels: ingestor.channel_labels().to_vec(),
            fill_ratio: ingestor.fill_ratio(),
            latest_age_ms: ingestor.latest_age_ms(),
            running: ingestor.is_running(),
            healthy: ingestor.is_healthy(),
            flushed_samples: ingestor.flushed_samples(),
        })
    }

    // ─── Sessions ───────────────────────────────────────────────────

    /// Start a session and its recording. Returns the session id.
    ///
    /// Recording failure does not abort the session: live feedback is more
    /// valuable than persistence, so the failure is logged and the session
    /// continues unrecorded.
    pub fn session_start(
        &self,
        protocol: &str,
        subject_ids: HashMap<String, String>,
        notes: &str,
        experimenter: &str,
    ) -> EngineResult<String> {
        let connected = self.rate.device_names();
        let session_id = self.session.start_session(
            protocol,
            subject_ids.clone(),
            notes,
            experimenter,
            &connected,
        )?;

        let channel_labels: HashMap<String, Vec<String>> = subject_ids
            .keys()
            .filter_map(|device| {
                self.rate
                    .device(device)
                    .map(|ing| (device.clone(), ing.channel_labels().to_vec()))
            })
            .collect();
        let protocol_name = self
            .session
            .get_protocol(protocol)
            .map_or_else(|| protocol.to_string(), |p| p.name);
        let info = RecordingInfo {
            protocol: protocol_name,
            notes: notes.to_string(),
            experimenter: experimenter.to_string(),
        };

        if let Err(e) = self
            .recorder
            .start(&session_id, &subject_ids, &channel_labels, &info)
        {
            tracing::warn!(
                session_id = %session_id,
                error = %e,
                "Recording could not start; session continues without persistence"
            );
        }

        Ok(session_id)
    }

    /// Stop the active session and finalize its recording.
    ///
    /// Returns the written CSV path per device (empty when the session ran
    /// without recording).
    pub fn session_stop(&self) -> EngineResult<HashMap<String, PathBuf>> {
        self.session.stop_session()?;
        match self.recorder.stop() {
            Ok(paths) => Ok(paths),
            Err(EngineError::RecordingInactive) => Ok(HashMap::new()),
            Err(e) => Err(e),
        }
    }

    pub fn session_status(&self) -> SessionStatus {
        self.session.status()
    }

    pub fn list_protocols(&self) -> Vec<ProtocolSummary> {
        self.session.list_protocols()
    }

    pub fn add_protocol(&self, protocol: Protocol) -> EngineResult<()> {
        self.session.add_protocol(protocol)
    }

    pub fn pause_session(&self) -> EngineResult<()> {
        self.session.pause_session()
    }

    pub fn resume_session(&self) -> EngineResult<()> {
        self.session.resume_session()
    }

    // ─── Observability ──────────────────────────────────────────────

    pub fn health(&self) -> EngineHealth {
        EngineHealth {
            feedback_subscribers: self.rate.feedback_subscribers(),
            connected_devices: self.rate.device_names(),
            session_active: self.session.is_active(),
            performance: self.rate.performance_stats(),
        }
    }

    pub fn performance_stats(&self) -> PerfStats {
        self.rate.performance_stats()
    }

    pub fn recorder_status(&self) -> RecorderStatus {
        self.recorder.status()
    }

    /// Latest computed frame per device (full precision, pre-wire).
    pub fn latest_frames(&self) -> HashMap<String, FeatureFrame> {
        self.rate.latest_frames().snapshot()
    }

    /// Subscribe to the raw wire JSON feed.
    pub fn subscribe_feedback(&self) -> tokio::sync::broadcast::Receiver<String> {
        self.rate.subscribe_feedback()
    }

    /// Subscribe to the typed feedback feed. Requires a tokio runtime.
    pub fn feedback_stream(&self) -> FeedbackStream {
        FeedbackStream::new(self.rate.subscribe_feedback())
    }

    // ─── Teardown ───────────────────────────────────────────────────

    /// Stop everything in dependency order. Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Engine shutting down");

        // 1. Publisher first: nothing downstream reads the slot after this.
        self.rate.stop_publisher();
        // 2. Compute: stops producing frames.
        self.rate.stop_compute();
        // 3. Ingestors: stop filling buffers.
        for name in self.rate.device_names() {
            if let Some(ingestor) = self.rate.remove_device(&name) {
                ingestor.stop();
            }
        }
        // 4. Recorder last: flush whatever the ingest threads handed over.
        if self.session.is_active() {
            let _ = self.session.stop_session();
        }
        if self.recorder.is_recording() {
            match self.recorder.stop() {
                Ok(paths) => tracing::info!(files = paths.len(), "Recording finalized"),
                Err(e) => tracing::error!(error = %e, "Recorder did not finalize cleanly"),
            }
        }

        tracing::info!("Engine shutdown complete");
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

impl Drop for FeedbackEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

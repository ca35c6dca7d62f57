//! # Rate Control
//!
//! The orchestrator of the three independent rates:
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │ INGEST THREADS (20 Hz, one per device)                     │
//! │   blocking pulls → DeviceBuffers (mutex-protected)         │
//! └────────────────────────────────────────────────────────────┘
//!               ↓ buffer snapshots
//! ┌────────────────────────────────────────────────────────────┐
//! │ COMPUTE THREAD (10 Hz)                                     │
//! │   ready devices → 4 s windows → MultiScaleProcessor        │
//! │   → FeatureFrames → LatestFrames slot                      │
//! └────────────────────────────────────────────────────────────┘
//!               ↓ slot snapshots
//! ┌────────────────────────────────────────────────────────────┐
//! │ PUBLISH TASK (10 Hz, tokio)                                │
//! │   phase cursor → wire frames → broadcast fan-out           │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! The slot is a map-with-replace, not a queue: stale frames have no value
//! for neurofeedback, so slow publishers never back-pressure compute and
//! slow compute just means the publisher re-sends the last known frame.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::broadcast;

use crate::clock::unix_now;
use crate::config::{EngineConfig, READY_FILL_RATIO};
use crate::error::EngineError;
use crate::features::{ChannelData, MultiScaleProcessor};
use crate::ingest::StreamIngestor;
use crate::metrics::{FeatureFrame, WireFrame};
use crate::recorder::SessionRecorder;
use crate::session::{PhaseTransition, SessionManager};

/// Entries kept in the compute-tick wall-time rolling statistic.
const PERF_WINDOW: usize = 100;

/// Capacity of the feedback broadcast channel. Subscribers that fall more
/// than this many frames behind observe a lag and skip forward.
const FEEDBACK_CHANNEL_CAPACITY: usize = 64;

/// Grace period for the compute thread to join on stop.
const COMPUTE_STOP_GRACE: Duration = Duration::from_secs(2);

/// Grace period for the publish task to wind down cooperatively.
const PUBLISH_STOP_GRACE: Duration = Duration::from_millis(500);

/// Compute-tick wall time statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PerfStats {
    pub calc_loop_avg_ms: f64,
    pub calc_loop_max_ms: f64,
    pub calc_loop_min_ms: f64,
    pub samples: usize,
}

/// The shared latest-frame slot between compute and publish.
///
/// Replacement is timestamp-guarded per device: a frame never replaces a
/// newer one, so publisher snapshots are monotonic per device even when
/// compute iterations reorder under load.
pub struct LatestFrames {
    inner: Mutex<HashMap<String, FeatureFrame>>,
}

impl Default for LatestFrames {
    fn default() -> Self {
        Self::new()
    }
}

impl LatestFrames {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Merge a tick's frames. Devices absent from `frames` keep their
    /// existing entry; older frames never replace newer ones.
    pub fn merge(&self, frames: HashMap<String, FeatureFrame>) {
        let mut inner = self.lock();
        for (device, frame) in frames {
            match inner.get(&device) {
                Some(existing) if existing.timestamp > frame.timestamp => {
                    tracing::debug!(device = %device, "Discarding out-of-order frame");
                }
                _ => {
                    inner.insert(device, frame);
                }
            }
        }
    }

    /// Consistent snapshot of every device's latest frame.
    pub fn snapshot(&self) -> HashMap<String, FeatureFrame> {
        self.lock().clone()
    }

    pub fn remove(&self, device: &str) -> Option<FeatureFrame> {
        self.lock().remove(device)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, FeatureFrame>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Owns the compute and publish ticks and the device registry.
pub struct RateController {
    devices: Mutex<HashMap<String, Arc<StreamIngestor>>>,
    processor: Arc<MultiScaleProcessor>,
    session: Arc<SessionManager>,
    recorder: Arc<SessionRecorder>,
    slot: Arc<LatestFrames>,
    feedback_tx: broadcast::Sender<String>,

    compute_running: Arc<AtomicBool>,
    compute_handle: Mutex<Option<std::thread::JoinHandle<()>>>,
    publish_running: Arc<AtomicBool>,
    publish_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,

    loop_times: Arc<Mutex<VecDeque<f64>>>,

    compute_period: Duration,
    publish_period: Duration,
    window_secs: f64,
    stale_after_ms: f64,
}

impl RateController {
    pub fn new(
        processor: Arc<MultiScaleProcessor>,
        session: Arc<SessionManager>,
        recorder: Arc<SessionRecorder>,
        config: &EngineConfig,
    ) -> Self {
        let (feedback_tx, _) = broadcast::channel(FEEDBACK_CHANNEL_CAPACITY);
        Self {
            devices: Mutex::new(HashMap::new()),
            processor,
            session,
            recorder,
            slot: Arc::new(LatestFrames::new()),
            feedback_tx,
            compute_running: Arc::new(AtomicBool::new(false)),
            compute_handle: Mutex::new(None),
            publish_running: Arc::new(AtomicBool::new(false)),
            publish_handle: Mutex::new(None),
            loop_times: Arc::new(Mutex::new(VecDeque::with_capacity(PERF_WINDOW))),
            compute_period: Duration::from_secs_f64(1.0 / config.timing.compute_rate_hz),
            publish_period: Duration::from_secs_f64(1.0 / config.timing.publish_rate_hz),
            window_secs: config.window_secs,
            stale_after_ms: config.timing.stale_after_ms as f64,
        }
    }

    // ─── Device registry ────────────────────────────────────────────

    pub fn insert_device(&self, ingestor: Arc<StreamIngestor>) {
        self.devices_lock()
            .insert(ingestor.stream_name().to_string(), ingestor);
    }

    pub fn remove_device(&self, device: &str) -> Option<Arc<StreamIngestor>> {
        self.slot.remove(device);
        self.devices_lock().remove(device)
    }

    pub fn device(&self, device: &str) -> Option<Arc<StreamIngestor>> {
        self.devices_lock().get(device).cloned()
    }

    pub fn device_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.devices_lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn latest_frames(&self) -> &Arc<LatestFrames> {
        &self.slot
    }

    /// Subscribe to published wire JSON messages.
    pub fn subscribe_feedback(&self) -> broadcast::Receiver<String> {
        self.feedback_tx.subscribe()
    }

    /// Current number of feedback subscribers.
    pub fn feedback_subscribers(&self) -> usize {
        self.feedback_tx.receiver_count()
    }

    // ─── Compute tick ───────────────────────────────────────────────

    /// Start the 10 Hz compute thread. Idempotent.
    pub fn start_compute(self: &Arc<Self>) {
        if self.compute_running.swap(true, Ordering::SeqCst) {
            tracing::warn!("Compute tick already running");
            return;
        }

        let controller = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("compute-tick".to_string())
            .spawn(move || controller.compute_loop());

        match handle {
            Ok(handle) => {
                *self
                    .compute_handle
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(handle);
                tracing::info!(
                    period_ms = self.compute_period.as_millis() as u64,
                    "Compute tick started"
                );
            }
            Err(e) => {
                self.compute_running.store(false, Ordering::SeqCst);
                tracing::error!(error = %e, "Failed to spawn compute thread");
            }
        }
    }

    /// Stop the compute thread, joining within its grace period.
    pub fn stop_compute(&self) {
        self.compute_running.store(false, Ordering::SeqCst);
        let handle = self
            .compute_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(handle) = handle else { return };

        let deadline = Instant::now() + COMPUTE_STOP_GRACE;
        while !handle.is_finished() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        if handle.is_finished() {
            let _ = handle.join();
            tracing::info!("Compute tick stopped");
        } else {
            tracing::warn!("Compute thread did not stop within grace period");
        }
    }

    fn compute_loop(&self) {
        let budget_ms = self.compute_period.as_secs_f64() * 1000.0;

        while self.compute_running.load(Ordering::SeqCst) {
            let started = Instant::now();
            self.compute_tick();

            let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
            self.record_loop_time(elapsed_ms);
            if elapsed_ms > budget_ms {
                let overrun = EngineError::BudgetExceeded {
                    elapsed_ms,
                    budget_ms: budget_ms as u64,
                };
                tracing::warn!(elapsed_ms, "{overrun}");
            }

            if let Some(remaining) = self.compute_period.checked_sub(started.elapsed()) {
                std::thread::sleep(remaining);
            }
        }
    }

    /// One compute iteration: gather ready devices, run the processor,
    /// merge frames, evict dead or stale entries.
    fn compute_tick(&self) {
        // Snapshot the registry without holding its lock through the FFTs.
        let devices: Vec<(String, Arc<StreamIngestor>)> = self
            .devices_lock()
            .iter()
            .map(|(name, ing)| (name.clone(), Arc::clone(ing)))
            .collect();

        let mut inputs: HashMap<String, ChannelData> = HashMap::new();
        let mut ready: HashMap<String, Arc<StreamIngestor>> = HashMap::new();
        for (name, ingestor) in devices {
            if !ingestor.is_running() {
                tracing::warn!(device = %name, "Ingestor died; removing device");
                self.remove_device(&name);
                continue;
            }
            if ingestor.fill_ratio() < READY_FILL_RATIO {
                tracing::trace!(device = %name, fill = ingestor.fill_ratio(), "Device not ready");
                continue;
            }
            let Some(window) = ingestor.snapshot(self.window_secs) else {
                continue;
            };
            inputs.insert(name.clone(), window);
            ready.insert(name, ingestor);
        }

        if !inputs.is_empty() {
            let results = self.processor.compute_multi_timescale(&inputs);
            let now = unix_now();

            let mut frames = HashMap::new();
            for (device, scales) in results {
                if !scales.is_complete() {
                    tracing::debug!(device = %device, "Partial timescale results; frame withheld");
                    continue;
                }
                let Some(ingestor) = ready.get(&device) else {
                    continue;
                };

                // Fill ratio stands in for per-channel signal quality until a
                // real estimator is wired in (see quality module).
                let fill = ingestor.fill_ratio();
                let signal_quality = ingestor
                    .channel_labels()
                    .iter()
                    .map(|label| (label.clone(), fill))
                    .collect();

                let trend = scales.relaxation_trend();
                frames.insert(
                    device.clone(),
                    FeatureFrame {
                        device,
                        scales,
                        trend,
                        data_age_ms: ingestor.latest_age_ms().unwrap_or(f64::INFINITY),
                        signal_quality,
                        timestamp: now,
                    },
                );
            }
            self.slot.merge(frames);
        }

        self.evict_stale();
    }

    /// Drop slot entries whose device is gone or whose data has gone stale.
    /// Healthy devices that merely skipped this tick keep their entry.
    fn evict_stale(&self) {
        for device in self.slot.snapshot().keys() {
            let age = self.device(device).and_then(|ing| ing.latest_age_ms());
            match age {
                None => {
                    tracing::warn!(device = %device, "Device gone; dropping published frame");
                    self.slot.remove(device);
                }
                Some(age_ms) if age_ms > self.stale_after_ms => {
                    tracing::warn!(device = %device, age_ms, "Device data stale; dropping published frame");
                    self.slot.remove(device);
                }
                Some(_) => {}
            }
        }
    }

    fn record_loop_time(&self, elapsed_ms: f64) {
        let mut times = self
            .loop_times
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if times.len() == PERF_WINDOW {
            times.pop_front();
        }
        times.push_back(elapsed_ms);
    }

    /// Rolling compute-tick statistics over the last 100 iterations.
    pub fn performance_stats(&self) -> PerfStats {
        let times = self
            .loop_times
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if times.is_empty() {
            return PerfStats::default();
        }
        let sum: f64 = times.iter().sum();
        PerfStats {
            calc_loop_avg_ms: sum / times.len() as f64,
            calc_loop_max_ms: times.iter().copied().fold(f64::MIN, f64::max),
            calc_loop_min_ms: times.iter().copied().fold(f64::MAX, f64::min),
            samples: times.len(),
        }
    }

    // ─── Publish tick ───────────────────────────────────────────────

    /// Spawn the 10 Hz publish task on the current tokio runtime.
    ///
    /// Frames are always published while feedback subscribers exist; when
    /// the session phase has feedback disabled the frames are annotated
    /// (`feedback_enabled: false`) rather than suppressed, so monitoring
    /// subscribers keep seeing quality data during baselines.
    pub fn spawn_publisher(self: &Arc<Self>) {
        if self.publish_running.swap(true, Ordering::SeqCst) {
            tracing::warn!("Publish task already running");
            return;
        }

        let controller = Arc::clone(self);
        let handle = tokio::spawn(async move { controller.publish_loop().await });
        *self
            .publish_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
        tracing::info!(
            period_ms = self.publish_period.as_millis() as u64,
            "Publish task started"
        );
    }

    /// Cooperatively stop the publish task, aborting after a grace period.
    pub fn stop_publisher(&self) {
        self.publish_running.store(false, Ordering::SeqCst);
        let handle = self
            .publish_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(handle) = handle else { return };

        let deadline = Instant::now() + PUBLISH_STOP_GRACE;
        while !handle.is_finished() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        if handle.is_finished() {
            tracing::info!("Publish task stopped");
        } else {
            handle.abort();
            tracing::warn!("Publish task aborted after grace period");
        }
    }

    async fn publish_loop(&self) {
        while self.publish_running.load(Ordering::SeqCst) {
            let started = Instant::now();

            // Drive the session phase cursor from the publisher's cadence;
            // a completed final phase finalizes the recording.
            if let PhaseTransition::Completed { session_id } = self.session.update_phase() {
                if self.recorder.is_recording() {
                    match self.recorder.stop() {
                        Ok(paths) => {
                            tracing::info!(session_id = %session_id, files = paths.len(), "Recording finalized on session completion");
                        }
                        Err(e) => {
                            tracing::error!(session_id = %session_id, error = %e, "Failed to finalize recording");
                        }
                    }
                }
            }

            let frames = self.slot.snapshot();
            let feedback_enabled = self.session.feedback_enabled();
            let mut wire: Vec<WireFrame> = frames
                .values()
                .map(|frame| frame.to_wire(feedback_enabled))
                .collect();
            wire.sort_by(|a, b| a.subject.cmp(&b.subject));

            match serde_json::to_string(&wire) {
                Ok(json) => {
                    // Send fails only when nobody is subscribed.
                    let _ = self.feedback_tx.send(json);
                }
                Err(e) => tracing::error!(error = %e, "Failed to serialize feedback frames"),
            }

            let remaining = self.publish_period.saturating_sub(started.elapsed());
            tokio::time::sleep(remaining).await;
        }
    }

    fn devices_lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<StreamIngestor>>> {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

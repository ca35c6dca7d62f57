//! # Stream Ingestor
//!
//! One ingestor per device. Wraps a blocking pull source in a dedicated OS
//! thread running at a nominal 20 Hz, appending pulled chunks atomically to
//! the device's rolling rings and recording log, and forwarding each batch
//! to the session recorder for the lossless path.
//!
//! ## Startup flush
//!
//! Pull sources queue samples from the moment the link comes up. Without a
//! flush, the first windows the compute tick sees would reflect the user's
//! state from several seconds before the session — useless for feedback.
//! So immediately after resolve, and before the loop starts appending, the
//! source's backlog is drained with zero-timeout pulls until it reports
//! empty. The discarded count is kept for diagnostics.
//!
//! ## Failure policy
//!
//! A single failed pull is logged and retried after a short backoff. After
//! `max_consecutive_pull_failures` consecutive errors the ingestor marks
//! itself unhealthy and stops; the orchestrator notices the dead ingestor on
//! its next tick and removes the device.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::buffers::DeviceBuffers;
use crate::config::EngineConfig;
use crate::error::EngineResult;
use crate::recorder::SessionRecorder;
use crate::source::{SampleSource, SourceResolver};

/// Maximum samples drained per flush pull.
const FLUSH_CHUNK: usize = 1000;

/// Backoff after a transient pull failure.
const PULL_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Grace period for the ingest thread to exit on `stop()`.
const STOP_GRACE: Duration = Duration::from_secs(2);

/// Dedicated ingest loop for a single device stream.
#[derive(Debug)]
pub struct StreamIngestor {
    stream_name: String,
    buffers: Arc<DeviceBuffers>,
    running: Arc<AtomicBool>,
    healthy: Arc<AtomicBool>,
    flushed_samples: u64,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl StreamIngestor {
    /// Resolve the named stream and start ingesting.
    ///
    /// Blocks for up to the configured resolve timeout. On success the
    /// returned ingestor is already appending to its buffers.
    pub fn start(
        stream_name: &str,
        resolver: &dyn SourceResolver,
        recorder: Arc<SessionRecorder>,
        config: &EngineConfig,
    ) -> EngineResult<Self> {
        let timeout = Duration::from_secs(config.timing.resolve_timeout_secs);
        tracing::info!(stream = stream_name, ?timeout, "Resolving sample stream");
        let mut source = resolver.resolve(stream_name, timeout)?;

        let meta = source.metadata();
        tracing::info!(
            stream = stream_name,
            channels = meta.channel_count,
            rate = meta.nominal_rate,
            labels = ?meta.channel_labels,
            "Stream connected"
        );

        let buffers = Arc::new(DeviceBuffers::new(
            stream_name,
            meta.channel_labels.clone(),
            meta.nominal_rate,
            config.ring_capacity(meta.nominal_rate),
        ));

        let flushed_samples = flush_backlog(stream_name, source.as_mut());

        let running = Arc::new(AtomicBool::new(true));
        let healthy = Arc::new(AtomicBool::new(true));
        let period = Duration::from_secs_f64(1.0 / config.timing.ingest_rate_hz);
        let max_pull = meta.nominal_rate.ceil().max(1.0) as usize;
        let max_failures = config.timing.max_consecutive_pull_failures;

        let handle = {
            let buffers = Arc::clone(&buffers);
            let running = Arc::clone(&running);
            let healthy = Arc::clone(&healthy);
            let stream_name = stream_name.to_string();
            std::thread::Builder::new()
                .name(format!("ingest-{stream_name}"))
                .spawn(move || {
                    pull_loop(
                        source, &stream_name, &buffers, &recorder, &running, &healthy, period,
                        max_pull, max_failures,
                    );
                })?
        };

        Ok(Self {
            stream_name: stream_name.to_string(),
            buffers,
            running,
            healthy,
            flushed_samples,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Signal the loop to exit and join it within a grace period. Idempotent.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(handle) = handle else {
            return;
        };

        let deadline = Instant::now() + STOP_GRACE;
        while !handle.is_finished() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        if handle.is_finished() {
            let _ = handle.join();
            tracing::info!(stream = %self.stream_name, "Ingest stopped");
        } else {
            // Detach; the loop will exit at its next period check.
            tracing::warn!(stream = %self.stream_name, "Ingest thread did not stop within grace period");
        }
    }

    /// The device's buffers, shared with the compute tick.
    pub fn buffers(&self) -> &Arc<DeviceBuffers> {
        &self.buffers
    }

    /// Whether the pull loop is still running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// False once the loop has given up after repeated pull failures.
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    /// Samples discarded by the startup flush.
    pub fn flushed_samples(&self) -> u64 {
        self.flushed_samples
    }

    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }

    pub fn channel_labels(&self) -> &[String] {
        self.buffers.channel_labels()
    }

    pub fn sample_rate(&self) -> f64 {
        self.buffers.sample_rate()
    }

    pub fn latest_age_ms(&self) -> Option<f64> {
        self.buffers.latest_age_ms()
    }

    pub fn fill_ratio(&self) -> f64 {
        self.buffers.fill_ratio()
    }

    /// Most-recent `duration_s` of samples per channel.
    pub fn snapshot(&self, duration_s: f64) -> Option<std::collections::HashMap<String, Vec<f64>>> {
        self.buffers.recent(duration_s)
    }

    /// Copy of the full recording log.
    pub fn recording_snapshot(&self) -> Vec<(f64, Vec<f64>)> {
        self.buffers.drain_recording()
    }
}

impl Drop for StreamIngestor {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

/// Drain the source's pre-connection backlog with zero-timeout pulls.
fn flush_backlog(stream_name: &str, source: &mut dyn SampleSource) -> u64 {
    let mut total: u64 = 0;
    loop {
        match source.pull_chunk(FLUSH_CHUNK) {
            Ok(chunk) if chunk.is_empty() => break,
            Ok(chunk) => total += chunk.len() as u64,
            Err(e) => {
                tracing::warn!(stream = stream_name, error = %e, "Flush pull failed; continuing");
                break;
            }
        }
    }
    tracing::info!(
        stream = stream_name,
        discarded = total,
        "Startup backlog flushed"
    );
    total
}

#[allow(clippy::too_many_arguments)]
fn pull_loop(
    mut source: Box<dyn SampleSource>,
    stream_name: &str,
    buffers: &DeviceBuffers,
    recorder: &SessionRecorder,
    running: &AtomicBool,
    healthy: &AtomicBool,
    period: Duration,
    max_pull: usize,
    max_failures: u32,
) {
    tracing::debug!(
        stream = stream_name,
        period_ms = period.as_millis() as u64,
        "Ingest loop started"
    );

    let mut consecutive_failures: u32 = 0;
    let mut iterations: u64 = 0;

    while running.load(Ordering::SeqCst) {
        let started = Instant::now();

        match source.pull_chunk(max_pull) {
            Ok(chunk) => {
                consecutive_failures = 0;
                if !chunk.is_empty() {
                    // One lock acquisition covers rings and the recording log.
                    buffers.append_batch(&chunk.timestamps, &chunk.samples);
                    recorder.append_batch(stream_name, &chunk.timestamps, &chunk.samples);
                }
            }
            Err(e) => {
                consecutive_failures += 1;
                tracing::warn!(
                    stream = stream_name,
                    consecutive_failures,
                    error = %e,
                    "Chunk pull failed"
                );
                if consecutive_failures >= max_failures {
                    let fatal = crate::error::EngineError::IngestFatal {
                        device: stream_name.to_string(),
                        consecutive_failures,
                    };
                    tracing::error!(stream = stream_name, "{fatal}");
                    healthy.store(false, Ordering::SeqCst);
                    running.store(false, Ordering::SeqCst);
                    break;
                }
                std::thread::sleep(PULL_ERROR_BACKOFF);
            }
        }

        iterations += 1;
        if let Some(remaining) = period.checked_sub(started.elapsed()) {
            std::thread::sleep(remaining);
        }
    }

    source.close();
    tracing::debug!(stream = stream_name, iterations, "Ingest loop exited");
}

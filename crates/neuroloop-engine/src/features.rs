//! # Multi-Scale Feature Extraction
//!
//! Fans per-device band-power computation out across a bounded worker pool
//! and collects results at the three analysis timescales.
//!
//! The pool is built once at engine start and reused for every tick —
//! spawning threads per tick at 10 Hz would eat the compute budget. A
//! four-device, three-timescale call is twelve independent FFT tasks, so
//! the default four workers keep the wall time near the single slowest task.
//!
//! Per-device failures are isolated: a device with a missing frontal channel
//! or a short window is omitted from the result map, with a warning, and the
//! other devices are unaffected.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use rayon::prelude::*;

use crate::error::{EngineError, EngineResult};
use crate::metrics::{ComputeQuality, MultiScaleMetrics, Timescale, TimescaleMetrics};
use crate::spectral::{BandPowers, SpectralKernel};

/// Channel-indexed sample windows for one device, as returned by
/// [`DeviceBuffers::recent`](crate::buffers::DeviceBuffers::recent).
pub type ChannelData = HashMap<String, Vec<f64>>;

/// Multi-timescale neurofeedback processor shared by the compute tick.
pub struct MultiScaleProcessor {
    kernel: Arc<SpectralKernel>,
    pool: rayon::ThreadPool,
    frontal: [String; 2],
}

impl MultiScaleProcessor {
    /// Build the processor and its worker pool.
    ///
    /// `workers` should be at least the expected device count (default 4).
    pub fn new(
        kernel: Arc<SpectralKernel>,
        frontal: [String; 2],
        workers: usize,
    ) -> EngineResult<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers.max(1))
            .thread_name(|i| format!("fft-worker-{i}"))
            .build()
            .map_err(|e| EngineError::ConfigError {
                reason: format!("Failed to build FFT worker pool: {e}"),
            })?;

        tracing::info!(
            workers = workers.max(1),
            sample_rate = kernel.sample_rate(),
            "Feature processor initialized"
        );

        Ok(Self {
            kernel,
            pool,
            frontal,
        })
    }

    pub fn frontal_channels(&self) -> &[String; 2] {
        &self.frontal
    }

    /// Compute one device at one timescale on the calling thread.
    ///
    /// Truncates each frontal channel to the most-recent
    /// `⌊timescale · f_s⌋` samples, runs the spectral kernel on each, and
    /// averages the two band-power results element-wise.
    pub fn process_device(
        &self,
        device: &str,
        data: &ChannelData,
        timescale: Timescale,
    ) -> EngineResult<TimescaleMetrics> {
        let started = Instant::now();
        let needed = (timescale.secs() * self.kernel.sample_rate()).floor() as usize;

        let mut windows: [&[f64]; 2] = [&[], &[]];
        for (slot, label) in windows.iter_mut().zip(&self.frontal) {
            let channel = data.get(label).ok_or_else(|| EngineError::MissingChannel {
                device: device.to_string(),
                channel: label.clone(),
            })?;
            if channel.len() < needed {
                return Err(EngineError::InsufficientData {
                    device: device.to_string(),
                    available: channel.len(),
                    required: needed,
                });
            }
            *slot = &channel[channel.len() - needed..];
        }

        let left = self.kernel.band_powers(windows[0]);
        let right = self.kernel.band_powers(windows[1]);
        let averaged = BandPowers::average(&left, &right);

        Ok(TimescaleMetrics::from_bands(
            &averaged,
            ComputeQuality {
                timescale_secs: timescale.secs(),
                channels_used: self.frontal.to_vec(),
                samples: needed,
                computation_ms: started.elapsed().as_secs_f64() * 1000.0,
            },
        ))
    }

    /// Compute every device at a single timescale, in parallel.
    ///
    /// Devices that fail are omitted from the result map; collection order
    /// is whatever order tasks complete in.
    pub fn compute(
        &self,
        inputs: &HashMap<String, ChannelData>,
        timescale: Timescale,
    ) -> HashMap<String, TimescaleMetrics> {
        let results: Vec<(String, EngineResult<TimescaleMetrics>)> = self.pool.install(|| {
            inputs
                .par_iter()
                .map(|(device, data)| {
                    (
                        device.clone(),
                        self.process_device(device, data, timescale),
                    )
                })
                .collect()
        });

        let mut out = HashMap::new();
        for (device, result) in results {
            match result {
                Ok(metrics) => {
                    out.insert(device, metrics);
                }
                Err(err) => log_skip(&device, timescale, &err),
            }
        }
        out
    }

    /// Compute every device at every timescale, in parallel.
    ///
    /// The fan-out is over device × timescale pairs so a single slow device
    /// does not serialize the others. Devices missing any timescale come
    /// back with that slot empty; callers decide whether partial results
    /// are usable.
    pub fn compute_multi_timescale(
        &self,
        inputs: &HashMap<String, ChannelData>,
    ) -> HashMap<String, MultiScaleMetrics> {
        let tasks: Vec<(&String, &ChannelData, Timescale)> = inputs
            .iter()
            .flat_map(|(device, data)| {
                Timescale::ALL.iter().map(move |&ts| (device, data, ts))
            })
            .collect();

        let results: Vec<(String, Timescale, EngineResult<TimescaleMetrics>)> =
            self.pool.install(|| {
                tasks
                    .par_iter()
                    .map(|&(device, data, ts)| {
                        (
                            device.clone(),
                            ts,
                            self.process_device(device, data, ts),
                        )
                    })
                    .collect()
            });

        let mut out: HashMap<String, MultiScaleMetrics> = HashMap::new();
        for (device, timescale, result) in results {
            match result {
                Ok(metrics) => {
                    out.entry(device).or_default().set(timescale, metrics);
                }
                Err(err) => log_skip(&device, timescale, &err),
            }
        }
        out
    }
}

fn log_skip(device: &str, timescale: Timescale, err: &EngineError) {
    match err {
        EngineError::MissingChannel { channel, .. } => {
            tracing::warn!(device, channel = %channel, "Device omitted: required frontal channel absent");
        }
        EngineError::InsufficientData {
            available,
            required,
            ..
        } => {
            tracing::debug!(
                device,
                timescale = timescale.label(),
                available,
                required,
                "Device skipped this tick: window not filled"
            );
        }
        other => {
            tracing::warn!(device, error = %other, "Device computation failed");
        }
    }
}

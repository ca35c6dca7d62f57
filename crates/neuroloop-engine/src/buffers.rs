//! # Device Buffers
//!
//! Per-device sample storage with two personalities:
//!
//! - **Rolling rings** — one fixed-capacity arena per channel plus a parallel
//!   timestamp ring, holding the most-recent `window_secs · f_s` samples for
//!   the live compute path. Oldest samples drop on overflow.
//! - **Recording log** — an unbounded append-only `(timestamp, sample)` list
//!   for the lossless export path, cleared only on explicit request.
//!
//! All state sits behind one mutex; readers get owned copies, never
//! references into the rings. Lock scopes are the minimum copy — no caller
//! ever suspends or computes while holding the lock.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use crate::clock::unix_now;

/// Fill state of the rolling window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    /// No samples yet.
    Empty,
    /// Some samples, but below the ready threshold.
    Filling,
    /// Fill ratio ≥ 0.9 — stable windows are available.
    Ready,
}

/// Fixed-capacity ring backed by a flat array and a head index.
#[derive(Debug)]
struct Ring {
    data: Vec<f64>,
    head: usize,
    len: usize,
}

impl Ring {
    fn new(capacity: usize) -> Self {
        Self {
            data: vec![0.0; capacity],
            head: 0,
            len: 0,
        }
    }

    fn push(&mut self, value: f64) {
        self.data[self.head] = value;
        self.head = (self.head + 1) % self.data.len();
        if self.len < self.data.len() {
            self.len += 1;
        }
    }

    /// Most recent value, if any.
    fn last(&self) -> Option<f64> {
        if self.len == 0 {
            return None;
        }
        let idx = (self.head + self.data.len() - 1) % self.data.len();
        Some(self.data[idx])
    }

    /// Copy out the `n` most-recent values in insertion order.
    /// Caller guarantees `n <= self.len`.
    fn recent(&self, n: usize) -> Vec<f64> {
        let capacity = self.data.len();
        let mut out = Vec::with_capacity(n);
        let start = (self.head + capacity - n) % capacity;
        for i in 0..n {
            out.push(self.data[(start + i) % capacity]);
        }
        out
    }
}

#[derive(Debug)]
struct Inner {
    rings: Vec<Ring>,
    timestamps: Ring,
    recording: Vec<(f64, Vec<f64>)>,
}

/// Thread-safe per-device sample buffers.
#[derive(Debug)]
pub struct DeviceBuffers {
    device: String,
    channel_labels: Vec<String>,
    sample_rate: f64,
    capacity: usize,
    inner: Mutex<Inner>,
}

impl DeviceBuffers {
    /// Allocate buffers for a device.
    ///
    /// `capacity` is the rolling window size in samples
    /// (`window_secs · sample_rate`, at least 1).
    pub fn new(
        device: impl Into<String>,
        channel_labels: Vec<String>,
        sample_rate: f64,
        capacity: usize,
    ) -> Self {
        let capacity = capacity.max(1);
        let rings = channel_labels.iter().map(|_| Ring::new(capacity)).collect();
        Self {
            device: device.into(),
            channel_labels,
            sample_rate,
            capacity,
            inner: Mutex::new(Inner {
                rings,
                timestamps: Ring::new(capacity),
                recording: Vec::new(),
            }),
        }
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn channel_labels(&self) -> &[String] {
        &self.channel_labels
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append one timestamped sample to the rings and the recording log.
    pub fn append(&self, timestamp: f64, sample: &[f64]) {
        self.append_batch(&[timestamp], &[sample.to_vec()]);
    }

    /// Append a batch atomically: every channel ring, the timestamp ring,
    /// and the recording log advance together under one lock acquisition.
    ///
    /// Samples whose length does not match the channel count are dropped
    /// with a warning. Timestamps are clamped to be non-decreasing.
    pub fn append_batch(&self, timestamps: &[f64], samples: &[Vec<f64>]) {
        let n_channels = self.channel_labels.len();
        let mut inner = self.lock();

        for (&ts, sample) in timestamps.iter().zip(samples) {
            if sample.len() != n_channels {
                tracing::warn!(
                    device = %self.device,
                    expected = n_channels,
                    got = sample.len(),
                    "Dropping sample with wrong channel count"
                );
                continue;
            }

            let ts = match inner.timestamps.last() {
                Some(last) if ts < last => {
                    tracing::trace!(device = %self.device, "Clamping out-of-order timestamp");
                    last
                }
                _ => ts,
            };

            for (ring, &value) in inner.rings.iter_mut().zip(sample.iter()) {
                ring.push(value);
            }
            inner.timestamps.push(ts);
            inner.recording.push((ts, sample.clone()));
        }
    }

    /// The most-recent `⌊duration_s · f_s⌋` samples per channel, as owned
    /// copies, or `None` if fewer are buffered.
    pub fn recent(&self, duration_s: f64) -> Option<HashMap<String, Vec<f64>>> {
        let n = (duration_s * self.sample_rate).floor() as usize;
        if n == 0 {
            return Some(HashMap::new());
        }

        let inner = self.lock();
        if inner.timestamps.len < n {
            return None;
        }

        Some(
            self.channel_labels
                .iter()
                .zip(inner.rings.iter())
                .map(|(label, ring)| (label.clone(), ring.recent(n)))
                .collect(),
        )
    }

    /// Age of the most recent sample in milliseconds, or `None` if empty.
    pub fn latest_age_ms(&self) -> Option<f64> {
        let latest = self.lock().timestamps.last()?;
        Some((unix_now() - latest) * 1000.0)
    }

    /// Rolling-window occupancy in `[0, 1]`.
    pub fn fill_ratio(&self) -> f64 {
        self.lock().timestamps.len as f64 / self.capacity as f64
    }

    /// Current fill state.
    pub fn state(&self) -> BufferState {
        let len = self.lock().timestamps.len;
        if len == 0 {
            BufferState::Empty
        } else if (len as f64 / self.capacity as f64) >= crate::config::READY_FILL_RATIO {
            BufferState::Ready
        } else {
            BufferState::Filling
        }
    }

    /// Number of samples currently in the rolling window.
    pub fn len(&self) -> usize {
        self.lock().timestamps.len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the entire recording log. Does not clear it.
    pub fn drain_recording(&self) -> Vec<(f64, Vec<f64>)> {
        self.lock().recording.clone()
    }

    /// Number of samples in the recording log.
    pub fn recording_len(&self) -> usize {
        self.lock().recording.len()
    }

    /// Clear the recording log. Rolling rings are unaffected.
    pub fn clear_recording(&self) {
        self.lock().recording.clear();
        tracing::debug!(device = %self.device, "Recording log cleared");
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#![allow(dead_code)]

//! Scripted mock pull source for integration tests.
//!
//! Models the behavior of a real FIFO-queued stream inlet:
//!
//! - an optional **backlog** of stale pre-connection samples that sits in
//!   the queue until drained (this is what the startup flush must discard);
//! - a **paced generator** that produces per-channel sinusoids at the
//!   nominal rate from the moment the backlog has been drained, optionally
//!   back-dated by `prefill_secs` so rolling buffers fill quickly while
//!   timestamps still end "now";
//! - optional **failure injection**: after `fail_after_pulls` generator
//!   pulls every subsequent pull errors, simulating a dead source process.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use neuroloop_engine::error::{EngineError, EngineResult};
use neuroloop_engine::source::{SampleChunk, SampleSource, SourceMetadata, SourceResolver};

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// One channel's synthetic signal.
#[derive(Debug, Clone, Copy)]
pub struct SignalSpec {
    pub freq_hz: f64,
    pub amplitude: f64,
}

/// Scripted behavior for one mock stream.
#[derive(Debug, Clone)]
pub struct MockBehavior {
    pub channel_labels: Vec<String>,
    pub sample_rate: f64,
    /// Per-channel signals; must match `channel_labels` in length.
    pub signals: Vec<SignalSpec>,
    /// Seconds of stale samples queued before connect (flush fodder).
    pub backlog_secs: f64,
    /// Back-date the generator start so buffers fill fast with fresh-looking
    /// timestamps ending at the current wall clock.
    pub prefill_secs: f64,
    /// After this many generator pulls, every pull fails.
    pub fail_after_pulls: Option<u64>,
}

impl MockBehavior {
    /// Four-channel Muse-style stream carrying a strong 10 Hz alpha rhythm
    /// on the frontal channels.
    pub fn steady_alpha() -> Self {
        Self {
            channel_labels: vec!["TP9".into(), "AF7".into(), "AF8".into(), "TP10".into()],
            sample_rate: 256.0,
            signals: vec![
                SignalSpec { freq_hz: 3.0, amplitude: 10.0 },
                SignalSpec { freq_hz: 10.0, amplitude: 50.0 },
                SignalSpec { freq_hz: 10.0, amplitude: 50.0 },
                SignalSpec { freq_hz: 3.0, amplitude: 10.0 },
            ],
            backlog_secs: 0.0,
            prefill_secs: 0.0,
            fail_after_pulls: None,
        }
    }

    pub fn with_backlog(mut self, secs: f64) -> Self {
        self.backlog_secs = secs;
        self
    }

    pub fn with_prefill(mut self, secs: f64) -> Self {
        self.prefill_secs = secs;
        self
    }

    pub fn failing_after(mut self, pulls: u64) -> Self {
        self.fail_after_pulls = Some(pulls);
        self
    }
}

enum Stage {
    /// Backlog queue not yet drained.
    Backlog,
    /// Backlog drained; one empty pull pending so the flush loop stops.
    AwaitingFirstLivePull,
    /// Live generation since the contained wall-clock instant.
    Generating { started_at: f64, emitted: u64 },
}

/// A scripted stream, handed out by [`MockResolver`].
pub struct MockSource {
    behavior: MockBehavior,
    backlog: VecDeque<(f64, Vec<f64>)>,
    stage: Stage,
    generator_pulls: u64,
    closed: bool,
}

impl MockSource {
    fn new(behavior: MockBehavior) -> Self {
        let now = unix_now();
        let n_backlog = (behavior.backlog_secs * behavior.sample_rate) as u64;
        let backlog = (0..n_backlog)
            .map(|i| {
                let ts = now - behavior.backlog_secs + i as f64 / behavior.sample_rate;
                (ts, sample_at(&behavior, i))
            })
            .collect();
        Self {
            behavior,
            backlog,
            stage: Stage::Backlog,
            generator_pulls: 0,
            closed: false,
        }
    }
}

fn sample_at(behavior: &MockBehavior, index: u64) -> Vec<f64> {
    let t = index as f64 / behavior.sample_rate;
    behavior
        .signals
        .iter()
        .map(|s| s.amplitude * (2.0 * std::f64::consts::PI * s.freq_hz * t).sin())
        .collect()
}

impl SampleSource for MockSource {
    fn metadata(&self) -> SourceMetadata {
        SourceMetadata {
            channel_count: self.behavior.channel_labels.len(),
            channel_labels: self.behavior.channel_labels.clone(),
            nominal_rate: self.behavior.sample_rate,
        }
    }

    fn pull_chunk(&mut self, max_samples: usize) -> EngineResult<SampleChunk> {
        assert!(!self.closed, "pull after close");

        match &mut self.stage {
            Stage::Backlog => {
                if self.backlog.is_empty() {
                    self.stage = Stage::AwaitingFirstLivePull;
                    return Ok(SampleChunk::default());
                }
                let mut chunk = SampleChunk::default();
                while chunk.len() < max_samples {
                    let Some((ts, sample)) = self.backlog.pop_front() else {
                        break;
                    };
                    chunk.timestamps.push(ts);
                    chunk.samples.push(sample);
                }
                Ok(chunk)
            }
            Stage::AwaitingFirstLivePull => {
                // First pull of the ingest loop proper: start the clock,
                // back-dated by prefill so the window fills immediately.
                self.stage = Stage::Generating {
                    started_at: unix_now() - self.behavior.prefill_secs,
                    emitted: 0,
                };
                self.pull_chunk(max_samples)
            }
            Stage::Generating { started_at, emitted } => {
                self.generator_pulls += 1;
                if let Some(limit) = self.behavior.fail_after_pulls {
                    if self.generator_pulls > limit {
                        return Err(EngineError::IngestTransient {
                            device: "mock".to_string(),
                            reason: "simulated source death".to_string(),
                        });
                    }
                }

                let available =
                    ((unix_now() - *started_at) * self.behavior.sample_rate) as u64;
                let n = available.saturating_sub(*emitted).min(max_samples as u64);

                let mut chunk = SampleChunk::default();
                for _ in 0..n {
                    let index = *emitted;
                    chunk
                        .timestamps
                        .push(*started_at + index as f64 / self.behavior.sample_rate);
                    chunk.samples.push(sample_at(&self.behavior, index));
                    *emitted += 1;
                }
                Ok(chunk)
            }
        }
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

/// Resolver over a registry of scripted behaviors. A behavior is consumed
/// on resolve; unknown names fail the way a missing LSL stream would.
#[derive(Default)]
pub struct MockResolver {
    behaviors: Mutex<HashMap<String, MockBehavior>>,
}

impl MockResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, stream_name: &str, behavior: MockBehavior) {
        self.behaviors
            .lock()
            .unwrap()
            .insert(stream_name.to_string(), behavior);
    }

    pub fn with(stream_name: &str, behavior: MockBehavior) -> Self {
        let resolver = Self::new();
        resolver.register(stream_name, behavior);
        resolver
    }
}

impl SourceResolver for MockResolver {
    fn resolve(
        &self,
        stream_name: &str,
        timeout: Duration,
    ) -> EngineResult<Box<dyn SampleSource>> {
        let behavior = self.behaviors.lock().unwrap().remove(stream_name);
        match behavior {
            Some(behavior) => Ok(Box::new(MockSource::new(behavior))),
            None => Err(EngineError::SourceUnavailable {
                name: stream_name.to_string(),
                timeout_secs: timeout.as_secs(),
            }),
        }
    }
}

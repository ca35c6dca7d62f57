//! # Feedback Metrics
//!
//! Typed results flowing out of the compute tick: per-timescale band powers
//! and relaxation scores, the multi-timescale trend, and the wire frames
//! handed to subscribers.
//!
//! Internal values are full-precision `f64`. Two-decimal rounding happens
//! only when building wire frames — trend classification and any other
//! downstream use always see unrounded values.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::spectral::BandPowers;

/// Relative difference required between adjacent timescales before a trend
/// is called (5%).
pub const TREND_THRESHOLD: f64 = 0.05;

/// The three analysis timescales.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Timescale {
    /// 1 s — responsive to quick changes, more noise.
    Fast,
    /// 2 s — balance of responsiveness and stability.
    Balanced,
    /// 4 s — smooth trends, less noise.
    Stable,
}

impl Timescale {
    pub const ALL: [Timescale; 3] = [Timescale::Fast, Timescale::Balanced, Timescale::Stable];

    /// Window duration in seconds.
    pub fn secs(self) -> f64 {
        match self {
            Timescale::Fast => 1.0,
            Timescale::Balanced => 2.0,
            Timescale::Stable => 4.0,
        }
    }

    /// Wire label (`"1s"`, `"2s"`, `"4s"`).
    pub fn label(self) -> &'static str {
        match self {
            Timescale::Fast => "1s",
            Timescale::Balanced => "2s",
            Timescale::Stable => "4s",
        }
    }
}

/// Quality block attached to each per-timescale result.
#[derive(Debug, Clone)]
pub struct ComputeQuality {
    /// Window duration in seconds.
    pub timescale_secs: f64,
    /// Channels averaged for the frontal metrics.
    pub channels_used: Vec<String>,
    /// Window size in samples.
    pub samples: usize,
    /// Wall time spent computing this device at this timescale, in ms.
    pub computation_ms: f64,
}

/// Band powers plus the relaxation score for one device at one timescale.
#[derive(Debug, Clone)]
pub struct TimescaleMetrics {
    /// Frontal alpha / beta ratio; 0 when beta is 0.
    pub relaxation: f64,
    pub alpha: f64,
    pub beta: f64,
    pub theta: f64,
    pub delta: f64,
    pub gamma: f64,
    pub quality: ComputeQuality,
}

impl TimescaleMetrics {
    /// Build metrics from averaged frontal band powers.
    pub fn from_bands(bands: &BandPowers, quality: ComputeQuality) -> Self {
        let relaxation = if bands.beta > 0.0 {
            bands.alpha / bands.beta
        } else {
            0.0
        };
        Self {
            relaxation,
            alpha: bands.alpha,
            beta: bands.beta,
            theta: bands.theta,
            delta: bands.delta,
            gamma: bands.gamma,
            quality,
        }
    }
}

/// Per-device results across all three timescales.
#[derive(Debug, Clone, Default)]
pub struct MultiScaleMetrics {
    pub fast: Option<TimescaleMetrics>,
    pub balanced: Option<TimescaleMetrics>,
    pub stable: Option<TimescaleMetrics>,
}

impl MultiScaleMetrics {
    pub fn get(&self, scale: Timescale) -> Option<&TimescaleMetrics> {
        match scale {
            Timescale::Fast => self.fast.as_ref(),
            Timescale::Balanced => self.balanced.as_ref(),
            Timescale::Stable => self.stable.as_ref(),
        }
    }

    pub fn set(&mut self, scale: Timescale, metrics: TimescaleMetrics) {
        match scale {
            Timescale::Fast => self.fast = Some(metrics),
            Timescale::Balanced => self.balanced = Some(metrics),
            Timescale::Stable => self.stable = Some(metrics),
        }
    }

    /// True when all three timescales produced a result.
    pub fn is_complete(&self) -> bool {
        self.fast.is_some() && self.balanced.is_some() && self.stable.is_some()
    }

    /// Relaxation trend across the timescales (unrounded values).
    pub fn relaxation_trend(&self) -> Trend {
        Trend::classify(
            self.fast.as_ref().map(|m| m.relaxation),
            self.balanced.as_ref().map(|m| m.relaxation),
            self.stable.as_ref().map(|m| m.relaxation),
        )
    }
}

/// Direction of a metric across the fast → balanced → stable timescales.
///
/// Because shorter windows weight recent samples more heavily, a fast value
/// above the balanced value above the stable value means the metric is
/// currently rising.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Trend {
    Improving,
    Declining,
    Stable,
    Unknown,
}

impl Trend {
    /// Classify a `(fast, balanced, stable)` triple.
    ///
    /// - `Improving` iff `fast > bal·(1+θ)` and `bal > slow·(1+θ)`
    /// - `Declining` iff `fast < bal·(1−θ)` and `bal < slow·(1−θ)`
    /// - `Stable` otherwise
    /// - `Unknown` if any timescale is missing
    pub fn classify(fast: Option<f64>, balanced: Option<f64>, stable: Option<f64>) -> Trend {
        let (Some(fast), Some(bal), Some(slow)) = (fast, balanced, stable) else {
            return Trend::Unknown;
        };

        if fast > bal * (1.0 + TREND_THRESHOLD) && bal > slow * (1.0 + TREND_THRESHOLD) {
            Trend::Improving
        } else if fast < bal * (1.0 - TREND_THRESHOLD) && bal < slow * (1.0 - TREND_THRESHOLD) {
            Trend::Declining
        } else {
            Trend::Stable
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Trend::Improving => "IMPROVING",
            Trend::Declining => "DECLINING",
            Trend::Stable => "STABLE",
            Trend::Unknown => "UNKNOWN",
        }
    }
}

/// One device's complete feedback result for one compute tick.
#[derive(Debug, Clone)]
pub struct FeatureFrame {
    /// Producing device id (stream name).
    pub device: String,
    /// Per-timescale metrics.
    pub scales: MultiScaleMetrics,
    /// Relaxation trend, computed from unrounded values.
    pub trend: Trend,
    /// Age of the newest buffered sample when this frame was computed, in ms.
    pub data_age_ms: f64,
    /// Per-channel signal quality in `[0, 1]`.
    pub signal_quality: HashMap<String, f64>,
    /// Emission wall-clock timestamp (Unix seconds).
    pub timestamp: f64,
}

// ─── Wire format ────────────────────────────────────────────────────────

/// Round to two decimals for publication.
fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Frontal metrics for one timescale on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireScale {
    pub relaxation: f64,
    pub alpha: f64,
    pub beta: f64,
}

/// The three timescales on the wire, keyed by their labels.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireScales {
    #[serde(rename = "1s", skip_serializing_if = "Option::is_none")]
    pub fast: Option<WireScale>,
    #[serde(rename = "2s", skip_serializing_if = "Option::is_none")]
    pub balanced: Option<WireScale>,
    #[serde(rename = "4s", skip_serializing_if = "Option::is_none")]
    pub stable: Option<WireScale>,
}

/// Quality block on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireQuality {
    pub data_age_ms: f64,
    /// BTreeMap so serialized channel order is deterministic.
    pub signal_quality: BTreeMap<String, f64>,
}

/// One device entry in a published feedback message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireFrame {
    pub subject: String,
    pub frontal: WireScales,
    pub quality: WireQuality,
    /// Whether the current session phase has feedback enabled. Frames are
    /// always published; this flag lets subscribers gate their display.
    pub feedback_enabled: bool,
}

impl FeatureFrame {
    /// Build the published representation: two-decimal rounding applied,
    /// `feedback_enabled` annotation attached.
    pub fn to_wire(&self, feedback_enabled: bool) -> WireFrame {
        let scale = |m: &TimescaleMetrics| WireScale {
            relaxation: round2(m.relaxation),
            alpha: round2(m.alpha),
            beta: round2(m.beta),
        };
        WireFrame {
            subject: self.device.clone(),
            frontal: WireScales {
                fast: self.scales.fast.as_ref().map(scale),
                balanced: self.scales.balanced.as_ref().map(scale),
                stable: self.scales.stable.as_ref().map(scale),
            },
            quality: WireQuality {
                data_age_ms: round2(self.data_age_ms),
                signal_quality: self
                    .signal_quality
                    .iter()
                    .map(|(k, v)| (k.clone(), round2(*v)))
                    .collect(),
            },
            feedback_enabled,
        }
    }
}

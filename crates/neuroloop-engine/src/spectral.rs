//! # Spectral Kernel
//!
//! Band-power extraction for a single channel window: Hann window →
//! real-input FFT → one-sided power spectral density → per-band integration.
//!
//! The kernel is pure (same input → same output) and thread-safe: FFT plans
//! and Hann windows are cached per window length behind a mutex, and the
//! actual transform runs outside the lock. It is shared by every worker in
//! the feature-extraction pool.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};

use crate::config::BandTable;

/// Power in each EEG frequency band, in signal-units² (µV² for EEG sources).
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BandPowers {
    pub delta: f64,
    pub theta: f64,
    pub alpha: f64,
    pub beta: f64,
    pub gamma: f64,
}

impl BandPowers {
    /// All-zero band powers (used for windows too short to resolve anything).
    pub fn zero() -> Self {
        Self::default()
    }

    /// Element-wise average of two band-power results.
    pub fn average(a: &Self, b: &Self) -> Self {
        Self {
            delta: (a.delta + b.delta) / 2.0,
            theta: (a.theta + b.theta) / 2.0,
            alpha: (a.alpha + b.alpha) / 2.0,
            beta: (a.beta + b.beta) / 2.0,
            gamma: (a.gamma + b.gamma) / 2.0,
        }
    }

    /// The band with the highest power, by name.
    pub fn dominant(&self) -> &'static str {
        let all = [
            ("delta", self.delta),
            ("theta", self.theta),
            ("alpha", self.alpha),
            ("beta", self.beta),
            ("gamma", self.gamma),
        ];
        all.iter()
            .fold(("delta", f64::MIN), |best, &(name, v)| {
                if v > best.1 { (name, v) } else { best }
            })
            .0
    }
}

/// Cached transform state for one window length.
struct CachedPlan {
    fft: Arc<dyn Fft<f64>>,
    window: Arc<[f64]>,
}

/// Shared spectral analysis kernel.
///
/// One instance serves all devices and all timescales; window lengths seen
/// in practice are `⌊timescale · f_s⌋` for the three timescales, so the
/// plan cache stays tiny.
pub struct SpectralKernel {
    sample_rate: f64,
    bands: BandTable,
    plans: Mutex<HashMap<usize, CachedPlan>>,
}

impl SpectralKernel {
    pub fn new(sample_rate: f64, bands: BandTable) -> Self {
        Self {
            sample_rate,
            bands,
            plans: Mutex::new(HashMap::new()),
        }
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    /// Compute power in each frequency band for one channel window.
    ///
    /// Algorithm:
    /// 1. Multiply by a Hann window to reduce spectral leakage
    /// 2. Real-input DFT
    /// 3. One-sided PSD: `|X_k|² / N`
    /// 4. Per band `(lo, hi)`: sum PSD over bins with `lo <= f < hi`,
    ///    scaled by the bin spacing `f_s / N`
    ///
    /// Bands whose range contains no frequency bin at this window length
    /// come back as zero.
    pub fn band_powers(&self, samples: &[f64]) -> BandPowers {
        let (psd, bin_hz) = match self.power_spectrum(samples) {
            Some(spectrum) => spectrum,
            None => return BandPowers::zero(),
        };

        let mut out = [0.0f64; 5];
        for (slot, (_, (lo, hi))) in out.iter_mut().zip(self.bands.named()) {
            let sum: f64 = psd
                .iter()
                .enumerate()
                .filter(|(k, _)| {
                    let f = *k as f64 * bin_hz;
                    f >= lo && f < hi
                })
                .map(|(_, p)| p)
                .sum();
            *slot = sum * bin_hz;
        }

        BandPowers {
            delta: out[0],
            theta: out[1],
            alpha: out[2],
            beta: out[3],
            gamma: out[4],
        }
    }

    /// One-sided power spectral density of a Hann-windowed sample vector,
    /// plus the frequency bin spacing in Hz.
    ///
    /// Returns `None` for an empty input. Also used by the signal-quality
    /// utilities for SNR estimation.
    pub fn power_spectrum(&self, samples: &[f64]) -> Option<(Vec<f64>, f64)> {
        let n = samples.len();
        if n == 0 {
            return None;
        }

        let plan = self.plan_for(n);

        let mut buffer: Vec<Complex<f64>> = samples
            .iter()
            .zip(plan.window.iter())
            .map(|(&x, &w)| Complex::new(x * w, 0.0))
            .collect();
        plan.fft.process(&mut buffer);

        let spectrum_len = n / 2 + 1;
        let psd: Vec<f64> = buffer[..spectrum_len]
            .iter()
            .map(|x| x.norm_sqr() / n as f64)
            .collect();

        Some((psd, self.sample_rate / n as f64))
    }

    /// Look up or create the FFT plan and Hann window for length `n`.
    /// The returned Arcs are cheap clones; the transform runs unlocked.
    fn plan_for(&self, n: usize) -> CachedPlan {
        let mut plans = self.plans.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = plans.entry(n).or_insert_with(|| {
            let mut planner = FftPlanner::new();
            CachedPlan {
                fft: planner.plan_fft_forward(n),
                window: hann_window(n).into(),
            }
        });
        CachedPlan {
            fft: Arc::clone(&entry.fft),
            window: Arc::clone(&entry.window),
        }
    }
}

/// Hann window coefficients: `0.5 - 0.5·cos(2πi/N)`.
fn hann_window(n: usize) -> Vec<f64> {
    if n == 1 {
        return vec![1.0];
    }
    (0..n)
        .map(|i| 0.5 - 0.5 * (2.0 * std::f64::consts::PI * i as f64 / n as f64).cos())
        .collect()
}

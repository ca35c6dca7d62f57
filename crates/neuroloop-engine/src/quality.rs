//! # Signal Quality Utilities
//!
//! Per-channel quality assessment and light preprocessing helpers.
//!
//! The live publish path currently reports buffer fill ratio as its
//! per-channel quality placeholder; the estimators here are the real
//! surface for wiring in later: amplitude/variance checks with artifact
//! counting ([`channel_report`]) and spectral SNR ([`band_snr_db`]).

use serde::Serialize;

use crate::spectral::SpectralKernel;

/// Peak-to-peak voltage above which a channel is considered saturated (µV).
const VOLTAGE_THRESHOLD: f64 = 1000.0;

/// Standard deviation above which a channel is considered noisy (µV).
const STD_THRESHOLD: f64 = 200.0;

/// Absolute mean above which a DC offset is flagged (µV).
const DC_OFFSET_THRESHOLD: f64 = 100.0;

/// Fraction of ±3σ outliers above which artifacts are flagged.
const ARTIFACT_RATIO_THRESHOLD: f64 = 0.05;

/// Quality assessment for a single channel window.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelQualityReport {
    /// No issues and composite score above 0.6.
    pub is_good: bool,
    /// Peak-to-peak voltage (µV).
    pub voltage_range: f64,
    /// Standard deviation (µV).
    pub std_dev: f64,
    /// Mean value (µV); large magnitudes indicate DC drift.
    pub mean: f64,
    pub has_artifacts: bool,
    /// Fraction of samples beyond ±3σ of the mean.
    pub artifact_ratio: f64,
    /// Composite quality score in `[0, 1]`, higher is better.
    pub quality_score: f64,
    pub issues: Vec<String>,
}

/// Assess one channel window: amplitude range, noise level, DC drift, and
/// ±3σ artifact density, combined into a 0–1 score.
pub fn channel_report(signal: &[f64]) -> ChannelQualityReport {
    if signal.is_empty() {
        return ChannelQualityReport {
            is_good: false,
            voltage_range: 0.0,
            std_dev: 0.0,
            mean: 0.0,
            has_artifacts: false,
            artifact_ratio: 0.0,
            quality_score: 0.0,
            issues: vec!["no samples".to_string()],
        };
    }

    let mut issues = Vec::new();

    let (min, max) = signal
        .iter()
        .fold((f64::MAX, f64::MIN), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    let voltage_range = max - min;
    let mean = signal.iter().sum::<f64>() / signal.len() as f64;
    let variance = signal.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / signal.len() as f64;
    let std_dev = variance.sqrt();

    if voltage_range < 1.0 {
        issues.push("signal too flat; possible sensor disconnect".to_string());
    }
    if voltage_range > VOLTAGE_THRESHOLD {
        issues.push(format!(
            "voltage range too high ({voltage_range:.1} µV); possible artifact"
        ));
    }
    if std_dev > STD_THRESHOLD {
        issues.push(format!("high noise level (std {std_dev:.1} µV)"));
    }
    if mean.abs() > DC_OFFSET_THRESHOLD {
        issues.push(format!("DC offset detected ({mean:.1} µV)"));
    }

    let artifact_threshold = 3.0 * std_dev;
    let n_artifacts = signal
        .iter()
        .filter(|&&v| (v - mean).abs() > artifact_threshold)
        .count();
    let artifact_ratio = n_artifacts as f64 / signal.len() as f64;
    let has_artifacts = artifact_ratio > ARTIFACT_RATIO_THRESHOLD;
    if has_artifacts {
        issues.push(format!(
            "artifacts detected ({:.1}% of samples)",
            artifact_ratio * 100.0
        ));
    }

    let score_voltage = 1.0 - (voltage_range / VOLTAGE_THRESHOLD).min(1.0);
    let score_std = 1.0 - (std_dev / STD_THRESHOLD).min(1.0);
    let score_artifacts = 1.0 - (artifact_ratio * 10.0).min(1.0);
    let quality_score = (score_voltage + score_std + score_artifacts) / 3.0;

    ChannelQualityReport {
        is_good: issues.is_empty() && quality_score > 0.6,
        voltage_range,
        std_dev,
        mean,
        has_artifacts,
        artifact_ratio,
        quality_score,
        issues,
    }
}

/// Signal-to-noise ratio in dB between two frequency bands.
///
/// Compares mean PSD in `signal_band` (default alpha–beta territory) against
/// `noise_band` (default powerline territory). Good EEG typically lands in
/// the 5–20 dB range. Returns 0 when either band has no bins or no power.
pub fn band_snr_db(
    kernel: &SpectralKernel,
    signal: &[f64],
    signal_band: (f64, f64),
    noise_band: (f64, f64),
) -> f64 {
    let Some((psd, bin_hz)) = kernel.power_spectrum(signal) else {
        return 0.0;
    };

    let band_mean = |(lo, hi): (f64, f64)| -> Option<f64> {
        let values: Vec<f64> = psd
            .iter()
            .enumerate()
            .filter(|(k, _)| {
                let f = *k as f64 * bin_hz;
                f >= lo && f < hi
            })
            .map(|(_, &p)| p)
            .collect();
        if values.is_empty() {
            None
        } else {
            Some(values.iter().sum::<f64>() / values.len() as f64)
        }
    };

    match (band_mean(signal_band), band_mean(noise_band)) {
        (Some(signal_power), Some(noise_power)) if noise_power > 0.0 => {
            10.0 * (signal_power / noise_power).log10()
        }
        _ => 0.0,
    }
}

/// Remove the least-squares linear trend from a signal.
pub fn detrend(signal: &[f64]) -> Vec<f64> {
    let n = signal.len();
    if n < 2 {
        return signal.to_vec();
    }

    let n_f = n as f64;
    let x_mean = (n_f - 1.0) / 2.0;
    let y_mean = signal.iter().sum::<f64>() / n_f;

    let mut covariance = 0.0;
    let mut x_variance = 0.0;
    for (i, &y) in signal.iter().enumerate() {
        let dx = i as f64 - x_mean;
        covariance += dx * (y - y_mean);
        x_variance += dx * dx;
    }
    let slope = if x_variance > 0.0 {
        covariance / x_variance
    } else {
        0.0
    };
    let intercept = y_mean - slope * x_mean;

    signal
        .iter()
        .enumerate()
        .map(|(i, &y)| y - (slope * i as f64 + intercept))
        .collect()
}

/// Mark samples where the first derivative exceeds `threshold` (µV/sample).
///
/// Eye blinks produce large, rapid voltage swings in frontal channels;
/// a derivative threshold catches both edges of the blink.
pub fn detect_blinks(signal: &[f64], threshold: f64) -> Vec<bool> {
    let mut out = Vec::with_capacity(signal.len());
    let mut previous = match signal.first() {
        Some(&v) => v,
        None => return out,
    };
    for &value in signal {
        out.push((value - previous).abs() > threshold);
        previous = value;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BandTable;

    fn sine(freq: f64, n: usize, amplitude: f64) -> Vec<f64> {
        (0..n)
            .map(|i| amplitude * (2.0 * std::f64::consts::PI * freq * i as f64 / 256.0).sin())
            .collect()
    }

    #[test]
    fn test_clean_signal_is_good() {
        let report = channel_report(&sine(10.0, 1024, 40.0));
        assert!(report.is_good, "issues: {:?}", report.issues);
        assert!(report.quality_score > 0.6);
        assert!(!report.has_artifacts);
    }

    #[test]
    fn test_flat_signal_flagged() {
        let report = channel_report(&[0.1; 512]);
        assert!(!report.is_good);
        assert!(report.issues.iter().any(|i| i.contains("flat")));
    }

    #[test]
    fn test_saturated_signal_flagged() {
        let report = channel_report(&sine(10.0, 512, 2000.0));
        assert!(!report.is_good);
        assert!(report.issues.iter().any(|i| i.contains("voltage range")));
    }

    #[test]
    fn test_dc_offset_flagged() {
        let signal: Vec<f64> = sine(10.0, 512, 20.0).iter().map(|v| v + 300.0).collect();
        let report = channel_report(&signal);
        assert!(report.issues.iter().any(|i| i.contains("DC offset")));
    }

    #[test]
    fn test_spikes_counted_as_artifacts() {
        let mut signal = sine(10.0, 512, 10.0);
        // Plant spikes in >5% of samples
        for i in (0..512).step_by(15) {
            signal[i] = 500.0;
        }
        let report = channel_report(&signal);
        assert!(report.has_artifacts);
        assert!(report.artifact_ratio > 0.05);
    }

    #[test]
    fn test_empty_signal() {
        let report = channel_report(&[]);
        assert!(!report.is_good);
        assert_eq!(report.quality_score, 0.0);
    }

    #[test]
    fn test_snr_favors_signal_band() {
        let kernel = SpectralKernel::new(256.0, BandTable::default());
        // Strong alpha, no powerline content
        let clean = sine(10.0, 1024, 50.0);
        let snr = band_snr_db(&kernel, &clean, (8.0, 30.0), (50.0, 60.0));
        assert!(snr > 5.0, "snr {snr}");

        // Pure powerline hum
        let hum = sine(55.0, 1024, 50.0);
        let snr = band_snr_db(&kernel, &hum, (8.0, 30.0), (50.0, 60.0));
        assert!(snr < 0.0, "snr {snr}");
    }

    #[test]
    fn test_snr_degenerate_inputs() {
        let kernel = SpectralKernel::new(256.0, BandTable::default());
        assert_eq!(band_snr_db(&kernel, &[], (8.0, 30.0), (50.0, 60.0)), 0.0);
        // Band with no bins at this length
        let snr = band_snr_db(&kernel, &sine(10.0, 64, 1.0), (0.1, 0.2), (50.0, 60.0));
        assert_eq!(snr, 0.0);
    }

    #[test]
    fn test_detrend_removes_slope() {
        let signal: Vec<f64> = (0..100).map(|i| 2.0 * i as f64 + 5.0).collect();
        let detrended = detrend(&signal);
        for v in &detrended {
            assert!(v.abs() < 1e-9, "residual {v}");
        }

        // Oscillation survives detrending
        let with_drift: Vec<f64> = sine(10.0, 256, 10.0)
            .iter()
            .enumerate()
            .map(|(i, v)| v + 0.5 * i as f64)
            .collect();
        let detrended = detrend(&with_drift);
        let range = detrended.iter().fold(0.0f64, |hi, v| hi.max(v.abs()));
        assert!(range > 5.0);
    }

    #[test]
    fn test_blink_detection() {
        let mut signal = vec![0.0; 100];
        signal[50] = 200.0; // step up and back down
        let blinks = detect_blinks(&signal, 100.0);
        assert!(blinks[50]);
        assert!(blinks[51]);
        assert_eq!(blinks.iter().filter(|&&b| b).count(), 2);

        assert!(detect_blinks(&[], 100.0).is_empty());
        let calm = detect_blinks(&sine(10.0, 256, 10.0), 100.0);
        assert!(calm.iter().all(|&b| !b));
    }
}

//! Effective-sample-size estimation.
//!
//! Convergence is judged from the chain's accepted-sample history (the
//! differential-evolution buffer): the integrated autocorrelation time
//! is estimated per varying dimension and the worst one divides the
//! history length.

use crate::de_buffer::DiffEvolutionBuffer;

/// Fewer stored samples than this and the estimate is not meaningful.
const MIN_SAMPLES: usize = 8;

/// Lag-correlation cutoff for the autocorrelation sum.
const ACF_CUTOFF: f64 = 0.01;

/// Number of effectively independent samples in `history`.
///
/// `varying` holds the value indices of the sampled dimensions. Returns
/// zero while the history is too short to say anything.
pub fn effective_sample_size(history: &DiffEvolutionBuffer, varying: &[usize]) -> u64 {
    let n = history.len();
    if n < MIN_SAMPLES || varying.is_empty() {
        return 0;
    }

    let mut series = vec![0f64; n];
    let mut worst = 1f64;
    for &dim in varying {
        for (slot, point) in series.iter_mut().zip(history.points()) {
            *slot = point[dim];
        }
        worst = worst.max(integrated_autocorr_time(&series));
    }
    (n as f64 / worst).floor() as u64
}

/// Integrated autocorrelation time of one series, in sample units.
///
/// Sums lag correlations until they fall below the cutoff. A constant
/// series carries a single sample's worth of information.
pub fn integrated_autocorr_time(series: &[f64]) -> f64 {
    let n = series.len();
    let mean = series.iter().sum::<f64>() / n as f64;
    let variance = series.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() / n as f64;
    if variance <= 0.0 {
        return n as f64;
    }

    let mut tau = 1.0;
    for lag in 1..n / 2 {
        let mut covariance = 0.0;
        for i in 0..n - lag {
            covariance += (series[i] - mean) * (series[i + lag] - mean);
        }
        let rho = covariance / ((n - lag) as f64 * variance);
        if rho < ACF_CUTOFF {
            break;
        }
        tau += 2.0 * rho;
    }
    tau.clamp(1.0, n as f64)
}

//! Jitter estimation from an offset population
//!
//! 1. Optional single-pass outlier cut at `outlier_sigma` raw standard deviations
//! 2. Equal-width histogram over the retained range
//! 3. Gaussian fit to (bin centre, count), seeded from the retained moments

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::fit::fit_gaussian;
use super::histogram::Histogram;
use crate::error::{AnalysisError, Result};

/// `2 * sqrt(2 * ln 2)`: FWHM of a Gaussian in units of sigma
pub const FWHM_PER_SIGMA: f64 = 2.354_820_045_030_949_3;

/// Full width at half maximum of a Gaussian with standard deviation `sigma`
pub fn fwhm(sigma: f64) -> f64 {
    FWHM_PER_SIGMA * sigma
}

/// Histogram and outlier settings for one estimate
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FitConfig {
    pub bin_count: usize,
    /// Keep samples within this many standard deviations of the mean; 0 keeps all
    pub outlier_sigma: f64,
}

impl FitConfig {
    pub fn validate(&self) -> Result<()> {
        if self.bin_count == 0 {
            return Err(AnalysisError::InvalidConfig(
                "histogram bin count must be positive".into(),
            ));
        }
        if !(self.outlier_sigma.is_finite() && self.outlier_sigma >= 0.0) {
            return Err(AnalysisError::InvalidConfig(format!(
                "outlier sigma must be a non-negative finite value, got {}",
                self.outlier_sigma
            )));
        }
        Ok(())
    }
}

/// Result of one Gaussian fit over an offset population
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JitterEstimate {
    /// Fitted standard deviation (s), never negative
    pub sigma_fit: f64,
    pub sigma_err: f64,
    pub mean_fit: f64,
    pub mean_err: f64,
    pub amp_fit: f64,
    pub amp_err: f64,
    pub bin_width: f64,
    /// Samples kept after the outlier cut
    pub retained: usize,
    /// Samples removed by the outlier cut
    pub rejected: usize,
    pub histogram: Histogram,
}

impl JitterEstimate {
    pub fn fwhm(&self) -> f64 {
        fwhm(self.sigma_fit)
    }

    pub fn fwhm_err(&self) -> f64 {
        fwhm(self.sigma_err)
    }
}

/// Population mean and standard deviation (divisor n)
pub fn mean_and_std(values: &[f64]) -> Option<(f64, f64)> {
    if values.is_empty() {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values
        .iter()
        .map(|v| {
            let delta = v - mean;
            delta * delta
        })
        .sum::<f64>()
        / n;
    Some((mean, variance.sqrt()))
}

/// Samples strictly within `outlier_sigma` raw standard deviations of the raw mean
///
/// `outlier_sigma == 0` keeps everything. Order is preserved.
pub fn reject_outliers(offsets: &[f64], outlier_sigma: f64) -> Vec<f64> {
    if outlier_sigma == 0.0 {
        return offsets.to_vec();
    }
    let Some((mean, std)) = mean_and_std(offsets) else {
        return Vec::new();
    };
    let limit = outlier_sigma * std;
    offsets
        .iter()
        .copied()
        .filter(|v| (v - mean).abs() < limit)
        .collect()
}

/// Fit a Gaussian to the histogram of `offsets`
pub fn fit_jitter(offsets: &[f64], bin_count: usize, outlier_sigma: f64) -> Result<JitterEstimate> {
    let config = FitConfig {
        bin_count,
        outlier_sigma,
    };
    config.validate()?;

    let retained = reject_outliers(offsets, outlier_sigma);
    let rejected = offsets.len() - retained.len();
    info!(
        "Removed {} outliers ({} kept)",
        rejected,
        retained.len()
    );

    let histogram = Histogram::from_values(&retained, bin_count);
    let divergence = |reason: String, histogram: Histogram| AnalysisError::FitDivergence {
        reason,
        histogram,
    };

    if retained.len() < 3 {
        return Err(divergence(
            format!("only {} samples retained", retained.len()),
            histogram,
        ));
    }

    let Some((mean, std)) = mean_and_std(&retained) else {
        return Err(divergence("empty population".into(), histogram));
    };
    let amp0 = histogram.max_count() as f64;
    let counts: Vec<f64> = histogram.counts.iter().map(|&c| c as f64).collect();

    debug!(
        "Fit seed: amp={} mu={:e} sigma={:e} over {} bins ({} occupied) of {:e}",
        amp0,
        mean,
        std,
        bin_count,
        histogram.occupied_bins(),
        histogram.bin_width
    );

    let fit = match fit_gaussian(&histogram.centers, &counts, amp0, mean, std) {
        Ok(fit) => fit,
        Err(failure) => return Err(divergence(failure.to_string(), histogram)),
    };

    let estimate = JitterEstimate {
        sigma_fit: fit.sigma.abs(),
        sigma_err: fit.sigma_err,
        mean_fit: fit.mu,
        mean_err: fit.mu_err,
        amp_fit: fit.amp,
        amp_err: fit.amp_err,
        bin_width: histogram.bin_width,
        retained: retained.len(),
        rejected,
        histogram,
    };

    info!(
        "Fit: sigma={:.3e} ± {:.1e} s, mean={:.4e} s, FWHM={:.3e} s ({} iterations)",
        estimate.sigma_fit,
        estimate.sigma_err,
        estimate.mean_fit,
        estimate.fwhm(),
        fit.iterations
    );

    Ok(estimate)
}

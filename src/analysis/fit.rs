//! Three-parameter Gaussian least-squares fit
//!
//! Levenberg–Marquardt on `amp * exp(-0.5 * ((x - mu) / sigma)^2)`. The
//! problem is solved in coordinates normalised by the seed values: offsets
//! live around 1e-9 s while counts are in the hundreds, and the raw normal
//! matrix would be far outside f64's usable condition range.

use nalgebra::{Matrix3, Vector3};
use thiserror::Error;
use tracing::trace;

/// Maximum accepted + rejected LM iterations
const MAX_ITERATIONS: usize = 500;

/// Relative reduction in the residual sum below which the fit has converged
const FTOL: f64 = 1.49e-8;

/// Relative parameter step below which the fit has converged
const XTOL: f64 = 1.49e-8;

const LAMBDA_INIT: f64 = 1e-3;

/// Damping beyond which no descent direction remains
const LAMBDA_MAX: f64 = 1e12;

/// Gaussian model evaluated at `x`
pub fn gaussian(x: f64, amp: f64, mu: f64, sigma: f64) -> f64 {
    let z = (x - mu) / sigma;
    amp * (-0.5 * z * z).exp()
}

/// Fitted parameters and their standard errors
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GaussianFit {
    pub amp: f64,
    pub mu: f64,
    /// May come out negative; only the magnitude is meaningful
    pub sigma: f64,
    pub amp_err: f64,
    pub mu_err: f64,
    pub sigma_err: f64,
    pub iterations: usize,
}

/// Why a fit could not produce parameters
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FitFailure {
    #[error("{points} data points cannot constrain 3 parameters")]
    TooFewPoints { points: usize },

    #[error("initial guess is degenerate")]
    BadSeed,

    #[error("normal matrix is singular")]
    Singular,

    #[error("no convergence after {iterations} iterations")]
    NotConverged { iterations: usize },

    #[error("parameters became non-finite")]
    NonFinite,
}

/// Fit a Gaussian to `(x, y)` starting from `(amp0, mu0, sigma0)`
///
/// Parameter errors follow the usual least-squares convention: the inverse
/// normal matrix scaled by the residual variance `SSR / (n - 3)`.
pub fn fit_gaussian(
    x: &[f64],
    y: &[f64],
    amp0: f64,
    mu0: f64,
    sigma0: f64,
) -> Result<GaussianFit, FitFailure> {
    let n = x.len().min(y.len());
    if n <= 3 {
        return Err(FitFailure::TooFewPoints { points: n });
    }
    if !(amp0.is_finite() && mu0.is_finite() && sigma0.is_finite()) || amp0 == 0.0 || sigma0 == 0.0
    {
        return Err(FitFailure::BadSeed);
    }

    // Normalised data: u = (x - mu0) / sigma0, v = y / amp0, seed (1, 0, 1)
    let u: Vec<f64> = x[..n].iter().map(|&xi| (xi - mu0) / sigma0).collect();
    let v: Vec<f64> = y[..n].iter().map(|&yi| yi / amp0).collect();

    let mut p = Vector3::new(1.0, 0.0, 1.0);
    let mut ssr = residual_sum(&u, &v, &p);
    let mut lambda = LAMBDA_INIT;
    let mut iterations = 0;
    let mut converged = false;

    while iterations < MAX_ITERATIONS {
        iterations += 1;
        let (jtj, jtr) = normal_equations(&u, &v, &p);

        let mut damped = jtj;
        for i in 0..3 {
            damped[(i, i)] += lambda * jtj[(i, i)].max(1e-12);
        }
        let Some(step) = damped.lu().solve(&jtr) else {
            lambda *= 10.0;
            if lambda > LAMBDA_MAX {
                break;
            }
            continue;
        };

        let candidate = p + step;
        let candidate_ssr = residual_sum(&u, &v, &candidate);

        if candidate_ssr.is_finite() && candidate_ssr <= ssr {
            let reduction = ssr - candidate_ssr;
            let small_step = step.norm() <= XTOL * (p.norm() + XTOL);
            p = candidate;
            let previous = ssr;
            ssr = candidate_ssr;
            lambda = (lambda / 10.0).max(1e-15);
            trace!("LM iteration {}: ssr={:e} lambda={:e}", iterations, ssr, lambda);

            if reduction <= FTOL * previous || small_step {
                converged = true;
                break;
            }
        } else {
            lambda *= 10.0;
            if lambda > LAMBDA_MAX {
                // No damped step improves the residual: a minimum to working precision
                converged = true;
                break;
            }
        }
    }

    if !converged {
        return Err(FitFailure::NotConverged { iterations });
    }
    if !(p.iter().all(|c| c.is_finite()) && ssr.is_finite()) {
        return Err(FitFailure::NonFinite);
    }
    if p[2] == 0.0 {
        return Err(FitFailure::Singular);
    }

    let (jtj, _) = normal_equations(&u, &v, &p);
    let inverse = jtj.try_inverse().ok_or(FitFailure::Singular)?;
    let residual_variance = ssr / (n - 3) as f64;
    let scale = Vector3::new(amp0, sigma0, sigma0.abs());
    let errors: Vec<f64> = (0..3)
        .map(|i| (inverse[(i, i)] * residual_variance).abs().sqrt() * scale[i].abs())
        .collect();

    let fit = GaussianFit {
        amp: p[0] * amp0,
        mu: mu0 + p[1] * sigma0,
        sigma: p[2] * sigma0,
        amp_err: errors[0],
        mu_err: errors[1],
        sigma_err: errors[2],
        iterations,
    };

    if ![fit.amp, fit.mu, fit.sigma, fit.amp_err, fit.mu_err, fit.sigma_err]
        .iter()
        .all(|c| c.is_finite())
    {
        return Err(FitFailure::NonFinite);
    }
    Ok(fit)
}

fn residual_sum(u: &[f64], v: &[f64], p: &Vector3<f64>) -> f64 {
    u.iter()
        .zip(v)
        .map(|(&ui, &vi)| {
            let r = vi - gaussian(ui, p[0], p[1], p[2]);
            r * r
        })
        .sum()
}

/// `JᵀJ` and `Jᵀr` of the model at `p`
fn normal_equations(u: &[f64], v: &[f64], p: &Vector3<f64>) -> (Matrix3<f64>, Vector3<f64>) {
    let (amp, mu, sigma) = (p[0], p[1], p[2]);
    let mut jtj = Matrix3::zeros();
    let mut jtr = Vector3::zeros();

    for (&ui, &vi) in u.iter().zip(v) {
        let z = (ui - mu) / sigma;
        let e = (-0.5 * z * z).exp();
        let j = Vector3::new(e, amp * e * z / sigma, amp * e * z * z / sigma);
        let r = vi - amp * e;
        jtj += j * j.transpose();
        jtr += j * r;
    }

    (jtj, jtr)
}

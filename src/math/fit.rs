// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Non-linear least squares.

use nalgebra::{DMatrix, DVector};
use thiserror::Error;

use crate::constants::FWHM_PER_SIGMA;

#[derive(Error, Debug, Clone, PartialEq)]
pub(crate) enum FitError {
    #[error("Need at least {needed} points for this fit, but only {got} are available")]
    TooFewPoints { needed: usize, got: usize },

    #[error("Fit inputs have different lengths ({x} vs. {y})")]
    LengthMismatch { x: usize, y: usize },

    #[error("The fit's normal equations are singular: {0}")]
    Singular(String),

    #[error("Non-finite values were encountered while fitting")]
    NonFinite,
}

#[derive(Debug, Clone)]
pub(crate) struct LmOptions {
    pub(crate) max_iterations: usize,

    /// Stop when the relative decrease of chi-squared is below this.
    pub(crate) ftol: f64,

    /// Stop when the relative size of a step is below this.
    pub(crate) xtol: f64,

    pub(crate) initial_lambda: f64,
}

impl Default for LmOptions {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            ftol: 1e-10,
            xtol: 1e-10,
            initial_lambda: 1e-3,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct LmResult {
    pub(crate) params: Vec<f64>,
    pub(crate) chi2: f64,
    pub(crate) iterations: usize,
    pub(crate) converged: bool,
}

fn chi2<F: Fn(f64, &[f64]) -> f64>(model: &F, x: &[f64], y: &[f64], inv_sigma: &[f64], p: &[f64]) -> f64 {
    let mut total = 0.0;
    for ((&xi, &yi), &w) in x.iter().zip(y).zip(inv_sigma) {
        let r = (yi - model(xi, p)) * w;
        if !r.is_finite() {
            return f64::INFINITY;
        }
        total += r * r;
    }
    total
}

fn clamp_params(p: &mut [f64], bounds: Option<&[(f64, f64)]>) {
    if let Some(bounds) = bounds {
        for (v, &(lo, hi)) in p.iter_mut().zip(bounds) {
            *v = v.clamp(lo, hi);
        }
    }
}

/// Levenberg-Marquardt minimisation of the weighted squared residuals between
/// `y` and `model(x, params)`. The Jacobian is estimated with central
/// differences. Parameters are clamped to `bounds` after every step.
pub(crate) fn levenberg_marquardt<F>(
    model: F,
    x: &[f64],
    y: &[f64],
    sigma: Option<&[f64]>,
    p0: &[f64],
    bounds: Option<&[(f64, f64)]>,
    opts: &LmOptions,
) -> Result<LmResult, FitError>
where
    F: Fn(f64, &[f64]) -> f64,
{
    let n = x.len();
    let m = p0.len();
    if y.len() != n {
        return Err(FitError::LengthMismatch { x: n, y: y.len() });
    }
    if n < m {
        return Err(FitError::TooFewPoints { needed: m, got: n });
    }
    let inv_sigma: Vec<f64> = match sigma {
        Some(s) => s
            .iter()
            .map(|&s| if s > 0.0 && s.is_finite() { 1.0 / s } else { 0.0 })
            .collect(),
        None => vec![1.0; n],
    };

    let mut p = p0.to_vec();
    clamp_params(&mut p, bounds);
    let mut current = chi2(&model, x, y, &inv_sigma, &p);
    if !current.is_finite() {
        return Err(FitError::NonFinite);
    }
    let mut lambda = opts.initial_lambda;
    let mut converged = false;
    let mut iterations = 0;

    while iterations < opts.max_iterations {
        iterations += 1;

        let mut jac = DMatrix::<f64>::zeros(n, m);
        for j in 0..m {
            let h = 1e-6 * p[j].abs().max(1e-6);
            let mut hi = p.clone();
            let mut lo = p.clone();
            hi[j] += h;
            lo[j] -= h;
            for i in 0..n {
                jac[(i, j)] = (model(x[i], &hi) - model(x[i], &lo)) / (2.0 * h) * inv_sigma[i];
            }
        }
        let residuals = DVector::from_fn(n, |i, _| (y[i] - model(x[i], &p)) * inv_sigma[i]);
        let jtj = jac.transpose() * &jac;
        let jtr = jac.transpose() * residuals;

        // Keep raising the damping until a step improves chi-squared.
        let mut improved = false;
        while lambda < 1e16 {
            let mut a = jtj.clone();
            for j in 0..m {
                a[(j, j)] += lambda * jtj[(j, j)].max(1e-12);
            }
            let step = match a.lu().solve(&jtr) {
                Some(s) => s,
                None => {
                    lambda *= 10.0;
                    continue;
                }
            };
            let mut trial: Vec<f64> = p.iter().zip(step.iter()).map(|(a, b)| a + b).collect();
            clamp_params(&mut trial, bounds);
            let trial_chi2 = chi2(&model, x, y, &inv_sigma, &trial);
            if trial_chi2 < current {
                let rel_step = trial
                    .iter()
                    .zip(&p)
                    .map(|(t, o)| (t - o).abs() / o.abs().max(1e-12))
                    .fold(0.0, f64::max);
                let rel_decrease = (current - trial_chi2) / current.max(f64::MIN_POSITIVE);
                p = trial;
                current = trial_chi2;
                lambda = (lambda / 10.0).max(1e-12);
                improved = true;
                if rel_decrease < opts.ftol || rel_step < opts.xtol {
                    converged = true;
                }
                break;
            }
            lambda *= 10.0;
        }
        if !improved {
            // No step can reduce chi-squared; we're at a minimum.
            converged = true;
        }
        if converged {
            break;
        }
    }

    Ok(LmResult {
        params: p,
        chi2: current,
        iterations,
        converged,
    })
}

/// A Gaussian with an additive offset.
pub(crate) fn gauss(x: f64, amp: f64, centre: f64, sigma: f64, offset: f64) -> f64 {
    amp * (-0.5 * ((x - centre) / sigma).powi(2)).exp() + offset
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct GaussFit {
    pub(crate) amp: f64,
    pub(crate) centre: f64,
    pub(crate) sigma: f64,
    pub(crate) offset: f64,
    pub(crate) slope: f64,
    pub(crate) rms: f64,
    pub(crate) converged: bool,
}

impl GaussFit {
    pub(crate) fn fwhm(&self) -> f64 {
        self.sigma.abs() * FWHM_PER_SIGMA
    }

    pub(crate) fn eval(&self, x: f64) -> f64 {
        gauss(x, self.amp, self.centre, self.sigma, self.offset) + self.slope * (x - self.centre)
    }
}

/// Fit a Gaussian (optionally with a linear slope) to `(x, y)`. `guess` is
/// `[amp, centre, sigma, offset]`. The centre is kept inside the range of `x`
/// and the width is kept positive.
pub(crate) fn fit_gaussian(
    x: &[f64],
    y: &[f64],
    guess: [f64; 4],
    with_slope: bool,
) -> Result<GaussFit, FitError> {
    let (xmin, xmax) = x
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    let span = (xmax - xmin).max(f64::EPSILON);
    let mut p0 = guess.to_vec();
    let mut bounds = vec![
        (f64::NEG_INFINITY, f64::INFINITY),
        (xmin, xmax),
        (span * 1e-4, span * 10.0),
        (f64::NEG_INFINITY, f64::INFINITY),
    ];
    if with_slope {
        p0.push(0.0);
        bounds.push((f64::NEG_INFINITY, f64::INFINITY));
    }
    let model = |xi: f64, p: &[f64]| {
        let slope = p.get(4).copied().unwrap_or(0.0);
        gauss(xi, p[0], p[1], p[2], p[3]) + slope * (xi - p[1])
    };
    let result = levenberg_marquardt(
        model,
        x,
        y,
        None,
        &p0,
        Some(&bounds),
        &LmOptions::default(),
    )?;
    let p = &result.params;
    let rms = (result.chi2 / x.len() as f64).sqrt();
    Ok(GaussFit {
        amp: p[0],
        centre: p[1],
        sigma: p[2],
        offset: p[3],
        slope: p.get(4).copied().unwrap_or(0.0),
        rms,
        converged: result.converged,
    })
}

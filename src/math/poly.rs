// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Polynomial fitting. Coefficients are always in ascending order of power,
//! i.e. `c[0] + c[1] x + c[2] x^2 + ...`.

use nalgebra::{DMatrix, DVector};

use super::{nanmedian_iter, FitError};

/// Evaluate a polynomial with Horner's method.
pub(crate) fn polyval(coeffs: &[f64], x: f64) -> f64 {
    coeffs.iter().rev().fold(0.0, |acc, c| acc * x + c)
}

/// The coefficients of the derivative of a polynomial.
pub(crate) fn polyder(coeffs: &[f64]) -> Vec<f64> {
    coeffs
        .iter()
        .enumerate()
        .skip(1)
        .map(|(i, c)| c * i as f64)
        .collect()
}

fn binomial(n: usize, k: usize) -> f64 {
    (0..k).fold(1.0, |acc, i| acc * (n - i) as f64 / (i + 1) as f64)
}

pub(crate) fn polyfit(x: &[f64], y: &[f64], deg: usize) -> Result<Vec<f64>, FitError> {
    polyfit_weighted(x, y, None, deg)
}

/// Least-squares polynomial fit. The abscissae are centred and scaled before
/// the solve; the returned coefficients are for the unscaled abscissae.
pub(crate) fn polyfit_weighted(
    x: &[f64],
    y: &[f64],
    weights: Option<&[f64]>,
    deg: usize,
) -> Result<Vec<f64>, FitError> {
    let n = x.len();
    if y.len() != n || weights.map(|w| w.len() != n).unwrap_or(false) {
        return Err(FitError::LengthMismatch {
            x: n,
            y: y.len(),
        });
    }
    if n < deg + 1 {
        return Err(FitError::TooFewPoints {
            needed: deg + 1,
            got: n,
        });
    }
    if x.iter().chain(y.iter()).any(|v| !v.is_finite()) {
        return Err(FitError::NonFinite);
    }

    let (xmin, xmax) = x
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    let centre = 0.5 * (xmin + xmax);
    let scale = if xmax > xmin { 0.5 * (xmax - xmin) } else { 1.0 };

    let w = |i: usize| weights.map(|w| w[i]).unwrap_or(1.0);
    let a = DMatrix::from_fn(n, deg + 1, |i, j| w(i) * ((x[i] - centre) / scale).powi(j as i32));
    let b = DVector::from_fn(n, |i, _| w(i) * y[i]);
    let solved = a
        .svd(true, true)
        .solve(&b, 1e-14)
        .map_err(|e| FitError::Singular(e.to_string()))?;

    // Expand c_j ((x - m) / s)^j into powers of x.
    let mut coeffs = vec![0.0; deg + 1];
    for (j, c) in solved.iter().enumerate() {
        let cj = c / scale.powi(j as i32);
        for (k, coeff) in coeffs.iter_mut().enumerate().take(j + 1) {
            *coeff += cj * binomial(j, k) * (-centre).powi((j - k) as i32);
        }
    }
    if coeffs.iter().any(|c| !c.is_finite()) {
        return Err(FitError::NonFinite);
    }
    Ok(coeffs)
}

/// The result of a polynomial fit that rejected some of its input points.
#[derive(Debug, Clone)]
pub(crate) struct ClippedFit {
    pub(crate) coeffs: Vec<f64>,

    /// `true` for the points that were kept.
    pub(crate) mask: Vec<bool>,

    pub(crate) n_removed: usize,

    /// RMS of the kept residuals.
    pub(crate) rms: f64,

    /// Peak-to-peak of the kept residuals.
    pub(crate) ptp: f64,
}

fn residual_stats(x: &[f64], y: &[f64], mask: &[bool], coeffs: &[f64]) -> (Vec<f64>, f64, f64) {
    let residuals: Vec<f64> = x
        .iter()
        .zip(y)
        .map(|(&xi, &yi)| yi - polyval(coeffs, xi))
        .collect();
    let kept: Vec<f64> = residuals
        .iter()
        .zip(mask)
        .filter_map(|(r, &m)| m.then_some(*r))
        .collect();
    let rms = (kept.iter().map(|r| r * r).sum::<f64>() / kept.len().max(1) as f64).sqrt();
    let (lo, hi) = kept
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &r| {
            (lo.min(r), hi.max(r))
        });
    (residuals, rms, hi - lo)
}

fn masked(values: &[f64], mask: &[bool]) -> Vec<f64> {
    values
        .iter()
        .zip(mask)
        .filter_map(|(v, &m)| m.then_some(*v))
        .collect()
}

/// Fit, then reject the single worst point, until `done(rms, ptp)` is
/// satisfied or only `deg + 2` points remain.
pub(crate) fn clip_worst_polyfit<F>(
    x: &[f64],
    y: &[f64],
    deg: usize,
    done: F,
) -> Result<ClippedFit, FitError>
where
    F: Fn(f64, f64) -> bool,
{
    let mut mask = vec![true; x.len()];
    loop {
        let coeffs = polyfit(&masked(x, &mask), &masked(y, &mask), deg)?;
        let (residuals, rms, ptp) = residual_stats(x, y, &mask, &coeffs);
        let n_kept = mask.iter().filter(|&&m| m).count();
        if done(rms, ptp) || n_kept <= deg + 2 {
            return Ok(ClippedFit {
                coeffs,
                n_removed: mask.len() - n_kept,
                mask,
                rms,
                ptp,
            });
        }
        let worst = residuals
            .iter()
            .zip(&mask)
            .enumerate()
            .filter(|(_, (_, &m))| m)
            .max_by(|(_, (a, _)), (_, (b, _))| a.abs().total_cmp(&b.abs()))
            .map(|(i, _)| i);
        match worst {
            Some(i) => mask[i] = false,
            None => {
                return Err(FitError::TooFewPoints {
                    needed: deg + 1,
                    got: 0,
                })
            }
        }
    }
}

/// Iteratively fit and reject the worst point while its absolute residual is
/// more than `nsigcut` times the median absolute residual.
pub(crate) fn robust_polyfit(
    x: &[f64],
    y: &[f64],
    deg: usize,
    nsigcut: f64,
) -> Result<ClippedFit, FitError> {
    clip_worst_polyfit_by(x, y, deg, |residuals, mask| {
        let med = nanmedian_iter(
            residuals
                .iter()
                .zip(mask)
                .filter_map(|(r, &m)| m.then_some(r.abs())),
        );
        residuals
            .iter()
            .zip(mask)
            .all(|(r, &m)| !m || med <= 0.0 || r.abs() / med <= nsigcut)
    })
}

fn clip_worst_polyfit_by<F>(x: &[f64], y: &[f64], deg: usize, done: F) -> Result<ClippedFit, FitError>
where
    F: Fn(&[f64], &[bool]) -> bool,
{
    let mut mask = vec![true; x.len()];
    loop {
        let coeffs = polyfit(&masked(x, &mask), &masked(y, &mask), deg)?;
        let (residuals, rms, ptp) = residual_stats(x, y, &mask, &coeffs);
        let n_kept = mask.iter().filter(|&&m| m).count();
        if done(&residuals, &mask) || n_kept <= deg + 2 {
            return Ok(ClippedFit {
                coeffs,
                n_removed: mask.len() - n_kept,
                mask,
                rms,
                ptp,
            });
        }
        if let Some((i, _)) = residuals
            .iter()
            .enumerate()
            .filter(|(i, _)| mask[*i])
            .max_by(|(_, a), (_, b)| a.abs().total_cmp(&b.abs()))
        {
            mask[i] = false;
        }
    }
}

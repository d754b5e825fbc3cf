// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Blaze and flat-field per order from an extracted flat.

use std::f64::consts::PI;

use log::{debug, trace, warn};
use ndarray::prelude::*;
use thiserror::Error;

use crate::{
    config::FlatConfig,
    math::{
        levenberg_marquardt, median_filter, nanargmax, nanpercentile, nanstd, FitError,
        LmOptions,
    },
    qc::QcResult,
};

#[derive(Error, Debug)]
pub(crate) enum FlatError {
    #[error("The blaze couldn't be fitted in any of the {n_orders} orders")]
    NoOrders { n_orders: usize },
}

/// `sinc^2` is at half its peak here.
const SINC2_HALF_MAX: f64 = 1.391_557_4;

/// The blaze function `A * sinc^2(phi) * (1 + S (x - x0))` with
/// `phi = pi u (1 + q u)` and `u = (x - x0) / P`. Parameters are
/// `[A, P, x0, q, S]`.
pub(crate) fn blaze_model(x: f64, p: &[f64]) -> f64 {
    let u = (x - p[2]) / p[1];
    let phi = PI * u * (1.0 + p[3] * u);
    let sinc = if phi.abs() < 1e-12 { 1.0 } else { phi.sin() / phi };
    p[0] * sinc * sinc * (1.0 + p[4] * (x - p[2]))
}

#[derive(Debug, Clone)]
pub(crate) struct FlatBlaze {
    pub(crate) flat: Array2<f64>,
    pub(crate) blaze: Array2<f64>,
    /// Per-order RMS of the flat.
    pub(crate) rms: Vec<f64>,
    pub(crate) qc: QcResult,
}

/// The flux level of an order: a high percentile, so that a few hot or
/// cosmic-ray pixels don't set it.
fn order_level(values: &[f64]) -> f64 {
    nanpercentile(values, 95.0)
}

/// Which pixels of an order can constrain the blaze. Unilluminated columns
/// and the faint ends of the order pull a sinc^2 away from its peak, so only
/// pixels above `peak_cut` of the order's level are used, and nothing
/// brighter than twice that level.
fn fit_mask(spectrum: &[f64], smooth: &[f64], level: f64, peak_cut: f64) -> Vec<bool> {
    spectrum
        .iter()
        .zip(smooth)
        .map(|(&v, &s)| {
            v.is_finite() && v > peak_cut * level && s >= peak_cut * level && s <= 2.0 * level
        })
        .collect()
}

/// Fit the blaze function to one order. Returns the parameters.
pub(crate) fn fit_blaze(spectrum: &[f64], config: &FlatConfig) -> Result<Vec<f64>, FitError> {
    let n = spectrum.len();
    let smooth = median_filter(spectrum, 11);
    let peak = order_level(&smooth);
    if peak.is_nan() || peak <= 0.0 {
        return Err(FitError::NonFinite);
    }
    let mut mask = fit_mask(spectrum, &smooth, peak, config.peak_cut);
    let n_usable = mask.iter().filter(|&&m| m).count();
    if n_usable < 5 {
        return Err(FitError::TooFewPoints {
            needed: 5,
            got: n_usable,
        });
    }
    let masked: Vec<f64> = smooth
        .iter()
        .zip(&mask)
        .map(|(&v, &m)| if m { v } else { f64::NAN })
        .collect();
    let centre = nanargmax(&masked).ok_or(FitError::TooFewPoints { needed: 5, got: 0 })?;
    let n_above = masked.iter().filter(|&&v| v >= 0.5 * peak).count().max(2);
    let period = PI * (n_above as f64 / 2.0) / SINC2_HALF_MAX;

    let nf = n as f64;
    let bounds = [
        (0.0, 10.0 * peak),
        (0.1 * period, 10.0 * period),
        (-nf, 2.0 * nf),
        (-0.5, 0.5),
        (-1.0 / nf, 1.0 / nf),
    ];
    let mut params = vec![peak, period, centre as f64, 0.0, 0.0];
    let opts = LmOptions::default();

    for iteration in 0..config.n_iterations.max(1) {
        let (x, y): (Vec<f64>, Vec<f64>) = spectrum
            .iter()
            .enumerate()
            .filter(|(i, _)| mask[*i])
            .map(|(i, &v)| (i as f64, v))
            .unzip();
        let result = levenberg_marquardt(blaze_model, &x, &y, None, &params, Some(&bounds), &opts)?;
        trace!(
            "Blaze pass {iteration}: chi2 {:.4e} after {} iterations",
            result.chi2,
            result.iterations
        );
        params = result.params;

        let residuals: Vec<f64> = spectrum
            .iter()
            .enumerate()
            .map(|(i, &v)| v - blaze_model(i as f64, &params))
            .collect();
        let kept: Vec<f64> = residuals
            .iter()
            .zip(&mask)
            .filter_map(|(r, &m)| m.then_some(*r))
            .collect();
        let sigma = nanstd(&kept);
        let mut n_clipped = 0;
        for (m, r) in mask.iter_mut().zip(&residuals) {
            if *m && r.abs() > config.n_sigma * sigma {
                *m = false;
                n_clipped += 1;
            }
        }
        debug!(
            "Blaze iteration {}: {n_clipped} points clipped, sigma {sigma:.2}",
            iteration + 1
        );
        if n_clipped == 0 {
            break;
        }
    }
    Ok(params)
}

/// Split an extracted flat (orders x columns) into its blaze and the
/// remaining flat field. Orders whose blaze can't be fitted are left NaN.
pub(crate) fn make_flat(e2ds: ArrayView2<f64>, config: &FlatConfig) -> Result<FlatBlaze, FlatError> {
    let (n_orders, nx) = e2ds.dim();
    let mut flat = Array2::from_elem((n_orders, nx), f64::NAN);
    let mut blaze = Array2::from_elem((n_orders, nx), f64::NAN);
    let mut rms = vec![f64::NAN; n_orders];
    let mut n_failed = 0;

    for (order, spectrum) in e2ds.outer_iter().enumerate() {
        let spectrum = spectrum.to_vec();
        let params = match fit_blaze(&spectrum, config) {
            Ok(p) => p,
            Err(e) => {
                warn!("Couldn't fit the blaze of order {order}: {e}");
                n_failed += 1;
                continue;
            }
        };
        let level = order_level(&spectrum);
        for x in 0..nx {
            let model = blaze_model(x as f64, &params);
            let v = spectrum[x];
            if v.is_finite() && v >= config.peak_cut * level && model >= config.peak_cut * params[0] {
                blaze[[order, x]] = model;
                flat[[order, x]] = v / model;
            }
        }
        rms[order] = nanstd(&flat.row(order).to_vec());
    }

    if n_failed == n_orders {
        return Err(FlatError::NoOrders { n_orders });
    }

    let worst = rms.iter().copied().filter(|v| v.is_finite()).fold(f64::NAN, f64::max);
    let mut qc = QcResult::new();
    qc.check_max("FLAT_RMS", worst, config.max_rms);
    qc.inform("FLAT_NFAILED", n_failed as f64, "informational", n_failed == 0);
    Ok(FlatBlaze {
        flat,
        blaze,
        rms,
        qc,
    })
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! FP drifts, measured against the reference FP of the master wavelength
//! solution.
//!
//! The estimator is that of Bouchy, Pepe & Queloz (2001): every pixel
//! contributes `(spe - ref) / (dref/dv)`, weighted by the inverse of its
//! photon-noise variance. Before comparing, the spectrum is renormalised to
//! the reference order by order, and pixels that disagree with the reference
//! far more than the rest of their order (cosmics) are replaced by the scaled
//! reference.

use log::debug;
use ndarray::prelude::*;

use crate::{
    config::DriftConfig,
    constants::SPEED_OF_LIGHT_MS,
    math::{nanstd, nansum},
    qc::QcResult,
};

#[derive(Debug, Clone)]
pub(crate) struct DriftMeasurement {
    /// \[m/s\], positive when the spectrum moved to larger wavelengths.
    pub(crate) per_order: Vec<f64>,
    /// \[m/s\]
    pub(crate) per_order_error: Vec<f64>,
    /// Photon-noise weighted mean of `per_order` \[m/s\].
    pub(crate) mean: f64,
    /// \[m/s\]
    pub(crate) error: f64,
    /// The flux ratio of the spectrum to the reference, per order.
    pub(crate) flux_ratio: Vec<f64>,
    pub(crate) n_cosmics: usize,
    pub(crate) qc: QcResult,
}

/// Pixels to use: below the saturation level, and at least `box_size` pixels
/// from any saturated pixel. Non-finite pixels are masked on their own.
fn good_pixels(row: ArrayView1<f64>, saturated: impl Fn(usize) -> bool, box_size: usize) -> Vec<bool> {
    let n = row.len();
    let mut good: Vec<bool> = row.iter().map(|v| v.is_finite()).collect();
    for i in (0..n).filter(|&i| saturated(i)) {
        let lo = i.saturating_sub(box_size);
        let hi = (i + box_size).min(n - 1);
        good[lo..=hi].iter_mut().for_each(|g| *g = false);
    }
    good
}

/// `(λ / Δλ, Δf / σ², σ²)` at pixel `x` of a spectrum, where the differences
/// are taken across the neighbouring pixels.
fn gradient_terms(spe: ArrayView1<f64>, wave: ArrayView1<f64>, x: usize, noise: f64) -> (f64, f64, f64) {
    let nwave = wave[x] / (wave[x + 1] - wave[x - 1]);
    let sxn = spe[x] + noise * noise;
    let nspe = (spe[x + 1] - spe[x - 1]) / sxn;
    (nwave, nspe, sxn)
}

/// The squared photon-noise velocity uncertainty of every order \[(m/s)²\],
/// and the uncertainty of their combination \[m/s\].
pub(crate) fn photon_noise(
    spe: ArrayView2<f64>,
    wave: ArrayView2<f64>,
    config: &DriftConfig,
) -> (Vec<f64>, f64) {
    let dvrms2: Vec<f64> = spe
        .outer_iter()
        .zip(wave.outer_iter())
        .map(|(row, w)| {
            let flag = good_pixels(row, |i| row[i] >= config.max_flux, config.box_size);
            let total: f64 = (1..row.len().saturating_sub(1))
                .filter(|&x| flag[x - 1] && flag[x] && flag[x + 1])
                .map(|x| {
                    let (nwave, nspe, sxn) = gradient_terms(row, w, x, config.noise);
                    sxn * (nwave * nspe).powi(2)
                })
                .filter(|v| v.is_finite())
                .sum();
            SPEED_OF_LIGHT_MS.powi(2) / total.abs()
        })
        .collect();
    let weighted = 1.0 / nansum(&dvrms2.iter().map(|v| 1.0 / v).collect::<Vec<_>>()).sqrt();
    (dvrms2, weighted)
}

/// Scale `spe` to the flux of `reference` order by order, replacing cosmics
/// with the reference. Returns the renormalised spectrum, the flux
/// ratio of each order and the number of pixels replaced.
pub(crate) fn renormalise_cosmics(
    reference: ArrayView2<f64>,
    spe: ArrayView2<f64>,
    config: &DriftConfig,
) -> (Array2<f64>, Vec<f64>, usize) {
    let mut out = Array2::from_elem(spe.dim(), f64::NAN);
    let mut ratios = Vec::with_capacity(spe.nrows());
    let mut n_cosmics = 0;
    for ((r, s), mut o) in reference
        .outer_iter()
        .zip(spe.outer_iter())
        .zip(out.outer_iter_mut())
    {
        let n = s.len();
        let flag = good_pixels(
            s,
            |i| s[i] >= config.max_flux || r[i] >= config.max_flux,
            config.box_size,
        );
        let masked = |row: ArrayView1<f64>| -> Vec<f64> {
            row.iter()
                .zip(flag.iter())
                .map(|(&v, &g)| if g { v } else { 0.0 })
                .collect()
        };
        let rf = masked(r);
        let sf = masked(s);
        let norm = nansum(&sf) / nansum(&rf);
        let mean_total = (nansum(&rf) + nansum(&sf)) / n as f64;
        let z: Vec<f64> = rf
            .iter()
            .zip(sf.iter())
            .map(|(&r, &s)| (r - s / norm) / (s / norm + r + mean_total))
            .collect();
        let nonzero: Vec<f64> = z
            .iter()
            .map(|&v| if v.abs() > 0.0 { v } else { f64::NAN })
            .collect();
        let rms = nanstd(&nonzero);
        let cosmic: Vec<bool> = z.iter().map(|v| v.abs() > config.cosmic_cut * rms).collect();
        n_cosmics += cosmic.iter().filter(|&&c| c).count();
        let kept = |row: &[f64]| -> f64 {
            row.iter()
                .zip(cosmic.iter())
                .filter(|(_, &c)| !c)
                .map(|(&v, _)| v)
                .filter(|v| v.is_finite())
                .sum()
        };
        let ratio = kept(&sf) / kept(&rf);
        o.iter_mut()
            .zip(sf.iter().zip(rf.iter()).zip(cosmic.iter()))
            .for_each(|(o, ((&s, &r), &c))| *o = if c { r } else { s / ratio });
        ratios.push(ratio);
    }
    (out, ratios, n_cosmics)
}

/// The velocity of `spe` relative to `reference` in every order \[m/s\].
/// The sign is that of the wavelength shift.
pub(crate) fn rv_drifts(
    reference: ArrayView2<f64>,
    spe: ArrayView2<f64>,
    wave: ArrayView2<f64>,
    config: &DriftConfig,
) -> Vec<f64> {
    reference
        .outer_iter()
        .zip(spe.outer_iter())
        .zip(wave.outer_iter())
        .map(|((r, s), w)| {
            let flag = good_pixels(
                r,
                |i| {
                    r[i] >= config.max_flux
                        || s[i] >= config.max_flux
                        || r[i] - s[i] >= config.max_flux / 10.0
                },
                config.box_size,
            );
            let (mut sum1, mut sum2) = (0.0, 0.0);
            for x in (1..r.len().saturating_sub(1)).filter(|&x| flag[x - 1] && flag[x] && flag[x + 1]) {
                let (nwave, nspe, sxn) = gradient_terms(r, w, x, config.noise);
                let a = nwave * nspe * (s[x] - r[x]);
                let b = sxn * (nwave * nspe).powi(2);
                if a.is_finite() && b.is_finite() {
                    sum1 += a;
                    sum2 += b;
                }
            }
            -SPEED_OF_LIGHT_MS * sum1 / sum2
        })
        .collect()
}

/// Measure the drift of `spe` relative to `reference`, both extracted FP
/// spectra on the wavelength grid `wave`.
pub(crate) fn measure_drift(
    reference: ArrayView2<f64>,
    spe: ArrayView2<f64>,
    wave: ArrayView2<f64>,
    config: &DriftConfig,
) -> DriftMeasurement {
    let (dvrms_ref, _) = photon_noise(reference, wave, config);
    let (dvrms_spe, weighted) = photon_noise(spe, wave, config);
    debug!("Photon noise of the spectrum: {weighted:.3} m/s");

    let (spen, flux_ratio, n_cosmics) = renormalise_cosmics(reference, spe, config);
    let per_order = rv_drifts(reference, spen.view(), wave, config);
    let per_order_error: Vec<f64> = dvrms_ref
        .iter()
        .zip(dvrms_spe.iter())
        .map(|(r, s)| (r + s).sqrt())
        .collect();

    let (mut num, mut den, mut inv_var) = (0.0, 0.0, 0.0);
    for ((&d, &e), &r) in per_order.iter().zip(per_order_error.iter()).zip(dvrms_ref.iter()) {
        if d.is_finite() && e.is_finite() && e > 0.0 && r.is_finite() && r > 0.0 {
            num += d / r;
            den += 1.0 / r;
            inv_var += 1.0 / (e * e);
        }
    }
    let mean = num / den;
    let error = 1.0 / inv_var.sqrt();

    let mut qc = QcResult::new();
    qc.check("DRIFT", mean, "DRIFT is finite", mean.is_finite());
    qc.check_max("DRIFT_ERR", error, config.max_error);
    qc.inform("DRIFT_NCOSMIC", n_cosmics as f64, "informational", true);

    DriftMeasurement {
        per_order,
        per_order_error,
        mean,
        error,
        flux_ratio,
        n_cosmics,
        qc,
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Telluric absorption: transmission maps from hot stars, and the correction
//! of science spectra.
//!
//! Absorption is modelled against a pre-convolved atmospheric template with
//! two species, water and everything else ("others"), each raised to its own
//! optical-depth exponent. Hot-star maps are gathered into a PCA of the
//! absorbance, which then corrects science frames.

mod fit;
mod pca;
mod preclean;
mod template;

pub(crate) use fit::{fit_telluric, AtmosphereInputs};
pub(crate) use pca::TelluricPca;
pub(crate) use preclean::{preclean, Preclean};
pub(crate) use template::{make_template, StellarTemplate, TemplateFrame};

use ndarray::prelude::*;
use thiserror::Error;

use crate::{
    constants::SPEED_OF_LIGHT_KMS,
    io::tables::{TransmissionTemplate, WeightedLine},
    math::{gaussian_kernel, interp_linear, median_filter, nan_convolve_same, FitError},
};

#[derive(Error, Debug)]
pub(crate) enum TelluricError {
    #[error("All {n_orders} orders are below the SNR threshold of {min_snr}")]
    NoOrders { n_orders: usize, min_snr: f64 },

    #[error("The transmission template doesn't cover the spectrum ({start:.3} - {end:.3} nm)")]
    NoTemplateOverlap { start: f64, end: f64 },

    #[error("Too few telluric mask lines fall on the spectrum ({found})")]
    TooFewMaskLines { found: usize },

    #[error("Transmission maps have inconsistent shapes: expected {expected:?}, got {got:?}")]
    MapShape {
        expected: (usize, usize),
        got: (usize, usize),
    },

    #[error("No pixel is defined in every transmission map")]
    NoCommonPixels,

    #[error("No spectra to combine into a template")]
    NoFrames,

    #[error(transparent)]
    Fit(#[from] FitError),
}

/// The atmospheric template with its absorber-specific exponents applied.
#[derive(Debug, Clone)]
pub(crate) struct Atmosphere<'a> {
    pub(crate) template: &'a TransmissionTemplate,
    pub(crate) expo_water: f64,
    pub(crate) expo_others: f64,
    /// Velocity of the absorption relative to the spectrum \[km/s\].
    pub(crate) velocity: f64,
}

impl<'a> Atmosphere<'a> {
    /// The template's rest wavelength observed at `wavelength`.
    fn rest(&self, wavelength: f64) -> f64 {
        wavelength / (1.0 + self.velocity / SPEED_OF_LIGHT_KMS)
    }

    /// Model transmission at one wavelength. NaN outside the template.
    pub(crate) fn transmission(&self, wavelength: f64) -> f64 {
        let w = self.rest(wavelength);
        let water = interp_linear(w, &self.template.wave, &self.template.water);
        let others = interp_linear(w, &self.template.wave, &self.template.others);
        water.max(0.0).powf(self.expo_water) * others.max(0.0).powf(self.expo_others)
    }

    /// Model transmission of every pixel of a wave map.
    pub(crate) fn transmission_map(&self, wave: ArrayView2<f64>) -> Array2<f64> {
        wave.mapv(|w| self.transmission(w))
    }
}

/// A smooth estimate of a spectral energy distribution: a running median,
/// then Gaussian smoothing, order by order.
pub(crate) fn estimate_sed(spectrum: ArrayView2<f64>, window: usize, smooth: f64) -> Array2<f64> {
    let kernel = gaussian_kernel(smooth, 3.0);
    let mut sed = Array2::from_elem(spectrum.dim(), f64::NAN);
    for (row, mut out) in spectrum.outer_iter().zip(sed.outer_iter_mut()) {
        let med = median_filter(&row.to_vec(), window.max(1));
        let smoothed = nan_convolve_same(&med, &kernel);
        out.iter_mut()
            .zip(smoothed)
            .zip(row.iter())
            .for_each(|((o, s), &v)| {
                if v.is_finite() && s.is_finite() && s > 0.0 {
                    *o = s;
                }
            });
    }
    sed
}

/// Like [`estimate_sed`], but for a star whose lines are known: the smooth
/// part is estimated from `spectrum / stellar` and the lines multiplied back
/// in.
pub(crate) fn estimate_sed_with(
    spectrum: ArrayView2<f64>,
    stellar: Option<ArrayView2<f64>>,
    window: usize,
    smooth: f64,
) -> Array2<f64> {
    match stellar {
        None => estimate_sed(spectrum, window, smooth),
        Some(stellar) => {
            let mut lines = stellar.to_owned();
            lines.mapv_inplace(|v| if v.is_finite() && v > 0.0 { v } else { 1.0 });
            let continuum = estimate_sed((&spectrum / &lines).view(), window, smooth);
            continuum * lines
        }
    }
}

/// Mask lines that fall inside the wavelength range of at least one order.
fn lines_on_spectrum(lines: &[WeightedLine], wave: ArrayView2<f64>) -> Vec<WeightedLine> {
    let ranges: Vec<(f64, f64)> = wave
        .outer_iter()
        .map(|row| {
            row.iter()
                .filter(|v| v.is_finite())
                .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
                    (lo.min(v), hi.max(v))
                })
        })
        .collect();
    lines
        .iter()
        .filter(|l| {
            l.weight > 0.0
                && ranges
                    .iter()
                    .any(|(lo, hi)| l.wavelength > *lo && l.wavelength < *hi)
        })
        .copied()
        .collect()
}

/// Interpolate an E2DS at a wavelength, searching every order. Orders are
/// averaged where they overlap.
fn sample_spectrum(values: ArrayView2<f64>, wave: ArrayView2<f64>, wavelength: f64) -> f64 {
    let mut sum = 0.0;
    let mut n = 0;
    for (row, w) in values.outer_iter().zip(wave.outer_iter()) {
        let (Some(w), Some(v)) = (w.as_slice(), row.as_slice()) else {
            continue;
        };
        let s = interp_linear(wavelength, w, v);
        if s.is_finite() {
            sum += s;
            n += 1;
        }
    }
    if n == 0 {
        f64::NAN
    } else {
        sum / n as f64
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Resampling of E2DS orders onto a single 1D grid.

use ndarray::prelude::*;
use strum_macros::{Display, EnumIter};

use crate::{
    config::S1dConfig,
    constants::SPEED_OF_LIGHT_KMS,
    io::{header::Header, product::Product},
    math::{interp_linear, lanczos},
};

#[derive(Debug, Display, EnumIter, Clone, Copy, PartialEq, Eq)]
pub(crate) enum S1dGrid {
    /// Constant steps in wavelength.
    #[strum(serialize = "w")]
    Wavelength,
    /// Constant steps in velocity.
    #[strum(serialize = "v")]
    Velocity,
}

#[derive(Debug, Clone)]
pub(crate) struct S1d {
    /// \[nm\]
    pub(crate) wave: Vec<f64>,
    pub(crate) flux: Vec<f64>,
    /// The summed blaze weight of every bin.
    pub(crate) weight: Vec<f64>,
}

impl S1d {
    pub(crate) fn to_product(&self, header: Header) -> Product {
        let flux = Array2::from_shape_vec((1, self.flux.len()), self.flux.clone())
            .unwrap_or_else(|_| Array2::zeros((1, 0)));
        Product::new(flux, header)
            .with_vector("WAVE", &self.wave)
            .with_vector("WEIGHT", &self.weight)
    }
}

/// The output grid over `[start, end]`.
pub(crate) fn make_grid(kind: S1dGrid, start: f64, end: f64, config: &S1dConfig) -> Vec<f64> {
    if !(start.is_finite() && end.is_finite()) || end <= start {
        return vec![];
    }
    match kind {
        S1dGrid::Wavelength => {
            let n = ((end - start) / config.bin_wave).floor() as usize + 1;
            (0..n).map(|i| start + i as f64 * config.bin_wave).collect()
        }
        S1dGrid::Velocity => {
            let ratio = config.bin_velocity / SPEED_OF_LIGHT_KMS;
            let n = ((end / start).ln() / ratio).floor() as usize + 1;
            (0..n).map(|i| start * (i as f64 * ratio).exp()).collect()
        }
    }
}

/// Resample one order at fractional pixel `x` with a Lanczos kernel. NaN
/// when less than `min_valid` of the kernel weight lands on finite pixels.
fn resample(spectrum: ArrayView1<f64>, x: f64, a: f64, min_valid: f64) -> f64 {
    let n = spectrum.len() as i64;
    let base = x.floor() as i64;
    let reach = a.ceil() as i64;
    let (mut sum, mut wsum, mut total, mut valid) = (0.0, 0.0, 0.0, 0.0);
    for j in base - reach + 1..=base + reach {
        let w = lanczos(x - j as f64, a);
        total += w.abs();
        if j < 0 || j >= n {
            continue;
        }
        let v = spectrum[j as usize];
        if v.is_finite() {
            sum += w * v;
            wsum += w;
            valid += w.abs();
        }
    }
    if total <= 0.0 || valid / total < min_valid || wsum == 0.0 {
        return f64::NAN;
    }
    sum / wsum
}

/// Combine the orders of a flux-normalised E2DS into one spectrum. `wave`
/// holds the wavelength of every E2DS pixel and `blaze_norm` the normalised
/// blaze, which weighs overlapping orders.
pub(crate) fn make_s1d(
    e2ds: ArrayView2<f64>,
    wave: ArrayView2<f64>,
    blaze_norm: ArrayView2<f64>,
    kind: S1dGrid,
    config: &S1dConfig,
) -> S1d {
    let finite = || wave.iter().copied().filter(|v| v.is_finite());
    let start = config
        .wave_start
        .unwrap_or_else(|| finite().fold(f64::INFINITY, f64::min));
    let end = config
        .wave_end
        .unwrap_or_else(|| finite().fold(f64::NEG_INFINITY, f64::max));
    let grid = make_grid(kind, start, end, config);

    let mut num = vec![0.0; grid.len()];
    let mut den = vec![0.0; grid.len()];
    for ((spectrum, wave_row), blaze_row) in e2ds
        .outer_iter()
        .zip(wave.outer_iter())
        .zip(blaze_norm.outer_iter())
    {
        let w = wave_row.to_vec();
        let pixels: Vec<f64> = (0..w.len()).map(|i| i as f64).collect();
        let b = blaze_row.to_vec();
        for (i, &lambda) in grid.iter().enumerate() {
            let x = interp_linear(lambda, &w, &pixels);
            if !x.is_finite() {
                continue;
            }
            let weight = interp_linear(x, &pixels, &b);
            let flux = resample(spectrum, x, config.kernel_width, config.min_valid_fraction);
            if flux.is_finite() && weight.is_finite() && weight > 0.0 {
                num[i] += weight * flux;
                den[i] += weight;
            }
        }
    }

    let flux = num
        .iter()
        .zip(&den)
        .map(|(n, d)| if *d > 0.0 { n / d } else { f64::NAN })
        .collect();
    S1d {
        wave: grid,
        flux,
        weight: den,
    }
}

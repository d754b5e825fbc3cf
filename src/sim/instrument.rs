// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! An analytic model of a small two-fibre echelle on a 256 x 512 detector.
//!
//! Orders run along rows with wavelength increasing with column. Each order
//! holds an "AB" trace with a "C" trace above it. The first amplifier (the
//! first [`AMP_WIDTH`] columns) sees no light.

use ndarray::prelude::*;
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::{Distribution, StandardNormal};

use crate::constants::SPEED_OF_LIGHT_KMS;

pub(crate) const NX: usize = 512;
pub(crate) const NY: usize = 256;
pub(crate) const N_AMPS: usize = 8;
pub(crate) const AMP_WIDTH: usize = NX / N_AMPS;
pub(crate) const N_ORDERS: usize = 6;
pub(crate) const FIBRES: [&str; 2] = ["AB", "C"];
/// \[ADU\]
pub(crate) const READ_NOISE: f64 = 10.0;

/// `m lambda = 2D` at FP peaks \[nm\].
pub(crate) const FP_TWO_D: f64 = 12.5e6;

/// Rows between the AB traces of neighbouring orders.
const ORDER_PITCH: f64 = 38.0;
/// Rows between the AB and C traces of an order.
const FIBRE_OFFSET: f64 = 13.0;
const FIRST_TRACE_ROW: f64 = 24.0;
/// Cross-dispersion sigma of every trace \[rows\].
const TRACE_SIGMA: f64 = 1.3;
/// Sigma of FP and HC lines along the dispersion \[columns\].
const LINE_SIGMA: f64 = 1.4;
/// Width of the sinc^2 blaze \[columns\].
const BLAZE_WIDTH: f64 = 420.0;
/// \[ADU/s\]
const DARK_CURRENT: f64 = 0.02;
const N_HOT_PIXELS: usize = 40;

/// The true wavelength of column `x` in `order` \[nm\].
pub(crate) fn wavelength(order: usize, x: f64) -> f64 {
    1000.0 + 6.0 * order as f64 + 0.0125 * x - 2e-6 * x * x
}

/// The true wavelength polynomial of `order`, lowest power first.
pub(crate) fn wave_coeffs(order: usize) -> [f64; 3] {
    [1000.0 + 6.0 * order as f64, 0.0125, -2e-6]
}

/// d lambda / dx \[nm per column\].
fn dispersion(x: f64) -> f64 {
    0.0125 - 4e-6 * x
}

fn trace_centre(order: usize, fibre: usize, x: f64) -> f64 {
    let dx = x - 0.5 * (AMP_WIDTH + NX) as f64;
    FIRST_TRACE_ROW + ORDER_PITCH * order as f64 + FIBRE_OFFSET * fibre as f64 + 0.002 * dx + 2e-5 * dx * dx
}

fn blaze(x: usize) -> f64 {
    if x < AMP_WIDTH {
        return 0.0;
    }
    let u = std::f64::consts::PI * (x as f64 - 0.5 * (AMP_WIDTH + NX) as f64) / BLAZE_WIDTH;
    if u.abs() < 1e-12 {
        1.0
    } else {
        (u.sin() / u).powi(2)
    }
}

#[inline]
fn gauss(d: f64, sigma: f64) -> f64 {
    (-0.5 * (d / sigma).powi(2)).exp()
}

/// The columns of the HC lines of `order`.
pub(crate) fn hc_columns(order: usize) -> Vec<f64> {
    (0..16)
        .map(|j| 82.0 + 26.0 * j as f64 + (j % 3) as f64 * 3.1 + 0.7 * order as f64)
        .filter(|&x| x < (NX - 12) as f64)
        .collect()
}

/// Relative HC line strength.
pub(crate) fn hc_strength(j: usize) -> f64 {
    0.4 + 0.6 * ((j * 7) % 5) as f64 / 4.0
}

/// A spectral line: wavelength \[nm\], depth or optical depth, sigma \[nm\].
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct SpectralLine {
    pub(crate) wavelength: f64,
    pub(crate) depth: f64,
    pub(crate) sigma: f64,
}

/// The stellar and atmospheric line lists shared by the raw frames and the
/// written catalogues.
#[derive(Debug, Clone)]
pub(crate) struct Sky {
    pub(crate) star: Vec<SpectralLine>,
    pub(crate) water: Vec<SpectralLine>,
    pub(crate) others: Vec<SpectralLine>,
}

impl Sky {
    pub(crate) fn new(seed: u64) -> Sky {
        let mut rng = StdRng::seed_from_u64(seed);
        let (lo, hi) = (wavelength(0, 0.0) - 1.0, wavelength(N_ORDERS - 1, NX as f64) + 1.0);
        let mut lines = |n: usize, depth: (f64, f64), sigma: (f64, f64)| -> Vec<SpectralLine> {
            let mut v: Vec<SpectralLine> = (0..n)
                .map(|_| SpectralLine {
                    wavelength: rng.gen_range(lo..hi),
                    depth: rng.gen_range(depth.0..depth.1),
                    sigma: rng.gen_range(sigma.0..sigma.1),
                })
                .collect();
            v.sort_by(|a, b| a.wavelength.total_cmp(&b.wavelength));
            v
        };
        // Star lines ~4 km/s wide; telluric lines ~1 column.
        let star = lines(150, (0.2, 0.6), (0.012, 0.016));
        let water = lines(60, (0.05, 0.5), (0.010, 0.014));
        let others = lines(25, (0.05, 0.3), (0.010, 0.014));
        Sky { star, water, others }
    }

    /// Water and other-absorber transmission at unit airmass.
    pub(crate) fn template(&self, lambda: f64) -> (f64, f64) {
        (optical_depth(&self.water, lambda, 1.0).exp(), optical_depth(&self.others, lambda, 1.0).exp())
    }

    fn transmission(&self, lambda: f64, water: f64, others: f64) -> f64 {
        (optical_depth(&self.water, lambda, water) + optical_depth(&self.others, lambda, others)).exp()
    }

    fn stellar(&self, lambda: f64, rv: f64) -> f64 {
        let shift = 1.0 + rv / SPEED_OF_LIGHT_KMS;
        self.star
            .iter()
            .filter(|l| (l.wavelength * shift - lambda).abs() < 6.0 * l.sigma)
            .fold(1.0, |f, l| f * (1.0 - l.depth * gauss(lambda - l.wavelength * shift, l.sigma)))
    }
}

/// Minus the optical depth of `lines` at `lambda`, scaled by `exponent`.
fn optical_depth(lines: &[SpectralLine], lambda: f64, exponent: f64) -> f64 {
    -exponent
        * lines
            .iter()
            .filter(|l| (l.wavelength - lambda).abs() < 6.0 * l.sigma)
            .map(|l| l.depth * gauss(lambda - l.wavelength, l.sigma))
            .sum::<f64>()
}

/// What one fibre sees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Light {
    Dark,
    Flat,
    Fp,
    Hc,
    /// A star seen through the atmosphere. `rv` in km/s; `None` for a
    /// featureless hot star.
    Star {
        rv: Option<f64>,
        water: f64,
        others: f64,
    },
}

impl Light {
    /// The header name of the fibre illumination.
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Light::Dark => "DARK",
            Light::Flat => "FLAT",
            Light::Fp => "FP",
            Light::Hc => "HC",
            Light::Star { .. } => "OBJ",
        }
    }

    /// Peak count rate \[ADU/s\].
    fn rate(&self) -> f64 {
        match self {
            Light::Dark => 0.0,
            Light::Flat => 2500.0,
            Light::Fp => 1200.0,
            Light::Hc => 800.0,
            Light::Star { rv: Some(_), .. } => 15.0,
            Light::Star { rv: None, .. } => 40.0,
        }
    }

    /// Relative intensity along one order.
    fn spectrum(&self, sky: &Sky, order: usize) -> Vec<f64> {
        let hc = hc_columns(order);
        (0..NX)
            .map(|x| {
                let xf = x as f64;
                let lambda = wavelength(order, xf);
                match *self {
                    Light::Dark => 0.0,
                    Light::Flat => 1.0,
                    Light::Fp => {
                        // Distance to the nearest peak, converted from peak
                        // number to columns.
                        let m = FP_TWO_D / lambda;
                        let dm_dx = FP_TWO_D / (lambda * lambda) * dispersion(xf);
                        gauss((m - m.round()) / dm_dx, LINE_SIGMA)
                    }
                    Light::Hc => hc
                        .iter()
                        .enumerate()
                        .map(|(j, &c)| hc_strength(j) * gauss(xf - c, LINE_SIGMA))
                        .sum(),
                    Light::Star { rv, water, others } => {
                        let star = rv.map(|rv| sky.stellar(lambda, rv)).unwrap_or(1.0);
                        star * sky.transmission(lambda, water, others)
                    }
                }
            })
            .collect()
    }
}

/// Detector defects that are the same in every frame.
#[derive(Debug, Clone)]
pub(crate) struct Detector {
    /// (row, column, rate \[ADU/s\])
    hot_pixels: Vec<(usize, usize, f64)>,
}

impl Detector {
    pub(crate) fn new(seed: u64) -> Detector {
        let mut rng = StdRng::seed_from_u64(seed ^ 0x5eed);
        let hot_pixels = (0..N_HOT_PIXELS)
            .map(|_| {
                (
                    rng.gen_range(0..NY),
                    rng.gen_range(0..NX),
                    rng.gen_range(20.0..80.0),
                )
            })
            .collect();
        Detector { hot_pixels }
    }

    /// Read-out structure shared by every amplifier, in amplifier
    /// coordinates.
    fn common_mode(y: usize, u: usize) -> f64 {
        6.0 * (std::f64::consts::TAU * y as f64 / 6.3).sin() + 3.0 * (std::f64::consts::TAU * u as f64 / 9.1).cos()
    }

    /// A raw frame of `exptime` seconds with `science` in the AB fibre and
    /// `reference` in the C fibre.
    pub(crate) fn expose(
        &self,
        sky: &Sky,
        science: Light,
        reference: Light,
        exptime: f64,
        seed: u64,
    ) -> Array2<f64> {
        let mut image = Array2::from_elem((NY, NX), DARK_CURRENT * exptime);
        for (fibre, light) in [science, reference].iter().enumerate() {
            let rate = light.rate();
            if rate == 0.0 {
                continue;
            }
            for order in 0..N_ORDERS {
                let spectrum = light.spectrum(sky, order);
                for (x, s) in spectrum.into_iter().enumerate() {
                    let flux = rate * exptime * s * blaze(x);
                    if flux <= 0.0 {
                        continue;
                    }
                    let yc = trace_centre(order, fibre, x as f64);
                    let lo = (yc - 6.0).floor().max(0.0) as usize;
                    let hi = ((yc + 6.0).ceil() as usize).min(NY - 1);
                    for y in lo..=hi {
                        image[[y, x]] += flux * gauss(y as f64 - yc, TRACE_SIGMA);
                    }
                }
            }
        }
        for &(y, x, rate) in &self.hot_pixels {
            image[[y, x]] += rate * exptime;
        }

        let mut rng = StdRng::seed_from_u64(seed);
        image.mapv_inplace(|v| {
            let z: f64 = StandardNormal.sample(&mut rng);
            v + z * (v.max(0.0) + READ_NOISE * READ_NOISE).sqrt()
        });
        for ((y, x), v) in image.indexed_iter_mut() {
            let (amp, u) = (x / AMP_WIDTH, x % AMP_WIDTH);
            // Odd amplifiers read out in the other direction.
            let u = if amp % 2 == 1 { AMP_WIDTH - 1 - u } else { u };
            *v += Self::common_mode(y, u);
        }
        image
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use approx::assert_abs_diff_eq;
use ndarray::prelude::*;

use super::*;

const NX: usize = 2000;

fn wave() -> Array2<f64> {
    Array2::from_shape_fn((1, NX), |(_, x)| 1000.0 + 0.005 * x as f64)
}

fn line_centres() -> Vec<f64> {
    (0..12).map(|j| 1001.0 + 0.25 * j as f64).collect()
}

fn mask(shift: f64) -> Vec<MaskLine> {
    line_centres()
        .into_iter()
        .map(|c| {
            let c = c * doppler(shift);
            MaskLine {
                start: c - 0.001,
                end: c + 0.001,
                weight: 1.0,
            }
        })
        .collect()
}

/// A continuum of 1 with 50%-deep lines of 4 km/s width, moving at `rv`.
fn spectrum(rv: f64) -> Array2<f64> {
    let centres: Vec<f64> = line_centres().iter().map(|c| c * doppler(rv)).collect();
    wave().mapv(|w| {
        1.0 - centres
            .iter()
            .map(|&c| {
                let sigma = c * 4.0 / SPEED_OF_LIGHT_KMS;
                0.5 * (-0.5 * ((w - c) / sigma).powi(2)).exp()
            })
            .sum::<f64>()
    })
}

#[test]
fn test_velocity_grid() {
    let v = velocity_grid(5.0, 2.0, 0.5);
    assert_eq!(v, [3.0, 3.5, 4.0, 4.5, 5.0, 5.5, 6.0, 6.5, 7.0]);
    assert_eq!(velocity_grid(5.0, 2.0, 0.0), [5.0]);
}

#[test]
fn test_tophat_counts_partial_pixels() {
    let values = [1.0, 2.0, 4.0];
    let edges = [0.0, 1.0, 2.0, 3.0];
    assert_abs_diff_eq!(tophat_sum(&values, &edges, 0.5, 2.25), 0.5 + 2.0 + 1.0);
}

#[test]
fn test_ccf_finds_the_stellar_velocity() {
    let spectrum = spectrum(12.0);
    let blaze = Array2::ones((1, NX));
    let config = CcfConfig::default();
    let ccf = compute_ccf(spectrum.view(), wave().view(), blaze.view(), &mask(0.0), &config).unwrap();
    assert_eq!(ccf.n_lines, 12);
    assert_eq!(ccf.velocities.len(), 121);
    assert_eq!(ccf.per_order.dim(), (1, 121));

    let fit = fit_ccf(&ccf, &config).unwrap();
    assert_abs_diff_eq!(fit.rv, 12.0, epsilon = 0.1);
    assert!(fit.contrast > 0.3 && fit.contrast < 0.6);
    assert_abs_diff_eq!(fit.fwhm, 4.0 * crate::constants::FWHM_PER_SIGMA, epsilon = 0.5);
    assert_abs_diff_eq!(fit.bisector_span, 0.0, epsilon = 0.2);

    let product = ccf_product(&ccf, Some(&fit), 3.0, Header::new());
    assert_eq!(product.image.dim(), (2, 121));
    assert_abs_diff_eq!(product.header.get_float("CCFMNRV").unwrap(), fit.rv);
    assert_eq!(product.header.get_int("CCFTLINE").unwrap(), 12);
    assert!(product.extension("FIT").is_some());
}

#[test]
fn test_minimum_beyond_the_scan_does_not_converge() {
    let spectrum = spectrum(40.0);
    let blaze = Array2::ones((1, NX));
    let config = CcfConfig::default();
    let ccf = compute_ccf(spectrum.view(), wave().view(), blaze.view(), &mask(0.0), &config).unwrap();
    assert!(matches!(fit_ccf(&ccf, &config), Err(CcfError::NotConverged { at_edge: true, .. })));
}

#[test]
fn test_shifted_mask_does_not_converge() {
    let spectrum = spectrum(0.0);
    let blaze = Array2::ones((1, NX));
    let config = CcfConfig::default();
    let ccf = compute_ccf(spectrum.view(), wave().view(), blaze.view(), &mask(1000.0), &config).unwrap();
    assert!(matches!(fit_ccf(&ccf, &config), Err(CcfError::NotConverged { .. })));

    // Without a fit, the product still carries the CCF.
    let product = ccf_product(&ccf, None, f64::NAN, Header::new());
    assert!(product.header.get_float("CCFMNRV").is_err());
}

#[test]
fn test_lines_on_bad_pixels_are_skipped() {
    let mut spectrum = spectrum(0.0);
    // Pixel 200 is 1001.0 nm, the first line.
    spectrum[[0, 200]] = f64::NAN;
    let blaze = Array2::ones((1, NX));
    let ccf = compute_ccf(spectrum.view(), wave().view(), blaze.view(), &mask(0.0), &CcfConfig::default())
        .unwrap();
    assert_eq!(ccf.n_lines, 11);

    let nothing = Array2::from_elem((1, NX), f64::NAN);
    assert!(matches!(
        compute_ccf(nothing.view(), wave().view(), blaze.view(), &mask(0.0), &CcfConfig::default()),
        Err(CcfError::NoLines { n_lines: 12 })
    ));
}

#[test]
fn test_photon_noise_scales_with_flux() {
    let s = spectrum(0.0);
    let faint = photon_noise_rv((&s * 1e4).view(), wave().view(), 0.0, 48);
    let bright = photon_noise_rv((&s * 4e4).view(), wave().view(), 0.0, 48);
    assert!(faint.is_finite() && faint > 0.0);
    assert_abs_diff_eq!(faint / bright, 2.0, epsilon = 1e-9);
}

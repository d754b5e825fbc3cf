// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use approx::assert_abs_diff_eq;
use ndarray::prelude::*;

use super::*;

#[test]
fn test_nan_statistics() {
    let v = [1.0, f64::NAN, 3.0, 2.0, f64::INFINITY, 4.0];
    assert_abs_diff_eq!(nanmedian(&v), 2.5);
    assert_abs_diff_eq!(nanmean(&v), 2.5);
    assert_abs_diff_eq!(nansum(&v), 10.0);
    assert_abs_diff_eq!(nanmax(&v), 4.0);
    assert_abs_diff_eq!(nanmin(&v), 1.0);
    assert_eq!(nanargmax(&v), Some(5));
    assert_eq!(nanargmin(&v), Some(0));
    assert_abs_diff_eq!(nanpercentile(&v, 25.0), 1.75);
    assert_abs_diff_eq!(nanstd(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]), 2.0);

    let empty = [f64::NAN, f64::NAN];
    assert!(nanmedian(&empty).is_nan());
    assert!(nanmean(&empty).is_nan());
    assert!(nanmax(&empty).is_nan());
    assert_eq!(nanargmax(&empty), None);
}

#[test]
fn test_robust_sigma_ignores_outliers() {
    let mut v: Vec<f64> = (0..1001).map(|i| ((i as f64) * 0.7).sin()).collect();
    let clean = robust_sigma(&v);
    v[10] = 1e6;
    v[20] = -1e6;
    assert_abs_diff_eq!(robust_sigma(&v), clean, epsilon = 0.01);
}

#[test]
fn test_median_filter_removes_spike() {
    let mut v = vec![1.0; 21];
    v[10] = 100.0;
    let filtered = median_filter(&v, 5);
    assert_eq!(filtered.len(), 21);
    assert_abs_diff_eq!(filtered[10], 1.0);
    assert_abs_diff_eq!(filtered[0], 1.0);
}

#[test]
fn test_convolve_same_matches_numpy() {
    // np.convolve([1, 2, 3], [0, 1, 0.5], 'same') == [1, 2.5, 4]
    let out = convolve_same(&[1.0, 2.0, 3.0], &[0.0, 1.0, 0.5]);
    assert_abs_diff_eq!(out.as_slice(), [1.0, 2.5, 4.0].as_slice());

    let kernel = gaussian_kernel(2.0, 4.0);
    assert_abs_diff_eq!(kernel.iter().sum::<f64>(), 1.0, epsilon = 1e-12);
    assert_eq!(kernel.len() % 2, 1);
}

#[test]
fn test_nan_convolve_fills_gaps() {
    let signal = [1.0, 1.0, f64::NAN, 1.0, 1.0];
    let out = nan_convolve_same(&signal, &[0.25, 0.5, 0.25]);
    for v in out {
        assert_abs_diff_eq!(v, 1.0, epsilon = 1e-12);
    }
}

#[test]
fn test_gradient() {
    let g = gradient(&[1.0, 2.0, 4.0, 7.0, 11.0]);
    assert_abs_diff_eq!(g.as_slice(), [1.0, 1.5, 2.5, 3.5, 4.0].as_slice());
}

#[test]
fn test_rot8_inverses() {
    let image = Array2::from_shape_fn((3, 5), |(y, x)| (y * 10 + x) as f64);
    for code in 0..8 {
        let rotated = rot8(image.view(), code);
        let back = rot8(rotated.view(), rot8_inverse(code));
        assert_eq!(back, image, "code {code}");
    }

    // A single counter-clockwise rotation moves the top-right corner to the
    // top-left.
    let rotated = rot8(image.view(), 1);
    assert_eq!(rotated.dim(), (5, 3));
    assert_abs_diff_eq!(rotated[[0, 0]], image[[0, 4]]);
    assert_abs_diff_eq!(rotated[[4, 0]], image[[0, 0]]);

    let flipped = rot8(image.view(), 4);
    assert_abs_diff_eq!(flipped[[0, 0]], image[[2, 0]]);
}

#[test]
fn test_percentile_bin_and_zoom() {
    let image = Array2::from_elem((8, 8), 3.0);
    let small = percentile_bin(image.view(), 2, 4, 50.0);
    assert_eq!(small.dim(), (2, 4));
    assert_abs_diff_eq!(small, Array2::from_elem((2, 4), 3.0));

    let big = zoom_bilinear(small.view(), 8, 8);
    assert_abs_diff_eq!(big, image, epsilon = 1e-12);
}

#[test]
fn test_sampling() {
    let image = Array2::from_shape_fn((4, 4), |(y, x)| (y * 4 + x) as f64);
    assert_abs_diff_eq!(sample_bilinear(image.view(), 1.5, 2.5), 8.5);
    assert_abs_diff_eq!(sample_row(image.row(0), 3.0), 3.0);
    assert!(sample_row(image.row(0), 3.5).is_nan());
    assert!(sample_bilinear(image.view(), -0.1, 1.0).is_nan());
}

#[test]
fn test_polyfit_recovers_coefficients() {
    let truth = [1200.0, 3.5e-3, -2.0e-7, 4.0e-11];
    let x: Vec<f64> = (0..4096).step_by(16).map(|v| v as f64).collect();
    let y: Vec<f64> = x.iter().map(|&x| polyval(&truth, x)).collect();
    let coeffs = polyfit(&x, &y, 3).unwrap();
    for &xi in &[0.0, 1000.0, 4095.0] {
        assert_abs_diff_eq!(polyval(&coeffs, xi), polyval(&truth, xi), epsilon = 1e-7);
    }
    assert_abs_diff_eq!(coeffs[1], truth[1], epsilon = 1e-9);

    assert!(matches!(
        polyfit(&[1.0, 2.0], &[1.0, 2.0], 2),
        Err(FitError::TooFewPoints { needed: 3, got: 2 })
    ));
    assert_eq!(polyder(&[1.0, 2.0, 3.0]), vec![2.0, 6.0]);
}

#[test]
fn test_clipped_polyfits_reject_outliers() {
    let x: Vec<f64> = (0..50).map(|v| v as f64).collect();
    let mut y: Vec<f64> = x
        .iter()
        .map(|&x| 2.0 + 0.5 * x + 0.01 * (x * 1.3).sin())
        .collect();
    y[17] += 30.0;
    y[40] -= 25.0;

    let fit = clip_worst_polyfit(&x, &y, 1, |rms, _| rms < 0.05).unwrap();
    assert_eq!(fit.n_removed, 2);
    assert!(!fit.mask[17] && !fit.mask[40]);
    assert_abs_diff_eq!(fit.coeffs[1], 0.5, epsilon = 1e-3);

    let fit = robust_polyfit(&x, &y, 1, 10.0).unwrap();
    assert!(!fit.mask[17] && !fit.mask[40]);
    assert_abs_diff_eq!(fit.coeffs[0], 2.0, epsilon = 0.01);
}

#[test]
fn test_gaussian_fit() {
    let x: Vec<f64> = (0..61).map(|v| v as f64 * 0.5 - 15.0).collect();
    let y: Vec<f64> = x
        .iter()
        .map(|&x| gauss(x, -0.4, 1.3, 2.2, 1.0) + 0.001 * x)
        .collect();
    let fit = fit_gaussian(&x, &y, [-0.3, 0.0, 3.0, 1.0], true).unwrap();
    assert!(fit.converged);
    assert_abs_diff_eq!(fit.amp, -0.4, epsilon = 1e-5);
    assert_abs_diff_eq!(fit.centre, 1.3, epsilon = 1e-5);
    assert_abs_diff_eq!(fit.sigma, 2.2, epsilon = 1e-5);
    assert_abs_diff_eq!(fit.fwhm(), 2.2 * crate::constants::FWHM_PER_SIGMA, epsilon = 1e-4);
}

#[test]
fn test_lm_respects_bounds() {
    let x: Vec<f64> = (0..20).map(|v| v as f64).collect();
    let y: Vec<f64> = x.iter().map(|&x| 3.0 * x).collect();
    let result = levenberg_marquardt(
        |x, p| p[0] * x,
        &x,
        &y,
        None,
        &[1.0],
        Some(&[(0.0, 2.0)]),
        &LmOptions::default(),
    )
    .unwrap();
    assert_abs_diff_eq!(result.params[0], 2.0);
}

#[test]
fn test_linear_minimization() {
    let samples = Array2::from_shape_fn((2, 100), |(c, i)| {
        if c == 0 {
            1.0
        } else {
            (i as f64 * 0.1).cos()
        }
    });
    let mut vector = &samples.row(0) * 0.7 + &samples.row(1) * -1.5;
    vector[3] = f64::NAN;
    let (amps, recon) = linear_minimization(vector.view(), samples.view()).unwrap();
    assert_abs_diff_eq!(amps[0], 0.7, epsilon = 1e-10);
    assert_abs_diff_eq!(amps[1], -1.5, epsilon = 1e-10);
    assert!(recon[3].is_finite());
}

#[test]
fn test_interpolation() {
    let xp = [0.0, 1.0, 2.0, 3.0];
    let fp = [0.0, 10.0, 20.0, 30.0];
    assert_abs_diff_eq!(interp_linear(1.25, &xp, &fp), 12.5);
    assert_abs_diff_eq!(interp_linear(3.0, &xp, &fp), 30.0);
    assert!(interp_linear(3.1, &xp, &fp).is_nan());

    let x: Vec<f64> = (0..20).map(|v| v as f64 * 0.5).collect();
    let y: Vec<f64> = x.iter().map(|v| v.sin()).collect();
    let spline = CubicSpline::new(&x, &y).unwrap();
    assert_abs_diff_eq!(spline.eval(2.25), 2.25f64.sin(), epsilon = 2e-3);
    assert_abs_diff_eq!(spline.eval(x[7]), y[7], epsilon = 1e-12);
    assert!(spline.eval(-1.0).is_nan());
    assert_abs_diff_eq!(spline.eval_clamped(-1.0), y[0]);

    assert_abs_diff_eq!(lanczos(0.0, 3.0), 1.0);
    assert_abs_diff_eq!(lanczos(1.0, 3.0), 0.0, epsilon = 1e-12);
    assert_abs_diff_eq!(lanczos(3.5, 3.0), 0.0);
}

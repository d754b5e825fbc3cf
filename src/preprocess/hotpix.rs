// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Hot-pixel detection and repair.
//!
//! A pixel is hot when it sits more than `nsig` local sigmas away from a
//! low-pass version of the image. The low-pass runs along the dispersion axis
//! only; cross-dispersion, the orders are too narrow for a median to follow
//! them. Bad pixels are replaced by a 2D quadratic through their valid 3x3
//! neighbours.

use nalgebra::{DMatrix, DVector};
use ndarray::prelude::*;

use crate::math::{median_filter, nan_convolve_same, nanmedian, nanmedian_iter};

/// Width of the median and boxcar used for the low-pass.
const LOWPASS_WIDTH: usize = 5;

/// Offsets of the 8 neighbours of a pixel.
const NEIGHBOURS: [(isize, isize); 8] = [
    (-1, -1),
    (-1, 0),
    (-1, 1),
    (0, -1),
    (0, 1),
    (1, -1),
    (1, 0),
    (1, 1),
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct HotPixelStats {
    pub(crate) n_flagged: usize,
    pub(crate) n_imputed: usize,
}

/// A median followed by a boxcar along each lane of `axis`.
pub(crate) fn lowpass_along(image: ArrayView2<f64>, axis: Axis) -> Array2<f64> {
    let boxcar = vec![1.0 / LOWPASS_WIDTH as f64; LOWPASS_WIDTH];
    let mut out = image.to_owned();
    for mut lane in out.lanes_mut(axis) {
        let values = lane.to_vec();
        let smoothed = nan_convolve_same(&median_filter(&values, LOWPASS_WIDTH), &boxcar);
        lane.assign(&Array1::from(smoothed));
    }
    out
}

/// The 3x3 median of each pixel's neighbourhood, truncated at the edges.
fn local_median(values: ArrayView2<f64>) -> Array2<f64> {
    let (ny, nx) = values.dim();
    Array2::from_shape_fn((ny, nx), |(y, x)| {
        let window = values.slice(s![
            y.saturating_sub(1)..(y + 2).min(ny),
            x.saturating_sub(1)..(x + 2).min(nx)
        ]);
        nanmedian_iter(window.iter().copied())
    })
}

/// Flag hot (and non-finite) pixels. `dispersion` is the axis along which the
/// spectrum varies slowly.
pub(crate) fn find_hot_pixels(image: ArrayView2<f64>, dispersion: Axis, nsig: f64) -> Array2<bool> {
    let residual = &image - &lowpass_along(image, dispersion);
    let abs_residual = residual.mapv(f64::abs);
    let mut rms = local_median(abs_residual.view());
    let floor = 0.5 * nanmedian(&rms.iter().copied().collect::<Vec<_>>());
    if floor.is_finite() {
        rms.mapv_inplace(|r| if r.is_finite() { r.max(floor) } else { floor });
    }

    Array2::from_shape_fn(image.dim(), |(y, x)| {
        let v = image[[y, x]];
        if !v.is_finite() {
            return true;
        }
        let ratio = abs_residual[[y, x]] / rms[[y, x]];
        ratio > nsig
    })
}

/// The value at (0, 0) of the least-squares quadratic
/// `a + b dx + c dy + d dx^2 + e dy^2 + f dx dy` through the given points.
fn quadratic_at_centre(points: &[(f64, f64, f64)]) -> Option<f64> {
    let n = points.len();
    let a = DMatrix::from_fn(n, 6, |i, j| {
        let (dy, dx, _) = points[i];
        match j {
            0 => 1.0,
            1 => dx,
            2 => dy,
            3 => dx * dx,
            4 => dy * dy,
            _ => dx * dy,
        }
    });
    let b = DVector::from_fn(n, |i, _| points[i].2);
    let svd = a.svd(true, true);
    // Some sparse neighbourhoods don't constrain every term.
    if svd.rank(1e-9) < 6 {
        return None;
    }
    let solution = svd.solve(&b, 1e-12).ok()?;
    let v = solution[0];
    v.is_finite().then_some(v)
}

/// Replace bad pixels using their valid neighbours. Pixels with 5 or fewer
/// valid neighbours are left alone. Returns the number of repaired pixels.
pub(crate) fn impute_bad_pixels(image: &mut Array2<f64>, bad: ArrayView2<bool>) -> usize {
    let (ny, nx) = image.dim();
    let snapshot = image.clone();
    let mut n_imputed = 0;

    for ((y, x), &is_bad) in bad.indexed_iter() {
        if !is_bad {
            continue;
        }
        let mut points = Vec::with_capacity(8);
        for &(dy, dx) in &NEIGHBOURS {
            let (yy, xx) = (y as isize + dy, x as isize + dx);
            if yy < 0 || xx < 0 || yy >= ny as isize || xx >= nx as isize {
                continue;
            }
            let (yy, xx) = (yy as usize, xx as usize);
            let v = snapshot[[yy, xx]];
            if !bad[[yy, xx]] && v.is_finite() {
                points.push((dy as f64, dx as f64, v));
            }
        }

        let value = match points.len() {
            8 => {
                // Exact for quadratics: 0.5 * edges - 0.25 * corners.
                let (edges, corners) = points.iter().fold((0.0, 0.0), |(e, c), &(dy, dx, v)| {
                    if dy == 0.0 || dx == 0.0 {
                        (e + v, c)
                    } else {
                        (e, c + v)
                    }
                });
                Some(0.5 * edges - 0.25 * corners)
            }
            6 | 7 => quadratic_at_centre(&points),
            _ => None,
        };
        if let Some(v) = value {
            image[[y, x]] = v;
            n_imputed += 1;
        }
    }
    n_imputed
}

/// Find and repair hot pixels in place.
pub(crate) fn clean_hot_pixels(image: &mut Array2<f64>, dispersion: Axis, nsig: f64) -> HotPixelStats {
    let bad = find_hot_pixels(image.view(), dispersion, nsig);
    let n_flagged = bad.iter().filter(|&&b| b).count();
    let n_imputed = impute_bad_pixels(image, bad.view());
    HotPixelStats {
        n_flagged,
        n_imputed,
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;

    fn quadratic(y: f64, x: f64) -> f64 {
        3.0 + 0.5 * x - 0.2 * y + 0.03 * x * x + 0.01 * y * y - 0.02 * x * y
    }

    #[test]
    fn test_eight_neighbour_closed_form_is_exact() {
        let mut image = Array2::from_shape_fn((5, 5), |(y, x)| quadratic(y as f64, x as f64));
        let truth = image[[2, 2]];
        image[[2, 2]] = 1e6;
        let mut bad = Array2::from_elem((5, 5), false);
        bad[[2, 2]] = true;
        assert_eq!(impute_bad_pixels(&mut image, bad.view()), 1);
        assert_abs_diff_eq!(image[[2, 2]], truth, epsilon = 1e-9);
    }

    #[test]
    fn test_least_squares_with_seven_neighbours() {
        let mut image = Array2::from_shape_fn((5, 5), |(y, x)| quadratic(y as f64, x as f64));
        let truth = image[[2, 2]];
        image[[2, 2]] = f64::NAN;
        image[[1, 1]] = f64::NAN;
        let bad = image.mapv(|v| !v.is_finite());
        impute_bad_pixels(&mut image, bad.view());
        assert_abs_diff_eq!(image[[2, 2]], truth, epsilon = 1e-9);
    }

    #[test]
    fn test_sparse_neighbourhoods_are_not_imputed() {
        let mut image = Array2::from_elem((3, 3), 1.0);
        for (y, x) in [(0, 0), (0, 1), (0, 2), (1, 1)] {
            image[[y, x]] = f64::NAN;
        }
        let bad = image.mapv(|v| !v.is_finite());
        // The centre has only 5 valid neighbours.
        impute_bad_pixels(&mut image, bad.view());
        assert!(image[[1, 1]].is_nan());
    }

    #[test]
    fn test_isolated_hot_pixel_is_found_and_repaired() {
        // Smooth orders along x with some texture.
        let mut image = Array2::from_shape_fn((40, 60), |(y, x)| {
            let profile = (-0.5 * ((y as f64 % 10.0 - 5.0) / 1.5).powi(2)).exp();
            1000.0 * profile * (1.0 + 0.1 * (x as f64 / 9.0).sin())
                + ((x * 7 + y * 13) % 5) as f64
        });
        let truth = image[[12, 30]];
        image[[12, 30]] += 5000.0;
        image[[30, 3]] = f64::NAN;

        let stats = clean_hot_pixels(&mut image, Axis(1), 10.0);
        assert!(stats.n_flagged >= 2);
        assert!(stats.n_imputed >= 2);
        assert!((image[[12, 30]] - truth).abs() < 50.0);
        assert!(image[[30, 3]].is_finite());
    }

    #[test]
    fn test_cleaning_is_deterministic() {
        let make = || {
            let mut image =
                Array2::from_shape_fn((20, 30), |(y, x)| ((x * 31 + y * 17) % 11) as f64);
            image[[5, 5]] = 1e4;
            image
        };
        let mut a = make();
        let mut b = make();
        clean_hot_pixels(&mut a, Axis(0), 10.0);
        clean_hot_pixels(&mut b, Axis(0), 10.0);
        assert_eq!(a, b);
    }
}

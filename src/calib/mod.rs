// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Calibration primitives: everything that turns preprocessed calibration
//! frames into dark, bad-pixel, localisation, shape, flat/blaze, thermal and
//! wavelength models, and FP drifts.

pub(crate) mod badpix;
pub(crate) mod dark;
pub(crate) mod drift;
pub(crate) mod flat;
pub(crate) mod loc;
pub(crate) mod shape;
pub(crate) mod thermal;
pub(crate) mod wave;

use ndarray::prelude::*;

use crate::math::nanmedian_iter;

/// The pixel-wise median of a stack of equally-shaped images. A single image
/// is returned as it is.
pub(crate) fn stack_median(images: &[Array2<f64>]) -> Option<Array2<f64>> {
    let first = images.first()?;
    if images.len() == 1 {
        return Some(first.clone());
    }
    let dim = first.dim();
    if images.iter().any(|i| i.dim() != dim) {
        return None;
    }
    Some(Array2::from_shape_fn(dim, |(y, x)| {
        nanmedian_iter(images.iter().map(|i| i[[y, x]]))
    }))
}

/// Subtract the dark current for `exptime` seconds and blank bad pixels.
pub(crate) fn calibrate_frame(
    image: &mut Array2<f64>,
    dark: Option<ArrayView2<f64>>,
    exptime: f64,
    badpix: Option<ArrayView2<bool>>,
) {
    if let Some(dark) = dark {
        image.zip_mut_with(&dark, |v, &d| {
            if d.is_finite() {
                *v -= d * exptime;
            }
        });
    }
    if let Some(badpix) = badpix {
        image.zip_mut_with(&badpix, |v, &bad| {
            if bad {
                *v = f64::NAN;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;

    #[test]
    fn test_stack_median_ignores_nans() {
        let a = array![[1.0, f64::NAN], [3.0, 4.0]];
        let b = array![[2.0, 5.0], [100.0, 4.0]];
        let c = array![[3.0, 7.0], [3.0, f64::NAN]];
        let m = stack_median(&[a, b, c]).unwrap();
        assert_abs_diff_eq!(m, array![[2.0, 6.0], [3.0, 4.0]]);
        assert!(stack_median(&[]).is_none());
        assert!(stack_median(&[Array2::zeros((2, 2)), Array2::zeros((2, 3))]).is_none());
    }

    #[test]
    fn test_calibrate_frame() {
        let mut image = Array2::from_elem((2, 2), 100.0);
        let dark = array![[1.0, 2.0], [f64::NAN, 0.0]];
        let bad = array![[false, false], [false, true]];
        calibrate_frame(&mut image, Some(dark.view()), 10.0, Some(bad.view()));
        assert_abs_diff_eq!(image[[0, 0]], 90.0);
        assert_abs_diff_eq!(image[[0, 1]], 80.0);
        assert_abs_diff_eq!(image[[1, 0]], 100.0);
        assert!(image[[1, 1]].is_nan());
    }
}

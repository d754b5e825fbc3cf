// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Low-frequency background (scattered light and residual bias).

use ndarray::prelude::*;

use crate::math::{gaussian_filter2d, percentile_bin, zoom_bilinear};

/// Estimate the background of an image. A low percentile in each
/// `bin` x `bin` block picks out the inter-order gaps; the binned map is then
/// smoothed by `smooth` bins and interpolated back to full resolution.
pub(crate) fn estimate_background(
    image: ArrayView2<f64>,
    bin: usize,
    percentile: f64,
    smooth: f64,
) -> Array2<f64> {
    let (ny, nx) = image.dim();
    let binned = percentile_bin(image, (ny / bin).max(1), (nx / bin).max(1), percentile);
    let smoothed = gaussian_filter2d(binned.view(), smooth);
    // Blocks without a single finite pixel contribute nothing.
    let smoothed = smoothed.mapv(|v| if v.is_finite() { v } else { 0.0 });
    zoom_bilinear(smoothed.view(), ny, nx)
}

/// Subtract the background in place, returning it.
pub(crate) fn subtract_background(
    image: &mut Array2<f64>,
    bin: usize,
    percentile: f64,
    smooth: f64,
) -> Array2<f64> {
    let background = estimate_background(image.view(), bin, percentile, smooth);
    *image -= &background;
    background
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;

    #[test]
    fn test_gradient_under_orders_is_removed() {
        let (ny, nx) = (64, 96);
        let mut image = Array2::from_shape_fn((ny, nx), |(y, x)| {
            let bkgd = 20.0 + 0.1 * x as f64 + 0.05 * y as f64;
            // Narrow bright orders every 16 rows.
            let order = if y % 16 < 3 { 5000.0 } else { 0.0 };
            bkgd + order
        });
        let background = subtract_background(&mut image, 8, 5.0, 1.0);

        // The fit is within a few ADU of the true background in the gaps.
        for &(y, x) in &[(8, 10), (40, 48), (56, 80)] {
            let truth = 20.0 + 0.1 * x as f64 + 0.05 * y as f64;
            assert!((background[[y, x]] - truth).abs() < 3.0);
        }
        assert!(image[[33, 50]] > 4990.0);
    }

    #[test]
    fn test_flat_image_gives_flat_background() {
        let image = Array2::from_elem((32, 32), 7.0);
        let background = estimate_background(image.view(), 8, 5.0, 1.0);
        assert_abs_diff_eq!(background, Array2::from_elem((32, 32), 7.0), epsilon = 1e-9);
    }
}

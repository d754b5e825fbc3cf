// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Amplifier common-mode removal.
//!
//! Raw frames are read out by `n_amps` amplifiers, each owning a stripe of
//! columns. Odd amplifiers read in the opposite direction, so their stripes are
//! mirrored before being compared with even ones.

use ndarray::prelude::*;

use crate::math::{nanmedian_iter, percentile_bin, zoom_bilinear};

/// The raw column of position `u` in amplifier `amp`.
#[inline]
fn amp_column(amp: usize, u: usize, width: usize) -> usize {
    if amp % 2 == 1 {
        amp * width + width - 1 - u
    } else {
        amp * width + u
    }
}

/// Stack the amplifier stripes of `image` into shape `(n_amps, rows, width)`,
/// mirroring odd amplifiers.
pub(crate) fn fold_amplifiers(image: ArrayView2<f64>, n_amps: usize) -> Array3<f64> {
    let (ny, nx) = image.dim();
    let width = nx / n_amps;
    Array3::from_shape_fn((n_amps, ny, width), |(amp, y, u)| {
        image[[y, amp_column(amp, u, width)]]
    })
}

/// The pixel-wise median of a stack of folded stripes.
pub(crate) fn median_stripe(stack: ArrayView3<f64>) -> Array2<f64> {
    let (_, ny, width) = stack.dim();
    Array2::from_shape_fn((ny, width), |(y, u)| {
        nanmedian_iter(stack.slice(s![.., y, u]).iter().copied())
    })
}

/// Remove the common-mode pattern shared by all amplifiers. The returned
/// stripe is what was subtracted from each (unmirrored) amplifier.
///
/// With `n_dark_amps > 0`, the pattern comes only from the first `n_dark_amps`
/// amplifiers, which see no light. Their slowly-varying level is removed first
/// (median in blocks of `amp_bin` pixels) so that only the correlated
/// read-out structure remains.
pub(crate) fn correct_common_mode(
    image: &mut Array2<f64>,
    n_amps: usize,
    n_dark_amps: usize,
    amp_bin: usize,
) -> Array2<f64> {
    let (ny, nx) = image.dim();
    let width = nx / n_amps;

    let stripe = if n_dark_amps > 0 {
        let dark = image.slice(s![.., ..n_dark_amps * width]);
        let (dy, dx) = dark.dim();
        let binned = percentile_bin(
            dark,
            (dy / amp_bin).max(1),
            (dx / amp_bin).max(1),
            50.0,
        );
        let low_freq = zoom_bilinear(binned.view(), dy, dx);
        let high_pass = &dark - &low_freq;
        median_stripe(fold_amplifiers(high_pass.view(), n_dark_amps).view())
    } else {
        median_stripe(fold_amplifiers(image.view(), n_amps).view())
    };

    for amp in 0..n_amps {
        for y in 0..ny {
            for u in 0..width {
                let v = stripe[[y, u]];
                if v.is_finite() {
                    image[[y, amp_column(amp, u, width)]] -= v;
                }
            }
        }
    }
    stripe
}

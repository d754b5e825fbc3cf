// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Thermal background: what an extraction of a dark exposure still contains
//! after dark subtraction, per second.

use ndarray::prelude::*;

use super::loc::LocModel;
use crate::extract::{extract_orders, ExtractParams};

/// Extract a calibrated, straightened dark and normalise it per second.
pub(crate) fn make_thermal(
    dark: ArrayView2<f64>,
    exptime: f64,
    loc: &LocModel,
    params: &ExtractParams,
) -> Array2<f64> {
    let scale = if exptime > 0.0 { 1.0 / exptime } else { 1.0 };
    extract_orders(dark, loc, params).e2ds.mapv(|v| v * scale)
}

/// Remove `exptime` seconds of thermal background from an extraction.
/// Columns without a thermal estimate are left as they are.
pub(crate) fn subtract_thermal(e2ds: &mut Array2<f64>, thermal: ArrayView2<f64>, exptime: f64) {
    e2ds.zip_mut_with(&thermal, |v, &t| {
        if t.is_finite() {
            *v -= t * exptime;
        }
    });
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;
    use crate::config::ExtractMethod;

    #[test]
    fn test_thermal_is_per_second() {
        let loc = LocModel {
            fibre: "C".to_string(),
            centres: array![[5.0]],
            widths: array![[2.5]],
        };
        let params = ExtractParams {
            method: ExtractMethod::Tilt,
            r1: 3.0,
            r2: 3.0,
            cosmic_cut: 100.0,
            cosmic_max_iter: 0,
            read_noise: 5.0,
        };
        // A uniform glow of 2 ADU per pixel over 10 s.
        let dark = Array2::from_elem((11, 20), 2.0);
        let thermal = make_thermal(dark.view(), 10.0, &loc, &params);
        let v = thermal[[0, 10]];
        assert!(v > 0.0);

        let mut e2ds = Array2::from_elem((1, 20), 100.0);
        let mut thermal_with_gap = thermal.clone();
        thermal_with_gap[[0, 0]] = f64::NAN;
        subtract_thermal(&mut e2ds, thermal_with_gap.view(), 10.0);
        assert_abs_diff_eq!(e2ds[[0, 10]], 100.0 - 10.0 * v);
        assert_abs_diff_eq!(e2ds[[0, 0]], 100.0);
    }
}

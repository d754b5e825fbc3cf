// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Dark current maps.

use ndarray::prelude::*;

use crate::{config::DarkConfig, io::header::Header, math::nanmedian_iter, qc::QcResult};

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct DarkStats {
    /// Fraction of non-finite pixels.
    pub(crate) dead_fraction: f64,
    /// \[ADU/s\]
    pub(crate) median: f64,
    /// Median of the short-wavelength half of the detector \[ADU/s\].
    pub(crate) blue_median: f64,
    /// Median of the long-wavelength half \[ADU/s\].
    pub(crate) red_median: f64,
}

impl DarkStats {
    pub(crate) fn write_header(&self, header: &mut Header) {
        header.set("DADEAD", self.dead_fraction);
        header.set("DAMED", self.median);
        header.set("DABMED", self.blue_median);
        header.set("DARMED", self.red_median);
    }

    pub(crate) fn qc(&self, config: &DarkConfig) -> QcResult {
        let mut qc = QcResult::new();
        qc.check_max("DADEAD", self.dead_fraction, config.max_dead_fraction);
        qc.check_max("DAMED", self.median, config.max_median);
        qc
    }
}

/// Turn a (stacked) dark exposure of `exptime` seconds into a dark current
/// map in ADU/s. Wavelength increases with column, so the blue half is the
/// left half.
pub(crate) fn make_dark(stack: ArrayView2<f64>, exptime: f64) -> (Array2<f64>, DarkStats) {
    let scale = if exptime > 0.0 { 1.0 / exptime } else { 1.0 };
    let dark = stack.mapv(|v| v * scale);
    let (_, nx) = dark.dim();
    let n_dead = dark.iter().filter(|v| !v.is_finite()).count();
    let stats = DarkStats {
        dead_fraction: n_dead as f64 / dark.len().max(1) as f64,
        median: nanmedian_iter(dark.iter().copied()),
        blue_median: nanmedian_iter(dark.slice(s![.., ..nx / 2]).iter().copied()),
        red_median: nanmedian_iter(dark.slice(s![.., nx / 2..]).iter().copied()),
    };
    (dark, stats)
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;

    #[test]
    fn test_dark_statistics() {
        let mut stack = Array2::from_shape_fn((4, 8), |(_, x)| if x < 4 { 10.0 } else { 30.0 });
        stack[[0, 0]] = f64::NAN;
        let (dark, stats) = make_dark(stack.view(), 10.0);
        assert_abs_diff_eq!(dark[[1, 1]], 1.0);
        assert_abs_diff_eq!(stats.blue_median, 1.0);
        assert_abs_diff_eq!(stats.red_median, 3.0);
        assert_abs_diff_eq!(stats.dead_fraction, 1.0 / 32.0);

        let qc = stats.qc(&DarkConfig {
            max_dead_fraction: 0.05,
            max_median: 1.0,
        });
        // The median over everything is 3 ADU/s.
        assert!(!qc.passed());
        assert_eq!(qc.failed_names(), ["DAMED"]);
    }
}

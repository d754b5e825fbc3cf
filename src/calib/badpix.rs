// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Bad-pixel and illumination masks from a flat and a dark.

use ndarray::prelude::*;

use crate::{
    config::BadpixConfig,
    io::header::Header,
    math::{median_filter, nanpercentile_iter},
    qc::QcResult,
};

#[derive(Debug, Clone)]
pub(crate) struct BadPixelMaps {
    /// `true` for pixels that must not be used.
    pub(crate) badpix: Array2<bool>,
    /// `true` for pixels that the flat doesn't illuminate.
    pub(crate) background: Array2<bool>,
    pub(crate) stats: BadpixStats,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct BadpixStats {
    pub(crate) hot: f64,
    pub(crate) bad_flat: f64,
    pub(crate) nonfinite_dark: f64,
    pub(crate) nonfinite_flat: f64,
    pub(crate) bad: f64,
    pub(crate) unilluminated: f64,
}

impl BadpixStats {
    pub(crate) fn write_header(&self, header: &mut Header) {
        header.set("BHOT", self.hot);
        header.set("BBFLAT", self.bad_flat);
        header.set("BNDARK", self.nonfinite_dark);
        header.set("BNFLAT", self.nonfinite_flat);
        header.set("BBAD", self.bad);
        header.set("BNILUM", self.unilluminated);
    }

    pub(crate) fn qc(&self, config: &BadpixConfig) -> QcResult {
        let mut qc = QcResult::new();
        qc.check_max("BBAD", self.bad, config.max_bad_fraction);
        qc
    }
}

fn fraction(mask: &Array2<bool>) -> f64 {
    mask.iter().filter(|&&b| b).count() as f64 / mask.len().max(1) as f64
}

/// Flag pixels that are hot in the dark (`dark` in ADU/s), that deviate from
/// the smooth flat, or that are non-finite in either. Also find the pixels the
/// flat doesn't illuminate.
pub(crate) fn make_badpix(
    flat: ArrayView2<f64>,
    dark: ArrayView2<f64>,
    config: &BadpixConfig,
) -> BadPixelMaps {
    let hot = dark.mapv(|d| d.is_finite() && d > config.max_hot);
    let nonfinite_dark = dark.mapv(|d| !d.is_finite());
    let nonfinite_flat = flat.mapv(|f| !f.is_finite());

    // Normalise the flat by a bright level so the illumination cut doesn't
    // depend on the lamp.
    let level = nanpercentile_iter(flat.iter().copied(), 99.0);
    let norm = flat.mapv(|f| f / level);
    let background = norm.mapv(|f| !f.is_finite() || f < config.illum_cut);

    // Orders run along rows, so smooth along rows.
    let mut smooth = norm.clone();
    for mut row in smooth.rows_mut() {
        let filtered = median_filter(&row.to_vec(), config.flat_median_width);
        row.assign(&Array1::from(filtered));
    }
    let mut bad_flat = Array2::from_elem(flat.dim(), false);
    azip!((b in &mut bad_flat, &n in &norm, &s in &smooth, &bg in &background) {
        *b = !bg && s > 0.0 && ((n / s) - 1.0).abs() > config.flat_cut_ratio;
    });

    let mut badpix = Array2::from_elem(flat.dim(), false);
    azip!((b in &mut badpix, &h in &hot, &f in &bad_flat, &nd in &nonfinite_dark, &nf in &nonfinite_flat) {
        *b = h || f || nd || nf;
    });

    let stats = BadpixStats {
        hot: fraction(&hot),
        bad_flat: fraction(&bad_flat),
        nonfinite_dark: fraction(&nonfinite_dark),
        nonfinite_flat: fraction(&nonfinite_flat),
        bad: fraction(&badpix),
        unilluminated: fraction(&background),
    };
    BadPixelMaps {
        badpix,
        background,
        stats,
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;

    #[test]
    fn test_hot_dead_and_unilluminated() {
        // Two illuminated bands of rows.
        let mut flat = Array2::from_shape_fn((10, 20), |(y, _)| {
            if (2..4).contains(&y) || (6..8).contains(&y) {
                1000.0
            } else {
                1.0
            }
        });
        flat[[2, 10]] = 100.0;
        flat[[7, 3]] = f64::NAN;
        let mut dark = Array2::from_elem((10, 20), 0.1);
        dark[[5, 5]] = 50.0;

        let maps = make_badpix(flat.view(), dark.view(), &BadpixConfig::default());
        assert!(maps.badpix[[2, 10]]);
        assert!(maps.badpix[[7, 3]]);
        assert!(maps.badpix[[5, 5]]);
        assert!(!maps.badpix[[2, 11]]);
        // Low flat values in the gaps are background, not bad.
        assert!(!maps.badpix[[0, 0]]);
        assert!(maps.background[[0, 0]]);
        assert!(!maps.background[[3, 0]]);
        assert_abs_diff_eq!(maps.stats.bad, 3.0 / 200.0);
        assert_abs_diff_eq!(maps.stats.hot, 1.0 / 200.0);
        assert!(maps.stats.qc(&BadpixConfig::default()).passed());
    }
}

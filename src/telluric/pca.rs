// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Principal components of the absorbance of many transmission maps.

use log::debug;
use nalgebra::DMatrix;
use ndarray::prelude::*;

use super::TelluricError;
use crate::math::gradient;

#[derive(Debug, Clone)]
pub(crate) struct TelluricPca {
    /// One flattened E2DS-shaped component per row. NaN where any map was
    /// undefined.
    pub(crate) components: Array2<f64>,
    /// `(n_orders, n_columns)` of the maps.
    pub(crate) shape: (usize, usize),
    /// How many maps went into the decomposition.
    pub(crate) n_maps: usize,
}

impl TelluricPca {
    /// Decompose `-ln(transmission)` of every map. The leading
    /// `n_components` components are kept, followed by the first and second
    /// derivatives of the leading component when `derivatives` is set.
    pub(crate) fn new(
        maps: &[Array2<f64>],
        n_components: usize,
        derivatives: bool,
    ) -> Result<TelluricPca, TelluricError> {
        let shape = maps.first().map(|m| m.dim()).unwrap_or((0, 0));
        if let Some(bad) = maps.iter().find(|m| m.dim() != shape) {
            return Err(TelluricError::MapShape {
                expected: shape,
                got: bad.dim(),
            });
        }
        let n_pix = shape.0 * shape.1;
        let flat: Vec<ArrayView1<f64>> = maps
            .iter()
            .filter_map(|m| m.as_slice().map(ArrayView1::from))
            .collect();
        let valid: Vec<usize> = (0..n_pix)
            .filter(|&p| flat.iter().all(|m| m[p].is_finite() && m[p] > 0.0))
            .collect();
        if valid.is_empty() || flat.len() != maps.len() {
            return Err(TelluricError::NoCommonPixels);
        }

        let absorbance = DMatrix::from_fn(flat.len(), valid.len(), |i, j| -flat[i][valid[j]].ln());
        let svd = absorbance.svd(false, true);
        let Some(v_t) = svd.v_t else {
            return Err(TelluricError::NoCommonPixels);
        };
        let mut order: Vec<usize> = (0..svd.singular_values.len()).collect();
        order.sort_by(|&a, &b| svd.singular_values[b].total_cmp(&svd.singular_values[a]));
        let n_keep = n_components.min(order.len());
        debug!(
            "Telluric PCA of {} maps over {} pixels; keeping {n_keep} components",
            maps.len(),
            valid.len()
        );

        let n_rows = n_keep + if derivatives && n_keep > 0 { 2 } else { 0 };
        let mut components = Array2::from_elem((n_rows, n_pix), f64::NAN);
        for (row, &k) in order.iter().take(n_keep).enumerate() {
            let scale = svd.singular_values[k] / (flat.len() as f64).sqrt();
            let v = v_t.row(k);
            // Absorbance is positive; orient each component the same way.
            let sign = if v.sum() < 0.0 { -1.0 } else { 1.0 };
            for (j, &p) in valid.iter().enumerate() {
                components[[row, p]] = sign * scale * v[j];
            }
        }

        if derivatives && n_keep > 0 {
            let (n_orders, nx) = shape;
            for order in 0..n_orders {
                let span = order * nx..(order + 1) * nx;
                let lead = components.slice(s![0, span.clone()]).to_vec();
                let first = gradient(&lead);
                let second = gradient(&first);
                components
                    .slice_mut(s![n_keep, span.clone()])
                    .assign(&Array1::from(first));
                components
                    .slice_mut(s![n_keep + 1, span])
                    .assign(&Array1::from(second));
            }
        }

        Ok(TelluricPca {
            components,
            shape,
            n_maps: maps.len(),
        })
    }

    pub(crate) fn n_components(&self) -> usize {
        self.components.nrows()
    }
}

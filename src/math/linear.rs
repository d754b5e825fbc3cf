// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use nalgebra::{DMatrix, DVector};
use ndarray::prelude::*;

use super::FitError;

/// Find the amplitudes of each row of `samples` (shape `(n_components,
/// n_pixels)`) that best reproduce `vector` in a least-squares sense. Only
/// pixels where the vector and every component are finite constrain the fit.
///
/// Returns the amplitudes and the reconstruction over every pixel.
pub(crate) fn linear_minimization(
    vector: ArrayView1<f64>,
    samples: ArrayView2<f64>,
) -> Result<(Vec<f64>, Array1<f64>), FitError> {
    let (n_comp, n_pix) = samples.dim();
    if vector.len() != n_pix {
        return Err(FitError::LengthMismatch {
            x: vector.len(),
            y: n_pix,
        });
    }
    let valid: Vec<usize> = (0..n_pix)
        .filter(|&i| vector[i].is_finite() && samples.column(i).iter().all(|v| v.is_finite()))
        .collect();
    if valid.len() < n_comp {
        return Err(FitError::TooFewPoints {
            needed: n_comp,
            got: valid.len(),
        });
    }

    let mut normal = DMatrix::<f64>::zeros(n_comp, n_comp);
    let mut rhs = DVector::<f64>::zeros(n_comp);
    for i in 0..n_comp {
        for j in i..n_comp {
            let v: f64 = valid.iter().map(|&p| samples[[i, p]] * samples[[j, p]]).sum();
            normal[(i, j)] = v;
            normal[(j, i)] = v;
        }
        rhs[i] = valid.iter().map(|&p| samples[[i, p]] * vector[p]).sum();
    }
    let amps = normal
        .lu()
        .solve(&rhs)
        .ok_or_else(|| FitError::Singular("linear minimisation".to_string()))?;
    if amps.iter().any(|a| !a.is_finite()) {
        return Err(FitError::NonFinite);
    }

    let mut recon = Array1::zeros(n_pix);
    for (amp, row) in amps.iter().zip(samples.outer_iter()) {
        recon.scaled_add(*amp, &row);
    }
    Ok((amps.iter().copied().collect(), recon))
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Correction of science spectra.

use log::{debug, info};
use ndarray::prelude::*;

use super::{estimate_sed_with, preclean, Preclean, TelluricError, TelluricPca};
use crate::{
    config::TelluricConfig,
    io::{
        header::Header,
        tables::{TransmissionTemplate, WeightedLine},
    },
    math::linear_minimization,
    qc::QcResult,
};

/// Corrections are undefined where the reconstructed transmission falls
/// below this.
const MIN_TRANSMISSION: f64 = 0.367_879_441_171_442_3; // 1/e

/// The atmospheric inputs of the two-exponent model.
#[derive(Debug, Clone, Copy)]
pub(crate) struct AtmosphereInputs<'a> {
    pub(crate) template: &'a TransmissionTemplate,
    pub(crate) water_mask: &'a [WeightedLine],
    pub(crate) dry_mask: &'a [WeightedLine],
}

#[derive(Debug, Clone)]
pub(crate) struct TelluricFit {
    /// The spectrum divided by the reconstructed transmission.
    pub(crate) corrected: Array2<f64>,
    /// The reconstructed transmission.
    pub(crate) recon: Array2<f64>,
    /// PCA amplitudes, or the two exponents when the PCA wasn't used.
    pub(crate) amplitudes: Vec<f64>,
    pub(crate) used_pca: bool,
    pub(crate) used_template: bool,
    pub(crate) preclean: Option<Preclean>,
    pub(crate) qc: QcResult,
}

impl TelluricFit {
    pub(crate) fn write_header(&self, header: &mut Header) {
        header.set("TLFPCA", self.used_pca);
        header.set("TLFTEMP", self.used_template);
        header.set("TLFNAMP", self.amplitudes.len());
        for (i, a) in self.amplitudes.iter().enumerate() {
            header.set(&format!("TLFAMP{i:02}"), *a);
        }
        if let Some(pre) = &self.preclean {
            pre.write_header(header);
        }
    }
}

fn divide_out(spectrum: ArrayView2<f64>, recon: ArrayView2<f64>) -> Array2<f64> {
    let mut corrected = spectrum.to_owned();
    corrected.zip_mut_with(&recon, |v, &t| {
        if t.is_finite() && t >= MIN_TRANSMISSION {
            *v /= t;
        } else {
            *v = f64::NAN;
        }
    });
    corrected
}

/// Fit `ln(spectrum / SED)` with the PCA components, re-estimating the SED
/// from the corrected spectrum on every iteration.
fn fit_with_pca(
    spectrum: ArrayView2<f64>,
    pca: &TelluricPca,
    stellar: Option<ArrayView2<f64>>,
    config: &TelluricConfig,
) -> Result<(Array2<f64>, Vec<f64>), TelluricError> {
    let shape = spectrum.dim();
    if shape != pca.shape {
        return Err(TelluricError::MapShape {
            expected: pca.shape,
            got: shape,
        });
    }
    let sed_of = |s: ArrayView2<f64>| estimate_sed_with(s, stellar, config.sed_window, config.sed_smooth);
    let mut sed = sed_of(spectrum);
    let mut recon = Array2::ones(shape);
    let mut amplitudes = vec![];
    for iteration in 0..config.recon_iterations.max(1) {
        let absorbance: Array1<f64> = spectrum
            .iter()
            .zip(sed.iter())
            .map(|(&s, &e)| {
                let r = s / e;
                if r.is_finite() && r > 0.0 {
                    -r.ln()
                } else {
                    f64::NAN
                }
            })
            .collect();
        let (amps, fitted) = linear_minimization(absorbance.view(), pca.components.view())?;
        recon = fitted
            .mapv(|a| (-a).exp())
            .into_shape_with_order(shape)
            .map_err(|_| TelluricError::MapShape {
                expected: shape,
                got: pca.shape,
            })?;
        sed = sed_of((&spectrum / &recon).view());
        debug!("Telluric reconstruction {}: amplitudes {amps:?}", iteration + 1);
        amplitudes = amps;
    }
    Ok((recon, amplitudes))
}

/// Correct a blaze-normalised science E2DS for telluric absorption.
///
/// The PCA is used when it was built from more than `n_components` maps;
/// otherwise the two-exponent model alone corrects the spectrum. `stellar`
/// is the object's template on the spectrum's grid, if it has one.
pub(crate) fn fit_telluric(
    e2ds: ArrayView2<f64>,
    wave: ArrayView2<f64>,
    snr: &[f64],
    pca: Option<&TelluricPca>,
    stellar: Option<ArrayView2<f64>>,
    atmosphere: AtmosphereInputs,
    config: &TelluricConfig,
) -> Result<TelluricFit, TelluricError> {
    let mut qc = QcResult::new();
    let usable = pca.filter(|p| p.n_maps > config.n_components);
    let n_maps = pca.map(|p| p.n_maps).unwrap_or(0);
    qc.inform(
        "TELLU_PCA",
        n_maps as f64,
        &format!("maps > {}", config.n_components),
        usable.is_some(),
    );

    let (recon, amplitudes, pre) = match usable {
        Some(pca) => {
            let (recon, amps) = fit_with_pca(e2ds, pca, stellar, config)?;
            (recon, amps, None)
        }
        None => {
            info!(
                "{n_maps} transmission maps available; need more than {} for the PCA. Using the two-exponent model",
                config.n_components
            );
            let pre = preclean(
                e2ds,
                wave,
                snr,
                atmosphere.template,
                atmosphere.water_mask,
                atmosphere.dry_mask,
                &config.science_bounds,
                stellar,
                config,
            )?;
            qc.merge(pre.qc.clone());
            (pre.model.clone(), vec![pre.expo_water, pre.expo_others], Some(pre))
        }
    };

    Ok(TelluricFit {
        corrected: divide_out(e2ds, recon.view()),
        recon,
        amplitudes,
        used_pca: usable.is_some(),
        used_template: stellar.is_some(),
        preclean: pre,
        qc,
    })
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Extraction of straightened orders into E2DS spectra, and their
//! resampling into S1D spectra.

pub(crate) mod s1d;

use log::{debug, warn};
use ndarray::prelude::*;
use thiserror::Error;

use crate::{
    calib::loc::LocModel,
    config::{DrsConfig, ExtractMethod},
    constants::FWHM_PER_SIGMA,
    math::{nanmax, nanmedian},
    qc::QcResult,
};

#[derive(Error, Debug)]
pub(crate) enum ExtractError {
    #[error("The {what} has shape {got:?}, but the image has shape {expected:?}")]
    Dimensions {
        what: &'static str,
        expected: (usize, usize),
        got: (usize, usize),
    },
}

/// Calibrations must match the frame they are applied to.
pub(crate) fn check_dims(
    what: &'static str,
    expected: (usize, usize),
    got: (usize, usize),
) -> Result<(), ExtractError> {
    if expected == got {
        Ok(())
    } else {
        Err(ExtractError::Dimensions {
            what,
            expected,
            got,
        })
    }
}

/// Everything the extractor needs to know besides the image and the traces.
#[derive(Debug, Clone)]
pub(crate) struct ExtractParams {
    pub(crate) method: ExtractMethod,
    /// Rows below the trace centre.
    pub(crate) r1: f64,
    /// Rows above the trace centre.
    pub(crate) r2: f64,
    pub(crate) cosmic_cut: f64,
    pub(crate) cosmic_max_iter: usize,
    pub(crate) read_noise: f64,
}

impl ExtractParams {
    pub(crate) fn from_config(config: &DrsConfig) -> ExtractParams {
        ExtractParams {
            method: config.extract.method,
            r1: config.extract.half_width_low,
            r2: config.extract.half_width_high,
            cosmic_cut: config.extract.cosmic_cut,
            cosmic_max_iter: config.extract.cosmic_max_iter,
            read_noise: config.detector.read_noise,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Extraction {
    /// Flux per order (rows) and column.
    pub(crate) e2ds: Array2<f64>,
    /// Median signal-to-noise ratio per order.
    pub(crate) snr: Vec<f64>,
    pub(crate) n_cosmics: usize,
    /// Orders without a single finite pixel.
    pub(crate) empty_orders: Vec<usize>,
    /// The brightest pixel used.
    pub(crate) max_pixel: f64,
}

impl Extraction {
    pub(crate) fn qc(&self, saturation: f64) -> QcResult {
        let mut qc = QcResult::new();
        qc.check_max("EXT_MAXPIX", self.max_pixel, saturation);
        for &order in &self.empty_orders {
            qc.inform(&format!("EXT_EMPTY{order:02}"), 0.0, "order has flux", false);
        }
        qc
    }
}

/// One column of one order.
struct ColumnResult {
    flux: f64,
    variance: f64,
    n_cosmics: usize,
    max_pixel: f64,
}

fn extract_column(data: &[f64], profile: &[f64], params: &ExtractParams) -> ColumnResult {
    let ron2 = params.read_noise * params.read_noise;
    let mut valid: Vec<bool> = data.iter().map(|v| v.is_finite()).collect();
    let max_pixel = nanmax(data);
    let mut n_cosmics = 0;

    let estimate = |valid: &[bool]| -> Option<(f64, f64)> {
        let psum: f64 = profile.iter().zip(valid).filter(|(_, &v)| v).map(|(p, _)| p).sum();
        if psum <= 0.0 {
            return None;
        }
        let tilt: f64 = data.iter().zip(valid).filter(|(_, &v)| v).map(|(d, _)| d).sum::<f64>() / psum;
        match params.method {
            ExtractMethod::Tilt => {
                let var: f64 = data
                    .iter()
                    .zip(valid)
                    .filter(|(_, &v)| v)
                    .map(|(d, _)| ron2 + d.abs())
                    .sum::<f64>()
                    / (psum * psum);
                Some((tilt, var))
            }
            ExtractMethod::Optimal => {
                let (mut num, mut den) = (0.0, 0.0);
                for ((d, p), _) in data.iter().zip(profile).zip(valid).filter(|(_, &v)| v) {
                    let v = ron2 + (tilt * p).abs();
                    num += p * d / v;
                    den += p * p / v;
                }
                (den > 0.0).then(|| (num / den, 1.0 / den))
            }
        }
    };

    let mut current = estimate(&valid);
    for _ in 0..params.cosmic_max_iter {
        let Some((flux, _)) = current else {
            break;
        };
        let worst = data
            .iter()
            .zip(profile)
            .enumerate()
            .filter(|(i, _)| valid[*i])
            .map(|(i, (d, p))| {
                let model = flux * p;
                (i, (d - model) / (ron2 + model.abs()).sqrt())
            })
            .max_by(|a, b| a.1.total_cmp(&b.1));
        match worst {
            Some((i, r)) if r > params.cosmic_cut => {
                valid[i] = false;
                n_cosmics += 1;
                current = estimate(&valid);
            }
            _ => break,
        }
    }

    let (flux, variance) = current.unwrap_or((f64::NAN, f64::NAN));
    ColumnResult {
        flux,
        variance,
        n_cosmics,
        max_pixel,
    }
}

/// Extract every order of `loc` from a straightened image.
pub(crate) fn extract_orders(image: ArrayView2<f64>, loc: &LocModel, params: &ExtractParams) -> Extraction {
    let (ny, nx) = image.dim();
    let n_orders = loc.n_orders();
    let mut e2ds = Array2::from_elem((n_orders, nx), f64::NAN);

    let per_order: Vec<(f64, usize, f64)> = e2ds
        .axis_iter_mut(Axis(0))
        .enumerate()
        .map(|(order, mut out)| {
            let mut snr = vec![];
            let mut n_cosmics = 0;
            let mut max_pixel = f64::NEG_INFINITY;
            for x in 0..nx {
                let xf = x as f64;
                let centre = loc.centre_at(order, xf);
                let sigma = (loc.width_at(order, xf) / FWHM_PER_SIGMA).max(0.5);
                let lo = (centre - params.r1).round();
                let hi = (centre + params.r2).round();
                if !centre.is_finite() || hi < 0.0 || lo > (ny - 1) as f64 {
                    continue;
                }
                let lo = lo.max(0.0) as usize;
                let hi = (hi as usize).min(ny - 1);
                let data: Vec<f64> = (lo..=hi).map(|y| image[[y, x]]).collect();
                let mut profile: Vec<f64> = (lo..=hi)
                    .map(|y| (-0.5 * ((y as f64 - centre) / sigma).powi(2)).exp())
                    .collect();
                let norm: f64 = profile.iter().sum();
                profile.iter_mut().for_each(|p| *p /= norm);

                let column = extract_column(&data, &profile, params);
                out[x] = column.flux;
                n_cosmics += column.n_cosmics;
                if column.max_pixel > max_pixel {
                    max_pixel = column.max_pixel;
                }
                if column.variance > 0.0 {
                    snr.push(column.flux / column.variance.sqrt());
                }
            }
            (nanmedian(&snr), n_cosmics, max_pixel)
        })
        .collect();

    let empty_orders: Vec<usize> = e2ds
        .outer_iter()
        .enumerate()
        .filter(|(_, row)| row.iter().all(|v| !v.is_finite()))
        .map(|(i, _)| i)
        .collect();
    for &order in &empty_orders {
        warn!("Fibre {} order {order} has no flux", loc.fibre);
    }
    let n_cosmics = per_order.iter().map(|p| p.1).sum();
    let max_pixel = per_order.iter().map(|p| p.2).fold(f64::NEG_INFINITY, f64::max);
    debug!(
        "Extracted {n_orders} orders of fibre {}; {n_cosmics} cosmic rays rejected",
        loc.fibre
    );
    Extraction {
        e2ds,
        snr: per_order.into_iter().map(|p| p.0).collect(),
        n_cosmics,
        empty_orders,
        max_pixel,
    }
}

/// Each order of the blaze divided by its own maximum.
pub(crate) fn normalise_blaze(blaze: ArrayView2<f64>) -> Array2<f64> {
    let mut out = blaze.to_owned();
    for mut row in out.outer_iter_mut() {
        let peak = nanmax(&row.to_vec());
        row.mapv_inplace(|v| v / peak);
    }
    out
}

/// Flux-normalise an extraction: divide by the flat (when given) and by the
/// normalised blaze.
pub(crate) fn flat_field(
    e2ds: ArrayView2<f64>,
    flat: Option<ArrayView2<f64>>,
    blaze: ArrayView2<f64>,
) -> Array2<f64> {
    let mut out = e2ds.to_owned();
    if let Some(flat) = flat {
        out.zip_mut_with(&flat, |v, &f| *v /= f);
    }
    out.zip_mut_with(&normalise_blaze(blaze), |v, &b| *v /= b);
    out
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;

    fn loc() -> LocModel {
        LocModel {
            fibre: "AB".to_string(),
            centres: array![[10.0, 0.0], [30.0, 0.02]],
            widths: array![[3.0, 0.0], [3.0, 0.0]],
        }
    }

    fn params(method: ExtractMethod) -> ExtractParams {
        ExtractParams {
            method,
            r1: 4.0,
            r2: 4.0,
            cosmic_cut: 10.0,
            cosmic_max_iter: 5,
            read_noise: 5.0,
        }
    }

    /// Orders with a flux of 1000 per column spread over a Gaussian profile.
    fn image() -> Array2<f64> {
        let loc = loc();
        Array2::from_shape_fn((45, 100), |(y, x)| {
            (0..2)
                .map(|k| {
                    let c = loc.centre_at(k, x as f64);
                    let sigma = 3.0 / FWHM_PER_SIGMA;
                    let g = (-0.5 * ((y as f64 - c) / sigma).powi(2)).exp();
                    1000.0 * g / (sigma * (2.0 * std::f64::consts::PI).sqrt())
                })
                .sum()
        })
    }

    #[test]
    fn test_both_methods_recover_the_flux() {
        for method in [ExtractMethod::Tilt, ExtractMethod::Optimal] {
            let ext = extract_orders(image().view(), &loc(), &params(method));
            assert_eq!(ext.e2ds.dim(), (2, 100));
            assert_abs_diff_eq!(ext.e2ds[[0, 50]], 1000.0, epsilon = 15.0);
            assert_abs_diff_eq!(ext.e2ds[[1, 80]], 1000.0, epsilon = 15.0);
            assert!(ext.empty_orders.is_empty());
            assert!(ext.snr[0] > 10.0);
        }
    }

    #[test]
    fn test_cosmic_rays_are_rejected() {
        let mut img = image();
        img[[11, 40]] += 50000.0;
        let ext = extract_orders(img.view(), &loc(), &params(ExtractMethod::Optimal));
        assert!(ext.n_cosmics >= 1);
        assert_abs_diff_eq!(ext.e2ds[[0, 40]], 1000.0, epsilon = 30.0);
    }

    #[test]
    fn test_empty_order_is_nan_with_a_warning() {
        let mut img = image();
        img.slice_mut(s![..20, ..]).fill(f64::NAN);
        let ext = extract_orders(img.view(), &loc(), &params(ExtractMethod::Tilt));
        assert_eq!(ext.empty_orders, [0]);
        assert!(ext.e2ds.row(0).iter().all(|v| v.is_nan()));
        let qc = ext.qc(60000.0);
        // Empty orders don't fail the extraction.
        assert!(qc.passed());
        assert_eq!(qc.checks.len(), 2);
    }

    #[test]
    fn test_check_dims() {
        assert!(check_dims("shape map", (4, 5), (4, 5)).is_ok());
        let e = check_dims("shape map", (4, 5), (5, 4)).unwrap_err();
        assert!(e.to_string().contains("shape map"));
    }

    #[test]
    fn test_flat_field() {
        let e2ds = array![[10.0, 20.0]];
        let flat = array![[1.0, 2.0]];
        let blaze = array![[5.0, 10.0]];
        let ff = flat_field(e2ds.view(), Some(flat.view()), blaze.view());
        assert_abs_diff_eq!(ff, array![[20.0, 10.0]]);
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Cross-correlation of extracted spectra with a line mask, and radial
//! velocities from the result.

#[cfg(test)]
mod tests;

use log::{debug, trace};
use ndarray::prelude::*;
use thiserror::Error;

use crate::{
    config::CcfConfig,
    constants::{SPEED_OF_LIGHT_KMS, SPEED_OF_LIGHT_MS},
    io::{header::Header, product::Product, tables::MaskLine},
    math::{fit_gaussian, gradient, nanargmax, nanargmin, GaussFit},
};

#[derive(Error, Debug)]
pub(crate) enum CcfError {
    #[error("None of the {n_lines} mask lines fall on the spectrum over the whole velocity scan")]
    NoLines { n_lines: usize },

    /// `at_edge` is set when a dip was found but too close to the end of the
    /// velocity scan.
    #[error("The CCF fit did not converge: {reason}")]
    NotConverged { reason: String, at_edge: bool },
}

/// Relativistic Doppler factor for a velocity in km/s.
pub(crate) fn doppler(velocity: f64) -> f64 {
    let beta = velocity / SPEED_OF_LIGHT_KMS;
    ((1.0 + beta) / (1.0 - beta)).sqrt()
}

/// The velocities of a scan centred on `rv`.
pub(crate) fn velocity_grid(rv: f64, width: f64, step: f64) -> Vec<f64> {
    if step.is_nan() || step <= 0.0 || width.is_nan() || width < 0.0 {
        return vec![rv];
    }
    let n = (width / step).round() as i64;
    (-n..=n).map(|i| rv + i as f64 * step).collect()
}

/// Pixel edges in wavelength, halfway between pixel centres.
fn pixel_edges(wave: &[f64]) -> Vec<f64> {
    let n = wave.len();
    if n < 2 {
        return vec![];
    }
    let mut edges = Vec::with_capacity(n + 1);
    edges.push(wave[0] - 0.5 * (wave[1] - wave[0]));
    edges.extend(wave.windows(2).map(|w| 0.5 * (w[0] + w[1])));
    edges.push(wave[n - 1] + 0.5 * (wave[n - 1] - wave[n - 2]));
    edges
}

/// Sum `values` over `[lo, hi]` in wavelength, counting partially covered
/// pixels by their covered fraction.
fn tophat_sum(values: &[f64], edges: &[f64], lo: f64, hi: f64) -> f64 {
    let first = edges.partition_point(|&e| e <= lo).saturating_sub(1);
    let mut sum = 0.0;
    for (i, v) in values.iter().enumerate().skip(first) {
        let (e0, e1) = (edges[i], edges[i + 1]);
        if e0 >= hi {
            break;
        }
        let overlap = (e1.min(hi) - e0.max(lo)).max(0.0);
        sum += v * overlap / (e1 - e0);
    }
    sum
}

/// CCFs of every order and their combination.
#[derive(Debug, Clone)]
pub(crate) struct Ccf {
    /// \[km/s\]
    pub(crate) velocities: Vec<f64>,
    /// `(n_orders, n_velocities)`; NaN for orders without usable lines.
    pub(crate) per_order: Array2<f64>,
    pub(crate) combined: Vec<f64>,
    /// Mask lines used over all combined orders.
    pub(crate) n_lines: usize,
}

/// Cross-correlate a spectrum with a mask.
///
/// `spectrum` is blaze-normalised; each pixel is weighted by `blaze_norm`
/// and each line by its mask weight. A line only contributes to an order if
/// every pixel it touches over the whole scan is finite.
pub(crate) fn compute_ccf(
    spectrum: ArrayView2<f64>,
    wave: ArrayView2<f64>,
    blaze_norm: ArrayView2<f64>,
    mask: &[MaskLine],
    config: &CcfConfig,
) -> Result<Ccf, CcfError> {
    let velocities = velocity_grid(config.rv, config.width, config.step);
    let (n_orders, _) = spectrum.dim();
    let mut per_order = Array2::from_elem((n_orders, velocities.len()), f64::NAN);
    let (v_min, v_max) = (
        velocities.first().copied().unwrap_or(config.rv),
        velocities.last().copied().unwrap_or(config.rv),
    );
    let half_width = 0.5 * config.mask_width / SPEED_OF_LIGHT_KMS;
    let mut n_lines_total = 0;

    for (order, ((s, w), b)) in spectrum
        .outer_iter()
        .zip(wave.outer_iter())
        .zip(blaze_norm.outer_iter())
        .enumerate()
        .take(config.n_ord_max)
    {
        let w = w.to_vec();
        let edges = pixel_edges(&w);
        let Some((&first, &last)) = edges.first().zip(edges.last()) else {
            continue;
        };
        let weighted: Vec<f64> = s.iter().zip(b.iter()).map(|(s, b)| s * b).collect();

        // The lines that stay on finite pixels over the whole scan.
        let lines: Vec<&MaskLine> = mask
            .iter()
            .filter(|line| {
                let lo = line.centre() * doppler(v_min) * (1.0 - half_width);
                let hi = line.centre() * doppler(v_max) * (1.0 + half_width);
                if lo <= first || hi >= last {
                    return false;
                }
                let i0 = edges.partition_point(|&e| e <= lo).saturating_sub(1);
                let i1 = edges.partition_point(|&e| e < hi).min(weighted.len());
                weighted[i0..i1].iter().all(|v| v.is_finite())
            })
            .collect();
        trace!("Order {order}: {} mask lines", lines.len());
        if lines.is_empty() {
            continue;
        }
        n_lines_total += lines.len();

        for (j, &v) in velocities.iter().enumerate() {
            let factor = doppler(v);
            per_order[[order, j]] = lines
                .iter()
                .map(|line| {
                    let centre = line.centre() * factor;
                    line.weight
                        * tophat_sum(
                            &weighted,
                            &edges,
                            centre * (1.0 - half_width),
                            centre * (1.0 + half_width),
                        )
                })
                .sum();
        }
    }

    if n_lines_total == 0 {
        return Err(CcfError::NoLines {
            n_lines: mask.len(),
        });
    }
    let combined: Vec<f64> = (0..velocities.len())
        .map(|j| {
            per_order
                .column(j)
                .iter()
                .filter(|v| v.is_finite())
                .sum()
        })
        .collect();
    debug!("CCF over {n_lines_total} lines and {} velocities", velocities.len());
    Ok(Ccf {
        velocities,
        per_order,
        combined,
        n_lines: n_lines_total,
    })
}

/// The Gaussian fit of a combined CCF.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CcfFit {
    /// \[km/s\]
    pub(crate) rv: f64,
    /// Fractional depth of the CCF.
    pub(crate) contrast: f64,
    /// \[km/s\]
    pub(crate) fwhm: f64,
    /// Bisector span \[km/s\].
    pub(crate) bisector_span: f64,
    pub(crate) gauss: GaussFit,
}

/// The bisector velocity at each of the normalised depths in `levels`.
fn bisector(velocities: &[f64], depth: &[f64], centre: usize, levels: &[f64]) -> Vec<f64> {
    let crossing = |range: &mut dyn Iterator<Item = usize>, level: f64| -> Option<f64> {
        let mut prev: Option<usize> = None;
        for i in range {
            if let Some(p) = prev {
                let (d0, d1) = (depth[p], depth[i]);
                if d0 >= level && d1 < level {
                    let f = (d0 - level) / (d0 - d1);
                    return Some(velocities[p] + f * (velocities[i] - velocities[p]));
                }
            }
            prev = Some(i);
        }
        None
    };
    levels
        .iter()
        .map(|&level| {
            let left = crossing(&mut (0..=centre).rev(), level);
            let right = crossing(&mut (centre..velocities.len()), level);
            match (left, right) {
                (Some(l), Some(r)) => 0.5 * (l + r),
                _ => f64::NAN,
            }
        })
        .collect()
}

fn mean_finite(values: &[f64]) -> f64 {
    let finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if finite.is_empty() {
        f64::NAN
    } else {
        finite.iter().sum::<f64>() / finite.len() as f64
    }
}

/// Fit the combined CCF with a Gaussian on a sloped continuum.
///
/// Fails with [`CcfError::NotConverged`] when the fit doesn't converge, when
/// it finds no dip deeper than the minimum contrast, or when the dip is
/// within one step of either end of the scan.
pub(crate) fn fit_ccf(ccf: &Ccf, config: &CcfConfig) -> Result<CcfFit, CcfError> {
    let v = &ccf.velocities;
    let y = &ccf.combined;
    let (Some(i_min), Some(i_max)) = (nanargmin(y), nanargmax(y)) else {
        return Err(CcfError::NotConverged {
            reason: "the CCF is empty".to_string(),
            at_edge: false,
        });
    };
    let continuum = y[i_max];
    let guess = [y[i_min] - continuum, v[i_min], 2.0 * config.mask_width.max(config.step), continuum];
    let not_converged = |reason: String| {
        Err(CcfError::NotConverged {
            reason,
            at_edge: false,
        })
    };
    let gauss = match fit_gaussian(v, y, guess, true) {
        Ok(g) => g,
        Err(e) => return not_converged(e.to_string()),
    };
    if !gauss.converged {
        return not_converged("the Gaussian fit hit its iteration limit".to_string());
    }
    trace!(
        "CCF fit: centre {:.4} km/s, FWHM {:.4} km/s, residual RMS {:.3e}",
        gauss.centre,
        gauss.fwhm(),
        gauss.rms
    );
    let contrast = -gauss.amp / gauss.offset;
    if !(gauss.amp < 0.0 && contrast >= config.min_contrast) {
        return not_converged(format!(
            "no CCF dip deeper than {} (contrast {contrast:.4})",
            config.min_contrast
        ));
    }
    let (Some(&v0), Some(&v1)) = (v.first(), v.last()) else {
        return not_converged("the CCF is empty".to_string());
    };
    if gauss.centre - v0 < config.step || v1 - gauss.centre < config.step {
        return Err(CcfError::NotConverged {
            reason: format!(
                "the CCF minimum at {:.2} km/s is at the edge of the scan ({v0:.1} to {v1:.1} km/s)",
                gauss.centre
            ),
            at_edge: true,
        });
    }

    // Depth below the fitted continuum, normalised to the dip.
    let depth: Vec<f64> = v
        .iter()
        .zip(y)
        .map(|(&vi, &yi)| {
            let cont = gauss.offset + gauss.slope * (vi - gauss.centre);
            (cont - yi) / -gauss.amp
        })
        .collect();
    let centre = v
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| (*a - gauss.centre).abs().total_cmp(&(*b - gauss.centre).abs()))
        .map(|(i, _)| i)
        .unwrap_or(i_min);
    let top = bisector(v, &depth, centre, &[0.1, 0.2, 0.3, 0.4]);
    let bottom = bisector(v, &depth, centre, &[0.6, 0.7, 0.8, 0.9]);
    let bisector_span = mean_finite(&top) - mean_finite(&bottom);

    Ok(CcfFit {
        rv: gauss.centre,
        contrast,
        fwhm: gauss.fwhm(),
        bisector_span,
        gauss,
    })
}

/// Photon-noise radial-velocity uncertainty \[m/s\] of a spectrum in counts
/// (Bouchy, Pepe & Queloz 2001).
pub(crate) fn photon_noise_rv(
    counts: ArrayView2<f64>,
    wave: ArrayView2<f64>,
    read_noise: f64,
    n_ord_max: usize,
) -> f64 {
    let mut inv_var = 0.0;
    for (a, w) in counts.outer_iter().zip(wave.outer_iter()).take(n_ord_max) {
        let a = a.to_vec();
        let w = w.to_vec();
        let da = gradient(&a);
        let dw = gradient(&w);
        let q2: f64 = (0..a.len())
            .filter_map(|i| {
                let slope = da[i] / dw[i];
                let var = a[i] + read_noise * read_noise;
                let q = w[i] * slope;
                (q.is_finite() && var > 0.0).then(|| q * q / var)
            })
            .sum();
        inv_var += q2;
    }
    if inv_var > 0.0 {
        SPEED_OF_LIGHT_MS / inv_var.sqrt()
    } else {
        f64::NAN
    }
}

/// The CCF product: one row per order plus the combined CCF as the last
/// row.
pub(crate) fn ccf_product(
    ccf: &Ccf,
    fit: Option<&CcfFit>,
    dvrms: f64,
    mut header: Header,
) -> Product {
    let (n_orders, n_vel) = ccf.per_order.dim();
    let mut image = Array2::from_elem((n_orders + 1, n_vel), f64::NAN);
    image.slice_mut(s![..n_orders, ..]).assign(&ccf.per_order);
    image.row_mut(n_orders).assign(&Array1::from(ccf.combined.clone()));

    let step = match ccf.velocities.as_slice() {
        [a, b, ..] => b - a,
        _ => 0.0,
    };
    header.set("CCFSTEP", step);
    header.set("CCFTLINE", ccf.n_lines);
    header.set("DVRMS_CC", dvrms);
    let mut product = Product::new(image, header).with_vector("VELOCITY", &ccf.velocities);
    if let Some(fit) = fit {
        let h = &mut product.header;
        h.set("CCFMNRV", fit.rv);
        h.set("CCFMCONT", fit.contrast);
        h.set("CCFMFWHM", fit.fwhm);
        h.set("CCFBIS", fit.bisector_span);
        let model: Vec<f64> = ccf.velocities.iter().map(|&v| fit.gauss.eval(v)).collect();
        product = product.with_vector("FIT", &model);
    }
    product
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Order localisation.
//!
//! Orders run along rows of a preprocessed frame. Their centres are found in
//! a collapsed strip around a central column, traced outward column by
//! column, and described by a polynomial in the column for both the centre
//! and the FWHM of each trace.

use itertools::Itertools;
use log::{debug, trace, warn};
use ndarray::prelude::*;
use thiserror::Error;

use crate::{
    config::{DetectorConfig, LocConfig},
    constants::FWHM_PER_SIGMA,
    io::{header::Header, product::Product},
    math::{clip_worst_polyfit, median_filter, nanmedian_iter, polyval, FitError},
    qc::QcResult,
};

#[derive(Error, Debug)]
pub(crate) enum LocError {
    #[error("No orders were found above the detection threshold")]
    NoOrders,

    #[error("Found {found} traces, but no order had all {groups} fibre groups")]
    TooFewTraces { found: usize, groups: usize },

    #[error("Localisation product is malformed: {0}")]
    Product(String),
}

/// The traces of one fibre group.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct LocModel {
    pub(crate) fibre: String,
    /// Centre polynomial coefficients, one row per order.
    pub(crate) centres: Array2<f64>,
    /// FWHM polynomial coefficients, one row per order.
    pub(crate) widths: Array2<f64>,
}

impl LocModel {
    pub(crate) fn n_orders(&self) -> usize {
        self.centres.nrows()
    }

    pub(crate) fn centre_at(&self, order: usize, x: f64) -> f64 {
        polyval(self.centres.row(order).as_slice().unwrap_or(&[]), x)
    }

    pub(crate) fn width_at(&self, order: usize, x: f64) -> f64 {
        polyval(self.widths.row(order).as_slice().unwrap_or(&[]), x)
    }

    pub(crate) fn to_product(&self, mut header: Header) -> Product {
        header.set("LONUMORD", self.n_orders());
        header.set("LOFIBRE", self.fibre.as_str());
        header.set("LODEGCE", self.centres.ncols().saturating_sub(1));
        header.set("LODEGWI", self.widths.ncols().saturating_sub(1));
        Product::new(self.centres.clone(), header).with_extension("WIDTH", self.widths.clone())
    }

    pub(crate) fn from_product(product: &Product) -> Result<LocModel, LocError> {
        let fibre = product
            .header
            .get_str("LOFIBRE")
            .map_err(|e| LocError::Product(e.to_string()))?;
        let widths = product
            .extension("WIDTH")
            .ok_or_else(|| LocError::Product("no WIDTH extension".to_string()))?
            .clone();
        if widths.nrows() != product.image.nrows() {
            return Err(LocError::Product(format!(
                "{} centre rows but {} width rows",
                product.image.nrows(),
                widths.nrows()
            )));
        }
        Ok(LocModel {
            fibre,
            centres: product.image.as_standard_layout().to_owned(),
            widths: widths.as_standard_layout().to_owned(),
        })
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Localisation {
    /// One model per fibre group, in the configured layout order.
    pub(crate) models: Vec<LocModel>,
    pub(crate) n_removed: usize,
    /// Orders left out because one of their traces was missing or unusable.
    pub(crate) n_dropped_orders: usize,
    /// The worst centre-fit RMS over every trace \[pixels\].
    pub(crate) max_rms: f64,
    pub(crate) qc: QcResult,
}

/// A candidate order at the central column.
#[derive(Debug, Clone, Copy)]
struct Candidate {
    centre: f64,
    flux: f64,
}

/// Find order centres in a 1D cut across the orders.
fn find_candidates(profile: &[f64], threshold: &[f64], min_width: usize, min_spacing: f64) -> Vec<Candidate> {
    let mut candidates: Vec<Candidate> = vec![];
    let mut run: Vec<usize> = vec![];
    let flush = |run: &mut Vec<usize>, candidates: &mut Vec<Candidate>| {
        if run.len() >= min_width {
            let flux: f64 = run.iter().map(|&y| profile[y]).sum();
            let centre = run.iter().map(|&y| y as f64 * profile[y]).sum::<f64>() / flux;
            candidates.push(Candidate { centre, flux });
        }
        run.clear();
    };
    for (y, (&v, &t)) in profile.iter().zip(threshold).enumerate() {
        if v.is_finite() && t.is_finite() && v > t {
            run.push(y);
        } else {
            flush(&mut run, &mut candidates);
        }
    }
    flush(&mut run, &mut candidates);

    let mut kept: Vec<Candidate> = vec![];
    for c in candidates {
        match kept.last_mut() {
            Some(last) if c.centre - last.centre < min_spacing => {
                trace!(
                    "Candidates at {:.1} and {:.1} overlap; keeping the brighter",
                    last.centre,
                    c.centre
                );
                if c.flux > last.flux {
                    *last = c;
                }
            }
            _ => kept.push(c),
        }
    }
    kept
}

/// Background-subtracted centroid and FWHM of a column around `guess`.
/// Returns `None` when the window leaves the detector or the signal is below
/// `min_signal`.
fn measure_column(column: ArrayView1<f64>, guess: f64, half_width: f64, min_signal: f64) -> Option<(f64, f64)> {
    let lo = (guess - half_width).round();
    let hi = (guess + half_width).round();
    if lo < 0.0 || hi >= column.len() as f64 {
        return None;
    }
    let (lo, hi) = (lo as usize, hi as usize);
    let window: Vec<(f64, f64)> = (lo..=hi)
        .filter(|&y| column[y].is_finite())
        .map(|y| (y as f64, column[y]))
        .collect();
    if window.len() < 3 {
        return None;
    }
    let bg = window.iter().map(|w| w.1).fold(f64::INFINITY, f64::min);
    let peak = window.iter().map(|w| w.1).fold(f64::NEG_INFINITY, f64::max);
    if peak - bg < min_signal {
        return None;
    }
    let total: f64 = window.iter().map(|(_, v)| v - bg).sum();
    let centre = window.iter().map(|(y, v)| y * (v - bg)).sum::<f64>() / total;
    let var = window
        .iter()
        .map(|(y, v)| (y - centre).powi(2) * (v - bg))
        .sum::<f64>()
        / total;
    Some((centre, var.sqrt() * FWHM_PER_SIGMA))
}

/// Split traces (sorted by their row at the central column) into orders of
/// `n_groups` traces each. The fibres of an order sit closer together than
/// neighbouring orders do, so orders are separated at the gaps above the
/// largest jump in the sorted gap sizes. Clusters with the wrong number of
/// traces are returned separately.
fn group_orders(centres: &[f64], n_groups: usize) -> (Vec<Vec<usize>>, Vec<Vec<usize>>) {
    if centres.is_empty() {
        return (vec![], vec![]);
    }
    let gaps: Vec<f64> = centres.windows(2).map(|w| w[1] - w[0]).collect();
    let threshold = if n_groups <= 1 {
        0.0
    } else {
        let mut sorted = gaps.clone();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let jump = sorted
            .windows(2)
            .enumerate()
            .filter(|(_, w)| w[0] > 0.0)
            .max_by(|(_, a), (_, b)| (a[1] / a[0]).total_cmp(&(b[1] / b[0])));
        match jump {
            Some((_, w)) if w[1] / w[0] >= 1.5 => 0.5 * (w[0] + w[1]),
            // Every gap looks alike: either one order, or nothing can be
            // told apart.
            _ if centres.len() <= n_groups => f64::INFINITY,
            _ => 0.0,
        }
    };

    let mut clusters = vec![vec![0]];
    for (i, &gap) in gaps.iter().enumerate() {
        if gap < threshold {
            if let Some(last) = clusters.last_mut() {
                last.push(i + 1);
            }
        } else {
            clusters.push(vec![i + 1]);
        }
    }
    clusters.into_iter().partition(|c| c.len() == n_groups)
}

/// The narrowest fitted width of any trace, sampled every `step` columns.
fn narrowest(widths: &[Vec<f64>], nx: usize, step: usize) -> f64 {
    widths
        .iter()
        .flat_map(|w| (0..nx).step_by(step.max(1)).map(move |x| polyval(w, x as f64)))
        .fold(f64::INFINITY, f64::min)
}

/// Follow a trace from the central column to both edges of the detector.
fn follow_trace(
    image: ArrayView2<f64>,
    start: f64,
    x0: usize,
    config: &LocConfig,
    min_signal: f64,
) -> Vec<(f64, f64, f64)> {
    let nx = image.ncols();
    let step = config.column_step.max(1);
    let mut points = vec![];
    for direction in [-1_i64, 1] {
        let mut guess = start;
        let mut x = x0 as i64;
        if direction == 1 {
            x += step as i64;
        }
        while x >= 0 && (x as usize) < nx {
            let Some((centre, fwhm)) =
                measure_column(image.column(x as usize), guess, config.centroid_half_width, min_signal)
            else {
                break;
            };
            if (centre - guess).abs() > config.centroid_half_width / 2.0 {
                break;
            }
            points.push((x as f64, centre, fwhm));
            guess = centre;
            x += direction * step as i64;
        }
    }
    points.sort_by(|a, b| a.0.total_cmp(&b.0));
    points
}

/// Localise every trace on a flat-like frame. `badpix` pixels are ignored.
pub(crate) fn localise(
    image: ArrayView2<f64>,
    badpix: Option<ArrayView2<bool>>,
    detector: &DetectorConfig,
    config: &LocConfig,
) -> Result<Localisation, LocError> {
    let mut image = image.to_owned();
    if let Some(badpix) = badpix {
        image.zip_mut_with(&badpix, |v, &b| {
            if b {
                *v = f64::NAN
            }
        });
    }
    let (ny, nx) = image.dim();
    let x0 = config.central_column.unwrap_or(nx / 2).min(nx.saturating_sub(1));
    let half = config.collapse_width / 2;
    let (clo, chi) = (x0.saturating_sub(half), (x0 + half + 1).min(nx));

    let profile: Vec<f64> = (0..ny)
        .map(|y| nanmedian_iter(image.slice(s![y, clo..chi]).iter().copied()))
        .collect();
    let min_signal = config.threshold_sigma * detector.read_noise;
    let threshold: Vec<f64> = median_filter(&profile, config.median_window)
        .into_iter()
        .map(|m| m + min_signal)
        .collect();
    let candidates = find_candidates(&profile, &threshold, config.min_width, config.min_spacing);
    debug!("{} candidate traces at column {x0}", candidates.len());
    if candidates.is_empty() {
        return Err(LocError::NoOrders);
    }

    // Every candidate is fitted, but an order only survives if all of its
    // fibres do.
    let mut fits = Vec::with_capacity(candidates.len());
    for candidate in &candidates {
        let points = follow_trace(image.view(), candidate.centre, x0, config, min_signal);
        if points.len() < config.centre_poly_deg.max(config.width_poly_deg) + 3 {
            warn!(
                "The trace at row {:.1} could only be followed over {} columns",
                candidate.centre,
                points.len()
            );
            fits.push(None);
            continue;
        }
        let xs: Vec<f64> = points.iter().map(|p| p.0).collect();
        let cs: Vec<f64> = points.iter().map(|p| p.1).collect();
        let ws: Vec<f64> = points.iter().map(|p| p.2).collect();
        let fit = |ys: &[f64], deg: usize, rms: f64, ptp: f64| -> Result<_, FitError> {
            clip_worst_polyfit(&xs, ys, deg, |r, p| r < rms && p < ptp)
        };
        match (
            fit(&cs, config.centre_poly_deg, config.max_rms_centre, config.max_ptp_centre),
            fit(&ws, config.width_poly_deg, config.max_rms_width, config.max_ptp_width),
        ) {
            (Ok(c), Ok(w)) => {
                trace!(
                    "Trace at row {:.1}: {} points, {} clipped, centre RMS {:.3} PTP {:.3}",
                    candidate.centre,
                    points.len(),
                    c.n_removed,
                    c.rms,
                    c.ptp
                );
                fits.push(Some((c, w)));
            }
            (Err(e), _) | (_, Err(e)) => {
                warn!("Couldn't fit the trace at row {:.1}: {e}", candidate.centre);
                fits.push(None);
            }
        }
    }

    let n_groups = config.fibre_layout.len().max(1);
    let rows: Vec<f64> = candidates.iter().map(|c| c.centre).collect();
    let (orders, strays) = group_orders(&rows, n_groups);
    for stray in &strays {
        warn!(
            "{} trace(s) at row(s) {} don't form an order of {n_groups} fibres; dropping them",
            stray.len(),
            stray.iter().map(|&i| format!("{:.1}", rows[i])).join(", ")
        );
    }

    // Traces in fibre order within each kept order.
    let mut per_fibre: Vec<(Vec<Vec<f64>>, Vec<Vec<f64>>)> = vec![(vec![], vec![]); n_groups];
    let mut n_removed = 0;
    let mut max_rms: f64 = 0.0;
    let mut n_dropped_orders = 0;
    for order in &orders {
        if order.iter().any(|&i| fits[i].is_none()) {
            warn!(
                "Dropping the order at row {:.1}: not every fibre could be traced",
                rows[order[0]]
            );
            n_dropped_orders += 1;
            continue;
        }
        for (g, &i) in order.iter().enumerate() {
            if let Some((centre, width)) = &fits[i] {
                n_removed += centre.n_removed + width.n_removed;
                max_rms = max_rms.max(centre.rms);
                per_fibre[g].0.push(centre.coeffs.clone());
                per_fibre[g].1.push(width.coeffs.clone());
            }
        }
    }
    let n_kept = per_fibre[0].0.len();
    if n_kept == 0 {
        return Err(LocError::TooFewTraces {
            found: fits.iter().filter(|f| f.is_some()).count(),
            groups: n_groups,
        });
    }

    let centre_fits: Vec<Vec<f64>> = (0..n_kept)
        .flat_map(|k| per_fibre.iter().map(move |f| f.0[k].clone()))
        .collect();
    let width_fits: Vec<Vec<f64>> = per_fibre.iter().flat_map(|f| f.1.iter().cloned()).collect();

    // The fitted traces must not cross anywhere on the detector.
    let monotonic = (0..nx).step_by(config.column_step.max(1)).all(|x| {
        centre_fits
            .windows(2)
            .all(|w| polyval(&w[1], x as f64) > polyval(&w[0], x as f64))
    });

    let min_width = narrowest(&width_fits, nx, config.column_step);

    let mut qc = QcResult::new();
    qc.check_max("LOC_NREMOVED", n_removed as f64, config.qc_max_removed as f64);
    qc.check_max("LOC_RMS", max_rms, config.qc_max_rms);
    qc.check("LOC_WIDTH", min_width, "LOC_WIDTH > 0", min_width > 0.0);
    qc.inform(
        "LOC_NDROPPED",
        n_dropped_orders as f64,
        "informational",
        n_dropped_orders == 0,
    );
    qc.check(
        "LOC_MONO",
        if monotonic { 1.0 } else { 0.0 },
        "LOC_MONO == 1",
        monotonic,
    );

    let to_array = |rows: &[Vec<f64>]| -> Array2<f64> {
        let ncols = rows.first().map(|r| r.len()).unwrap_or(0);
        Array2::from_shape_fn((rows.len(), ncols), |(i, j)| rows[i][j])
    };
    let models = config
        .fibre_layout
        .iter()
        .zip(&per_fibre)
        .map(|(fibre, (centres, widths))| LocModel {
            fibre: fibre.clone(),
            centres: to_array(centres),
            widths: to_array(widths),
        })
        .collect::<Vec<_>>();
    for m in &models {
        debug!("Fibre {}: {} orders", m.fibre, m.n_orders());
    }

    Ok(Localisation {
        models,
        n_removed,
        n_dropped_orders,
        max_rms,
        qc,
    })
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;

    /// Three orders, each with a pair of traces 9 rows apart. `lit` says
    /// whether trace `(order, fibre)` is illuminated at a column.
    fn lit_flat_image(lit: impl Fn(usize, usize, usize) -> bool) -> Array2<f64> {
        Array2::from_shape_fn((100, 200), |(y, x)| {
            let xf = x as f64;
            (0..3)
                .flat_map(|k| {
                    let c = 15.0 + 30.0 * k as f64 + 0.01 * (xf - 100.0) + 2e-5 * (xf - 100.0).powi(2);
                    [(k, 0, c), (k, 1, c + 9.0)]
                })
                .filter(|&(k, f, _)| lit(k, f, x))
                .map(|(_, _, c)| 5000.0 * (-0.5 * ((y as f64 - c) / 1.3).powi(2)).exp())
                .sum::<f64>()
                + 10.0
        })
    }

    fn flat_image() -> Array2<f64> {
        lit_flat_image(|_, _, _| true)
    }

    fn config() -> (DetectorConfig, LocConfig) {
        let det = DetectorConfig {
            read_noise: 5.0,
            ..Default::default()
        };
        let loc = LocConfig {
            median_window: 31,
            column_step: 5,
            centre_poly_deg: 2,
            width_poly_deg: 1,
            ..Default::default()
        };
        (det, loc)
    }

    #[test]
    fn test_finds_every_trace() {
        let (det, loc) = config();
        let result = localise(flat_image().view(), None, &det, &loc).unwrap();
        assert_eq!(result.models.len(), 2);
        let ab = &result.models[0];
        let c = &result.models[1];
        assert_eq!(ab.fibre, "AB");
        assert_eq!(ab.n_orders(), 3);
        assert_eq!(c.n_orders(), 3);
        for k in 0..3 {
            let truth = 15.0 + 30.0 * k as f64;
            assert_abs_diff_eq!(ab.centre_at(k, 100.0), truth, epsilon = 0.05);
            assert_abs_diff_eq!(c.centre_at(k, 100.0), truth + 9.0, epsilon = 0.05);
            assert_abs_diff_eq!(ab.centre_at(k, 150.0), truth + 0.5 + 0.05, epsilon = 0.05);
            assert_abs_diff_eq!(ab.width_at(k, 100.0), 1.3 * FWHM_PER_SIGMA, epsilon = 0.3);
        }
        assert!(result.qc.passed());
    }

    #[test]
    fn test_widths_are_positive() {
        let (det, loc) = config();
        let result = localise(flat_image().view(), None, &det, &loc).unwrap();
        for m in &result.models {
            for k in 0..m.n_orders() {
                for x in (0..200).step_by(10) {
                    assert!(m.width_at(k, x as f64) > 0.0);
                }
            }
        }
        let width = result.qc.checks.iter().find(|c| c.name == "LOC_WIDTH").unwrap();
        assert!(width.passed && width.value > 0.0);

        assert!(narrowest(&[vec![3.0, -0.02]], 200, 10) < 0.0);
        assert_abs_diff_eq!(narrowest(&[vec![3.0, 0.0], vec![2.5]], 200, 10), 2.5);
    }

    #[test]
    fn test_a_lost_trace_drops_its_whole_order() {
        // Order 0's second fibre is only lit over a few central columns, so
        // it's seen at the central column but can't be followed.
        let image = lit_flat_image(|k, f, x| !(k == 0 && f == 1) || (97..=103).contains(&x));
        let (det, loc) = config();
        let result = localise(image.view(), None, &det, &loc).unwrap();
        assert_eq!(result.n_dropped_orders, 1);
        let ab = &result.models[0];
        let c = &result.models[1];
        assert_eq!(ab.n_orders(), 2);
        assert_eq!(c.n_orders(), 2);
        for k in 0..2 {
            let truth = 45.0 + 30.0 * k as f64;
            assert_abs_diff_eq!(ab.centre_at(k, 100.0), truth, epsilon = 0.05);
            assert_abs_diff_eq!(c.centre_at(k, 100.0), truth + 9.0, epsilon = 0.05);
        }
        assert!(result.qc.passed());
    }

    #[test]
    fn test_unpaired_traces_are_not_given_a_fibre() {
        // The bottom order's first fibre is dark everywhere.
        let image = lit_flat_image(|k, f, _| !(k == 0 && f == 0));
        let (det, loc) = config();
        let result = localise(image.view(), None, &det, &loc).unwrap();
        assert_eq!(result.models[0].n_orders(), 2);
        assert_abs_diff_eq!(result.models[0].centre_at(0, 100.0), 45.0, epsilon = 0.05);
        assert_abs_diff_eq!(result.models[1].centre_at(0, 100.0), 54.0, epsilon = 0.05);
    }

    #[test]
    fn test_group_orders() {
        let (orders, strays) = group_orders(&[15.0, 24.0, 45.0, 54.0, 75.0, 84.0], 2);
        assert_eq!(orders, vec![vec![0, 1], vec![2, 3], vec![4, 5]]);
        assert!(strays.is_empty());

        let (orders, strays) = group_orders(&[24.0, 45.0, 54.0, 75.0, 84.0], 2);
        assert_eq!(orders, vec![vec![1, 2], vec![3, 4]]);
        assert_eq!(strays, vec![vec![0]]);

        let (orders, _) = group_orders(&[10.0, 20.0, 30.0], 1);
        assert_eq!(orders.len(), 3);
        let (orders, _) = group_orders(&[10.0, 19.0], 2);
        assert_eq!(orders, vec![vec![0, 1]]);
    }

    #[test]
    fn test_overlapping_candidates_keep_the_brighter() {
        let profile = [0.0, 10.0, 10.0, 10.0, 0.0, 20.0, 20.0, 20.0, 0.0];
        let threshold = [5.0; 9];
        let c = find_candidates(&profile, &threshold, 3, 5.0);
        assert_eq!(c.len(), 1);
        assert_abs_diff_eq!(c[0].centre, 6.0);
    }

    #[test]
    fn test_blank_frame_has_no_orders() {
        let (det, loc) = config();
        let image = Array2::from_elem((100, 200), 10.0);
        assert!(matches!(
            localise(image.view(), None, &det, &loc),
            Err(LocError::NoOrders)
        ));
    }

    #[test]
    fn test_product_round_trip() {
        let (det, loc) = config();
        let result = localise(flat_image().view(), None, &det, &loc).unwrap();
        let product = result.models[1].to_product(Header::new());
        assert_eq!(product.header.get_int("LONUMORD").unwrap(), 3);
        let back = LocModel::from_product(&product).unwrap();
        assert_eq!(back, result.models[1]);
    }
}

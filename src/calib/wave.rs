// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Wavelength solutions.
//!
//! Arc (HC) lines are matched against a catalogue through a prior solution
//! and fitted per order. The FP comb then sets an absolute reference: its
//! peaks obey `m lambda = 2 D`, so once the cavity width `D` and the peak
//! numbers `m` are known, every peak has a reference wavelength and the
//! solution is refitted on HC and FP lines together.
//!
//! A master solution numbers the peaks from scratch and keeps them as the
//! reference FP. Nightly solutions take each peak's wavelength from the
//! reference FP instead, and the shift of the peaks against it is the drift.

use itertools::Itertools;
use log::{debug, trace, warn};
use ndarray::prelude::*;
use thiserror::Error;

use crate::{
    config::WaveConfig,
    constants::SPEED_OF_LIGHT_MS,
    io::{
        header::Header,
        product::Product,
        tables::{HcLine, InitialWaveOrder},
    },
    math::{
        fit_gaussian, nanmax, nanmedian, percentile_filter, polyder, polyval, robust_polyfit,
        robust_sigma, FitError,
    },
    qc::QcResult,
};

#[derive(Error, Debug)]
pub(crate) enum WaveError {
    #[error("The initial wavelength solution has no orders for fibre {0}")]
    NoInitial(String),

    #[error("The prior solution has {prior} orders, but the spectrum has {spectrum}")]
    OrderMismatch { prior: usize, spectrum: usize },

    #[error("No order had enough HC lines (at least {needed} are needed)")]
    TooFewLines { needed: usize },

    #[error("Too few FP peaks ({found}) to measure the cavity")]
    TooFewFpPeaks { found: usize },

    #[error("The reference FP has {reference} orders, but the spectrum has {spectrum}")]
    ReferenceMismatch { reference: usize, spectrum: usize },

    #[error(transparent)]
    Fit(#[from] FitError),

    #[error("Wave product is malformed: {0}")]
    Product(String),
}

/// Polynomial wavelength (nm) against column, per order.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct WaveSolution {
    pub(crate) coeffs: Array2<f64>,
    pub(crate) nx: usize,
}

impl WaveSolution {
    pub(crate) fn n_orders(&self) -> usize {
        self.coeffs.nrows()
    }

    pub(crate) fn eval(&self, order: usize, x: f64) -> f64 {
        polyval(self.coeffs.row(order).as_slice().unwrap_or(&[]), x)
    }

    /// dlambda/dx.
    pub(crate) fn dispersion(&self, order: usize, x: f64) -> f64 {
        polyval(&polyder(&self.coeffs.row(order).to_vec()), x)
    }

    /// The wavelength of every pixel.
    pub(crate) fn wave_map(&self) -> Array2<f64> {
        Array2::from_shape_fn((self.n_orders(), self.nx), |(k, x)| self.eval(k, x as f64))
    }

    /// Wavelength must increase along every order.
    pub(crate) fn is_monotonic(&self) -> bool {
        (0..self.n_orders()).all(|k| (1..self.nx).all(|x| self.eval(k, x as f64) > self.eval(k, (x - 1) as f64)))
    }

    pub(crate) fn from_initial(
        initial: &[InitialWaveOrder],
        fibre: &str,
        nx: usize,
    ) -> Result<WaveSolution, WaveError> {
        let orders: Vec<&InitialWaveOrder> = initial
            .iter()
            .filter(|o| o.fibre == fibre)
            .sorted_by_key(|o| o.order)
            .collect();
        if orders.is_empty() {
            return Err(WaveError::NoInitial(fibre.to_string()));
        }
        let n_coeffs = orders.iter().map(|o| o.coeffs.len()).max().unwrap_or(0);
        let coeffs = Array2::from_shape_fn((orders.len(), n_coeffs), |(k, j)| {
            orders[k].coeffs.get(j).copied().unwrap_or(0.0)
        });
        Ok(WaveSolution { coeffs, nx })
    }

    pub(crate) fn to_product(&self, mut header: Header) -> Product {
        header.set("WAVEDEG", self.coeffs.ncols().saturating_sub(1));
        header.set("WAVENX", self.nx);
        Product::new(self.coeffs.clone(), header).with_extension("WAVEMAP", self.wave_map())
    }

    pub(crate) fn from_product(product: &Product) -> Result<WaveSolution, WaveError> {
        let nx = product
            .header
            .get_int("WAVENX")
            .map_err(|e| WaveError::Product(e.to_string()))?;
        Ok(WaveSolution {
            coeffs: product.image.as_standard_layout().to_owned(),
            nx: nx.max(0) as usize,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct WaveStats {
    pub(crate) n_hc_lines: usize,
    pub(crate) n_fp_lines: usize,
    /// The FP cavity width \[nm\].
    pub(crate) cavity: f64,
    /// Mean FP drift from the reference FP, or from the cavity comb for a
    /// master solution \[m/s\].
    pub(crate) drift_mean: f64,
    /// \[m/s\]
    pub(crate) drift_rms: f64,
    /// Residual RMS of the final fit over every line \[m/s\].
    pub(crate) rms: f64,
}

impl WaveStats {
    pub(crate) fn write_header(&self, header: &mut Header) {
        header.set("WHCNLIN", self.n_hc_lines);
        header.set("WFPNLIN", self.n_fp_lines);
        header.set("WFPCAV", self.cavity);
        header.set("WFPDRIFT", self.drift_mean);
        header.set("WFPRMS", self.drift_rms);
        header.set("WAVERMS", self.rms);
    }
}

#[derive(Debug, Clone)]
pub(crate) struct WaveResult {
    pub(crate) solution: WaveSolution,
    pub(crate) stats: WaveStats,
    /// The numbered FP peaks this solution used.
    pub(crate) fp_lines: FpReference,
    pub(crate) qc: QcResult,
}

/// The numbered FP peaks of a master solution: where each peak fell and the
/// wavelength it was given.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct FpReference {
    /// `(x, wavelength)` per order, by increasing x.
    pub(crate) lines: Vec<Vec<(f64, f64)>>,
    /// \[nm\]
    pub(crate) cavity: f64,
}

impl FpReference {
    pub(crate) fn n_lines(&self) -> usize {
        self.lines.iter().map(|l| l.len()).sum()
    }

    /// The product holds the extracted FP itself, which drift measurements
    /// compare against, and a table of the peaks.
    pub(crate) fn to_product(&self, fp_e2ds: Array2<f64>, mut header: Header) -> Product {
        header.set("WFPCAV", self.cavity);
        header.set("WFPNORD", self.lines.len());
        header.set("WFPNLIN", self.n_lines());
        let rows: Vec<[f64; 3]> = self
            .lines
            .iter()
            .enumerate()
            .flat_map(|(order, lines)| lines.iter().map(move |&(x, w)| [order as f64, x, w]))
            .collect();
        let table = Array2::from_shape_fn((rows.len(), 3), |(i, j)| rows[i][j]);
        Product::new(fp_e2ds, header).with_extension("FPLINES", table)
    }

    pub(crate) fn from_product(product: &Product) -> Result<FpReference, WaveError> {
        let malformed = |m: &str| WaveError::Product(m.to_string());
        let cavity = product
            .header
            .get_float("WFPCAV")
            .map_err(|e| WaveError::Product(e.to_string()))?;
        let table = product
            .extension("FPLINES")
            .ok_or_else(|| malformed("no FPLINES extension"))?;
        if table.ncols() != 3 {
            return Err(malformed("FPLINES must have 3 columns"));
        }
        let n_orders = product.image.nrows();
        let mut lines = vec![vec![]; n_orders];
        for row in table.outer_iter() {
            let order = row[0];
            if !(order >= 0.0 && (order as usize) < n_orders) {
                return Err(malformed("an FP line belongs to no order"));
            }
            lines[order as usize].push((row[1], row[2]));
        }
        for order in lines.iter_mut() {
            order.sort_by(|a, b| a.0.total_cmp(&b.0));
        }
        Ok(FpReference { lines, cavity })
    }
}

/// A line with a known wavelength at a measured position.
#[derive(Debug, Clone, Copy)]
struct Line {
    x: f64,
    wavelength: f64,
}

/// Indices that are the largest value within `half_window` and at least
/// `threshold`.
fn local_maxima(values: &[f64], half_window: usize, threshold: f64) -> Vec<usize> {
    let n = values.len();
    (0..n)
        .filter(|&i| {
            let v = values[i];
            let lo = i.saturating_sub(half_window);
            let hi = (i + half_window).min(n - 1);
            v.is_finite()
                && v >= threshold
                && (i == 0 || values[i - 1] < v)
                && values[lo..=hi].iter().all(|&w| w.is_nan() || w <= v)
        })
        .collect()
}

/// Gaussian centre of a line near `i`. `None` when the fit is poor.
fn fit_line(values: &[f64], i: usize, half_window: usize) -> Option<(f64, f64)> {
    let lo = i.checked_sub(half_window)?;
    let hi = i + half_window;
    if hi >= values.len() {
        return None;
    }
    let (x, y): (Vec<f64>, Vec<f64>) = (lo..=hi)
        .filter(|&j| values[j].is_finite())
        .map(|j| (j as f64, values[j]))
        .unzip();
    if x.len() < 5 {
        return None;
    }
    let floor = y.iter().copied().fold(f64::INFINITY, f64::min);
    let fit = fit_gaussian(&x, &y, [values[i] - floor, i as f64, 1.5, floor], false).ok()?;
    let good = fit.converged
        && fit.amp > 0.0
        && (fit.centre - i as f64).abs() < half_window as f64
        && fit.sigma > 0.3
        && fit.sigma < half_window as f64;
    good.then_some((fit.centre, fit.sigma))
}

/// Find HC emission lines in one order: `(x, sigma)` in pixels.
fn find_hc_lines(spectrum: &[f64], config: &WaveConfig) -> Vec<(f64, f64)> {
    let hw = config.hc_half_window;
    let baseline = percentile_filter(spectrum, 8 * hw + 1, 10.0);
    let resid: Vec<f64> = spectrum.iter().zip(&baseline).map(|(s, b)| s - b).collect();
    let peak = nanmax(&resid);
    let noise = robust_sigma(&resid).max(1e-3 * peak.abs()).max(f64::MIN_POSITIVE);
    local_maxima(&resid, hw, config.hc_min_snr * noise)
        .into_iter()
        .filter_map(|i| fit_line(&resid, i, hw))
        .collect()
}

/// Match measured lines to the catalogue through the prior solution.
fn match_lines(
    found: &[(f64, f64)],
    prior: &WaveSolution,
    order: usize,
    catalogue: &[HcLine],
    match_window: f64,
) -> Vec<Line> {
    let mut out = vec![];
    for &(x, sigma) in found {
        let guess = prior.eval(order, x);
        let d = prior.dispersion(order, x).abs();
        let window = match_window * d;
        let near: Vec<&HcLine> = catalogue
            .iter()
            .filter(|l| (l.wavelength - guess).abs() <= window)
            .collect();
        let within_sigma = near
            .iter()
            .filter(|l| (l.wavelength - guess).abs() <= sigma * d)
            .count();
        if within_sigma >= 2 {
            warn!(
                "Order {order}: {within_sigma} catalogue lines fall within the width of the line at x = {x:.2}; dropping them"
            );
            continue;
        }
        if let Some(best) = near
            .iter()
            .min_by(|a, b| (a.wavelength - guess).abs().total_cmp(&(b.wavelength - guess).abs()))
        {
            out.push(Line {
                x,
                wavelength: best.wavelength,
            });
        }
    }
    // A catalogue line can only be matched once. When two detections claim
    // the same line neither can be trusted.
    let by_line = out
        .into_iter()
        .sorted_by(|a, b| a.wavelength.total_cmp(&b.wavelength))
        .group_by(|l| l.wavelength.to_bits());
    let unique = by_line
        .into_iter()
        .filter_map(|(_, group)| {
            let group: Vec<Line> = group.collect();
            if group.len() == 1 {
                Some(group[0])
            } else {
                warn!(
                    "Order {order}: {} lines (x = {}) match the catalogue line at {:.5} nm; dropping them",
                    group.len(),
                    group.iter().map(|l| format!("{:.2}", l.x)).join(", "),
                    group[0].wavelength
                );
                None
            }
        })
        .collect();
    unique
}

/// Fit one order's lines, returning the coefficients and the kept lines.
fn fit_order(lines: &[Line], deg: usize, nsig: f64) -> Result<(Vec<f64>, Vec<Line>), FitError> {
    let x: Vec<f64> = lines.iter().map(|l| l.x).collect();
    let w: Vec<f64> = lines.iter().map(|l| l.wavelength).collect();
    let fit = robust_polyfit(&x, &w, deg, nsig)?;
    let kept = lines
        .iter()
        .zip(&fit.mask)
        .filter_map(|(l, &m)| m.then_some(*l))
        .collect();
    Ok((fit.coeffs, kept))
}

/// Find FP peak positions in one order.
fn find_fp_peaks(spectrum: &[f64], config: &WaveConfig) -> Vec<f64> {
    let max = nanmax(spectrum);
    local_maxima(spectrum, config.fp_half_window, config.fp_min_fraction * max)
        .into_iter()
        .filter_map(|i| fit_line(spectrum, i, config.fp_half_window).map(|f| f.0))
        .collect()
}

fn rms_velocity(lines: &[(f64, f64)]) -> f64 {
    let n = lines.len().max(1) as f64;
    (lines
        .iter()
        .map(|(model, truth)| ((model - truth) / truth * SPEED_OF_LIGHT_MS).powi(2))
        .sum::<f64>()
        / n)
        .sqrt()
}

/// Number the FP peaks from the cavity width they imply. Returns the lines,
/// the drift of every peak from the comb \[m/s\] and the cavity width.
fn fp_lines_from_cavity(
    peaks: &[Vec<(f64, f64)>],
    config: &WaveConfig,
) -> Result<(Vec<Vec<Line>>, Vec<f64>, f64), WaveError> {
    let steps: Vec<f64> = peaks
        .iter()
        .flat_map(|p| p.windows(2).map(|w| (1.0 / w[0].1 - 1.0 / w[1].1).abs()))
        .collect();
    if steps.len() < 2 {
        return Err(WaveError::TooFewFpPeaks { found: steps.len() });
    }
    // m lambda = 2D, so neighbouring peaks differ by 1 / 2D in 1 / lambda.
    let two_d = 1.0 / nanmedian(&steps);
    debug!("FP cavity width {:.3} nm", two_d / 2.0);

    let mut drifts = vec![];
    let mut fp_lines: Vec<Vec<Line>> = vec![vec![]; peaks.len()];
    for (order, order_peaks) in peaks.iter().enumerate() {
        let Some(&(_, lambda0)) = order_peaks.first() else {
            continue;
        };
        // Peak numbers relative to the first peak; they fall with wavelength.
        let relative: Vec<f64> = order_peaks
            .iter()
            .map(|&(_, l)| (two_d * (1.0 / l - 1.0 / lambda0)).round())
            .collect();
        let guess = (two_d / lambda0).round() as i64;
        let scatter = |k: i64| -> f64 {
            order_peaks
                .iter()
                .zip(&relative)
                .map(|(&(_, l), &m)| ((m + k as f64) * l - two_d).powi(2))
                .sum()
        };
        let Some(k) = (guess - config.fp_number_search..=guess + config.fp_number_search)
            .min_by(|&a, &b| scatter(a).total_cmp(&scatter(b)))
        else {
            continue;
        };
        for (&(x, l), &m) in order_peaks.iter().zip(&relative) {
            let reference = two_d / (m + k as f64);
            drifts.push((l - reference) / reference * SPEED_OF_LIGHT_MS);
            fp_lines[order].push(Line {
                x,
                wavelength: reference,
            });
        }
    }
    Ok((fp_lines, drifts, two_d / 2.0))
}

/// Give each FP peak the wavelength of the nearest reference peak, if that
/// is within half the reference peak spacing. Returns the lines and the
/// drift of every matched peak from its reference position \[m/s\].
fn fp_lines_from_reference(
    peaks: &[Vec<(f64, f64)>],
    solution: &WaveSolution,
    reference: &FpReference,
) -> (Vec<Vec<Line>>, Vec<f64>) {
    let mut drifts = vec![];
    let mut fp_lines: Vec<Vec<Line>> = vec![vec![]; peaks.len()];
    for (order, (order_peaks, ref_lines)) in peaks.iter().zip(&reference.lines).enumerate() {
        let spacing: Vec<f64> = ref_lines.windows(2).map(|w| w[1].0 - w[0].0).collect();
        let window = 0.5 * nanmedian(&spacing);
        if !window.is_finite() {
            continue;
        }
        let mut n_unmatched = 0;
        for &(x, _) in order_peaks {
            let nearest = ref_lines
                .iter()
                .min_by(|a, b| (a.0 - x).abs().total_cmp(&(b.0 - x).abs()));
            match nearest {
                Some(&(x_ref, wavelength)) if (x - x_ref).abs() < window => {
                    let shift = (x - x_ref) * solution.dispersion(order, x).abs();
                    drifts.push(shift / wavelength * SPEED_OF_LIGHT_MS);
                    fp_lines[order].push(Line { x, wavelength });
                }
                _ => n_unmatched += 1,
            }
        }
        if n_unmatched > 0 {
            trace!("Order {order}: {n_unmatched} FP peaks have no reference peak");
        }
    }
    (fp_lines, drifts)
}

/// Solve for the wavelength of one fibre from its extracted HC and FP
/// spectra. Without a reference FP the peaks are numbered from scratch, as
/// for a master solution.
pub(crate) fn solve_wave(
    hc: ArrayView2<f64>,
    fp: ArrayView2<f64>,
    prior: &WaveSolution,
    catalogue: &[HcLine],
    reference: Option<&FpReference>,
    config: &WaveConfig,
) -> Result<WaveResult, WaveError> {
    let (n_orders, nx) = hc.dim();
    if prior.n_orders() != n_orders {
        return Err(WaveError::OrderMismatch {
            prior: prior.n_orders(),
            spectrum: n_orders,
        });
    }
    let deg = config.poly_deg;
    let mut coeffs = Array2::<f64>::zeros((n_orders, deg + 1));
    let mut hc_lines: Vec<Vec<Line>> = vec![vec![]; n_orders];
    let mut n_fallback = 0;

    // HC
    for (order, spectrum) in hc.outer_iter().enumerate() {
        let found = find_hc_lines(&spectrum.to_vec(), config);
        let matched = match_lines(&found, prior, order, catalogue, config.match_window);
        trace!("Order {order}: {} HC lines found, {} matched", found.len(), matched.len());
        let fitted = if matched.len() >= config.min_lines.max(deg + 1) {
            fit_order(&matched, deg, config.hc_nsig_clip).ok()
        } else {
            None
        };
        match fitted {
            Some((c, kept)) => {
                coeffs.row_mut(order).assign(&Array1::from(c));
                hc_lines[order] = kept;
            }
            None => {
                warn!(
                    "Order {order}: only {} HC lines matched; keeping the prior solution",
                    matched.len()
                );
                n_fallback += 1;
                let p = prior.coeffs.row(order);
                for (j, c) in coeffs.row_mut(order).iter_mut().enumerate() {
                    *c = p.get(j).copied().unwrap_or(0.0);
                }
            }
        }
    }
    if n_fallback == n_orders {
        return Err(WaveError::TooFewLines {
            needed: config.min_lines,
        });
    }
    let hc_solution = WaveSolution {
        coeffs: coeffs.clone(),
        nx,
    };

    // FP: positions and their wavelengths on the HC solution.
    let peaks: Vec<Vec<(f64, f64)>> = fp
        .outer_iter()
        .enumerate()
        .map(|(order, spectrum)| {
            find_fp_peaks(&spectrum.to_vec(), config)
                .into_iter()
                .map(|x| (x, hc_solution.eval(order, x)))
                .collect()
        })
        .collect();
    let (fp_lines, drifts, cavity) = match reference {
        Some(reference) => {
            if reference.lines.len() != n_orders {
                return Err(WaveError::ReferenceMismatch {
                    reference: reference.lines.len(),
                    spectrum: n_orders,
                });
            }
            let (lines, drifts) = fp_lines_from_reference(&peaks, &hc_solution, reference);
            if drifts.len() < 2 {
                return Err(WaveError::TooFewFpPeaks { found: drifts.len() });
            }
            (lines, drifts, reference.cavity)
        }
        None => fp_lines_from_cavity(&peaks, config)?,
    };
    let drift_mean = drifts.iter().sum::<f64>() / drifts.len().max(1) as f64;
    let drift_rms =
        (drifts.iter().map(|d| (d - drift_mean).powi(2)).sum::<f64>() / drifts.len().max(1) as f64).sqrt();

    // Refit with both line sets.
    let mut residuals = vec![];
    for order in 0..n_orders {
        let lines: Vec<Line> = hc_lines[order].iter().chain(&fp_lines[order]).copied().collect();
        if lines.len() < deg + 2 {
            continue;
        }
        match fit_order(&lines, deg, config.hc_nsig_clip) {
            Ok((c, kept)) => {
                residuals.extend(kept.iter().map(|l| (polyval(&c, l.x), l.wavelength)));
                coeffs.row_mut(order).assign(&Array1::from(c));
            }
            Err(e) => warn!("Order {order}: the HC+FP refit failed ({e}); keeping the HC solution"),
        }
    }
    let solution = WaveSolution { coeffs, nx };

    let stats = WaveStats {
        n_hc_lines: hc_lines.iter().map(|l| l.len()).sum(),
        n_fp_lines: fp_lines.iter().map(|l| l.len()).sum(),
        cavity,
        drift_mean,
        drift_rms,
        rms: rms_velocity(&residuals),
    };
    debug!(
        "Wave solution: {} HC and {} FP lines, RMS {:.1} m/s, FP drift {:.1} +/- {:.1} m/s",
        stats.n_hc_lines, stats.n_fp_lines, stats.rms, stats.drift_mean, stats.drift_rms
    );

    let mut qc = QcResult::new();
    qc.check_max("WAVE_RMS", stats.rms, config.max_rms);
    let monotonic = solution.is_monotonic();
    qc.check(
        "WAVE_MONO",
        if monotonic { 1.0 } else { 0.0 },
        "WAVE_MONO == 1",
        monotonic,
    );
    qc.inform(
        "WAVE_NPRIOR",
        n_fallback as f64,
        "WAVE_NPRIOR == 0",
        n_fallback == 0,
    );
    let fp_lines = FpReference {
        lines: fp_lines
            .iter()
            .map(|order| {
                order
                    .iter()
                    .map(|l| (l.x, l.wavelength))
                    .sorted_by(|a, b| a.0.total_cmp(&b.0))
                    .collect()
            })
            .collect(),
        cavity,
    };
    Ok(WaveResult {
        solution,
        stats,
        fp_lines,
        qc,
    })
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;

    const NX: usize = 400;
    const TWO_D: f64 = 12.5e6;

    fn truth(k: usize, x: f64) -> f64 {
        1000.0 + 4.5 * k as f64 + 0.0125 * x - 2e-6 * x * x
    }

    fn truth_solution() -> WaveSolution {
        WaveSolution {
            coeffs: Array2::from_shape_fn((3, 3), |(k, j)| match j {
                0 => 1000.0 + 4.5 * k as f64,
                1 => 0.0125,
                _ => -2e-6,
            }),
            nx: NX,
        }
    }

    fn gauss_at(x: usize, centre: f64, sigma: f64) -> f64 {
        (-0.5 * ((x as f64 - centre) / sigma).powi(2)).exp()
    }

    fn catalogue_positions() -> Vec<(usize, f64)> {
        (0..3)
            .flat_map(|k| {
                (0..16)
                    .map(move |j| (k, 20.0 + 23.0 * j as f64 + (j % 3) as f64 * 3.1))
                    .filter(|(_, x)| *x < 380.0)
            })
            .collect()
    }

    fn catalogue() -> Vec<HcLine> {
        catalogue_positions()
            .into_iter()
            .map(|(k, x)| HcLine {
                wavelength: truth(k, x),
                strength: 1.0,
            })
            .sorted_by(|a, b| a.wavelength.total_cmp(&b.wavelength))
            .collect()
    }

    fn hc_spectrum() -> Array2<f64> {
        let positions = catalogue_positions();
        Array2::from_shape_fn((3, NX), |(k, x)| {
            10.0 + positions
                .iter()
                .filter(|(o, _)| *o == k)
                .map(|(_, c)| 1000.0 * gauss_at(x, *c, 1.3))
                .sum::<f64>()
        })
    }

    /// FP peak columns: where 2D / lambda is an integer.
    fn fp_spectrum() -> Array2<f64> {
        shifted_fp_spectrum(0.0)
    }

    /// The FP comb moved by `shift` columns.
    fn shifted_fp_spectrum(shift: f64) -> Array2<f64> {
        let mut out = Array2::from_elem((3, NX), 5.0);
        for k in 0..3 {
            let m_hi = (TWO_D / truth(k, 0.0)).floor() as i64;
            let m_lo = (TWO_D / truth(k, (NX - 1) as f64)).ceil() as i64;
            for m in m_lo..=m_hi {
                let target = TWO_D / m as f64;
                // Newton's method on the quadratic.
                let mut x = (target - truth(k, 0.0)) / 0.0125;
                for _ in 0..10 {
                    x -= (truth(k, x) - target) / (0.0125 - 4e-6 * x);
                }
                for col in 0..NX {
                    out[[k, col]] += 500.0 * gauss_at(col, x + shift, 1.2);
                }
            }
        }
        out
    }

    fn prior() -> WaveSolution {
        let mut p = truth_solution();
        p.coeffs.column_mut(0).mapv_inplace(|c| c + 0.002);
        p
    }

    fn config() -> WaveConfig {
        WaveConfig {
            poly_deg: 2,
            ..Default::default()
        }
    }

    #[test]
    fn test_recovers_the_true_solution() {
        let result = solve_wave(
            hc_spectrum().view(),
            fp_spectrum().view(),
            &prior(),
            &catalogue(),
            None,
            &config(),
        )
        .unwrap();
        let t = truth_solution();
        for k in 0..3 {
            for x in [5.0, 200.0, 395.0] {
                assert_abs_diff_eq!(result.solution.eval(k, x), t.eval(k, x), epsilon = 2e-4);
            }
        }
        assert!(result.stats.n_hc_lines >= 40);
        assert!(result.stats.n_fp_lines > 100);
        assert_abs_diff_eq!(result.stats.cavity, TWO_D / 2.0, epsilon = 100.0);
        assert!(result.stats.drift_rms < 60.0);
        assert!(result.qc.passed(), "{:?}", result.qc.failed_names());
    }

    #[test]
    fn test_nightly_solution_measures_drift_against_the_reference() {
        let master = solve_wave(
            hc_spectrum().view(),
            fp_spectrum().view(),
            &prior(),
            &catalogue(),
            None,
            &config(),
        )
        .unwrap();
        let reference = master.fp_lines.clone();
        assert_eq!(reference.lines.len(), 3);
        assert_eq!(reference.n_lines(), master.stats.n_fp_lines);
        assert!(reference.lines.iter().all(|l| l.windows(2).all(|w| w[0].0 < w[1].0)));

        // The same comb measures no drift against itself.
        let same = solve_wave(
            hc_spectrum().view(),
            fp_spectrum().view(),
            &master.solution,
            &catalogue(),
            Some(&reference),
            &config(),
        )
        .unwrap();
        assert!(same.stats.drift_mean.abs() < 5.0, "{}", same.stats.drift_mean);
        assert_abs_diff_eq!(same.stats.cavity, reference.cavity);

        // A comb moved by a tenth of a pixel drifts by c * 0.1 * dispersion /
        // wavelength, about 370 m/s.
        let moved = solve_wave(
            hc_spectrum().view(),
            shifted_fp_spectrum(0.1).view(),
            &master.solution,
            &catalogue(),
            Some(&reference),
            &config(),
        )
        .unwrap();
        let expected = 0.1 * 0.0122 / 1005.0 * SPEED_OF_LIGHT_MS;
        assert_abs_diff_eq!(moved.stats.drift_mean, expected, epsilon = 0.1 * expected);
        assert!(moved.stats.n_fp_lines > 100);

        let wrong = FpReference {
            lines: vec![vec![]; 2],
            cavity: reference.cavity,
        };
        assert!(matches!(
            solve_wave(
                hc_spectrum().view(),
                fp_spectrum().view(),
                &master.solution,
                &catalogue(),
                Some(&wrong),
                &config(),
            ),
            Err(WaveError::ReferenceMismatch { reference: 2, spectrum: 3 })
        ));
    }

    #[test]
    fn test_fp_reference_product() {
        let reference = FpReference {
            lines: vec![vec![(10.5, 1000.1), (20.25, 1000.2)], vec![], vec![(3.0, 1010.0)]],
            cavity: 6.25e6,
        };
        let product = reference.to_product(Array2::ones((3, 40)), Header::new());
        assert_eq!(product.header.get_int("WFPNLIN").unwrap(), 3);
        assert_eq!(FpReference::from_product(&product).unwrap(), reference);

        let bare = Product::new(Array2::ones((3, 40)), product.header.clone());
        assert!(matches!(
            FpReference::from_product(&bare),
            Err(WaveError::Product(_))
        ));
    }

    #[test]
    fn test_close_catalogue_lines_are_dropped() {
        let prior = truth_solution();
        let found = [(100.0, 1.3)];
        let lambda = truth(0, 100.0);
        let catalogue = [
            HcLine {
                wavelength: lambda,
                strength: 1.0,
            },
            HcLine {
                wavelength: lambda + 0.005,
                strength: 1.0,
            },
        ];
        assert!(match_lines(&found, &prior, 0, &catalogue, 3.0).is_empty());
        assert_eq!(match_lines(&found, &prior, 0, &catalogue[..1], 3.0).len(), 1);
    }

    #[test]
    fn test_doubly_matched_catalogue_lines_are_dropped() {
        let prior = truth_solution();
        let catalogue = [HcLine {
            wavelength: truth(0, 100.0),
            strength: 1.0,
        }];
        // Two detections fall within the match window of the same line.
        let found = [(100.0, 0.1), (100.4, 0.1)];
        assert!(match_lines(&found, &prior, 0, &catalogue, 3.0).is_empty());
        let matched = match_lines(&found[..1], &prior, 0, &catalogue, 3.0);
        assert_eq!(matched.len(), 1);
        assert_abs_diff_eq!(matched[0].x, 100.0);
    }

    #[test]
    fn test_initial_solution_and_product() {
        let initial = vec![
            InitialWaveOrder {
                fibre: "AB".to_string(),
                order: 1,
                coeffs: vec![1004.5, 0.0125],
            },
            InitialWaveOrder {
                fibre: "AB".to_string(),
                order: 0,
                coeffs: vec![1000.0, 0.0125, -2e-6],
            },
            InitialWaveOrder {
                fibre: "C".to_string(),
                order: 0,
                coeffs: vec![1.0],
            },
        ];
        let solution = WaveSolution::from_initial(&initial, "AB", NX).unwrap();
        assert_eq!(solution.coeffs.dim(), (2, 3));
        assert_abs_diff_eq!(solution.coeffs[[1, 2]], 0.0);
        assert!(solution.is_monotonic());
        assert!(matches!(
            WaveSolution::from_initial(&initial, "X", NX),
            Err(WaveError::NoInitial(_))
        ));

        let product = solution.to_product(Header::new());
        assert_eq!(product.extension("WAVEMAP").unwrap().dim(), (2, NX));
        assert_eq!(WaveSolution::from_product(&product).unwrap(), solution);
    }
}

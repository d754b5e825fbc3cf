// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The slit shape: a per-pixel column offset that makes the slit image
//! vertical.
//!
//! FP lines are tilted across each trace. For every trace we find the slope
//! of the brightest FP lines, fit it as a polynomial in the column, and
//! measure what is left per row. The per-trace models are then spread
//! across the detector into a single `dx` map, iterating a few times on the
//! straightened frame.

use log::{debug, trace};
use ndarray::prelude::*;
use thiserror::Error;

use super::loc::LocModel;
use crate::{
    config::ShapeConfig,
    io::{header::Header, product::Product},
    math::{nanargmax, nanmedian, polyval, robust_polyfit, sample_row, CubicSpline, FitError},
    qc::QcResult,
};

/// Residual slopes beyond this many median absolute residuals are clipped.
const SLOPE_CLIP: f64 = 5.0;

/// Rows whose share of a line's flux is below this don't constrain the
/// per-row residual.
const MIN_ROW_FRACTION: f64 = 0.1;

#[derive(Error, Debug)]
pub(crate) enum ShapeError {
    #[error("Only {found} FP peaks were usable in fibre {fibre} order {order}; at least {needed} are needed")]
    TooFewPeaks {
        fibre: String,
        order: usize,
        found: usize,
        needed: usize,
    },

    #[error("Couldn't fit the slit slope: {0}")]
    Fit(#[from] FitError),

    #[error("Shape product is malformed: {0}")]
    Product(String),
}

#[derive(Debug, Clone)]
pub(crate) struct ShapeMap {
    /// Column offset per pixel; see [`straighten`].
    pub(crate) dx: Array2<f64>,
    /// Slope polynomial coefficients per trace, from the bottom of the
    /// detector to the top.
    pub(crate) slopes: Array2<f64>,
}

impl ShapeMap {
    pub(crate) fn to_product(&self, mut header: Header) -> Product {
        header.set("SHNTRACE", self.slopes.nrows());
        Product::new(self.dx.clone(), header).with_extension("SLOPE", self.slopes.clone())
    }

    pub(crate) fn from_product(product: &Product) -> Result<ShapeMap, ShapeError> {
        let slopes = product
            .extension("SLOPE")
            .ok_or_else(|| ShapeError::Product("no SLOPE extension".to_string()))?
            .clone();
        Ok(ShapeMap {
            dx: product.image.clone(),
            slopes,
        })
    }
}

/// Resample every row so that `out[y, x] = image[y, x + dx[y, x]]`.
pub(crate) fn straighten(image: ArrayView2<f64>, dx: ArrayView2<f64>) -> Array2<f64> {
    let mut out = Array2::from_elem(image.dim(), f64::NAN);
    for (y, (mut out_row, dx_row)) in out.outer_iter_mut().zip(dx.outer_iter()).enumerate() {
        let row = image.row(y);
        for (x, (o, &d)) in out_row.iter_mut().zip(dx_row.iter()).enumerate() {
            *o = sample_row(row, x as f64 + d);
        }
    }
    out
}

/// One trace: its centre per column and the shape found for it.
struct TraceShape {
    centres: Vec<f64>,
    slope: Vec<f64>,
    residual: Option<CubicSpline>,
}

impl TraceShape {
    fn dx(&self, x: usize, y: f64) -> f64 {
        let c = self.centres[x];
        let mut d = polyval(&self.slope, x as f64) * (y - c);
        if let Some(spline) = &self.residual {
            d += spline.eval_clamped(y - c.round());
        }
        d
    }
}

fn row_range(centre: f64, half_height: usize, ny: usize) -> std::ops::RangeInclusive<usize> {
    let c = centre.round().max(0.0) as usize;
    c.saturating_sub(half_height)..=(c + half_height).min(ny.saturating_sub(1))
}

/// The brightest local maxima of `spectrum` down to `fraction` of its peak.
fn find_peaks(spectrum: &[f64], fraction: f64, half_window: usize, max_peaks: usize) -> Vec<usize> {
    let max = spectrum
        .iter()
        .copied()
        .filter(|v| v.is_finite())
        .fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() || max <= 0.0 {
        return vec![];
    }
    let n = spectrum.len();
    let mut peaks: Vec<usize> = (half_window..n.saturating_sub(half_window))
        .filter(|&i| {
            let v = spectrum[i];
            v.is_finite()
                && v >= fraction * max
                && spectrum[i - half_window..=i + half_window]
                    .iter()
                    .all(|&w| w.is_nan() || w <= v)
                && spectrum[i - 1] < v
        })
        .collect();
    peaks.sort_by(|&a, &b| spectrum[b].total_cmp(&spectrum[a]));
    peaks.truncate(max_peaks);
    peaks.sort_unstable();
    peaks
}

/// How sharp a line is once its rows are shifted by `slope * (y - centre)`.
fn sharpness(image: ArrayView2<f64>, centre: f64, rows: &[usize], xs: &[usize], slope: f64) -> f64 {
    xs.iter()
        .map(|&x| {
            let s: f64 = rows
                .iter()
                .map(|&y| sample_row(image.row(y), x as f64 + slope * (y as f64 - centre)))
                .filter(|v| v.is_finite())
                .sum();
            s * s
        })
        .sum()
}

/// Grid search over slopes in `[-range, range]`, refined with a parabola.
fn best_slope(
    image: ArrayView2<f64>,
    centre: f64,
    rows: &[usize],
    xs: &[usize],
    range: f64,
    n_slopes: usize,
) -> Option<f64> {
    let n = n_slopes.max(3);
    let step = 2.0 * range / (n - 1) as f64;
    let scores: Vec<f64> = (0..n)
        .map(|i| sharpness(image, centre, rows, xs, -range + i as f64 * step))
        .collect();
    let best = nanargmax(&scores)?;
    let mut slope = -range + best as f64 * step;
    if best > 0 && best + 1 < n {
        let (a, b, c) = (scores[best - 1], scores[best], scores[best + 1]);
        let denom = a - 2.0 * b + c;
        if denom != 0.0 {
            slope += 0.5 * (a - c) / denom * step;
        }
    }
    Some(slope)
}

fn centroid(values: &[(f64, f64)]) -> Option<(f64, f64)> {
    let bg = values.iter().map(|v| v.1).fold(f64::INFINITY, f64::min);
    let total: f64 = values.iter().map(|(_, v)| v - bg).sum();
    if total.is_nan() || total <= 0.0 {
        return None;
    }
    let c = values.iter().map(|(x, v)| x * (v - bg)).sum::<f64>() / total;
    Some((c, total))
}

/// Per-row column shift of straightened lines, relative to the collapsed
/// line, as a function of the row offset from the trace centre.
fn row_residuals(
    image: ArrayView2<f64>,
    centres: &[f64],
    peaks: &[usize],
    slope: &[f64],
    config: &ShapeConfig,
) -> Option<CubicSpline> {
    let (ny, nx) = image.dim();
    let h = config.half_height as i64;
    let hw = config.peak_half_window;
    let mut per_offset: Vec<Vec<f64>> = vec![vec![]; (2 * h + 1) as usize];
    for &p in peaks {
        if p < hw || p + hw >= nx {
            continue;
        }
        let c = centres[p];
        let s = polyval(slope, p as f64);
        let sample = |y: usize| -> Vec<(f64, f64)> {
            (p - hw..=p + hw)
                .map(|x| (x as f64, sample_row(image.row(y), x as f64 + s * (y as f64 - c))))
                .filter(|v| v.1.is_finite())
                .collect()
        };
        let rows: Vec<usize> = row_range(c, config.half_height, ny).collect();
        let measured: Vec<(i64, f64, f64)> = rows
            .iter()
            .filter_map(|&y| {
                centroid(&sample(y)).map(|(cx, flux)| (y as i64 - c.round() as i64, cx, flux))
            })
            .collect();
        let Some(max_flux) = measured.iter().map(|m| m.2).reduce(f64::max) else {
            continue;
        };
        let total: f64 = measured.iter().map(|m| m.2).sum();
        let mean_centroid = measured.iter().map(|m| m.1 * m.2).sum::<f64>() / total;
        for (dy, cx, flux) in measured {
            if flux >= MIN_ROW_FRACTION * max_flux && (-h..=h).contains(&dy) {
                per_offset[(dy + h) as usize].push(cx - mean_centroid);
            }
        }
    }
    let (knots, values): (Vec<f64>, Vec<f64>) = per_offset
        .iter()
        .enumerate()
        .filter(|(_, v)| v.len() >= 3)
        .map(|(i, v)| ((i as i64 - h) as f64, nanmedian(v)))
        .unzip();
    CubicSpline::new(&knots, &values).ok()
}

/// Spread the per-trace shapes over the detector. Each pixel takes the shape
/// of the trace nearest to it in its column.
fn combine(traces: &[TraceShape], ny: usize, nx: usize) -> Array2<f64> {
    let mut dx = Array2::zeros((ny, nx));
    for x in 0..nx {
        for y in 0..ny {
            let yf = y as f64;
            let nearest = traces
                .iter()
                .min_by(|a, b| (a.centres[x] - yf).abs().total_cmp(&(b.centres[x] - yf).abs()));
            if let Some(t) = nearest {
                dx[[y, x]] = t.dx(x, yf);
            }
        }
    }
    dx
}

/// Measure the slit shape on a (stacked) FP frame.
pub(crate) fn measure_shape(
    fp: ArrayView2<f64>,
    locs: &[LocModel],
    config: &ShapeConfig,
) -> Result<(ShapeMap, QcResult), ShapeError> {
    let (ny, nx) = fp.dim();
    let mut traces: Vec<(String, usize, Vec<f64>)> = locs
        .iter()
        .flat_map(|loc| {
            (0..loc.n_orders()).map(move |k| {
                let centres = (0..nx).map(|x| loc.centre_at(k, x as f64)).collect();
                (loc.fibre.clone(), k, centres)
            })
        })
        .collect();
    traces.sort_by(|a, b| a.2[nx / 2].total_cmp(&b.2[nx / 2]));

    let mut dx = Array2::<f64>::zeros((ny, nx));
    let mut total_slopes: Vec<Vec<f64>> = vec![vec![0.0; config.slope_poly_deg + 1]; traces.len()];
    let mut n_peaks_used = 0;

    for iteration in 0..config.n_iterations.max(1) {
        let work = straighten(fp, dx.view());
        let range = config.max_slope / 3_f64.powi(iteration as i32);
        let mut shapes = Vec::with_capacity(traces.len());
        n_peaks_used = 0;

        for ((fibre, order, centres), total) in traces.iter().zip(total_slopes.iter_mut()) {
            let spectrum: Vec<f64> = (0..nx)
                .map(|x| {
                    row_range(centres[x], config.half_height, ny)
                        .map(|y| work[[y, x]])
                        .filter(|v| v.is_finite())
                        .sum()
                })
                .collect();
            let peaks = find_peaks(
                &spectrum,
                config.peak_fraction,
                config.peak_half_window,
                config.max_peaks,
            );
            let mut xs = vec![];
            let mut slopes = vec![];
            for &p in &peaks {
                let c = centres[p];
                let rows: Vec<usize> = row_range(c, config.half_height, ny).collect();
                let window: Vec<usize> =
                    (p.saturating_sub(config.peak_half_window)..=(p + config.peak_half_window).min(nx - 1)).collect();
                if let Some(s) = best_slope(work.view(), c, &rows, &window, range, config.n_slopes) {
                    xs.push(p as f64);
                    slopes.push(s);
                }
            }
            if xs.len() < config.min_peaks.max(config.slope_poly_deg + 2) {
                return Err(ShapeError::TooFewPeaks {
                    fibre: fibre.clone(),
                    order: *order,
                    found: xs.len(),
                    needed: config.min_peaks,
                });
            }
            n_peaks_used += xs.len();
            let fit = robust_polyfit(&xs, &slopes, config.slope_poly_deg, SLOPE_CLIP)?;
            trace!(
                "Iteration {}, fibre {fibre} order {order}: {} peaks, slope {:.4} at the centre",
                iteration + 1,
                xs.len(),
                polyval(&fit.coeffs, (nx / 2) as f64)
            );
            let residual = row_residuals(work.view(), centres, &peaks, &fit.coeffs, config);
            for (t, c) in total.iter_mut().zip(&fit.coeffs) {
                *t += c;
            }
            shapes.push(TraceShape {
                centres: centres.clone(),
                slope: fit.coeffs,
                residual,
            });
        }
        dx += &combine(&shapes, ny, nx);
        debug!(
            "Shape iteration {} used {n_peaks_used} FP peaks",
            iteration + 1
        );
    }

    let max_slope = total_slopes
        .iter()
        .flat_map(|c| (0..nx).step_by(16).map(move |x| polyval(c, x as f64).abs()))
        .fold(0.0, f64::max);
    let mut qc = QcResult::new();
    qc.check_max("SHAPE_MAXSLOPE", max_slope, config.max_slope);
    qc.inform(
        "SHAPE_NPEAKS",
        n_peaks_used as f64,
        "informational",
        true,
    );

    let n_coeffs = config.slope_poly_deg + 1;
    let slopes = Array2::from_shape_fn((total_slopes.len(), n_coeffs), |(i, j)| total_slopes[i][j]);
    Ok((ShapeMap { dx, slopes }, qc))
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;

    const SLOPE: f64 = 0.08;

    /// Two flat traces carrying FP-like lines tilted by `SLOPE`.
    fn fp_image() -> Array2<f64> {
        Array2::from_shape_fn((60, 300), |(y, x)| {
            [20.0, 40.0]
                .iter()
                .map(|&c| {
                    let dy = y as f64 - c;
                    let profile = (-0.5 * (dy / 1.5).powi(2)).exp();
                    let comb: f64 = (1..37)
                        .map(|p| {
                            let xp = 8.0 * p as f64 + SLOPE * dy;
                            (-0.5 * ((x as f64 - xp) / 1.2).powi(2)).exp()
                        })
                        .sum();
                    1000.0 * profile * comb
                })
                .sum()
        })
    }

    fn locs() -> Vec<LocModel> {
        vec![LocModel {
            fibre: "AB".to_string(),
            centres: array![[20.0, 0.0], [40.0, 0.0]],
            widths: array![[3.5, 0.0], [3.5, 0.0]],
        }]
    }

    #[test]
    fn test_recovers_slit_tilt() {
        let config = ShapeConfig {
            min_peaks: 5,
            ..Default::default()
        };
        let (shape, qc) = measure_shape(fp_image().view(), &locs(), &config).unwrap();
        assert!(qc.passed());
        assert_eq!(shape.slopes.nrows(), 2);
        for x in [50, 150, 250] {
            assert_abs_diff_eq!(shape.dx[[23, x]], 3.0 * SLOPE, epsilon = 0.05);
            assert_abs_diff_eq!(shape.dx[[37, x]], -3.0 * SLOPE, epsilon = 0.05);
            assert_abs_diff_eq!(shape.dx[[20, x]], 0.0, epsilon = 0.05);
        }

        // Straightened lines are vertical: rows above and below the centre
        // peak at the same column.
        let straight = straighten(fp_image().view(), shape.dx.view());
        let row_peak = |y: usize| {
            (90..102)
                .max_by(|&a, &b| straight[[y, a]].total_cmp(&straight[[y, b]]))
                .unwrap()
        };
        assert_eq!(row_peak(17), row_peak(23));
    }

    #[test]
    fn test_straighten_with_zero_offsets_is_identity() {
        let image = fp_image();
        let out = straighten(image.view(), Array2::zeros(image.dim()).view());
        assert_abs_diff_eq!(out, image);
    }

    #[test]
    fn test_blank_frame_has_too_few_peaks() {
        let image = Array2::zeros((60, 300));
        assert!(matches!(
            measure_shape(image.view(), &locs(), &ShapeConfig::default()),
            Err(ShapeError::TooFewPeaks { .. })
        ));
    }
}

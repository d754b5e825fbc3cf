// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Some helper mathematics.
//!
//! Statistics here ignore non-finite values, in the same way that numpy's
//! `nan*` functions do. A statistic over no finite values is NaN.

mod fit;
mod interp;
mod linear;
mod poly;
#[cfg(test)]
mod tests;

pub(crate) use fit::{fit_gaussian, gauss, levenberg_marquardt, FitError, GaussFit, LmOptions};
pub(crate) use interp::{interp_linear, lanczos, CubicSpline};
pub(crate) use linear::linear_minimization;
pub(crate) use poly::{clip_worst_polyfit, polyder, polyfit, polyval, robust_polyfit};

use ndarray::prelude::*;

/// Collect the finite values of an iterator and sort them.
fn finite_sorted<I: IntoIterator<Item = f64>>(values: I) -> Vec<f64> {
    let mut v: Vec<f64> = values.into_iter().filter(|v| v.is_finite()).collect();
    v.sort_unstable_by(|a, b| a.total_cmp(b));
    v
}

/// Percentile of already-sorted values, with numpy's default ("linear")
/// interpolation.
fn sorted_percentile(sorted: &[f64], percentile: f64) -> f64 {
    match sorted.len() {
        0 => f64::NAN,
        1 => sorted[0],
        n => {
            let index = (percentile.clamp(0.0, 100.0) / 100.0) * (n - 1) as f64;
            let lo = index.floor() as usize;
            let hi = index.ceil() as usize;
            sorted[lo] + (sorted[hi] - sorted[lo]) * (index - lo as f64)
        }
    }
}

pub(crate) fn nanpercentile_iter<I: IntoIterator<Item = f64>>(values: I, percentile: f64) -> f64 {
    sorted_percentile(&finite_sorted(values), percentile)
}

pub(crate) fn nanpercentile(values: &[f64], percentile: f64) -> f64 {
    nanpercentile_iter(values.iter().copied(), percentile)
}

pub(crate) fn nanmedian_iter<I: IntoIterator<Item = f64>>(values: I) -> f64 {
    nanpercentile_iter(values, 50.0)
}

pub(crate) fn nanmedian(values: &[f64]) -> f64 {
    nanmedian_iter(values.iter().copied())
}

pub(crate) fn nansum(values: &[f64]) -> f64 {
    values.iter().filter(|v| v.is_finite()).sum()
}

pub(crate) fn nanmean_iter<I: IntoIterator<Item = f64>>(values: I) -> f64 {
    let (sum, count) = values
        .into_iter()
        .filter(|v| v.is_finite())
        .fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    if count == 0 {
        f64::NAN
    } else {
        sum / count as f64
    }
}

pub(crate) fn nanmean(values: &[f64]) -> f64 {
    nanmean_iter(values.iter().copied())
}

/// Population standard deviation (ddof = 0).
pub(crate) fn nanstd(values: &[f64]) -> f64 {
    let mean = nanmean(values);
    if !mean.is_finite() {
        return f64::NAN;
    }
    let (sum, count) = values
        .iter()
        .filter(|v| v.is_finite())
        .fold((0.0, 0usize), |(s, c), v| (s + (v - mean).powi(2), c + 1));
    (sum / count as f64).sqrt()
}

pub(crate) fn nanmax(values: &[f64]) -> f64 {
    values
        .iter()
        .copied()
        .filter(|v| v.is_finite())
        .fold(f64::NAN, f64::max)
}

pub(crate) fn nanmin(values: &[f64]) -> f64 {
    values
        .iter()
        .copied()
        .filter(|v| v.is_finite())
        .fold(f64::NAN, f64::min)
}

pub(crate) fn nanargmax(values: &[f64]) -> Option<usize> {
    values
        .iter()
        .enumerate()
        .filter(|(_, v)| v.is_finite())
        .max_by(|(_, a), (_, b)| a.total_cmp(b))
        .map(|(i, _)| i)
}

pub(crate) fn nanargmin(values: &[f64]) -> Option<usize> {
    values
        .iter()
        .enumerate()
        .filter(|(_, v)| v.is_finite())
        .min_by(|(_, a), (_, b)| a.total_cmp(b))
        .map(|(i, _)| i)
}

/// A robust estimate of the standard deviation from the median absolute
/// deviation.
pub(crate) fn robust_sigma(values: &[f64]) -> f64 {
    let med = nanmedian(values);
    1.4826 * nanmedian_iter(values.iter().map(|v| (v - med).abs()))
}

/// Sliding-window median. Windows are truncated at the edges and non-finite
/// values inside a window are ignored.
pub(crate) fn median_filter(values: &[f64], width: usize) -> Vec<f64> {
    let half = width / 2;
    let n = values.len();
    (0..n)
        .map(|i| {
            let lo = i.saturating_sub(half);
            let hi = (i + half + 1).min(n);
            nanmedian(&values[lo..hi])
        })
        .collect()
}

/// Sliding-window percentile; see [`median_filter`].
pub(crate) fn percentile_filter(values: &[f64], width: usize, percentile: f64) -> Vec<f64> {
    let half = width / 2;
    let n = values.len();
    (0..n)
        .map(|i| {
            let lo = i.saturating_sub(half);
            let hi = (i + half + 1).min(n);
            nanpercentile(&values[lo..hi], percentile)
        })
        .collect()
}

/// A normalised Gaussian kernel spanning +/- `n_sigma` standard deviations.
pub(crate) fn gaussian_kernel(sigma: f64, n_sigma: f64) -> Vec<f64> {
    if sigma <= 0.0 || !sigma.is_finite() {
        return vec![1.0];
    }
    let half = (n_sigma * sigma).ceil().max(1.0) as i64;
    let mut kernel: Vec<f64> = (-half..=half)
        .map(|i| (-0.5 * (i as f64 / sigma).powi(2)).exp())
        .collect();
    let total: f64 = kernel.iter().sum();
    kernel.iter_mut().for_each(|k| *k /= total);
    kernel
}

/// Discrete convolution with numpy's "same" output size. Non-finite values
/// propagate.
pub(crate) fn convolve_same(signal: &[f64], kernel: &[f64]) -> Vec<f64> {
    let n = signal.len() as i64;
    let m = kernel.len() as i64;
    let offset = (m - 1) / 2;
    (0..n)
        .map(|i| {
            let k = i + offset;
            (0..m)
                .filter_map(|j| {
                    let s = k - j;
                    (0..n).contains(&s).then(|| signal[s as usize] * kernel[j as usize])
                })
                .sum()
        })
        .collect()
}

/// Convolution with numpy's "same" output size, but non-finite values are
/// skipped and each output is normalised by the kernel weight that touched
/// finite values. Outputs with no finite support are NaN.
pub(crate) fn nan_convolve_same(signal: &[f64], kernel: &[f64]) -> Vec<f64> {
    let n = signal.len() as i64;
    let m = kernel.len() as i64;
    let offset = (m - 1) / 2;
    let kernel_total: f64 = kernel.iter().sum();
    (0..n)
        .map(|i| {
            let k = i + offset;
            let mut sum = 0.0;
            let mut weight = 0.0;
            for j in 0..m {
                let s = k - j;
                if (0..n).contains(&s) {
                    let v = signal[s as usize];
                    if v.is_finite() {
                        sum += v * kernel[j as usize];
                        weight += kernel[j as usize];
                    }
                }
            }
            if weight > 0.0 {
                sum / weight * kernel_total
            } else {
                f64::NAN
            }
        })
        .collect()
}

/// The same as numpy's `gradient` with unit spacing.
pub(crate) fn gradient(values: &[f64]) -> Vec<f64> {
    let n = values.len();
    match n {
        0 => vec![],
        1 => vec![0.0],
        _ => (0..n)
            .map(|i| {
                if i == 0 {
                    values[1] - values[0]
                } else if i == n - 1 {
                    values[n - 1] - values[n - 2]
                } else {
                    (values[i + 1] - values[i - 1]) / 2.0
                }
            })
            .collect(),
    }
}

/// Rotate and/or flip an image into one of its 8 orientations. Codes 0-3 are
/// counter-clockwise rotations by `code` × 90°; codes 4-7 flip the first axis
/// before rotating by `code - 4` × 90°.
pub(crate) fn rot8<T: Clone>(image: ArrayView2<T>, code: u8) -> Array2<T> {
    let mut view = image;
    if (code / 4) % 2 == 1 {
        view.invert_axis(Axis(0));
    }
    match code % 4 {
        1 => {
            view.swap_axes(0, 1);
            view.invert_axis(Axis(0));
        }
        2 => {
            view.invert_axis(Axis(0));
            view.invert_axis(Axis(1));
        }
        3 => {
            view.invert_axis(Axis(0));
            view.swap_axes(0, 1);
        }
        _ => (),
    }
    view.to_owned()
}

/// The orientation code that undoes `rot8(_, code)`. Flipped orientations are
/// their own inverse.
pub(crate) fn rot8_inverse(code: u8) -> u8 {
    match code % 8 {
        1 => 3,
        3 => 1,
        c => c,
    }
}

/// Bin an image into `(nby, nbx)` blocks, using the given percentile of the
/// finite pixels in each block. Pixels beyond the last whole block are
/// ignored.
pub(crate) fn percentile_bin(image: ArrayView2<f64>, nby: usize, nbx: usize, percentile: f64) -> Array2<f64> {
    let (ny, nx) = image.dim();
    let by = (ny / nby).max(1);
    let bx = (nx / nbx).max(1);
    Array2::from_shape_fn((nby, nbx), |(i, j)| {
        let block = image.slice(s![
            (i * by).min(ny)..((i + 1) * by).min(ny),
            (j * bx).min(nx)..((j + 1) * bx).min(nx)
        ]);
        nanpercentile_iter(block.iter().copied(), percentile)
    })
}

/// Upsample a small image to `(ny, nx)` with bilinear interpolation between
/// block centres.
pub(crate) fn zoom_bilinear(small: ArrayView2<f64>, ny: usize, nx: usize) -> Array2<f64> {
    let (sy, sx) = small.dim();
    let coord = |out: usize, n_out: usize, n_in: usize| -> (usize, usize, f64) {
        let pos = ((out as f64 + 0.5) * n_in as f64 / n_out as f64 - 0.5).clamp(0.0, (n_in - 1) as f64);
        let lo = pos.floor() as usize;
        let hi = (lo + 1).min(n_in - 1);
        (lo, hi, pos - lo as f64)
    };
    Array2::from_shape_fn((ny, nx), |(y, x)| {
        let (y0, y1, fy) = coord(y, ny, sy);
        let (x0, x1, fx) = coord(x, nx, sx);
        let top = small[[y0, x0]] * (1.0 - fx) + small[[y0, x1]] * fx;
        let bottom = small[[y1, x0]] * (1.0 - fx) + small[[y1, x1]] * fx;
        top * (1.0 - fy) + bottom * fy
    })
}

/// Separable, NaN-aware Gaussian smoothing of an image.
pub(crate) fn gaussian_filter2d(image: ArrayView2<f64>, sigma: f64) -> Array2<f64> {
    let kernel = gaussian_kernel(sigma, 4.0);
    let mut out = image.to_owned();
    for mut row in out.rows_mut() {
        let smoothed = nan_convolve_same(&row.to_vec(), &kernel);
        row.assign(&Array1::from(smoothed));
    }
    for mut col in out.columns_mut() {
        let smoothed = nan_convolve_same(&col.to_vec(), &kernel);
        col.assign(&Array1::from(smoothed));
    }
    out
}

/// Linear interpolation of a single row at a fractional column. Returns NaN
/// outside the row or when a neighbour is non-finite.
pub(crate) fn sample_row(row: ArrayView1<f64>, x: f64) -> f64 {
    let n = row.len();
    if n == 0 || !x.is_finite() || x < 0.0 || x > (n - 1) as f64 {
        return f64::NAN;
    }
    let x0 = x.floor() as usize;
    let x1 = (x0 + 1).min(n - 1);
    let f = x - x0 as f64;
    if f == 0.0 {
        return row[x0];
    }
    row[x0] * (1.0 - f) + row[x1] * f
}

/// Bilinear sampling of an image at fractional (y, x).
pub(crate) fn sample_bilinear(image: ArrayView2<f64>, y: f64, x: f64) -> f64 {
    let (ny, _) = image.dim();
    if ny == 0 || !y.is_finite() || y < 0.0 || y > (ny - 1) as f64 {
        return f64::NAN;
    }
    let y0 = y.floor() as usize;
    let y1 = (y0 + 1).min(ny - 1);
    let f = y - y0 as f64;
    let a = sample_row(image.row(y0), x);
    if f == 0.0 {
        return a;
    }
    let b = sample_row(image.row(y1), x);
    a * (1.0 - f) + b * f
}

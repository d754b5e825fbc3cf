// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! 1-D interpolation.

use super::FitError;

/// Index of the interval of increasing `xp` that contains `x`, i.e. `i` such
/// that `xp[i] <= x <= xp[i + 1]`.
fn bracket(xp: &[f64], x: f64) -> Option<usize> {
    let n = xp.len();
    if n < 2 || !x.is_finite() || x < xp[0] || x > xp[n - 1] {
        return None;
    }
    let i = xp.partition_point(|&v| v <= x);
    Some(i.saturating_sub(1).min(n - 2))
}

/// Linear interpolation on increasing abscissae. NaN outside the range.
pub(crate) fn interp_linear(x: f64, xp: &[f64], fp: &[f64]) -> f64 {
    match bracket(xp, x) {
        Some(i) => {
            let dx = xp[i + 1] - xp[i];
            if dx == 0.0 {
                return fp[i];
            }
            let f = (x - xp[i]) / dx;
            fp[i] * (1.0 - f) + fp[i + 1] * f
        }
        None => f64::NAN,
    }
}

/// The Lanczos window `sinc(x) sinc(x / a)` for `|x| < a`.
pub(crate) fn lanczos(x: f64, a: f64) -> f64 {
    if x == 0.0 {
        return 1.0;
    }
    if x.abs() >= a {
        return 0.0;
    }
    let px = std::f64::consts::PI * x;
    a * px.sin() * (px / a).sin() / (px * px)
}

/// A natural cubic spline.
#[derive(Debug, Clone)]
pub(crate) struct CubicSpline {
    x: Vec<f64>,
    y: Vec<f64>,
    /// Second derivatives at the knots.
    m: Vec<f64>,
}

impl CubicSpline {
    pub(crate) fn new(x: &[f64], y: &[f64]) -> Result<Self, FitError> {
        let n = x.len();
        if y.len() != n {
            return Err(FitError::LengthMismatch { x: n, y: y.len() });
        }
        if n < 2 {
            return Err(FitError::TooFewPoints { needed: 2, got: n });
        }
        if x.windows(2).any(|w| w[1] <= w[0]) {
            return Err(FitError::Singular(
                "spline knots must be strictly increasing".to_string(),
            ));
        }

        // Tridiagonal solve (Thomas algorithm) with natural end conditions.
        let mut m = vec![0.0; n];
        if n > 2 {
            let mut c_prime = vec![0.0; n];
            let mut d_prime = vec![0.0; n];
            for i in 1..n - 1 {
                let h0 = x[i] - x[i - 1];
                let h1 = x[i + 1] - x[i];
                let a = h0;
                let b = 2.0 * (h0 + h1);
                let c = h1;
                let d = 6.0 * ((y[i + 1] - y[i]) / h1 - (y[i] - y[i - 1]) / h0);
                let denom = b - a * c_prime[i - 1];
                c_prime[i] = c / denom;
                d_prime[i] = (d - a * d_prime[i - 1]) / denom;
            }
            for i in (1..n - 1).rev() {
                m[i] = d_prime[i] - c_prime[i] * m[i + 1];
            }
        }

        Ok(Self {
            x: x.to_vec(),
            y: y.to_vec(),
            m,
        })
    }

    /// Evaluate the spline. NaN outside the knots.
    pub(crate) fn eval(&self, x: f64) -> f64 {
        match bracket(&self.x, x) {
            Some(i) => self.eval_in(i, x),
            None => f64::NAN,
        }
    }

    /// Evaluate the spline, holding the end values constant outside the knots.
    pub(crate) fn eval_clamped(&self, x: f64) -> f64 {
        let n = self.x.len();
        if x <= self.x[0] {
            self.y[0]
        } else if x >= self.x[n - 1] {
            self.y[n - 1]
        } else {
            self.eval(x)
        }
    }

    fn eval_in(&self, i: usize, x: f64) -> f64 {
        let h = self.x[i + 1] - self.x[i];
        let a = (self.x[i + 1] - x) / h;
        let b = (x - self.x[i]) / h;
        a * self.y[i]
            + b * self.y[i + 1]
            + ((a.powi(3) - a) * self.m[i] + (b.powi(3) - b) * self.m[i + 1]) * h * h / 6.0
    }
}

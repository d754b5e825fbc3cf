// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The two-exponent telluric fit.

use log::{debug, warn};
use ndarray::prelude::*;

use super::{estimate_sed_with, lines_on_spectrum, sample_spectrum, Atmosphere, TelluricError};
use crate::{
    config::{ExpoBounds, TelluricConfig},
    constants::SPEED_OF_LIGHT_KMS,
    io::{
        header::Header,
        tables::{TransmissionTemplate, WeightedLine},
    },
    math::{fit_gaussian, interp_linear, linear_minimization, nanargmax, nanmin},
    qc::QcResult,
};

/// The template is too opaque below this transmission to say anything about
/// the spectrum underneath.
const MIN_TRANSMISSION: f64 = 0.367_879_441_171_442_3; // 1/e

#[derive(Debug, Clone)]
pub(crate) struct Preclean {
    /// `spectrum / SED`; NaN where the model is too opaque, capped at 1.
    pub(crate) transmission: Array2<f64>,
    /// The fitted model transmission.
    pub(crate) model: Array2<f64>,
    pub(crate) expo_water: f64,
    pub(crate) expo_others: f64,
    /// \[km/s\]
    pub(crate) velocity: f64,
    pub(crate) iterations: usize,
    pub(crate) converged: bool,
    pub(crate) qc: QcResult,
}

impl Preclean {
    pub(crate) fn write_header(&self, header: &mut Header) {
        header.set("TLPEH2O", self.expo_water);
        header.set("TLPEOTR", self.expo_others);
        header.set("TLPVEL", self.velocity);
        header.set("TLPNITER", self.iterations);
        header.set("TLPCONV", self.converged);
    }
}

/// Velocity of the water absorption, from a Gaussian fit to the CCF of the
/// normalised spectrum with the water mask.
fn water_velocity(
    ratio: ArrayView2<f64>,
    wave: ArrayView2<f64>,
    lines: &[WeightedLine],
    config: &TelluricConfig,
) -> f64 {
    let n_steps = (config.ccf_scan_range / config.ccf_step).floor() as i64;
    let velocities: Vec<f64> = (-n_steps..=n_steps)
        .map(|i| i as f64 * config.ccf_step)
        .collect();
    let ccf: Vec<f64> = velocities
        .iter()
        .map(|v| {
            let factor = 1.0 + v / SPEED_OF_LIGHT_KMS;
            let (sum, weight) = lines.iter().fold((0.0, 0.0), |(s, w), line| {
                let r = sample_spectrum(ratio, wave, line.wavelength * factor);
                if r.is_finite() {
                    (s + line.weight * (1.0 - r), w + line.weight)
                } else {
                    (s, w)
                }
            });
            if weight > 0.0 {
                sum / weight
            } else {
                f64::NAN
            }
        })
        .collect();

    let (x, y): (Vec<f64>, Vec<f64>) = velocities
        .iter()
        .zip(&ccf)
        .filter(|(_, c)| c.is_finite())
        .map(|(v, c)| (*v, *c))
        .unzip();
    let Some(peak) = nanargmax(&y) else {
        warn!("The water CCF is empty; assuming no velocity offset");
        return 0.0;
    };
    let floor = nanmin(&y);
    match fit_gaussian(&x, &y, [y[peak] - floor, x[peak], 3.0, floor], false) {
        Ok(fit) if fit.converged && fit.amp > 0.0 => fit.centre,
        _ => {
            warn!("Couldn't fit the water CCF; assuming no velocity offset");
            0.0
        }
    }
}

/// One linear fit of `ln(spectrum / SED)` at the mask lines against the log
/// template of each species.
fn fit_exponents(
    ratio: ArrayView2<f64>,
    wave: ArrayView2<f64>,
    lines: &[WeightedLine],
    template: &TransmissionTemplate,
    velocity: f64,
) -> Result<(f64, f64), TelluricError> {
    let factor = 1.0 + velocity / SPEED_OF_LIGHT_KMS;
    let mut y = vec![];
    let mut water = vec![];
    let mut others = vec![];
    for line in lines {
        let r = sample_spectrum(ratio, wave, line.wavelength * factor);
        let lw = interp_linear(line.wavelength, &template.wave, &template.water).ln();
        let lo = interp_linear(line.wavelength, &template.wave, &template.others).ln();
        if !(r.is_finite() && r > 0.0 && lw.is_finite() && lo.is_finite()) {
            continue;
        }
        let sw = line.weight.sqrt();
        y.push(r.ln() * sw);
        water.push(lw * sw);
        others.push(lo * sw);
    }
    if y.len() < 2 {
        return Err(TelluricError::TooFewMaskLines { found: y.len() });
    }
    let n = y.len();
    let mut samples = Array2::zeros((2, n));
    samples.row_mut(0).assign(&Array1::from(water));
    samples.row_mut(1).assign(&Array1::from(others));
    let (amps, _) = linear_minimization(Array1::from(y).view(), samples.view())?;
    Ok((amps[0], amps[1]))
}

/// Fit the water and dry exponents of a blaze-normalised E2DS.
///
/// Orders with an SNR below the configured minimum don't contribute. The
/// returned transmission covers every pixel the SED and the model are
/// defined on. A `stellar` template on the spectrum's grid keeps the star's
/// own lines out of the SED.
#[allow(clippy::too_many_arguments)]
pub(crate) fn preclean(
    e2ds: ArrayView2<f64>,
    wave: ArrayView2<f64>,
    snr: &[f64],
    template: &TransmissionTemplate,
    water_mask: &[WeightedLine],
    dry_mask: &[WeightedLine],
    bounds: &ExpoBounds,
    stellar: Option<ArrayView2<f64>>,
    config: &TelluricConfig,
) -> Result<Preclean, TelluricError> {
    let n_orders = e2ds.nrows();
    let mut spectrum = e2ds.to_owned();
    let mut n_valid = 0;
    for (order, mut row) in spectrum.outer_iter_mut().enumerate() {
        let s = snr.get(order).copied().unwrap_or(f64::NAN);
        if s.is_nan() || s < config.min_snr {
            debug!("Order {order} has SNR {s:.1}; not used for the telluric fit");
            row.fill(f64::NAN);
        } else {
            n_valid += 1;
        }
    }
    if n_valid == 0 {
        return Err(TelluricError::NoOrders {
            n_orders,
            min_snr: config.min_snr,
        });
    }

    let (start, end) = wave
        .iter()
        .filter(|v| v.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    let covered = match (template.wave.first(), template.wave.last()) {
        (Some(&t0), Some(&t1)) => t0 < end && t1 > start,
        _ => false,
    };
    if !covered {
        return Err(TelluricError::NoTemplateOverlap { start, end });
    }

    let water_lines = lines_on_spectrum(water_mask, wave);
    let mut all_lines = water_lines.clone();
    all_lines.extend(lines_on_spectrum(dry_mask, wave));
    if all_lines.len() < 2 {
        return Err(TelluricError::TooFewMaskLines {
            found: all_lines.len(),
        });
    }

    let sed_of = |s: ArrayView2<f64>| estimate_sed_with(s, stellar, config.sed_window, config.sed_smooth);
    let sed = sed_of(spectrum.view());
    let velocity = water_velocity((&spectrum / &sed).view(), wave, &water_lines, config);
    debug!("Telluric velocity offset: {velocity:.3} km/s");

    let (w_lo, w_hi) = bounds.water;
    let (o_lo, o_hi) = bounds.others;
    let mut atm = Atmosphere {
        template,
        expo_water: 1.0_f64.clamp(w_lo, w_hi),
        expo_others: 1.0_f64.clamp(o_lo, o_hi),
        velocity,
    };
    let mut model = atm.transmission_map(wave);
    let mut sed = sed_of((&spectrum / &model).view());
    let mut converged = false;
    let mut iterations = 0;
    while iterations < config.max_iterations {
        iterations += 1;
        let ratio = &spectrum / &sed;
        let (ew, eo) = fit_exponents(ratio.view(), wave, &all_lines, template, velocity)?;
        let ew = ew.clamp(w_lo, w_hi);
        let eo = eo.clamp(o_lo, o_hi);
        let dexpo = (ew - atm.expo_water).abs().max((eo - atm.expo_others).abs());
        debug!("Telluric iteration {iterations}: water {ew:.4}, others {eo:.4}, change {dexpo:.2e}");
        atm.expo_water = ew;
        atm.expo_others = eo;
        model = atm.transmission_map(wave);
        sed = sed_of((&spectrum / &model).view());
        if dexpo < config.dexpo_threshold {
            converged = true;
            break;
        }
    }
    if !converged {
        warn!(
            "The telluric exponents didn't converge after {iterations} iterations (water {:.3}, others {:.3})",
            atm.expo_water, atm.expo_others
        );
    }

    let mut transmission = &spectrum / &sed;
    transmission.zip_mut_with(&model, |t, &m| {
        if !(m >= MIN_TRANSMISSION && t.is_finite() && *t > 0.0) {
            *t = f64::NAN;
        } else if *t > 1.0 {
            *t = 1.0;
        }
    });

    let mut qc = QcResult::new();
    qc.check("TELLU_CONV", iterations as f64, "exponents converged", converged);
    qc.inform("TELLU_NORDERS", n_valid as f64, "orders above the SNR cut", true);
    Ok(Preclean {
        transmission,
        model,
        expo_water: atm.expo_water,
        expo_others: atm.expo_others,
        velocity,
        iterations,
        converged,
        qc,
    })
}

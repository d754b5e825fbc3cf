// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Stellar templates: the median of an object's telluric-corrected spectra in
//! the barycentric frame. A template gives the telluric fit the object's own
//! lines, so that they aren't mistaken for absorption.

use log::debug;
use ndarray::prelude::*;

use super::TelluricError;
use crate::{
    constants::SPEED_OF_LIGHT_KMS,
    io::{header::Header, product::Product},
    math::{interp_linear, nanmedian, nanmedian_iter},
};

/// One corrected spectrum going into a template.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TemplateFrame<'a> {
    pub(crate) flux: ArrayView2<'a, f64>,
    pub(crate) wave: ArrayView2<'a, f64>,
    /// \[km/s\]
    pub(crate) berv: f64,
}

#[derive(Debug, Clone)]
pub(crate) struct StellarTemplate {
    /// Normalised to a median of 1 in every order.
    pub(crate) flux: Array2<f64>,
    /// Barycentric wavelengths \[nm\].
    pub(crate) wave: Array2<f64>,
    pub(crate) n_frames: usize,
}

fn to_barycentric(wave: ArrayView2<f64>, berv: f64) -> Array2<f64> {
    wave.mapv(|w| w * (1.0 + berv / SPEED_OF_LIGHT_KMS))
}

/// Interpolate every order of `flux` (on `wave`) onto the same order of
/// `target`.
fn resample(flux: ArrayView2<f64>, wave: ArrayView2<f64>, target: ArrayView2<f64>) -> Array2<f64> {
    let mut out = Array2::from_elem(target.dim(), f64::NAN);
    for ((f, w), (t, mut o)) in flux
        .outer_iter()
        .zip(wave.outer_iter())
        .zip(target.outer_iter().zip(out.outer_iter_mut()))
    {
        let (f, w) = (f.to_vec(), w.to_vec());
        o.iter_mut()
            .zip(t.iter())
            .for_each(|(o, &t)| *o = interp_linear(t, &w, &f));
    }
    out
}

fn normalise_orders(image: &mut Array2<f64>) {
    for mut row in image.outer_iter_mut() {
        let med = nanmedian(&row.to_vec());
        if med.is_finite() && med > 0.0 {
            row.mapv_inplace(|v| v / med);
        } else {
            row.fill(f64::NAN);
        }
    }
}

/// Median-combine corrected spectra on the barycentric grid of the first.
pub(crate) fn make_template(frames: &[TemplateFrame]) -> Result<StellarTemplate, TelluricError> {
    let Some(first) = frames.first() else {
        return Err(TelluricError::NoFrames);
    };
    let shape = first.flux.dim();
    if let Some(bad) = frames
        .iter()
        .find(|f| f.flux.dim() != shape || f.wave.dim() != shape)
    {
        return Err(TelluricError::MapShape {
            expected: shape,
            got: bad.flux.dim(),
        });
    }
    let grid = to_barycentric(first.wave, first.berv);
    let resampled: Vec<Array2<f64>> = frames
        .iter()
        .map(|f| {
            let mut r = resample(f.flux, to_barycentric(f.wave, f.berv).view(), grid.view());
            normalise_orders(&mut r);
            r
        })
        .collect();
    let flux = Array2::from_shape_fn(shape, |(o, x)| {
        nanmedian_iter(resampled.iter().map(|r| r[[o, x]]))
    });
    debug!("Combined {} spectra into a template", frames.len());
    Ok(StellarTemplate {
        flux,
        wave: grid,
        n_frames: frames.len(),
    })
}

impl StellarTemplate {
    pub(crate) fn to_product(&self, mut header: Header) -> Product {
        header.set("TMPNFRM", self.n_frames);
        Product::new(self.flux.clone(), header).with_extension("WAVE", self.wave.clone())
    }

    pub(crate) fn from_product(product: &Product) -> Result<StellarTemplate, TelluricError> {
        let wave = product
            .extension("WAVE")
            .filter(|w| w.dim() == product.image.dim())
            .ok_or(TelluricError::MapShape {
                expected: product.image.dim(),
                got: product.extension("WAVE").map(|w| w.dim()).unwrap_or((0, 0)),
            })?;
        let n_frames = product
            .header
            .get_int("TMPNFRM")
            .ok()
            .and_then(|n| usize::try_from(n).ok())
            .unwrap_or(0);
        Ok(StellarTemplate {
            flux: product.image.clone(),
            wave: wave.clone(),
            n_frames,
        })
    }

    /// The template seen on the wavelength grid of a spectrum taken at
    /// `berv`.
    pub(crate) fn on_grid(&self, wave: ArrayView2<f64>, berv: f64) -> Result<Array2<f64>, TelluricError> {
        if wave.nrows() != self.flux.nrows() {
            return Err(TelluricError::MapShape {
                expected: self.flux.dim(),
                got: wave.dim(),
            });
        }
        Ok(resample(
            self.flux.view(),
            self.wave.view(),
            to_barycentric(wave, berv).view(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;
    use crate::math::nanargmin;

    const LINE: f64 = 1600.5;

    /// A continuum at `level` with one stellar line, observed at `berv`.
    fn observed(wave: &Array2<f64>, berv: f64, level: f64) -> Array2<f64> {
        wave.mapv(|w| {
            let rest = w * (1.0 + berv / SPEED_OF_LIGHT_KMS);
            level * (1.0 - 0.6 * (-0.5 * ((rest - LINE) / 0.02).powi(2)).exp())
        })
    }

    fn grid() -> Array2<f64> {
        Array2::from_shape_fn((2, 300), |(o, x)| 1600.0 + 2.0 * o as f64 + 0.004 * x as f64)
    }

    #[test]
    fn test_template_follows_the_star() {
        let wave = grid();
        let a = observed(&wave, 20.0, 500.0);
        let b = observed(&wave, -15.0, 800.0);
        let template = make_template(&[
            TemplateFrame {
                flux: a.view(),
                wave: wave.view(),
                berv: 20.0,
            },
            TemplateFrame {
                flux: b.view(),
                wave: wave.view(),
                berv: -15.0,
            },
        ])
        .unwrap();
        assert_eq!(template.n_frames, 2);

        // Seen at another BERV, the line sits where the star puts it.
        let seen = template.on_grid(wave.view(), 5.0).unwrap();
        let expected = observed(&wave, 5.0, 1.0);
        let row = seen.row(0).to_vec();
        let at = nanargmin(&row).unwrap();
        let expected_at = nanargmin(&expected.row(0).to_vec()).unwrap();
        assert!((at as i64 - expected_at as i64).abs() <= 1, "{at} {expected_at}");
        assert!(seen[[0, 5]].is_nan());
        assert_abs_diff_eq!(seen[[0, 250]], 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(seen[[0, at]], expected[[0, at]], epsilon = 0.05);
    }

    #[test]
    fn test_template_product() {
        let wave = grid();
        let flux = observed(&wave, 0.0, 100.0);
        let template = make_template(&[TemplateFrame {
            flux: flux.view(),
            wave: wave.view(),
            berv: 0.0,
        }])
        .unwrap();
        let product = template.to_product(Header::new());
        let back = StellarTemplate::from_product(&product).unwrap();
        assert_eq!(back.n_frames, 1);
        assert_abs_diff_eq!(back.wave, template.wave);

        assert!(matches!(make_template(&[]), Err(TelluricError::NoFrames)));
        let bare = Product::new(template.flux.clone(), Header::new());
        assert!(StellarTemplate::from_product(&bare).is_err());
    }
}

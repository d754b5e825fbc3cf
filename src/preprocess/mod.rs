// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Detector cleaning: turn a raw frame into a preprocessed ("pp") frame in
//! the canonical orientation.

mod amplifiers;
mod background;
pub(crate) mod hotpix;

use std::path::{Path, PathBuf};

use log::{debug, trace};
use ndarray::prelude::*;
use thiserror::Error;

use self::hotpix::HotPixelStats;
use crate::{
    config::DrsConfig,
    dprtype::DprType,
    io::{
        fits::{self, FitsError},
        header::Header,
        store::{RawFrame, StoreError},
    },
    math::rot8,
    qc::QcResult,
};

#[derive(Error, Debug)]
pub(crate) enum PreprocessError {
    #[error("{}: corrupt frame: {reason}", file.display())]
    Corrupt { file: PathBuf, reason: String },

    #[error("{}: expected a raw image of shape {expected:?}, but got {got:?}", file.display())]
    Shape {
        file: PathBuf,
        expected: (usize, usize),
        got: (usize, usize),
    },

    #[error(transparent)]
    Fits(#[from] FitsError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A cleaned frame in the canonical orientation.
#[derive(Debug, Clone)]
pub(crate) struct PreppedFrame {
    pub(crate) image: Array2<f64>,
    pub(crate) header: Header,
    pub(crate) dprtype: DprType,
    pub(crate) hot_pixels: HotPixelStats,
    /// The fraction of non-finite pixels left after cleaning.
    pub(crate) nan_fraction: f64,
    pub(crate) qc: QcResult,
}

/// The fraction of pixels that are non-finite or at/above `saturation`.
fn corrupt_fraction(image: ArrayView2<f64>, saturation: f64) -> (f64, usize) {
    let n_bad = image
        .iter()
        .filter(|v| !v.is_finite() || **v >= saturation)
        .count();
    (n_bad as f64 / image.len().max(1) as f64, n_bad)
}

/// Clean a raw image whose header has already been interpreted.
pub(crate) fn preprocess_image(
    frame: &RawFrame,
    mut image: Array2<f64>,
    config: &DrsConfig,
) -> Result<PreppedFrame, PreprocessError> {
    let pp = &config.preprocess;
    let det = &config.detector;

    let expected = det.raw_shape();
    if image.dim() != expected {
        return Err(PreprocessError::Shape {
            file: frame.path.clone(),
            expected,
            got: image.dim(),
        });
    }

    if image.iter().all(|v| !v.is_finite()) {
        return Err(PreprocessError::Corrupt {
            file: frame.path.clone(),
            reason: "every pixel is NaN".to_string(),
        });
    }
    let (fraction, n_bad) = corrupt_fraction(image.view(), det.saturation);
    if fraction > pp.max_corrupt_fraction {
        return Err(PreprocessError::Corrupt {
            file: frame.path.clone(),
            reason: format!(
                "{n_bad} pixels ({:.1}%) are saturated or NaN; at most {:.1}% are allowed",
                fraction * 100.0,
                pp.max_corrupt_fraction * 100.0
            ),
        });
    }

    trace!("{}: removing amplifier common mode", frame.basename);
    amplifiers::correct_common_mode(&mut image, pp.n_amps, pp.n_dark_amps, pp.amp_bin);

    trace!("{}: subtracting background", frame.basename);
    background::subtract_background(
        &mut image,
        pp.bkgd_bin,
        pp.bkgd_percentile,
        pp.bkgd_smooth,
    );

    // Orders run along raw rows for even rotations and along raw columns for
    // odd ones.
    let dispersion = if det.rotation % 2 == 1 {
        Axis(0)
    } else {
        Axis(1)
    };
    let hot_pixels = hotpix::clean_hot_pixels(&mut image, dispersion, pp.hotpix_nsig);
    debug!(
        "{}: {} hot or bad pixels flagged, {} repaired",
        frame.basename, hot_pixels.n_flagged, hot_pixels.n_imputed
    );

    let image = rot8(image.view(), det.rotation);
    let n_nan = image.iter().filter(|v| !v.is_finite()).count();
    let nan_fraction = n_nan as f64 / image.len().max(1) as f64;

    let mut qc = QcResult::new();
    qc.check_max("PP_NANFRAC", nan_fraction, pp.max_nan_fraction);

    let mut header = frame.header.clone();
    header.set("DPRTYPE", frame.dprtype.to_string());
    header.set("PPROT", i64::from(det.rotation));
    header.set("PPNHOT", hot_pixels.n_flagged);
    header.set("PPNIMP", hot_pixels.n_imputed);
    header.set("PPNANFR", nan_fraction);
    qc.write_header(&mut header);

    Ok(PreppedFrame {
        image,
        header,
        dprtype: frame.dprtype,
        hot_pixels,
        nan_fraction,
        qc,
    })
}

/// Read and clean a raw file. A header that can't be interpreted makes the
/// frame corrupt.
pub(crate) fn preprocess_file(
    night: &str,
    path: &Path,
    config: &DrsConfig,
) -> Result<PreppedFrame, PreprocessError> {
    let (image, header) = fits::read_primary(path)?;
    let frame = RawFrame::from_header(night, path, header, &config.keywords).map_err(|e| {
        PreprocessError::Corrupt {
            file: path.to_path_buf(),
            reason: e.to_string(),
        }
    })?;
    preprocess_image(&frame, image, config)
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;
    use crate::{config::DetectorConfig, keywords::KeywordSet};

    fn small_config() -> DrsConfig {
        let mut config = DrsConfig {
            detector: DetectorConfig {
                nx: 64,
                ny: 32,
                rotation: 5,
                ..Default::default()
            },
            ..Default::default()
        };
        config.preprocess.n_amps = 4;
        config.preprocess.n_dark_amps = 1;
        config.preprocess.amp_bin = 8;
        config.preprocess.bkgd_bin = 8;
        config
    }

    fn frame() -> RawFrame {
        let mut h = Header::new();
        h.set("MJD-OBS", 60000.0);
        h.set("EXPTIME", 10.0);
        h.set("CMPLTEXP", 1);
        h.set("NEXP", 1);
        h.set("OBSTYPE", "FLAT");
        h.set("SCIFIB", "FLAT");
        h.set("REFFIB", "FLAT");
        RawFrame::from_header("n", Path::new("f.fits"), h, &KeywordSet::default()).unwrap()
    }

    /// Raw images for rotation 5 are (nx, ny) = (64 rows, 32 columns). Orders
    /// run along raw columns.
    fn raw_image() -> Array2<f64> {
        Array2::from_shape_fn((64, 32), |(r, c)| {
            let order = (-0.5 * (((r % 16) as f64 - 8.0) / 1.5).powi(2)).exp();
            let lit = if c >= 8 { 1.0 } else { 0.0 };
            100.0 + lit * 2000.0 * order + ((r * 3 + c * 5) % 7) as f64
        })
    }

    #[test]
    fn test_output_is_rotated_and_tagged() {
        let config = small_config();
        let prepped = preprocess_image(&frame(), raw_image(), &config).unwrap();
        assert_eq!(prepped.image.dim(), (32, 64));
        assert_eq!(prepped.header.get_str("DPRTYPE").unwrap(), "FLAT_FLAT");
        assert_eq!(prepped.header.get_int("PPROT").unwrap(), 5);
        assert!(prepped.qc.passed());
        assert_eq!(prepped.header.get_int("QCC_ALL").unwrap(), 1);
    }

    #[test]
    fn test_preprocessing_is_bit_identical() {
        let config = small_config();
        let a = preprocess_image(&frame(), raw_image(), &config).unwrap();
        let b = preprocess_image(&frame(), raw_image(), &config).unwrap();
        assert_eq!(a.image, b.image);
        assert_abs_diff_eq!(a.nan_fraction, 0.0);
    }

    #[test]
    fn test_all_nan_is_corrupt() {
        let config = small_config();
        let image = Array2::from_elem((64, 32), f64::NAN);
        assert!(matches!(
            preprocess_image(&frame(), image, &config),
            Err(PreprocessError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_mostly_saturated_is_corrupt() {
        let config = small_config();
        let mut image = raw_image();
        image
            .slice_mut(s![..48, ..])
            .fill(config.detector.saturation);
        assert!(matches!(
            preprocess_image(&frame(), image, &config),
            Err(PreprocessError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_wrong_shape() {
        let config = small_config();
        assert!(matches!(
            preprocess_image(&frame(), Array2::zeros((32, 64)), &config),
            Err(PreprocessError::Shape { .. })
        ));
    }
}

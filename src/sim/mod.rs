// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Synthetic nights.
//!
//! A night is written as raw frames of a small analytic instrument, together
//! with a configuration file describing that instrument and every catalogue
//! the recipes need. All content is derived from a seed, so the same options
//! always give the same files.

mod assets;
pub(crate) mod instrument;

use std::path::{Path, PathBuf};

use chrono::{Datelike, NaiveDate};
use hifitime::Epoch;
use log::{debug, info};
use ndarray::prelude::*;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use self::instrument::{Detector, Light, Sky, AMP_WIDTH, FIBRES, NX, NY, N_AMPS, N_ORDERS, READ_NOISE};
use crate::{
    config::{ConfigError, DrsConfig, PathsConfig},
    constants::SECONDS_PER_DAY,
    io::{
        fits::{write_image_file, FitsError},
        header::Header,
        store::{ensure_dir, StoreError},
    },
    keywords::Keyword,
};

/// The objects the written configuration treats as telluric standards.
const HOT_STARS: [&str; 4] = ["HR 875", "HR 1903", "HR 4468", "HR 7590"];
const SCIENCE_TARGET: &str = "GL699";
const CONFIG_FILE: &str = "nirdrs.toml";
const FIRST_ODOMETER: usize = 2_400_001;

#[derive(Error, Debug)]
pub(crate) enum SimError {
    #[error("Invalid simulation options: {0}")]
    Options(String),

    #[error("Couldn't write {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Couldn't serialise the configuration: {0}")]
    Serialise(#[from] toml::ser::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Fits(#[from] FitsError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct SimOptions {
    /// `YYYY-MM-DD` or `YYYYMMDD`.
    pub(crate) night: String,
    pub(crate) n_darks: usize,
    pub(crate) n_flats: usize,
    pub(crate) n_fp: usize,
    pub(crate) n_hc: usize,
    pub(crate) n_science: usize,
    pub(crate) n_hot_stars: usize,
    /// The dark sequence index starts again from 1 after this many exposures.
    pub(crate) dark_restart: Option<usize>,
    /// How much earlier than the rest of the night the darks are taken
    /// \[days\].
    pub(crate) dark_age: f64,
    /// Add an all-NaN exposure to the FP sequence.
    pub(crate) corrupt_frame: bool,
    /// Stellar radial velocity \[km/s\].
    pub(crate) rv: f64,
    /// Velocity added to the written CCF mask \[km/s\].
    pub(crate) mask_shift: f64,
    pub(crate) seed: u64,
}

impl Default for SimOptions {
    fn default() -> Self {
        Self {
            night: "2024-05-14".to_string(),
            n_darks: 5,
            n_flats: 5,
            n_fp: 5,
            n_hc: 1,
            n_science: 1,
            n_hot_stars: 0,
            dark_restart: None,
            dark_age: 0.0,
            corrupt_frame: false,
            rv: 12.3,
            mask_shift: 0.0,
            seed: 42,
        }
    }
}

impl SimOptions {
    fn validate(&self) -> Result<(), SimError> {
        if let Some(k) = self.dark_restart {
            if k == 0 || k >= self.n_darks {
                return Err(SimError::Options(format!(
                    "the dark index can only restart after 1 to {} exposures, not {k}",
                    self.n_darks.saturating_sub(1)
                )));
            }
        }
        if !self.dark_age.is_finite() || self.dark_age < 0.0 {
            return Err(SimError::Options(format!(
                "the dark age must be a positive number of days, not {}",
                self.dark_age
            )));
        }
        if self.rv.abs() > 1000.0 {
            return Err(SimError::Options(format!("an RV of {} km/s is not stellar", self.rv)));
        }
        Ok(())
    }
}

/// The MJD at which observing starts on `night`.
fn night_start_mjd(night: &str) -> Result<f64, SimError> {
    let date = NaiveDate::parse_from_str(night, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(night, "%Y%m%d"))
        .map_err(|_| SimError::Options(format!("'{night}' is not a date (YYYY-MM-DD)")))?;
    let midnight = Epoch::from_gregorian_utc_at_midnight(date.year(), date.month() as u8, date.day() as u8);
    Ok(midnight.to_mjd_utc_days() + 0.05)
}

/// One raw exposure to write.
#[derive(Debug, Clone, PartialEq)]
struct Exposure {
    name: String,
    science: Light,
    reference: Light,
    obstype: &'static str,
    object: String,
    mjd: f64,
    /// \[s\]
    exptime: f64,
    seq_index: usize,
    seq_total: usize,
    airmass: f64,
    corrupt: bool,
}

/// Hands out file names and acquisition times.
struct Schedule {
    odometer: usize,
    exposures: Vec<Exposure>,
}

impl Schedule {
    /// Add a sequence of exposures starting at `mjd`. `indices` are the
    /// (index, total) header values of each.
    #[allow(clippy::too_many_arguments)]
    fn sequence(
        &mut self,
        mjd: f64,
        suffix: char,
        science: Light,
        reference: Light,
        exptime: f64,
        indices: &[(usize, usize)],
        object: &str,
        airmass: f64,
    ) {
        let step = (exptime + 20.0) / SECONDS_PER_DAY;
        let obstype = match science {
            Light::Dark => "DARK",
            Light::Star { .. } => "OBJECT",
            _ => "ALIGN",
        };
        for (i, &(seq_index, seq_total)) in indices.iter().enumerate() {
            self.exposures.push(Exposure {
                name: format!("{:07}{suffix}", self.odometer),
                science,
                reference,
                obstype,
                object: object.to_string(),
                mjd: mjd + i as f64 * step,
                exptime,
                seq_index,
                seq_total,
                airmass,
                corrupt: false,
            });
            self.odometer += 1;
        }
    }
}

fn complete(n: usize) -> Vec<(usize, usize)> {
    (1..=n).map(|i| (i, n)).collect()
}

/// Every exposure of the night, in acquisition order apart from old darks.
fn schedule(opts: &SimOptions, start: f64) -> Vec<Exposure> {
    let mut s = Schedule {
        odometer: FIRST_ODOMETER,
        exposures: vec![],
    };

    let dark_indices = match opts.dark_restart {
        // The first sequence expected all the darks but stopped early.
        Some(k) => (1..=k)
            .map(|i| (i, opts.n_darks))
            .chain(complete(opts.n_darks - k))
            .collect(),
        None => complete(opts.n_darks),
    };
    s.sequence(start - opts.dark_age, 'd', Light::Dark, Light::Dark, 100.0, &dark_indices, "DARK", 1.0);
    s.sequence(start + 0.02, 'f', Light::Flat, Light::Flat, 10.0, &complete(opts.n_flats), "FLAT", 1.0);

    let n_fp = opts.n_fp + usize::from(opts.corrupt_frame);
    s.sequence(start + 0.04, 'a', Light::Fp, Light::Fp, 10.0, &complete(n_fp), "FP", 1.0);
    if opts.corrupt_frame {
        if let Some(last) = s.exposures.last_mut() {
            last.corrupt = true;
        }
    }
    s.sequence(start + 0.06, 'a', Light::Hc, Light::Hc, 10.0, &complete(opts.n_hc), "HC", 1.0);

    for i in 0..opts.n_hot_stars {
        // Spread the water column so that the maps differ.
        let airmass = 1.0 + 0.05 * (i % 10) as f64;
        let star = Light::Star {
            rv: None,
            water: 0.4 + 0.12 * ((i * 3) % 11) as f64,
            others: airmass,
        };
        let object = HOT_STARS[i % HOT_STARS.len()];
        s.sequence(start + 0.10 + 0.004 * i as f64, 'o', star, Light::Fp, 100.0, &complete(1), object, airmass);
    }
    for i in 0..opts.n_science {
        let star = Light::Star {
            rv: Some(opts.rv),
            water: 1.1,
            others: 1.2,
        };
        s.sequence(start + 0.30 + 0.01 * i as f64, 'o', star, Light::Fp, 300.0, &complete(1), SCIENCE_TARGET, 1.2);
    }
    s.exposures
}

/// The configuration of the synthetic instrument. Paths are relative to the
/// directory the configuration is written to.
pub(crate) fn sim_config() -> DrsConfig {
    let mut config = DrsConfig::default();
    config.paths = PathsConfig {
        raw: PathBuf::from("raw"),
        working: PathBuf::from("working"),
        reduced: PathBuf::from("reduced"),
        calib_db: PathBuf::from("calibDB"),
        tellu_db: PathBuf::from("telluDB"),
        msg: PathBuf::from("msg"),
        plot: PathBuf::from("plot"),
        assets: PathBuf::from("assets"),
    };
    config.detector.nx = NX;
    config.detector.ny = NY;
    config.detector.rotation = 0;
    config.detector.read_noise = READ_NOISE;
    config.preprocess.n_amps = N_AMPS;
    config.preprocess.n_dark_amps = 1;
    config.preprocess.amp_bin = AMP_WIDTH / 4;
    config.loc.fibre_layout = FIBRES.iter().map(|f| f.to_string()).collect();
    config.wave.poly_deg = 3;
    config.telluric.hot_stars = HOT_STARS.iter().map(|s| s.to_string()).collect();
    config.ccf.n_ord_max = N_ORDERS;
    config.ccf.min_contrast = 0.1;
    config.calibdb.max_wait = 60.0;
    config
}

fn exposure_header(e: &Exposure, config: &DrsConfig) -> Header {
    let kw = &config.keywords;
    let mut h = Header::new();
    h.set(kw.key(Keyword::Mjd), e.mjd);
    h.set(kw.key(Keyword::ExpTime), e.exptime);
    h.set(kw.key(Keyword::ExpRequested), e.exptime);
    h.set(kw.key(Keyword::SeqIndex), e.seq_index);
    h.set(kw.key(Keyword::SeqTotal), e.seq_total);
    h.set(kw.key(Keyword::ObsType), e.obstype);
    h.set(kw.key(Keyword::SciFibre), e.science.name());
    h.set(kw.key(Keyword::RefFibre), e.reference.name());
    h.set(kw.key(Keyword::Object), e.object.as_str());
    h.set(kw.key(Keyword::Airmass), e.airmass);
    h.set(kw.key(Keyword::Mode), crate::constants::DEFAULT_INSTRUMENT_MODE);
    h.set(kw.key(Keyword::Berv), 0.0);
    h.set("ORIGIN", "nirdrs simulate-night");
    h
}

/// What [`simulate_night`] wrote.
#[derive(Debug, Clone)]
pub(crate) struct SimulatedNight {
    pub(crate) config: PathBuf,
    pub(crate) raw_dir: PathBuf,
    pub(crate) frames: Vec<PathBuf>,
    pub(crate) assets: Vec<PathBuf>,
}

/// Write a synthetic night, its configuration and its catalogues under
/// `outdir`.
pub(crate) fn simulate_night(outdir: &Path, opts: &SimOptions) -> Result<SimulatedNight, SimError> {
    opts.validate()?;
    let start = night_start_mjd(&opts.night)?;
    ensure_dir(outdir)?;

    let config_path = outdir.join(CONFIG_FILE);
    let text = toml::to_string(&sim_config())?;
    std::fs::write(&config_path, text).map_err(|source| SimError::Io {
        path: config_path.clone(),
        source,
    })?;
    // Read back, so that the paths are resolved exactly as the recipes will
    // see them.
    let config = DrsConfig::from_file(&config_path)?;
    config.validate()?;
    debug!("Wrote {}", config_path.display());

    let sky = Sky::new(opts.seed);
    let detector = Detector::new(opts.seed);
    ensure_dir(&config.paths.assets)?;
    let assets = assets::write_assets(&config, &sky, opts.mask_shift)?;

    let raw_dir = config.paths.raw.join(&opts.night);
    ensure_dir(&raw_dir)?;
    let exposures = schedule(opts, start);
    let frames = exposures
        .par_iter()
        .enumerate()
        .map(|(i, e)| {
            let path = raw_dir.join(format!("{}.fits", e.name));
            let image = if e.corrupt {
                Array2::from_elem((NY, NX), f64::NAN)
            } else {
                let seed = opts.seed.wrapping_mul(1_000_003).wrapping_add(i as u64);
                detector.expose(&sky, e.science, e.reference, e.exptime, seed)
            };
            write_image_file(&path, image.view(), &exposure_header(e, &config), &[])?;
            debug!(
                "{}: {}_{} ({}/{}) at MJD {:.5}",
                e.name,
                e.science.name(),
                e.reference.name(),
                e.seq_index,
                e.seq_total,
                e.mjd
            );
            Ok(path)
        })
        .collect::<Result<Vec<_>, SimError>>()?;

    info!(
        "Simulated night {}: {} raw frames in {}",
        opts.night,
        frames.len(),
        raw_dir.display()
    );
    Ok(SimulatedNight {
        config: config_path,
        raw_dir,
        frames,
        assets,
    })
}

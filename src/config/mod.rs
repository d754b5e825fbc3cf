// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Pipeline configuration.
//!
//! [`DrsConfig`] is immutable once loaded and is handed to every recipe. Every
//! field has a default, so a configuration file only needs to specify what it
//! changes. Files may be TOML, JSON or YAML. After a file is loaded, the
//! `DRS_*` environment variables override the data directories.

mod error;
#[cfg(test)]
mod tests;

pub(crate) use error::ConfigError;

use std::{
    path::{Path, PathBuf},
    str::FromStr,
};

use itertools::Itertools;
use log::debug;
use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter, EnumString};

use crate::keywords::KeywordSet;

lazy_static::lazy_static! {
    pub(crate) static ref CONFIG_FILE_TYPES_COMMA_SEPARATED: String = ConfigFileType::iter().join(", ");
}

/// The file names searched for in a `DRS_UCONFIG` directory.
const CONFIG_FILE_STEMS: [&str; 1] = ["nirdrs"];

#[derive(Debug, Display, EnumIter, EnumString, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConfigFileType {
    #[strum(serialize = "toml")]
    Toml,
    #[strum(serialize = "json")]
    Json,
    #[strum(serialize = "yaml", serialize = "yml")]
    Yaml,
}

/// How the orchestrator runs recipe items.
#[derive(
    Debug, Display, EnumIter, EnumString, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub(crate) enum Isolation {
    /// Each item runs in its own `nirdrs run-item` process.
    Process,
    /// Items run on worker threads of the orchestrating process.
    Thread,
}

/// Which calibration to use when more than one is available.
#[derive(
    Debug, Display, EnumIter, EnumString, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub(crate) enum LookupPolicy {
    /// The latest calibration taken at or before the frame.
    Older,
    /// The calibration closest in time to the frame, before or after.
    Closest,
}

#[derive(
    Debug, Display, EnumIter, EnumString, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub(crate) enum ExtractMethod {
    /// Uniform weights across the slit.
    Tilt,
    /// Horne (1986) optimal weights.
    Optimal,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct DrsConfig {
    pub(crate) paths: PathsConfig,
    pub(crate) detector: DetectorConfig,
    pub(crate) keywords: KeywordSet,
    pub(crate) calibdb: CalibDbConfig,
    pub(crate) preprocess: PreprocessConfig,
    pub(crate) dark: DarkConfig,
    pub(crate) badpix: BadpixConfig,
    pub(crate) loc: LocConfig,
    pub(crate) shape: ShapeConfig,
    pub(crate) flat: FlatConfig,
    pub(crate) thermal: ThermalConfig,
    pub(crate) wave: WaveConfig,
    pub(crate) drift: DriftConfig,
    pub(crate) extract: ExtractConfig,
    pub(crate) s1d: S1dConfig,
    pub(crate) telluric: TelluricConfig,
    pub(crate) ccf: CcfConfig,
    pub(crate) orchestrator: OrchestratorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct PathsConfig {
    pub(crate) raw: PathBuf,
    pub(crate) working: PathBuf,
    pub(crate) reduced: PathBuf,
    pub(crate) calib_db: PathBuf,
    pub(crate) tellu_db: PathBuf,
    pub(crate) msg: PathBuf,
    pub(crate) plot: PathBuf,
    /// Where catalogues, masks and templates are found when given as relative
    /// paths.
    pub(crate) assets: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            raw: PathBuf::from("data/raw"),
            working: PathBuf::from("data/working"),
            reduced: PathBuf::from("data/reduced"),
            calib_db: PathBuf::from("data/calibDB"),
            tellu_db: PathBuf::from("data/telluDB"),
            msg: PathBuf::from("data/msg"),
            plot: PathBuf::from("data/plot"),
            assets: PathBuf::from("assets"),
        }
    }
}

impl PathsConfig {
    /// Resolve a catalogue/mask/template path against the assets directory.
    pub(crate) fn asset<P: AsRef<Path>>(&self, p: P) -> PathBuf {
        let p = p.as_ref();
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.assets.join(p)
        }
    }

    pub(crate) fn make_absolute(&mut self, base: &Path) {
        for p in [
            &mut self.raw,
            &mut self.working,
            &mut self.reduced,
            &mut self.calib_db,
            &mut self.tellu_db,
            &mut self.msg,
            &mut self.plot,
            &mut self.assets,
        ] {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct DetectorConfig {
    /// Columns of a preprocessed frame.
    pub(crate) nx: usize,
    /// Rows of a preprocessed frame.
    pub(crate) ny: usize,
    /// The `rot8` code taking a raw frame to the canonical orientation.
    pub(crate) rotation: u8,
    /// \[ADU\]
    pub(crate) saturation: f64,
    /// \[ADU\]
    pub(crate) read_noise: f64,
    /// The instrument modes that may appear in raw headers.
    pub(crate) modes: Vec<String>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            nx: 4096,
            ny: 4096,
            rotation: 5,
            saturation: 60000.0,
            read_noise: 10.0,
            modes: vec!["SPECTRO".to_string(), "POLAR".to_string()],
        }
    }
}

impl DetectorConfig {
    /// The (rows, columns) of a raw frame.
    pub(crate) fn raw_shape(&self) -> (usize, usize) {
        if self.rotation % 2 == 1 {
            (self.nx, self.ny)
        } else {
            (self.ny, self.nx)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct CalibDbConfig {
    pub(crate) policy: LookupPolicy,
    /// When no calibration precedes a frame, use the closest one instead of
    /// failing.
    pub(crate) fallback_to_closest: bool,
    /// \[seconds\]
    pub(crate) max_wait: f64,
    /// \[seconds\]
    pub(crate) poll_interval: f64,
}

impl Default for CalibDbConfig {
    fn default() -> Self {
        Self {
            policy: LookupPolicy::Older,
            fallback_to_closest: true,
            max_wait: crate::constants::DEFAULT_DB_MAX_WAIT,
            poll_interval: 0.1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct PreprocessConfig {
    pub(crate) n_amps: usize,
    /// The number of unilluminated amplifiers, counted from the first raw
    /// column.
    pub(crate) n_dark_amps: usize,
    /// Rows per bin when removing the low-frequency level of dark amplifiers.
    pub(crate) amp_bin: usize,
    /// Down-binning factor of the background estimate.
    pub(crate) bkgd_bin: usize,
    pub(crate) bkgd_percentile: f64,
    /// Gaussian smoothing of the binned background \[bins\].
    pub(crate) bkgd_smooth: f64,
    pub(crate) hotpix_nsig: f64,
    /// The largest fraction of saturated or NaN pixels in a raw frame.
    pub(crate) max_corrupt_fraction: f64,
    /// The largest fraction of non-finite pixels after cleaning.
    pub(crate) max_nan_fraction: f64,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            n_amps: 32,
            n_dark_amps: 5,
            amp_bin: 32,
            bkgd_bin: 32,
            bkgd_percentile: 5.0,
            bkgd_smooth: 1.0,
            hotpix_nsig: 10.0,
            max_corrupt_fraction: 0.5,
            max_nan_fraction: 0.01,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct DarkConfig {
    pub(crate) max_dead_fraction: f64,
    /// \[ADU/s\]
    pub(crate) max_median: f64,
}

impl Default for DarkConfig {
    fn default() -> Self {
        Self {
            max_dead_fraction: 0.05,
            max_median: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct BadpixConfig {
    /// \[ADU/s\]
    pub(crate) max_hot: f64,
    pub(crate) flat_cut_ratio: f64,
    pub(crate) flat_median_width: usize,
    pub(crate) illum_cut: f64,
    pub(crate) max_bad_fraction: f64,
}

impl Default for BadpixConfig {
    fn default() -> Self {
        Self {
            max_hot: 5.0,
            flat_cut_ratio: 0.5,
            flat_median_width: 7,
            illum_cut: 0.05,
            max_bad_fraction: 0.1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct LocConfig {
    /// Fibre groups from the bottom to the top of each order.
    pub(crate) fibre_layout: Vec<String>,
    pub(crate) central_column: Option<usize>,
    pub(crate) collapse_width: usize,
    pub(crate) median_window: usize,
    /// In units of the read noise.
    pub(crate) threshold_sigma: f64,
    pub(crate) min_width: usize,
    pub(crate) min_spacing: f64,
    pub(crate) column_step: usize,
    pub(crate) centroid_half_width: f64,
    pub(crate) centre_poly_deg: usize,
    pub(crate) width_poly_deg: usize,
    pub(crate) max_rms_centre: f64,
    pub(crate) max_ptp_centre: f64,
    pub(crate) max_rms_width: f64,
    pub(crate) max_ptp_width: f64,
    pub(crate) qc_max_removed: usize,
    pub(crate) qc_max_rms: f64,
}

impl Default for LocConfig {
    fn default() -> Self {
        Self {
            fibre_layout: vec!["AB".to_string(), "C".to_string()],
            central_column: None,
            collapse_width: 10,
            median_window: 51,
            threshold_sigma: 10.0,
            min_width: 3,
            min_spacing: 4.0,
            column_step: 10,
            centroid_half_width: 4.0,
            centre_poly_deg: 4,
            width_poly_deg: 3,
            max_rms_centre: 0.1,
            max_ptp_centre: 0.5,
            max_rms_width: 0.5,
            max_ptp_width: 1.5,
            qc_max_removed: 500,
            qc_max_rms: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct ShapeConfig {
    pub(crate) n_iterations: usize,
    pub(crate) peak_fraction: f64,
    pub(crate) max_peaks: usize,
    pub(crate) min_peaks: usize,
    /// The largest slit slope searched \[pixels per row\].
    pub(crate) max_slope: f64,
    pub(crate) n_slopes: usize,
    pub(crate) slope_poly_deg: usize,
    /// Rows either side of a trace centre.
    pub(crate) half_height: usize,
    /// Columns either side of an FP peak.
    pub(crate) peak_half_window: usize,
}

impl Default for ShapeConfig {
    fn default() -> Self {
        Self {
            n_iterations: 3,
            peak_fraction: 0.3,
            max_peaks: 300,
            min_peaks: 5,
            max_slope: 0.2,
            n_slopes: 21,
            slope_poly_deg: 2,
            half_height: 4,
            peak_half_window: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct FlatConfig {
    pub(crate) n_sigma: f64,
    pub(crate) n_iterations: usize,
    pub(crate) peak_cut: f64,
    pub(crate) max_rms: f64,
}

impl Default for FlatConfig {
    fn default() -> Self {
        Self {
            n_sigma: 4.0,
            n_iterations: 3,
            peak_cut: 0.1,
            max_rms: 0.05,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct ThermalConfig {
    pub(crate) enabled: bool,
}

impl Default for ThermalConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct WaveConfig {
    pub(crate) hc_catalogue: PathBuf,
    pub(crate) initial_solution: PathBuf,
    pub(crate) poly_deg: usize,
    pub(crate) hc_half_window: usize,
    pub(crate) hc_min_snr: f64,
    /// \[pixels\]
    pub(crate) match_window: f64,
    pub(crate) hc_nsig_clip: f64,
    pub(crate) min_lines: usize,
    pub(crate) fp_half_window: usize,
    pub(crate) fp_min_fraction: f64,
    /// How far (in peak numbers) the FP numbering is searched around the first
    /// guess.
    pub(crate) fp_number_search: i64,
    /// \[m/s\]
    pub(crate) max_rms: f64,
}

impl Default for WaveConfig {
    fn default() -> Self {
        Self {
            hc_catalogue: PathBuf::from("hc_lines.txt"),
            initial_solution: PathBuf::from("wave_initial.txt"),
            poly_deg: 4,
            hc_half_window: 4,
            hc_min_snr: 20.0,
            match_window: 3.0,
            hc_nsig_clip: 10.0,
            min_lines: 6,
            fp_half_window: 3,
            fp_min_fraction: 0.05,
            fp_number_search: 50,
            max_rms: 150.0,
        }
    }
}

/// Settings for FP drift measurements against the reference FP.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct DriftConfig {
    /// Read noise used in the photon-noise weights \[e-\].
    pub(crate) noise: f64,
    /// Pixels masked on either side of a saturated pixel.
    pub(crate) box_size: usize,
    /// Pixels at or above this flux are saturated.
    pub(crate) max_flux: f64,
    /// Cosmic rejection threshold on the normalised residuals \[sigma\].
    pub(crate) cosmic_cut: f64,
    /// The largest acceptable uncertainty on the mean drift \[m/s\].
    pub(crate) max_error: f64,
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            noise: 8.0,
            box_size: 12,
            max_flux: 1e9,
            cosmic_cut: 4.5,
            max_error: 10.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct ExtractConfig {
    pub(crate) method: ExtractMethod,
    /// Rows below the trace centre.
    pub(crate) half_width_low: f64,
    /// Rows above the trace centre.
    pub(crate) half_width_high: f64,
    /// \[sigma\]
    pub(crate) cosmic_cut: f64,
    pub(crate) cosmic_max_iter: usize,
    pub(crate) use_flat: bool,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            method: ExtractMethod::Optimal,
            half_width_low: 4.0,
            half_width_high: 4.0,
            cosmic_cut: 10.0,
            cosmic_max_iter: 5,
            use_flat: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct S1dConfig {
    /// \[nm\]
    pub(crate) bin_wave: f64,
    /// \[km/s\]
    pub(crate) bin_velocity: f64,
    /// \[nm\]
    pub(crate) wave_start: Option<f64>,
    /// \[nm\]
    pub(crate) wave_end: Option<f64>,
    /// Half-width of the Lanczos kernel \[pixels\].
    pub(crate) kernel_width: f64,
    pub(crate) min_valid_fraction: f64,
}

impl Default for S1dConfig {
    fn default() -> Self {
        Self {
            bin_wave: 0.005,
            bin_velocity: 1.0,
            wave_start: None,
            wave_end: None,
            kernel_width: 3.0,
            min_valid_fraction: 0.99,
        }
    }
}

/// Bounds on the optical-depth exponents of the two telluric species.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct ExpoBounds {
    pub(crate) water: (f64, f64),
    pub(crate) others: (f64, f64),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct TelluricConfig {
    pub(crate) enabled: bool,
    pub(crate) template: PathBuf,
    pub(crate) water_mask: PathBuf,
    pub(crate) dry_mask: PathBuf,
    /// Objects treated as telluric standards.
    pub(crate) hot_stars: Vec<String>,
    pub(crate) min_snr: f64,
    /// Exponent bounds while building transmission maps from hot stars.
    pub(crate) hot_star_bounds: ExpoBounds,
    /// Exponent bounds while correcting science frames.
    pub(crate) science_bounds: ExpoBounds,
    pub(crate) max_iterations: usize,
    pub(crate) dexpo_threshold: f64,
    /// \[km/s\]
    pub(crate) ccf_scan_range: f64,
    /// \[km/s\]
    pub(crate) ccf_step: f64,
    pub(crate) n_components: usize,
    pub(crate) fit_derivatives: bool,
    pub(crate) recon_iterations: usize,
    /// Running-median window of the SED estimate \[pixels\].
    pub(crate) sed_window: usize,
    /// Gaussian smoothing of the SED estimate \[pixels\].
    pub(crate) sed_smooth: f64,
    /// Build per-object templates from corrected science frames.
    pub(crate) make_templates: bool,
    /// Frames needed before a template is published.
    pub(crate) template_min_frames: usize,
}

impl Default for TelluricConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            template: PathBuf::from("tapas.txt"),
            water_mask: PathBuf::from("water_mask.txt"),
            dry_mask: PathBuf::from("dry_mask.txt"),
            hot_stars: vec![],
            min_snr: 5.0,
            hot_star_bounds: ExpoBounds {
                water: (0.05, 15.0),
                others: (0.8, 5.0),
            },
            science_bounds: ExpoBounds {
                water: (0.05, 15.0),
                others: (0.8, 5.0),
            },
            max_iterations: 20,
            dexpo_threshold: 1e-4,
            ccf_scan_range: 25.0,
            ccf_step: 0.5,
            n_components: 5,
            fit_derivatives: true,
            recon_iterations: 4,
            sed_window: 51,
            sed_smooth: 5.0,
            make_templates: true,
            template_min_frames: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct CcfConfig {
    pub(crate) mask: PathBuf,
    /// Centre of the velocity scan \[km/s\].
    pub(crate) rv: f64,
    /// Half-width of the velocity scan \[km/s\].
    pub(crate) width: f64,
    /// \[km/s\]
    pub(crate) step: f64,
    /// Width of the top-hat mask lines \[km/s\].
    pub(crate) mask_width: f64,
    pub(crate) n_ord_max: usize,
    pub(crate) min_contrast: f64,
}

impl Default for CcfConfig {
    fn default() -> Self {
        Self {
            mask: PathBuf::from("ccf_mask.txt"),
            rv: 0.0,
            width: 30.0,
            step: 0.5,
            mask_width: 1.7,
            n_ord_max: 48,
            min_contrast: 0.02,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct OrchestratorConfig {
    /// Defaults to the available parallelism.
    pub(crate) n_workers: Option<usize>,
    pub(crate) stop_on_error: bool,
    pub(crate) retry_with_closest: bool,
    /// Exposures whose measured exposure time is below this fraction of the
    /// requested time are aborted.
    pub(crate) abort_fraction: f64,
    pub(crate) isolation: Isolation,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            n_workers: None,
            stop_on_error: false,
            retry_with_closest: true,
            abort_fraction: 0.9,
            isolation: Isolation::Process,
        }
    }
}

impl OrchestratorConfig {
    pub(crate) fn workers(&self) -> usize {
        self.n_workers
            .unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1)
            })
            .max(1)
    }
}

impl DrsConfig {
    /// Read a configuration file. Relative paths inside it are taken relative
    /// to the file's directory.
    pub(crate) fn from_file(file: &Path) -> Result<DrsConfig, ConfigError> {
        debug!("Attempting to parse config file {}", file.display());
        let file_type = file
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .and_then(|e| ConfigFileType::from_str(&e).ok())
            .ok_or_else(|| ConfigError::UnknownExtension {
                file: file.to_path_buf(),
            })?;
        let contents = std::fs::read_to_string(file).map_err(|e| ConfigError::Io {
            file: file.to_path_buf(),
            source: e,
        })?;
        let mut config: DrsConfig = match file_type {
            ConfigFileType::Toml => toml::from_str(&contents).map_err(|e| e.to_string()),
            ConfigFileType::Json => serde_json::from_str(&contents).map_err(|e| e.to_string()),
            ConfigFileType::Yaml => serde_yaml::from_str(&contents).map_err(|e| e.to_string()),
        }
        .map_err(|message| ConfigError::Parse {
            file: file.to_path_buf(),
            file_type,
            message,
        })?;

        let base = file
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        config.paths.make_absolute(&base);
        Ok(config)
    }

    /// Load the configuration: from `file` if given, else from `DRS_UCONFIG`,
    /// else the defaults. Environment overrides are applied and the result is
    /// validated.
    pub(crate) fn load(file: Option<&Path>) -> Result<DrsConfig, ConfigError> {
        let file = match file {
            Some(f) => Some(f.to_path_buf()),
            None => std::env::var_os("DRS_UCONFIG")
                .map(PathBuf::from)
                .map(find_config_in)
                .transpose()?,
        };
        let mut config = match file {
            Some(f) => Self::from_file(&f)?,
            None => DrsConfig::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Override the data directories with any `DRS_*` environment variables.
    pub(crate) fn apply_env_overrides(&mut self) {
        let p = &mut self.paths;
        for (var, dest) in [
            ("DRS_DATA_RAW", &mut p.raw),
            ("DRS_DATA_WORKING", &mut p.working),
            ("DRS_DATA_REDUC", &mut p.reduced),
            ("DRS_CALIB_DB", &mut p.calib_db),
            ("DRS_TELLU_DB", &mut p.tellu_db),
            ("DRS_DATA_MSG", &mut p.msg),
            ("DRS_DATA_PLOT", &mut p.plot),
        ] {
            if let Some(v) = std::env::var_os(var) {
                debug!("{var} overrides {}", dest.display());
                *dest = PathBuf::from(v);
            }
        }
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |s: String| Err(ConfigError::Invalid(s));

        let d = &self.detector;
        if d.nx == 0 || d.ny == 0 {
            return invalid(format!("detector shape {}x{} is empty", d.ny, d.nx));
        }
        if d.rotation > 7 {
            return invalid(format!(
                "detector.rotation must be between 0 and 7, not {}",
                d.rotation
            ));
        }
        if d.modes.is_empty() {
            return Err(ConfigError::Missing("detector.modes".to_string()));
        }

        let pp = &self.preprocess;
        let (_, raw_nx) = d.raw_shape();
        if pp.n_amps == 0 || raw_nx % pp.n_amps != 0 {
            return invalid(format!(
                "raw frames have {raw_nx} columns, which cannot be split into {} amplifiers",
                pp.n_amps
            ));
        }
        if pp.n_dark_amps >= pp.n_amps {
            return invalid(format!(
                "preprocess.n_dark_amps ({}) must be less than preprocess.n_amps ({})",
                pp.n_dark_amps, pp.n_amps
            ));
        }
        if pp.bkgd_bin == 0 || pp.amp_bin == 0 {
            return invalid("preprocess bin sizes must be positive".to_string());
        }

        if self.loc.fibre_layout.is_empty() {
            return Err(ConfigError::Missing("loc.fibre_layout".to_string()));
        }
        for (name, deg) in [
            ("loc.centre_poly_deg", self.loc.centre_poly_deg),
            ("loc.width_poly_deg", self.loc.width_poly_deg),
            ("shape.slope_poly_deg", self.shape.slope_poly_deg),
            ("wave.poly_deg", self.wave.poly_deg),
        ] {
            if deg < 1 {
                return invalid(format!("{name} must be at least 1"));
            }
        }
        if self.loc.column_step == 0 {
            return invalid("loc.column_step must be positive".to_string());
        }

        for (name, bounds) in [
            ("telluric.hot_star_bounds", &self.telluric.hot_star_bounds),
            ("telluric.science_bounds", &self.telluric.science_bounds),
        ] {
            for (species, (lo, hi)) in [("water", bounds.water), ("others", bounds.others)] {
                if lo > hi {
                    return invalid(format!(
                        "{name}.{species}: the lower bound ({lo}) is above the upper bound ({hi})"
                    ));
                }
            }
        }

        if self.ccf.step <= 0.0 || self.ccf.width <= self.ccf.step {
            return invalid(format!(
                "ccf.width ({}) must be larger than ccf.step ({}), which must be positive",
                self.ccf.width, self.ccf.step
            ));
        }
        if self.drift.noise < 0.0 || self.drift.cosmic_cut <= 0.0 || self.drift.max_flux <= 0.0 {
            return invalid(
                "drift.noise must not be negative and drift.cosmic_cut and drift.max_flux must be positive"
                    .to_string(),
            );
        }
        if self.telluric.template_min_frames == 0 {
            return invalid("telluric.template_min_frames must be at least 1".to_string());
        }
        if self.calibdb.max_wait < 0.0 || self.calibdb.poll_interval <= 0.0 {
            return invalid("calibdb.max_wait and calibdb.poll_interval must be positive".to_string());
        }
        Ok(())
    }

    /// Fail with [`ConfigError::UnknownMode`] if `mode` is not an instrument
    /// mode.
    pub(crate) fn check_mode(&self, mode: &str) -> Result<(), ConfigError> {
        if self.detector.modes.iter().any(|m| m == mode) {
            Ok(())
        } else {
            Err(ConfigError::UnknownMode {
                mode: mode.to_string(),
                known: self.detector.modes.join(", "),
            })
        }
    }
}

/// `DRS_UCONFIG` may name a file or a directory containing `nirdrs.<ext>`.
fn find_config_in(p: PathBuf) -> Result<PathBuf, ConfigError> {
    if !p.is_dir() {
        return Ok(p);
    }
    for stem in CONFIG_FILE_STEMS {
        for ext in ConfigFileType::iter() {
            let candidate = p.join(format!("{stem}.{ext}"));
            if candidate.exists() {
                return Ok(candidate);
            }
        }
    }
    Err(ConfigError::NotFound { dir: p })
}

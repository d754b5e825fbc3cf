// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

/*!
Useful constants.

All constants *must* be double precision. Reductions are done in double
precision throughout; products are written as doubles too.
 */

pub use std::f64::consts::{FRAC_PI_2, PI, TAU};

/// Speed of light \[m/s\].
pub const SPEED_OF_LIGHT_MS: f64 = 299_792_458.0;

/// Speed of light \[km/s\].
pub const SPEED_OF_LIGHT_KMS: f64 = SPEED_OF_LIGHT_MS / 1000.0;

/// The ratio between the FWHM and the standard deviation of a Gaussian, i.e.
/// 2 sqrt(2 ln 2).
pub const FWHM_PER_SIGMA: f64 = 2.354_820_045_030_949_3;

/// The MJD of the Unix epoch (1970-01-01T00:00:00).
pub const MJD_UNIX_EPOCH: f64 = 40587.0;

/// The number of seconds in a day.
pub const SECONDS_PER_DAY: f64 = 86400.0;

/// The default name of the calibration database table file.
pub const DEFAULT_CALIB_DB_FILE: &str = "calibDB.txt";

/// The default name of the telluric database table file.
pub const DEFAULT_TELLU_DB_FILE: &str = "telluDB.txt";

/// The default maximum time to wait on a lock file \[seconds\].
pub const DEFAULT_DB_MAX_WAIT: f64 = 3600.0;

/// The default instrument mode, used when a raw header doesn't declare one.
pub const DEFAULT_INSTRUMENT_MODE: &str = "SPECTRO";

/// The name of the changelog file at the installation root.
pub const CHANGELOG_FILE: &str = "CHANGELOG.md";

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Recipes: the units of work of the pipeline.
//!
//! Each recipe takes the configuration, a [`RecipeContext`] (the night, the
//! file store and the calibration databases) and its input files. It writes
//! products and, when its quality control passes, publishes calibrations.
//! The registry below declares what every recipe consumes and produces; the
//! orchestrator schedules from it and the CLI dispatches through it.

mod calibrations;
mod context;
mod provenance;
mod science;
#[cfg(test)]
mod tests;

pub(crate) use context::{LoadedFrame, RecipeContext};
pub(crate) use provenance::Provenance;

use std::path::PathBuf;

use indexmap::IndexMap;
use log::debug;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, EnumString};
use thiserror::Error;

use crate::{
    calib::{flat::FlatError, loc::LocError, shape::ShapeError, wave::WaveError},
    calibdb::{CalibDbError, CalibEntry},
    ccf::CcfError,
    config::{ConfigError, DrsConfig},
    dprtype::DprType,
    extract::ExtractError,
    io::{fits::FitsError, header::HeaderError, store::StoreError, tables::TableError},
    misc::recipe_scope,
    preprocess::PreprocessError,
    qc::QcResult,
    telluric::TelluricError,
};

/// Calibration kinds as they appear in the databases.
pub(crate) mod kinds {
    pub(crate) const DARK: &str = "DARK";
    pub(crate) const BADPIX: &str = "BADPIX";
    pub(crate) const BKGRD_MAP: &str = "BKGRD_MAP";
    pub(crate) const SHAPE: &str = "SHAPE";
    pub(crate) const TELL_MAP: &str = "TELL_MAP";

    pub(crate) fn loc(fibre: &str) -> String {
        format!("LOC_{fibre}")
    }

    pub(crate) fn flat(fibre: &str) -> String {
        format!("FLAT_{fibre}")
    }

    pub(crate) fn blaze(fibre: &str) -> String {
        format!("BLAZE_{fibre}")
    }

    pub(crate) fn thermal(fibre: &str) -> String {
        format!("THERMAL_{fibre}")
    }

    pub(crate) fn wave(fibre: &str) -> String {
        format!("WAVE_{fibre}")
    }

    /// The FP of a master wavelength solution, which drifts are measured
    /// against.
    pub(crate) fn fp_ref(fibre: &str) -> String {
        format!("FP_REF_{fibre}")
    }

    /// The stellar template of an object, kept in the telluric database.
    pub(crate) fn template(object: &str) -> String {
        format!("TELL_TEMP_{}", sanitise_object(object))
    }

    /// Object names as they appear in kinds and file names: upper case, with
    /// anything but letters and digits removed.
    pub(crate) fn sanitise_object(object: &str) -> String {
        object
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_uppercase())
            .collect()
    }
}

#[derive(
    Debug,
    Display,
    EnumIter,
    EnumString,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub(crate) enum RecipeKind {
    Preprocess,
    Dark,
    Badpix,
    Loc,
    Shape,
    Flat,
    Thermal,
    WaveMaster,
    Wave,
    Drift,
    Extract,
    MkTellu,
    FitTellu,
    MkTemplate,
    Ccf,
}

impl RecipeKind {
    pub(crate) fn spec(self) -> &'static RecipeSpec {
        // Every kind is registered; see `test_every_kind_is_registered`.
        &RECIPES[&self]
    }
}

/// Which exposures a recipe input accepts.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Accepts {
    Any,
    Types(&'static [DprType]),
    /// A star (or sky) on the science fibre.
    Science,
}

impl Accepts {
    pub(crate) fn allows(self, dprtype: DprType) -> bool {
        match self {
            Accepts::Any => true,
            Accepts::Types(types) => types.contains(&dprtype),
            Accepts::Science => dprtype.is_science(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct InputRole {
    pub(crate) name: &'static str,
    pub(crate) accepts: Accepts,
}

type RecipeFn = fn(&DrsConfig, &RecipeContext, &RecipeInputs) -> Result<RecipeOutcome, RecipeError>;

/// The static declaration of a recipe. `{FIBER}` in a kind or pattern stands
/// for each fibre group of the layout, `{OBJECT}` for the sanitised object
/// name.
pub(crate) struct RecipeSpec {
    pub(crate) kind: RecipeKind,
    pub(crate) about: &'static str,
    pub(crate) inputs: &'static [InputRole],
    pub(crate) requires: &'static [&'static str],
    pub(crate) optional: &'static [&'static str],
    pub(crate) outputs: &'static [&'static str],
    pub(crate) publishes: &'static [&'static str],
    /// Position in the calibration chain. Work items of a lower rank are
    /// scheduled first.
    pub(crate) rank: usize,
    entry: RecipeFn,
}

impl RecipeSpec {
    pub(crate) fn run(
        &self,
        config: &DrsConfig,
        ctx: &RecipeContext,
        inputs: &RecipeInputs,
    ) -> Result<RecipeOutcome, RecipeError> {
        let _scope = recipe_scope(&self.kind.to_string());
        debug!(
            "Running {} on night {} ({} input roles)",
            self.kind,
            ctx.night,
            inputs.files.len()
        );
        (self.entry)(config, ctx, inputs)
    }
}

const DARKS: &[DprType] = &[DprType::DARK_DARK];
const FLATS: &[DprType] = &[DprType::FLAT_FLAT];
const FPS: &[DprType] = &[DprType::FP_FP];
const HCS: &[DprType] = &[DprType::HC_HC];

const ANY_FILES: &[InputRole] = &[InputRole {
    name: "files",
    accepts: Accepts::Any,
}];
const DARK_FILES: &[InputRole] = &[InputRole {
    name: "files",
    accepts: Accepts::Types(DARKS),
}];
const FLAT_FILES: &[InputRole] = &[InputRole {
    name: "files",
    accepts: Accepts::Types(FLATS),
}];
const FP_FILES: &[InputRole] = &[InputRole {
    name: "files",
    accepts: Accepts::Types(FPS),
}];
const SCIENCE_FILES: &[InputRole] = &[InputRole {
    name: "files",
    accepts: Accepts::Science,
}];
const FLATS_AND_DARKS: &[InputRole] = &[
    InputRole {
        name: "flats",
        accepts: Accepts::Types(FLATS),
    },
    InputRole {
        name: "darks",
        accepts: Accepts::Types(DARKS),
    },
];
const FP_AND_HC: &[InputRole] = &[
    InputRole {
        name: "fp",
        accepts: Accepts::Types(FPS),
    },
    InputRole {
        name: "hc",
        accepts: Accepts::Types(HCS),
    },
];
const HC_AND_FP: &[InputRole] = &[
    InputRole {
        name: "hc",
        accepts: Accepts::Types(HCS),
    },
    InputRole {
        name: "fp",
        accepts: Accepts::Types(FPS),
    },
];

lazy_static::lazy_static! {
    pub(crate) static ref RECIPES: IndexMap<RecipeKind, RecipeSpec> = {
        let specs = [
            RecipeSpec {
                kind: RecipeKind::Preprocess,
                about: "Clean raw frames and rotate them to the canonical orientation",
                inputs: ANY_FILES,
                requires: &[],
                optional: &[],
                outputs: &["{basename}_pp.fits"],
                publishes: &[],
                rank: 0,
                entry: calibrations::preprocess,
            },
            RecipeSpec {
                kind: RecipeKind::Dark,
                about: "Combine dark exposures into a dark-current map",
                inputs: DARK_FILES,
                requires: &[],
                optional: &[],
                outputs: &["{first}_pp_dark.fits"],
                publishes: &[kinds::DARK],
                rank: 1,
                entry: calibrations::dark,
            },
            RecipeSpec {
                kind: RecipeKind::Badpix,
                about: "Flag bad pixels and find the unilluminated background",
                inputs: FLATS_AND_DARKS,
                requires: &[],
                optional: &[kinds::DARK],
                outputs: &["{first}_pp_badpix.fits", "{first}_pp_bmap.fits"],
                publishes: &[kinds::BADPIX, kinds::BKGRD_MAP],
                rank: 2,
                entry: calibrations::badpix,
            },
            RecipeSpec {
                kind: RecipeKind::Loc,
                about: "Localise the orders of every fibre group on flats",
                inputs: FLAT_FILES,
                requires: &[kinds::DARK, kinds::BADPIX],
                optional: &[],
                outputs: &["{first}_pp_loco_{FIBER}.fits"],
                publishes: &["LOC_{FIBER}"],
                rank: 3,
                entry: calibrations::loc,
            },
            RecipeSpec {
                kind: RecipeKind::Shape,
                about: "Measure the slit shape on FP exposures",
                inputs: FP_AND_HC,
                requires: &[kinds::DARK, kinds::BADPIX, "LOC_{FIBER}"],
                optional: &[],
                outputs: &["{first}_pp_shape.fits"],
                publishes: &[kinds::SHAPE],
                rank: 4,
                entry: calibrations::shape,
            },
            RecipeSpec {
                kind: RecipeKind::Flat,
                about: "Fit the blaze and the flat field of every order",
                inputs: FLAT_FILES,
                requires: &[kinds::DARK, kinds::BADPIX, kinds::SHAPE, "LOC_{FIBER}"],
                optional: &[],
                outputs: &["{first}_pp_flat_{FIBER}.fits", "{first}_pp_blaze_{FIBER}.fits"],
                publishes: &["FLAT_{FIBER}", "BLAZE_{FIBER}"],
                rank: 5,
                entry: calibrations::flat,
            },
            RecipeSpec {
                kind: RecipeKind::Thermal,
                about: "Extract dark exposures to measure the thermal background",
                inputs: DARK_FILES,
                requires: &[kinds::DARK, kinds::BADPIX, kinds::SHAPE, "LOC_{FIBER}"],
                optional: &[],
                outputs: &["{first}_pp_thermal_{FIBER}.fits"],
                publishes: &["THERMAL_{FIBER}"],
                rank: 6,
                entry: calibrations::thermal,
            },
            RecipeSpec {
                kind: RecipeKind::WaveMaster,
                about: "Solve for a master wavelength solution and number the FP peaks from scratch",
                inputs: HC_AND_FP,
                requires: &[
                    kinds::DARK,
                    kinds::BADPIX,
                    kinds::SHAPE,
                    "LOC_{FIBER}",
                    "FLAT_{FIBER}",
                    "BLAZE_{FIBER}",
                ],
                optional: &["WAVE_{FIBER}"],
                outputs: &["{first}_pp_wave_{FIBER}.fits", "{first}_pp_fpref_{FIBER}.fits"],
                publishes: &["WAVE_{FIBER}", "FP_REF_{FIBER}"],
                rank: 7,
                entry: calibrations::wave_master,
            },
            RecipeSpec {
                kind: RecipeKind::Wave,
                about: "Solve for the wavelength of every order, numbering FP peaks from the reference FP",
                inputs: HC_AND_FP,
                requires: &[
                    kinds::DARK,
                    kinds::BADPIX,
                    kinds::SHAPE,
                    "LOC_{FIBER}",
                    "FLAT_{FIBER}",
                    "BLAZE_{FIBER}",
                    "FP_REF_{FIBER}",
                ],
                optional: &["WAVE_{FIBER}"],
                outputs: &["{first}_pp_wave_{FIBER}.fits"],
                publishes: &["WAVE_{FIBER}"],
                rank: 8,
                entry: calibrations::wave,
            },
            RecipeSpec {
                kind: RecipeKind::Drift,
                about: "Measure the drift of FP exposures against the reference FP",
                inputs: FP_FILES,
                requires: &[
                    kinds::DARK,
                    kinds::BADPIX,
                    kinds::SHAPE,
                    "LOC_{FIBER}",
                    "FLAT_{FIBER}",
                    "BLAZE_{FIBER}",
                    "WAVE_{FIBER}",
                    "FP_REF_{FIBER}",
                ],
                optional: &[],
                outputs: &["{first}_pp_drift_{FIBER}.fits"],
                publishes: &[],
                rank: 9,
                entry: calibrations::drift,
            },
            RecipeSpec {
                kind: RecipeKind::Extract,
                about: "Extract E2DS and S1D spectra",
                inputs: ANY_FILES,
                requires: &[
                    kinds::DARK,
                    kinds::BADPIX,
                    kinds::SHAPE,
                    "LOC_{FIBER}",
                    "FLAT_{FIBER}",
                    "BLAZE_{FIBER}",
                    "WAVE_{FIBER}",
                ],
                optional: &["THERMAL_{FIBER}"],
                outputs: &[
                    "{base}_pp_e2ds_{FIBER}.fits",
                    "{base}_pp_e2dsff_{FIBER}.fits",
                    "{base}_pp_s1d_w_{FIBER}.fits",
                    "{base}_pp_s1d_v_{FIBER}.fits",
                ],
                publishes: &[],
                rank: 10,
                entry: science::extract,
            },
            RecipeSpec {
                kind: RecipeKind::MkTellu,
                about: "Measure telluric transmission maps on hot stars",
                inputs: SCIENCE_FILES,
                requires: &[],
                optional: &[],
                outputs: &["{base}_pp_tellu_trans_{FIBER}.fits"],
                publishes: &[kinds::TELL_MAP],
                rank: 11,
                entry: science::mk_tellu,
            },
            RecipeSpec {
                kind: RecipeKind::FitTellu,
                about: "Correct science spectra for telluric absorption",
                inputs: SCIENCE_FILES,
                requires: &[],
                optional: &[kinds::TELL_MAP, "TELL_TEMP_{OBJECT}"],
                outputs: &["{base}_pp_tcorr_{FIBER}.fits", "{base}_pp_recon_{FIBER}.fits"],
                publishes: &[],
                rank: 12,
                entry: science::fit_tellu,
            },
            RecipeSpec {
                kind: RecipeKind::MkTemplate,
                about: "Combine the corrected spectra of an object into its stellar template",
                inputs: SCIENCE_FILES,
                requires: &[],
                optional: &[],
                outputs: &["{night}_{OBJECT}_template_{FIBER}.fits"],
                publishes: &["TELL_TEMP_{OBJECT}"],
                rank: 13,
                entry: science::mk_template,
            },
            RecipeSpec {
                kind: RecipeKind::Ccf,
                about: "Cross-correlate spectra with a line mask to measure radial velocities",
                inputs: SCIENCE_FILES,
                requires: &[],
                optional: &[],
                outputs: &["{base}_pp_ccf_{mask}_{FIBER}.fits"],
                publishes: &[],
                rank: 14,
                entry: science::ccf,
            },
        ];
        specs.into_iter().map(|s| (s.kind, s)).collect()
    };
}

/// Input files, one list per input role of the recipe.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct RecipeInputs {
    pub(crate) files: Vec<Vec<PathBuf>>,
}

impl RecipeInputs {
    pub(crate) fn single(files: Vec<PathBuf>) -> RecipeInputs {
        RecipeInputs { files: vec![files] }
    }

    pub(crate) fn pair(first: Vec<PathBuf>, second: Vec<PathBuf>) -> RecipeInputs {
        RecipeInputs {
            files: vec![first, second],
        }
    }

    pub(crate) fn role(&self, i: usize) -> &[PathBuf] {
        self.files.get(i).map(|f| f.as_slice()).unwrap_or(&[])
    }

    /// Every input file of every role.
    pub(crate) fn all(&self) -> impl Iterator<Item = &PathBuf> {
        self.files.iter().flatten()
    }
}

/// What a recipe did. The recipe failed its quality control when
/// `qc.passed()` is false; its products exist regardless.
#[derive(Debug, Clone, Default)]
pub(crate) struct RecipeOutcome {
    pub(crate) outputs: Vec<PathBuf>,
    pub(crate) published: Vec<CalibEntry>,
    pub(crate) qc: QcResult,
}

impl RecipeOutcome {
    pub(crate) fn passed(&self) -> bool {
        self.qc.passed()
    }

    pub(crate) fn merge(&mut self, other: RecipeOutcome) {
        self.outputs.extend(other.outputs);
        self.published.extend(other.published);
        self.qc.merge(other.qc);
    }
}

/// How the orchestrator treats an error.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub(crate) enum ErrorClass {
    /// Bad arguments or configuration.
    User,
    InputNotFound,
    CorruptFrame,
    CalibMissing,
    LockTimeout,
    /// A fit didn't converge. Recorded as a QC failure.
    Convergence,
    Fatal,
}

#[derive(Error, Debug)]
pub(crate) enum RecipeError {
    #[error("{recipe} needs at least one {role} file")]
    NoInputs {
        recipe: RecipeKind,
        role: &'static str,
    },

    #[error("{}: {recipe} doesn't accept {got} exposures as {role}", file.display())]
    WrongType {
        file: PathBuf,
        recipe: RecipeKind,
        role: &'static str,
        got: DprType,
    },

    #[error("{}: {source}", file.display())]
    Header { file: PathBuf, source: HeaderError },

    #[error("Input frames have different shapes: {first:?} and {other:?}")]
    StackShape {
        first: (usize, usize),
        other: (usize, usize),
    },

    #[error("The {kind} calibration {} is malformed: {message}", file.display())]
    BadCalibration {
        kind: String,
        file: PathBuf,
        message: String,
    },

    #[error("{what} {} doesn't exist; run {needs} first", path.display())]
    MissingProduct {
        what: &'static str,
        path: PathBuf,
        needs: RecipeKind,
    },

    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Fits(#[from] FitsError),

    #[error(transparent)]
    Table(#[from] TableError),

    #[error(transparent)]
    Preprocess(#[from] PreprocessError),

    #[error(transparent)]
    CalibDb(#[from] CalibDbError),

    #[error(transparent)]
    Loc(#[from] LocError),

    #[error(transparent)]
    Shape(#[from] ShapeError),

    #[error(transparent)]
    Flat(#[from] FlatError),

    #[error(transparent)]
    Wave(#[from] WaveError),

    #[error(transparent)]
    Extract(#[from] ExtractError),

    #[error(transparent)]
    Telluric(#[from] TelluricError),

    #[error(transparent)]
    Ccf(#[from] CcfError),
}

impl RecipeError {
    pub(crate) fn classify(&self) -> ErrorClass {
        use ErrorClass::*;
        match self {
            RecipeError::NoInputs { .. }
            | RecipeError::WrongType { .. }
            | RecipeError::Config(_)
            | RecipeError::Table(_)
            | RecipeError::Extract(_) => User,

            RecipeError::MissingProduct { .. } => InputNotFound,
            RecipeError::Store(StoreError::InputNotFound { .. }) => InputNotFound,
            RecipeError::Preprocess(PreprocessError::Store(StoreError::InputNotFound { .. })) => {
                InputNotFound
            }

            RecipeError::Header { .. }
            | RecipeError::StackShape { .. }
            | RecipeError::BadCalibration { .. }
            | RecipeError::Fits(_)
            | RecipeError::Preprocess(_)
            | RecipeError::Store(StoreError::Header { .. } | StoreError::DprType { .. }) => {
                CorruptFrame
            }

            RecipeError::CalibDb(CalibDbError::Missing { .. }) => CalibMissing,
            RecipeError::CalibDb(CalibDbError::Busy { .. }) => LockTimeout,

            RecipeError::Loc(_)
            | RecipeError::Shape(ShapeError::TooFewPeaks { .. } | ShapeError::Fit(_))
            | RecipeError::Flat(_)
            | RecipeError::Wave(
                WaveError::TooFewLines { .. } | WaveError::TooFewFpPeaks { .. } | WaveError::Fit(_),
            )
            | RecipeError::Telluric(_)
            | RecipeError::Ccf(_) => Convergence,

            RecipeError::Shape(ShapeError::Product(_)) | RecipeError::Wave(WaveError::Product(_)) => {
                CorruptFrame
            }
            RecipeError::Wave(
                WaveError::NoInitial(_)
                | WaveError::OrderMismatch { .. }
                | WaveError::ReferenceMismatch { .. },
            ) => User,

            RecipeError::Io { .. } | RecipeError::Store(_) | RecipeError::CalibDb(_) => Fatal,
        }
    }
}

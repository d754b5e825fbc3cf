// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Error type for all nirdrs-related errors. This should be the *only* error
//! enum that is publicly visible.

use thiserror::Error;

use crate::{
    calibdb::{CalibDbError, LockError},
    config::ConfigError,
    io::{fits::FitsError, store::StoreError, tables::TableError, GlobError},
    orchestrator::OrchestratorError,
    recipes::{ErrorClass, RecipeError},
    sim::SimError,
};

/// The *only* publicly visible error from nirdrs. Each message carries a hint
/// of where to look next.
#[derive(Error, Debug)]
pub enum DrsError {
    /// A problem with the configuration file or the `DRS_*` environment.
    #[error("{0}\n\nCheck the configuration file given with --config (or DRS_UCONFIG) and the DRS_* environment variables.")]
    Config(String),

    /// An error related to argument files.
    #[error("{0}\n\nArgument files are toml or json; write one with --save-toml to see the expected layout.")]
    ArgFile(String),

    /// Bad recipe arguments: wrong exposure types, missing files, etc.
    #[error("{0}")]
    Recipe(String),

    /// A recipe ran but its products failed quality control.
    #[error("{0}\n\nThe products were written but not published to the calibration database.")]
    Qc(String),

    /// An input frame can't be used.
    #[error("{0}\n\nThe frame is unusable; exclude it from the inputs.")]
    CorruptFrame(String),

    /// A calibration database couldn't be read, written or searched.
    #[error("{0}\n\nInspect the database with 'nirdrs calibdb list'.")]
    CalibDb(String),

    /// A cfitsio error. Because these are usually quite spartan, some
    /// suggestions are provided here.
    #[error("cfitsio error: {0}\n\nIf you don't know what this means, try turning up verbosity (-v or -vv) and maybe disabling progress bars.")]
    Cfitsio(String),

    /// A problem writing a synthetic night.
    #[error("{0}")]
    Simulate(String),

    /// A generic error that can't be clarified further, e.g. IO errors.
    #[error("{0}")]
    Generic(String),
}

impl DrsError {
    /// The process exit code for this error: 1 for problems the user can
    /// fix, 2 for quality-control failures and 3 for everything else.
    pub fn exit_code(&self) -> i32 {
        match self {
            DrsError::Config(_) | DrsError::ArgFile(_) | DrsError::Recipe(_) => 1,
            DrsError::Qc(_) => 2,
            DrsError::CorruptFrame(_)
            | DrsError::CalibDb(_)
            | DrsError::Cfitsio(_)
            | DrsError::Simulate(_)
            | DrsError::Generic(_) => 3,
        }
    }
}

// When changing the error propagation below, ensure `Self::from(e)` uses the
// correct `e`!

impl From<RecipeError> for DrsError {
    fn from(e: RecipeError) -> Self {
        let s = e.to_string();
        match e.classify() {
            ErrorClass::User | ErrorClass::InputNotFound => match e {
                RecipeError::Config(e) => Self::from(e),
                _ => Self::Recipe(s),
            },
            ErrorClass::Convergence => Self::Qc(s),
            ErrorClass::CorruptFrame => match e {
                RecipeError::Fits(e) => Self::from(e),
                _ => Self::CorruptFrame(s),
            },
            ErrorClass::CalibMissing | ErrorClass::LockTimeout => Self::CalibDb(s),
            ErrorClass::Fatal => Self::Generic(s),
        }
    }
}

impl From<OrchestratorError> for DrsError {
    fn from(e: OrchestratorError) -> Self {
        let s = e.to_string();
        match e {
            OrchestratorError::Busy(_) => Self::CalibDb(s),
            OrchestratorError::Dag(_) => Self::Generic(s),
            OrchestratorError::Store(e) => Self::from(e),
            OrchestratorError::Io { .. } => Self::Generic(s),
        }
    }
}

impl From<SimError> for DrsError {
    fn from(e: SimError) -> Self {
        let s = e.to_string();
        match e {
            SimError::Options(_) => Self::Recipe(s),
            SimError::Config(e) => Self::from(e),
            SimError::Fits(e) => Self::from(e),
            SimError::Store(e) => Self::from(e),
            SimError::Io { .. } | SimError::Serialise(_) => Self::Simulate(s),
        }
    }
}

impl From<ConfigError> for DrsError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e.to_string())
    }
}

impl From<CalibDbError> for DrsError {
    fn from(e: CalibDbError) -> Self {
        Self::CalibDb(e.to_string())
    }
}

impl From<LockError> for DrsError {
    fn from(e: LockError) -> Self {
        Self::CalibDb(e.to_string())
    }
}

impl From<StoreError> for DrsError {
    fn from(e: StoreError) -> Self {
        let s = e.to_string();
        match e {
            StoreError::InputNotFound { .. } => Self::Recipe(s),
            StoreError::Header { .. } | StoreError::DprType { .. } => Self::CorruptFrame(s),
            StoreError::Fits(e) => Self::from(e),
            StoreError::Glob(e) => Self::from(e),
            StoreError::CreateDir { .. } => Self::Generic(s),
        }
    }
}

impl From<FitsError> for DrsError {
    fn from(e: FitsError) -> Self {
        Self::Cfitsio(e.to_string())
    }
}

impl From<TableError> for DrsError {
    fn from(e: TableError) -> Self {
        Self::Recipe(e.to_string())
    }
}

impl From<GlobError> for DrsError {
    fn from(e: GlobError) -> Self {
        Self::Recipe(e.to_string())
    }
}

impl From<std::io::Error> for DrsError {
    fn from(e: std::io::Error) -> Self {
        Self::Generic(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::{ccf::CcfError, recipes::RecipeKind};

    #[test]
    fn test_exit_codes() {
        let e = DrsError::from(RecipeError::NoInputs {
            recipe: RecipeKind::Dark,
            role: "files",
        });
        assert_eq!(e.exit_code(), 1);

        let e = DrsError::from(RecipeError::Ccf(CcfError::NotConverged {
            reason: "minimum at the edge of the scan".to_string(),
            at_edge: true,
        }));
        assert!(matches!(e, DrsError::Qc(_)));
        assert_eq!(e.exit_code(), 2);

        let e = DrsError::from(RecipeError::Io {
            path: PathBuf::from("/x"),
            source: std::io::Error::new(std::io::ErrorKind::Other, "disk on fire"),
        });
        assert_eq!(e.exit_code(), 3);

        let e = DrsError::from(ConfigError::Invalid("nx".to_string()));
        assert_eq!(e.exit_code(), 1);
        assert!(e.to_string().contains("--config"));
    }
}

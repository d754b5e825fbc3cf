// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::path::PathBuf;

use thiserror::Error;

use super::lock::LockError;

#[derive(Error, Debug)]
pub(crate) enum CalibDbError {
    #[error("The database at {} is busy: {source}", dir.display())]
    Busy { dir: PathBuf, source: LockError },

    #[error("No {kind} calibration for mode {mode} at or before MJD {mjd:.5}")]
    Missing { kind: String, mode: String, mjd: f64 },

    #[error("Artifact {} doesn't exist", path.display())]
    ArtifactMissing { path: PathBuf },

    #[error("{}:{line}: {message}", file.display())]
    Parse {
        file: PathBuf,
        line: usize,
        message: String,
    },

    #[error("'{0}' can't be stored in the database because it contains whitespace")]
    Whitespace(String),

    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

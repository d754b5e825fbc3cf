// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Functions to glob files.

use std::path::{Path, PathBuf};

use glob::glob;
use thiserror::Error;

/// Given a glob pattern, get all of the matches from the filesystem, sorted.
pub(crate) fn get_all_matches_from_glob(g: &str) -> Result<Vec<PathBuf>, GlobError> {
    let mut entries = vec![];
    for entry in glob(g)? {
        match entry {
            Ok(e) => entries.push(e),
            Err(e) => return Err(GlobError::GlobCrate(e)),
        }
    }
    entries.sort();
    Ok(entries)
}

/// The FITS files directly inside a directory. Glob metacharacters in the
/// directory name are escaped.
pub(crate) fn fits_files_in(dir: &Path) -> Result<Vec<PathBuf>, GlobError> {
    let escaped = glob::Pattern::escape(&dir.display().to_string());
    get_all_matches_from_glob(&format!("{escaped}/*.fits"))
}

/// Expand each argument as a glob if it contains glob metacharacters;
/// otherwise pass it through untouched. A glob that matches nothing is an
/// error.
pub(crate) fn expand_file_args(args: &[String]) -> Result<Vec<PathBuf>, GlobError> {
    let mut files = vec![];
    for a in args {
        if a.contains(['*', '?', '[']) {
            let matches = get_all_matches_from_glob(a)?;
            if matches.is_empty() {
                return Err(GlobError::NoMatches { glob: a.clone() });
            }
            files.extend(matches);
        } else {
            files.push(PathBuf::from(a));
        }
    }
    Ok(files)
}

#[derive(Error, Debug)]
/// Error type associated with glob helper functions.
pub(crate) enum GlobError {
    #[error("No glob matches were found for {glob}")]
    NoMatches { glob: String },

    #[error(transparent)]
    GlobCrate(#[from] glob::GlobError),

    #[error(transparent)]
    PatternError(#[from] glob::PatternError),
}

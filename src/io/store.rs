// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The layout of the data directories, and an index of a night's raw frames
//! keyed by (night, basename).

use std::path::{Path, PathBuf};

use log::{debug, trace, warn};
use thiserror::Error;

use super::{
    fits::{self, FitsError},
    fits_files_in,
    header::{Header, HeaderError},
    GlobError,
};
use crate::{
    config::PathsConfig,
    dprtype::{DprType, DprTypeError},
    keywords::{Keyword, KeywordSet},
};

#[derive(Error, Debug)]
pub(crate) enum StoreError {
    #[error("Input file {} doesn't exist", path.display())]
    InputNotFound { path: PathBuf },

    #[error("{}: {source}", file.display())]
    Header { file: PathBuf, source: HeaderError },

    #[error("{}: {source}", file.display())]
    DprType { file: PathBuf, source: DprTypeError },

    #[error(transparent)]
    Fits(#[from] FitsError),

    #[error(transparent)]
    Glob(#[from] GlobError),

    #[error("Couldn't create directory {}: {source}", dir.display())]
    CreateDir {
        dir: PathBuf,
        source: std::io::Error,
    },
}

/// The file name without a trailing `.fits`.
pub(crate) fn basename_of(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.strip_suffix(".fits").unwrap_or(&name).to_string()
}

/// The header metadata of one raw exposure.
#[derive(Debug, Clone)]
pub(crate) struct RawFrame {
    pub(crate) night: String,
    pub(crate) basename: String,
    pub(crate) path: PathBuf,
    pub(crate) header: Header,
    pub(crate) mjd: f64,
    pub(crate) mode: String,
    pub(crate) seq_index: i64,
    pub(crate) seq_total: i64,
    pub(crate) obstype: String,
    pub(crate) dprtype: DprType,
    pub(crate) object: String,
    /// \[s\]
    pub(crate) exptime: f64,
    /// \[s\]
    pub(crate) exp_requested: f64,
}

impl RawFrame {
    pub(crate) fn from_header(
        night: &str,
        path: &Path,
        header: Header,
        keywords: &KeywordSet,
    ) -> Result<RawFrame, StoreError> {
        let header_err = |source| StoreError::Header {
            file: path.to_path_buf(),
            source,
        };
        let mjd = keywords.get_mjd(&header).map_err(header_err)?;
        let mode = keywords
            .get_str(&header, Keyword::Mode)
            .unwrap_or_else(|_| crate::constants::DEFAULT_INSTRUMENT_MODE.to_string());
        let seq_index = keywords
            .get_int(&header, Keyword::SeqIndex)
            .map_err(header_err)?;
        let seq_total = keywords
            .get_int(&header, Keyword::SeqTotal)
            .map_err(header_err)?;
        let obstype = keywords
            .get_str(&header, Keyword::ObsType)
            .map_err(header_err)?;
        let sci = keywords
            .get_str(&header, Keyword::SciFibre)
            .map_err(header_err)?;
        let reference = keywords
            .get_str(&header, Keyword::RefFibre)
            .map_err(header_err)?;
        let dprtype =
            DprType::from_fibres(&sci, &reference, &mode).map_err(|source| StoreError::DprType {
                file: path.to_path_buf(),
                source,
            })?;
        let object = keywords
            .get_str(&header, Keyword::Object)
            .unwrap_or_default();
        let exptime = keywords
            .get_float(&header, Keyword::ExpTime)
            .map_err(header_err)?;
        let exp_requested = keywords
            .get_float_or(&header, Keyword::ExpRequested, exptime)
            .map_err(header_err)?;

        Ok(RawFrame {
            night: night.to_string(),
            basename: basename_of(path),
            path: path.to_path_buf(),
            header,
            mjd,
            mode,
            seq_index,
            seq_total,
            obstype,
            dprtype,
            object,
            exptime,
            exp_requested,
        })
    }

    /// Was this exposure stopped before it got `fraction` of its requested
    /// time?
    pub(crate) fn is_aborted(&self, fraction: f64) -> bool {
        self.exp_requested > 0.0 && self.exptime < fraction * self.exp_requested
    }
}

/// The outcome of indexing a raw night. Frames whose headers couldn't be
/// interpreted are kept separately so they can still be reported.
#[derive(Debug, Default)]
pub(crate) struct NightIndex {
    pub(crate) frames: Vec<RawFrame>,
    pub(crate) unreadable: Vec<(PathBuf, StoreError)>,
}

#[derive(Debug, Clone)]
pub(crate) struct FileStore {
    paths: PathsConfig,
}

impl FileStore {
    pub(crate) fn new(paths: &PathsConfig) -> FileStore {
        FileStore {
            paths: paths.clone(),
        }
    }

    pub(crate) fn raw_dir(&self, night: &str) -> PathBuf {
        self.paths.raw.join(night)
    }

    pub(crate) fn working_dir(&self, night: &str) -> PathBuf {
        self.paths.working.join(night)
    }

    pub(crate) fn reduced_dir(&self, night: &str) -> PathBuf {
        self.paths.reduced.join(night)
    }

    pub(crate) fn msg_dir(&self, night: &str) -> PathBuf {
        self.paths.msg.join(night)
    }

    /// Where a preprocessed frame lives.
    pub(crate) fn pp_path(&self, night: &str, basename: &str) -> PathBuf {
        self.working_dir(night).join(format!("{basename}_pp.fits"))
    }

    /// Where a product of the given file name lives.
    pub(crate) fn product_path(&self, night: &str, name: &str) -> PathBuf {
        self.reduced_dir(night).join(name)
    }

    /// Find an input file given on the command line. Absolute or existing
    /// relative paths are used as they are; otherwise the name is looked for
    /// in the night's raw, working and reduced directories (with `.fits`
    /// appended if needed).
    pub(crate) fn resolve_input(&self, night: &str, name: &Path) -> Result<PathBuf, StoreError> {
        if name.exists() {
            return Ok(name.to_path_buf());
        }
        let with_ext = if name.extension().is_none() {
            name.with_extension("fits")
        } else {
            name.to_path_buf()
        };
        for dir in [
            self.raw_dir(night),
            self.working_dir(night),
            self.reduced_dir(night),
        ] {
            let candidate = dir.join(&with_ext);
            if candidate.exists() {
                return Ok(candidate);
            }
        }
        Err(StoreError::InputNotFound {
            path: name.to_path_buf(),
        })
    }

    pub(crate) fn list_raw(&self, night: &str) -> Result<Vec<PathBuf>, StoreError> {
        Ok(fits_files_in(&self.raw_dir(night))?)
    }

    /// Read the header of every raw frame of a night, sorted by acquisition
    /// time.
    pub(crate) fn index_night(
        &self,
        night: &str,
        keywords: &KeywordSet,
    ) -> Result<NightIndex, StoreError> {
        let mut index = NightIndex::default();
        for path in self.list_raw(night)? {
            match self.read_raw_frame(night, &path, keywords) {
                Ok(frame) => index.frames.push(frame),
                Err(e) => {
                    warn!("Couldn't index {}: {e}", path.display());
                    index.unreadable.push((path, e));
                }
            }
        }
        index.frames.sort_by(|a, b| {
            a.mjd
                .total_cmp(&b.mjd)
                .then_with(|| a.basename.cmp(&b.basename))
        });
        for f in &index.frames {
            trace!(
                "{}/{}: {} {} '{}', {} of {}",
                f.night,
                f.basename,
                f.obstype,
                f.dprtype,
                f.object,
                f.seq_index,
                f.seq_total
            );
        }
        debug!(
            "Indexed {} raw frames for night {night} ({} unreadable)",
            index.frames.len(),
            index.unreadable.len()
        );
        Ok(index)
    }

    pub(crate) fn read_raw_frame(
        &self,
        night: &str,
        path: &Path,
        keywords: &KeywordSet,
    ) -> Result<RawFrame, StoreError> {
        let header = fits::read_primary_header(path)?;
        RawFrame::from_header(night, path, header, keywords)
    }
}

/// Create a directory (and its parents) if it doesn't exist.
pub(crate) fn ensure_dir(dir: &Path) -> Result<(), StoreError> {
    std::fs::create_dir_all(dir).map_err(|e| StoreError::CreateDir {
        dir: dir.to_path_buf(),
        source: e,
    })
}

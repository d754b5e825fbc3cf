// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Plain-text catalogues and masks.
//!
//! Columns are separated by whitespace and `#` starts a comment. Extra columns
//! are ignored.

use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Error, Debug)]
pub(crate) enum TableError {
    #[error("Couldn't read {}: {source}", file.display())]
    Io {
        file: PathBuf,
        source: std::io::Error,
    },

    #[error("{}:{line}: expected at least {needed} columns, found {got}", file.display())]
    TooFewColumns {
        file: PathBuf,
        line: usize,
        needed: usize,
        got: usize,
    },

    #[error("{}:{line}: couldn't parse '{value}' as a number", file.display())]
    Parse {
        file: PathBuf,
        line: usize,
        value: String,
    },

    #[error("{} contains no rows", file.display())]
    Empty { file: PathBuf },

    #[error("{}: {message}", file.display())]
    Invalid { file: PathBuf, message: String },
}

/// The non-comment, non-empty lines of a file, split into fields, with their
/// 1-based line numbers.
fn read_fields(file: &Path) -> Result<Vec<(usize, Vec<String>)>, TableError> {
    let contents = std::fs::read_to_string(file).map_err(|e| TableError::Io {
        file: file.to_path_buf(),
        source: e,
    })?;
    let rows: Vec<(usize, Vec<String>)> = contents
        .lines()
        .enumerate()
        .filter_map(|(i, line)| {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                None
            } else {
                Some((
                    i + 1,
                    line.split_whitespace().map(|s| s.to_string()).collect(),
                ))
            }
        })
        .collect();
    if rows.is_empty() {
        return Err(TableError::Empty {
            file: file.to_path_buf(),
        });
    }
    Ok(rows)
}

fn parse_f64(file: &Path, line: usize, value: &str) -> Result<f64, TableError> {
    value.parse().map_err(|_| TableError::Parse {
        file: file.to_path_buf(),
        line,
        value: value.to_string(),
    })
}

/// Read the first `n_cols` numeric columns of every row.
pub(crate) fn read_numeric(file: &Path, n_cols: usize) -> Result<Vec<Vec<f64>>, TableError> {
    read_fields(file)?
        .into_iter()
        .map(|(line, fields)| {
            if fields.len() < n_cols {
                return Err(TableError::TooFewColumns {
                    file: file.to_path_buf(),
                    line,
                    needed: n_cols,
                    got: fields.len(),
                });
            }
            fields[..n_cols]
                .iter()
                .map(|f| parse_f64(file, line, f))
                .collect()
        })
        .collect()
}

/// An arc-lamp line \[nm\].
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct HcLine {
    pub(crate) wavelength: f64,
    pub(crate) strength: f64,
}

/// Read an HC line catalogue, sorted by wavelength.
pub(crate) fn read_hc_catalogue(file: &Path) -> Result<Vec<HcLine>, TableError> {
    let mut lines: Vec<HcLine> = read_numeric(file, 2)?
        .into_iter()
        .map(|r| HcLine {
            wavelength: r[0],
            strength: r[1],
        })
        .collect();
    lines.sort_by(|a, b| a.wavelength.total_cmp(&b.wavelength));
    Ok(lines)
}

/// A CCF mask line \[nm\].
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct MaskLine {
    pub(crate) start: f64,
    pub(crate) end: f64,
    pub(crate) weight: f64,
}

impl MaskLine {
    pub(crate) fn centre(&self) -> f64 {
        0.5 * (self.start + self.end)
    }
}

/// Read a CCF mask. Lines with non-positive weights are dropped.
pub(crate) fn read_ccf_mask(file: &Path) -> Result<Vec<MaskLine>, TableError> {
    let mut lines: Vec<MaskLine> = read_numeric(file, 3)?
        .into_iter()
        .map(|r| MaskLine {
            start: r[0],
            end: r[1],
            weight: r[2],
        })
        .filter(|l| l.weight > 0.0)
        .collect();
    if lines.is_empty() {
        return Err(TableError::Invalid {
            file: file.to_path_buf(),
            message: "no mask lines have a positive weight".to_string(),
        });
    }
    lines.sort_by(|a, b| a.centre().total_cmp(&b.centre()));
    Ok(lines)
}

/// A telluric line-mask entry \[nm\].
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct WeightedLine {
    pub(crate) wavelength: f64,
    pub(crate) weight: f64,
}

pub(crate) fn read_line_mask(file: &Path) -> Result<Vec<WeightedLine>, TableError> {
    let mut lines: Vec<WeightedLine> = read_numeric(file, 2)?
        .into_iter()
        .map(|r| WeightedLine {
            wavelength: r[0],
            weight: r[1],
        })
        .collect();
    lines.sort_by(|a, b| a.wavelength.total_cmp(&b.wavelength));
    Ok(lines)
}

/// A pre-convolved atmospheric transmission, split into water and all other
/// absorbers.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct TransmissionTemplate {
    /// \[nm\], strictly increasing.
    pub(crate) wave: Vec<f64>,
    pub(crate) water: Vec<f64>,
    pub(crate) others: Vec<f64>,
}

pub(crate) fn read_transmission_template(file: &Path) -> Result<TransmissionTemplate, TableError> {
    let mut rows = read_numeric(file, 3)?;
    rows.sort_by(|a, b| a[0].total_cmp(&b[0]));
    if rows.windows(2).any(|w| w[1][0] <= w[0][0]) {
        return Err(TableError::Invalid {
            file: file.to_path_buf(),
            message: "wavelengths are not unique".to_string(),
        });
    }
    Ok(TransmissionTemplate {
        wave: rows.iter().map(|r| r[0]).collect(),
        water: rows.iter().map(|r| r[1]).collect(),
        others: rows.iter().map(|r| r[2]).collect(),
    })
}

/// One order of an initial wavelength solution: `fibre order c0 c1 ...`.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct InitialWaveOrder {
    pub(crate) fibre: String,
    pub(crate) order: usize,
    pub(crate) coeffs: Vec<f64>,
}

pub(crate) fn read_initial_wave(file: &Path) -> Result<Vec<InitialWaveOrder>, TableError> {
    read_fields(file)?
        .into_iter()
        .map(|(line, fields)| {
            if fields.len() < 3 {
                return Err(TableError::TooFewColumns {
                    file: file.to_path_buf(),
                    line,
                    needed: 3,
                    got: fields.len(),
                });
            }
            let order = fields[1].parse().map_err(|_| TableError::Parse {
                file: file.to_path_buf(),
                line,
                value: fields[1].clone(),
            })?;
            let coeffs = fields[2..]
                .iter()
                .map(|f| parse_f64(file, line, f))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(InitialWaveOrder {
                fibre: fields[0].clone(),
                order,
                coeffs,
            })
        })
        .collect()
}

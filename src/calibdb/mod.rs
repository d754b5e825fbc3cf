// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The calibration database.
//!
//! An append-only text table in a directory that also holds every published
//! artifact. Each line is
//!
//! ```text
//! kind mode basename iso_time mjd pid created
//! ```
//!
//! Writers serialise through a lock file and append each line with a single
//! write, so readers never need the lock. A line whose (kind, mode, mjd)
//! matches a later line is superseded.

mod error;
pub(crate) mod lock;
#[cfg(test)]
mod tests;

pub(crate) use error::CalibDbError;
pub(crate) use lock::{LockError, LockFile};

use std::{
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
    time::Duration,
};

use log::{debug, info, warn};

use crate::{
    config::{CalibDbConfig, LookupPolicy, PathsConfig},
    constants::{DEFAULT_CALIB_DB_FILE, DEFAULT_TELLU_DB_FILE},
    misc::{drs_pid, mjd_to_iso, now_iso},
};

/// Calibrations older than this are worth telling the user about \[days\].
const OLD_CALIBRATION_DAYS: f64 = 7.0;

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct CalibEntry {
    pub(crate) kind: String,
    pub(crate) mode: String,
    /// The artifact's file name inside the database directory.
    pub(crate) basename: String,
    pub(crate) iso_time: String,
    /// Acquisition time of the data the calibration was made from.
    pub(crate) mjd: f64,
    pub(crate) pid: String,
    pub(crate) created: String,
    pub(crate) superseded: bool,
    /// 1-based.
    pub(crate) line: usize,
}

impl CalibEntry {
    fn to_line(&self) -> String {
        format!(
            "{} {} {} {} {:.10} {} {}\n",
            self.kind, self.mode, self.basename, self.iso_time, self.mjd, self.pid, self.created
        )
    }

    fn parse(file: &Path, line: usize, text: &str) -> Result<CalibEntry, CalibDbError> {
        let fields: Vec<&str> = text.split_whitespace().collect();
        if fields.len() < 5 {
            return Err(CalibDbError::Parse {
                file: file.to_path_buf(),
                line,
                message: format!("expected at least 5 columns, found {}", fields.len()),
            });
        }
        let mjd = fields[4].parse().map_err(|_| CalibDbError::Parse {
            file: file.to_path_buf(),
            line,
            message: format!("'{}' is not an MJD", fields[4]),
        })?;
        Ok(CalibEntry {
            kind: fields[0].to_string(),
            mode: fields[1].to_string(),
            basename: fields[2].to_string(),
            iso_time: fields[3].to_string(),
            mjd,
            pid: fields.get(5).unwrap_or(&"-").to_string(),
            created: fields.get(6).unwrap_or(&"-").to_string(),
            superseded: false,
            line,
        })
    }

    /// How much older than `mjd` this entry is \[days\]. Negative if it's
    /// newer.
    pub(crate) fn age_days(&self, mjd: f64) -> f64 {
        mjd - self.mjd
    }
}

/// The result of a lookup.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct CalibMatch {
    pub(crate) entry: CalibEntry,
    pub(crate) path: PathBuf,
    /// The entry isn't the latest before the query, because there wasn't one.
    pub(crate) fallback: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct CalibDb {
    dir: PathBuf,
    file: PathBuf,
    lock_path: PathBuf,
    max_wait: Duration,
    poll_interval: Duration,
    fallback_to_closest: bool,
}

impl CalibDb {
    pub(crate) fn new(dir: &Path, file_name: &str, config: &CalibDbConfig) -> CalibDb {
        CalibDb {
            dir: dir.to_path_buf(),
            file: dir.join(file_name),
            lock_path: dir.join(format!("{file_name}.lock")),
            max_wait: Duration::from_secs_f64(config.max_wait.max(0.0)),
            poll_interval: Duration::from_secs_f64(config.poll_interval.max(1e-3)),
            fallback_to_closest: config.fallback_to_closest,
        }
    }

    /// The calibration database proper.
    pub(crate) fn calibrations(paths: &PathsConfig, config: &CalibDbConfig) -> CalibDb {
        CalibDb::new(&paths.calib_db, DEFAULT_CALIB_DB_FILE, config)
    }

    /// The telluric database, which holds transmission maps.
    pub(crate) fn tellurics(paths: &PathsConfig, config: &CalibDbConfig) -> CalibDb {
        CalibDb::new(&paths.tellu_db, DEFAULT_TELLU_DB_FILE, config)
    }

    pub(crate) fn dir(&self) -> &Path {
        &self.dir
    }

    pub(crate) fn file(&self) -> &Path {
        &self.file
    }

    /// Every line of the table, in file order, with superseded entries
    /// flagged. A missing table is empty.
    pub(crate) fn entries(&self) -> Result<Vec<CalibEntry>, CalibDbError> {
        let contents = match std::fs::read_to_string(&self.file) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => {
                return Err(CalibDbError::Io {
                    path: self.file.clone(),
                    source: e,
                })
            }
        };
        let complete = contents.ends_with('\n');
        let lines: Vec<&str> = contents.lines().collect();
        let mut entries = Vec::with_capacity(lines.len());
        for (i, text) in lines.iter().enumerate() {
            let text = text.split('#').next().unwrap_or("");
            if text.trim().is_empty() {
                continue;
            }
            match CalibEntry::parse(&self.file, i + 1, text) {
                Ok(e) => entries.push(e),
                // A line still being written by someone else.
                Err(_) if !complete && i + 1 == lines.len() => {
                    debug!("Ignoring incomplete last line of {}", self.file.display());
                }
                Err(e) => warn!("Skipping bad database line: {e}"),
            }
        }

        for i in 0..entries.len() {
            let (head, tail) = entries.split_at_mut(i + 1);
            let e = &mut head[i];
            e.superseded = tail
                .iter()
                .any(|l| l.kind == e.kind && l.mode == e.mode && l.mjd == e.mjd);
        }
        Ok(entries)
    }

    /// The entries that are still visible to lookups.
    pub(crate) fn current(&self, kind: &str, mode: &str) -> Result<Vec<CalibEntry>, CalibDbError> {
        Ok(self
            .entries()?
            .into_iter()
            .filter(|e| !e.superseded && e.kind == kind && e.mode == mode)
            .collect())
    }

    pub(crate) fn path_of(&self, entry: &CalibEntry) -> PathBuf {
        self.dir.join(&entry.basename)
    }

    fn lock(&self) -> Result<LockFile, CalibDbError> {
        LockFile::acquire(&self.lock_path, self.max_wait, self.poll_interval).map_err(
            |e| match e {
                LockError::Timeout { .. } => CalibDbError::Busy {
                    dir: self.dir.clone(),
                    source: e,
                },
                LockError::Io { path, source } => CalibDbError::Io { path, source },
            },
        )
    }

    /// Add an entry for `artifact`, copying it into the database directory
    /// if it isn't already there. Published artifacts are never modified.
    pub(crate) fn publish(
        &self,
        kind: &str,
        mode: &str,
        mjd: f64,
        artifact: &Path,
    ) -> Result<CalibEntry, CalibDbError> {
        for s in [kind, mode] {
            if s.is_empty() || s.contains(char::is_whitespace) {
                return Err(CalibDbError::Whitespace(s.to_string()));
            }
        }
        if !artifact.exists() {
            return Err(CalibDbError::ArtifactMissing {
                path: artifact.to_path_buf(),
            });
        }
        let basename = artifact
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if basename.contains(char::is_whitespace) {
            return Err(CalibDbError::Whitespace(basename));
        }

        std::fs::create_dir_all(&self.dir).map_err(|e| CalibDbError::Io {
            path: self.dir.clone(),
            source: e,
        })?;
        let _lock = self.lock()?;

        let basename = self.store(artifact, &basename)?;

        let entry = CalibEntry {
            kind: kind.to_string(),
            mode: mode.to_string(),
            basename,
            iso_time: mjd_to_iso(mjd),
            mjd,
            pid: drs_pid().to_string(),
            created: now_iso(),
            superseded: false,
            line: 0,
        };
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.file)
            .map_err(|e| CalibDbError::Io {
                path: self.file.clone(),
                source: e,
            })?;
        f.write_all(entry.to_line().as_bytes())
            .map_err(|e| CalibDbError::Io {
                path: self.file.clone(),
                source: e,
            })?;
        info!(
            "Published {kind} ({mode}) {} to {}",
            entry.basename,
            self.file.display()
        );
        Ok(entry)
    }

    /// Copy `artifact` into the database directory under `basename`, unless
    /// it's already there. A different file of the same name is never
    /// overwritten; the copy gets the first free `_v<N>` suffix instead.
    /// Must be called with the lock held. Returns the name actually used.
    fn store(&self, artifact: &Path, basename: &str) -> Result<String, CalibDbError> {
        let io = |path: &Path| {
            let path = path.to_path_buf();
            move |source| CalibDbError::Io { path, source }
        };
        let source = artifact.canonicalize().map_err(io(artifact))?;
        let (stem, ext) = match basename.rsplit_once('.') {
            Some((s, e)) if !s.is_empty() => (s, format!(".{e}")),
            _ => (basename, String::new()),
        };
        let mut contents = None;
        let mut version = 1;
        loop {
            let name = if version == 1 {
                basename.to_string()
            } else {
                format!("{stem}_v{version}{ext}")
            };
            let dest = self.dir.join(&name);
            if !dest.exists() {
                std::fs::copy(artifact, &dest).map_err(io(&dest))?;
                if version > 1 {
                    warn!(
                        "{} already holds a different {basename}; published as {name}",
                        self.dir.display()
                    );
                }
                return Ok(name);
            }
            if dest.canonicalize().map_err(io(&dest))? == source {
                return Ok(name);
            }
            if contents.is_none() {
                contents = Some(std::fs::read(artifact).map_err(io(artifact))?);
            }
            if contents.as_deref() == Some(std::fs::read(&dest).map_err(io(&dest))?.as_slice()) {
                debug!("{name} is already in {}", self.dir.display());
                return Ok(name);
            }
            version += 1;
        }
    }

    /// The entry with the greatest time at or before `mjd`. If there is none,
    /// the closest entry is used when the database allows it.
    pub(crate) fn latest_before(
        &self,
        kind: &str,
        mode: &str,
        mjd: f64,
    ) -> Result<CalibMatch, CalibDbError> {
        let candidates = self.current(kind, mode)?;
        // Ties are impossible between current entries; prefer the later line
        // anyway.
        let best = candidates
            .iter()
            .filter(|e| e.mjd <= mjd)
            .max_by(|a, b| a.mjd.total_cmp(&b.mjd).then(a.line.cmp(&b.line)));
        match best {
            Some(e) => {
                let age = e.age_days(mjd);
                if age > OLD_CALIBRATION_DAYS {
                    info!(
                        "Using {kind} {} which is {age:.1} days older than MJD {mjd:.5}",
                        e.basename
                    );
                } else {
                    debug!("Using {kind} {} ({age:.3} days old)", e.basename);
                }
                Ok(CalibMatch {
                    path: self.path_of(e),
                    entry: e.clone(),
                    fallback: false,
                })
            }
            None if self.fallback_to_closest && !candidates.is_empty() => {
                let mut m = self.closest(kind, mode, mjd)?;
                warn!(
                    "No {kind} precedes MJD {mjd:.5}; falling back to the closest ({}, {:.2} days later)",
                    m.entry.basename,
                    -m.entry.age_days(mjd)
                );
                m.fallback = true;
                Ok(m)
            }
            None => Err(CalibDbError::Missing {
                kind: kind.to_string(),
                mode: mode.to_string(),
                mjd,
            }),
        }
    }

    /// The entry minimising |t - mjd|.
    pub(crate) fn closest(
        &self,
        kind: &str,
        mode: &str,
        mjd: f64,
    ) -> Result<CalibMatch, CalibDbError> {
        let candidates = self.current(kind, mode)?;
        let best = candidates.iter().min_by(|a, b| {
            (a.mjd - mjd)
                .abs()
                .total_cmp(&(b.mjd - mjd).abs())
                .then(b.line.cmp(&a.line))
        });
        match best {
            Some(e) => {
                debug!(
                    "Closest {kind} is {} ({:.3} days away)",
                    e.basename,
                    e.age_days(mjd).abs()
                );
                Ok(CalibMatch {
                    path: self.path_of(e),
                    entry: e.clone(),
                    fallback: false,
                })
            }
            None => Err(CalibDbError::Missing {
                kind: kind.to_string(),
                mode: mode.to_string(),
                mjd,
            }),
        }
    }

    pub(crate) fn lookup(
        &self,
        kind: &str,
        mode: &str,
        mjd: f64,
        policy: LookupPolicy,
    ) -> Result<CalibMatch, CalibDbError> {
        match policy {
            LookupPolicy::Older => self.latest_before(kind, mode, mjd),
            LookupPolicy::Closest => self.closest(kind, mode, mjd),
        }
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Exclusive lock files.

use std::{
    fs::OpenOptions,
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
    time::{Duration, Instant, SystemTime},
};

use log::{debug, warn};
use thiserror::Error;

#[derive(Error, Debug)]
pub(crate) enum LockError {
    #[error("Gave up waiting for {} after {waited:.1}s; if nothing else is running, delete it", path.display())]
    Timeout { path: PathBuf, waited: f64 },

    #[error("Couldn't create lock file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Held while a file exists on disk; dropping it removes the file.
#[derive(Debug)]
pub(crate) struct LockFile {
    path: PathBuf,
}

/// How long ago a file was last modified, if it still exists.
fn file_age(path: &Path) -> Option<Duration> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    Some(
        SystemTime::now()
            .duration_since(modified)
            .unwrap_or(Duration::ZERO),
    )
}

impl LockFile {
    /// Create the lock file, waiting while another process holds it.
    ///
    /// A lock that was already older than `max_wait` when we started waiting
    /// is stale and gets broken. Otherwise, waiting longer than `max_wait` is
    /// a [`LockError::Timeout`].
    pub(crate) fn acquire(
        path: &Path,
        max_wait: Duration,
        poll_interval: Duration,
    ) -> Result<LockFile, LockError> {
        let start = Instant::now();
        let mut announced = false;
        loop {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut f) => {
                    // The contents are only a courtesy for humans.
                    let _ = writeln!(f, "{} {}", crate::misc::drs_pid(), crate::misc::now_iso());
                    debug!("Acquired {}", path.display());
                    return Ok(LockFile {
                        path: path.to_path_buf(),
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    let waited = start.elapsed();
                    if let Some(age) = file_age(path) {
                        if age.saturating_sub(waited) > max_wait {
                            warn!(
                                "Breaking stale lock {} ({:.0}s old)",
                                path.display(),
                                age.as_secs_f64()
                            );
                            let _ = std::fs::remove_file(path);
                            continue;
                        }
                    }
                    if waited >= max_wait {
                        return Err(LockError::Timeout {
                            path: path.to_path_buf(),
                            waited: waited.as_secs_f64(),
                        });
                    }
                    if !announced {
                        warn!("{} is locked; waiting", path.display());
                        announced = true;
                    }
                    std::thread::sleep(poll_interval);
                }
                Err(e) => {
                    return Err(LockError::Io {
                        path: path.to_path_buf(),
                        source: e,
                    })
                }
            }
        }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("Couldn't remove lock {}: {e}", self.path.display());
        }
    }
}

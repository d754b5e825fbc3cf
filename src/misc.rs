// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Miscellaneous things.

use std::{
    cell::RefCell,
    fs::{File, OpenOptions},
    io::Write,
    path::Path,
    sync::Mutex,
    thread,
};

use console::Term;
use crossbeam_channel::bounded;
use hifitime::{Epoch, Unit};
use is_terminal::IsTerminal;

lazy_static::lazy_static! {
    /// Identifies this process in logs, products and database entries.
    static ref DRS_PID: String = format!(
        "PID-{}-{}",
        chrono::Utc::now().format("%Y%m%d%H%M%S"),
        std::process::id()
    );

    /// The log file of the night being processed, if any.
    static ref NIGHT_LOG: Mutex<Option<File>> = Mutex::new(None);
}

thread_local! {
    /// The name of the recipe being run on this thread. Used to tag log
    /// messages.
    static CURRENT_RECIPE: RefCell<Option<String>> = RefCell::new(None);
}

pub(crate) fn drs_pid() -> &'static str {
    DRS_PID.as_str()
}

/// The current UTC time as an ISO-8601 string with millisecond precision.
pub(crate) fn now_iso() -> String {
    chrono::Utc::now()
        .format("%Y-%m-%dT%H:%M:%S%.3f")
        .to_string()
}

/// Tag this thread's log messages with a recipe name (or clear the tag).
pub(crate) fn set_current_recipe(name: Option<&str>) {
    CURRENT_RECIPE.with(|c| *c.borrow_mut() = name.map(|s| s.to_string()));
}

/// The recipe name this thread is tagged with, or "-".
pub(crate) fn current_recipe() -> String {
    CURRENT_RECIPE.with(|c| c.borrow().clone().unwrap_or_else(|| "-".to_string()))
}

/// Set the recipe tag for the lifetime of the returned guard.
pub(crate) fn recipe_scope(name: &str) -> scopeguard::ScopeGuard<(), impl FnOnce(())> {
    set_current_recipe(Some(name));
    scopeguard::guard((), |_| set_current_recipe(None))
}

/// Copy log records to `path` until [`close_night_log`] is called.
pub(crate) fn open_night_log(path: &Path) -> std::io::Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    if let Ok(mut log) = NIGHT_LOG.lock() {
        *log = Some(file);
    }
    Ok(())
}

pub(crate) fn close_night_log() {
    if let Ok(mut log) = NIGHT_LOG.lock() {
        if let Some(mut file) = log.take() {
            let _ = file.flush();
        }
    }
}

/// The logger's output: stdout, and the night's log file while one is open.
pub(crate) struct LogTee;

impl Write for LogTee {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if let Ok(mut log) = NIGHT_LOG.lock() {
            if let Some(file) = log.as_mut() {
                // Losing the file copy mustn't lose the terminal copy.
                let _ = file.write_all(buf);
            }
        }
        std::io::stdout().write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if let Ok(mut log) = NIGHT_LOG.lock() {
            if let Some(file) = log.as_mut() {
                file.flush()?;
            }
        }
        std::io::stdout().flush()
    }
}

/// Format an MJD as an ISO-8601 UTC string with millisecond precision and no
/// spaces.
pub(crate) fn mjd_to_iso(mjd: f64) -> String {
    let (y, mo, d, h, mi, s, ns) = Epoch::from_mjd_utc(mjd)
        .round(Unit::Millisecond * 1)
        .to_gregorian_utc();
    format!(
        "{y:04}-{mo:02}-{d:02}T{h:02}:{mi:02}:{s:02}.{:03}",
        ns / 1_000_000
    )
}

pub(crate) fn is_a_tty() -> bool {
    std::io::stdout().is_terminal() || std::io::stderr().is_terminal()
}

/// Perform this expensive operation as a normal Rust function, but if it takes
/// more than a certain amount of time, display a message to the user that
/// you're still waiting for this operation to complete.
pub(crate) fn expensive_op<F, R>(func: F, wait_message: &str) -> R
where
    F: FnOnce() -> R + Send,
    R: Send,
{
    use std::time::Duration;

    const INITIAL_WAIT_TIME: Duration = Duration::from_secs(2);
    const INC_WAIT_TIME: Duration = Duration::from_millis(100);

    let (tx, rx) = bounded(1);

    thread::scope(|s| {
        s.spawn(|| {
            let r = func();
            // The receiver only goes away if the scope is unwinding.
            let _ = tx.send(r);
        });

        let term = is_a_tty().then(Term::stderr);
        let mut total_wait_time = Duration::from_secs(0);
        let mut printed_wait_line = false;
        loop {
            match rx.recv_timeout(INC_WAIT_TIME) {
                Ok(r) => {
                    if let (Some(term), true) = (term.as_ref(), printed_wait_line) {
                        let _ = term.move_cursor_up(1);
                        let _ = term.clear_line();
                    }
                    return r;
                }
                Err(_) => {
                    total_wait_time += INC_WAIT_TIME;
                    if let Some(term) = term.as_ref() {
                        if total_wait_time >= INITIAL_WAIT_TIME {
                            if printed_wait_line {
                                let _ = term.move_cursor_up(1);
                                let _ = term.clear_line();
                            }
                            let _ = term.write_line(&format!(
                                "{wait_message}: {:.2}s",
                                total_wait_time.as_secs_f64()
                            ));
                            printed_wait_line = true;
                        }
                    }
                }
            }
        }
    })
}

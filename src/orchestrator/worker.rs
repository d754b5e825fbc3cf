// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Running work items in their own processes. The orchestrator writes each
//! item to a JSON task file and re-invokes its own executable with the hidden
//! `run-item` subcommand; the worker writes its [`RunRecord`] next to the
//! task. A worker that dies without a record is an error of that item only.

use std::{
    path::{Path, PathBuf},
    process::Command,
    time::Instant,
};

use log::{debug, error, warn, LevelFilter};
use serde::{Deserialize, Serialize};

use super::{
    plan::WorkItem,
    record::{DoneMarker, ItemStatus, RunRecord},
    run_item, OrchestratorError,
};
use crate::{
    config::DrsConfig,
    misc::{close_night_log, drs_pid, open_night_log},
    recipes::{ErrorClass, RecipeContext, RecipeInputs, RecipeKind},
};

/// What a worker process is asked to do.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ItemTask {
    pub(crate) night: String,
    pub(crate) item: String,
    pub(crate) recipe: RecipeKind,
    pub(crate) inputs: RecipeInputs,
    /// Where the worker writes its record.
    pub(crate) result: PathBuf,
}

impl ItemTask {
    fn read(path: &Path) -> Result<ItemTask, OrchestratorError> {
        let text = std::fs::read_to_string(path).map_err(|source| OrchestratorError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|e| OrchestratorError::Io {
            path: path.to_path_buf(),
            source: e.into(),
        })
    }
}

fn write_json<T: Serialize>(value: &T, path: &Path) -> Result<(), OrchestratorError> {
    let io_error = |source| OrchestratorError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(io_error)?;
    }
    let text = serde_json::to_string_pretty(value).map_err(|e| io_error(e.into()))?;
    std::fs::write(path, text).map_err(io_error)
}

/// Write the configuration every worker of this run reads. Relative paths are
/// resolved first, as workers read the file from elsewhere.
pub(super) fn write_worker_config(config: &DrsConfig, path: &Path) -> Result<(), OrchestratorError> {
    let mut config = config.clone();
    let cwd = std::env::current_dir().map_err(|source| OrchestratorError::Io {
        path: PathBuf::from("."),
        source,
    })?;
    config.paths.make_absolute(&cwd);
    write_json(&config, path)
}

/// Verbosity flags that give a worker the same log level as this process.
fn verbosity_args() -> &'static [&'static str] {
    match log::max_level() {
        LevelFilter::Debug => &["-v"],
        LevelFilter::Trace => &["-vv"],
        _ => &[],
    }
}

fn failed(item: &WorkItem, message: String, start: Instant) -> RunRecord {
    error!("{}: {message}", item.id);
    let mut record = RunRecord::new(&item.id, item.recipe, ItemStatus::Error);
    record.class = Some(ErrorClass::Fatal);
    record.message = message;
    record.duration = start.elapsed().as_secs_f64();
    record
}

/// Run one item in a child process and collect its record.
pub(super) fn run_in_process(
    config_file: &Path,
    task_dir: &Path,
    night: &str,
    item: &WorkItem,
    inputs: &RecipeInputs,
) -> RunRecord {
    let start = Instant::now();
    let task_path = DoneMarker::path_for(task_dir, &item.id);
    let task = ItemTask {
        night: night.to_string(),
        item: item.id.clone(),
        recipe: item.recipe,
        inputs: inputs.clone(),
        result: task_path.with_extension("record.json"),
    };
    // A record left by an earlier run must not be mistaken for this one.
    let _ = std::fs::remove_file(&task.result);
    if let Err(e) = write_json(&task, &task_path) {
        return failed(item, format!("couldn't write the task: {e}"), start);
    }

    let exe = match std::env::current_exe() {
        Ok(exe) => exe,
        Err(e) => return failed(item, format!("couldn't find the nirdrs executable: {e}"), start),
    };
    debug!("{}: starting a worker with {}", item.id, task_path.display());
    let status = Command::new(exe)
        .args(verbosity_args())
        .arg("--no-progress-bars")
        .arg("--config")
        .arg(config_file)
        .arg("run-item")
        .arg(&task_path)
        .status();
    let status = match status {
        Ok(s) => s,
        Err(e) => return failed(item, format!("couldn't start a worker: {e}"), start),
    };

    let record = std::fs::read_to_string(&task.result)
        .ok()
        .and_then(|text| serde_json::from_str::<RunRecord>(&text).ok());
    match record {
        Some(record) => {
            if !status.success() {
                warn!("{}: the worker wrote its record but exited with {status}", item.id);
            }
            record
        }
        None => failed(item, format!("the worker exited with {status} and left no record"), start),
    }
}

/// The worker's side: run the task at `task_path` and write its record.
pub(crate) fn run_task(config: &DrsConfig, task_path: &Path) -> Result<ItemStatus, OrchestratorError> {
    let task = ItemTask::read(task_path)?;
    let ctx = RecipeContext::new(config, &task.night);
    let log_path = ctx.store.msg_dir(&task.night).join(format!("{}.log", drs_pid()));
    if let Err(e) = open_night_log(&log_path) {
        warn!("Couldn't open the night log {}: {e}", log_path.display());
    }
    let _night_log = scopeguard::guard((), |_| close_night_log());

    let record = run_item(config, &ctx, &task.item, task.recipe, &task.inputs);
    write_json(&record, &task.result)?;
    Ok(record.status)
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Reducing a whole night: plan the work items, run them level by level on a
//! pool of workers, and record what happened to each.

mod dag;
mod plan;
mod pool;
mod record;
mod worker;

pub(crate) use dag::DagError;
pub(crate) use record::{ItemStatus, RunRecord};
pub(crate) use worker::run_task;

use std::{
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::{debug, error, info, warn};
use thiserror::Error;

use self::{
    plan::{Plan, WorkItem},
    pool::{run_pool, TaskResult},
    record::{DoneMarker, RunSummary},
    worker::{run_in_process, write_worker_config},
};
use crate::{
    calibdb::{LockError, LockFile},
    config::{DrsConfig, Isolation, LookupPolicy},
    io::store::{basename_of, ensure_dir, StoreError},
    misc::{close_night_log, drs_pid, open_night_log},
    recipes::{kinds, ErrorClass, RecipeContext, RecipeError, RecipeInputs, RecipeKind},
    CANCEL_REQUESTED, PROGRESS_BARS,
};

#[derive(Error, Debug)]
pub(crate) enum OrchestratorError {
    #[error("Another run is processing this night: {0}")]
    Busy(#[from] LockError),

    #[error("Couldn't order the work items: {0}")]
    Dag(#[from] DagError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// What a night's run did.
#[derive(Debug, Default)]
pub(crate) struct NightReport {
    pub(crate) records: Vec<RunRecord>,
    /// Not written for dry runs.
    pub(crate) summary: Option<PathBuf>,
}

impl NightReport {
    pub(crate) fn count(&self, status: ItemStatus) -> usize {
        self.records.iter().filter(|r| r.status == status).count()
    }

    pub(crate) fn n_published(&self) -> usize {
        self.records.iter().map(|r| r.n_published).sum()
    }
}

/// Reduce every raw frame of `night`.
pub(crate) fn process_night(
    config: &DrsConfig,
    night: &str,
    dry_run: bool,
) -> Result<NightReport, OrchestratorError> {
    let ctx = RecipeContext::new(config, night);
    let msg_dir = ctx.store.msg_dir(night);
    ensure_dir(&msg_dir)?;

    let _run_lock = LockFile::acquire(
        &msg_dir.join(".run.lock"),
        Duration::from_secs_f64(config.calibdb.max_wait.max(0.0)),
        Duration::from_secs_f64(config.calibdb.poll_interval.max(0.001)),
    )?;
    let log_path = msg_dir.join(format!("{}.log", drs_pid()));
    if let Err(e) = open_night_log(&log_path) {
        warn!("Couldn't open the night log {}: {e}", log_path.display());
    }
    let _night_log = scopeguard::guard((), |_| close_night_log());

    let index = ctx.store.index_night(night, &config.keywords)?;
    info!(
        "Night {night}: {} raw frames, {} unreadable",
        index.frames.len(),
        index.unreadable.len()
    );
    let first_mjd = index.frames.iter().map(|f| f.mjd).fold(f64::INFINITY, f64::min);
    let plan = Plan::build(config, &index, has_fp_reference(config, &ctx, first_mjd))?;
    if dry_run {
        plan.describe();
        return Ok(NightReport::default());
    }

    let summary_path = msg_dir.join(format!("{}_summary.txt", drs_pid()));
    let mut summary = RunSummary::create(&summary_path).map_err(|source| OrchestratorError::Io {
        path: summary_path.clone(),
        source,
    })?;
    let append = |summary: &mut RunSummary, record: &RunRecord| {
        if let Err(e) = summary.append(record) {
            warn!("Couldn't write to {}: {e}", summary.path().display());
        }
    };

    let mut report = NightReport {
        records: vec![],
        summary: Some(summary_path.clone()),
    };
    for (path, e) in index.unreadable {
        let item = format!("{}:{}", RecipeKind::Preprocess, basename_of(&path));
        let mut record = RunRecord::new(&item, RecipeKind::Preprocess, ItemStatus::Error);
        let e = RecipeError::from(e);
        record.class = Some(e.classify());
        record.message = e.to_string();
        append(&mut summary, &record);
        report.records.push(record);
    }

    let progress = ProgressBar::with_draw_target(
        Some(plan.items.len() as u64),
        if PROGRESS_BARS.load() {
            ProgressDrawTarget::stdout()
        } else {
            ProgressDrawTarget::hidden()
        },
    )
    .with_style(
        ProgressStyle::default_bar()
            .template("{msg:18}: [{wide_bar:.blue}] {pos:3}/{len:3} ({elapsed_precise}<{eta_precise})")
            .unwrap()
            .progress_chars("=> "),
    )
    .with_message("Reducing");

    let done_dir = msg_dir.join("done");
    let task_dir = msg_dir.join("tasks");
    let worker_config = msg_dir.join(format!("{}_config.json", drs_pid()));
    if config.orchestrator.isolation == Isolation::Process {
        write_worker_config(config, &worker_config)?;
        debug!("Workers read {}", worker_config.display());
    }
    let n_workers = config.orchestrator.workers();
    let mut records: Vec<Option<RunRecord>> = vec![None; plan.items.len()];
    for (level_index, level) in plan.levels.iter().enumerate() {
        debug!("Level {level_index}: {} items", level.len());
        let mut tasks: Vec<(usize, RecipeInputs)> = vec![];
        for &i in level {
            match prepare(&plan.items[i], &records, &done_dir) {
                Prepared::Run(inputs) => tasks.push((i, inputs)),
                Prepared::Skip(record) => {
                    info!("{}: skipped ({})", record.item, record.message);
                    append(&mut summary, &record);
                    records[i] = Some(record);
                    progress.inc(1);
                }
            }
        }

        run_pool(
            tasks.clone(),
            n_workers,
            |(i, inputs): (usize, RecipeInputs)| {
                let item = &plan.items[i];
                match config.orchestrator.isolation {
                    Isolation::Process => run_in_process(&worker_config, &task_dir, night, item, &inputs),
                    Isolation::Thread => run_item(config, &ctx, &item.id, item.recipe, &inputs),
                }
            },
            |task, result| {
                let (i, inputs) = &tasks[task];
                let item = &plan.items[*i];
                let record = match result {
                    TaskResult::Done(record) => record.clone(),
                    TaskResult::Panicked(message) => {
                        error!("{} panicked: {message}", item.id);
                        let mut record = RunRecord::new(&item.id, item.recipe, ItemStatus::Error);
                        record.class = Some(ErrorClass::Fatal);
                        record.message = format!("panicked: {message}");
                        record
                    }
                    TaskResult::Cancelled => RunRecord::skipped(&item.id, item.recipe, "cancelled"),
                };

                if matches!(record.status, ItemStatus::Ok | ItemStatus::QcFail) {
                    let inputs: Vec<PathBuf> = inputs.all().cloned().collect();
                    if let Some(marker) = DoneMarker::new(item.recipe, &inputs, &record) {
                        let path = DoneMarker::path_for(&done_dir, &item.id);
                        if let Err(e) = marker.write(&path) {
                            warn!("Couldn't write {}: {e}", path.display());
                        }
                    }
                }
                if record.status == ItemStatus::Error && config.orchestrator.stop_on_error {
                    error!("Stopping after {} failed", item.id);
                    CANCEL_REQUESTED.store(true);
                }
                append(&mut summary, &record);
                records[*i] = Some(record);
                progress.inc(1);
            },
        );
    }
    progress.finish_with_message("Done");

    report.records.extend(records.into_iter().flatten());
    info!(
        "Night {night}: {} OK, {} QC failures, {} errors, {} skipped; {} calibrations published",
        report.count(ItemStatus::Ok),
        report.count(ItemStatus::QcFail),
        report.count(ItemStatus::Error),
        report.count(ItemStatus::Skipped),
        report.n_published()
    );
    info!("Summary written to {}", summary_path.display());
    Ok(report)
}

/// Does the database hold a reference FP for every fibre from before the
/// night? A reference made by this night's own master solution doesn't count,
/// so that a re-run plans the same items.
fn has_fp_reference(config: &DrsConfig, ctx: &RecipeContext, first_mjd: f64) -> bool {
    let entries = match ctx.calibdb.entries() {
        Ok(e) => e,
        Err(e) => {
            warn!("Couldn't read the calibration database: {e}");
            return false;
        }
    };
    config
        .loc
        .fibre_layout
        .iter()
        .all(|f| {
            entries
                .iter()
                .any(|e| e.kind == kinds::fp_ref(f) && e.mjd < first_mjd)
        })
}

enum Prepared {
    Run(RecipeInputs),
    Skip(RunRecord),
}

/// Decide whether an item runs, and with which of its frames.
fn prepare(item: &WorkItem, records: &[Option<RunRecord>], done_dir: &Path) -> Prepared {
    if CANCEL_REQUESTED.load() {
        return Prepared::Skip(RunRecord::skipped(&item.id, item.recipe, "cancelled"));
    }
    for &j in &item.requires {
        let usable = records[j].as_ref().map(|r| r.has_products()).unwrap_or(false);
        if !usable {
            return Prepared::Skip(RunRecord::skipped(
                &item.id,
                item.recipe,
                format!("{} has no products", records_id(records, j)),
            ));
        }
    }

    // Frames whose preprocessing failed are left out.
    let failed: Vec<&PathBuf> = item
        .frame_deps
        .iter()
        .filter(|(j, _)| !records[*j].as_ref().map(|r| r.succeeded()).unwrap_or(false))
        .map(|(_, path)| path)
        .collect();
    let mut inputs = item.inputs.clone();
    if !failed.is_empty() {
        for role in inputs.files.iter_mut() {
            role.retain(|p| !failed.contains(&p));
        }
        let emptied = item
            .inputs
            .files
            .iter()
            .zip(&inputs.files)
            .any(|(before, after)| !before.is_empty() && after.is_empty());
        if emptied {
            return Prepared::Skip(RunRecord::skipped(
                &item.id,
                item.recipe,
                "no usable input frames",
            ));
        }
        warn!(
            "{}: leaving out {} frames that failed preprocessing",
            item.id,
            failed.len()
        );
    }

    let inputs_now: Vec<PathBuf> = inputs.all().cloned().collect();
    if let Some(marker) = DoneMarker::read(&DoneMarker::path_for(done_dir, &item.id)) {
        if marker.still_valid(item.recipe, &inputs_now) {
            let mut record = RunRecord::skipped(&item.id, item.recipe, "already done");
            record.already_done = true;
            record.outputs = marker.outputs;
            return Prepared::Skip(record);
        }
    }
    Prepared::Run(inputs)
}

fn records_id(records: &[Option<RunRecord>], j: usize) -> String {
    records[j]
        .as_ref()
        .map(|r| r.item.clone())
        .unwrap_or_else(|| format!("item {j}"))
}

/// Run one item, retrying once where that can help.
fn run_item(
    config: &DrsConfig,
    ctx: &RecipeContext,
    id: &str,
    recipe: RecipeKind,
    inputs: &RecipeInputs,
) -> RunRecord {
    let spec = recipe.spec();
    let start = Instant::now();
    let mut record = RunRecord::new(id, recipe, ItemStatus::Ok);

    let mut result = spec.run(config, ctx, inputs);
    let retry = match &result {
        Err(e) => match e.classify() {
            ErrorClass::CalibMissing
                if config.orchestrator.retry_with_closest && ctx.policy != LookupPolicy::Closest =>
            {
                warn!("{}: {e}; retrying with the closest calibrations", id);
                Some(ctx.with_policy(LookupPolicy::Closest))
            }
            ErrorClass::LockTimeout => {
                warn!("{}: {e}; retrying once", id);
                Some(ctx.clone())
            }
            _ => None,
        },
        Ok(_) => None,
    };
    if let Some(ctx) = retry {
        result = spec.run(config, &ctx, inputs);
    }

    match result {
        Ok(outcome) => {
            record.status = if outcome.passed() {
                ItemStatus::Ok
            } else {
                ItemStatus::QcFail
            };
            record.qc_failed = outcome.qc.failed_names();
            record.n_published = outcome.published.len();
            record.outputs = outcome.outputs;
            if record.status == ItemStatus::QcFail {
                warn!("{}: failed QC ({})", id, record.qc_failed.join(", "));
            }
        }
        Err(e) => {
            let class = e.classify();
            record.class = Some(class);
            record.message = e.to_string();
            if class == ErrorClass::Convergence {
                record.status = ItemStatus::QcFail;
                record.qc_failed = vec![class.to_string()];
                warn!("{}: {e}", id);
            } else {
                record.status = ItemStatus::Error;
                error!("{}: {e}", id);
            }
        }
    }
    record.duration = start.elapsed().as_secs_f64();
    record
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::path::PathBuf;

use clap::Parser;
use log::{debug, info, trace};
use serde::{Deserialize, Serialize};

use super::common::{display_warnings, require_night, InfoPrinter, Warn, ARG_FILE_HELP};
use crate::{
    config::DrsConfig,
    orchestrator::{process_night, run_task, ItemStatus},
    DrsError,
};

#[derive(Parser, Debug, Clone, Default, Serialize, Deserialize)]
pub(super) struct ProcessArgs {
    #[clap(long, help = ARG_FILE_HELP.as_str(), parse(from_os_str))]
    #[serde(skip)]
    pub(super) args_file: Option<PathBuf>,

    /// The night directory to reduce, e.g. 2024-05-14.
    #[clap(name = "NIGHT")]
    pub(super) night: Option<String>,

    /// The number of recipes to run at once. Defaults to the configured
    /// number, or the available parallelism.
    #[clap(short = 'j', long)]
    pub(super) workers: Option<usize>,

    /// Stop scheduling new work after the first item fails.
    #[clap(long)]
    #[serde(default)]
    pub(super) stop_on_error: bool,
}

impl ProcessArgs {
    pub(super) fn merge(self) -> Result<ProcessArgs, DrsError> {
        debug!("Merging command-line arguments with the argument file");

        let cli_args = self;
        if let Some(arg_file) = cli_args.args_file {
            let ProcessArgs {
                args_file: _,
                night,
                workers,
                stop_on_error,
            } = unpack_arg_file!(arg_file);

            Ok(ProcessArgs {
                args_file: None,
                night: cli_args.night.or(night),
                workers: cli_args.workers.or(workers),
                stop_on_error: cli_args.stop_on_error || stop_on_error,
            })
        } else {
            Ok(cli_args)
        }
    }

    /// Reduce the night. Failures of individual work items are recorded in
    /// the run summary; only a run that couldn't start is an error.
    pub(super) fn run(self, config: &DrsConfig, dry_run: bool) -> Result<(), DrsError> {
        trace!("{:#?}", self);
        let night = require_night(self.night)?;
        let mut config = config.clone();
        if let Some(workers) = self.workers {
            if workers == 0 {
                "0 workers were requested; using 1".warn();
            }
            config.orchestrator.n_workers = Some(workers.max(1));
        }
        config.orchestrator.stop_on_error |= self.stop_on_error;
        display_warnings();

        let report = process_night(&config, &night, dry_run)?;
        if dry_run {
            info!("Dry run -- exiting now.");
            return Ok(());
        }

        let mut printer = InfoPrinter::new(format!("Night {night}").into());
        printer.push_block(vec![
            format!("OK:          {}", report.count(ItemStatus::Ok)).into(),
            format!("QC failures: {}", report.count(ItemStatus::QcFail)).into(),
            format!("Errors:      {}", report.count(ItemStatus::Error)).into(),
            format!("Skipped:     {}", report.count(ItemStatus::Skipped)).into(),
        ]);
        printer.push_line(format!("Calibrations published: {}", report.n_published()).into());
        if let Some(summary) = &report.summary {
            printer.push_line(format!("Summary: {}", summary.display()).into());
        }
        printer.display();
        Ok(())
    }
}

/// One work item of a `process` run, in a process of its own. Written by the
/// orchestrator; not meant to be run by hand.
#[derive(Parser, Debug)]
pub(super) struct RunItemArgs {
    /// The JSON task written by the orchestrator.
    #[clap(name = "TASK", parse(from_os_str))]
    pub(super) task: PathBuf,
}

impl RunItemArgs {
    pub(super) fn run(self, config: &DrsConfig) -> Result<(), DrsError> {
        let status = run_task(config, &self.task)?;
        debug!("{}: {status}", self.task.display());
        Ok(())
    }
}

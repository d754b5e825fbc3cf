// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Inspecting the calibration and telluric databases.

use clap::{Parser, Subcommand};
use log::info;

use super::common::InfoPrinter;
use crate::{
    calibdb::CalibDb,
    config::{DrsConfig, LookupPolicy},
    constants::DEFAULT_INSTRUMENT_MODE,
    DrsError,
};

#[derive(Parser, Debug)]
pub(super) struct CalibdbArgs {
    #[clap(subcommand)]
    command: CalibdbCommand,

    /// Use the telluric database rather than the calibration database.
    #[clap(long, global = true)]
    tellu: bool,
}

#[derive(Subcommand, Debug)]
enum CalibdbCommand {
    /// List the entries of the database.
    List {
        /// Only list entries of this kind, e.g. DARK or WAVE_AB.
        #[clap(short, long)]
        kind: Option<String>,

        /// Also list entries superseded by a later publication.
        #[clap(long)]
        all: bool,
    },

    /// Find the calibration a frame taken at MJD would use.
    Lookup {
        /// The calibration kind, e.g. DARK or WAVE_AB.
        #[clap(name = "KIND")]
        kind: String,

        /// The acquisition time of the frame [MJD].
        #[clap(name = "MJD")]
        mjd: f64,

        /// The instrument mode.
        #[clap(short, long, default_value = DEFAULT_INSTRUMENT_MODE)]
        mode: String,

        /// Override the configured lookup policy (older or closest).
        #[clap(short, long)]
        policy: Option<LookupPolicy>,
    },
}

impl CalibdbArgs {
    pub(super) fn run(self, config: &DrsConfig) -> Result<(), DrsError> {
        let db = if self.tellu {
            CalibDb::tellurics(&config.paths, &config.calibdb)
        } else {
            CalibDb::calibrations(&config.paths, &config.calibdb)
        };

        match self.command {
            CalibdbCommand::List { kind, all } => {
                let entries: Vec<_> = db
                    .entries()?
                    .into_iter()
                    .filter(|e| all || !e.superseded)
                    .filter(|e| kind.as_ref().map(|k| &e.kind == k).unwrap_or(true))
                    .collect();
                let mut printer = InfoPrinter::new(format!("{}", db.file().display()).into());
                if entries.is_empty() {
                    printer.push_line("No entries".into());
                }
                for e in entries {
                    printer.push_line(
                        format!(
                            "{:<10} {:<8} {:<36} {} {:.5}{}",
                            e.kind,
                            e.mode,
                            e.basename,
                            e.iso_time,
                            e.mjd,
                            if e.superseded { " (superseded)" } else { "" }
                        )
                        .into(),
                    );
                }
                printer.display();
            }

            CalibdbCommand::Lookup {
                kind,
                mjd,
                mode,
                policy,
            } => {
                let policy = policy.unwrap_or(config.calibdb.policy);
                let found = db.lookup(&kind, &mode, mjd, policy)?;
                info!(
                    "{kind} for MJD {mjd:.5} ({policy}): {} ({:+.3} days){}",
                    found.path.display(),
                    -found.entry.age_days(mjd),
                    if found.fallback { ", closest fallback" } else { "" }
                );
            }
        }
        Ok(())
    }
}

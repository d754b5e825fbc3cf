// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::path::PathBuf;

use clap::Parser;
use log::{debug, info, trace};
use serde::{Deserialize, Serialize};

use super::common::{display_warnings, InfoPrinter, Warn, ARG_FILE_HELP};
use crate::{
    misc::expensive_op,
    sim::{simulate_night, SimOptions},
    DrsError,
};

#[derive(Parser, Debug, Clone, Default, Serialize, Deserialize)]
pub(super) struct SimulateNightArgs {
    #[clap(long, help = ARG_FILE_HELP.as_str(), parse(from_os_str))]
    #[serde(skip)]
    pub(super) args_file: Option<PathBuf>,

    /// Where to write the night, its configuration (nirdrs.toml) and its
    /// catalogues.
    #[clap(name = "OUTDIR", parse(from_os_str))]
    pub(super) outdir: Option<PathBuf>,

    /// The night's date (YYYY-MM-DD). Default: 2024-05-14
    #[clap(long)]
    pub(super) night: Option<String>,

    /// Default: 5
    #[clap(long, help_heading = "EXPOSURES")]
    pub(super) darks: Option<usize>,

    /// Default: 5
    #[clap(long, help_heading = "EXPOSURES")]
    pub(super) flats: Option<usize>,

    /// Default: 5
    #[clap(long, help_heading = "EXPOSURES")]
    pub(super) fps: Option<usize>,

    /// Default: 1
    #[clap(long, help_heading = "EXPOSURES")]
    pub(super) hcs: Option<usize>,

    /// Default: 1
    #[clap(long, help_heading = "EXPOSURES")]
    pub(super) science: Option<usize>,

    /// Telluric standards observed after the calibrations. Default: 0
    #[clap(long, help_heading = "EXPOSURES")]
    pub(super) hot_stars: Option<usize>,

    /// Restart the dark sequence index after this many exposures.
    #[clap(long, help_heading = "FAULTS")]
    pub(super) dark_restart: Option<usize>,

    /// Take the darks this many days before the rest of the night.
    #[clap(long, help_heading = "FAULTS")]
    pub(super) dark_age: Option<f64>,

    /// Append an all-NaN exposure to the FP sequence.
    #[clap(long, help_heading = "FAULTS")]
    #[serde(default)]
    pub(super) corrupt_frame: bool,

    /// Shift the written CCF mask by this velocity [km/s].
    #[clap(long, allow_hyphen_values(true), help_heading = "FAULTS")]
    pub(super) mask_shift: Option<f64>,

    /// The science target's radial velocity [km/s]. Default: 12.3
    #[clap(long, allow_hyphen_values(true))]
    pub(super) rv: Option<f64>,

    /// Seed for every random number of the night. Default: 42
    #[clap(long)]
    pub(super) seed: Option<u64>,
}

impl SimulateNightArgs {
    pub(super) fn merge(self) -> Result<SimulateNightArgs, DrsError> {
        debug!("Merging command-line arguments with the argument file");

        let cli_args = self;
        if let Some(arg_file) = cli_args.args_file {
            let SimulateNightArgs {
                args_file: _,
                outdir,
                night,
                darks,
                flats,
                fps,
                hcs,
                science,
                hot_stars,
                dark_restart,
                dark_age,
                corrupt_frame,
                mask_shift,
                rv,
                seed,
            } = unpack_arg_file!(arg_file);

            Ok(SimulateNightArgs {
                args_file: None,
                outdir: cli_args.outdir.or(outdir),
                night: cli_args.night.or(night),
                darks: cli_args.darks.or(darks),
                flats: cli_args.flats.or(flats),
                fps: cli_args.fps.or(fps),
                hcs: cli_args.hcs.or(hcs),
                science: cli_args.science.or(science),
                hot_stars: cli_args.hot_stars.or(hot_stars),
                dark_restart: cli_args.dark_restart.or(dark_restart),
                dark_age: cli_args.dark_age.or(dark_age),
                corrupt_frame: cli_args.corrupt_frame || corrupt_frame,
                mask_shift: cli_args.mask_shift.or(mask_shift),
                rv: cli_args.rv.or(rv),
                seed: cli_args.seed.or(seed),
            })
        } else {
            Ok(cli_args)
        }
    }

    fn parse(self) -> Result<(PathBuf, SimOptions), DrsError> {
        let outdir = self
            .outdir
            .ok_or_else(|| DrsError::Recipe("No output directory was given".to_string()))?;
        let d = SimOptions::default();
        let opts = SimOptions {
            night: self.night.unwrap_or(d.night),
            n_darks: self.darks.unwrap_or(d.n_darks),
            n_flats: self.flats.unwrap_or(d.n_flats),
            n_fp: self.fps.unwrap_or(d.n_fp),
            n_hc: self.hcs.unwrap_or(d.n_hc),
            n_science: self.science.unwrap_or(d.n_science),
            n_hot_stars: self.hot_stars.unwrap_or(d.n_hot_stars),
            dark_restart: self.dark_restart.or(d.dark_restart),
            dark_age: self.dark_age.unwrap_or(d.dark_age),
            corrupt_frame: self.corrupt_frame,
            rv: self.rv.unwrap_or(d.rv),
            mask_shift: self.mask_shift.unwrap_or(d.mask_shift),
            seed: self.seed.unwrap_or(d.seed),
        };
        if opts.n_darks == 0 || opts.n_flats == 0 || opts.n_fp == 0 || opts.n_hc == 0 {
            "Without darks, flats, FPs and HCs the night can't be fully calibrated".warn();
        }
        if outdir.join("nirdrs.toml").exists() {
            format!("Overwriting the night in {}", outdir.display()).warn();
        }
        Ok((outdir, opts))
    }

    pub(super) fn run(self, dry_run: bool) -> Result<(), DrsError> {
        trace!("{:#?}", self);
        let (outdir, opts) = self.parse()?;

        let mut printer = InfoPrinter::new(format!("Simulating night {}", opts.night).into());
        printer.push_block(vec![
            format!("Darks:     {}", opts.n_darks).into(),
            format!("Flats:     {}", opts.n_flats).into(),
            format!("FPs:       {}", opts.n_fp).into(),
            format!("HCs:       {}", opts.n_hc).into(),
            format!("Hot stars: {}", opts.n_hot_stars).into(),
            format!("Science:   {} (RV {} km/s)", opts.n_science, opts.rv).into(),
        ]);
        let mut faults = vec![];
        if let Some(k) = opts.dark_restart {
            faults.push(format!("Dark index restarts after {k} exposures").into());
        }
        if opts.dark_age > 0.0 {
            faults.push(format!("Darks taken {} days early", opts.dark_age).into());
        }
        if opts.corrupt_frame {
            faults.push("One corrupt FP exposure".into());
        }
        if opts.mask_shift != 0.0 {
            faults.push(format!("CCF mask shifted by {} km/s", opts.mask_shift).into());
        }
        if !faults.is_empty() {
            printer.push_block(faults);
        }
        printer.push_line(format!("Output: {}", outdir.display()).into());
        printer.display();
        display_warnings();

        if dry_run {
            info!("Dry run -- exiting now.");
            return Ok(());
        }

        let night = expensive_op(
            || simulate_night(&outdir, &opts),
            "Still writing the synthetic night...",
        )?;
        info!("Raw frames: {}", night.raw_dir.display());
        info!("Configuration: {}", night.config.display());
        info!(
            "Reduce it with: nirdrs --config {} process {}",
            night.config.display(),
            opts.night
        );
        Ok(())
    }
}

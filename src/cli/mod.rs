// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Command-line interface code. More specific options for `nirdrs`
//! subcommands are contained in modules.
//!
//! All booleans must have `#[serde(default)]` annotated, and anything that
//! isn't a boolean must be optional. This allows all arguments to be optional
//! *and* usable in an arguments file.
//!
//! Only 3 things should be public in this module: `Drs`, `Drs::run`, and
//! `DrsError`.

#[macro_use]
mod common;
mod calibdb;
mod error;
mod process;
mod recipe;
mod simulate;

pub use error::DrsError;

use std::path::{Path, PathBuf};

use clap::{AppSettings, Args, Parser, Subcommand};
use log::{info, warn};

use crate::{
    config::DrsConfig,
    constants::CHANGELOG_FILE,
    misc::{current_recipe, drs_pid, is_a_tty, LogTee},
    recipes::RecipeKind,
    CANCEL_REQUESTED, PROGRESS_BARS,
};

// Add build-time information from the "built" crate.
include!(concat!(env!("OUT_DIR"), "/built.rs"));

#[derive(Debug, Parser)]
#[clap(
    name = "nirdrs",
    version,
    author,
    about = "Data-reduction pipeline for a near-infrared cross-dispersed echelle spectrograph"
)]
#[clap(global_setting(AppSettings::DeriveDisplayOrder))]
#[clap(disable_help_subcommand = true)]
#[clap(infer_subcommands = true)]
#[clap(propagate_version = true)]
#[clap(infer_long_args = true)]
pub struct Drs {
    #[clap(flatten)]
    global_opts: GlobalArgs,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct GlobalArgs {
    /// Don't draw progress bars.
    #[clap(long)]
    #[clap(global = true)]
    no_progress_bars: bool,

    /// The verbosity of the program. Increase by specifying multiple times
    /// (e.g. -vv). The default is to print only high-level information.
    #[clap(short, long, parse(from_occurrences))]
    #[clap(global = true)]
    verbosity: u8,

    /// Only verify that arguments were correctly ingested and print out
    /// high-level information.
    #[clap(long)]
    #[clap(global = true)]
    dry_run: bool,

    /// The pipeline configuration (toml, json or yaml). Defaults to the file
    /// named by DRS_UCONFIG, then to built-in values.
    #[clap(short, long, parse(from_os_str))]
    #[clap(global = true)]
    config: Option<PathBuf>,

    /// Save the input arguments into a new TOML file that can be used to
    /// reproduce this run.
    #[clap(long)]
    #[clap(global = true)]
    save_toml: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
#[clap(arg_required_else_help = true)]
enum Command {
    #[clap(about = "Clean raw frames and rotate them to the canonical orientation.")]
    Preprocess(recipe::FilesArgs),

    #[clap(about = "Combine dark exposures into a dark-current map.")]
    Dark(recipe::FilesArgs),

    #[clap(about = "Flag bad pixels from flats and darks.")]
    Badpix(recipe::BadpixArgs),

    #[clap(alias = "localise")]
    #[clap(about = "Localise the orders of every fibre group on flats.")]
    Loc(recipe::FilesArgs),

    #[clap(about = "Measure the slit shape on FP and HC exposures.")]
    Shape(recipe::ShapeArgs),

    #[clap(about = "Fit the blaze and flat field of every order.")]
    Flat(recipe::FilesArgs),

    #[clap(about = "Measure the thermal background from dark exposures.")]
    Thermal(recipe::FilesArgs),

    #[clap(about = "Solve for a master wavelength solution and write the reference FP.")]
    WaveMaster(recipe::WaveMasterArgs),

    #[clap(about = "Solve for the wavelength of every order from HC and FP exposures.")]
    Wave(recipe::WaveArgs),

    #[clap(about = "Measure the drift of FP exposures against the reference FP.")]
    Drift(recipe::FilesArgs),

    #[clap(about = "Extract E2DS and S1D spectra.")]
    Extract(recipe::FilesArgs),

    #[clap(about = "Measure telluric transmission on hot stars.")]
    MkTellu(recipe::FilesArgs),

    #[clap(about = "Correct science spectra for telluric absorption.")]
    FitTellu(recipe::FilesArgs),

    #[clap(about = "Combine an object's corrected spectra into a stellar template.")]
    MkTemplate(recipe::FilesArgs),

    #[clap(about = "Measure radial velocities by cross-correlating with a line mask.")]
    Ccf(recipe::CcfArgs),

    #[clap(about = "Reduce every raw frame of a night, in dependency order.")]
    Process(process::ProcessArgs),

    #[clap(hide = true)]
    RunItem(process::RunItemArgs),

    #[clap(about = "Inspect the calibration databases.")]
    Calibdb(calibdb::CalibdbArgs),

    #[clap(about = "Write a synthetic night of raw frames with its configuration.")]
    SimulateNight(simulate::SimulateNightArgs),

    #[clap(about = "Print build information and the latest changelog entry.")]
    Version,
}

impl Drs {
    pub fn run(self) -> Result<(), DrsError> {
        // Set up logging.
        let GlobalArgs {
            verbosity,
            dry_run,
            no_progress_bars,
            config,
            save_toml,
        } = self.global_opts;
        setup_logging(verbosity).expect("Failed to initialise logging.");
        // Progress bars are only drawn for people.
        if !no_progress_bars && is_a_tty() {
            PROGRESS_BARS.store(true);
        }
        if let Err(e) = ctrlc::set_handler(|| {
            eprintln!("Cancelling; waiting for running recipes to finish");
            CANCEL_REQUESTED.store(true);
        }) {
            warn!("Couldn't install the interrupt handler: {e}");
        }

        // Print the version of nirdrs and its build-time information.
        let sub_command = match &self.command {
            Command::Preprocess(_) => "preprocess",
            Command::Dark(_) => "dark",
            Command::Badpix(_) => "badpix",
            Command::Loc(_) => "loc",
            Command::Shape(_) => "shape",
            Command::Flat(_) => "flat",
            Command::Thermal(_) => "thermal",
            Command::WaveMaster(_) => "wave-master",
            Command::Wave(_) => "wave",
            Command::Drift(_) => "drift",
            Command::Extract(_) => "extract",
            Command::MkTellu(_) => "mk-tellu",
            Command::FitTellu(_) => "fit-tellu",
            Command::MkTemplate(_) => "mk-template",
            Command::Ccf(_) => "ccf",
            Command::Process(_) => "process",
            Command::RunItem(_) => "run-item",
            Command::Calibdb(_) => "calibdb",
            Command::SimulateNight(_) => "simulate-night",
            Command::Version => "version",
        };
        info!("nirdrs {} {} ({})", sub_command, env!("CARGO_PKG_VERSION"), drs_pid());
        // Workers leave the build information to their orchestrator.
        let is_worker = matches!(self.command, Command::RunItem(_));
        if !is_worker {
            display_build_info();
        }

        let load_config = || DrsConfig::load(config.as_deref());

        macro_rules! merge_save_run {
            ($args:expr, |$merged:ident| $run:expr) => {{
                let $merged = $args.merge()?;
                if let Some(toml) = save_toml {
                    use std::{
                        fs::File,
                        io::{BufWriter, Write},
                    };

                    let mut f = BufWriter::new(File::create(toml)?);
                    let toml_str = toml::to_string(&$merged).map_err(|e| DrsError::ArgFile(e.to_string()))?;
                    f.write_all(toml_str.as_bytes())?;
                }
                $run?;
            }};
        }

        match self.command {
            Command::Preprocess(args) => {
                merge_save_run!(args, |a| a.run(RecipeKind::Preprocess, &load_config()?, dry_run))
            }
            Command::Dark(args) => {
                merge_save_run!(args, |a| a.run(RecipeKind::Dark, &load_config()?, dry_run))
            }
            Command::Badpix(args) => merge_save_run!(args, |a| a.run(&load_config()?, dry_run)),
            Command::Loc(args) => {
                merge_save_run!(args, |a| a.run(RecipeKind::Loc, &load_config()?, dry_run))
            }
            Command::Shape(args) => merge_save_run!(args, |a| a.run(&load_config()?, dry_run)),
            Command::Flat(args) => {
                merge_save_run!(args, |a| a.run(RecipeKind::Flat, &load_config()?, dry_run))
            }
            Command::Thermal(args) => {
                merge_save_run!(args, |a| a.run(RecipeKind::Thermal, &load_config()?, dry_run))
            }
            Command::WaveMaster(args) => merge_save_run!(args, |a| a.run(&load_config()?, dry_run)),
            Command::Wave(args) => merge_save_run!(args, |a| a.run(&load_config()?, dry_run)),
            Command::Drift(args) => {
                merge_save_run!(args, |a| a.run(RecipeKind::Drift, &load_config()?, dry_run))
            }
            Command::Extract(args) => {
                merge_save_run!(args, |a| a.run(RecipeKind::Extract, &load_config()?, dry_run))
            }
            Command::MkTellu(args) => {
                merge_save_run!(args, |a| a.run(RecipeKind::MkTellu, &load_config()?, dry_run))
            }
            Command::FitTellu(args) => {
                merge_save_run!(args, |a| a.run(RecipeKind::FitTellu, &load_config()?, dry_run))
            }
            Command::MkTemplate(args) => {
                merge_save_run!(args, |a| a.run(RecipeKind::MkTemplate, &load_config()?, dry_run))
            }
            Command::Ccf(args) => merge_save_run!(args, |a| a.run(&load_config()?, dry_run)),
            Command::Process(args) => merge_save_run!(args, |a| a.run(&load_config()?, dry_run)),
            Command::SimulateNight(args) => merge_save_run!(args, |a| a.run(dry_run)),

            Command::RunItem(args) => args.run(&load_config()?)?,
            Command::Calibdb(args) => args.run(&load_config()?)?,
            Command::Version => display_changelog(),
        }

        if !is_worker {
            info!("nirdrs {} complete.", sub_command);
        }
        Ok(())
    }
}

/// Activate a logger. Records go to `stdout` and, while a night is being
/// processed, to the night's log file. Each record is tagged with the process
/// id and the recipe running on its thread. Source code lines are displayed
/// in log messages when verbosity >= 3.
fn setup_logging(verbosity: u8) -> Result<(), log::SetLoggerError> {
    use std::io::Write;

    let mut builder = env_logger::Builder::from_default_env();
    builder.target(env_logger::Target::Pipe(Box::new(LogTee)));
    match verbosity {
        0 => builder.filter_level(log::LevelFilter::Info),
        1 => builder.filter_level(log::LevelFilter::Debug),
        _ => builder.filter_level(log::LevelFilter::Trace),
    };
    if verbosity < 3 {
        builder.format(|buf, record| {
            writeln!(
                buf,
                "[{} {}|{}] {}",
                record.level(),
                drs_pid(),
                current_recipe(),
                record.args()
            )
        });
    } else {
        builder.format(|buf, record| {
            let timestamp = buf.timestamp();
            let level = record.level();
            let target = record.target();
            let line = record.line().unwrap_or(0);
            let message = record.args();

            writeln!(
                buf,
                "[{timestamp} {level} {}|{} {target}:{line}] {message}",
                drs_pid(),
                current_recipe()
            )
        });
    }
    builder.try_init()
}

/// Write many info-level log lines of how this executable was compiled.
fn display_build_info() {
    let dirty = match GIT_DIRTY {
        Some(true) => " (dirty)",
        _ => "",
    };
    match GIT_COMMIT_HASH_SHORT {
        Some(hash) => {
            info!("Compiled on git commit hash: {hash}{dirty}");
        }
        None => info!("Compiled on git commit hash: <no git info>"),
    }
    if let Some(hr) = GIT_HEAD_REF {
        info!("            git head ref: {}", hr);
    }
    info!("            {}", BUILT_TIME_UTC);
    info!("         with compiler {}", RUSTC_VERSION);
    info!("");
}

/// The changelog next to the installed binary, or in the source tree it was
/// built from.
fn find_changelog() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok();
    let installed = exe
        .iter()
        .flat_map(|e| e.ancestors().skip(1).take(3))
        .map(|dir| dir.join(CHANGELOG_FILE));
    let built = std::iter::once(Path::new(env!("CARGO_MANIFEST_DIR")).join(CHANGELOG_FILE));
    installed.chain(built).find(|p| p.exists())
}

/// The first release section of a changelog: everything up to the second
/// `## ` heading.
fn changelog_head(text: &str) -> Vec<&str> {
    let mut headings = 0;
    text.lines()
        .take_while(|l| {
            if l.starts_with("## ") {
                headings += 1;
            }
            headings < 2
        })
        .skip_while(|l| !l.starts_with("## "))
        .collect()
}

fn display_changelog() {
    let Some(path) = find_changelog() else {
        info!("No {CHANGELOG_FILE} found");
        return;
    };
    match std::fs::read_to_string(&path) {
        Ok(text) => {
            for line in changelog_head(&text) {
                info!("{line}");
            }
        }
        Err(e) => warn!("Couldn't read {}: {e}", path.display()),
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;
    use indoc::indoc;

    use super::*;

    #[test]
    fn test_cli_is_consistent() {
        Drs::command().debug_assert();
    }

    #[test]
    fn test_parse_recipe_commands() {
        let drs = Drs::try_parse_from([
            "nirdrs",
            "-vv",
            "--config",
            "night/nirdrs.toml",
            "badpix",
            "2024-05-14",
            "--flats",
            "a.fits",
            "b.fits",
            "--darks",
            "c.fits",
        ])
        .unwrap();
        assert_eq!(drs.global_opts.verbosity, 2);
        assert_eq!(drs.global_opts.config, Some(PathBuf::from("night/nirdrs.toml")));
        match drs.command {
            Command::Badpix(args) => {
                assert_eq!(args.night.as_deref(), Some("2024-05-14"));
                assert_eq!(args.flats, ["a.fits", "b.fits"]);
                assert_eq!(args.darks, ["c.fits"]);
            }
            _ => panic!("expected badpix"),
        }

        let drs = Drs::try_parse_from(["nirdrs", "ccf", "2024-05-14", "x.fits", "--rv", "-12.5"]).unwrap();
        match drs.command {
            Command::Ccf(args) => {
                assert_eq!(args.rv, Some(-12.5));
                assert_eq!(args.files.files, ["x.fits"]);
            }
            _ => panic!("expected ccf"),
        }

        let drs = Drs::try_parse_from(["nirdrs", "mk-template", "2024-05-14", "a.fits", "b.fits"]).unwrap();
        match drs.command {
            Command::MkTemplate(args) => assert_eq!(args.files, ["a.fits", "b.fits"]),
            _ => panic!("expected mk-template"),
        }
        let drs = Drs::try_parse_from([
            "nirdrs",
            "wave-master",
            "2024-05-14",
            "--hc",
            "h.fits",
            "--fp",
            "f.fits",
        ])
        .unwrap();
        assert!(matches!(drs.command, Command::WaveMaster(_)));
        let drs = Drs::try_parse_from(["nirdrs", "run-item", "msg/tasks/dark_2400001d.json"]).unwrap();
        match drs.command {
            Command::RunItem(args) => assert_eq!(args.task, PathBuf::from("msg/tasks/dark_2400001d.json")),
            _ => panic!("expected run-item"),
        }

        assert!(Drs::try_parse_from(["nirdrs", "calibdb", "lookup", "DARK", "60444.1"]).is_ok());
        assert!(Drs::try_parse_from(["nirdrs", "not-a-recipe"]).is_err());
    }

    #[test]
    fn test_changelog_head() {
        let text = indoc! {"
            # Changelog

            ## [0.3.0] - 2024-06-01
            ### Added
            - Thermal correction

            ## [0.2.0] - 2024-03-01
            - Older things
        "};
        let head = changelog_head(text);
        assert_eq!(head[0], "## [0.3.0] - 2024-06-01");
        assert_eq!(head.last(), Some(&""));
        assert!(!head.iter().any(|l| l.contains("0.2.0")));
    }
}

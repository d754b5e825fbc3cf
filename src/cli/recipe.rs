// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Running a single recipe from the command line.

use std::path::{Path, PathBuf};

use clap::Parser;
use log::{debug, info, trace, warn};
use serde::{Deserialize, Serialize};

use super::common::{display_warnings, expand_files, require_night, InfoPrinter, Warn, ARG_FILE_HELP};
use crate::{
    config::DrsConfig,
    misc::{close_night_log, drs_pid, open_night_log},
    recipes::{RecipeContext, RecipeInputs, RecipeKind},
    DrsError,
};

/// File lists given on the command line replace those of the argument file.
fn or_from_file(cli: Vec<String>, file: Vec<String>) -> Vec<String> {
    if cli.is_empty() {
        file
    } else {
        cli
    }
}

/// Recipes with one list of input files.
#[derive(Parser, Debug, Clone, Default, Serialize, Deserialize)]
pub(super) struct FilesArgs {
    #[clap(long, help = ARG_FILE_HELP.as_str(), parse(from_os_str))]
    #[serde(skip)]
    pub(super) args_file: Option<PathBuf>,

    /// The night directory, e.g. 2024-05-14.
    #[clap(name = "NIGHT")]
    pub(super) night: Option<String>,

    /// Raw (or preprocessed) files of the night. Globs are expanded.
    #[clap(name = "FILES")]
    #[serde(default)]
    pub(super) files: Vec<String>,
}

impl FilesArgs {
    pub(super) fn merge(self) -> Result<FilesArgs, DrsError> {
        debug!("Merging command-line arguments with the argument file");

        let cli_args = self;
        if let Some(arg_file) = cli_args.args_file {
            let FilesArgs {
                args_file: _,
                night,
                files,
            } = unpack_arg_file!(arg_file);

            Ok(FilesArgs {
                args_file: None,
                night: cli_args.night.or(night),
                files: or_from_file(cli_args.files, files),
            })
        } else {
            Ok(cli_args)
        }
    }

    pub(super) fn run(self, kind: RecipeKind, config: &DrsConfig, dry_run: bool) -> Result<(), DrsError> {
        trace!("{:#?}", self);
        let night = require_night(self.night)?;
        let files = expand_files(self.files, "files")?;
        run_recipe(kind, config, &night, RecipeInputs::single(files), dry_run)
    }
}

/// Generates the argument struct of a recipe taking two named file lists.
macro_rules! two_role_args {
    ($name:ident, $kind:expr, $first:ident: $first_doc:literal, $second:ident: $second_doc:literal) => {
        #[derive(Parser, Debug, Clone, Default, Serialize, Deserialize)]
        pub(super) struct $name {
            #[clap(long, help = ARG_FILE_HELP.as_str(), parse(from_os_str))]
            #[serde(skip)]
            pub(super) args_file: Option<PathBuf>,

            /// The night directory, e.g. 2024-05-14.
            #[clap(name = "NIGHT")]
            pub(super) night: Option<String>,

            #[doc = $first_doc]
            #[clap(long, multiple_values(true))]
            #[serde(default)]
            pub(super) $first: Vec<String>,

            #[doc = $second_doc]
            #[clap(long, multiple_values(true))]
            #[serde(default)]
            pub(super) $second: Vec<String>,
        }

        impl $name {
            pub(super) fn merge(self) -> Result<$name, DrsError> {
                debug!("Merging command-line arguments with the argument file");

                let cli_args = self;
                if let Some(arg_file) = cli_args.args_file {
                    let $name {
                        args_file: _,
                        night,
                        $first,
                        $second,
                    } = unpack_arg_file!(arg_file);

                    Ok($name {
                        args_file: None,
                        night: cli_args.night.or(night),
                        $first: or_from_file(cli_args.$first, $first),
                        $second: or_from_file(cli_args.$second, $second),
                    })
                } else {
                    Ok(cli_args)
                }
            }

            pub(super) fn run(self, config: &DrsConfig, dry_run: bool) -> Result<(), DrsError> {
                trace!("{:#?}", self);
                let night = require_night(self.night)?;
                let first = expand_files(self.$first, stringify!($first))?;
                let second = expand_files(self.$second, stringify!($second))?;
                run_recipe($kind, config, &night, RecipeInputs::pair(first, second), dry_run)
            }
        }
    };
}

two_role_args!(
    BadpixArgs,
    RecipeKind::Badpix,
    flats: "Flat exposures.",
    darks: "Dark exposures."
);
two_role_args!(
    ShapeArgs,
    RecipeKind::Shape,
    fp: "FP exposures.",
    hc: "HC exposures."
);
two_role_args!(
    WaveMasterArgs,
    RecipeKind::WaveMaster,
    hc: "HC exposures.",
    fp: "FP exposures whose peaks become the reference FP."
);
two_role_args!(
    WaveArgs,
    RecipeKind::Wave,
    hc: "HC exposures.",
    fp: "FP exposures."
);

#[derive(Parser, Debug, Clone, Default, Serialize, Deserialize)]
pub(super) struct CcfArgs {
    #[clap(flatten)]
    #[serde(flatten)]
    pub(super) files: FilesArgs,

    /// The line mask to correlate with. Defaults to the configured mask.
    #[clap(long, parse(from_os_str))]
    pub(super) mask: Option<PathBuf>,

    /// Centre of the velocity scan [km/s].
    #[clap(long, allow_hyphen_values(true))]
    pub(super) rv: Option<f64>,

    /// Half-width of the velocity scan [km/s].
    #[clap(long)]
    pub(super) width: Option<f64>,

    /// Velocity step of the scan [km/s].
    #[clap(long)]
    pub(super) step: Option<f64>,
}

impl CcfArgs {
    pub(super) fn merge(self) -> Result<CcfArgs, DrsError> {
        debug!("Merging command-line arguments with the argument file");

        let cli_args = self;
        if let Some(arg_file) = cli_args.files.args_file.clone() {
            let CcfArgs {
                files,
                mask,
                rv,
                width,
                step,
            } = unpack_arg_file!(arg_file);

            Ok(CcfArgs {
                files: FilesArgs {
                    args_file: None,
                    night: cli_args.files.night.or(files.night),
                    files: or_from_file(cli_args.files.files, files.files),
                },
                mask: cli_args.mask.or(mask),
                rv: cli_args.rv.or(rv),
                width: cli_args.width.or(width),
                step: cli_args.step.or(step),
            })
        } else {
            Ok(cli_args)
        }
    }

    pub(super) fn run(self, config: &DrsConfig, dry_run: bool) -> Result<(), DrsError> {
        let mut config = config.clone();
        let ccf = &mut config.ccf;
        if let Some(mask) = self.mask {
            ccf.mask = absolute(&mask)?;
        }
        if let Some(rv) = self.rv {
            ccf.rv = rv;
        }
        if let Some(width) = self.width {
            if width <= 0.0 {
                return Err(DrsError::Recipe(format!("The CCF width must be positive, not {width}")));
            }
            ccf.width = width;
        }
        if let Some(step) = self.step {
            if step <= 0.0 {
                return Err(DrsError::Recipe(format!("The CCF step must be positive, not {step}")));
            }
            ccf.step = step;
        }
        if ccf.step > ccf.width {
            format!(
                "The CCF step ({} km/s) is larger than the scan half-width ({} km/s)",
                ccf.step, ccf.width
            )
            .warn();
        }
        self.files.run(RecipeKind::Ccf, &config, dry_run)
    }
}

/// Paths given on the command line are relative to the working directory.
fn absolute(p: &Path) -> Result<PathBuf, DrsError> {
    if p.is_absolute() {
        Ok(p.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(p))
    }
}

/// Describe the inputs, then run the recipe. Products that fail quality
/// control are an error.
fn run_recipe(
    kind: RecipeKind,
    config: &DrsConfig,
    night: &str,
    inputs: RecipeInputs,
    dry_run: bool,
) -> Result<(), DrsError> {
    let spec = kind.spec();
    let mut printer = InfoPrinter::new(format!("{kind}: {}", spec.about).into());
    printer.push_line(format!("Night: {night}").into());
    for (role, files) in spec.inputs.iter().zip(&inputs.files) {
        let mut block = vec![format!("{} ({}):", role.name, files.len()).into()];
        block.extend(files.iter().map(|f| format!("  {}", f.display()).into()));
        printer.push_block(block);
    }
    for (label, kinds) in [
        ("Requires", spec.requires),
        ("Uses if present", spec.optional),
        ("Publishes", spec.publishes),
        ("Writes", spec.outputs),
    ] {
        if !kinds.is_empty() {
            printer.push_line(format!("{label}: {}", kinds.join(", ")).into());
        }
    }
    printer.display();

    if matches!(kind, RecipeKind::Dark | RecipeKind::Flat) && inputs.role(0).len() < 3 {
        format!(
            "Only {} input files; the combined {kind} will be noisy",
            inputs.role(0).len()
        )
        .warn();
    }
    display_warnings();

    if dry_run {
        info!("Dry run -- exiting now.");
        return Ok(());
    }

    let ctx = RecipeContext::new(config, night);
    let log_path = ctx.store.msg_dir(night).join(format!("{}.log", drs_pid()));
    if let Err(e) = open_night_log(&log_path) {
        warn!("Couldn't open the night log {}: {e}", log_path.display());
    }
    let _night_log = scopeguard::guard((), |_| close_night_log());

    let outcome = spec.run(config, &ctx, &inputs)?;
    for output in &outcome.outputs {
        info!("Wrote {}", output.display());
    }
    for entry in &outcome.published {
        info!("Published {} {}", entry.kind, entry.basename);
    }
    if outcome.passed() {
        Ok(())
    } else {
        Err(DrsError::Qc(format!(
            "{kind} failed quality control: {}",
            outcome.qc.failed_names().join(", ")
        )))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use indoc::indoc;
    use tempfile::Builder;

    use super::*;

    #[test]
    fn test_cli_args_override_the_arg_file() {
        let mut f = Builder::new().suffix(".toml").tempfile().unwrap();
        f.write_all(
            indoc! {r#"
                night = "2024-05-14"
                flats = ["2400006f.fits"]
                darks = ["2400001d.fits", "2400002d.fits"]
            "#}
            .as_bytes(),
        )
        .unwrap();

        let args = BadpixArgs {
            args_file: Some(f.path().to_path_buf()),
            flats: vec!["2400007f.fits".to_string()],
            ..Default::default()
        }
        .merge()
        .unwrap();
        assert_eq!(args.night.as_deref(), Some("2024-05-14"));
        assert_eq!(args.flats, ["2400007f.fits"]);
        assert_eq!(args.darks.len(), 2);
    }

    #[test]
    fn test_ccf_arg_file() {
        let mut f = Builder::new().suffix(".json").tempfile().unwrap();
        f.write_all(br#"{"night": "2024-05-14", "files": ["2400017o.fits"], "rv": -20.5}"#)
            .unwrap();
        let args = CcfArgs {
            files: FilesArgs {
                args_file: Some(f.path().to_path_buf()),
                ..Default::default()
            },
            step: Some(0.25),
            ..Default::default()
        }
        .merge()
        .unwrap();
        assert_eq!(args.files.files, ["2400017o.fits"]);
        assert_eq!(args.rv, Some(-20.5));
        assert_eq!(args.step, Some(0.25));
        assert!(args.width.is_none());
    }

    #[test]
    fn test_arg_file_lists_fill_in_empty_ones() {
        let mut f = Builder::new().suffix(".json").tempfile().unwrap();
        f.write_all(br#"{"night": "2024-05-14", "hc": ["2400015a.fits"], "fp": ["2400016a.fits"]}"#)
            .unwrap();
        let args = WaveMasterArgs {
            args_file: Some(f.path().to_path_buf()),
            fp: vec!["2400020a.fits".to_string()],
            ..Default::default()
        }
        .merge()
        .unwrap();
        assert_eq!(args.hc, ["2400015a.fits"]);
        assert_eq!(args.fp, ["2400020a.fits"]);
    }

    #[test]
    fn test_bad_arg_file_extension() {
        let f = Builder::new().suffix(".ini").tempfile().unwrap();
        let result = FilesArgs {
            args_file: Some(f.path().to_path_buf()),
            ..Default::default()
        }
        .merge();
        assert!(matches!(result, Err(DrsError::ArgFile(_))));
    }

    #[test]
    fn test_missing_night_is_a_user_error() {
        let result = FilesArgs {
            files: vec!["a.fits".to_string()],
            ..Default::default()
        }
        .run(RecipeKind::Dark, &DrsConfig::default(), true);
        match result {
            Err(e) => assert_eq!(e.exit_code(), 1),
            Ok(_) => panic!("expected an error"),
        }
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Running single recipes and the exit codes of failures.

use std::io::Write;

use indoc::indoc;
use tempfile::TempDir;

use crate::*;

fn exit_code(result: &Result<Output, OutputError>) -> Option<i32> {
    match result {
        Ok(o) => o.status.code(),
        Err(o) => o.as_output().unwrap().status.code(),
    }
}

#[test]
fn test_single_dark() {
    let tmp_dir = TempDir::new().expect("couldn't make tmp dir");
    let config = simulate(tmp_dir.path(), &["--darks", "3"]);

    #[rustfmt::skip]
    let cmd = nirdrs()
        .args([
            "--no-progress-bars",
            "--config", &format!("{}", config.display()),
            "dark", NIGHT, "2400001d", "2400002d", "2400003d.fits",
        ])
        .ok();
    assert!(cmd.is_ok(), "dark failed: {}", cmd.err().unwrap());
    let (stdout, _) = get_cmd_output(cmd);
    assert!(stdout.contains("Published DARK"), "{stdout}");

    // The raw inputs were preprocessed on the way.
    let working = tmp_dir.path().join("working").join(NIGHT);
    for i in 1..=3 {
        assert!(working.join(format!("240000{i}d_pp.fits")).exists());
    }
    let kinds = db_kinds(&tmp_dir.path().join("calibDB").join("calibDB.txt"));
    assert_eq!(kinds, ["DARK"]);
}

#[test]
fn test_arg_file() {
    let tmp_dir = TempDir::new().expect("couldn't make tmp dir");
    let config = simulate(tmp_dir.path(), &["--darks", "2"]);
    let args_file = tmp_dir.path().join("dark.toml");
    let mut f = std::fs::File::create(&args_file).unwrap();
    f.write_all(
        indoc! {r#"
            night = "2024-05-14"
            files = ["2400001d", "2400002d"]
        "#}
        .as_bytes(),
    )
    .unwrap();
    drop(f);

    #[rustfmt::skip]
    let cmd = nirdrs()
        .args([
            "--no-progress-bars",
            "--config", &format!("{}", config.display()),
            "dark", "--args-file", &format!("{}", args_file.display()),
        ])
        .ok();
    assert!(cmd.is_ok(), "dark failed: {}", cmd.err().unwrap());
    assert!(tmp_dir.path().join("calibDB").join("calibDB.txt").exists());
}

#[test]
fn test_save_toml() {
    let tmp_dir = TempDir::new().expect("couldn't make tmp dir");
    let config = simulate(tmp_dir.path(), &["--darks", "1"]);
    let saved = tmp_dir.path().join("saved.toml");

    #[rustfmt::skip]
    let cmd = nirdrs()
        .args([
            "--dry-run",
            "--config", &format!("{}", config.display()),
            "--save-toml", &format!("{}", saved.display()),
            "ccf", NIGHT, "2400013o", "--rv", "-20",
        ])
        .ok();
    assert!(cmd.is_ok(), "ccf failed: {}", cmd.err().unwrap());
    let text = std::fs::read_to_string(&saved).unwrap();
    assert!(text.contains("night = \"2024-05-14\""), "{text}");
    assert!(text.contains("rv = -20"), "{text}");
    // A dry run makes no products.
    assert!(!reduced_dir(tmp_dir.path()).exists());
}

#[test]
fn test_user_errors_exit_1() {
    let tmp_dir = TempDir::new().expect("couldn't make tmp dir");
    let config = simulate(tmp_dir.path(), &["--darks", "1"]);
    let config = format!("{}", config.display());

    // No night.
    let cmd = nirdrs().args(["--config", &config, "dark"]).ok();
    assert_eq!(exit_code(&cmd), Some(1));

    // A file that doesn't exist.
    let cmd = nirdrs()
        .args(["--config", &config, "dark", NIGHT, "9999999d"])
        .ok();
    assert_eq!(exit_code(&cmd), Some(1));

    // A flat given to the dark recipe.
    let cmd = nirdrs()
        .args(["--config", &config, "dark", NIGHT, "2400002f"])
        .ok();
    let code = exit_code(&cmd);
    let (stdout, stderr) = get_cmd_output(cmd);
    assert_eq!(code, Some(1), "{stdout}");
    assert!(stderr.starts_with("Error:"), "{stderr}");

    // A configuration that doesn't exist.
    let missing = tmp_dir.path().join("missing.toml");
    let cmd = nirdrs()
        .args([
            "--config",
            &format!("{}", missing.display()),
            "process",
            NIGHT,
        ])
        .ok();
    assert_eq!(exit_code(&cmd), Some(1));
}

#[test]
fn test_corrupt_frame_exits_3() {
    let tmp_dir = TempDir::new().expect("couldn't make tmp dir");
    let config = simulate(
        tmp_dir.path(),
        &["--darks", "1", "--flats", "1", "--fps", "1", "--corrupt-frame"],
    );

    #[rustfmt::skip]
    let cmd = nirdrs()
        .args([
            "--config", &format!("{}", config.display()),
            "preprocess", NIGHT, "2400004a",
        ])
        .ok();
    assert_eq!(exit_code(&cmd), Some(3));

    #[rustfmt::skip]
    let cmd = nirdrs()
        .args([
            "--config", &format!("{}", config.display()),
            "preprocess", NIGHT, "2400003a",
        ])
        .ok();
    assert!(cmd.is_ok(), "preprocess failed: {}", cmd.err().unwrap());
}

#[test]
fn test_version() {
    let cmd = nirdrs().arg("version").ok();
    assert!(cmd.is_ok(), "version failed: {}", cmd.err().unwrap());
    let (stdout, _) = get_cmd_output(cmd);
    assert!(stdout.contains(env!("CARGO_PKG_VERSION")), "{stdout}");
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Tests to ensure there is no stderr output for successful commands.

use tempfile::TempDir;

use crate::*;

#[test]
fn test_simulate_night_no_stderr() {
    let tmp_dir = TempDir::new().expect("couldn't make tmp dir");

    #[rustfmt::skip]
    let cmd = nirdrs()
        .args([
            "simulate-night", &format!("{}", tmp_dir.path().display()),
            "--darks", "2",
            "--flats", "2",
            "--fps", "2",
        ])
        .ok();
    assert!(
        cmd.is_ok(),
        "simulate-night failed: {}",
        cmd.err().unwrap()
    );
    let (_, stderr) = get_cmd_output(cmd);
    assert!(stderr.is_empty(), "stderr wasn't empty: {stderr}");
}

#[test]
fn test_process_no_stderr() {
    let tmp_dir = TempDir::new().expect("couldn't make tmp dir");
    let config = simulate(tmp_dir.path(), &["--darks", "3", "--flats", "3", "--fps", "3"]);
    let (_, stderr) = process(&config);
    assert!(stderr.is_empty(), "stderr wasn't empty: {stderr}");
}

#[test]
fn test_dry_run_no_stderr() {
    let tmp_dir = TempDir::new().expect("couldn't make tmp dir");
    let config = simulate(tmp_dir.path(), &["--darks", "1"]);

    #[rustfmt::skip]
    let cmd = nirdrs()
        .args([
            "--dry-run",
            "--config", &format!("{}", config.display()),
            "process", NIGHT,
        ])
        .ok();
    assert!(cmd.is_ok(), "process failed: {}", cmd.err().unwrap());
    let (_, stderr) = get_cmd_output(cmd);
    assert!(stderr.is_empty(), "stderr wasn't empty: {stderr}");
    assert!(!reduced_dir(tmp_dir.path()).exists());
}

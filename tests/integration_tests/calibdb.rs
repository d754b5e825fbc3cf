// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use tempfile::TempDir;

use crate::*;

#[test]
fn test_list_and_lookup() {
    let tmp_dir = TempDir::new().expect("couldn't make tmp dir");
    let config = simulate(tmp_dir.path(), &["--darks", "3"]);
    let config = format!("{}", config.display());

    #[rustfmt::skip]
    let cmd = nirdrs()
        .args([
            "--no-progress-bars",
            "--config", &config,
            "dark", NIGHT, "2400001d", "2400002d", "2400003d",
        ])
        .ok();
    assert!(cmd.is_ok(), "dark failed: {}", cmd.err().unwrap());

    let cmd = nirdrs()
        .args(["--config", &config, "calibdb", "list", "--kind", "DARK"])
        .ok();
    assert!(cmd.is_ok(), "calibdb list failed: {}", cmd.err().unwrap());
    let (stdout, _) = get_cmd_output(cmd);
    assert!(stdout.contains("DARK"), "{stdout}");
    assert!(stdout.contains("SPECTRO"), "{stdout}");

    // Late in the night, the dark taken at its start is used.
    let cmd = nirdrs()
        .args(["--config", &config, "calibdb", "lookup", "DARK", "60444.9"])
        .ok();
    assert!(cmd.is_ok(), "calibdb lookup failed: {}", cmd.err().unwrap());
    let (stdout, _) = get_cmd_output(cmd);
    assert!(stdout.contains("DARK for MJD 60444.90000 (older)"), "{stdout}");
    assert!(!stdout.contains("fallback"), "{stdout}");

    // Nothing precedes the night, so the closest dark is used instead.
    let cmd = nirdrs()
        .args(["--config", &config, "calibdb", "lookup", "DARK", "60440"])
        .ok();
    assert!(cmd.is_ok(), "calibdb lookup failed: {}", cmd.err().unwrap());
    let (stdout, _) = get_cmd_output(cmd);
    assert!(stdout.contains("closest fallback"), "{stdout}");

    #[rustfmt::skip]
    let cmd = nirdrs()
        .args([
            "--config", &config,
            "calibdb", "lookup", "DARK", "60440", "--policy", "closest",
        ])
        .ok();
    assert!(cmd.is_ok(), "calibdb lookup failed: {}", cmd.err().unwrap());
    let (stdout, _) = get_cmd_output(cmd);
    assert!(stdout.contains("DARK for MJD 60440.00000 (closest)"), "{stdout}");
    assert!(!stdout.contains("fallback"), "{stdout}");
}

#[test]
fn test_missing_calibration_exits_3() {
    let tmp_dir = TempDir::new().expect("couldn't make tmp dir");
    let config = simulate(tmp_dir.path(), &["--darks", "1"]);

    #[rustfmt::skip]
    let cmd = nirdrs()
        .args([
            "--config", &format!("{}", config.display()),
            "calibdb", "lookup", "WAVE_AB", "60444.5",
        ])
        .ok();
    assert!(cmd.is_err());
    assert_eq!(cmd.err().unwrap().as_output().unwrap().status.code(), Some(3));

    // An empty database isn't an error to list.
    #[rustfmt::skip]
    let cmd = nirdrs()
        .args([
            "--config", &format!("{}", config.display()),
            "calibdb", "--tellu", "list",
        ])
        .ok();
    assert!(cmd.is_ok(), "calibdb list failed: {}", cmd.err().unwrap());
    let (stdout, _) = get_cmd_output(cmd);
    assert!(stdout.contains("No entries"), "{stdout}");
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Reducing whole simulated nights.

use tempfile::TempDir;

use crate::*;

/// The velocity reported in a log line like
/// "2400017o: RV 12.3012 km/s, contrast ...".
fn logged_rv(stdout: &str, basename: &str) -> Option<f64> {
    let needle = format!("{basename}: RV ");
    stdout.lines().find_map(|l| {
        let (_, rest) = l.split_once(&needle)?;
        rest.split_whitespace().next()?.parse().ok()
    })
}

#[test]
fn test_complete_night() {
    let tmp_dir = TempDir::new().expect("couldn't make tmp dir");
    let config = simulate(tmp_dir.path(), &[]);
    let (stdout, _) = process(&config);

    let kinds = db_kinds(&tmp_dir.path().join("calibDB").join("calibDB.txt"));
    for kind in [
        "DARK", "BADPIX", "BKGRD_MAP", "LOC_AB", "LOC_C", "SHAPE", "FLAT_AB", "FLAT_C", "BLAZE_AB",
        "BLAZE_C", "WAVE_AB", "WAVE_C",
    ] {
        assert!(kinds.iter().any(|k| k == kind), "{kind} wasn't published: {kinds:?}");
    }

    let reduced = reduced_dir(tmp_dir.path());
    for product in [
        "2400017o_pp_e2ds_AB.fits",
        "2400017o_pp_e2dsff_AB.fits",
        "2400017o_pp_s1d_w_AB.fits",
        "2400017o_pp_s1d_v_AB.fits",
        "2400017o_pp_ccf_ccf_mask_AB.fits",
    ] {
        assert!(reduced.join(product).exists(), "{product} is missing");
    }

    let rows = only_summary(tmp_dir.path());
    assert!(rows.iter().all(|r| !r.status.starts_with("ERROR")), "{rows:#?}");
    let ccf: Vec<_> = rows.iter().filter(|r| r.recipe == "ccf").collect();
    assert_eq!(ccf.len(), 1);
    assert!(ccf[0].item.contains("2400017o"));
    assert_eq!(ccf[0].status, "OK");

    let rv = logged_rv(&stdout, "2400017o").expect("no RV was logged");
    assert!((rv - 12.3).abs() < 1.0, "measured RV {rv} km/s");

    // Everything logged also went to the night's logs, one per process.
    let logs: Vec<PathBuf> = std::fs::read_dir(msg_dir(tmp_dir.path()))
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.extension().map(|e| e == "log").unwrap_or(false))
        .collect();
    assert!(logs.len() > 1, "{logs:?}");
    assert!(logs
        .iter()
        .any(|log| std::fs::read_to_string(log).unwrap().contains("RV ")));

    // Items ran in their own processes.
    let pids: std::collections::HashSet<&str> = rows.iter().map(|r| r.pid.as_str()).collect();
    assert!(pids.len() > 1, "{pids:?}");
}

#[test]
fn test_rerun_skips_finished_items() {
    let tmp_dir = TempDir::new().expect("couldn't make tmp dir");
    let config = simulate(tmp_dir.path(), &["--fps", "3"]);
    process(&config);
    let calib_db = tmp_dir.path().join("calibDB").join("calibDB.txt");
    let before = std::fs::read_to_string(&calib_db).unwrap();

    // Summaries are named after the process ID, which includes the time in
    // seconds.
    std::thread::sleep(std::time::Duration::from_millis(1100));
    process(&config);
    let files = summaries(tmp_dir.path());
    assert_eq!(files.len(), 2);
    let rows = read_summary(&files[1]);
    assert!(!rows.is_empty());
    for row in rows {
        assert_eq!(row.status, "SKIPPED", "{row:?}");
        assert_eq!(row.message, "already done");
    }
    assert_eq!(std::fs::read_to_string(&calib_db).unwrap(), before);
}

#[test]
fn test_dark_sequence_restart() {
    let tmp_dir = TempDir::new().expect("couldn't make tmp dir");
    let config = simulate(tmp_dir.path(), &["--darks", "6", "--dark-restart", "3"]);
    process(&config);

    let rows = only_summary(tmp_dir.path());
    let darks: Vec<_> = rows.iter().filter(|r| r.recipe == "dark").collect();
    // The restarted sequence is two sequences, each with its own dark.
    assert_eq!(darks.len(), 2, "{rows:#?}");
    assert!(darks.iter().all(|r| r.status == "OK"));
    let kinds = db_kinds(&tmp_dir.path().join("calibDB").join("calibDB.txt"));
    assert_eq!(kinds.iter().filter(|k| *k == "DARK").count(), 2);
    assert!(rows.iter().filter(|r| r.recipe == "ccf").all(|r| r.status == "OK"));
}

#[test]
fn test_old_darks_are_used() {
    let tmp_dir = TempDir::new().expect("couldn't make tmp dir");
    let config = simulate(tmp_dir.path(), &["--dark-age", "30"]);
    let (stdout, _) = process(&config);

    assert!(stdout.contains("days older"), "{stdout}");
    let rows = only_summary(tmp_dir.path());
    assert!(rows.iter().all(|r| !r.status.starts_with("ERROR")), "{rows:#?}");
    assert!(rows.iter().any(|r| r.recipe == "ccf" && r.status == "OK"));
}

#[test]
fn test_hot_stars_make_transmission_maps() {
    let tmp_dir = TempDir::new().expect("couldn't make tmp dir");
    let config = simulate(tmp_dir.path(), &["--hot-stars", "20"]);
    process(&config);

    let rows = only_summary(tmp_dir.path());
    let mk_tellu: Vec<_> = rows.iter().filter(|r| r.recipe == "mk-tellu").collect();
    assert_eq!(mk_tellu.len(), 20);
    // Only maps that passed quality control are published.
    let n_ok = mk_tellu.iter().filter(|r| r.status == "OK").count();
    assert!(n_ok > 0, "{mk_tellu:#?}");
    let maps = db_kinds(&tmp_dir.path().join("telluDB").join("telluDB.txt"))
        .into_iter()
        .filter(|k| k == "TELL_MAP")
        .count();
    assert_eq!(maps, n_ok);
    let fit: Vec<_> = rows.iter().filter(|r| r.recipe == "fit-tellu").collect();
    assert_eq!(fit.len(), 1);
    assert_eq!(fit[0].status, "OK");
    assert!(reduced_dir(tmp_dir.path())
        .join("2400037o_pp_tcorr_AB.fits")
        .exists());
}

#[test]
fn test_corrupt_frame_is_isolated() {
    let tmp_dir = TempDir::new().expect("couldn't make tmp dir");
    let config = simulate(tmp_dir.path(), &["--corrupt-frame"]);
    process(&config);

    let rows = only_summary(tmp_dir.path());
    let corrupt: Vec<_> = rows.iter().filter(|r| r.status.starts_with("ERROR")).collect();
    assert_eq!(corrupt.len(), 1, "{rows:#?}");
    assert_eq!(corrupt[0].status, "ERROR(CORRUPT_FRAME)");
    assert_eq!(corrupt[0].recipe, "preprocess");
    assert!(corrupt[0].item.contains("2400016a"));

    // The rest of the FP sequence is still used.
    assert!(rows
        .iter()
        .filter(|r| r.recipe == "preprocess" && !r.item.contains("2400016a"))
        .all(|r| r.status == "OK"));
    assert!(rows.iter().filter(|r| r.recipe == "ccf").all(|r| r.status == "OK"));
}

#[test]
fn test_shifted_mask_fails_quality_control() {
    let tmp_dir = TempDir::new().expect("couldn't make tmp dir");
    let config = simulate(tmp_dir.path(), &["--mask-shift", "1000"]);
    process(&config);

    let rows = only_summary(tmp_dir.path());
    let ccf: Vec<_> = rows.iter().filter(|r| r.recipe == "ccf").collect();
    assert_eq!(ccf.len(), 1);
    assert_eq!(ccf[0].status, "QC_FAIL");
    assert!(ccf[0].qc_failed.starts_with("CCF"), "{:?}", ccf[0]);
    // Everything upstream of the CCF is unaffected.
    assert!(rows.iter().all(|r| !r.status.starts_with("ERROR")), "{rows:#?}");

    // Running the recipe on its own is a quality-control failure.
    #[rustfmt::skip]
    let cmd = nirdrs()
        .args([
            "--no-progress-bars",
            "--config", &format!("{}", config.display()),
            "ccf", NIGHT, "2400017o",
        ])
        .ok();
    assert!(cmd.is_err());
    let output = cmd.err().unwrap();
    assert_eq!(output.as_output().unwrap().status.code(), Some(2));
}

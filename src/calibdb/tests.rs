// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::time::Instant;

use tempfile::TempDir;

use super::*;

fn make_db(tmp: &TempDir, fallback_to_closest: bool) -> CalibDb {
    let config = CalibDbConfig {
        fallback_to_closest,
        max_wait: 0.3,
        poll_interval: 0.01,
        ..Default::default()
    };
    CalibDb::new(&tmp.path().join("db"), "calibDB.txt", &config)
}

fn artifact(tmp: &TempDir, name: &str) -> PathBuf {
    let p = tmp.path().join(name);
    std::fs::write(&p, name).unwrap();
    p
}

#[test]
fn test_publish_copies_and_appends() {
    let tmp = TempDir::new().unwrap();
    let db = make_db(&tmp, true);
    let a = artifact(&tmp, "a_pp_dark.fits");
    let entry = db.publish("DARK", "SPECTRO", 60000.5, &a).unwrap();
    assert_eq!(entry.iso_time, "2023-02-25T12:00:00.000");
    assert!(db.dir().join("a_pp_dark.fits").exists());

    let entries = db.entries().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].kind, "DARK");
    assert_eq!(entries[0].mjd, 60000.5);
    assert_eq!(entries[0].line, 1);

    // Publishing an artifact that already lives in the database directory
    // doesn't copy it again.
    let inside = db.dir().join("a_pp_dark.fits");
    db.publish("DARK", "SPECTRO", 60001.5, &inside).unwrap();
    assert_eq!(db.entries().unwrap().len(), 2);

    assert!(matches!(
        db.publish("DARK", "SPECTRO", 60000.5, &tmp.path().join("nope.fits")),
        Err(CalibDbError::ArtifactMissing { .. })
    ));
    assert!(matches!(
        db.publish("DARK FLAT", "SPECTRO", 60000.5, &a),
        Err(CalibDbError::Whitespace(_))
    ));
}

#[test]
fn test_latest_before_never_returns_the_future() {
    let tmp = TempDir::new().unwrap();
    let db = make_db(&tmp, false);
    for (i, mjd) in [60000.0, 60010.0, 60005.0].into_iter().enumerate() {
        let a = artifact(&tmp, &format!("d{i}.fits"));
        db.publish("DARK", "SPECTRO", mjd, &a).unwrap();
    }

    for t in [60000.0, 60004.9, 60005.0, 60009.0, 60100.0] {
        let m = db.latest_before("DARK", "SPECTRO", t).unwrap();
        assert!(m.entry.mjd <= t);
        assert!(!m.fallback);
    }
    assert_eq!(
        db.latest_before("DARK", "SPECTRO", 60007.0).unwrap().entry.basename,
        "d2.fits"
    );
    assert!(matches!(
        db.latest_before("DARK", "SPECTRO", 59999.0),
        Err(CalibDbError::Missing { .. })
    ));
    assert!(matches!(
        db.latest_before("DARK", "POLAR", 60100.0),
        Err(CalibDbError::Missing { .. })
    ));
    assert_eq!(
        db.closest("DARK", "SPECTRO", 60008.0).unwrap().entry.basename,
        "d1.fits"
    );
    assert_eq!(
        db.lookup("DARK", "SPECTRO", 60008.0, LookupPolicy::Older)
            .unwrap()
            .entry
            .basename,
        "d2.fits"
    );
}

#[test]
fn test_fallback_to_closest() {
    let tmp = TempDir::new().unwrap();
    let db = make_db(&tmp, true);
    db.publish("FLAT_AB", "SPECTRO", 60010.0, &artifact(&tmp, "f.fits"))
        .unwrap();
    let m = db.latest_before("FLAT_AB", "SPECTRO", 60000.0).unwrap();
    assert!(m.fallback);
    assert_eq!(m.path, db.dir().join("f.fits"));

    // Nothing of the kind at all is still missing.
    assert!(matches!(
        db.latest_before("BLAZE_AB", "SPECTRO", 60000.0),
        Err(CalibDbError::Missing { .. })
    ));
}

#[test]
fn test_republishing_supersedes() {
    let tmp = TempDir::new().unwrap();
    let db = make_db(&tmp, false);
    db.publish("SHAPE", "SPECTRO", 60000.0, &artifact(&tmp, "s1.fits"))
        .unwrap();
    db.publish("SHAPE", "SPECTRO", 60000.0, &artifact(&tmp, "s2.fits"))
        .unwrap();
    let entries = db.entries().unwrap();
    assert!(entries[0].superseded);
    assert!(!entries[1].superseded);
    assert_eq!(db.current("SHAPE", "SPECTRO").unwrap().len(), 1);
    assert_eq!(
        db.latest_before("SHAPE", "SPECTRO", 60000.0)
            .unwrap()
            .entry
            .basename,
        "s2.fits"
    );
}

#[test]
fn test_published_artifacts_are_never_overwritten() {
    let tmp = TempDir::new().unwrap();
    let db = make_db(&tmp, false);
    for dir in ["a", "b", "c"] {
        std::fs::create_dir_all(tmp.path().join(dir)).unwrap();
    }
    let first = tmp.path().join("a/x_dark.fits");
    std::fs::write(&first, "first night").unwrap();
    let e1 = db.publish("DARK", "SPECTRO", 60000.0, &first).unwrap();
    assert_eq!(e1.basename, "x_dark.fits");

    // Same name, different bytes.
    let second = tmp.path().join("b/x_dark.fits");
    std::fs::write(&second, "second night").unwrap();
    let e2 = db.publish("DARK", "SPECTRO", 60001.0, &second).unwrap();
    assert_eq!(e2.basename, "x_dark_v2.fits");
    assert_eq!(
        std::fs::read_to_string(db.dir().join("x_dark.fits")).unwrap(),
        "first night"
    );
    assert_eq!(
        std::fs::read_to_string(db.dir().join("x_dark_v2.fits")).unwrap(),
        "second night"
    );

    // Identical bytes reuse the stored copy.
    let again = tmp.path().join("c/x_dark.fits");
    std::fs::write(&again, "second night").unwrap();
    let e3 = db.publish("DARK", "SPECTRO", 60002.0, &again).unwrap();
    assert_eq!(e3.basename, "x_dark_v2.fits");
    assert!(!db.dir().join("x_dark_v3.fits").exists());

    let current = db.latest_before("DARK", "SPECTRO", 60000.5).unwrap();
    assert_eq!(
        std::fs::read_to_string(current.path).unwrap(),
        "first night"
    );
}

#[test]
fn test_reader_tolerates_short_and_partial_lines() {
    let tmp = TempDir::new().unwrap();
    let db = make_db(&tmp, false);
    std::fs::create_dir_all(db.dir()).unwrap();
    std::fs::write(
        db.file(),
        "# kind mode basename iso mjd\nDARK SPECTRO d.fits 2023-02-25T00:00:00.000 60000.0\nBROKEN\nDARK SPECTRO e.fits 2023",
    )
    .unwrap();
    let entries = db.entries().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].pid, "-");
    assert_eq!(entries[0].line, 2);
}

#[test]
fn test_busy_database_times_out() {
    let tmp = TempDir::new().unwrap();
    let db = make_db(&tmp, false);
    std::fs::create_dir_all(db.dir()).unwrap();
    let held = LockFile::acquire(
        &db.dir().join("calibDB.txt.lock"),
        Duration::from_secs(1),
        Duration::from_millis(10),
    )
    .unwrap();

    let start = Instant::now();
    let result = db.publish("DARK", "SPECTRO", 60000.0, &artifact(&tmp, "d.fits"));
    assert!(matches!(result, Err(CalibDbError::Busy { .. })));
    assert!(start.elapsed() >= Duration::from_millis(300));
    assert!(db.entries().unwrap().is_empty());

    drop(held);
    db.publish("DARK", "SPECTRO", 60000.0, &artifact(&tmp, "d.fits"))
        .unwrap();
}

#[test]
fn test_stale_lock_is_broken() {
    let tmp = TempDir::new().unwrap();
    let lock_path = tmp.path().join("x.lock");
    std::fs::write(&lock_path, "left behind").unwrap();
    std::thread::sleep(Duration::from_millis(200));

    let lock = LockFile::acquire(
        &lock_path,
        Duration::from_millis(50),
        Duration::from_millis(10),
    )
    .unwrap();
    assert_eq!(lock.path(), lock_path);
    drop(lock);
    assert!(!lock_path.exists());
}

#[test]
fn test_concurrent_publishers_serialise() {
    let tmp = TempDir::new().unwrap();
    let db = make_db(&tmp, false);
    let artifacts: Vec<PathBuf> = (0..8)
        .map(|i| artifact(&tmp, &format!("w{i}.fits")))
        .collect();
    std::thread::scope(|s| {
        for (i, a) in artifacts.iter().enumerate() {
            let db = db.clone();
            s.spawn(move || {
                let mut db = db;
                db.max_wait = Duration::from_secs(10);
                db.publish("WAVE_AB", "SPECTRO", 60000.0 + i as f64, a)
                    .unwrap();
            });
        }
    });
    let entries = db.entries().unwrap();
    assert_eq!(entries.len(), 8);
    assert!(entries.iter().all(|e| !e.superseded));
}

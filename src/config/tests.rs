// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::io::Write;

use indoc::indoc;
use serial_test::serial;
use tempfile::TempDir;

use super::*;

fn write(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    let mut f = std::fs::File::create(&path).unwrap();
    f.write_all(contents.as_bytes()).unwrap();
    path
}

#[test]
fn test_defaults_are_valid() {
    let config = DrsConfig::default();
    config.validate().unwrap();
    assert_eq!(config.calibdb.policy, LookupPolicy::Older);
    assert!(config.calibdb.fallback_to_closest);
    assert_eq!(config.loc.fibre_layout, ["AB", "C"]);
    assert_eq!(config.detector.raw_shape(), (4096, 4096));
    assert_eq!(config.orchestrator.isolation, Isolation::Process);
    assert!(config.telluric.make_templates);
}

#[test]
fn test_partial_files_in_every_format() {
    let tmp = TempDir::new().unwrap();
    let toml = write(
        tmp.path(),
        "a.toml",
        indoc! {r#"
            [detector]
            nx = 512
            ny = 256
            rotation = 1

            [preprocess]
            n_amps = 8

            [calibdb]
            policy = "closest"
        "#},
    );
    let json = write(
        tmp.path(),
        "b.json",
        r#"{"extract": {"method": "tilt"}, "telluric": {"hot_stars": ["HR1", "HR2"]}, "orchestrator": {"isolation": "thread"}, "drift": {"max_error": 5.0}}"#,
    );
    let yaml = write(
        tmp.path(),
        "c.yml",
        indoc! {"
            ccf:
              mask: masks/m.txt
              step: 1.0
        "},
    );

    let c = DrsConfig::from_file(&toml).unwrap();
    assert_eq!((c.detector.ny, c.detector.nx), (256, 512));
    assert_eq!(c.detector.raw_shape(), (512, 256));
    assert_eq!(c.calibdb.policy, LookupPolicy::Closest);
    assert_eq!(c.loc.median_window, 51);
    // 256 raw columns split into 8 amplifiers.
    c.validate().unwrap();
    assert_eq!(c.paths.raw, tmp.path().join("data/raw"));

    let c = DrsConfig::from_file(&json).unwrap();
    assert_eq!(c.extract.method, ExtractMethod::Tilt);
    assert_eq!(c.telluric.hot_stars, ["HR1", "HR2"]);
    assert_eq!(c.orchestrator.isolation, Isolation::Thread);
    assert_eq!(c.drift.max_error, 5.0);
    assert_eq!(c.drift.box_size, 12);

    let c = DrsConfig::from_file(&yaml).unwrap();
    assert_eq!(c.ccf.step, 1.0);
    assert_eq!(c.paths.asset(&c.ccf.mask), tmp.path().join("assets/masks/m.txt"));
}

#[test]
fn test_bad_files() {
    let tmp = TempDir::new().unwrap();
    let unknown_field = write(tmp.path(), "a.toml", "[detector]\nnz = 5\n");
    assert!(matches!(
        DrsConfig::from_file(&unknown_field),
        Err(ConfigError::Parse {
            file_type: ConfigFileType::Toml,
            ..
        })
    ));

    let ext = write(tmp.path(), "a.ini", "");
    assert!(matches!(
        DrsConfig::from_file(&ext),
        Err(ConfigError::UnknownExtension { .. })
    ));

    assert!(matches!(
        DrsConfig::from_file(&tmp.path().join("missing.toml")),
        Err(ConfigError::Io { .. })
    ));
}

#[test]
fn test_validation() {
    let mut c = DrsConfig::default();
    c.preprocess.n_amps = 3;
    assert!(matches!(c.validate(), Err(ConfigError::Invalid(_))));

    let mut c = DrsConfig::default();
    c.wave.poly_deg = 0;
    assert!(matches!(c.validate(), Err(ConfigError::Invalid(_))));

    let mut c = DrsConfig::default();
    c.loc.fibre_layout.clear();
    assert!(matches!(c.validate(), Err(ConfigError::Missing(_))));

    let mut c = DrsConfig::default();
    c.telluric.science_bounds.water = (2.0, 1.0);
    assert!(matches!(c.validate(), Err(ConfigError::Invalid(_))));

    let mut c = DrsConfig::default();
    c.drift.cosmic_cut = 0.0;
    assert!(matches!(c.validate(), Err(ConfigError::Invalid(_))));

    let mut c = DrsConfig::default();
    c.telluric.template_min_frames = 0;
    assert!(matches!(c.validate(), Err(ConfigError::Invalid(_))));

    let c = DrsConfig::default();
    c.check_mode("SPECTRO").unwrap();
    assert!(matches!(
        c.check_mode("IMAGING"),
        Err(ConfigError::UnknownMode { .. })
    ));
}

#[test]
#[serial]
fn test_env_overrides() {
    let tmp = TempDir::new().unwrap();
    let file = write(tmp.path(), "nirdrs.toml", "[paths]\nraw = \"rawdata\"\n");

    std::env::set_var("DRS_UCONFIG", tmp.path());
    std::env::set_var("DRS_DATA_REDUC", "/elsewhere/reduced");
    let result = DrsConfig::load(None);
    std::env::remove_var("DRS_UCONFIG");
    std::env::remove_var("DRS_DATA_REDUC");

    let c = result.unwrap();
    assert_eq!(c.paths.raw, tmp.path().join("rawdata"));
    assert_eq!(c.paths.reduced, PathBuf::from("/elsewhere/reduced"));

    // An explicit file wins over DRS_UCONFIG.
    let c = DrsConfig::load(Some(&file)).unwrap();
    assert_eq!(c.paths.raw, tmp.path().join("rawdata"));
}

#[test]
#[serial]
fn test_uconfig_dir_without_a_file() {
    let tmp = TempDir::new().unwrap();
    std::env::set_var("DRS_UCONFIG", tmp.path());
    let result = DrsConfig::load(None);
    std::env::remove_var("DRS_UCONFIG");
    assert!(matches!(result, Err(ConfigError::NotFound { .. })));
}

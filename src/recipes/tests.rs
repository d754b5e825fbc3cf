// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{path::PathBuf, str::FromStr};

use strum::IntoEnumIterator;

use super::{provenance::calib_key, *};
use crate::{
    calibdb::LockError,
    dprtype::FibreState,
    io::header::Header,
};

#[test]
fn test_every_kind_is_registered() {
    for kind in RecipeKind::iter() {
        assert_eq!(kind.spec().kind, kind);
        assert!(!kind.spec().about.is_empty());
        assert!(!kind.spec().inputs.is_empty(), "{kind} has no inputs");
    }
    assert_eq!(RECIPES.len(), RecipeKind::iter().count());
}

#[test]
fn test_ranks_follow_the_calibration_chain() {
    let ranks: Vec<usize> = RECIPES.values().map(|s| s.rank).collect();
    assert!(ranks.windows(2).all(|w| w[0] < w[1]), "{ranks:?}");
    // Whatever a recipe requires is published by a recipe ranked below it.
    for spec in RECIPES.values() {
        for kind in spec.requires {
            let producer = RECIPES
                .values()
                .find(|s| s.publishes.contains(kind))
                .unwrap_or_else(|| panic!("nothing publishes {kind}"));
            assert!(producer.rank < spec.rank, "{} needs {kind}", spec.kind);
        }
    }
}

#[test]
fn test_recipe_names() {
    assert_eq!(RecipeKind::MkTellu.to_string(), "mk-tellu");
    assert_eq!(RecipeKind::from_str("fit-tellu").unwrap(), RecipeKind::FitTellu);
    assert_eq!(RecipeKind::WaveMaster.to_string(), "wave-master");
    assert_eq!(RecipeKind::from_str("mk-template").unwrap(), RecipeKind::MkTemplate);
    assert_eq!(
        serde_json::to_string(&RecipeKind::MkTemplate).unwrap(),
        "\"mk-template\""
    );
    assert!(RecipeKind::from_str("mktellu").is_err());
}

#[test]
fn test_accepts() {
    let dark = DprType::DARK_DARK;
    let obj = DprType::new(FibreState::Obj, FibreState::Fp);
    assert!(Accepts::Any.allows(dark));
    assert!(Accepts::Types(DARKS).allows(dark));
    assert!(!Accepts::Types(FLATS).allows(dark));
    assert!(Accepts::Science.allows(obj));
    assert!(!Accepts::Science.allows(dark));
}

#[test]
fn test_inputs() {
    let inputs = RecipeInputs::pair(vec![PathBuf::from("a")], vec![]);
    assert_eq!(inputs.role(0).len(), 1);
    assert!(inputs.role(1).is_empty());
    assert!(inputs.role(7).is_empty());
    assert_eq!(inputs.all().count(), 1);
}

#[test]
fn test_calib_keys_fit_in_a_card() {
    assert_eq!(calib_key("DARK"), "CDBDRK");
    assert_eq!(calib_key("WAVE_AB"), "CDBWAVAB");
    assert_eq!(calib_key("LOC_C"), "CDBLOCC");
    assert_eq!(calib_key("BKGRD_MAP"), "CDBBKG");
    assert_eq!(calib_key("TELL_MAP"), "CDBTEL");
    assert_eq!(calib_key("Lamp-Stuff_B"), "CDBLAMB");
    assert_eq!(calib_key("FP_REF_AB"), "CDBFPRAB");
    assert_eq!(calib_key(&kinds::template("Gl 699")), "CDBTMP");
    for spec in RECIPES.values() {
        for kind in spec.requires.iter().chain(spec.optional).chain(spec.publishes) {
            let kind = kind.replace("{FIBER}", "AB").replace("{OBJECT}", "GL699");
            assert!(calib_key(&kind).len() <= 8, "{kind}");
        }
    }
}

#[test]
fn test_object_kinds() {
    assert_eq!(kinds::sanitise_object(" Gl 699-b "), "GL699B");
    assert_eq!(kinds::template("Gl 699"), "TELL_TEMP_GL699");
    assert_eq!(kinds::fp_ref("C"), "FP_REF_C");
}

#[test]
fn test_provenance_replaces_old_provenance() {
    let mut base = Header::new();
    base.set("OBJECT", "Gl 699");
    base.set("INF1001", "old_input");
    base.set("INF1002", "another_old_input");
    base.set("CDBDRK", "old_dark.fits");
    base.set("QCC001N", "OLD_CHECK");

    let mut prov = Provenance::new(RecipeKind::Extract);
    prov.add_input("2466000o");
    prov.add_input("2466000o");
    prov.add_calibration("DARK", "2465999d_pp_dark.fits");
    assert_eq!(prov.inputs(), ["2466000o"]);
    assert_eq!(prov.calibrations().count(), 1);

    let header = prov.header(&base);
    assert_eq!(header.get_str("OBJECT").unwrap(), "Gl 699");
    assert_eq!(header.get_str("RECIPE").unwrap(), "extract");
    assert_eq!(header.get_str("INF1001").unwrap(), "2466000o");
    assert!(header.get("INF1002").is_none());
    assert!(header.get("QCC001N").is_none());
    assert_eq!(header.get_str("CDBDRK").unwrap(), "2465999d_pp_dark.fits");
    assert_eq!(header.get_str("VERSION").unwrap(), env!("CARGO_PKG_VERSION"));
}

#[test]
fn test_error_classes() {
    let missing = RecipeError::CalibDb(CalibDbError::Missing {
        kind: "DARK".to_string(),
        mode: "SPECTRO".to_string(),
        mjd: 60000.0,
    });
    assert_eq!(missing.classify(), ErrorClass::CalibMissing);

    let busy = RecipeError::CalibDb(CalibDbError::Busy {
        dir: PathBuf::from("calibdb"),
        source: LockError::Timeout {
            path: PathBuf::from("calibdb/lock"),
            waited: 1.0,
        },
    });
    assert_eq!(busy.classify(), ErrorClass::LockTimeout);

    let no_input = RecipeError::Store(StoreError::InputNotFound {
        path: PathBuf::from("nope.fits"),
    });
    assert_eq!(no_input.classify(), ErrorClass::InputNotFound);

    let wrong = RecipeError::WrongType {
        file: PathBuf::from("f.fits"),
        recipe: RecipeKind::Dark,
        role: "files",
        got: DprType::FLAT_FLAT,
    };
    assert_eq!(wrong.classify(), ErrorClass::User);
    assert!(wrong.to_string().contains("FLAT_FLAT"));

    let ccf = RecipeError::Ccf(CcfError::NotConverged {
        reason: "flat".to_string(),
        at_edge: false,
    });
    assert_eq!(ccf.classify(), ErrorClass::Convergence);

    let reference = RecipeError::Wave(WaveError::ReferenceMismatch {
        reference: 2,
        spectrum: 3,
    });
    assert_eq!(reference.classify(), ErrorClass::User);

    let shape = RecipeError::StackShape {
        first: (4, 4),
        other: (4, 5),
    };
    assert_eq!(shape.classify(), ErrorClass::CorruptFrame);

    let io = RecipeError::Io {
        path: PathBuf::from("x"),
        source: std::io::Error::new(std::io::ErrorKind::Other, "disk on fire"),
    };
    assert_eq!(io.classify(), ErrorClass::Fatal);
    assert_eq!(ErrorClass::CalibMissing.to_string(), "CALIB_MISSING");
}

#[test]
fn test_outcome_merge() {
    let mut a = RecipeOutcome::default();
    a.outputs.push(PathBuf::from("a.fits"));
    a.qc.check_max("X", 1.0, 2.0);
    let mut b = RecipeOutcome::default();
    b.outputs.push(PathBuf::from("b.fits"));
    b.qc.check_max("Y", 3.0, 2.0);
    assert!(a.passed());
    a.merge(b);
    assert_eq!(a.outputs.len(), 2);
    assert!(!a.passed());
}

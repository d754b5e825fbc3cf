// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Provenance keywords carried by every product.

use indexmap::IndexMap;

use super::RecipeKind;
use crate::{
    io::header::Header,
    misc::{drs_pid, now_iso},
};

/// Keys that describe how a product was made. A product built from another
/// product's header mustn't inherit them.
const PROVENANCE_PREFIXES: &[&str] = &["QCC", "INF1", "CDB"];

#[derive(Debug, Clone)]
pub(crate) struct Provenance {
    recipe: RecipeKind,
    inputs: Vec<String>,
    /// Calibration kind to artifact basename.
    calibrations: IndexMap<String, String>,
}

impl Provenance {
    pub(crate) fn new(recipe: RecipeKind) -> Provenance {
        Provenance {
            recipe,
            inputs: vec![],
            calibrations: IndexMap::new(),
        }
    }

    pub(crate) fn add_input(&mut self, basename: &str) {
        if !self.inputs.iter().any(|i| i == basename) {
            self.inputs.push(basename.to_string());
        }
    }

    pub(crate) fn add_calibration(&mut self, kind: &str, basename: &str) {
        self.calibrations
            .insert(kind.to_string(), basename.to_string());
    }

    pub(crate) fn inputs(&self) -> &[String] {
        &self.inputs
    }

    pub(crate) fn calibrations(&self) -> impl Iterator<Item = (&String, &String)> {
        self.calibrations.iter()
    }

    /// A product header: `base` without any old provenance, then this
    /// provenance.
    pub(crate) fn header(&self, base: &Header) -> Header {
        let mut header = base.clone();
        let stale: Vec<String> = header
            .iter()
            .map(|(k, _)| k.clone())
            .filter(|k| PROVENANCE_PREFIXES.iter().any(|p| k.starts_with(p)))
            .collect();
        for key in stale {
            header.remove(&key);
        }
        self.write_header(&mut header);
        header
    }

    pub(crate) fn write_header(&self, header: &mut Header) {
        header.set("RECIPE", self.recipe.to_string());
        header.set("VERSION", env!("CARGO_PKG_VERSION"));
        header.set("DRSPID", drs_pid());
        header.set("DRSDATE", now_iso());
        for (i, input) in self.inputs.iter().enumerate() {
            header.set(&format!("INF1{:03}", i + 1), input.as_str());
        }
        for (kind, basename) in &self.calibrations {
            header.set(&calib_key(kind), basename.as_str());
        }
    }
}

/// The header key recording which artifact of a calibration kind was used.
/// FITS keys hold 8 characters, so the kind is abbreviated: `CDB`, a code for
/// the kind and the fibre group (e.g. `WAVE_AB` is `CDBWAVAB`).
pub(crate) fn calib_key(kind: &str) -> String {
    let (base, fibre) = match kind {
        "BKGRD_MAP" => ("BKG", ""),
        "TELL_MAP" => ("TEL", ""),
        _ if kind.starts_with("TELL_TEMP_") => ("TMP", ""),
        _ => match kind.strip_prefix("FP_REF_") {
            Some(fibre) => ("FPR", fibre),
            None => kind.split_once('_').unwrap_or((kind, "")),
        },
    };
    let code: String = match base {
        "DARK" => "DRK".to_string(),
        "BADPIX" => "BAD".to_string(),
        "LOC" => "LOC".to_string(),
        "SHAPE" => "SHP".to_string(),
        "FLAT" => "FLT".to_string(),
        "BLAZE" => "BLZ".to_string(),
        "THERMAL" => "THM".to_string(),
        "WAVE" => "WAV".to_string(),
        other => other
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .take(3)
            .collect(),
    };
    let mut key = format!("CDB{code}{fibre}").to_ascii_uppercase();
    key.truncate(8);
    key
}

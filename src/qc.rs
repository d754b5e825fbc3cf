// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Quality-control results. These are data, never errors: a recipe whose QC
//! fails still writes its products.

use serde::{Deserialize, Serialize};

use crate::io::header::Header;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct QcCheck {
    pub(crate) name: String,
    pub(crate) value: f64,
    /// The condition that passes, e.g. "DADEAD <= 0.05".
    pub(crate) logic: String,
    pub(crate) passed: bool,
    /// Informational checks are recorded but don't fail the recipe.
    pub(crate) blocking: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct QcResult {
    pub(crate) checks: Vec<QcCheck>,
}

impl QcResult {
    pub(crate) fn new() -> QcResult {
        QcResult::default()
    }

    fn push(&mut self, name: &str, value: f64, logic: String, passed: bool, blocking: bool) {
        self.checks.push(QcCheck {
            name: name.to_string(),
            value,
            logic,
            passed,
            blocking,
        });
    }

    /// Pass when `value <= max`. NaN fails.
    pub(crate) fn check_max(&mut self, name: &str, value: f64, max: f64) -> bool {
        let passed = value <= max;
        self.push(name, value, format!("{name} <= {max}"), passed, true);
        passed
    }

    /// Pass when `value >= min`. NaN fails.
    pub(crate) fn check_min(&mut self, name: &str, value: f64, min: f64) -> bool {
        let passed = value >= min;
        self.push(name, value, format!("{name} >= {min}"), passed, true);
        passed
    }

    pub(crate) fn check(&mut self, name: &str, value: f64, logic: &str, passed: bool) -> bool {
        self.push(name, value, logic.to_string(), passed, true);
        passed
    }

    /// A non-blocking check.
    pub(crate) fn inform(&mut self, name: &str, value: f64, logic: &str, passed: bool) {
        self.push(name, value, logic.to_string(), passed, false);
    }

    /// Did every blocking check pass?
    pub(crate) fn passed(&self) -> bool {
        self.checks.iter().all(|c| c.passed || !c.blocking)
    }

    /// The names of every check that failed, blocking or not.
    pub(crate) fn failed_names(&self) -> Vec<String> {
        self.checks
            .iter()
            .filter(|c| !c.passed)
            .map(|c| c.name.clone())
            .collect()
    }

    pub(crate) fn merge(&mut self, other: QcResult) {
        self.checks.extend(other.checks);
    }

    /// Record every check as QCC{n:03}N/V/L/P and the overall result as
    /// QCC_ALL.
    pub(crate) fn write_header(&self, header: &mut Header) {
        for (i, c) in self.checks.iter().enumerate() {
            let n = i + 1;
            header.set(&format!("QCC{n:03}N"), c.name.as_str());
            header.set(&format!("QCC{n:03}V"), c.value);
            header.set(&format!("QCC{n:03}L"), c.logic.as_str());
            header.set(&format!("QCC{n:03}P"), i64::from(c.passed));
        }
        header.set("QCC_ALL", i64::from(self.passed()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocking_and_informational() {
        let mut qc = QcResult::new();
        assert!(qc.check_max("DADEAD", 0.01, 0.05));
        assert!(!qc.check_min("SNR", f64::NAN, 10.0));
        qc.inform("TELLU_PCA", 3.0, "NMAPS >= 6", false);
        assert!(!qc.passed());
        assert_eq!(qc.failed_names(), ["SNR", "TELLU_PCA"]);

        let mut qc = QcResult::new();
        qc.inform("TELLU_PCA", 3.0, "NMAPS >= 6", false);
        assert!(qc.passed());
    }

    #[test]
    fn test_header_cards() {
        let mut qc = QcResult::new();
        qc.check_max("DAMED", 0.5, 1.0);
        qc.check_max("DADEAD", 0.2, 0.05);
        let mut h = Header::new();
        qc.write_header(&mut h);
        assert_eq!(h.get_str("QCC001N").unwrap(), "DAMED");
        assert_eq!(h.get_float("QCC002V").unwrap(), 0.2);
        assert_eq!(h.get_str("QCC002L").unwrap(), "DADEAD <= 0.05");
        assert_eq!(h.get_int("QCC001P").unwrap(), 1);
        assert_eq!(h.get_int("QCC002P").unwrap(), 0);
        assert_eq!(h.get_int("QCC_ALL").unwrap(), 0);
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Data-product types: what illuminates the science and reference fibres.

use std::{fmt::Display, str::FromStr};

use serde::{Deserialize, Serialize};
use strum_macros::{Display as StrumDisplay, EnumIter, EnumString};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub(crate) enum DprTypeError {
    #[error("'{0}' is not a fibre illumination (expected one of DARK, FLAT, FP, HC, OBJ, SKY, POLAR)")]
    UnknownState(String),

    #[error("'{0}' is not a DPRTYPE of the form SCI_REF")]
    BadFormat(String),
}

#[derive(
    Debug,
    StrumDisplay,
    EnumIter,
    EnumString,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
pub(crate) enum FibreState {
    Dark,
    Flat,
    Fp,
    Hc,
    Obj,
    Sky,
    Polar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub(crate) struct DprType {
    pub(crate) sci: FibreState,
    pub(crate) reference: FibreState,
}

impl DprType {
    pub(crate) const DARK_DARK: DprType = DprType::new(FibreState::Dark, FibreState::Dark);
    pub(crate) const FLAT_FLAT: DprType = DprType::new(FibreState::Flat, FibreState::Flat);
    pub(crate) const FP_FP: DprType = DprType::new(FibreState::Fp, FibreState::Fp);
    pub(crate) const HC_HC: DprType = DprType::new(FibreState::Hc, FibreState::Hc);

    pub(crate) const fn new(sci: FibreState, reference: FibreState) -> DprType {
        DprType { sci, reference }
    }

    /// Derive the type from the science and reference fibre keywords. A
    /// science fibre on a star becomes POLAR in polarimetric mode.
    pub(crate) fn from_fibres(sci: &str, reference: &str, mode: &str) -> Result<DprType, DprTypeError> {
        let parse = |s: &str| {
            FibreState::from_str(s.trim()).map_err(|_| DprTypeError::UnknownState(s.to_string()))
        };
        let mut sci = parse(sci)?;
        let reference = parse(reference)?;
        if sci == FibreState::Obj && mode.eq_ignore_ascii_case("POLAR") {
            sci = FibreState::Polar;
        }
        Ok(DprType { sci, reference })
    }

    /// One of the calibration sequence types.
    pub(crate) fn is_calibration(&self) -> bool {
        use FibreState::*;
        matches!(
            (self.sci, self.reference),
            (Dark, Dark)
                | (Flat, Flat)
                | (Fp, Fp)
                | (Hc, Hc)
                | (Hc, Fp)
                | (Fp, Hc)
                | (Dark, Flat)
                | (Flat, Dark)
        )
    }

    /// A star (or the sky) is on the science fibre.
    pub(crate) fn is_science(&self) -> bool {
        matches!(
            self.sci,
            FibreState::Obj | FibreState::Polar | FibreState::Sky
        )
    }
}

impl Display for DprType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}", self.sci, self.reference)
    }
}

impl FromStr for DprType {
    type Err = DprTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (sci, reference) = s
            .trim()
            .split_once('_')
            .ok_or_else(|| DprTypeError::BadFormat(s.to_string()))?;
        let parse = |p: &str| {
            FibreState::from_str(p).map_err(|_| DprTypeError::UnknownState(p.to_string()))
        };
        Ok(DprType {
            sci: parse(sci)?,
            reference: parse(reference)?,
        })
    }
}

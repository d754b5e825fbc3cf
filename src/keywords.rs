// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Logical header keywords and the instrument keys they map to.

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter};

use crate::io::header::{Header, HeaderError};

/// MJDs outside this range can't be real acquisition times.
const MJD_RANGE: (f64, f64) = (40000.0, 100000.0);

#[derive(Debug, Display, EnumIter, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Keyword {
    /// Acquisition time \[MJD\].
    Mjd,
    /// Measured exposure time \[s\].
    ExpTime,
    /// Requested exposure time \[s\].
    ExpRequested,
    /// Exposure index within its sequence, starting at 1.
    SeqIndex,
    SeqTotal,
    ObsType,
    SciFibre,
    RefFibre,
    Object,
    Airmass,
    Mode,
    Rhomb1,
    Rhomb2,
    /// Barycentric Earth radial velocity \[km/s\].
    Berv,
}

/// The header key used for every [`Keyword`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct KeywordSet {
    pub(crate) mjd: String,
    pub(crate) exptime: String,
    pub(crate) exp_requested: String,
    pub(crate) seq_index: String,
    pub(crate) seq_total: String,
    pub(crate) obstype: String,
    pub(crate) sci_fibre: String,
    pub(crate) ref_fibre: String,
    pub(crate) object: String,
    pub(crate) airmass: String,
    pub(crate) mode: String,
    pub(crate) rhomb1: String,
    pub(crate) rhomb2: String,
    pub(crate) berv: String,
}

impl Default for KeywordSet {
    fn default() -> Self {
        Self {
            mjd: "MJD-OBS".to_string(),
            exptime: "EXPTIME".to_string(),
            exp_requested: "EXPREQ".to_string(),
            seq_index: "CMPLTEXP".to_string(),
            seq_total: "NEXP".to_string(),
            obstype: "OBSTYPE".to_string(),
            sci_fibre: "SCIFIB".to_string(),
            ref_fibre: "REFFIB".to_string(),
            object: "OBJECT".to_string(),
            airmass: "AIRMASS".to_string(),
            mode: "INSMODE".to_string(),
            rhomb1: "RHOMB1".to_string(),
            rhomb2: "RHOMB2".to_string(),
            berv: "BERV".to_string(),
        }
    }
}

impl KeywordSet {
    pub(crate) fn key(&self, kw: Keyword) -> &str {
        match kw {
            Keyword::Mjd => &self.mjd,
            Keyword::ExpTime => &self.exptime,
            Keyword::ExpRequested => &self.exp_requested,
            Keyword::SeqIndex => &self.seq_index,
            Keyword::SeqTotal => &self.seq_total,
            Keyword::ObsType => &self.obstype,
            Keyword::SciFibre => &self.sci_fibre,
            Keyword::RefFibre => &self.ref_fibre,
            Keyword::Object => &self.object,
            Keyword::Airmass => &self.airmass,
            Keyword::Mode => &self.mode,
            Keyword::Rhomb1 => &self.rhomb1,
            Keyword::Rhomb2 => &self.rhomb2,
            Keyword::Berv => &self.berv,
        }
    }

    pub(crate) fn get_float(&self, header: &Header, kw: Keyword) -> Result<f64, HeaderError> {
        header.get_float(self.key(kw))
    }

    pub(crate) fn get_int(&self, header: &Header, kw: Keyword) -> Result<i64, HeaderError> {
        header.get_int(self.key(kw))
    }

    pub(crate) fn get_str(&self, header: &Header, kw: Keyword) -> Result<String, HeaderError> {
        header.get_str(self.key(kw)).map(|s| s.trim().to_string())
    }

    /// The acquisition time, checked to be a plausible MJD.
    pub(crate) fn get_mjd(&self, header: &Header) -> Result<f64, HeaderError> {
        let key = self.key(Keyword::Mjd);
        let mjd = header.get_float(key)?;
        if !mjd.is_finite() || mjd < MJD_RANGE.0 || mjd > MJD_RANGE.1 {
            return Err(HeaderError::Range {
                key: key.to_string(),
                value: mjd.to_string(),
                reason: "not a plausible MJD",
            });
        }
        Ok(mjd)
    }

    /// Like [`KeywordSet::get_float`], but a missing key gives `default`.
    pub(crate) fn get_float_or(
        &self,
        header: &Header,
        kw: Keyword,
        default: f64,
    ) -> Result<f64, HeaderError> {
        Ok(header.get_float_opt(self.key(kw))?.unwrap_or(default))
    }
}

#[cfg(test)]
mod tests {
    use strum::IntoEnumIterator;

    use super::*;

    #[test]
    fn test_every_keyword_fits_in_a_card() {
        let ks = KeywordSet::default();
        for kw in Keyword::iter() {
            assert!(ks.key(kw).len() <= 8, "{kw}");
        }
    }

    #[test]
    fn test_typed_access() {
        let ks = KeywordSet {
            object: "OBJNAME".to_string(),
            ..Default::default()
        };
        let mut h = Header::new();
        h.set("MJD-OBS", 60000.25);
        h.set("OBJNAME", " Gl699 ");
        h.set("NEXP", 4);

        assert_eq!(ks.get_mjd(&h).unwrap(), 60000.25);
        assert_eq!(ks.get_str(&h, Keyword::Object).unwrap(), "Gl699");
        assert_eq!(ks.get_int(&h, Keyword::SeqTotal).unwrap(), 4);
        assert_eq!(ks.get_float_or(&h, Keyword::Airmass, 1.0).unwrap(), 1.0);
        assert!(ks.get_float(&h, Keyword::Airmass).is_err());

        h.set("MJD-OBS", 12.0);
        assert!(matches!(ks.get_mjd(&h), Err(HeaderError::Range { .. })));
    }
}

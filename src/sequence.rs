// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Group a night's exposures into sequences.
//!
//! Every raw header carries the exposure's index within its sequence and the
//! sequence length. A sequence closes when the index reaches the total, or
//! early when a later exposure starts again from 1.

use itertools::Itertools;
use log::{debug, warn};
use thiserror::Error;

use crate::{dprtype::DprType, io::store::RawFrame};

#[derive(Error, Debug, Clone, PartialEq)]
pub(crate) enum SequenceError {
    #[error("Sequence starting at {first} mixes exposure types: {types}")]
    TypeMismatch { first: String, types: String },
}

#[derive(Debug, Clone)]
pub(crate) struct Sequence {
    pub(crate) dprtype: DprType,
    pub(crate) frames: Vec<RawFrame>,
    /// Closed before its index reached its total.
    pub(crate) truncated: bool,
}

impl Sequence {
    /// Sequences are named after their first exposure.
    pub(crate) fn id(&self) -> &str {
        self.frames
            .first()
            .map(|f| f.basename.as_str())
            .unwrap_or("")
    }

    /// The acquisition time of the sequence (its last exposure).
    pub(crate) fn mjd(&self) -> f64 {
        self.frames.last().map(|f| f.mjd).unwrap_or(f64::NAN)
    }
}

#[derive(Debug, Default)]
pub(crate) struct Classification {
    pub(crate) sequences: Vec<Sequence>,
    pub(crate) rejected: Vec<SequenceError>,
    pub(crate) aborted: Vec<RawFrame>,
}

fn close(frames: Vec<RawFrame>, truncated: bool, out: &mut Classification) {
    let Some(first) = frames.first() else {
        return;
    };
    let types: Vec<DprType> = frames.iter().map(|f| f.dprtype).unique().collect();
    if types.len() > 1 {
        let e = SequenceError::TypeMismatch {
            first: first.basename.clone(),
            types: types.iter().join(", "),
        };
        warn!("{e}");
        out.rejected.push(e);
        return;
    }
    debug!(
        "Closed {} sequence {} with {} exposures{}",
        types[0],
        first.basename,
        frames.len(),
        if truncated { " (truncated)" } else { "" }
    );
    out.sequences.push(Sequence {
        dprtype: types[0],
        frames,
        truncated,
    });
}

/// Classify exposures into sequences. `frames` must be sorted by acquisition
/// time. Exposures that got less than `abort_fraction` of their requested
/// exposure time are set aside first.
pub(crate) fn classify(frames: &[RawFrame], abort_fraction: f64) -> Classification {
    let mut out = Classification::default();
    let mut current: Vec<RawFrame> = vec![];

    for frame in frames {
        if frame.is_aborted(abort_fraction) {
            warn!(
                "{} was aborted ({:.1} s of {:.1} s); ignoring it",
                frame.basename, frame.exptime, frame.exp_requested
            );
            out.aborted.push(frame.clone());
            continue;
        }

        if let Some(last) = current.last() {
            if frame.seq_index <= 1 || frame.seq_index <= last.seq_index {
                warn!(
                    "{} restarts the sequence index; closing the sequence started by {} after {} of {} exposures",
                    frame.basename,
                    current[0].basename,
                    current.len(),
                    last.seq_total
                );
                close(std::mem::take(&mut current), true, &mut out);
            }
        }

        current.push(frame.clone());
        if frame.seq_index >= frame.seq_total {
            close(std::mem::take(&mut current), false, &mut out);
        }
    }

    if let Some(first) = current.first() {
        warn!(
            "The sequence started by {} is incomplete at the end of the night",
            first.basename
        );
        close(current, true, &mut out);
    }
    out
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::{io::header::Header, keywords::KeywordSet};

    fn frame(name: &str, mjd: f64, index: i64, total: i64, sci: &str, reference: &str) -> RawFrame {
        let mut h = Header::new();
        h.set("MJD-OBS", mjd);
        h.set("EXPTIME", 10.0);
        h.set("EXPREQ", 10.0);
        h.set("CMPLTEXP", index);
        h.set("NEXP", total);
        h.set("OBSTYPE", "DARK");
        h.set("SCIFIB", sci);
        h.set("REFFIB", reference);
        RawFrame::from_header(
            "n",
            Path::new(&format!("{name}.fits")),
            h,
            &KeywordSet::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_complete_sequences() {
        let frames: Vec<RawFrame> = (1..=3)
            .map(|i| frame(&format!("d{i}"), 60000.0 + i as f64 * 0.01, i, 3, "DARK", "DARK"))
            .chain((1..=2).map(|i| frame(&format!("f{i}"), 60000.1 + i as f64 * 0.01, i, 2, "FLAT", "FLAT")))
            .collect();
        let c = classify(&frames, 0.9);
        assert_eq!(c.sequences.len(), 2);
        assert_eq!(c.sequences[0].dprtype, DprType::DARK_DARK);
        assert_eq!(c.sequences[0].frames.len(), 3);
        assert!(!c.sequences[0].truncated);
        assert_eq!(c.sequences[1].id(), "f1");
    }

    #[test]
    fn test_index_restart_truncates() {
        // 5 darks whose index restarts after the 3rd.
        let frames: Vec<RawFrame> = [1, 2, 3, 1, 2]
            .iter()
            .enumerate()
            .map(|(n, &i)| {
                let total = if n < 3 { 5 } else { 2 };
                frame(&format!("d{n}"), 60000.0 + n as f64 * 0.01, i, total, "DARK", "DARK")
            })
            .collect();
        let c = classify(&frames, 0.9);
        let lengths: Vec<usize> = c.sequences.iter().map(|s| s.frames.len()).collect();
        assert_eq!(lengths, [3, 2]);
        assert!(c.sequences[0].truncated);
        assert!(!c.sequences[1].truncated);
    }

    #[test]
    fn test_mixed_types_are_rejected() {
        let frames = vec![
            frame("a", 60000.0, 1, 2, "FP", "FP"),
            frame("b", 60000.01, 2, 2, "HC", "HC"),
            frame("c", 60000.02, 1, 1, "OBJ", "FP"),
        ];
        let c = classify(&frames, 0.9);
        assert_eq!(c.rejected.len(), 1);
        assert!(matches!(&c.rejected[0], SequenceError::TypeMismatch { first, .. } if first == "a"));
        assert_eq!(c.sequences.len(), 1);
        assert_eq!(c.sequences[0].dprtype.to_string(), "OBJ_FP");
    }

    #[test]
    fn test_aborted_exposures_are_excluded() {
        let mut short = frame("b", 60000.01, 2, 3, "DARK", "DARK");
        short.exptime = 1.0;
        let frames = vec![
            frame("a", 60000.0, 1, 3, "DARK", "DARK"),
            short,
            frame("c", 60000.02, 3, 3, "DARK", "DARK"),
        ];
        let c = classify(&frames, 0.9);
        assert_eq!(c.aborted.len(), 1);
        assert_eq!(c.sequences.len(), 1);
        assert_eq!(c.sequences[0].frames.len(), 2);
    }

    #[test]
    fn test_incomplete_at_end_of_night() {
        let frames = vec![
            frame("a", 60000.0, 1, 4, "FP", "FP"),
            frame("b", 60000.01, 2, 4, "FP", "FP"),
        ];
        let c = classify(&frames, 0.9);
        assert_eq!(c.sequences.len(), 1);
        assert!(c.sequences[0].truncated);
    }
}

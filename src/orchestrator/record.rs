// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! What happened to every work item: run records, the per-run summary table
//! and the markers that let a re-run skip finished work.

use std::{
    fs::File,
    io::Write,
    path::{Path, PathBuf},
    time::UNIX_EPOCH,
};

use log::{debug, trace};
use serde::{Deserialize, Serialize};
use strum_macros::Display;

use crate::recipes::{ErrorClass, RecipeKind};

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub(crate) enum ItemStatus {
    #[strum(serialize = "OK")]
    Ok,
    #[strum(serialize = "QC_FAIL")]
    QcFail,
    #[strum(serialize = "ERROR")]
    Error,
    #[strum(serialize = "SKIPPED")]
    Skipped,
}

/// Worker processes hand their record back to the orchestrator as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct RunRecord {
    pub(crate) item: String,
    pub(crate) recipe: RecipeKind,
    pub(crate) status: ItemStatus,
    /// Set for errors.
    pub(crate) class: Option<ErrorClass>,
    /// The names of the failed QC checks.
    pub(crate) qc_failed: Vec<String>,
    pub(crate) message: String,
    pub(crate) outputs: Vec<PathBuf>,
    pub(crate) n_published: usize,
    /// The process that ran the item.
    pub(crate) pid: String,
    /// \[s\]
    pub(crate) duration: f64,
    /// Skipped because an earlier run finished it.
    pub(crate) already_done: bool,
}

impl RunRecord {
    pub(crate) fn new(item: &str, recipe: RecipeKind, status: ItemStatus) -> RunRecord {
        RunRecord {
            item: item.to_string(),
            recipe,
            status,
            class: None,
            qc_failed: vec![],
            message: String::new(),
            outputs: vec![],
            n_published: 0,
            pid: crate::misc::drs_pid().to_string(),
            duration: 0.0,
            already_done: false,
        }
    }

    pub(crate) fn skipped<S: Into<String>>(item: &str, recipe: RecipeKind, message: S) -> RunRecord {
        RunRecord {
            message: message.into(),
            ..RunRecord::new(item, recipe, ItemStatus::Skipped)
        }
    }

    /// Did the item leave usable products behind?
    pub(crate) fn has_products(&self) -> bool {
        match self.status {
            ItemStatus::Ok | ItemStatus::QcFail => true,
            ItemStatus::Skipped => self.already_done,
            ItemStatus::Error => false,
        }
    }

    /// Did the item succeed outright?
    pub(crate) fn succeeded(&self) -> bool {
        match self.status {
            ItemStatus::Ok => true,
            ItemStatus::Skipped => self.already_done,
            _ => false,
        }
    }

    fn summary_line(&self) -> String {
        let status = match self.class {
            Some(class) => format!("{}({class})", self.status),
            None => self.status.to_string(),
        };
        let qc = if self.qc_failed.is_empty() {
            "-".to_string()
        } else {
            self.qc_failed.join(",")
        };
        format!(
            "{:<11} {:<32} {:<26} {:<20} {:>9.2}  {:<30} {}\n",
            self.recipe,
            self.item,
            status,
            qc,
            self.duration,
            self.pid,
            self.message.replace('\n', " ")
        )
    }
}

/// The per-run summary table. Records are appended as items finish.
pub(crate) struct RunSummary {
    path: PathBuf,
    file: File,
}

impl RunSummary {
    pub(crate) fn create(path: &Path) -> std::io::Result<RunSummary> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let mut file = File::create(path)?;
        write!(
            file,
            "# {}\n{:<11} {:<32} {:<26} {:<20} {:>9}  {:<30} {}\n",
            crate::misc::drs_pid(),
            "recipe",
            "item",
            "status",
            "qc_failed",
            "duration",
            "pid",
            "message"
        )?;
        Ok(RunSummary {
            path: path.to_path_buf(),
            file,
        })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn append(&mut self, record: &RunRecord) -> std::io::Result<()> {
        self.file.write_all(record.summary_line().as_bytes())?;
        self.file.flush()
    }
}

/// Enough about a file to notice that it changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Fingerprint {
    pub(crate) path: PathBuf,
    pub(crate) size: u64,
    /// Modification time \[ns since the Unix epoch\].
    pub(crate) mtime: u128,
}

impl Fingerprint {
    pub(crate) fn of(path: &Path) -> Option<Fingerprint> {
        let meta = std::fs::metadata(path).ok()?;
        let mtime = meta
            .modified()
            .ok()?
            .duration_since(UNIX_EPOCH)
            .ok()?
            .as_nanos();
        Some(Fingerprint {
            path: path.to_path_buf(),
            size: meta.len(),
            mtime,
        })
    }
}

/// Written when an item finishes with products, so that a later run with the
/// same inputs can skip it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct DoneMarker {
    pub(crate) recipe: String,
    pub(crate) inputs: Vec<Fingerprint>,
    pub(crate) outputs: Vec<PathBuf>,
    pub(crate) status: String,
    pub(crate) pid: String,
}

impl DoneMarker {
    pub(crate) fn new(recipe: RecipeKind, inputs: &[PathBuf], record: &RunRecord) -> Option<DoneMarker> {
        Some(DoneMarker {
            recipe: recipe.to_string(),
            inputs: inputs.iter().map(|p| Fingerprint::of(p)).collect::<Option<_>>()?,
            outputs: record.outputs.clone(),
            status: record.status.to_string(),
            pid: crate::misc::drs_pid().to_string(),
        })
    }

    /// Where the marker of a work item lives.
    pub(crate) fn path_for(dir: &Path, item: &str) -> PathBuf {
        let name: String = item
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        dir.join(format!("{name}.json"))
    }

    pub(crate) fn read(path: &Path) -> Option<DoneMarker> {
        let text = std::fs::read_to_string(path).ok()?;
        match serde_json::from_str(&text) {
            Ok(marker) => Some(marker),
            Err(e) => {
                debug!("Ignoring unreadable marker {}: {e}", path.display());
                None
            }
        }
    }

    pub(crate) fn write(&self, path: &Path) -> std::io::Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let text = serde_json::to_string_pretty(self).map_err(std::io::Error::from)?;
        std::fs::write(path, text)
    }

    /// Are the inputs the same as when the marker was written, and do the
    /// outputs still exist?
    pub(crate) fn still_valid(&self, recipe: RecipeKind, inputs: &[PathBuf]) -> bool {
        if self.recipe != recipe.to_string() || self.inputs.len() != inputs.len() {
            return false;
        }
        let same_inputs = self
            .inputs
            .iter()
            .zip(inputs)
            .all(|(fp, path)| Fingerprint::of(path).as_ref() == Some(fp));
        let outputs_exist = self.outputs.iter().all(|p| p.exists());
        trace!("Marker for {recipe}: inputs unchanged {same_inputs}, outputs exist {outputs_exist}");
        same_inputs && outputs_exist
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_status_names() {
        assert_eq!(ItemStatus::QcFail.to_string(), "QC_FAIL");
        assert_eq!(ItemStatus::Ok.to_string(), "OK");
    }

    #[test]
    fn test_done_marker() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("a.fits");
        let output = dir.path().join("a_pp.fits");
        std::fs::write(&input, "raw").unwrap();
        std::fs::write(&output, "pp").unwrap();

        let mut record = RunRecord::new("preprocess:a", RecipeKind::Preprocess, ItemStatus::Ok);
        record.outputs.push(output.clone());
        let marker = DoneMarker::new(RecipeKind::Preprocess, &[input.clone()], &record).unwrap();
        let path = DoneMarker::path_for(&dir.path().join("done"), "preprocess:a");
        assert!(path.ends_with("preprocess_a.json"));
        marker.write(&path).unwrap();

        let read = DoneMarker::read(&path).unwrap();
        assert_eq!(read, marker);
        assert!(read.still_valid(RecipeKind::Preprocess, &[input.clone()]));
        assert!(!read.still_valid(RecipeKind::Dark, &[input.clone()]));

        std::fs::write(&input, "different raw").unwrap();
        assert!(!read.still_valid(RecipeKind::Preprocess, &[input.clone()]));

        std::fs::remove_file(&output).unwrap();
        let marker = DoneMarker::new(RecipeKind::Preprocess, &[input.clone()], &record).unwrap();
        assert!(!marker.still_valid(RecipeKind::Preprocess, &[input]));
    }

    #[test]
    fn test_missing_inputs_have_no_marker() {
        let record = RunRecord::new("x", RecipeKind::Dark, ItemStatus::Ok);
        assert!(DoneMarker::new(RecipeKind::Dark, &[PathBuf::from("/nonexistent/x.fits")], &record).is_none());
    }

    #[test]
    fn test_summary_table() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("msg").join("summary.txt");
        let mut summary = RunSummary::create(&path).unwrap();
        let mut record = RunRecord::new("dark:a", RecipeKind::Dark, ItemStatus::QcFail);
        record.qc_failed = vec!["DAMED".to_string()];
        summary.append(&record).unwrap();
        let text = std::fs::read_to_string(summary.path()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[2].starts_with("dark"));
        assert!(lines[2].contains("QC_FAIL"));
        assert!(lines[2].contains("DAMED"));
        assert!(lines[2].contains(crate::misc::drs_pid()));
    }

    #[test]
    fn test_records_survive_json() {
        let mut record = RunRecord::new("wave:2400016a", RecipeKind::Wave, ItemStatus::Error);
        record.class = Some(ErrorClass::CalibMissing);
        record.outputs.push(PathBuf::from("/reduced/x.fits"));
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"CALIB_MISSING\""));
        let back: RunRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.status, ItemStatus::Error);
        assert_eq!(back.class, Some(ErrorClass::CalibMissing));
        assert_eq!(back.outputs, record.outputs);
        assert_eq!(back.pid, record.pid);
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Integration tests.
//!
//! Every test simulates its own night into a temporary directory and reduces
//! it with the `nirdrs` executable.
//!
//! Some help for laying out these tests was taken from:
//! https://matklad.github.io/2021/02/27/delete-cargo-integration-tests.html

mod calibdb;
mod no_stderr;
mod process;
mod recipes;

use std::{
    path::{Path, PathBuf},
    process::Output,
    str::from_utf8,
};

use assert_cmd::{output::OutputError, Command};

const NIGHT: &str = "2024-05-14";

fn nirdrs() -> Command {
    Command::cargo_bin("nirdrs").unwrap()
}

fn get_cmd_output(result: Result<Output, OutputError>) -> (String, String) {
    let output = match result {
        Ok(o) => o,
        Err(o) => o.as_output().unwrap().clone(),
    };
    (
        from_utf8(&output.stdout).unwrap().to_string(),
        from_utf8(&output.stderr).unwrap().to_string(),
    )
}

/// Simulate a night into `dir` and return the path to its configuration.
/// `extra` are additional `simulate-night` arguments.
fn simulate(dir: &Path, extra: &[&str]) -> PathBuf {
    let cmd = nirdrs()
        .arg("simulate-night")
        .arg(dir)
        .args(extra)
        .ok();
    assert!(cmd.is_ok(), "simulate-night failed: {}", cmd.err().unwrap());
    let config = dir.join("nirdrs.toml");
    assert!(config.exists());
    config
}

/// Reduce the simulated night. The run itself must succeed, whatever happens
/// to individual items.
fn process(config: &Path) -> (String, String) {
    #[rustfmt::skip]
    let cmd = nirdrs()
        .args([
            "--no-progress-bars",
            "--config", &format!("{}", config.display()),
            "process", NIGHT,
        ])
        .ok();
    assert!(cmd.is_ok(), "process failed: {}", cmd.err().unwrap());
    get_cmd_output(cmd)
}

fn reduced_dir(dir: &Path) -> PathBuf {
    dir.join("reduced").join(NIGHT)
}

fn msg_dir(dir: &Path) -> PathBuf {
    dir.join("msg").join(NIGHT)
}

/// The run summaries of the night, oldest first.
fn summaries(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(msg_dir(dir))
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.ends_with("_summary.txt"))
                .unwrap_or(false)
        })
        .collect();
    files.sort();
    files
}

/// One row of a run summary.
#[derive(Debug)]
struct SummaryRow {
    recipe: String,
    item: String,
    status: String,
    qc_failed: String,
    pid: String,
    message: String,
}

fn read_summary(path: &Path) -> Vec<SummaryRow> {
    let text = std::fs::read_to_string(path).unwrap();
    let mut lines = text.lines();
    assert!(lines.next().unwrap().starts_with("# PID-"));
    assert!(lines.next().unwrap().starts_with("recipe"));
    lines
        .map(|line| {
            let mut fields = line.split_whitespace();
            let recipe = fields.next().unwrap().to_string();
            let item = fields.next().unwrap().to_string();
            let status = fields.next().unwrap().to_string();
            let qc_failed = fields.next().unwrap().to_string();
            let _duration: f64 = fields.next().unwrap().parse().unwrap();
            let pid = fields.next().unwrap().to_string();
            assert!(pid.starts_with("PID-"), "{line}");
            let message = fields.collect::<Vec<_>>().join(" ");
            SummaryRow {
                recipe,
                item,
                status,
                qc_failed,
                pid,
                message,
            }
        })
        .collect()
}

/// The summary of the only run of the night.
fn only_summary(dir: &Path) -> Vec<SummaryRow> {
    let files = summaries(dir);
    assert_eq!(files.len(), 1, "expected a single run: {files:?}");
    read_summary(&files[0])
}

/// The kinds of the current (not superseded) lines of a database file.
fn db_kinds(db: &Path) -> Vec<String> {
    std::fs::read_to_string(db)
        .unwrap()
        .lines()
        .filter(|l| !l.trim().is_empty() && !l.starts_with('#'))
        .map(|l| l.split_whitespace().next().unwrap().to_string())
        .collect()
}

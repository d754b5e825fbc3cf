// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Data-reduction pipeline for a near-infrared cross-dispersed echelle
//! spectrograph.
//!
//! Raw detector frames go in; calibrations, extracted spectra, telluric
//! corrections and radial velocities come out.

#[doc(hidden)]
pub mod benchmarks;
mod calib;
mod calibdb;
mod ccf;
mod cli;
pub mod constants;
mod config;
mod dprtype;
mod extract;
mod io;
mod keywords;
mod math;
mod misc;
mod orchestrator;
mod preprocess;
mod qc;
mod recipes;
mod sequence;
mod sim;
mod telluric;

pub use cli::{Drs, DrsError};

use crossbeam_utils::atomic::AtomicCell;

lazy_static::lazy_static! {
    /// Are progress bars being drawn? This should only ever be enabled by CLI
    /// code.
    static ref PROGRESS_BARS: AtomicCell<bool> = AtomicCell::new(false);

    /// Set on SIGINT, or when a fatal error happens and the run stops on
    /// errors. Workers check this between work items.
    static ref CANCEL_REQUESTED: AtomicCell<bool> = AtomicCell::new(false);
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Workloads for the criterion benchmarks, built on the synthetic instrument.
//! Not part of the public API.

use ndarray::prelude::*;

use crate::{
    calib::loc::{localise, LocModel},
    extract::{extract_orders, ExtractParams},
    preprocess::hotpix::clean_hot_pixels,
    sim::{
        instrument::{Detector, Light, Sky},
        sim_config,
    },
};

/// A raw flat full of hot pixels.
pub struct HotPixelCase {
    image: Array2<f64>,
    nsig: f64,
}

impl HotPixelCase {
    pub fn new(seed: u64) -> HotPixelCase {
        let sky = Sky::new(seed);
        let image = Detector::new(seed).expose(&sky, Light::Flat, Light::Flat, 10.0, seed);
        HotPixelCase {
            image,
            nsig: sim_config().preprocess.hotpix_nsig,
        }
    }

    /// Clean a copy of the image; returns the number of flagged pixels.
    pub fn run(&self) -> usize {
        let mut image = self.image.clone();
        clean_hot_pixels(&mut image, Axis(1), self.nsig).n_flagged
    }
}

/// An FP exposure and the traces of its science fibre.
pub struct ExtractCase {
    image: Array2<f64>,
    loc: LocModel,
    params: ExtractParams,
}

impl ExtractCase {
    pub fn new(seed: u64) -> Result<ExtractCase, String> {
        let config = sim_config();
        let sky = Sky::new(seed);
        let detector = Detector::new(seed);
        let flat = detector.expose(&sky, Light::Flat, Light::Flat, 10.0, seed);
        let loc = localise(flat.view(), None, &config.detector, &config.loc).map_err(|e| e.to_string())?;
        let loc = loc
            .models
            .into_iter()
            .next()
            .ok_or_else(|| "no fibre group was localised".to_string())?;
        Ok(ExtractCase {
            image: detector.expose(&sky, Light::Fp, Light::Fp, 10.0, seed + 1),
            loc,
            params: ExtractParams::from_config(&config),
        })
    }

    /// Extract every order; returns the number of orders.
    pub fn run(&self) -> usize {
        extract_orders(self.image.view(), &self.loc, &self.params).e2ds.nrows()
    }
}

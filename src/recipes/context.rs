// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Everything a recipe needs besides the configuration: where the night's
//! files are, and the calibration databases.

use std::{
    path::{Path, PathBuf},
    str::FromStr,
};

use log::{debug, trace};
use ndarray::prelude::*;

use super::{kinds, InputRole, Provenance, RecipeError, RecipeKind};
use crate::{
    calib::{
        calibrate_frame,
        loc::LocModel,
        shape::{straighten, ShapeMap},
        stack_median,
    },
    calibdb::{CalibDb, CalibDbError, CalibEntry},
    config::{DrsConfig, LookupPolicy},
    constants::DEFAULT_INSTRUMENT_MODE,
    dprtype::DprType,
    io::{
        header::Header,
        product::{image_to_mask, Product},
        store::{basename_of, ensure_dir, FileStore},
    },
    keywords::Keyword,
    preprocess::{preprocess_file, PreppedFrame},
};

/// A preprocessed frame and what its header says about it.
#[derive(Debug, Clone)]
pub(crate) struct LoadedFrame {
    /// The raw basename, without `_pp`.
    pub(crate) basename: String,
    pub(crate) image: Array2<f64>,
    pub(crate) header: Header,
    pub(crate) mode: String,
    pub(crate) mjd: f64,
    /// \[s\]
    pub(crate) exptime: f64,
    pub(crate) dprtype: DprType,
    pub(crate) object: String,
}

impl LoadedFrame {
    fn from_product(
        basename: String,
        file: &Path,
        product: Product,
        config: &DrsConfig,
    ) -> Result<LoadedFrame, RecipeError> {
        let kw = &config.keywords;
        let header = product.header;
        let bad_header = |source| RecipeError::Header {
            file: file.to_path_buf(),
            source,
        };
        let mode = kw
            .get_str(&header, Keyword::Mode)
            .unwrap_or_else(|_| DEFAULT_INSTRUMENT_MODE.to_string());
        let mjd = kw.get_mjd(&header).map_err(bad_header)?;
        let exptime = kw.get_float(&header, Keyword::ExpTime).map_err(bad_header)?;
        let dprtype = header.get_str("DPRTYPE").map_err(bad_header)?;
        let dprtype = DprType::from_str(&dprtype).map_err(|e| RecipeError::BadCalibration {
            kind: "DPRTYPE".to_string(),
            file: file.to_path_buf(),
            message: e.to_string(),
        })?;
        let object = kw.get_str(&header, Keyword::Object).unwrap_or_default();
        Ok(LoadedFrame {
            basename,
            image: product.image,
            header,
            mode,
            mjd,
            exptime,
            dprtype,
            object,
        })
    }
}

/// The combination of several frames of one sequence.
#[derive(Debug, Clone)]
pub(crate) struct Stack {
    pub(crate) image: Array2<f64>,
    /// The header of the first frame.
    pub(crate) header: Header,
    /// Named after the first frame.
    pub(crate) first: String,
    pub(crate) mode: String,
    /// The acquisition time of the last frame, which dates the calibration.
    pub(crate) mjd: f64,
    /// The mean exposure time.
    pub(crate) exptime: f64,
}

/// Median-combine frames. Frames must not be empty.
pub(crate) fn stack_frames(frames: &[LoadedFrame]) -> Result<Stack, RecipeError> {
    let first = &frames[0];
    if let Some(other) = frames.iter().find(|f| f.image.dim() != first.image.dim()) {
        return Err(RecipeError::StackShape {
            first: first.image.dim(),
            other: other.image.dim(),
        });
    }
    let images: Vec<Array2<f64>> = frames.iter().map(|f| f.image.clone()).collect();
    let image = stack_median(&images).ok_or(RecipeError::StackShape {
        first: first.image.dim(),
        other: first.image.dim(),
    })?;
    let mjd = frames.iter().map(|f| f.mjd).fold(f64::NEG_INFINITY, f64::max);
    let exptime = frames.iter().map(|f| f.exptime).sum::<f64>() / frames.len() as f64;
    trace!("Stacked {} frames starting with {}", frames.len(), first.basename);
    Ok(Stack {
        image,
        header: first.header.clone(),
        first: first.basename.clone(),
        mode: first.mode.clone(),
        mjd,
        exptime,
    })
}

#[derive(Debug, Clone)]
pub(crate) struct RecipeContext {
    pub(crate) night: String,
    pub(crate) store: FileStore,
    pub(crate) calibdb: CalibDb,
    pub(crate) telludb: CalibDb,
    pub(crate) policy: LookupPolicy,
}

impl RecipeContext {
    pub(crate) fn new(config: &DrsConfig, night: &str) -> RecipeContext {
        RecipeContext {
            night: night.to_string(),
            store: FileStore::new(&config.paths),
            calibdb: CalibDb::calibrations(&config.paths, &config.calibdb),
            telludb: CalibDb::tellurics(&config.paths, &config.calibdb),
            policy: config.calibdb.policy,
        }
    }

    /// The same context, looking calibrations up with another policy.
    pub(crate) fn with_policy(&self, policy: LookupPolicy) -> RecipeContext {
        RecipeContext {
            policy,
            ..self.clone()
        }
    }

    /// Where a product of this night is written.
    pub(crate) fn product_path(&self, name: &str) -> PathBuf {
        self.store.product_path(&self.night, name)
    }

    pub(crate) fn write_product(&self, product: &Product, name: &str) -> Result<PathBuf, RecipeError> {
        let path = self.product_path(name);
        if let Some(dir) = path.parent() {
            ensure_dir(dir)?;
        }
        product.write(&path)?;
        debug!("Wrote {}", path.display());
        Ok(path)
    }

    /// Preprocess a raw file and write the result to the working directory.
    pub(crate) fn preprocess_raw(
        &self,
        config: &DrsConfig,
        raw: &Path,
    ) -> Result<(PathBuf, PreppedFrame), RecipeError> {
        let prepped = preprocess_file(&self.night, raw, config)?;
        let basename = basename_of(raw);
        let mut prov = Provenance::new(RecipeKind::Preprocess);
        prov.add_input(&basename);
        let mut header = prov.header(&prepped.header);
        prepped.qc.write_header(&mut header);

        let path = self.store.pp_path(&self.night, &basename);
        if let Some(dir) = path.parent() {
            ensure_dir(dir)?;
        }
        Product::new(prepped.image.clone(), header).write(&path)?;
        debug!("Wrote {}", path.display());
        Ok((path, prepped))
    }

    /// Load the preprocessed version of an input. Inputs may name a raw file
    /// or its `_pp` product; a raw file that hasn't been preprocessed yet is
    /// preprocessed now.
    pub(crate) fn load_frame(&self, config: &DrsConfig, input: &Path) -> Result<LoadedFrame, RecipeError> {
        let resolved = self.store.resolve_input(&self.night, input)?;
        let name = basename_of(&resolved);
        let (basename, pp) = match name.strip_suffix("_pp") {
            Some(raw) => (raw.to_string(), resolved),
            None => {
                let pp = self.store.pp_path(&self.night, &name);
                if !pp.exists() {
                    self.preprocess_raw(config, &resolved)?;
                }
                (name, pp)
            }
        };
        let product = Product::read(&pp)?;
        LoadedFrame::from_product(basename, &pp, product, config)
    }

    /// Load the inputs of one role, checking their exposure types.
    pub(crate) fn load_role(
        &self,
        config: &DrsConfig,
        recipe: RecipeKind,
        role: InputRole,
        inputs: &[PathBuf],
        prov: &mut Provenance,
    ) -> Result<Vec<LoadedFrame>, RecipeError> {
        if inputs.is_empty() {
            return Err(RecipeError::NoInputs {
                recipe,
                role: role.name,
            });
        }
        inputs
            .iter()
            .map(|input| {
                let frame = self.load_frame(config, input)?;
                if !role.accepts.allows(frame.dprtype) {
                    return Err(RecipeError::WrongType {
                        file: input.clone(),
                        recipe,
                        role: role.name,
                        got: frame.dprtype,
                    });
                }
                prov.add_input(&frame.basename);
                Ok(frame)
            })
            .collect()
    }

    /// Read the calibration of `kind` for a frame and record it in the
    /// provenance.
    pub(crate) fn fetch(
        &self,
        kind: &str,
        mode: &str,
        mjd: f64,
        prov: &mut Provenance,
    ) -> Result<Calibration, RecipeError> {
        let found = self.calibdb.lookup(kind, mode, mjd, self.policy)?;
        let product = Product::read_all(&found.path)?;
        prov.add_calibration(kind, &found.entry.basename);
        Ok(Calibration {
            kind: kind.to_string(),
            path: found.path,
            product,
        })
    }

    /// Like [`RecipeContext::fetch`], but a calibration that doesn't exist
    /// isn't an error.
    pub(crate) fn fetch_optional(
        &self,
        kind: &str,
        mode: &str,
        mjd: f64,
        prov: &mut Provenance,
    ) -> Result<Option<Calibration>, RecipeError> {
        match self.fetch(kind, mode, mjd, prov) {
            Ok(p) => Ok(Some(p)),
            Err(RecipeError::CalibDb(CalibDbError::Missing { .. })) => {
                debug!("No {kind} calibration for mode {mode}");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Subtract the dark from an image and blank its bad pixels. Returns the
    /// bad pixel mask.
    pub(crate) fn calibrate(
        &self,
        image: &mut Array2<f64>,
        mode: &str,
        mjd: f64,
        exptime: f64,
        prov: &mut Provenance,
    ) -> Result<Array2<bool>, RecipeError> {
        let shape = image.dim();
        let dark = self.fetch(kinds::DARK, mode, mjd, prov)?;
        let badpix = self.fetch(kinds::BADPIX, mode, mjd, prov)?.mask(shape)?;
        calibrate_frame(image, Some(dark.image(shape)?), exptime, Some(badpix.view()));
        Ok(badpix)
    }

    /// Resample an image so that the slit is vertical everywhere.
    pub(crate) fn straighten(
        &self,
        image: ArrayView2<f64>,
        mode: &str,
        mjd: f64,
        prov: &mut Provenance,
    ) -> Result<Array2<f64>, RecipeError> {
        let calib = self.fetch(kinds::SHAPE, mode, mjd, prov)?;
        let map = calib.parse(ShapeMap::from_product)?;
        if map.dx.dim() != image.dim() {
            return Err(calib.malformed(format!(
                "shape {:?}, expected {:?}",
                map.dx.dim(),
                image.dim()
            )));
        }
        Ok(straighten(image, map.dx.view()))
    }

    /// The order localisation of every fibre group, in layout order.
    pub(crate) fn loc_models(
        &self,
        config: &DrsConfig,
        mode: &str,
        mjd: f64,
        prov: &mut Provenance,
    ) -> Result<Vec<LocModel>, RecipeError> {
        config
            .loc
            .fibre_layout
            .iter()
            .map(|fibre| {
                self.fetch(&kinds::loc(fibre), mode, mjd, prov)?
                    .parse(LocModel::from_product)
            })
            .collect()
    }

    /// Every current telluric map of a mode.
    pub(crate) fn transmission_maps(&self, mode: &str) -> Result<Vec<(CalibEntry, Product)>, RecipeError> {
        self.telludb
            .current(kinds::TELL_MAP, mode)?
            .into_iter()
            .map(|entry| {
                let product = Product::read(self.telludb.path_of(&entry))?;
                Ok((entry, product))
            })
            .collect()
    }

    /// The stellar template of an object closest in time, if the telluric
    /// database has one.
    pub(crate) fn stellar_template(
        &self,
        object: &str,
        mode: &str,
        mjd: f64,
        prov: &mut Provenance,
    ) -> Result<Option<Calibration>, RecipeError> {
        let kind = kinds::template(object);
        let found = match self.telludb.lookup(&kind, mode, mjd, LookupPolicy::Closest) {
            Ok(found) => found,
            Err(CalibDbError::Missing { .. }) => {
                debug!("No template for {object} in mode {mode}");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        let product = Product::read_all(&found.path)?;
        prov.add_calibration(&kind, &found.entry.basename);
        Ok(Some(Calibration {
            kind,
            path: found.path,
            product,
        }))
    }

    pub(crate) fn publish(
        &self,
        db: &CalibDb,
        kind: &str,
        mode: &str,
        mjd: f64,
        artifact: &Path,
    ) -> Result<CalibEntry, RecipeError> {
        Ok(db.publish(kind, mode, mjd, artifact)?)
    }
}

/// A calibration artifact read from the database.
#[derive(Debug, Clone)]
pub(crate) struct Calibration {
    pub(crate) kind: String,
    pub(crate) path: PathBuf,
    pub(crate) product: Product,
}

impl Calibration {
    pub(crate) fn malformed<S: Into<String>>(&self, message: S) -> RecipeError {
        RecipeError::BadCalibration {
            kind: self.kind.clone(),
            file: self.path.clone(),
            message: message.into(),
        }
    }

    /// The primary image, which must match the frame it is applied to.
    pub(crate) fn image(&self, shape: (usize, usize)) -> Result<ArrayView2<f64>, RecipeError> {
        let dim = self.product.image.dim();
        if dim != shape {
            return Err(self.malformed(format!("shape {dim:?}, expected {shape:?}")));
        }
        Ok(self.product.image.view())
    }

    /// The primary image of a 0/1 mask.
    pub(crate) fn mask(&self, shape: (usize, usize)) -> Result<Array2<bool>, RecipeError> {
        self.image(shape).map(image_to_mask)
    }

    /// Turn a model's own parse error into a malformed-calibration error.
    pub(crate) fn parse<T, E: std::fmt::Display>(
        &self,
        f: impl FnOnce(&Product) -> Result<T, E>,
    ) -> Result<T, RecipeError> {
        f(&self.product).map_err(|e| self.malformed(e.to_string()))
    }
}

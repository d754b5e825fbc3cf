// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! A FITS image with its header and any named extensions.

use std::path::Path;

use indexmap::IndexMap;
use log::trace;
use ndarray::prelude::*;

use super::{
    fits::{self, FitsError},
    header::Header,
};

#[derive(Debug, Clone)]
pub(crate) struct Product {
    pub(crate) image: Array2<f64>,
    pub(crate) header: Header,
    pub(crate) extensions: IndexMap<String, Array2<f64>>,
}

impl Product {
    pub(crate) fn new(image: Array2<f64>, header: Header) -> Product {
        Product {
            image,
            header,
            extensions: IndexMap::new(),
        }
    }

    pub(crate) fn with_extension<S: Into<String>>(mut self, name: S, data: Array2<f64>) -> Product {
        self.extensions.insert(name.into(), data);
        self
    }

    /// A 1D array stored as a single-row extension.
    pub(crate) fn with_vector<S: Into<String>>(self, name: S, data: &[f64]) -> Product {
        let row = Array2::from_shape_vec((1, data.len()), data.to_vec())
            .unwrap_or_else(|_| Array2::zeros((1, 0)));
        self.with_extension(name, row)
    }

    pub(crate) fn extension(&self, name: &str) -> Option<&Array2<f64>> {
        self.extensions.get(name)
    }

    /// Read the primary image and header only.
    pub(crate) fn read<P: AsRef<Path>>(file: P) -> Result<Product, FitsError> {
        trace!("Reading {}", file.as_ref().display());
        let (image, header) = fits::read_primary(&file)?;
        Ok(Product::new(image, header))
    }

    /// Read the primary HDU and every image extension.
    pub(crate) fn read_all<P: AsRef<Path>>(file: P) -> Result<Product, FitsError> {
        let mut product = Product::read(&file)?;
        let mut fptr = fits::fits_open(&file)?;
        for name in fits::fits_extension_names(&mut fptr)? {
            let hdu = fits::fits_open_hdu(&mut fptr, name.as_str())?;
            let data = fits::fits_get_image_2d(&mut fptr, &hdu)?;
            product.extensions.insert(name, data);
        }
        Ok(product)
    }

    pub(crate) fn write<P: AsRef<Path>>(&self, file: P) -> Result<(), FitsError> {
        trace!("Writing {}", file.as_ref().display());
        let extensions: Vec<(String, Array2<f64>)> = self
            .extensions
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        fits::write_image_file(file, self.image.view(), &self.header, &extensions)
    }
}

/// Convert a boolean mask to the 0/1 image it is stored as.
pub(crate) fn mask_to_image(mask: ArrayView2<bool>) -> Array2<f64> {
    mask.mapv(|b| if b { 1.0 } else { 0.0 })
}

/// Any non-zero, finite pixel is set.
pub(crate) fn image_to_mask(image: ArrayView2<f64>) -> Array2<bool> {
    image.mapv(|v| v.is_finite() && v != 0.0)
}

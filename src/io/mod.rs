// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! File stuff: FITS images and headers, text tables, globs and the layout of
//! the data directories.

pub(crate) mod fits;
mod glob;
pub(crate) mod header;
pub(crate) mod product;
pub(crate) mod store;
pub(crate) mod tables;

pub(crate) use self::glob::{expand_file_args, fits_files_in, GlobError};

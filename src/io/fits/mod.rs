// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Helper functions for reading and writing FITS files.
//!
//! Every image is read and written as 64-bit floats with a row-major
//! (row, column) shape. Boolean masks are stored as 0/1 images.

mod error;

pub(crate) use error::FitsError;

use std::{ffi::CStr, fmt::Display, os::raw::c_char, path::Path};

use fitsio::{
    hdu::{DescribesHdu, FitsHdu, HduInfo},
    images::{ImageDescription, ImageType},
    FitsFile,
};
use ndarray::prelude::*;

use super::header::{Header, HeaderValue};

/// Cards that describe the HDU structure rather than the data. These are
/// handled by cfitsio and never copied between files.
const STRUCTURAL_KEYS: [&str; 12] = [
    "SIMPLE", "BITPIX", "NAXIS", "EXTEND", "XTENSION", "PCOUNT", "GCOUNT", "EXTNAME", "BZERO",
    "BSCALE", "COMMENT", "HISTORY",
];

pub(crate) fn is_structural_key(key: &str) -> bool {
    key.is_empty()
        || key == "END"
        || STRUCTURAL_KEYS.contains(&key)
        || (key.starts_with("NAXIS") && key[5..].chars().all(|c| c.is_ascii_digit()))
}

/// Open a FITS file.
#[track_caller]
pub(crate) fn fits_open<P: AsRef<Path>>(file: P) -> Result<FitsFile, FitsError> {
    FitsFile::open(file.as_ref()).map_err(|e| {
        let caller = std::panic::Location::caller();
        FitsError::Open {
            fits_error: Box::new(e),
            fits_filename: file.as_ref().to_path_buf().into_boxed_path(),
            source_file: caller.file(),
            source_line: caller.line(),
            source_column: caller.column(),
        }
    })
}

/// Create (or overwrite) a FITS file whose primary HDU is a 2D double image
/// with the given (rows, columns).
#[track_caller]
pub(crate) fn fits_create<P: AsRef<Path>>(
    file: P,
    shape: (usize, usize),
) -> Result<FitsFile, FitsError> {
    let dims = [shape.0, shape.1];
    let desc = ImageDescription {
        data_type: ImageType::Double,
        dimensions: &dims,
    };
    FitsFile::create(file.as_ref())
        .with_custom_primary(&desc)
        .overwrite()
        .open()
        .map_err(|e| {
            let caller = std::panic::Location::caller();
            FitsError::Open {
                fits_error: Box::new(e),
                fits_filename: file.as_ref().to_path_buf().into_boxed_path(),
                source_file: caller.file(),
                source_line: caller.line(),
                source_column: caller.column(),
            }
        })
}

/// Open a FITS file's HDU.
#[track_caller]
pub(crate) fn fits_open_hdu<T: DescribesHdu + Display + Copy>(
    fits_fptr: &mut FitsFile,
    hdu_description: T,
) -> Result<FitsHdu, FitsError> {
    fits_fptr.hdu(hdu_description).map_err(|e| {
        let caller = std::panic::Location::caller();
        FitsError::Fitsio {
            fits_error: Box::new(e),
            fits_filename: fits_fptr.file_path().to_path_buf().into_boxed_path(),
            hdu_description: format!("{hdu_description}").into_boxed_str(),
            source_file: caller.file(),
            source_line: caller.line(),
            source_column: caller.column(),
        }
    })
}

/// Given a FITS file pointer, a HDU that belongs to it, and a keyword that may
/// or may not exist, pull out the value of the keyword, parsing it into the
/// desired type.
#[track_caller]
pub(crate) fn fits_get_optional_key<T: std::str::FromStr>(
    fits_fptr: &mut FitsFile,
    hdu: &FitsHdu,
    keyword: &str,
) -> Result<Option<T>, FitsError> {
    let unparsed_value: String = match hdu.read_key(fits_fptr, keyword) {
        Ok(key_value) => key_value,
        Err(fitsio::errors::Error::Fits(fe)) if matches!(fe.status, 202 | 204) => return Ok(None),
        Err(e) => {
            let caller = std::panic::Location::caller();
            return Err(FitsError::Fitsio {
                fits_error: Box::new(e),
                fits_filename: fits_fptr.file_path().to_path_buf().into_boxed_path(),
                hdu_description: format!("{}", hdu.number + 1).into_boxed_str(),
                source_file: caller.file(),
                source_line: caller.line(),
                source_column: caller.column(),
            });
        }
    };

    match unparsed_value.trim().parse() {
        Ok(parsed_value) => Ok(Some(parsed_value)),
        Err(_) => {
            let caller = std::panic::Location::caller();
            Err(FitsError::Parse {
                key: keyword.to_string().into_boxed_str(),
                fits_filename: fits_fptr.file_path().to_path_buf().into_boxed_path(),
                hdu_num: hdu.number + 1,
                source_file: caller.file(),
                source_line: caller.line(),
                source_column: caller.column(),
            })
        }
    }
}

/// Given a FITS file pointer, a HDU that belongs to it, and a keyword, pull out
/// the value of the keyword, parsing it into the desired type.
#[track_caller]
pub(crate) fn fits_get_required_key<T: std::str::FromStr>(
    fits_fptr: &mut FitsFile,
    hdu: &FitsHdu,
    keyword: &str,
) -> Result<T, FitsError> {
    match fits_get_optional_key(fits_fptr, hdu, keyword) {
        Ok(Some(value)) => Ok(value),
        Ok(None) => {
            let caller = std::panic::Location::caller();
            Err(FitsError::MissingKey {
                key: keyword.to_string().into_boxed_str(),
                fits_filename: fits_fptr.file_path().to_path_buf().into_boxed_path(),
                hdu_num: hdu.number + 1,
                source_file: caller.file(),
                source_line: caller.line(),
                source_column: caller.column(),
            })
        }
        Err(error) => Err(error),
    }
}

/// Read every non-structural card of the supplied HDU. This walks the header
/// with low-level cfitsio calls, because fitsio only reads keys by name.
#[track_caller]
pub(crate) fn fits_read_header(
    fits_fptr: &mut FitsFile,
    hdu: &FitsHdu,
) -> Result<Header, FitsError> {
    // Make sure the HDU we want is the current one.
    fits_open_hdu(fits_fptr, hdu.number)?;

    let mut header = Header::new();
    let mut status = 0;
    let mut num_keys = 0;
    let mut more_keys = 0;
    unsafe {
        // ffghsp = fits_get_hdrspace
        fitsio_sys::ffghsp(
            fits_fptr.as_raw(), /* I - FITS file pointer                     */
            &mut num_keys,      /* O - number of existing keywords in header */
            &mut more_keys,     /* O - how many more keywords will fit       */
            &mut status,        /* IO - error status                         */
        );
    }
    if status != 0 {
        let caller = std::panic::Location::caller();
        return Err(FitsError::Card {
            card: 0,
            status,
            fits_filename: fits_fptr.file_path().to_path_buf().into_boxed_path(),
            hdu_num: hdu.number + 1,
            source_file: caller.file(),
            source_line: caller.line(),
            source_column: caller.column(),
        });
    }

    for card in 1..=num_keys {
        let mut name = [0 as c_char; 81];
        let mut value = [0 as c_char; 81];
        let mut comment = [0 as c_char; 81];
        let (name, value) = unsafe {
            // ffgkyn = fits_read_keyn
            fitsio_sys::ffgkyn(
                fits_fptr.as_raw(),     /* I - FITS file pointer             */
                card,                   /* I - number of the keyword to read */
                name.as_mut_ptr(),      /* O - name of the keyword           */
                value.as_mut_ptr(),     /* O - keyword value                 */
                comment.as_mut_ptr(),   /* O - keyword comment               */
                &mut status,            /* IO - error status                 */
            );
            if status != 0 {
                let caller = std::panic::Location::caller();
                return Err(FitsError::Card {
                    card,
                    status,
                    fits_filename: fits_fptr.file_path().to_path_buf().into_boxed_path(),
                    hdu_num: hdu.number + 1,
                    source_file: caller.file(),
                    source_line: caller.line(),
                    source_column: caller.column(),
                });
            }
            (
                CStr::from_ptr(name.as_ptr()).to_string_lossy().into_owned(),
                CStr::from_ptr(value.as_ptr()).to_string_lossy().into_owned(),
            )
        };
        let name = name.trim().to_uppercase();
        // Long keys (e.g. HIERARCH) can't be written back as-is, so we don't
        // carry them.
        if is_structural_key(&name) || name.len() > 8 {
            continue;
        }
        header.set(&name, HeaderValue::from_card_value(&value));
    }

    Ok(header)
}

/// Write every card of `header` into the supplied HDU. Non-finite floats are
/// written as strings, because cfitsio can't format them.
#[track_caller]
pub(crate) fn fits_write_header(
    fits_fptr: &mut FitsFile,
    hdu: &FitsHdu,
    header: &Header,
) -> Result<(), FitsError> {
    let caller = std::panic::Location::caller();
    for (key, value) in header.iter() {
        if is_structural_key(key) {
            continue;
        }
        let result = match value {
            HeaderValue::Int(i) => hdu.write_key(fits_fptr, key, *i),
            HeaderValue::Float(f) if f.is_finite() => hdu.write_key(fits_fptr, key, *f),
            HeaderValue::Float(f) => hdu.write_key(fits_fptr, key, format!("{f}")),
            HeaderValue::Str(s) => hdu.write_key(fits_fptr, key, s.clone()),
        };
        result.map_err(|e| FitsError::Fitsio {
            fits_error: Box::new(e),
            fits_filename: fits_fptr.file_path().to_path_buf().into_boxed_path(),
            hdu_description: format!("{}", hdu.number + 1).into_boxed_str(),
            source_file: caller.file(),
            source_line: caller.line(),
            source_column: caller.column(),
        })?;
    }
    Ok(())
}

/// Given a FITS file pointer and a HDU, read the associated 2D image.
#[track_caller]
pub(crate) fn fits_get_image_2d(
    fits_fptr: &mut FitsFile,
    hdu: &FitsHdu,
) -> Result<Array2<f64>, FitsError> {
    let caller = std::panic::Location::caller();
    let shape = match &hdu.info {
        HduInfo::ImageInfo { shape, .. } => shape.clone(),
        _ => {
            return Err(FitsError::NotImage {
                fits_filename: fits_fptr.file_path().to_path_buf().into_boxed_path(),
                hdu_num: hdu.number + 1,
                source_file: caller.file(),
                source_line: caller.line(),
                source_column: caller.column(),
            })
        }
    };
    let bad_shape = |fits_fptr: &FitsFile| FitsError::BadShape {
        shape: shape.clone(),
        fits_filename: fits_fptr.file_path().to_path_buf().into_boxed_path(),
        hdu_num: hdu.number + 1,
        source_file: caller.file(),
        source_line: caller.line(),
        source_column: caller.column(),
    };
    if shape.len() != 2 {
        return Err(bad_shape(fits_fptr));
    }

    let data: Vec<f64> = hdu.read_image(fits_fptr).map_err(|e| FitsError::Fitsio {
        fits_error: Box::new(e),
        fits_filename: fits_fptr.file_path().to_path_buf().into_boxed_path(),
        hdu_description: format!("{}", hdu.number + 1).into_boxed_str(),
        source_file: caller.file(),
        source_line: caller.line(),
        source_column: caller.column(),
    })?;
    Array2::from_shape_vec((shape[0], shape[1]), data).map_err(|_| bad_shape(fits_fptr))
}

/// Given a FITS file pointer and a HDU, write a 2D image.
#[track_caller]
pub(crate) fn fits_write_image_2d(
    fits_fptr: &mut FitsFile,
    hdu: &FitsHdu,
    data: ArrayView2<f64>,
) -> Result<(), FitsError> {
    let caller = std::panic::Location::caller();
    let data = data.as_standard_layout();
    // A standard-layout array always has a contiguous slice.
    let slice = data.as_slice().unwrap_or(&[]);
    hdu.write_image(fits_fptr, slice)
        .map_err(|e| FitsError::Fitsio {
            fits_error: Box::new(e),
            fits_filename: fits_fptr.file_path().to_path_buf().into_boxed_path(),
            hdu_description: format!("{}", hdu.number + 1).into_boxed_str(),
            source_file: caller.file(),
            source_line: caller.line(),
            source_column: caller.column(),
        })
}

/// Add a named 2D double image extension.
#[track_caller]
pub(crate) fn fits_create_image_extension(
    fits_fptr: &mut FitsFile,
    name: &str,
    shape: (usize, usize),
) -> Result<FitsHdu, FitsError> {
    let dims = [shape.0, shape.1];
    let desc = ImageDescription {
        data_type: ImageType::Double,
        dimensions: &dims,
    };
    fits_fptr.create_image(name.to_string(), &desc).map_err(|e| {
        let caller = std::panic::Location::caller();
        FitsError::Fitsio {
            fits_error: Box::new(e),
            fits_filename: fits_fptr.file_path().to_path_buf().into_boxed_path(),
            hdu_description: name.to_string().into_boxed_str(),
            source_file: caller.file(),
            source_line: caller.line(),
            source_column: caller.column(),
        }
    })
}

/// The names (EXTNAME) of every extension after the primary HDU. Unnamed
/// extensions get their HDU number.
#[track_caller]
pub(crate) fn fits_extension_names(fits_fptr: &mut FitsFile) -> Result<Vec<String>, FitsError> {
    let mut num_hdus = 0;
    let mut status = 0;
    unsafe {
        // ffthdu = fits_get_num_hdus
        fitsio_sys::ffthdu(
            fits_fptr.as_raw(), /* I - FITS file pointer     */
            &mut num_hdus,      /* O - number of HDUs in file */
            &mut status,        /* IO - error status          */
        );
    }
    if status != 0 {
        let caller = std::panic::Location::caller();
        return Err(FitsError::Card {
            card: 0,
            status,
            fits_filename: fits_fptr.file_path().to_path_buf().into_boxed_path(),
            hdu_num: 0,
            source_file: caller.file(),
            source_line: caller.line(),
            source_column: caller.column(),
        });
    }

    let mut names = Vec::with_capacity(num_hdus.max(1) as usize - 1);
    for i in 1..num_hdus.max(1) as usize {
        let hdu = fits_open_hdu(fits_fptr, i)?;
        let name: Option<String> = fits_get_optional_key(fits_fptr, &hdu, "EXTNAME")?;
        names.push(name.unwrap_or_else(|| i.to_string()));
    }
    Ok(names)
}

/// Read the primary image and header of a file.
pub(crate) fn read_primary<P: AsRef<Path>>(file: P) -> Result<(Array2<f64>, Header), FitsError> {
    let mut fptr = fits_open(&file)?;
    let hdu = fits_open_hdu(&mut fptr, 0)?;
    let header = fits_read_header(&mut fptr, &hdu)?;
    let image = fits_get_image_2d(&mut fptr, &hdu)?;
    Ok((image, header))
}

/// Read only the primary header of a file.
pub(crate) fn read_primary_header<P: AsRef<Path>>(file: P) -> Result<Header, FitsError> {
    let mut fptr = fits_open(&file)?;
    let hdu = fits_open_hdu(&mut fptr, 0)?;
    fits_read_header(&mut fptr, &hdu)
}

/// Read a named image extension.
pub(crate) fn read_extension<P: AsRef<Path>>(
    file: P,
    name: &str,
) -> Result<Array2<f64>, FitsError> {
    let mut fptr = fits_open(&file)?;
    let hdu = fits_open_hdu(&mut fptr, name)?;
    fits_get_image_2d(&mut fptr, &hdu)
}

/// Write a file with a primary image, its header, and any named image
/// extensions. An existing file is overwritten.
pub(crate) fn write_image_file<P: AsRef<Path>>(
    file: P,
    image: ArrayView2<f64>,
    header: &Header,
    extensions: &[(String, Array2<f64>)],
) -> Result<(), FitsError> {
    let mut fptr = fits_create(&file, image.dim())?;
    let hdu = fits_open_hdu(&mut fptr, 0)?;
    fits_write_image_2d(&mut fptr, &hdu, image)?;
    fits_write_header(&mut fptr, &hdu, header)?;
    for (name, data) in extensions {
        let hdu = fits_create_image_extension(&mut fptr, name, data.dim())?;
        fits_write_image_2d(&mut fptr, &hdu, data.view())?;
    }
    Ok(())
}

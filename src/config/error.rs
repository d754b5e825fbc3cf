// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::path::PathBuf;

use thiserror::Error;

use super::{ConfigFileType, CONFIG_FILE_TYPES_COMMA_SEPARATED};

#[derive(Error, Debug)]
pub(crate) enum ConfigError {
    #[error("Config file '{}' doesn't have a recognised file extension! Valid extensions are: {}", file.display(), *CONFIG_FILE_TYPES_COMMA_SEPARATED)]
    UnknownExtension { file: PathBuf },

    #[error("Couldn't decode {file_type} structure from {}:\n{message}", file.display())]
    Parse {
        file: PathBuf,
        file_type: ConfigFileType,
        message: String,
    },

    #[error("No config file (nirdrs.toml, nirdrs.json or nirdrs.yaml) was found in {}", dir.display())]
    NotFound { dir: PathBuf },

    #[error("Required config parameter {0} is missing or empty")]
    Missing(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Unknown instrument mode '{mode}'; known modes are: {known}")]
    UnknownMode { mode: String, known: String },

    #[error("Couldn't read config file {}: {source}", file.display())]
    Io {
        file: PathBuf,
        source: std::io::Error,
    },
}

use std::path::PathBuf;
use thiserror::Error;

use crate::edit::EditError;

#[derive(Error, Debug)]
pub enum GoModError {
    #[error("go.mod:{line}: {message}")]
    Parse { line: usize, message: String },

    #[error("go.mod:{line}: invalid version {version:?}: {source}")]
    InvalidVersion {
        line: usize,
        version: String,
        #[source]
        source: semver::Error,
    },

    #[error("go.mod has no module directive: {path}")]
    MissingModule { path: PathBuf },

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot relocate {path}: module directory must be absolute")]
    RelativeModuleDir { path: PathBuf },

    #[error("manifest edit failed: {0}")]
    Edit(#[from] EditError),
}

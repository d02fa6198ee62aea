use std::path::PathBuf;
use thiserror::Error;

use crate::gomod::GoModError;
use crate::ts::ParseError;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to walk module directory: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("syntax error in {path}:{line}:{column}")]
    Syntax {
        path: PathBuf,
        line: usize,
        column: usize,
    },

    #[error("parser error: {0}")]
    Parser(#[from] ParseError),

    #[error("invalid manifest {path}: {source}")]
    Manifest {
        path: PathBuf,
        #[source]
        source: GoModError,
    },

    #[error("{path} declares no module")]
    MissingModule { path: PathBuf },

    #[error("no Go packages found under {dir}")]
    NoPackages { dir: PathBuf },

    #[error("loaded sources exceed the position space")]
    TooLarge,
}

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// A filesystem operation that failed on one path.
#[derive(Error, Debug)]
#[error("{op} {path}: {source}")]
pub struct FsError {
    pub op: &'static str,
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

impl FsError {
    pub fn new(op: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self {
            op,
            path: path.into(),
            source,
        }
    }
}

/// One failure observed during a sync run.
#[derive(Debug)]
pub enum Failure {
    /// Directory walk (producer side).
    Walk(FsError),
    /// A copy worker.
    Worker(FsError),
    /// A copy worker panicked; the payload message is kept.
    Panic(String),
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::Walk(e) => write!(f, "walk dir: {e}"),
            Failure::Worker(e) => write!(f, "copy: {e}"),
            Failure::Panic(msg) => write!(f, "panic: {msg}"),
        }
    }
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("invalid ignore pattern {pattern:?}: {source}")]
    InvalidIgnore {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("sync failed: {}", join_failures(.failures))]
    Failed { failures: Vec<Failure> },
}

impl SyncError {
    /// First failure observed, walk errors before worker errors.
    pub fn first(&self) -> Option<&Failure> {
        match self {
            SyncError::Failed { failures } => failures.first(),
            SyncError::InvalidIgnore { .. } => None,
        }
    }
}

fn join_failures(failures: &[Failure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

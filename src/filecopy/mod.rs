//! Concurrent reconciliation of source trees into a destination root.
//!
//! Sources are either real directories ([`RebaseSource`]) or in-memory
//! generated content ([`GeneratedSource`]). Copied files get the local "now"
//! as their modification time, so later runs only compare against the
//! destination's own clock.

mod engine;
mod errors;
mod paths;
mod progress;
mod source;

pub use engine::{
    resolve_workers, sync, DestPathHook, DidCopyHook, RetainHook, ShouldCopyHook, SyncOptions,
    DEFAULT_WORKERS, WORKERS_ENV,
};
pub use errors::{Failure, FsError, SyncError};
pub use paths::{clean_go_fs_path, clean_path, rebase_path};
pub use progress::{ProgressCallback, ProgressLogger, ProgressStats, MASSIVE_FILE_THRESHOLD};
pub use source::{
    mtime_newer, newest_mod_time, Content, ContentComparator, EntryKind, GeneratedSource,
    RebaseSource, SourceEntry, SyncSource,
};

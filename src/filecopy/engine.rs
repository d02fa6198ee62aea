//! Producer/worker-pool sync of one or more source roots into a destination.
//!
//! The calling thread walks the sources and feeds a bounded channel; a fixed
//! pool of scoped worker threads drains it and copies files. The first worker
//! error or panic raises a shared flag that stops further dequeuing and makes
//! the walk stop producing. All failures are returned together once every
//! worker has drained.

use std::any::Any;
use std::collections::HashMap;
use std::ffi::OsString;
use std::fs::{self, Metadata};
use std::io::{self, Read, Write};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use filetime::FileTime;
use regex::Regex;
use tracing::{debug, info};

use super::errors::{Failure, FsError, SyncError};
use super::progress::{Progress, ProgressCallback, ProgressStats};
use super::source::{EntryKind, SourceEntry, SyncSource};

pub const DEFAULT_WORKERS: usize = 50;
pub const WORKERS_ENV: &str = "SHADOWBUILD_COPY_WORKERS";
const CHANNEL_CAPACITY: usize = 1000;
const COPY_BUFFER_SIZE: usize = 4 * 1024 * 1024;

pub type DestPathHook<'a> = Box<dyn Fn(&Path) -> PathBuf + Send + Sync + 'a>;
pub type DidCopyHook<'a> = Box<dyn Fn(&Path, &Path) + Send + Sync + 'a>;
pub type ShouldCopyHook<'a> =
    Box<dyn Fn(&SourceEntry, &Path, &Metadata) -> io::Result<bool> + Send + Sync + 'a>;
pub type RetainHook<'a> = Box<dyn Fn(&Path) -> bool + Send + Sync + 'a>;

#[derive(Default)]
pub struct SyncOptions<'a> {
    /// Regexes matched against source paths; matches are not synced.
    pub ignores: Vec<String>,
    /// Remove destination entries not present in the source.
    pub delete_not_found: bool,
    /// Copy every file regardless of freshness.
    pub force: bool,
    /// Worker count; 0 picks [`DEFAULT_WORKERS`] or the environment override.
    pub workers: usize,
    pub on_progress: Option<ProgressCallback<'a>>,
    pub process_dest_path: Option<DestPathHook<'a>>,
    /// Called with (source, destination) right before a file is copied.
    pub did_copy: Option<DidCopyHook<'a>>,
    /// Replaces the source's freshness rule when the destination exists.
    pub should_copy: Option<ShouldCopyHook<'a>>,
    /// Destination paths kept even when absent from the source.
    pub retain: Option<RetainHook<'a>>,
}

/// Worker count after applying the environment override.
pub fn resolve_workers(configured: usize) -> usize {
    if let Ok(value) = std::env::var(WORKERS_ENV) {
        match value.trim().parse::<usize>() {
            Ok(n) if n > 0 => {
                info!(workers = n, "file copy workers from {WORKERS_ENV}");
                return n;
            }
            _ => debug!(value = %value, "ignoring invalid {WORKERS_ENV}"),
        }
    }
    if configured > 0 {
        configured
    } else {
        DEFAULT_WORKERS
    }
}

struct IgnoreMatcher {
    patterns: Vec<Regex>,
}

impl IgnoreMatcher {
    fn new(patterns: &[String]) -> Result<Self, SyncError> {
        let patterns = patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|source| SyncError::InvalidIgnore {
                    pattern: p.clone(),
                    source,
                })
            })
            .collect::<Result<_, _>>()?;
        Ok(Self { patterns })
    }

    fn is_match(&self, path: &Path) -> bool {
        if self.patterns.is_empty() {
            return false;
        }
        let path = path.to_string_lossy();
        self.patterns.iter().any(|re| re.is_match(&path))
    }
}

struct CopyJob {
    entry: SourceEntry,
    dest: PathBuf,
    dest_meta: Option<Metadata>,
}

/// Why the walk stopped early.
enum Halt {
    Error(FsError),
    /// Workers failed; their errors are reported instead.
    Stopped,
}

impl From<FsError> for Halt {
    fn from(e: FsError) -> Self {
        Halt::Error(e)
    }
}

struct Shared<'s, 'o, S> {
    source: &'s S,
    opts: &'s SyncOptions<'o>,
    progress: &'s Progress<'s>,
    failed: &'s AtomicBool,
}

impl<S: SyncSource> Shared<'_, '_, S> {
    fn dest_path(&self, path: &Path) -> PathBuf {
        let dest = self.source.dest_path(path);
        match &self.opts.process_dest_path {
            Some(hook) => hook(&dest),
            None => dest,
        }
    }
}

/// Make `dest` mirror the union of `roots` read through `source`.
pub fn sync<S: SyncSource>(
    roots: &[PathBuf],
    source: &S,
    opts: &SyncOptions<'_>,
) -> Result<ProgressStats, SyncError> {
    let ignore = IgnoreMatcher::new(&opts.ignores)?;
    let workers = resolve_workers(opts.workers);
    let progress = Progress::new(opts.on_progress.as_ref());
    let failed = AtomicBool::new(false);
    let worker_errors: Mutex<Vec<Failure>> = Mutex::new(Vec::new());

    let shared = Shared {
        source,
        opts,
        progress: &progress,
        failed: &failed,
    };

    let walk_result = thread::scope(|scope| {
        let (tx, rx) = mpsc::sync_channel::<CopyJob>(CHANNEL_CAPACITY);
        let rx = Arc::new(Mutex::new(rx));
        for _ in 0..workers {
            let rx = Arc::clone(&rx);
            let shared = &shared;
            let worker_errors = &worker_errors;
            scope.spawn(move || run_worker(shared, rx, worker_errors));
        }
        // workers hold the only receivers now; once they all exit, sends fail
        drop(rx);

        let walker = Walker {
            shared: &shared,
            ignore: &ignore,
            tx,
        };
        let result = roots
            .iter()
            .try_for_each(|root| walker.handle_root(root));
        // dropping the walker closes the channel so idle workers exit
        drop(walker);
        result
    });

    progress.report(true);

    let mut failures = Vec::new();
    if let Err(Halt::Error(e)) = walk_result {
        failures.push(Failure::Walk(e));
    }
    failures.extend(
        worker_errors
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner),
    );
    if !failures.is_empty() {
        return Err(SyncError::Failed { failures });
    }
    Ok(progress.snapshot(true))
}

struct Walker<'w, 's, 'o, S> {
    shared: &'w Shared<'s, 'o, S>,
    ignore: &'w IgnoreMatcher,
    tx: SyncSender<CopyJob>,
}

impl<S: SyncSource> Walker<'_, '_, '_, S> {
    fn handle_root(&self, root: &Path) -> Result<(), Halt> {
        if self.ignore.is_match(root) {
            return Ok(());
        }
        let entry = self
            .shared
            .source
            .entry(root)
            .map_err(|e| FsError::new("stat", root, e))?;
        let dest = self.shared.dest_path(root);
        self.handle(entry, dest, None)
    }

    /// `dest_meta` is `Some` when the parent listing already resolved it.
    fn handle(
        &self,
        entry: SourceEntry,
        dest: PathBuf,
        dest_meta: Option<Option<Metadata>>,
    ) -> Result<(), Halt> {
        if self.ignore.is_match(&entry.path) {
            return Ok(());
        }
        match entry.kind {
            EntryKind::Other => Ok(()),
            EntryKind::File => self.handle_file(entry, dest, dest_meta),
            EntryKind::Dir => self.handle_dir(entry, dest),
        }
    }

    fn handle_file(
        &self,
        entry: SourceEntry,
        dest: PathBuf,
        dest_meta: Option<Option<Metadata>>,
    ) -> Result<(), Halt> {
        let shared = self.shared;
        shared.progress.file_seen();

        let dest_meta = match dest_meta {
            Some(meta) => meta,
            None => stat_if_exists(&dest)?,
        };

        let mut should_copy = true;
        if !shared.opts.force {
            if let Some(meta) = &dest_meta {
                should_copy = match &shared.opts.should_copy {
                    Some(hook) => {
                        hook(&entry, &dest, meta).map_err(|e| FsError::new("compare", &dest, e))?
                    }
                    None => shared.source.newer_than(&entry, &dest, meta),
                };
            }
        }

        if !should_copy {
            shared.progress.file_skipped();
            return Ok(());
        }
        if shared.failed.load(Ordering::Acquire) {
            return Err(Halt::Stopped);
        }
        self.tx
            .send(CopyJob {
                entry,
                dest,
                dest_meta,
            })
            .map_err(|_| Halt::Stopped)
    }

    fn handle_dir(&self, entry: SourceEntry, dest: PathBuf) -> Result<(), Halt> {
        let shared = self.shared;
        let existing = read_dest_dir(&dest)?;
        if existing.is_none() {
            fs::create_dir_all(&dest).map_err(|e| FsError::new("create dest dir", &dest, e))?;
        }

        let children = shared
            .source
            .children(&entry)
            .map_err(|e| FsError::new("read src dir", &entry.path, e))?;

        // name -> (metadata, still missing from source)
        let mut dest_entries: HashMap<OsString, (Option<Metadata>, bool)> = existing
            .unwrap_or_default()
            .into_iter()
            .map(|(name, meta)| (name, (Some(meta), true)))
            .collect();

        for child in children {
            if shared.failed.load(Ordering::Acquire) {
                return Err(Halt::Stopped);
            }
            let child_dest = shared.dest_path(&child.path);
            let child_meta = match child_dest
                .file_name()
                .and_then(|name| dest_entries.get_mut(name))
            {
                Some((meta, missing)) => {
                    *missing = false;
                    meta.take()
                }
                None => None,
            };
            self.handle(child, child_dest, Some(child_meta))?;
        }

        if shared.opts.delete_not_found {
            for (name, (_, missing)) in dest_entries {
                if !missing {
                    continue;
                }
                let stale = dest.join(&name);
                if let Some(retain) = &shared.opts.retain {
                    if retain(&stale) {
                        continue;
                    }
                }
                debug!(path = %stale.display(), "removing stale destination entry");
                remove_path(&stale).map_err(|e| FsError::new("remove", &stale, e))?;
            }
        }
        Ok(())
    }
}

/// List a destination directory. A regular file in its place is removed and
/// reported as absent.
fn read_dest_dir(dest: &Path) -> Result<Option<Vec<(OsString, Metadata)>>, FsError> {
    match fs::symlink_metadata(dest) {
        Ok(meta) if meta.is_dir() => {}
        Ok(_) => {
            remove_path(dest).map_err(|e| FsError::new("remove existing dest file", dest, e))?;
            return Ok(None);
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(FsError::new("stat", dest, e)),
    }

    let mut entries = Vec::new();
    let iter = fs::read_dir(dest).map_err(|e| FsError::new("read dest dir", dest, e))?;
    for item in iter {
        let item = item.map_err(|e| FsError::new("read dest dir", dest, e))?;
        let meta = item
            .metadata()
            .map_err(|e| FsError::new("stat", item.path(), e))?;
        entries.push((item.file_name(), meta));
    }
    Ok(Some(entries))
}

fn stat_if_exists(path: &Path) -> Result<Option<Metadata>, FsError> {
    match fs::metadata(path) {
        Ok(meta) => Ok(Some(meta)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(FsError::new("stat", path, e)),
    }
}

fn remove_path(path: &Path) -> io::Result<()> {
    let meta = fs::symlink_metadata(path)?;
    if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

fn run_worker<S: SyncSource>(
    shared: &Shared<'_, '_, S>,
    rx: Arc<Mutex<Receiver<CopyJob>>>,
    errors: &Mutex<Vec<Failure>>,
) {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        let mut buf: Vec<u8> = Vec::new();
        loop {
            if shared.failed.load(Ordering::Acquire) {
                return;
            }
            let job = {
                let guard = rx.lock().unwrap_or_else(PoisonError::into_inner);
                guard.recv()
            };
            let Ok(job) = job else {
                return;
            };
            // another worker may have failed while this one waited in recv
            if shared.failed.load(Ordering::Acquire) {
                return;
            }
            if buf.is_empty() {
                buf = vec![0; COPY_BUFFER_SIZE];
            }
            if let Err(e) = copy_file(shared, &job, &mut buf) {
                shared.failed.store(true, Ordering::Release);
                errors
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(Failure::Worker(e));
                return;
            }
        }
    }));

    if let Err(payload) = outcome {
        shared.failed.store(true, Ordering::Release);
        errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Failure::Panic(panic_message(payload.as_ref())));
    }
}

fn copy_file<S: SyncSource>(
    shared: &Shared<'_, '_, S>,
    job: &CopyJob,
    buf: &mut [u8],
) -> Result<(), FsError> {
    let dest = &job.dest;
    if let Some(meta) = &job.dest_meta {
        if !meta.is_file() {
            // about to truncate, so clear whatever occupies the path
            remove_path(dest).map_err(|e| FsError::new("remove", dest, e))?;
        }
    }

    if let Some(hook) = &shared.opts.did_copy {
        hook(&job.entry.path, dest);
    }

    let mut reader = shared
        .source
        .open(&job.entry)
        .map_err(|e| FsError::new("open src file", &job.entry.path, e))?;
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|e| FsError::new("create dir", parent, e))?;
    }
    let mut writer =
        fs::File::create(dest).map_err(|e| FsError::new("create dest file", dest, e))?;

    loop {
        let n = match reader.read(buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(FsError::new("read", &job.entry.path, e)),
        };
        writer
            .write_all(&buf[..n])
            .map_err(|e| FsError::new("write dest file", dest, e))?;
    }
    drop(writer);

    filetime::set_file_mtime(dest, FileTime::now())
        .map_err(|e| FsError::new("set mtime", dest, e))?;

    shared.progress.file_copied();
    Ok(())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

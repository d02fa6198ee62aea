//! Integration tests for the file sync engine
//!
//! Exercises the public sync API against real temp trees: repeat runs,
//! deletion with retained paths, worker failures and generated content.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use filetime::FileTime;

use shadowbuild::content_digest;
use shadowbuild::filecopy::{
    rebase_path, sync, Content, Failure, GeneratedSource, RebaseSource, SourceEntry, SyncError,
    SyncOptions, SyncSource, DEFAULT_WORKERS,
};
use tempfile::TempDir;

fn write(path: &Path, content: &str) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

/// Source tree with a few nested files, canonicalized so rebased
/// destinations are predictable.
fn setup_source() -> (TempDir, PathBuf, PathBuf) {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("src");
    write(&src.join("main.go"), "package main\n");
    write(&src.join("pkg/util/util.go"), "package util\n");
    write(&src.join("pkg/util/util_test.go"), "package util\n");
    write(&src.join("README.md"), "# app\n");
    let src = fs::canonicalize(&src).unwrap();
    let dest = fs::canonicalize(dir.path()).unwrap().join("shadow");
    (dir, src, dest)
}

#[test]
fn test_second_sync_copies_nothing() {
    let (_dir, src, dest) = setup_source();
    let source = RebaseSource::new(&dest);
    let opts = SyncOptions::default();

    let first = sync(&[src.clone()], &source, &opts).unwrap();
    assert_eq!(first.total, 4);
    assert_eq!(first.copied, 4);
    assert_eq!(
        fs::read_to_string(rebase_path(&dest, &src.join("pkg/util/util.go"))).unwrap(),
        "package util\n"
    );

    let second = sync(&[src], &source, &opts).unwrap();
    assert_eq!(second.total, 4);
    assert_eq!(second.copied, 0);
    assert_eq!(second.finished, 4);
}

#[test]
fn test_force_copies_everything_again() {
    let (_dir, src, dest) = setup_source();
    let source = RebaseSource::new(&dest);
    sync(&[src.clone()], &source, &SyncOptions::default()).unwrap();

    let opts = SyncOptions {
        force: true,
        ..SyncOptions::default()
    };
    let stats = sync(&[src], &source, &opts).unwrap();
    assert_eq!(stats.copied, 4);
}

#[test]
fn test_delete_not_found_honors_retain() {
    let (_dir, src, dest) = setup_source();
    let source = RebaseSource::new(&dest);
    sync(&[src.clone()], &source, &SyncOptions::default()).unwrap();

    let shadow_src = rebase_path(&dest, &src);
    write(&shadow_src.join("stale.go"), "package main\n");
    write(&shadow_src.join("zz_generated.go"), "package main\n");
    write(&shadow_src.join("old/dir/file.go"), "package dir\n");
    fs::remove_file(src.join("README.md")).unwrap();

    let keep = shadow_src.join("zz_generated.go");
    let opts = SyncOptions {
        delete_not_found: true,
        retain: Some(Box::new(|p: &Path| p == keep)),
        ..SyncOptions::default()
    };
    sync(&[src], &source, &opts).unwrap();

    assert!(!shadow_src.join("stale.go").exists());
    assert!(!shadow_src.join("old").exists());
    assert!(!shadow_src.join("README.md").exists());
    assert!(shadow_src.join("zz_generated.go").exists());
    assert!(shadow_src.join("main.go").exists());
}

#[test]
fn test_without_delete_extra_files_survive() {
    let (_dir, src, dest) = setup_source();
    let source = RebaseSource::new(&dest);
    sync(&[src.clone()], &source, &SyncOptions::default()).unwrap();

    let extra = rebase_path(&dest, &src).join("extra.go");
    write(&extra, "package main\n");
    sync(&[src], &source, &SyncOptions::default()).unwrap();
    assert!(extra.exists());
}

/// Real tree whose `.go` files cannot be opened.
struct FailingSource {
    inner: RebaseSource,
    opened: AtomicUsize,
}

impl SyncSource for FailingSource {
    fn entry(&self, path: &Path) -> io::Result<SourceEntry> {
        self.inner.entry(path)
    }

    fn children(&self, dir: &SourceEntry) -> io::Result<Vec<SourceEntry>> {
        self.inner.children(dir)
    }

    fn dest_path(&self, path: &Path) -> PathBuf {
        self.inner.dest_path(path)
    }

    fn open(&self, entry: &SourceEntry) -> io::Result<Box<dyn Read + '_>> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        if entry.path.extension().is_some_and(|e| e == "go") {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "locked"));
        }
        self.inner.open(entry)
    }
}

#[test]
fn test_worker_failure_is_reported() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("src");
    for i in 0..200 {
        write(&src.join(format!("f{i:03}.go")), "package main\n");
    }
    let src = fs::canonicalize(&src).unwrap();
    let source = FailingSource {
        inner: RebaseSource::new(dir.path().join("shadow")),
        opened: AtomicUsize::new(0),
    };
    let opts = SyncOptions {
        workers: 2,
        ..SyncOptions::default()
    };

    let err = sync(&[src], &source, &opts).unwrap_err();
    let SyncError::Failed { failures } = err else {
        panic!("expected a failed sync");
    };
    assert!(!failures.is_empty());
    // each worker stops after its first error
    assert!(failures.len() <= 2);
    assert!(failures
        .iter()
        .all(|f| matches!(f, Failure::Worker(_))));
    assert!(source.opened.load(Ordering::SeqCst) < 200);
}

/// Real tree where exactly one file cannot be opened.
struct FailOnceSource {
    inner: RebaseSource,
    broken: PathBuf,
    failed: AtomicBool,
    /// Files opened successfully before the failure.
    opened: Mutex<Vec<PathBuf>>,
    /// Opens that started after the failure.
    late: AtomicUsize,
}

impl SyncSource for FailOnceSource {
    fn entry(&self, path: &Path) -> io::Result<SourceEntry> {
        self.inner.entry(path)
    }

    fn children(&self, dir: &SourceEntry) -> io::Result<Vec<SourceEntry>> {
        self.inner.children(dir)
    }

    fn dest_path(&self, path: &Path) -> PathBuf {
        self.inner.dest_path(path)
    }

    fn open(&self, entry: &SourceEntry) -> io::Result<Box<dyn Read + '_>> {
        if self.failed.load(Ordering::SeqCst) {
            self.late.fetch_add(1, Ordering::SeqCst);
        } else if entry.path == self.broken {
            self.failed.store(true, Ordering::SeqCst);
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "locked"));
        } else {
            self.opened.lock().unwrap().push(entry.path.clone());
        }
        self.inner.open(entry)
    }
}

#[test]
fn test_single_failure_stops_default_pool() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("src");
    for i in 0..2000 {
        write(&src.join(format!("f{i:04}.go")), "package main\n");
    }
    let src = fs::canonicalize(&src).unwrap();
    let shadow = fs::canonicalize(dir.path()).unwrap().join("shadow");
    let source = FailOnceSource {
        inner: RebaseSource::new(&shadow),
        broken: src.join("f0100.go"),
        failed: AtomicBool::new(false),
        opened: Mutex::new(Vec::new()),
        late: AtomicUsize::new(0),
    };
    let opts = SyncOptions::default();
    assert_eq!(opts.workers, 0);

    let err = sync(&[src.clone()], &source, &opts).unwrap_err();
    let SyncError::Failed { failures } = &err else {
        panic!("expected a failed sync, got {err}");
    };
    assert_eq!(failures.len(), 1);
    match err.first() {
        Some(Failure::Worker(e)) => assert_eq!(e.path, src.join("f0100.go")),
        other => panic!("unexpected first failure: {other:?}"),
    }

    // files copied before the failure stay in place
    let opened = source.opened.lock().unwrap();
    assert!(!opened.is_empty());
    for path in opened.iter() {
        assert_eq!(
            fs::read_to_string(rebase_path(&shadow, path)).unwrap(),
            "package main\n"
        );
    }
    assert!(!rebase_path(&shadow, &src.join("f0100.go")).exists());

    // only copies already in flight may still open, nothing new is dispatched
    assert!(source.late.load(Ordering::SeqCst) < DEFAULT_WORKERS);
    assert!(opened.len() + source.late.load(Ordering::SeqCst) < 2000 - 1);
    assert!(!rebase_path(&shadow, &src.join("f1999.go")).exists());
}

#[test]
fn test_generated_source_rewrites_only_changed_digests() {
    let dir = TempDir::new().unwrap();
    let shadow = dir.path().join("shadow");
    let mut contents = BTreeMap::new();
    contents.insert(
        PathBuf::from("/app/main.go"),
        Content::generated(b"package main\n".to_vec()),
    );
    contents.insert(
        PathBuf::from("/app/zz_gen.go"),
        Content::generated(b"package main\n\nvar x = 1\n".to_vec()),
    );

    // digests of what is already on disk
    let written: BTreeMap<PathBuf, String> = contents
        .iter()
        .map(|(k, c)| (rebase_path(&shadow, k), content_digest(&c.bytes)))
        .collect();
    let run = |contents: &BTreeMap<PathBuf, Content>, known: &BTreeMap<PathBuf, String>| {
        let source = GeneratedSource::new(
            &shadow,
            contents,
            Box::new(|_p: &Path, c: &Content, dest: &Path, _m: &fs::Metadata| {
                known.get(dest) != Some(&content_digest(&c.bytes))
            }),
        );
        sync(&source.roots(), &source, &SyncOptions::default()).unwrap()
    };

    let first = run(&contents, &BTreeMap::new());
    assert_eq!(first.copied, 2);
    let main_dest = shadow.join("app/main.go");
    let gen_dest = shadow.join("app/zz_gen.go");
    let mtime = |p: &Path| FileTime::from_last_modification_time(&fs::metadata(p).unwrap());
    // push the written files into the past so a rewrite would show
    let past = FileTime::from_unix_time(1_000_000_000, 0);
    filetime::set_file_mtime(&main_dest, past).unwrap();
    filetime::set_file_mtime(&gen_dest, past).unwrap();

    let second = run(&contents, &written);
    assert_eq!(second.copied, 0);
    assert_eq!(mtime(&main_dest), past);
    assert_eq!(mtime(&gen_dest), past);

    contents.insert(
        PathBuf::from("/app/zz_gen.go"),
        Content::generated(b"package main\n\nvar x = 2\n".to_vec()),
    );
    let third = run(&contents, &written);
    assert_eq!(third.copied, 1);
    assert_eq!(mtime(&main_dest), past);
    assert_ne!(mtime(&gen_dest), past);
    assert_eq!(
        fs::read_to_string(shadow.join("app/zz_gen.go")).unwrap(),
        "package main\n\nvar x = 2\n"
    );
}

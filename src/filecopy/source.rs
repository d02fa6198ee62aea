//! Sources the sync engine can read from.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs::{self, Metadata};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use super::paths::rebase_path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
    /// Symlinks, sockets and the like are not synced.
    Other,
}

/// One source file or directory.
#[derive(Debug, Clone)]
pub struct SourceEntry {
    pub path: PathBuf,
    /// Name relative to the parent directory.
    pub name: OsString,
    pub kind: EntryKind,
    pub modified: Option<SystemTime>,
}

impl SourceEntry {
    fn from_metadata(path: PathBuf, meta: &Metadata) -> Self {
        let kind = if meta.is_dir() {
            EntryKind::Dir
        } else if meta.is_file() {
            EntryKind::File
        } else {
            EntryKind::Other
        };
        let name = path.file_name().map(OsString::from).unwrap_or_default();
        Self {
            path,
            name,
            kind,
            modified: meta.modified().ok(),
        }
    }
}

/// Where the sync engine reads from and where each entry lands.
pub trait SyncSource: Sync {
    fn entry(&self, path: &Path) -> io::Result<SourceEntry>;

    fn children(&self, dir: &SourceEntry) -> io::Result<Vec<SourceEntry>>;

    fn dest_path(&self, path: &Path) -> PathBuf;

    /// Whether `entry` must overwrite an existing destination.
    fn newer_than(&self, entry: &SourceEntry, dest: &Path, dest_meta: &Metadata) -> bool {
        let _ = dest;
        mtime_newer(entry, dest_meta)
    }

    fn open(&self, entry: &SourceEntry) -> io::Result<Box<dyn Read + '_>>;
}

/// Default freshness rule: a non-regular destination is always stale,
/// otherwise compare modification times.
pub fn mtime_newer(entry: &SourceEntry, dest_meta: &Metadata) -> bool {
    if !dest_meta.is_file() {
        return true;
    }
    match (entry.modified, dest_meta.modified().ok()) {
        (Some(src), Some(dest)) => src > dest,
        _ => true,
    }
}

/// Real filesystem paths copied to `rebase_dir/<absolute path>`.
#[derive(Debug, Clone)]
pub struct RebaseSource {
    rebase_dir: PathBuf,
}

impl RebaseSource {
    pub fn new(rebase_dir: impl Into<PathBuf>) -> Self {
        Self {
            rebase_dir: rebase_dir.into(),
        }
    }
}

impl SyncSource for RebaseSource {
    fn entry(&self, path: &Path) -> io::Result<SourceEntry> {
        let meta = fs::metadata(path)?;
        Ok(SourceEntry::from_metadata(path.to_path_buf(), &meta))
    }

    fn children(&self, dir: &SourceEntry) -> io::Result<Vec<SourceEntry>> {
        let mut children = Vec::new();
        for item in fs::read_dir(&dir.path)? {
            let item = item?;
            // read_dir metadata does not follow links, so links stay Other
            let meta = item.metadata()?;
            children.push(SourceEntry::from_metadata(item.path(), &meta));
        }
        children.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(children)
    }

    fn dest_path(&self, path: &Path) -> PathBuf {
        rebase_path(&self.rebase_dir, path)
    }

    fn open(&self, entry: &SourceEntry) -> io::Result<Box<dyn Read + '_>> {
        Ok(Box::new(fs::File::open(&entry.path)?))
    }
}

/// Generated file content, optionally derived from a real source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Content {
    /// Destination path the backing source was copied to, when there is one.
    pub source_dest: Option<PathBuf>,
    pub bytes: Arc<[u8]>,
}

impl Content {
    pub fn generated(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            source_dest: None,
            bytes: bytes.into(),
        }
    }

    pub fn derived(source_dest: PathBuf, bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            source_dest: Some(source_dest),
            bytes: bytes.into(),
        }
    }
}

/// Decides whether a generated entry overwrites an existing destination.
pub type ContentComparator<'a> =
    Box<dyn Fn(&Path, &Content, &Path, &Metadata) -> bool + Send + Sync + 'a>;

/// In-memory files keyed by path. Only individual files can be roots.
pub struct GeneratedSource<'a> {
    base_dir: PathBuf,
    contents: &'a BTreeMap<PathBuf, Content>,
    comparator: ContentComparator<'a>,
}

impl<'a> GeneratedSource<'a> {
    pub fn new(
        base_dir: impl Into<PathBuf>,
        contents: &'a BTreeMap<PathBuf, Content>,
        comparator: ContentComparator<'a>,
    ) -> Self {
        Self {
            base_dir: base_dir.into(),
            contents,
            comparator,
        }
    }

    pub fn roots(&self) -> Vec<PathBuf> {
        self.contents.keys().cloned().collect()
    }

    fn content(&self, path: &Path) -> io::Result<&Content> {
        self.contents.get(path).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no generated content for {}", path.display()),
            )
        })
    }
}

impl SyncSource for GeneratedSource<'_> {
    fn entry(&self, path: &Path) -> io::Result<SourceEntry> {
        self.content(path)?;
        Ok(SourceEntry {
            path: path.to_path_buf(),
            name: path.file_name().map(OsString::from).unwrap_or_default(),
            kind: EntryKind::File,
            modified: None,
        })
    }

    fn children(&self, dir: &SourceEntry) -> io::Result<Vec<SourceEntry>> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("generated source has no directories: {}", dir.path.display()),
        ))
    }

    fn dest_path(&self, path: &Path) -> PathBuf {
        rebase_path(&self.base_dir, path)
    }

    fn newer_than(&self, entry: &SourceEntry, dest: &Path, dest_meta: &Metadata) -> bool {
        match self.contents.get(&entry.path) {
            Some(content) => (self.comparator)(&entry.path, content, dest, dest_meta),
            None => true,
        }
    }

    fn open(&self, entry: &SourceEntry) -> io::Result<Box<dyn Read + '_>> {
        let content = self.content(&entry.path)?;
        Ok(Box::new(&content.bytes[..]))
    }
}

/// Newest modification time of a file, or of the direct children of a
/// directory. `None` for an empty directory.
pub fn newest_mod_time(path: &Path) -> io::Result<Option<SystemTime>> {
    let meta = fs::metadata(path)?;
    if !meta.is_dir() {
        return Ok(Some(meta.modified()?));
    }
    let mut newest = None;
    for item in fs::read_dir(path)? {
        let modified = item?.metadata()?.modified()?;
        if newest.map_or(true, |n| modified > n) {
            newest = Some(modified);
        }
    }
    Ok(newest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::{set_file_mtime, FileTime};
    use tempfile::TempDir;

    #[test]
    fn rebase_source_lists_sorted_children() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("b.go"), "b").unwrap();
        fs::write(dir.path().join("a.go"), "a").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();

        let source = RebaseSource::new("/shadow");
        let root = source.entry(dir.path()).unwrap();
        assert_eq!(root.kind, EntryKind::Dir);

        let names: Vec<_> = source
            .children(&root)
            .unwrap()
            .into_iter()
            .map(|c| c.name.to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.go", "b.go", "sub"]);
    }

    #[test]
    fn mtime_rule_prefers_newer_source() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src.txt");
        let dest = dir.path().join("dest.txt");
        fs::write(&src, "x").unwrap();
        fs::write(&dest, "x").unwrap();
        set_file_mtime(&src, FileTime::from_unix_time(2_000_000_000, 0)).unwrap();
        set_file_mtime(&dest, FileTime::from_unix_time(1_000_000_000, 0)).unwrap();

        let source = RebaseSource::new(dir.path());
        let entry = source.entry(&src).unwrap();
        let dest_meta = fs::metadata(&dest).unwrap();
        assert!(source.newer_than(&entry, &dest, &dest_meta));

        set_file_mtime(&dest, FileTime::from_unix_time(2_100_000_000, 0)).unwrap();
        let dest_meta = fs::metadata(&dest).unwrap();
        assert!(!source.newer_than(&entry, &dest, &dest_meta));
    }

    #[test]
    fn directory_dest_is_always_stale() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src.txt");
        fs::write(&src, "x").unwrap();
        let dest = dir.path().join("dest");
        fs::create_dir(&dest).unwrap();

        let source = RebaseSource::new(dir.path());
        let entry = source.entry(&src).unwrap();
        assert!(source.newer_than(&entry, &dest, &fs::metadata(&dest).unwrap()));
    }

    #[test]
    fn generated_source_reads_content() {
        let mut contents = BTreeMap::new();
        contents.insert(
            PathBuf::from("/proj/gen.go"),
            Content::generated(b"package gen\n".to_vec()),
        );
        let source = GeneratedSource::new("/shadow", &contents, Box::new(|_, _, _, _| false));

        let entry = source.entry(Path::new("/proj/gen.go")).unwrap();
        let mut text = String::new();
        source.open(&entry).unwrap().read_to_string(&mut text).unwrap();
        assert_eq!(text, "package gen\n");
        assert_eq!(
            source.dest_path(&entry.path),
            PathBuf::from("/shadow/proj/gen.go")
        );
        assert!(source.children(&entry).is_err());
    }

    #[test]
    fn newest_mod_time_of_dir() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        fs::write(&a, "").unwrap();
        fs::write(&b, "").unwrap();
        set_file_mtime(&a, FileTime::from_unix_time(1_000_000_000, 0)).unwrap();
        set_file_mtime(&b, FileTime::from_unix_time(1_500_000_000, 0)).unwrap();

        let newest = newest_mod_time(dir.path()).unwrap().unwrap();
        let expected = fs::metadata(&b).unwrap().modified().unwrap();
        assert_eq!(newest, expected);
    }
}

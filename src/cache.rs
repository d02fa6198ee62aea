//! Caches: compiled ast-grep patterns (per thread) and the persisted digest
//! map of generated files.
//!
//! The digest file is read once at the start of a run and rewritten as a
//! whole at the end. Two runs against the same shadow root are not
//! coordinated; the atomic write only guarantees readers never see a torn
//! file.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::{Path, PathBuf};

use ast_grep_core::Pattern;
use ast_grep_language::SupportLang;
use thiserror::Error;
use tracing::{debug, warn};
use xxhash_rust::xxh3::xxh3_64;

use crate::edit::{atomic_write, EditError};

const MAX_CACHE_ENTRIES: usize = 256;

thread_local! {
    // "<lang>:<pattern>" so one pattern string compiled for two languages
    // never collides
    static PATTERN_CACHE: RefCell<HashMap<String, Pattern>> =
        RefCell::new(HashMap::new());
}

/// Compiled pattern for `lang`, compiled at most once per thread until the
/// cache fills up and is cleared.
pub fn get_or_compile_pattern(pattern_str: &str, lang: SupportLang) -> Pattern {
    let cache_key = format!("{lang:?}:{pattern_str}");

    PATTERN_CACHE.with(|cache| {
        let mut cache = cache.borrow_mut();
        if let Some(p) = cache.get(&cache_key) {
            return p.clone();
        }
        if cache.len() >= MAX_CACHE_ENTRIES {
            cache.clear();
        }
        let compiled = Pattern::new(pattern_str, lang);
        cache.insert(cache_key, compiled.clone());
        compiled
    })
}

pub fn pattern_cache_size() -> usize {
    PATTERN_CACHE.with(|cache| cache.borrow().len())
}

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("failed to encode digest cache: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("failed to write digest cache {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: EditError,
    },
}

/// Hex digest of generated content.
pub fn content_digest(bytes: &[u8]) -> String {
    format!("{:016x}", xxh3_64(bytes))
}

/// Last digest written per destination path.
#[derive(Debug, Default)]
pub struct DigestCache {
    path: PathBuf,
    digests: BTreeMap<String, String>,
}

impl DigestCache {
    /// Start empty without reading anything, as a forced run does.
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            digests: BTreeMap::new(),
        }
    }

    /// Read the cache at `path`. A missing file is an empty cache; an
    /// unreadable or malformed one is logged and ignored.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let digests = match std::fs::read(&path) {
            Ok(bytes) if bytes.is_empty() => BTreeMap::new(),
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(map) => map,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "bad digest cache ignored");
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unreadable digest cache ignored");
                BTreeMap::new()
            }
        };
        debug!(path = %path.display(), entries = digests.len(), "loaded digest cache");
        Self { path, digests }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.digests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.digests.is_empty()
    }

    pub fn get(&self, dest: &Path) -> Option<&str> {
        self.digests
            .get(dest.to_string_lossy().as_ref())
            .map(String::as_str)
    }

    /// Every destination with a recorded digest.
    pub fn paths(&self) -> impl Iterator<Item = &Path> + '_ {
        self.digests.keys().map(Path::new)
    }

    /// Whether `dest` was last written with exactly `digest`.
    pub fn is_current(&self, dest: &Path, digest: &str) -> bool {
        self.get(dest) == Some(digest)
    }

    /// Replace every entry; entries for paths no longer generated are dropped.
    pub fn replace_all(&mut self, entries: impl IntoIterator<Item = (PathBuf, String)>) {
        self.digests = entries
            .into_iter()
            .map(|(p, d)| (p.to_string_lossy().into_owned(), d))
            .collect();
    }

    /// Write the whole cache atomically.
    pub fn save(&self) -> Result<(), CacheError> {
        let data = serde_json::to_vec_pretty(&self.digests)?;
        atomic_write(&self.path, &data).map_err(|source| CacheError::Write {
            path: self.path.clone(),
            source,
        })?;
        debug!(path = %self.path.display(), entries = self.digests.len(), "saved digest cache");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn pattern_cache_reuses_compilations() {
        let before = pattern_cache_size();
        get_or_compile_pattern("fmt.Println($A)", SupportLang::Go);
        get_or_compile_pattern("fmt.Println($A)", SupportLang::Go);
        assert_eq!(pattern_cache_size(), before + 1);
    }

    #[test]
    fn digest_is_stable_hex() {
        let a = content_digest(b"package a\n");
        assert_eq!(a.len(), 16);
        assert_eq!(a, content_digest(b"package a\n"));
        assert_ne!(a, content_digest(b"package b\n"));
    }

    #[test]
    fn save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("meta").join("src-digest.json");

        let mut cache = DigestCache::load(&path);
        assert!(cache.is_empty());
        cache.replace_all(vec![(PathBuf::from("/shadow/a.go"), "abc".to_string())]);
        cache.save().unwrap();

        let loaded = DigestCache::load(&path);
        assert!(loaded.is_current(Path::new("/shadow/a.go"), "abc"));
        assert!(!loaded.is_current(Path::new("/shadow/a.go"), "abd"));
        assert_eq!(loaded.get(Path::new("/shadow/b.go")), None);
    }

    #[test]
    fn corrupt_cache_is_ignored() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("src-digest.json");
        std::fs::write(&path, "{not json").unwrap();
        let cache = DigestCache::load(&path);
        assert!(cache.is_empty());
    }
}

//! Per-run locations derived from the settings and the project directory.

use std::env;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;
use xxhash_rust::xxh3::xxh3_64;

use crate::config::{Settings, GOCACHE_ENV};
use crate::filecopy::rebase_path;

pub const GOROOT_ENV: &str = "GOROOT";
pub const DIGEST_FILE: &str = "src-digest.json";

#[derive(Error, Debug)]
pub enum ContextError {
    #[error("cannot resolve project directory {path}: {source}")]
    ProjectDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Where one project's shadow tree, digest file and build cache live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunContext {
    pub project_dir: PathBuf,
    /// `<base>/<name>/<project hash>`
    pub meta_root: PathBuf,
    /// Root every source path is rebased under.
    pub shadow_root: PathBuf,
    pub digest_path: PathBuf,
    pub go_cache: PathBuf,
    pub goroot: Option<PathBuf>,
}

impl RunContext {
    pub fn new(settings: &Settings, project_dir: impl AsRef<Path>) -> Result<Self, ContextError> {
        let project_dir = project_dir.as_ref();
        let project_dir =
            std::fs::canonicalize(project_dir).map_err(|source| ContextError::ProjectDir {
                path: project_dir.to_path_buf(),
                source,
            })?;
        let base = settings
            .rewrite
            .base_dir
            .clone()
            .unwrap_or_else(env::temp_dir);
        Ok(Self::with_base(
            &base,
            &settings.rewrite.name,
            project_dir,
            settings.build.go_cache.clone(),
        ))
    }

    /// Context rooted at `base` without touching the filesystem.
    pub fn with_base(
        base: &Path,
        name: &str,
        project_dir: PathBuf,
        go_cache: Option<PathBuf>,
    ) -> Self {
        let hash = format!(
            "{:016x}",
            xxh3_64(project_dir.to_string_lossy().as_bytes())
        );
        let meta_root = base.join(name).join(hash);
        let shadow_root = meta_root.join("src");
        let digest_path = meta_root.join(DIGEST_FILE);
        let go_cache = go_cache
            .or_else(|| non_empty_env(GOCACHE_ENV).map(PathBuf::from))
            .unwrap_or_else(|| meta_root.join("go-build-cache"));
        let goroot = non_empty_env(GOROOT_ENV).map(PathBuf::from);

        debug!(
            project = %project_dir.display(),
            shadow = %shadow_root.display(),
            "run context"
        );
        Self {
            project_dir,
            meta_root,
            shadow_root,
            digest_path,
            go_cache,
            goroot,
        }
    }

    /// The project's own directory inside the shadow tree.
    pub fn shadow_project_dir(&self) -> PathBuf {
        rebase_path(&self.shadow_root, &self.project_dir)
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn layout_under_base() {
        let ctx = RunContext::with_base(
            Path::new("/tmp/base"),
            "shadowbuild",
            PathBuf::from("/work/app"),
            Some(PathBuf::from("/cache")),
        );
        assert!(ctx.meta_root.starts_with("/tmp/base/shadowbuild"));
        assert_eq!(ctx.shadow_root, ctx.meta_root.join("src"));
        assert_eq!(ctx.digest_path, ctx.meta_root.join("src-digest.json"));
        assert_eq!(ctx.go_cache, PathBuf::from("/cache"));
        assert_eq!(
            ctx.shadow_project_dir(),
            ctx.shadow_root.join("work").join("app")
        );
    }

    #[test]
    fn hash_separates_projects() {
        let a = RunContext::with_base(Path::new("/b"), "n", PathBuf::from("/p/a"), None);
        let b = RunContext::with_base(Path::new("/b"), "n", PathBuf::from("/p/b"), None);
        let a2 = RunContext::with_base(Path::new("/b"), "n", PathBuf::from("/p/a"), None);
        assert_ne!(a.meta_root, b.meta_root);
        assert_eq!(a.meta_root, a2.meta_root);
    }

    #[test]
    fn project_dir_is_canonicalized() {
        let dir = TempDir::new().unwrap();
        let mut settings = Settings::default();
        settings.rewrite.base_dir = Some(dir.path().join("base"));
        let ctx = RunContext::new(&settings, dir.path().join(".")).unwrap();
        assert_eq!(ctx.project_dir, dir.path().canonicalize().unwrap());
    }

    #[test]
    fn missing_project_dir() {
        let dir = TempDir::new().unwrap();
        let err = RunContext::new(&Settings::default(), dir.path().join("nope")).unwrap_err();
        assert!(matches!(err, ContextError::ProjectDir { .. }));
    }
}

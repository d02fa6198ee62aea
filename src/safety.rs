use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::filecopy::clean_path;

/// Keeps every write of a run inside the shadow root and away from the
/// trees it mirrors.
#[derive(Debug, Clone)]
pub struct ShadowGuard {
    /// Absolute, symlink-resolved shadow root
    shadow_root: PathBuf,
    /// Directories that must never be written to
    forbidden_paths: Vec<PathBuf>,
}

#[derive(Error, Debug)]
pub enum SafetyError {
    #[error("path is outside the shadow root: {path} (root: {root})")]
    OutsideShadow { path: PathBuf, root: PathBuf },

    #[error("path is in forbidden directory: {path} (forbidden: {forbidden})")]
    ForbiddenPath { path: PathBuf, forbidden: PathBuf },

    #[error("shadow root {root} lies inside source tree {source_dir}")]
    NestedRoot { root: PathBuf, source_dir: PathBuf },

    #[error("failed to resolve path {path}: {source}")]
    Resolve {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ShadowGuard {
    /// Guard for `shadow_root`, which need not exist yet.
    ///
    /// The Go module cache and the toolchain root (when known) are always
    /// forbidden.
    pub fn new(shadow_root: impl AsRef<Path>, goroot: Option<&Path>) -> Result<Self, SafetyError> {
        let shadow_root = resolve(shadow_root.as_ref())?;

        let mut forbidden_paths = Vec::new();
        if let Some(home) = home::home_dir() {
            if let Ok(mod_cache) = home.join("go/pkg/mod").canonicalize() {
                forbidden_paths.push(mod_cache);
            }
        }
        if let Some(goroot) = goroot {
            if let Ok(goroot) = goroot.canonicalize() {
                forbidden_paths.push(goroot);
            }
        }

        Ok(Self {
            shadow_root,
            forbidden_paths,
        })
    }

    /// Refuse source trees that contain the shadow root; copying them would
    /// recurse into the copy.
    pub fn check_sources(&self, sources: &[PathBuf]) -> Result<(), SafetyError> {
        for source in sources {
            let resolved = resolve(source)?;
            if self.shadow_root.starts_with(&resolved) {
                return Err(SafetyError::NestedRoot {
                    root: self.shadow_root.clone(),
                    source_dir: resolved,
                });
            }
        }
        Ok(())
    }

    /// Check a destination path before it is written.
    ///
    /// Returns the resolved absolute path if safe. Relative paths are taken
    /// against the shadow root.
    pub fn validate_path(&self, path: impl AsRef<Path>) -> Result<PathBuf, SafetyError> {
        let path = path.as_ref();
        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.shadow_root.join(path)
        };
        let resolved = resolve(&absolute)?;

        if !resolved.starts_with(&self.shadow_root) {
            return Err(SafetyError::OutsideShadow {
                path: resolved,
                root: self.shadow_root.clone(),
            });
        }
        for forbidden in &self.forbidden_paths {
            if resolved.starts_with(forbidden) {
                return Err(SafetyError::ForbiddenPath {
                    path: resolved,
                    forbidden: forbidden.clone(),
                });
            }
        }
        Ok(resolved)
    }

    pub fn shadow_root(&self) -> &Path {
        &self.shadow_root
    }

    #[cfg(test)]
    pub fn with_forbidden(
        shadow_root: impl AsRef<Path>,
        forbidden: Vec<PathBuf>,
    ) -> Result<Self, SafetyError> {
        Ok(Self {
            shadow_root: resolve(shadow_root.as_ref())?,
            forbidden_paths: forbidden,
        })
    }
}

/// Canonicalize the longest existing prefix of `path` and append the rest
/// lexically, so paths that do not exist yet still resolve symlinks above
/// them.
fn resolve(path: &Path) -> Result<PathBuf, SafetyError> {
    let cleaned = clean_path(path);
    let mut existing = cleaned.as_path();
    let mut rest = Vec::new();
    loop {
        match existing.canonicalize() {
            Ok(canonical) => {
                let mut out = canonical;
                for part in rest.iter().rev() {
                    out.push(part);
                }
                return Ok(out);
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let (Some(parent), Some(name)) = (existing.parent(), existing.file_name()) else {
                    return Err(SafetyError::Resolve {
                        path: path.to_path_buf(),
                        source: e,
                    });
                };
                rest.push(name.to_os_string());
                existing = parent;
            }
            Err(source) => {
                return Err(SafetyError::Resolve {
                    path: path.to_path_buf(),
                    source,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn path_inside_missing_root() {
        let temp_dir = tempfile::tempdir().unwrap();
        let root = temp_dir.path().join("meta/src");
        let guard = ShadowGuard::new(&root, None).unwrap();

        let resolved = guard.validate_path(root.join("work/app/main.go")).unwrap();
        assert!(resolved.ends_with("meta/src/work/app/main.go"));
        assert!(guard.validate_path("work/app/go.mod").is_ok());
    }

    #[test]
    fn path_outside_root() {
        let temp_dir = tempfile::tempdir().unwrap();
        let root = temp_dir.path().join("src");
        let guard = ShadowGuard::new(&root, None).unwrap();

        let result = guard.validate_path(temp_dir.path().join("other/a.go"));
        assert!(matches!(result, Err(SafetyError::OutsideShadow { .. })));
        let result = guard.validate_path("../escape.go");
        assert!(matches!(result, Err(SafetyError::OutsideShadow { .. })));
    }

    #[test]
    fn forbidden_inside_root() {
        let temp_dir = tempfile::tempdir().unwrap();
        let root = temp_dir.path().join("src");
        let cache = root.join("cache");
        fs::create_dir_all(&cache).unwrap();
        let guard =
            ShadowGuard::with_forbidden(&root, vec![cache.canonicalize().unwrap()]).unwrap();

        let result = guard.validate_path(cache.join("x"));
        assert!(matches!(result, Err(SafetyError::ForbiddenPath { .. })));
    }

    #[test]
    fn shadow_inside_source_is_rejected() {
        let temp_dir = tempfile::tempdir().unwrap();
        let project = temp_dir.path().join("app");
        fs::create_dir_all(&project).unwrap();
        let guard = ShadowGuard::new(project.join(".shadow/src"), None).unwrap();

        let result = guard.check_sources(&[project.clone()]);
        assert!(matches!(result, Err(SafetyError::NestedRoot { .. })));

        let elsewhere = ShadowGuard::new(temp_dir.path().join("shadow"), None).unwrap();
        assert!(elsewhere.check_sources(&[project]).is_ok());
    }

    #[test]
    #[cfg(unix)]
    fn symlink_escape() {
        use std::os::unix::fs::symlink;

        let temp_dir = tempfile::tempdir().unwrap();
        let root = temp_dir.path().join("src");
        fs::create_dir_all(&root).unwrap();
        let outside = temp_dir.path().join("outside");
        fs::create_dir_all(&outside).unwrap();
        symlink(&outside, root.join("link")).unwrap();

        let guard = ShadowGuard::new(&root, None).unwrap();
        let result = guard.validate_path(root.join("link/a.go"));
        assert!(matches!(result, Err(SafetyError::OutsideShadow { .. })));
    }
}

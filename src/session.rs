//! Coordination point for one rewrite pass.
//!
//! Visitors ask the session for edit surfaces; every surface is created once
//! per key no matter how many threads race for it. After visiting, [`Session::gen`]
//! hands every materialized surface's final text to the caller.

use std::any::Any;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, warn};

use crate::filecopy::clean_go_fs_path;
use crate::once_map::OnceMap;
use crate::registry::Registry;
use crate::rewrite::{next_name, FileSurface, ImportError, NewFileSurface, SurfaceError};
use crate::syntax::{FileId, Package, PackageId, Program, SourceFile};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Import(#[from] ImportError),

    #[error("rendering {path}: {source}")]
    Render {
        path: PathBuf,
        #[source]
        source: SurfaceError,
    },
}

/// Final text of one surface, passed to the [`Session::gen`] callback.
#[derive(Debug)]
pub enum Generated<'a> {
    /// A loaded file rewritten as a whole.
    Rewrite { file: &'a SourceFile, text: String },
    /// A loaded file with localized edits.
    Edit { file: &'a SourceFile, text: String },
    /// A new file inside a package directory.
    Package {
        package: &'a Package,
        kind: &'a str,
        /// File name without `.go`.
        real_name: &'a str,
        path: &'a Path,
        text: String,
    },
}

#[derive(Debug)]
struct PackageEntry {
    package: PackageId,
    kind: String,
    real_name: String,
    surface: NewFileSurface,
}

/// Keyed scratch space shared by all visitors of a session.
#[derive(Default)]
pub struct SessionData {
    values: DashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl SessionData {
    pub fn set<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.values.insert(key.into(), Arc::new(value));
    }

    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let value = Arc::clone(self.values.get(key)?.value());
        value.downcast::<T>().ok()
    }

    pub fn remove(&self, key: &str) {
        self.values.remove(key);
    }
}

type SurfaceSlot = Result<Arc<FileSurface>, ImportError>;

pub struct Session {
    registry: Arc<Registry>,
    project_dir: PathBuf,
    file_rewrites: OnceMap<FileId, SurfaceSlot>,
    file_edits: OnceMap<FileId, SurfaceSlot>,
    package_edits: OnceMap<String, Result<Arc<PackageEntry>, ImportError>>,
    overlay: Mutex<BTreeMap<PathBuf, String>>,
    data: SessionData,
}

impl Session {
    /// `project_dir` is the absolute directory of the target project.
    pub fn new(registry: Arc<Registry>, project_dir: impl Into<PathBuf>) -> Self {
        Self {
            registry,
            project_dir: project_dir.into(),
            file_rewrites: OnceMap::new(),
            file_edits: OnceMap::new(),
            package_edits: OnceMap::new(),
            overlay: Mutex::new(BTreeMap::new()),
            data: SessionData::default(),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn program(&self) -> &Arc<Program> {
        self.registry.program()
    }

    pub fn data(&self) -> &SessionData {
        &self.data
    }

    /// Surface whose output replaces `file` as a whole.
    pub fn file_rewrite(&self, file: FileId) -> Result<Arc<FileSurface>, ImportError> {
        self.file_rewrites.get_or_init(file, || {
            FileSurface::new(&self.registry, file).map(Arc::new)
        })
    }

    /// Surface for localized edits of `file`.
    pub fn file_edit(&self, file: FileId) -> Result<Arc<FileSurface>, ImportError> {
        self.file_edits.get_or_init(file, || {
            FileSurface::new(&self.registry, file).map(Arc::new)
        })
    }

    /// New file of the given kind inside `package`. The file is named after
    /// the first of `kind`, `kind1`, ... not taken by a file of the package.
    pub fn package_edit(
        &self,
        package: PackageId,
        kind: &str,
    ) -> Result<NewFileSurfaceHandle, ImportError> {
        let program = self.program();
        self.package_edit_with(package, kind, |pkg, candidate| {
            !pkg.files
                .iter()
                .any(|f| program.file(*f).file_name().strip_suffix(".go") == Some(candidate))
        })
    }

    /// [`Session::package_edit`] with the name check supplied by the caller.
    /// `name_free` only runs while the surface for `kind` is being created.
    fn package_edit_with(
        &self,
        package: PackageId,
        kind: &str,
        mut name_free: impl FnMut(&Package, &str) -> bool,
    ) -> Result<NewFileSurfaceHandle, ImportError> {
        let pkg = self.program().package(package);
        let key = format!("{}:{}", pkg.import_path, kind);

        let entry = self.package_edits.get_or_init(key, || {
            let real_name = next_name(kind, |candidate| name_free(pkg, candidate))?;
            let path = clean_go_fs_path(&pkg.dir.join(format!("{real_name}.go")));
            debug!(package = %pkg.import_path, %real_name, "new package file");
            Ok(Arc::new(PackageEntry {
                package,
                kind: kind.to_string(),
                real_name,
                surface: NewFileSurface::new(path, pkg.name.clone()),
            }))
        })?;
        Ok(NewFileSurfaceHandle { entry })
    }

    /// Put a file at `path` relative to the shadow root.
    pub fn set_rewrite_file(&self, path: impl AsRef<Path>, content: impl Into<String>) {
        let key = clean_go_fs_path(&Path::new("/").join(path.as_ref()));
        self.set_file(key, content.into());
    }

    /// Replace a file at `path` relative to the project directory.
    pub fn replace_file(&self, path: impl AsRef<Path>, content: impl Into<String>) {
        let key = clean_go_fs_path(&self.project_dir.join(path.as_ref()));
        self.set_file(key, content.into());
    }

    fn set_file(&self, key: PathBuf, content: String) {
        self.overlay
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, content);
    }

    /// Files added through [`Session::set_rewrite_file`] and
    /// [`Session::replace_file`], keyed by their source-space path.
    pub fn overlay(&self) -> BTreeMap<PathBuf, String> {
        self.overlay
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Hand every materialized surface to `callback`: file rewrites, then
    /// file edits, then new package files, each group in key order.
    ///
    /// Returns `Ok(false)` when the callback stopped the walk.
    pub fn gen(&self, mut callback: impl FnMut(Generated<'_>) -> bool) -> Result<bool, SessionError> {
        let program = self.program();

        for (file, slot) in self.file_rewrites.snapshot() {
            let surface = match slot {
                Ok(surface) => surface,
                Err(err) => {
                    warn!(path = %program.file(file).path.display(), %err, "skipping failed file rewrite");
                    continue;
                }
            };
            let text = render(&surface)?;
            if !callback(Generated::Rewrite {
                file: program.file(file),
                text,
            }) {
                return Ok(false);
            }
        }

        for (file, slot) in self.file_edits.snapshot() {
            let surface = match slot {
                Ok(surface) => surface,
                Err(err) => {
                    warn!(path = %program.file(file).path.display(), %err, "skipping failed file edit");
                    continue;
                }
            };
            let text = render(&surface)?;
            if !callback(Generated::Edit {
                file: program.file(file),
                text,
            }) {
                return Ok(false);
            }
        }

        for (key, slot) in self.package_edits.snapshot() {
            let entry = match slot {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(%key, %err, "skipping failed package file");
                    continue;
                }
            };
            let text = entry.surface.render();
            if !callback(Generated::Package {
                package: program.package(entry.package),
                kind: &entry.kind,
                real_name: &entry.real_name,
                path: entry.surface.path(),
                text,
            }) {
                return Ok(false);
            }
        }

        Ok(true)
    }
}

fn render(surface: &FileSurface) -> Result<String, SessionError> {
    surface.render().map_err(|source| SessionError::Render {
        path: surface.path().to_path_buf(),
        source,
    })
}

/// Shared handle to a package's new file.
#[derive(Debug, Clone)]
pub struct NewFileSurfaceHandle {
    entry: Arc<PackageEntry>,
}

impl NewFileSurfaceHandle {
    /// File name without `.go`.
    pub fn real_name(&self) -> &str {
        &self.entry.real_name
    }

    pub fn surface(&self) -> &NewFileSurface {
        &self.entry.surface
    }

    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.entry, &other.entry)
    }
}

impl std::ops::Deref for NewFileSurfaceHandle {
    type Target = NewFileSurface;

    fn deref(&self) -> &NewFileSurface {
        &self.entry.surface
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syntax::{Loader, ModuleSpec};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::thread;

    fn session() -> Session {
        let program = Loader::default()
            .load_sources(
                ModuleSpec::new("example.com/demo", "/demo"),
                vec![
                    ("/demo/a.go".into(), "package demo\n\nfunc A() {}\n".into()),
                    ("/demo/mock.go".into(), "package demo\n".into()),
                    ("/demo/mock1.go".into(), "package demo\n".into()),
                ],
            )
            .unwrap();
        let registry = Registry::build(Arc::new(program)).unwrap();
        Session::new(Arc::new(registry), "/demo")
    }

    #[test]
    fn racing_callers_get_one_surface() {
        let session = session();
        let file = session.program().files[0].id;
        let barrier = Barrier::new(100);
        let surfaces: Vec<Arc<FileSurface>> = thread::scope(|scope| {
            let handles: Vec<_> = (0..100)
                .map(|_| {
                    scope.spawn(|| {
                        barrier.wait();
                        session.file_rewrite(file).unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert!(surfaces.iter().all(|s| Arc::ptr_eq(s, &surfaces[0])));

        let edit = session.file_edit(file).unwrap();
        assert!(!Arc::ptr_eq(&edit, &surfaces[0]));
    }

    #[test]
    fn racing_callers_get_one_package_file() {
        let session = session();
        let pkg = session.program().packages[0].id;
        let checks = AtomicUsize::new(0);
        let barrier = Barrier::new(100);
        let handles: Vec<NewFileSurfaceHandle> = thread::scope(|scope| {
            let threads: Vec<_> = (0..100)
                .map(|_| {
                    scope.spawn(|| {
                        barrier.wait();
                        session
                            .package_edit_with(pkg, "mock_stub", |p, candidate| {
                                checks.fetch_add(1, Ordering::SeqCst);
                                !p.files.iter().any(|f| {
                                    session.program().file(*f).file_name()
                                        == format!("{candidate}.go")
                                })
                            })
                            .unwrap()
                    })
                })
                .collect();
            threads.into_iter().map(|t| t.join().unwrap()).collect()
        });

        assert!(handles.iter().all(|h| h.same_as(&handles[0])));
        assert!(handles.iter().all(|h| h.real_name() == "mock_stub"));
        assert_eq!(checks.load(Ordering::SeqCst), 1);

        let mut names = Vec::new();
        session
            .gen(|g| {
                if let Generated::Package { real_name, .. } = g {
                    names.push(real_name.to_string());
                }
                true
            })
            .unwrap();
        assert_eq!(names, vec!["mock_stub"]);
    }

    #[test]
    fn package_file_name_skips_existing_files() {
        let session = session();
        let pkg = session.program().packages[0].id;
        let mock = session.package_edit(pkg, "mock").unwrap();
        assert_eq!(mock.real_name(), "mock2");
        let again = session.package_edit(pkg, "mock").unwrap();
        assert!(mock.same_as(&again));
        let trace = session.package_edit(pkg, "trace").unwrap();
        assert_eq!(trace.real_name(), "trace");
        assert_eq!(trace.path(), Path::new("/demo/trace.go"));
    }

    #[test]
    fn gen_orders_groups_and_can_stop() {
        let session = session();
        let program = session.program().clone();
        let a = program.files[0].id;
        let pkg = program.packages[0].id;

        session.package_edit(pkg, "gen").unwrap().add_code("var X = 1");
        session.file_edit(a).unwrap().append("// edited\n");
        session.file_rewrite(a).unwrap().append("// rewritten\n");

        let mut seen = Vec::new();
        let finished = session
            .gen(|g| {
                seen.push(match g {
                    Generated::Rewrite { text, .. } => format!("rewrite:{}", text.ends_with("// rewritten\n")),
                    Generated::Edit { text, .. } => format!("edit:{}", text.ends_with("// edited\n")),
                    Generated::Package { real_name, text, .. } => {
                        format!("pkg:{real_name}:{}", text.contains("var X = 1"))
                    }
                });
                true
            })
            .unwrap();
        assert!(finished);
        assert_eq!(seen, vec!["rewrite:true", "edit:true", "pkg:gen:true"]);

        let mut calls = 0;
        let finished = session
            .gen(|_| {
                calls += 1;
                false
            })
            .unwrap();
        assert!(!finished);
        assert_eq!(calls, 1);
    }

    #[test]
    fn gen_skips_surfaces_that_failed_to_open() {
        let program = Loader::default()
            .load_sources(
                ModuleSpec::new("example.com/dup", "/dup"),
                vec![
                    ("/dup/bad.go".into(), "package dup\n\nimport \"fmt\"\nimport \"fmt\"\n".into()),
                    ("/dup/good.go".into(), "package dup\n".into()),
                ],
            )
            .unwrap();
        let session = Session::new(Arc::new(Registry::build(Arc::new(program)).unwrap()), "/dup");
        let files: Vec<FileId> = session.program().files.iter().map(|f| f.id).collect();
        let (bad, good) = if session.program().file(files[0]).file_name() == "bad.go" {
            (files[0], files[1])
        } else {
            (files[1], files[0])
        };

        assert!(matches!(
            session.file_edit(bad),
            Err(ImportError::DuplicateImport { .. })
        ));
        session.file_edit(good).unwrap().append("// ok\n");

        let mut edited = Vec::new();
        let finished = session
            .gen(|g| {
                if let Generated::Edit { file, .. } = g {
                    edited.push(file.file_name().to_string());
                }
                true
            })
            .unwrap();
        assert!(finished);
        assert_eq!(edited, vec!["good.go"]);
    }

    #[test]
    fn overlay_paths_are_cleaned() {
        let session = session();
        session.set_rewrite_file("mod/x@v1.0.0/a.go", "a");
        session.replace_file("go.mod", "module m\n");
        let overlay = session.overlay();
        assert_eq!(overlay.get(Path::new("/mod/x/v1.0.0/a.go")).map(String::as_str), Some("a"));
        assert!(overlay.contains_key(Path::new("/demo/go.mod")));
    }

    #[test]
    fn data_store_round_trips_typed_values() {
        let session = session();
        session.data().set("count", 3usize);
        assert_eq!(session.data().get::<usize>("count").as_deref(), Some(&3));
        assert!(session.data().get::<String>("count").is_none());
        session.data().remove("count");
        assert!(session.data().get::<usize>("count").is_none());
    }
}

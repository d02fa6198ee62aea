//! Module loading: directory walk, parallel parsing, arena construction.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rayon::prelude::*;
use tracing::{debug, info};
use walkdir::WalkDir;

use super::arena::{Arena, Pos, PACKAGE_KIND};
use super::errors::LoadError;
use super::program::{
    FileId, Module, ModuleId, ModuleRole, Package, PackageId, Program, SourceFile,
};
use crate::gomod::GoMod;
use crate::pool;
use crate::ts::ParseError;

/// Directory names never descended into.
const SKIPPED_DIRS: &[&str] = &["vendor", "testdata"];

/// A module loaded alongside the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleSpec {
    pub path: String,
    pub dir: PathBuf,
    pub version: Option<String>,
    pub is_std: bool,
    /// Import paths to load; empty loads every package.
    pub packages: Vec<String>,
}

impl ModuleSpec {
    pub fn new(path: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            dir: dir.into(),
            version: None,
            is_std: false,
            packages: Vec::new(),
        }
    }

    fn import_path(&self, rel: &Path) -> String {
        let rel = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        match (self.is_std, rel.is_empty()) {
            (true, _) => rel,
            (false, true) => self.path.clone(),
            (false, false) => format!("{}/{}", self.path, rel),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Also load `_test.go` files.
    pub include_tests: bool,
}

struct PendingFile {
    module: usize,
    dir: PathBuf,
    import_path: String,
    path: PathBuf,
    text: String,
}

struct ParsedFile {
    pending: PendingFile,
    tree: tree_sitter::Tree,
    package_name: String,
}

#[derive(Debug, Default)]
pub struct Loader {
    options: LoadOptions,
}

impl Loader {
    pub fn new(options: LoadOptions) -> Self {
        Self { options }
    }

    /// Load the module rooted at `target_dir` plus `extras`.
    pub fn load(&self, target_dir: &Path, extras: &[ModuleSpec]) -> Result<Program, LoadError> {
        let target_dir = fs::canonicalize(target_dir).map_err(|source| LoadError::Io {
            path: target_dir.to_path_buf(),
            source,
        })?;
        let manifest = target_dir.join("go.mod");
        let text = fs::read_to_string(&manifest).map_err(|source| LoadError::Io {
            path: manifest.clone(),
            source,
        })?;
        let gomod = GoMod::parse(&text).map_err(|source| LoadError::Manifest {
            path: manifest.clone(),
            source,
        })?;
        let module_path = gomod
            .module
            .ok_or_else(|| LoadError::MissingModule { path: manifest })?;

        let mut specs = vec![ModuleSpec::new(module_path, target_dir.clone())];
        specs.extend(extras.iter().cloned());

        let mut pending = Vec::new();
        for (idx, spec) in specs.iter().enumerate() {
            let files = self.collect_files(idx, spec)?;
            if idx == 0 && files.is_empty() {
                return Err(LoadError::NoPackages { dir: target_dir });
            }
            pending.extend(files);
        }

        self.build(&specs, pending)
    }

    /// Load one module from in-memory sources.
    pub fn load_sources(
        &self,
        module: ModuleSpec,
        sources: Vec<(PathBuf, String)>,
    ) -> Result<Program, LoadError> {
        let pending = sources
            .into_iter()
            .map(|(path, text)| {
                let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
                let rel = dir.strip_prefix(&module.dir).unwrap_or(Path::new(""));
                PendingFile {
                    module: 0,
                    import_path: module.import_path(rel),
                    dir,
                    path,
                    text,
                }
            })
            .collect();
        self.build(std::slice::from_ref(&module), pending)
    }

    fn collect_files(&self, idx: usize, spec: &ModuleSpec) -> Result<Vec<PendingFile>, LoadError> {
        let root = spec.dir.clone();
        let walker = WalkDir::new(&root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| {
                if e.depth() == 0 || !e.file_type().is_dir() {
                    return true;
                }
                let name = e.file_name().to_string_lossy();
                if name.starts_with('.') || name.starts_with('_') {
                    return false;
                }
                if SKIPPED_DIRS.contains(&name.as_ref()) {
                    return false;
                }
                // nested modules are separate units
                !e.path().join("go.mod").exists()
            });

        let mut files = Vec::new();
        for entry in walker {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if !name.ends_with(".go") {
                continue;
            }
            if name.ends_with("_test.go") && !self.options.include_tests {
                continue;
            }
            let path = entry.path().to_path_buf();
            let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
            let rel = dir.strip_prefix(&root).unwrap_or(Path::new(""));
            let import_path = spec.import_path(rel);
            if !spec.packages.is_empty() && !spec.packages.contains(&import_path) {
                continue;
            }
            let text = fs::read_to_string(&path).map_err(|source| LoadError::Io {
                path: path.clone(),
                source,
            })?;
            files.push(PendingFile {
                module: idx,
                dir,
                import_path,
                path,
                text,
            });
        }
        Ok(files)
    }

    fn build(&self, specs: &[ModuleSpec], pending: Vec<PendingFile>) -> Result<Program, LoadError> {
        let parsed = pending
            .into_par_iter()
            .map(parse_file)
            .collect::<Result<Vec<_>, _>>()?;

        // (module, dir, package name) -> files, in path order
        let mut groups: BTreeMap<(usize, PathBuf, String), Vec<ParsedFile>> = BTreeMap::new();
        for file in parsed {
            let key = (
                file.pending.module,
                file.pending.dir.clone(),
                file.package_name.clone(),
            );
            groups.entry(key).or_default().push(file);
        }

        let mut program = Program {
            arena: Arena::new(),
            modules: specs
                .iter()
                .enumerate()
                .map(|(idx, spec)| Module {
                    id: ModuleId(idx as u32),
                    path: spec.path.clone(),
                    dir: spec.dir.clone(),
                    version: spec.version.clone(),
                    role: if idx == 0 {
                        ModuleRole::Target
                    } else {
                        ModuleRole::Extra
                    },
                    is_std: spec.is_std,
                    manifest: (!spec.is_std).then(|| spec.dir.join("go.mod")),
                    packages: Vec::new(),
                })
                .collect(),
            packages: Vec::new(),
            files: Vec::new(),
        };

        let mut next_base: u64 = 1;
        for ((module_idx, dir, name), mut files) in groups {
            files.sort_by(|a, b| a.pending.path.cmp(&b.pending.path));
            let package_id = PackageId(program.packages.len() as u32);
            let root = program.arena.alloc(PACKAGE_KIND, None, None);

            let mut import_path = files[0].pending.import_path.clone();
            if self.options.include_tests && name.ends_with("_test") {
                import_path.push_str("_test");
            }

            let mut file_ids = Vec::with_capacity(files.len());
            for file in files {
                let len = file.pending.text.len() as u64;
                if next_base + len >= u64::from(u32::MAX) {
                    return Err(LoadError::TooLarge);
                }
                let base = Pos(next_base as u32);
                next_base += len + 1;

                let file_root = program.arena.convert_tree(file.tree.root_node(), base);
                program.arena.push_child(root, file_root);

                let file_id = FileId(program.files.len() as u32);
                program.files.push(SourceFile {
                    id: file_id,
                    path: file.pending.path,
                    text: Arc::from(file.pending.text),
                    base,
                    package: package_id,
                    root: file_root,
                });
                file_ids.push(file_id);
            }

            debug!(package = %import_path, files = file_ids.len(), "loaded package");
            program.modules[module_idx].packages.push(package_id);
            program.packages.push(Package {
                id: package_id,
                name,
                import_path,
                dir,
                module: ModuleId(module_idx as u32),
                files: file_ids,
                root,
            });
        }

        info!(
            modules = program.modules.len(),
            packages = program.packages.len(),
            files = program.files.len(),
            nodes = program.arena.len(),
            "program loaded"
        );
        Ok(program)
    }
}

fn parse_file(pending: PendingFile) -> Result<ParsedFile, LoadError> {
    let tree = pool::with_parser(|parser| parser.parse_strict(&pending.text)).map_err(|e| match e {
        ParseError::Syntax { line, column, .. } => LoadError::Syntax {
            path: pending.path.clone(),
            line,
            column,
        },
        other => LoadError::Parser(other),
    })?;

    let package_name = package_name(&tree, &pending.text).ok_or_else(|| LoadError::Syntax {
        path: pending.path.clone(),
        line: 1,
        column: 1,
    })?;

    Ok(ParsedFile {
        pending,
        tree,
        package_name,
    })
}

fn package_name(tree: &tree_sitter::Tree, text: &str) -> Option<String> {
    let root = tree.root_node();
    let mut cursor = root.walk();
    let clause = root
        .named_children(&mut cursor)
        .find(|n| n.kind() == "package_clause")?;
    let mut cursor = clause.walk();
    let ident = clause
        .named_children(&mut cursor)
        .find(|n| n.kind() == "package_identifier")?;
    text.get(ident.byte_range()).map(str::to_string)
}

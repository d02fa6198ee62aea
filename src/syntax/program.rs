//! Loaded modules, packages and files sharing one [`Arena`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::arena::{Arena, NodeId, Pos, Span};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ModuleId(pub(crate) u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PackageId(pub(crate) u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FileId(pub(crate) u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleRole {
    /// The module being built.
    Target,
    /// A dependency whose packages are rewritten too.
    Extra,
}

#[derive(Debug, Clone)]
pub struct Module {
    pub id: ModuleId,
    /// Import path from the `module` directive.
    pub path: String,
    /// Absolute directory holding `go.mod`.
    pub dir: PathBuf,
    pub version: Option<String>,
    pub role: ModuleRole,
    /// Packages come from the standard library under GOROOT.
    pub is_std: bool,
    /// Path of the module's go.mod, when it has one.
    pub manifest: Option<PathBuf>,
    pub packages: Vec<PackageId>,
}

#[derive(Debug, Clone)]
pub struct Package {
    pub id: PackageId,
    pub name: String,
    pub import_path: String,
    pub dir: PathBuf,
    pub module: ModuleId,
    pub files: Vec<FileId>,
    /// Synthetic root whose children are the file roots.
    pub root: NodeId,
}

#[derive(Debug, Clone)]
pub struct SourceFile {
    pub id: FileId,
    pub path: PathBuf,
    pub text: Arc<str>,
    pub base: Pos,
    pub package: PackageId,
    pub root: NodeId,
}

impl SourceFile {
    /// Position one past the last byte.
    pub fn end(&self) -> Pos {
        self.base.advance(self.text.len())
    }

    pub fn contains(&self, pos: Pos) -> bool {
        self.base <= pos && pos <= self.end()
    }

    /// Byte offset of a position inside this file.
    pub fn offset_of(&self, pos: Pos) -> Option<usize> {
        if !self.contains(pos) {
            return None;
        }
        Some((pos.0 - self.base.0) as usize)
    }

    pub fn pos_at(&self, offset: usize) -> Pos {
        self.base.advance(offset)
    }

    /// Source text between two positions of this file.
    pub fn slice(&self, start: Pos, end: Pos) -> Option<&str> {
        let s = self.offset_of(start)?;
        let e = self.offset_of(end)?;
        self.text.get(s..e)
    }

    pub fn file_name(&self) -> &str {
        self.path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
    }
}

/// Everything one load produced.
#[derive(Debug, Default)]
pub struct Program {
    pub arena: Arena,
    pub modules: Vec<Module>,
    pub packages: Vec<Package>,
    pub files: Vec<SourceFile>,
}

impl Program {
    pub fn module(&self, id: ModuleId) -> &Module {
        &self.modules[id.0 as usize]
    }

    pub fn package(&self, id: PackageId) -> &Package {
        &self.packages[id.0 as usize]
    }

    pub fn file(&self, id: FileId) -> &SourceFile {
        &self.files[id.0 as usize]
    }

    pub fn target_module(&self) -> Option<&Module> {
        self.modules.iter().find(|m| m.role == ModuleRole::Target)
    }

    pub fn package_by_path(&self, import_path: &str) -> Option<&Package> {
        self.packages.iter().find(|p| p.import_path == import_path)
    }

    pub fn file_by_path(&self, path: &Path) -> Option<&SourceFile> {
        self.files.iter().find(|f| f.path == path)
    }

    /// File owning a position. Files are laid out in ascending base order.
    pub fn file_at(&self, pos: Pos) -> Option<&SourceFile> {
        if !pos.is_valid() {
            return None;
        }
        let idx = self.files.partition_point(|f| f.base <= pos);
        let file = self.files.get(idx.checked_sub(1)?)?;
        file.contains(pos).then_some(file)
    }

    /// Source text covered by a node. `None` for synthesized nodes.
    pub fn node_text(&self, node: NodeId) -> Option<&str> {
        let Span { start, end } = self.arena.span(node)?;
        self.file_at(start)?.slice(start, end)
    }

    pub fn package_roots(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.packages.iter().map(|p| p.root)
    }
}

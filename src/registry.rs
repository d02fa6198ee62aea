//! Stable identities and lookups for every node of one load.
//!
//! One pre-order traversal records each node's parent. The position index
//! used by [`Registry::node_by_pos`] is built on first use. Wrapper types
//! such as [`FuncDecl`] are created once per node and shared afterwards,
//! including between concurrent callers.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use thiserror::Error;

use crate::once_map::OnceMap;
use crate::syntax::{FileId, NodeId, PackageId, Pos, Program, Span};

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("internal error: node {node} reached from two parents")]
    DuplicateParent { node: NodeId },
}

/// Receiver of a method declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receiver {
    pub ptr: bool,
    pub type_name: String,
}

/// A function or method declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuncDecl {
    pub node: NodeId,
    pub file: FileId,
    pub name: String,
    pub receiver: Option<Receiver>,
    pub body: Option<NodeId>,
}

impl FuncDecl {
    /// `name`, `T.name` or `(*T).name`.
    pub fn qualified_name(&self) -> String {
        match &self.receiver {
            None => self.name.clone(),
            Some(Receiver {
                ptr: true,
                type_name,
            }) => format!("(*{type_name}).{}", self.name),
            Some(Receiver {
                ptr: false,
                type_name,
            }) => format!("{type_name}.{}", self.name),
        }
    }
}

/// An import spec of an existing file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportSpec {
    pub path: String,
    /// Explicit local name, including `_` and `.`.
    pub alias: Option<String>,
    pub span: Span,
}

/// Per-file facts the edit surfaces need.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub file: FileId,
    /// End of the package name in the package clause.
    pub package_clause_end: Pos,
    pub imports: Vec<ImportSpec>,
}

pub struct Registry {
    program: Arc<Program>,
    parents: Vec<Option<NodeId>>,
    file_roots: HashMap<NodeId, FileId>,
    package_roots: HashMap<NodeId, PackageId>,
    pos_map: OnceLock<HashMap<(Pos, Pos), NodeId>>,
    funcs: OnceMap<NodeId, Option<Arc<FuncDecl>>>,
    files: OnceMap<FileId, Arc<FileInfo>>,
}

impl Registry {
    pub fn build(program: Arc<Program>) -> Result<Self, RegistryError> {
        let arena = &program.arena;
        let mut parents = vec![None; arena.len()];
        let mut seen = vec![false; arena.len()];

        for pkg in &program.packages {
            let mut stack = vec![pkg.root];
            seen[pkg.root.index()] = true;
            while let Some(node) = stack.pop() {
                for &child in arena.children(node).iter().rev() {
                    if seen[child.index()] {
                        return Err(RegistryError::DuplicateParent { node: child });
                    }
                    seen[child.index()] = true;
                    parents[child.index()] = Some(node);
                    stack.push(child);
                }
            }
        }

        let file_roots = program.files.iter().map(|f| (f.root, f.id)).collect();
        let package_roots = program.packages.iter().map(|p| (p.root, p.id)).collect();

        Ok(Self {
            program,
            parents,
            file_roots,
            package_roots,
            pos_map: OnceLock::new(),
            funcs: OnceMap::new(),
            files: OnceMap::new(),
        })
    }

    pub fn program(&self) -> &Arc<Program> {
        &self.program
    }

    pub fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.parents.get(node.index()).copied().flatten()
    }

    /// Node covering exactly `[start, end)`. When a parent and its only child
    /// share a range, the parent is returned.
    pub fn node_by_pos(&self, start: Pos, end: Pos) -> Option<NodeId> {
        if !start.is_valid() {
            return None;
        }
        let map = self.pos_map.get_or_init(|| {
            let mut map = HashMap::with_capacity(self.program.arena.len());
            // pre-order ids: the first node recorded for a range is the outermost
            for id in self.program.arena.ids() {
                if let Some(span) = self.program.arena.span(id) {
                    map.entry((span.start, span.end)).or_insert(id);
                }
            }
            map
        });
        map.get(&(start, end)).copied()
    }

    /// File enclosing a node; `None` for package roots.
    pub fn file_of(&self, node: NodeId) -> Option<FileId> {
        let mut current = Some(node);
        while let Some(n) = current {
            if let Some(file) = self.file_roots.get(&n) {
                return Some(*file);
            }
            current = self.parent(n);
        }
        None
    }

    pub fn package_of(&self, node: NodeId) -> Option<PackageId> {
        if let Some(pkg) = self.package_roots.get(&node) {
            return Some(*pkg);
        }
        let file = self.file_of(node)?;
        Some(self.program.file(file).package)
    }

    /// Visit every node in pre-order; stop when `f` returns false.
    pub fn range_nodes(&self, mut f: impl FnMut(NodeId) -> bool) {
        for id in self.program.arena.ids() {
            if !f(id) {
                return;
            }
        }
    }

    /// Wrapper for a function or method declaration. `None` for other kinds
    /// and for synthesized nodes.
    pub fn func_decl(&self, node: NodeId) -> Option<Arc<FuncDecl>> {
        let kind = self.program.arena.kind(node);
        if kind != "function_declaration" && kind != "method_declaration" {
            return None;
        }
        self.funcs
            .get_or_init(node, || self.make_func_decl(node).map(Arc::new))
    }

    pub fn file_info(&self, file: FileId) -> Arc<FileInfo> {
        self.files
            .get_or_init(file, || Arc::new(self.make_file_info(file)))
    }

    fn make_func_decl(&self, node: NodeId) -> Option<FuncDecl> {
        let program = &*self.program;
        let arena = &program.arena;
        let file = self.file_of(node)?;
        let name = program.node_text(arena.child_by_field(node, "name")?)?.to_string();
        let body = arena.child_by_field(node, "body");

        let receiver = arena.child_by_field(node, "receiver").and_then(|list| {
            let param = arena.child_by_kind(list, "parameter_declaration")?;
            let ty = arena.child_by_field(param, "type")?;
            let ptr = arena.kind(ty) == "pointer_type";
            let ident = arena.find_descendant(ty, "type_identifier")?;
            Some(Receiver {
                ptr,
                type_name: program.node_text(ident)?.to_string(),
            })
        });

        Some(FuncDecl {
            node,
            file,
            name,
            receiver,
            body,
        })
    }

    fn make_file_info(&self, file: FileId) -> FileInfo {
        let program = &*self.program;
        let arena = &program.arena;
        let source = program.file(file);

        let package_clause_end = arena
            .child_by_kind(source.root, "package_clause")
            .and_then(|clause| arena.child_by_kind(clause, "package_identifier"))
            .and_then(|ident| arena.span(ident))
            .map(|span| span.end)
            .unwrap_or(source.base);

        let mut imports = Vec::new();
        for &decl in arena.children(source.root) {
            if arena.kind(decl) != "import_declaration" {
                continue;
            }
            let mut stack = vec![decl];
            let mut specs = Vec::new();
            while let Some(n) = stack.pop() {
                if arena.kind(n) == "import_spec" {
                    specs.push(n);
                    continue;
                }
                stack.extend(arena.children(n).iter().rev().copied());
            }
            for spec in specs {
                let Some(span) = arena.span(spec) else {
                    continue;
                };
                let Some(path) = arena
                    .child_by_field(spec, "path")
                    .and_then(|p| program.node_text(p))
                else {
                    continue;
                };
                let alias = arena
                    .child_by_field(spec, "name")
                    .and_then(|n| program.node_text(n))
                    .map(str::to_string);
                imports.push(ImportSpec {
                    path: unquote(path),
                    alias,
                    span,
                });
            }
        }

        FileInfo {
            file,
            package_clause_end,
            imports,
        }
    }
}

fn unquote(literal: &str) -> String {
    literal
        .trim_matches(|c| c == '"' || c == '`')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syntax::{Loader, ModuleSpec};
    use std::thread;

    const SOURCE: &str = r#"package demo

import (
	"fmt"
	str "strings"
	_ "embed"
)

type Server struct{}

func (s *Server) Start() { fmt.Println(str.ToUpper("x")) }

func (s Server) Name() string { return "s" }

func helper() {}
"#;

    fn registry() -> Registry {
        let program = Loader::default()
            .load_sources(
                ModuleSpec::new("example.com/demo", "/demo"),
                vec![("/demo/demo.go".into(), SOURCE.into())],
            )
            .unwrap();
        Registry::build(Arc::new(program)).unwrap()
    }

    fn find(reg: &Registry, kind: &str, text_prefix: &str) -> NodeId {
        let mut found = None;
        reg.range_nodes(|id| {
            let program = reg.program();
            if program.arena.kind(id) == kind
                && program
                    .node_text(id)
                    .is_some_and(|t| t.starts_with(text_prefix))
            {
                found = Some(id);
                return false;
            }
            true
        });
        found.unwrap()
    }

    #[test]
    fn parents_and_files() {
        let reg = registry();
        let program = reg.program().clone();
        let pkg = &program.packages[0];
        let file = &program.files[0];

        assert_eq!(reg.parent(pkg.root), None);
        assert_eq!(reg.parent(file.root), Some(pkg.root));
        assert_eq!(reg.file_of(pkg.root), None);
        assert_eq!(reg.package_of(pkg.root), Some(pkg.id));

        let helper = find(&reg, "function_declaration", "func helper");
        assert_eq!(reg.file_of(helper), Some(file.id));
        assert_eq!(reg.package_of(helper), Some(pkg.id));
    }

    #[test]
    fn node_by_pos_roundtrip() {
        let reg = registry();
        let helper = find(&reg, "function_declaration", "func helper");
        let span = reg.program().arena.span(helper).unwrap();
        assert_eq!(reg.node_by_pos(span.start, span.end), Some(helper));
        assert_eq!(reg.node_by_pos(Pos::NONE, span.end), None);
        assert_eq!(reg.node_by_pos(span.start, span.start.advance(1)), None);
    }

    #[test]
    fn node_by_pos_prefers_outermost() {
        let reg = registry();
        let call = find(&reg, "call_expression", "fmt.Println");
        let stmt = reg.parent(call).unwrap();
        assert_eq!(reg.program().arena.kind(stmt), "expression_statement");
        assert_eq!(reg.program().arena.span(stmt), reg.program().arena.span(call));

        let span = reg.program().arena.span(call).unwrap();
        assert_eq!(reg.node_by_pos(span.start, span.end), Some(stmt));
    }

    #[test]
    fn func_decl_wrappers() {
        let reg = registry();
        let start = find(&reg, "method_declaration", "func (s *Server) Start");
        let name = find(&reg, "method_declaration", "func (s Server) Name");
        let helper = find(&reg, "function_declaration", "func helper");

        let start = reg.func_decl(start).unwrap();
        assert_eq!(start.qualified_name(), "(*Server).Start");
        assert!(start.body.is_some());
        assert_eq!(reg.func_decl(name).unwrap().qualified_name(), "Server.Name");
        assert_eq!(reg.func_decl(helper).unwrap().qualified_name(), "helper");

        let file_root = reg.program().files[0].root;
        assert!(reg.func_decl(file_root).is_none());
        let pkg_root = reg.program().packages[0].root;
        assert!(reg.func_decl(pkg_root).is_none());
    }

    #[test]
    fn func_decl_is_memoized_across_threads() {
        let reg = registry();
        let helper = find(&reg, "function_declaration", "func helper");
        let all: Vec<Arc<FuncDecl>> = thread::scope(|scope| {
            let handles: Vec<_> = (0..16)
                .map(|_| scope.spawn(|| reg.func_decl(helper).unwrap()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert!(all.iter().all(|f| Arc::ptr_eq(f, &all[0])));
    }

    #[test]
    fn file_info_lists_imports() {
        let reg = registry();
        let info = reg.file_info(reg.program().files[0].id);
        let imports: Vec<(&str, Option<&str>)> = info
            .imports
            .iter()
            .map(|i| (i.path.as_str(), i.alias.as_deref()))
            .collect();
        assert_eq!(
            imports,
            vec![("fmt", None), ("strings", Some("str")), ("embed", Some("_"))]
        );

        let file = &reg.program().files[0];
        let offset = file.offset_of(info.package_clause_end).unwrap();
        assert_eq!(&file.text[..offset], "package demo");
        assert!(Arc::ptr_eq(&info, &reg.file_info(file.id)));
    }
}

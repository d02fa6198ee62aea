//! Edit surfaces handed out by the session.
//!
//! Surfaces are shared between concurrent visitors, so every mutating method
//! takes `&self` and serializes through an internal lock.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;

use super::imports::{default_package_name, ImportError, ImportList};
use crate::edit::{EditBuffer, EditError};
use crate::registry::Registry;
use crate::syntax::{FileId, Pos};

#[derive(Error, Debug)]
pub enum SurfaceError {
    #[error(transparent)]
    Edit(#[from] EditError),

    #[error(transparent)]
    Import(#[from] ImportError),

    #[error("position {pos} is outside {path}")]
    OutsideFile { pos: Pos, path: PathBuf },
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Edits against the original text of one loaded file.
#[derive(Debug)]
pub struct FileSurface {
    file: FileId,
    path: PathBuf,
    base: Pos,
    len: usize,
    state: Mutex<FileState>,
}

#[derive(Debug)]
struct FileState {
    buffer: EditBuffer,
    imports: ImportList,
    /// End of the package clause; new imports go here.
    import_at: usize,
    emitted_imports: usize,
    /// Code added after the end of the original text.
    tail: String,
    /// Offset in `tail` where the next init block goes.
    init_cursor: usize,
}

impl FileSurface {
    /// Surface for `file`, with the file's existing imports already known.
    pub fn new(registry: &Registry, file: FileId) -> Result<Self, ImportError> {
        let program = registry.program();
        let source = program.file(file);
        let info = registry.file_info(file);

        let mut imports = ImportList::new();
        for spec in &info.imports {
            let name = program
                .package_by_path(&spec.path)
                .map(|p| p.name.clone())
                .unwrap_or_else(|| default_package_name(&spec.path));
            imports.seed(&spec.path, &name, spec.alias.as_deref().unwrap_or(""))?;
        }

        Ok(Self {
            file,
            path: source.path.clone(),
            base: source.base,
            len: source.text.len(),
            state: Mutex::new(FileState {
                buffer: EditBuffer::new(source.text.to_string()),
                imports,
                import_at: source.offset_of(info.package_clause_end).unwrap_or(0),
                emitted_imports: 0,
                tail: String::new(),
                init_cursor: 0,
            }),
        })
    }

    pub fn file(&self) -> FileId {
        self.file
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn offset(&self, pos: Pos) -> Result<usize, SurfaceError> {
        if pos < self.base || pos.0 - self.base.0 > self.len as u32 {
            return Err(SurfaceError::OutsideFile {
                pos,
                path: self.path.clone(),
            });
        }
        Ok((pos.0 - self.base.0) as usize)
    }

    pub fn insert(&self, pos: Pos, text: impl Into<String>) -> Result<(), SurfaceError> {
        let at = self.offset(pos)?;
        lock(&self.state).buffer.insert(at, text)?;
        Ok(())
    }

    pub fn delete(&self, start: Pos, end: Pos) -> Result<(), SurfaceError> {
        let (s, e) = (self.offset(start)?, self.offset(end)?);
        lock(&self.state).buffer.delete(s, e)?;
        Ok(())
    }

    pub fn replace(&self, start: Pos, end: Pos, text: impl Into<String>) -> Result<(), SurfaceError> {
        let (s, e) = (self.offset(start)?, self.offset(end)?);
        lock(&self.state).buffer.replace(s, e, text)?;
        Ok(())
    }

    /// Import `path` if needed and return the name it is reachable by. New
    /// imports are inserted right after the package clause.
    pub fn must_import(
        &self,
        path: &str,
        name: &str,
        suggested_alias: Option<&str>,
        forbidden: Option<&dyn Fn(&str) -> bool>,
    ) -> Result<String, SurfaceError> {
        let mut state = lock(&self.state);
        let resolved = state
            .imports
            .must_import(path, name, suggested_alias, forbidden)?;
        if let Some(import) = resolved.new_import {
            let lead = if state.emitted_imports == 0 { ";" } else { "" };
            let text = format!("{lead}import {};", import.spec());
            let at = state.import_at;
            state.buffer.insert(at, text)?;
            state.emitted_imports += 1;
        }
        Ok(resolved.name)
    }

    /// Add init code after the original text. Init blocks keep call order and
    /// stay ahead of anything added with [`FileSurface::append`].
    pub fn add_anonymous_init(&self, code: impl Into<String>) {
        let code = code.into();
        let mut state = lock(&self.state);
        let at = state.init_cursor;
        state.tail.insert_str(at, &code);
        state.init_cursor += code.len();
    }

    /// Add code at the very end of the file.
    pub fn append(&self, code: impl Into<String>) {
        lock(&self.state).tail.push_str(&code.into());
    }

    /// Original text with every recorded edit applied.
    pub fn render(&self) -> Result<String, SurfaceError> {
        let state = lock(&self.state);
        let mut out = state.buffer.apply()?;
        out.push_str(&state.tail);
        Ok(out)
    }
}

/// A file generated from scratch inside a package directory.
#[derive(Debug)]
pub struct NewFileSurface {
    path: PathBuf,
    state: Mutex<NewFileState>,
}

#[derive(Debug, Default)]
struct NewFileState {
    package_name: String,
    imports: ImportList,
    head_codes: Vec<String>,
    codes: Vec<String>,
    inits: Vec<String>,
}

impl NewFileSurface {
    pub fn new(path: PathBuf, package_name: impl Into<String>) -> Self {
        Self {
            path,
            state: Mutex::new(NewFileState {
                package_name: package_name.into(),
                ..NewFileState::default()
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn set_package_name(&self, name: impl Into<String>) {
        lock(&self.state).package_name = name.into();
    }

    pub fn must_import(
        &self,
        path: &str,
        name: &str,
        suggested_alias: Option<&str>,
        forbidden: Option<&dyn Fn(&str) -> bool>,
    ) -> Result<String, SurfaceError> {
        let resolved =
            lock(&self.state)
                .imports
                .must_import(path, name, suggested_alias, forbidden)?;
        Ok(resolved.name)
    }

    /// Code placed before the package clause, such as build tags.
    pub fn add_head_code(&self, code: impl Into<String>) {
        lock(&self.state).head_codes.push(code.into());
    }

    /// Code placed after the imports.
    pub fn add_code(&self, code: impl Into<String>) {
        lock(&self.state).codes.push(code.into());
    }

    pub fn add_anonymous_init(&self, code: impl Into<String>) {
        lock(&self.state).inits.push(code.into());
    }

    pub fn render(&self) -> String {
        let state = lock(&self.state);
        let mut lines: Vec<String> = Vec::new();

        if !state.head_codes.is_empty() {
            lines.extend(state.head_codes.iter().cloned());
            lines.push(String::new());
        }
        lines.push(format!("package {}", state.package_name));

        let imports = state.imports.added();
        if !imports.is_empty() {
            lines.push(String::new());
            lines.push("import (".to_string());
            lines.extend(imports.iter().map(|i| format!("    {}", i.spec())));
            lines.push(")".to_string());
        }
        if !state.codes.is_empty() {
            lines.push(String::new());
            lines.extend(state.codes.iter().cloned());
        }
        if !state.inits.is_empty() {
            lines.push(String::new());
            lines.extend(state.inits.iter().cloned());
        }

        let mut out = lines.join("\n");
        out.push('\n');
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syntax::{Loader, ModuleSpec};
    use std::sync::Arc;

    const SOURCE: &str = "package demo\n\nimport \"fmt\"\n\nfunc Hello() { fmt.Println(\"hi\") }\n";

    fn registry() -> Registry {
        let program = Loader::default()
            .load_sources(
                ModuleSpec::new("example.com/demo", "/demo"),
                vec![("/demo/demo.go".into(), SOURCE.into())],
            )
            .unwrap();
        Registry::build(Arc::new(program)).unwrap()
    }

    #[test]
    fn imports_go_after_package_clause() {
        let reg = registry();
        let file = reg.program().files[0].id;
        let surface = FileSurface::new(&reg, file).unwrap();

        assert_eq!(surface.must_import("fmt", "fmt", None, None).unwrap(), "fmt");
        assert_eq!(
            surface
                .must_import("example.com/mock", "mock", Some("_mock"), None)
                .unwrap(),
            "_mock"
        );
        assert_eq!(surface.must_import("os", "os", None, None).unwrap(), "os");

        let out = surface.render().unwrap();
        assert!(out.starts_with(
            "package demo;import _mock \"example.com/mock\";import \"os\";\n\nimport \"fmt\""
        ));
    }

    #[test]
    fn positional_edits_and_inits() {
        let reg = registry();
        let source = &reg.program().files[0];
        let surface = FileSurface::new(&reg, source.id).unwrap();

        let at = SOURCE.find("\"hi\"").unwrap();
        surface
            .replace(source.pos_at(at), source.pos_at(at + 4), "\"bye\"")
            .unwrap();
        surface.add_anonymous_init("var _ = 1\n");

        let out = surface.render().unwrap();
        assert!(out.contains("fmt.Println(\"bye\")"));
        assert!(out.ends_with("}\nvar _ = 1\n"));
    }

    #[test]
    fn inits_stay_ahead_of_appended_code() {
        let reg = registry();
        let surface = FileSurface::new(&reg, reg.program().files[0].id).unwrap();

        surface.add_anonymous_init("// init A\n");
        surface.append("// append B\n");
        surface.add_anonymous_init("// init C\n");
        surface.append("// append D\n");

        let out = surface.render().unwrap();
        assert!(out.ends_with("}\n// init A\n// init C\n// append B\n// append D\n"));
        assert!(out.starts_with(SOURCE));
    }

    #[test]
    fn append_only_goes_to_the_end() {
        let reg = registry();
        let surface = FileSurface::new(&reg, reg.program().files[0].id).unwrap();
        surface.append("// one\n");
        surface.append("// two\n");
        surface.add_anonymous_init("// init\n");
        assert_eq!(
            surface.render().unwrap(),
            format!("{SOURCE}// init\n// one\n// two\n")
        );
    }

    #[test]
    fn positions_outside_the_file_are_rejected() {
        let reg = registry();
        let source = &reg.program().files[0];
        let surface = FileSurface::new(&reg, source.id).unwrap();
        let err = surface.insert(source.end().advance(1), "x").unwrap_err();
        assert!(matches!(err, SurfaceError::OutsideFile { .. }));
        assert!(surface.insert(Pos::NONE, "x").is_err());
    }

    #[test]
    fn overlapping_edits_surface_as_errors() {
        let reg = registry();
        let source = &reg.program().files[0];
        let surface = FileSurface::new(&reg, source.id).unwrap();
        surface.delete(source.pos_at(0), source.pos_at(7)).unwrap();
        surface.delete(source.pos_at(3), source.pos_at(9)).unwrap();
        assert!(matches!(
            surface.render(),
            Err(SurfaceError::Edit(EditError::Overlap { .. }))
        ));
    }

    #[test]
    fn new_file_layout() {
        let surface = NewFileSurface::new("/demo/mock.go".into(), "demo");
        surface.add_head_code("//go:build !prod");
        surface.must_import("fmt", "fmt", None, None).unwrap();
        surface
            .must_import("example.com/x/v2", "x", Some("xx"), None)
            .unwrap();
        surface.add_code("func A() { fmt.Println(xx.V) }");
        surface.add_anonymous_init("func init() {}");

        assert_eq!(
            surface.render(),
            "//go:build !prod\n\npackage demo\n\nimport (\n    \"fmt\"\n    xx \"example.com/x/v2\"\n)\n\nfunc A() { fmt.Println(xx.V) }\n\nfunc init() {}\n"
        );
    }

    #[test]
    fn bare_new_file() {
        let surface = NewFileSurface::new("/demo/empty.go".into(), "demo");
        surface.set_package_name("other");
        assert_eq!(surface.render(), "package other\n");
    }
}

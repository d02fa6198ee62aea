//! Loaded Go sources: node arena, module/package/file model and the loader.

mod arena;
mod errors;
mod load;
mod program;

pub use arena::{Arena, NodeData, NodeId, Pos, Span, PACKAGE_KIND};
pub use errors::LoadError;
pub use load::{LoadOptions, Loader, ModuleSpec};
pub use program::{
    FileId, Module, ModuleId, ModuleRole, Package, PackageId, Program, SourceFile,
};

//! Producing new source text: subtree rewrites, import allocation and the
//! edit surfaces built on top of them.

mod imports;
mod surface;
mod walk;

pub use imports::{
    default_package_name, next_name, ImportError, ImportList, NewImport, Resolved,
    MAX_NAME_ATTEMPTS,
};
pub use surface::{FileSurface, NewFileSurface, SurfaceError};
pub use walk::{combine_hooks, rewrite_node, Hook, RewriteFault};

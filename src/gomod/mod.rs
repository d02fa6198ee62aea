//! go.mod parsing and relocation of module manifests into the shadow root.

mod errors;
mod parse;
mod relocate;
mod vendor;

pub use errors::GoModError;
pub use parse::{is_local_path, GoMod, ModuleVersion, Replace, Require};
pub use relocate::{
    forced_replaces, relocate, relocate_manifest, ModuleRef, RelocateInput, Relocation,
};
pub use vendor::rewrite_modules_txt;

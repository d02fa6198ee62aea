//! Shadowbuild: rewrite Go sources into a shadow build root and keep that
//! root in sync with the project.
//!
//! A pass loads the target module (and optionally dependencies) into a node
//! arena with globally unique positions, lets visitors record edits through
//! a [`Session`], then materializes the result under a per-project shadow
//! root. Unchanged files are never rewritten: real sources are mirrored by
//! modification time and generated files by content digest.
//!
//! # Architecture
//!
//! Every textual change compiles down to byte-range edits on an
//! [`EditBuffer`]. Surfaces handed out by the session are created once per
//! key no matter how many visitor threads ask for them, and import names
//! are allocated per file so generated code never shadows an existing name.
//!
//! # Example
//!
//! ```no_run
//! use shadowbuild::{config, Pipeline, RunContext};
//!
//! let settings = config::load_from_path("shadowbuild.toml").unwrap();
//! let ctx = RunContext::new(&settings, "/path/to/project").unwrap();
//! let report = Pipeline::new(&settings, &ctx).run().unwrap();
//! println!("{} files written", report.generated.copied);
//! ```

pub mod cache;
pub mod config;
pub mod context;
pub mod edit;
pub mod filecopy;
pub mod gomod;
pub mod logging;
pub mod once_map;
pub mod pipeline;
pub mod pool;
pub mod registry;
pub mod rewrite;
pub mod safety;
pub mod select;
pub mod session;
pub mod syntax;
pub mod toolchain;
pub mod ts;
pub mod visit;

// Re-exports
pub use cache::{content_digest, DigestCache};
pub use config::{load_from_path, load_from_str, ConfigError, Settings};
pub use context::{ContextError, RunContext};
pub use edit::{atomic_write, Edit, EditBuffer, EditError};
pub use filecopy::{sync, ProgressStats, SyncError, SyncOptions};
pub use gomod::{GoMod, GoModError, Relocation};
pub use pipeline::{Pipeline, PipelineError, RuleVisitor, RunReport};
pub use registry::{FuncDecl, Registry};
pub use rewrite::{rewrite_node, FileSurface, ImportError, NewFileSurface};
pub use safety::{SafetyError, ShadowGuard};
pub use select::{PatternSelector, Selection};
pub use session::{Generated, Session, SessionError};
pub use syntax::{FileId, LoadError, Loader, NodeId, PackageId, Pos, Program};
pub use toolchain::{BuildError, BuildPlan, BuildTool, GoTool};
pub use visit::{visit_all, visit_all_parallel, FnVisitor, Visitor};

//! Tree-sitter parsing of Go sources.
//!
//! The grammar comes from `ast-grep-language`, so patterns compiled by
//! ast-grep and trees parsed here agree on node kinds.

pub mod errors;
pub mod parser;

pub use errors::ParseError;
pub use parser::{first_syntax_error, GoParser};

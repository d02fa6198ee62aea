use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Go grammar rejected by tree-sitter: {0}")]
    Grammar(String),

    #[error("parser produced no tree")]
    NoTree,

    /// `line` and `column` are 1-based.
    #[error("syntax error at {line}:{column} (bytes {byte_start}..{byte_end})")]
    Syntax {
        byte_start: usize,
        byte_end: usize,
        line: usize,
        column: usize,
    },
}

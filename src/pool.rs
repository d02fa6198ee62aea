//! Thread-local parser pooling.
//!
//! Package loading parses files on rayon worker threads; each thread keeps
//! one Go parser and reuses it for every file it is handed.

use crate::ts::{GoParser, ParseError};
use std::cell::RefCell;

thread_local! {
    static GO_PARSER: RefCell<Option<GoParser>> = const { RefCell::new(None) };
}

/// Execute function with pooled parser instance.
///
/// On first call per thread, creates new parser. Subsequent calls reuse
/// the same parser instance.
pub fn with_parser<F, R>(f: F) -> Result<R, ParseError>
where
    F: FnOnce(&mut GoParser) -> Result<R, ParseError>,
{
    GO_PARSER.with(|cell| {
        let mut slot = cell.borrow_mut();
        let mut parser = match slot.take() {
            Some(parser) => parser,
            None => GoParser::new()?,
        };
        let result = f(&mut parser);
        *slot = Some(parser);
        result
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pooled_parser_is_reused() {
        let first = with_parser(|p| p.parse("package a\n").map(|t| t.root_node().kind()));
        let second = with_parser(|p| p.parse("package b\n").map(|t| t.root_node().kind()));
        assert_eq!(first.unwrap(), "source_file");
        assert_eq!(second.unwrap(), "source_file");
    }
}

use ast_grep_language::{LanguageExt, SupportLang};
use tree_sitter::{Node, Parser, Tree};

use crate::ts::errors::ParseError;

/// Reusable Go parser. Not `Sync`; see [`crate::pool`] for per-thread reuse.
pub struct GoParser {
    parser: Parser,
}

impl GoParser {
    pub fn new() -> Result<Self, ParseError> {
        let mut parser = Parser::new();
        parser
            .set_language(&SupportLang::Go.get_ts_language())
            .map_err(|e| ParseError::Grammar(e.to_string()))?;
        Ok(Self { parser })
    }

    /// Parse without judging the result; the tree may contain error nodes.
    pub fn parse(&mut self, source: &str) -> Result<Tree, ParseError> {
        self.parser.parse(source, None).ok_or(ParseError::NoTree)
    }

    /// Parse and reject any source tree-sitter had to recover from.
    pub fn parse_strict(&mut self, source: &str) -> Result<Tree, ParseError> {
        let tree = self.parse(source)?;
        match first_syntax_error(tree.root_node()) {
            Some(err) => Err(err),
            None => Ok(tree),
        }
    }
}

/// Leftmost ERROR or MISSING node under `root`. Subtrees without errors are
/// not entered.
pub fn first_syntax_error(root: Node<'_>) -> Option<ParseError> {
    if !root.has_error() {
        return None;
    }
    let mut node = root;
    'descend: loop {
        if node.is_error() || node.is_missing() {
            let start = node.start_position();
            return Some(ParseError::Syntax {
                byte_start: node.start_byte(),
                byte_end: node.end_byte(),
                line: start.row + 1,
                column: start.column + 1,
            });
        }
        let mut cursor = node.walk();
        for child in node.children(&mut cursor) {
            if child.has_error() {
                node = child;
                continue 'descend;
            }
        }
        // has_error without a flagged child: the node itself is the culprit
        let start = node.start_position();
        return Some(ParseError::Syntax {
            byte_start: node.start_byte(),
            byte_end: node.end_byte(),
            line: start.row + 1,
            column: start.column + 1,
        });
    }
}

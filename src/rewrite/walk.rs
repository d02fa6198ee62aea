//! Whole-subtree rewrite.
//!
//! A single depth-first pass asks the caller for a replacement of every node.
//! A replaced node becomes a leaf; every other node is rebuilt from the
//! original source between its children plus each child's rebuilt text.

use thiserror::Error;

use crate::syntax::{NodeId, Pos, Program, SourceFile, Span};

/// Internal-consistency faults of the syntax tree being rewritten.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RewriteFault {
    #[error("node {child} escapes the range of its parent {parent}")]
    ChildEscapesParent { parent: NodeId, child: NodeId },

    #[error("nodes {first} and {second} overlap")]
    ChildrenOverlap { first: NodeId, second: NodeId },

    #[error("node {node} has no source position")]
    SynthesizedNode { node: NodeId },

    #[error("no source text for node {node}")]
    MissingText { node: NodeId },
}

/// Post-processing applied to the output of every node.
pub type Hook<'a> = Box<dyn Fn(NodeId, String) -> String + Send + Sync + 'a>;

/// Chain hooks so that the first one sees a node's output first and each
/// later hook receives the previous hook's result.
pub fn combine_hooks<'a>(hooks: Vec<Hook<'a>>) -> Hook<'a> {
    Box::new(move |node, text| hooks.iter().fold(text, |acc, hook| hook(node, acc)))
}

/// Rebuild the text of `root`.
///
/// `rewrite` is called in pre-order; returning `Some` replaces the node and
/// skips its children. `hook` runs on the output of every node, replaced or
/// not, innermost first.
pub fn rewrite_node<F>(
    program: &Program,
    root: NodeId,
    mut rewrite: F,
    hook: Option<&(dyn Fn(NodeId, String) -> String + '_)>,
) -> Result<String, RewriteFault>
where
    F: FnMut(NodeId) -> Option<String>,
{
    let span = program
        .arena
        .span(root)
        .ok_or(RewriteFault::SynthesizedNode { node: root })?;
    let file = program
        .file_at(span.start)
        .ok_or(RewriteFault::MissingText { node: root })?;

    let mut walker = Walker {
        program,
        file,
        rewrite: &mut rewrite,
        hook,
    };
    walker.node(root, span)
}

struct Walker<'p, 'f> {
    program: &'p Program,
    file: &'p SourceFile,
    rewrite: &'f mut dyn FnMut(NodeId) -> Option<String>,
    hook: Option<&'f (dyn Fn(NodeId, String) -> String + 'f)>,
}

impl Walker<'_, '_> {
    fn node(&mut self, node: NodeId, span: Span) -> Result<String, RewriteFault> {
        if let Some(replaced) = (self.rewrite)(node) {
            return Ok(self.finish(node, replaced));
        }

        let mut out = String::new();
        let mut offset = span.start;
        let mut previous: Option<NodeId> = None;

        for &child in self.program.arena.children(node) {
            let child_span = self
                .program
                .arena
                .span(child)
                .ok_or(RewriteFault::SynthesizedNode { node: child })?;
            if !span.contains(&child_span) {
                return Err(RewriteFault::ChildEscapesParent {
                    parent: node,
                    child,
                });
            }
            if child_span.start < offset {
                return Err(RewriteFault::ChildrenOverlap {
                    first: previous.unwrap_or(node),
                    second: child,
                });
            }

            out.push_str(self.gap(node, offset, child_span.start)?);
            out.push_str(&self.node(child, child_span)?);
            offset = child_span.end;
            previous = Some(child);
        }

        out.push_str(self.gap(node, offset, span.end)?);
        Ok(self.finish(node, out))
    }

    fn gap(&self, node: NodeId, from: Pos, to: Pos) -> Result<&str, RewriteFault> {
        self.file
            .slice(from, to)
            .ok_or(RewriteFault::MissingText { node })
    }

    fn finish(&self, node: NodeId, text: String) -> String {
        match self.hook {
            Some(hook) => hook(node, text),
            None => text,
        }
    }
}

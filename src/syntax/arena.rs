//! Node arena with load-global positions.
//!
//! Every node gets a [`NodeId`] allocated in pre-order while a tree-sitter tree
//! is converted. Positions are global across one load: each file is assigned
//! a base so that `Pos(base + byte_offset)` never collides with another file.

use std::fmt;

/// A position in the load-global position space. `Pos(0)` means "no position".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Pos(pub u32);

impl Pos {
    pub const NONE: Pos = Pos(0);

    pub fn is_valid(self) -> bool {
        self.0 != 0
    }

    /// Advance by a byte count.
    pub fn advance(self, bytes: usize) -> Pos {
        Pos(self.0 + bytes as u32)
    }
}

impl fmt::Display for Pos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Half-open `[start, end)` range in the global position space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Span {
    pub start: Pos,
    pub end: Pos,
}

impl Span {
    pub fn new(start: Pos, end: Pos) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct NodeData {
    /// Grammar kind, or `"package"` for synthetic package roots.
    pub kind: &'static str,
    /// `None` for synthesized nodes.
    pub span: Option<Span>,
    /// Field name this node occupies in its parent, if any.
    pub field: Option<&'static str>,
    pub children: Vec<NodeId>,
}

/// Kind of the synthetic root wrapping a package's files.
pub const PACKAGE_KIND: &str = "package";

#[derive(Debug, Default)]
pub struct Arena {
    nodes: Vec<NodeData>,
}

impl Arena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(
        &mut self,
        kind: &'static str,
        span: Option<Span>,
        field: Option<&'static str>,
    ) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(NodeData {
            kind,
            span,
            field,
            children: Vec::new(),
        });
        id
    }

    pub fn push_child(&mut self, parent: NodeId, child: NodeId) {
        self.nodes[parent.index()].children.push(child);
    }

    pub fn get(&self, id: NodeId) -> &NodeData {
        &self.nodes[id.index()]
    }

    pub fn kind(&self, id: NodeId) -> &'static str {
        self.get(id).kind
    }

    pub fn span(&self, id: NodeId) -> Option<Span> {
        self.get(id).span
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.get(id).children
    }

    /// First child occupying the given field.
    pub fn child_by_field(&self, id: NodeId, field: &str) -> Option<NodeId> {
        self.children(id)
            .iter()
            .copied()
            .find(|c| self.get(*c).field == Some(field))
    }

    /// First child of the given kind.
    pub fn child_by_kind(&self, id: NodeId, kind: &str) -> Option<NodeId> {
        self.children(id)
            .iter()
            .copied()
            .find(|c| self.get(*c).kind == kind)
    }

    /// Pre-order search for the first descendant (including `id`) of a kind.
    pub fn find_descendant(&self, id: NodeId, kind: &str) -> Option<NodeId> {
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            if self.kind(next) == kind {
                return Some(next);
            }
            stack.extend(self.children(next).iter().rev().copied());
        }
        None
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = NodeId> {
        (0..self.nodes.len() as u32).map(NodeId)
    }

    /// Convert a tree-sitter tree into arena nodes rooted at the returned id.
    ///
    /// Only named nodes are kept; the text between them is recovered from the
    /// source when a tree is rewritten.
    pub fn convert_tree(&mut self, root: tree_sitter::Node<'_>, base: Pos) -> NodeId {
        self.convert_node(root, base, None)
    }

    fn convert_node(
        &mut self,
        node: tree_sitter::Node<'_>,
        base: Pos,
        field: Option<&'static str>,
    ) -> NodeId {
        let span = Span::new(base.advance(node.start_byte()), base.advance(node.end_byte()));
        let id = self.alloc(node.kind(), Some(span), field);

        let mut cursor = node.walk();
        if cursor.goto_first_child() {
            loop {
                let child = cursor.node();
                if child.is_named() && !child.is_missing() {
                    let field_name = cursor.field_name();
                    let child_id = self.convert_node(child, base, field_name);
                    self.push_child(id, child_id);
                }
                if !cursor.goto_next_sibling() {
                    break;
                }
            }
        }
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ts::GoParser;

    #[test]
    fn convert_assigns_global_positions() {
        let mut parser = GoParser::new().unwrap();
        let source = "package demo\n\nfunc Run() {}\n";
        let tree = parser.parse(source).unwrap();

        let mut arena = Arena::new();
        let root = arena.convert_tree(tree.root_node(), Pos(100));

        let span = arena.span(root).unwrap();
        assert_eq!(span.start, Pos(100));
        assert_eq!(span.end, Pos(100 + source.len() as u32));

        let func = arena.find_descendant(root, "function_declaration").unwrap();
        let name = arena.child_by_field(func, "name").unwrap();
        assert_eq!(arena.kind(name), "identifier");
        assert!(span.contains(&arena.span(func).unwrap()));
    }

    #[test]
    fn ids_are_preorder() {
        let mut parser = GoParser::new().unwrap();
        let tree = parser.parse("package demo\n\nvar x = 1\n").unwrap();

        let mut arena = Arena::new();
        let root = arena.convert_tree(tree.root_node(), Pos(1));
        for child in arena.children(root) {
            assert!(child.index() > root.index());
        }
    }
}

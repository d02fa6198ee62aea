//! Depth-first traversal of the package forest.
//!
//! Each package is a synthetic root whose children are its files, so a
//! visitor sees the package first, then every file, then the file contents.

use rayon::prelude::*;
use tracing::debug;

use crate::session::Session;
use crate::syntax::{NodeId, PackageId};

/// Callbacks driven by [`visit_all`].
///
/// `visit` decides whether the children of a node are walked. `visit_end`
/// fires for every visited node once its subtree is done, or right away when
/// `visit` returned false.
pub trait Visitor: Sync {
    fn visit(&self, node: NodeId, session: &Session) -> bool;

    fn visit_end(&self, node: NodeId, session: &Session) {
        let _ = (node, session);
    }
}

type VisitFn<'a> = Box<dyn Fn(NodeId, &Session) -> bool + Send + Sync + 'a>;
type VisitEndFn<'a> = Box<dyn Fn(NodeId, &Session) + Send + Sync + 'a>;

/// Visitor assembled from closures. Missing callbacks descend everywhere and
/// do nothing on exit.
#[derive(Default)]
pub struct FnVisitor<'a> {
    pub visit: Option<VisitFn<'a>>,
    pub visit_end: Option<VisitEndFn<'a>>,
}

impl<'a> FnVisitor<'a> {
    pub fn new(visit: impl Fn(NodeId, &Session) -> bool + Send + Sync + 'a) -> Self {
        Self {
            visit: Some(Box::new(visit)),
            visit_end: None,
        }
    }

    pub fn on_end(mut self, visit_end: impl Fn(NodeId, &Session) + Send + Sync + 'a) -> Self {
        self.visit_end = Some(Box::new(visit_end));
        self
    }
}

impl Visitor for FnVisitor<'_> {
    fn visit(&self, node: NodeId, session: &Session) -> bool {
        match &self.visit {
            Some(f) => f(node, session),
            None => true,
        }
    }

    fn visit_end(&self, node: NodeId, session: &Session) {
        if let Some(f) = &self.visit_end {
            f(node, session);
        }
    }
}

/// Walk the subtree of `root`.
pub fn visit_node(root: NodeId, session: &Session, visitor: &dyn Visitor) {
    let arena = &session.program().arena;
    // (node, index of the next child to visit)
    let mut stack: Vec<(NodeId, usize)> = Vec::new();

    if !visitor.visit(root, session) {
        visitor.visit_end(root, session);
        return;
    }
    stack.push((root, 0));

    while let Some(top) = stack.last_mut() {
        let (node, next) = *top;
        match arena.children(node).get(next) {
            Some(&child) => {
                top.1 += 1;
                if visitor.visit(child, session) {
                    stack.push((child, 0));
                } else {
                    visitor.visit_end(child, session);
                }
            }
            None => {
                stack.pop();
                visitor.visit_end(node, session);
            }
        }
    }

    // the loop only exits once every pushed node has been closed
    debug_assert!(stack.is_empty(), "traversal of {root} left nodes on the stack");
}

/// Visit the given packages one after another.
pub fn visit_all(
    packages: &[PackageId],
    session: &Session,
    visitor: &dyn Visitor,
) {
    for &pkg in packages {
        let root = session.program().package(pkg).root;
        visit_node(root, session, visitor);
    }
    debug!(packages = packages.len(), "visited packages");
}

/// Visit packages on the rayon pool. Packages are independent roots, so each
/// traversal keeps its own stack; the visitor and the session are shared.
pub fn visit_all_parallel(
    packages: &[PackageId],
    session: &Session,
    visitor: &dyn Visitor,
) {
    packages.par_iter().for_each(|&pkg| {
        let root = session.program().package(pkg).root;
        visit_node(root, session, visitor);
    });
    debug!(packages = packages.len(), "visited packages in parallel");
}

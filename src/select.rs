//! Choosing which nodes a pass rewrites.
//!
//! Patterns use ast-grep's metavariable syntax (`$NAME`, `$$$ARGS`, `$_`)
//! against the Go grammar. Each match is mapped back to a registry node
//! through its position range.

use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use ast_grep_core::AstGrep;
use ast_grep_language::SupportLang;
use rayon::prelude::*;
use regex::Regex;
use tracing::debug;

use crate::cache;
use crate::registry::Registry;
use crate::syntax::{FileId, NodeId};

/// One pattern match resolved to a node.
#[derive(Debug, Clone)]
pub struct Selection {
    pub node: NodeId,
    pub file: FileId,
    /// Captured metavariables: name -> text
    pub captures: HashMap<String, String>,
}

/// Set of chosen nodes.
#[derive(Debug, Clone, Default)]
pub struct NodeSet {
    nodes: HashSet<NodeId>,
}

impl NodeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, node: NodeId) -> bool {
        self.nodes.insert(node)
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.nodes.contains(&node)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.iter().copied()
    }
}

impl FromIterator<NodeId> for NodeSet {
    fn from_iter<I: IntoIterator<Item = NodeId>>(iter: I) -> Self {
        Self {
            nodes: iter.into_iter().collect(),
        }
    }
}

/// Pattern matcher over every loaded file.
#[derive(Debug, Clone)]
pub struct PatternSelector {
    pattern: String,
    /// `$$$NAME` metavariables named in the pattern
    multi_vars: Vec<String>,
}

fn multi_var_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    #[allow(clippy::expect_used)]
    RE.get_or_init(|| Regex::new(r"\$\$\$([A-Z_][A-Z0-9_]*)").expect("invalid metavariable regex"))
}

impl PatternSelector {
    pub fn new(pattern: impl Into<String>) -> Self {
        let pattern = pattern.into();
        let multi_vars = multi_var_regex()
            .captures_iter(&pattern)
            .map(|c| c[1].to_string())
            .collect();
        Self {
            pattern,
            multi_vars,
        }
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Matches in one file, in source order.
    pub fn select_in(&self, registry: &Registry, file: FileId) -> Vec<Selection> {
        let source = registry.program().file(file);
        let pat = cache::get_or_compile_pattern(&self.pattern, SupportLang::Go);
        let sg = AstGrep::new(&*source.text, SupportLang::Go);

        let mut out = Vec::new();
        for m in sg.root().find_all(&pat) {
            let range = m.get_node().range();
            let start = source.pos_at(range.start);
            let end = source.pos_at(range.end);
            let Some(node) = registry.node_by_pos(start, end) else {
                // anonymous grammar nodes are not kept in the arena
                debug!(pattern = %self.pattern, start = range.start, "match without a node");
                continue;
            };
            let env = m.get_env();
            let mut captures: HashMap<String, String> = env.clone().into();
            // multi-node captures keep the source text between their nodes
            for name in &self.multi_vars {
                let nodes = env.get_multiple_matches(name);
                let text = match (nodes.first(), nodes.last()) {
                    (Some(first), Some(last)) => source
                        .text
                        .get(first.range().start..last.range().end)
                        .unwrap_or_default()
                        .to_string(),
                    _ => String::new(),
                };
                captures.insert(name.clone(), text);
            }
            out.push(Selection {
                node,
                file,
                captures,
            });
        }
        out
    }

    /// Matches across all files, files searched in parallel.
    pub fn select(&self, registry: &Registry) -> Vec<Selection> {
        registry
            .program()
            .files
            .par_iter()
            .flat_map_iter(|f| self.select_in(registry, f.id))
            .collect()
    }

    pub fn node_set(&self, registry: &Registry) -> NodeSet {
        self.select(registry).into_iter().map(|s| s.node).collect()
    }
}

/// Substitute `$$$NAME` and `$NAME` references with captured text. Longer
/// names are substituted first so `$AB` never matches a capture `A`.
pub fn expand_template(template: &str, captures: &HashMap<String, String>) -> String {
    let mut names: Vec<&String> = captures.keys().collect();
    names.sort_by(|a, b| b.len().cmp(&a.len()).then(a.cmp(b)));

    let mut result = template.to_string();
    for name in names {
        let text = &captures[name];
        result = result.replace(&format!("$$${name}"), text);
        result = result.replace(&format!("${name}"), text);
    }
    result
}

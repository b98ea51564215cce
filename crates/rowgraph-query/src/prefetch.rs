//! Prefetch trees.
//!
//! A query carries a tree of relationship paths to resolve together with the
//! root objects. Each node carries a semantics choice: *joint* folds the
//! related rows into the root SELECT via joins, *disjoint* issues one
//! secondary SELECT per prefetch path, *disjoint-by-id* issues one secondary
//! SELECT per parent id. Adding "a.b" creates an intermediate node for "a"
//! with undefined semantics; undefined nodes adopt the query's default at
//! translation time.

use std::collections::BTreeMap;

/// How a prefetch path is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub enum PrefetchSemantics {
    /// Not chosen yet; resolved to the query default at translation.
    #[default]
    Undefined,
    /// Joined into the root SELECT.
    Joint,
    /// One secondary SELECT qualified by the root query.
    Disjoint,
    /// One secondary SELECT per parent id.
    DisjointById,
}

/// One node of a prefetch tree. Children are keyed by relationship name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct PrefetchNode {
    /// Execution semantics for this path segment.
    pub semantics: PrefetchSemantics,
    /// Child segments.
    pub children: BTreeMap<String, PrefetchNode>,
}

/// Tree of prefetch paths rooted at the query's entity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct PrefetchTree {
    root: PrefetchNode,
}

impl PrefetchTree {
    /// Empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether any prefetch path has been added.
    pub fn is_empty(&self) -> bool {
        self.root.children.is_empty()
    }

    /// Add a dotted relationship path with the given semantics. Intermediate
    /// segments are created with undefined semantics; re-adding an existing
    /// path overwrites its semantics.
    pub fn add(&mut self, path: &str, semantics: PrefetchSemantics) {
        let mut node = &mut self.root;
        for segment in path.split('.') {
            node = node.children.entry(segment.to_string()).or_default();
        }
        node.semantics = semantics;
    }

    /// Look up the node for a dotted path.
    pub fn node(&self, path: &str) -> Option<&PrefetchNode> {
        let mut node = &self.root;
        for segment in path.split('.') {
            node = node.children.get(segment)?;
        }
        Some(node)
    }

    /// Replace every undefined semantics with the given default.
    pub fn resolve_undefined(&mut self, default: PrefetchSemantics) {
        fn walk(node: &mut PrefetchNode, default: PrefetchSemantics) {
            for child in node.children.values_mut() {
                if child.semantics == PrefetchSemantics::Undefined {
                    child.semantics = default;
                }
                walk(child, default);
            }
        }
        walk(&mut self.root, default);
    }

    /// Depth-first traversal as (dotted path, node) pairs, parents before
    /// children.
    pub fn walk(&self) -> Vec<(String, &PrefetchNode)> {
        fn descend<'a>(
            prefix: &str,
            node: &'a PrefetchNode,
            out: &mut Vec<(String, &'a PrefetchNode)>,
        ) {
            for (name, child) in &node.children {
                let path = if prefix.is_empty() {
                    name.clone()
                } else {
                    format!("{prefix}.{name}")
                };
                out.push((path.clone(), child));
                descend(&path, child, out);
            }
        }
        let mut out = Vec::new();
        descend("", &self.root, &mut out);
        out
    }

    /// Whether any node in the tree uses the given semantics.
    pub fn uses(&self, semantics: PrefetchSemantics) -> bool {
        self.walk().iter().any(|(_, n)| n.semantics == semantics)
    }
}

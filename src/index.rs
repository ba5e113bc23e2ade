//! The in-memory trie of key fragments → insertion offset (spec.md §4.6).

use indexmap::IndexMap;

use crate::key::{range_contains, stringify_fragment, Fragment, Key, Query, QueryFragment};

struct Child {
    fragment: Fragment,
    node: Node,
}

#[derive(Default)]
struct Node {
    children: IndexMap<String, Child>,
    reference: Option<u64>,
}

impl Node {
    fn new() -> Self {
        Node::default()
    }

    fn is_empty_leaf(&self) -> bool {
        self.reference.is_none() && self.children.is_empty()
    }
}

/// A trie mapping composite keys to the ledger offset of their most recent
/// `SET`. See spec.md §4.6 for the full descent/prune algorithm.
#[derive(Default)]
pub struct Index {
    root: Node,
}

impl Index {
    pub fn new() -> Self {
        Index { root: Node::new() }
    }

    /// Descends `key`, creating nodes as needed, and sets `reference=offset`
    /// at the leaf. Overwrites any previous reference (last write wins).
    pub fn add(&mut self, key: &Key, offset: u64) {
        add_rec(&mut self.root, key.fragments(), 0, offset);
    }

    /// Descends `key`; if the full path exists, unsets the leaf's reference
    /// and prunes upward any node left both referenceless and childless.
    /// Returns the prior offset, if any.
    pub fn delete(&mut self, key: &Key) -> Option<u64> {
        delete_rec(&mut self.root, key.fragments(), 0).0
    }

    /// Returns offsets of every reference whose key matches `query`,
    /// including references at and beneath the node the query's fragments
    /// resolve to (a query shorter than a stored key's depth acts as a
    /// prefix match over the whole subtree). Sorted ascending unless
    /// `reverse`, then truncated to `limit`.
    pub fn get(&self, query: &Query, limit: Option<usize>, reverse: bool) -> Vec<u64> {
        let mut out = Vec::new();
        collect(&self.root, query.fragments(), 0, &mut out);
        out.sort_unstable();
        if reverse {
            out.reverse();
        }
        if let Some(limit) = limit {
            out.truncate(limit);
        }
        out
    }

    /// Navigates to the node identified by `query` (the root if `None`) and
    /// returns the stringified form of each immediate child fragment.
    pub fn get_child_keys(&self, query: Option<&Query>) -> Vec<String> {
        let node = match query {
            None => Some(&self.root),
            Some(query) => navigate(&self.root, query.fragments(), 0),
        };
        match node {
            Some(node) => node
                .children
                .values()
                .map(|child| stringify_fragment(&child.fragment))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Resets the tree to an empty root.
    pub fn clear(&mut self) {
        self.root = Node::new();
    }
}

fn add_rec(node: &mut Node, fragments: &[Fragment], idx: usize, offset: u64) {
    if idx == fragments.len() {
        node.reference = Some(offset);
        return;
    }
    let fragment = &fragments[idx];
    let key_str = stringify_fragment(fragment);
    let child = node
        .children
        .entry(key_str)
        .or_insert_with(|| Child {
            fragment: fragment.clone(),
            node: Node::new(),
        });
    add_rec(&mut child.node, fragments, idx + 1, offset);
}

/// Returns `(prior_offset, should_prune_from_parent)`.
fn delete_rec(node: &mut Node, fragments: &[Fragment], idx: usize) -> (Option<u64>, bool) {
    if idx == fragments.len() {
        let prior = node.reference.take();
        return (prior, node.is_empty_leaf());
    }
    let key_str = stringify_fragment(&fragments[idx]);
    let Some(child) = node.children.get_mut(&key_str) else {
        return (None, false);
    };
    let (prior, child_should_prune) = delete_rec(&mut child.node, fragments, idx + 1);
    if child_should_prune {
        node.children.shift_remove(&key_str);
    }
    (prior, node.is_empty_leaf())
}

fn collect(node: &Node, fragments: &[QueryFragment], idx: usize, out: &mut Vec<u64>) {
    if idx == fragments.len() {
        collect_subtree(node, out);
        return;
    }
    match &fragments[idx] {
        QueryFragment::Literal(literal) => {
            let key_str = stringify_fragment(literal);
            if let Some(child) = node.children.get(&key_str) {
                collect(&child.node, fragments, idx + 1, out);
            }
        }
        QueryFragment::Range { from, to } => {
            for child in node.children.values() {
                if range_contains(&child.fragment, from, to) {
                    collect(&child.node, fragments, idx + 1, out);
                }
            }
        }
    }
}

fn collect_subtree(node: &Node, out: &mut Vec<u64>) {
    if let Some(reference) = node.reference {
        out.push(reference);
    }
    for child in node.children.values() {
        collect_subtree(&child.node, out);
    }
}

fn navigate<'a>(node: &'a Node, fragments: &[QueryFragment], idx: usize) -> Option<&'a Node> {
    if idx == fragments.len() {
        return Some(node);
    }
    match &fragments[idx] {
        QueryFragment::Literal(literal) => {
            let key_str = stringify_fragment(literal);
            navigate(&node.children.get(&key_str)?.node, fragments, idx + 1)
        }
        // Only single-child navigation is meaningful for getChildKeys; a
        // range fragment mid-path has no single destination node, so it
        // does not resolve (treated the same as a literal that has no
        // matching child).
        QueryFragment::Range { .. } => None,
    }
}

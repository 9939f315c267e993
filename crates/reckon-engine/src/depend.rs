//! The dependency graph for formula recalculation.
//!
//! All dependency relationships are edges `(out_node, in_node, relation)`,
//! meaning that `out_node` depends on `in_node`. Each node is a column in a
//! table; the relation determines which rows of `out_node` need recomputing
//! when a row of `in_node` changes.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::relation::RelationHandle;
use crate::value::RowId;

/// A column in a table: the unit of the dependency graph.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Node {
    pub table_id: String,
    pub col_id: String,
}

impl Node {
    pub fn new(table_id: impl Into<String>, col_id: impl Into<String>) -> Node {
        Node { table_id: table_id.into(), col_id: col_id.into() }
    }
}

impl std::fmt::Display for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}.{}]", self.table_id, self.col_id)
    }
}

/// A set of rows needing recomputation; `All` means the entire column.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RowSet {
    All,
    Rows(BTreeSet<RowId>),
}

impl RowSet {
    pub fn rows(ids: impl IntoIterator<Item = RowId>) -> RowSet {
        RowSet::Rows(ids.into_iter().collect())
    }

    pub fn single(row_id: RowId) -> RowSet {
        RowSet::rows([row_id])
    }

    pub fn empty() -> RowSet {
        RowSet::Rows(BTreeSet::new())
    }

    pub fn is_empty(&self) -> bool {
        match self {
            RowSet::All => false,
            RowSet::Rows(rows) => rows.is_empty(),
        }
    }
}

/// `out_node` depends on `in_node`: a change to `in_node` triggers a
/// recomputation of `out_node`, with rows mapped through `relation`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Edge {
    pub out_node: Node,
    pub in_node: Node,
    pub relation: RelationHandle,
}

/// Map of node -> rows that need recomputing. BTreeMap keeps scheduler
/// iteration deterministic.
pub type RecomputeMap = BTreeMap<Node, RowSet>;

/// The dependency graph for all data in a document.
#[derive(Default)]
pub struct Graph {
    all_edges: HashSet<Edge>,
    /// node -> edges having it as in_node (i.e. edges to dependents).
    in_node_map: HashMap<Node, HashSet<Edge>>,
    /// node -> edges having it as out_node (i.e. edges to dependencies).
    out_node_map: HashMap<Node, HashSet<Edge>>,
}

impl Graph {
    pub fn new() -> Graph {
        Graph::default()
    }

    /// Add an edge; duplicates are no-ops.
    pub fn add_edge(&mut self, out_node: Node, in_node: Node, relation: RelationHandle) {
        debug_assert_eq!(relation.referring_table(), out_node.table_id);
        debug_assert_eq!(relation.target_table(), in_node.table_id);
        let edge = Edge { out_node, in_node, relation };
        if self.all_edges.insert(edge.clone()) {
            self.in_node_map.entry(edge.in_node.clone()).or_default().insert(edge.clone());
            self.out_node_map.entry(edge.out_node.clone()).or_default().insert(edge);
        }
    }

    /// Remove all edges which affect the given out_node, i.e. all of its
    /// dependencies, letting each dropped relation forget its state.
    pub fn clear_dependencies(&mut self, out_node: &Node) {
        let Some(edges) = self.out_node_map.remove(out_node) else {
            return;
        };
        for edge in edges {
            self.all_edges.remove(&edge);
            if let Some(set) = self.in_node_map.get_mut(&edge.in_node) {
                set.remove(&edge);
            }
            edge.relation.reset_all();
        }
    }

    /// For edges the given node depends on, reset the given output rows.
    /// Called just before those rows get recomputed, so relations can clear
    /// per-row state.
    pub fn reset_dependencies(&mut self, node: &Node, dirty_rows: &RowSet) {
        if let Some(edges) = self.out_node_map.get(node) {
            for edge in edges {
                edge.relation.reset_rows(dirty_rows);
            }
        }
    }

    /// Edges pointing from dependents at this node.
    pub fn dependents(&self, node: &Node) -> Vec<Edge> {
        self.in_node_map.get(node).map(|set| set.iter().cloned().collect()).unwrap_or_default()
    }

    /// The nodes this node reads (its dependencies).
    pub fn dependencies(&self, node: &Node) -> Vec<Node> {
        self.out_node_map
            .get(node)
            .map(|set| set.iter().map(|e| e.in_node.clone()).collect())
            .unwrap_or_default()
    }

    pub fn has_dependents(&self, node: &Node) -> bool {
        self.in_node_map.get(node).is_some_and(|set| !set.is_empty())
    }

    /// Invalidate the given rows in the given node and everything that
    /// recursively depends on it, accumulating into `recompute_map`.
    ///
    /// Iterative on purpose: long dependency chains overflow the stack when
    /// done recursively. If `dirty_rows` is `All`, the whole column is
    /// affected and its dependencies are cleared so the coming recompute can
    /// rebuild them from scratch.
    pub fn invalidate_deps(
        &mut self,
        dirty_node: Node,
        dirty_rows: RowSet,
        recompute_map: &mut RecomputeMap,
        include_self: bool,
    ) {
        let mut to_invalidate = vec![(dirty_node, dirty_rows)];
        let mut include_self = include_self;

        while let Some((node, rows)) = to_invalidate.pop() {
            if include_self {
                if matches!(recompute_map.get(&node), Some(RowSet::All)) {
                    continue;
                }
                match rows {
                    RowSet::All => {
                        recompute_map.insert(node.clone(), RowSet::All);
                        self.clear_dependencies(&node);
                    }
                    RowSet::Rows(ref new_rows) => {
                        if new_rows.is_empty() {
                            continue;
                        }
                        match recompute_map.entry(node.clone()) {
                            std::collections::btree_map::Entry::Occupied(mut entry) => {
                                if let RowSet::Rows(out_rows) = entry.get_mut() {
                                    let prev = out_rows.len();
                                    out_rows.extend(new_rows.iter().copied());
                                    // Nothing new: prune this branch of the walk.
                                    if out_rows.len() <= prev {
                                        continue;
                                    }
                                }
                            }
                            std::collections::btree_map::Entry::Vacant(entry) => {
                                entry.insert(rows.clone());
                            }
                        }
                    }
                }
            }
            include_self = true;

            for edge in self.dependents(&node) {
                let affected = edge.relation.affected(&rows);
                if !affected.is_empty() {
                    to_invalidate.push((edge.out_node, affected));
                }
            }
        }
    }

    /// Relabel a node after a column or table rename. Edge relations are
    /// shared objects and are renamed by the caller.
    pub fn rename_node(&mut self, old: &Node, new: Node) {
        let in_edges = self.in_node_map.remove(old).unwrap_or_default();
        let out_edges = self.out_node_map.remove(old).unwrap_or_default();
        for edge in in_edges.into_iter().chain(out_edges) {
            self.remove_edge(&edge);
            let mut edge = edge;
            if edge.in_node == *old {
                edge.in_node = new.clone();
            }
            if edge.out_node == *old {
                edge.out_node = new.clone();
            }
            self.add_edge(edge.out_node, edge.in_node, edge.relation);
        }
    }

    /// Drop every edge touching the node (both directions), without resetting
    /// relations; used when a column or table is removed outright.
    pub fn remove_node(&mut self, node: &Node) {
        for edge in self.dependents(node) {
            self.remove_edge(&edge);
        }
        if let Some(edges) = self.out_node_map.remove(node) {
            for edge in edges {
                self.all_edges.remove(&edge);
                if let Some(set) = self.in_node_map.get_mut(&edge.in_node) {
                    set.remove(&edge);
                }
            }
        }
    }

    fn remove_edge(&mut self, edge: &Edge) {
        self.all_edges.remove(edge);
        if let Some(set) = self.in_node_map.get_mut(&edge.in_node) {
            set.remove(edge);
        }
        if let Some(set) = self.out_node_map.get_mut(&edge.out_node) {
            set.remove(edge);
        }
    }

    pub fn edge_count(&self) -> usize {
        self.all_edges.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relation::RelationHandle;

    fn node(t: &str, c: &str) -> Node {
        Node::new(t, c)
    }

    #[test]
    fn test_add_edge_dedupes() {
        let mut graph = Graph::new();
        let rel = RelationHandle::identity("T");
        graph.add_edge(node("T", "a"), node("T", "b"), rel.clone());
        graph.add_edge(node("T", "a"), node("T", "b"), rel);
        assert_eq!(graph.edge_count(), 1);
    }

    #[test]
    fn test_invalidate_propagates_through_chain() {
        let mut graph = Graph::new();
        let rel = RelationHandle::identity("T");
        // c depends on b depends on a.
        graph.add_edge(node("T", "b"), node("T", "a"), rel.clone());
        graph.add_edge(node("T", "c"), node("T", "b"), rel);

        let mut map = RecomputeMap::new();
        graph.invalidate_deps(node("T", "a"), RowSet::rows([1, 2]), &mut map, false);
        assert!(!map.contains_key(&node("T", "a")));
        assert_eq!(map.get(&node("T", "b")), Some(&RowSet::rows([1, 2])));
        assert_eq!(map.get(&node("T", "c")), Some(&RowSet::rows([1, 2])));
    }

    #[test]
    fn test_invalidate_all_rows_clears_dependencies() {
        let mut graph = Graph::new();
        let rel = RelationHandle::identity("T");
        graph.add_edge(node("T", "b"), node("T", "a"), rel.clone());

        let mut map = RecomputeMap::new();
        graph.invalidate_deps(node("T", "b"), RowSet::All, &mut map, true);
        assert_eq!(map.get(&node("T", "b")), Some(&RowSet::All));
        // The whole-column recompute starts from an empty dependency set.
        assert!(graph.dependencies(&node("T", "b")).is_empty());
    }

    #[test]
    fn test_invalidate_prunes_already_dirty() {
        let mut graph = Graph::new();
        let rel = RelationHandle::identity("T");
        // A two-node cycle must terminate.
        graph.add_edge(node("T", "a"), node("T", "b"), rel.clone());
        graph.add_edge(node("T", "b"), node("T", "a"), rel);

        let mut map = RecomputeMap::new();
        graph.invalidate_deps(node("T", "a"), RowSet::rows([1]), &mut map, true);
        assert_eq!(map.get(&node("T", "a")), Some(&RowSet::rows([1])));
        assert_eq!(map.get(&node("T", "b")), Some(&RowSet::rows([1])));
    }

    #[test]
    fn test_long_chain_does_not_overflow() {
        let mut graph = Graph::new();
        let rel = RelationHandle::identity("T");
        for i in 0..50_000 {
            graph.add_edge(
                node("T", &format!("c{}", i + 1)),
                node("T", &format!("c{}", i)),
                rel.clone(),
            );
        }
        let mut map = RecomputeMap::new();
        graph.invalidate_deps(node("T", "c0"), RowSet::rows([1]), &mut map, false);
        assert_eq!(map.len(), 50_000);
    }
}

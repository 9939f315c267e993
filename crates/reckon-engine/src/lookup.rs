//! Lookup indexes backing `lookupRecords` / `lookupOne`.
//!
//! A lookup map maintains `key tuple -> row set` for one combination of key
//! columns (and optional sort order) on a table. Querying registers a
//! dependency from the asking formula cell onto the map's synthetic node via
//! a Lookup relation keyed on the exact tuple, so later changes to source
//! rows invalidate exactly the cells that asked about the affected tuples.
//! The index itself is kept current by the recompute scheduler, which treats
//! the map's node like a column.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeSet, HashMap};
use std::rc::{Rc, Weak};

use crate::depend::{Node, RowSet};
use crate::relation::RelationHandle;
use crate::sort_key::{SortKey, SortSpec};
use crate::table::Table;
use crate::value::{key_of, KeyVal, RowId};

/// The hash-normalized tuple of key-column values for one row or query.
pub type KeyTuple = Vec<KeyVal>;

pub struct LookupMap {
    node: RefCell<Node>,
    table: RefCell<Weak<Table>>,
    key_cols: RefCell<Vec<String>>,
    sort_spec: RefCell<Option<SortSpec>>,
    /// key tuple -> source rows currently carrying that tuple.
    primary: RefCell<HashMap<KeyTuple, RowGroup>>,
    /// source row -> tuple it is indexed under.
    row_key: RefCell<HashMap<RowId, KeyTuple>>,
    /// Sort keys of indexed rows, kept so ordered groups can be updated.
    row_sort: RefCell<HashMap<RowId, SortKey>>,
    /// Lookup relation per referring (dependent) node.
    relations: RefCell<HashMap<Node, RelationHandle>>,
    /// Whether the index has had its initial full build.
    built: Cell<bool>,
}

enum RowGroup {
    Unsorted(BTreeSet<RowId>),
    Sorted(Vec<RowId>),
}

impl LookupMap {
    /// Synthetic column id for the map's graph node, derived from the key
    /// columns and sort order so equal queries share one index.
    pub fn map_col_id(key_cols: &[String], sort_spec: Option<&SortSpec>) -> String {
        let mut id = format!("#lookup#{}", key_cols.join(":"));
        if let Some(spec) = sort_spec {
            id.push('#');
            id.push_str(&spec.canonical());
        }
        id
    }

    pub fn new(
        table: &Rc<Table>,
        map_col_id: &str,
        key_cols: Vec<String>,
        sort_spec: Option<SortSpec>,
    ) -> Rc<LookupMap> {
        Rc::new(LookupMap {
            node: RefCell::new(Node::new(table.table_id(), map_col_id)),
            table: RefCell::new(Rc::downgrade(table)),
            key_cols: RefCell::new(key_cols),
            sort_spec: RefCell::new(sort_spec),
            primary: RefCell::new(HashMap::new()),
            row_key: RefCell::new(HashMap::new()),
            row_sort: RefCell::new(HashMap::new()),
            relations: RefCell::new(HashMap::new()),
            built: Cell::new(false),
        })
    }

    pub fn is_built(&self) -> bool {
        self.built.get()
    }

    pub fn mark_built(&self) {
        self.built.set(true);
    }

    pub fn node(&self) -> Node {
        self.node.borrow().clone()
    }

    pub fn key_cols(&self) -> Vec<String> {
        self.key_cols.borrow().clone()
    }

    pub fn sort_spec(&self) -> Option<SortSpec> {
        self.sort_spec.borrow().clone()
    }

    /// Columns the index reads: keys plus any order_by columns.
    pub fn dep_cols(&self) -> Vec<String> {
        let mut cols = self.key_cols();
        if let Some(spec) = self.sort_spec.borrow().as_ref() {
            for col in spec.col_ids() {
                if !cols.iter().any(|c| c == col) {
                    cols.push(col.to_string());
                }
            }
        }
        cols
    }

    pub fn uses_col(&self, col_id: &str) -> bool {
        self.dep_cols().iter().any(|c| c == col_id)
    }

    /// The Lookup relation for a given dependent node, created on first use.
    pub fn relation_for(self: &Rc<LookupMap>, referring_node: &Node) -> RelationHandle {
        if let Some(rel) = self.relations.borrow().get(referring_node) {
            return rel.clone();
        }
        let rel = RelationHandle::lookup(&referring_node.table_id, self.clone());
        self.relations.borrow_mut().insert(referring_node.clone(), rel.clone());
        rel
    }

    pub fn relations(&self) -> Vec<RelationHandle> {
        self.relations.borrow().values().cloned().collect()
    }

    /// Relabel a renamed referring table in the per-dependent relation keys.
    pub fn rename_referring_table(&self, old_table_id: &str, new_table_id: &str) {
        let mut relations = self.relations.borrow_mut();
        let entries: Vec<(Node, RelationHandle)> = relations.drain().collect();
        for (node, rel) in entries {
            let node = if node.table_id == old_table_id {
                Node::new(new_table_id, node.col_id)
            } else {
                node
            };
            relations.insert(node, rel);
        }
    }

    /// Current key tuple of a source row, read straight from the columns
    /// (no dependency tracing; the map subscribes to its columns itself).
    pub fn compute_key(&self, row_id: RowId) -> KeyTuple {
        let Some(table) = self.table.borrow().upgrade() else {
            return Vec::new();
        };
        self.key_cols
            .borrow()
            .iter()
            .map(|col| key_of(&table.get_cell(col, row_id)))
            .collect()
    }

    /// Tuples a changed row may be registered under: the one it was indexed
    /// with plus the one its current values produce.
    pub fn keys_for_row(&self, row_id: RowId) -> Vec<KeyTuple> {
        let mut keys = Vec::with_capacity(2);
        if let Some(old) = self.row_key.borrow().get(&row_id) {
            keys.push(old.clone());
        }
        if self.table.borrow().upgrade().is_some_and(|t| t.has_row(row_id)) {
            let current = self.compute_key(row_id);
            if !keys.contains(&current) {
                keys.push(current);
            }
        }
        keys
    }

    /// Re-index the given rows (or rebuild entirely for `All`). Called by the
    /// scheduler when the map's node comes up dirty.
    pub fn update_rows(&self, rows: &RowSet) {
        match rows {
            RowSet::All => {
                self.primary.borrow_mut().clear();
                self.row_key.borrow_mut().clear();
                self.row_sort.borrow_mut().clear();
                let Some(table) = self.table.borrow().upgrade() else {
                    return;
                };
                for row_id in table.all_row_ids() {
                    self.index_row(row_id);
                }
            }
            RowSet::Rows(rows) => {
                let table = self.table.borrow().upgrade();
                for &row_id in rows {
                    self.unindex_row(row_id);
                    if table.as_ref().is_some_and(|t| t.has_row(row_id)) {
                        self.index_row(row_id);
                    }
                }
            }
        }
    }

    fn index_row(&self, row_id: RowId) {
        if row_id == 0 {
            return;
        }
        let key = self.compute_key(row_id);
        self.row_key.borrow_mut().insert(row_id, key.clone());
        let sort_spec = self.sort_spec.borrow().clone();
        let mut primary = self.primary.borrow_mut();
        match sort_spec {
            None => {
                let group = primary.entry(key).or_insert_with(|| RowGroup::Unsorted(BTreeSet::new()));
                if let RowGroup::Unsorted(set) = group {
                    set.insert(row_id);
                }
            }
            Some(spec) => {
                let sort_key = self.make_sort_key(row_id, &spec);
                let group = primary.entry(key).or_insert_with(|| RowGroup::Sorted(Vec::new()));
                if let RowGroup::Sorted(rows) = group {
                    let row_sort = self.row_sort.borrow();
                    let pos = rows
                        .binary_search_by(|r| {
                            spec.compare(&row_sort[r], &sort_key)
                        })
                        .unwrap_or_else(|p| p);
                    drop(row_sort);
                    rows.insert(pos, row_id);
                }
                self.row_sort.borrow_mut().insert(row_id, sort_key);
            }
        }
    }

    fn unindex_row(&self, row_id: RowId) {
        let Some(key) = self.row_key.borrow_mut().remove(&row_id) else {
            return;
        };
        let mut primary = self.primary.borrow_mut();
        let empty = match primary.get_mut(&key) {
            Some(RowGroup::Unsorted(set)) => {
                set.remove(&row_id);
                set.is_empty()
            }
            Some(RowGroup::Sorted(rows)) => {
                rows.retain(|r| *r != row_id);
                rows.is_empty()
            }
            None => false,
        };
        if empty {
            primary.remove(&key);
        }
        self.row_sort.borrow_mut().remove(&row_id);
    }

    fn make_sort_key(&self, row_id: RowId, spec: &SortSpec) -> SortKey {
        let table = self.table.borrow().upgrade();
        let values = spec
            .col_ids()
            .map(|col| table.as_ref().map(|t| t.get_cell(col, row_id)).unwrap_or_default())
            .collect();
        SortKey { row_id, values }
    }

    /// Rows matching a key tuple, in the map's order.
    pub fn query(&self, key: &KeyTuple) -> Vec<RowId> {
        match self.primary.borrow().get(key) {
            Some(RowGroup::Unsorted(set)) => set.iter().copied().collect(),
            Some(RowGroup::Sorted(rows)) => rows.clone(),
            None => Vec::new(),
        }
    }

    pub fn clear(&self) {
        self.primary.borrow_mut().clear();
        self.row_key.borrow_mut().clear();
        self.row_sort.borrow_mut().clear();
    }

    pub fn set_table_id(&self, new_table_id: &str) {
        let col_id = self.node.borrow().col_id.clone();
        *self.node.borrow_mut() = Node::new(new_table_id, col_id);
    }

    /// A column rename updates the stored column references; the index
    /// contents are untouched.
    pub fn rename_col(&self, old_col_id: &str, new_col_id: &str) {
        for col in self.key_cols.borrow_mut().iter_mut() {
            if col == old_col_id {
                *col = new_col_id.to_string();
            }
        }
        if let Some(spec) = self.sort_spec.borrow_mut().as_mut() {
            spec.rename_col(old_col_id, new_col_id);
        }
        let new_id = LookupMap::map_col_id(&self.key_cols.borrow(), self.sort_spec.borrow().as_ref());
        let table_id = self.node.borrow().table_id.clone();
        *self.node.borrow_mut() = Node::new(table_id, new_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::ColKind;
    use crate::value::{ColType, Value};

    fn table_with_state() -> Rc<Table> {
        let table = Table::new("Students");
        table.add_column(table.make_column("Name", ColType::Text, ColKind::Data));
        table.add_column(table.make_column("State", ColType::Text, ColKind::Data));
        table.add_rows(&[1, 2, 3]);
        for (row, (name, state)) in [("Al", "NY"), ("Bo", "NY"), ("Ca", "IL")].iter().enumerate() {
            table.set_cell("Name", row as i64 + 1, Value::Text(name.to_string()));
            table.set_cell("State", row as i64 + 1, Value::Text(state.to_string()));
        }
        table
    }

    #[test]
    fn test_query_after_full_update() {
        let table = table_with_state();
        let map = table.lookup_map(vec!["State".into()], None);
        map.update_rows(&RowSet::All);
        assert_eq!(map.query(&vec![key_of(&Value::Text("NY".into()))]), vec![1, 2]);
        assert_eq!(map.query(&vec![key_of(&Value::Text("IL".into()))]), vec![3]);
        assert_eq!(map.query(&vec![key_of(&Value::Text("TX".into()))]), Vec::<RowId>::new());
    }

    #[test]
    fn test_incremental_update_moves_rows_between_keys() {
        let table = table_with_state();
        let map = table.lookup_map(vec!["State".into()], None);
        map.update_rows(&RowSet::All);

        table.set_cell("State", 2, Value::Text("IL".into()));
        // Before the index updates, keys_for_row reports both tuples.
        let keys = map.keys_for_row(2);
        assert_eq!(keys.len(), 2);

        map.update_rows(&RowSet::rows([2]));
        assert_eq!(map.query(&vec![key_of(&Value::Text("NY".into()))]), vec![1]);
        assert_eq!(map.query(&vec![key_of(&Value::Text("IL".into()))]), vec![2, 3]);
    }

    #[test]
    fn test_sorted_lookup_orders_by_spec_with_row_tiebreak() {
        let table = Table::new("T");
        table.add_column(table.make_column("g", ColType::Text, ColKind::Data));
        table.add_column(table.make_column("n", ColType::Int, ColKind::Data));
        table.add_rows(&[1, 2, 3, 4]);
        for (row, n) in [(1, 5), (2, 3), (3, 5), (4, 1)] {
            table.set_cell("g", row, Value::Text("x".into()));
            table.set_cell("n", row, Value::Int(n));
        }
        let map = table.lookup_map(vec!["g".into()], Some(SortSpec::parse_one("-n")));
        map.update_rows(&RowSet::All);
        let key = vec![key_of(&Value::Text("x".into()))];
        assert_eq!(map.query(&key), vec![1, 3, 2, 4]);
    }

    #[test]
    fn test_removed_row_leaves_index() {
        let table = table_with_state();
        let map = table.lookup_map(vec!["State".into()], None);
        map.update_rows(&RowSet::All);
        table.remove_rows(&[1]);
        map.update_rows(&RowSet::rows([1]));
        assert_eq!(map.query(&vec![key_of(&Value::Text("NY".into()))]), vec![2]);
    }

    #[test]
    fn test_shared_map_for_equal_specs() {
        let table = table_with_state();
        let a = table.lookup_map(vec!["State".into()], None);
        let b = table.lookup_map(vec!["State".into()], None);
        assert!(Rc::ptr_eq(&a, &b));
        let c = table.lookup_map(vec!["State".into()], Some(SortSpec::parse_one("Name")));
        assert!(!Rc::ptr_eq(&a, &c));
    }
}

//! Tables: ordered row-id lists plus columns, and the Record/RecordSet
//! views that formulas evaluate against.
//!
//! Row ids are assigned monotonically and never reused; row id 0 is the
//! "no such record" sentinel. Records are lightweight (table, row id,
//! source relation) triples; the relation is what dependency tracking
//! composes as attribute chains are followed.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use indexmap::IndexMap;

use crate::column::{ColKind, Column};
use crate::depend::Node;
use crate::lookup::LookupMap;
use crate::relation::RelationHandle;
use crate::sort_key::SortSpec;
use crate::value::{ColType, RowId, Value};

pub struct Table {
    table_id: RefCell<String>,
    row_ids: RefCell<Vec<RowId>>,
    row_pos: RefCell<HashMap<RowId, usize>>,
    next_row_id: Cell<RowId>,
    columns: RefCell<IndexMap<String, Rc<Column>>>,
    lookups: RefCell<IndexMap<String, Rc<LookupMap>>>,
    identity_rel: RelationHandle,
    single_row_rel: RelationHandle,
}

impl Table {
    pub fn new(table_id: &str) -> Rc<Table> {
        Rc::new(Table {
            table_id: RefCell::new(table_id.to_string()),
            row_ids: RefCell::new(Vec::new()),
            row_pos: RefCell::new(HashMap::new()),
            next_row_id: Cell::new(1),
            columns: RefCell::new(IndexMap::new()),
            lookups: RefCell::new(IndexMap::new()),
            identity_rel: RelationHandle::identity(table_id),
            single_row_rel: RelationHandle::single_row_identity(table_id),
        })
    }

    pub fn table_id(&self) -> String {
        self.table_id.borrow().clone()
    }

    pub fn identity_rel(&self) -> RelationHandle {
        self.identity_rel.clone()
    }

    pub fn single_row_rel(&self) -> RelationHandle {
        self.single_row_rel.clone()
    }

    //----------------------------------------
    // Columns.
    //----------------------------------------

    pub fn add_column(&self, column: Rc<Column>) {
        let n = self.row_ids.borrow().len();
        for _ in column.len()..n {
            column.push_default();
        }
        self.columns.borrow_mut().insert(column.col_id(), column);
    }

    pub fn remove_column(&self, col_id: &str) -> Option<Rc<Column>> {
        self.columns.borrow_mut().shift_remove(col_id)
    }

    pub fn get_column(&self, col_id: &str) -> Option<Rc<Column>> {
        self.columns.borrow().get(col_id).cloned()
    }

    pub fn has_column(&self, col_id: &str) -> bool {
        self.columns.borrow().contains_key(col_id)
    }

    pub fn column_ids(&self) -> Vec<String> {
        self.columns.borrow().keys().cloned().collect()
    }

    pub fn columns(&self) -> Vec<Rc<Column>> {
        self.columns.borrow().values().cloned().collect()
    }

    /// Relabel a column in place, preserving column order. Lookup maps keyed
    /// on the column keep their stored reference (no index rebuild); only
    /// the id strings and their registry keys change.
    pub fn rename_column(&self, old_col_id: &str, new_col_id: &str) -> bool {
        let mut columns = self.columns.borrow_mut();
        let Some(index) = columns.get_index_of(old_col_id) else {
            return false;
        };
        let column = columns[index].clone();
        column.set_col_id(new_col_id);
        let entries: Vec<(String, Rc<Column>)> =
            columns.drain(..).map(|(id, col)| {
                if id == old_col_id { (new_col_id.to_string(), col) } else { (id, col) }
            }).collect();
        columns.extend(entries);
        drop(columns);

        let mut lookups = self.lookups.borrow_mut();
        let entries: Vec<(String, Rc<LookupMap>)> = lookups.drain(..).collect();
        for (_, map) in entries {
            map.rename_col(old_col_id, new_col_id);
            lookups.insert(map.node().col_id, map);
        }
        true
    }

    //----------------------------------------
    // Rows.
    //----------------------------------------

    pub fn row_count(&self) -> usize {
        self.row_ids.borrow().len()
    }

    pub fn all_row_ids(&self) -> Vec<RowId> {
        self.row_ids.borrow().clone()
    }

    pub fn has_row(&self, row_id: RowId) -> bool {
        self.row_pos.borrow().contains_key(&row_id)
    }

    pub fn row_index(&self, row_id: RowId) -> Option<usize> {
        self.row_pos.borrow().get(&row_id).copied()
    }

    /// Allocate the next fresh row id.
    pub fn alloc_row_id(&self) -> RowId {
        let id = self.next_row_id.get();
        self.next_row_id.set(id + 1);
        id
    }

    /// Register externally supplied row ids (e.g. from a load or an explicit
    /// AddRecord), keeping the monotonic allocator ahead of them.
    pub fn add_rows(&self, new_row_ids: &[RowId]) {
        let mut row_ids = self.row_ids.borrow_mut();
        let mut row_pos = self.row_pos.borrow_mut();
        for &row_id in new_row_ids {
            debug_assert!(row_id > 0 && !row_pos.contains_key(&row_id));
            row_pos.insert(row_id, row_ids.len());
            row_ids.push(row_id);
            if row_id >= self.next_row_id.get() {
                self.next_row_id.set(row_id + 1);
            }
        }
        drop(row_ids);
        drop(row_pos);
        for column in self.columns.borrow().values() {
            for _ in 0..new_row_ids.len() {
                column.push_default();
            }
            // Keep reference inverse maps off the fresh defaults; they are
            // populated when values land.
        }
    }

    /// Remove rows, dropping their values from every column. The freed ids
    /// are never reused.
    pub fn remove_rows(&self, removed: &[RowId]) {
        let mut indices: Vec<usize> = removed.iter().filter_map(|r| self.row_index(*r)).collect();
        indices.sort_unstable();
        if indices.is_empty() {
            return;
        }
        for column in self.columns.borrow().values() {
            // Unhook reference inverse entries for the dying rows first.
            if let Some(rel) = column.ref_rel() {
                for &index in &indices {
                    let row_id = self.row_ids.borrow()[index];
                    for target in ref_targets(&column.get_at(index)) {
                        rel.remove_reference(row_id, target);
                    }
                }
            }
            column.remove_indices(&indices);
        }
        let mut row_ids = self.row_ids.borrow_mut();
        for &index in indices.iter().rev() {
            row_ids.remove(index);
        }
        let mut row_pos = self.row_pos.borrow_mut();
        row_pos.clear();
        for (i, &row_id) in row_ids.iter().enumerate() {
            row_pos.insert(row_id, i);
        }
    }

    /// Drop all rows (ReplaceTableData); ids remain retired.
    pub fn clear_rows(&self) {
        let all: Vec<RowId> = self.all_row_ids();
        self.remove_rows(&all);
    }

    //----------------------------------------
    // Cells.
    //----------------------------------------

    /// Read a cell. Row 0 and unknown rows yield the column's type default.
    pub fn get_cell(&self, col_id: &str, row_id: RowId) -> Value {
        let Some(column) = self.get_column(col_id) else {
            return Value::Null;
        };
        match self.row_index(row_id) {
            Some(index) => column.get_at(index),
            None => column.type_default(),
        }
    }

    /// Write a cell, converting to the column type and maintaining the
    /// reference inverse index. Writes at row 0 or unknown rows are silently
    /// ignored. Returns the previous value when a write happened.
    pub fn set_cell(&self, col_id: &str, row_id: RowId, value: Value) -> Option<Value> {
        let column = self.get_column(col_id)?;
        let index = self.row_index(row_id)?;
        let converted = crate::value::convert_value(value, &column.col_type());
        let old = column.get_at(index);
        if let Some(rel) = column.ref_rel() {
            for target in ref_targets(&old) {
                rel.remove_reference(row_id, target);
            }
            for target in ref_targets(&converted) {
                rel.add_reference(row_id, target);
            }
        }
        column.set_at(index, converted);
        Some(old)
    }

    /// Store a computed value without type conversion (formula results carry
    /// their own types, including boxed errors).
    pub fn store_computed(&self, col_id: &str, row_id: RowId, value: Value) -> Option<Value> {
        let column = self.get_column(col_id)?;
        let index = self.row_index(row_id)?;
        let old = column.get_at(index);
        if let Some(rel) = column.ref_rel() {
            for target in ref_targets(&old) {
                rel.remove_reference(row_id, target);
            }
            for target in ref_targets(&value) {
                rel.add_reference(row_id, target);
            }
        }
        column.set_at(index, value);
        Some(old)
    }

    //----------------------------------------
    // Lookup maps.
    //----------------------------------------

    /// Fetch or create the lookup map for the given key columns and sort
    /// order. The map's node id is derived from both, so equal queries share
    /// one index.
    pub fn lookup_map(
        self: &Rc<Table>,
        key_cols: Vec<String>,
        sort_spec: Option<SortSpec>,
    ) -> Rc<LookupMap> {
        let map_id = LookupMap::map_col_id(&key_cols, sort_spec.as_ref());
        if let Some(existing) = self.lookups.borrow().get(&map_id) {
            return existing.clone();
        }
        let map = LookupMap::new(self, &map_id, key_cols, sort_spec);
        self.lookups.borrow_mut().insert(map_id, map.clone());
        map
    }

    pub fn lookup_maps(&self) -> Vec<Rc<LookupMap>> {
        self.lookups.borrow().values().cloned().collect()
    }

    pub fn get_lookup_map(&self, map_col_id: &str) -> Option<Rc<LookupMap>> {
        self.lookups.borrow().get(map_col_id).cloned()
    }

    /// Drop lookup maps keyed on a column whose type changed; their nodes are
    /// invalidated by the caller so dependents re-query fresh indexes.
    pub fn drop_lookup_maps_keyed_on(&self, col_id: &str) -> Vec<Rc<LookupMap>> {
        let mut lookups = self.lookups.borrow_mut();
        let (keep, dropped): (Vec<_>, Vec<_>) =
            lookups.drain(..).partition(|(_, map)| !map.uses_col(col_id));
        lookups.extend(keep);
        dropped.into_iter().map(|(_, map)| map).collect()
    }

    /// Rename the table id everywhere the table itself stores it. Reference
    /// relations pointing here from other tables are renamed by the engine.
    pub fn set_table_id(&self, new_table_id: &str) {
        let old = self.table_id();
        *self.table_id.borrow_mut() = new_table_id.to_string();
        self.identity_rel.rename_table(&old, new_table_id);
        self.single_row_rel.rename_table(&old, new_table_id);
        for lookup in self.lookup_maps() {
            lookup.set_table_id(new_table_id);
        }
        for column in self.columns() {
            if let Some(rel) = column.ref_rel() {
                rel.rename_table(&old, new_table_id);
            }
        }
    }

    /// The graph node for one of this table's columns.
    pub fn node(&self, col_id: &str) -> Node {
        Node::new(self.table_id(), col_id)
    }

    /// The identity-or-single-row relation a formula frame should use, by
    /// column kind.
    pub fn frame_rel(&self, column: &Column) -> RelationHandle {
        match column.kind() {
            ColKind::Trigger { .. } => self.single_row_rel(),
            _ => self.identity_rel(),
        }
    }

    /// Create a column with the engine-side plumbing (reference relation).
    pub fn make_column(self: &Rc<Table>, col_id: &str, col_type: ColType, kind: ColKind) -> Rc<Column> {
        let column = Rc::new(Column::new(col_id, col_type.clone(), kind));
        if let Some(target) = col_type.ref_target() {
            column.set_ref_rel(Some(RelationHandle::reference(&self.table_id(), col_id, target)));
        }
        column
    }
}

/// The row ids a reference-typed value points at.
pub fn ref_targets(value: &Value) -> Vec<RowId> {
    match value {
        Value::Ref(r) if *r != 0 => vec![*r],
        Value::RefList(ids) => ids.iter().copied().filter(|r| *r != 0).collect(),
        _ => Vec::new(),
    }
}

/// A single record: the primary means of accessing values in formulas.
#[derive(Clone)]
pub struct Record {
    pub table: Rc<Table>,
    pub row_id: RowId,
    pub rel: RelationHandle,
}

/// A collection of records, as returned by `lookupRecords`.
#[derive(Clone)]
pub struct RecordSet {
    pub table: Rc<Table>,
    pub row_ids: Vec<RowId>,
    pub rel: RelationHandle,
}

impl RecordSet {
    /// The first record by the set's order, or the row-0 sentinel record.
    pub fn get_one(&self) -> Record {
        let row_id = self.row_ids.first().copied().unwrap_or(0);
        Record { table: self.table.clone(), row_id, rel: self.rel.clone() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_table() -> Rc<Table> {
        let table = Table::new("T");
        table.add_column(table.make_column("name", ColType::Text, ColKind::Data));
        table.add_column(table.make_column("n", ColType::Int, ColKind::Data));
        table
    }

    #[test]
    fn test_row_zero_reads_defaults() {
        let table = sample_table();
        table.add_rows(&[1]);
        table.set_cell("name", 1, Value::Text("x".into()));
        assert_eq!(table.get_cell("name", 0), Value::Text(String::new()));
        assert_eq!(table.get_cell("n", 0), Value::Int(0));
        // Writes at row 0 are silently ignored.
        assert_eq!(table.set_cell("name", 0, Value::Text("y".into())), None);
    }

    #[test]
    fn test_row_ids_never_reused() {
        let table = sample_table();
        let a = table.alloc_row_id();
        table.add_rows(&[a]);
        table.remove_rows(&[a]);
        let b = table.alloc_row_id();
        assert!(b > a);
    }

    #[test]
    fn test_add_rows_fills_defaults() {
        let table = sample_table();
        table.add_rows(&[1, 2]);
        assert_eq!(table.get_cell("n", 2), Value::Int(0));
        table.set_cell("n", 2, Value::Int(9));
        assert_eq!(table.get_cell("n", 2), Value::Int(9));
        assert_eq!(table.get_cell("n", 1), Value::Int(0));
    }

    #[test]
    fn test_reference_inverse_maintained_on_writes() {
        let table = Table::new("A");
        table.add_column(table.make_column("link", ColType::Ref("B".into()), ColKind::Data));
        table.add_rows(&[1, 2]);
        let rel = table.get_column("link").unwrap().ref_rel().unwrap();

        table.set_cell("link", 1, Value::Ref(10));
        table.set_cell("link", 2, Value::Ref(10));
        assert_eq!(rel.affected(&crate::depend::RowSet::rows([10])),
                   crate::depend::RowSet::rows([1, 2]));

        table.set_cell("link", 1, Value::Ref(11));
        assert_eq!(rel.affected(&crate::depend::RowSet::rows([10])),
                   crate::depend::RowSet::rows([2]));

        table.remove_rows(&[2]);
        assert_eq!(rel.affected(&crate::depend::RowSet::rows([10])),
                   crate::depend::RowSet::empty());
    }

    #[test]
    fn test_rename_column_preserves_order_and_values() {
        let table = sample_table();
        table.add_rows(&[1]);
        table.set_cell("name", 1, Value::Text("x".into()));
        assert!(table.rename_column("name", "title"));
        assert_eq!(table.column_ids(), vec!["title".to_string(), "n".to_string()]);
        assert_eq!(table.get_cell("title", 1), Value::Text("x".into()));
    }
}

//! Per-pass summary of calc changes.
//!
//! Repeated updates to the same cell during a recompute pass coalesce into a
//! single delta (first old value, last new value). Flushing converts the
//! deltas into Update/BulkUpdateRecord actions, appended to the group's
//! stored, calc and undo streams in recompute order.

use std::collections::BTreeMap;

use indexmap::IndexMap;

use crate::actions::{ActionGroup, BulkCellUpdates, CellUpdates, DocAction};
use crate::value::{RowId, Value};

#[derive(Default)]
pub struct ActionSummary {
    /// (table, column) -> row -> (old, new); insertion order is the order in
    /// which columns first changed during the pass.
    deltas: IndexMap<(String, String), BTreeMap<RowId, (Value, Value)>>,
}

impl ActionSummary {
    pub fn new() -> ActionSummary {
        ActionSummary::default()
    }

    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }

    pub fn add_cell_change(
        &mut self,
        table_id: &str,
        col_id: &str,
        row_id: RowId,
        old: Value,
        new: Value,
    ) {
        let rows = self.deltas.entry((table_id.to_string(), col_id.to_string())).or_default();
        match rows.get_mut(&row_id) {
            Some((_, last)) => *last = new,
            None => {
                rows.insert(row_id, (old, new));
            }
        }
    }

    /// Drop pending deltas for rows that were removed mid-pass.
    pub fn discard_rows(&mut self, table_id: &str, row_ids: &[RowId]) {
        for ((t, _), rows) in self.deltas.iter_mut() {
            if t == table_id {
                for row_id in row_ids {
                    rows.remove(row_id);
                }
            }
        }
    }

    /// Drop pending deltas for an entire table (table removal mid-pass).
    pub fn discard_table(&mut self, table_id: &str) {
        self.deltas.retain(|(t, _), _| t != table_id);
    }

    pub fn rename_table(&mut self, old_table_id: &str, new_table_id: &str) {
        let entries: Vec<_> = self.deltas.drain(..).collect();
        for ((t, c), rows) in entries {
            let t = if t == old_table_id { new_table_id.to_string() } else { t };
            self.deltas.insert((t, c), rows);
        }
    }

    pub fn rename_column(&mut self, table_id: &str, old_col_id: &str, new_col_id: &str) {
        let entries: Vec<_> = self.deltas.drain(..).collect();
        for ((t, c), rows) in entries {
            let c = if t == table_id && c == old_col_id { new_col_id.to_string() } else { c };
            self.deltas.insert((t, c), rows);
        }
    }

    /// Convert the deltas to actions on the group and clear the summary.
    pub fn flush(&mut self, group: &mut ActionGroup) {
        for ((table_id, col_id), rows) in self.deltas.drain(..) {
            let changed: Vec<(RowId, Value, Value)> = rows
                .into_iter()
                .filter(|(_, (old, new))| old != new)
                .map(|(row, (old, new))| (row, old, new))
                .collect();
            if changed.is_empty() {
                continue;
            }
            let (action, inverse) = if changed.len() == 1 {
                let (row_id, old, new) = changed.into_iter().next().unwrap();
                let mut columns = CellUpdates::new();
                columns.insert(col_id.clone(), new);
                let mut old_columns = CellUpdates::new();
                old_columns.insert(col_id.clone(), old);
                (
                    DocAction::UpdateRecord { table_id: table_id.clone(), row_id, columns },
                    DocAction::UpdateRecord { table_id, row_id, columns: old_columns },
                )
            } else {
                let row_ids: Vec<RowId> = changed.iter().map(|(r, _, _)| *r).collect();
                let news: Vec<Value> = changed.iter().map(|(_, _, n)| n.clone()).collect();
                let olds: Vec<Value> = changed.into_iter().map(|(_, o, _)| o).collect();
                let mut columns = BulkCellUpdates::new();
                columns.insert(col_id.clone(), news);
                let mut old_columns = BulkCellUpdates::new();
                old_columns.insert(col_id.clone(), olds);
                (
                    DocAction::BulkUpdateRecord {
                        table_id: table_id.clone(),
                        row_ids: row_ids.clone(),
                        columns,
                    },
                    DocAction::BulkUpdateRecord { table_id, row_ids, columns: old_columns },
                )
            };
            group.calc.push(action.clone());
            group.record(action, false, vec![inverse]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeated_updates_coalesce() {
        let mut summary = ActionSummary::new();
        summary.add_cell_change("T", "c", 1, Value::Int(1), Value::Int(2));
        summary.add_cell_change("T", "c", 1, Value::Int(2), Value::Int(3));
        let mut group = ActionGroup::new();
        summary.flush(&mut group);
        assert_eq!(group.stored.len(), 1);
        assert_eq!(group.calc.len(), 1);
        let DocAction::UpdateRecord { ref columns, .. } = group.stored[0] else {
            panic!("expected UpdateRecord");
        };
        assert_eq!(columns.get("c"), Some(&Value::Int(3)));
        let DocAction::UpdateRecord { columns: ref old, .. } = group.undo[0] else {
            panic!("expected UpdateRecord undo");
        };
        assert_eq!(old.get("c"), Some(&Value::Int(1)));
    }

    #[test]
    fn test_round_trip_to_original_value_is_dropped() {
        let mut summary = ActionSummary::new();
        summary.add_cell_change("T", "c", 1, Value::Int(1), Value::Int(2));
        summary.add_cell_change("T", "c", 1, Value::Int(2), Value::Int(1));
        let mut group = ActionGroup::new();
        summary.flush(&mut group);
        assert!(group.stored.is_empty());
        assert!(group.calc.is_empty());
    }

    #[test]
    fn test_bulk_coalescing_in_recompute_order() {
        let mut summary = ActionSummary::new();
        summary.add_cell_change("T", "b", 2, Value::Int(0), Value::Int(5));
        summary.add_cell_change("T", "a", 1, Value::Int(0), Value::Int(4));
        summary.add_cell_change("T", "b", 3, Value::Int(0), Value::Int(6));
        let mut group = ActionGroup::new();
        summary.flush(&mut group);
        // Column b changed first, so its action comes first.
        assert_eq!(group.stored[0].name(), "BulkUpdateRecord");
        let DocAction::BulkUpdateRecord { ref row_ids, .. } = group.stored[0] else {
            panic!();
        };
        assert_eq!(row_ids, &vec![2, 3]);
        assert_eq!(group.stored[1].name(), "UpdateRecord");
    }
}

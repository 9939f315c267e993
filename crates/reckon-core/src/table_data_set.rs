//! A schema-agnostic holder for full document data.
//!
//! TableDataSet keeps every table as plain JSON values and applies document
//! actions with minimal assumptions about their interpretation. Migrations
//! run on top of it, because they must manipulate documents whose schema
//! predates the current one.

use std::collections::HashMap;

use reckon_engine::{ColInfo, DocAction, RowId};

use crate::error::{DocError, Result};

#[derive(Default, Clone)]
pub struct TableData {
    pub row_ids: Vec<RowId>,
    pub columns: HashMap<String, Vec<serde_json::Value>>,
}

#[derive(Default)]
pub struct TableDataSet {
    pub all_tables: HashMap<String, TableData>,
    schema: HashMap<String, HashMap<String, ColInfo>>,
}

impl TableDataSet {
    pub fn new() -> TableDataSet {
        TableDataSet::default()
    }

    /// Load one table from its wire payload (row ids + column arrays).
    pub fn load_table(
        &mut self,
        table_id: &str,
        row_ids: Vec<RowId>,
        columns: HashMap<String, Vec<serde_json::Value>>,
    ) {
        // The schema is reconstructed loosely: anything present is data.
        let schema = self.schema.entry(table_id.to_string()).or_default();
        for col in columns.keys() {
            schema.entry(col.clone()).or_insert_with(|| ColInfo::data("Any"));
        }
        self.all_tables.insert(table_id.to_string(), TableData { row_ids, columns });
    }

    pub fn get_col_info(&self, table_id: &str, col_id: &str) -> Option<&ColInfo> {
        self.schema.get(table_id)?.get(col_id)
    }

    pub fn apply_doc_actions(&mut self, actions: &[DocAction]) -> Result<()> {
        for action in actions {
            self.apply_doc_action(action)?;
        }
        Ok(())
    }

    pub fn apply_doc_action(&mut self, action: &DocAction) -> Result<()> {
        match action {
            DocAction::AddRecord { table_id, row_id, columns } => {
                let mut bulk: HashMap<String, Vec<serde_json::Value>> = HashMap::new();
                for (col, value) in columns {
                    bulk.insert(col.clone(), vec![value.to_repr()]);
                }
                self.bulk_add(table_id, &[*row_id], bulk)
            }
            DocAction::BulkAddRecord { table_id, row_ids, columns } => {
                let bulk = columns
                    .iter()
                    .map(|(c, vs)| (c.clone(), vs.iter().map(|v| v.to_repr()).collect()))
                    .collect();
                self.bulk_add(table_id, row_ids, bulk)
            }
            DocAction::RemoveRecord { table_id, row_id } => {
                self.bulk_remove(table_id, &[*row_id])
            }
            DocAction::BulkRemoveRecord { table_id, row_ids } => {
                self.bulk_remove(table_id, row_ids)
            }
            DocAction::UpdateRecord { table_id, row_id, columns } => {
                let bulk: HashMap<String, Vec<serde_json::Value>> = columns
                    .iter()
                    .map(|(c, v)| (c.clone(), vec![v.to_repr()]))
                    .collect();
                self.bulk_update(table_id, &[*row_id], bulk)
            }
            DocAction::BulkUpdateRecord { table_id, row_ids, columns } => {
                let bulk = columns
                    .iter()
                    .map(|(c, vs)| (c.clone(), vs.iter().map(|v| v.to_repr()).collect()))
                    .collect();
                self.bulk_update(table_id, row_ids, bulk)
            }
            DocAction::ReplaceTableData { table_id, row_ids, columns } => {
                let table = self.table_mut(table_id)?;
                table.row_ids.clear();
                for values in table.columns.values_mut() {
                    values.clear();
                }
                let bulk = columns
                    .iter()
                    .map(|(c, vs)| (c.clone(), vs.iter().map(|v| v.to_repr()).collect()))
                    .collect();
                self.bulk_add(table_id, row_ids, bulk)
            }
            DocAction::AddColumn { table_id, col_id, info } => {
                let n = self.table_mut(table_id)?.row_ids.len();
                let default = type_default_repr(&info.col_type);
                self.table_mut(table_id)?
                    .columns
                    .insert(col_id.clone(), vec![default; n]);
                self.schema
                    .entry(table_id.clone())
                    .or_default()
                    .insert(col_id.clone(), info.clone());
                Ok(())
            }
            DocAction::RemoveColumn { table_id, col_id } => {
                self.table_mut(table_id)?.columns.remove(col_id);
                if let Some(schema) = self.schema.get_mut(table_id) {
                    schema.remove(col_id);
                }
                Ok(())
            }
            DocAction::RenameColumn { table_id, old_col_id, new_col_id } => {
                let table = self.table_mut(table_id)?;
                if let Some(values) = table.columns.remove(old_col_id) {
                    table.columns.insert(new_col_id.clone(), values);
                }
                if let Some(schema) = self.schema.get_mut(table_id) {
                    if let Some(info) = schema.remove(old_col_id) {
                        schema.insert(new_col_id.clone(), info);
                    }
                }
                Ok(())
            }
            DocAction::ModifyColumn { table_id, col_id, delta } => {
                let info = self
                    .schema
                    .entry(table_id.clone())
                    .or_default()
                    .entry(col_id.clone())
                    .or_insert_with(|| ColInfo::data("Any"));
                if let Some(t) = &delta.col_type {
                    info.col_type = t.clone();
                }
                if let Some(f) = delta.is_formula {
                    info.is_formula = f;
                }
                if let Some(f) = &delta.formula {
                    info.formula = f.clone();
                }
                Ok(())
            }
            DocAction::AddTable { table_id, columns } => {
                let mut table = TableData::default();
                let mut schema = HashMap::new();
                for (col_id, info) in columns {
                    table.columns.insert(col_id.clone(), Vec::new());
                    schema.insert(col_id.clone(), info.clone());
                }
                self.all_tables.insert(table_id.clone(), table);
                self.schema.insert(table_id.clone(), schema);
                Ok(())
            }
            DocAction::RemoveTable { table_id } => {
                self.all_tables.remove(table_id);
                self.schema.remove(table_id);
                Ok(())
            }
            DocAction::RenameTable { old_table_id, new_table_id } => {
                if let Some(table) = self.all_tables.remove(old_table_id) {
                    self.all_tables.insert(new_table_id.clone(), table);
                }
                if let Some(schema) = self.schema.remove(old_table_id) {
                    self.schema.insert(new_table_id.clone(), schema);
                }
                Ok(())
            }
        }
    }

    fn table_mut(&mut self, table_id: &str) -> Result<&mut TableData> {
        self.all_tables
            .get_mut(table_id)
            .ok_or_else(|| DocError::invalid(format!("no such table: {}", table_id)))
    }

    fn bulk_add(
        &mut self,
        table_id: &str,
        row_ids: &[RowId],
        mut columns: HashMap<String, Vec<serde_json::Value>>,
    ) -> Result<()> {
        let schema = self.schema.get(table_id).cloned().unwrap_or_default();
        let table = self.table_mut(table_id)?;
        table.row_ids.extend_from_slice(row_ids);
        for (col, values) in table.columns.iter_mut() {
            match columns.remove(col) {
                Some(new_values) => values.extend(new_values),
                None => {
                    let default = schema
                        .get(col)
                        .map(|info| type_default_repr(&info.col_type))
                        .unwrap_or(serde_json::Value::Null);
                    values.extend(std::iter::repeat_n(default, row_ids.len()));
                }
            }
        }
        Ok(())
    }

    fn bulk_remove(&mut self, table_id: &str, row_ids: &[RowId]) -> Result<()> {
        let table = self.table_mut(table_id)?;
        let remove: Vec<bool> = table.row_ids.iter().map(|r| row_ids.contains(r)).collect();
        for values in table.columns.values_mut() {
            let mut keep = remove.iter();
            values.retain(|_| !keep.next().copied().unwrap_or(false));
        }
        let mut keep = remove.iter();
        table.row_ids.retain(|_| !keep.next().copied().unwrap_or(false));
        Ok(())
    }

    fn bulk_update(
        &mut self,
        table_id: &str,
        row_ids: &[RowId],
        columns: HashMap<String, Vec<serde_json::Value>>,
    ) -> Result<()> {
        let table = self.table_mut(table_id)?;
        let index_of: HashMap<RowId, usize> =
            table.row_ids.iter().enumerate().map(|(i, &r)| (r, i)).collect();
        for (col, new_values) in columns {
            let Some(values) = table.columns.get_mut(&col) else {
                continue;
            };
            for (row_id, value) in row_ids.iter().zip(new_values) {
                if let Some(&index) = index_of.get(row_id) {
                    values[index] = value;
                }
            }
        }
        Ok(())
    }
}

fn type_default_repr(col_type: &str) -> serde_json::Value {
    reckon_engine::ColType::parse(col_type).default_value().to_repr()
}

#[cfg(test)]
mod tests {
    use super::*;
    use reckon_engine::actions::BulkCellUpdates;
    use reckon_engine::Value;
    use serde_json::json;

    #[test]
    fn test_add_and_remove_records() {
        let mut set = TableDataSet::new();
        set.apply_doc_action(&DocAction::AddTable {
            table_id: "T".into(),
            columns: vec![("a".into(), ColInfo::data("Int"))],
        })
        .unwrap();
        let mut columns = BulkCellUpdates::new();
        columns.insert("a".into(), vec![Value::Int(1), Value::Int(2)]);
        set.apply_doc_action(&DocAction::BulkAddRecord {
            table_id: "T".into(),
            row_ids: vec![1, 2],
            columns,
        })
        .unwrap();
        set.apply_doc_action(&DocAction::RemoveRecord { table_id: "T".into(), row_id: 1 })
            .unwrap();
        let table = &set.all_tables["T"];
        assert_eq!(table.row_ids, vec![2]);
        assert_eq!(table.columns["a"], vec![json!(2)]);
    }

    #[test]
    fn test_missing_columns_fill_defaults() {
        let mut set = TableDataSet::new();
        set.apply_doc_action(&DocAction::AddTable {
            table_id: "T".into(),
            columns: vec![("a".into(), ColInfo::data("Int")), ("b".into(), ColInfo::data("Text"))],
        })
        .unwrap();
        let mut columns = BulkCellUpdates::new();
        columns.insert("a".into(), vec![Value::Int(5)]);
        set.apply_doc_action(&DocAction::BulkAddRecord {
            table_id: "T".into(),
            row_ids: vec![1],
            columns,
        })
        .unwrap();
        assert_eq!(set.all_tables["T"].columns["b"], vec![json!("")]);
    }
}

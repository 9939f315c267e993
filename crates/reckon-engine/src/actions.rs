//! Document actions: the primitive, reversible mutations of a document,
//! and the four-stream group that packages one submission's results.
//!
//! The wire form of an action is the array `[name, ...positional fields]`,
//! e.g. `["UpdateRecord", "Students", 7, {"firstName": "Alice"}]`.

use std::collections::BTreeMap;

use serde_json::json;

use crate::value::{RowId, Value};

/// Column metadata as carried by AddColumn/AddTable.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct ColInfo {
    pub col_type: String,
    pub is_formula: bool,
    pub formula: String,
}

impl ColInfo {
    pub fn data(col_type: &str) -> ColInfo {
        ColInfo { col_type: col_type.to_string(), is_formula: false, formula: String::new() }
    }

    pub fn formula(col_type: &str, formula: &str) -> ColInfo {
        ColInfo { col_type: col_type.to_string(), is_formula: true, formula: formula.to_string() }
    }

    pub fn to_json(&self) -> serde_json::Value {
        json!({"type": self.col_type, "isFormula": self.is_formula, "formula": self.formula})
    }

    pub fn from_json(value: &serde_json::Value) -> ColInfo {
        ColInfo {
            col_type: value.get("type").and_then(|v| v.as_str()).unwrap_or("Any").to_string(),
            is_formula: value.get("isFormula").and_then(|v| v.as_bool()).unwrap_or(false),
            formula: value.get("formula").and_then(|v| v.as_str()).unwrap_or("").to_string(),
        }
    }
}

/// Partial column metadata for ModifyColumn; None fields are untouched.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct ColDelta {
    pub col_type: Option<String>,
    pub is_formula: Option<bool>,
    pub formula: Option<String>,
}

impl ColDelta {
    pub fn is_empty(&self) -> bool {
        self.col_type.is_none() && self.is_formula.is_none() && self.formula.is_none()
    }

    pub fn to_json(&self) -> serde_json::Value {
        let mut obj = serde_json::Map::new();
        if let Some(t) = &self.col_type {
            obj.insert("type".into(), json!(t));
        }
        if let Some(f) = self.is_formula {
            obj.insert("isFormula".into(), json!(f));
        }
        if let Some(f) = &self.formula {
            obj.insert("formula".into(), json!(f));
        }
        serde_json::Value::Object(obj)
    }

    pub fn from_json(value: &serde_json::Value) -> ColDelta {
        ColDelta {
            col_type: value.get("type").and_then(|v| v.as_str()).map(str::to_string),
            is_formula: value.get("isFormula").and_then(|v| v.as_bool()),
            formula: value.get("formula").and_then(|v| v.as_str()).map(str::to_string),
        }
    }
}

pub type CellUpdates = BTreeMap<String, Value>;
pub type BulkCellUpdates = BTreeMap<String, Vec<Value>>;

#[derive(Clone, Debug, PartialEq)]
pub enum DocAction {
    AddRecord { table_id: String, row_id: RowId, columns: CellUpdates },
    BulkAddRecord { table_id: String, row_ids: Vec<RowId>, columns: BulkCellUpdates },
    RemoveRecord { table_id: String, row_id: RowId },
    BulkRemoveRecord { table_id: String, row_ids: Vec<RowId> },
    UpdateRecord { table_id: String, row_id: RowId, columns: CellUpdates },
    BulkUpdateRecord { table_id: String, row_ids: Vec<RowId>, columns: BulkCellUpdates },
    ReplaceTableData { table_id: String, row_ids: Vec<RowId>, columns: BulkCellUpdates },
    AddColumn { table_id: String, col_id: String, info: ColInfo },
    RemoveColumn { table_id: String, col_id: String },
    RenameColumn { table_id: String, old_col_id: String, new_col_id: String },
    ModifyColumn { table_id: String, col_id: String, delta: ColDelta },
    AddTable { table_id: String, columns: Vec<(String, ColInfo)> },
    RemoveTable { table_id: String },
    RenameTable { old_table_id: String, new_table_id: String },
}

impl DocAction {
    pub fn name(&self) -> &'static str {
        match self {
            DocAction::AddRecord { .. } => "AddRecord",
            DocAction::BulkAddRecord { .. } => "BulkAddRecord",
            DocAction::RemoveRecord { .. } => "RemoveRecord",
            DocAction::BulkRemoveRecord { .. } => "BulkRemoveRecord",
            DocAction::UpdateRecord { .. } => "UpdateRecord",
            DocAction::BulkUpdateRecord { .. } => "BulkUpdateRecord",
            DocAction::ReplaceTableData { .. } => "ReplaceTableData",
            DocAction::AddColumn { .. } => "AddColumn",
            DocAction::RemoveColumn { .. } => "RemoveColumn",
            DocAction::RenameColumn { .. } => "RenameColumn",
            DocAction::ModifyColumn { .. } => "ModifyColumn",
            DocAction::AddTable { .. } => "AddTable",
            DocAction::RemoveTable { .. } => "RemoveTable",
            DocAction::RenameTable { .. } => "RenameTable",
        }
    }

    pub fn table_id(&self) -> &str {
        match self {
            DocAction::AddRecord { table_id, .. }
            | DocAction::BulkAddRecord { table_id, .. }
            | DocAction::RemoveRecord { table_id, .. }
            | DocAction::BulkRemoveRecord { table_id, .. }
            | DocAction::UpdateRecord { table_id, .. }
            | DocAction::BulkUpdateRecord { table_id, .. }
            | DocAction::ReplaceTableData { table_id, .. }
            | DocAction::AddColumn { table_id, .. }
            | DocAction::RemoveColumn { table_id, .. }
            | DocAction::RenameColumn { table_id, .. }
            | DocAction::ModifyColumn { table_id, .. }
            | DocAction::AddTable { table_id, .. }
            | DocAction::RemoveTable { table_id } => table_id,
            DocAction::RenameTable { old_table_id, .. } => old_table_id,
        }
    }

    pub fn to_repr(&self) -> serde_json::Value {
        match self {
            DocAction::AddRecord { table_id, row_id, columns } => {
                json!([self.name(), table_id, row_id, cells_repr(columns)])
            }
            DocAction::BulkAddRecord { table_id, row_ids, columns }
            | DocAction::BulkUpdateRecord { table_id, row_ids, columns }
            | DocAction::ReplaceTableData { table_id, row_ids, columns } => {
                json!([self.name(), table_id, row_ids, bulk_cells_repr(columns)])
            }
            DocAction::RemoveRecord { table_id, row_id } => {
                json!([self.name(), table_id, row_id])
            }
            DocAction::BulkRemoveRecord { table_id, row_ids } => {
                json!([self.name(), table_id, row_ids])
            }
            DocAction::UpdateRecord { table_id, row_id, columns } => {
                json!([self.name(), table_id, row_id, cells_repr(columns)])
            }
            DocAction::AddColumn { table_id, col_id, info } => {
                json!([self.name(), table_id, col_id, info.to_json()])
            }
            DocAction::RemoveColumn { table_id, col_id } => {
                json!([self.name(), table_id, col_id])
            }
            DocAction::RenameColumn { table_id, old_col_id, new_col_id } => {
                json!([self.name(), table_id, old_col_id, new_col_id])
            }
            DocAction::ModifyColumn { table_id, col_id, delta } => {
                json!([self.name(), table_id, col_id, delta.to_json()])
            }
            DocAction::AddTable { table_id, columns } => {
                let cols: Vec<serde_json::Value> = columns
                    .iter()
                    .map(|(col_id, info)| {
                        let mut obj = info.to_json();
                        obj["id"] = json!(col_id);
                        obj
                    })
                    .collect();
                json!([self.name(), table_id, cols])
            }
            DocAction::RemoveTable { table_id } => json!([self.name(), table_id]),
            DocAction::RenameTable { old_table_id, new_table_id } => {
                json!([self.name(), old_table_id, new_table_id])
            }
        }
    }

    /// Decode a wire-form action. Returns None for malformed input.
    pub fn from_repr(repr: &serde_json::Value) -> Option<DocAction> {
        let arr = repr.as_array()?;
        let name = arr.first()?.as_str()?;
        let table_id = arr.get(1)?.as_str()?.to_string();
        let action = match name {
            "AddRecord" => DocAction::AddRecord {
                table_id,
                row_id: arr.get(2)?.as_i64()?,
                columns: cells_from_repr(arr.get(3)?)?,
            },
            "BulkAddRecord" => DocAction::BulkAddRecord {
                table_id,
                row_ids: row_ids_from_repr(arr.get(2)?)?,
                columns: bulk_cells_from_repr(arr.get(3)?)?,
            },
            "RemoveRecord" => DocAction::RemoveRecord { table_id, row_id: arr.get(2)?.as_i64()? },
            "BulkRemoveRecord" => DocAction::BulkRemoveRecord {
                table_id,
                row_ids: row_ids_from_repr(arr.get(2)?)?,
            },
            "UpdateRecord" => DocAction::UpdateRecord {
                table_id,
                row_id: arr.get(2)?.as_i64()?,
                columns: cells_from_repr(arr.get(3)?)?,
            },
            "BulkUpdateRecord" => DocAction::BulkUpdateRecord {
                table_id,
                row_ids: row_ids_from_repr(arr.get(2)?)?,
                columns: bulk_cells_from_repr(arr.get(3)?)?,
            },
            "ReplaceTableData" => DocAction::ReplaceTableData {
                table_id,
                row_ids: row_ids_from_repr(arr.get(2)?)?,
                columns: bulk_cells_from_repr(arr.get(3)?)?,
            },
            "AddColumn" => DocAction::AddColumn {
                table_id,
                col_id: arr.get(2)?.as_str()?.to_string(),
                info: ColInfo::from_json(arr.get(3)?),
            },
            "RemoveColumn" => DocAction::RemoveColumn {
                table_id,
                col_id: arr.get(2)?.as_str()?.to_string(),
            },
            "RenameColumn" => DocAction::RenameColumn {
                table_id,
                old_col_id: arr.get(2)?.as_str()?.to_string(),
                new_col_id: arr.get(3)?.as_str()?.to_string(),
            },
            "ModifyColumn" => DocAction::ModifyColumn {
                table_id,
                col_id: arr.get(2)?.as_str()?.to_string(),
                delta: ColDelta::from_json(arr.get(3)?),
            },
            "AddTable" => {
                let columns = arr
                    .get(2)?
                    .as_array()?
                    .iter()
                    .filter_map(|col| {
                        let col_id = col.get("id")?.as_str()?.to_string();
                        Some((col_id, ColInfo::from_json(col)))
                    })
                    .collect();
                DocAction::AddTable { table_id, columns }
            }
            "RemoveTable" => DocAction::RemoveTable { table_id },
            "RenameTable" => DocAction::RenameTable {
                old_table_id: table_id,
                new_table_id: arr.get(2)?.as_str()?.to_string(),
            },
            _ => return None,
        };
        Some(action)
    }
}

fn cells_repr(columns: &CellUpdates) -> serde_json::Value {
    let map: serde_json::Map<String, serde_json::Value> =
        columns.iter().map(|(col, v)| (col.clone(), v.to_repr())).collect();
    serde_json::Value::Object(map)
}

fn bulk_cells_repr(columns: &BulkCellUpdates) -> serde_json::Value {
    let map: serde_json::Map<String, serde_json::Value> = columns
        .iter()
        .map(|(col, vs)| {
            (col.clone(), serde_json::Value::Array(vs.iter().map(Value::to_repr).collect()))
        })
        .collect();
    serde_json::Value::Object(map)
}

fn cells_from_repr(repr: &serde_json::Value) -> Option<CellUpdates> {
    let obj = repr.as_object()?;
    Some(obj.iter().map(|(col, v)| (col.clone(), Value::from_repr(v))).collect())
}

fn bulk_cells_from_repr(repr: &serde_json::Value) -> Option<BulkCellUpdates> {
    let obj = repr.as_object()?;
    let mut out = BulkCellUpdates::new();
    for (col, vs) in obj {
        let values = vs.as_array()?.iter().map(Value::from_repr).collect();
        out.insert(col.clone(), values);
    }
    Some(out)
}

fn row_ids_from_repr(repr: &serde_json::Value) -> Option<Vec<RowId>> {
    repr.as_array()?.iter().map(|v| v.as_i64()).collect()
}

/// The actions produced by the engine in the course of processing one
/// submission of user actions, plus a return value per user action.
///
/// `stored` holds every document action applied, in order; `direct` flags
/// which of them came from the user-action translator rather than from
/// recompute; `calc` is the recompute-attributable subset in recompute
/// order; `undo` holds the inverse of each stored action, aligned with
/// `stored` (the wire form reverses it).
#[derive(Default, Debug)]
pub struct ActionGroup {
    pub stored: Vec<DocAction>,
    pub direct: Vec<bool>,
    pub calc: Vec<DocAction>,
    pub undo: Vec<DocAction>,
    pub ret_values: Vec<serde_json::Value>,
    /// Pending host requests keyed by their stable argument hash.
    pub requests: BTreeMap<String, serde_json::Value>,
}

impl ActionGroup {
    pub fn new() -> ActionGroup {
        ActionGroup::default()
    }

    pub fn record(&mut self, action: DocAction, direct: bool, inverse: Vec<DocAction>) {
        self.stored.push(action);
        self.direct.push(direct);
        self.undo.extend(inverse);
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint { stored: self.stored.len(), undo: self.undo.len() }
    }

    /// Wire representation of the bundle, with `undo` reversed so applying
    /// it front to back restores the prior state.
    pub fn to_repr(&self) -> serde_json::Value {
        let undo: Vec<serde_json::Value> =
            self.undo.iter().rev().map(DocAction::to_repr).collect();
        let mut obj = json!({
            "stored": self.stored.iter().map(DocAction::to_repr).collect::<Vec<_>>(),
            "direct": self.direct,
            "calc": self.calc.iter().map(DocAction::to_repr).collect::<Vec<_>>(),
            "undo": undo,
            "retValues": self.ret_values,
        });
        if !self.requests.is_empty() {
            obj["requests"] = json!(self.requests);
        }
        obj
    }
}

/// Marks a point in the group's streams, for tentative sub-bundles.
#[derive(Clone, Copy, Debug)]
pub struct Checkpoint {
    pub stored: usize,
    pub undo: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_repr_round_trip() {
        let mut columns = CellUpdates::new();
        columns.insert("firstName".into(), Value::Text("Alice".into()));
        let action = DocAction::UpdateRecord { table_id: "Students".into(), row_id: 7, columns };
        let repr = action.to_repr();
        assert_eq!(repr, json!(["UpdateRecord", "Students", 7, {"firstName": "Alice"}]));
        assert_eq!(DocAction::from_repr(&repr), Some(action));
    }

    #[test]
    fn test_add_table_repr() {
        let action = DocAction::AddTable {
            table_id: "T".into(),
            columns: vec![("a".into(), ColInfo::data("Int"))],
        };
        let repr = action.to_repr();
        assert_eq!(
            repr,
            json!(["AddTable", "T",
                   [{"id": "a", "type": "Int", "isFormula": false, "formula": ""}]])
        );
        assert_eq!(DocAction::from_repr(&repr), Some(action));
    }

    #[test]
    fn test_group_repr_reverses_undo() {
        let mut group = ActionGroup::new();
        group.record(
            DocAction::RemoveRecord { table_id: "T".into(), row_id: 1 },
            true,
            vec![DocAction::AddRecord { table_id: "T".into(), row_id: 1, columns: CellUpdates::new() }],
        );
        group.record(
            DocAction::RemoveRecord { table_id: "T".into(), row_id: 2 },
            true,
            vec![DocAction::AddRecord { table_id: "T".into(), row_id: 2, columns: CellUpdates::new() }],
        );
        let repr = group.to_repr();
        assert_eq!(repr["undo"][0][2], json!(2));
        assert_eq!(repr["undo"][1][2], json!(1));
    }
}

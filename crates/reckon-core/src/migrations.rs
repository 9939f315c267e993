//! Schema migrations.
//!
//! `create_migrations` receives the full data of an older document and
//! computes the document actions that bring its schema to SCHEMA_VERSION.
//! Migrations run over a TableDataSet so they need no assumptions beyond
//! the schema version they start from.

use std::collections::HashMap;

use reckon_engine::{ColInfo, DocAction, RowId};
use serde_json::json;

use crate::error::{DocError, Result};
use crate::schema::{self, SCHEMA_VERSION};
use crate::table_data_set::TableDataSet;

/// One migration step: takes the document at version N-1, returns the
/// actions that bring it to version N.
type Migration = fn(&TableDataSet) -> Vec<DocAction>;

fn migration_for(version: i64) -> Option<Migration> {
    match version {
        2 => Some(migration_v2),
        3 => Some(migration_v3),
        _ => None,
    }
}

/// Version 2 added display metadata to column records.
fn migration_v2(data: &TableDataSet) -> Vec<DocAction> {
    let mut actions = Vec::new();
    for col_id in ["label", "widgetOptions"] {
        if data.get_col_info(schema::META_COLUMNS, col_id).is_none() {
            actions.push(DocAction::AddColumn {
                table_id: schema::META_COLUMNS.to_string(),
                col_id: col_id.to_string(),
                info: ColInfo::data("Text"),
            });
        }
    }
    actions
}

/// Version 3 added trigger formulas and webhook triggers.
fn migration_v3(data: &TableDataSet) -> Vec<DocAction> {
    let mut actions = Vec::new();
    if data.get_col_info(schema::META_COLUMNS, "recalcWhen").is_none() {
        actions.push(DocAction::AddColumn {
            table_id: schema::META_COLUMNS.to_string(),
            col_id: "recalcWhen".to_string(),
            info: ColInfo::data("Int"),
        });
    }
    if data.get_col_info(schema::META_COLUMNS, "recalcDeps").is_none() {
        actions.push(DocAction::AddColumn {
            table_id: schema::META_COLUMNS.to_string(),
            col_id: "recalcDeps".to_string(),
            info: ColInfo::data("RefList:_grist_Tables_column"),
        });
    }
    if !data.all_tables.contains_key(schema::META_TRIGGERS) {
        actions.push(DocAction::AddTable {
            table_id: schema::META_TRIGGERS.to_string(),
            columns: vec![
                ("tableRef".to_string(), ColInfo::data("Ref:_grist_Tables")),
                ("label".to_string(), ColInfo::data("Text")),
                ("eventTypes".to_string(), ColInfo::data("Text")),
                ("watchedColRefList".to_string(),
                 ColInfo::data("RefList:_grist_Tables_column")),
                ("condition".to_string(), ColInfo::data("Text")),
                ("actions".to_string(), ColInfo::data("Text")),
                ("enabled".to_string(), ColInfo::data("Bool")),
            ],
        });
    }
    actions
}

/// Compute the migration actions for a document given as a map of
/// `table_id -> table data` payloads. Returns the actions in wire form.
pub fn create_migrations(all_tables: &serde_json::Value) -> Result<serde_json::Value> {
    let tables = all_tables
        .as_object()
        .ok_or_else(|| DocError::invalid("expected a map of table data"))?;

    let mut data = TableDataSet::new();
    for (table_id, payload) in tables {
        let (row_ids, columns) = parse_payload(payload)
            .ok_or_else(|| DocError::invalid(format!("malformed table data for {}", table_id)))?;
        data.load_table(table_id, row_ids, columns);
    }

    let doc_version = data
        .all_tables
        .get(schema::META_DOC_INFO)
        .and_then(|t| t.columns.get("schemaVersion"))
        .and_then(|vs| vs.first())
        .and_then(|v| v.as_i64())
        .unwrap_or(1);
    if doc_version > SCHEMA_VERSION {
        return Err(DocError::invalid(format!(
            "document version {} is newer than engine version {}", doc_version, SCHEMA_VERSION
        )));
    }

    let mut all_actions: Vec<DocAction> = Vec::new();
    for version in (doc_version + 1)..=SCHEMA_VERSION {
        let Some(migration) = migration_for(version) else {
            continue;
        };
        let actions = migration(&data);
        data.apply_doc_actions(&actions)?;
        all_actions.extend(actions);
    }

    if doc_version < SCHEMA_VERSION {
        let doc_info_row: RowId = data
            .all_tables
            .get(schema::META_DOC_INFO)
            .and_then(|t| t.row_ids.first().copied())
            .unwrap_or(1);
        let mut columns = reckon_engine::actions::CellUpdates::new();
        columns.insert("schemaVersion".to_string(), reckon_engine::Value::Int(SCHEMA_VERSION));
        all_actions.push(DocAction::UpdateRecord {
            table_id: schema::META_DOC_INFO.to_string(),
            row_id: doc_info_row,
            columns,
        });
    }

    Ok(json!(all_actions.iter().map(DocAction::to_repr).collect::<Vec<_>>()))
}

fn parse_payload(
    payload: &serde_json::Value,
) -> Option<(Vec<RowId>, HashMap<String, Vec<serde_json::Value>>)> {
    let arr = payload.as_array()?;
    let offset = if arr.first().and_then(|v| v.as_str()) == Some("TableData") { 2 } else { 1 };
    let row_ids = arr.get(offset)?.as_array()?.iter().filter_map(|v| v.as_i64()).collect();
    let columns = arr
        .get(offset + 1)?
        .as_object()?
        .iter()
        .map(|(col, values)| {
            (col.clone(), values.as_array().cloned().unwrap_or_default())
        })
        .collect();
    Some((row_ids, columns))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn old_doc() -> serde_json::Value {
        json!({
            schema::META_DOC_INFO: ["TableData", schema::META_DOC_INFO, [1],
                                    {"docId": [""], "schemaVersion": [1]}],
            schema::META_TABLES: ["TableData", schema::META_TABLES, [], {"tableId": []}],
            schema::META_COLUMNS: ["TableData", schema::META_COLUMNS, [], {
                "parentId": [], "colId": [], "type": [], "isFormula": [], "formula": []}],
        })
    }

    #[test]
    fn test_migrates_v1_to_current() {
        let actions = create_migrations(&old_doc()).unwrap();
        let actions = actions.as_array().unwrap();
        // label/widgetOptions, recalcWhen/recalcDeps, triggers table, plus
        // the version bump.
        let names: Vec<&str> =
            actions.iter().map(|a| a[0].as_str().unwrap()).collect();
        assert_eq!(names.iter().filter(|n| **n == "AddColumn").count(), 4);
        assert!(names.contains(&"AddTable"));
        let last = actions.last().unwrap();
        assert_eq!(last[0], json!("UpdateRecord"));
        assert_eq!(last[3]["schemaVersion"], json!(SCHEMA_VERSION));
    }

    #[test]
    fn test_current_version_needs_nothing() {
        let doc = json!({
            schema::META_DOC_INFO: ["TableData", schema::META_DOC_INFO, [1],
                                    {"schemaVersion": [SCHEMA_VERSION]}],
        });
        let actions = create_migrations(&doc).unwrap();
        assert!(actions.as_array().unwrap().is_empty());
    }

    #[test]
    fn test_newer_version_rejected() {
        let doc = json!({
            schema::META_DOC_INFO: ["TableData", schema::META_DOC_INFO, [1],
                                    {"schemaVersion": [SCHEMA_VERSION + 1]}],
        });
        assert!(create_migrations(&doc).is_err());
    }
}

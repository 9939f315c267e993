//! The metadata schema.
//!
//! The schema of a document is itself stored in tables named `_grist_*`.
//! This module defines their shape and the actions that create them in a
//! fresh document. Schema edits by user actions are expressed as ordinary
//! document actions against these tables (plus the matching structural
//! actions on the user tables).

use reckon_engine::{ColInfo, DocAction};

/// Current schema version, returned by `get_version` and written to
/// `_grist_DocInfo` on creation. Migrations bring older documents here.
pub const SCHEMA_VERSION: i64 = 3;

pub const META_DOC_INFO: &str = "_grist_DocInfo";
pub const META_TABLES: &str = "_grist_Tables";
pub const META_COLUMNS: &str = "_grist_Tables_column";
pub const META_SECTIONS: &str = "_grist_Views_section";
pub const META_ACL_RESOURCES: &str = "_grist_ACLResources";
pub const META_ACL_RULES: &str = "_grist_ACLRules";
pub const META_TRIGGERS: &str = "_grist_Triggers";

pub fn is_meta_table(table_id: &str) -> bool {
    table_id.starts_with("_grist_")
}

fn col(id: &str, col_type: &str) -> (String, ColInfo) {
    (id.to_string(), ColInfo::data(col_type))
}

fn formula_col(id: &str, col_type: &str, formula: &str) -> (String, ColInfo) {
    (id.to_string(), ColInfo::formula(col_type, formula))
}

/// The actions that create the metadata tables of an empty document.
pub fn schema_create_actions() -> Vec<DocAction> {
    vec![
        DocAction::AddTable {
            table_id: META_DOC_INFO.to_string(),
            columns: vec![col("docId", "Text"), col("schemaVersion", "Int")],
        },
        DocAction::AddTable {
            table_id: META_TABLES.to_string(),
            columns: vec![
                col("tableId", "Text"),
                // Denormalized list of the table's column records, kept in
                // sync by the engine like any other formula.
                formula_col(
                    "columns",
                    "RefList:_grist_Tables_column",
                    "_grist_Tables_column.lookupRecords(parentId=$id)",
                ),
            ],
        },
        DocAction::AddTable {
            table_id: META_COLUMNS.to_string(),
            columns: vec![
                col("parentId", "Ref:_grist_Tables"),
                col("colId", "Text"),
                col("type", "Text"),
                col("isFormula", "Bool"),
                col("formula", "Text"),
                col("label", "Text"),
                col("widgetOptions", "Text"),
                col("recalcWhen", "Int"),
                col("recalcDeps", "RefList:_grist_Tables_column"),
                col("reverseCol", "Ref:_grist_Tables_column"),
            ],
        },
        DocAction::AddTable {
            table_id: META_SECTIONS.to_string(),
            columns: vec![col("tableRef", "Ref:_grist_Tables"), col("title", "Text")],
        },
        DocAction::AddTable {
            table_id: META_ACL_RESOURCES.to_string(),
            columns: vec![col("tableId", "Text"), col("colIds", "Text")],
        },
        DocAction::AddTable {
            table_id: META_ACL_RULES.to_string(),
            columns: vec![
                col("resource", "Ref:_grist_ACLResources"),
                col("aclFormula", "Text"),
                col("aclFormulaParsed", "Text"),
                col("permissionsText", "Text"),
                col("userAttributes", "Text"),
                col("memo", "Text"),
            ],
        },
        DocAction::AddTable {
            table_id: META_TRIGGERS.to_string(),
            columns: vec![
                col("tableRef", "Ref:_grist_Tables"),
                col("label", "Text"),
                col("eventTypes", "Text"),
                col("watchedColRefList", "RefList:_grist_Tables_column"),
                col("condition", "Text"),
                col("actions", "Text"),
                col("enabled", "Bool"),
            ],
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_creates_all_meta_tables() {
        let actions = schema_create_actions();
        let ids: Vec<&str> = actions.iter().map(|a| a.table_id()).collect();
        for id in [META_DOC_INFO, META_TABLES, META_COLUMNS, META_SECTIONS,
                   META_ACL_RESOURCES, META_ACL_RULES, META_TRIGGERS] {
            assert!(ids.contains(&id), "missing {}", id);
            assert!(is_meta_table(id));
        }
        assert!(!is_meta_table("Students"));
    }
}

//! Typed read access to the metadata tables.
//!
//! The docmodel always reads the live meta tables, so schema views cannot
//! go stale across undo; nothing here is cached.

use reckon_engine::{Engine, RowId, Value};

use crate::schema;

pub struct DocModel<'a> {
    engine: &'a Engine,
}

impl<'a> DocModel<'a> {
    pub fn new(engine: &'a Engine) -> DocModel<'a> {
        DocModel { engine }
    }

    fn rows_where(&self, table_id: &str, col_id: &str, value: &Value) -> Vec<RowId> {
        let Some(table) = self.engine.table(table_id) else {
            return Vec::new();
        };
        table
            .all_row_ids()
            .into_iter()
            .filter(|&r| &table.get_cell(col_id, r) == value)
            .collect()
    }

    fn cell(&self, table_id: &str, col_id: &str, row_id: RowId) -> Value {
        self.engine
            .table(table_id)
            .map(|t| t.get_cell(col_id, row_id))
            .unwrap_or(Value::Null)
    }

    //----------------------------------------
    // Tables.
    //----------------------------------------

    /// Meta row id of a user table, from its tableId.
    pub fn table_rec(&self, table_id: &str) -> Option<RowId> {
        self.rows_where(schema::META_TABLES, "tableId", &Value::Text(table_id.to_string()))
            .into_iter()
            .next()
    }

    pub fn table_id_of(&self, table_rec: RowId) -> Option<String> {
        match self.cell(schema::META_TABLES, "tableId", table_rec) {
            Value::Text(id) if !id.is_empty() => Some(id),
            _ => None,
        }
    }

    pub fn all_table_recs(&self) -> Vec<RowId> {
        self.engine
            .table(schema::META_TABLES)
            .map(|t| t.all_row_ids())
            .unwrap_or_default()
    }

    //----------------------------------------
    // Columns.
    //----------------------------------------

    /// Meta row id of a column, from its table and column ids.
    pub fn col_rec(&self, table_id: &str, col_id: &str) -> Option<RowId> {
        let table_rec = self.table_rec(table_id)?;
        self.rows_where(schema::META_COLUMNS, "parentId", &Value::Ref(table_rec))
            .into_iter()
            .find(|&r| {
                self.cell(schema::META_COLUMNS, "colId", r)
                    == Value::Text(col_id.to_string())
            })
    }

    /// Meta row ids of a table's columns.
    pub fn column_recs(&self, table_id: &str) -> Vec<RowId> {
        match self.table_rec(table_id) {
            Some(table_rec) => {
                self.rows_where(schema::META_COLUMNS, "parentId", &Value::Ref(table_rec))
            }
            None => Vec::new(),
        }
    }

    pub fn all_column_recs(&self) -> Vec<RowId> {
        self.engine
            .table(schema::META_COLUMNS)
            .map(|t| t.all_row_ids())
            .unwrap_or_default()
    }

    pub fn col_field(&self, col_rec: RowId, field: &str) -> Value {
        self.cell(schema::META_COLUMNS, field, col_rec)
    }

    pub fn col_id_of(&self, col_rec: RowId) -> Option<String> {
        match self.col_field(col_rec, "colId") {
            Value::Text(id) if !id.is_empty() => Some(id),
            _ => None,
        }
    }

    /// The tableId the column belongs to.
    pub fn col_table_id(&self, col_rec: RowId) -> Option<String> {
        let parent = self.col_field(col_rec, "parentId").as_row_id();
        self.table_id_of(parent)
    }

    pub fn col_text(&self, col_rec: RowId, field: &str) -> String {
        match self.col_field(col_rec, field) {
            Value::Text(s) => s,
            other => other.to_text(),
        }
    }

    /// The table a Ref/RefList-typed column points at, from the meta type
    /// string.
    pub fn col_ref_target(&self, col_rec: RowId) -> Option<String> {
        let type_string = self.col_text(col_rec, "type");
        reckon_engine::ColType::parse(&type_string).ref_target().map(str::to_string)
    }

    /// The column's reverse partner, if it declares one.
    pub fn reverse_col(&self, col_rec: RowId) -> Option<RowId> {
        match self.col_field(col_rec, "reverseCol") {
            Value::Ref(r) if r != 0 => Some(r),
            _ => None,
        }
    }

    //----------------------------------------
    // Rules and triggers.
    //----------------------------------------

    pub fn all_acl_rule_recs(&self) -> Vec<RowId> {
        self.engine
            .table(schema::META_ACL_RULES)
            .map(|t| t.all_row_ids())
            .unwrap_or_default()
    }

    pub fn all_acl_resource_recs(&self) -> Vec<RowId> {
        self.engine
            .table(schema::META_ACL_RESOURCES)
            .map(|t| t.all_row_ids())
            .unwrap_or_default()
    }

    pub fn all_trigger_recs(&self) -> Vec<RowId> {
        self.engine
            .table(schema::META_TRIGGERS)
            .map(|t| t.all_row_ids())
            .unwrap_or_default()
    }

    pub fn rule_field(&self, rule_rec: RowId, field: &str) -> Value {
        self.cell(schema::META_ACL_RULES, field, rule_rec)
    }

    pub fn resource_field(&self, resource_rec: RowId, field: &str) -> Value {
        self.cell(schema::META_ACL_RESOURCES, field, resource_rec)
    }

    pub fn trigger_field(&self, trigger_rec: RowId, field: &str) -> Value {
        self.cell(schema::META_TRIGGERS, field, trigger_rec)
    }

    /// The tableId a trigger watches.
    pub fn trigger_table_id(&self, trigger_rec: RowId) -> Option<String> {
        let table_rec = self.trigger_field(trigger_rec, "tableRef").as_row_id();
        self.table_id_of(table_rec)
    }
}

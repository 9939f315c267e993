//! One loaded document: the engine plus the entry points the host calls.
//!
//! Lifecycle is `load_*` -> many `apply_user_actions` / `fetch_*` -> process
//! exit. Each submission is atomic: on failure the engine state rolls back
//! and nothing is returned to the host.

use reckon_engine::actions::BulkCellUpdates;
use reckon_engine::formula::eval::{BUILTIN_NAMES, LOOKUP_METHOD_NAMES};
use reckon_engine::{DocAction, Engine, RecalcWhen, RowId, Value};
use serde_json::json;

use crate::docmodel::DocModel;
use crate::error::{DocError, Result};
use crate::find_col;
use crate::migrations;
use crate::schema;
use crate::useractions::UserActions;

#[derive(Default)]
pub struct Document {
    pub engine: Engine,
}

impl Document {
    pub fn new() -> Document {
        Document { engine: Engine::new() }
    }

    fn ensure_schema(&self) -> Result<()> {
        if self.engine.has_table(schema::META_TABLES) {
            return Ok(());
        }
        for action in schema::schema_create_actions() {
            self.engine.load_doc_action(action)?;
        }
        Ok(())
    }

    //----------------------------------------
    // Loading.
    //----------------------------------------

    /// Initialize a fresh empty document.
    pub fn load_empty(&self) -> Result<serde_json::Value> {
        self.ensure_schema()?;
        let doc_info = self.engine.require_table(schema::META_DOC_INFO)?;
        if doc_info.row_count() == 0 {
            let mut cells = reckon_engine::actions::CellUpdates::new();
            cells.insert("schemaVersion".to_string(), Value::Int(schema::SCHEMA_VERSION));
            self.engine.load_doc_action(DocAction::AddRecord {
                table_id: schema::META_DOC_INFO.to_string(),
                row_id: 1,
                columns: cells,
            })?;
        }
        self.load_done()
    }

    /// Load the two metadata tables and build the user tables they
    /// describe.
    pub fn load_meta_tables(
        &self,
        meta_tables: &serde_json::Value,
        meta_columns: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        self.ensure_schema()?;
        self.load_table_payload(schema::META_TABLES, meta_tables)?;
        self.load_table_payload(schema::META_COLUMNS, meta_columns)?;

        let dm = DocModel::new(&self.engine);
        for table_rec in dm.all_table_recs() {
            let Some(table_id) = dm.table_id_of(table_rec) else {
                continue;
            };
            if schema::is_meta_table(&table_id) || self.engine.has_table(&table_id) {
                continue;
            }
            let mut columns = Vec::new();
            for col_rec in dm.column_recs(&table_id) {
                let Some(col_id) = dm.col_id_of(col_rec) else {
                    continue;
                };
                columns.push((col_id, reckon_engine::ColInfo {
                    col_type: dm.col_text(col_rec, "type"),
                    is_formula: dm.col_field(col_rec, "isFormula").is_truthy(),
                    formula: dm.col_text(col_rec, "formula"),
                }));
            }
            self.engine.load_doc_action(DocAction::AddTable { table_id, columns })?;
        }
        Ok(serde_json::Value::Null)
    }

    /// Load one table's contents.
    pub fn load_table(&self, table_id: &str, data: &serde_json::Value) -> Result<serde_json::Value> {
        self.load_table_payload(table_id, data)?;
        Ok(serde_json::Value::Null)
    }

    fn load_table_payload(&self, table_id: &str, data: &serde_json::Value) -> Result<()> {
        let (row_ids, columns) = parse_table_data(data)
            .ok_or_else(|| DocError::invalid(format!("malformed table data for {}", table_id)))?;
        if row_ids.is_empty() {
            return Ok(());
        }
        self.engine.load_doc_action(DocAction::BulkAddRecord {
            table_id: table_id.to_string(),
            row_ids,
            columns,
        })?;
        Ok(())
    }

    /// Finish loading: run the initial full recompute.
    pub fn load_done(&self) -> Result<serde_json::Value> {
        for table in self.engine.all_tables() {
            for column in table.columns() {
                if column.is_formula() {
                    self.engine.invalidate(
                        table.node(&column.col_id()),
                        reckon_engine::RowSet::All,
                        true,
                    );
                }
            }
        }
        self.engine.begin_group();
        self.engine.bring_all_up_to_date()?;
        let _initial = self.engine.finish_group();
        self.sync_derived_config();
        Ok(serde_json::Value::Null)
    }

    //----------------------------------------
    // User actions.
    //----------------------------------------

    /// Apply a list of user actions atomically and return the bundle.
    pub fn apply_user_actions(&self, action_reprs: &[serde_json::Value]) -> Result<serde_json::Value> {
        self.engine.begin_group();
        let applied = (|| -> Result<()> {
            let mut actions = UserActions::new(&self.engine);
            for repr in action_reprs {
                let ret = actions.apply_one(repr)?;
                self.engine.push_ret_value(ret);
            }
            self.engine.bring_all_up_to_date()?;
            self.check_schema_consistency()?;
            Ok(())
        })();
        match applied {
            Ok(()) => {
                self.sync_derived_config();
                let group = self.engine.finish_group();
                Ok(group.to_repr())
            }
            Err(err) => {
                log::warn!("user action submission failed, rolling back: {}", err);
                self.engine.abort_group();
                Err(err)
            }
        }
    }

    /// Metadata is the source of truth for configuration the engine caches:
    /// trigger-formula settings here. Re-synced at the end of every
    /// submission so undo can never leave them stale.
    fn sync_derived_config(&self) {
        let dm = DocModel::new(&self.engine);
        for col_rec in dm.all_column_recs() {
            let Some(table_id) = dm.col_table_id(col_rec) else {
                continue;
            };
            let Some(col_id) = dm.col_id_of(col_rec) else {
                continue;
            };
            let is_formula = dm.col_field(col_rec, "isFormula").is_truthy();
            let formula = dm.col_text(col_rec, "formula");
            if is_formula || formula.is_empty() {
                continue;
            }
            let when = match dm.col_field(col_rec, "recalcWhen") {
                Value::Int(i) => RecalcWhen::from_int(i),
                _ => RecalcWhen::Default,
            };
            let deps: Vec<String> = match dm.col_field(col_rec, "recalcDeps") {
                Value::RefList(recs) => {
                    recs.into_iter().filter_map(|r| dm.col_id_of(r)).collect()
                }
                _ => Vec::new(),
            };
            self.engine.configure_trigger(&table_id, &col_id, when, deps);
        }
    }

    /// The engine refuses to commit a submission that leaves the metadata
    /// and the live tables describing different schemas.
    fn check_schema_consistency(&self) -> Result<()> {
        let dm = DocModel::new(&self.engine);
        for table_rec in dm.all_table_recs() {
            let Some(table_id) = dm.table_id_of(table_rec) else {
                continue;
            };
            if !self.engine.has_table(&table_id) {
                return Err(DocError::Engine(
                    reckon_engine::EngineError::InconsistentUndo(format!(
                        "metadata names missing table {}", table_id
                    )),
                ));
            }
            for col_rec in dm.column_recs(&table_id) {
                let Some(col_id) = dm.col_id_of(col_rec) else {
                    continue;
                };
                let present =
                    self.engine.table(&table_id).is_some_and(|t| t.has_column(&col_id));
                if !present {
                    return Err(DocError::Engine(
                        reckon_engine::EngineError::InconsistentUndo(format!(
                            "metadata names missing column {}.{}", table_id, col_id
                        )),
                    ));
                }
            }
        }
        Ok(())
    }

    //----------------------------------------
    // Fetching.
    //----------------------------------------

    /// Dump a table's current contents as `["TableData", id, row_ids,
    /// columns]`, optionally filtered and without formula columns.
    pub fn fetch_table(
        &self,
        table_id: &str,
        formulas: bool,
        query: Option<&serde_json::Value>,
    ) -> Result<serde_json::Value> {
        let table = self.engine.require_table(table_id)?;
        let mut row_ids = table.all_row_ids();
        if let Some(query) = query.and_then(|q| q.as_object()) {
            for (col, allowed) in query {
                let allowed: Vec<Value> = allowed
                    .as_array()
                    .map(|a| a.iter().map(Value::from_repr).collect())
                    .unwrap_or_default();
                row_ids.retain(|&r| allowed.contains(&table.get_cell(col, r)));
            }
        }
        let mut columns = serde_json::Map::new();
        for column in table.columns() {
            if !formulas && column.is_formula() {
                continue;
            }
            let values: Vec<serde_json::Value> = row_ids
                .iter()
                .map(|&r| table.get_cell(&column.col_id(), r).to_repr())
                .collect();
            columns.insert(column.col_id(), serde_json::Value::Array(values));
        }
        Ok(json!(["TableData", table_id, row_ids, columns]))
    }

    /// Dump the metadata tables.
    pub fn fetch_meta_tables(&self) -> Result<serde_json::Value> {
        let mut out = serde_json::Map::new();
        for table in self.engine.all_tables() {
            let table_id = table.table_id();
            if schema::is_meta_table(&table_id) {
                out.insert(table_id.clone(), self.fetch_table(&table_id, true, None)?);
            }
        }
        Ok(serde_json::Value::Object(out))
    }

    /// Dump every table as one bundle.
    pub fn fetch_snapshot(&self) -> Result<serde_json::Value> {
        let mut out = serde_json::Map::new();
        for table in self.engine.all_tables() {
            let table_id = table.table_id();
            out.insert(table_id.clone(), self.fetch_table(&table_id, true, None)?);
        }
        Ok(serde_json::Value::Object(out))
    }

    //----------------------------------------
    // Small services.
    //----------------------------------------

    /// Completions for a prefix typed in a formula context.
    pub fn autocomplete(&self, prefix: &str, table_id: &str) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        // After "Table.", offer the lookup methods.
        for tid in self.engine.table_ids() {
            let dotted = format!("{}.", tid);
            if let Some(rest) = prefix.strip_prefix(&dotted) {
                for method in LOOKUP_METHOD_NAMES {
                    if method.starts_with(rest) {
                        out.push(format!("{}{}", dotted, method));
                    }
                }
                out.sort();
                return out;
            }
        }
        if let Some(table) = self.engine.table(table_id) {
            for col in table.column_ids() {
                out.push(format!("${}", col));
                out.push(format!("rec.{}", col));
            }
        }
        for tid in self.engine.table_ids() {
            if !schema::is_meta_table(&tid) {
                out.push(tid);
            }
        }
        out.extend(BUILTIN_NAMES.iter().map(|s| s.to_string()));
        out.retain(|c| c.starts_with(prefix));
        out.sort();
        out.dedup();
        out
    }

    /// Columns whose contents overlap `values` by at least `n` distinct
    /// elements, best match first.
    pub fn find_col_from_values(
        &self,
        values: &[serde_json::Value],
        n: usize,
        table_id: Option<&str>,
    ) -> Vec<RowId> {
        let values: Vec<Value> = values.iter().map(Value::from_repr).collect();
        find_col::find_col_from_values(&self.engine, &values, n, table_id)
    }

    /// The stored exception for a cell, or null when the cell holds none.
    pub fn get_formula_error(
        &self,
        table_id: &str,
        col_id: &str,
        row_id: RowId,
    ) -> Result<serde_json::Value> {
        let table = self.engine.require_table(table_id)?;
        match table.get_cell(col_id, row_id) {
            value @ Value::Error(_) => Ok(value.to_repr()),
            _ => Ok(serde_json::Value::Null),
        }
    }

    /// Schema-migration document actions for an older document.
    pub fn create_migrations(&self, all_tables: &serde_json::Value) -> Result<serde_json::Value> {
        migrations::create_migrations(all_tables)
    }

    pub fn get_version(&self) -> i64 {
        schema::SCHEMA_VERSION
    }
}

/// Accept both `["TableData", id, row_ids, columns]` and `{"id": [...],
/// col: [...]}` payload shapes.
fn parse_table_data(data: &serde_json::Value) -> Option<(Vec<RowId>, BulkCellUpdates)> {
    if let Some(arr) = data.as_array() {
        let offset = if arr.first().and_then(|v| v.as_str()) == Some("TableData") { 2 } else { 1 };
        let row_ids: Vec<RowId> =
            arr.get(offset)?.as_array()?.iter().filter_map(|v| v.as_i64()).collect();
        let mut columns = BulkCellUpdates::new();
        for (col, values) in arr.get(offset + 1)?.as_object()? {
            columns.insert(
                col.clone(),
                values.as_array()?.iter().map(Value::from_repr).collect(),
            );
        }
        return Some((row_ids, columns));
    }
    let obj = data.as_object()?;
    let row_ids: Vec<RowId> =
        obj.get("id")?.as_array()?.iter().filter_map(|v| v.as_i64()).collect();
    let mut columns = BulkCellUpdates::new();
    for (col, values) in obj {
        if col == "id" {
            continue;
        }
        columns.insert(
            col.clone(),
            values.as_array()?.iter().map(Value::from_repr).collect(),
        );
    }
    Some((row_ids, columns))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc_with_students() -> Document {
        let doc = Document::new();
        doc.load_empty().unwrap();
        doc.apply_user_actions(&[
            json!(["AddTable", "Students", [
                {"id": "Name", "type": "Text", "isFormula": false},
                {"id": "State", "type": "Text", "isFormula": false},
                {"id": "StateCount", "type": "Int", "isFormula": true,
                 "formula": "len(Students.lookupRecords(State=$State))"},
            ]]),
            json!(["BulkAddRecord", "Students", [null, null, null], {
                "Name": ["Al", "Bo", "Ca"],
                "State": ["NY", "NY", "IL"],
            }]),
        ])
        .unwrap();
        doc
    }

    fn column_values(doc: &Document, table_id: &str, col_id: &str) -> Vec<Value> {
        let table = doc.engine.table(table_id).unwrap();
        table.all_row_ids().into_iter().map(|r| table.get_cell(col_id, r)).collect()
    }

    fn undo_actions(bundle: &serde_json::Value) -> serde_json::Value {
        json!([["ApplyUndoActions", bundle["undo"]]])
    }

    #[test]
    fn test_summary_style_recompute_and_undo() {
        let doc = doc_with_students();
        assert_eq!(
            column_values(&doc, "Students", "StateCount"),
            vec![Value::Int(2), Value::Int(2), Value::Int(1)]
        );

        let bundle = doc
            .apply_user_actions(&[json!(["UpdateRecord", "Students", 2, {"State": "IL"}])])
            .unwrap();
        assert_eq!(
            column_values(&doc, "Students", "StateCount"),
            vec![Value::Int(1), Value::Int(2), Value::Int(2)]
        );

        // Undo restores both the stored field and the derived counts.
        doc.apply_user_actions(&undo_actions(&bundle).as_array().unwrap().clone())
            .unwrap();
        assert_eq!(
            column_values(&doc, "Students", "State"),
            vec![Value::Text("NY".into()), Value::Text("NY".into()), Value::Text("IL".into())]
        );
        assert_eq!(
            column_values(&doc, "Students", "StateCount"),
            vec![Value::Int(2), Value::Int(2), Value::Int(1)]
        );
    }

    #[test]
    fn test_undo_redo_identity_on_fetch() {
        let doc = doc_with_students();
        let before = doc.fetch_table("Students", true, None).unwrap();
        let bundle = doc
            .apply_user_actions(&[
                json!(["AddRecord", "Students", null, {"Name": "Di", "State": "NY"}]),
                json!(["UpdateRecord", "Students", 1, {"State": "WA"}]),
            ])
            .unwrap();
        assert_ne!(doc.fetch_table("Students", true, None).unwrap(), before);
        doc.apply_user_actions(&undo_actions(&bundle).as_array().unwrap().clone())
            .unwrap();
        assert_eq!(doc.fetch_table("Students", true, None).unwrap(), before);
    }

    #[test]
    fn test_temp_row_ids_bind_across_actions() {
        let doc = Document::new();
        doc.load_empty().unwrap();
        let bundle = doc
            .apply_user_actions(&[
                json!(["AddTable", "Address", [
                    {"id": "city", "type": "Text", "isFormula": false}]]),
                json!(["AddTable", "Schools", [
                    {"id": "address", "type": "Ref:Address", "isFormula": false}]]),
                json!(["AddRecord", "Address", -3, {"city": "C"}]),
                json!(["AddRecord", "Schools", -1, {"address": -3}]),
                json!(["BulkAddRecord", "Schools", [null, null], {"address": [-3, -3]}]),
            ])
            .unwrap();

        let address_row = bundle["retValues"][2].as_i64().unwrap();
        assert!(address_row > 0);
        let schools = doc.engine.table("Schools").unwrap();
        for row in schools.all_row_ids() {
            assert_eq!(schools.get_cell("address", row), Value::Ref(address_row));
        }
        // No action in the returned bundle carries a non-positive row id.
        for action in bundle["stored"].as_array().unwrap() {
            let repr = action.to_string();
            assert!(!repr.contains("-3"), "temp id leaked into {}", repr);
            assert!(!repr.contains("-1"), "temp id leaked into {}", repr);
        }
    }

    #[test]
    fn test_predicate_rename_preserves_bytes() {
        let doc = doc_with_students();
        doc.apply_user_actions(&[
            json!(["AddRecord", "_grist_ACLResources", null,
                   {"tableId": "Students", "colIds": "*"}]),
            json!(["AddRecord", "_grist_ACLRules", null, {
                "resource": 1,
                "aclFormula": "( rec.State != # comment\n user.School.name)",
            }]),
        ])
        .unwrap();

        doc.apply_user_actions(&[json!(["RenameColumn", "Students", "State", "State_Name"])])
            .unwrap();

        let dm = DocModel::new(&doc.engine);
        let rule = dm.all_acl_rule_recs()[0];
        assert_eq!(
            dm.rule_field(rule, "aclFormula"),
            Value::Text("( rec.State_Name != # comment\n user.School.name)".into())
        );
        // Parsed form was refreshed along with the text.
        let parsed = dm.rule_field(rule, "aclFormulaParsed").to_text();
        assert!(parsed.contains("State_Name"));
        // And the user formula followed the rename too.
        assert_eq!(
            column_values(&doc, "Students", "StateCount"),
            vec![Value::Int(2), Value::Int(2), Value::Int(1)]
        );
        let table = doc.engine.table("Students").unwrap();
        let formula = table.get_column("StateCount").unwrap().formula().unwrap();
        assert_eq!(formula.source, "len(Students.lookupRecords(State_Name=$State_Name))");
    }

    #[test]
    fn test_rename_back_restores_original_text() {
        let doc = doc_with_students();
        doc.apply_user_actions(&[
            json!(["AddRecord", "_grist_ACLResources", null,
                   {"tableId": "Students", "colIds": "*"}]),
            json!(["AddRecord", "_grist_ACLRules", null, {
                "resource": 1,
                "aclFormula": "( rec.State != # comment\n user.School.name)",
            }]),
        ])
        .unwrap();
        doc.apply_user_actions(&[json!(["RenameColumn", "Students", "State", "Tmp"])])
            .unwrap();
        doc.apply_user_actions(&[json!(["RenameColumn", "Students", "Tmp", "State"])])
            .unwrap();
        let dm = DocModel::new(&doc.engine);
        let rule = dm.all_acl_rule_recs()[0];
        assert_eq!(
            dm.rule_field(rule, "aclFormula"),
            Value::Text("( rec.State != # comment\n user.School.name)".into())
        );
    }

    #[test]
    fn test_reference_chain_single_calc_update() {
        let doc = Document::new();
        doc.load_empty().unwrap();
        doc.apply_user_actions(&[
            json!(["AddTable", "C", [{"id": "x", "type": "Int", "isFormula": false}]]),
            json!(["AddTable", "B", [{"id": "link", "type": "Ref:C", "isFormula": false}]]),
            json!(["AddTable", "A", [
                {"id": "link", "type": "Ref:B", "isFormula": false},
                {"id": "xx", "type": "Int", "isFormula": true, "formula": "$link.link.x"}]]),
            json!(["AddRecord", "C", 3, {"x": 5}]),
            json!(["AddRecord", "B", 2, {"link": 3}]),
            json!(["AddRecord", "A", 1, {"link": 2}]),
        ])
        .unwrap();
        assert_eq!(column_values(&doc, "A", "xx"), vec![Value::Int(5)]);

        let bundle = doc
            .apply_user_actions(&[json!(["UpdateRecord", "C", 3, {"x": 7}])])
            .unwrap();
        assert_eq!(column_values(&doc, "A", "xx"), vec![Value::Int(7)]);
        let calc = bundle["calc"].as_array().unwrap();
        assert_eq!(calc.len(), 1);
        assert_eq!(calc[0], json!(["UpdateRecord", "A", 1, {"xx": 7}]));

        doc.apply_user_actions(&undo_actions(&bundle).as_array().unwrap().clone())
            .unwrap();
        assert_eq!(column_values(&doc, "C", "x"), vec![Value::Int(5)]);
        assert_eq!(column_values(&doc, "A", "xx"), vec![Value::Int(5)]);
    }

    #[test]
    fn test_circular_reference_stays_responsive() {
        let doc = Document::new();
        doc.load_empty().unwrap();
        doc.apply_user_actions(&[
            json!(["AddTable", "T", [
                {"id": "a", "type": "Int", "isFormula": true, "formula": "$b + 1"},
                {"id": "b", "type": "Int", "isFormula": true, "formula": "$a + 1"}]]),
            json!(["AddRecord", "T", null, {}]),
        ])
        .unwrap();
        for col in ["a", "b"] {
            let error = doc.get_formula_error("T", col, 1).unwrap();
            assert_eq!(error[1], json!("CircularReference"), "column {}", col);
        }
        // Still serving requests afterwards.
        doc.apply_user_actions(&[json!(["AddRecord", "T", null, {}])]).unwrap();
    }

    #[test]
    fn test_failed_side_effect_leaves_no_trace() {
        let doc = Document::new();
        doc.load_empty().unwrap();
        let bundle = doc
            .apply_user_actions(&[
                json!(["AddTable", "Schools", [
                    {"id": "city", "type": "Text", "isFormula": false}]]),
                json!(["AddTable", "People", [
                    {"id": "city", "type": "Text", "isFormula": false},
                    {"id": "bad", "type": "Any", "isFormula": true,
                     "formula": "Schools.lookupOrAddDerived(city=$city) and RAISE('x')"}]]),
                json!(["BulkAddRecord", "People", [null, null], {"city": ["C", "D"]}]),
            ])
            .unwrap();
        assert_eq!(doc.engine.table("Schools").unwrap().row_count(), 0);
        for action in bundle["stored"].as_array().unwrap() {
            let creates_rows = action[0] == json!("AddRecord") || action[0] == json!("BulkAddRecord");
            assert!(!(creates_rows && action[1] == json!("Schools")),
                    "leaked side effect: {}", action);
        }
        for row in [1, 2] {
            let error = doc.get_formula_error("People", "bad", row).unwrap();
            assert_eq!(error[2], json!("x"));
        }
    }

    #[test]
    fn test_reverse_references_stay_consistent() {
        let doc = Document::new();
        doc.load_empty().unwrap();
        doc.apply_user_actions(&[
            json!(["AddTable", "Teams", [
                {"id": "name", "type": "Text", "isFormula": false},
                {"id": "members", "type": "RefList:People", "isFormula": false}]]),
            json!(["AddTable", "People", [
                {"id": "name", "type": "Text", "isFormula": false},
                {"id": "team", "type": "Ref:Teams", "isFormula": false}]]),
            json!(["BulkAddRecord", "Teams", [1, 2], {"name": ["Red", "Blue"]}]),
            json!(["BulkAddRecord", "People", [1, 2], {"name": ["ann", "bob"]}]),
        ])
        .unwrap();
        // Declare the two-way pair: People.team <-> Teams.members.
        let dm = DocModel::new(&doc.engine);
        let members_rec = dm.col_rec("Teams", "members").unwrap();
        doc.apply_user_actions(&[json!([
            "ModifyColumn", "People", "team", {"reverseCol": members_rec}
        ])])
        .unwrap();

        doc.apply_user_actions(&[json!(["UpdateRecord", "People", 1, {"team": 1}])])
            .unwrap();
        doc.apply_user_actions(&[json!(["UpdateRecord", "People", 2, {"team": 1}])])
            .unwrap();
        assert_eq!(
            column_values(&doc, "Teams", "members"),
            vec![Value::RefList(vec![1, 2]), Value::RefList(vec![])]
        );

        doc.apply_user_actions(&[json!(["UpdateRecord", "People", 1, {"team": 2}])])
            .unwrap();
        assert_eq!(
            column_values(&doc, "Teams", "members"),
            vec![Value::RefList(vec![2]), Value::RefList(vec![1])]
        );
    }

    #[test]
    fn test_trigger_formula_recalc_rules() {
        let doc = Document::new();
        doc.load_empty().unwrap();
        doc.apply_user_actions(&[
            json!(["AddTable", "T", [
                {"id": "a", "type": "Int", "isFormula": false},
                {"id": "b", "type": "Int", "isFormula": false}]]),
        ])
        .unwrap();
        // snap is a trigger formula: copies a, recalculating only when a
        // changes (recalcDeps), never on b.
        let dm = DocModel::new(&doc.engine);
        let a_rec = dm.col_rec("T", "a").unwrap();
        doc.apply_user_actions(&[json!(["AddColumn", "T", "snap", {
            "type": "Int", "isFormula": false, "formula": "$a",
            "recalcWhen": 0, "recalcDeps": ["L", a_rec],
        }])])
        .unwrap();

        doc.apply_user_actions(&[json!(["AddRecord", "T", null, {"a": 10, "b": 1}])])
            .unwrap();
        assert_eq!(column_values(&doc, "T", "snap"), vec![Value::Int(10)]);

        // Updating b does not recalc the snapshot.
        doc.apply_user_actions(&[json!(["UpdateRecord", "T", 1, {"b": 2, "a": 11}])])
            .unwrap();
        assert_eq!(column_values(&doc, "T", "snap"), vec![Value::Int(11)]);
        doc.apply_user_actions(&[json!(["UpdateRecord", "T", 1, {"b": 3}])])
            .unwrap();
        assert_eq!(column_values(&doc, "T", "snap"), vec![Value::Int(11)]);
        // A direct write to the trigger column sticks.
        doc.apply_user_actions(&[json!(["UpdateRecord", "T", 1, {"snap": 99}])])
            .unwrap();
        assert_eq!(column_values(&doc, "T", "snap"), vec![Value::Int(99)]);
    }

    #[test]
    fn test_sorted_lookup_order_by() {
        let doc = Document::new();
        doc.load_empty().unwrap();
        doc.apply_user_actions(&[
            json!(["AddTable", "Tasks", [
                {"id": "owner", "type": "Text", "isFormula": false},
                {"id": "priority", "type": "Int", "isFormula": false}]]),
            json!(["AddTable", "Owners", [
                {"id": "name", "type": "Text", "isFormula": false},
                {"id": "top", "type": "Int", "isFormula": true,
                 "formula":
                   "Tasks.lookupOne(owner=$name, order_by='-priority').priority"}]]),
            json!(["BulkAddRecord", "Tasks", [null, null, null],
                   {"owner": ["x", "x", "y"], "priority": [1, 5, 3]}]),
            json!(["AddRecord", "Owners", null, {"name": "x"}]),
        ])
        .unwrap();
        assert_eq!(column_values(&doc, "Owners", "top"), vec![Value::Int(5)]);

        doc.apply_user_actions(&[json!(["UpdateRecord", "Tasks", 1, {"priority": 9}])])
            .unwrap();
        assert_eq!(column_values(&doc, "Owners", "top"), vec![Value::Int(9)]);
    }

    #[test]
    fn test_modify_column_type_conversion_alt_text() {
        let doc = Document::new();
        doc.load_empty().unwrap();
        doc.apply_user_actions(&[
            json!(["AddTable", "T", [{"id": "v", "type": "Text", "isFormula": false}]]),
            json!(["BulkAddRecord", "T", [null, null], {"v": ["12", "apple"]}]),
            json!(["ModifyColumn", "T", "v", {"type": "Int"}]),
        ])
        .unwrap();
        assert_eq!(
            column_values(&doc, "T", "v"),
            vec![Value::Int(12), Value::AltText("apple".into())]
        );
    }

    #[test]
    fn test_replace_table_data_rederives_formulas() {
        let doc = doc_with_students();
        doc.apply_user_actions(&[json!(["ReplaceTableData", "Students", [7, 8], {
            "Name": ["Zed", "Yan"], "State": ["WA", "WA"],
        }])])
        .unwrap();
        assert_eq!(
            column_values(&doc, "Students", "StateCount"),
            vec![Value::Int(2), Value::Int(2)]
        );
    }

    #[test]
    fn test_failed_submission_rolls_back_entirely() {
        let doc = doc_with_students();
        let before = doc.fetch_table("Students", true, None).unwrap();
        let result = doc.apply_user_actions(&[
            json!(["UpdateRecord", "Students", 1, {"State": "TX"}]),
            json!(["AddColumn", "NoSuchTable", "x", {"type": "Int"}]),
        ]);
        assert!(result.is_err());
        assert_eq!(doc.fetch_table("Students", true, None).unwrap(), before);
    }

    #[test]
    fn test_rename_table_patches_formulas_and_types() {
        let doc = Document::new();
        doc.load_empty().unwrap();
        doc.apply_user_actions(&[
            json!(["AddTable", "Schools", [{"id": "city", "type": "Text", "isFormula": false}]]),
            json!(["AddTable", "People", [
                {"id": "school", "type": "Ref:Schools", "isFormula": false},
                {"id": "n", "type": "Int", "isFormula": true,
                 "formula": "len(Schools.lookupRecords(city=$school.city))"}]]),
            json!(["AddRecord", "Schools", null, {"city": "C"}]),
            json!(["AddRecord", "People", null, {"school": 1}]),
        ])
        .unwrap();
        assert_eq!(column_values(&doc, "People", "n"), vec![Value::Int(1)]);

        doc.apply_user_actions(&[json!(["RenameTable", "Schools", "Academies"])]).unwrap();
        let people = doc.engine.table("People").unwrap();
        let formula = people.get_column("n").unwrap().formula().unwrap();
        assert_eq!(formula.source, "len(Academies.lookupRecords(city=$school.city))");
        assert_eq!(
            people.get_column("school").unwrap().col_type(),
            reckon_engine::ColType::Ref("Academies".into())
        );
        // Metadata followed.
        let dm = DocModel::new(&doc.engine);
        let col_rec = dm.col_rec("People", "school").unwrap();
        assert_eq!(dm.col_text(col_rec, "type"), "Ref:Academies");
        // Still recalculates.
        doc.apply_user_actions(&[json!(["AddRecord", "Academies", null, {"city": "C"}])])
            .unwrap();
        assert_eq!(column_values(&doc, "People", "n"), vec![Value::Int(2)]);
    }

    #[test]
    fn test_fetch_table_query_and_formulas_flag() {
        let doc = doc_with_students();
        let filtered = doc
            .fetch_table("Students", false, Some(&json!({"State": ["NY"]})))
            .unwrap();
        assert_eq!(filtered[2], json!([1, 2]));
        assert!(filtered[3].get("StateCount").is_none());
        let full = doc.fetch_table("Students", true, None).unwrap();
        assert_eq!(full[3]["StateCount"], json!([2, 2, 1]));
    }

    #[test]
    fn test_autocomplete_contexts() {
        let doc = doc_with_students();
        let out = doc.autocomplete("$St", "Students");
        assert!(out.contains(&"$State".to_string()));
        assert!(out.contains(&"$StateCount".to_string()));
        let out = doc.autocomplete("Students.look", "Students");
        assert!(out.contains(&"Students.lookupRecords".to_string()));
        let out = doc.autocomplete("le", "Students");
        assert!(out.contains(&"len".to_string()));
    }

    #[test]
    fn test_find_col_from_values() {
        let doc = doc_with_students();
        let values = vec![json!("NY"), json!("IL"), json!("TX")];
        let found = doc.find_col_from_values(&values, 2, None);
        let dm = DocModel::new(&doc.engine);
        let state_rec = dm.col_rec("Students", "State").unwrap();
        assert_eq!(found.first(), Some(&state_rec));
        // Too high a threshold filters it out.
        assert!(doc.find_col_from_values(&values, 3, None).is_empty());
    }

    #[test]
    fn test_requests_pend_and_resolve() {
        let doc = Document::new();
        doc.load_empty().unwrap();
        let bundle = doc
            .apply_user_actions(&[
                json!(["AddTable", "T", [
                    {"id": "u", "type": "Text", "isFormula": false},
                    {"id": "resp", "type": "Any", "isFormula": true,
                     "formula": "REQUEST($u)"}]]),
                json!(["AddRecord", "T", null, {"u": "http://x"}]),
            ])
            .unwrap();
        let requests = bundle["requests"].as_object().unwrap();
        assert_eq!(requests.len(), 1);
        let key = requests.keys().next().unwrap().clone();
        let error = doc.get_formula_error("T", "resp", 1).unwrap();
        assert_eq!(error[1], json!("Pending"));

        let mut responses = serde_json::Map::new();
        responses.insert(key, json!("hello"));
        doc.apply_user_actions(&[json!(["RespondToRequests", responses])]).unwrap();
        assert_eq!(column_values(&doc, "T", "resp"), vec![Value::Text("hello".into())]);
    }

    #[test]
    fn test_meta_columns_formula_stays_in_sync() {
        let doc = doc_with_students();
        let dm = DocModel::new(&doc.engine);
        let table_rec = dm.table_rec("Students").unwrap();
        let meta = doc.engine.table(schema::META_TABLES).unwrap();
        let columns = meta.get_cell("columns", table_rec);
        let Value::RefList(col_recs) = columns else {
            panic!("expected RefList, got {:?}", columns);
        };
        assert_eq!(col_recs.len(), 3);
        doc.apply_user_actions(&[json!(["AddColumn", "Students", "extra", {"type": "Text"}])])
            .unwrap();
        let Value::RefList(col_recs) = meta.get_cell("columns", table_rec) else {
            panic!("expected RefList");
        };
        assert_eq!(col_recs.len(), 4);
    }

    #[test]
    fn test_transform_and_finish_import() {
        let doc = Document::new();
        doc.load_empty().unwrap();
        doc.apply_user_actions(&[
            json!(["AddTable", "Hidden", [
                {"id": "first", "type": "Text", "isFormula": false},
                {"id": "last", "type": "Text", "isFormula": false}]]),
            json!(["BulkAddRecord", "Hidden", [null, null],
                   {"first": ["a", "b"], "last": ["x", "y"]}]),
        ])
        .unwrap();
        let bundle = doc
            .apply_user_actions(&[json!(["TransformAndFinishImport", "Hidden", null, {
                "destCols": [
                    {"colId": "full", "label": "Full", "type": "Text",
                     "formula": "$first + ' ' + $last"},
                ],
            }])])
            .unwrap();
        let dest = bundle["retValues"][0].as_str().unwrap().to_string();
        assert!(doc.engine.table("Hidden").is_none());
        assert_eq!(
            column_values(&doc, &dest, "full"),
            vec![Value::Text("a x".into()), Value::Text("b y".into())]
        );
    }

    #[test]
    fn test_load_meta_tables_and_table_data() {
        let doc = Document::new();
        doc.load_meta_tables(
            &json!(["TableData", "_grist_Tables", [1], {"tableId": ["Pets"]}]),
            &json!(["TableData", "_grist_Tables_column", [1, 2], {
                "parentId": [1, 1],
                "colId": ["name", "loud"],
                "type": ["Text", "Text"],
                "isFormula": [false, true],
                "formula": ["", "$name + '!'"],
                "label": ["Name", "Loud"],
                "widgetOptions": ["", ""],
            }]),
        )
        .unwrap();
        doc.load_table("Pets", &json!({"id": [1, 2], "name": ["rex", "tom"]})).unwrap();
        doc.load_done().unwrap();
        assert_eq!(
            column_values(&doc, "Pets", "loud"),
            vec![Value::Text("rex!".into()), Value::Text("tom!".into())]
        );
    }
}

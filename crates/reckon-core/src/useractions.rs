//! The user-action translator.
//!
//! Each user action is an intent-level edit; the translator expands it into
//! document actions (on user tables and on the metadata tables together),
//! resolves temporary row ids, computes reverse-reference adjustments, and
//! patches formulas and predicate formulas on renames. Recomputation runs
//! once per submission, after all actions are translated.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use reckon_engine::actions::{BulkCellUpdates, CellUpdates};
use reckon_engine::table::ref_targets;
use reckon_engine::{ColDelta, ColInfo, ColType, DocAction, Engine, RowId, Value};
use serde_json::json;

use crate::docmodel::DocModel;
use crate::error::{DocError, Result};
use crate::identifiers::{pick_col_ident, pick_table_ident};
use crate::predicate;
use crate::renames;
use crate::schema;

pub struct UserActions<'a> {
    engine: &'a Engine,
    /// (table_id, negative id) -> allocated row id, scoped to one submission.
    /// Re-binding a negative id points it at the most recent creation.
    temp_row_ids: HashMap<(String, i64), RowId>,
}

impl<'a> UserActions<'a> {
    pub fn new(engine: &'a Engine) -> UserActions<'a> {
        UserActions { engine, temp_row_ids: HashMap::new() }
    }

    /// Apply one user action given in wire form; returns its retValue.
    pub fn apply_one(&mut self, repr: &serde_json::Value) -> Result<serde_json::Value> {
        let arr = repr
            .as_array()
            .ok_or_else(|| DocError::invalid("user action must be an array"))?;
        let name = arr
            .first()
            .and_then(|v| v.as_str())
            .ok_or_else(|| DocError::invalid("user action is missing its name"))?;
        let args = &arr[1..];
        log::debug!("applying user action {}", name);
        match name {
            "AddRecord" => self.do_add_record(args),
            "BulkAddRecord" => self.do_bulk_add_record(args),
            "UpdateRecord" => self.do_update_record(args),
            "BulkUpdateRecord" => self.do_bulk_update_record(args),
            "RemoveRecord" => self.do_remove_record(args),
            "BulkRemoveRecord" => self.do_bulk_remove_record(args),
            "ReplaceTableData" => self.do_replace_table_data(args),
            "AddColumn" => self.do_add_column(args),
            "RemoveColumn" => self.do_remove_column(args),
            "RenameColumn" => self.do_rename_column(args),
            "ModifyColumn" => self.do_modify_column(args),
            "AddTable" => self.do_add_table(args),
            "AddEmptyTable" => self.do_add_empty_table(args),
            "RemoveTable" => self.do_remove_table_action(args),
            "RenameTable" => self.do_rename_table(args),
            "Calculate" => Ok(serde_json::Value::Null),
            "ApplyUndoActions" | "ApplyDocActions" => self.do_apply_doc_actions(args),
            "RespondToRequests" => self.do_respond_to_requests(args),
            "TransformAndFinishImport" => self.do_transform_and_finish_import(args),
            other => Err(DocError::invalid(format!("unknown user action: {}", other))),
        }
    }

    //----------------------------------------
    // Argument helpers.
    //----------------------------------------

    fn arg_str<'b>(&self, args: &'b [serde_json::Value], index: usize) -> Result<&'b str> {
        args.get(index)
            .and_then(|v| v.as_str())
            .ok_or_else(|| DocError::invalid(format!("expected string argument {}", index)))
    }

    fn require_user_table(&self, table_id: &str) -> Result<()> {
        if schema::is_meta_table(table_id) {
            return Err(DocError::invalid(format!(
                "schema actions are not allowed on metadata table {}", table_id
            )));
        }
        self.engine.require_table(table_id)?;
        Ok(())
    }

    fn cells_arg(&self, args: &[serde_json::Value], index: usize) -> Result<CellUpdates> {
        let obj = args
            .get(index)
            .and_then(|v| v.as_object())
            .ok_or_else(|| DocError::invalid("expected an object of cell values"))?;
        Ok(obj.iter().map(|(col, v)| (col.clone(), Value::from_repr(v))).collect())
    }

    fn bulk_cells_arg(&self, args: &[serde_json::Value], index: usize) -> Result<BulkCellUpdates> {
        let obj = args
            .get(index)
            .and_then(|v| v.as_object())
            .ok_or_else(|| DocError::invalid("expected an object of cell value lists"))?;
        let mut out = BulkCellUpdates::new();
        for (col, values) in obj {
            let values = values
                .as_array()
                .ok_or_else(|| DocError::invalid("column values must be arrays"))?;
            out.insert(col.clone(), values.iter().map(Value::from_repr).collect());
        }
        Ok(out)
    }

    //----------------------------------------
    // Temporary row ids and reference translation.
    //----------------------------------------

    /// Resolve a caller-supplied row id for a row being created: null or 0
    /// allocates, a negative id allocates and binds, a positive id is used
    /// as given.
    fn resolve_new_row_id(&mut self, table_id: &str, given: Option<i64>) -> Result<RowId> {
        let table = self.engine.require_table(table_id)?;
        Ok(match given {
            Some(id) if id > 0 => id,
            Some(id) if id < 0 => {
                let actual = table.alloc_row_id();
                self.temp_row_ids.insert((table_id.to_string(), id), actual);
                actual
            }
            _ => table.alloc_row_id(),
        })
    }

    /// Resolve a row id referring to an existing row (negative ids must be
    /// bound earlier in the submission).
    fn resolve_row_id(&self, table_id: &str, given: i64) -> Result<RowId> {
        if given >= 0 {
            return Ok(given);
        }
        self.temp_row_ids
            .get(&(table_id.to_string(), given))
            .copied()
            .ok_or_else(|| DocError::invalid(format!("unknown temporary row id {}", given)))
    }

    /// Map temporary ids inside Ref/RefList values onto their bindings.
    fn translate_ref_values(
        &self,
        table_id: &str,
        mut columns: BulkCellUpdates,
    ) -> Result<BulkCellUpdates> {
        let table = self.engine.require_table(table_id)?;
        for (col, values) in columns.iter_mut() {
            let Some(column) = table.get_column(col) else {
                continue;
            };
            let Some(target) = column.col_type().ref_target().map(str::to_string) else {
                continue;
            };
            for value in values.iter_mut() {
                *value = match value {
                    Value::Int(id) if *id < 0 => Value::Ref(self.resolve_row_id(&target, *id)?),
                    Value::Ref(id) if *id < 0 => Value::Ref(self.resolve_row_id(&target, *id)?),
                    Value::RefList(ids) => {
                        let mapped: Result<Vec<RowId>> = ids
                            .iter()
                            .map(|&id| {
                                if id < 0 {
                                    self.resolve_row_id(&target, id)
                                } else {
                                    Ok(id)
                                }
                            })
                            .collect();
                        Value::RefList(mapped?)
                    }
                    Value::List(items) => {
                        let mapped: Result<Vec<RowId>> = items
                            .iter()
                            .map(|v| match v {
                                Value::Int(id) if *id < 0 => self.resolve_row_id(&target, *id),
                                other => Ok(other.as_row_id()),
                            })
                            .collect();
                        Value::RefList(mapped?)
                    }
                    _ => value.clone(),
                };
            }
        }
        Ok(columns)
    }

    /// Parse-on-write enrichment for metadata tables.
    fn enrich_meta_columns(
        &self,
        table_id: &str,
        mut columns: BulkCellUpdates,
    ) -> Result<BulkCellUpdates> {
        match table_id {
            schema::META_ACL_RULES => {
                if let Some(formulas) = columns.get("aclFormula").cloned() {
                    if !columns.contains_key("aclFormulaParsed") {
                        let parsed: Result<Vec<Value>> = formulas
                            .iter()
                            .map(|f| match f {
                                Value::Text(src) => {
                                    Ok(Value::Text(predicate::parse_acl_formula_field(src)?))
                                }
                                _ => Ok(Value::Text(String::new())),
                            })
                            .collect();
                        columns.insert("aclFormulaParsed".to_string(), parsed?);
                    }
                }
            }
            schema::META_COLUMNS => {
                if let Some(options) = columns.get_mut("widgetOptions") {
                    for value in options.iter_mut() {
                        if let Value::Text(src) = value {
                            *value = Value::Text(predicate::parse_dropdown_condition(src));
                        }
                    }
                }
            }
            schema::META_TRIGGERS => {
                if let Some(conditions) = columns.get_mut("condition") {
                    for value in conditions.iter_mut() {
                        if let Value::Text(src) = value {
                            *value = match predicate::parse_trigger_condition(src) {
                                Some(out) => Value::Text(out),
                                None => Value::Null,
                            };
                        }
                    }
                }
            }
            _ => {}
        }
        Ok(columns)
    }

    //----------------------------------------
    // Record actions.
    //----------------------------------------

    fn do_add_record(&mut self, args: &[serde_json::Value]) -> Result<serde_json::Value> {
        let table_id = self.arg_str(args, 0)?.to_string();
        let given = args.get(1).and_then(|v| v.as_i64());
        let cells = self.cells_arg(args, 2)?;
        let mut columns = BulkCellUpdates::new();
        for (col, value) in cells {
            columns.insert(col, vec![value]);
        }
        let row_ids = self.add_records(&table_id, vec![given], columns)?;
        Ok(json!(row_ids[0]))
    }

    fn do_bulk_add_record(&mut self, args: &[serde_json::Value]) -> Result<serde_json::Value> {
        let table_id = self.arg_str(args, 0)?.to_string();
        let given: Vec<Option<i64>> = args
            .get(1)
            .and_then(|v| v.as_array())
            .ok_or_else(|| DocError::invalid("expected an array of row ids"))?
            .iter()
            .map(|v| v.as_i64())
            .collect();
        let columns = self.bulk_cells_arg(args, 2)?;
        let row_ids = self.add_records(&table_id, given, columns)?;
        Ok(json!(row_ids))
    }

    fn add_records(
        &mut self,
        table_id: &str,
        given: Vec<Option<i64>>,
        columns: BulkCellUpdates,
    ) -> Result<Vec<RowId>> {
        let row_ids: Result<Vec<RowId>> =
            given.into_iter().map(|g| self.resolve_new_row_id(table_id, g)).collect();
        let row_ids = row_ids?;
        let columns = self.translate_ref_values(table_id, columns)?;
        let columns = self.enrich_meta_columns(table_id, columns)?;
        self.engine.apply_doc_action(
            DocAction::BulkAddRecord {
                table_id: table_id.to_string(),
                row_ids: row_ids.clone(),
                columns,
            },
            true,
        )?;
        Ok(row_ids)
    }

    fn do_update_record(&mut self, args: &[serde_json::Value]) -> Result<serde_json::Value> {
        let table_id = self.arg_str(args, 0)?.to_string();
        let row_id = args
            .get(1)
            .and_then(|v| v.as_i64())
            .ok_or_else(|| DocError::invalid("expected a row id"))?;
        let cells = self.cells_arg(args, 2)?;
        let mut columns = BulkCellUpdates::new();
        for (col, value) in cells {
            columns.insert(col, vec![value]);
        }
        self.update_records(&table_id, vec![row_id], columns)?;
        Ok(serde_json::Value::Null)
    }

    fn do_bulk_update_record(&mut self, args: &[serde_json::Value]) -> Result<serde_json::Value> {
        let table_id = self.arg_str(args, 0)?.to_string();
        let row_ids: Vec<i64> = args
            .get(1)
            .and_then(|v| v.as_array())
            .ok_or_else(|| DocError::invalid("expected an array of row ids"))?
            .iter()
            .filter_map(|v| v.as_i64())
            .collect();
        let columns = self.bulk_cells_arg(args, 2)?;
        self.update_records(&table_id, row_ids, columns)?;
        Ok(serde_json::Value::Null)
    }

    fn update_records(
        &mut self,
        table_id: &str,
        row_ids: Vec<i64>,
        columns: BulkCellUpdates,
    ) -> Result<()> {
        let row_ids: Result<Vec<RowId>> =
            row_ids.into_iter().map(|r| self.resolve_row_id(table_id, r)).collect();
        let row_ids = row_ids?;
        let columns = self.translate_ref_values(table_id, columns)?;
        let columns = self.enrich_meta_columns(table_id, columns)?;
        let adjustments = self.reverse_adjustments(table_id, &row_ids, &columns);
        let updated_cols: Vec<String> = columns.keys().cloned().collect();
        self.engine.apply_doc_action(
            DocAction::BulkUpdateRecord {
                table_id: table_id.to_string(),
                row_ids: row_ids.clone(),
                columns,
            },
            true,
        )?;
        for action in adjustments {
            self.engine.apply_doc_action(action, true)?;
        }
        self.engine.recalc_triggers(table_id, &row_ids, &updated_cols);
        Ok(())
    }

    /// Compensating updates that keep a two-way reference pair consistent:
    /// for each changed source row, its old targets lose it and its new
    /// targets gain it, and each affected target row gets its full new list.
    fn reverse_adjustments(
        &self,
        table_id: &str,
        row_ids: &[RowId],
        columns: &BulkCellUpdates,
    ) -> Vec<DocAction> {
        let dm = DocModel::new(self.engine);
        let Some(table) = self.engine.table(table_id) else {
            return Vec::new();
        };
        let mut actions = Vec::new();
        for (col, new_values) in columns {
            let Some(col_rec) = dm.col_rec(table_id, col) else {
                continue;
            };
            let Some(reverse_rec) = dm.reverse_col(col_rec) else {
                continue;
            };
            let (Some(target_table_id), Some(reverse_col_id)) =
                (dm.col_ref_target(col_rec), dm.col_id_of(reverse_rec))
            else {
                continue;
            };
            let Some(target_table) = self.engine.table(&target_table_id) else {
                continue;
            };
            let Some(column) = table.get_column(col) else {
                continue;
            };

            #[derive(Default)]
            struct RefUpdates {
                removals: BTreeSet<RowId>,
                additions: BTreeSet<RowId>,
            }
            let mut affected: BTreeMap<RowId, RefUpdates> = BTreeMap::new();
            for (&row_id, new_value) in row_ids.iter().zip(new_values) {
                let old_value = table.get_cell(col, row_id);
                let new_value =
                    reckon_engine::value::convert_value(new_value.clone(), &column.col_type());
                if old_value == new_value {
                    continue;
                }
                for target in ref_targets(&old_value) {
                    affected.entry(target).or_default().removals.insert(row_id);
                }
                for target in ref_targets(&new_value) {
                    affected.entry(target).or_default().additions.insert(row_id);
                }
            }
            if affected.is_empty() {
                continue;
            }

            let reverse_type = target_table
                .get_column(&reverse_col_id)
                .map(|c| c.col_type())
                .unwrap_or(ColType::Any);
            let mut out_rows = Vec::new();
            let mut out_values = Vec::new();
            for (target_row, updates) in affected {
                if !target_table.has_row(target_row) {
                    continue;
                }
                let mut current: BTreeSet<RowId> =
                    ref_targets(&target_table.get_cell(&reverse_col_id, target_row))
                        .into_iter()
                        .collect();
                for row in updates.removals {
                    current.remove(&row);
                }
                for row in updates.additions {
                    current.insert(row);
                }
                let value = match reverse_type {
                    ColType::Ref(_) => Value::Ref(current.first().copied().unwrap_or(0)),
                    _ => Value::RefList(current.into_iter().collect()),
                };
                out_rows.push(target_row);
                out_values.push(value);
            }
            if !out_rows.is_empty() {
                let mut out_columns = BulkCellUpdates::new();
                out_columns.insert(reverse_col_id, out_values);
                actions.push(DocAction::BulkUpdateRecord {
                    table_id: target_table_id,
                    row_ids: out_rows,
                    columns: out_columns,
                });
            }
        }
        actions
    }

    fn do_remove_record(&mut self, args: &[serde_json::Value]) -> Result<serde_json::Value> {
        let table_id = self.arg_str(args, 0)?.to_string();
        let row_id = args
            .get(1)
            .and_then(|v| v.as_i64())
            .ok_or_else(|| DocError::invalid("expected a row id"))?;
        self.remove_records(&table_id, vec![row_id])?;
        Ok(serde_json::Value::Null)
    }

    fn do_bulk_remove_record(&mut self, args: &[serde_json::Value]) -> Result<serde_json::Value> {
        let table_id = self.arg_str(args, 0)?.to_string();
        let row_ids: Vec<i64> = args
            .get(1)
            .and_then(|v| v.as_array())
            .ok_or_else(|| DocError::invalid("expected an array of row ids"))?
            .iter()
            .filter_map(|v| v.as_i64())
            .collect();
        self.remove_records(&table_id, row_ids)?;
        Ok(serde_json::Value::Null)
    }

    fn remove_records(&mut self, table_id: &str, row_ids: Vec<i64>) -> Result<()> {
        let row_ids: Result<Vec<RowId>> =
            row_ids.into_iter().map(|r| self.resolve_row_id(table_id, r)).collect();
        let row_ids = row_ids?;
        // Dying rows leave their partners' reverse lists.
        let dm = DocModel::new(self.engine);
        let mut cleared = BulkCellUpdates::new();
        if let Some(table) = self.engine.table(table_id) {
            for column in table.columns() {
                let has_reverse = dm
                    .col_rec(table_id, &column.col_id())
                    .and_then(|rec| dm.reverse_col(rec))
                    .is_some();
                if has_reverse {
                    cleared.insert(
                        column.col_id(),
                        vec![column.type_default(); row_ids.len()],
                    );
                }
            }
        }
        // Partner lists are adjusted first: adjustments may target rows of
        // this same table, which must still exist when the update lands.
        for action in self.reverse_adjustments(table_id, &row_ids, &cleared) {
            self.engine.apply_doc_action(action, true)?;
        }
        self.engine.apply_doc_action(
            DocAction::BulkRemoveRecord { table_id: table_id.to_string(), row_ids },
            true,
        )?;
        Ok(())
    }

    fn do_replace_table_data(&mut self, args: &[serde_json::Value]) -> Result<serde_json::Value> {
        let table_id = self.arg_str(args, 0)?.to_string();
        let row_ids: Vec<RowId> = args
            .get(1)
            .and_then(|v| v.as_array())
            .map(|a| a.iter().filter_map(|v| v.as_i64()).collect())
            .unwrap_or_default();
        let columns = self.bulk_cells_arg(args, 2)?;
        self.engine.apply_doc_action(
            DocAction::ReplaceTableData { table_id, row_ids, columns },
            true,
        )?;
        Ok(serde_json::Value::Null)
    }

    //----------------------------------------
    // Table actions.
    //----------------------------------------

    fn do_add_table(&mut self, args: &[serde_json::Value]) -> Result<serde_json::Value> {
        let suggestion = args.first().and_then(|v| v.as_str());
        let columns_json = args
            .get(1)
            .and_then(|v| v.as_array())
            .ok_or_else(|| DocError::invalid("expected an array of column definitions"))?;
        self.add_table(suggestion, columns_json)
    }

    fn do_add_empty_table(&mut self, args: &[serde_json::Value]) -> Result<serde_json::Value> {
        let suggestion = args.first().and_then(|v| v.as_str());
        let columns: Vec<serde_json::Value> =
            (0..3).map(|_| json!({"id": null, "type": "Any", "isFormula": false})).collect();
        self.add_table(suggestion, &columns)
    }

    fn add_table(
        &mut self,
        suggestion: Option<&str>,
        columns_json: &[serde_json::Value],
    ) -> Result<serde_json::Value> {
        let avoid: HashSet<String> = self.engine.table_ids().into_iter().collect();
        let table_id = pick_table_ident(suggestion, &avoid);

        let mut avoid_cols: HashSet<String> = HashSet::new();
        avoid_cols.insert("id".to_string());
        let mut col_infos: Vec<(String, ColInfo)> = Vec::new();
        let mut labels: Vec<String> = Vec::new();
        let mut widget_options: Vec<String> = Vec::new();
        for col_json in columns_json {
            let label = col_json
                .get("label")
                .and_then(|v| v.as_str())
                .or_else(|| col_json.get("id").and_then(|v| v.as_str()))
                .unwrap_or("");
            let suggestion = col_json.get("id").and_then(|v| v.as_str()).or_else(|| {
                if label.is_empty() { None } else { Some(label) }
            });
            let col_id = pick_col_ident(suggestion, &avoid_cols);
            avoid_cols.insert(col_id.clone());
            let mut info = ColInfo::from_json(col_json);
            // A formula column with no body on a fresh table is just data.
            if info.is_formula && info.formula.is_empty() {
                info.is_formula = false;
            }
            labels.push(if label.is_empty() { col_id.clone() } else { label.to_string() });
            widget_options.push(
                col_json
                    .get("widgetOptions")
                    .and_then(|v| v.as_str())
                    .map(predicate::parse_dropdown_condition)
                    .unwrap_or_default(),
            );
            col_infos.push((col_id, info));
        }

        self.engine.apply_doc_action(
            DocAction::AddTable { table_id: table_id.clone(), columns: col_infos.clone() },
            true,
        )?;

        // Metadata: the table record, its column records, its raw section.
        let meta_tables = self.engine.require_table(schema::META_TABLES)?;
        let table_rec = meta_tables.alloc_row_id();
        let mut cells = CellUpdates::new();
        cells.insert("tableId".to_string(), Value::Text(table_id.clone()));
        self.engine.apply_doc_action(
            DocAction::AddRecord {
                table_id: schema::META_TABLES.to_string(),
                row_id: table_rec,
                columns: cells,
            },
            true,
        )?;

        let meta_columns = self.engine.require_table(schema::META_COLUMNS)?;
        let col_recs: Vec<RowId> =
            col_infos.iter().map(|_| meta_columns.alloc_row_id()).collect();
        if !col_recs.is_empty() {
            let mut columns = BulkCellUpdates::new();
            columns.insert("parentId".to_string(),
                           vec![Value::Ref(table_rec); col_recs.len()]);
            columns.insert("colId".to_string(),
                           col_infos.iter().map(|(c, _)| Value::Text(c.clone())).collect());
            columns.insert("type".to_string(),
                           col_infos.iter().map(|(_, i)| Value::Text(i.col_type.clone())).collect());
            columns.insert("isFormula".to_string(),
                           col_infos.iter().map(|(_, i)| Value::Bool(i.is_formula)).collect());
            columns.insert("formula".to_string(),
                           col_infos.iter().map(|(_, i)| Value::Text(i.formula.clone())).collect());
            columns.insert("label".to_string(),
                           labels.into_iter().map(Value::Text).collect());
            columns.insert("widgetOptions".to_string(),
                           widget_options.into_iter().map(Value::Text).collect());
            self.engine.apply_doc_action(
                DocAction::BulkAddRecord {
                    table_id: schema::META_COLUMNS.to_string(),
                    row_ids: col_recs.clone(),
                    columns,
                },
                true,
            )?;
        }

        let meta_sections = self.engine.require_table(schema::META_SECTIONS)?;
        let section_rec = meta_sections.alloc_row_id();
        let mut cells = CellUpdates::new();
        cells.insert("tableRef".to_string(), Value::Ref(table_rec));
        cells.insert("title".to_string(), Value::Text(String::new()));
        self.engine.apply_doc_action(
            DocAction::AddRecord {
                table_id: schema::META_SECTIONS.to_string(),
                row_id: section_rec,
                columns: cells,
            },
            true,
        )?;

        Ok(json!({
            "table_id": table_id,
            "id": table_rec,
            "columns": col_infos.iter().map(|(c, _)| c.clone()).collect::<Vec<_>>(),
        }))
    }

    fn do_remove_table_action(&mut self, args: &[serde_json::Value]) -> Result<serde_json::Value> {
        let table_id = self.arg_str(args, 0)?.to_string();
        self.remove_table(&table_id)?;
        Ok(serde_json::Value::Null)
    }

    fn remove_table(&mut self, table_id: &str) -> Result<()> {
        self.require_user_table(table_id)?;
        let dm = DocModel::new(self.engine);
        let table_rec = dm.table_rec(table_id);

        if let Some(table_rec) = table_rec {
            // Cascade: triggers, ACL resources (and their rules), sections,
            // column records, then the table record itself.
            let trigger_recs: Vec<RowId> = dm
                .all_trigger_recs()
                .into_iter()
                .filter(|&t| dm.trigger_field(t, "tableRef").as_row_id() == table_rec)
                .collect();
            if !trigger_recs.is_empty() {
                self.engine.apply_doc_action(
                    DocAction::BulkRemoveRecord {
                        table_id: schema::META_TRIGGERS.to_string(),
                        row_ids: trigger_recs,
                    },
                    true,
                )?;
            }
            let resource_recs: Vec<RowId> = dm
                .all_acl_resource_recs()
                .into_iter()
                .filter(|&r| {
                    dm.resource_field(r, "tableId") == Value::Text(table_id.to_string())
                })
                .collect();
            let rule_recs: Vec<RowId> = dm
                .all_acl_rule_recs()
                .into_iter()
                .filter(|&rule| {
                    resource_recs.contains(&dm.rule_field(rule, "resource").as_row_id())
                })
                .collect();
            if !rule_recs.is_empty() {
                self.engine.apply_doc_action(
                    DocAction::BulkRemoveRecord {
                        table_id: schema::META_ACL_RULES.to_string(),
                        row_ids: rule_recs,
                    },
                    true,
                )?;
            }
            if !resource_recs.is_empty() {
                self.engine.apply_doc_action(
                    DocAction::BulkRemoveRecord {
                        table_id: schema::META_ACL_RESOURCES.to_string(),
                        row_ids: resource_recs,
                    },
                    true,
                )?;
            }
            let section_recs: Vec<RowId> = self
                .engine
                .table(schema::META_SECTIONS)
                .map(|t| {
                    t.all_row_ids()
                        .into_iter()
                        .filter(|&s| {
                            t.get_cell("tableRef", s).as_row_id() == table_rec
                        })
                        .collect()
                })
                .unwrap_or_default();
            if !section_recs.is_empty() {
                self.engine.apply_doc_action(
                    DocAction::BulkRemoveRecord {
                        table_id: schema::META_SECTIONS.to_string(),
                        row_ids: section_recs,
                    },
                    true,
                )?;
            }
            let col_recs = dm.column_recs(table_id);
            if !col_recs.is_empty() {
                self.engine.apply_doc_action(
                    DocAction::BulkRemoveRecord {
                        table_id: schema::META_COLUMNS.to_string(),
                        row_ids: col_recs,
                    },
                    true,
                )?;
            }
            self.engine.apply_doc_action(
                DocAction::RemoveRecord {
                    table_id: schema::META_TABLES.to_string(),
                    row_id: table_rec,
                },
                true,
            )?;
        }

        self.engine
            .apply_doc_action(DocAction::RemoveTable { table_id: table_id.to_string() }, true)?;
        Ok(())
    }

    fn do_rename_table(&mut self, args: &[serde_json::Value]) -> Result<serde_json::Value> {
        let old_table_id = self.arg_str(args, 0)?.to_string();
        let suggestion = self.arg_str(args, 1)?;
        self.require_user_table(&old_table_id)?;
        let mut avoid: HashSet<String> = self.engine.table_ids().into_iter().collect();
        avoid.remove(&old_table_id);
        let new_table_id = pick_table_ident(Some(suggestion), &avoid);
        if new_table_id == old_table_id {
            return Ok(json!(new_table_id));
        }

        // Patch formulas that name the table, before the schema moves.
        let formula_updates = self.collect_table_rename_formula_updates(&old_table_id, &new_table_id);

        self.engine.apply_doc_action(
            DocAction::RenameTable {
                old_table_id: old_table_id.clone(),
                new_table_id: new_table_id.clone(),
            },
            true,
        )?;

        let dm = DocModel::new(self.engine);
        if let Some(table_rec) = dm.table_rec(&old_table_id) {
            let mut cells = CellUpdates::new();
            cells.insert("tableId".to_string(), Value::Text(new_table_id.clone()));
            self.engine.apply_doc_action(
                DocAction::UpdateRecord {
                    table_id: schema::META_TABLES.to_string(),
                    row_id: table_rec,
                    columns: cells,
                },
                true,
            )?;
        }
        // Ref:Old / RefList:Old type strings in column metadata.
        let mut type_updates: Vec<(RowId, String)> = Vec::new();
        for col_rec in dm.all_column_recs() {
            let type_string = dm.col_text(col_rec, "type");
            let col_type = ColType::parse(&type_string);
            if col_type.ref_target() == Some(old_table_id.as_str()) {
                let new_type = match col_type {
                    ColType::Ref(_) => format!("Ref:{}", new_table_id),
                    _ => format!("RefList:{}", new_table_id),
                };
                type_updates.push((col_rec, new_type));
            }
        }
        for (col_rec, new_type) in type_updates {
            let mut cells = CellUpdates::new();
            cells.insert("type".to_string(), Value::Text(new_type));
            self.engine.apply_doc_action(
                DocAction::UpdateRecord {
                    table_id: schema::META_COLUMNS.to_string(),
                    row_id: col_rec,
                    columns: cells,
                },
                true,
            )?;
        }

        for (table, col, new_formula) in formula_updates {
            let table = if table == old_table_id { new_table_id.clone() } else { table };
            self.apply_formula_update(&table, &col, &new_formula)?;
        }

        // ACL resources and user attributes that name the table.
        let dm = DocModel::new(self.engine);
        let (resource_updates, rule_updates) =
            predicate::acl_table_rename_updates(&dm, &old_table_id, &new_table_id);
        for (row_id, cells) in resource_updates {
            self.apply_meta_update(schema::META_ACL_RESOURCES, row_id, cells)?;
        }
        for (row_id, cells) in rule_updates {
            self.apply_meta_update(schema::META_ACL_RULES, row_id, cells)?;
        }

        Ok(json!(new_table_id))
    }

    /// (table_id, col_id, new_formula) for every formula mentioning the
    /// renamed table, gathered against the pre-rename schema.
    fn collect_table_rename_formula_updates(
        &self,
        old_table_id: &str,
        new_table_id: &str,
    ) -> Vec<(String, String, String)> {
        let mut updates = Vec::new();
        for table in self.engine.all_tables() {
            if schema::is_meta_table(&table.table_id()) {
                continue;
            }
            for column in table.columns() {
                let Some(formula) = column.formula() else {
                    continue;
                };
                if let Some(new_formula) =
                    renames::rename_table_in_formula(&formula.source, old_table_id, new_table_id)
                {
                    updates.push((table.table_id(), column.col_id(), new_formula));
                }
            }
        }
        updates
    }

    //----------------------------------------
    // Column actions.
    //----------------------------------------

    fn do_add_column(&mut self, args: &[serde_json::Value]) -> Result<serde_json::Value> {
        let table_id = self.arg_str(args, 0)?.to_string();
        self.require_user_table(&table_id)?;
        let suggestion = args.get(1).and_then(|v| v.as_str());
        let info_json = args.get(2).cloned().unwrap_or_else(|| json!({}));

        let table = self.engine.require_table(&table_id)?;
        let mut avoid: HashSet<String> = table.column_ids().into_iter().collect();
        avoid.insert("id".to_string());
        let label = info_json.get("label").and_then(|v| v.as_str()).unwrap_or("");
        let col_id = pick_col_ident(
            suggestion.or(if label.is_empty() { None } else { Some(label) }),
            &avoid,
        );
        let mut info = ColInfo::from_json(&info_json);
        if info.is_formula && info.formula.is_empty() {
            info.is_formula = false;
        }

        self.engine.apply_doc_action(
            DocAction::AddColumn {
                table_id: table_id.clone(),
                col_id: col_id.clone(),
                info: info.clone(),
            },
            true,
        )?;

        let dm = DocModel::new(self.engine);
        let table_rec = dm
            .table_rec(&table_id)
            .ok_or_else(|| DocError::invalid(format!("no metadata for table {}", table_id)))?;
        let meta_columns = self.engine.require_table(schema::META_COLUMNS)?;
        let col_rec = meta_columns.alloc_row_id();
        let mut cells = CellUpdates::new();
        cells.insert("parentId".to_string(), Value::Ref(table_rec));
        cells.insert("colId".to_string(), Value::Text(col_id.clone()));
        cells.insert("type".to_string(), Value::Text(info.col_type.clone()));
        cells.insert("isFormula".to_string(), Value::Bool(info.is_formula));
        cells.insert("formula".to_string(), Value::Text(info.formula.clone()));
        cells.insert(
            "label".to_string(),
            Value::Text(if label.is_empty() { col_id.clone() } else { label.to_string() }),
        );
        for field in ["widgetOptions"] {
            if let Some(value) = info_json.get(field).and_then(|v| v.as_str()) {
                cells.insert(field.to_string(),
                             Value::Text(predicate::parse_dropdown_condition(value)));
            }
        }
        if let Some(when) = info_json.get("recalcWhen").and_then(|v| v.as_i64()) {
            cells.insert("recalcWhen".to_string(), Value::Int(when));
        }
        if let Some(deps) = info_json.get("recalcDeps") {
            cells.insert("recalcDeps".to_string(), Value::from_repr(deps));
        }
        self.engine.apply_doc_action(
            DocAction::AddRecord {
                table_id: schema::META_COLUMNS.to_string(),
                row_id: col_rec,
                columns: cells,
            },
            true,
        )?;

        Ok(json!({"colRef": col_rec, "colId": col_id}))
    }

    fn do_remove_column(&mut self, args: &[serde_json::Value]) -> Result<serde_json::Value> {
        let table_id = self.arg_str(args, 0)?.to_string();
        let col_id = self.arg_str(args, 1)?.to_string();
        self.require_user_table(&table_id)?;
        let dm = DocModel::new(self.engine);
        if let Some(col_rec) = dm.col_rec(&table_id, &col_id) {
            // Unhook a reverse partner pointing at the dying column.
            if let Some(reverse_rec) = dm.reverse_col(col_rec) {
                let mut cells = CellUpdates::new();
                cells.insert("reverseCol".to_string(), Value::Ref(0));
                self.apply_meta_update(schema::META_COLUMNS, reverse_rec, cells.into_iter().collect())?;
            }
            self.engine.apply_doc_action(
                DocAction::RemoveRecord {
                    table_id: schema::META_COLUMNS.to_string(),
                    row_id: col_rec,
                },
                true,
            )?;
        }
        self.engine.apply_doc_action(
            DocAction::RemoveColumn { table_id, col_id },
            true,
        )?;
        Ok(serde_json::Value::Null)
    }

    fn do_rename_column(&mut self, args: &[serde_json::Value]) -> Result<serde_json::Value> {
        let table_id = self.arg_str(args, 0)?.to_string();
        let old_col_id = self.arg_str(args, 1)?.to_string();
        let suggestion = self.arg_str(args, 2)?;
        self.require_user_table(&table_id)?;
        let table = self.engine.require_table(&table_id)?;
        if !table.has_column(&old_col_id) {
            return Err(DocError::Engine(reckon_engine::EngineError::Schema(format!(
                "no such column: {}.{}", table_id, old_col_id
            ))));
        }
        let mut avoid: HashSet<String> = table.column_ids().into_iter().collect();
        avoid.remove(&old_col_id);
        avoid.insert("id".to_string());
        let new_col_id = pick_col_ident(Some(suggestion), &avoid);
        if new_col_id == old_col_id {
            return Ok(json!(new_col_id));
        }

        // Formula patches are computed against the pre-rename schema.
        let mut formula_updates: Vec<(String, String, String)> = Vec::new();
        for other in self.engine.all_tables() {
            if schema::is_meta_table(&other.table_id()) {
                continue;
            }
            for column in other.columns() {
                let Some(formula) = column.formula() else {
                    continue;
                };
                if let Some(new_formula) = renames::rename_col_in_formula(
                    self.engine,
                    &other.table_id(),
                    &formula.source,
                    &table_id,
                    &old_col_id,
                    &new_col_id,
                ) {
                    formula_updates.push((other.table_id(), column.col_id(), new_formula));
                }
            }
        }

        self.engine.apply_doc_action(
            DocAction::RenameColumn {
                table_id: table_id.clone(),
                old_col_id: old_col_id.clone(),
                new_col_id: new_col_id.clone(),
            },
            true,
        )?;

        let dm = DocModel::new(self.engine);
        if let Some(col_rec) = dm.col_rec(&table_id, &old_col_id) {
            let mut cells = CellUpdates::new();
            cells.insert("colId".to_string(), Value::Text(new_col_id.clone()));
            self.apply_meta_update(schema::META_COLUMNS, col_rec, cells.into_iter().collect())?;
        }

        for (formula_table, formula_col, new_formula) in formula_updates {
            let formula_col = if formula_table == table_id && formula_col == old_col_id {
                new_col_id.clone()
            } else {
                formula_col
            };
            self.apply_formula_update(&formula_table, &formula_col, &new_formula)?;
        }

        // Predicate formulas: access rules, dropdown conditions, trigger
        // conditions.
        let mut col_renames = predicate::ColRenames::new();
        col_renames.insert((table_id.clone(), old_col_id.clone()), new_col_id.clone());
        let dm = DocModel::new(self.engine);
        for (row_id, cells) in predicate::acl_rename_updates(&dm, &col_renames) {
            self.apply_meta_update(schema::META_ACL_RULES, row_id, cells)?;
        }
        for (row_id, cells) in predicate::dropdown_rename_updates(&dm, &col_renames) {
            self.apply_meta_update(schema::META_COLUMNS, row_id, cells)?;
        }
        for (row_id, cells) in predicate::trigger_rename_updates(&dm, &col_renames) {
            self.apply_meta_update(schema::META_TRIGGERS, row_id, cells)?;
        }

        Ok(json!(new_col_id))
    }

    fn do_modify_column(&mut self, args: &[serde_json::Value]) -> Result<serde_json::Value> {
        let table_id = self.arg_str(args, 0)?.to_string();
        let col_id = self.arg_str(args, 1)?.to_string();
        let info_json = args
            .get(2)
            .and_then(|v| v.as_object())
            .ok_or_else(|| DocError::invalid("expected a column info object"))?;
        self.require_user_table(&table_id)?;

        let delta = ColDelta {
            col_type: info_json.get("type").and_then(|v| v.as_str()).map(str::to_string),
            is_formula: info_json.get("isFormula").and_then(|v| v.as_bool()),
            formula: info_json.get("formula").and_then(|v| v.as_str()).map(str::to_string),
        };
        if !delta.is_empty() {
            self.engine.apply_doc_action(
                DocAction::ModifyColumn {
                    table_id: table_id.clone(),
                    col_id: col_id.clone(),
                    delta,
                },
                true,
            )?;
        }

        let dm = DocModel::new(self.engine);
        let Some(col_rec) = dm.col_rec(&table_id, &col_id) else {
            return Ok(serde_json::Value::Null);
        };
        let mut cells = CellUpdates::new();
        for field in ["type", "formula", "label"] {
            if let Some(value) = info_json.get(field).and_then(|v| v.as_str()) {
                cells.insert(field.to_string(), Value::Text(value.to_string()));
            }
        }
        if let Some(value) = info_json.get("isFormula").and_then(|v| v.as_bool()) {
            cells.insert("isFormula".to_string(), Value::Bool(value));
        }
        if let Some(value) = info_json.get("widgetOptions").and_then(|v| v.as_str()) {
            cells.insert(
                "widgetOptions".to_string(),
                Value::Text(predicate::parse_dropdown_condition(value)),
            );
        }
        if let Some(value) = info_json.get("recalcWhen").and_then(|v| v.as_i64()) {
            cells.insert("recalcWhen".to_string(), Value::Int(value));
        }
        if let Some(value) = info_json.get("recalcDeps") {
            cells.insert("recalcDeps".to_string(), Value::from_repr(value));
        }
        if let Some(value) = info_json.get("reverseCol") {
            self.set_reverse_col(&dm, col_rec, value.as_i64().unwrap_or(0))?;
        }
        if !cells.is_empty() {
            self.apply_meta_update(schema::META_COLUMNS, col_rec, cells.into_iter().collect())?;
        }
        Ok(serde_json::Value::Null)
    }

    /// Declare (or clear) a two-way reference pair. Both sides' reverseCol
    /// fields move together.
    fn set_reverse_col(&mut self, dm: &DocModel, col_rec: RowId, desired: RowId) -> Result<()> {
        if desired == 0 {
            if let Some(old_partner) = dm.reverse_col(col_rec) {
                for rec in [col_rec, old_partner] {
                    let mut cells = CellUpdates::new();
                    cells.insert("reverseCol".to_string(), Value::Ref(0));
                    self.apply_meta_update(schema::META_COLUMNS, rec,
                                           cells.into_iter().collect())?;
                }
            }
            return Ok(());
        }
        let ref_table = dm.col_ref_target(col_rec).ok_or_else(|| {
            DocError::invalid("reverseCol may only be set on a column with a reference type")
        })?;
        let partner_table = dm.col_table_id(desired).ok_or_else(|| {
            DocError::invalid("invalid column specified in reverseCol")
        })?;
        if partner_table != ref_table {
            return Err(DocError::invalid("reverseCol must be a column in the target table"));
        }
        if dm.reverse_col(desired).is_some() {
            return Err(DocError::invalid(
                "reverseCol specifies an existing two-way reference column",
            ));
        }
        let mut cells = CellUpdates::new();
        cells.insert("reverseCol".to_string(), Value::Ref(desired));
        self.apply_meta_update(schema::META_COLUMNS, col_rec, cells.into_iter().collect())?;
        let mut cells = CellUpdates::new();
        cells.insert("reverseCol".to_string(), Value::Ref(col_rec));
        self.apply_meta_update(schema::META_COLUMNS, desired, cells.into_iter().collect())?;
        Ok(())
    }

    //----------------------------------------
    // Misc actions.
    //----------------------------------------

    fn do_apply_doc_actions(&mut self, args: &[serde_json::Value]) -> Result<serde_json::Value> {
        let actions = args
            .first()
            .and_then(|v| v.as_array())
            .ok_or_else(|| DocError::invalid("expected an array of doc actions"))?;
        for repr in actions {
            let action = DocAction::from_repr(repr)
                .ok_or_else(|| DocError::invalid("malformed doc action"))?;
            self.engine.apply_doc_action(action, true)?;
        }
        Ok(serde_json::Value::Null)
    }

    fn do_respond_to_requests(&mut self, args: &[serde_json::Value]) -> Result<serde_json::Value> {
        let responses = args
            .first()
            .and_then(|v| v.as_object())
            .ok_or_else(|| DocError::invalid("expected a map of responses"))?;
        let map: HashMap<String, Value> =
            responses.iter().map(|(k, v)| (k.clone(), Value::from_repr(v))).collect();
        let any = self.engine.respond_to_requests(map);
        Ok(json!(any))
    }

    /// Apply a user-supplied transform rule mapping source columns into
    /// destination columns (possibly into a new table), then remove the
    /// hidden source table.
    fn do_transform_and_finish_import(
        &mut self,
        args: &[serde_json::Value],
    ) -> Result<serde_json::Value> {
        let hidden_table_id = self.arg_str(args, 0)?.to_string();
        self.require_user_table(&hidden_table_id)?;
        let dest_arg = args.get(1).and_then(|v| v.as_str()).map(str::to_string);
        let rule_cols: Vec<serde_json::Value> = args
            .get(2)
            .and_then(|v| v.get("destCols"))
            .and_then(|v| v.as_array())
            .cloned()
            .ok_or_else(|| DocError::invalid("transform rule must carry destCols"))?;

        // Destination table: given, or created from the rule.
        let dest_table_id = match dest_arg {
            Some(id) => {
                self.engine.require_table(&id)?;
                id
            }
            None => {
                let columns: Vec<serde_json::Value> = rule_cols
                    .iter()
                    .map(|rc| {
                        json!({
                            "id": rc.get("colId").cloned().unwrap_or(serde_json::Value::Null),
                            "label": rc.get("label").cloned().unwrap_or(serde_json::Value::Null),
                            "type": rc.get("type").and_then(|v| v.as_str()).unwrap_or("Any"),
                            "isFormula": false,
                        })
                    })
                    .collect();
                let created = self.add_table(None, &columns)?;
                created["table_id"].as_str().unwrap_or_default().to_string()
            }
        };

        // Evaluate each transform formula through ordinary (hidden) formula
        // columns on the source table.
        let mut transform_cols: Vec<Option<String>> = Vec::new();
        for (index, rule_col) in rule_cols.iter().enumerate() {
            let formula = rule_col.get("formula").and_then(|v| v.as_str()).unwrap_or("");
            if formula.is_empty() {
                transform_cols.push(None);
                continue;
            }
            let temp_col_id = format!("gristHelper_Import{}", index);
            self.engine.apply_doc_action(
                DocAction::AddColumn {
                    table_id: hidden_table_id.clone(),
                    col_id: temp_col_id.clone(),
                    info: ColInfo::formula(
                        rule_col.get("type").and_then(|v| v.as_str()).unwrap_or("Any"),
                        formula,
                    ),
                },
                true,
            )?;
            transform_cols.push(Some(temp_col_id));
        }
        self.engine.bring_all_up_to_date()?;

        let source = self.engine.require_table(&hidden_table_id)?;
        let dest = self.engine.require_table(&dest_table_id)?;
        let dest_col_ids: Vec<String> = dest
            .column_ids()
            .into_iter()
            .filter(|c| !c.starts_with("gristHelper_"))
            .collect();
        let source_rows = source.all_row_ids();
        if !source_rows.is_empty() {
            let row_ids: Vec<RowId> = source_rows.iter().map(|_| dest.alloc_row_id()).collect();
            let mut columns = BulkCellUpdates::new();
            for (index, rule_col) in rule_cols.iter().enumerate() {
                let dest_col = rule_col
                    .get("colId")
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
                    .or_else(|| dest_col_ids.get(index).cloned());
                let Some(dest_col) = dest_col else {
                    continue;
                };
                let values: Vec<Value> = source_rows
                    .iter()
                    .map(|&row| match &transform_cols[index] {
                        Some(temp_col) => match source.get_cell(temp_col, row) {
                            Value::Error(_) => Value::Null,
                            value => value,
                        },
                        None => source.get_cell(&dest_col, row),
                    })
                    .collect();
                columns.insert(dest_col, values);
            }
            self.engine.apply_doc_action(
                DocAction::BulkAddRecord { table_id: dest_table_id.clone(), row_ids, columns },
                true,
            )?;
        }

        self.remove_table(&hidden_table_id)?;
        Ok(json!(dest_table_id))
    }

    //----------------------------------------
    // Shared helpers.
    //----------------------------------------

    /// Update a formula column's text: the structural recompile plus the
    /// matching metadata field.
    fn apply_formula_update(&mut self, table_id: &str, col_id: &str, formula: &str) -> Result<()> {
        self.engine.apply_doc_action(
            DocAction::ModifyColumn {
                table_id: table_id.to_string(),
                col_id: col_id.to_string(),
                delta: ColDelta { formula: Some(formula.to_string()), ..Default::default() },
            },
            true,
        )?;
        let dm = DocModel::new(self.engine);
        if let Some(col_rec) = dm.col_rec(table_id, col_id) {
            let mut cells = CellUpdates::new();
            cells.insert("formula".to_string(), Value::Text(formula.to_string()));
            self.apply_meta_update(schema::META_COLUMNS, col_rec, cells.into_iter().collect())?;
        }
        Ok(())
    }

    fn apply_meta_update(
        &mut self,
        table_id: &str,
        row_id: RowId,
        cells: Vec<(String, Value)>,
    ) -> Result<()> {
        let columns: CellUpdates = cells.into_iter().collect();
        self.engine.apply_doc_action(
            DocAction::UpdateRecord { table_id: table_id.to_string(), row_id, columns },
            true,
        )?;
        Ok(())
    }
}

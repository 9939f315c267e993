//! Predicate formulas stored in metadata: access rules, dropdown
//! conditions and trigger conditions.
//!
//! Each is stored as text plus a parsed JSON tree; the parsed form is
//! (re)generated on write when absent, and column renames patch the text
//! and refresh the parse.

use std::collections::HashMap;

use reckon_engine::formula::{
    parse_predicate, parse_predicate_json, process_renames, EntityKind, PredicateKind,
};
use reckon_engine::{RowId, Value};
use serde_json::json;

use crate::docmodel::DocModel;
use crate::error::{DocError, Result};

/// Column renames being applied: (table_id, old_col_id) -> new_col_id.
pub type ColRenames = HashMap<(String, String), String>;

/// Populate `aclFormulaParsed` from `aclFormula`. A malformed rule formula
/// rejects the submission.
pub fn parse_acl_formula_field(formula: &str) -> Result<String> {
    parse_predicate_json(formula)
        .map_err(|err| DocError::invalid(format!("error parsing ACL formula: {}", err)))
}

/// Parse `dropdownCondition.text` inside a widgetOptions JSON string and
/// store the result under `dropdownCondition.parsed`. Returns the input
/// unchanged when there is nothing to do or it cannot be parsed.
pub fn parse_dropdown_condition(widget_options_json: &str) -> String {
    let Ok(mut options) = serde_json::from_str::<serde_json::Value>(widget_options_json) else {
        return widget_options_json.to_string();
    };
    let Some(condition) = options.get_mut("dropdownCondition").and_then(|c| c.as_object_mut())
    else {
        return widget_options_json.to_string();
    };
    if condition.contains_key("parsed") {
        return widget_options_json.to_string();
    }
    let Some(text) = condition.get("text").and_then(|t| t.as_str()) else {
        return widget_options_json.to_string();
    };
    match parse_predicate_json(text) {
        Ok(parsed) => {
            condition.insert("parsed".to_string(), json!(parsed));
            options.to_string()
        }
        Err(_) => widget_options_json.to_string(),
    }
}

/// Parse a trigger condition. Accepts either a raw formula string (wrapped
/// into the JSON form) or `{"text": ..., "parsed": ...}` JSON. Cleared text
/// removes the condition (returns None).
pub fn parse_trigger_condition(condition_str: &str) -> Option<String> {
    if condition_str.is_empty() {
        return None;
    }
    let mut condition = match serde_json::from_str::<serde_json::Value>(condition_str) {
        Ok(serde_json::Value::Object(obj)) => obj,
        Ok(_) => return Some(condition_str.to_string()),
        Err(_) => {
            let mut obj = serde_json::Map::new();
            obj.insert("text".to_string(), json!(condition_str));
            obj
        }
    };
    let text = condition.get("text").and_then(|t| t.as_str()).unwrap_or("").to_string();
    if text.is_empty() {
        return None;
    }
    if condition.contains_key("parsed") {
        return Some(condition_str.to_string());
    }
    match parse_predicate(&text) {
        Ok(parsed) => {
            condition.insert("parsed".to_string(), parsed);
            Some(serde_json::Value::Object(condition).to_string())
        }
        Err(_) => Some(condition_str.to_string()),
    }
}

/// Updates to `_grist_ACLRules` rows for the given column renames.
pub fn acl_rename_updates(
    dm: &DocModel,
    renames: &ColRenames,
) -> Vec<(RowId, Vec<(String, Value)>)> {
    // user.ATTR.COL entities resolve against the user attribute's lookup
    // table, declared in rules' userAttributes JSON.
    let mut user_attr_tables: HashMap<String, String> = HashMap::new();
    for rule_rec in dm.all_acl_rule_recs() {
        if let Value::Text(attrs_json) = dm.rule_field(rule_rec, "userAttributes") {
            if let Ok(attrs) = serde_json::from_str::<serde_json::Value>(&attrs_json) {
                let name = attrs.get("name").and_then(|v| v.as_str());
                let table_id = attrs.get("tableId").and_then(|v| v.as_str());
                if let (Some(name), Some(table_id)) = (name, table_id) {
                    user_attr_tables.insert(name.to_string(), table_id.to_string());
                }
            }
        }
    }

    let mut updates = Vec::new();
    for rule_rec in dm.all_acl_rule_recs() {
        let Value::Text(formula) = dm.rule_field(rule_rec, "aclFormula") else {
            continue;
        };
        if formula.is_empty() {
            continue;
        }
        let resource_rec = dm.rule_field(rule_rec, "resource").as_row_id();
        let resource_table = match dm.resource_field(resource_rec, "tableId") {
            Value::Text(t) => t,
            _ => String::new(),
        };
        let new_formula = process_renames(&formula, PredicateKind::Acl, |entity| {
            let table_id = match entity.kind {
                EntityKind::RecCol => Some(resource_table.clone()),
                EntityKind::UserAttrCol => {
                    entity.extra.as_ref().and_then(|attr| user_attr_tables.get(attr)).cloned()
                }
                _ => None,
            }?;
            renames.get(&(table_id, entity.name.clone())).cloned()
        });
        if new_formula != formula {
            let parsed = parse_predicate_json(&new_formula).unwrap_or_default();
            updates.push((rule_rec, vec![
                ("aclFormula".to_string(), Value::Text(new_formula)),
                ("aclFormulaParsed".to_string(), Value::Text(parsed)),
            ]));
        }
    }
    updates
}

/// Updates to `_grist_Tables_column.widgetOptions` for dropdown-condition
/// renames.
pub fn dropdown_rename_updates(
    dm: &DocModel,
    renames: &ColRenames,
) -> Vec<(RowId, Vec<(String, Value)>)> {
    let mut updates = Vec::new();
    for col_rec in dm.all_column_recs() {
        let options_json = dm.col_text(col_rec, "widgetOptions");
        if options_json.is_empty() {
            continue;
        }
        let Ok(mut options) = serde_json::from_str::<serde_json::Value>(&options_json) else {
            continue;
        };
        let Some(text) = options
            .get("dropdownCondition")
            .and_then(|c| c.get("text"))
            .and_then(|t| t.as_str())
            .map(str::to_string)
        else {
            continue;
        };
        // choice.X resolves against the column's referenced table; rec.X
        // against the column's own table. Stray choiceAttrs on non-reference
        // columns resolve to no table and stay untouched.
        let self_table = dm.col_table_id(col_rec).unwrap_or_default();
        let ref_table = dm.col_ref_target(col_rec);
        let new_text = process_renames(&text, PredicateKind::Dropdown, |entity| {
            let table_id = match entity.kind {
                EntityKind::RecCol => Some(self_table.clone()),
                EntityKind::ChoiceAttr => ref_table.clone(),
                _ => None,
            }?;
            renames.get(&(table_id, entity.name.clone())).cloned()
        });
        if new_text != text {
            let parsed = parse_predicate_json(&new_text).unwrap_or_default();
            if let Some(condition) = options.get_mut("dropdownCondition") {
                condition["text"] = json!(new_text);
                condition["parsed"] = json!(parsed);
            }
            updates.push((col_rec, vec![
                ("widgetOptions".to_string(), Value::Text(options.to_string())),
            ]));
        }
    }
    updates
}

/// Updates to `_grist_Triggers.condition` for trigger-condition renames.
pub fn trigger_rename_updates(
    dm: &DocModel,
    renames: &ColRenames,
) -> Vec<(RowId, Vec<(String, Value)>)> {
    let mut updates = Vec::new();
    for trigger_rec in dm.all_trigger_recs() {
        let Value::Text(condition_json) = dm.trigger_field(trigger_rec, "condition") else {
            continue;
        };
        if condition_json.is_empty() {
            continue;
        }
        let Ok(mut condition) = serde_json::from_str::<serde_json::Value>(&condition_json) else {
            continue;
        };
        let Some(text) =
            condition.get("text").and_then(|t| t.as_str()).map(str::to_string)
        else {
            continue;
        };
        let Some(table_id) = dm.trigger_table_id(trigger_rec) else {
            continue;
        };
        let new_text = process_renames(&text, PredicateKind::Trigger, |entity| {
            renames.get(&(table_id.clone(), entity.name.clone())).cloned()
        });
        if new_text != text {
            condition["text"] = json!(new_text);
            condition["parsed"] = parse_predicate(&new_text).unwrap_or(json!(null));
            updates.push((trigger_rec, vec![
                ("condition".to_string(), Value::Text(condition.to_string())),
            ]));
        }
    }
    updates
}

/// Updates to ACL resources and user-attribute JSON for a table rename.
pub fn acl_table_rename_updates(
    dm: &DocModel,
    old_table_id: &str,
    new_table_id: &str,
) -> (Vec<(RowId, Vec<(String, Value)>)>, Vec<(RowId, Vec<(String, Value)>)>) {
    let mut resource_updates = Vec::new();
    for resource_rec in dm.all_acl_resource_recs() {
        if dm.resource_field(resource_rec, "tableId")
            == Value::Text(old_table_id.to_string())
        {
            resource_updates.push((resource_rec, vec![
                ("tableId".to_string(), Value::Text(new_table_id.to_string())),
            ]));
        }
    }
    let mut rule_updates = Vec::new();
    for rule_rec in dm.all_acl_rule_recs() {
        let Value::Text(attrs_json) = dm.rule_field(rule_rec, "userAttributes") else {
            continue;
        };
        let Ok(mut attrs) = serde_json::from_str::<serde_json::Value>(&attrs_json) else {
            continue;
        };
        if attrs.get("tableId").and_then(|v| v.as_str()) == Some(old_table_id) {
            attrs["tableId"] = json!(new_table_id);
            rule_updates.push((rule_rec, vec![
                ("userAttributes".to_string(), Value::Text(attrs.to_string())),
            ]));
        }
    }
    (resource_updates, rule_updates)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dropdown_condition_adds_parsed() {
        let options = r#"{"dropdownCondition":{"text":"rec.x == 1"}}"#;
        let out = parse_dropdown_condition(options);
        let parsed: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert!(parsed["dropdownCondition"]["parsed"].as_str().unwrap().contains("Attr"));
        // A second pass is a no-op.
        assert_eq!(parse_dropdown_condition(&out), out);
    }

    #[test]
    fn test_parse_trigger_condition_wraps_raw_text() {
        let out = parse_trigger_condition("rec.x > 2").unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed["text"], json!("rec.x > 2"));
        assert_eq!(parsed["parsed"][0], json!("Gt"));
        assert_eq!(parse_trigger_condition(""), None);
        assert_eq!(parse_trigger_condition(r#"{"text":""}"#), None);
    }

    #[test]
    fn test_parse_acl_formula_field_rejects_bad_formula() {
        assert!(parse_acl_formula_field("rec.x ==").is_err());
        assert!(parse_acl_formula_field("rec.x == 1").is_ok());
    }
}

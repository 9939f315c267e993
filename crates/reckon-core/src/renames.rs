//! Rename patching for user formulas.
//!
//! Unlike predicate formulas, user formulas can reach other tables through
//! reference chains and lookups, so deciding whether `x.name` refers to the
//! renamed column needs the schema: the type of `x` is inferred from the
//! parse tree and the column types. Patches splice only the identifier
//! tokens; comments, strings and whitespace stay byte-identical.

use reckon_engine::formula::{replace_dollars, ParseNode};
use reckon_engine::textbuilder::{apply_patches, Patch};
use reckon_engine::Engine;

/// What an expression evaluates to, as far as renames care.
#[derive(Clone, Debug, PartialEq)]
enum TypeInfo {
    /// A record of the given table.
    Rec(String),
    /// A set of records of the given table.
    RecSet(String),
    /// The table namespace itself.
    TableNs(String),
    /// A bound lookup method on the given table.
    LookupMethod(String),
    Other,
}

struct Collector<'a> {
    engine: &'a Engine,
    self_table: String,
    renamed_table: String,
    renamed_col: String,
    new_name: String,
    patches: Vec<Patch>,
}

impl Collector<'_> {
    /// Infer the type of a node while collecting rename patches from its
    /// children.
    fn walk(&mut self, node: &ParseNode) -> TypeInfo {
        match node {
            ParseNode::Name { name, .. } => {
                if name == "rec" {
                    TypeInfo::Rec(self.self_table.clone())
                } else if self.engine.has_table(name) {
                    TypeInfo::TableNs(name.clone())
                } else {
                    TypeInfo::Other
                }
            }
            ParseNode::Attr { obj, name, pos } => {
                let obj_type = self.walk(obj);
                match &obj_type {
                    TypeInfo::Rec(table) | TypeInfo::RecSet(table) => {
                        if *table == self.renamed_table && *name == self.renamed_col {
                            self.patches.push(Patch::new(
                                *pos,
                                pos + name.len(),
                                self.new_name.clone(),
                            ));
                        }
                        self.attr_type(table.clone(), name, matches!(obj_type, TypeInfo::RecSet(_)))
                    }
                    TypeInfo::TableNs(table) => {
                        if matches!(name.as_str(), "lookupRecords" | "lookupOne"
                                    | "lookupOrAddDerived") {
                            TypeInfo::LookupMethod(table.clone())
                        } else {
                            TypeInfo::Other
                        }
                    }
                    _ => TypeInfo::Other,
                }
            }
            ParseNode::Call { func, args, kwargs } => {
                let func_type = self.walk(func);
                for arg in args {
                    self.walk(arg);
                }
                let lookup_table = match &func_type {
                    TypeInfo::LookupMethod(table) => Some(table.clone()),
                    _ => None,
                };
                for kwarg in kwargs {
                    // Keyword names of a lookup call are column ids of the
                    // looked-up table.
                    if let Some(table) = &lookup_table {
                        if *table == self.renamed_table
                            && kwarg.name == self.renamed_col
                            && kwarg.name != "order_by"
                        {
                            self.patches.push(Patch::new(
                                kwarg.pos,
                                kwarg.pos + kwarg.name.len(),
                                self.new_name.clone(),
                            ));
                        }
                    }
                    self.walk(&kwarg.value);
                }
                match func_type {
                    TypeInfo::LookupMethod(table) => TypeInfo::RecSet(table),
                    _ => TypeInfo::Other,
                }
            }
            ParseNode::And(parts) | ParseNode::Or(parts) | ParseNode::List(parts) => {
                for part in parts {
                    self.walk(part);
                }
                TypeInfo::Other
            }
            ParseNode::BinOp { lhs, rhs, .. } | ParseNode::Compare { lhs, rhs, .. } => {
                self.walk(lhs);
                self.walk(rhs);
                TypeInfo::Other
            }
            ParseNode::Not(operand) | ParseNode::Comment { node: operand, .. } => {
                self.walk(operand);
                TypeInfo::Other
            }
            ParseNode::Const(_) => TypeInfo::Other,
        }
    }

    /// The type of `<table record>.<col>`, following reference columns.
    fn attr_type(&self, table_id: String, col_id: &str, many: bool) -> TypeInfo {
        let Some(table) = self.engine.table(&table_id) else {
            return TypeInfo::Other;
        };
        let Some(column) = table.get_column(col_id) else {
            return TypeInfo::Other;
        };
        match column.col_type() {
            reckon_engine::ColType::Ref(target) => {
                if many {
                    TypeInfo::RecSet(target)
                } else {
                    TypeInfo::Rec(target)
                }
            }
            reckon_engine::ColType::RefList(target) => TypeInfo::RecSet(target),
            _ => TypeInfo::Other,
        }
    }
}

/// Patch references to a renamed column in one formula. Returns the new
/// source if anything changed. `lookupOne(...).x` chains and `$x` shorthand
/// are handled; syntactically invalid formulas stay untouched.
pub fn rename_col_in_formula(
    engine: &Engine,
    self_table: &str,
    formula: &str,
    renamed_table: &str,
    old_col_id: &str,
    new_col_id: &str,
) -> Option<String> {
    let replacer = replace_dollars(formula);
    let node = reckon_engine::formula::parse_expression(replacer.text()).ok()?;
    let mut collector = Collector {
        engine,
        self_table: self_table.to_string(),
        renamed_table: renamed_table.to_string(),
        renamed_col: old_col_id.to_string(),
        new_name: new_col_id.to_string(),
        patches: Vec::new(),
    };
    collector.walk(&node);
    if collector.patches.is_empty() {
        return None;
    }
    let patches: Vec<Patch> =
        collector.patches.into_iter().map(|p| replacer.map_back_patch(p)).collect();
    Some(apply_patches(formula, patches))
}

/// Patch references to a renamed table (used as a module-level name) in one
/// formula. Returns the new source if anything changed.
pub fn rename_table_in_formula(
    formula: &str,
    old_table_id: &str,
    new_table_id: &str,
) -> Option<String> {
    let replacer = replace_dollars(formula);
    let node = reckon_engine::formula::parse_expression(replacer.text()).ok()?;
    let mut patches = Vec::new();
    collect_table_names(&node, old_table_id, new_table_id, &mut patches);
    if patches.is_empty() {
        return None;
    }
    let patches: Vec<Patch> = patches.into_iter().map(|p| replacer.map_back_patch(p)).collect();
    Some(apply_patches(formula, patches))
}

fn collect_table_names(node: &ParseNode, old: &str, new: &str, patches: &mut Vec<Patch>) {
    match node {
        ParseNode::Name { name, pos } => {
            // `rec` is the only bare name that is not a table reference;
            // anything else shadowing a table id is not expressible here.
            if name == old {
                patches.push(Patch::new(*pos, pos + name.len(), new.to_string()));
            }
        }
        ParseNode::Attr { obj, .. } => collect_table_names(obj, old, new, patches),
        ParseNode::Call { func, args, kwargs } => {
            collect_table_names(func, old, new, patches);
            for arg in args {
                collect_table_names(arg, old, new, patches);
            }
            for kwarg in kwargs {
                collect_table_names(&kwarg.value, old, new, patches);
            }
        }
        ParseNode::And(parts) | ParseNode::Or(parts) | ParseNode::List(parts) => {
            for part in parts {
                collect_table_names(part, old, new, patches);
            }
        }
        ParseNode::BinOp { lhs, rhs, .. } | ParseNode::Compare { lhs, rhs, .. } => {
            collect_table_names(lhs, old, new, patches);
            collect_table_names(rhs, old, new, patches);
        }
        ParseNode::Not(operand) | ParseNode::Comment { node: operand, .. } => {
            collect_table_names(operand, old, new, patches);
        }
        ParseNode::Const(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reckon_engine::{ColInfo, DocAction};

    fn engine_with_schema() -> Engine {
        let engine = Engine::new();
        engine.begin_group();
        for (table, cols) in [
            ("Schools", vec![("name", "Text"), ("address", "Ref:Address")]),
            ("Address", vec![("city", "Text")]),
            ("Students", vec![("school", "Ref:Schools"), ("schoolName", "Text")]),
        ] {
            engine
                .apply_doc_action(
                    DocAction::AddTable {
                        table_id: table.to_string(),
                        columns: cols
                            .into_iter()
                            .map(|(c, t)| (c.to_string(), ColInfo::data(t)))
                            .collect(),
                    },
                    true,
                )
                .unwrap();
        }
        engine
    }

    #[test]
    fn test_rename_direct_and_dollar_reference() {
        let engine = engine_with_schema();
        let out = rename_col_in_formula(
            &engine, "Students", "$schoolName + rec.schoolName", "Students", "schoolName", "sn",
        );
        assert_eq!(out.as_deref(), Some("$sn + rec.sn"));
    }

    #[test]
    fn test_rename_through_reference_chain() {
        let engine = engine_with_schema();
        let out = rename_col_in_formula(
            &engine, "Students", "$school.address.city", "Address", "city", "town",
        );
        assert_eq!(out.as_deref(), Some("$school.address.town"));
        // The same name on an unrelated table stays put.
        let out = rename_col_in_formula(
            &engine, "Students", "$school.name", "Address", "name", "x",
        );
        assert_eq!(out, None);
    }

    #[test]
    fn test_rename_lookup_keyword_and_result_attr() {
        let engine = engine_with_schema();
        let out = rename_col_in_formula(
            &engine,
            "Students",
            "Schools.lookupOne(name=$schoolName).name",
            "Schools",
            "name",
            "title",
        );
        assert_eq!(out.as_deref(), Some("Schools.lookupOne(title=$schoolName).title"));
    }

    #[test]
    fn test_rename_table_name_only_where_used() {
        let out = rename_table_in_formula(
            "len(Schools.lookupRecords(name=$x)) + Schools2.lookupOne(a=1).b",
            "Schools",
            "Academies",
        );
        // Only the exact name matches; similar names are untouched.
        assert_eq!(
            out.as_deref(),
            Some("len(Academies.lookupRecords(name=$x)) + Schools2.lookupOne(a=1).b")
        );
    }

    #[test]
    fn test_invalid_formula_untouched() {
        let engine = engine_with_schema();
        assert_eq!(
            rename_col_in_formula(&engine, "Students", "$x +", "Students", "x", "y"),
            None
        );
    }
}

//! Rename-safe source rewriting.
//!
//! `$NAME` is rewritten to `rec.NAME` before parsing; the rewrite records
//! enough to map positions in the rewritten text back onto the original, so
//! rename patches land on the exact identifier tokens the user wrote.
//! Entity collection walks the parse tree for the handful of attribute
//! patterns that renames may affect.

use crate::textbuilder::{apply_patches, Patch};

use super::parser::parse_expression;
use super::ParseNode;

/// The reversible `$NAME` -> `rec.NAME` rewrite.
pub struct DollarReplacer {
    original: String,
    text: String,
    repls: Vec<Repl>,
}

struct Repl {
    /// Offset of `$` in the original text.
    orig_pos: usize,
    /// Offset of `rec.` in the rewritten text.
    new_pos: usize,
    name_len: usize,
}

/// Length difference of one replacement: "rec." is three bytes longer
/// than "$".
const REPL_GROWTH: usize = 3;

pub fn replace_dollars(src: &str) -> DollarReplacer {
    let bytes = src.as_bytes();
    let mut text = String::with_capacity(src.len());
    let mut repls = Vec::new();
    let mut in_string: Option<u8> = None;
    let mut escaped = false;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        if let Some(quote) = in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == quote {
                in_string = None;
            }
            // Copy string contents byte-exactly, one full character at a time.
            let ch_len = src[i..].chars().next().map(|c| c.len_utf8()).unwrap_or(1);
            text.push_str(&src[i..i + ch_len]);
            i += ch_len;
            continue;
        }
        match b {
            b'\'' | b'"' => {
                in_string = Some(b);
                text.push(b as char);
                i += 1;
            }
            b'$' => {
                let start = i + 1;
                let mut end = start;
                while end < bytes.len()
                    && ((bytes[end] as char).is_ascii_alphanumeric() || bytes[end] == b'_')
                {
                    end += 1;
                }
                if end > start && !(bytes[start] as char).is_ascii_digit() {
                    repls.push(Repl { orig_pos: i, new_pos: text.len(), name_len: end - start });
                    text.push_str("rec.");
                    text.push_str(&src[start..end]);
                    i = end;
                } else {
                    text.push('$');
                    i += 1;
                }
            }
            _ => {
                // Copy one full UTF-8 character.
                let ch_len = src[i..].chars().next().map(|c| c.len_utf8()).unwrap_or(1);
                text.push_str(&src[i..i + ch_len]);
                i += ch_len;
            }
        }
    }

    DollarReplacer { original: src.to_string(), text, repls }
}

impl DollarReplacer {
    /// The rewritten text that gets parsed.
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn original(&self) -> &str {
        &self.original
    }

    /// Map a patch against the rewritten text back onto the original. A
    /// patch inside a rewritten `rec.NAME` lands on the NAME part of the
    /// original `$NAME`.
    pub fn map_back_patch(&self, patch: Patch) -> Patch {
        let mut preceding = 0;
        for repl in &self.repls {
            let name_start = repl.new_pos + 4;
            let name_end = name_start + repl.name_len;
            if patch.start >= name_start && patch.end <= name_end {
                let orig_name_start = repl.orig_pos + 1;
                let offset = patch.start - name_start;
                let len = patch.end - patch.start;
                return Patch {
                    start: orig_name_start + offset,
                    end: orig_name_start + offset + len,
                    text: patch.text,
                };
            }
            if name_end <= patch.start {
                preceding += 1;
            } else {
                break;
            }
        }
        let shift = preceding * REPL_GROWTH;
        Patch { start: patch.start - shift, end: patch.end - shift, text: patch.text }
    }
}

/// Which predicate flavor is being scanned; each recognizes a different set
/// of attribute roots.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PredicateKind {
    /// `rec.X`/`newRec.X`, `user.X`, `user.X.Y`.
    Acl,
    /// `rec.X`, `choice.X`.
    Dropdown,
    /// `rec.X`, `oldRec.X`.
    Trigger,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntityKind {
    RecCol,
    UserAttr,
    UserAttrCol,
    ChoiceAttr,
}

/// A named entity encountered in a predicate formula, which may get renamed.
#[derive(Clone, Debug, PartialEq)]
pub struct NamedEntity {
    pub kind: EntityKind,
    /// Byte offset of the name token in the dollar-rewritten text.
    pub pos: usize,
    pub name: String,
    /// Name of the user attribute, for UserAttrCol entities.
    pub extra: Option<String>,
}

/// Collect the named entities of a parse tree, in source order.
pub fn collect_entities(node: &ParseNode, pred: PredicateKind, out: &mut Vec<NamedEntity>) {
    match node {
        ParseNode::And(parts) | ParseNode::Or(parts) | ParseNode::List(parts) => {
            for part in parts {
                collect_entities(part, pred, out);
            }
        }
        ParseNode::BinOp { lhs, rhs, .. } | ParseNode::Compare { lhs, rhs, .. } => {
            collect_entities(lhs, pred, out);
            collect_entities(rhs, pred, out);
        }
        ParseNode::Not(operand) => collect_entities(operand, pred, out),
        ParseNode::Const(_) | ParseNode::Name { .. } => {}
        ParseNode::Attr { obj, name, pos } => {
            collect_entities(obj, pred, out);
            if let Some(entity) = classify_attr(obj, name, *pos, pred) {
                out.push(entity);
            }
        }
        ParseNode::Call { func, args, kwargs } => {
            collect_entities(func, pred, out);
            for arg in args {
                collect_entities(arg, pred, out);
            }
            for kwarg in kwargs {
                collect_entities(&kwarg.value, pred, out);
            }
        }
        ParseNode::Comment { node, .. } => collect_entities(node, pred, out),
    }
}

fn classify_attr(
    obj: &ParseNode,
    name: &str,
    pos: usize,
    pred: PredicateKind,
) -> Option<NamedEntity> {
    let root = match obj {
        ParseNode::Name { name, .. } => Some(name.as_str()),
        _ => None,
    };
    let entity = |kind, extra: Option<String>| {
        Some(NamedEntity { kind, pos, name: name.to_string(), extra })
    };
    match pred {
        PredicateKind::Acl => match root {
            Some("rec") | Some("newRec") => entity(EntityKind::RecCol, None),
            Some("user") => entity(EntityKind::UserAttr, None),
            _ => {
                // user.ATTR.COL: a column of the user attribute's lookup table.
                if let ParseNode::Attr { obj: inner, name: attr, .. } = obj {
                    if matches!(&**inner, ParseNode::Name { name, .. } if name == "user") {
                        return entity(EntityKind::UserAttrCol, Some(attr.clone()));
                    }
                }
                None
            }
        },
        PredicateKind::Dropdown => match root {
            Some("rec") => entity(EntityKind::RecCol, None),
            Some("choice") => entity(EntityKind::ChoiceAttr, None),
            _ => None,
        },
        PredicateKind::Trigger => match root {
            Some("rec") | Some("oldRec") => entity(EntityKind::RecCol, None),
            _ => None,
        },
    }
}

/// Rename entities in a predicate formula. The renamer returns the new name
/// for entities it wants to rename, or None. Syntactically invalid formulas
/// are returned unchanged; so is anything untouched, byte for byte.
pub fn process_renames<F>(formula: &str, pred: PredicateKind, renamer: F) -> String
where
    F: Fn(&NamedEntity) -> Option<String>,
{
    let replacer = replace_dollars(formula);
    let Ok(node) = parse_expression(replacer.text()) else {
        return formula.to_string();
    };
    let mut entities = Vec::new();
    collect_entities(&node, pred, &mut entities);

    let mut patches = Vec::new();
    for entity in &entities {
        if let Some(new_name) = renamer(entity) {
            patches.push(replacer.map_back_patch(Patch::new(
                entity.pos,
                entity.pos + entity.name.len(),
                new_name,
            )));
        }
    }
    if patches.is_empty() {
        return formula.to_string();
    }
    apply_patches(formula, patches)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rename_rec_col(formula: &str, old: &str, new: &str) -> String {
        process_renames(formula, PredicateKind::Acl, |e| {
            (e.kind == EntityKind::RecCol && e.name == old).then(|| new.to_string())
        })
    }

    #[test]
    fn test_rename_preserves_comment_and_whitespace() {
        let formula = "( rec.schoolName != # comment\n user.School.name)";
        let out = rename_rec_col(formula, "schoolName", "School_Name");
        assert_eq!(out, "( rec.School_Name != # comment\n user.School.name)");
    }

    #[test]
    fn test_rename_through_dollar_shortcut() {
        let out = rename_rec_col("$office == 'Seattle'", "office", "Location");
        assert_eq!(out, "$Location == 'Seattle'");
    }

    #[test]
    fn test_rename_skips_strings_and_unrelated_names() {
        let formula = "rec.office == 'office' and office == 1";
        let out = rename_rec_col(formula, "office", "x");
        assert_eq!(out, "rec.x == 'office' and office == 1");
    }

    #[test]
    fn test_invalid_formula_unchanged() {
        let formula = "rec.office ==";
        assert_eq!(rename_rec_col(formula, "office", "x"), formula);
    }

    #[test]
    fn test_user_attr_col_entities() {
        let mut entities = Vec::new();
        let node = parse_expression("user.School.name == rec.school").unwrap();
        collect_entities(&node, PredicateKind::Acl, &mut entities);
        let kinds: Vec<EntityKind> = entities.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EntityKind::UserAttr, EntityKind::UserAttrCol, EntityKind::RecCol]);
        assert_eq!(entities[1].extra.as_deref(), Some("School"));
    }

    #[test]
    fn test_rename_back_round_trips() {
        let formula = "( rec.schoolName != # comment\n user.School.name)";
        let there = rename_rec_col(formula, "schoolName", "School_Name");
        let back = rename_rec_col(&there, "School_Name", "schoolName");
        assert_eq!(back, formula);
    }

    #[test]
    fn test_multiple_dollar_renames() {
        let out = rename_rec_col("$a + $b + $a", "a", "alpha");
        assert_eq!(out, "$alpha + $b + $alpha");
    }
}

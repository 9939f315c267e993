//! The expression language shared by user formulas and predicate formulas
//! (access rules, dropdown conditions, trigger conditions).
//!
//! Text is lexed and parsed into a small tagged tree. Predicate consumers
//! serialize the tree to JSON arrays of the form `["Kind", ...children]`;
//! user formulas are compiled once per column and evaluated per row by
//! the traced interpreter in [`eval`].

mod lexer;
mod parser;
pub mod eval;
pub mod rename;

pub use lexer::{lex, SyntaxError, Token, TokenKind};
pub use parser::parse_expression;
pub use rename::{
    collect_entities, process_renames, replace_dollars, DollarReplacer, EntityKind, NamedEntity,
    PredicateKind,
};

use serde_json::json;

/// Binary arithmetic operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mult,
    Div,
    Mod,
}

impl BinOp {
    pub fn tag(self) -> &'static str {
        match self {
            BinOp::Add => "Add",
            BinOp::Sub => "Sub",
            BinOp::Mult => "Mult",
            BinOp::Div => "Div",
            BinOp::Mod => "Mod",
        }
    }
}

/// Comparison operators; chained comparisons are rejected at parse time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    NotEq,
    Lt,
    LtE,
    Gt,
    GtE,
    Is,
    IsNot,
    In,
    NotIn,
}

impl CmpOp {
    pub fn tag(self) -> &'static str {
        match self {
            CmpOp::Eq => "Eq",
            CmpOp::NotEq => "NotEq",
            CmpOp::Lt => "Lt",
            CmpOp::LtE => "LtE",
            CmpOp::Gt => "Gt",
            CmpOp::GtE => "GtE",
            CmpOp::Is => "Is",
            CmpOp::IsNot => "IsNot",
            CmpOp::In => "In",
            CmpOp::NotIn => "NotIn",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Literal {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

/// A keyword argument in a call, with the byte offset of its name token
/// (used by rename patching).
#[derive(Clone, Debug, PartialEq)]
pub struct Kwarg {
    pub name: String,
    pub pos: usize,
    pub value: ParseNode,
}

/// The tagged parse tree.
#[derive(Clone, Debug, PartialEq)]
pub enum ParseNode {
    And(Vec<ParseNode>),
    Or(Vec<ParseNode>),
    BinOp { op: BinOp, lhs: Box<ParseNode>, rhs: Box<ParseNode> },
    Not(Box<ParseNode>),
    Compare { op: CmpOp, lhs: Box<ParseNode>, rhs: Box<ParseNode> },
    List(Vec<ParseNode>),
    Const(Literal),
    Name { name: String, pos: usize },
    Attr { obj: Box<ParseNode>, name: String, pos: usize },
    Call { func: Box<ParseNode>, args: Vec<ParseNode>, kwargs: Vec<Kwarg> },
    /// A top-level expression with its trailing line comment.
    Comment { node: Box<ParseNode>, text: String },
}

impl ParseNode {
    /// The JSON form consumed by predicate interpreters:
    /// `["Kind", ...children]`, with call keywords appended as a trailing
    /// `["keywords", [name, value], ...]` group.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            ParseNode::And(parts) => tagged("And", parts),
            ParseNode::Or(parts) => tagged("Or", parts),
            ParseNode::BinOp { op, lhs, rhs } => {
                json!([op.tag(), lhs.to_json(), rhs.to_json()])
            }
            ParseNode::Not(operand) => json!(["Not", operand.to_json()]),
            ParseNode::Compare { op, lhs, rhs } => {
                json!([op.tag(), lhs.to_json(), rhs.to_json()])
            }
            ParseNode::List(items) => tagged("List", items),
            ParseNode::Const(lit) => {
                let value = match lit {
                    Literal::Null => serde_json::Value::Null,
                    Literal::Bool(b) => json!(b),
                    Literal::Int(i) => json!(i),
                    Literal::Float(f) => json!(f),
                    Literal::Str(s) => json!(s),
                };
                json!(["Const", value])
            }
            ParseNode::Name { name, .. } => json!(["Name", name]),
            ParseNode::Attr { obj, name, .. } => json!(["Attr", obj.to_json(), name]),
            ParseNode::Call { func, args, kwargs } => {
                let mut arr = vec![json!("Call"), func.to_json()];
                arr.extend(args.iter().map(ParseNode::to_json));
                if !kwargs.is_empty() {
                    let mut kw = vec![json!("keywords")];
                    kw.extend(kwargs.iter().map(|k| json!([k.name, k.value.to_json()])));
                    arr.push(serde_json::Value::Array(kw));
                }
                serde_json::Value::Array(arr)
            }
            ParseNode::Comment { node, text } => json!(["Comment", node.to_json(), text]),
        }
    }
}

fn tagged(tag: &str, parts: &[ParseNode]) -> serde_json::Value {
    let mut arr = vec![json!(tag)];
    arr.extend(parts.iter().map(ParseNode::to_json));
    serde_json::Value::Array(arr)
}

/// A formula compiled for evaluation: the rewritten source (with `$X`
/// expanded to `rec.X`) and its parse tree.
#[derive(Debug)]
pub struct CompiledFormula {
    /// Original formula text as the user wrote it.
    pub source: String,
    pub body: Result<ParseNode, SyntaxError>,
}

impl CompiledFormula {
    /// Compile a formula body. A syntactically invalid formula still
    /// compiles; evaluating it yields the parse error as the cell error.
    pub fn compile(source: &str) -> CompiledFormula {
        let replacer = replace_dollars(source);
        let body = parse_expression(replacer.text());
        CompiledFormula { source: source.to_string(), body }
    }
}

/// Parse a predicate formula to its JSON tree. The leading `$NAME` shortcut
/// is accepted; a trailing line comment wraps the result in a Comment node.
pub fn parse_predicate(formula: &str) -> Result<serde_json::Value, SyntaxError> {
    let replacer = replace_dollars(formula);
    let (tokens, comments) = lex(replacer.text())?;
    let node = parser::parse_tokens(&tokens, replacer.text())?;
    let node = match comments.first() {
        Some((_, text)) => {
            ParseNode::Comment { node: Box::new(node), text: text.trim().to_string() }
        }
        None => node,
    };
    Ok(node.to_json())
}

/// As `parse_predicate`, but stringifies the result and maps an empty
/// formula to the empty string.
pub fn parse_predicate_json(formula: &str) -> Result<String, SyntaxError> {
    if formula.trim().is_empty() {
        return Ok(String::new());
    }
    Ok(parse_predicate(formula)?.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tree(formula: &str) -> serde_json::Value {
        parse_predicate(formula).unwrap()
    }

    #[test]
    fn test_basic_predicates() {
        assert_eq!(
            tree("user.Email == 'X@'"),
            json!(["Eq", ["Attr", ["Name", "user"], "Email"], ["Const", "X@"]])
        );
        assert_eq!(
            tree("user.Role not in ('editors', 'owners')"),
            json!(["NotIn", ["Attr", ["Name", "user"], "Role"],
                   ["List", ["Const", "editors"], ["Const", "owners"]]])
        );
        assert_eq!(
            tree("rec.office == 'Seattle' and user.email in ['sally@', 'xie@']"),
            json!(["And",
                   ["Eq", ["Attr", ["Name", "rec"], "office"], ["Const", "Seattle"]],
                   ["In", ["Attr", ["Name", "user"], "email"],
                    ["List", ["Const", "sally@"], ["Const", "xie@"]]]])
        );
    }

    #[test]
    fn test_dollar_shortcut() {
        assert_eq!(
            tree("$office == 'Seattle'"),
            json!(["Eq", ["Attr", ["Name", "rec"], "office"], ["Const", "Seattle"]])
        );
    }

    #[test]
    fn test_named_constants_and_arithmetic() {
        assert_eq!(
            tree("rec.assigned is None"),
            json!(["Is", ["Attr", ["Name", "rec"], "assigned"], ["Const", null]])
        );
        assert_eq!(
            tree("r.A <= n.A + 1"),
            json!(["LtE", ["Attr", ["Name", "r"], "A"],
                   ["Add", ["Attr", ["Name", "n"], "A"], ["Const", 1]]])
        );
        assert_eq!(
            tree("not user.IsAdmin or True"),
            json!(["Or", ["Not", ["Attr", ["Name", "user"], "IsAdmin"]], ["Const", true]])
        );
    }

    #[test]
    fn test_call_with_keywords() {
        assert_eq!(
            tree("foo(a, b=2)"),
            json!(["Call", ["Name", "foo"], ["Name", "a"],
                   ["keywords", ["b", ["Const", 2]]]])
        );
    }

    #[test]
    fn test_comment_wraps_top_level() {
        assert_eq!(
            tree("rec.x  # note\n == 1"),
            json!(["Comment",
                   ["Eq", ["Attr", ["Name", "rec"], "x"], ["Const", 1]],
                   "note"])
        );
    }

    #[test]
    fn test_chained_comparison_rejected() {
        let err = parse_predicate("1 < x < 3").unwrap_err();
        assert!(err.message.contains("chained comparisons"));
    }

    #[test]
    fn test_syntax_error_has_position() {
        let err = parse_predicate("rec. == 3").unwrap_err();
        assert_eq!(err.line, 1);
        assert!(err.col > 0);
    }

    #[test]
    fn test_empty_predicate_json() {
        assert_eq!(parse_predicate_json("  ").unwrap(), "");
    }
}

//! Traced formula evaluation.
//!
//! The interpreter walks a compiled parse tree in the context of the
//! engine's current evaluation frame. Every read of `rec.X` or
//! `Table.lookupRecords(...)` goes through the engine, which registers the
//! dependency edge with the appropriate composed relation; the returned
//! Record/RecordSet values carry their source relation so downstream
//! attribute access composes correctly.

use std::rc::Rc;

use crate::engine::Engine;
use crate::sort_key::SortSpec;
use crate::table::{Record, RecordSet, Table};
use crate::value::{compare_values, ColType, RaisedException, Value};

use super::{BinOp, CmpOp, Literal, ParseNode};

/// Runtime values of the interpreter: plain cell values plus the richer
/// objects formulas manipulate before a result lands in a cell.
pub enum EvalValue {
    Val(Value),
    Rec(Record),
    RecSet(RecordSet),
    TableRef(Rc<Table>),
    Func(Builtin),
    Method { table: Rc<Table>, kind: LookupKind },
    ListV(Vec<EvalValue>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Builtin {
    Len,
    Sum,
    Min,
    Max,
    Str,
    Int,
    Float,
    Bool,
    Abs,
    Raise,
    Request,
    SetAutoRemove,
}

/// Names resolvable as builtin functions, also served to autocomplete.
pub const BUILTIN_NAMES: &[&str] = &[
    "len", "sum", "min", "max", "str", "int", "float", "bool", "abs",
    "RAISE", "REQUEST", "setAutoRemove",
];

/// Table methods, also served to autocomplete.
pub const LOOKUP_METHOD_NAMES: &[&str] = &["lookupRecords", "lookupOne", "lookupOrAddDerived"];

#[derive(Clone, Copy, Debug)]
pub enum LookupKind {
    Records,
    One,
    OrAddDerived,
}

type EvalResult = Result<EvalValue, RaisedException>;

fn builtin_named(name: &str) -> Option<Builtin> {
    Some(match name {
        "len" => Builtin::Len,
        "sum" => Builtin::Sum,
        "min" => Builtin::Min,
        "max" => Builtin::Max,
        "str" => Builtin::Str,
        "int" => Builtin::Int,
        "float" => Builtin::Float,
        "bool" => Builtin::Bool,
        "abs" => Builtin::Abs,
        "RAISE" => Builtin::Raise,
        "REQUEST" => Builtin::Request,
        "setAutoRemove" => Builtin::SetAutoRemove,
        _ => return None,
    })
}

fn err(kind: &str, message: impl Into<String>) -> RaisedException {
    RaisedException::new(kind, message)
}

/// Evaluate a parse tree in the engine's current frame.
pub fn evaluate(engine: &Engine, node: &ParseNode) -> EvalResult {
    match node {
        ParseNode::Const(lit) => Ok(EvalValue::Val(match lit {
            Literal::Null => Value::Null,
            Literal::Bool(b) => Value::Bool(*b),
            Literal::Int(i) => Value::Int(*i),
            Literal::Float(f) => Value::Num(*f),
            Literal::Str(s) => Value::Text(s.clone()),
        })),
        ParseNode::Name { name, .. } => resolve_name(engine, name),
        ParseNode::And(parts) => {
            let mut last = EvalValue::Val(Value::Bool(true));
            for part in parts {
                last = evaluate(engine, part)?;
                if !is_truthy(&last) {
                    return Ok(last);
                }
            }
            Ok(last)
        }
        ParseNode::Or(parts) => {
            let mut last = EvalValue::Val(Value::Bool(false));
            for part in parts {
                last = evaluate(engine, part)?;
                if is_truthy(&last) {
                    return Ok(last);
                }
            }
            Ok(last)
        }
        ParseNode::Not(operand) => {
            let value = evaluate(engine, operand)?;
            Ok(EvalValue::Val(Value::Bool(!is_truthy(&value))))
        }
        ParseNode::BinOp { op, lhs, rhs } => {
            let lhs = evaluate(engine, lhs)?;
            let rhs = evaluate(engine, rhs)?;
            binop(*op, lhs, rhs)
        }
        ParseNode::Compare { op, lhs, rhs } => {
            let lhs = evaluate(engine, lhs)?;
            let rhs = evaluate(engine, rhs)?;
            compare(*op, lhs, rhs)
        }
        ParseNode::List(items) => {
            let values: Result<Vec<EvalValue>, RaisedException> =
                items.iter().map(|item| evaluate(engine, item)).collect();
            Ok(EvalValue::ListV(values?))
        }
        ParseNode::Attr { obj, name, .. } => {
            let obj = evaluate(engine, obj)?;
            attr(engine, obj, name)
        }
        ParseNode::Call { func, args, kwargs } => {
            let func = evaluate(engine, func)?;
            call(engine, func, args, kwargs)
        }
        ParseNode::Comment { node, .. } => evaluate(engine, node),
    }
}

fn resolve_name(engine: &Engine, name: &str) -> EvalResult {
    if name == "rec" {
        let Some(frame) = engine.current_frame() else {
            return Err(err("NameError", "rec is only available in a formula"));
        };
        let Some(table) = engine.table(&frame.node.table_id) else {
            return Err(err("NameError", "rec is only available in a formula"));
        };
        return Ok(EvalValue::Rec(Record { table, row_id: frame.row_id, rel: frame.rel }));
    }
    if let Some(builtin) = builtin_named(name) {
        return Ok(EvalValue::Func(builtin));
    }
    if let Some(table) = engine.table(name) {
        return Ok(EvalValue::TableRef(table));
    }
    Err(err("NameError", format!("name '{}' is not defined", name)))
}

fn attr(engine: &Engine, obj: EvalValue, name: &str) -> EvalResult {
    match obj {
        EvalValue::Rec(rec) => {
            if name == "id" {
                return Ok(EvalValue::Val(Value::Int(rec.row_id)));
            }
            if !rec.table.has_column(name) {
                return Err(err(
                    "AttributeError",
                    format!("{} has no column '{}'", rec.table.table_id(), name),
                ));
            }
            let value = engine.read_cell_traced(&rec.table, name, rec.row_id, &rec.rel)?;
            Ok(wrap_cell_value(engine, &rec.table, name, value, &rec.rel))
        }
        EvalValue::RecSet(set) => {
            if name == "id" {
                return Ok(EvalValue::ListV(
                    set.row_ids.iter().map(|&r| EvalValue::Val(Value::Int(r))).collect(),
                ));
            }
            if !set.table.has_column(name) {
                return Err(err(
                    "AttributeError",
                    format!("{} has no column '{}'", set.table.table_id(), name),
                ));
            }
            let mut out = Vec::with_capacity(set.row_ids.len());
            for &row_id in &set.row_ids {
                let value = engine.read_cell_traced(&set.table, name, row_id, &set.rel)?;
                out.push(wrap_cell_value(engine, &set.table, name, value, &set.rel));
            }
            Ok(EvalValue::ListV(out))
        }
        EvalValue::TableRef(table) => {
            let kind = match name {
                "lookupRecords" => LookupKind::Records,
                "lookupOne" => LookupKind::One,
                "lookupOrAddDerived" => LookupKind::OrAddDerived,
                _ => {
                    return Err(err(
                        "AttributeError",
                        format!("table {} has no attribute '{}'", table.table_id(), name),
                    ));
                }
            };
            Ok(EvalValue::Method { table, kind })
        }
        other => Err(err(
            "AttributeError",
            format!("{} has no attribute '{}'", type_name(&other), name),
        )),
    }
}

/// Wrap a raw cell value by column type: references come back as Records
/// (or RecordSets), carrying the read's relation composed with the
/// reference relation so further attribute access traces correctly.
fn wrap_cell_value(
    engine: &Engine,
    table: &Rc<Table>,
    col_id: &str,
    value: Value,
    rel: &crate::relation::RelationHandle,
) -> EvalValue {
    let Some(column) = table.get_column(col_id) else {
        return EvalValue::Val(value);
    };
    let target_table = match column.col_type() {
        ColType::Ref(target) | ColType::RefList(target) => engine.table(&target),
        _ => None,
    };
    let (Some(target), Some(ref_rel)) = (target_table, column.ref_rel()) else {
        return EvalValue::Val(value);
    };
    match value {
        Value::Ref(row_id) => EvalValue::Rec(Record {
            table: target,
            row_id,
            rel: rel.compose(&ref_rel),
        }),
        Value::RefList(row_ids) => EvalValue::RecSet(RecordSet {
            table: target,
            row_ids,
            rel: rel.compose(&ref_rel),
        }),
        other => EvalValue::Val(other),
    }
}

fn call(
    engine: &Engine,
    func: EvalValue,
    args: &[ParseNode],
    kwargs: &[super::Kwarg],
) -> EvalResult {
    match func {
        EvalValue::Func(builtin) => {
            if !kwargs.is_empty() {
                return Err(err("TypeError", "unexpected keyword argument"));
            }
            let values: Result<Vec<EvalValue>, RaisedException> =
                args.iter().map(|a| evaluate(engine, a)).collect();
            call_builtin(engine, builtin, values?)
        }
        EvalValue::Method { table, kind } => {
            if !args.is_empty() {
                return Err(err("TypeError", "lookup methods take keyword arguments only"));
            }
            let mut pairs = Vec::new();
            let mut sort_spec = None;
            for kwarg in kwargs {
                let value = to_plain_value(evaluate(engine, &kwarg.value)?);
                if kwarg.name == "order_by" {
                    sort_spec = SortSpec::parse_value(&value);
                } else {
                    pairs.push((kwarg.name.clone(), value));
                }
            }
            match kind {
                LookupKind::Records => {
                    Ok(EvalValue::RecSet(engine.do_lookup(&table, pairs, sort_spec)?))
                }
                LookupKind::One => {
                    let found = engine.do_lookup(&table, pairs, sort_spec)?;
                    Ok(EvalValue::Rec(found.get_one()))
                }
                LookupKind::OrAddDerived => {
                    Ok(EvalValue::Rec(engine.lookup_or_add_derived(&table, pairs)?))
                }
            }
        }
        other => Err(err("TypeError", format!("{} is not callable", type_name(&other)))),
    }
}

fn call_builtin(engine: &Engine, builtin: Builtin, mut args: Vec<EvalValue>) -> EvalResult {
    match builtin {
        Builtin::Len => {
            let arg = one_arg(args, "len")?;
            let n = match &arg {
                EvalValue::RecSet(set) => set.row_ids.len(),
                EvalValue::ListV(items) => items.len(),
                EvalValue::Val(Value::Text(s)) => s.chars().count(),
                EvalValue::Val(Value::List(items)) => items.len(),
                EvalValue::Val(Value::RefList(ids)) => ids.len(),
                _ => return Err(err("TypeError", "object has no len()")),
            };
            Ok(EvalValue::Val(Value::Int(n as i64)))
        }
        Builtin::Sum => {
            let arg = one_arg(args, "sum")?;
            let mut int_total: i64 = 0;
            let mut float_total = 0.0;
            let mut any_float = false;
            for value in iterate(arg)? {
                match value {
                    Value::Int(i) => int_total = int_total.wrapping_add(i),
                    Value::Bool(b) => int_total = int_total.wrapping_add(b as i64),
                    Value::Num(f) => {
                        any_float = true;
                        float_total += f;
                    }
                    Value::Null => {}
                    other => {
                        return Err(err(
                            "TypeError",
                            format!("unsupported operand for sum: {}", other.to_text()),
                        ));
                    }
                }
            }
            if any_float {
                Ok(EvalValue::Val(Value::Num(float_total + int_total as f64)))
            } else {
                Ok(EvalValue::Val(Value::Int(int_total)))
            }
        }
        Builtin::Min | Builtin::Max => {
            let items = if args.len() == 1 { iterate(args.remove(0))? } else {
                args.into_iter().map(to_plain_value).collect()
            };
            if items.is_empty() {
                return Err(err("ValueError", "min()/max() of empty sequence"));
            }
            let best = items
                .into_iter()
                .reduce(|a, b| {
                    let keep_a = match builtin {
                        Builtin::Min => compare_values(&a, &b) != std::cmp::Ordering::Greater,
                        _ => compare_values(&a, &b) != std::cmp::Ordering::Less,
                    };
                    if keep_a { a } else { b }
                })
                .unwrap();
            Ok(EvalValue::Val(best))
        }
        Builtin::Str => {
            let arg = one_arg(args, "str")?;
            Ok(EvalValue::Val(Value::Text(to_plain_value(arg).to_text())))
        }
        Builtin::Int => {
            let arg = to_plain_value(one_arg(args, "int")?);
            match crate::value::convert_value(arg, &ColType::Int) {
                Value::Int(i) => Ok(EvalValue::Val(Value::Int(i))),
                other => Err(err("ValueError", format!("invalid int: {}", other.to_text()))),
            }
        }
        Builtin::Float => {
            let arg = to_plain_value(one_arg(args, "float")?);
            match crate::value::convert_value(arg, &ColType::Numeric) {
                Value::Num(f) => Ok(EvalValue::Val(Value::Num(f))),
                other => Err(err("ValueError", format!("invalid float: {}", other.to_text()))),
            }
        }
        Builtin::Bool => {
            let arg = one_arg(args, "bool")?;
            Ok(EvalValue::Val(Value::Bool(is_truthy(&arg))))
        }
        Builtin::Abs => {
            let arg = to_plain_value(one_arg(args, "abs")?);
            match arg {
                Value::Int(i) => Ok(EvalValue::Val(Value::Int(i.abs()))),
                Value::Num(f) => Ok(EvalValue::Val(Value::Num(f.abs()))),
                other => Err(err("TypeError", format!("bad operand for abs: {}", other.to_text()))),
            }
        }
        Builtin::Raise => {
            let message = args
                .first()
                .map(|a| match a {
                    EvalValue::Val(v) => v.to_text(),
                    _ => "error".to_string(),
                })
                .unwrap_or_else(|| "error".to_string());
            Err(err("Exception", message))
        }
        Builtin::Request => {
            let parts: Vec<serde_json::Value> =
                args.into_iter().map(|a| to_plain_value(a).to_repr()).collect();
            let response = engine.request_value(serde_json::Value::Array(parts))?;
            Ok(EvalValue::Val(response))
        }
        Builtin::SetAutoRemove => {
            if args.len() != 2 {
                return Err(err("TypeError", "setAutoRemove takes a record and a flag"));
            }
            let flag = is_truthy(&args[1]);
            let EvalValue::Rec(rec) = &args[0] else {
                return Err(err("TypeError", "setAutoRemove takes a record and a flag"));
            };
            engine.set_auto_remove(&rec.table.table_id(), rec.row_id, flag);
            Ok(EvalValue::Val(Value::Null))
        }
    }
}

fn one_arg(mut args: Vec<EvalValue>, name: &str) -> Result<EvalValue, RaisedException> {
    if args.len() != 1 {
        return Err(err("TypeError", format!("{}() takes exactly one argument", name)));
    }
    Ok(args.remove(0))
}

/// Expand an argument into plain values for aggregation.
fn iterate(arg: EvalValue) -> Result<Vec<Value>, RaisedException> {
    match arg {
        EvalValue::ListV(items) => Ok(items.into_iter().map(to_plain_value).collect()),
        EvalValue::RecSet(set) => {
            Ok(set.row_ids.into_iter().map(Value::Ref).collect())
        }
        EvalValue::Val(Value::List(items)) => Ok(items),
        EvalValue::Val(Value::RefList(ids)) => Ok(ids.into_iter().map(Value::Ref).collect()),
        _ => Err(err("TypeError", "object is not iterable")),
    }
}

fn binop(op: BinOp, lhs: EvalValue, rhs: EvalValue) -> EvalResult {
    let a = to_plain_value(lhs);
    let b = to_plain_value(rhs);
    // Text concatenation and list concatenation.
    if op == BinOp::Add {
        if let (Value::Text(x), Value::Text(y)) = (&a, &b) {
            return Ok(EvalValue::Val(Value::Text(format!("{}{}", x, y))));
        }
        if let (Value::List(x), Value::List(y)) = (&a, &b) {
            let mut out = x.clone();
            out.extend(y.iter().cloned());
            return Ok(EvalValue::Val(Value::List(out)));
        }
    }
    let type_err = || {
        err("TypeError", format!(
            "unsupported operand types: {} {} {}", a.to_text(), op.tag(), b.to_text()
        ))
    };
    let (x, y) = match (numeric(&a), numeric(&b)) {
        (Some(x), Some(y)) => (x, y),
        _ => return Err(type_err()),
    };
    if let (Value::Int(i), Value::Int(j)) = (&a, &b) {
        // Integer arithmetic stays integral except for division.
        match op {
            BinOp::Add => return ok_int(i.checked_add(*j), x + y),
            BinOp::Sub => return ok_int(i.checked_sub(*j), x - y),
            BinOp::Mult => return ok_int(i.checked_mul(*j), x * y),
            BinOp::Mod => {
                if *j == 0 {
                    return Err(err("ZeroDivisionError", "modulo by zero"));
                }
                return Ok(EvalValue::Val(Value::Int(i.rem_euclid(*j))));
            }
            BinOp::Div => {}
        }
    }
    let result = match op {
        BinOp::Add => x + y,
        BinOp::Sub => x - y,
        BinOp::Mult => x * y,
        BinOp::Div => {
            if y == 0.0 {
                return Err(err("ZeroDivisionError", "division by zero"));
            }
            x / y
        }
        BinOp::Mod => {
            if y == 0.0 {
                return Err(err("ZeroDivisionError", "modulo by zero"));
            }
            x.rem_euclid(y)
        }
    };
    Ok(EvalValue::Val(Value::Num(result)))
}

fn ok_int(exact: Option<i64>, approx: f64) -> EvalResult {
    Ok(EvalValue::Val(match exact {
        Some(i) => Value::Int(i),
        None => Value::Num(approx),
    }))
}

fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Bool(b) => Some(*b as i64 as f64),
        Value::Int(i) => Some(*i as f64),
        Value::Num(f) => Some(*f),
        _ => None,
    }
}

fn compare(op: CmpOp, lhs: EvalValue, rhs: EvalValue) -> EvalResult {
    let result = match op {
        CmpOp::Eq => values_equal(&to_plain_value(lhs), &to_plain_value(rhs)),
        CmpOp::NotEq => !values_equal(&to_plain_value(lhs), &to_plain_value(rhs)),
        CmpOp::Lt | CmpOp::LtE | CmpOp::Gt | CmpOp::GtE => {
            let ord = compare_values(&to_plain_value(lhs), &to_plain_value(rhs));
            match op {
                CmpOp::Lt => ord == std::cmp::Ordering::Less,
                CmpOp::LtE => ord != std::cmp::Ordering::Greater,
                CmpOp::Gt => ord == std::cmp::Ordering::Greater,
                _ => ord != std::cmp::Ordering::Less,
            }
        }
        CmpOp::Is | CmpOp::IsNot => {
            let same = identical(&to_plain_value(lhs), &to_plain_value(rhs));
            if matches!(op, CmpOp::Is) { same } else { !same }
        }
        CmpOp::In | CmpOp::NotIn => {
            let found = contains(rhs, &to_plain_value(lhs))?;
            if matches!(op, CmpOp::In) { found } else { !found }
        }
    };
    Ok(EvalValue::Val(Value::Bool(result)))
}

fn values_equal(a: &Value, b: &Value) -> bool {
    if let (Some(x), Some(y)) = (numeric(a), numeric(b)) {
        return x == y;
    }
    match (a, b) {
        (Value::Text(x), Value::AltText(y)) | (Value::AltText(x), Value::Text(y)) => x == y,
        _ => a == b,
    }
}

/// Identity semantics, used only for None/bool checks in practice.
fn identical(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        _ => false,
    }
}

fn contains(hay: EvalValue, needle: &Value) -> Result<bool, RaisedException> {
    match hay {
        EvalValue::ListV(items) => {
            Ok(items.into_iter().any(|item| values_equal(&to_plain_value(item), needle)))
        }
        EvalValue::RecSet(set) => {
            let id = needle.as_row_id();
            Ok(id != 0 && set.row_ids.contains(&id))
        }
        EvalValue::Val(Value::List(items)) => {
            Ok(items.iter().any(|item| values_equal(item, needle)))
        }
        EvalValue::Val(Value::RefList(ids)) => Ok(ids.contains(&needle.as_row_id())),
        EvalValue::Val(Value::Text(s)) => match needle {
            Value::Text(sub) => Ok(s.contains(sub.as_str())),
            _ => Err(err("TypeError", "'in' requires a string on the left")),
        },
        _ => Err(err("TypeError", "argument of 'in' is not iterable")),
    }
}

fn is_truthy(value: &EvalValue) -> bool {
    match value {
        EvalValue::Val(v) => v.is_truthy(),
        EvalValue::Rec(rec) => rec.row_id != 0,
        EvalValue::RecSet(set) => !set.row_ids.is_empty(),
        EvalValue::ListV(items) => !items.is_empty(),
        EvalValue::TableRef(_) | EvalValue::Func(_) | EvalValue::Method { .. } => true,
    }
}

fn type_name(value: &EvalValue) -> &'static str {
    match value {
        EvalValue::Val(Value::Null) => "None",
        EvalValue::Val(Value::Text(_)) | EvalValue::Val(Value::AltText(_)) => "a string",
        EvalValue::Val(_) => "this value",
        EvalValue::Rec(_) => "a record",
        EvalValue::RecSet(_) => "a record set",
        EvalValue::TableRef(_) => "a table",
        EvalValue::Func(_) => "a function",
        EvalValue::Method { .. } => "a lookup method",
        EvalValue::ListV(_) => "a list",
    }
}

/// Collapse a runtime value to a plain cell value (records become row ids).
pub fn to_plain_value(value: EvalValue) -> Value {
    match value {
        EvalValue::Val(v) => v,
        EvalValue::Rec(rec) => Value::Ref(rec.row_id),
        EvalValue::RecSet(set) => Value::RefList(set.row_ids),
        EvalValue::ListV(items) => {
            Value::List(items.into_iter().map(to_plain_value).collect())
        }
        EvalValue::TableRef(_) | EvalValue::Func(_) | EvalValue::Method { .. } => {
            Value::Error(Box::new(err("TypeError", "cannot store this object in a cell")))
        }
    }
}

/// The value stored into the cell after evaluation.
pub fn to_cell_value(value: EvalValue) -> Value {
    to_plain_value(value)
}

/// Attach a short friendly explanation to common formula errors.
pub fn friendly_message(engine: &Engine, table: &Rc<Table>, exc: &RaisedException) -> String {
    if exc.kind != "AttributeError" && exc.kind != "NameError" {
        return exc.message.clone();
    }
    // Suggest an existing column or table whose name differs only by case.
    let wanted = exc
        .message
        .rsplit('\'')
        .nth(1)
        .unwrap_or("")
        .to_ascii_lowercase();
    if wanted.is_empty() {
        return exc.message.clone();
    }
    let mut candidates: Vec<String> = table
        .column_ids()
        .into_iter()
        .filter(|c| c.to_ascii_lowercase() == wanted)
        .collect();
    candidates.extend(
        engine.table_ids().into_iter().filter(|t| t.to_ascii_lowercase() == wanted),
    );
    match candidates.first() {
        Some(suggestion) => format!("{} (did you mean '{}'?)", exc.message, suggestion),
        None => exc.message.clone(),
    }
}

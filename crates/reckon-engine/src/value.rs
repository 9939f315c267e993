//! Cell values and column types.
//!
//! `Value` is the single in-memory representation for everything a cell can
//! hold, across all column types. Conversions between `Value` and the
//! host-facing JSON representation live here too, as does the hash
//! normalization used by lookup indexes.

use std::cmp::Ordering;

use chrono::{Datelike, NaiveDate};
use serde_json::json;

/// Stable row identifier. Row id 0 is the "no such record" sentinel.
pub type RowId = i64;

/// An error raised by a formula, stored in the cell as data.
#[derive(Clone, Debug, PartialEq)]
pub struct RaisedException {
    /// Error kind, e.g. "Exception", "CircularReference", "AttributeError".
    pub kind: String,
    pub message: String,
}

impl RaisedException {
    pub fn new(kind: &str, message: impl Into<String>) -> Self {
        RaisedException { kind: kind.to_string(), message: message.into() }
    }

    pub fn circular() -> Self {
        RaisedException::new("CircularReference", "Circular reference")
    }
}

impl std::fmt::Display for RaisedException {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// A single cell value.
#[derive(Clone, Debug, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Num(f64),
    Text(String),
    Date(NaiveDate),
    /// Seconds since the epoch, plus an IANA zone name kept for rendering.
    DateTime(i64, String),
    Ref(RowId),
    RefList(Vec<RowId>),
    List(Vec<Value>),
    /// A string stored in a typed column because it could not be converted.
    /// Compares equal only to the same string; formulas observe the raw text.
    AltText(String),
    Error(Box<RaisedException>),
}

impl Value {
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Num(f) => *f != 0.0,
            Value::Text(s) | Value::AltText(s) => !s.is_empty(),
            Value::Date(_) | Value::DateTime(_, _) => true,
            Value::Ref(r) => *r != 0,
            Value::RefList(l) => !l.is_empty(),
            Value::List(l) => !l.is_empty(),
            Value::Error(_) => true,
        }
    }

    pub fn as_row_id(&self) -> RowId {
        match self {
            Value::Ref(r) => *r,
            Value::Int(i) => *i,
            _ => 0,
        }
    }

    /// Host-facing representation, used in document actions and fetch results.
    pub fn to_repr(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => json!(b),
            Value::Int(i) => json!(i),
            Value::Num(f) => json!(f),
            Value::Text(s) | Value::AltText(s) => json!(s),
            Value::Date(d) => json!(d.format("%Y-%m-%d").to_string()),
            Value::DateTime(ts, zone) => json!(["D", ts, zone]),
            Value::Ref(r) => json!(r),
            Value::RefList(l) => {
                let mut arr = vec![json!("L")];
                arr.extend(l.iter().map(|r| json!(r)));
                serde_json::Value::Array(arr)
            }
            Value::List(l) => {
                let mut arr = vec![json!("l")];
                arr.extend(l.iter().map(Value::to_repr));
                serde_json::Value::Array(arr)
            }
            Value::Error(e) => json!(["E", e.kind, e.message]),
        }
    }

    /// Decode a host-supplied representation. The result is still untyped;
    /// `convert_value` applies the owning column's type.
    pub fn from_repr(repr: &serde_json::Value) -> Value {
        match repr {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Num(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Value::Text(s.clone()),
            serde_json::Value::Array(arr) => Self::from_tagged_array(arr),
            serde_json::Value::Object(_) => Value::Null,
        }
    }

    fn from_tagged_array(arr: &[serde_json::Value]) -> Value {
        match arr.first().and_then(|v| v.as_str()) {
            Some("L") => Value::RefList(
                arr[1..].iter().filter_map(|v| v.as_i64()).collect(),
            ),
            Some("l") => Value::List(arr[1..].iter().map(Value::from_repr).collect()),
            Some("D") => {
                let ts = arr.get(1).and_then(|v| v.as_i64()).unwrap_or(0);
                let zone = arr.get(2).and_then(|v| v.as_str()).unwrap_or("UTC");
                Value::DateTime(ts, zone.to_string())
            }
            Some("E") => {
                let kind = arr.get(1).and_then(|v| v.as_str()).unwrap_or("Exception");
                let message = arr.get(2).and_then(|v| v.as_str()).unwrap_or("");
                Value::Error(Box::new(RaisedException::new(kind, message)))
            }
            _ => Value::List(arr.iter().map(Value::from_repr).collect()),
        }
    }

    /// Short rendering used in error messages and AltText fallbacks.
    pub fn to_text(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Num(f) => f.to_string(),
            Value::Text(s) | Value::AltText(s) => s.clone(),
            Value::Date(d) => d.format("%Y-%m-%d").to_string(),
            Value::DateTime(ts, zone) => format!("{} {}", ts, zone),
            Value::Ref(r) => r.to_string(),
            Value::RefList(l) => format!("{:?}", l),
            Value::List(l) => {
                let parts: Vec<String> = l.iter().map(Value::to_text).collect();
                format!("[{}]", parts.join(", "))
            }
            Value::Error(e) => e.to_string(),
        }
    }
}

/// Logical column types.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ColType {
    Text,
    Int,
    Numeric,
    Bool,
    Date,
    DateTime(String),
    Choice,
    ChoiceList,
    Ref(String),
    RefList(String),
    Attachments,
    Any,
}

impl ColType {
    /// Parse the stored type string, e.g. "Ref:Students" or "DateTime:UTC".
    pub fn parse(s: &str) -> ColType {
        let (head, arg) = match s.split_once(':') {
            Some((h, a)) => (h, Some(a)),
            None => (s, None),
        };
        match head {
            "Text" => ColType::Text,
            "Int" => ColType::Int,
            "Numeric" => ColType::Numeric,
            "Bool" => ColType::Bool,
            "Date" => ColType::Date,
            "DateTime" => ColType::DateTime(arg.unwrap_or("UTC").to_string()),
            "Choice" => ColType::Choice,
            "ChoiceList" => ColType::ChoiceList,
            "Ref" => ColType::Ref(arg.unwrap_or("").to_string()),
            "RefList" => ColType::RefList(arg.unwrap_or("").to_string()),
            "Attachments" => ColType::Attachments,
            _ => ColType::Any,
        }
    }

    pub fn as_string(&self) -> String {
        match self {
            ColType::Text => "Text".to_string(),
            ColType::Int => "Int".to_string(),
            ColType::Numeric => "Numeric".to_string(),
            ColType::Bool => "Bool".to_string(),
            ColType::Date => "Date".to_string(),
            ColType::DateTime(zone) => format!("DateTime:{}", zone),
            ColType::Choice => "Choice".to_string(),
            ColType::ChoiceList => "ChoiceList".to_string(),
            ColType::Ref(t) => format!("Ref:{}", t),
            ColType::RefList(t) => format!("RefList:{}", t),
            ColType::Attachments => "Attachments".to_string(),
            ColType::Any => "Any".to_string(),
        }
    }

    /// The value read at row 0 and the fill for missing fields.
    pub fn default_value(&self) -> Value {
        match self {
            ColType::Text | ColType::Choice => Value::Text(String::new()),
            ColType::Int => Value::Int(0),
            ColType::Numeric => Value::Num(0.0),
            ColType::Bool => Value::Bool(false),
            ColType::Date | ColType::DateTime(_) => Value::Null,
            ColType::ChoiceList => Value::List(Vec::new()),
            ColType::Ref(_) => Value::Ref(0),
            ColType::RefList(_) | ColType::Attachments => Value::RefList(Vec::new()),
            ColType::Any => Value::Null,
        }
    }

    /// The table a Ref/RefList column points at, if any.
    pub fn ref_target(&self) -> Option<&str> {
        match self {
            ColType::Ref(t) | ColType::RefList(t) => Some(t.as_str()),
            _ => None,
        }
    }
}

/// Convert a value for storage in a column of the given type. Inconvertible
/// values become `AltText` of their text rendering.
pub fn convert_value(value: Value, col_type: &ColType) -> Value {
    if matches!(value, Value::Null | Value::Error(_)) {
        return value;
    }
    match col_type {
        ColType::Any => value,
        ColType::Text | ColType::Choice => match value {
            Value::Text(_) => value,
            Value::AltText(s) => Value::Text(s),
            other => Value::Text(other.to_text()),
        },
        ColType::Int => match value {
            Value::Int(_) => value,
            Value::Num(f) if f.fract() == 0.0 => Value::Int(f as i64),
            Value::Bool(b) => Value::Int(b as i64),
            Value::Text(ref s) | Value::AltText(ref s) => match s.trim().parse::<i64>() {
                Ok(i) => Value::Int(i),
                Err(_) => alt_text(value),
            },
            other => alt_text(other),
        },
        ColType::Numeric => match value {
            Value::Num(_) => value,
            Value::Int(i) => Value::Num(i as f64),
            Value::Bool(b) => Value::Num(b as i64 as f64),
            Value::Text(ref s) | Value::AltText(ref s) => match s.trim().parse::<f64>() {
                Ok(f) => Value::Num(f),
                Err(_) => alt_text(value),
            },
            other => alt_text(other),
        },
        ColType::Bool => match value {
            Value::Bool(_) => value,
            Value::Int(i) => Value::Bool(i != 0),
            Value::Num(f) => Value::Bool(f != 0.0),
            Value::Text(ref s) | Value::AltText(ref s) => match s.trim() {
                "true" | "True" => Value::Bool(true),
                "false" | "False" => Value::Bool(false),
                _ => alt_text(value),
            },
            other => alt_text(other),
        },
        ColType::Date => match value {
            Value::Date(_) => value,
            Value::Text(ref s) | Value::AltText(ref s) => {
                match NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d") {
                    Ok(d) => Value::Date(d),
                    Err(_) => alt_text(value),
                }
            }
            other => alt_text(other),
        },
        ColType::DateTime(zone) => match value {
            Value::DateTime(_, _) => value,
            Value::Int(ts) => Value::DateTime(ts, zone.clone()),
            Value::Num(ts) => Value::DateTime(ts as i64, zone.clone()),
            other => alt_text(other),
        },
        ColType::ChoiceList => match value {
            Value::List(_) => value,
            Value::Text(s) => Value::List(vec![Value::Text(s)]),
            other => alt_text(other),
        },
        ColType::Ref(_) => match value {
            Value::Ref(_) => value,
            Value::Int(i) if i >= 0 => Value::Ref(i),
            Value::Num(f) if f.fract() == 0.0 && f >= 0.0 => Value::Ref(f as i64),
            other => alt_text(other),
        },
        ColType::RefList(_) | ColType::Attachments => match value {
            Value::RefList(mut ids) => {
                ids.sort_unstable();
                ids.dedup();
                Value::RefList(ids)
            }
            Value::List(items) => {
                let mut ids: Vec<RowId> =
                    items.iter().map(Value::as_row_id).filter(|r| *r != 0).collect();
                ids.sort_unstable();
                ids.dedup();
                Value::RefList(ids)
            }
            Value::Ref(r) if r != 0 => Value::RefList(vec![r]),
            Value::Int(0) | Value::Ref(0) => Value::RefList(Vec::new()),
            Value::Int(i) if i > 0 => Value::RefList(vec![i]),
            other => alt_text(other),
        },
    }
}

fn alt_text(value: Value) -> Value {
    match value {
        Value::AltText(_) => value,
        other => Value::AltText(other.to_text()),
    }
}

/// Hash-normalized key used by lookup indexes. Integral floats collapse onto
/// integers; anything without a stable hash maps to `Unhashable`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum KeyVal {
    Null,
    Bool(bool),
    Int(i64),
    NumBits(u64),
    Text(String),
    Date(i32),
    DateTime(i64, String),
    Tuple(Vec<KeyVal>),
    Unhashable,
}

pub fn key_of(value: &Value) -> KeyVal {
    match value {
        Value::Null => KeyVal::Null,
        Value::Bool(b) => KeyVal::Bool(*b),
        Value::Int(i) => KeyVal::Int(*i),
        Value::Num(f) => {
            if f.fract() == 0.0 && f.is_finite() && f.abs() < (i64::MAX as f64) {
                KeyVal::Int(*f as i64)
            } else if f.is_nan() {
                KeyVal::Unhashable
            } else {
                KeyVal::NumBits(f.to_bits())
            }
        }
        Value::Text(s) | Value::AltText(s) => KeyVal::Text(s.clone()),
        Value::Date(d) => KeyVal::Date(d.num_days_from_ce()),
        Value::DateTime(ts, zone) => KeyVal::DateTime(*ts, zone.clone()),
        Value::Ref(r) => KeyVal::Int(*r),
        Value::RefList(l) => KeyVal::Tuple(l.iter().map(|r| KeyVal::Int(*r)).collect()),
        Value::List(l) => KeyVal::Tuple(l.iter().map(key_of).collect()),
        Value::Error(_) => KeyVal::Unhashable,
    }
}

/// Total order over mixed-type values, used for sort keys and min/max.
/// Nulls sort first, then anything numeric, then other types by type name.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    fn numeric(v: &Value) -> Option<f64> {
        match v {
            Value::Bool(b) => Some(*b as i64 as f64),
            Value::Int(i) => Some(*i as f64),
            Value::Num(f) => Some(*f),
            _ => None,
        }
    }
    fn type_name(v: &Value) -> &'static str {
        match v {
            Value::Null => "",
            Value::Bool(_) | Value::Int(_) | Value::Num(_) => "number",
            Value::Text(_) | Value::AltText(_) => "str",
            Value::Date(_) => "date",
            Value::DateTime(_, _) => "datetime",
            Value::Ref(_) => "record",
            Value::RefList(_) => "recordlist",
            Value::List(_) => "list",
            Value::Error(_) => "exception",
        }
    }

    let rank = |v: &Value| (!matches!(v, Value::Null) as u8, numeric(v).is_none() as u8);
    match rank(a).cmp(&rank(b)) {
        Ordering::Equal => {}
        other => return other,
    }
    if let (Some(x), Some(y)) = (numeric(a), numeric(b)) {
        return x.partial_cmp(&y).unwrap_or(Ordering::Equal);
    }
    match type_name(a).cmp(type_name(b)) {
        Ordering::Equal => {}
        other => return other,
    }
    match (a, b) {
        (Value::Text(x), Value::Text(y))
        | (Value::AltText(x), Value::AltText(y))
        | (Value::Text(x), Value::AltText(y))
        | (Value::AltText(x), Value::Text(y)) => x.cmp(y),
        (Value::Date(x), Value::Date(y)) => x.cmp(y),
        (Value::DateTime(x, _), Value::DateTime(y, _)) => x.cmp(y),
        (Value::Ref(x), Value::Ref(y)) => x.cmp(y),
        (Value::RefList(x), Value::RefList(y)) => x.cmp(y),
        (Value::List(x), Value::List(y)) => {
            for (i, j) in x.iter().zip(y.iter()) {
                match compare_values(i, j) {
                    Ordering::Equal => continue,
                    other => return other,
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Error(x), Value::Error(y)) => x.message.cmp(&y.message),
        _ => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_defaults() {
        assert_eq!(ColType::Text.default_value(), Value::Text(String::new()));
        assert_eq!(ColType::Int.default_value(), Value::Int(0));
        assert_eq!(ColType::Ref("T".into()).default_value(), Value::Ref(0));
        assert_eq!(ColType::parse("RefList:T").default_value(), Value::RefList(vec![]));
    }

    #[test]
    fn test_parse_round_trip() {
        for s in ["Text", "Int", "Numeric", "Bool", "Date", "DateTime:UTC", "Ref:Students",
                  "RefList:Schools", "Choice", "ChoiceList", "Attachments", "Any"] {
            assert_eq!(ColType::parse(s).as_string(), s);
        }
    }

    #[test]
    fn test_convert_falls_back_to_alt_text() {
        let v = convert_value(Value::Text("not a number".into()), &ColType::Int);
        assert_eq!(v, Value::AltText("not a number".into()));
        // AltText survives another conversion attempt verbatim.
        let v2 = convert_value(v, &ColType::Int);
        assert_eq!(v2, Value::AltText("not a number".into()));
    }

    #[test]
    fn test_convert_ref_list_sorts_and_dedupes() {
        let v = convert_value(Value::RefList(vec![3, 1, 3, 2]), &ColType::RefList("T".into()));
        assert_eq!(v, Value::RefList(vec![1, 2, 3]));
    }

    #[test]
    fn test_key_normalization() {
        assert_eq!(key_of(&Value::Int(5)), key_of(&Value::Num(5.0)));
        assert_ne!(key_of(&Value::Int(5)), key_of(&Value::Num(5.5)));
        assert_eq!(key_of(&Value::Error(Box::new(RaisedException::new("E", "x")))),
                   KeyVal::Unhashable);
    }

    #[test]
    fn test_compare_values_mixed_types() {
        assert_eq!(compare_values(&Value::Null, &Value::Int(-10)), Ordering::Less);
        assert_eq!(compare_values(&Value::Int(2), &Value::Num(2.5)), Ordering::Less);
        assert_eq!(compare_values(&Value::Num(3.0), &Value::Text("a".into())), Ordering::Less);
        assert_eq!(compare_values(&Value::Date(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()),
                                  &Value::Text("z".into())),
                   Ordering::Less);
    }

    #[test]
    fn test_repr_round_trip() {
        let v = Value::RefList(vec![1, 2, 3]);
        assert_eq!(Value::from_repr(&v.to_repr()), v);
        let e = Value::Error(Box::new(RaisedException::new("Exception", "boom")));
        assert_eq!(Value::from_repr(&e.to_repr()), e);
    }
}

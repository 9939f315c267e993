//! Sort specs and sort keys for ordered lookups.
//!
//! A sort spec is a column id, optionally prefixed with `-` for descending
//! order, or a list of such strings. Comparison falls back across types in a
//! stable order (nulls first, then numbers, then other types), with ascending
//! row id as the final tiebreak.

use std::cmp::Ordering;

use crate::value::{compare_values, RowId, Value};

/// A parsed `order_by` specification.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SortSpec {
    /// (col_id, descending) pairs, in significance order.
    pub cols: Vec<(String, bool)>,
}

impl SortSpec {
    /// Parse a single spec string like "Name" or "-Date".
    pub fn parse_one(spec: &str) -> SortSpec {
        SortSpec { cols: vec![parse_col_spec(spec)] }
    }

    /// Parse a host-supplied order_by value: a string or a list of strings.
    pub fn parse_value(value: &Value) -> Option<SortSpec> {
        match value {
            Value::Text(s) if !s.is_empty() => Some(SortSpec::parse_one(s)),
            Value::List(items) => {
                let cols: Vec<(String, bool)> = items
                    .iter()
                    .filter_map(|v| match v {
                        Value::Text(s) if !s.is_empty() => Some(parse_col_spec(s)),
                        _ => None,
                    })
                    .collect();
                if cols.is_empty() { None } else { Some(SortSpec { cols }) }
            }
            _ => None,
        }
    }

    /// Canonical rendering, used to key lookup maps by their sort order.
    pub fn canonical(&self) -> String {
        let parts: Vec<String> = self
            .cols
            .iter()
            .map(|(col, desc)| if *desc { format!("-{}", col) } else { col.clone() })
            .collect();
        parts.join(",")
    }

    pub fn col_ids(&self) -> impl Iterator<Item = &str> {
        self.cols.iter().map(|(col, _)| col.as_str())
    }

    /// Compare two rows by their precomputed sort values.
    pub fn compare(&self, a: &SortKey, b: &SortKey) -> Ordering {
        for (i, (_, desc)) in self.cols.iter().enumerate() {
            let empty = Value::Null;
            let x = a.values.get(i).unwrap_or(&empty);
            let y = b.values.get(i).unwrap_or(&empty);
            let ord = compare_values(x, y);
            let ord = if *desc { ord.reverse() } else { ord };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        a.row_id.cmp(&b.row_id)
    }

    /// Rename a column inside the spec; returns true if anything changed.
    pub fn rename_col(&mut self, old_col_id: &str, new_col_id: &str) -> bool {
        let mut changed = false;
        for (col, _) in &mut self.cols {
            if col == old_col_id {
                *col = new_col_id.to_string();
                changed = true;
            }
        }
        changed
    }
}

fn parse_col_spec(spec: &str) -> (String, bool) {
    match spec.strip_prefix('-') {
        Some(col) => (col.to_string(), true),
        None => (spec.to_string(), false),
    }
}

/// The sort values of one row under a particular spec, plus the row id
/// tiebreak.
#[derive(Clone, Debug)]
pub struct SortKey {
    pub row_id: RowId,
    pub values: Vec<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_descending() {
        let spec = SortSpec::parse_one("-Date");
        assert_eq!(spec.cols, vec![("Date".to_string(), true)]);
        assert_eq!(spec.canonical(), "-Date");
    }

    #[test]
    fn test_parse_value_list() {
        let spec = SortSpec::parse_value(&Value::List(vec![
            Value::Text("A".into()),
            Value::Text("-B".into()),
        ]))
        .unwrap();
        assert_eq!(spec.canonical(), "A,-B");
    }

    #[test]
    fn test_compare_with_tiebreak() {
        let spec = SortSpec::parse_one("X");
        let a = SortKey { row_id: 2, values: vec![Value::Int(1)] };
        let b = SortKey { row_id: 1, values: vec![Value::Int(1)] };
        assert_eq!(spec.compare(&a, &b), Ordering::Greater);

        let c = SortKey { row_id: 9, values: vec![Value::Null] };
        assert_eq!(spec.compare(&c, &a), Ordering::Less);
    }

    #[test]
    fn test_compare_descending() {
        let spec = SortSpec::parse_one("-X");
        let a = SortKey { row_id: 1, values: vec![Value::Int(5)] };
        let b = SortKey { row_id: 2, values: vec![Value::Int(3)] };
        assert_eq!(spec.compare(&a, &b), Ordering::Less);
    }
}

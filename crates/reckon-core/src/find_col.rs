//! Matching columns by content overlap.
//!
//! Given a sample of values, find the columns whose contents share at least
//! `n` distinct elements with it; used by the host to guess which column an
//! imported list belongs to.

use std::collections::HashSet;

use reckon_engine::value::{key_of, KeyVal};
use reckon_engine::{Engine, RowId, Value};

use crate::docmodel::DocModel;
use crate::schema;

/// Counts the size of a sample's overlap with an iterable of values.
/// Values without a stable hash are never counted.
pub struct MatchCounter {
    sample: HashSet<KeyVal>,
}

impl MatchCounter {
    pub fn new(sample: &[Value]) -> MatchCounter {
        MatchCounter {
            sample: sample
                .iter()
                .map(key_of)
                .filter(|k| *k != KeyVal::Unhashable)
                .collect(),
        }
    }

    /// The count of distinct sample elements present in the iterable.
    pub fn count_unique<'a>(&self, values: impl Iterator<Item = &'a Value>) -> usize {
        let mut seen = HashSet::new();
        for value in values {
            let key = key_of(value);
            if key != KeyVal::Unhashable && self.sample.contains(&key) {
                seen.insert(key);
            }
        }
        seen.len()
    }
}

/// Meta row ids of the best-matching columns, sorted by overlap count
/// descending (column record id as tiebreak). Columns below the `n`
/// threshold are dropped.
pub fn find_col_from_values(
    engine: &Engine,
    values: &[Value],
    n: usize,
    table_id: Option<&str>,
) -> Vec<RowId> {
    let counter = MatchCounter::new(values);
    let dm = DocModel::new(engine);
    let mut scored: Vec<(usize, RowId)> = Vec::new();
    for table in engine.all_tables() {
        let tid = table.table_id();
        if schema::is_meta_table(&tid) {
            continue;
        }
        if table_id.is_some_and(|t| t != tid) {
            continue;
        }
        for column in table.columns() {
            let cells = column.all_values();
            let score = counter.count_unique(cells.iter());
            if score >= n {
                if let Some(col_rec) = dm.col_rec(&tid, &column.col_id()) {
                    scored.push((score, col_rec));
                }
            }
        }
    }
    scored.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
    scored.into_iter().map(|(_, col_rec)| col_rec).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_match_counter_distinct_overlap() {
        let counter = MatchCounter::new(&[
            Value::Text("a".into()),
            Value::Text("b".into()),
            Value::Int(3),
        ]);
        let values = vec![
            Value::Text("a".into()),
            Value::Text("a".into()),
            Value::Num(3.0),
            Value::Text("z".into()),
        ];
        // "a" counts once; 3.0 matches the integer 3.
        assert_eq!(counter.count_unique(values.iter()), 2);
    }

    #[test]
    fn test_unhashable_values_ignored() {
        let counter = MatchCounter::new(&[Value::Int(1)]);
        let values = vec![Value::Error(Box::new(
            reckon_engine::RaisedException::new("E", "x"),
        ))];
        assert_eq!(counter.count_unique(values.iter()), 0);
    }
}

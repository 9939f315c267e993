//! Per-column cell storage.
//!
//! A column holds a parallel array of values indexed by the owning table's
//! row-id list. Ref and RefList columns additionally own the Reference
//! relation whose inverse index answers "who points at this row".

use std::cell::RefCell;
use std::rc::Rc;

use crate::formula::CompiledFormula;
use crate::relation::RelationHandle;
use crate::value::{ColType, Value};

/// When a trigger-formula column recalculates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecalcWhen {
    /// New records, plus changes to the explicit dependency columns.
    Default,
    /// New records only.
    Never,
    /// New records, plus any user update to the row.
    ManualUpdates,
}

impl RecalcWhen {
    pub fn from_int(i: i64) -> RecalcWhen {
        match i {
            1 => RecalcWhen::Never,
            2 => RecalcWhen::ManualUpdates,
            _ => RecalcWhen::Default,
        }
    }
}

/// What drives a column's contents.
#[derive(Clone, Debug)]
pub enum ColKind {
    Data,
    Formula,
    /// Data column with a recompute formula driven by explicit triggers
    /// rather than reactive dependencies.
    Trigger { when: RecalcWhen, deps: Vec<String> },
}

pub struct Column {
    col_id: RefCell<String>,
    col_type: RefCell<ColType>,
    kind: RefCell<ColKind>,
    formula: RefCell<Option<Rc<CompiledFormula>>>,
    values: RefCell<Vec<Value>>,
    /// Reference relation for Ref/RefList columns; None otherwise.
    ref_rel: RefCell<Option<RelationHandle>>,
}

impl Column {
    pub fn new(col_id: &str, col_type: ColType, kind: ColKind) -> Column {
        Column {
            col_id: RefCell::new(col_id.to_string()),
            col_type: RefCell::new(col_type),
            kind: RefCell::new(kind),
            formula: RefCell::new(None),
            values: RefCell::new(Vec::new()),
            ref_rel: RefCell::new(None),
        }
    }

    pub fn col_id(&self) -> String {
        self.col_id.borrow().clone()
    }

    pub fn set_col_id(&self, col_id: &str) {
        *self.col_id.borrow_mut() = col_id.to_string();
    }

    pub fn col_type(&self) -> ColType {
        self.col_type.borrow().clone()
    }

    pub fn set_col_type(&self, col_type: ColType) {
        *self.col_type.borrow_mut() = col_type;
    }

    pub fn kind(&self) -> ColKind {
        self.kind.borrow().clone()
    }

    pub fn set_kind(&self, kind: ColKind) {
        *self.kind.borrow_mut() = kind;
    }

    /// True for reactive formula columns (not trigger formulas).
    pub fn is_formula(&self) -> bool {
        matches!(*self.kind.borrow(), ColKind::Formula)
    }

    pub fn is_trigger(&self) -> bool {
        matches!(*self.kind.borrow(), ColKind::Trigger { .. })
    }

    pub fn formula(&self) -> Option<Rc<CompiledFormula>> {
        self.formula.borrow().clone()
    }

    pub fn set_formula(&self, formula: Option<Rc<CompiledFormula>>) {
        *self.formula.borrow_mut() = formula;
    }

    pub fn ref_rel(&self) -> Option<RelationHandle> {
        self.ref_rel.borrow().clone()
    }

    pub fn set_ref_rel(&self, rel: Option<RelationHandle>) {
        *self.ref_rel.borrow_mut() = rel;
    }

    pub fn type_default(&self) -> Value {
        self.col_type.borrow().default_value()
    }

    pub fn len(&self) -> usize {
        self.values.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.borrow().is_empty()
    }

    /// Read by storage index; out-of-range reads behave like row 0.
    pub fn get_at(&self, index: usize) -> Value {
        self.values.borrow().get(index).cloned().unwrap_or_else(|| self.type_default())
    }

    pub fn set_at(&self, index: usize, value: Value) {
        let mut values = self.values.borrow_mut();
        if index < values.len() {
            values[index] = value;
        }
    }

    pub fn push_default(&self) {
        let default = self.type_default();
        self.values.borrow_mut().push(default);
    }

    pub fn push(&self, value: Value) {
        self.values.borrow_mut().push(value);
    }

    /// Drop the given storage indices (sorted ascending).
    pub fn remove_indices(&self, indices: &[usize]) {
        let mut values = self.values.borrow_mut();
        for &index in indices.iter().rev() {
            if index < values.len() {
                values.remove(index);
            }
        }
    }

    pub fn clear(&self) {
        self.values.borrow_mut().clear();
    }

    /// Snapshot of all values in storage order.
    pub fn all_values(&self) -> Vec<Value> {
        self.values.borrow().clone()
    }

    /// Re-convert every stored value to a new type, returning the old values.
    /// Inconvertible cells become AltText of their prior text.
    pub fn convert_to_type(&self, new_type: &ColType) -> Vec<Value> {
        let mut values = self.values.borrow_mut();
        let old = values.clone();
        for v in values.iter_mut() {
            *v = crate::value::convert_value(v.clone(), new_type);
        }
        old
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_range_reads_yield_default() {
        let col = Column::new("n", ColType::Int, ColKind::Data);
        col.push(Value::Int(7));
        assert_eq!(col.get_at(0), Value::Int(7));
        assert_eq!(col.get_at(5), Value::Int(0));
    }

    #[test]
    fn test_convert_to_type_alt_text_fallback() {
        let col = Column::new("n", ColType::Text, ColKind::Data);
        col.push(Value::Text("12".into()));
        col.push(Value::Text("apple".into()));
        col.set_col_type(ColType::Int);
        let old = col.convert_to_type(&ColType::Int);
        assert_eq!(old, vec![Value::Text("12".into()), Value::Text("apple".into())]);
        assert_eq!(col.get_at(0), Value::Int(12));
        assert_eq!(col.get_at(1), Value::AltText("apple".into()));
    }

    #[test]
    fn test_remove_indices() {
        let col = Column::new("n", ColType::Int, ColKind::Data);
        for i in 0..5 {
            col.push(Value::Int(i));
        }
        col.remove_indices(&[1, 3]);
        assert_eq!(col.all_values(), vec![Value::Int(0), Value::Int(2), Value::Int(4)]);
    }
}

//! Row relations: the algebra that maps changed input rows to affected
//! output rows during invalidation.
//!
//! Each dependency edge carries a relation. Identity covers same-row
//! dependencies, Reference covers `rec.other.field` chains, Lookup covers
//! `lookupRecords` fan-out, and Composed chains them. Compositions are
//! memoized so that equal compositions are the same object; edge set
//! membership relies on that.

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use crate::depend::RowSet;
use crate::lookup::{KeyTuple, LookupMap};
use crate::value::RowId;

/// Shared, identity-compared handle to a relation.
#[derive(Clone)]
pub struct RelationHandle(Rc<Relation>);

impl RelationHandle {
    pub fn new(kind: RelKind) -> RelationHandle {
        RelationHandle(Rc::new(Relation { kind, composed: RefCell::new(HashMap::new()) }))
    }

    pub fn identity(table_id: &str) -> RelationHandle {
        RelationHandle::new(RelKind::Identity { table_id: RefCell::new(table_id.to_string()) })
    }

    pub fn single_row_identity(table_id: &str) -> RelationHandle {
        RelationHandle::new(RelKind::SingleRowIdentity {
            table_id: RefCell::new(table_id.to_string()),
        })
    }

    pub fn reference(referring_table: &str, ref_col_id: &str, target_table: &str) -> RelationHandle {
        RelationHandle::new(RelKind::Reference {
            referring_table: RefCell::new(referring_table.to_string()),
            target_table: RefCell::new(target_table.to_string()),
            ref_col_id: RefCell::new(ref_col_id.to_string()),
            inverse: RefCell::new(HashMap::new()),
        })
    }

    pub fn lookup(referring_table: &str, map: Rc<LookupMap>) -> RelationHandle {
        RelationHandle::new(RelKind::Lookup(LookupRelState {
            referring_table: RefCell::new(referring_table.to_string()),
            map,
            referring: RefCell::new(HashMap::new()),
            referred_keys: RefCell::new(HashMap::new()),
        }))
    }

    pub fn kind(&self) -> &RelKind {
        &self.0.kind
    }

    /// Compose `self` (the referring side) with `other` (the target side).
    /// Equal compositions return the same shared instance. Composition with
    /// Identity is intentionally not simplified away: the reset behavior of
    /// the composition differs from the bare relation.
    pub fn compose(&self, other: &RelationHandle) -> RelationHandle {
        if let Some(existing) = self.0.composed.borrow().get(other) {
            return existing.clone();
        }
        let composed = RelationHandle::new(RelKind::Composed {
            source: self.clone(),
            target: other.clone(),
        });
        self.0.composed.borrow_mut().insert(other.clone(), composed.clone());
        composed
    }

    /// Map changed input (dependency) rows to affected output (dependent) rows.
    pub fn affected(&self, input_rows: &RowSet) -> RowSet {
        match &self.0.kind {
            RelKind::Identity { .. } => input_rows.clone(),
            RelKind::SingleRowIdentity { .. } => match input_rows {
                RowSet::All => RowSet::empty(),
                rows => rows.clone(),
            },
            RelKind::Reference { inverse, .. } => match input_rows {
                RowSet::All => RowSet::All,
                RowSet::Rows(rows) => {
                    let inverse = inverse.borrow();
                    let mut out = BTreeSet::new();
                    for target_row in rows {
                        if let Some(referrers) = inverse.get(target_row) {
                            out.extend(referrers.iter().copied());
                        }
                    }
                    RowSet::Rows(out)
                }
            },
            RelKind::Lookup(state) => state.affected(input_rows),
            RelKind::Composed { source, target } => source.affected(&target.affected(input_rows)),
        }
    }

    /// Forget relation state keyed on the given output rows, called just
    /// before those rows are recomputed. Only lookups carry such state; a
    /// composition forwards to its referring side only.
    pub fn reset_rows(&self, output_rows: &RowSet) {
        match &self.0.kind {
            RelKind::Lookup(state) => state.reset_rows(output_rows),
            RelKind::Composed { source, .. } => source.reset_rows(output_rows),
            _ => {}
        }
    }

    pub fn reset_all(&self) {
        self.reset_rows(&RowSet::All);
    }

    pub fn referring_table(&self) -> String {
        match &self.0.kind {
            RelKind::Identity { table_id } | RelKind::SingleRowIdentity { table_id } => {
                table_id.borrow().clone()
            }
            RelKind::Reference { referring_table, .. } => referring_table.borrow().clone(),
            RelKind::Lookup(state) => state.referring_table.borrow().clone(),
            RelKind::Composed { source, .. } => source.referring_table(),
        }
    }

    pub fn target_table(&self) -> String {
        match &self.0.kind {
            RelKind::Identity { table_id } | RelKind::SingleRowIdentity { table_id } => {
                table_id.borrow().clone()
            }
            RelKind::Reference { target_table, .. } => target_table.borrow().clone(),
            RelKind::Lookup(state) => state.map.node().table_id.clone(),
            RelKind::Composed { target, .. } => target.target_table(),
        }
    }

    /// Record that `referring_row` points at `target_row` through the
    /// reference column that owns this relation.
    pub fn add_reference(&self, referring_row: RowId, target_row: RowId) {
        if let RelKind::Reference { inverse, .. } = &self.0.kind {
            if target_row != 0 {
                inverse.borrow_mut().entry(target_row).or_default().insert(referring_row);
            }
        }
    }

    pub fn remove_reference(&self, referring_row: RowId, target_row: RowId) {
        if let RelKind::Reference { inverse, .. } = &self.0.kind {
            if let Some(set) = inverse.borrow_mut().get_mut(&target_row) {
                set.remove(&referring_row);
            }
        }
    }

    /// Rename any table ids this relation mentions. Lookup maps rename their
    /// own node separately.
    pub fn rename_table(&self, old_table_id: &str, new_table_id: &str) {
        match &self.0.kind {
            RelKind::Identity { table_id } | RelKind::SingleRowIdentity { table_id } => {
                if *table_id.borrow() == old_table_id {
                    *table_id.borrow_mut() = new_table_id.to_string();
                }
            }
            RelKind::Reference { referring_table, target_table, .. } => {
                if *referring_table.borrow() == old_table_id {
                    *referring_table.borrow_mut() = new_table_id.to_string();
                }
                if *target_table.borrow() == old_table_id {
                    *target_table.borrow_mut() = new_table_id.to_string();
                }
            }
            RelKind::Lookup(state) => {
                if *state.referring_table.borrow() == old_table_id {
                    *state.referring_table.borrow_mut() = new_table_id.to_string();
                }
            }
            RelKind::Composed { source, target } => {
                source.rename_table(old_table_id, new_table_id);
                target.rename_table(old_table_id, new_table_id);
            }
        }
    }
}

impl PartialEq for RelationHandle {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for RelationHandle {}

impl Hash for RelationHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Rc::as_ptr(&self.0) as usize).hash(state);
    }
}

impl std::fmt::Debug for RelationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.0.kind {
            RelKind::Identity { table_id } => write!(f, "Identity({})", table_id.borrow()),
            RelKind::SingleRowIdentity { table_id } => {
                write!(f, "SingleRowIdentity({})", table_id.borrow())
            }
            RelKind::Reference { referring_table, ref_col_id, .. } => {
                write!(f, "Reference({}.{})", referring_table.borrow(), ref_col_id.borrow())
            }
            RelKind::Lookup(state) => write!(f, "Lookup({})", state.map.node()),
            RelKind::Composed { source, target } => write!(f, "{:?} + {:?}", source, target),
        }
    }
}

pub struct Relation {
    kind: RelKind,
    /// Memoized compositions keyed by the target-side relation.
    composed: RefCell<HashMap<RelationHandle, RelationHandle>>,
}

pub enum RelKind {
    /// Same-row dependency within one table.
    Identity { table_id: RefCell<String> },
    /// Identity that refuses to pass along a whole-column invalidation; used
    /// for trigger formulas so they do not recalculate in full when a
    /// dependency column is modified wholesale.
    SingleRowIdentity { table_id: RefCell<String> },
    /// Maintains the inverse index of a reference column:
    /// target row -> set of referring rows.
    Reference {
        referring_table: RefCell<String>,
        target_table: RefCell<String>,
        ref_col_id: RefCell<String>,
        inverse: RefCell<HashMap<RowId, BTreeSet<RowId>>>,
    },
    Lookup(LookupRelState),
    Composed { source: RelationHandle, target: RelationHandle },
}

/// Per-dependent state of a lookup: which formula rows asked about which key
/// tuples. `affected` maps changed source rows to the formula rows registered
/// for the rows' key tuples before or after the change.
pub struct LookupRelState {
    pub referring_table: RefCell<String>,
    pub map: Rc<LookupMap>,
    referring: RefCell<HashMap<KeyTuple, BTreeSet<RowId>>>,
    referred_keys: RefCell<HashMap<RowId, HashSet<KeyTuple>>>,
}

impl LookupRelState {
    /// Record that formula row `referring_row` queried `key`.
    pub fn register(&self, key: &KeyTuple, referring_row: RowId) {
        self.referring.borrow_mut().entry(key.clone()).or_default().insert(referring_row);
        self.referred_keys.borrow_mut().entry(referring_row).or_default().insert(key.clone());
    }

    fn affected(&self, input_rows: &RowSet) -> RowSet {
        let referring = self.referring.borrow();
        let mut out = BTreeSet::new();
        match input_rows {
            RowSet::All => {
                for rows in referring.values() {
                    out.extend(rows.iter().copied());
                }
            }
            RowSet::Rows(rows) => {
                for row in rows {
                    for key in self.map.keys_for_row(*row) {
                        if let Some(referrers) = referring.get(&key) {
                            out.extend(referrers.iter().copied());
                        }
                    }
                }
            }
        }
        RowSet::Rows(out)
    }

    fn reset_rows(&self, output_rows: &RowSet) {
        match output_rows {
            RowSet::All => {
                self.referring.borrow_mut().clear();
                self.referred_keys.borrow_mut().clear();
            }
            RowSet::Rows(rows) => {
                let mut referring = self.referring.borrow_mut();
                let mut referred_keys = self.referred_keys.borrow_mut();
                for row in rows {
                    if let Some(keys) = referred_keys.remove(row) {
                        for key in keys {
                            if let Some(set) = referring.get_mut(&key) {
                                set.remove(row);
                                if set.is_empty() {
                                    referring.remove(&key);
                                }
                            }
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compose_is_memoized() {
        let a = RelationHandle::identity("A");
        let b = RelationHandle::reference("A", "link", "B");
        let c1 = a.compose(&b);
        let c2 = a.compose(&b);
        assert_eq!(c1, c2);
        let c3 = b.compose(&a);
        assert_ne!(c1, c3);
    }

    #[test]
    fn test_identity_not_collapsed() {
        let a = RelationHandle::identity("A");
        let b = RelationHandle::reference("A", "link", "B");
        let composed = a.compose(&b);
        assert_ne!(composed, b);
        assert_eq!(composed.referring_table(), "A");
        assert_eq!(composed.target_table(), "B");
    }

    #[test]
    fn test_reference_affected() {
        let rel = RelationHandle::reference("Students", "school", "Schools");
        rel.add_reference(1, 10);
        rel.add_reference(2, 10);
        rel.add_reference(3, 11);
        assert_eq!(rel.affected(&RowSet::rows([10])), RowSet::rows([1, 2]));
        rel.remove_reference(2, 10);
        assert_eq!(rel.affected(&RowSet::rows([10, 11])), RowSet::rows([1, 3]));
        assert_eq!(rel.affected(&RowSet::All), RowSet::All);
        assert_eq!(rel.affected(&RowSet::rows([99])), RowSet::empty());
    }

    #[test]
    fn test_single_row_identity_blocks_all_rows() {
        let rel = RelationHandle::single_row_identity("T");
        assert_eq!(rel.affected(&RowSet::All), RowSet::empty());
        assert_eq!(rel.affected(&RowSet::rows([4, 5])), RowSet::rows([4, 5]));
    }
}

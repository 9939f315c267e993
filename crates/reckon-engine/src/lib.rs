//! reckon_engine - the in-process data engine: typed column storage, the
//! dependency graph, lookup indexes, the expression language, and the
//! incremental recompute scheduler.
//!
//! - [`value`] - cell values, column types, conversions and key hashing
//! - [`relation`] - the row-mapping algebra used by dependency edges
//! - [`depend`] - the dependency graph and invalidation walk
//! - [`column`] / [`table`] - storage and the Record/RecordSet views
//! - [`lookup`] - lookup indexes backing `lookupRecords`
//! - [`formula`] - lexer, parser, rename patching, traced evaluation
//! - [`actions`] / [`summary`] - document actions, bundles, calc summaries
//! - [`engine`] - ties it together and drives recomputation

pub mod actions;
pub mod column;
pub mod depend;
pub mod engine;
pub mod error;
pub mod formula;
pub mod lookup;
pub mod relation;
pub mod sort_key;
pub mod summary;
pub mod table;
pub mod textbuilder;
pub mod value;

pub use actions::{ActionGroup, ColDelta, ColInfo, DocAction};
pub use column::{ColKind, Column, RecalcWhen};
pub use depend::{Node, RowSet};
pub use engine::Engine;
pub use error::{EngineError, Result};
pub use table::{Record, RecordSet, Table};
pub use value::{ColType, RaisedException, RowId, Value};

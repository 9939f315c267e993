//! reckon_core - the document model over the data engine: the metadata
//! schema, typed docmodel access, user-action translation, predicate
//! formulas in metadata, migrations, and the host-facing entry points.

pub mod docmodel;
pub mod document;
pub mod error;
pub mod find_col;
pub mod identifiers;
pub mod migrations;
pub mod predicate;
pub mod renames;
pub mod schema;
pub mod table_data_set;
pub mod useractions;

pub use docmodel::DocModel;
pub use document::Document;
pub use error::{DocError, Result};
pub use schema::SCHEMA_VERSION;

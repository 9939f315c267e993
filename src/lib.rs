//! reckon - the sandbox process wrapping the document engine.

pub mod sandbox;

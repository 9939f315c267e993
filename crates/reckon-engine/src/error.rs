//! Error types for the Reckon engine.

use thiserror::Error;

/// Errors that abort the current submission (as opposed to formula errors,
/// which are stored in cells as values).
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("SchemaError: {0}")]
    Schema(String),

    #[error("InvalidRequest: {0}")]
    InvalidRequest(String),

    #[error("internal schema inconsistent after undo: {0}")]
    InconsistentUndo(String),
}

impl EngineError {
    /// Error kind string used in `EXC` wire replies.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Schema(_) => "SchemaError",
            EngineError::InvalidRequest(_) => "InvalidRequest",
            EngineError::InconsistentUndo(_) => "SchemaError",
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

//! Error types for the Reckon document model.

use reckon_engine::EngineError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DocError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("InvalidRequest: {0}")]
    InvalidRequest(String),
}

impl DocError {
    /// Error kind string used in `EXC` wire replies.
    pub fn kind(&self) -> &'static str {
        match self {
            DocError::Engine(err) => err.kind(),
            DocError::InvalidRequest(_) => "InvalidRequest",
        }
    }

    pub fn invalid(message: impl Into<String>) -> DocError {
        DocError::InvalidRequest(message.into())
    }
}

pub type Result<T> = std::result::Result<T, DocError>;

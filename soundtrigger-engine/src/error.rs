/// Engine error taxonomy
///
/// Every public engine operation reports failures through [`EngineError`].
/// Callers that need a numeric status (for example a C-facing HAL shim) use
/// [`EngineError::status_code`], which maps each variant onto one negative
/// errno-style value.

use crate::session::{ParamId, SessionError};
use thiserror::Error;

const EINVAL: i32 = 22;
const EAGAIN: i32 = 11;
const EIO: i32 = 5;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("No sound model loaded")]
    NotLoaded,

    #[error("Failed to spawn buffering thread: {0}")]
    SpawnFailure(#[source] std::io::Error),

    #[error("Session rejected parameter {param:?}: {source}")]
    ParameterRejected {
        param: ParamId,
        #[source]
        source: SessionError,
    },

    #[error("Capture failed: {0}")]
    Capture(#[from] SessionError),
}

impl EngineError {
    /// Shorthand for building an [`EngineError::InvalidArgument`]
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        EngineError::InvalidArgument(msg.into())
    }

    /// Negative status code for this error
    pub fn status_code(&self) -> i32 {
        match self {
            EngineError::InvalidArgument(_) | EngineError::NotLoaded => -EINVAL,
            EngineError::SpawnFailure(_) => -EAGAIN,
            EngineError::ParameterRejected { source, .. } => match source {
                SessionError::Rejected { status, .. } if *status < 0 => *status,
                _ => -EIO,
            },
            EngineError::Capture(_) => -EIO,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

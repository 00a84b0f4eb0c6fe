//! Pipeline-specific error types.

use crate::pipeline::id::CopyKey;
use thiserror::Error;

/// Errors raised by stage code and channel plumbing while a pipeline runs.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Stage {key} error: {message}")]
    Stage { key: CopyKey, message: String },

    #[error("Stage {0} failed to initialize: {1}")]
    Init(CopyKey, String),

    #[error("Unknown stage type: {0}")]
    UnknownStageType(String),

    #[error("Invalid stage setting '{key}': {message}")]
    Setting { key: String, message: String },

    #[error("Row field {index} out of range (row has {len} fields)")]
    FieldOutOfRange { index: usize, len: usize },

    #[error("Aborted after {0} rows")]
    Aborted(u64),

    #[error("Channel {0} is already done")]
    ChannelDone(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    pub fn stage(key: &CopyKey, message: impl Into<String>) -> Self {
        PipelineError::Stage {
            key: key.clone(),
            message: message.into(),
        }
    }

    pub fn setting(key: impl Into<String>, message: impl Into<String>) -> Self {
        PipelineError::Setting {
            key: key.into(),
            message: message.into(),
        }
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

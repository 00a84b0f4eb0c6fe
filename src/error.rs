//! Error handling for the flowrun engine
//!
//! This module defines the engine-level error type and a Result alias used by
//! the lifecycle controller, configuration loading and the runner binary.
//! Stage code reports its own failures through
//! [`PipelineError`](crate::pipeline::PipelineError), which converts into
//! [`EngineError`] at the engine boundary.

use crate::pipeline::error::PipelineError;
use crate::pipeline::id::CopyKey;
use thiserror::Error;

/// Main error type for engine operations
#[derive(Error, Debug)]
pub enum EngineError {
    /// Invalid or unresolvable engine configuration (negative copies, bad channel kind)
    #[error("Configuration error: {0}")]
    Config(String),

    /// The pipeline graph itself is malformed
    #[error("Invalid pipeline definition: {0}")]
    Definition(String),

    /// One or more stage copies failed to initialize
    #[error("Unable to initialize at least one stage ({})", format_keys(.failed))]
    InitFailed {
        failed: Vec<CopyKey>,
        /// Buffered log text, attached when running in preview mode
        log_text: Option<String>,
    },

    /// A lifecycle operation was called in the wrong state
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// A started/finished/stopped listener failed
    #[error("Listener error: {0}")]
    Listener(String),

    /// An extension hook raised a fatal error
    #[error("Extension point {point} failed: {message}")]
    Hook { point: String, message: String },

    /// Errors raised by stage or channel code
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<EngineError>,
    },
}

fn format_keys(keys: &[CopyKey]) -> String {
    keys.iter()
        .map(|k| k.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl EngineError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        EngineError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Buffered log text carried by a preview-mode init failure.
    pub fn log_text(&self) -> Option<&str> {
        match self {
            EngineError::InitFailed { log_text, .. } => log_text.as_deref(),
            EngineError::WithContext { source, .. } => source.log_text(),
            _ => None,
        }
    }
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}

impl<T> ResultExt<T> for std::result::Result<T, PipelineError> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| EngineError::from(e).with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| EngineError::from(e).with_context(f()))
    }
}

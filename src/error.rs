//! Error handling for ScriptFlow
//!
//! This module defines the crate-level error type and a Result alias for use
//! outside the stage internals. Stage-internal failures use
//! [`PipelineError`](crate::pipeline::PipelineError) and convert into this type.

use crate::pipeline::error::PipelineError;
use thiserror::Error;

/// Main error type for ScriptFlow operations
#[derive(Error, Debug)]
pub enum ScriptFlowError {
    /// Errors related to configuration loading/saving
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors related to recordings and player sources
    #[error("Player error: {0}")]
    Player(String),

    /// Errors raised by the user node stage
    #[error("Pipeline error: {0}")]
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
        source: Box<ScriptFlowError>,
    },
}

impl ScriptFlowError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        ScriptFlowError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }
}

impl From<serde_json::Error> for ScriptFlowError {
    fn from(err: serde_json::Error) -> Self {
        ScriptFlowError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for ScriptFlowError {
    fn from(err: toml::de::Error) -> Self {
        ScriptFlowError::Config(err.to_string())
    }
}

/// Result type alias for ScriptFlow operations
pub type Result<T> = std::result::Result<T, ScriptFlowError>;

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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::id::NodeId;

    #[test]
    fn test_error_display() {
        let err = ScriptFlowError::Config("missing stage section".to_string());
        assert_eq!(err.to_string(), "Configuration error: missing stage section");
    }

    #[test]
    fn test_error_with_context() {
        let err = ScriptFlowError::Player("recording is empty".to_string());
        let with_ctx = err.with_context("Failed to load recording");
        assert!(with_ctx.to_string().contains("Failed to load recording"));
        assert!(with_ctx.to_string().contains("recording is empty"));
    }

    #[test]
    fn test_pipeline_error_conversion() {
        let err: ScriptFlowError = PipelineError::ChainedNode {
            node_id: NodeId::from("n1"),
            topic: "/b".to_string(),
        }
        .into();
        assert!(err.to_string().contains("/b"));
    }

    #[test]
    fn test_result_ext_context() {
        let result: Result<()> = Err(ScriptFlowError::Serialization("eof".to_string()));
        let err = result.context("Parsing project").unwrap_err();
        assert!(err.to_string().starts_with("Parsing project"));
    }
}

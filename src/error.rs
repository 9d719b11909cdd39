//! Error types for matforge operations.
//!
//! Defines error types for the major subsystems:
//! - LLM API interactions
//! - Per-document extraction
//! - Stage execution inside the workflow engine
//! - Correlation analysis

use thiserror::Error;

/// Errors that can occur during LLM operations.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Missing API base URL: MATFORGE_API_BASE environment variable not set")]
    MissingApiBase,

    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Failed to parse LLM response: {0}")]
    ParseError(String),

    #[error("API error ({code}): {message}")]
    ApiError { code: u16, message: String },

    #[error("Model returned an empty completion")]
    EmptyCompletion,
}

/// Errors that can occur while extracting structured data from a document.
///
/// All variants are recoverable at the batch level: a failed document is
/// retried within budget and then skipped with a record, never aborting the
/// run.
#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("Document '{0}' is empty or unreadable")]
    EmptyDocument(String),

    #[error("Model call failed: {0}")]
    Model(#[from] LlmError),

    #[error("Failed to parse extraction output: {0}")]
    Parse(String),

    #[error("No JSON object found in extraction output")]
    MissingJson,
}

/// A non-recoverable failure inside a stage handler.
///
/// The engine records this in the context event log and transitions to the
/// terminal node with the partial-failure flag set; it is never propagated
/// as an unhandled fault.
#[derive(Debug, Error)]
#[error("Stage '{stage}' failed: {message}")]
pub struct StageError {
    /// Name of the stage that failed.
    pub stage: &'static str,
    /// Human-readable description of the failure.
    pub message: String,
}

impl StageError {
    /// Creates a new stage error.
    pub fn new(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
        }
    }
}

/// Errors that can occur during correlation analysis.
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("No persisted rows available for analysis")]
    NoData,

    #[error("Target column '{0}' not found in persisted data")]
    UnknownTarget(String),

    #[error("Not enough overlapping samples (need at least {needed}, found {found})")]
    InsufficientSamples { needed: usize, found: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_error_display() {
        let err = StageError::new("standardizer", "schema index unavailable");
        assert!(err.to_string().contains("standardizer"));
        assert!(err.to_string().contains("schema index unavailable"));
    }

    #[test]
    fn test_extraction_error_from_llm_error() {
        let err: ExtractionError = LlmError::EmptyCompletion.into();
        assert!(matches!(err, ExtractionError::Model(_)));
    }
}

//! matforge: materials-literature mining pipeline.
//!
//! This library provides the orchestration engine for extracting,
//! standardizing, and persisting ionic-conductivity data from research
//! papers, plus the analysis branch over previously persisted data.

// Core modules
pub mod analysis;
pub mod cli;
pub mod error;
pub mod llm;
pub mod schema;
pub mod stages;
pub mod storage;
pub mod units;
pub mod workflow;

// Re-export commonly used error types
pub use error::{AnalysisError, ExtractionError, LlmError, StageError};
pub use workflow::{ConfigError, WorkflowConfig, WorkflowContext, WorkflowEngine};

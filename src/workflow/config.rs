//! Workflow configuration.
//!
//! This module provides configuration options for the workflow engine:
//! retry and iteration budgets, schema-matching thresholds, extraction
//! concurrency, collaborator endpoints and persistence connections.

use thiserror::Error;

/// Errors that can occur during configuration operations.
///
/// Configuration failures are the only error class that prevents a run from
/// starting; everything after `validate()` succeeds is handled inside the
/// engine loop.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// A required collaborator connection is not configured.
    #[error("Missing collaborator connection: {0}")]
    MissingCollaborator(String),
}

/// Default canonical schema columns for solid-electrolyte data.
pub const DEFAULT_CANONICAL_COLUMNS: &[&str] = &[
    "ionic_conductivity_ms_cm",
    "activation_energy_ev",
    "sintering_temp_c",
    "ball_milling_rpm",
    "grain_size_um",
    "relative_density",
];

/// Configuration for the workflow engine and its stages.
#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    // Extraction loop settings
    /// Retry permits per batch; also the per-document retry cap.
    pub retry_budget: u32,
    /// Concurrency width of the extraction worker pool.
    pub extract_concurrency: usize,

    // Engine settings
    /// Hard cap on engine transitions, independent of stage budgets.
    pub max_transitions: u32,

    // Standardization settings
    /// Similarity threshold above which a schema mapping is accepted.
    pub similarity_threshold: f64,
    /// Canonical schema keys to map extracted fields onto.
    pub canonical_columns: Vec<String>,

    // Persistence settings
    /// Whether the batch must be explicitly approved before persistence.
    pub require_approval: bool,
    /// Row store connection URL.
    pub database_url: Option<String>,
    /// Graph store base URI.
    pub graph_uri: Option<String>,
    /// Graph store user.
    pub graph_user: Option<String>,
    /// Graph store password.
    pub graph_password: Option<String>,

    // LLM settings
    /// Model identifier used for extraction and intent classification.
    pub model: String,
    /// Chat-completions API base URL.
    pub api_base: Option<String>,
    /// API key, when the endpoint requires one.
    pub api_key: Option<String>,

    // Analysis settings
    /// Target property for correlation analysis.
    pub target_property: String,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            retry_budget: 2,
            extract_concurrency: 1,
            max_transitions: 100,
            similarity_threshold: 0.85,
            canonical_columns: DEFAULT_CANONICAL_COLUMNS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            require_approval: false,
            database_url: None,
            graph_uri: None,
            graph_user: None,
            graph_password: None,
            model: "gpt-4o-mini".to_string(),
            api_base: None,
            api_key: None,
            target_property: "ionic_conductivity_ms_cm".to_string(),
        }
    }
}

impl WorkflowConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the per-batch retry budget.
    pub fn with_retry_budget(mut self, retry_budget: u32) -> Self {
        self.retry_budget = retry_budget;
        self
    }

    /// Sets the extraction worker-pool width.
    pub fn with_extract_concurrency(mut self, width: usize) -> Self {
        self.extract_concurrency = width;
        self
    }

    /// Sets the engine transition cap.
    pub fn with_max_transitions(mut self, max_transitions: u32) -> Self {
        self.max_transitions = max_transitions;
        self
    }

    /// Sets the schema-mapping similarity threshold.
    pub fn with_similarity_threshold(mut self, threshold: f64) -> Self {
        self.similarity_threshold = threshold;
        self
    }

    /// Sets the canonical column set.
    pub fn with_canonical_columns(mut self, columns: Vec<String>) -> Self {
        self.canonical_columns = columns;
        self
    }

    /// Requires explicit batch approval before persistence.
    pub fn with_require_approval(mut self, require: bool) -> Self {
        self.require_approval = require;
        self
    }

    /// Sets the row store connection URL.
    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    /// Sets the model identifier.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Sets the correlation target property.
    pub fn with_target_property(mut self, target: impl Into<String>) -> Self {
        self.target_property = target.into();
        self
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `MATFORGE_RETRY_BUDGET`: retry permits per batch (default: 2)
    /// - `MATFORGE_EXTRACT_CONCURRENCY`: worker-pool width (default: 1)
    /// - `MATFORGE_MAX_TRANSITIONS`: engine transition cap (default: 100)
    /// - `MATFORGE_SIMILARITY_THRESHOLD`: mapping threshold (default: 0.85)
    /// - `MATFORGE_REQUIRE_APPROVAL`: gate persistence on approval (default: false)
    /// - `MATFORGE_MODEL`: model identifier (default: gpt-4o-mini)
    /// - `MATFORGE_API_BASE`: chat-completions base URL
    /// - `MATFORGE_API_KEY`: API key for the endpoint
    /// - `DATABASE_URL`: row store connection URL
    /// - `MATFORGE_GRAPH_URI`: graph store base URI
    /// - `MATFORGE_GRAPH_USER` / `MATFORGE_GRAPH_PASSWORD`: graph credentials
    /// - `MATFORGE_TARGET_PROPERTY`: correlation target property
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("MATFORGE_RETRY_BUDGET") {
            config.retry_budget = parse_env_value(&val, "MATFORGE_RETRY_BUDGET")?;
        }
        if let Ok(val) = std::env::var("MATFORGE_EXTRACT_CONCURRENCY") {
            config.extract_concurrency = parse_env_value(&val, "MATFORGE_EXTRACT_CONCURRENCY")?;
        }
        if let Ok(val) = std::env::var("MATFORGE_MAX_TRANSITIONS") {
            config.max_transitions = parse_env_value(&val, "MATFORGE_MAX_TRANSITIONS")?;
        }
        if let Ok(val) = std::env::var("MATFORGE_SIMILARITY_THRESHOLD") {
            config.similarity_threshold = parse_env_value(&val, "MATFORGE_SIMILARITY_THRESHOLD")?;
        }
        if let Ok(val) = std::env::var("MATFORGE_REQUIRE_APPROVAL") {
            config.require_approval = parse_env_value(&val, "MATFORGE_REQUIRE_APPROVAL")?;
        }
        if let Ok(val) = std::env::var("MATFORGE_MODEL") {
            config.model = val;
        }
        if let Ok(val) = std::env::var("MATFORGE_API_BASE") {
            config.api_base = Some(val);
        }
        if let Ok(val) = std::env::var("MATFORGE_API_KEY") {
            config.api_key = Some(val);
        }
        if let Ok(val) = std::env::var("DATABASE_URL") {
            config.database_url = Some(val);
        }
        if let Ok(val) = std::env::var("MATFORGE_GRAPH_URI") {
            config.graph_uri = Some(val);
        }
        if let Ok(val) = std::env::var("MATFORGE_GRAPH_USER") {
            config.graph_user = Some(val);
        }
        if let Ok(val) = std::env::var("MATFORGE_GRAPH_PASSWORD") {
            config.graph_password = Some(val);
        }
        if let Ok(val) = std::env::var("MATFORGE_TARGET_PROPERTY") {
            config.target_property = val;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` describing the first
    /// violation found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.extract_concurrency == 0 {
            return Err(ConfigError::ValidationFailed(
                "extract_concurrency must be at least 1".to_string(),
            ));
        }
        if self.max_transitions == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_transitions must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.similarity_threshold) {
            return Err(ConfigError::ValidationFailed(format!(
                "similarity_threshold must be within [0, 1], got {}",
                self.similarity_threshold
            )));
        }
        if self.canonical_columns.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "canonical_columns must not be empty".to_string(),
            ));
        }
        if self.target_property.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "target_property must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Parses an environment variable value into the target type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = WorkflowConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.retry_budget, 2);
        assert_eq!(config.extract_concurrency, 1);
        assert_eq!(config.max_transitions, 100);
        assert!((config.similarity_threshold - 0.85).abs() < f64::EPSILON);
        assert_eq!(config.canonical_columns.len(), 6);
    }

    #[test]
    fn test_builder_chain() {
        let config = WorkflowConfig::new()
            .with_retry_budget(5)
            .with_extract_concurrency(8)
            .with_max_transitions(32)
            .with_similarity_threshold(0.7)
            .with_require_approval(true)
            .with_database_url("postgres://localhost/matforge")
            .with_model("qwen2.5:32b")
            .with_target_property("activation_energy_ev");

        assert_eq!(config.retry_budget, 5);
        assert_eq!(config.extract_concurrency, 8);
        assert_eq!(config.max_transitions, 32);
        assert!(config.require_approval);
        assert_eq!(
            config.database_url.as_deref(),
            Some("postgres://localhost/matforge")
        );
        assert_eq!(config.model, "qwen2.5:32b");
        assert_eq!(config.target_property, "activation_energy_ev");
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let config = WorkflowConfig::new().with_extract_concurrency(0);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationFailed(_))
        ));
    }

    #[test]
    fn test_validate_rejects_out_of_range_threshold() {
        let config = WorkflowConfig::new().with_similarity_threshold(1.5);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_columns() {
        let config = WorkflowConfig::new().with_canonical_columns(Vec::new());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_env_value_invalid() {
        let result: Result<u32, _> = parse_env_value("not-a-number", "MATFORGE_RETRY_BUDGET");
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }
}

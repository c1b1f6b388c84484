//! Error taxonomy for the inference layer.
//!
//! Only [`InferenceError::ModelLoadFailed`] is fatal for a backend: the
//! lifecycle manager marks the backend unavailable for the rest of the
//! process. Everything else is reported to the orchestrator, which turns it
//! into an escalation instead of surfacing it to callers.

use thiserror::Error;

/// Inference layer error types
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InferenceError {
    /// Backing artifact missing, corrupt, or incompatible with the runtime
    #[error("Model load failed for '{backend}': {reason}")]
    ModelLoadFailed { backend: String, reason: String },

    /// Runtime failure during inference (after the adapter's internal retry)
    #[error("Generation failed for '{backend}': {reason}")]
    GenerationFailed { backend: String, reason: String },

    /// Backend previously failed to load and is disabled for this process
    #[error("Backend '{backend}' is unavailable: {reason}")]
    BackendUnavailable { backend: String, reason: String },

    /// Admitting the backend would exceed the configured memory budget
    #[error("Memory budget exceeded: {0}")]
    BudgetExceeded(String),

    /// No backend registered under this identifier
    #[error("Backend not found: {0}")]
    BackendNotFound(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl InferenceError {
    pub fn load(backend: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ModelLoadFailed {
            backend: backend.into(),
            reason: reason.into(),
        }
    }

    pub fn generation(backend: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::GenerationFailed {
            backend: backend.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error permanently disables the backend that raised it.
    pub fn is_fatal_for_backend(&self) -> bool {
        matches!(self, Self::ModelLoadFailed { .. })
    }
}

/// Result type for inference operations
pub type InferenceResult<T> = Result<T, InferenceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = InferenceError::load("qna", "config.json not found");
        assert_eq!(
            err.to_string(),
            "Model load failed for 'qna': config.json not found"
        );

        let err = InferenceError::BudgetExceeded("need 2600 MB, budget 2048 MB".into());
        assert!(err.to_string().contains("Memory budget exceeded"));
    }

    #[test]
    fn test_only_load_failures_are_fatal() {
        assert!(InferenceError::load("phi2", "bad magic").is_fatal_for_backend());
        assert!(!InferenceError::generation("phi2", "timeout").is_fatal_for_backend());
        assert!(!InferenceError::BudgetExceeded("x".into()).is_fatal_for_backend());
        assert!(!InferenceError::BackendNotFound("x".into()).is_fatal_for_backend());
    }
}

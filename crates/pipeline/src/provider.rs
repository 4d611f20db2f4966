//! AI provider boundary (extraction, vision, embeddings).
//!
//! The pipeline never talks to a model directly; stages and task handlers go
//! through [`AiProvider`] and map its errors onto the retry taxonomy.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::stage::StageError;
use crate::task::TaskFailure;

/// One provider call: an operation name plus its JSON payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyzeRequest {
    /// e.g. `extract_document`, `analyze_image`
    pub operation: String,
    pub payload: serde_json::Value,
}

impl AnalyzeRequest {
    pub fn new(operation: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            operation: operation.into(),
            payload,
        }
    }
}

/// Errors raised by a provider call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    #[error("provider rate limited")]
    RateLimited { retry_after: Option<Duration> },

    #[error("transient provider error: {0}")]
    Transient(String),

    #[error("fatal provider error: {0}")]
    Fatal(String),
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ProviderError::Fatal(_))
    }
}

/// Narrow call interface to an AI backend.
#[async_trait]
pub trait AiProvider: Send + Sync {
    async fn analyze(&self, request: AnalyzeRequest) -> Result<serde_json::Value, ProviderError>;
}

impl From<ProviderError> for TaskFailure {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::RateLimited { retry_after } => TaskFailure::Retryable {
                message: "provider rate limited".to_string(),
                retry_after,
            },
            ProviderError::Transient(msg) => TaskFailure::retryable(msg),
            ProviderError::Fatal(msg) => TaskFailure::Fatal(msg),
        }
    }
}

impl From<ProviderError> for StageError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Fatal(msg) => StageError::Fatal(msg),
            other => StageError::Retryable(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limits_and_transient_errors_are_retryable_task_failures() {
        let failure: TaskFailure = ProviderError::RateLimited {
            retry_after: Some(Duration::from_secs(2)),
        }
        .into();
        assert!(matches!(
            failure,
            TaskFailure::Retryable { retry_after: Some(d), .. } if d == Duration::from_secs(2)
        ));

        let failure: TaskFailure = ProviderError::Transient("connection reset".into()).into();
        assert!(matches!(failure, TaskFailure::Retryable { .. }));
    }

    #[test]
    fn fatal_provider_errors_map_to_fatal() {
        let failure: TaskFailure = ProviderError::Fatal("bad image".into()).into();
        assert_eq!(failure, TaskFailure::Fatal("bad image".into()));

        let stage: StageError = ProviderError::Fatal("unparseable pdf".into()).into();
        assert!(!stage.is_retryable());
    }
}

//! Error taxonomy for the service boundary
//!
//! Pipeline internals use `anyhow` with context; operations that cross the
//! HTTP boundary classify failures into this taxonomy so handlers can map
//! them to status codes without string matching.

use thiserror::Error;

/// Classified service error
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Bad or missing request fields; no persistence side effects
    #[error("validation error: {0}")]
    Validation(String),

    /// Unknown document, job, or index key
    #[error("not found: {0}")]
    NotFound(String),

    /// Version/dimension mismatch against an existing index
    #[error("conflict: {0}")]
    Conflict(String),

    /// External service (LLM, embedder, reranker) unavailable or timed out
    #[error("dependency unavailable: {0}")]
    Dependency(String),

    /// Retryable failure (lock timeout, database busy)
    #[error("transient failure: {0}")]
    Transient(String),

    /// Unrecoverable failure (corrupt store, unreadable index file)
    #[error("fatal: {0}")]
    Fatal(String),
}

impl ServiceError {
    /// HTTP status code for this error kind
    pub fn status_code(&self) -> u16 {
        match self {
            ServiceError::Validation(_) => 400,
            ServiceError::NotFound(_) => 404,
            ServiceError::Conflict(_) => 500,
            ServiceError::Dependency(_) => 503,
            ServiceError::Transient(_) => 503,
            ServiceError::Fatal(_) => 500,
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        ServiceError::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        ServiceError::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        ServiceError::Conflict(msg.into())
    }
}

/// Map an `anyhow` error back to the taxonomy: if a `ServiceError` is in the
/// chain, use its classification, otherwise treat the failure as fatal.
pub fn classify(err: &anyhow::Error) -> (u16, String) {
    for cause in err.chain() {
        if let Some(service_err) = cause.downcast_ref::<ServiceError>() {
            return (service_err.status_code(), service_err.to_string());
        }
    }
    (500, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_status_codes() {
        assert_eq!(ServiceError::validation("x").status_code(), 400);
        assert_eq!(ServiceError::not_found("x").status_code(), 404);
        assert_eq!(ServiceError::conflict("x").status_code(), 500);
        assert_eq!(ServiceError::Dependency("x".into()).status_code(), 503);
        assert_eq!(ServiceError::Transient("x".into()).status_code(), 503);
    }

    #[test]
    fn test_classify_finds_service_error_in_chain() {
        let err = anyhow::Error::from(ServiceError::not_found("doc d1"))
            .context("while deleting document");
        let (status, msg) = classify(&err);
        assert_eq!(status, 404);
        assert!(msg.contains("doc d1"));
    }

    #[test]
    fn test_classify_defaults_to_500() {
        let err = anyhow::anyhow!("something broke");
        let (status, _) = classify(&err);
        assert_eq!(status, 500);
    }
}

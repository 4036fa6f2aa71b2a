use kgquery_common::SpecError;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    /// Rejected before reaching the engine. Never retried.
    #[error("invalid query specification: {0}")]
    InvalidSpecification(String),

    /// The engine call failed. Not retried here and never cached.
    #[error("query execution failed after {elapsed_secs:.3}s: {source}")]
    ExecutionFailure {
        elapsed_secs: f64,
        #[source]
        source: BoxError,
    },

    /// Internal cache fault. The optimizer absorbs this and runs uncached.
    #[error("query cache unavailable: {0}")]
    CacheUnavailable(String),
}

impl QueryError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        QueryError::InvalidSpecification(msg.into())
    }

    pub fn execution(elapsed_secs: f64, err: anyhow::Error) -> Self {
        QueryError::ExecutionFailure {
            elapsed_secs,
            source: err.into(),
        }
    }

    pub fn is_invalid_specification(&self) -> bool {
        matches!(self, QueryError::InvalidSpecification(_))
    }
}

impl From<SpecError> for QueryError {
    fn from(err: SpecError) -> Self {
        QueryError::InvalidSpecification(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_execution_failure_keeps_source() {
        let err = QueryError::execution(0.25, anyhow::anyhow!("connection reset"));
        assert!(err.to_string().contains("0.250s"));
        assert_eq!(err.source().map(|s| s.to_string()).as_deref(), Some("connection reset"));
    }

    #[test]
    fn test_spec_error_maps_to_invalid() {
        let err: QueryError = SpecError::UnknownDirection("up".into()).into();
        assert!(err.is_invalid_specification());
    }
}

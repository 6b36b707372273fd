//! MQ-003: Error taxonomy.
//!
//! Registry errors are fatal at startup. Compile and execution errors end a
//! request with an `error` event. Unclear specifications are not errors at
//! the pipeline level; they become clarifying questions.

use super::types::{Ambiguity, OperationTag};
use thiserror::Error;

/// Registry construction failures. Raised only while building the catalog.
#[derive(Debug, Error, PartialEq)]
pub enum RegistryError {
    #[error("operation '{0}' registered twice")]
    Duplicate(OperationTag),
    #[error("operation '{0}' has a payload shape but no builder")]
    MissingBuilder(OperationTag),
    #[error("operation '{0}' has a builder but no payload shape")]
    MissingShape(OperationTag),
    #[error("schema for '{tag}' could not be derived: {reason}")]
    Schema { tag: OperationTag, reason: String },
    #[error("table name '{0}' is not a plain SQL identifier")]
    InvalidTable(String),
}

/// A required facet is unresolved.
#[derive(Debug, Error, PartialEq)]
#[error("question is ambiguous: {}", join_ambiguities(.unclear))]
pub struct SpecificationError {
    pub unclear: Vec<Ambiguity>,
}

fn join_ambiguities(items: &[Ambiguity]) -> String {
    items
        .iter()
        .map(|a| a.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Error, PartialEq)]
pub enum CompileError {
    #[error(transparent)]
    Unresolved(#[from] SpecificationError),
    #[error("no builder registered for operation '{0}'")]
    Unregistered(OperationTag),
    #[error("operation '{expected}' cannot take a '{found}' payload")]
    PayloadMismatch {
        expected: OperationTag,
        found: OperationTag,
    },
    #[error("operation '{0}' requires a payload")]
    MissingPayload(OperationTag),
    #[error("invalid period: {0}")]
    InvalidPeriod(String),
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExecutionError {
    #[error("data engine error: {0}")]
    Engine(String),
    #[error("query exceeded {0} ms")]
    Timeout(u64),
    #[error("query returned more than {0} rows")]
    RowCap(usize),
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProviderError {
    #[error("completion provider unavailable: {0}")]
    Unavailable(String),
    #[error("completion provider exceeded {0} ms")]
    Timeout(u64),
    #[error("completion provider returned malformed output: {0}")]
    Malformed(String),
    #[error("client disconnected")]
    Disconnected,
}

/// Failures that end a request.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("client disconnected")]
    Disconnected,
}

impl PipelineError {
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            Self::Disconnected | Self::Provider(ProviderError::Disconnected)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mq003_messages() {
        let e = SpecificationError {
            unclear: vec![Ambiguity::Year, Ambiguity::Metric],
        };
        assert_eq!(e.to_string(), "question is ambiguous: year, metric");
        let e = CompileError::PayloadMismatch {
            expected: OperationTag::TopN,
            found: OperationTag::Stats,
        };
        assert_eq!(e.to_string(), "operation 'top_n' cannot take a 'stats' payload");
        assert_eq!(
            RegistryError::Duplicate(OperationTag::Backtest).to_string(),
            "operation 'backtest' registered twice"
        );
    }

    #[test]
    fn test_mq003_disconnect_detection() {
        assert!(PipelineError::Disconnected.is_disconnect());
        assert!(PipelineError::Provider(ProviderError::Disconnected).is_disconnect());
        assert!(!PipelineError::Execution(ExecutionError::RowCap(10)).is_disconnect());
    }
}

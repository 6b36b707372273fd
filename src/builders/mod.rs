//! Query builders: one SQL-emitting strategy per operation tag.
//!
//! Each builder:
//! 1. Bounds rows by symbol and half-open period
//! 2. ANDs in the caller's filter fragment
//! 3. Shapes or aggregates per its operation

pub mod aggregate;
pub mod backtest;
pub mod common;
pub mod comparison;
pub mod correlation;
pub mod extremum;
pub mod stats;
pub mod top_n;

use crate::core::compiler::BuilderRegistry;
use crate::core::error::RegistryError;

/// Registry holding every built-in builder.
pub fn builtin() -> Result<BuilderRegistry, RegistryError> {
    let mut registry = BuilderRegistry::new();
    registry.register(Box::new(aggregate::AggregateBuilder))?;
    registry.register(Box::new(top_n::TopNBuilder))?;
    registry.register(Box::new(extremum::ExtremumBuilder))?;
    registry.register(Box::new(correlation::CorrelationBuilder))?;
    registry.register(Box::new(comparison::ComparisonBuilder))?;
    registry.register(Box::new(backtest::BacktestBuilder))?;
    registry.register(Box::new(stats::StatsBuilder))?;
    Ok(registry)
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::OperationTag;

    #[test]
    fn test_mq009_builtin_has_one_builder_per_tag() {
        let registry = builtin().unwrap();
        assert_eq!(registry.len(), OperationTag::ALL.len());
        for tag in OperationTag::ALL {
            assert_eq!(registry.get(tag).map(|b| b.tag()), Some(tag));
        }
    }

    #[test]
    fn test_mq009_registration_order_is_stable() {
        let tags: Vec<OperationTag> = builtin().unwrap().tags().collect();
        assert_eq!(tags, OperationTag::ALL.to_vec());
    }
}

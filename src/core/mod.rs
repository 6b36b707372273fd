//! Core query logic: types, conditions, periods, schema, compilation, configuration.

pub mod compiler;
pub mod condition;
pub mod error;
pub mod parser;
pub mod period;
pub mod schema;
pub mod types;

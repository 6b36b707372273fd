//! marketql: natural-language analytics over daily market bars.
//!
//! Questions become typed query specifications, specifications compile to
//! parameterized SQL, and every request streams its progress as JSON events.

pub mod builders;
pub mod cli;
pub mod core;
pub mod engine;
pub mod pipeline;
pub mod provider;
pub mod stream;
pub mod understand;

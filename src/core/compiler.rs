//! MQ-005: Query compiler. Builder registry, catalog, parameterized SQL.
//!
//! Builders never splice specification values into SQL text. Every value
//! goes through `SqlWriter::bind*`, which appends a positional `?` and
//! records the parameter. Identifiers come from closed enums or from the
//! table name validated when the catalog is built.

use super::error::{CompileError, RegistryError, SpecificationError};
use super::period;
use super::schema::SchemaRegistry;
use super::types::{Ambiguity, DateRange, Metric, OperationTag, QuerySpecification};
use crate::builders;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

// ============================================================================
// Parameters and SQL assembly
// ============================================================================

/// A bound query parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SqlParam {
    Text(String),
    Integer(i64),
    Real(f64),
}

impl fmt::Display for SqlParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(s) => write!(f, "'{}'", s.replace('\'', "''")),
            Self::Integer(i) => write!(f, "{}", i),
            Self::Real(r) => write!(f, "{}", r),
        }
    }
}

/// Trusted SQL supplied by the caller, ANDed into every builder's predicate.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FilterFragment {
    pub sql: String,
    pub params: Vec<SqlParam>,
}

impl FilterFragment {
    pub fn new(sql: impl Into<String>, params: Vec<SqlParam>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}

/// Append-only SQL text with positional parameters in text order.
#[derive(Debug, Default)]
pub struct SqlWriter {
    sql: String,
    params: Vec<SqlParam>,
}

impl SqlWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, text: &str) -> &mut Self {
        self.sql.push_str(text);
        self
    }

    pub fn bind(&mut self, param: SqlParam) -> &mut Self {
        self.sql.push('?');
        self.params.push(param);
        self
    }

    pub fn bind_text(&mut self, value: impl Into<String>) -> &mut Self {
        self.bind(SqlParam::Text(value.into()))
    }

    pub fn bind_int(&mut self, value: i64) -> &mut Self {
        self.bind(SqlParam::Integer(value))
    }

    pub fn bind_real(&mut self, value: f64) -> &mut Self {
        self.bind(SqlParam::Real(value))
    }

    /// Append a caller fragment together with its own parameters.
    pub fn fragment(&mut self, fragment: &FilterFragment) -> &mut Self {
        self.sql.push_str(&fragment.sql);
        self.params.extend(fragment.params.iter().cloned());
        self
    }

    pub fn into_parts(self) -> (String, Vec<SqlParam>) {
        (self.sql, self.params)
    }

    pub fn finish(self, tag: OperationTag) -> CompiledQuery {
        CompiledQuery {
            tag,
            sql: self.sql,
            params: self.params,
        }
    }
}

/// SQL text plus its bound parameters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompiledQuery {
    pub tag: OperationTag,
    pub sql: String,
    pub params: Vec<SqlParam>,
}

impl CompiledQuery {
    /// BLAKE3 over the SQL text and parameters. Returns `"blake3:{hex}"`.
    pub fn fingerprint(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.sql.as_bytes());
        for p in &self.params {
            hasher.update(b"\0");
            match p {
                SqlParam::Text(s) => {
                    hasher.update(b"t");
                    hasher.update(s.as_bytes());
                }
                SqlParam::Integer(i) => {
                    hasher.update(b"i");
                    hasher.update(&i.to_le_bytes());
                }
                SqlParam::Real(r) => {
                    hasher.update(b"r");
                    hasher.update(&r.to_bits().to_le_bytes());
                }
            }
        }
        format!("blake3:{}", hasher.finalize().to_hex())
    }
}

// ============================================================================
// Builders
// ============================================================================

/// Everything a builder may read.
pub struct BuildContext<'a> {
    pub spec: &'a QuerySpecification,
    pub table: &'a str,
    pub extra: Option<&'a FilterFragment>,
}

impl BuildContext<'_> {
    pub fn symbol(&self) -> Result<&str, CompileError> {
        self.spec
            .filters
            .symbol
            .resolved()
            .map(String::as_str)
            .ok_or_else(|| unresolved(Ambiguity::Symbol))
    }

    pub fn window(&self) -> Result<DateRange, CompileError> {
        let spec = self
            .spec
            .filters
            .period
            .resolved()
            .ok_or_else(|| unresolved(Ambiguity::Period))?;
        period::resolve(spec)
    }

    pub fn metric(&self) -> Result<Metric, CompileError> {
        self.spec
            .metric
            .resolved()
            .copied()
            .ok_or_else(|| unresolved(Ambiguity::Metric))
    }
}

fn unresolved(facet: Ambiguity) -> CompileError {
    CompileError::Unresolved(SpecificationError {
        unclear: vec![facet],
    })
}

/// SQL-emitting strategy for one operation tag.
pub trait QueryBuilder: Send + Sync {
    fn tag(&self) -> OperationTag;
    fn build(&self, ctx: &BuildContext<'_>) -> Result<CompiledQuery, CompileError>;
}

/// Operation tag to builder, fixed once constructed.
#[derive(Default)]
pub struct BuilderRegistry {
    builders: IndexMap<OperationTag, Box<dyn QueryBuilder>>,
}

impl BuilderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, builder: Box<dyn QueryBuilder>) -> Result<(), RegistryError> {
        let tag = builder.tag();
        if self.builders.contains_key(&tag) {
            return Err(RegistryError::Duplicate(tag));
        }
        self.builders.insert(tag, builder);
        Ok(())
    }

    pub fn get(&self, tag: OperationTag) -> Option<&dyn QueryBuilder> {
        self.builders.get(&tag).map(|b| b.as_ref())
    }

    pub fn tags(&self) -> impl Iterator<Item = OperationTag> + '_ {
        self.builders.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.builders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.builders.is_empty()
    }
}

// ============================================================================
// Catalog
// ============================================================================

/// The schema and builder registries, checked against each other.
pub struct Catalog {
    schema: SchemaRegistry,
    builders: BuilderRegistry,
    table: String,
}

impl Catalog {
    /// Fails unless every registered shape has a builder and vice versa.
    pub fn new(
        schema: SchemaRegistry,
        builders: BuilderRegistry,
        table: &str,
    ) -> Result<Self, RegistryError> {
        if !is_identifier(table) {
            return Err(RegistryError::InvalidTable(table.to_string()));
        }
        for tag in schema.tags() {
            if builders.get(tag).is_none() {
                return Err(RegistryError::MissingBuilder(tag));
            }
        }
        for tag in builders.tags() {
            if !schema.contains(tag) {
                return Err(RegistryError::MissingShape(tag));
            }
        }
        Ok(Self {
            schema,
            builders,
            table: table.to_string(),
        })
    }

    /// All built-in operations over `table`, ready to share across requests.
    pub fn builtin(table: &str) -> Result<Arc<Self>, RegistryError> {
        let schema = SchemaRegistry::builtin()?;
        let builders = builders::builtin()?;
        Ok(Arc::new(Self::new(schema, builders, table)?))
    }

    pub fn schema(&self) -> &SchemaRegistry {
        &self.schema
    }

    pub fn builders(&self) -> &BuilderRegistry {
        &self.builders
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Dispatch a resolved specification to its builder.
    pub fn compile(
        &self,
        spec: &QuerySpecification,
        extra: Option<&FilterFragment>,
    ) -> Result<CompiledQuery, CompileError> {
        let unclear = spec.unclear();
        if !unclear.is_empty() {
            return Err(SpecificationError { unclear }.into());
        }
        let tag = spec
            .tag()
            .ok_or_else(|| unresolved(Ambiguity::Operation))?;
        let builder = self
            .builders
            .get(tag)
            .ok_or(CompileError::Unregistered(tag))?;
        match &spec.payload {
            Some(p) if p.tag() != tag => {
                return Err(CompileError::PayloadMismatch {
                    expected: tag,
                    found: p.tag(),
                })
            }
            None if self.schema.payload_required(tag) => {
                return Err(CompileError::MissingPayload(tag))
            }
            _ => {}
        }
        if tag.needs_metric() && !spec.metric.is_resolved() {
            return Err(unresolved(Ambiguity::Metric));
        }
        if !spec.filters.symbol.is_resolved() {
            return Err(unresolved(Ambiguity::Symbol));
        }
        if tag.needs_period() && !spec.filters.period.is_resolved() {
            return Err(unresolved(Ambiguity::Period));
        }
        let ctx = BuildContext {
            spec,
            table: &self.table,
            extra: extra.filter(|f| !f.sql.trim().is_empty()),
        };
        let query = builder.build(&ctx)?;
        tracing::debug!(tag = %tag, params = query.params.len(), "compiled query");
        Ok(query)
    }
}

/// `[A-Za-z_][A-Za-z0-9_]*`
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

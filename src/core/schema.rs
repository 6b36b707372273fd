//! MQ-006: Schema registry. Payload shapes and the derived tool schema.
//!
//! The tool schema handed to a completion provider is generated from the
//! registered payload types, and provider proposals are checked against
//! the same registrations. Adding an operation means registering its
//! payload here and its builder in `builders`; nothing else changes.

use super::condition::Condition;
use super::error::RegistryError;
use super::types::{
    AggregatePayload, BacktestPayload, ComparisonPayload, CorrelationPayload, ExtremumPayload,
    Facet, Filters, Metric, OperationPayload, OperationTag, PeriodSpec, QuerySpecification,
    SortSpec, StatsPayload, TopNPayload, Weekday,
};
use indexmap::IndexMap;
use schemars::gen::{SchemaGenerator, SchemaSettings};
use schemars::schema::Schema;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

/// Name of the derived tool.
pub const TOOL_NAME: &str = "extract_query_specification";

/// Top-level fields a proposal may carry.
pub const PROPOSAL_FIELDS: [&str; 9] = [
    "operation",
    "metric",
    "symbol",
    "period",
    "weekday",
    "condition",
    "sort",
    "limit",
    "payload",
];

struct Shape {
    description: &'static str,
    required: bool,
    fields: Vec<String>,
    required_fields: Vec<String>,
    subschema: fn(&mut SchemaGenerator) -> Schema,
}

fn subschema<P: JsonSchema>(gen: &mut SchemaGenerator) -> Schema {
    gen.subschema_for::<P>()
}

/// Operation tag to payload shape, fixed once constructed.
#[derive(Default)]
pub struct SchemaRegistry {
    shapes: IndexMap<OperationTag, Shape>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every built-in operation.
    pub fn builtin() -> Result<Self, RegistryError> {
        let mut r = Self::new();
        r.register::<AggregatePayload>(
            OperationTag::Aggregate,
            "Aggregate the metric over the period, optionally grouped by year, month or weekday",
            true,
        )?;
        r.register::<TopNPayload>(
            OperationTag::TopN,
            "The n bars ranked highest (or lowest) by the sort key",
            true,
        )?;
        r.register::<ExtremumPayload>(
            OperationTag::Extremum,
            "The single bar holding the maximum or minimum of the metric",
            true,
        )?;
        r.register::<CorrelationPayload>(
            OperationTag::Correlation,
            "Pearson correlation between two metrics over the period",
            true,
        )?;
        r.register::<ComparisonPayload>(
            OperationTag::Comparison,
            "The same aggregate of the metric over two or more periods",
            true,
        )?;
        r.register::<BacktestPayload>(
            OperationTag::Backtest,
            "Enter whenever the condition holds and exit after hold_bars bars",
            true,
        )?;
        r.register::<StatsPayload>(
            OperationTag::Stats,
            "Count, mean, min, max, sum and standard deviation of the metric",
            false,
        )?;
        Ok(r)
    }

    /// Register the payload shape for `tag`. `required` is false only for
    /// operations whose payload carries no parameters.
    pub fn register<P: JsonSchema>(
        &mut self,
        tag: OperationTag,
        description: &'static str,
        required: bool,
    ) -> Result<(), RegistryError> {
        if self.shapes.contains_key(&tag) {
            return Err(RegistryError::Duplicate(tag));
        }
        let root = schemars::schema_for!(P);
        if let Some(ty) = &root.schema.instance_type {
            if !ty.contains(&schemars::schema::InstanceType::Object) {
                return Err(RegistryError::Schema {
                    tag,
                    reason: "payload must be an object".to_string(),
                });
            }
        }
        let (fields, required_fields) = match root.schema.object.as_deref() {
            Some(obj) => (
                obj.properties.keys().cloned().collect(),
                obj.required.iter().cloned().collect(),
            ),
            None => (Vec::new(), Vec::new()),
        };
        self.shapes.insert(
            tag,
            Shape {
                description,
                required,
                fields,
                required_fields,
                subschema: subschema::<P>,
            },
        );
        Ok(())
    }

    pub fn tags(&self) -> impl Iterator<Item = OperationTag> + '_ {
        self.shapes.keys().copied()
    }

    pub fn contains(&self, tag: OperationTag) -> bool {
        self.shapes.contains_key(&tag)
    }

    pub fn len(&self) -> usize {
        self.shapes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shapes.is_empty()
    }

    pub fn description(&self, tag: OperationTag) -> Option<&'static str> {
        self.shapes.get(&tag).map(|s| s.description)
    }

    /// Whether a specification for `tag` must carry a payload.
    pub fn payload_required(&self, tag: OperationTag) -> bool {
        self.shapes.get(&tag).is_some_and(|s| s.required)
    }

    /// Payload field names for `tag`, in declaration order.
    pub fn fields(&self, tag: OperationTag) -> &[String] {
        self.shapes
            .get(&tag)
            .map(|s| s.fields.as_slice())
            .unwrap_or(&[])
    }

    /// The machine-callable tool schema: `{name, description, parameters, operations}`.
    pub fn derive(&self) -> Value {
        let mut gen = SchemaSettings::draft07().into_generator();
        let variants: Vec<Value> = self
            .shapes
            .iter()
            .map(|(tag, shape)| {
                json!({
                    "title": tag.as_str(),
                    "description": shape.description,
                    "allOf": [(shape.subschema)(&mut gen)],
                })
            })
            .collect();
        let operations: Vec<Value> = self
            .shapes
            .iter()
            .map(|(tag, shape)| {
                json!({
                    "operation": tag.as_str(),
                    "description": shape.description,
                    "payload_required": shape.required,
                })
            })
            .collect();
        let tags: Vec<&str> = self.tags().map(OperationTag::as_str).collect();
        let metric = gen.subschema_for::<Metric>();
        let period = gen.subschema_for::<PeriodSpec>();
        let weekday = gen.subschema_for::<Weekday>();
        let condition = gen.subschema_for::<Condition>();
        let sort = gen.subschema_for::<SortSpec>();
        let definitions = gen.take_definitions();
        json!({
            "name": TOOL_NAME,
            "description": "Describe a market-data question as a typed query specification. \
                            Leave out any field the question does not determine.",
            "parameters": {
                "type": "object",
                "additionalProperties": false,
                "required": ["operation"],
                "properties": {
                    "operation": {"type": "string", "enum": tags},
                    "metric": metric,
                    "symbol": {"type": "string"},
                    "period": period,
                    "weekday": weekday,
                    "condition": condition,
                    "sort": sort,
                    "limit": {"type": "integer", "minimum": 1},
                    "payload": {"oneOf": variants},
                },
                "definitions": definitions,
            },
            "operations": operations,
        })
    }

    /// Check a provider proposal against the registered shapes only.
    ///
    /// Returns a specification whose facets are resolved exactly where the
    /// proposal named a value and absent elsewhere.
    pub fn check_proposal(&self, proposal: &Value) -> Result<QuerySpecification, Vec<ProposalIssue>> {
        let Some(obj) = proposal.as_object() else {
            return Err(vec![ProposalIssue::NotAnObject]);
        };
        let mut issues = Vec::new();
        for key in obj.keys() {
            if !PROPOSAL_FIELDS.contains(&key.as_str()) {
                issues.push(ProposalIssue::UnknownField { field: key.clone() });
            }
        }

        let tag = match obj.get("operation") {
            None | Some(Value::Null) => None,
            Some(Value::String(name)) => match OperationTag::from_name(name) {
                Some(tag) if self.contains(tag) => Some(tag),
                _ => {
                    issues.push(ProposalIssue::UnregisteredOperation { name: name.clone() });
                    None
                }
            },
            Some(other) => {
                issues.push(ProposalIssue::UnregisteredOperation {
                    name: other.to_string(),
                });
                None
            }
        };

        let payload = obj.get("payload").filter(|v| !v.is_null());
        match (tag, payload) {
            (Some(tag), Some(Value::Object(fields))) => {
                let shape = &self.shapes[&tag];
                for key in fields.keys() {
                    if !shape.fields.contains(key) {
                        issues.push(ProposalIssue::UnknownPayloadField {
                            operation: tag,
                            field: key.clone(),
                        });
                    }
                }
                for key in &shape.required_fields {
                    if !fields.contains_key(key) {
                        issues.push(ProposalIssue::MissingPayloadField {
                            operation: tag,
                            field: key.clone(),
                        });
                    }
                }
            }
            (Some(_), Some(other)) => issues.push(ProposalIssue::Malformed {
                message: format!("payload must be an object, got {}", other),
            }),
            (Some(tag), None) if self.payload_required(tag) => {
                issues.push(ProposalIssue::MissingPayload { operation: tag })
            }
            (None, Some(_)) if !obj.contains_key("operation") => {
                issues.push(ProposalIssue::PayloadWithoutOperation)
            }
            _ => {}
        }

        if !issues.is_empty() {
            return Err(issues);
        }

        let raw: RawProposal = serde_json::from_value(proposal.clone()).map_err(|e| {
            vec![ProposalIssue::Malformed {
                message: e.to_string(),
            }]
        })?;
        raw.into_specification(tag).map_err(|message| vec![ProposalIssue::Malformed { message }])
    }
}

/// Why a provider proposal was rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Error)]
#[serde(tag = "issue", rename_all = "snake_case")]
pub enum ProposalIssue {
    #[error("proposal is not a JSON object")]
    NotAnObject,
    #[error("unknown field '{field}'")]
    UnknownField { field: String },
    #[error("operation '{name}' is not registered")]
    UnregisteredOperation { name: String },
    #[error("'{operation}' payload has no field '{field}'")]
    UnknownPayloadField {
        operation: OperationTag,
        field: String,
    },
    #[error("'{operation}' payload is missing '{field}'")]
    MissingPayloadField {
        operation: OperationTag,
        field: String,
    },
    #[error("operation '{operation}' requires a payload")]
    MissingPayload { operation: OperationTag },
    #[error("payload given without an operation")]
    PayloadWithoutOperation,
    #[error("malformed proposal: {message}")]
    Malformed { message: String },
}

/// Proposal body after the registry checks pass.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawProposal {
    #[serde(default)]
    #[allow(dead_code)]
    operation: Option<OperationTag>,
    #[serde(default)]
    metric: Option<Metric>,
    #[serde(default)]
    symbol: Option<String>,
    #[serde(default)]
    period: Option<PeriodSpec>,
    #[serde(default)]
    weekday: Option<Weekday>,
    #[serde(default)]
    condition: Option<Condition>,
    #[serde(default)]
    sort: Option<SortSpec>,
    #[serde(default)]
    limit: Option<u32>,
    #[serde(default)]
    payload: Option<Value>,
}

fn facet<T>(value: Option<T>) -> Facet<T> {
    value.map_or(Facet::Absent, Facet::Resolved)
}

impl RawProposal {
    fn into_specification(self, tag: Option<OperationTag>) -> Result<QuerySpecification, String> {
        let payload = match (tag, self.payload) {
            (Some(tag), Some(value)) => Some(
                OperationPayload::from_value(tag, value)
                    .map_err(|e| format!("{} payload: {}", tag, e))?,
            ),
            _ => None,
        };
        Ok(QuerySpecification {
            operation: facet(tag),
            metric: facet(self.metric),
            payload,
            filters: Filters {
                symbol: facet(self.symbol),
                period: facet(self.period),
                weekday: self.weekday,
                condition: self.condition,
            },
            sort: self.sort,
            limit: self.limit,
        })
    }
}

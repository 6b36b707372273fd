//! MQ-001: Core types. Operations, metrics, periods, facets, specifications.
//!
//! A `QuerySpecification` is the typed description of what a question asks
//! for. Every facet the understanding step may fail to resolve is modelled
//! as a `Facet<T>`, so "unclear" is a state the compiler and pipeline must
//! match on rather than a missing field.

use super::condition::Condition;
use chrono::NaiveDate;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::ops::{Add, AddAssign};
use std::path::PathBuf;

// ============================================================================
// Operations
// ============================================================================

/// Closed set of operation kinds a question can resolve to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum OperationTag {
    Aggregate,
    TopN,
    Extremum,
    Correlation,
    Comparison,
    Backtest,
    Stats,
}

impl OperationTag {
    pub const ALL: [OperationTag; 7] = [
        Self::Aggregate,
        Self::TopN,
        Self::Extremum,
        Self::Correlation,
        Self::Comparison,
        Self::Backtest,
        Self::Stats,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Aggregate => "aggregate",
            Self::TopN => "top_n",
            Self::Extremum => "extremum",
            Self::Correlation => "correlation",
            Self::Comparison => "comparison",
            Self::Backtest => "backtest",
            Self::Stats => "stats",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == name)
    }

    /// Operations that read a single metric column.
    pub fn needs_metric(self) -> bool {
        !matches!(self, Self::Correlation | Self::Backtest)
    }

    /// Operations bounded by the specification's own period.
    /// Comparison carries its periods in the payload instead.
    pub fn needs_period(self) -> bool {
        !matches!(self, Self::Comparison)
    }
}

impl fmt::Display for OperationTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Metrics
// ============================================================================

/// Row fields and derived expressions over a daily bar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Open,
    High,
    Low,
    Close,
    Volume,
    /// close - open
    Change,
    /// percent move from open to close
    ChangePct,
    /// high - low, the intraday volatility
    Range,
    /// high - low as a percent of open
    RangePct,
}

/// Spoken names for metrics, longest first so multi-word aliases win.
pub const METRIC_ALIASES: &[(&str, Metric)] = &[
    ("percent change", Metric::ChangePct),
    ("percent range", Metric::RangePct),
    ("closing price", Metric::Close),
    ("opening price", Metric::Open),
    ("pct change", Metric::ChangePct),
    ("range pct", Metric::RangePct),
    ("change_pct", Metric::ChangePct),
    ("range_pct", Metric::RangePct),
    ("volatility", Metric::Range),
    ("volatile", Metric::Range),
    ("returns", Metric::ChangePct),
    ("closing", Metric::Close),
    ("opening", Metric::Open),
    ("return", Metric::ChangePct),
    ("volume", Metric::Volume),
    ("change", Metric::Change),
    ("gains", Metric::ChangePct),
    ("range", Metric::Range),
    ("price", Metric::Close),
    ("close", Metric::Close),
    ("gain", Metric::ChangePct),
    ("open", Metric::Open),
    ("high", Metric::High),
    ("low", Metric::Low),
];

impl Metric {
    pub const ALL: [Metric; 9] = [
        Self::Open,
        Self::High,
        Self::Low,
        Self::Close,
        Self::Volume,
        Self::Change,
        Self::ChangePct,
        Self::Range,
        Self::RangePct,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::High => "high",
            Self::Low => "low",
            Self::Close => "close",
            Self::Volume => "volume",
            Self::Change => "change",
            Self::ChangePct => "change_pct",
            Self::Range => "range",
            Self::RangePct => "range_pct",
        }
    }

    /// Fixed SQL expression for the metric. Never built from user text.
    pub fn sql_expr(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::High => "high",
            Self::Low => "low",
            Self::Close => "close",
            Self::Volume => "volume",
            Self::Change => "(close - open)",
            Self::ChangePct => "((close - open) * 100.0 / open)",
            Self::Range => "(high - low)",
            Self::RangePct => "((high - low) * 100.0 / open)",
        }
    }

    /// Resolve a canonical name or spoken alias (case-insensitive).
    pub fn from_alias(word: &str) -> Option<Self> {
        let word = word.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|m| m.as_str() == word)
            .or_else(|| {
                METRIC_ALIASES
                    .iter()
                    .find(|(alias, _)| *alias == word)
                    .map(|(_, m)| *m)
            })
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Payloads
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum AggregateFunc {
    #[default]
    Avg,
    Sum,
    Min,
    Max,
    Count,
}

impl AggregateFunc {
    pub fn sql_name(self) -> &'static str {
        match self {
            Self::Avg => "AVG",
            Self::Sum => "SUM",
            Self::Min => "MIN",
            Self::Max => "MAX",
            Self::Count => "COUNT",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Avg => "average",
            Self::Sum => "total",
            Self::Min => "minimum",
            Self::Max => "maximum",
            Self::Count => "count",
        }
    }
}

/// Bucketing for grouped aggregates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Grouping {
    #[default]
    None,
    Year,
    Month,
    Weekday,
}

impl Grouping {
    pub fn bucket_expr(self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::Year => Some("strftime('%Y', timestamp)"),
            Self::Month => Some("strftime('%Y-%m', timestamp)"),
            Self::Weekday => Some("CAST(strftime('%w', timestamp) AS INTEGER)"),
        }
    }
}

/// Aggregate a metric over the window, optionally bucketed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct AggregatePayload {
    pub func: AggregateFunc,
    #[serde(default)]
    pub group_by: Grouping,
}

/// Rank rows by the sort key and keep the first `n`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct TopNPayload {
    pub n: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ExtremumKind {
    Max,
    Min,
}

/// Single row holding the global max or min of the metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ExtremumPayload {
    pub kind: ExtremumKind,
}

/// Pearson correlation between two metrics over the window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct CorrelationPayload {
    pub left: Metric,
    pub right: Metric,
}

/// The same aggregate over two or more periods.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ComparisonPayload {
    pub periods: Vec<PeriodSpec>,
    #[serde(default)]
    pub func: AggregateFunc,
}

fn default_hold_bars() -> u32 {
    1
}

/// Enter on every bar where `entry` holds, exit `hold_bars` bars later.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct BacktestPayload {
    pub entry: Condition,
    #[serde(default = "default_hold_bars")]
    pub hold_bars: u32,
}

/// Descriptive statistics. No parameters beyond the metric.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct StatsPayload {}

/// Exactly one payload case per operation tag.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum OperationPayload {
    Aggregate(AggregatePayload),
    TopN(TopNPayload),
    Extremum(ExtremumPayload),
    Correlation(CorrelationPayload),
    Comparison(ComparisonPayload),
    Backtest(BacktestPayload),
    Stats(StatsPayload),
}

impl OperationPayload {
    pub fn tag(&self) -> OperationTag {
        match self {
            Self::Aggregate(_) => OperationTag::Aggregate,
            Self::TopN(_) => OperationTag::TopN,
            Self::Extremum(_) => OperationTag::Extremum,
            Self::Correlation(_) => OperationTag::Correlation,
            Self::Comparison(_) => OperationTag::Comparison,
            Self::Backtest(_) => OperationTag::Backtest,
            Self::Stats(_) => OperationTag::Stats,
        }
    }

    /// Decode the payload object for a known tag.
    pub fn from_value(tag: OperationTag, value: serde_json::Value) -> Result<Self, serde_json::Error> {
        Ok(match tag {
            OperationTag::Aggregate => Self::Aggregate(serde_json::from_value(value)?),
            OperationTag::TopN => Self::TopN(serde_json::from_value(value)?),
            OperationTag::Extremum => Self::Extremum(serde_json::from_value(value)?),
            OperationTag::Correlation => Self::Correlation(serde_json::from_value(value)?),
            OperationTag::Comparison => Self::Comparison(serde_json::from_value(value)?),
            OperationTag::Backtest => Self::Backtest(serde_json::from_value(value)?),
            OperationTag::Stats => Self::Stats(serde_json::from_value(value)?),
        })
    }
}

// ============================================================================
// Periods
// ============================================================================

/// A period as the question named it. Resolves to a half-open `DateRange`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum PeriodSpec {
    Year { year: i32 },
    Quarter { year: i32, quarter: u32 },
    Month { year: i32, month: u32 },
    Day { date: NaiveDate },
    /// `end` is exclusive.
    Range { start: NaiveDate, end: NaiveDate },
}

const MONTH_NAMES: [&str; 12] = [
    "January", "February", "March", "April", "May", "June", "July", "August", "September",
    "October", "November", "December",
];

impl fmt::Display for PeriodSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Year { year } => write!(f, "{}", year),
            Self::Quarter { year, quarter } => write!(f, "Q{} {}", quarter, year),
            Self::Month { year, month } => {
                let name = MONTH_NAMES
                    .get((*month as usize).wrapping_sub(1))
                    .copied()
                    .unwrap_or("?");
                write!(f, "{} {}", name, year)
            }
            Self::Day { date } => write!(f, "{}", date),
            Self::Range { start, end } => write!(f, "{} to {} (exclusive)", start, end),
        }
    }
}

/// Half-open date window `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, String> {
        if start >= end {
            return Err(format!("period start {} must be before end {}", start, end));
        }
        Ok(Self { start, end })
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Weekday {
    Mon,
    Tue,
    Wed,
    Thu,
    Fri,
    Sat,
    Sun,
}

impl Weekday {
    /// SQLite `strftime('%w')` numbering: Sunday = 0.
    pub fn sqlite_index(self) -> i64 {
        match self {
            Self::Sun => 0,
            Self::Mon => 1,
            Self::Tue => 2,
            Self::Wed => 3,
            Self::Thu => 4,
            Self::Fri => 5,
            Self::Sat => 6,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.to_ascii_lowercase();
        let name = name.trim_end_matches('s');
        Some(match name {
            "mon" | "monday" => Self::Mon,
            "tue" | "tues" | "tuesday" => Self::Tue,
            "wed" | "wednesday" => Self::Wed,
            "thu" | "thur" | "thurs" | "thursday" => Self::Thu,
            "fri" | "friday" => Self::Fri,
            "sat" | "saturday" => Self::Sat,
            "sun" | "sunday" => Self::Sun,
            _ => return None,
        })
    }
}

// ============================================================================
// Facets
// ============================================================================

/// Why a facet could not be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ambiguity {
    Operation,
    Metric,
    Symbol,
    Period,
    /// A month or quarter was named without a year.
    Year,
}

impl fmt::Display for Ambiguity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Operation => "operation",
            Self::Metric => "metric",
            Self::Symbol => "symbol",
            Self::Period => "period",
            Self::Year => "year",
        })
    }
}

/// A facet of the specification: resolved, explicitly unclear, or not mentioned.
#[derive(Debug, Clone, PartialEq)]
pub enum Facet<T> {
    Resolved(T),
    Unclear(Ambiguity),
    Absent,
}

impl<T> Default for Facet<T> {
    fn default() -> Self {
        Self::Absent
    }
}

impl<T> Facet<T> {
    pub fn resolved(&self) -> Option<&T> {
        match self {
            Self::Resolved(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, Self::Resolved(_))
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }

    pub fn ambiguity(&self) -> Option<Ambiguity> {
        match self {
            Self::Unclear(a) => Some(*a),
            _ => None,
        }
    }
}

impl<T: PartialEq> Facet<T> {
    /// Combine two findings for the same facet.
    ///
    /// Resolved beats unclear beats absent; two different resolved values
    /// collapse to `Unclear(on_conflict)`.
    pub fn merge(self, other: Facet<T>, on_conflict: Ambiguity) -> Facet<T> {
        match (self, other) {
            (Self::Absent, other) => other,
            (this, Self::Absent) => this,
            (Self::Unclear(_), Self::Resolved(v)) => Self::Resolved(v),
            (Self::Resolved(a), Self::Resolved(b)) => {
                if a == b {
                    Self::Resolved(a)
                } else {
                    Self::Unclear(on_conflict)
                }
            }
            (this, _) => this,
        }
    }
}

impl<T: Serialize> Serialize for Facet<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        struct UnclearRepr {
            unclear: Ambiguity,
        }
        match self {
            Self::Resolved(v) => v.serialize(serializer),
            Self::Unclear(a) => UnclearRepr { unclear: *a }.serialize(serializer),
            Self::Absent => serializer.serialize_none(),
        }
    }
}

// ============================================================================
// Specification
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    pub fn sql(self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct SortSpec {
    pub key: Metric,
    #[serde(default)]
    pub order: SortOrder,
}

/// Row filters shared by every operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Filters {
    pub symbol: Facet<String>,
    pub period: Facet<PeriodSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weekday: Option<Weekday>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
}

/// The resolved, typed description of a question.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QuerySpecification {
    pub operation: Facet<OperationTag>,
    pub metric: Facet<Metric>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<OperationPayload>,
    pub filters: Filters,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort: Option<SortSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

impl QuerySpecification {
    /// Every facet that is explicitly unclear, in a stable order.
    pub fn unclear(&self) -> Vec<Ambiguity> {
        let mut out = Vec::new();
        let facets = [
            self.operation.ambiguity(),
            self.metric.ambiguity(),
            self.filters.symbol.ambiguity(),
            self.filters.period.ambiguity(),
        ];
        for a in facets.into_iter().flatten() {
            if !out.contains(&a) {
                out.push(a);
            }
        }
        out
    }

    pub fn tag(&self) -> Option<OperationTag> {
        self.operation.resolved().copied()
    }
}

// ============================================================================
// Usage accounting
// ============================================================================

/// Token and cost accounting for external completion calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub thinking_tokens: u64,
    pub cost: f64,
}

impl Add for Usage {
    type Output = Usage;

    fn add(self, rhs: Usage) -> Usage {
        Usage {
            input_tokens: self.input_tokens + rhs.input_tokens,
            output_tokens: self.output_tokens + rhs.output_tokens,
            thinking_tokens: self.thinking_tokens + rhs.thinking_tokens,
            cost: self.cost + rhs.cost,
        }
    }
}

impl AddAssign for Usage {
    fn add_assign(&mut self, rhs: Usage) {
        *self = *self + rhs;
    }
}

// ============================================================================
// marketql.yaml
// ============================================================================

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketqlConfig {
    /// Schema version (must be "1.0")
    pub version: String,

    /// Where the bars live
    pub data: DataConfig,

    /// Orchestration limits
    #[serde(default)]
    pub pipeline: PipelinePolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// SQLite database path
    pub database: PathBuf,

    /// Table holding the bars
    #[serde(default = "default_table")]
    pub table: String,

    /// Symbol universe recognised in questions
    #[serde(default)]
    pub symbols: Vec<String>,

    /// Symbol used when a question names none
    #[serde(default)]
    pub default_symbol: Option<String>,
}

fn default_table() -> String {
    "bars".to_string()
}

/// Limits applied to every request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelinePolicy {
    /// Narrator rewrites allowed after the first attempt
    #[serde(default = "default_max_rewrites")]
    pub max_rewrites: u32,

    /// Hard cap on rows returned by one query
    #[serde(default = "default_row_cap")]
    pub row_cap: usize,

    /// Data executor timeout
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,

    /// Completion provider and narrator timeout
    #[serde(default = "default_provider_timeout_ms")]
    pub provider_timeout_ms: u64,

    /// Events buffered per request before the producer waits
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl Default for PipelinePolicy {
    fn default() -> Self {
        Self {
            max_rewrites: default_max_rewrites(),
            row_cap: default_row_cap(),
            query_timeout_ms: default_query_timeout_ms(),
            provider_timeout_ms: default_provider_timeout_ms(),
            event_buffer: default_event_buffer(),
        }
    }
}

fn default_max_rewrites() -> u32 {
    2
}

fn default_row_cap() -> usize {
    5000
}

fn default_query_timeout_ms() -> u64 {
    5000
}

fn default_provider_timeout_ms() -> u64 {
    30_000
}

fn default_event_buffer() -> usize {
    256
}

// ============================================================================
// Tests
// ============================================================================

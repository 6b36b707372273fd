//! MQ-050: Understander. Question text plus prior turns to a typed specification.
//!
//! Two phases. [`Understander::rules`] runs every rule chunk, merges their
//! findings, inherits context from the previous turn and marks whatever a
//! query still needs as unclear. When the operation or metric is still
//! unresolved the caller may ask a completion provider and hand the
//! proposal to [`Understander::fallback`], which accepts it only after the
//! schema registry has checked it.

pub mod chunks;
pub mod router;

use crate::core::compiler::Catalog;
use crate::core::schema::ProposalIssue;
use crate::core::types::{
    AggregateFunc, Ambiguity, DataConfig, Facet, Filters, Metric, OperationPayload, OperationTag,
    QuerySpecification, SortOrder, SortSpec, StatsPayload,
};
use crate::provider::ExtractionRequest;
use chrono::{Local, NaiveDate};
use chunks::{ChunkInput, Findings, RuleChunk};
use router::{Route, Router};
use serde_json::Value;
use std::sync::Arc;

/// Reference date for relative periods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Clock {
    System,
    Fixed(NaiveDate),
}

impl Clock {
    pub fn today(self) -> NaiveDate {
        match self {
            Self::System => Local::now().date_naive(),
            Self::Fixed(date) => date,
        }
    }
}

/// An earlier question in the same conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct Turn {
    pub question: String,
    pub spec: QuerySpecification,
}

pub struct Understander {
    catalog: Arc<Catalog>,
    chunks: Vec<Box<dyn RuleChunk>>,
    router: Router,
    symbols: Vec<String>,
    default_symbol: Option<String>,
    clock: Clock,
    tool: Value,
}

impl Understander {
    pub fn new(catalog: Arc<Catalog>, data: &DataConfig) -> Self {
        let tool = catalog.schema().derive();
        Self {
            chunks: chunks::standard(&data.symbols),
            router: Router::new(chunks::standard(&data.symbols), &data.symbols),
            symbols: data.symbols.clone(),
            default_symbol: data.default_symbol.clone(),
            clock: Clock::System,
            catalog,
            tool,
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn today(&self) -> NaiveDate {
        self.clock.today()
    }

    pub fn chunk_names(&self) -> Vec<&'static str> {
        self.chunks.iter().map(|c| c.name()).collect()
    }

    /// Derived tool schema handed to the completion provider.
    pub fn tool(&self) -> &Value {
        &self.tool
    }

    pub fn route(&self, question: &str) -> Route {
        self.router.route(question, self.today())
    }

    /// Merged findings of every chunk, before context and settling.
    pub fn findings(&self, question: &str) -> Findings {
        let lower = question.to_lowercase();
        let input = ChunkInput {
            text: &lower,
            today: self.today(),
        };
        self.chunks
            .iter()
            .map(|c| c.apply(&input))
            .fold(Findings::default(), Findings::merge)
    }

    /// Rule phase: chunks, inheritance from the last turn, then settling.
    pub fn rules(&self, question: &str, history: &[Turn]) -> QuerySpecification {
        let mut found = self.findings(question);
        if let Some(prev) = history.last().map(|t| &t.spec) {
            inherit(&mut found, prev);
        }
        if found.symbol.is_absent() {
            if let Some(symbol) = &self.default_symbol {
                found.symbol = Facet::Resolved(symbol.clone());
            }
        }
        let order = found.order;
        let spec = QuerySpecification {
            operation: found.operation,
            metric: found.metric,
            payload: found.payload,
            filters: Filters {
                symbol: found.symbol,
                period: found.period,
                weekday: found.weekday,
                condition: found.condition,
            },
            sort: None,
            limit: None,
        };
        self.settle(spec, order)
    }

    /// True when the provider may still resolve something.
    pub fn needs_fallback(spec: &QuerySpecification) -> bool {
        !spec.operation.is_resolved() || spec.metric.ambiguity().is_some()
    }

    pub fn request<'a>(
        &'a self,
        question: &'a str,
        unresolved: &'a [Ambiguity],
    ) -> ExtractionRequest<'a> {
        ExtractionRequest {
            question,
            tool: &self.tool,
            unresolved,
        }
    }

    /// Merge a checked provider proposal into the still-unresolved facets.
    ///
    /// A rejected proposal leaves `spec` untouched and returns the issues.
    /// A month named without a year stays unclear whatever the proposal says.
    pub fn fallback(
        &self,
        spec: QuerySpecification,
        proposal: &Value,
    ) -> Result<QuerySpecification, Vec<ProposalIssue>> {
        let offered = self.catalog.schema().check_proposal(proposal)?;
        let mut spec = spec;
        let order = spec.sort.map(|s| s.order);
        if let Facet::Resolved(tag) = offered.operation {
            let completes = spec.payload.is_none() && spec.tag() == Some(tag);
            if !spec.operation.is_resolved() || completes {
                spec.operation = Facet::Resolved(tag);
                spec.payload = offered.payload;
            }
        }
        if !spec.metric.is_resolved() && offered.metric.is_resolved() {
            spec.metric = offered.metric;
        }
        if !spec.filters.symbol.is_resolved() {
            if let Facet::Resolved(symbol) = offered.filters.symbol {
                if self.symbols.is_empty() || self.symbols.contains(&symbol) {
                    spec.filters.symbol = Facet::Resolved(symbol);
                }
            }
        }
        let year_unclear = spec.filters.period.ambiguity() == Some(Ambiguity::Year);
        if !spec.filters.period.is_resolved() && !year_unclear && offered.filters.period.is_resolved() {
            spec.filters.period = offered.filters.period;
        }
        spec.filters.weekday = spec.filters.weekday.or(offered.filters.weekday);
        spec.filters.condition = spec.filters.condition.or(offered.filters.condition);
        spec.sort = spec.sort.or(offered.sort);
        spec.limit = spec.limit.or(offered.limit);
        Ok(self.settle(spec, order))
    }

    /// Mark what the operation still needs as unclear and fill derived fields.
    fn settle(&self, mut spec: QuerySpecification, order: Option<SortOrder>) -> QuerySpecification {
        // a bare "metric for period" question is descriptive
        if spec.operation.is_absent() && spec.metric.is_resolved() {
            spec.operation = Facet::Resolved(OperationTag::Stats);
            spec.payload = Some(OperationPayload::Stats(StatsPayload {}));
        }
        match spec.tag() {
            None => {
                if spec.operation.is_absent() {
                    spec.operation = Facet::Unclear(Ambiguity::Operation);
                }
            }
            Some(tag) => {
                if tag == OperationTag::Comparison && spec.payload.is_some() {
                    spec.filters.period = Facet::Absent;
                }
                let counting = matches!(
                    &spec.payload,
                    Some(OperationPayload::Aggregate(p)) if p.func == AggregateFunc::Count
                );
                if counting && spec.metric.is_absent() {
                    spec.metric = Facet::Resolved(Metric::Close);
                }
                if tag.needs_metric() && spec.metric.is_absent() {
                    spec.metric = Facet::Unclear(Ambiguity::Metric);
                }
                if tag.needs_period() && spec.filters.period.is_absent() {
                    spec.filters.period = Facet::Unclear(Ambiguity::Period);
                }
                if let Some(OperationPayload::Backtest(p)) = &spec.payload {
                    if spec.filters.condition.as_ref() == Some(&p.entry) {
                        spec.filters.condition = None;
                    }
                }
                if tag == OperationTag::TopN && spec.sort.is_none() {
                    if let Some(metric) = spec.metric.resolved() {
                        spec.sort = Some(SortSpec {
                            key: *metric,
                            order: order.unwrap_or_default(),
                        });
                    }
                }
                let missing_payload =
                    spec.payload.is_none() && self.catalog.schema().payload_required(tag);
                if missing_payload && spec.unclear().is_empty() {
                    spec.operation = Facet::Unclear(Ambiguity::Operation);
                }
            }
        }
        if spec.filters.symbol.is_absent() {
            spec.filters.symbol = Facet::Unclear(Ambiguity::Symbol);
        }
        spec
    }
}

/// Follow-ups keep the previous symbol and period; a turn that names no
/// operation or metric also keeps the previous question's shape.
fn inherit(found: &mut Findings, prev: &QuerySpecification) {
    if found.symbol.is_absent() {
        if let Some(symbol) = prev.filters.symbol.resolved() {
            found.symbol = Facet::Resolved(symbol.clone());
        }
    }
    if found.period.is_absent() {
        if let Some(period) = prev.filters.period.resolved() {
            found.period = Facet::Resolved(period.clone());
        }
    }
    let shapeless =
        found.operation.is_absent() && found.metric.is_absent() && found.payload.is_none();
    if shapeless && prev.operation.is_resolved() {
        found.operation = prev.operation.clone();
        found.metric = prev.metric.clone();
        found.payload = prev.payload.clone();
        found.weekday = found.weekday.or(prev.filters.weekday);
        found.condition = found.condition.take().or_else(|| prev.filters.condition.clone());
        found.order = found.order.or(prev.sort.map(|s| s.order));
    }
}

/// The question put back to the user for an unclear specification.
pub fn clarifying_question(unclear: &[Ambiguity]) -> String {
    let parts: Vec<&str> = unclear
        .iter()
        .map(|a| match a {
            Ambiguity::Operation => "what you would like to calculate, such as an average or the top days",
            Ambiguity::Metric => "which measure to use, such as close, volume or range",
            Ambiguity::Symbol => "which symbol you mean",
            Ambiguity::Period => "which period you mean",
            Ambiguity::Year => "which year you mean",
        })
        .collect();
    if parts.is_empty() {
        return "Could you rephrase the question?".to_string();
    }
    format!("Could you tell me {}?", parts.join(" and "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::condition::parse;
    use crate::core::types::{BacktestPayload, PeriodSpec, TopNPayload};
    use serde_json::json;
    use std::path::PathBuf;

    fn data_config() -> DataConfig {
        DataConfig {
            database: PathBuf::from("bars.db"),
            table: "bars".to_string(),
            symbols: vec!["NQ".to_string(), "ES".to_string()],
            default_symbol: Some("NQ".to_string()),
        }
    }

    fn understander() -> Understander {
        let catalog = Catalog::builtin("bars").unwrap();
        Understander::new(catalog, &data_config())
            .with_clock(Clock::Fixed(NaiveDate::from_ymd_opt(2024, 5, 15).unwrap()))
    }

    #[test]
    fn test_mq050_volatility_for_2024() {
        let spec = understander().rules("volatility for 2024", &[]);
        assert_eq!(spec.metric, Facet::Resolved(Metric::Range));
        assert_eq!(spec.filters.period, Facet::Resolved(PeriodSpec::Year { year: 2024 }));
        assert_eq!(spec.operation, Facet::Resolved(OperationTag::Stats));
        assert_eq!(spec.filters.symbol, Facet::Resolved("NQ".to_string()));
        assert!(spec.unclear().is_empty());
    }

    #[test]
    fn test_mq050_month_without_year() {
        let spec = understander().rules("average close in March", &[]);
        assert_eq!(spec.unclear(), vec![Ambiguity::Year]);
        assert!(!Understander::needs_fallback(&spec));
    }

    #[test]
    fn test_mq050_without_default_symbol_asks() {
        let catalog = Catalog::builtin("bars").unwrap();
        let mut data = data_config();
        data.default_symbol = None;
        let u = Understander::new(catalog, &data);
        let spec = u.rules("average close in 2023", &[]);
        assert_eq!(spec.unclear(), vec![Ambiguity::Symbol]);
    }

    #[test]
    fn test_mq050_top_n_sort_follows_metric() {
        let spec = understander().rules("worst 3 days by change_pct for ES in 2024", &[]);
        assert_eq!(spec.payload, Some(OperationPayload::TopN(TopNPayload { n: 3 })));
        assert_eq!(
            spec.sort,
            Some(SortSpec {
                key: Metric::ChangePct,
                order: SortOrder::Asc,
            })
        );
        assert_eq!(spec.filters.symbol, Facet::Resolved("ES".to_string()));
    }

    #[test]
    fn test_mq050_backtest_condition_not_duplicated() {
        let spec = understander().rules("backtest buying when change_pct < -1 in January 2024", &[]);
        assert_eq!(
            spec.payload,
            Some(OperationPayload::Backtest(BacktestPayload {
                entry: parse("change_pct < -1").unwrap(),
                hold_bars: 1,
            }))
        );
        assert_eq!(spec.filters.condition, None);
        assert!(spec.unclear().is_empty());
    }

    #[test]
    fn test_mq050_oversized_hold_asks_instead_of_defaulting() {
        let spec = understander().rules(
            "backtest buying when change_pct < -1 hold 99999999999 days in January 2024",
            &[],
        );
        assert_eq!(spec.payload, None);
        assert_eq!(spec.unclear(), vec![Ambiguity::Operation]);
        assert!(Understander::needs_fallback(&spec));
    }

    #[test]
    fn test_mq050_follow_up_inherits() {
        let u = understander();
        let first = u.rules("average close for ES in Q1 2024", &[]);
        let history = vec![Turn {
            question: "average close for ES in Q1 2024".into(),
            spec: first.clone(),
        }];
        let next = u.rules("and in 2023?", &history);
        assert_eq!(next.operation, first.operation);
        assert_eq!(next.metric, first.metric);
        assert_eq!(next.filters.symbol, Facet::Resolved("ES".to_string()));
        assert_eq!(next.filters.period, Facet::Resolved(PeriodSpec::Year { year: 2023 }));

        let other = u.rules("highest volume", &history);
        assert_eq!(other.operation, Facet::Resolved(OperationTag::Extremum));
        assert_eq!(
            other.filters.period,
            Facet::Resolved(PeriodSpec::Quarter {
                year: 2024,
                quarter: 1
            })
        );
    }

    #[test]
    fn test_mq050_unknown_operation_needs_fallback() {
        let spec = understander().rules("how did things go in 2024", &[]);
        assert_eq!(spec.operation, Facet::Unclear(Ambiguity::Operation));
        assert!(Understander::needs_fallback(&spec));
    }

    #[test]
    fn test_mq050_fallback_fills_unresolved() {
        let u = understander();
        let spec = u.rules("how did things go in 2024", &[]);
        let proposal = json!({
            "operation": "aggregate",
            "metric": "close",
            "payload": {"func": "avg", "group_by": "month"}
        });
        let merged = u.fallback(spec, &proposal).unwrap();
        assert_eq!(merged.operation, Facet::Resolved(OperationTag::Aggregate));
        assert_eq!(merged.metric, Facet::Resolved(Metric::Close));
        assert_eq!(merged.filters.period, Facet::Resolved(PeriodSpec::Year { year: 2024 }));
        assert!(merged.unclear().is_empty());
    }

    #[test]
    fn test_mq050_fallback_rejects_unregistered_field() {
        let u = understander();
        let spec = u.rules("how did things go in 2024", &[]);
        let proposal = json!({"operation": "stats", "metric": "close", "mood": "bullish"});
        let issues = u.fallback(spec, &proposal).unwrap_err();
        assert!(issues
            .iter()
            .any(|i| matches!(i, ProposalIssue::UnknownField { field } if field == "mood")));
    }

    #[test]
    fn test_mq050_fallback_keeps_year_unclear() {
        let u = understander();
        let spec = u.rules("how did things go in March", &[]);
        assert_eq!(spec.filters.period, Facet::Unclear(Ambiguity::Year));
        let proposal = json!({
            "operation": "stats",
            "metric": "close",
            "period": {"kind": "month", "year": 2024, "month": 3}
        });
        let merged = u.fallback(spec, &proposal).unwrap();
        assert_eq!(merged.filters.period, Facet::Unclear(Ambiguity::Year));
        assert_eq!(merged.unclear(), vec![Ambiguity::Year]);
    }

    #[test]
    fn test_mq050_clarifying_question() {
        assert_eq!(
            clarifying_question(&[Ambiguity::Year]),
            "Could you tell me which year you mean?"
        );
        assert!(clarifying_question(&[Ambiguity::Symbol, Ambiguity::Period]).contains(" and "));
    }
}

//! MQ-042: Template narrator. Deterministic prose built only from result cells.
//!
//! Every figure it writes comes straight out of the row set or the
//! specification, so its output always passes the grounding validator.

use super::{fragments, FragmentSink, NarrationRequest, Narrator, Subject};
use crate::core::error::ProviderError;
use crate::core::types::{
    ExtremumKind, Grouping, Metric, OperationPayload, OperationTag, QuerySpecification, Usage,
};
use crate::engine::RowSet;
use async_trait::async_trait;

const CONVERSATION_REPLY: &str = "I answer questions about daily market bars: averages and totals, \
top days, highs and lows, correlations, period comparisons, backtests and summary statistics. \
Try asking for the average close of a symbol in a given month.";

const WEEKDAY_NAMES: [&str; 7] = [
    "Sunday",
    "Monday",
    "Tuesday",
    "Wednesday",
    "Thursday",
    "Friday",
    "Saturday",
];

pub struct TemplateNarrator;

#[async_trait]
impl Narrator for TemplateNarrator {
    async fn narrate(
        &self,
        request: &NarrationRequest<'_>,
        sink: &mut dyn FragmentSink,
    ) -> Result<Usage, ProviderError> {
        let text = match request.subject {
            Subject::Data { spec, rows, .. } => describe(spec, rows),
            Subject::Conversation => CONVERSATION_REPLY.to_string(),
        };
        for part in fragments(&text) {
            sink.fragment(part).await?;
        }
        let cells = match request.subject {
            Subject::Data { rows, .. } => rows.len() * rows.columns.len().max(1),
            Subject::Conversation => 0,
        };
        Ok(Usage {
            input_tokens: estimate_tokens(request.question) + (cells as u64) * 2,
            output_tokens: estimate_tokens(&text),
            thinking_tokens: 0,
            cost: 0.0,
        })
    }
}

/// Roughly four characters per token.
fn estimate_tokens(text: &str) -> u64 {
    (text.len() as u64).div_ceil(4)
}

/// Integers print bare; everything else gets at most `decimals` places.
pub fn fmt_num(value: f64, decimals: usize) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        return format!("{}", value as i64);
    }
    let text = format!("{:.*}", decimals, value);
    if text.contains('.') {
        text.trim_end_matches('0').trim_end_matches('.').to_string()
    } else {
        text
    }
}

fn metric_label(metric: Metric) -> &'static str {
    match metric {
        Metric::Open => "open",
        Metric::High => "high",
        Metric::Low => "low",
        Metric::Close => "close",
        Metric::Volume => "volume",
        Metric::Change => "change",
        Metric::ChangePct => "percent change",
        Metric::Range => "range",
        Metric::RangePct => "percent range",
    }
}

/// ` for NQ in January 2024`, leaving out whatever is unresolved.
fn scope(spec: &QuerySpecification) -> String {
    let mut out = String::new();
    if let Some(symbol) = spec.filters.symbol.resolved() {
        out.push_str(" for ");
        out.push_str(symbol);
    }
    if let Some(period) = spec.filters.period.resolved() {
        out.push_str(" in ");
        out.push_str(&period.to_string());
    }
    if let Some(day) = spec.filters.weekday {
        let name = WEEKDAY_NAMES[day.sqlite_index() as usize];
        out.push_str(&format!(" on {}s", name));
    }
    if let Some(condition) = &spec.filters.condition {
        out.push_str(&format!(" when {}", condition));
    }
    out
}

fn num(rows: &RowSet, row: usize, column: &str) -> Option<String> {
    rows.f64(row, column).map(|v| fmt_num(v, 2))
}

/// Narrate one result set.
pub fn describe(spec: &QuerySpecification, rows: &RowSet) -> String {
    let metric = spec
        .metric
        .resolved()
        .map(|m| metric_label(*m))
        .unwrap_or("value");
    let where_ = scope(spec);
    let no_data = format!("No bars matched{}.", where_);
    let Some(tag) = spec.tag() else {
        return no_data;
    };
    match (tag, &spec.payload) {
        (OperationTag::Aggregate, Some(OperationPayload::Aggregate(p))) => {
            if p.group_by == Grouping::None {
                match (num(rows, 0, "value"), num(rows, 0, "bars")) {
                    (Some(value), Some(bars)) => format!(
                        "The {} {}{} was {} across {} bars.",
                        p.func.as_str(),
                        metric,
                        where_,
                        value,
                        bars
                    ),
                    _ => no_data,
                }
            } else if rows.is_empty() {
                no_data
            } else {
                let parts: Vec<String> = (0..rows.len())
                    .filter_map(|i| {
                        let value = num(rows, i, "value")?;
                        Some(format!("{} {}", bucket_label(rows, i), value))
                    })
                    .collect();
                format!(
                    "The {} {}{} by {} was {}.",
                    p.func.as_str(),
                    metric,
                    where_,
                    grouping_label(p.group_by),
                    parts.join("; ")
                )
            }
        }
        (OperationTag::TopN, _) => {
            if rows.is_empty() {
                return no_data;
            }
            let parts: Vec<String> = (0..rows.len())
                .filter_map(|i| {
                    Some(format!(
                        "{} ({})",
                        rows.text(i, "timestamp")?,
                        num(rows, i, "value")?
                    ))
                })
                .collect();
            format!(
                "The top {} days by {}{} were {}.",
                rows.len(),
                metric,
                where_,
                parts.join(", ")
            )
        }
        (OperationTag::Extremum, Some(OperationPayload::Extremum(p))) => {
            let word = match p.kind {
                ExtremumKind::Max => "highest",
                ExtremumKind::Min => "lowest",
            };
            match (num(rows, 0, "value"), rows.text(0, "timestamp")) {
                (Some(value), Some(day)) => {
                    format!("The {} {}{} was {} on {}.", word, metric, where_, value, day)
                }
                _ => no_data,
            }
        }
        (OperationTag::Correlation, Some(OperationPayload::Correlation(p))) => {
            let n = num(rows, 0, "n").unwrap_or_else(|| "0".to_string());
            let pair = format!("{} and {}", metric_label(p.left), metric_label(p.right));
            match rows.f64(0, "correlation") {
                Some(r) => format!(
                    "The correlation between {}{} was {} over {} bars.",
                    pair,
                    where_,
                    fmt_num(r, 3),
                    n
                ),
                None => format!(
                    "The correlation between {}{} is undefined over {} bars because one of the series does not vary.",
                    pair, where_, n
                ),
            }
        }
        (OperationTag::Comparison, Some(OperationPayload::Comparison(p))) => {
            let parts: Vec<String> = (0..rows.len())
                .map(|i| {
                    let label = rows.text(i, "period").unwrap_or("?");
                    match num(rows, i, "value") {
                        Some(value) => format!("{} {}", label, value),
                        None => format!("{} had no bars", label),
                    }
                })
                .collect();
            if parts.is_empty() {
                return no_data;
            }
            format!(
                "The {} {}{} was {}.",
                p.func.as_str(),
                metric,
                where_,
                parts.join(" versus ")
            )
        }
        (OperationTag::Backtest, Some(OperationPayload::Backtest(p))) => {
            let trades = rows.f64(0, "trades").unwrap_or(0.0);
            let setup = format!(
                "Entering when {} and holding {} bars{}",
                p.entry,
                p.hold_bars,
                where_
            );
            if trades == 0.0 {
                return format!("{} produced no trades.", setup);
            }
            let pct = |column: &str| {
                num(rows, 0, column)
                    .map(|v| format!("{}%", v))
                    .unwrap_or_else(|| "n/a".to_string())
            };
            format!(
                "{} produced {} trades with {} wins and {} losses, a win rate of {}. \
                 The average return was {}, the best {} and the worst {}.",
                setup,
                fmt_num(trades, 2),
                num(rows, 0, "wins").unwrap_or_else(|| "0".to_string()),
                num(rows, 0, "losses").unwrap_or_else(|| "0".to_string()),
                pct("win_rate"),
                pct("avg_return"),
                pct("best_return"),
                pct("worst_return"),
            )
        }
        (OperationTag::Stats, _) => {
            match rows.f64(0, "count") {
                Some(count) if count > 0.0 => format!(
                    "The {}{} over {} bars had a mean of {}, a minimum of {}, a maximum of {}, a sum of {} and a standard deviation of {}.",
                    metric,
                    where_,
                    fmt_num(count, 2),
                    num(rows, 0, "mean").unwrap_or_default(),
                    num(rows, 0, "min").unwrap_or_default(),
                    num(rows, 0, "max").unwrap_or_default(),
                    num(rows, 0, "sum").unwrap_or_default(),
                    num(rows, 0, "stddev").unwrap_or_default(),
                ),
                _ => no_data,
            }
        }
        _ => no_data,
    }
}

fn grouping_label(grouping: Grouping) -> &'static str {
    match grouping {
        Grouping::None => "window",
        Grouping::Year => "year",
        Grouping::Month => "month",
        Grouping::Weekday => "weekday",
    }
}

/// Weekday buckets come back as SQLite day numbers.
fn bucket_label(rows: &RowSet, row: usize) -> String {
    if let Some(text) = rows.text(row, "bucket") {
        return text.to_string();
    }
    match rows.f64(row, "bucket") {
        Some(day) if (0.0..7.0).contains(&day) => WEEKDAY_NAMES[day as usize].to_string(),
        Some(other) => fmt_num(other, 2),
        None => "?".to_string(),
    }
}

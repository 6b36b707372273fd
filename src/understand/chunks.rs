//! MQ-051: Rule chunks. Independent recognisers that each report findings.
//!
//! A chunk looks at the lowercased question and fills in only the facets
//! it knows about. Chunks never look at each other's output; the
//! understander merges their findings with [`Findings::merge`].

use crate::builders::backtest::MAX_HOLD_BARS;
use crate::core::condition::{self, Condition};
use crate::core::types::{
    AggregateFunc, AggregatePayload, Ambiguity, BacktestPayload, ComparisonPayload,
    CorrelationPayload, ExtremumKind, ExtremumPayload, Facet, Grouping, Metric, OperationPayload,
    OperationTag, PeriodSpec, SortOrder, StatsPayload, TopNPayload, Weekday, METRIC_ALIASES,
};
use chrono::{Datelike, Duration, Months, NaiveDate};
use regex::{Captures, Regex};
use std::sync::OnceLock;

macro_rules! static_regex {
    ($pattern:expr) => {{
        static RE: OnceLock<Regex> = OnceLock::new();
        RE.get_or_init(|| Regex::new($pattern).expect("static regex"))
    }};
}

/// Holding period when a backtest question names none.
pub const DEFAULT_HOLD_BARS: u32 = 1;

/// Row count for "top days" without a number.
pub const DEFAULT_TOP_N: u32 = 10;

/// What a chunk sees.
#[derive(Debug, Clone, Copy)]
pub struct ChunkInput<'a> {
    /// Lowercased question text.
    pub text: &'a str,
    /// Reference date for relative periods.
    pub today: NaiveDate,
}

/// Partial facets reported by one or more chunks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Findings {
    pub operation: Facet<OperationTag>,
    pub payload: Option<OperationPayload>,
    pub metric: Facet<Metric>,
    pub symbol: Facet<String>,
    pub period: Facet<PeriodSpec>,
    pub weekday: Option<Weekday>,
    pub condition: Option<Condition>,
    /// Ranking direction for top-N questions.
    pub order: Option<SortOrder>,
}

impl Findings {
    /// Combine two findings. Conflicting resolved values become unclear.
    pub fn merge(self, other: Findings) -> Findings {
        let payload_conflict =
            matches!((&self.payload, &other.payload), (Some(a), Some(b)) if a != b);
        let mut operation = self.operation.merge(other.operation, Ambiguity::Operation);
        let payload = if payload_conflict {
            operation = Facet::Unclear(Ambiguity::Operation);
            None
        } else {
            self.payload.or(other.payload)
        };
        Findings {
            operation,
            payload,
            metric: self.metric.merge(other.metric, Ambiguity::Metric),
            symbol: self.symbol.merge(other.symbol, Ambiguity::Symbol),
            period: self.period.merge(other.period, Ambiguity::Period),
            weekday: self.weekday.or(other.weekday),
            condition: self.condition.or(other.condition),
            order: self.order.or(other.order),
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Findings::default()
    }
}

/// One independent recogniser.
pub trait RuleChunk: Send + Sync {
    fn name(&self) -> &'static str;
    fn apply(&self, input: &ChunkInput<'_>) -> Findings;
}

/// The standard chunk set for a symbol universe.
pub fn standard(symbols: &[String]) -> Vec<Box<dyn RuleChunk>> {
    vec![
        Box::new(AbsolutePeriod),
        Box::new(RelativePeriod),
        Box::new(MetricChunk),
        Box::new(SymbolChunk::new(symbols)),
        Box::new(OperationChunk),
        Box::new(WeekdayChunk),
        Box::new(ConditionChunk),
    ]
}

/// A period mention and where it starts in the text.
pub type Mention = (usize, Facet<PeriodSpec>);

fn fold_mentions(mentions: Vec<Mention>) -> Facet<PeriodSpec> {
    mentions
        .into_iter()
        .fold(Facet::Absent, |acc, (_, f)| acc.merge(f, Ambiguity::Period))
}

/// Blank out a matched span so later patterns skip it.
fn mask(text: &mut String, start: usize, end: usize) {
    text.replace_range(start..end, &" ".repeat(end - start));
}

fn date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()
}

fn cap_num<T: std::str::FromStr>(caps: &Captures<'_>, i: usize) -> Option<T> {
    caps.get(i)?.as_str().parse().ok()
}

// ============================================================================
// Periods
// ============================================================================

const MONTHS: [(&str, u32); 24] = [
    ("january", 1),
    ("february", 2),
    ("march", 3),
    ("april", 4),
    ("may", 5),
    ("june", 6),
    ("july", 7),
    ("august", 8),
    ("september", 9),
    ("october", 10),
    ("november", 11),
    ("december", 12),
    ("jan", 1),
    ("feb", 2),
    ("mar", 3),
    ("apr", 4),
    ("jun", 6),
    ("jul", 7),
    ("aug", 8),
    ("sept", 9),
    ("sep", 9),
    ("oct", 10),
    ("nov", 11),
    ("dec", 12),
];

fn month_number(name: &str) -> Option<u32> {
    MONTHS
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, m)| *m)
}

/// True when the number at `start..end` reads as a year rather than a
/// quantity (`volume > 2000`, `2000.5`).
fn reads_as_year(text: &str, start: usize, end: usize) -> bool {
    let before = text[..start].trim_end();
    let after = &text[end..];
    if after.starts_with('.') && after[1..].starts_with(|c: char| c.is_ascii_digit()) {
        return false;
    }
    const QUANTITY_CUES: [&str; 11] = [
        ">", "<", "=", "-", "above", "below", "under", "than", "exceeds", "top", "bottom",
    ];
    !QUANTITY_CUES.iter().any(|cue| before.ends_with(cue))
}

/// Every absolute period mention in text order.
pub fn absolute_mentions(text: &str) -> Vec<Mention> {
    let mut work = text.to_string();
    let mut out: Vec<Mention> = Vec::new();

    let range = static_regex!(
        r"\b(?:from|between)\s+(\d{4}-\d{2}-\d{2})\s+(?:to|and|until|through|thru)\s+(\d{4}-\d{2}-\d{2})\b"
    );
    for caps in range.captures_iter(text) {
        let Some(m) = caps.get(0) else { continue };
        // the spoken end date is inclusive
        let facet = match (date(&caps[1]), date(&caps[2]).and_then(|d| d.succ_opt())) {
            (Some(start), Some(end)) if start < end => Facet::Resolved(PeriodSpec::Range { start, end }),
            _ => Facet::Unclear(Ambiguity::Period),
        };
        out.push((m.start(), facet));
        mask(&mut work, m.start(), m.end());
    }

    let quarter = static_regex!(r"\bq([1-4])(?:\s+of)?,?\s+(\d{4})\b|\b(\d{4})\s*-?\s*q([1-4])\b");
    let snapshot = work.clone();
    for caps in quarter.captures_iter(&snapshot) {
        let Some(m) = caps.get(0) else { continue };
        let (year, quarter) = if caps.get(1).is_some() {
            (cap_num(&caps, 2), cap_num(&caps, 1))
        } else {
            (cap_num(&caps, 3), cap_num(&caps, 4))
        };
        if let (Some(year), Some(quarter)) = (year, quarter) {
            out.push((m.start(), Facet::Resolved(PeriodSpec::Quarter { year, quarter })));
            mask(&mut work, m.start(), m.end());
        }
    }

    let month_year = static_regex!(
        r"\b(january|february|march|april|may|june|july|august|september|october|november|december|jan|feb|mar|apr|jun|jul|aug|sept|sep|oct|nov|dec)\.?(?:\s+of)?,?\s+(\d{4})\b"
    );
    let snapshot = work.clone();
    for caps in month_year.captures_iter(&snapshot) {
        let Some(m) = caps.get(0) else { continue };
        if let (Some(month), Some(year)) = (month_number(&caps[1]), cap_num(&caps, 2)) {
            out.push((m.start(), Facet::Resolved(PeriodSpec::Month { year, month })));
            mask(&mut work, m.start(), m.end());
        }
    }

    let iso_day = static_regex!(r"\b(\d{4}-\d{2}-\d{2})\b");
    let snapshot = work.clone();
    for caps in iso_day.captures_iter(&snapshot) {
        let Some(m) = caps.get(0) else { continue };
        let facet = match date(&caps[1]) {
            Some(date) => Facet::Resolved(PeriodSpec::Day { date }),
            None => Facet::Unclear(Ambiguity::Period),
        };
        out.push((m.start(), facet));
        mask(&mut work, m.start(), m.end());
    }

    let iso_month = static_regex!(r"\b(\d{4})-(\d{2})\b");
    let snapshot = work.clone();
    for caps in iso_month.captures_iter(&snapshot) {
        let Some(m) = caps.get(0) else { continue };
        let year: Option<i32> = cap_num(&caps, 1);
        let month: Option<u32> = cap_num(&caps, 2);
        if let (Some(year), Some(month)) = (year, month.filter(|m| (1..=12).contains(m))) {
            out.push((m.start(), Facet::Resolved(PeriodSpec::Month { year, month })));
            mask(&mut work, m.start(), m.end());
        }
    }

    // a month or quarter without a year is unclear, never assumed
    let bare = static_regex!(
        r"\b(?:q[1-4]|january|february|march|april|june|july|august|september|october|november|december)\b"
    );
    let snapshot = work.clone();
    for m in bare.find_iter(&snapshot) {
        out.push((m.start(), Facet::Unclear(Ambiguity::Year)));
        mask(&mut work, m.start(), m.end());
    }

    let year = static_regex!(r"\b(19\d{2}|20\d{2})\b");
    let snapshot = work.clone();
    for caps in year.captures_iter(&snapshot) {
        let Some(m) = caps.get(0) else { continue };
        if !reads_as_year(&snapshot, m.start(), m.end()) {
            continue;
        }
        if let Some(year) = cap_num(&caps, 1) {
            out.push((m.start(), Facet::Resolved(PeriodSpec::Year { year })));
        }
    }

    out.sort_by_key(|(pos, _)| *pos);
    out
}

/// Every relative period mention in text order, resolved against `today`.
pub fn relative_mentions(text: &str, today: NaiveDate) -> Vec<Mention> {
    let mut work = text.to_string();
    let mut out: Vec<Mention> = Vec::new();
    let tomorrow = today.succ_opt().unwrap_or(today);

    let trailing = static_regex!(
        r"\b(?:last|past|previous|trailing|prior)\s+(\d+)\s+(day|week|month|year)s?\b"
    );
    for caps in trailing.captures_iter(text) {
        let Some(m) = caps.get(0) else { continue };
        let n: u32 = cap_num(&caps, 1).unwrap_or(0);
        let start = match &caps[2] {
            "day" => today.checked_sub_signed(Duration::days(i64::from(n))),
            "week" => today.checked_sub_signed(Duration::weeks(i64::from(n))),
            "month" => today.checked_sub_months(Months::new(n)),
            _ => today.checked_sub_months(Months::new(n.saturating_mul(12))),
        };
        // today counts, so the window runs through tomorrow exclusive
        let facet = match start.map(|s| s.succ_opt().unwrap_or(s)) {
            Some(start) if n > 0 && start < tomorrow => Facet::Resolved(PeriodSpec::Range {
                start,
                end: tomorrow,
            }),
            _ => Facet::Unclear(Ambiguity::Period),
        };
        out.push((m.start(), facet));
        mask(&mut work, m.start(), m.end());
    }

    let unit = static_regex!(r"\b(this|current|last|previous|past|prior)\s+(week|month|quarter|year)\b");
    let snapshot = work.clone();
    for caps in unit.captures_iter(&snapshot) {
        let Some(m) = caps.get(0) else { continue };
        let back = !matches!(&caps[1], "this" | "current");
        if let Some(period) = calendar_unit(&caps[2], back, today) {
            out.push((m.start(), Facet::Resolved(period)));
        }
        mask(&mut work, m.start(), m.end());
    }

    let to_date = static_regex!(r"\b(ytd|year[\s-]to[\s-]date|mtd|month[\s-]to[\s-]date)\b");
    let snapshot = work.clone();
    for caps in to_date.captures_iter(&snapshot) {
        let Some(m) = caps.get(0) else { continue };
        let start = if caps[1].starts_with('y') {
            NaiveDate::from_ymd_opt(today.year(), 1, 1)
        } else {
            NaiveDate::from_ymd_opt(today.year(), today.month(), 1)
        };
        if let Some(start) = start {
            out.push((m.start(), Facet::Resolved(PeriodSpec::Range { start, end: tomorrow })));
        }
        mask(&mut work, m.start(), m.end());
    }

    let day = static_regex!(r"\b(today|yesterday)\b");
    let snapshot = work.clone();
    for caps in day.captures_iter(&snapshot) {
        let Some(m) = caps.get(0) else { continue };
        let date = if &caps[1] == "today" {
            Some(today)
        } else {
            today.pred_opt()
        };
        if let Some(date) = date {
            out.push((m.start(), Facet::Resolved(PeriodSpec::Day { date })));
        }
    }

    out.sort_by_key(|(pos, _)| *pos);
    out
}

/// The current (or, when `back`, the previous) calendar unit around `today`.
fn calendar_unit(unit: &str, back: bool, today: NaiveDate) -> Option<PeriodSpec> {
    Some(match unit {
        "week" => {
            let mut start = crate::core::period::week_start(today);
            if back {
                start = start.checked_sub_signed(Duration::days(7))?;
            }
            PeriodSpec::Range {
                start,
                end: start.checked_add_signed(Duration::days(7))?,
            }
        }
        "month" => {
            let date = if back {
                today.checked_sub_months(Months::new(1))?
            } else {
                today
            };
            PeriodSpec::Month {
                year: date.year(),
                month: date.month(),
            }
        }
        "quarter" => {
            let date = if back {
                today.checked_sub_months(Months::new(3))?
            } else {
                today
            };
            PeriodSpec::Quarter {
                year: date.year(),
                quarter: date.month0() / 3 + 1,
            }
        }
        _ => PeriodSpec::Year {
            year: if back { today.year() - 1 } else { today.year() },
        },
    })
}

/// Named dates, months, quarters, ranges and years.
pub struct AbsolutePeriod;

impl RuleChunk for AbsolutePeriod {
    fn name(&self) -> &'static str {
        "absolute_period"
    }

    fn apply(&self, input: &ChunkInput<'_>) -> Findings {
        Findings {
            period: fold_mentions(absolute_mentions(input.text)),
            ..Findings::default()
        }
    }
}

/// Periods relative to the reference date.
pub struct RelativePeriod;

impl RuleChunk for RelativePeriod {
    fn name(&self) -> &'static str {
        "relative_period"
    }

    fn apply(&self, input: &ChunkInput<'_>) -> Findings {
        Findings {
            period: fold_mentions(relative_mentions(input.text, input.today)),
            ..Findings::default()
        }
    }
}

// ============================================================================
// Metric and symbol
// ============================================================================

fn metric_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        let alternatives: Vec<String> = METRIC_ALIASES
            .iter()
            .map(|(alias, _)| regex::escape(alias))
            .collect();
        Regex::new(&format!(r"\b(?:{})\b", alternatives.join("|"))).expect("static regex")
    })
}

/// First metric mentioned in `text`.
pub fn first_metric(text: &str) -> Option<Metric> {
    metric_re()
        .find(text)
        .and_then(|m| Metric::from_alias(m.as_str()))
}

/// Metric vocabulary. The first mention wins.
pub struct MetricChunk;

impl RuleChunk for MetricChunk {
    fn name(&self) -> &'static str {
        "metric"
    }

    fn apply(&self, input: &ChunkInput<'_>) -> Findings {
        Findings {
            metric: first_metric(input.text).map_or(Facet::Absent, Facet::Resolved),
            ..Findings::default()
        }
    }
}

/// Whole-word match against the configured symbol universe.
pub struct SymbolChunk {
    symbols: Vec<(String, String)>,
}

impl SymbolChunk {
    pub fn new(symbols: &[String]) -> Self {
        Self {
            symbols: symbols
                .iter()
                .map(|s| (s.to_lowercase(), s.clone()))
                .collect(),
        }
    }
}

/// Words of `text` with surrounding punctuation removed.
pub fn words(text: &str) -> impl Iterator<Item = &str> {
    text.split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()))
        .filter(|w| !w.is_empty())
}

impl RuleChunk for SymbolChunk {
    fn name(&self) -> &'static str {
        "symbol"
    }

    fn apply(&self, input: &ChunkInput<'_>) -> Findings {
        let symbol = words(input.text)
            .filter_map(|w| self.symbols.iter().find(|(lower, _)| lower == w))
            .fold(Facet::Absent, |acc, (_, original)| {
                acc.merge(Facet::Resolved(original.clone()), Ambiguity::Symbol)
            });
        Findings {
            symbol,
            ..Findings::default()
        }
    }
}

// ============================================================================
// Operation
// ============================================================================

fn aggregate_func(text: &str) -> Option<AggregateFunc> {
    if static_regex!(r"\b(?:average|avg|mean)\b").is_match(text) {
        Some(AggregateFunc::Avg)
    } else if static_regex!(r"\b(?:total|sum|cumulative)\b").is_match(text) {
        Some(AggregateFunc::Sum)
    } else if static_regex!(r"\b(?:how many|count|number of)\b").is_match(text) {
        Some(AggregateFunc::Count)
    } else {
        None
    }
}

fn grouping(text: &str) -> Grouping {
    let re = static_regex!(
        r"\b(?:(?:by|per|each|every)\s+(year|month|weekday|day of (?:the )?week)|(yearly|annual|annually|monthly))\b"
    );
    let Some(caps) = re.captures(text) else {
        return Grouping::None;
    };
    let word = caps.get(1).or_else(|| caps.get(2)).map_or("", |m| m.as_str());
    match word {
        "year" | "yearly" | "annual" | "annually" => Grouping::Year,
        "month" | "monthly" => Grouping::Month,
        _ => Grouping::Weekday,
    }
}

/// Condition after `when` / `if` / `where`, up to the next clause.
pub fn condition_clause(text: &str) -> Option<Condition> {
    let re = static_regex!(
        r"\b(?:when|whenever|where|if)\s+(.+?)\s*(?:,|;|\?|\bhold(?:ing)?\b|\bexit(?:ing)?\b|\bfor\b|\bin\b|\bduring\b|\bon\b|\bthen\b|$)"
    );
    let caps = re.captures(text)?;
    condition::parse(caps.get(1)?.as_str()).ok()
}

/// Holding period in bars. `None` when one is stated but unusable, so the
/// payload stays unresolved instead of taking a made-up value.
fn hold_bars(text: &str) -> Option<u32> {
    let re = static_regex!(
        r"\b(?:hold(?:ing)?|exit(?:ing)?\s+after|for)\s+(?:it\s+)?(?:for\s+)?(\d+)\s+(?:bars?|days?|sessions?)\b"
    );
    let Some(caps) = re.captures(text) else {
        return Some(DEFAULT_HOLD_BARS);
    };
    cap_num::<u32>(&caps, 1).filter(|n| (1..=MAX_HOLD_BARS).contains(n))
}

fn correlation_pair(text: &str) -> Option<CorrelationPayload> {
    let re = static_regex!(
        r"\b(?:between|of)\s+([a-z_ ]+?)\s+(?:and|with|vs\.?|versus|against)\s+([a-z_ ]+?)(?:\s+(?:for|in|during|on|over|across)\b|[?.,]|$)"
    );
    let caps = re.captures(text)?;
    let left = first_metric(caps.get(1)?.as_str())?;
    let right = first_metric(caps.get(2)?.as_str())?;
    (left != right).then_some(CorrelationPayload { left, right })
}

fn top_n(text: &str) -> Option<(u32, SortOrder)> {
    let counted = static_regex!(r"\b(top|bottom|best|worst)\s+(\d+)\b");
    let described = static_regex!(
        r"\b(top|bottom|best|worst|biggest|largest|highest|lowest|smallest)\s+(?:(\d+)\s+)?(?:[a-z_]+\s+)?(?:days|sessions|bars)\b"
    );
    let caps = counted.captures(text).or_else(|| described.captures(text))?;
    let order = match &caps[1] {
        "bottom" | "worst" | "lowest" | "smallest" => SortOrder::Asc,
        _ => SortOrder::Desc,
    };
    let n = caps
        .get(2)
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(DEFAULT_TOP_N);
    Some((n, order))
}

fn extremum(text: &str) -> Option<ExtremumKind> {
    if static_regex!(r"\b(?:highest|max|maximum|biggest|largest|peak|most)\b").is_match(text) {
        Some(ExtremumKind::Max)
    } else if static_regex!(r"\b(?:lowest|min|minimum|smallest|least)\b").is_match(text) {
        Some(ExtremumKind::Min)
    } else {
        None
    }
}

/// Recognises which operation a question asks for, plus its payload.
pub struct OperationChunk;

impl OperationChunk {
    fn detect(&self, input: &ChunkInput<'_>) -> Option<(OperationTag, Option<OperationPayload>, Option<SortOrder>)> {
        let text = input.text;
        if static_regex!(r"\bbacktest\w*\b|\b(?:buy|buying|enter|entering|long)\b[^.?]*\b(?:when|whenever|if)\b")
            .is_match(text)
        {
            let payload = condition_clause(text)
                .zip(hold_bars(text))
                .map(|(entry, hold_bars)| {
                    OperationPayload::Backtest(BacktestPayload { entry, hold_bars })
                });
            return Some((OperationTag::Backtest, payload, None));
        }
        if static_regex!(r"\bcorrelat\w*\b|\bcorr\b").is_match(text) {
            let payload = correlation_pair(text).map(OperationPayload::Correlation);
            return Some((OperationTag::Correlation, payload, None));
        }
        if static_regex!(r"\b(?:compare|compared|comparing|vs\.?|versus)\b").is_match(text) {
            let mut mentions = absolute_mentions(text);
            mentions.extend(relative_mentions(text, input.today));
            mentions.sort_by_key(|(pos, _)| *pos);
            let mut periods: Vec<PeriodSpec> = Vec::new();
            for (_, facet) in mentions {
                if let Facet::Resolved(p) = facet {
                    if !periods.contains(&p) {
                        periods.push(p);
                    }
                }
            }
            let payload = (periods.len() >= 2).then(|| {
                OperationPayload::Comparison(ComparisonPayload {
                    periods,
                    func: aggregate_func(text).unwrap_or_default(),
                })
            });
            return Some((OperationTag::Comparison, payload, None));
        }
        if let Some((n, order)) = top_n(text) {
            let payload = OperationPayload::TopN(TopNPayload { n });
            return Some((OperationTag::TopN, Some(payload), Some(order)));
        }
        if static_regex!(
            r"\b(?:stats|statistics|summary|summari[sz]e|describe|overview|distribution)\b"
        )
        .is_match(text)
        {
            return Some((OperationTag::Stats, Some(OperationPayload::Stats(StatsPayload {})), None));
        }
        if let Some(kind) = extremum(text) {
            let payload = OperationPayload::Extremum(ExtremumPayload { kind });
            return Some((OperationTag::Extremum, Some(payload), None));
        }
        if let Some(func) = aggregate_func(text) {
            let payload = OperationPayload::Aggregate(AggregatePayload {
                func,
                group_by: grouping(text),
            });
            return Some((OperationTag::Aggregate, Some(payload), None));
        }
        None
    }
}

impl RuleChunk for OperationChunk {
    fn name(&self) -> &'static str {
        "operation"
    }

    fn apply(&self, input: &ChunkInput<'_>) -> Findings {
        match self.detect(input) {
            Some((tag, payload, order)) => Findings {
                operation: Facet::Resolved(tag),
                payload,
                order,
                ..Findings::default()
            },
            None => Findings::default(),
        }
    }
}

// ============================================================================
// Row filters
// ============================================================================

/// "on Mondays", "fridays".
pub struct WeekdayChunk;

impl RuleChunk for WeekdayChunk {
    fn name(&self) -> &'static str {
        "weekday"
    }

    fn apply(&self, input: &ChunkInput<'_>) -> Findings {
        let re = static_regex!(r"\b(monday|tuesday|wednesday|thursday|friday|saturday|sunday)s?\b");
        Findings {
            weekday: re.captures(input.text).and_then(|c| Weekday::from_name(&c[1])),
            ..Findings::default()
        }
    }
}

/// `when <condition>` row filters.
pub struct ConditionChunk;

impl RuleChunk for ConditionChunk {
    fn name(&self) -> &'static str {
        "condition"
    }

    fn apply(&self, input: &ChunkInput<'_>) -> Findings {
        Findings {
            condition: condition_clause(input.text),
            ..Findings::default()
        }
    }
}

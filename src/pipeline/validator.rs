//! MQ-061: Grounding validator. Every figure in the narration must come from the data.

use crate::provider::Subject;
use crate::stream::event::ValidationStatus;
use regex::Regex;
use std::sync::OnceLock;

/// A validator's judgement of one narration attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub status: ValidationStatus,
    pub issues: Vec<String>,
    /// Instructions for the next narrator attempt.
    pub feedback: Option<String>,
}

impl Verdict {
    pub fn ok() -> Self {
        Self {
            status: ValidationStatus::Ok,
            issues: Vec::new(),
            feedback: None,
        }
    }
}

pub trait Validator: Send + Sync {
    fn validate(&self, question: &str, subject: &Subject<'_>, narration: &str) -> Verdict;
}

fn date_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b\d{4}-\d{2}-\d{2}\b").expect("static regex"))
}

fn number_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\d{1,3}(?:,\d{3})+(?:\.\d+)?|\d+(?:\.\d+)?").expect("static regex")
    })
}

/// Unsigned numbers written in `text`; thousands separators are accepted.
pub fn numbers_in(text: &str) -> Vec<(String, f64)> {
    number_re()
        .find_iter(text)
        .filter_map(|m| {
            let value = m.as_str().replace(',', "").parse().ok()?;
            Some((m.as_str().to_string(), value))
        })
        .collect()
}

/// Accepts a narration when each date and number in it is found in the
/// result rows, the specification or the question itself.
///
/// Figures are compared as magnitudes, so "fell 2.5%" matches a cell of
/// `-2.5`. An empty narration fails outright.
#[derive(Debug, Clone, Copy)]
pub struct GroundingValidator {
    pub abs_tolerance: f64,
    pub rel_tolerance: f64,
}

impl Default for GroundingValidator {
    fn default() -> Self {
        Self {
            abs_tolerance: 0.01,
            rel_tolerance: 0.001,
        }
    }
}

impl GroundingValidator {
    fn matches(&self, written: f64, known: f64) -> bool {
        (written - known).abs() <= self.abs_tolerance + self.rel_tolerance * known.abs()
    }

    /// Text the narration may quote from, plus raw numeric cells.
    fn sources(question: &str, subject: &Subject<'_>) -> (String, Vec<f64>) {
        let mut text = question.to_string();
        let mut cells = Vec::new();
        if let Subject::Data { spec, rows, .. } = subject {
            if let Ok(json) = serde_json::to_string(spec) {
                text.push('\n');
                text.push_str(&json);
            }
            if let Some(period) = spec.filters.period.resolved() {
                text.push('\n');
                text.push_str(&period.to_string());
            }
            for row in &rows.rows {
                for cell in row {
                    match cell {
                        serde_json::Value::String(s) => {
                            text.push('\n');
                            text.push_str(s);
                        }
                        other => cells.extend(other.as_f64().map(f64::abs)),
                    }
                }
            }
            cells.push(rows.len() as f64);
        }
        (text, cells)
    }
}

impl Validator for GroundingValidator {
    fn validate(&self, question: &str, subject: &Subject<'_>, narration: &str) -> Verdict {
        if narration.trim().is_empty() {
            return Verdict {
                status: ValidationStatus::Failed,
                issues: vec!["narration is empty".to_string()],
                feedback: None,
            };
        }
        let (source_text, mut known) = Self::sources(question, subject);
        known.extend(numbers_in(&source_text).into_iter().map(|(_, v)| v));

        let mut issues = Vec::new();
        for m in date_re().find_iter(narration) {
            if !source_text.contains(m.as_str()) {
                issues.push(format!("date {} is not in the results", m.as_str()));
            }
        }
        let without_dates = date_re().replace_all(narration, " ");
        for (written, value) in numbers_in(&without_dates) {
            if !known.iter().any(|k| self.matches(value, *k)) {
                issues.push(format!("figure {} is not in the results", written));
            }
        }

        if issues.is_empty() {
            return Verdict::ok();
        }
        let feedback = format!(
            "Use only figures and dates that appear in the result rows. Remove or correct: {}.",
            issues.join("; ")
        );
        Verdict {
            status: ValidationStatus::Rewrite,
            issues,
            feedback: Some(feedback),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builders::fixture;
    use crate::core::compiler::Catalog;
    use crate::core::types::{
        AggregateFunc, AggregatePayload, Grouping, Metric, OperationPayload, OperationTag,
    };
    use crate::provider::template::describe;

    /// Validate `narration` against NQ's January 2024 average close;
    /// `None` validates the template narration.
    fn check(narration: Option<&str>) -> Verdict {
        let spec = fixture::spec(
            OperationTag::Aggregate,
            Metric::Close,
            OperationPayload::Aggregate(AggregatePayload {
                func: AggregateFunc::Avg,
                group_by: Grouping::None,
            }),
        );
        let db = fixture::bars_db();
        let catalog = Catalog::builtin("bars").unwrap();
        let query = catalog.compile(&spec, None).unwrap();
        let rows = fixture::run_query(&db, &query);
        let subject = Subject::Data {
            spec: &spec,
            query: &query,
            rows: &rows,
        };
        let text = narration
            .map(str::to_string)
            .unwrap_or_else(|| describe(&spec, &rows));
        GroundingValidator::default().validate("average close", &subject, &text)
    }

    #[test]
    fn test_mq061_numbers_in() {
        let found: Vec<f64> = numbers_in("1,200 bars, 3.5% and 2024")
            .into_iter()
            .map(|(_, v)| v)
            .collect();
        assert_eq!(found, vec![1200.0, 3.5, 2024.0]);
    }

    #[test]
    fn test_mq061_template_narration_is_grounded() {
        assert_eq!(check(None).status, ValidationStatus::Ok);
    }

    #[test]
    fn test_mq061_rounded_figures_accepted() {
        assert_eq!(
            check(Some("NQ averaged 104.2 over 5 bars in January 2024.")).status,
            ValidationStatus::Ok
        );
    }

    #[test]
    fn test_mq061_invented_figure_rewrites() {
        let v = check(Some("NQ averaged 250.75 in January 2024."));
        assert_eq!(v.status, ValidationStatus::Rewrite);
        assert_eq!(v.issues, vec!["figure 250.75 is not in the results".to_string()]);
        assert!(v.feedback.unwrap().contains("250.75"));
    }

    #[test]
    fn test_mq061_invented_date_rewrites() {
        let v = check(Some("The average was 104.2 as of 2024-03-09."));
        assert_eq!(v.status, ValidationStatus::Rewrite);
        assert!(v.issues[0].contains("2024-03-09"));
    }

    #[test]
    fn test_mq061_empty_narration_fails() {
        let spec = crate::core::types::QuerySpecification::default();
        let rows = crate::engine::RowSet::default();
        let query = Catalog::builtin("bars")
            .unwrap()
            .compile(
                &fixture::spec(
                    OperationTag::Stats,
                    Metric::Close,
                    OperationPayload::Stats(crate::core::types::StatsPayload {}),
                ),
                None,
            )
            .unwrap();
        let subject = Subject::Data {
            spec: &spec,
            query: &query,
            rows: &rows,
        };
        let v = GroundingValidator::default().validate("q", &subject, "  ");
        assert_eq!(v.status, ValidationStatus::Failed);
    }

    #[test]
    fn test_mq061_conversation_without_figures() {
        let v = GroundingValidator::default().validate("hi", &Subject::Conversation, "Hello there.");
        assert_eq!(v, Verdict::ok());
    }
}

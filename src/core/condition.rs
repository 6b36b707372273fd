//! MQ-002: Boolean row conditions. AST, text parsing, SQL rendering.
//!
//! Conditions come from questions ("when change_pct < -2 and volume above
//! 1000000") and from provider proposals. Metric names resolve through the
//! closed `Metric` set and every literal is bound as a parameter.

use super::compiler::SqlWriter;
use super::types::Metric;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Gt,
    Ge,
    Lt,
    Le,
    Eq,
    Ne,
}

impl CompareOp {
    pub fn sql(self) -> &'static str {
        match self {
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Eq => "=",
            Self::Ne => "<>",
        }
    }

    fn from_token(tok: &str) -> Option<Self> {
        Some(match tok {
            ">" | "above" | "over" | "exceeds" => Self::Gt,
            ">=" => Self::Ge,
            "<" | "below" | "under" => Self::Lt,
            "<=" => Self::Le,
            "=" | "==" | "equals" => Self::Eq,
            "!=" | "<>" => Self::Ne,
            _ => return None,
        })
    }
}

/// Boolean expression over row fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    Compare {
        metric: Metric,
        op: CompareOp,
        value: f64,
    },
    All(Vec<Condition>),
    Any(Vec<Condition>),
    Not(Box<Condition>),
}

impl Condition {
    /// Append this condition as a parenthesised predicate.
    pub fn write_sql(&self, w: &mut SqlWriter) {
        match self {
            Self::Compare { metric, op, value } => {
                w.push("(")
                    .push(metric.sql_expr())
                    .push(" ")
                    .push(op.sql())
                    .push(" ")
                    .bind_real(*value)
                    .push(")");
            }
            Self::All(items) => write_joined(w, items, " AND ", "(1 = 1)"),
            Self::Any(items) => write_joined(w, items, " OR ", "(1 = 0)"),
            Self::Not(inner) => {
                w.push("(NOT ");
                inner.write_sql(w);
                w.push(")");
            }
        }
    }
}

fn write_joined(w: &mut SqlWriter, items: &[Condition], sep: &str, empty: &str) {
    if items.is_empty() {
        w.push(empty);
        return;
    }
    w.push("(");
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            w.push(sep);
        }
        item.write_sql(w);
    }
    w.push(")");
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Compare { metric, op, value } => write!(f, "{} {} {}", metric, op.sql(), value),
            Self::All(items) | Self::Any(items) => {
                let sep = if matches!(self, Self::All(_)) { " and " } else { " or " };
                let parts: Vec<String> = items.iter().map(|c| c.to_string()).collect();
                write!(f, "({})", parts.join(sep))
            }
            Self::Not(inner) => write!(f, "not {}", inner),
        }
    }
}

// ============================================================================
// Text parsing
// ============================================================================

fn token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)>=|<=|!=|<>|==|[<>=()]|-?\d+(?:\.\d+)?%?|[a-z_]+").expect("static regex")
    })
}

/// Words skipped between a metric and its comparison.
const FILLER: &[&str] = &["is", "was", "than", "the"];

/// Parse `metric op number` clauses joined by `and` / `or` / `not`.
///
/// `and` binds tighter than `or`; parentheses group. Percent signs on
/// numbers are dropped (`change_pct < -2%` compares against -2).
pub fn parse(text: &str) -> Result<Condition, String> {
    let tokens = tokenize(text)?;
    if tokens.is_empty() {
        return Err("empty condition".to_string());
    }
    let mut parser = Parser { tokens, pos: 0 };
    let cond = parser.parse_or()?;
    if parser.pos != parser.tokens.len() {
        return Err(format!(
            "unexpected '{}' in condition",
            parser.tokens[parser.pos]
        ));
    }
    Ok(cond)
}

fn tokenize(text: &str) -> Result<Vec<String>, String> {
    let mut tokens = Vec::new();
    let lower = text.to_ascii_lowercase();
    let mut cursor = 0;
    for m in token_re().find_iter(&lower) {
        let gap = &lower[cursor..m.start()];
        if !gap.trim().is_empty() {
            return Err(format!("unrecognised text '{}' in condition", gap.trim()));
        }
        cursor = m.end();
        let tok = m.as_str();
        let greater_less = matches!(tok, "greater" | "more" | "less");
        if greater_less {
            // "greater than" / "less than" become operators
            tokens.push(if tok == "less" { "<" } else { ">" }.to_string());
            continue;
        }
        if FILLER.contains(&tok) {
            continue;
        }
        tokens.push(tok.trim_end_matches('%').to_string());
    }
    if !lower[cursor..].trim().is_empty() {
        return Err(format!(
            "unrecognised text '{}' in condition",
            lower[cursor..].trim()
        ));
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<String>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&str> {
        self.tokens.get(self.pos).map(String::as_str)
    }

    fn next(&mut self) -> Option<String> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn parse_or(&mut self) -> Result<Condition, String> {
        let mut items = vec![self.parse_and()?];
        while self.peek() == Some("or") {
            self.pos += 1;
            items.push(self.parse_and()?);
        }
        Ok(if items.len() == 1 { items.remove(0) } else { Condition::Any(items) })
    }

    fn parse_and(&mut self) -> Result<Condition, String> {
        let mut items = vec![self.parse_unary()?];
        while self.peek() == Some("and") {
            self.pos += 1;
            items.push(self.parse_unary()?);
        }
        Ok(if items.len() == 1 { items.remove(0) } else { Condition::All(items) })
    }

    fn parse_unary(&mut self) -> Result<Condition, String> {
        match self.peek() {
            Some("not") => {
                self.pos += 1;
                Ok(Condition::Not(Box::new(self.parse_unary()?)))
            }
            Some("(") => {
                self.pos += 1;
                let inner = self.parse_or()?;
                match self.next().as_deref() {
                    Some(")") => Ok(inner),
                    _ => Err("unbalanced parenthesis in condition".to_string()),
                }
            }
            _ => self.parse_compare(),
        }
    }

    fn parse_compare(&mut self) -> Result<Condition, String> {
        let name = self.next().ok_or("expected a metric")?;
        let metric = Metric::from_alias(&name).ok_or_else(|| format!("unknown metric '{}'", name))?;
        let op_tok = self.next().ok_or("expected a comparison")?;
        let op = CompareOp::from_token(&op_tok)
            .ok_or_else(|| format!("unknown comparison '{}'", op_tok))?;
        let num = self.next().ok_or("expected a number")?;
        let value: f64 = num
            .parse()
            .map_err(|_| format!("expected a number, got '{}'", num))?;
        Ok(Condition::Compare { metric, op, value })
    }
}

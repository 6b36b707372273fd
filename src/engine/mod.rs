//! MQ-020: Data execution. Bounded row sets from compiled queries.

pub mod sqlite;

use crate::core::compiler::CompiledQuery;
use crate::core::error::ExecutionError;
use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

/// One daily OHLCV bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub symbol: String,
    /// ISO date, `YYYY-MM-DD`
    pub timestamp: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Column names plus JSON cells, in query order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RowSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl RowSet {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn get(&self, row: usize, column: &str) -> Option<&Value> {
        let idx = self.column(column)?;
        self.rows.get(row)?.get(idx)
    }

    pub fn f64(&self, row: usize, column: &str) -> Option<f64> {
        self.get(row, column)?.as_f64()
    }

    pub fn text(&self, row: usize, column: &str) -> Option<&str> {
        self.get(row, column)?.as_str()
    }

    pub fn is_null(&self, row: usize, column: &str) -> bool {
        matches!(self.get(row, column), Some(Value::Null))
    }

    /// Every numeric cell, row-major.
    pub fn numbers(&self) -> impl Iterator<Item = f64> + '_ {
        self.rows.iter().flatten().filter_map(Value::as_f64)
    }

    /// Rows as JSON objects keyed by column name.
    pub fn records(&self) -> Vec<Map<String, Value>> {
        self.rows
            .iter()
            .map(|row| {
                self.columns
                    .iter()
                    .cloned()
                    .zip(row.iter().cloned())
                    .collect()
            })
            .collect()
    }
}

/// Per-call bounds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExecutionLimits {
    /// Fetching `row_cap + 1` rows is a breach.
    pub row_cap: usize,
    pub timeout: Duration,
}

/// Runs compiled queries. Implementations must honour both limits and
/// stop work when the returned future is dropped.
#[async_trait]
pub trait DataExecutor: Send + Sync {
    async fn execute(
        &self,
        query: &CompiledQuery,
        limits: ExecutionLimits,
    ) -> Result<RowSet, ExecutionError>;
}

/// Deterministic synthetic weekday bars in `[start, end)`.
///
/// Prices follow a random walk whose steps come from BLAKE3 of
/// `symbol|date`, so the same inputs always produce the same bars.
pub fn demo_bars(symbols: &[String], start: NaiveDate, end: NaiveDate) -> Vec<Bar> {
    let mut out = Vec::new();
    for symbol in symbols {
        let mut close = 50.0 + noise(symbol, "base", 0).abs() * 450.0;
        let mut day = start;
        while day < end {
            if !matches!(day.weekday(), Weekday::Sat | Weekday::Sun) {
                let key = day.to_string();
                let open = round2(close * (1.0 + 0.004 * noise(symbol, &key, 0)));
                let next = round2(open * (1.0 + 0.018 * noise(symbol, &key, 1)));
                let high = round2(open.max(next) * (1.0 + 0.006 * noise(symbol, &key, 2).abs()));
                let low = round2(open.min(next) * (1.0 - 0.006 * noise(symbol, &key, 3).abs()));
                let volume = (1_000_000.0 * (1.0 + noise(symbol, &key, 4).abs())).round();
                out.push(Bar {
                    symbol: symbol.clone(),
                    timestamp: key,
                    open,
                    high,
                    low,
                    close: next,
                    volume,
                });
                close = next;
            }
            match day.succ_opt() {
                Some(next) => day = next,
                None => break,
            }
        }
    }
    out
}

/// Uniform value in `[-1, 1]` from BLAKE3 of the inputs.
fn noise(symbol: &str, key: &str, lane: u8) -> f64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(symbol.as_bytes());
    hasher.update(b"|");
    hasher.update(key.as_bytes());
    hasher.update(&[lane]);
    let bytes = hasher.finalize();
    let mut word = [0u8; 8];
    word.copy_from_slice(&bytes.as_bytes()[..8]);
    let unit = (u64::from_le_bytes(word) >> 11) as f64 / (1u64 << 53) as f64;
    unit * 2.0 - 1.0
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

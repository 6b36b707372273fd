//! MQ-015: Backtest builder. Enter where the condition holds, exit `hold_bars` later.
//!
//! Returns are measured close to close in percent. Only bars inside the
//! window are visible, so an entry whose exit bar falls past the window
//! end is not counted as a trade. Zero trades is a valid outcome: the row
//! still comes back with `trades = 0` and a NULL win rate.
//!
//! Weekday, condition and caller fragment narrow the entries only. Exits
//! are counted over every bar in the window.

use super::common::{write_bounds, write_extra, write_row_filters};
use crate::core::compiler::{BuildContext, CompiledQuery, QueryBuilder, SqlWriter};
use crate::core::error::CompileError;
use crate::core::types::{OperationPayload, OperationTag};

/// Upper bound on the holding period.
pub const MAX_HOLD_BARS: u32 = 250;

pub struct BacktestBuilder;

impl QueryBuilder for BacktestBuilder {
    fn tag(&self) -> OperationTag {
        OperationTag::Backtest
    }

    fn build(&self, ctx: &BuildContext<'_>) -> Result<CompiledQuery, CompileError> {
        let Some(OperationPayload::Backtest(payload)) = &ctx.spec.payload else {
            return Err(CompileError::MissingPayload(OperationTag::Backtest));
        };
        if payload.hold_bars == 0 || payload.hold_bars > MAX_HOLD_BARS {
            return Err(CompileError::InvalidParameter(format!(
                "hold_bars must be 1-{}, got {}",
                MAX_HOLD_BARS, payload.hold_bars
            )));
        }
        let window = ctx.window()?;

        let mut w = SqlWriter::new();
        w.push("WITH series AS (SELECT timestamp, close, CASE WHEN ");
        payload.entry.write_sql(&mut w);
        write_row_filters(&mut w, &ctx.spec.filters);
        write_extra(&mut w, ctx);
        w.push(" THEN 1 ELSE 0 END AS signal, LEAD(close, ")
            .bind_int(i64::from(payload.hold_bars))
            .push(") OVER (ORDER BY timestamp) AS exit_close FROM ")
            .push(ctx.table)
            .push(" WHERE ");
        write_bounds(&mut w, ctx, window)?;
        w.push("), trades AS (SELECT (exit_close - close) * 100.0 / close AS ret FROM series ")
            .push("WHERE signal = 1 AND exit_close IS NOT NULL AND close <> 0) ")
            .push("SELECT COUNT(*) AS trades, ")
            .push("COALESCE(SUM(ret > 0), 0) AS wins, ")
            .push("COALESCE(SUM(ret <= 0), 0) AS losses, ")
            .push("CASE WHEN COUNT(*) = 0 THEN NULL ELSE SUM(ret > 0) * 100.0 / COUNT(*) END AS win_rate, ")
            .push("AVG(ret) AS avg_return, MAX(ret) AS best_return, MIN(ret) AS worst_return ")
            .push("FROM trades");
        Ok(w.finish(OperationTag::Backtest))
    }
}

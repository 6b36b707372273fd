//! MQ-014: Comparison builder. One aggregate row per period, in request order.

use super::common::{write_row_filters, write_scope};
use crate::core::compiler::{BuildContext, CompiledQuery, QueryBuilder, SqlWriter};
use crate::core::error::CompileError;
use crate::core::period;
use crate::core::types::{OperationPayload, OperationTag};

/// Periods compared in one query, at most.
pub const MAX_PERIODS: usize = 12;

pub struct ComparisonBuilder;

impl QueryBuilder for ComparisonBuilder {
    fn tag(&self) -> OperationTag {
        OperationTag::Comparison
    }

    fn build(&self, ctx: &BuildContext<'_>) -> Result<CompiledQuery, CompileError> {
        let Some(OperationPayload::Comparison(payload)) = &ctx.spec.payload else {
            return Err(CompileError::MissingPayload(OperationTag::Comparison));
        };
        if payload.periods.len() < 2 || payload.periods.len() > MAX_PERIODS {
            return Err(CompileError::InvalidParameter(format!(
                "comparison needs 2-{} periods, got {}",
                MAX_PERIODS,
                payload.periods.len()
            )));
        }
        let metric = ctx.metric()?;

        let mut w = SqlWriter::new();
        w.push("SELECT period, value, bars FROM (");
        for (i, spec) in payload.periods.iter().enumerate() {
            let window = period::resolve(spec)?;
            if i > 0 {
                w.push(" UNION ALL ");
            }
            w.push("SELECT ")
                .bind_text(spec.to_string())
                .push(" AS period, ")
                .bind_int(i as i64)
                .push(" AS ordinal, ")
                .push(payload.func.sql_name())
                .push("(")
                .push(metric.sql_expr())
                .push(") AS value, COUNT(*) AS bars FROM ")
                .push(ctx.table)
                .push(" WHERE ");
            write_scope(&mut w, ctx, window)?;
            write_row_filters(&mut w, &ctx.spec.filters);
        }
        w.push(") ORDER BY ordinal ASC");
        Ok(w.finish(OperationTag::Comparison))
    }
}

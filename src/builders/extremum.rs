//! MQ-012: Extremum builder. The single bar holding the max or min.

use super::common::write_from_where;
use crate::core::compiler::{BuildContext, CompiledQuery, QueryBuilder, SqlWriter};
use crate::core::error::CompileError;
use crate::core::types::{ExtremumKind, OperationPayload, OperationTag, SortOrder};

pub struct ExtremumBuilder;

impl QueryBuilder for ExtremumBuilder {
    fn tag(&self) -> OperationTag {
        OperationTag::Extremum
    }

    fn build(&self, ctx: &BuildContext<'_>) -> Result<CompiledQuery, CompileError> {
        let Some(OperationPayload::Extremum(payload)) = &ctx.spec.payload else {
            return Err(CompileError::MissingPayload(OperationTag::Extremum));
        };
        let metric = ctx.metric()?;
        let window = ctx.window()?;
        let order = match payload.kind {
            ExtremumKind::Max => SortOrder::Desc,
            ExtremumKind::Min => SortOrder::Asc,
        };

        let mut w = SqlWriter::new();
        w.push("SELECT timestamp, open, high, low, close, volume, ")
            .push(metric.sql_expr())
            .push(" AS value");
        write_from_where(&mut w, ctx, window)?;
        w.push(" AND ")
            .push(metric.sql_expr())
            .push(" IS NOT NULL ORDER BY value ")
            .push(order.sql())
            .push(", timestamp ASC LIMIT 1");
        Ok(w.finish(OperationTag::Extremum))
    }
}

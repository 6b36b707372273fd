//! MQ-016: Stats builder. Descriptive aggregates of one metric.
//!
//! The standard deviation is population, from deviations about the mean
//! computed in a first pass.

use super::common::write_from_where;
use crate::core::compiler::{BuildContext, CompiledQuery, QueryBuilder, SqlWriter};
use crate::core::error::CompileError;
use crate::core::types::{OperationPayload, OperationTag};

pub struct StatsBuilder;

impl QueryBuilder for StatsBuilder {
    fn tag(&self) -> OperationTag {
        OperationTag::Stats
    }

    fn build(&self, ctx: &BuildContext<'_>) -> Result<CompiledQuery, CompileError> {
        if !matches!(ctx.spec.payload, None | Some(OperationPayload::Stats(_))) {
            return Err(CompileError::MissingPayload(OperationTag::Stats));
        }
        let metric = ctx.metric()?;
        let window = ctx.window()?;

        let mut w = SqlWriter::new();
        w.push("WITH xs AS (SELECT ")
            .push(metric.sql_expr())
            .push(" AS x");
        write_from_where(&mut w, ctx, window)?;
        w.push("), m AS (SELECT AVG(x) AS mean FROM xs) ")
            .push("SELECT COUNT(x) AS count, AVG(x) AS mean, MIN(x) AS min, MAX(x) AS max, ")
            .push("SUM(x) AS sum, sqrt(AVG((x - m.mean) * (x - m.mean))) AS stddev ")
            .push("FROM xs, m");
        Ok(w.finish(OperationTag::Stats))
    }
}

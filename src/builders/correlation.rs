//! MQ-013: Correlation builder. Pearson coefficient between two metrics.
//!
//! Two passes over the window: means first, then centred sums. A series
//! whose values are all equal yields NULL. That is decided from its min and
//! max, since centred sums of a constant can come out a few ulps above zero.

use super::common::write_from_where;
use crate::core::compiler::{BuildContext, CompiledQuery, QueryBuilder, SqlWriter};
use crate::core::error::CompileError;
use crate::core::types::{OperationPayload, OperationTag};

pub struct CorrelationBuilder;

impl QueryBuilder for CorrelationBuilder {
    fn tag(&self) -> OperationTag {
        OperationTag::Correlation
    }

    fn build(&self, ctx: &BuildContext<'_>) -> Result<CompiledQuery, CompileError> {
        let Some(OperationPayload::Correlation(payload)) = &ctx.spec.payload else {
            return Err(CompileError::MissingPayload(OperationTag::Correlation));
        };
        if payload.left == payload.right {
            return Err(CompileError::InvalidParameter(format!(
                "correlation needs two different metrics, got {} twice",
                payload.left
            )));
        }
        let window = ctx.window()?;
        let (x, y) = (payload.left.sql_expr(), payload.right.sql_expr());

        let mut w = SqlWriter::new();
        w.push("WITH pairs AS (SELECT ")
            .push(x)
            .push(" AS x, ")
            .push(y)
            .push(" AS y");
        write_from_where(&mut w, ctx, window)?;
        w.push(" AND ")
            .push(x)
            .push(" IS NOT NULL AND ")
            .push(y)
            .push(" IS NOT NULL), ")
            .push("means AS (SELECT COUNT(*) AS n, AVG(x) AS mx, AVG(y) AS my, ")
            .push("MIN(x) AS lox, MAX(x) AS hix, MIN(y) AS loy, MAX(y) AS hiy FROM pairs), ")
            .push("sums AS (SELECT SUM((x - mx) * (y - my)) AS sxy, ")
            .push("SUM((x - mx) * (x - mx)) AS sxx, ")
            .push("SUM((y - my) * (y - my)) AS syy FROM pairs, means) ")
            .push("SELECT means.n AS n, CASE WHEN means.n = 0 ")
            .push("OR means.lox = means.hix OR means.loy = means.hiy ")
            .push("OR sums.sxx <= 0 OR sums.syy <= 0 THEN NULL ")
            .push("ELSE sums.sxy / sqrt(sums.sxx * sums.syy) END AS correlation ")
            .push("FROM means, sums");
        Ok(w.finish(OperationTag::Correlation))
    }
}

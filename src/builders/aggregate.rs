//! MQ-010: Aggregate builder. One function over the metric, optionally bucketed.

use super::common::{write_from_where, write_limit};
use crate::core::compiler::{BuildContext, CompiledQuery, QueryBuilder, SqlWriter};
use crate::core::error::CompileError;
use crate::core::types::{OperationPayload, OperationTag};

pub struct AggregateBuilder;

impl QueryBuilder for AggregateBuilder {
    fn tag(&self) -> OperationTag {
        OperationTag::Aggregate
    }

    fn build(&self, ctx: &BuildContext<'_>) -> Result<CompiledQuery, CompileError> {
        let Some(OperationPayload::Aggregate(payload)) = &ctx.spec.payload else {
            return Err(CompileError::MissingPayload(OperationTag::Aggregate));
        };
        let metric = ctx.metric()?;
        let window = ctx.window()?;

        let mut w = SqlWriter::new();
        w.push("SELECT ");
        if let Some(bucket) = payload.group_by.bucket_expr() {
            w.push(bucket).push(" AS bucket, ");
        }
        w.push(payload.func.sql_name())
            .push("(")
            .push(metric.sql_expr())
            .push(") AS value, COUNT(*) AS bars");
        write_from_where(&mut w, ctx, window)?;
        if payload.group_by.bucket_expr().is_some() {
            w.push(" GROUP BY bucket ORDER BY bucket ASC");
            write_limit(&mut w, ctx.spec.limit);
        }
        Ok(w.finish(OperationTag::Aggregate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builders::fixture;
    use crate::core::types::{AggregateFunc, AggregatePayload, Grouping, Metric, Weekday};

    fn payload(func: AggregateFunc, group_by: Grouping) -> OperationPayload {
        OperationPayload::Aggregate(AggregatePayload { func, group_by })
    }

    #[test]
    fn test_mq010_average_close() {
        let db = fixture::bars_db();
        let spec = fixture::spec(
            OperationTag::Aggregate,
            Metric::Close,
            payload(AggregateFunc::Avg, Grouping::None),
        );
        let rows = fixture::run(&db, &spec);
        assert_eq!(rows.len(), 1);
        // closes in January 2024: 101, 103, 99, 110, 108
        let avg = rows.f64(0, "value").unwrap();
        assert!((avg - 104.2).abs() < 1e-9);
        assert_eq!(rows.f64(0, "bars"), Some(5.0));
    }

    #[test]
    fn test_mq010_group_by_month() {
        let db = fixture::bars_db();
        let mut spec = fixture::spec(
            OperationTag::Aggregate,
            Metric::Volume,
            payload(AggregateFunc::Sum, Grouping::Month),
        );
        spec.filters.period = crate::core::types::Facet::Resolved(
            crate::core::types::PeriodSpec::Year { year: 2024 },
        );
        let rows = fixture::run(&db, &spec);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows.text(0, "bucket"), Some("2024-01"));
        assert_eq!(rows.text(1, "bucket"), Some("2024-02"));
    }

    #[test]
    fn test_mq010_weekday_filter_binds_index() {
        let catalog = crate::core::compiler::Catalog::builtin("bars").unwrap();
        let mut spec = fixture::spec(
            OperationTag::Aggregate,
            Metric::Close,
            payload(AggregateFunc::Max, Grouping::None),
        );
        spec.filters.weekday = Some(Weekday::Fri);
        let q = catalog.compile(&spec, None).unwrap();
        assert!(q.sql.contains("strftime('%w', timestamp)"));
        assert_eq!(q.params.last(), Some(&crate::core::compiler::SqlParam::Integer(5)));
    }

    #[test]
    fn test_mq010_count_over_empty_window() {
        let db = fixture::bars_db();
        let mut spec = fixture::spec(
            OperationTag::Aggregate,
            Metric::Close,
            payload(AggregateFunc::Count, Grouping::None),
        );
        spec.filters.symbol = crate::core::types::Facet::Resolved("ZZ".into());
        let rows = fixture::run(&db, &spec);
        assert_eq!(rows.f64(0, "value"), Some(0.0));
    }
}

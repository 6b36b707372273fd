//! MQ-011: Top-N builder. Rank bars by the sort key, keep the first `n`.

use super::common::write_from_where;
use crate::core::compiler::{BuildContext, CompiledQuery, QueryBuilder, SqlWriter};
use crate::core::error::CompileError;
use crate::core::types::{OperationPayload, OperationTag, SortOrder};

/// Upper bound on `n`.
pub const MAX_N: u32 = 1000;

pub struct TopNBuilder;

impl QueryBuilder for TopNBuilder {
    fn tag(&self) -> OperationTag {
        OperationTag::TopN
    }

    fn build(&self, ctx: &BuildContext<'_>) -> Result<CompiledQuery, CompileError> {
        let Some(OperationPayload::TopN(payload)) = &ctx.spec.payload else {
            return Err(CompileError::MissingPayload(OperationTag::TopN));
        };
        if payload.n == 0 || payload.n > MAX_N {
            return Err(CompileError::InvalidParameter(format!(
                "top_n n must be 1-{}, got {}",
                MAX_N, payload.n
            )));
        }
        let metric = ctx.metric()?;
        let window = ctx.window()?;
        let (key, order) = match ctx.spec.sort {
            Some(sort) => (sort.key, sort.order),
            None => (metric, SortOrder::Desc),
        };

        let mut w = SqlWriter::new();
        w.push("SELECT timestamp, open, high, low, close, volume, ")
            .push(metric.sql_expr())
            .push(" AS value");
        write_from_where(&mut w, ctx, window)?;
        w.push(" AND ")
            .push(key.sql_expr())
            .push(" IS NOT NULL ORDER BY ")
            .push(key.sql_expr())
            .push(" ")
            .push(order.sql())
            .push(", timestamp ASC LIMIT ")
            .bind_int(i64::from(payload.n));
        Ok(w.finish(OperationTag::TopN))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builders::fixture;
    use crate::core::types::{Metric, SortSpec, TopNPayload};

    fn top(n: u32) -> OperationPayload {
        OperationPayload::TopN(TopNPayload { n })
    }

    #[test]
    fn test_mq011_desc_n1_is_max_row() {
        let db = fixture::bars_db();
        let spec = fixture::spec(OperationTag::TopN, Metric::Close, top(1));
        let rows = fixture::run(&db, &spec);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows.text(0, "timestamp"), Some("2024-01-05"));
        assert_eq!(rows.f64(0, "close"), Some(110.0));
    }

    #[test]
    fn test_mq011_order_and_truncate() {
        let db = fixture::bars_db();
        let spec = fixture::spec(OperationTag::TopN, Metric::ChangePct, top(2));
        let rows = fixture::run(&db, &spec);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows.text(0, "timestamp"), Some("2024-01-05"));
        assert_eq!(rows.text(1, "timestamp"), Some("2024-01-03"));
    }

    #[test]
    fn test_mq011_ties_earliest_first() {
        let db = fixture::bars_db();
        let mut spec = fixture::spec(OperationTag::TopN, Metric::Range, top(2));
        spec.sort = Some(SortSpec {
            key: Metric::Range,
            order: SortOrder::Desc,
        });
        let rows = fixture::run(&db, &spec);
        // 2024-01-05 and 2024-01-08 both span 13 points
        assert_eq!(rows.text(0, "timestamp"), Some("2024-01-05"));
        assert_eq!(rows.text(1, "timestamp"), Some("2024-01-08"));
    }

    #[test]
    fn test_mq011_ascending_sort() {
        let db = fixture::bars_db();
        let mut spec = fixture::spec(OperationTag::TopN, Metric::Close, top(1));
        spec.sort = Some(SortSpec {
            key: Metric::Close,
            order: SortOrder::Asc,
        });
        let rows = fixture::run(&db, &spec);
        assert_eq!(rows.f64(0, "close"), Some(99.0));
    }

    #[test]
    fn test_mq011_n_bounds() {
        let catalog = crate::core::compiler::Catalog::builtin("bars").unwrap();
        for n in [0, MAX_N + 1] {
            let spec = fixture::spec(OperationTag::TopN, Metric::Close, top(n));
            assert!(matches!(
                catalog.compile(&spec, None),
                Err(CompileError::InvalidParameter(_))
            ));
        }
    }

    #[test]
    fn test_mq011_limit_is_bound() {
        let catalog = crate::core::compiler::Catalog::builtin("bars").unwrap();
        let spec = fixture::spec(OperationTag::TopN, Metric::Close, top(7));
        let q = catalog.compile(&spec, None).unwrap();
        assert!(q.sql.ends_with("LIMIT ?"));
        assert!(!q.sql.contains('7'));
    }
}

//! Predicate pieces shared by every builder.

use crate::core::compiler::{BuildContext, SqlWriter};
use crate::core::error::CompileError;
use crate::core::types::{DateRange, Filters};

/// `symbol = ? AND timestamp >= ? AND timestamp < ?`
pub fn write_bounds(
    w: &mut SqlWriter,
    ctx: &BuildContext<'_>,
    window: DateRange,
) -> Result<(), CompileError> {
    w.push("symbol = ")
        .bind_text(ctx.symbol()?)
        .push(" AND timestamp >= ")
        .bind_text(window.start.to_string())
        .push(" AND timestamp < ")
        .bind_text(window.end.to_string());
    Ok(())
}

/// Caller fragment as ` AND (...)`, if any.
pub fn write_extra(w: &mut SqlWriter, ctx: &BuildContext<'_>) {
    if let Some(extra) = ctx.extra {
        w.push(" AND (").fragment(extra).push(")");
    }
}

/// Bounds, then the caller fragment.
pub fn write_scope(
    w: &mut SqlWriter,
    ctx: &BuildContext<'_>,
    window: DateRange,
) -> Result<(), CompileError> {
    write_bounds(w, ctx, window)?;
    write_extra(w, ctx);
    Ok(())
}

/// Weekday and condition filters, each as ` AND ...`.
pub fn write_row_filters(w: &mut SqlWriter, filters: &Filters) {
    if let Some(day) = filters.weekday {
        w.push(" AND CAST(strftime('%w', timestamp) AS INTEGER) = ")
            .bind_int(day.sqlite_index());
    }
    if let Some(condition) = &filters.condition {
        w.push(" AND ");
        condition.write_sql(w);
    }
}

/// ` FROM <table> WHERE <scope> <row filters>` over one window.
pub fn write_from_where(
    w: &mut SqlWriter,
    ctx: &BuildContext<'_>,
    window: DateRange,
) -> Result<(), CompileError> {
    w.push(" FROM ").push(ctx.table).push(" WHERE ");
    write_scope(w, ctx, window)?;
    write_row_filters(w, &ctx.spec.filters);
    Ok(())
}

/// Row limit from the specification, bound as a parameter.
pub fn write_limit(w: &mut SqlWriter, limit: Option<u32>) {
    if let Some(n) = limit {
        w.push(" LIMIT ").bind_int(i64::from(n));
    }
}

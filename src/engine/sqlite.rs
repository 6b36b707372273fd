//! MQ-021: SQLite executor. Read-only connection per call, interrupt on abandon.

use super::{Bar, DataExecutor, ExecutionLimits, RowSet};
use crate::core::compiler::{is_identifier, CompiledQuery, SqlParam};
use crate::core::error::ExecutionError;
use async_trait::async_trait;
use rusqlite::functions::FunctionFlags;
use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::{params_from_iter, Connection, InterruptHandle, OpenFlags, ToSql};
use serde_json::Value;
use std::path::{Path, PathBuf};

impl ToSql for SqlParam {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlParam::Text(s) => ToSqlOutput::from(s.as_str()),
            SqlParam::Integer(i) => ToSqlOutput::from(*i),
            SqlParam::Real(r) => ToSqlOutput::from(*r),
        })
    }
}

fn engine(e: rusqlite::Error) -> ExecutionError {
    ExecutionError::Engine(e.to_string())
}

/// Scalar functions the builders rely on. `sqrt` of a negative or NULL is NULL.
pub fn register_functions(conn: &Connection) -> Result<(), ExecutionError> {
    conn.create_scalar_function(
        "sqrt",
        1,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let x: Option<f64> = ctx.get(0)?;
            Ok(x.filter(|v| *v >= 0.0).map(f64::sqrt))
        },
    )
    .map_err(engine)
}

/// Run a compiled query, failing once more than `row_cap` rows arrive.
pub fn run_query(
    conn: &Connection,
    query: &CompiledQuery,
    row_cap: usize,
) -> Result<RowSet, ExecutionError> {
    let mut stmt = conn.prepare(&query.sql).map_err(engine)?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let width = columns.len();
    let mut cursor = stmt
        .query(params_from_iter(query.params.iter()))
        .map_err(engine)?;
    let mut rows = Vec::new();
    while let Some(row) = cursor.next().map_err(engine)? {
        if rows.len() == row_cap {
            return Err(ExecutionError::RowCap(row_cap));
        }
        let mut cells = Vec::with_capacity(width);
        for i in 0..width {
            cells.push(cell(row.get_ref(i).map_err(engine)?));
        }
        rows.push(cells);
    }
    Ok(RowSet { columns, rows })
}

fn cell(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f).map_or(Value::Null, Value::Number),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(format!("<{} bytes>", b.len())),
    }
}

/// Create the bars table if it does not exist.
pub fn create_table(conn: &Connection, table: &str) -> Result<(), ExecutionError> {
    if !is_identifier(table) {
        return Err(ExecutionError::Engine(format!(
            "table name '{}' is not a plain identifier",
            table
        )));
    }
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {table} (\
         symbol TEXT NOT NULL, timestamp TEXT NOT NULL, \
         open REAL, high REAL, low REAL, close REAL, volume REAL, \
         PRIMARY KEY (symbol, timestamp));\
         CREATE INDEX IF NOT EXISTS {table}_timestamp ON {table} (timestamp);"
    ))
    .map_err(engine)
}

/// Insert or replace bars in one transaction. Returns the number written.
pub fn insert_bars(conn: &Connection, table: &str, bars: &[Bar]) -> Result<usize, ExecutionError> {
    if !is_identifier(table) {
        return Err(ExecutionError::Engine(format!(
            "table name '{}' is not a plain identifier",
            table
        )));
    }
    let tx = conn.unchecked_transaction().map_err(engine)?;
    {
        let mut stmt = tx
            .prepare(&format!(
                "INSERT OR REPLACE INTO {} (symbol, timestamp, open, high, low, close, volume) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                table
            ))
            .map_err(engine)?;
        for bar in bars {
            stmt.execute(rusqlite::params![
                bar.symbol,
                bar.timestamp,
                bar.open,
                bar.high,
                bar.low,
                bar.close,
                bar.volume
            ])
            .map_err(engine)?;
        }
    }
    tx.commit().map_err(engine)?;
    Ok(bars.len())
}

/// Opens the database read-only for each query.
pub struct SqliteExecutor {
    path: PathBuf,
}

impl SqliteExecutor {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> Result<Connection, ExecutionError> {
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| ExecutionError::Engine(format!("{}: {}", self.path.display(), e)))?;
        register_functions(&conn)?;
        Ok(conn)
    }
}

/// Interrupts the running statement unless disarmed.
struct InterruptGuard(Option<InterruptHandle>);

impl InterruptGuard {
    fn disarm(&mut self) {
        self.0 = None;
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            handle.interrupt();
        }
    }
}

#[async_trait]
impl DataExecutor for SqliteExecutor {
    async fn execute(
        &self,
        query: &CompiledQuery,
        limits: ExecutionLimits,
    ) -> Result<RowSet, ExecutionError> {
        let conn = self.open()?;
        let mut guard = InterruptGuard(Some(conn.get_interrupt_handle()));
        let query = query.clone();
        let task = tokio::task::spawn_blocking(move || run_query(&conn, &query, limits.row_cap));
        match tokio::time::timeout(limits.timeout, task).await {
            Ok(Ok(result)) => {
                guard.disarm();
                result
            }
            Ok(Err(join)) => Err(ExecutionError::Engine(format!("query task failed: {}", join))),
            Err(_) => {
                tracing::warn!(timeout_ms = limits.timeout.as_millis() as u64, "query timed out");
                Err(ExecutionError::Timeout(limits.timeout.as_millis() as u64))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builders::fixture;
    use crate::core::types::OperationTag;
    use std::time::Duration;

    fn limits(row_cap: usize) -> ExecutionLimits {
        ExecutionLimits {
            row_cap,
            timeout: Duration::from_secs(5),
        }
    }

    fn raw(sql: &str, params: Vec<SqlParam>) -> CompiledQuery {
        CompiledQuery {
            tag: OperationTag::Stats,
            sql: sql.to_string(),
            params,
        }
    }

    fn db_file(dir: &Path) -> PathBuf {
        let path = dir.join("market.db");
        let conn = Connection::open(&path).unwrap();
        create_table(&conn, "bars").unwrap();
        insert_bars(&conn, "bars", &fixture::bars()).unwrap();
        path
    }

    #[test]
    fn test_mq021_row_cap_breach() {
        let conn = fixture::bars_db();
        let q = raw("SELECT * FROM bars", vec![]);
        assert_eq!(run_query(&conn, &q, 3), Err(ExecutionError::RowCap(3)));
        assert_eq!(run_query(&conn, &q, 12).unwrap().len(), 12);
    }

    #[test]
    fn test_mq021_params_bound_not_spliced() {
        let conn = fixture::bars_db();
        let q = raw(
            "SELECT COUNT(*) AS n FROM bars WHERE symbol = ?",
            vec![SqlParam::Text("NQ' OR '1'='1".into())],
        );
        let rows = run_query(&conn, &q, 10).unwrap();
        assert_eq!(rows.f64(0, "n"), Some(0.0));
    }

    #[test]
    fn test_mq021_sqrt_function() {
        let conn = fixture::bars_db();
        let q = raw("SELECT sqrt(16.0) AS a, sqrt(-1.0) AS b, sqrt(NULL) AS c", vec![]);
        let rows = run_query(&conn, &q, 10).unwrap();
        assert_eq!(rows.f64(0, "a"), Some(4.0));
        assert!(rows.is_null(0, "b"));
        assert!(rows.is_null(0, "c"));
    }

    #[test]
    fn test_mq021_engine_error_is_typed() {
        let conn = fixture::bars_db();
        let q = raw("SELECT nope FROM bars", vec![]);
        assert!(matches!(run_query(&conn, &q, 10), Err(ExecutionError::Engine(_))));
    }

    #[test]
    fn test_mq021_create_table_rejects_bad_name() {
        let conn = Connection::open_in_memory().unwrap();
        assert!(create_table(&conn, "bars; drop").is_err());
    }

    #[tokio::test]
    async fn test_mq021_executor_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let exec = SqliteExecutor::new(db_file(dir.path()));
        let q = raw(
            "SELECT COUNT(*) AS n FROM bars WHERE symbol = ?",
            vec![SqlParam::Text("NQ".into())],
        );
        let rows = exec.execute(&q, limits(10)).await.unwrap();
        assert_eq!(rows.f64(0, "n"), Some(8.0));
    }

    #[tokio::test]
    async fn test_mq021_executor_is_read_only() {
        let dir = tempfile::tempdir().unwrap();
        let exec = SqliteExecutor::new(db_file(dir.path()));
        let q = raw("DELETE FROM bars", vec![]);
        assert!(matches!(
            exec.execute(&q, limits(10)).await,
            Err(ExecutionError::Engine(_))
        ));
    }

    #[tokio::test]
    async fn test_mq021_missing_database() {
        let dir = tempfile::tempdir().unwrap();
        let exec = SqliteExecutor::new(dir.path().join("absent.db"));
        let q = raw("SELECT 1", vec![]);
        assert!(matches!(
            exec.execute(&q, limits(10)).await,
            Err(ExecutionError::Engine(_))
        ));
    }

    #[tokio::test]
    async fn test_mq021_timeout_interrupts() {
        let dir = tempfile::tempdir().unwrap();
        let exec = SqliteExecutor::new(db_file(dir.path()));
        let q = raw(
            "WITH RECURSIVE n(i) AS (SELECT 1 UNION ALL SELECT i + 1 FROM n) \
             SELECT COUNT(*) FROM n",
            vec![],
        );
        let tight = ExecutionLimits {
            row_cap: 10,
            timeout: Duration::from_millis(50),
        };
        assert_eq!(exec.execute(&q, tight).await, Err(ExecutionError::Timeout(50)));
    }
}

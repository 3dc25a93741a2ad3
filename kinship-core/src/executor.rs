use async_trait::async_trait;
use serde_json::Value;

use crate::error::KinshipResult;
use crate::query::QueryState;
use crate::row::Record;

/// Backend that runs rendered statements.
///
/// The query builder and the prefetch resolver only ever talk to the database
/// through this trait, with `table` already resolved to the name rendered into
/// SQL. Implementations render [`QueryState`] with their dialect and bind
/// [`QueryState::params`] positionally.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Runs a `SELECT` and returns one record per row.
    async fn select(&self, table: &str, query: &QueryState) -> KinshipResult<Vec<Record>>;
    /// Runs a `SELECT COUNT(*)`.
    async fn count(&self, table: &str, query: &QueryState) -> KinshipResult<u64>;
    /// Runs an `UPDATE` and returns the number of affected rows.
    async fn update(&self, table: &str, query: &QueryState) -> KinshipResult<u64>;
    /// Runs a `DELETE` and returns the number of affected rows.
    async fn delete(&self, table: &str, query: &QueryState) -> KinshipResult<u64>;
    /// Inserts `rows`, taking `columns` from each (missing keys bind NULL).
    async fn insert(&self, table: &str, columns: &[String], rows: &[Record]) -> KinshipResult<u64>;
    /// Inserts `rows`, updating existing rows that collide on `conflict`.
    async fn save(
        &self,
        table: &str,
        columns: &[String],
        rows: &[Record],
        conflict: &[String],
    ) -> KinshipResult<u64>;
    /// Runs caller-supplied SQL with positional parameters.
    async fn raw(&self, sql: &str, params: &[Value]) -> KinshipResult<Vec<Record>>;
}

#[cfg(feature = "metrics")]
pub(crate) fn record_query_metrics(operation: &str, table: &str, elapsed: std::time::Duration) {
    let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
    let labels = [
        ("operation", operation.to_owned()),
        ("table", table.to_owned()),
    ];
    metrics::histogram!("kinship.query.duration_ms", &labels).record(elapsed_ms);
    metrics::counter!("kinship.query.count", &labels).increment(1);
}

#[cfg(not(feature = "metrics"))]
pub(crate) fn record_query_metrics(_operation: &str, _table: &str, _elapsed: std::time::Duration) {}

pub(crate) fn insert_sql<D: crate::dialect::SqlDialect>(
    table: &str,
    columns: &[String],
    rows: &[Record],
) -> (String, Vec<Value>) {
    let column_list = columns
        .iter()
        .map(|c| D::quote_identifier(c))
        .collect::<Vec<_>>()
        .join(", ");
    let mut params = Vec::with_capacity(columns.len() * rows.len());
    let mut tuples = Vec::with_capacity(rows.len());
    for row in rows {
        let mut slots = Vec::with_capacity(columns.len());
        for column in columns {
            params.push(row.get(column).cloned().unwrap_or(Value::Null));
            slots.push(D::placeholder(params.len()));
        }
        tuples.push(format!("({})", slots.join(", ")));
    }
    let sql = format!(
        "INSERT INTO {} ({}) VALUES {}",
        D::quote_identifier(table),
        column_list,
        tuples.join(", ")
    );
    (sql, params)
}

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteExecutor;

#[cfg(feature = "sqlite")]
mod sqlite {
    use std::time::Instant;

    use async_trait::async_trait;
    use serde_json::Value;
    use sqlx::sqlite::{SqliteArguments, SqlitePool, SqliteRow};
    use sqlx::{Column, Row as _, Sqlite, TypeInfo, ValueRef};

    use super::{Executor, insert_sql, record_query_metrics};
    use crate::dialect::SqlDialect;
    use crate::error::KinshipResult;
    use crate::query::{QueryState, Statement};
    use crate::row::Record;

    type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

    /// [`Executor`] over a SQLite connection pool.
    #[derive(Debug, Clone)]
    pub struct SqliteExecutor {
        pool: SqlitePool,
    }

    impl SqliteExecutor {
        pub fn new(pool: SqlitePool) -> Self {
            Self { pool }
        }

        pub fn pool(&self) -> &SqlitePool {
            &self.pool
        }

        async fn fetch(&self, operation: &str, table: &str, sql: &str, params: &[Value]) -> KinshipResult<Vec<Record>> {
            tracing::trace!(operation, sql = %sql, params = params.len(), "kinship sql");
            let query = params.iter().fold(sqlx::query::<Sqlite>(sql), bind_json);
            let start = Instant::now();
            let rows = query.fetch_all(&self.pool).await;
            record_query_metrics(operation, table, start.elapsed());
            rows?.iter().map(decode_row).collect()
        }

        async fn execute(&self, operation: &str, table: &str, sql: &str, params: &[Value]) -> KinshipResult<u64> {
            tracing::trace!(operation, sql = %sql, params = params.len(), "kinship sql");
            let query = params.iter().fold(sqlx::query::<Sqlite>(sql), bind_json);
            let start = Instant::now();
            let result = query.execute(&self.pool).await;
            record_query_metrics(operation, table, start.elapsed());
            Ok(Sqlite::rows_affected(&result?))
        }
    }

    impl From<SqlitePool> for SqliteExecutor {
        fn from(pool: SqlitePool) -> Self {
            Self::new(pool)
        }
    }

    fn bind_json<'q>(query: SqliteQuery<'q>, value: &Value) -> SqliteQuery<'q> {
        match value {
            Value::String(s) => query.bind(s.clone()),
            Value::Number(n) => {
                if let Some(v) = n.as_i64() {
                    query.bind(v)
                } else if let Some(v) = n.as_f64() {
                    query.bind(v)
                } else {
                    query.bind(n.to_string())
                }
            }
            Value::Bool(b) => query.bind(*b),
            Value::Null => query.bind(Option::<String>::None),
            // Nested JSON is stored as its text.
            other => query.bind(other.to_string()),
        }
    }

    fn decode_row(row: &SqliteRow) -> KinshipResult<Record> {
        let mut record = Record::new();
        for (i, column) in row.columns().iter().enumerate() {
            let storage = {
                let raw = row.try_get_raw(i)?;
                if raw.is_null() {
                    None
                } else {
                    Some(raw.type_info().name().to_owned())
                }
            };
            let value = match storage.as_deref() {
                None => Value::Null,
                Some("INTEGER") => Value::from(row.try_get::<i64, _>(i)?),
                Some("REAL") => serde_json::Number::from_f64(row.try_get::<f64, _>(i)?)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
                Some("BLOB") => Value::from(row.try_get::<Vec<u8>, _>(i)?),
                Some(_) => Value::String(row.try_get::<String, _>(i)?),
            };
            record.insert(column.name().to_owned(), value);
        }
        Ok(record)
    }

    #[async_trait]
    impl Executor for SqliteExecutor {
        async fn select(&self, table: &str, query: &QueryState) -> KinshipResult<Vec<Record>> {
            let (sql, params) = query.render::<Sqlite>(Statement::Select, table)?;
            self.fetch("select", table, &sql, &params).await
        }

        async fn count(&self, table: &str, query: &QueryState) -> KinshipResult<u64> {
            let (sql, params) = query.render::<Sqlite>(Statement::Count, table)?;
            tracing::trace!(operation = "count", sql = %sql, "kinship sql");
            let query = params.iter().fold(sqlx::query::<Sqlite>(&sql), bind_json);
            let start = Instant::now();
            let row = query.fetch_one(&self.pool).await;
            record_query_metrics("count", table, start.elapsed());
            let count: i64 = row?.try_get(0)?;
            Ok(u64::try_from(count).unwrap_or(0))
        }

        async fn update(&self, table: &str, query: &QueryState) -> KinshipResult<u64> {
            let (sql, params) = query.render::<Sqlite>(Statement::Update, table)?;
            self.execute("update", table, &sql, &params).await
        }

        async fn delete(&self, table: &str, query: &QueryState) -> KinshipResult<u64> {
            let (sql, params) = query.render::<Sqlite>(Statement::Delete, table)?;
            self.execute("delete", table, &sql, &params).await
        }

        async fn insert(&self, table: &str, columns: &[String], rows: &[Record]) -> KinshipResult<u64> {
            if rows.is_empty() || columns.is_empty() {
                return Ok(0);
            }
            let (mut sql, params) = insert_sql::<Sqlite>(table, columns, rows);
            sql.push(';');
            self.execute("insert", table, &sql, &params).await
        }

        async fn save(
            &self,
            table: &str,
            columns: &[String],
            rows: &[Record],
            conflict: &[String],
        ) -> KinshipResult<u64> {
            if rows.is_empty() || columns.is_empty() {
                return Ok(0);
            }
            let (mut sql, params) = insert_sql::<Sqlite>(table, columns, rows);
            sql.push_str(&Sqlite::upsert_clause(conflict, columns));
            sql.push(';');
            self.execute("save", table, &sql, &params).await
        }

        async fn raw(&self, sql: &str, params: &[Value]) -> KinshipResult<Vec<Record>> {
            self.fetch("raw", "", sql, params).await
        }
    }

}

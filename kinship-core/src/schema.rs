use async_trait::async_trait;

use crate::error::KinshipResult;

/// Metadata about a database column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaColumn {
    /// The name of the column.
    pub name: String,
    /// The SQL type of the column (e.g., "INTEGER", "TEXT").
    pub sql_type: String,
    /// Whether the column can contain NULL values.
    pub nullable: bool,
    /// Whether the column is part of the Primary Key.
    pub primary_key: bool,
}

impl SchemaColumn {
    /// A nullable, non-key column of unspecified type.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql_type: String::new(),
            nullable: true,
            primary_key: false,
        }
    }

    /// Marks the column as the primary key.
    pub fn primary(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    /// Sets the SQL type.
    pub fn typed(mut self, sql_type: impl Into<String>) -> Self {
        self.sql_type = sql_type.into();
        self
    }
}

/// Metadata about a database table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaTable {
    /// The name of the table.
    pub name: String,
    /// The columns in the table, in declaration order.
    pub columns: Vec<SchemaColumn>,
}

impl SchemaTable {
    /// Returns a column by name if it exists in the table.
    pub fn column(&self, name: &str) -> Option<&SchemaColumn> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Returns the first column flagged as primary key.
    pub fn primary_key(&self) -> Option<&str> {
        self.columns
            .iter()
            .find(|c| c.primary_key)
            .map(|c| c.name.as_str())
    }
}

/// Source of table and column metadata, consulted once during setup.
#[async_trait]
pub trait MetadataProvider: Send + Sync {
    /// Lists the names of all user tables.
    async fn list_tables(&self) -> KinshipResult<Vec<String>>;
    /// Lists the columns of one table, in declaration order.
    async fn list_fields(&self, table: &str) -> KinshipResult<Vec<SchemaColumn>>;

    /// Loads every table with its columns.
    async fn introspect(&self) -> KinshipResult<Vec<SchemaTable>> {
        let mut tables = Vec::new();
        for name in self.list_tables().await? {
            let columns = self.list_fields(&name).await?;
            if columns.is_empty() {
                continue;
            }
            tables.push(SchemaTable { name, columns });
        }
        Ok(tables)
    }
}

/// Metadata provider reading a SQLite database through `sqlite_master` and
/// `PRAGMA table_info`.
#[cfg(feature = "sqlite")]
#[derive(Debug, Clone)]
pub struct SqliteMetadata {
    pool: sqlx::SqlitePool,
}

#[cfg(feature = "sqlite")]
impl SqliteMetadata {
    pub fn new(pool: sqlx::SqlitePool) -> Self {
        Self { pool }
    }
}

#[cfg(feature = "sqlite")]
#[async_trait]
impl MetadataProvider for SqliteMetadata {
    async fn list_tables(&self) -> KinshipResult<Vec<String>> {
        let table_names: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(table_names)
    }

    async fn list_fields(&self, table: &str) -> KinshipResult<Vec<SchemaColumn>> {
        use crate::dialect::SqlDialect;

        let pragma_sql = format!(
            "PRAGMA table_info({})",
            <sqlx::Sqlite as SqlDialect>::quote_identifier(table)
        );
        let rows: Vec<(i64, String, String, i64, Option<String>, i64)> =
            sqlx::query_as(&pragma_sql).fetch_all(&self.pool).await?;

        let columns = rows
            .into_iter()
            .map(|(_cid, col_name, col_type, notnull, _default, pk)| {
                let is_pk = pk > 0;
                SchemaColumn {
                    name: col_name,
                    sql_type: col_type,
                    nullable: !is_pk && notnull == 0,
                    primary_key: is_pk,
                }
            })
            .collect();
        Ok(columns)
    }
}

use std::sync::Arc;

use serde_json::Value;

use crate::association::Association;
use crate::error::KinshipResult;
use crate::executor::Executor;
use crate::query::Query;
use crate::registry::{Registry, RegistryBuilder};
use crate::row::Record;
use crate::schema::MetadataProvider;
use crate::settings::Settings;

/// Entry point: a frozen [`Registry`] paired with the executor that runs
/// queries. Cheap to clone.
#[derive(Clone)]
pub struct Db {
    registry: Arc<Registry>,
    executor: Arc<dyn Executor>,
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db")
            .field("tables", &self.registry.tables().count())
            .finish_non_exhaustive()
    }
}

impl Db {
    pub fn new(registry: Registry, executor: Arc<dyn Executor>) -> Self {
        Self {
            registry: Arc::new(registry),
            executor,
        }
    }

    /// Starts a registry for this settings object.
    pub fn builder(settings: Settings) -> RegistryBuilder {
        RegistryBuilder::new(settings)
    }

    /// Loads every table from `metadata`, infers associations and binds the
    /// result to `executor`.
    pub async fn connect(
        settings: Settings,
        metadata: &dyn MetadataProvider,
        executor: Arc<dyn Executor>,
    ) -> KinshipResult<Self> {
        let registry = RegistryBuilder::new(settings).load(metadata).await?.build()?;
        Ok(Self::new(registry, executor))
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn settings(&self) -> &Settings {
        self.registry.settings()
    }

    pub fn executor(&self) -> &Arc<dyn Executor> {
        &self.executor
    }

    /// Starts a query on `table`.
    pub fn table(&self, table: &str) -> KinshipResult<Query> {
        Query::new(self.clone(), table)
    }

    /// Relationship from `owner` to `related`, if any.
    pub fn classify(&self, owner: &str, related: &str) -> Option<Association> {
        self.registry.classify(owner, related)
    }

    /// Inserts records into `table`. Keys that are not columns are dropped.
    #[tracing::instrument(skip(self, records))]
    pub async fn insert(&self, table: &str, records: &[Record]) -> KinshipResult<u64> {
        let descriptor = self.registry.require(table)?;
        let columns = used_columns(descriptor.columns(), records);
        if columns.is_empty() {
            return Ok(0);
        }
        self.log("insert", descriptor.sql_name(), records.len());
        self.executor
            .insert(descriptor.sql_name(), &columns, records)
            .await
    }

    /// Inserts records, updating rows whose primary key already exists.
    #[tracing::instrument(skip(self, records))]
    pub async fn save(&self, table: &str, records: &[Record]) -> KinshipResult<u64> {
        let descriptor = self.registry.require(table)?;
        let columns = used_columns(descriptor.columns(), records);
        if columns.is_empty() {
            return Ok(0);
        }
        let conflict = [descriptor.primary_key().to_owned()];
        self.log("save", descriptor.sql_name(), records.len());
        self.executor
            .save(descriptor.sql_name(), &columns, records, &conflict)
            .await
    }

    fn log(&self, operation: &str, table: &str, rows: usize) {
        if self.settings().log_queries {
            tracing::debug!(operation, table = %table, rows, "kinship query");
        }
    }

    /// Runs caller-supplied SQL.
    pub async fn raw(&self, sql: &str, params: &[Value]) -> KinshipResult<Vec<Record>> {
        if self.settings().log_queries {
            tracing::debug!(operation = "raw", "kinship query");
        }
        self.executor.raw(sql, params).await
    }
}

/// Table columns present in at least one record, in table order.
fn used_columns(columns: &[String], records: &[Record]) -> Vec<String> {
    columns
        .iter()
        .filter(|c| records.iter().any(|r| r.contains_key(c.as_str())))
        .cloned()
        .collect()
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use super::*;
    use crate::test_utils::{MemoryExecutor, blog_db};
    use serde_json::json;

    #[tokio::test]
    async fn insert_drops_unknown_keys() {
        let executor = MemoryExecutor::new();
        let db = blog_db(executor.clone());
        let record = json!({"id": 1, "label": "rust", "extra": true})
            .as_object()
            .cloned()
            .unwrap();
        db.insert("tags", &[record]).await.unwrap();
        assert_eq!(
            Value::Object(executor.rows("tags")[0].clone()),
            json!({"id": 1, "label": "rust"})
        );
    }

    #[tokio::test]
    async fn save_updates_existing_rows() {
        let executor = MemoryExecutor::new().with_rows("tags", [json!({"id": 1, "label": "a"})]);
        let db = blog_db(executor.clone());
        let records = vec![
            json!({"id": 1, "label": "b"}).as_object().cloned().unwrap(),
            json!({"id": 2, "label": "c"}).as_object().cloned().unwrap(),
        ];
        db.save("tags", &records).await.unwrap();
        let rows = executor.rows("tags");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("label"), Some(&json!("b")));
    }

    #[test]
    fn unknown_tables_are_errors() {
        let db = blog_db(MemoryExecutor::new());
        assert!(matches!(
            db.table("nope"),
            Err(crate::KinshipError::UnknownTable(name)) if name == "nope"
        ));
    }
}

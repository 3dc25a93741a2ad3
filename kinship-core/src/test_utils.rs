//! In-memory stand-ins for a database, for tests that exercise query building
//! and prefetching without a connection.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{KinshipError, KinshipResult};
use crate::executor::Executor;
use crate::query::{Direction, Field, Fragment, JoinCondition, QueryState};
use crate::row::Record;
use crate::schema::{MetadataProvider, SchemaColumn, SchemaTable};

/// One call received by [`MemoryExecutor`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub operation: &'static str,
    pub table: String,
    pub state: Option<QueryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    tables: BTreeMap<String, Vec<Record>>,
    calls: Vec<RecordedCall>,
    failing: BTreeSet<String>,
}

/// [`Executor`] over in-memory tables.
///
/// Evaluates equality and membership filters, column-equality joins,
/// ordering, pagination and projections. Raw fragments are rejected. Clones
/// share the same tables and call log.
#[derive(Debug, Clone, Default)]
pub struct MemoryExecutor {
    inner: Arc<Mutex<MemoryState>>,
}

type Scope = BTreeMap<String, Record>;

impl MemoryExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds rows (JSON objects) to `table`, creating it if needed.
    pub fn with_rows<I>(self, table: &str, rows: I) -> Self
    where
        I: IntoIterator<Item = Value>,
    {
        {
            let mut state = self.lock();
            let entry = state.tables.entry(table.to_owned()).or_default();
            entry.extend(rows.into_iter().filter_map(|row| match row {
                Value::Object(record) => Some(record),
                _ => None,
            }));
        }
        self
    }

    /// Makes every call touching `table` fail.
    pub fn fail_on(self, table: &str) -> Self {
        self.lock().failing.insert(table.to_owned());
        self
    }

    /// Current contents of `table`.
    pub fn rows(&self, table: &str) -> Vec<Record> {
        self.lock().tables.get(table).cloned().unwrap_or_default()
    }

    /// Every call received so far.
    pub fn statements(&self) -> Vec<RecordedCall> {
        self.lock().calls.clone()
    }

    /// Number of `select` calls against `table`.
    pub fn selects(&self, table: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|call| call.operation == "select" && call.table == table)
            .count()
    }

    /// Every recorded statement rendered as SQLite SQL.
    #[cfg(feature = "sqlite")]
    pub fn sql(&self) -> Vec<String> {
        use crate::query::Statement;

        self.statements()
            .into_iter()
            .filter_map(|call| {
                let statement = match call.operation {
                    "select" => Statement::Select,
                    "count" => Statement::Count,
                    "update" => Statement::Update,
                    "delete" => Statement::Delete,
                    _ => return None,
                };
                call.state?
                    .render::<sqlx::Sqlite>(statement, &call.table)
                    .ok()
                    .map(|(sql, _)| sql)
            })
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn begin(
        &self,
        operation: &'static str,
        table: &str,
        query: Option<&QueryState>,
    ) -> KinshipResult<MutexGuard<'_, MemoryState>> {
        let mut state = self.lock();
        state.calls.push(RecordedCall {
            operation,
            table: table.to_owned(),
            state: query.cloned(),
        });
        let joined = query.and_then(|q| q.join()).map(|j| j.table.as_str());
        for name in std::iter::once(table).chain(joined) {
            if state.failing.contains(name) {
                return Err(KinshipError::Executor(format!(
                    "simulated failure on `{}`",
                    name
                )));
            }
        }
        Ok(state)
    }
}

fn unsupported(what: &str) -> KinshipError {
    KinshipError::Executor(format!("{} is not supported by MemoryExecutor", what))
}

fn lookup<'a>(scope: &'a Scope, table: &str, column: &str) -> Option<&'a Value> {
    scope.get(table)?.get(column)
}

fn split_path<'a>(path: &'a str, table: &'a str) -> (&'a str, &'a str) {
    match path.rsplit_once('.') {
        Some((t, c)) => (t, c),
        None => (table, path),
    }
}

fn same(a: Option<&Value>, b: Option<&Value>) -> bool {
    match (a, b) {
        (Some(Value::Null), _) | (_, Some(Value::Null)) | (None, _) | (_, None) => false,
        (Some(Value::Number(x)), Some(Value::Number(y))) => x.as_f64() == y.as_f64(),
        (Some(x), Some(y)) => x == y,
    }
}

fn compare(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(v: Option<&Value>) -> u8 {
        match v {
            None | Some(Value::Null) => 0,
            Some(Value::Bool(_)) => 1,
            Some(Value::Number(_)) => 2,
            Some(Value::String(_)) => 3,
            Some(_) => 4,
        }
    }
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

fn filters_match(scope: &Scope, table: &str, filters: &[Fragment]) -> KinshipResult<bool> {
    for filter in filters {
        let matched = match filter {
            Fragment::Raw { .. } => return Err(unsupported("raw where fragment")),
            Fragment::Eq {
                table: t,
                column,
                value,
            } => same(lookup(scope, t.as_deref().unwrap_or(table), column), Some(value)),
            Fragment::In {
                table: t,
                column,
                values,
            } => {
                let actual = lookup(scope, t.as_deref().unwrap_or(table), column);
                values.iter().any(|v| same(actual, Some(v)))
            }
        };
        if !matched {
            return Ok(false);
        }
    }
    Ok(true)
}

fn matching(
    tables: &BTreeMap<String, Vec<Record>>,
    table: &str,
    query: &QueryState,
) -> KinshipResult<Vec<(usize, Scope)>> {
    let base = tables
        .get(table)
        .ok_or_else(|| KinshipError::Executor(format!("no such table: {}", table)))?;
    let mut scopes: Vec<(usize, Scope)> = base
        .iter()
        .enumerate()
        .map(|(i, record)| (i, Scope::from([(table.to_owned(), record.clone())])))
        .collect();

    if let Some(join) = query.join() {
        let other = tables
            .get(&join.table)
            .ok_or_else(|| KinshipError::Executor(format!("no such table: {}", join.table)))?;
        let mut joined = Vec::new();
        for (i, scope) in scopes {
            for record in other {
                let mut candidate = scope.clone();
                candidate.insert(join.table.clone(), record.clone());
                let keep = match &join.on {
                    None => true,
                    Some(JoinCondition::ColumnsEq { left, right }) => same(
                        lookup(&candidate, &left.table, &left.column),
                        lookup(&candidate, &right.table, &right.column),
                    ),
                    Some(JoinCondition::Raw(_)) => return Err(unsupported("raw join condition")),
                };
                if keep {
                    joined.push((i, candidate));
                }
            }
        }
        scopes = joined;
    }

    let mut out = Vec::new();
    for (i, scope) in scopes {
        if filters_match(&scope, table, query.filters())? {
            out.push((i, scope));
        }
    }

    if let Some(order) = query.order() {
        let (t, c) = split_path(&order.field, table);
        out.sort_by(|a, b| {
            let ordering = compare(lookup(&a.1, t, c), lookup(&b.1, t, c));
            match order.direction {
                Direction::Asc => ordering,
                Direction::Desc => ordering.reverse(),
            }
        });
    }

    let offset = query.offset().unwrap_or(0) as usize;
    let limit = query.limit().map_or(usize::MAX, |n| n as usize);
    Ok(out.into_iter().skip(offset).take(limit).collect())
}

fn project(scope: &Scope, table: &str, fields: &[Field]) -> Record {
    let mut record = Record::new();
    let extend_with = |record: &mut Record, name: &str| {
        if let Some(values) = scope.get(name) {
            record.extend(values.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
    };

    if fields.is_empty() {
        extend_with(&mut record, table);
        for name in scope.keys().filter(|name| name.as_str() != table) {
            extend_with(&mut record, name);
        }
        return record;
    }

    for field in fields {
        match field {
            Field::Column(name) if name == "*" => extend_with(&mut record, table),
            Field::Column(name) if name.contains('(') => {}
            Field::Column(name) => {
                let (t, c) = split_path(name, table);
                let value = lookup(scope, t, c).cloned().unwrap_or(Value::Null);
                record.insert(c.to_owned(), value);
            }
            Field::AllOf(name) => extend_with(&mut record, name),
            Field::Aliased {
                table: t,
                column,
                alias,
            } => {
                let value = lookup(scope, t, column).cloned().unwrap_or(Value::Null);
                record.insert(alias.clone(), value);
            }
        }
    }
    record
}

fn same_key(a: &Record, b: &Record, columns: &[String]) -> bool {
    !columns.is_empty() && columns.iter().all(|c| same(a.get(c), b.get(c)))
}

#[async_trait]
impl Executor for MemoryExecutor {
    async fn select(&self, table: &str, query: &QueryState) -> KinshipResult<Vec<Record>> {
        let state = self.begin("select", table, Some(query))?;
        query.check()?;
        let rows = matching(&state.tables, table, query)?;
        Ok(rows
            .iter()
            .map(|(_, scope)| project(scope, table, query.fields()))
            .collect())
    }

    async fn count(&self, table: &str, query: &QueryState) -> KinshipResult<u64> {
        let state = self.begin("count", table, Some(query))?;
        query.check()?;
        Ok(matching(&state.tables, table, query)?.len() as u64)
    }

    async fn update(&self, table: &str, query: &QueryState) -> KinshipResult<u64> {
        let mut state = self.begin("update", table, Some(query))?;
        query.check()?;
        if query.join().is_some() {
            return Err(unsupported("update with join"));
        }
        let mut assignments = Vec::new();
        for fragment in query.assignments() {
            match fragment {
                Fragment::Eq { column, value, .. } => assignments.push((column.clone(), value.clone())),
                _ => return Err(unsupported("raw or membership assignment")),
            }
        }
        let targets: Vec<usize> = matching(&state.tables, table, query)?
            .into_iter()
            .map(|(i, _)| i)
            .collect();
        let Some(rows) = state.tables.get_mut(table) else {
            return Ok(0);
        };
        for &i in &targets {
            if let Some(row) = rows.get_mut(i) {
                for (column, value) in &assignments {
                    row.insert(column.clone(), value.clone());
                }
            }
        }
        Ok(targets.len() as u64)
    }

    async fn delete(&self, table: &str, query: &QueryState) -> KinshipResult<u64> {
        let mut state = self.begin("delete", table, Some(query))?;
        query.check()?;
        let mut targets: Vec<usize> = matching(&state.tables, table, query)?
            .into_iter()
            .map(|(i, _)| i)
            .collect();
        targets.sort_unstable();
        targets.dedup();
        let Some(rows) = state.tables.get_mut(table) else {
            return Ok(0);
        };
        for &i in targets.iter().rev() {
            rows.remove(i);
        }
        Ok(targets.len() as u64)
    }

    async fn insert(&self, table: &str, columns: &[String], rows: &[Record]) -> KinshipResult<u64> {
        let mut state = self.begin("insert", table, None)?;
        let stored = state.tables.entry(table.to_owned()).or_default();
        for row in rows {
            stored.push(
                columns
                    .iter()
                    .map(|c| (c.clone(), row.get(c).cloned().unwrap_or(Value::Null)))
                    .collect(),
            );
        }
        Ok(rows.len() as u64)
    }

    async fn save(
        &self,
        table: &str,
        columns: &[String],
        rows: &[Record],
        conflict: &[String],
    ) -> KinshipResult<u64> {
        let mut state = self.begin("save", table, None)?;
        let stored = state.tables.entry(table.to_owned()).or_default();
        for row in rows {
            let incoming: Record = columns
                .iter()
                .map(|c| (c.clone(), row.get(c).cloned().unwrap_or(Value::Null)))
                .collect();
            match stored.iter_mut().find(|existing| same_key(existing, &incoming, conflict)) {
                Some(existing) => existing.extend(incoming),
                None => stored.push(incoming),
            }
        }
        Ok(rows.len() as u64)
    }

    async fn raw(&self, _sql: &str, _params: &[Value]) -> KinshipResult<Vec<Record>> {
        let _state = self.begin("raw", "", None)?;
        Ok(Vec::new())
    }
}

/// [`MetadataProvider`] over a fixed list of tables.
#[derive(Debug, Clone, Default)]
pub struct MemoryMetadata {
    tables: Vec<SchemaTable>,
}

impl MemoryMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a table whose `id` column is the primary key.
    pub fn table<I, S>(mut self, name: &str, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let columns = columns
            .into_iter()
            .map(|c| {
                let column = SchemaColumn::new(c);
                if column.name == "id" { column.primary() } else { column }
            })
            .collect();
        self.tables.push(SchemaTable {
            name: name.to_owned(),
            columns,
        });
        self
    }
}

#[async_trait]
impl MetadataProvider for MemoryMetadata {
    async fn list_tables(&self) -> KinshipResult<Vec<String>> {
        Ok(self.tables.iter().map(|t| t.name.clone()).collect())
    }

    async fn list_fields(&self, table: &str) -> KinshipResult<Vec<SchemaColumn>> {
        Ok(self
            .tables
            .iter()
            .find(|t| t.name == table)
            .map(|t| t.columns.clone())
            .unwrap_or_default())
    }
}

/// Blog schema shared by unit tests: authors with one profile each, posts
/// with an author and an editor (an alias of authors), comments, tags joined
/// through `postsTags`, and pictures pointing at any table via `imageable`.
#[cfg(test)]
pub(crate) fn blog_db(executor: MemoryExecutor) -> crate::db::Db {
    use crate::registry::Registry;
    use crate::settings::Settings;

    let registry = Registry::builder(Settings::default())
        .columns("authors", ["id", "name"])
        .columns("posts", ["id", "authorId", "editorId", "title"])
        .columns("comments", ["id", "postId", "body"])
        .columns("tags", ["id", "label"])
        .columns("postsTags", ["id", "postId", "tagId"])
        .columns("profiles", ["id", "authorId", "bio"])
        .columns("pictures", ["id", "imageableType", "imageableId", "url"])
        .alias("authors", ["editors"])
        .has_one("authors", ["profiles"])
        .polymorphic("pictures", ["imageable"])
        .build()
        .expect("blog fixture registry");
    crate::db::Db::new(registry, Arc::new(executor))
}

#[cfg(test)]
struct LogWriter(Arc<Mutex<Vec<u8>>>);

#[cfg(test)]
impl std::io::Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Routes this thread's `tracing` output into a buffer until the guard drops.
#[cfg(test)]
pub(crate) fn capture_logs() -> (tracing::subscriber::DefaultGuard, Arc<Mutex<Vec<u8>>>) {
    let buffer = Arc::new(Mutex::new(Vec::new()));
    let make_writer = {
        let buffer = buffer.clone();
        move || LogWriter(buffer.clone())
    };
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_writer(make_writer)
        .without_time()
        .with_ansi(false)
        .finish();
    (tracing::subscriber::set_default(subscriber), buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::ColumnRef;
    use serde_json::json;

    fn executor() -> MemoryExecutor {
        MemoryExecutor::new()
            .with_rows(
                "posts",
                [
                    json!({"id": 1, "authorId": 1, "title": "b"}),
                    json!({"id": 2, "authorId": 2, "title": "a"}),
                    json!({"id": 3, "authorId": 1, "title": "c"}),
                ],
            )
            .with_rows(
                "authors",
                [json!({"id": 1, "name": "Ann"}), json!({"id": 2, "name": "Bob"})],
            )
    }

    #[tokio::test]
    async fn evaluates_join_projection_and_order() {
        let db = blog_db(executor());
        let query = db
            .table("authors")
            .unwrap()
            .join_on(
                "posts",
                JoinCondition::ColumnsEq {
                    left: ColumnRef::new("posts", "authorId"),
                    right: ColumnRef::new("authors", "id"),
                },
            )
            .fields(["name", "posts.title"])
            .order("posts.title", "desc");
        let rows = query.get_all().await.unwrap();
        let titles: Vec<_> = rows.iter().map(|r| r["title"].clone()).collect();
        assert_eq!(titles, vec![json!("c"), json!("b"), json!("a")]);
        assert_eq!(rows[0]["name"], json!("Ann"));
    }

    #[tokio::test]
    async fn failing_tables_report_executor_errors() {
        let db = blog_db(executor().fail_on("posts"));
        let err = db.table("posts").unwrap().get_all().await.unwrap_err();
        assert!(matches!(err, KinshipError::Executor(_)));
    }

    #[tokio::test]
    async fn memory_metadata_feeds_the_registry() {
        let metadata = MemoryMetadata::new()
            .table("posts", ["id", "authorId"])
            .table("authors", ["id"]);
        let db = crate::db::Db::connect(
            crate::settings::Settings::default(),
            &metadata,
            Arc::new(MemoryExecutor::new()),
        )
        .await
        .unwrap();
        assert_eq!(
            db.classify("posts", "authors").map(|a| a.kind),
            Some(crate::association::AssociationKind::BelongsTo)
        );
    }
}

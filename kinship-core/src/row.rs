use std::ops::{Deref, DerefMut};

use serde::{Serialize, Serializer};
use serde_json::Value;

use crate::db::Db;
use crate::error::{KinshipError, KinshipResult};
use crate::prefetch::{self, Prefetch};

/// Column values of one row, in column order. Prefetched associations are
/// stored under the related table's plural or singular name.
pub type Record = serde_json::Map<String, Value>;

/// A fetched row bound to its table.
///
/// Dereferences to its [`Record`] and serializes as that record, so attached
/// associations appear as nested objects or arrays.
#[derive(Clone)]
pub struct Row {
    db: Db,
    table: String,
    values: Record,
}

impl std::fmt::Debug for Row {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Row")
            .field("table", &self.table)
            .field("values", &self.values)
            .finish()
    }
}

impl PartialEq for Row {
    fn eq(&self, other: &Self) -> bool {
        self.table == other.table && self.values == other.values
    }
}

impl Deref for Row {
    type Target = Record;

    fn deref(&self) -> &Record {
        &self.values
    }
}

impl DerefMut for Row {
    fn deref_mut(&mut self) -> &mut Record {
        &mut self.values
    }
}

impl Serialize for Row {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.values.serialize(serializer)
    }
}

impl Row {
    pub fn new(db: Db, table: impl Into<String>, values: Record) -> Self {
        Self {
            db,
            table: table.into(),
            values,
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn values(&self) -> &Record {
        &self.values
    }

    pub fn into_record(self) -> Record {
        self.values
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.values)
    }

    /// Value of the table's primary key column.
    pub fn id(&self) -> Option<&Value> {
        let descriptor = self.db.registry().table(&self.table)?;
        self.values
            .get(descriptor.primary_key())
            .filter(|v| !v.is_null())
    }

    fn require_id(&self) -> KinshipResult<(String, Value)> {
        let descriptor = self.db.registry().require(&self.table)?;
        let id = self
            .values
            .get(descriptor.primary_key())
            .filter(|v| !v.is_null())
            .cloned()
            .ok_or_else(|| {
                KinshipError::Message(format!(
                    "row of `{}` has no `{}` value",
                    self.table,
                    descriptor.primary_key()
                ))
            })?;
        Ok((descriptor.primary_key().to_owned(), id))
    }

    /// Attached association rows stored under `related` (plural, array) or
    /// its singular form (one record).
    pub fn related(&self, related: &str) -> Option<RowSet> {
        let records = match self.values.get(related) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|item| item.as_object().cloned())
                .collect(),
            _ => {
                let singular = self.db.settings().singular(related);
                match self.values.get(&singular) {
                    Some(Value::Object(record)) => vec![record.clone()],
                    _ => return None,
                }
            }
        };
        Some(RowSet::new(self.db.clone(), related, records))
    }

    /// Keeps the entries of `partial` that are columns of the table, applies
    /// them to the row and writes only those back by primary key.
    pub async fn update(&mut self, partial: impl Into<Value>) -> KinshipResult<u64> {
        let Value::Object(partial) = partial.into() else {
            return Ok(0);
        };
        let (primary_key, id) = self.require_id()?;
        let assignments = column_values(&self.db, &self.table, &partial)?;
        if assignments.is_empty() {
            return Ok(0);
        }
        self.values.extend(assignments.clone());
        self.db
            .table(&self.table)?
            .set(assignments)
            .filter_eq(&primary_key, id)
            .update_all()
            .await
    }

    /// Deletes the row by primary key.
    pub async fn delete(&self) -> KinshipResult<u64> {
        let (primary_key, id) = self.require_id()?;
        self.db
            .table(&self.table)?
            .filter_eq(&primary_key, id)
            .delete_all()
            .await
    }

    /// Writes the row's columns, inserting it or updating the row with the
    /// same primary key.
    pub async fn save(&self) -> KinshipResult<u64> {
        self.db
            .save(&self.table, std::slice::from_ref(&self.values))
            .await
    }

    /// Eager loads associations onto this row after the fact.
    pub async fn fetch<I, P>(&mut self, requests: I) -> KinshipResult<()>
    where
        I: IntoIterator<Item = P>,
        P: Into<Prefetch>,
    {
        let requests: Vec<Prefetch> = requests.into_iter().map(Into::into).collect();
        let db = self.db.clone();
        let table = self.table.clone();
        prefetch::resolve(&db, &table, std::slice::from_mut(self), &requests).await
    }
}

/// Rows fetched from one table.
#[derive(Clone)]
pub struct RowSet {
    db: Db,
    table: String,
    rows: Vec<Row>,
}

impl std::fmt::Debug for RowSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowSet")
            .field("table", &self.table)
            .field("rows", &self.rows)
            .finish()
    }
}

impl Deref for RowSet {
    type Target = [Row];

    fn deref(&self) -> &[Row] {
        &self.rows
    }
}

impl DerefMut for RowSet {
    fn deref_mut(&mut self) -> &mut [Row] {
        &mut self.rows
    }
}

impl IntoIterator for RowSet {
    type Item = Row;
    type IntoIter = std::vec::IntoIter<Row>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.into_iter()
    }
}

impl<'a> IntoIterator for &'a RowSet {
    type Item = &'a Row;
    type IntoIter = std::slice::Iter<'a, Row>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.iter()
    }
}

impl Serialize for RowSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.rows.serialize(serializer)
    }
}

impl RowSet {
    pub fn new(db: Db, table: impl Into<String>, records: Vec<Record>) -> Self {
        let table = table.into();
        let rows = records
            .into_iter()
            .map(|values| Row::new(db.clone(), table.clone(), values))
            .collect();
        Self { db, table, rows }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn as_mut_slice(&mut self) -> &mut [Row] {
        &mut self.rows
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }

    pub fn into_first(self) -> Option<Row> {
        self.rows.into_iter().next()
    }

    pub fn into_records(self) -> Vec<Record> {
        self.rows.into_iter().map(Row::into_record).collect()
    }

    /// Primary keys of the rows, skipping rows without one.
    pub fn ids(&self) -> Vec<Value> {
        self.rows.iter().filter_map(|r| r.id().cloned()).collect()
    }

    /// Applies the column entries of `partial` to every row in memory and
    /// writes them with a single primary-key membership update.
    pub async fn update(&mut self, partial: impl Into<Value>) -> KinshipResult<u64> {
        let Value::Object(partial) = partial.into() else {
            return Ok(0);
        };
        let assignments = column_values(&self.db, &self.table, &partial)?;
        if assignments.is_empty() {
            return Ok(0);
        }
        for row in &mut self.rows {
            row.values.extend(assignments.clone());
        }
        let ids = self.ids();
        if ids.is_empty() {
            return Ok(0);
        }
        let primary_key = self.db.registry().require(&self.table)?.primary_key().to_owned();
        self.db
            .table(&self.table)?
            .set(assignments)
            .filter_in(&primary_key, ids)
            .update_all()
            .await
    }

    /// Deletes every row by primary-key membership.
    pub async fn delete(&self) -> KinshipResult<u64> {
        let ids = self.ids();
        if ids.is_empty() {
            return Ok(0);
        }
        let primary_key = self.db.registry().require(&self.table)?.primary_key().to_owned();
        self.db
            .table(&self.table)?
            .filter_in(&primary_key, ids)
            .delete_all()
            .await
    }

    /// Saves every row in one upsert.
    pub async fn save(&self) -> KinshipResult<u64> {
        let records: Vec<Record> = self.rows.iter().map(|r| r.values.clone()).collect();
        self.db.save(&self.table, &records).await
    }

    /// Eager loads associations onto every row.
    pub async fn fetch<I, P>(&mut self, requests: I) -> KinshipResult<()>
    where
        I: IntoIterator<Item = P>,
        P: Into<Prefetch>,
    {
        let requests: Vec<Prefetch> = requests.into_iter().map(Into::into).collect();
        prefetch::resolve(&self.db, &self.table, &mut self.rows, &requests).await
    }
}

/// Entries of `values` that are columns of `table`, skipping attached
/// associations.
fn column_values(db: &Db, table: &str, values: &Record) -> KinshipResult<Record> {
    let descriptor = db.registry().require(table)?;
    Ok(values
        .iter()
        .filter(|(column, _)| descriptor.has_column(column))
        .map(|(column, value)| (column.clone(), value.clone()))
        .collect())
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use super::*;
    use crate::test_utils::{MemoryExecutor, blog_db};
    use serde_json::json;

    #[tokio::test]
    async fn row_update_writes_only_columns() {
        let executor = MemoryExecutor::new().with_rows(
            "posts",
            [json!({"id": 1, "authorId": 1, "editorId": null, "title": "old"})],
        );
        let db = blog_db(executor.clone());
        let mut row = db.table("posts").unwrap().get().await.unwrap().unwrap();
        row.insert("author".to_owned(), json!({"id": 1}));

        let affected = row.update(json!({"title": "new"})).await.unwrap();
        assert_eq!(affected, 1);
        assert_eq!(row.get("title"), Some(&json!("new")));
        assert_eq!(executor.rows("posts")[0].get("title"), Some(&json!("new")));
        assert!(!executor.rows("posts")[0].contains_key("author"));
    }

    #[tokio::test]
    async fn row_update_sets_only_known_columns_of_the_partial() {
        let executor = MemoryExecutor::new().with_rows(
            "posts",
            [json!({"id": 1, "authorId": 1, "title": "old"})],
        );
        let db = blog_db(executor.clone());
        let mut row = db.table("posts").unwrap().get().await.unwrap().unwrap();

        row.update(json!({"title": "new", "bogus": 1})).await.unwrap();

        assert_eq!(
            row.keys().map(String::as_str).collect::<Vec<_>>(),
            vec!["id", "authorId", "title"]
        );
        assert_eq!(row["title"], json!("new"));
        assert_eq!(
            executor.sql().last().map(String::as_str),
            Some("UPDATE `posts` SET `title` = ? WHERE `posts`.`id` = ?;")
        );
        let update = executor.statements().pop().and_then(|call| call.state).unwrap();
        assert_eq!(update.params(), vec![json!("new"), json!(1)]);
    }

    #[tokio::test]
    async fn row_set_update_ignores_unknown_keys() {
        let executor = MemoryExecutor::new().with_rows(
            "tags",
            [json!({"id": 1, "label": "a"}), json!({"id": 2, "label": "b"})],
        );
        let db = blog_db(executor.clone());
        let mut rows = db.table("tags").unwrap().get_all().await.unwrap();

        assert_eq!(rows.update(json!({"label": "x", "bogus": true})).await.unwrap(), 2);
        assert!(rows.iter().all(|r| !r.contains_key("bogus") && r["label"] == json!("x")));
        assert_eq!(
            executor.sql().last().map(String::as_str),
            Some("UPDATE `tags` SET `label` = ? WHERE `tags`.`id` IN (?, ?);")
        );

        assert_eq!(rows.update(json!({"bogus": true})).await.unwrap(), 0);
        assert_eq!(executor.statements().len(), 2);
    }

    #[tokio::test]
    async fn row_without_primary_key_cannot_be_deleted() {
        let db = blog_db(MemoryExecutor::new());
        let row = Row::new(db, "posts", json!({"title": "x"}).as_object().cloned().unwrap());
        assert!(row.delete().await.is_err());
    }

    #[tokio::test]
    async fn row_set_delete_uses_membership() {
        let executor = MemoryExecutor::new().with_rows(
            "tags",
            [
                json!({"id": 1, "label": "a"}),
                json!({"id": 2, "label": "b"}),
                json!({"id": 3, "label": "c"}),
            ],
        );
        let db = blog_db(executor.clone());
        let rows = db
            .table("tags")
            .unwrap()
            .filter(json!({"id": [1, 3]}))
            .get_all()
            .await
            .unwrap();
        assert_eq!(rows.delete().await.unwrap(), 2);
        assert_eq!(executor.rows("tags").len(), 1);
    }

    #[tokio::test]
    async fn empty_row_set_mutations_are_no_ops() {
        let executor = MemoryExecutor::new();
        let db = blog_db(executor.clone());
        let mut rows = RowSet::new(db, "tags", Vec::new());
        assert_eq!(rows.update(json!({"label": "x"})).await.unwrap(), 0);
        assert_eq!(rows.delete().await.unwrap(), 0);
        assert!(executor.statements().is_empty());
    }

    #[test]
    fn serializes_as_record() {
        let db = blog_db(MemoryExecutor::new());
        let row = Row::new(db, "tags", json!({"id": 1, "label": "a"}).as_object().cloned().unwrap());
        assert_eq!(serde_json::to_value(&row).unwrap(), json!({"id": 1, "label": "a"}));
    }
}

//! Eager loading of associations onto already-fetched rows.
//!
//! Every requested association is resolved by one related-table query (one
//! per discriminator group for polymorphic associations). The queries run
//! concurrently and only produce [`Attachment`]s; the rows are mutated after
//! all of them have finished, so concurrent resolvers never see each other's
//! work.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use futures_util::future::{BoxFuture, try_join_all};
use serde_json::Value;

use crate::association::AssociationKind;
use crate::db::Db;
use crate::error::{KinshipError, KinshipResult};
use crate::query::{ColumnRef, Field, JoinCondition, Query};
use crate::row::{Row, RowSet};
use crate::table::TableDescriptor;

/// Projection alias carrying the owner-side key of a through join.
pub(crate) const THROUGH_KEY: &str = "_through_key";

/// One association to eager load: a table name, or a query on the related
/// table whose filters, ordering and nested prefetches are kept.
#[derive(Debug, Clone)]
pub enum Prefetch {
    Table(String),
    Query(Query),
}

impl Prefetch {
    /// Name of the related table.
    pub fn table(&self) -> &str {
        match self {
            Self::Table(table) => table,
            Self::Query(query) => query.table(),
        }
    }
}

impl From<&str> for Prefetch {
    fn from(value: &str) -> Self {
        Self::Table(value.to_owned())
    }
}

impl From<String> for Prefetch {
    fn from(value: String) -> Self {
        Self::Table(value)
    }
}

impl From<&TableDescriptor> for Prefetch {
    fn from(value: &TableDescriptor) -> Self {
        Self::Table(value.name().to_owned())
    }
}

impl From<Query> for Prefetch {
    fn from(value: Query) -> Self {
        Self::Query(value)
    }
}

#[derive(Debug)]
struct Attachment {
    row: usize,
    field: String,
    value: Value,
}

struct Context<'a> {
    db: &'a Db,
    owner: &'a TableDescriptor,
    related: &'a TableDescriptor,
    rows: &'a [Row],
    query: Query,
    plural: String,
    singular: String,
}

/// Resolves `requests` for `rows` of `owner` and attaches the results.
pub(crate) async fn resolve(
    db: &Db,
    owner: &str,
    rows: &mut [Row],
    requests: &[Prefetch],
) -> KinshipResult<()> {
    if rows.is_empty() || requests.is_empty() {
        return Ok(());
    }

    let mut seen = BTreeSet::new();
    for request in requests {
        if !seen.insert(request.table()) {
            return Err(KinshipError::DuplicatePrefetch {
                table: owner.to_owned(),
                related: request.table().to_owned(),
            });
        }
    }

    let base: &[Row] = &*rows;
    let batches = try_join_all(
        requests
            .iter()
            .map(|request| resolve_one(db, owner, base, request)),
    )
    .await?;

    for attachment in batches.into_iter().flatten() {
        if let Some(row) = rows.get_mut(attachment.row) {
            row.insert(attachment.field, attachment.value);
        }
    }
    Ok(())
}

fn fetch_rows(query: Query) -> BoxFuture<'static, KinshipResult<RowSet>> {
    Box::pin(query.get_all())
}

async fn resolve_one(
    db: &Db,
    owner: &str,
    rows: &[Row],
    request: &Prefetch,
) -> KinshipResult<Vec<Attachment>> {
    let related = request.table();
    let Some(association) = db.classify(owner, related) else {
        tracing::warn!(
            table = %owner,
            related = %related,
            "kinship association not found; nothing attached"
        );
        return Ok(Vec::new());
    };

    let registry = db.registry();
    let query = match request {
        Prefetch::Query(query) => query.clone(),
        Prefetch::Table(table) => db.table(table)?,
    };
    let ctx = Context {
        db,
        owner: registry.require(owner)?,
        related: registry.require(related)?,
        rows,
        query,
        plural: related.to_owned(),
        singular: db.settings().singular(related),
    };

    tracing::debug!(
        table = %owner,
        related = %related,
        kind = %association.kind,
        rows = rows.len(),
        "kinship prefetch"
    );

    match association.kind {
        AssociationKind::BelongsTo => belongs_to(ctx).await,
        AssociationKind::HasMany | AssociationKind::HasOne => {
            has_many(ctx, association.through.as_deref(), association.is_single()).await
        }
        AssociationKind::Paired => paired(ctx).await,
        AssociationKind::Polymorphic => polymorphic(ctx).await,
        AssociationKind::ContraPolymorphic => {
            let name = association.through.as_deref().unwrap_or(related);
            contra_polymorphic(ctx, name).await
        }
    }
}

async fn belongs_to(ctx: Context<'_>) -> KinshipResult<Vec<Attachment>> {
    let foreign_key = ctx.related.foreign_key();
    let primary_key = ctx.related.primary_key();
    let ids = distinct(ctx.rows.iter().map(|row| row.get(foreign_key)));
    if ids.is_empty() {
        return Ok(Vec::new());
    }

    let related = fetch_rows(ctx.query.filter_in(primary_key, ids)).await?;
    let index = index_by(&related, primary_key);

    let mut attachments = Vec::new();
    for (i, row) in ctx.rows.iter().enumerate() {
        if let Some(&j) = key_of(row.get(foreign_key))
            .and_then(|key| index.get(&key))
            .and_then(|matches| matches.first())
        {
            attachments.push(Attachment {
                row: i,
                field: ctx.singular.clone(),
                value: related[j].clone().into_value(),
            });
        }
    }
    Ok(attachments)
}

async fn has_many(
    ctx: Context<'_>,
    through: Option<&str>,
    single: bool,
) -> KinshipResult<Vec<Attachment>> {
    let (query, owner_key, related_key) = match through {
        Some(connector) => {
            match join_through(&ctx, connector)? {
                Some((query, owner_key)) => (query, owner_key, THROUGH_KEY.to_owned()),
                None => return Ok(Vec::new()),
            }
        }
        None => {
            let ids = distinct(ctx.rows.iter().map(|row| row.get(ctx.owner.primary_key())));
            if ids.is_empty() {
                return Ok(Vec::new());
            }
            let foreign_key = ctx.owner.foreign_key().to_owned();
            (
                ctx.query.clone().filter_in(&foreign_key, ids),
                ctx.owner.primary_key().to_owned(),
                foreign_key,
            )
        }
    };

    let related = fetch_rows(query).await?;
    let index = index_by(&related, &related_key);

    let mut attachments = Vec::new();
    for (i, row) in ctx.rows.iter().enumerate() {
        let Some(matches) = key_of(row.get(&owner_key)).and_then(|key| index.get(&key)) else {
            continue;
        };
        let mut records: Vec<Value> = matches
            .iter()
            .map(|&j| {
                let mut record = related[j].values().clone();
                if through.is_some() {
                    record.remove(THROUGH_KEY);
                }
                Value::Object(record)
            })
            .collect();

        if single {
            if let Some(first) = records.drain(..).next() {
                attachments.push(Attachment {
                    row: i,
                    field: ctx.singular.clone(),
                    value: first,
                });
            }
            continue;
        }
        if records.len() == 1 {
            attachments.push(Attachment {
                row: i,
                field: ctx.singular.clone(),
                value: records[0].clone(),
            });
        }
        attachments.push(Attachment {
            row: i,
            field: ctx.plural.clone(),
            value: Value::Array(records),
        });
    }
    Ok(attachments)
}

/// Joins the connector table onto the related query and constrains it to the
/// owner rows. Returns the query and the owner column whose values come back
/// under [`THROUGH_KEY`], or `None` when the owner rows carry no keys.
fn join_through(ctx: &Context<'_>, connector: &str) -> KinshipResult<Option<(Query, String)>> {
    let registry = ctx.db.registry();
    let incomplete = || KinshipError::IncompleteThrough {
        owner: ctx.owner.name().to_owned(),
        connector: connector.to_owned(),
        related: ctx.related.name().to_owned(),
    };
    let nested = || KinshipError::NestedThrough {
        owner: ctx.owner.name().to_owned(),
        connector: connector.to_owned(),
        related: ctx.related.name().to_owned(),
    };

    let connector_table = registry.table(connector).ok_or_else(incomplete)?;
    let owner_side = registry
        .classify(ctx.owner.name(), connector)
        .ok_or_else(incomplete)?;
    let related_side = registry
        .classify(connector, ctx.related.name())
        .ok_or_else(incomplete)?;

    for side in [&owner_side, &related_side] {
        match side.kind {
            AssociationKind::Polymorphic | AssociationKind::ContraPolymorphic => {
                return Err(incomplete());
            }
            _ if side.through.is_some() => return Err(nested()),
            _ => {}
        }
    }

    let con = connector_table.sql_name();
    let rel = ctx.related.sql_name();
    let on = match related_side.kind {
        AssociationKind::BelongsTo => JoinCondition::ColumnsEq {
            left: ColumnRef::new(con, ctx.related.foreign_key()),
            right: ColumnRef::new(rel, ctx.related.primary_key()),
        },
        AssociationKind::HasMany | AssociationKind::HasOne => JoinCondition::ColumnsEq {
            left: ColumnRef::new(con, connector_table.primary_key()),
            right: ColumnRef::new(rel, connector_table.foreign_key()),
        },
        _ => JoinCondition::ColumnsEq {
            left: ColumnRef::new(con, connector_table.primary_key()),
            right: ColumnRef::new(rel, ctx.related.primary_key()),
        },
    };

    let (constraint, owner_key) = match owner_side.kind {
        AssociationKind::BelongsTo => (
            connector_table.primary_key().to_owned(),
            connector_table.foreign_key().to_owned(),
        ),
        AssociationKind::HasMany | AssociationKind::HasOne => (
            ctx.owner.foreign_key().to_owned(),
            ctx.owner.primary_key().to_owned(),
        ),
        _ => (
            connector_table.primary_key().to_owned(),
            ctx.owner.primary_key().to_owned(),
        ),
    };

    let ids = distinct(ctx.rows.iter().map(|row| row.get(&owner_key)));
    if ids.is_empty() {
        return Ok(None);
    }

    let mut query = ctx.query.clone().join_on(con, on);
    if query.state().fields().is_empty() {
        query = query.project(Field::AllOf(rel.to_owned()));
    }
    let query = query
        .project(Field::Aliased {
            table: con.to_owned(),
            column: constraint.clone(),
            alias: THROUGH_KEY.to_owned(),
        })
        .filter_in_table(con, &constraint, ids);
    Ok(Some((query, owner_key)))
}

async fn paired(ctx: Context<'_>) -> KinshipResult<Vec<Attachment>> {
    let owner_key = ctx.owner.primary_key();
    let related_key = ctx.related.primary_key();
    let ids = distinct(ctx.rows.iter().map(|row| row.get(owner_key)));
    if ids.is_empty() {
        return Ok(Vec::new());
    }

    let related = fetch_rows(ctx.query.filter_in(related_key, ids)).await?;
    let index = index_by(&related, related_key);

    let mut attachments = Vec::new();
    for (i, row) in ctx.rows.iter().enumerate() {
        if let Some(&j) = key_of(row.get(owner_key))
            .and_then(|key| index.get(&key))
            .and_then(|matches| matches.first())
        {
            attachments.push(Attachment {
                row: i,
                field: ctx.singular.clone(),
                value: related[j].clone().into_value(),
            });
        }
    }
    Ok(attachments)
}

async fn polymorphic(ctx: Context<'_>) -> KinshipResult<Vec<Attachment>> {
    let settings = ctx.db.settings();
    let columns = settings.polymorphic(ctx.related.name());
    let shadow = format!("_{}", ctx.singular);

    let mut groups: BTreeMap<String, Vec<Option<&Value>>> = BTreeMap::new();
    for row in ctx.rows {
        if let Some(discriminator) = row.get(&columns.table_field).and_then(Value::as_str) {
            groups
                .entry(discriminator.to_owned())
                .or_default()
                .push(row.get(&columns.foreign_key));
        }
    }

    let mut fetches = Vec::with_capacity(groups.len());
    for (discriminator, keys) in groups {
        let table = settings.table_for_discriminator(&discriminator);
        let Some(descriptor) = ctx.db.registry().table(&table) else {
            tracing::warn!(
                table = %ctx.owner.name(),
                discriminator = %discriminator,
                "kinship polymorphic discriminator names no known table; skipped"
            );
            continue;
        };
        let ids = distinct(keys.into_iter());
        let primary_key = descriptor.primary_key().to_owned();
        let query = ctx.db.table(&table)?.copy_state(&ctx.query);
        fetches.push(async move {
            let related = if ids.is_empty() {
                None
            } else {
                Some(fetch_rows(query.filter_in(&primary_key, ids)).await?)
            };
            Ok::<_, KinshipError>((discriminator, primary_key, related))
        });
    }

    let mut attachments = Vec::new();
    for (discriminator, primary_key, related) in try_join_all(fetches).await? {
        let index = related.as_ref().map(|r| index_by(r, &primary_key));
        for (i, row) in ctx.rows.iter().enumerate() {
            if row.get(&columns.table_field).and_then(Value::as_str) != Some(discriminator.as_str()) {
                continue;
            }
            attachments.push(Attachment {
                row: i,
                field: shadow.clone(),
                value: Value::String(discriminator.clone()),
            });
            let (Some(related), Some(index)) = (&related, &index) else {
                continue;
            };
            if let Some(&j) = key_of(row.get(&columns.foreign_key))
                .and_then(|key| index.get(&key))
                .and_then(|matches| matches.first())
            {
                attachments.push(Attachment {
                    row: i,
                    field: ctx.singular.clone(),
                    value: related[j].clone().into_value(),
                });
            }
        }
    }
    Ok(attachments)
}

async fn contra_polymorphic(ctx: Context<'_>, name: &str) -> KinshipResult<Vec<Attachment>> {
    let settings = ctx.db.settings();
    let columns = settings.polymorphic(name);
    let owner_key = ctx.owner.primary_key();
    let ids = distinct(ctx.rows.iter().map(|row| row.get(owner_key)));
    if ids.is_empty() {
        return Ok(Vec::new());
    }

    let discriminator = settings.discriminator_for(ctx.owner.sql_name());
    let query = ctx
        .query
        .filter_in(&columns.foreign_key, ids)
        .filter_eq(&columns.table_field, discriminator);
    let related = fetch_rows(query).await?;
    let index = index_by(&related, &columns.foreign_key);

    let mut attachments = Vec::new();
    for (i, row) in ctx.rows.iter().enumerate() {
        let Some(matches) = key_of(row.get(owner_key)).and_then(|key| index.get(&key)) else {
            continue;
        };
        let records: Vec<Value> = matches
            .iter()
            .map(|&j| related[j].clone().into_value())
            .collect();
        if records.len() == 1 {
            attachments.push(Attachment {
                row: i,
                field: ctx.singular.clone(),
                value: records[0].clone(),
            });
        }
        attachments.push(Attachment {
            row: i,
            field: ctx.plural.clone(),
            value: Value::Array(records),
        });
    }
    Ok(attachments)
}

/// Normalized matching key. `1` and `1.0` compare equal; NULL matches nothing.
fn key_of(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::Null => None,
        Value::Number(n) => Some(match (n.as_i64(), n.as_u64(), n.as_f64()) {
            (Some(v), _, _) => format!("n:{}", v),
            (None, Some(v), _) => format!("n:{}", v),
            (None, None, Some(v)) if v.fract() == 0.0 && v.abs() < 9.0e15 => {
                format!("n:{}", v as i64)
            }
            _ => format!("n:{}", n),
        }),
        Value::String(s) => Some(format!("s:{}", s)),
        other => Some(format!("j:{}", other)),
    }
}

/// Non-null values, deduplicated by matching key, in first-seen order.
fn distinct<'a>(values: impl Iterator<Item = Option<&'a Value>>) -> Vec<Value> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for value in values.flatten() {
        if let Some(key) = key_of(Some(value))
            && seen.insert(key)
        {
            out.push(value.clone());
        }
    }
    out
}

/// Positions of related rows grouped by the matching key of `column`.
fn index_by(rows: &RowSet, column: &str) -> HashMap<String, Vec<usize>> {
    let mut index: HashMap<String, Vec<usize>> = HashMap::with_capacity(rows.len());
    for (i, row) in rows.iter().enumerate() {
        if let Some(key) = key_of(row.get(column)) {
            index.entry(key).or_default().push(i);
        }
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MemoryExecutor, blog_db, capture_logs};
    use serde_json::json;

    fn logs(buffer: &std::sync::Arc<std::sync::Mutex<Vec<u8>>>) -> String {
        String::from_utf8(buffer.lock().unwrap().clone()).unwrap()
    }

    #[tokio::test]
    async fn unknown_association_is_logged_and_skipped() {
        let (_guard, buffer) = capture_logs();
        let executor =
            MemoryExecutor::new().with_rows("authors", [json!({"id": 1, "name": "Ann"})]);
        let db = blog_db(executor.clone());

        let rows = db
            .table("authors")
            .unwrap()
            .prefetch(["tags"])
            .get_all()
            .await
            .unwrap();

        assert_eq!(
            serde_json::to_value(&rows).unwrap(),
            json!([{"id": 1, "name": "Ann"}])
        );
        assert_eq!(executor.selects("tags"), 0);
        assert!(logs(&buffer).contains("kinship association not found"));
    }

    #[tokio::test]
    async fn unknown_discriminators_are_logged_and_skipped() {
        let (_guard, buffer) = capture_logs();
        let executor = MemoryExecutor::new()
            .with_rows("authors", [json!({"id": 1, "name": "Ann"})])
            .with_rows(
                "pictures",
                [
                    json!({"id": 1, "imageableType": "ghosts", "imageableId": 9, "url": "a"}),
                    json!({"id": 2, "imageableType": "authors", "imageableId": 1, "url": "b"}),
                ],
            );
        let db = blog_db(executor);

        let rows = db
            .table("pictures")
            .unwrap()
            .prefetch(["imageable"])
            .order("id", "asc")
            .get_all()
            .await
            .unwrap();

        assert!(rows[0].get("imageable").is_none());
        assert!(rows[0].get("_imageable").is_none());
        assert_eq!(rows[1]["imageable"], json!({"id": 1, "name": "Ann"}));
        assert_eq!(rows[1]["_imageable"], json!("authors"));
        let logs = logs(&buffer);
        assert!(logs.contains("discriminator names no known table"));
        assert!(logs.contains("discriminator=ghosts"));
    }

    #[test]
    fn keys_normalize_numbers_and_skip_null() {
        assert_eq!(key_of(Some(&json!(1))), key_of(Some(&json!(1.0))));
        assert_ne!(key_of(Some(&json!(1))), key_of(Some(&json!("1"))));
        assert_eq!(key_of(Some(&json!(null))), None);
        assert_eq!(key_of(None), None);
    }

    #[test]
    fn distinct_keeps_first_seen_order() {
        let values = [json!(3), json!(1), json!(3), json!(null), json!(2), json!(1)];
        let out = distinct(values.iter().map(Some));
        assert_eq!(out, vec![json!(3), json!(1), json!(2)]);
    }
}

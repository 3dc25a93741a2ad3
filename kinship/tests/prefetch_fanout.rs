use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use kinship::prelude::*;
use kinship::{QueryState, Settings};
use kinship_core::test_utils::MemoryExecutor;
use serde_json::{Value, json};

/// Counts how many selects are in flight at once.
struct Tracking {
    inner: MemoryExecutor,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl Tracking {
    fn new(inner: MemoryExecutor) -> Self {
        Self {
            inner,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Executor for Tracking {
    async fn select(&self, table: &str, query: &QueryState) -> KinshipResult<Vec<Record>> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        let result = self.inner.select(table, query).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn count(&self, table: &str, query: &QueryState) -> KinshipResult<u64> {
        self.inner.count(table, query).await
    }

    async fn update(&self, table: &str, query: &QueryState) -> KinshipResult<u64> {
        self.inner.update(table, query).await
    }

    async fn delete(&self, table: &str, query: &QueryState) -> KinshipResult<u64> {
        self.inner.delete(table, query).await
    }

    async fn insert(&self, table: &str, columns: &[String], rows: &[Record]) -> KinshipResult<u64> {
        self.inner.insert(table, columns, rows).await
    }

    async fn save(
        &self,
        table: &str,
        columns: &[String],
        rows: &[Record],
        conflict: &[String],
    ) -> KinshipResult<u64> {
        self.inner.save(table, columns, rows, conflict).await
    }

    async fn raw(&self, sql: &str, params: &[Value]) -> KinshipResult<Vec<Record>> {
        self.inner.raw(sql, params).await
    }
}

fn registry() -> Registry {
    Registry::builder(Settings::default())
        .columns("authors", ["id", "name"])
        .columns("posts", ["id", "authorId", "title"])
        .columns("comments", ["id", "postId", "body"])
        .columns("tags", ["id", "label"])
        .columns("postsTags", ["id", "postId", "tagId"])
        .build()
        .expect("registry")
}

fn memory() -> MemoryExecutor {
    MemoryExecutor::new()
        .with_rows(
            "authors",
            [json!({"id": 1, "name": "Ann"}), json!({"id": 2, "name": "Bob"})],
        )
        .with_rows(
            "posts",
            [
                json!({"id": 1, "authorId": 1, "title": "x"}),
                json!({"id": 2, "authorId": 2, "title": "y"}),
                json!({"id": 3, "authorId": 1, "title": "z"}),
            ],
        )
        .with_rows(
            "comments",
            [
                json!({"id": 1, "postId": 1, "body": "c1"}),
                json!({"id": 2, "postId": 3, "body": "c2"}),
            ],
        )
        .with_rows(
            "tags",
            [json!({"id": 1, "label": "rust"}), json!({"id": 2, "label": "sql"})],
        )
        .with_rows(
            "postsTags",
            [
                json!({"id": 1, "postId": 1, "tagId": 2}),
                json!({"id": 2, "postId": 2, "tagId": 1}),
            ],
        )
}

#[tokio::test]
async fn associations_are_fetched_concurrently() -> Result<(), Box<dyn std::error::Error>> {
    let tracking = Arc::new(Tracking::new(memory()));
    let db = Db::new(registry(), tracking.clone());

    let posts = db
        .table("posts")?
        .prefetch(["authors", "comments", "tags"])
        .get_all()
        .await?;

    assert_eq!(posts.len(), 3);
    assert_eq!(tracking.peak.load(Ordering::SeqCst), 3);
    assert_eq!(tracking.in_flight.load(Ordering::SeqCst), 0);
    Ok(())
}

#[tokio::test]
async fn one_query_per_association() -> Result<(), Box<dyn std::error::Error>> {
    let memory = memory();
    let db = Db::new(registry(), Arc::new(memory.clone()));

    db.table("posts")?
        .prefetch(["authors", "comments", "tags"])
        .get_all()
        .await?;

    assert_eq!(memory.selects("posts"), 1);
    assert_eq!(memory.selects("authors"), 1);
    assert_eq!(memory.selects("comments"), 1);
    assert_eq!(memory.selects("tags"), 1);

    let sql = memory.sql();
    assert!(sql.contains(
        &"SELECT * FROM `authors` WHERE `authors`.`id` IN (?, ?);".to_owned()
    ));
    assert!(sql.contains(
        &"SELECT `tags`.*, `postsTags`.`postId` AS `_through_key` FROM `tags` JOIN `postsTags` ON `postsTags`.`tagId` = `tags`.`id` WHERE `postsTags`.`postId` IN (?, ?, ?);".to_owned()
    ));
    Ok(())
}

#[tokio::test]
async fn prefetch_order_does_not_change_results() -> Result<(), Box<dyn std::error::Error>> {
    let db = Db::new(registry(), Arc::new(memory()));

    let forward = db
        .table("posts")?
        .prefetch(["authors", "comments", "tags"])
        .get_all()
        .await?;
    let backward = db
        .table("posts")?
        .prefetch(["tags", "comments", "authors"])
        .get_all()
        .await?;

    assert_eq!(
        serde_json::to_value(&forward)?,
        serde_json::to_value(&backward)?
    );
    Ok(())
}

#[tokio::test]
async fn a_failing_association_fails_the_whole_call() -> Result<(), Box<dyn std::error::Error>> {
    let db = Db::new(registry(), Arc::new(memory().fail_on("comments")));

    let err = db
        .table("posts")?
        .prefetch(["authors", "comments"])
        .get_all()
        .await
        .unwrap_err();
    assert!(matches!(err, KinshipError::Executor(_)));

    let posts = db.table("posts")?.prefetch(["authors"]).get_all().await?;
    assert!(posts.iter().all(|p| p.get("author").is_some()));
    Ok(())
}

#[tokio::test]
async fn empty_base_result_skips_prefetch() -> Result<(), Box<dyn std::error::Error>> {
    let memory = memory();
    let db = Db::new(registry(), Arc::new(memory.clone()));

    let posts = db
        .table("posts")?
        .filter_eq("id", 99)
        .prefetch(["authors"])
        .get_all()
        .await?;
    assert!(posts.is_empty());
    assert_eq!(memory.selects("authors"), 0);
    Ok(())
}

use std::sync::{Arc, Mutex};

use kinship::prelude::*;
use kinship::{SqliteExecutor, SqliteMetadata};
use serde_json::json;
use sqlx::sqlite::SqlitePoolOptions;

struct TestWriter(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for TestWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().expect("lock").extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

async fn setup(settings: Settings) -> Result<Db, Box<dyn std::error::Error>> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    sqlx::query("CREATE TABLE posts (id INTEGER PRIMARY KEY, authorId INTEGER, title TEXT)")
        .execute(&pool)
        .await?;
    sqlx::query("INSERT INTO posts (id, authorId, title) VALUES (1, 7, 'hidden')")
        .execute(&pool)
        .await?;
    Ok(Db::connect(
        settings,
        &SqliteMetadata::new(pool.clone()),
        Arc::new(SqliteExecutor::new(pool)),
    )
    .await?)
}

fn capture(level: tracing::Level) -> (tracing::subscriber::DefaultGuard, Arc<Mutex<Vec<u8>>>) {
    let buffer = Arc::new(Mutex::new(Vec::new()));
    let make_writer = {
        let buffer = buffer.clone();
        move || TestWriter(buffer.clone())
    };
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(make_writer)
        .without_time()
        .with_ansi(false)
        .finish();
    (tracing::subscriber::set_default(subscriber), buffer)
}

fn text(buffer: &Arc<Mutex<Vec<u8>>>) -> String {
    String::from_utf8(buffer.lock().expect("lock").clone()).expect("utf8")
}

#[tokio::test]
async fn query_log_summarises_filters_and_redacts_raw_fragments() -> Result<(), Box<dyn std::error::Error>> {
    let db = setup(Settings::default()).await?;
    let (_guard, buffer) = capture(tracing::Level::TRACE);

    let rows = db
        .table("posts")?
        .filter_eq("authorId", 7)
        .filter_raw("title = ?", ["hidden"])
        .get_all()
        .await?;
    assert_eq!(rows.len(), 1);

    let logs = text(&buffer);
    assert!(logs.contains("kinship query"));
    assert!(logs.contains("operation=\"select\""));
    assert!(logs.contains("posts.authorId = 7 AND RAW(<redacted>)"));
    assert!(logs.contains("kinship sql"));
    assert!(!logs.contains("hidden"));
    Ok(())
}

#[tokio::test]
async fn disabling_log_queries_silences_the_query_event() -> Result<(), Box<dyn std::error::Error>> {
    let settings = Settings {
        log_queries: false,
        ..Settings::default()
    };
    let db = setup(settings).await?;
    let (_guard, buffer) = capture(tracing::Level::DEBUG);

    db.table("posts")?.filter(json!({ "id": 1 })).count().await?;
    db.table("posts")?.set(json!({ "title": "x" })).filter_eq("id", 1).update_all().await?;

    assert!(!text(&buffer).contains("kinship query"));
    Ok(())
}

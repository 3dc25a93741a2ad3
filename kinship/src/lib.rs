//! # Kinship 🔗
//!
//! > **"Name your tables well, and the joins write themselves."**
//!
//! Kinship is an association-aware query builder for relational databases.
//! It reads table and column metadata once, infers how tables relate from
//! their naming conventions, and eager loads related rows with one batched
//! query per association, all running concurrently.
//!
//! ## 🌟 Key Features
//!
//! - **🧭 Convention-Based Associations**: `posts.authorId` makes posts belong to authors.
//! - **🔀 Through Associations**: `posts` ↔ `tags` via `postsTags`, resolved with one join.
//! - **🎭 Polymorphic Targets**: `imageableType` / `imageableId` pointing at any table.
//! - **🚀 Concurrent Prefetch**: every requested association is fetched in parallel.
//!
//! ## 🚀 Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use kinship::prelude::*;
//! use kinship::{SqliteExecutor, SqliteMetadata};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = kinship::sqlx::SqlitePool::connect("sqlite::memory:").await?;
//! let db = Db::connect(
//!     Settings::default(),
//!     &SqliteMetadata::new(pool.clone()),
//!     Arc::new(SqliteExecutor::new(pool)),
//! )
//! .await?;
//!
//! let posts = db
//!     .table("posts")?
//!     .filter(kinship::serde_json::json!({ "authorId": 7 }))
//!     .prefetch(["authors", "tags"])
//!     .get_all()
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## 📦 Installation
//!
//! ```toml
//! [dependencies]
//! kinship = "0.3"
//! ```

pub use kinship_core::*;

pub mod prelude {
    pub use kinship_core::prelude::*;
}

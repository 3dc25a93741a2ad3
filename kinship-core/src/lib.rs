pub use async_trait;
pub use serde_json;
pub use sqlx;

pub mod association;
pub mod db;
pub mod dialect;
pub mod error;
pub mod executor;
pub mod prefetch;
pub mod query;
pub mod registry;
pub mod row;
pub mod schema;
pub mod settings;
pub mod table;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use association::{Association, AssociationKind, AssociationTarget};
pub use db::Db;
pub use dialect::SqlDialect;
pub use error::{KinshipError, KinshipResult};
#[cfg(feature = "sqlite")]
pub use executor::SqliteExecutor;
pub use executor::Executor;
pub use prefetch::Prefetch;
pub use query::{
    ColumnRef, Condition, Direction, Field, Found, Fragment, Join, JoinCondition, Order, Query,
    QueryState, Statement,
};
pub use registry::{Registry, RegistryBuilder};
pub use row::{Record, Row, RowSet};
#[cfg(feature = "sqlite")]
pub use schema::SqliteMetadata;
pub use schema::{MetadataProvider, SchemaColumn, SchemaTable};
pub use settings::{NamingStyle, PolymorphicColumns, Settings};
pub use table::{TableDescriptor, TableKind};

pub mod prelude {
    pub use crate::{
        AssociationKind, Db, Executor, KinshipError, KinshipResult, Prefetch, Query, Record,
        Registry, Row, RowSet, Settings,
    };
}

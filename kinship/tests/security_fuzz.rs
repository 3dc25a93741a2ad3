use std::sync::Arc;

use kinship::dialect::SqlDialect;
use kinship::{Db, Registry, Settings};
use kinship_core::test_utils::MemoryExecutor;
use proptest::prelude::*;
use proptest::strategy::ValueTree;
use proptest::test_runner::{Config, TestRunner};
use sqlx::Sqlite;

fn db() -> Db {
    let registry = Registry::builder(Settings::default())
        .columns("dummy_models", ["id", "name"])
        .build()
        .unwrap();
    Db::new(registry, Arc::new(MemoryExecutor::new()))
}

fn column_strategy() -> impl Strategy<Value = String> {
    "[A-Za-z0-9_`\\-\\s]{1,32}".prop_map(|s| s)
}

fn value_strategy() -> impl Strategy<Value = String> {
    "[A-Za-z0-9'\";`\\-\\s]{1,32}".prop_map(|s| s)
}

#[test]
fn filter_eq_quotes_identifier() {
    let mut runner = TestRunner::new(Config {
        cases: 128,
        failure_persistence: None,
        ..Config::default()
    });

    let column = column_strategy();
    let value = any::<i64>();
    let db = db();

    for _ in 0..128 {
        let column = column.new_tree(&mut runner).unwrap().current();
        let value = value.new_tree(&mut runner).unwrap().current();
        let (sql, params) = db
            .table("dummy_models")
            .unwrap()
            .filter_eq(&column, value)
            .to_sql::<Sqlite>()
            .unwrap();
        let quoted = <Sqlite as SqlDialect>::quote_identifier(&column);
        assert!(sql.contains(&format!("`dummy_models`.{} = ?", quoted)));
        assert_eq!(params, vec![serde_json::json!(value)]);
    }
}

#[test]
fn filter_values_never_reach_sql_text() {
    let mut runner = TestRunner::new(Config {
        cases: 128,
        failure_persistence: None,
        ..Config::default()
    });

    let value = value_strategy();
    let db = db();

    for _ in 0..128 {
        let value = value.new_tree(&mut runner).unwrap().current();
        let (sql, params) = db
            .table("dummy_models")
            .unwrap()
            .filter(serde_json::json!({ "name": value.clone() }))
            .to_sql::<Sqlite>()
            .unwrap();
        assert_eq!(
            sql,
            "SELECT * FROM `dummy_models` WHERE `dummy_models`.`name` = ?;"
        );
        assert_eq!(params, vec![serde_json::json!(value)]);
    }
}

#[test]
fn filter_in_rejects_empty_list() {
    let mut runner = TestRunner::new(Config {
        cases: 64,
        failure_persistence: None,
        ..Config::default()
    });

    let column = column_strategy();
    let db = db();
    for _ in 0..64 {
        let column = column.new_tree(&mut runner).unwrap().current();
        let result = db
            .table("dummy_models")
            .unwrap()
            .filter_in(&column, Vec::<i64>::new())
            .to_sql::<Sqlite>();
        assert!(matches!(
            result,
            Err(kinship::KinshipError::EmptyMembership { .. })
        ));
    }
}

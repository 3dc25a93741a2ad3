use sqlx::Database;

/// A trait that encapsulates what the renderer needs to know about a database.
///
/// Implementing this trait lets Kinship produce the right placeholder style,
/// identifier quoting and upsert syntax for a backend.
pub trait SqlDialect: Database + Sized + Send + Sync
where
    Self::Connection: Send,
{
    /// Returns the placeholder for the `n`-th parameter in a query (e.g., "?" or "$1").
    fn placeholder(n: usize) -> String;
    /// Returns the number of rows affected by a query result.
    fn rows_affected(res: &Self::QueryResult) -> u64;

    /// Quotes an identifier (table/column name) to prevent SQL injection.
    fn quote_identifier(ident: &str) -> String {
        format!("`{}`", ident.replace('`', "``"))
    }

    /// Row key used to select rows for `UPDATE`/`DELETE` with ordering or a
    /// limit, for backends that reject those clauses on mutations. `None`
    /// renders them directly.
    fn mutation_row_key() -> Option<&'static str> {
        None
    }

    /// Returns the clause appended to an `INSERT` to turn it into an upsert.
    ///
    /// `conflict` names the unique columns the conflict is detected on.
    fn upsert_clause(conflict: &[String], columns: &[String]) -> String {
        let target = conflict
            .iter()
            .map(|c| Self::quote_identifier(c))
            .collect::<Vec<_>>()
            .join(", ");
        let updates = columns
            .iter()
            .filter(|c| !conflict.contains(c))
            .map(|c| {
                let quoted = Self::quote_identifier(c);
                format!("{} = excluded.{}", quoted, quoted)
            })
            .collect::<Vec<_>>();
        if updates.is_empty() {
            format!(" ON CONFLICT ({}) DO NOTHING", target)
        } else {
            format!(
                " ON CONFLICT ({}) DO UPDATE SET {}",
                target,
                updates.join(", ")
            )
        }
    }
}

#[cfg(feature = "sqlite")]
impl SqlDialect for sqlx::Sqlite {
    fn placeholder(_n: usize) -> String {
        "?".to_owned()
    }
    fn rows_affected(res: &sqlx::sqlite::SqliteQueryResult) -> u64 {
        res.rows_affected()
    }
    fn mutation_row_key() -> Option<&'static str> {
        Some("rowid")
    }
}

#[cfg(feature = "postgres")]
impl SqlDialect for sqlx::Postgres {
    fn placeholder(n: usize) -> String {
        format!("${}", n)
    }
    fn rows_affected(res: &sqlx::postgres::PgQueryResult) -> u64 {
        res.rows_affected()
    }
    fn quote_identifier(ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }
    fn mutation_row_key() -> Option<&'static str> {
        Some("ctid")
    }
}

#[cfg(feature = "mysql")]
impl SqlDialect for sqlx::MySql {
    fn placeholder(_n: usize) -> String {
        "?".to_owned()
    }
    fn rows_affected(res: &sqlx::mysql::MySqlQueryResult) -> u64 {
        res.rows_affected()
    }
    fn upsert_clause(_conflict: &[String], columns: &[String]) -> String {
        let updates = columns
            .iter()
            .map(|c| {
                let quoted = Self::quote_identifier(c);
                format!("{} = VALUES({})", quoted, quoted)
            })
            .collect::<Vec<_>>();
        format!(" ON DUPLICATE KEY UPDATE {}", updates.join(", "))
    }
}

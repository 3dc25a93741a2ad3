use std::fmt::Write;

use serde_json::Value;

use crate::db::Db;
use crate::dialect::SqlDialect;
use crate::error::{KinshipError, KinshipResult};
use crate::prefetch::{self, Prefetch};
use crate::row::{Record, Row, RowSet};

/// One where- or set-clause fragment together with the parameters its
/// placeholders consume.
#[derive(Debug, Clone, PartialEq)]
pub enum Fragment {
    /// Caller-supplied SQL used verbatim.
    Raw { sql: String, params: Vec<Value> },
    /// `column = ?`, qualified with `table` when present.
    Eq {
        table: Option<String>,
        column: String,
        value: Value,
    },
    /// `column IN (?, ...)`, qualified with `table` when present. Never empty.
    In {
        table: Option<String>,
        column: String,
        values: Vec<Value>,
    },
}

impl Fragment {
    /// Parameters consumed by this fragment, in placeholder order.
    pub fn params(&self) -> Vec<&Value> {
        match self {
            Self::Raw { params, .. } => params.iter().collect(),
            Self::Eq { value, .. } => vec![value],
            Self::In { values, .. } => values.iter().collect(),
        }
    }

    fn requalify(&mut self, from: &str, to: &str) {
        if let Self::Eq { table, .. } | Self::In { table, .. } = self
            && table.as_deref() == Some(from)
        {
            *table = Some(to.to_owned());
        }
    }
}

/// Input accepted by [`Query::filter`] and [`Query::set`].
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// A verbatim fragment and the parameters for its placeholders.
    Raw(String, Vec<Value>),
    /// Column/value pairs. Array values become membership tests in where-clauses.
    Columns(Vec<(String, Value)>),
    /// A JSON value that is neither an object nor a string, by type name.
    /// Reported as [`KinshipError::InvalidCondition`] when the query runs.
    Invalid(&'static str),
}

impl From<&str> for Condition {
    fn from(value: &str) -> Self {
        Self::Raw(value.to_owned(), Vec::new())
    }
}

impl From<String> for Condition {
    fn from(value: String) -> Self {
        Self::Raw(value, Vec::new())
    }
}

impl From<Record> for Condition {
    fn from(value: Record) -> Self {
        Self::Columns(value.into_iter().collect())
    }
}

/// JSON objects map to [`Condition::Columns`], strings to raw fragments.
impl From<Value> for Condition {
    fn from(value: Value) -> Self {
        match value {
            Value::Object(map) => map.into(),
            Value::String(sql) => Self::Raw(sql, Vec::new()),
            Value::Null => Self::Invalid("null"),
            Value::Bool(_) => Self::Invalid("boolean"),
            Value::Number(_) => Self::Invalid("number"),
            Value::Array(_) => Self::Invalid("array"),
        }
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

impl Direction {
    /// `"desc"`, `"d"` and `"v"` (any case) are descending, everything else ascending.
    pub fn parse(input: &str) -> Self {
        match input.trim().to_ascii_uppercase().as_str() {
            "DESC" | "D" | "V" => Self::Desc,
            _ => Self::Asc,
        }
    }

    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub field: String,
    pub direction: Direction,
}

/// A `table.column` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnRef {
    pub table: String,
    pub column: String,
}

impl ColumnRef {
    pub fn new(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            column: column.into(),
        }
    }
}

/// Condition of a `JOIN ... ON`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinCondition {
    Raw(String),
    ColumnsEq { left: ColumnRef, right: ColumnRef },
}

impl From<&str> for JoinCondition {
    fn from(value: &str) -> Self {
        Self::Raw(value.to_owned())
    }
}

impl From<String> for JoinCondition {
    fn from(value: String) -> Self {
        Self::Raw(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Join {
    pub table: String,
    pub on: Option<JoinCondition>,
}

/// One entry of the projection list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Field {
    /// A column name. `*` and expressions such as `COUNT(*)` render unquoted.
    Column(String),
    /// `table.*`
    AllOf(String),
    /// `table.column AS alias`
    Aliased {
        table: String,
        column: String,
        alias: String,
    },
}

/// Statement kinds the renderer produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Statement {
    Select,
    Count,
    Update,
    Delete,
}

impl Statement {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Select => "select",
            Self::Count => "count",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

/// Caller error found while building, reported when the query renders or runs.
#[derive(Debug, Clone, PartialEq)]
enum Deferred {
    EmptyMembership { table: String, column: String },
    InvalidCondition { table: String, found: &'static str },
}

impl Deferred {
    fn table_mut(&mut self) -> &mut String {
        match self {
            Self::EmptyMembership { table, .. } | Self::InvalidCondition { table, .. } => table,
        }
    }
}

/// Accumulated filter, assignment, ordering and pagination state.
///
/// Each fragment owns its parameters, so the flattened parameter list always
/// lines up with the placeholders of the rendered text.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryState {
    filters: Vec<Fragment>,
    assignments: Vec<Fragment>,
    join: Option<Join>,
    order: Option<Order>,
    limit: Option<u64>,
    offset: Option<u64>,
    fields: Vec<Field>,
    deferred: Option<Deferred>,
}

impl QueryState {
    pub fn filters(&self) -> &[Fragment] {
        &self.filters
    }

    pub fn assignments(&self) -> &[Fragment] {
        &self.assignments
    }

    pub fn join(&self) -> Option<&Join> {
        self.join.as_ref()
    }

    pub fn order(&self) -> Option<&Order> {
        self.order.as_ref()
    }

    pub fn limit(&self) -> Option<u64> {
        self.limit
    }

    pub fn offset(&self) -> Option<u64> {
        self.offset
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn where_params(&self) -> Vec<Value> {
        self.filters
            .iter()
            .flat_map(|f| f.params())
            .cloned()
            .collect()
    }

    pub fn set_params(&self) -> Vec<Value> {
        self.assignments
            .iter()
            .flat_map(|f| f.params())
            .cloned()
            .collect()
    }

    /// Parameters in binding order: set-clause first, then where-clause.
    pub fn params(&self) -> Vec<Value> {
        let mut params = self.set_params();
        params.extend(self.where_params());
        params
    }

    /// Reports a deferred caller error recorded while building.
    pub fn check(&self) -> KinshipResult<()> {
        match &self.deferred {
            Some(Deferred::EmptyMembership { table, column }) => {
                Err(KinshipError::EmptyMembership {
                    table: table.clone(),
                    column: column.clone(),
                })
            }
            Some(Deferred::InvalidCondition { table, found }) => {
                Err(KinshipError::InvalidCondition {
                    table: table.clone(),
                    found: (*found).to_owned(),
                })
            }
            None => Ok(()),
        }
    }

    /// Keeps the first deferred error.
    fn defer(&mut self, error: Deferred) {
        if self.deferred.is_none() {
            self.deferred = Some(error);
        }
    }

    fn push_condition(&mut self, table: &str, condition: Condition) {
        match condition {
            Condition::Raw(sql, params) => {
                self.filters.push(Fragment::Raw { sql, params });
            }
            Condition::Invalid(found) => self.defer(Deferred::InvalidCondition {
                table: table.to_owned(),
                found,
            }),
            Condition::Columns(pairs) => {
                for (column, value) in pairs {
                    match value {
                        Value::Array(values) => self.push_membership(table, column, values),
                        value => self.filters.push(Fragment::Eq {
                            table: Some(table.to_owned()),
                            column,
                            value,
                        }),
                    }
                }
            }
        }
    }

    fn push_membership(&mut self, table: &str, column: String, values: Vec<Value>) {
        if values.is_empty() {
            self.defer(Deferred::EmptyMembership {
                table: table.to_owned(),
                column,
            });
            return;
        }
        self.filters.push(Fragment::In {
            table: Some(table.to_owned()),
            column,
            values,
        });
    }

    fn push_assignment(&mut self, table: &str, condition: Condition) {
        match condition {
            Condition::Raw(sql, params) => {
                self.assignments.push(Fragment::Raw { sql, params });
            }
            Condition::Invalid(found) => self.defer(Deferred::InvalidCondition {
                table: table.to_owned(),
                found,
            }),
            Condition::Columns(pairs) => {
                for (column, value) in pairs {
                    self.assignments.push(Fragment::Eq {
                        table: None,
                        column,
                        value,
                    });
                }
            }
        }
    }

    fn requalify(&mut self, from: &str, to: &str) {
        for filter in &mut self.filters {
            filter.requalify(from, to);
        }
        if let Some(deferred) = &mut self.deferred {
            let table = deferred.table_mut();
            if table.as_str() == from {
                *table = to.to_owned();
            }
        }
    }

    /// Dialect-free summary of the where-clause, for logging.
    pub fn describe(&self) -> String {
        let mut clauses = Vec::with_capacity(self.filters.len());
        for filter in &self.filters {
            match filter {
                Fragment::Raw { .. } => clauses.push("RAW(<redacted>)".to_owned()),
                Fragment::Eq {
                    table,
                    column,
                    value,
                } => clauses.push(format!("{} = {}", dotted(table, column), value)),
                Fragment::In {
                    table,
                    column,
                    values,
                } => {
                    let rendered = values
                        .iter()
                        .map(Value::to_string)
                        .collect::<Vec<_>>()
                        .join(", ");
                    clauses.push(format!("{} IN ({})", dotted(table, column), rendered));
                }
            }
        }
        clauses.join(" AND ")
    }

    /// Renders the statement against `table` and returns the text with its
    /// positional parameters (set-params, then where-params).
    pub fn render<D: SqlDialect>(
        &self,
        statement: Statement,
        table: &str,
    ) -> KinshipResult<(String, Vec<Value>)> {
        self.check()?;

        let mut sql = String::with_capacity(128);
        let mut params = Vec::with_capacity(self.filters.len() + self.assignments.len());
        let quoted_table = D::quote_identifier(table);

        match statement {
            Statement::Select => {
                sql.push_str("SELECT ");
                self.render_fields::<D>(&mut sql);
                let _ = write!(sql, " FROM {}", quoted_table);
            }
            Statement::Count => {
                let _ = write!(sql, "SELECT COUNT(*) FROM {}", quoted_table);
            }
            Statement::Update => {
                let _ = write!(sql, "UPDATE {}", quoted_table);
            }
            Statement::Delete => {
                let _ = write!(sql, "DELETE FROM {}", quoted_table);
            }
        }

        // Backends without LIMIT/ORDER BY on UPDATE and DELETE get the
        // row selection pushed into a sub-select on their row key.
        let mutation_key = match statement {
            Statement::Update | Statement::Delete
                if self.limit.is_some() || self.offset.is_some() || self.order.is_some() =>
            {
                D::mutation_row_key()
            }
            _ => None,
        };

        if mutation_key.is_none() {
            self.render_join::<D>(&mut sql);
        }

        if statement == Statement::Update && !self.assignments.is_empty() {
            sql.push_str(" SET ");
            render_fragments::<D>(&mut sql, &mut params, &self.assignments, ", ");
        }

        match mutation_key {
            Some(key) => {
                let key = format!("{}.{}", quoted_table, key);
                let _ = write!(sql, " WHERE {} IN (SELECT {} FROM {}", key, key, quoted_table);
                self.render_join::<D>(&mut sql);
                self.render_where::<D>(&mut sql, &mut params);
                self.render_tail::<D>(&mut sql);
                sql.push(')');
            }
            None => {
                self.render_where::<D>(&mut sql, &mut params);
                self.render_tail::<D>(&mut sql);
            }
        }

        sql.push(';');
        Ok((sql, params))
    }

    fn render_fields<D: SqlDialect>(&self, sql: &mut String) {
        if self.fields.is_empty() {
            sql.push('*');
            return;
        }
        let rendered = self
            .fields
            .iter()
            .map(|field| match field {
                Field::Column(name) if name == "*" || name.contains('(') => name.clone(),
                Field::Column(name) => quote_path::<D>(name),
                Field::AllOf(table) => format!("{}.*", D::quote_identifier(table)),
                Field::Aliased {
                    table,
                    column,
                    alias,
                } => format!(
                    "{}.{} AS {}",
                    D::quote_identifier(table),
                    D::quote_identifier(column),
                    D::quote_identifier(alias)
                ),
            })
            .collect::<Vec<_>>();
        sql.push_str(&rendered.join(", "));
    }

    fn render_join<D: SqlDialect>(&self, sql: &mut String) {
        let Some(join) = &self.join else {
            return;
        };
        let _ = write!(sql, " JOIN {}", D::quote_identifier(&join.table));
        match &join.on {
            Some(JoinCondition::Raw(condition)) => {
                let _ = write!(sql, " ON {}", condition);
            }
            Some(JoinCondition::ColumnsEq { left, right }) => {
                let _ = write!(
                    sql,
                    " ON {}.{} = {}.{}",
                    D::quote_identifier(&left.table),
                    D::quote_identifier(&left.column),
                    D::quote_identifier(&right.table),
                    D::quote_identifier(&right.column)
                );
            }
            None => {}
        }
    }

    fn render_where<D: SqlDialect>(&self, sql: &mut String, params: &mut Vec<Value>) {
        if self.filters.is_empty() {
            return;
        }
        sql.push_str(" WHERE ");
        render_fragments::<D>(sql, params, &self.filters, " AND ");
    }

    fn render_tail<D: SqlDialect>(&self, sql: &mut String) {
        if let Some(order) = &self.order {
            let _ = write!(
                sql,
                " ORDER BY {} {}",
                quote_path::<D>(&order.field),
                order.direction.as_sql()
            );
        }
        if let Some(limit) = self.limit {
            let _ = write!(sql, " LIMIT {}", limit);
        }
        if let Some(offset) = self.offset {
            let _ = write!(sql, " OFFSET {}", offset);
        }
    }
}

fn dotted(table: &Option<String>, column: &str) -> String {
    match table {
        Some(table) => format!("{}.{}", table, column),
        None => column.to_owned(),
    }
}

fn quote_path<D: SqlDialect>(path: &str) -> String {
    path.split('.')
        .map(|part| D::quote_identifier(part))
        .collect::<Vec<_>>()
        .join(".")
}

fn render_column<D: SqlDialect>(table: &Option<String>, column: &str) -> String {
    match table {
        Some(table) => format!(
            "{}.{}",
            D::quote_identifier(table),
            D::quote_identifier(column)
        ),
        None => D::quote_identifier(column),
    }
}

fn render_fragments<D: SqlDialect>(
    sql: &mut String,
    params: &mut Vec<Value>,
    fragments: &[Fragment],
    separator: &str,
) {
    for (i, fragment) in fragments.iter().enumerate() {
        if i > 0 {
            sql.push_str(separator);
        }
        match fragment {
            Fragment::Raw { sql: raw, params: raw_params } => {
                sql.push_str(raw);
                params.extend(raw_params.iter().cloned());
            }
            Fragment::Eq {
                table,
                column,
                value,
            } => {
                params.push(value.clone());
                let _ = write!(
                    sql,
                    "{} = {}",
                    render_column::<D>(table, column),
                    D::placeholder(params.len())
                );
            }
            Fragment::In {
                table,
                column,
                values,
            } => {
                let _ = write!(sql, "{} IN (", render_column::<D>(table, column));
                for (j, value) in values.iter().enumerate() {
                    if j > 0 {
                        sql.push_str(", ");
                    }
                    params.push(value.clone());
                    sql.push_str(&D::placeholder(params.len()));
                }
                sql.push(')');
            }
        }
    }
}

/// Coerces a limit/offset input to a non-negative integer. Numbers are
/// truncated, strings parsed by their leading digits; anything else is zero.
pub(crate) fn coerce_count(value: &Value) -> u64 {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| {
                n.as_f64()
                    .filter(|f| f.is_finite() && *f >= 1.0)
                    .map(|f| f.trunc() as u64)
            })
            .unwrap_or(0),
        Value::String(s) => {
            let s = s.trim_start();
            let s = s.strip_prefix('+').unwrap_or(s);
            let digits: String = s.chars().take_while(char::is_ascii_digit).collect();
            digits.parse().unwrap_or(0)
        }
        _ => 0,
    }
}

/// Result of [`Query::find`]: a scalar id yields at most one row, a list of
/// ids yields a row set.
#[derive(Debug, Clone)]
pub enum Found {
    One(Option<Row>),
    Many(RowSet),
}

impl Found {
    pub fn into_rows(self) -> Vec<Row> {
        match self {
            Self::One(row) => row.into_iter().collect(),
            Self::Many(rows) => rows.into_rows(),
        }
    }
}

/// A query against one table.
///
/// `Query` provides a fluent interface that accumulates [`QueryState`] and a
/// list of associations to prefetch, then runs through the database's
/// executor.
#[derive(Clone)]
pub struct Query {
    db: Db,
    table: String,
    sql_table: String,
    primary_key: String,
    state: QueryState,
    prefetch: Vec<Prefetch>,
}

impl std::fmt::Debug for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("table", &self.table)
            .field("state", &self.state)
            .field("prefetch", &self.prefetch)
            .finish()
    }
}

impl Query {
    /// Creates a query on `table`, which must be part of the database's registry.
    pub fn new(db: Db, table: &str) -> KinshipResult<Self> {
        let descriptor = db.registry().require(table)?;
        let sql_table = descriptor.sql_name().to_owned();
        let primary_key = descriptor.primary_key().to_owned();
        Ok(Self {
            db,
            table: table.to_owned(),
            sql_table,
            primary_key,
            state: QueryState::default(),
            prefetch: Vec::new(),
        })
    }

    /// Table the query was created for (possibly an alias).
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Table name rendered into SQL.
    pub fn sql_table(&self) -> &str {
        &self.sql_table
    }

    pub fn state(&self) -> &QueryState {
        &self.state
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    pub fn prefetches(&self) -> &[Prefetch] {
        &self.prefetch
    }

    /// Adds a where-condition. Column conditions are qualified with the table.
    pub fn filter(mut self, condition: impl Into<Condition>) -> Self {
        self.state.push_condition(&self.sql_table, condition.into());
        self
    }

    /// Adds a verbatim where-fragment with the parameters for its placeholders.
    pub fn filter_raw<I, V>(mut self, sql: impl Into<String>, params: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let params = params.into_iter().map(Into::into).collect();
        self.state
            .push_condition(&self.sql_table, Condition::Raw(sql.into(), params));
        self
    }

    /// Adds an equality filter (`column = value`).
    pub fn filter_eq(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.state.filters.push(Fragment::Eq {
            table: Some(self.sql_table.clone()),
            column: column.to_owned(),
            value: value.into(),
        });
        self
    }

    /// Adds a membership filter (`column IN (values...)`). An empty list is
    /// reported when the query runs.
    pub fn filter_in<I, V>(mut self, column: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let values = values.into_iter().map(Into::into).collect();
        let table = self.sql_table.clone();
        self.state
            .push_membership(&table, column.to_owned(), values);
        self
    }

    pub(crate) fn filter_in_table(mut self, table: &str, column: &str, values: Vec<Value>) -> Self {
        self.state.push_membership(table, column.to_owned(), values);
        self
    }

    /// Adds assignments for update statements.
    pub fn set(mut self, assignment: impl Into<Condition>) -> Self {
        self.state
            .push_assignment(&self.sql_table, assignment.into());
        self
    }

    /// Adds a verbatim assignment fragment with its parameters.
    pub fn set_raw<I, V>(mut self, sql: impl Into<String>, params: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let params = params.into_iter().map(Into::into).collect();
        self.state
            .push_assignment(&self.sql_table, Condition::Raw(sql.into(), params));
        self
    }

    /// Orders by `field`; see [`Direction::parse`] for accepted directions.
    pub fn order(self, field: impl Into<String>, direction: &str) -> Self {
        self.order_by(field, Direction::parse(direction))
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.state.order = Some(Order {
            field: field.into(),
            direction,
        });
        self
    }

    /// Sets the maximum number of rows. Invalid or negative input counts as
    /// zero, which renders no limit.
    pub fn limit(mut self, limit: impl Into<Value>) -> Self {
        self.state.limit = Some(coerce_count(&limit.into())).filter(|n| *n > 0);
        self
    }

    pub fn limit_offset(self, limit: impl Into<Value>, offset: impl Into<Value>) -> Self {
        self.limit(limit).offset(offset)
    }

    /// Sets the number of rows to skip, coerced like [`limit`](Self::limit).
    pub fn offset(mut self, offset: impl Into<Value>) -> Self {
        self.state.offset = Some(coerce_count(&offset.into())).filter(|n| *n > 0);
        self
    }

    /// Restricts the projected columns.
    pub fn fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state.fields = fields.into_iter().map(|f| Field::Column(f.into())).collect();
        self
    }

    pub(crate) fn project(mut self, field: Field) -> Self {
        self.state.fields.push(field);
        self
    }

    /// Joins `table`, replacing any earlier join.
    pub fn join(mut self, table: impl Into<String>) -> Self {
        self.state.join = Some(Join {
            table: table.into(),
            on: None,
        });
        self
    }

    pub fn join_on(self, table: impl Into<String>, on: impl Into<JoinCondition>) -> Self {
        self.join(table).on(on)
    }

    /// Sets the condition of the current join. Ignored without a join.
    pub fn on(mut self, on: impl Into<JoinCondition>) -> Self {
        if let Some(join) = &mut self.state.join {
            join.on = Some(on.into());
        }
        self
    }

    /// Requests eager loading of associations when rows are fetched.
    pub fn prefetch<I, P>(mut self, prefetch: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Prefetch>,
    {
        self.prefetch.extend(prefetch.into_iter().map(Into::into));
        self
    }

    /// Eager loads one association.
    pub fn include(mut self, prefetch: impl Into<Prefetch>) -> Self {
        self.prefetch.push(prefetch.into());
        self
    }

    /// Replaces this query's state and prefetch list with copies of `other`'s.
    /// Filters qualified with `other`'s table are re-qualified with this one.
    pub fn copy_state(mut self, other: &Query) -> Self {
        self.state = other.state.clone();
        self.state.requalify(&other.sql_table, &self.sql_table);
        self.prefetch = other.prefetch.clone();
        self
    }

    /// Returns the SELECT statement and parameters this query would run.
    pub fn to_sql<D: SqlDialect>(&self) -> KinshipResult<(String, Vec<Value>)> {
        self.state.render::<D>(Statement::Select, &self.sql_table)
    }

    fn log(&self, statement: Statement) {
        if self.db.settings().log_queries {
            tracing::debug!(
                operation = statement.as_str(),
                table = %self.sql_table,
                filters = %self.state.describe(),
                "kinship query"
            );
        }
    }

    /// Executes the query and eager loads the requested associations.
    #[tracing::instrument(skip(self), fields(table = %self.table))]
    pub async fn get_all(self) -> KinshipResult<RowSet> {
        self.state.check()?;
        self.log(Statement::Select);

        let records = self
            .db
            .executor()
            .select(&self.sql_table, &self.state)
            .await?;
        let mut rows = RowSet::new(self.db.clone(), self.table.clone(), records);

        if !self.prefetch.is_empty() && !rows.is_empty() {
            prefetch::resolve(&self.db, &self.table, rows.as_mut_slice(), &self.prefetch).await?;
        }
        Ok(rows)
    }

    /// Fetches the first row, if any.
    pub async fn get(self) -> KinshipResult<Option<Row>> {
        let rows = self.limit(1).get_all().await?;
        Ok(rows.into_first())
    }

    #[tracing::instrument(skip(self), fields(table = %self.table))]
    pub async fn count(self) -> KinshipResult<u64> {
        self.state.check()?;
        self.log(Statement::Count);
        self.db
            .executor()
            .count(&self.sql_table, &self.state)
            .await
    }

    /// Applies the accumulated assignments to every matching row.
    ///
    /// # Errors
    /// Refuses to run without assignments.
    #[tracing::instrument(skip(self), fields(table = %self.table))]
    pub async fn update_all(self) -> KinshipResult<u64> {
        self.state.check()?;
        if self.state.assignments.is_empty() {
            return Err(KinshipError::EmptyUpdate {
                table: self.table.clone(),
            });
        }
        self.log(Statement::Update);
        self.db
            .executor()
            .update(&self.sql_table, &self.state)
            .await
    }

    /// Updates at most one matching row.
    pub async fn update(self) -> KinshipResult<u64> {
        self.limit(1).update_all().await
    }

    /// Deletes every matching row.
    ///
    /// # Errors
    /// Refuses to run without a where-clause or limit, and with an offset.
    #[tracing::instrument(skip(self), fields(table = %self.table))]
    pub async fn delete_all(self) -> KinshipResult<u64> {
        self.state.check()?;
        self.ensure_scoped_delete()?;
        self.log(Statement::Delete);
        self.db
            .executor()
            .delete(&self.sql_table, &self.state)
            .await
    }

    /// Deletes at most one matching row. Requires a where-clause.
    pub async fn delete(self) -> KinshipResult<u64> {
        if self.state.filters.is_empty() && self.state.limit.is_none() {
            return Err(KinshipError::UnscopedDelete {
                table: self.table.clone(),
            });
        }
        self.limit(1).delete_all().await
    }

    fn ensure_scoped_delete(&self) -> KinshipResult<()> {
        if self.state.filters.is_empty() && self.state.limit.is_none() {
            return Err(KinshipError::UnscopedDelete {
                table: self.table.clone(),
            });
        }
        if self.state.offset.is_some() {
            return Err(KinshipError::OffsetDelete {
                table: self.table.clone(),
            });
        }
        Ok(())
    }

    /// Adds a primary-key condition without running the query.
    pub fn filter_id(self, id: impl Into<Value>) -> Self {
        let column = self.primary_key.clone();
        match id.into() {
            Value::Array(ids) => self.filter_in(&column, ids),
            id => self.filter_eq(&column, id),
        }
    }

    /// Looks rows up by primary key: a scalar id runs [`get`](Self::get), an
    /// array of ids runs [`get_all`](Self::get_all).
    pub async fn find(self, id: impl Into<Value>) -> KinshipResult<Found> {
        let id = id.into();
        if id.is_array() {
            Ok(Found::Many(self.filter_id(id).get_all().await?))
        } else {
            Ok(Found::One(self.filter_id(id).get().await?))
        }
    }
}

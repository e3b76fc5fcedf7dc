//! Predicate clauses and column values bound into generated SQL.

use chrono::{DateTime, Utc};
use sqlx::{Postgres, QueryBuilder};
use uuid::Uuid;

use super::RepositoryError;

/// A value bound as a query parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    /// Written as a literal `NULL`, which PostgreSQL coerces to the
    /// column's type.
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Uuid(Uuid),
    Timestamp(DateTime<Utc>),
    Json(serde_json::Value),
}

impl SqlValue {
    pub(crate) fn push_bind(&self, query: &mut QueryBuilder<'_, Postgres>) {
        match self.clone() {
            SqlValue::Null => query.push("NULL"),
            SqlValue::Bool(value) => query.push_bind(value),
            SqlValue::Int(value) => query.push_bind(value),
            SqlValue::Float(value) => query.push_bind(value),
            SqlValue::Text(value) => query.push_bind(value),
            SqlValue::Uuid(value) => query.push_bind(value),
            SqlValue::Timestamp(value) => query.push_bind(value),
            SqlValue::Json(value) => query.push_bind(value),
        };
    }
}

impl From<bool> for SqlValue {
    fn from(value: bool) -> Self {
        SqlValue::Bool(value)
    }
}

impl From<i32> for SqlValue {
    fn from(value: i32) -> Self {
        SqlValue::Int(i64::from(value))
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        SqlValue::Int(value)
    }
}

impl From<f64> for SqlValue {
    fn from(value: f64) -> Self {
        SqlValue::Float(value)
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        SqlValue::Text(value)
    }
}

impl From<Uuid> for SqlValue {
    fn from(value: Uuid) -> Self {
        SqlValue::Uuid(value)
    }
}

impl From<DateTime<Utc>> for SqlValue {
    fn from(value: DateTime<Utc>) -> Self {
        SqlValue::Timestamp(value)
    }
}

impl From<serde_json::Value> for SqlValue {
    fn from(value: serde_json::Value) -> Self {
        SqlValue::Json(value)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(SqlValue::Null, Into::into)
    }
}

/// A predicate: an SQL fragment with `?` placeholders and its arguments.
///
/// Every `?` in the fragment is a placeholder; clauses are AND-combined when
/// several are given.
///
/// ```ignore
/// let owned = Clause::new("api_key_id = ? AND currency = ?")
///     .bind(api_key_id)
///     .bind("USD");
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Clause {
    sql: String,
    args: Vec<SqlValue>,
}

impl Clause {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            args: Vec::new(),
        }
    }

    /// Bind the next placeholder.
    pub fn bind(mut self, value: impl Into<SqlValue>) -> Self {
        self.args.push(value.into());
        self
    }

    /// `column = ?`
    pub fn eq(column: &str, value: impl Into<SqlValue>) -> Self {
        Self::new(format!("{column} = ?")).bind(value)
    }

    /// `column IS NULL`
    pub fn is_null(column: &str) -> Self {
        Self::new(format!("{column} IS NULL"))
    }

    /// Case-insensitive substring search over `fields`.
    ///
    /// Produces `(LOWER(a) LIKE ? OR LOWER(b) LIKE ?)` with `%keyword%`
    /// bound once per field. LIKE wildcards in the keyword match literally.
    /// Returns `None` for a blank keyword or no fields.
    pub fn keyword(fields: &[&str], keyword: &str) -> Option<Self> {
        let keyword = keyword.trim();
        if keyword.is_empty() || fields.is_empty() {
            return None;
        }

        let pattern = format!("%{}%", escape_like(&keyword.to_lowercase()));
        let sql = fields
            .iter()
            .map(|field| format!("LOWER({field}) LIKE ?"))
            .collect::<Vec<_>>()
            .join(" OR ");

        let clause = fields
            .iter()
            .fold(Self::new(format!("({sql})")), |clause, _| {
                clause.bind(pattern.clone())
            });
        Some(clause)
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn args(&self) -> &[SqlValue] {
        &self.args
    }

    fn check(&self) -> Result<(), RepositoryError> {
        let expected = self.sql.matches('?').count();
        if expected != self.args.len() {
            return Err(RepositoryError::InvalidClause {
                sql: self.sql.clone(),
                expected,
                actual: self.args.len(),
            });
        }
        Ok(())
    }

    fn push_to(&self, query: &mut QueryBuilder<'_, Postgres>) {
        let mut segments = self.sql.split('?');
        if let Some(first) = segments.next() {
            query.push(first);
        }
        for (segment, arg) in segments.zip(&self.args) {
            arg.push_bind(query);
            query.push(segment);
        }
    }
}

/// Append ` WHERE (c1) AND (c2) ...`; nothing when `clauses` is empty.
pub(crate) fn push_where(
    query: &mut QueryBuilder<'_, Postgres>,
    clauses: &[Clause],
) -> Result<(), RepositoryError> {
    clauses.iter().try_for_each(Clause::check)?;

    for (index, clause) in clauses.iter().enumerate() {
        query.push(if index == 0 { " WHERE (" } else { " AND (" });
        clause.push_to(query);
        query.push(")");
    }
    Ok(())
}

/// Append raw JOIN fragments.
pub(crate) fn push_joins(query: &mut QueryBuilder<'_, Postgres>, joins: &[&str]) {
    for join in joins {
        query.push(" ");
        query.push(join.trim());
    }
}

fn escape_like(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Column/value pairs written by an INSERT or UPDATE.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ColumnValues(Vec<(&'static str, SqlValue)>);

impl ColumnValues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, column: &'static str, value: impl Into<SqlValue>) -> Self {
        self.0.push((column, value.into()));
        self
    }

    /// Set `column` only when `value` is present.
    pub fn set_opt<T: Into<SqlValue>>(self, column: &'static str, value: Option<T>) -> Self {
        match value {
            Some(value) => self.set(column, value),
            None => self,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn contains(&self, column: &str) -> bool {
        self.0.iter().any(|(name, _)| *name == column)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(&'static str, SqlValue)> {
        self.0.iter()
    }
}

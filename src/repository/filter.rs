//! Count + window composition for paginated listings.
//!
//! [`paginate`] runs the count query for a listing and hands back a
//! [`Window`] that appends the same joins and predicates, plus ordering and
//! the LIMIT/OFFSET window, to the caller's select.
//!
//! ```ignore
//! let window = filter::paginate(&pool, "accounts", &mut pagination, &clauses, &[]).await?;
//! let mut query = QueryBuilder::new("SELECT accounts.* FROM accounts");
//! window.apply(&mut query)?;
//! ```

use std::time::Instant;

use sqlx::{PgExecutor, Postgres, QueryBuilder};

use super::{Clause, RepositoryError, push_joins, push_where};
use crate::pagination::Pagination;

/// `SELECT COUNT(*) FROM table <joins> WHERE <clauses>`.
pub fn count_query(
    table: &str,
    clauses: &[Clause],
    joins: &[&str],
) -> Result<QueryBuilder<'static, Postgres>, RepositoryError> {
    let mut query = QueryBuilder::new(format!("SELECT COUNT(*) FROM {table}"));
    push_joins(&mut query, joins);
    push_where(&mut query, clauses)?;
    Ok(query)
}

/// Joins, predicates, ordering and window of one page.
#[derive(Debug, Clone, PartialEq)]
pub struct Window {
    joins: Vec<String>,
    clauses: Vec<Clause>,
    order: Option<String>,
    limit: u32,
    offset: u64,
}

impl Window {
    /// Window for an already normalized `pagination`.
    ///
    /// # Errors
    ///
    /// Fails when the sort parameters are invalid.
    pub fn new(
        pagination: &Pagination,
        clauses: &[Clause],
        joins: &[&str],
    ) -> Result<Self, RepositoryError> {
        let order = pagination.sort()?.and_then(|sort| sort.to_sql());

        Ok(Self {
            joins: joins.iter().map(|join| join.to_string()).collect(),
            clauses: clauses.to_vec(),
            order,
            limit: pagination.limit(),
            offset: pagination.offset(),
        })
    }

    /// Append joins, WHERE, ORDER BY, LIMIT and OFFSET to `query`.
    pub fn apply(&self, query: &mut QueryBuilder<'_, Postgres>) -> Result<(), RepositoryError> {
        let joins: Vec<&str> = self.joins.iter().map(String::as_str).collect();
        push_joins(query, &joins);
        push_where(query, &self.clauses)?;

        if let Some(order) = &self.order {
            query.push(" ORDER BY ");
            query.push(order);
        }
        query.push(" LIMIT ");
        query.push_bind(i64::from(self.limit));
        query.push(" OFFSET ");
        query.push_bind(i64::try_from(self.offset).unwrap_or(i64::MAX));
        Ok(())
    }

    pub fn order(&self) -> Option<&str> {
        self.order.as_deref()
    }
}

/// Count the rows of a listing and compute its window.
///
/// Normalizes `pagination` and writes `total_data`/`total_pages` into it.
/// The count runs on `executor`: a pool, or a connection inside a transaction.
///
/// # Errors
///
/// Invalid sort parameters, malformed clauses or a failed count query.
pub async fn paginate<'c, E: PgExecutor<'c>>(
    executor: E,
    table: &str,
    pagination: &mut Pagination,
    clauses: &[Clause],
    joins: &[&str],
) -> Result<Window, RepositoryError> {
    pagination.normalize();
    let window = Window::new(pagination, clauses, joins)?;

    let mut query = count_query(table, clauses, joins)?;
    let started = Instant::now();
    let result = query.build_query_scalar::<i64>().fetch_one(executor).await;
    let total = match result {
        Ok(total) => total,
        Err(error) => {
            tracing::error!(table, sql = query.sql(), %error, "count query failed");
            return Err(error.into());
        }
    };

    tracing::debug!(
        table,
        total,
        latency_ms = started.elapsed().as_millis() as u64,
        "counted rows"
    );

    pagination.set_total(total);
    Ok(window)
}

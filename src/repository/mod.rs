//! Generic CRUD repository over PostgreSQL.
//!
//! A [`Repository`] is parameterized over a persisted model `M` and the DTO
//! shapes used at the boundary:
//!
//! - `D`: read DTO returned by `create`, `update` and `find_one`
//! - `L`: list DTO returned by `find_all` and `find_page`
//! - `C`: create DTO accepted by `create`
//! - `U`: update DTO accepted by `update`
//!
//! Rows with a non-NULL soft-delete column are invisible to every operation.
//!
//! # Update Policy
//!
//! `update` fails with [`RepositoryError::NotFound`] when the predicate
//! matches no live row, so "no such record" is never reported as success.

mod clause;
pub mod filter;

use std::{
    marker::PhantomData,
    time::{Duration, Instant},
};

use sqlx::{FromRow, PgConnection, PgExecutor, PgPool, Postgres, QueryBuilder, postgres::PgRow};

pub use clause::{Clause, ColumnValues, SqlValue};
pub(crate) use clause::{push_joins, push_where};

use crate::pagination::{Pagination, PaginationError};

/// Slow-query threshold used unless configured otherwise.
pub const DEFAULT_SLOW_QUERY_THRESHOLD: Duration = Duration::from_millis(200);

/// Errors returned by repository operations.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    /// No live row matched a lookup or an update.
    #[error("Record Not Found")]
    NotFound,

    /// A unique constraint rejected the write.
    #[error("Record already exists")]
    Conflict(#[source] sqlx::Error),

    /// Any other failure reported by the store.
    #[error("Database error: {0}")]
    Database(#[source] sqlx::Error),

    #[error(transparent)]
    Pagination(#[from] PaginationError),

    /// A clause's placeholders don't match its arguments.
    #[error("clause `{sql}` has {expected} placeholders but {actual} arguments")]
    InvalidClause {
        sql: String,
        expected: usize,
        actual: usize,
    },

    /// An insert or update with nothing to write.
    #[error("no column values to write")]
    EmptyValues,

    /// An update or delete without a predicate.
    #[error("refusing to {operation} every row of `{table}` without a predicate")]
    MissingPredicate {
        operation: &'static str,
        table: &'static str,
    },

    #[error("`{0}` has no soft-delete column")]
    SoftDeleteUnsupported(&'static str),
}

impl RepositoryError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RepositoryError::NotFound)
    }
}

impl From<sqlx::Error> for RepositoryError {
    fn from(error: sqlx::Error) -> Self {
        let unique_violation = matches!(
            &error,
            sqlx::Error::Database(database) if database.is_unique_violation()
        );

        if matches!(error, sqlx::Error::RowNotFound) {
            RepositoryError::NotFound
        } else if unique_violation {
            RepositoryError::Conflict(error)
        } else {
            RepositoryError::Database(error)
        }
    }
}

/// A persisted model.
///
/// Column names are used verbatim in generated SQL and must be trusted
/// identifiers.
pub trait Entity: for<'r> FromRow<'r, PgRow> + Send + Unpin + 'static {
    const TABLE: &'static str;

    /// Orders `find_one` so "first" is deterministic.
    const PRIMARY_KEY: &'static str = "id";

    /// Timestamp column set by `soft_delete`; `None` disables soft deletes.
    const SOFT_DELETE_COLUMN: Option<&'static str> = Some("deleted_at");

    /// Timestamp column bumped by every `update`.
    const UPDATED_AT_COLUMN: Option<&'static str> = Some("updated_at");
}

/// Build a DTO from a model.
pub trait FromModel<M>: Sized {
    fn from_model(model: M) -> Self;
}

impl<M: Entity> FromModel<M> for M {
    fn from_model(model: M) -> Self {
        model
    }
}

/// Map a create DTO to the columns inserted for the new row.
pub trait CreateDto<M> {
    fn into_values(self) -> ColumnValues;
}

/// Map an update DTO to the columns it changes.
pub trait UpdateDto<M> {
    fn into_changes(self) -> ColumnValues;
}

/// Repository with read operations only.
pub type ReadRepository<M, D> = Repository<M, D, D, (), ()>;

/// Generic repository; see the module documentation.
pub struct Repository<M, D, L = D, C = (), U = ()> {
    pool: PgPool,
    slow_query_threshold: Duration,
    _marker: PhantomData<fn() -> (M, D, L, C, U)>,
}

impl<M, D, L, C, U> Clone for Repository<M, D, L, C, U> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            slow_query_threshold: self.slow_query_threshold,
            _marker: PhantomData,
        }
    }
}

impl<M: Entity, D, L, C, U> Repository<M, D, L, C, U> {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            slow_query_threshold: DEFAULT_SLOW_QUERY_THRESHOLD,
            _marker: PhantomData,
        }
    }

    /// Statements slower than `threshold` are logged as warnings.
    pub fn with_slow_query_threshold(mut self, threshold: Duration) -> Self {
        self.slow_query_threshold = threshold;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// The same repository running its statements on `conn`.
    ///
    /// Pass an open transaction to make several writes commit or roll back
    /// together:
    ///
    /// ```ignore
    /// let mut tx = pool.begin().await?;
    /// let mut accounts = repository.tx(&mut tx);
    /// accounts.create(first).await?;
    /// accounts.create(second).await?;
    /// tx.commit().await?;
    /// ```
    pub fn tx<'c>(&self, conn: &'c mut PgConnection) -> TxRepository<'c, M, D, L, C, U> {
        TxRepository {
            conn,
            slow_query_threshold: self.slow_query_threshold,
            _marker: PhantomData,
        }
    }

    /// Mark live rows matching `predicate` as deleted.
    ///
    /// Returns the number of rows marked; zero is not an error.
    pub async fn soft_delete(&self, predicate: &[Clause]) -> Result<u64, RepositoryError> {
        soft_delete_on::<M, _>(&self.pool, self.slow_query_threshold, predicate).await
    }
}

impl<M, D, L, C, U> Repository<M, D, L, C, U>
where
    M: Entity,
    D: FromModel<M>,
    L: FromModel<M>,
{
    /// Live rows matching `predicate`, in `order` (raw ORDER BY terms).
    ///
    /// Empty when nothing matches.
    pub async fn find_all(
        &self,
        predicate: &[Clause],
        order: Option<&str>,
    ) -> Result<Vec<L>, RepositoryError> {
        find_all_on::<M, L, _>(&self.pool, self.slow_query_threshold, predicate, order).await
    }

    /// First live row matching `predicate`, ordered by primary key.
    ///
    /// # Errors
    ///
    /// [`RepositoryError::NotFound`] when no row matches.
    pub async fn find_one(&self, predicate: &[Clause]) -> Result<D, RepositoryError> {
        find_one_on::<M, D, _>(&self.pool, self.slow_query_threshold, predicate).await
    }

    /// Number of live rows matching `predicate`.
    pub async fn count(&self, predicate: &[Clause]) -> Result<i64, RepositoryError> {
        count_on::<M, _>(&self.pool, self.slow_query_threshold, predicate).await
    }

    /// One page of live rows.
    ///
    /// Fills `total_data`/`total_pages` on `pagination` and returns the rows
    /// of the requested window.
    pub async fn find_page(
        &self,
        pagination: &mut Pagination,
        predicate: &[Clause],
        joins: &[&str],
    ) -> Result<Vec<L>, RepositoryError> {
        let scoped = scoped::<M>(predicate);
        let window = filter::paginate(&self.pool, M::TABLE, pagination, &scoped, joins).await?;
        fetch_window::<M, L, _>(&self.pool, self.slow_query_threshold, &window).await
    }
}

impl<M, D, L, C, U> Repository<M, D, L, C, U>
where
    M: Entity,
    D: FromModel<M>,
    C: CreateDto<M>,
{
    /// Insert a row built from `dto` and return it as a read DTO.
    ///
    /// # Errors
    ///
    /// [`RepositoryError::Conflict`] on a unique-constraint violation.
    pub async fn create(&self, dto: C) -> Result<D, RepositoryError> {
        create_on::<M, D, _>(&self.pool, self.slow_query_threshold, dto.into_values()).await
    }
}

impl<M, D, L, C, U> Repository<M, D, L, C, U>
where
    M: Entity,
    D: FromModel<M>,
    U: UpdateDto<M>,
{
    /// Apply `dto` to every live row matching `predicate`.
    ///
    /// Returns the updated rows, never empty.
    ///
    /// # Errors
    ///
    /// [`RepositoryError::NotFound`] when no live row matched.
    pub async fn update(&self, dto: U, predicate: &[Clause]) -> Result<Vec<D>, RepositoryError> {
        update_on::<M, D, _>(&self.pool, self.slow_query_threshold, dto.into_changes(), predicate)
            .await
    }
}

/// A [`Repository`] bound to one connection, usually a transaction.
///
/// Built by [`Repository::tx`]. Operations take `&mut self` since the
/// connection runs one statement at a time.
pub struct TxRepository<'c, M, D, L = D, C = (), U = ()> {
    conn: &'c mut PgConnection,
    slow_query_threshold: Duration,
    _marker: PhantomData<fn() -> (M, D, L, C, U)>,
}

impl<M: Entity, D, L, C, U> TxRepository<'_, M, D, L, C, U> {
    pub async fn soft_delete(&mut self, predicate: &[Clause]) -> Result<u64, RepositoryError> {
        soft_delete_on::<M, _>(&mut *self.conn, self.slow_query_threshold, predicate).await
    }
}

impl<M, D, L, C, U> TxRepository<'_, M, D, L, C, U>
where
    M: Entity,
    D: FromModel<M>,
    L: FromModel<M>,
{
    pub async fn find_all(
        &mut self,
        predicate: &[Clause],
        order: Option<&str>,
    ) -> Result<Vec<L>, RepositoryError> {
        find_all_on::<M, L, _>(&mut *self.conn, self.slow_query_threshold, predicate, order).await
    }

    pub async fn find_one(&mut self, predicate: &[Clause]) -> Result<D, RepositoryError> {
        find_one_on::<M, D, _>(&mut *self.conn, self.slow_query_threshold, predicate).await
    }

    pub async fn count(&mut self, predicate: &[Clause]) -> Result<i64, RepositoryError> {
        count_on::<M, _>(&mut *self.conn, self.slow_query_threshold, predicate).await
    }

    pub async fn find_page(
        &mut self,
        pagination: &mut Pagination,
        predicate: &[Clause],
        joins: &[&str],
    ) -> Result<Vec<L>, RepositoryError> {
        let scoped = scoped::<M>(predicate);
        let window = filter::paginate(&mut *self.conn, M::TABLE, pagination, &scoped, joins).await?;
        fetch_window::<M, L, _>(&mut *self.conn, self.slow_query_threshold, &window).await
    }
}

impl<M, D, L, C, U> TxRepository<'_, M, D, L, C, U>
where
    M: Entity,
    D: FromModel<M>,
    C: CreateDto<M>,
{
    pub async fn create(&mut self, dto: C) -> Result<D, RepositoryError> {
        create_on::<M, D, _>(&mut *self.conn, self.slow_query_threshold, dto.into_values()).await
    }
}

impl<M, D, L, C, U> TxRepository<'_, M, D, L, C, U>
where
    M: Entity,
    D: FromModel<M>,
    U: UpdateDto<M>,
{
    pub async fn update(&mut self, dto: U, predicate: &[Clause]) -> Result<Vec<D>, RepositoryError> {
        let changes = dto.into_changes();
        update_on::<M, D, _>(&mut *self.conn, self.slow_query_threshold, changes, predicate).await
    }
}

// Operations shared by both repositories, generic over where they run.

async fn find_all_on<'c, M, L, E>(
    executor: E,
    threshold: Duration,
    predicate: &[Clause],
    order: Option<&str>,
) -> Result<Vec<L>, RepositoryError>
where
    M: Entity,
    L: FromModel<M>,
    E: PgExecutor<'c>,
{
    let query = select_query::<M>(predicate, order, None)?;
    let rows = fetch_all::<M, E>(executor, threshold, query).await?;
    Ok(map_list(rows))
}

async fn find_one_on<'c, M, D, E>(
    executor: E,
    threshold: Duration,
    predicate: &[Clause],
) -> Result<D, RepositoryError>
where
    M: Entity,
    D: FromModel<M>,
    E: PgExecutor<'c>,
{
    let order = format!("{}.{}", M::TABLE, M::PRIMARY_KEY);
    let query = select_query::<M>(predicate, Some(&order), Some(1))?;
    let row = fetch_optional::<M, E>(executor, threshold, query).await?;
    first_or_not_found(row)
}

async fn count_on<'c, M, E>(
    executor: E,
    threshold: Duration,
    predicate: &[Clause],
) -> Result<i64, RepositoryError>
where
    M: Entity,
    E: PgExecutor<'c>,
{
    let scoped = scoped::<M>(predicate);
    let mut query = filter::count_query(M::TABLE, &scoped, &[])?;
    let started = Instant::now();
    let result = query.build_query_scalar::<i64>().fetch_one(executor).await;
    trace(M::TABLE, threshold, query.sql(), started, result.as_ref().map(|_| 1));
    Ok(result?)
}

async fn fetch_window<'c, M, L, E>(
    executor: E,
    threshold: Duration,
    window: &filter::Window,
) -> Result<Vec<L>, RepositoryError>
where
    M: Entity,
    L: FromModel<M>,
    E: PgExecutor<'c>,
{
    let mut query = QueryBuilder::new(format!("SELECT {table}.* FROM {table}", table = M::TABLE));
    window.apply(&mut query)?;
    let rows = fetch_all::<M, E>(executor, threshold, query).await?;
    Ok(map_list(rows))
}

async fn create_on<'c, M, D, E>(
    executor: E,
    threshold: Duration,
    values: ColumnValues,
) -> Result<D, RepositoryError>
where
    M: Entity,
    D: FromModel<M>,
    E: PgExecutor<'c>,
{
    let query = insert_query::<M>(&values)?;
    let row = fetch_optional::<M, E>(executor, threshold, query).await?;
    first_or_not_found(row)
}

async fn update_on<'c, M, D, E>(
    executor: E,
    threshold: Duration,
    changes: ColumnValues,
    predicate: &[Clause],
) -> Result<Vec<D>, RepositoryError>
where
    M: Entity,
    D: FromModel<M>,
    E: PgExecutor<'c>,
{
    let query = update_query::<M>(&changes, predicate)?;
    let rows = fetch_all::<M, E>(executor, threshold, query).await?;
    if rows.is_empty() {
        return Err(RepositoryError::NotFound);
    }
    Ok(rows.into_iter().map(D::from_model).collect())
}

async fn soft_delete_on<'c, M, E>(
    executor: E,
    threshold: Duration,
    predicate: &[Clause],
) -> Result<u64, RepositoryError>
where
    M: Entity,
    E: PgExecutor<'c>,
{
    let mut query = soft_delete_query::<M>(predicate)?;
    let started = Instant::now();
    let result = query.build().execute(executor).await;
    trace(
        M::TABLE,
        threshold,
        query.sql(),
        started,
        result.as_ref().map(|done| done.rows_affected()),
    );
    Ok(result?.rows_affected())
}

async fn fetch_all<'c, M, E>(
    executor: E,
    threshold: Duration,
    mut query: QueryBuilder<'_, Postgres>,
) -> Result<Vec<M>, RepositoryError>
where
    M: Entity,
    E: PgExecutor<'c>,
{
    let started = Instant::now();
    let result = query.build_query_as::<M>().fetch_all(executor).await;
    trace(
        M::TABLE,
        threshold,
        query.sql(),
        started,
        result.as_ref().map(|rows| rows.len() as u64),
    );
    Ok(result?)
}

async fn fetch_optional<'c, M, E>(
    executor: E,
    threshold: Duration,
    mut query: QueryBuilder<'_, Postgres>,
) -> Result<Option<M>, RepositoryError>
where
    M: Entity,
    E: PgExecutor<'c>,
{
    let started = Instant::now();
    let result = query.build_query_as::<M>().fetch_optional(executor).await;
    trace(
        M::TABLE,
        threshold,
        query.sql(),
        started,
        result.as_ref().map(|row| u64::from(row.is_some())),
    );
    Ok(result?)
}

fn trace(
    table: &'static str,
    threshold: Duration,
    sql: &str,
    started: Instant,
    outcome: Result<u64, &sqlx::Error>,
) {
    let latency = started.elapsed();
    let latency_ms = latency.as_millis() as u64;
    match outcome {
        Err(error) => tracing::error!(table, sql, latency_ms, %error, "query failed"),
        Ok(rows) if latency > threshold => {
            tracing::warn!(table, sql, rows, latency_ms, "slow query")
        }
        Ok(rows) => tracing::debug!(table, sql, rows, latency_ms, "query"),
    }
}

fn map_list<M, L: FromModel<M>>(rows: Vec<M>) -> Vec<L> {
    rows.into_iter().map(L::from_model).collect()
}

fn first_or_not_found<M, D: FromModel<M>>(row: Option<M>) -> Result<D, RepositoryError> {
    row.map(D::from_model).ok_or(RepositoryError::NotFound)
}

/// `predicate` plus the soft-delete filter of `M`.
fn scoped<M: Entity>(predicate: &[Clause]) -> Vec<Clause> {
    let mut clauses = predicate.to_vec();
    if let Some(column) = M::SOFT_DELETE_COLUMN {
        clauses.push(Clause::is_null(&format!("{}.{column}", M::TABLE)));
    }
    clauses
}

fn select_query<M: Entity>(
    predicate: &[Clause],
    order: Option<&str>,
    limit: Option<u64>,
) -> Result<QueryBuilder<'static, Postgres>, RepositoryError> {
    let mut query = QueryBuilder::new(format!("SELECT {table}.* FROM {table}", table = M::TABLE));
    push_where(&mut query, &scoped::<M>(predicate))?;

    if let Some(order) = order.map(str::trim).filter(|order| !order.is_empty()) {
        query.push(" ORDER BY ");
        query.push(order);
    }
    if let Some(limit) = limit {
        query.push(" LIMIT ");
        query.push(limit);
    }
    Ok(query)
}

fn insert_query<M: Entity>(
    values: &ColumnValues,
) -> Result<QueryBuilder<'static, Postgres>, RepositoryError> {
    if values.is_empty() {
        return Err(RepositoryError::EmptyValues);
    }

    let mut query = QueryBuilder::new(format!("INSERT INTO {} (", M::TABLE));
    for (index, (column, _)) in values.iter().enumerate() {
        if index > 0 {
            query.push(", ");
        }
        query.push(column);
    }

    query.push(") VALUES (");
    for (index, (_, value)) in values.iter().enumerate() {
        if index > 0 {
            query.push(", ");
        }
        value.push_bind(&mut query);
    }
    query.push(") RETURNING *");
    Ok(query)
}

fn update_query<M: Entity>(
    changes: &ColumnValues,
    predicate: &[Clause],
) -> Result<QueryBuilder<'static, Postgres>, RepositoryError> {
    if predicate.is_empty() {
        return Err(RepositoryError::MissingPredicate {
            operation: "update",
            table: M::TABLE,
        });
    }
    if changes.is_empty() {
        return Err(RepositoryError::EmptyValues);
    }

    let mut query = QueryBuilder::new(format!("UPDATE {} SET ", M::TABLE));
    for (index, (column, value)) in changes.iter().enumerate() {
        if index > 0 {
            query.push(", ");
        }
        query.push(column);
        query.push(" = ");
        value.push_bind(&mut query);
    }
    if let Some(column) = M::UPDATED_AT_COLUMN.filter(|column| !changes.contains(column)) {
        query.push(format!(", {column} = NOW()"));
    }

    push_where(&mut query, &scoped::<M>(predicate))?;
    query.push(" RETURNING *");
    Ok(query)
}

fn soft_delete_query<M: Entity>(
    predicate: &[Clause],
) -> Result<QueryBuilder<'static, Postgres>, RepositoryError> {
    let column = M::SOFT_DELETE_COLUMN.ok_or(RepositoryError::SoftDeleteUnsupported(M::TABLE))?;
    if predicate.is_empty() {
        return Err(RepositoryError::MissingPredicate {
            operation: "delete",
            table: M::TABLE,
        });
    }

    let mut query = QueryBuilder::new(format!("UPDATE {} SET {column} = NOW()", M::TABLE));
    push_where(&mut query, &scoped::<M>(predicate))?;
    Ok(query)
}

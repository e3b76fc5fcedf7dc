//! Pagination parameters and page responses.
//!
//! A [`Pagination`] is usually extracted from the query string
//! (`?page=2&limit=20&sortBy=created_at&sortOrder=desc&keyword=acme`) and
//! handed to [`Repository::find_page`](crate::repository::Repository::find_page),
//! which fills in the totals.

use serde::{Deserialize, Serialize};

/// Limit used when the client sends none (or zero).
pub const DEFAULT_LIMIT: u32 = 10;

/// Errors raised while interpreting sort parameters.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PaginationError {
    /// `sortBy` is not a plain column reference.
    #[error("invalid sort field `{0}`")]
    InvalidSortField(String),

    /// `sortOrder` is neither ASC nor DESC.
    #[error("invalid sort direction `{0}`, expected ASC or DESC")]
    InvalidSortDirection(String),
}

/// Page window requested by a client plus the totals computed for it.
///
/// # Query Parameters
///
/// - `page`: 1-based page number, `0` or absent means 1
/// - `limit`: rows per page, `0` or absent means [`DEFAULT_LIMIT`]
/// - `sortBy` / `sortOrder`: column and direction
/// - `keyword`: free-text search term, interpreted by the caller
///
/// Only `page`, `limit`, `totalData` and `totalPages` are serialized.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    #[serde(default)]
    pub page: u32,

    #[serde(default)]
    pub limit: u32,

    #[serde(default, skip_serializing)]
    pub sort_by: String,

    #[serde(default, skip_serializing)]
    pub sort_order: String,

    #[serde(default, skip_serializing)]
    pub keyword: String,

    #[serde(default, skip_deserializing)]
    pub total_data: i64,

    #[serde(default, skip_deserializing)]
    pub total_pages: i64,
}

impl Pagination {
    pub fn new(page: u32, limit: u32) -> Self {
        Self {
            page,
            limit,
            ..Self::default()
        }
    }

    /// Effective page number (never 0).
    pub fn page(&self) -> u32 {
        if self.page == 0 { 1 } else { self.page }
    }

    /// Effective page size (never 0).
    pub fn limit(&self) -> u32 {
        if self.limit == 0 {
            DEFAULT_LIMIT
        } else {
            self.limit
        }
    }

    /// Number of rows to skip: `(page - 1) * limit`.
    pub fn offset(&self) -> u64 {
        u64::from(self.page() - 1) * u64::from(self.limit())
    }

    /// Replace zero page/limit by their effective values.
    pub fn normalize(&mut self) {
        self.page = self.page();
        self.limit = self.limit();
    }

    /// Trimmed search keyword, if any.
    pub fn keyword(&self) -> Option<&str> {
        let keyword = self.keyword.trim();
        (!keyword.is_empty()).then_some(keyword)
    }

    /// Record the total row count and derive `total_pages`.
    pub fn set_total(&mut self, total_data: i64) {
        let limit = i64::from(self.limit());
        self.total_data = total_data.max(0);
        self.total_pages = (self.total_data + limit - 1) / limit;
    }

    /// Resolve `sortBy`/`sortOrder`.
    ///
    /// - both empty: no sort
    /// - field only: ascending
    /// - direction only: a sort with an empty field, which orders nothing
    ///
    /// # Errors
    ///
    /// Returns an error when the direction is not ASC/DESC or the field is
    /// not a plain (optionally table-qualified) identifier.
    pub fn sort(&self) -> Result<Option<Sort>, PaginationError> {
        let field = self.sort_by.trim();
        let direction = self.sort_order.trim();

        if field.is_empty() && direction.is_empty() {
            return Ok(None);
        }

        let direction = if direction.is_empty() {
            SortDirection::Asc
        } else {
            direction.parse()?
        };

        if !field.is_empty() && !is_identifier(field) {
            return Err(PaginationError::InvalidSortField(field.to_string()));
        }

        Ok(Some(Sort {
            field: field.to_string(),
            direction,
        }))
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl SortDirection {
    pub fn as_sql(self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}

impl std::str::FromStr for SortDirection {
    type Err = PaginationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_uppercase().as_str() {
            "ASC" => Ok(SortDirection::Asc),
            "DESC" => Ok(SortDirection::Desc),
            _ => Err(PaginationError::InvalidSortDirection(value.to_string())),
        }
    }
}

/// Resolved ORDER BY term.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sort {
    /// Column to order by; empty in the direction-only case.
    pub field: String,
    pub direction: SortDirection,
}

impl Sort {
    /// `"field DIR"`, or `None` when there is no field to order by.
    pub fn to_sql(&self) -> Option<String> {
        if self.field.is_empty() {
            return None;
        }
        Some(format!("{} {}", self.field, self.direction.as_sql()))
    }
}

/// One page of rows plus the pagination that produced it.
///
/// ```json
/// { "page": 1, "limit": 10, "totalData": 42, "totalPages": 5, "rows": [] }
/// ```
#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    #[serde(flatten)]
    pub pagination: Pagination,
    pub rows: Vec<T>,
}

impl<T> Page<T> {
    pub fn new(rows: Vec<T>, pagination: Pagination) -> Self {
        Self { pagination, rows }
    }
}

/// Plain column reference: `[A-Za-z_][A-Za-z0-9_]*` segments joined by dots.
pub(crate) fn is_identifier(value: &str) -> bool {
    !value.is_empty()
        && value.split('.').all(|segment| {
            let mut chars = segment.chars();
            matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        })
}

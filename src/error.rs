//! Error taxonomy and HTTP error response handling.
//!
//! Every layer of the kit eventually turns its failures into an [`AppError`]:
//! a structured error carrying a category path, the HTTP status it maps to,
//! a human-readable message and the source locations it was raised and
//! re-wrapped at.
//!
//! # Response Format
//!
//! ```json
//! {
//!   "message": "Record Not Found",
//!   "code": 404,
//!   "statusCode": "REPOSITORY -> ACCOUNTS__GET"
//! }
//! ```
//!
//! Errors with a status of 500 or above are fatal: their own message is
//! replaced by a generic one before it leaves the process. Locations and
//! stacks are only ever logged, never serialized.

use std::{
    any::Any,
    backtrace::{Backtrace, BacktraceStatus},
    error::Error as StdError,
    fmt,
    panic::Location,
    sync::Arc,
};

use axum::{
    Json,
    extract::rejection::{JsonRejection, PathRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::{
    http_client::HttpClientError, middleware::panic_capture::PanicReport,
    pagination::PaginationError, repository::RepositoryError,
};

/// Boxed cause accepted by every [`AppError`] constructor.
///
/// `&str` and `String` convert into it, so a plain message works as a cause.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Separator between the categories of a wrapped error.
pub const PART_SEPARATOR: &str = " -> ";

/// Message shown to clients for fatal errors unless configured otherwise.
pub const DEFAULT_FATAL_MESSAGE: &str = "An internal error occurred";

/// Application-wide error type.
///
/// # Wrapping
///
/// Constructing an `AppError` from a cause that already is an `AppError`
/// wraps it: the new category is appended to the path (`"X -> Y"`), the
/// inner message, callers and stack are kept, and the inner status wins
/// unless the constructor names a status explicitly.
///
/// ```ignore
/// let inner = AppError::not_found("REPOSITORY", "Record Not Found");
/// let outer = AppError::new("ACCOUNTS__GET", inner);
/// assert_eq!(outer.part(), "REPOSITORY -> ACCOUNTS__GET");
/// assert_eq!(outer.status(), StatusCode::NOT_FOUND);
/// ```
#[derive(Debug)]
pub struct AppError {
    part: String,
    message: String,
    status: StatusCode,
    location: &'static Location<'static>,
    callers: Vec<String>,
    stack: Option<String>,
    source: Option<BoxError>,
}

impl AppError {
    /// Wrap `cause` under `part`.
    ///
    /// The status is 500 unless `cause` is itself an `AppError`, in which
    /// case its status is carried over.
    #[track_caller]
    pub fn new(part: &str, cause: impl Into<BoxError>) -> Self {
        Self::build(part, cause.into(), None)
    }

    /// 400 Bad Request.
    #[track_caller]
    pub fn bad_request(part: &str, cause: impl Into<BoxError>) -> Self {
        Self::build(part, cause.into(), Some(StatusCode::BAD_REQUEST))
    }

    /// 401 Unauthorized.
    #[track_caller]
    pub fn unauthorized(part: &str, cause: impl Into<BoxError>) -> Self {
        Self::build(part, cause.into(), Some(StatusCode::UNAUTHORIZED))
    }

    /// 403 Forbidden.
    #[track_caller]
    pub fn forbidden(part: &str, cause: impl Into<BoxError>) -> Self {
        Self::build(part, cause.into(), Some(StatusCode::FORBIDDEN))
    }

    /// 404 Not Found.
    #[track_caller]
    pub fn not_found(part: &str, cause: impl Into<BoxError>) -> Self {
        Self::build(part, cause.into(), Some(StatusCode::NOT_FOUND))
    }

    /// 500 Internal Server Error, even when wrapping a non-fatal error.
    #[track_caller]
    pub fn internal(part: &str, cause: impl Into<BoxError>) -> Self {
        Self::build(part, cause.into(), Some(StatusCode::INTERNAL_SERVER_ERROR))
    }

    /// 502 Bad Gateway, for failures of downstream services.
    #[track_caller]
    pub fn bad_gateway(part: &str, cause: impl Into<BoxError>) -> Self {
        Self::build(part, cause.into(), Some(StatusCode::BAD_GATEWAY))
    }

    /// Any other status.
    #[track_caller]
    pub fn custom(part: &str, status: StatusCode, cause: impl Into<BoxError>) -> Self {
        Self::build(part, cause.into(), Some(status))
    }

    /// Fatal error for a recovered panic.
    ///
    /// The message is taken from the panic payload. When a [`PanicReport`]
    /// was captured by the panic hook its location and backtrace are used
    /// as the origin and stack.
    #[track_caller]
    pub fn from_panic(payload: Box<dyn Any + Send + 'static>, report: Option<PanicReport>) -> Self {
        let message = if let Some(message) = payload.downcast_ref::<&str>() {
            (*message).to_string()
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.clone()
        } else {
            "panic with a non-string payload".to_string()
        };

        let location = Location::caller();
        let (callers, stack) = match report {
            Some(report) => (
                vec![report.location.unwrap_or_else(|| format_location(location))],
                Some(report.backtrace),
            ),
            None => (vec![format_location(location)], None),
        };

        Self {
            part: "PANIC".to_string(),
            message,
            status: StatusCode::INTERNAL_SERVER_ERROR,
            location,
            callers,
            stack,
            source: None,
        }
    }

    #[track_caller]
    fn build(part: &str, cause: BoxError, status: Option<StatusCode>) -> Self {
        let location = Location::caller();

        match cause.downcast::<AppError>() {
            Ok(inner) => {
                let mut inner = *inner;
                let mut callers = inner.callers.clone();
                callers.push(format_location(location));

                Self {
                    part: join_parts(&inner.part, part),
                    message: inner.message.clone(),
                    status: status.unwrap_or(inner.status),
                    location,
                    callers,
                    stack: inner.stack.take(),
                    source: Some(Box::new(inner)),
                }
            }
            Err(cause) => Self {
                part: part.to_string(),
                message: cause.to_string(),
                status: status.unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                location,
                callers: vec![format_location(location)],
                stack: capture_stack(),
                source: Some(cause),
            },
        }
    }

    /// Category path, outermost category last.
    pub fn part(&self) -> &str {
        &self.part
    }

    /// Message of the innermost cause.
    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Whether the status is a server error (500 or above).
    pub fn is_fatal(&self) -> bool {
        self.status.is_server_error()
    }

    /// `file:line` of the outermost construction site.
    pub fn location(&self) -> String {
        format_location(self.location)
    }

    /// Every construction site, innermost first.
    pub fn callers(&self) -> &[String] {
        &self.callers
    }

    /// `file:line` where the error was first raised.
    pub fn origin(&self) -> Option<&str> {
        self.callers.first().map(String::as_str)
    }

    /// Backtrace captured at the origin, when backtraces are enabled.
    pub fn stack(&self) -> Option<&str> {
        self.stack.as_deref()
    }

    /// Render the wire response.
    ///
    /// `fatal_message` replaces the message of fatal errors.
    pub fn to_response(&self, fatal_message: &str) -> Response {
        let message = if self.is_fatal() {
            fatal_message
        } else {
            self.message.as_str()
        };

        let body = ErrorBody {
            message,
            code: self.status.as_u16(),
            status_code: &self.part,
        };

        (self.status, Json(body)).into_response()
    }
}

/// JSON body of an error response.
#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    message: &'a str,
    code: u16,
    #[serde(rename = "statusCode")]
    status_code: &'a str,
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.part.is_empty() {
            write!(f, "[{}]", self.status.as_u16())?;
        } else {
            write!(f, "[{} | {}]", self.status.as_u16(), self.part)?;
        }
        write!(f, " {}\r\n\t{}", self.message, format_location(self.location))
    }
}

impl StdError for AppError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|source| source as &(dyn StdError + 'static))
    }
}

/// Convert AppError into an HTTP response.
///
/// The response carries the error itself in its extensions so the request
/// logging middleware can log it and re-render fatal errors with the
/// configured message.
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let error = Arc::new(self);
        let mut response = error.to_response(DEFAULT_FATAL_MESSAGE);
        response.extensions_mut().insert(error);
        response
    }
}

impl From<RepositoryError> for AppError {
    #[track_caller]
    fn from(error: RepositoryError) -> Self {
        let status = match &error {
            RepositoryError::NotFound => StatusCode::NOT_FOUND,
            RepositoryError::Conflict(_) => StatusCode::CONFLICT,
            RepositoryError::Pagination(_) => StatusCode::BAD_REQUEST,
            RepositoryError::Database(_)
            | RepositoryError::InvalidClause { .. }
            | RepositoryError::EmptyValues
            | RepositoryError::MissingPredicate { .. }
            | RepositoryError::SoftDeleteUnsupported(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::build("REPOSITORY", Box::new(error), Some(status))
    }
}

impl From<sqlx::Error> for AppError {
    #[track_caller]
    fn from(error: sqlx::Error) -> Self {
        Self::from(RepositoryError::from(error))
    }
}

impl From<PaginationError> for AppError {
    #[track_caller]
    fn from(error: PaginationError) -> Self {
        Self::build("PAGINATION", Box::new(error), Some(StatusCode::BAD_REQUEST))
    }
}

impl From<HttpClientError> for AppError {
    #[track_caller]
    fn from(error: HttpClientError) -> Self {
        let status = match &error {
            HttpClientError::InvalidUrl(_)
            | HttpClientError::InvalidHeader(_)
            | HttpClientError::Encode(_) => StatusCode::INTERNAL_SERVER_ERROR,
            HttpClientError::Transport(_)
            | HttpClientError::Status { .. }
            | HttpClientError::Decode(_) => StatusCode::BAD_GATEWAY,
        };
        Self::build("HTTP_CLIENT", Box::new(error), Some(status))
    }
}

impl From<JsonRejection> for AppError {
    #[track_caller]
    fn from(rejection: JsonRejection) -> Self {
        Self::custom("REQUEST__JSON", rejection.status(), rejection.body_text())
    }
}

impl From<QueryRejection> for AppError {
    #[track_caller]
    fn from(rejection: QueryRejection) -> Self {
        Self::custom("REQUEST__QUERY", rejection.status(), rejection.body_text())
    }
}

impl From<PathRejection> for AppError {
    #[track_caller]
    fn from(rejection: PathRejection) -> Self {
        Self::custom("REQUEST__PATH", rejection.status(), rejection.body_text())
    }
}

fn join_parts(inner: &str, outer: &str) -> String {
    match (inner.is_empty(), outer.is_empty()) {
        (true, _) => outer.to_string(),
        (false, true) => inner.to_string(),
        (false, false) => format!("{inner}{PART_SEPARATOR}{outer}"),
    }
}

fn format_location(location: &Location<'_>) -> String {
    format!("{}:{}", location.file(), location.line())
}

/// Capture a backtrace when `RUST_BACKTRACE`/`RUST_LIB_BACKTRACE` enable it.
fn capture_stack() -> Option<String> {
    let backtrace = Backtrace::capture();
    match backtrace.status() {
        BacktraceStatus::Captured => Some(backtrace.to_string()),
        _ => None,
    }
}

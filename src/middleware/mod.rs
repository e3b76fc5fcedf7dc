//! HTTP middleware components.
//!
//! Middleware run around route handlers. They:
//! - Authenticate requests
//! - Log requests and recover from panics
//! - Reject malformed requests with the common error body

/// Bearer token authentication middleware
pub mod auth;

/// Extractors with JSON error rejections
pub mod extract;

/// Panic location capture for the logging layer
pub mod panic_capture;

/// Request id, timing and completion logging
pub mod request_log;

//! HTTP request handlers (route handlers).
//!
//! Each handler is an async function that:
//! 1. Receives HTTP request data (JSON body, URL params, etc.)
//! 2. Performs business logic through the repositories
//! 3. Returns HTTP response (JSON, status code)

use sqlx::PgPool;

use crate::models::account::AccountRepository;

/// Account management endpoints
pub mod accounts;
/// Service health endpoint
pub mod health;
/// Authenticated caller endpoint
pub mod whoami;

/// State shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub accounts: AccountRepository,
}

//! Helpers for building HTTP backends on axum and sqlx.
//!
//! - [`middleware::auth`]: bearer token guard with a pluggable resolver
//! - [`repository`]: generic CRUD repository with soft deletes
//! - [`pagination`] and [`repository::filter`]: paged listings
//! - [`error`]: structured errors rendered as JSON responses
//! - [`middleware::request_log`]: request ids, completion logs, panic recovery
//! - [`http_client`]: outbound JSON/form requests
//! - [`server`]: serving with graceful shutdown

pub mod config;
pub mod error;
pub mod http_client;
pub mod logging;
pub mod middleware;
pub mod pagination;
pub mod repository;
pub mod server;

pub use middleware::auth;

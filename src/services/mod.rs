//! Services backing the demo API.

/// API key lookup used by the auth guard
pub mod api_key_resolver;

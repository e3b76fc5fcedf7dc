//! Rows of the demo schema and the DTOs mapped over them.

pub mod account;
pub mod api_key;

//! API key model for authentication.
//!
//! API keys authenticate the businesses calling the demo API. They are stored
//! as SHA-256 hashes; the raw key is only ever seen in the Authorization
//! header.

use axum_service_kit::repository::{Entity, FromModel};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Represents an API key record from the database.
///
/// # Database Table
///
/// Maps to the `api_keys` table with columns:
/// - `id`: Unique identifier (UUID)
/// - `key_hash`: SHA-256 hash of the actual API key, only ever filtered on
/// - `business_name`: Name of the business this key belongs to
/// - `created_at`: When the key was created
/// - `is_active`: Whether the key is currently valid
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ApiKey {
    pub id: Uuid,

    pub business_name: String,

    pub created_at: DateTime<Utc>,

    /// Inactive keys are rejected during authentication.
    pub is_active: bool,
}

/// Keys are revoked through `is_active`, never deleted.
impl Entity for ApiKey {
    const TABLE: &'static str = "api_keys";
    const SOFT_DELETE_COLUMN: Option<&'static str> = None;
    const UPDATED_AT_COLUMN: Option<&'static str> = None;
}

/// The authenticated business, attached to requests by the auth guard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Caller {
    pub api_key_id: Uuid,
    pub business_name: String,
    pub key_created_at: DateTime<Utc>,
}

impl FromModel<ApiKey> for Caller {
    fn from_model(key: ApiKey) -> Self {
        Self {
            api_key_id: key.id,
            business_name: key.business_name,
            key_created_at: key.created_at,
        }
    }
}

/// Hex-encoded SHA-256 of a raw API key, as stored in `key_hash`.
pub fn hash_key(raw: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    hex::encode(hasher.finalize())
}

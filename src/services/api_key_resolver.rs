//! Bearer token resolution against the `api_keys` table.

use async_trait::async_trait;
use axum_service_kit::{
    auth::{ResolveError, TokenResolver},
    repository::{Clause, FromModel, ReadRepository, RepositoryError},
};
use sqlx::PgPool;

use crate::models::api_key::{ApiKey, Caller, hash_key};

/// Resolves raw API keys to the [`Caller`] owning them.
///
/// # Flow
///
/// 1. Hash the token using SHA-256
/// 2. Look up the hash
/// 3. No match, or a revoked key, resolves to no user, which the guard
///    rejects with 401
pub struct ApiKeyResolver {
    keys: ReadRepository<ApiKey, ApiKey>,
}

impl ApiKeyResolver {
    pub fn new(pool: PgPool) -> Self {
        Self {
            keys: ReadRepository::new(pool),
        }
    }
}

#[async_trait]
impl TokenResolver for ApiKeyResolver {
    type User = Caller;

    async fn resolve(&self, token: &str) -> Result<Option<Caller>, ResolveError> {
        let predicate = [Clause::eq("key_hash", hash_key(token))];

        match self.keys.find_one(&predicate).await {
            Ok(key) if !key.is_active => {
                tracing::debug!(api_key_id = %key.id, "revoked api key presented");
                Ok(None)
            }
            Ok(key) => Ok(Some(Caller::from_model(key))),
            Err(RepositoryError::NotFound) => Ok(None),
            Err(error) => Err(ResolveError::internal(error)),
        }
    }
}

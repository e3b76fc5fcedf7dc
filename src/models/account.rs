//! Account data models and API request/response types.
//!
//! This module defines:
//! - `Account`: Database entity representing an account
//! - `CreateAccountRequest` / `NewAccount`: Request body and insert values
//! - `UpdateAccountRequest`: Partial update body
//! - `AccountResponse`: Response body returned to clients

use axum_service_kit::{
    error::AppError,
    repository::{ColumnValues, CreateDto, Entity, FromModel, Repository, UpdateDto},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Repository over `accounts`, exposing [`AccountResponse`] only.
pub type AccountRepository =
    Repository<Account, AccountResponse, AccountResponse, NewAccount, UpdateAccountRequest>;

/// Columns searched by the `keyword` list parameter.
pub const KEYWORD_FIELDS: &[&str] = &["accounts.account_name", "accounts.currency"];

/// Represents an account record from the database.
///
/// # Database Table
///
/// Maps to the `accounts` table. Each account:
/// - Belongs to one business (via `api_key_id`)
/// - Has a balance stored in cents (to avoid floating-point errors)
/// - Is hidden once `deleted_at` is set
///
/// `api_key_id` and `deleted_at` are only filtered on and never loaded.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Account {
    pub id: Uuid,

    pub account_name: String,

    /// Current balance in cents (not dollars)
    pub balance_cents: i64,

    /// Currency code (ISO 4217, 3 letters)
    pub currency: String,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl Entity for Account {
    const TABLE: &'static str = "accounts";
}

/// Request body for creating a new account.
///
/// # JSON Example
///
/// ```json
/// {
///   "account_name": "My Savings Account",
///   "currency": "USD",
///   "initial_balance_cents": 10000
/// }
/// ```
///
/// # Validation
///
/// - `account_name`: Required, non-blank
/// - `currency`: Optional, defaults to "USD", three uppercase letters
/// - `initial_balance_cents`: Optional, defaults to 0, never negative
#[derive(Debug, Deserialize)]
pub struct CreateAccountRequest {
    pub account_name: String,

    #[serde(default = "default_currency")]
    pub currency: String,

    #[serde(default)]
    pub initial_balance_cents: i64,
}

fn default_currency() -> String {
    "USD".to_string()
}

impl CreateAccountRequest {
    pub fn validate(&self) -> Result<(), AppError> {
        validate_name(&self.account_name)?;
        validate_currency(&self.currency)?;
        if self.initial_balance_cents < 0 {
            return Err(AppError::bad_request(
                "ACCOUNTS__VALIDATE",
                "initial_balance_cents must not be negative",
            ));
        }
        Ok(())
    }

    /// Attach the owning API key.
    pub fn owned_by(self, api_key_id: Uuid) -> NewAccount {
        NewAccount {
            api_key_id,
            request: self,
        }
    }
}

/// A validated create request plus its owner.
#[derive(Debug)]
pub struct NewAccount {
    api_key_id: Uuid,
    request: CreateAccountRequest,
}

impl CreateDto<Account> for NewAccount {
    fn into_values(self) -> ColumnValues {
        ColumnValues::new()
            .set("api_key_id", self.api_key_id)
            .set("account_name", self.request.account_name.trim().to_string())
            .set("currency", self.request.currency)
            .set("balance_cents", self.request.initial_balance_cents)
    }
}

/// Request body for `PATCH /api/v1/accounts/{id}`; absent fields are kept.
#[derive(Debug, Default, Deserialize)]
pub struct UpdateAccountRequest {
    pub account_name: Option<String>,
    pub currency: Option<String>,
}

impl UpdateAccountRequest {
    pub fn validate(&self) -> Result<(), AppError> {
        if self.account_name.is_none() && self.currency.is_none() {
            return Err(AppError::bad_request("ACCOUNTS__VALIDATE", "nothing to update"));
        }
        if let Some(name) = &self.account_name {
            validate_name(name)?;
        }
        if let Some(currency) = &self.currency {
            validate_currency(currency)?;
        }
        Ok(())
    }
}

impl UpdateDto<Account> for UpdateAccountRequest {
    fn into_changes(self) -> ColumnValues {
        ColumnValues::new()
            .set_opt("account_name", self.account_name.map(|name| name.trim().to_string()))
            .set_opt("currency", self.currency)
    }
}

fn validate_name(name: &str) -> Result<(), AppError> {
    if name.trim().is_empty() {
        return Err(AppError::bad_request("ACCOUNTS__VALIDATE", "account_name is required"));
    }
    Ok(())
}

fn validate_currency(currency: &str) -> Result<(), AppError> {
    if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_uppercase()) {
        return Err(AppError::bad_request(
            "ACCOUNTS__VALIDATE",
            format!("invalid currency `{currency}`"),
        ));
    }
    Ok(())
}

/// Response body for account endpoints.
///
/// # JSON Example
///
/// ```json
/// {
///   "id": "550e8400-e29b-41d4-a716-446655440000",
///   "account_name": "My Account",
///   "balance_cents": 100000,
///   "currency": "USD",
///   "created_at": "2025-12-20T10:00:00Z",
///   "updated_at": "2025-12-20T10:00:00Z"
/// }
/// ```
#[derive(Debug, Clone, Serialize)]
pub struct AccountResponse {
    pub id: Uuid,
    pub account_name: String,
    pub balance_cents: i64,
    pub currency: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FromModel<Account> for AccountResponse {
    fn from_model(account: Account) -> Self {
        Self {
            id: account.id,
            account_name: account.account_name,
            balance_cents: account.balance_cents,
            currency: account.currency,
            created_at: account.created_at,
            updated_at: account.updated_at,
        }
    }
}

//! Account management HTTP handlers.
//!
//! This module implements the account-related API endpoints:
//! - POST /api/v1/accounts - Create new account
//! - GET /api/v1/accounts - Page through the caller's accounts
//! - GET /api/v1/accounts/{id} - Get account by ID
//! - PATCH /api/v1/accounts/{id} - Rename or change currency
//! - DELETE /api/v1/accounts/{id} - Soft-delete an account
//!
//! Every query is scoped to the authenticated API key, so another business's
//! account answers 404 exactly like a missing one.

use axum::{Json, extract::State, http::StatusCode};
use axum_service_kit::{
    auth::AuthUser,
    error::AppError,
    middleware::extract::{JsonBody, PathParam, QueryParams},
    pagination::{Page, Pagination},
    repository::Clause,
};
use uuid::Uuid;

use super::AppState;
use crate::models::{
    account::{AccountResponse, CreateAccountRequest, KEYWORD_FIELDS, UpdateAccountRequest},
    api_key::Caller,
};

fn owned(caller: &Caller, account_id: Uuid) -> [Clause; 2] {
    [
        Clause::eq("accounts.id", account_id),
        Clause::eq("accounts.api_key_id", caller.api_key_id),
    ]
}

/// Create a new account.
///
/// # Request Body
///
/// ```json
/// {
///   "account_name": "My Account",
///   "currency": "USD"
/// }
/// ```
///
/// # Response
///
/// - **Success (201 Created)**: Returns the created account
/// - **Error (400)**: Validation failure
/// - **Error (401)**: Invalid API key
pub async fn create_account(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser<Caller>,
    JsonBody(request): JsonBody<CreateAccountRequest>,
) -> Result<(StatusCode, Json<AccountResponse>), AppError> {
    request.validate()?;

    let account = state
        .accounts
        .create(request.owned_by(caller.api_key_id))
        .await
        .map_err(|error| AppError::new("ACCOUNTS__CREATE", AppError::from(error)))?;

    Ok((StatusCode::CREATED, Json(account)))
}

/// Page through the caller's live accounts.
///
/// # Query Parameters
///
/// `page`, `limit`, `sortBy`, `sortOrder` and `keyword` (matched against
/// name and currency). Newest first unless a sort is given.
///
/// # Response (200 OK)
///
/// ```json
/// { "page": 1, "limit": 10, "totalData": 1, "totalPages": 1, "rows": [] }
/// ```
pub async fn list_accounts(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser<Caller>,
    QueryParams(mut pagination): QueryParams<Pagination>,
) -> Result<Json<Page<AccountResponse>>, AppError> {
    if pagination.sort_by.trim().is_empty() && pagination.sort_order.trim().is_empty() {
        pagination.sort_by = "accounts.created_at".to_string();
        pagination.sort_order = "DESC".to_string();
    }

    let mut predicate = vec![Clause::eq("accounts.api_key_id", caller.api_key_id)];
    if let Some(keyword) = pagination.keyword().and_then(|kw| Clause::keyword(KEYWORD_FIELDS, kw)) {
        predicate.push(keyword);
    }

    let rows = state
        .accounts
        .find_page(&mut pagination, &predicate, &[])
        .await
        .map_err(|error| AppError::new("ACCOUNTS__LIST", AppError::from(error)))?;

    Ok(Json(Page::new(rows, pagination)))
}

/// Get a specific account by ID.
///
/// # Response
///
/// - **Success (200 OK)**: Returns account details
/// - **Error (404)**: Account not found, deleted or owned by another business
pub async fn get_account(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser<Caller>,
    PathParam(account_id): PathParam<Uuid>,
) -> Result<Json<AccountResponse>, AppError> {
    let account = state
        .accounts
        .find_one(&owned(&caller, account_id))
        .await
        .map_err(|error| AppError::new("ACCOUNTS__GET", AppError::from(error)))?;

    Ok(Json(account))
}

/// Update name and/or currency of an account.
///
/// # Response
///
/// - **Success (200 OK)**: Returns the updated account
/// - **Error (400)**: Nothing to update or invalid values
/// - **Error (404)**: No such live account for this business
pub async fn update_account(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser<Caller>,
    PathParam(account_id): PathParam<Uuid>,
    JsonBody(request): JsonBody<UpdateAccountRequest>,
) -> Result<Json<AccountResponse>, AppError> {
    request.validate()?;

    let updated = state
        .accounts
        .update(request, &owned(&caller, account_id))
        .await
        .map_err(|error| AppError::new("ACCOUNTS__UPDATE", AppError::from(error)))?;

    updated
        .into_iter()
        .next()
        .map(Json)
        .ok_or_else(|| AppError::not_found("ACCOUNTS__UPDATE", "Record Not Found"))
}

/// Soft-delete an account.
///
/// # Response
///
/// - **Success (204 No Content)**
/// - **Error (404)**: No such live account for this business
pub async fn delete_account(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser<Caller>,
    PathParam(account_id): PathParam<Uuid>,
) -> Result<StatusCode, AppError> {
    let deleted = state
        .accounts
        .soft_delete(&owned(&caller, account_id))
        .await
        .map_err(|error| AppError::new("ACCOUNTS__DELETE", AppError::from(error)))?;

    if deleted == 0 {
        return Err(AppError::not_found("ACCOUNTS__DELETE", "Record Not Found"));
    }
    Ok(StatusCode::NO_CONTENT)
}

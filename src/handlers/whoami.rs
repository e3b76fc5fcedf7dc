//! `GET /api/v1/whoami`

use axum::Json;
use axum_service_kit::{auth::AuthUser, middleware::request_log::RequestContext};
use serde::Serialize;

use crate::models::api_key::Caller;

#[derive(Debug, Serialize)]
pub struct WhoAmIResponse {
    #[serde(flatten)]
    pub caller: Caller,
    pub request_id: String,
}

/// The business owning the API key, plus the id of this request.
pub async fn whoami(
    AuthUser(caller): AuthUser<Caller>,
    context: RequestContext,
) -> Json<WhoAmIResponse> {
    context
        .span
        .in_scope(|| tracing::debug!(business = %caller.business_name, "whoami"));

    Json(WhoAmIResponse {
        caller,
        request_id: context.request_id,
    })
}

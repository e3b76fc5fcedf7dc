//! The full middleware chain: request logging, panic recovery, auth guard
//! and error rendering, in the order a service wires them.

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    Json, Router,
    body::Body,
    http::{Request, StatusCode, header},
    response::Response,
    routing::{get, post},
};
use axum_service_kit::{
    auth::{AuthManager, AuthUser, BearerTokenConfig, ResolveError, TokenResolver},
    error::AppError,
    middleware::{
        extract::JsonBody,
        request_log::{self, REQUEST_ID_HEADER, RequestContext, RequestLogConfig},
    },
};
use http_body_util::BodyExt;
use rstest::{fixture, rstest};
use serde::Deserialize;
use serde_json::{Value, json};
use tower::ServiceExt;

// =============================================================================
// Test App
// =============================================================================

#[derive(Debug, Clone)]
struct Member {
    name: String,
}

struct FixedResolver;

#[async_trait]
impl TokenResolver for FixedResolver {
    type User = Member;

    async fn resolve(&self, token: &str) -> Result<Option<Member>, ResolveError> {
        match token {
            "valid" => Ok(Some(Member {
                name: "acme".to_string(),
            })),
            "broken" => Err(ResolveError::internal("token store unreachable")),
            _ => Ok(None),
        }
    }
}

#[derive(Deserialize)]
struct Greeting {
    text: String,
}

async fn me(AuthUser(member): AuthUser<Member>, context: RequestContext) -> Json<Value> {
    Json(json!({ "name": member.name, "requestId": context.request_id }))
}

async fn greet(AuthUser(member): AuthUser<Member>, JsonBody(greeting): JsonBody<Greeting>) -> String {
    format!("{} says {}", member.name, greeting.text)
}

async fn explode(AuthUser(_member): AuthUser<Member>) -> &'static str {
    panic!("database handle poisoned")
}

async fn forbidden() -> Result<String, AppError> {
    Err(AppError::forbidden("ADMIN__ONLY", "admins only"))
}

#[fixture]
fn app() -> Router {
    let auth = AuthManager::new(FixedResolver, BearerTokenConfig::default());
    let protected = auth.protect(
        Router::new()
            .route("/me", get(me))
            .route("/greet", post(greet))
            .route("/explode", get(explode)),
    );

    let router = Router::new()
        .route("/admin", get(forbidden))
        .merge(protected);

    request_log::instrument(
        router,
        RequestLogConfig::default().with_fatal_error_message("Something went wrong"),
    )
}

fn authorized(method: &str, uri: &str, body: Body) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, "Bearer valid")
        .header(header::CONTENT_TYPE, "application/json")
        .body(body)
        .unwrap()
}

async fn json_body(response: Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

// =============================================================================
// Test Module: Authentication
// =============================================================================

mod authentication {
    use super::*;

    #[rstest]
    #[tokio::test]
    async fn authenticated_request_sees_user_and_request_id(app: Router) {
        let mut request = authorized("GET", "/me", Body::empty());
        request
            .headers_mut()
            .insert(REQUEST_ID_HEADER, "trace-1".parse().unwrap());

        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[REQUEST_ID_HEADER], "trace-1");
        assert_eq!(
            json_body(response).await,
            json!({ "name": "acme", "requestId": "trace-1" })
        );
    }

    #[rstest]
    #[tokio::test]
    async fn missing_token_is_401_with_request_id(app: Router) {
        let request = Request::builder().uri("/me").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().contains_key(REQUEST_ID_HEADER));
        assert_eq!(
            json_body(response).await,
            json!({ "message": "Unauthorized", "code": 401, "statusCode": "AUTH_GUARD__TOKEN_EMPTY" })
        );
    }

    #[rstest]
    #[tokio::test]
    async fn unknown_token_is_401(app: Router) {
        let request = Request::builder()
            .uri("/me?access_token=stranger")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(response).await["statusCode"], "AUTH_GUARD__USER_EMPTY");
    }

    #[rstest]
    #[tokio::test]
    async fn resolver_failure_hides_its_message(app: Router) {
        let request = Request::builder()
            .uri("/me")
            .header(header::AUTHORIZATION, "Bearer broken")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let error = response.extensions().get::<Arc<AppError>>().cloned().unwrap();
        assert_eq!(error.message(), "token store unreachable");

        let json = json_body(response).await;
        assert_eq!(json["message"], "Something went wrong");
        assert_eq!(json["statusCode"], "AUTH_GUARD__RESOLVE");
    }

    #[rstest]
    #[tokio::test]
    async fn public_routes_skip_the_guard(app: Router) {
        let request = Request::builder().uri("/admin").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(json_body(response).await["message"], "admins only");
    }
}

// =============================================================================
// Test Module: Request Handling
// =============================================================================

mod request_handling {
    use super::*;

    #[rstest]
    #[tokio::test]
    async fn json_body_reaches_handler(app: Router) {
        let body = Body::from(r#"{"text":"hello"}"#);
        let response = app.oneshot(authorized("POST", "/greet", body)).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"acme says hello");
    }

    #[rstest]
    #[tokio::test]
    async fn malformed_json_is_a_client_error(app: Router) {
        let response = app
            .oneshot(authorized("POST", "/greet", Body::from("{")))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["statusCode"], "REQUEST__JSON");
    }

    #[rstest]
    #[tokio::test]
    async fn panic_is_recovered_as_fatal_error(app: Router) {
        let response = app
            .oneshot(authorized("GET", "/explode", Body::empty()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(response.headers().contains_key(REQUEST_ID_HEADER));
        assert_eq!(
            json_body(response).await,
            json!({ "message": "Something went wrong", "code": 500, "statusCode": "PANIC" })
        );
    }

    #[rstest]
    #[tokio::test]
    async fn service_keeps_serving_after_a_panic(app: Router) {
        let first = app
            .clone()
            .oneshot(authorized("GET", "/explode", Body::empty()))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let second = app
            .oneshot(authorized("GET", "/me", Body::empty()))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::OK);
    }
}

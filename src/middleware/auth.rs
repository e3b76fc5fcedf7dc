//! Bearer token authentication middleware.
//!
//! The guard intercepts every protected request to:
//! 1. Find the bearer token (Authorization header, query parameter or form body)
//! 2. Resolve it to a user through a pluggable [`TokenResolver`]
//! 3. Inject the user into the request extensions
//! 4. Reject unauthenticated requests with HTTP 401
//!
//! ```ignore
//! let auth = AuthManager::new(ApiKeyResolver::new(pool.clone()), config.auth);
//! let protected = auth.protect(Router::new().route("/api/v1/whoami", get(whoami)));
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    Router,
    body::{Body, to_bytes},
    extract::{FromRequestParts, Request, State},
    http::{Extensions, HeaderMap, header, request::Parts},
    middleware::{self, Next},
    response::Response,
};
use serde::Deserialize;

use crate::error::{AppError, BoxError};

pub const DEFAULT_BODY_KEY: &str = "access_token";
pub const DEFAULT_HEADER_SCHEME: &str = "Bearer";
pub const DEFAULT_QUERY_KEY: &str = "access_token";
pub const DEFAULT_REQUEST_KEY: &str = "token";

/// Largest form body buffered while looking for a token.
const FORM_BODY_LIMIT: usize = 64 * 1024;

/// Where the guard looks for bearer tokens.
///
/// # Environment Variables
///
/// - `AUTH_BODY_KEY`: form field holding the token, defaults to `access_token`
/// - `AUTH_HEADER_SCHEME`: Authorization scheme, defaults to `Bearer`
/// - `AUTH_QUERY_KEY`: query parameter holding the token, defaults to `access_token`
/// - `AUTH_REQUEST_KEY`: name of the token in request logs, defaults to `token`
///
/// Empty values fall back to the defaults.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BearerTokenConfig {
    pub body_key: String,
    pub header_scheme: String,
    pub query_key: String,
    pub request_key: String,
}

impl Default for BearerTokenConfig {
    fn default() -> Self {
        Self {
            body_key: DEFAULT_BODY_KEY.to_string(),
            header_scheme: DEFAULT_HEADER_SCHEME.to_string(),
            query_key: DEFAULT_QUERY_KEY.to_string(),
            request_key: DEFAULT_REQUEST_KEY.to_string(),
        }
    }
}

impl BearerTokenConfig {
    /// Load from `AUTH_*` environment variables.
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::prefixed("AUTH_")
            .from_env::<Self>()
            .map(Self::with_defaults)
    }

    /// Replace empty values by the defaults.
    pub fn with_defaults(self) -> Self {
        fn or_default(value: String, default: &str) -> String {
            if value.trim().is_empty() {
                default.to_string()
            } else {
                value
            }
        }

        Self {
            body_key: or_default(self.body_key, DEFAULT_BODY_KEY),
            header_scheme: or_default(self.header_scheme, DEFAULT_HEADER_SCHEME),
            query_key: or_default(self.query_key, DEFAULT_QUERY_KEY),
            request_key: or_default(self.request_key, DEFAULT_REQUEST_KEY),
        }
    }
}

/// Failure reported by a [`TokenResolver`].
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    /// The token is unknown, expired or revoked.
    #[error("Unauthorized")]
    Unauthorized,

    /// The resolver itself failed.
    #[error(transparent)]
    Internal(BoxError),
}

impl ResolveError {
    pub fn internal(error: impl Into<BoxError>) -> Self {
        ResolveError::Internal(error.into())
    }
}

impl From<sqlx::Error> for ResolveError {
    fn from(error: sqlx::Error) -> Self {
        ResolveError::Internal(Box::new(error))
    }
}

impl From<AppError> for ResolveError {
    fn from(error: AppError) -> Self {
        ResolveError::Internal(Box::new(error))
    }
}

/// Turns a bearer token into a user.
///
/// `Ok(None)` means "no user for this token" and is rejected with 401, like
/// [`ResolveError::Unauthorized`].
#[async_trait]
pub trait TokenResolver: Send + Sync + 'static {
    type User: Clone + Send + Sync + 'static;

    async fn resolve(&self, token: &str) -> Result<Option<Self::User>, ResolveError>;
}

/// Authenticated user attached to the request by the guard.
///
/// Usable as an extractor in handlers behind [`AuthManager::protect`]; it
/// rejects with 401 when no user is attached.
#[derive(Debug, Clone)]
pub struct AuthUser<U>(pub U);

impl<S, U> FromRequestParts<S> for AuthUser<U>
where
    S: Send + Sync,
    U: Clone + Send + Sync + 'static,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        current_user::<U>(&parts.extensions)
            .cloned()
            .map(AuthUser)
            .ok_or_else(|| AppError::unauthorized("AUTH_GUARD__USER_EMPTY", "Unauthorized"))
    }
}

/// The raw token that authenticated the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerToken(pub String);

/// User attached by the guard, if any.
pub fn current_user<U: Send + Sync + 'static>(extensions: &Extensions) -> Option<&U> {
    extensions.get::<AuthUser<U>>().map(|user| &user.0)
}

#[derive(Debug, Clone, Copy)]
enum TokenSource {
    Header,
    Query,
    Body,
}

/// Bearer token guard for a group of routes.
pub struct AuthManager<R> {
    config: Arc<BearerTokenConfig>,
    resolver: Arc<R>,
}

impl<R> Clone for AuthManager<R> {
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            resolver: Arc::clone(&self.resolver),
        }
    }
}

impl<R: TokenResolver> AuthManager<R> {
    pub fn new(resolver: R, config: BearerTokenConfig) -> Self {
        Self {
            config: Arc::new(config.with_defaults()),
            resolver: Arc::new(resolver),
        }
    }

    pub fn config(&self) -> &BearerTokenConfig {
        &self.config
    }

    /// Put every route of `router` behind the guard.
    ///
    /// Applied as a route layer, so unmatched paths still answer 404.
    pub fn protect<S>(&self, router: Router<S>) -> Router<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        router.route_layer(middleware::from_fn_with_state(self.clone(), auth_guard::<R>))
    }

    /// Find and resolve the token of `request`, attaching the user.
    ///
    /// # Errors
    ///
    /// - 401 when there is no token, the resolver rejects it or finds no user
    /// - the resolver's own failure otherwise (500 unless it carries a status)
    pub async fn authenticate(&self, request: Request) -> Result<Request, AppError> {
        let (mut request, found) = self.find_token(request).await?;
        let Some((token, source)) = found else {
            return Err(AppError::unauthorized("AUTH_GUARD__TOKEN_EMPTY", "Unauthorized"));
        };

        let user = match self.resolver.resolve(&token).await {
            Ok(Some(user)) => user,
            Ok(None) => {
                return Err(AppError::unauthorized("AUTH_GUARD__USER_EMPTY", "Unauthorized"));
            }
            Err(ResolveError::Unauthorized) => {
                return Err(AppError::unauthorized(
                    "AUTH_GUARD__UNAUTHORIZED_BY_RESOLVER",
                    ResolveError::Unauthorized,
                ));
            }
            Err(ResolveError::Internal(error)) => {
                return Err(AppError::new("AUTH_GUARD__RESOLVE", error));
            }
        };

        tracing::debug!(request_key = %self.config.request_key, ?source, "bearer token accepted");

        let extensions = request.extensions_mut();
        extensions.insert(AuthUser(user));
        extensions.insert(BearerToken(token));
        Ok(request)
    }

    async fn find_token(
        &self,
        request: Request,
    ) -> Result<(Request, Option<(String, TokenSource)>), AppError> {
        if let Some(value) = header_value(request.headers()) {
            let token = scheme_token(value, &self.config.header_scheme);
            return Ok((request, token.map(|token| (token, TokenSource::Header))));
        }

        if let Some(token) = request
            .uri()
            .query()
            .and_then(|query| form_value(query.as_bytes(), &self.config.query_key))
        {
            return Ok((request, Some((token, TokenSource::Query))));
        }

        if !is_form(request.headers()) {
            return Ok((request, None));
        }

        let (parts, body) = request.into_parts();
        let bytes = to_bytes(body, FORM_BODY_LIMIT)
            .await
            .map_err(|error| AppError::bad_request("AUTH_GUARD__BODY", error))?;
        let token = form_value(&bytes, &self.config.body_key);
        let request = Request::from_parts(parts, Body::from(bytes));

        Ok((request, token.map(|token| (token, TokenSource::Body))))
    }
}

/// Middleware function installed by [`AuthManager::protect`].
pub async fn auth_guard<R: TokenResolver>(
    State(manager): State<AuthManager<R>>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let request = manager.authenticate(request).await?;
    Ok(next.run(request).await)
}

/// Non-empty Authorization header, as text.
///
/// `Some("")` when the header is present but not visible ASCII, so the
/// caller still treats it as the token source.
fn header_value(headers: &HeaderMap) -> Option<&str> {
    let value = headers
        .get(header::AUTHORIZATION)
        .filter(|value| !value.is_empty())?;
    Some(value.to_str().unwrap_or_default())
}

/// `"<scheme> <token>"` → token.
fn scheme_token(value: &str, scheme: &str) -> Option<String> {
    let (found, token) = value.split_once(' ')?;
    let token = token.trim();
    (found == scheme && !token.is_empty()).then(|| token.to_string())
}

fn form_value(encoded: &[u8], key: &str) -> Option<String> {
    url::form_urlencoded::parse(encoded)
        .find(|(name, value)| name == key && !value.is_empty())
        .map(|(_, value)| value.into_owned())
}

fn is_form(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("application/x-www-form-urlencoded"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        http::StatusCode,
        routing::{get, post},
    };
    use http_body_util::BodyExt;
    use rstest::rstest;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::ServiceExt;

    #[derive(Debug, Clone, PartialEq)]
    struct TestUser {
        name: String,
    }

    #[derive(Default)]
    struct StaticResolver {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl TokenResolver for StaticResolver {
        type User = TestUser;

        async fn resolve(&self, token: &str) -> Result<Option<TestUser>, ResolveError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match token {
                "abc123" => Ok(Some(TestUser {
                    name: "acme".to_string(),
                })),
                "ghost" => Ok(None),
                "revoked" => Err(ResolveError::Unauthorized),
                "gone" => Err(AppError::not_found("LOOKUP", "key not found").into()),
                _ => Err(ResolveError::internal("lookup failed")),
            }
        }
    }

    async fn whoami(AuthUser(user): AuthUser<TestUser>) -> String {
        user.name
    }

    async fn echo(AuthUser(user): AuthUser<TestUser>, body: String) -> String {
        format!("{}:{body}", user.name)
    }

    fn app(config: BearerTokenConfig) -> (Router, Arc<AtomicUsize>) {
        let resolver = StaticResolver::default();
        let calls = Arc::clone(&resolver.calls);
        let auth = AuthManager::new(resolver, config);
        let router = auth.protect(
            Router::new()
                .route("/me", get(whoami))
                .route("/echo", post(echo)),
        );
        (router, calls)
    }

    async fn send(router: Router, request: Request) -> (StatusCode, String) {
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    fn get_with_header(uri: &str, authorization: &str) -> Request {
        Request::builder()
            .uri(uri)
            .header(header::AUTHORIZATION, authorization)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn bearer_header_attaches_user() {
        let (router, calls) = app(BearerTokenConfig::default());
        let (status, body) = send(router, get_with_header("/me", "Bearer abc123")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "acme");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_token_never_reaches_resolver() {
        let (router, calls) = app(BearerTokenConfig::default());
        let request = Request::builder().uri("/me").body(Body::empty()).unwrap();
        let (status, body) = send(router, request).await;

        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["statusCode"], "AUTH_GUARD__TOKEN_EMPTY");
        assert_eq!(json["code"], 401);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[rstest]
    #[case::wrong_scheme("Basic abc123")]
    #[case::no_separator("Bearerabc123")]
    #[case::empty_token("Bearer ")]
    #[tokio::test]
    async fn malformed_header_is_rejected(#[case] authorization: &str) {
        let (router, calls) = app(BearerTokenConfig::default());
        let (status, _) = send(router, get_with_header("/me", authorization)).await;

        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn query_token_is_used_without_header() {
        let (router, _) = app(BearerTokenConfig::default());
        let request = Request::builder()
            .uri("/me?access_token=abc123")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(router, request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "acme");
    }

    #[tokio::test]
    async fn header_takes_precedence_over_query() {
        let (router, _) = app(BearerTokenConfig::default());
        let request = get_with_header("/me?access_token=abc123", "Basic xyz");
        let (status, _) = send(router, request).await;

        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn unreadable_header_still_blocks_query() {
        let (router, calls) = app(BearerTokenConfig::default());
        let request = Request::builder()
            .uri("/me?access_token=abc123")
            .header(
                header::AUTHORIZATION,
                axum::http::HeaderValue::from_bytes(b"Bearer caf\xe9").unwrap(),
            )
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(router, request).await;

        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["statusCode"], "AUTH_GUARD__TOKEN_EMPTY");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn custom_query_key() {
        let config = BearerTokenConfig {
            query_key: "key".to_string(),
            ..BearerTokenConfig::default()
        };
        let (router, _) = app(config);
        let request = Request::builder()
            .uri("/me?key=abc123")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(router, request).await;

        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn form_body_token_is_found_and_body_restored() {
        let (router, _) = app(BearerTokenConfig::default());
        let request = Request::builder()
            .method("POST")
            .uri("/echo")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from("access_token=abc123&note=hi"))
            .unwrap();
        let (status, body) = send(router, request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "acme:access_token=abc123&note=hi");
    }

    #[rstest]
    #[case::no_user("ghost", StatusCode::UNAUTHORIZED, "AUTH_GUARD__USER_EMPTY")]
    #[case::rejected("revoked", StatusCode::UNAUTHORIZED, "AUTH_GUARD__UNAUTHORIZED_BY_RESOLVER")]
    #[case::inner_status("gone", StatusCode::NOT_FOUND, "LOOKUP -> AUTH_GUARD__RESOLVE")]
    #[case::failure("boom", StatusCode::INTERNAL_SERVER_ERROR, "AUTH_GUARD__RESOLVE")]
    #[tokio::test]
    async fn resolver_outcomes(#[case] token: &str, #[case] expected: StatusCode, #[case] part: &str) {
        let (router, calls) = app(BearerTokenConfig::default());
        let (status, body) = send(router, get_with_header("/me", &format!("Bearer {token}"))).await;

        assert_eq!(status, expected);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["statusCode"], part);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn extractor_rejects_without_guard() {
        let router = Router::new().route("/me", get(whoami));
        let (status, _) = send(router, get_with_header("/me", "Bearer abc123")).await;

        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn empty_config_values_fall_back_to_defaults() {
        let config = BearerTokenConfig {
            body_key: String::new(),
            header_scheme: " ".to_string(),
            query_key: "key".to_string(),
            request_key: String::new(),
        }
        .with_defaults();

        assert_eq!(config.body_key, "access_token");
        assert_eq!(config.header_scheme, "Bearer");
        assert_eq!(config.query_key, "key");
        assert_eq!(config.request_key, "token");
    }

    #[test]
    fn current_user_reads_extensions() {
        let mut extensions = Extensions::new();
        assert!(current_user::<TestUser>(&extensions).is_none());

        extensions.insert(AuthUser(TestUser {
            name: "acme".to_string(),
        }));
        assert_eq!(current_user::<TestUser>(&extensions).map(|u| u.name.as_str()), Some("acme"));
    }
}

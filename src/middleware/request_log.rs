//! Request-scoped logging and panic recovery.
//!
//! For every request the middleware:
//! 1. Takes the request id from the inbound header or generates a UUID v4
//! 2. Opens a tracing span carrying that id and stores a [`RequestContext`]
//! 3. Runs the handler chain inside the span; panics are caught below it
//! 4. Logs one completion event: `info` on success, `error` with the error
//!    details when the response carries an [`AppError`]
//! 5. Echoes the request id on the response

use std::{
    any::Any,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use axum::{
    Router,
    extract::{ConnectInfo, FromRequestParts, Request, State},
    http::{HeaderName, HeaderValue, request::Parts},
    middleware::{self, Next},
    response::{IntoResponse, Response},
};
use tower::ServiceBuilder;
use tower_http::catch_panic::CatchPanicLayer;
use tracing::Instrument;
use uuid::Uuid;

use super::panic_capture;
use crate::error::{AppError, DEFAULT_FATAL_MESSAGE};

/// Header carrying the request id unless configured otherwise.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Debug, Clone)]
pub struct RequestLogConfig {
    /// Message shown to clients in place of fatal errors' own messages.
    pub fatal_error_message: String,
    pub request_id_header: HeaderName,
}

impl Default for RequestLogConfig {
    fn default() -> Self {
        Self {
            fatal_error_message: DEFAULT_FATAL_MESSAGE.to_string(),
            request_id_header: HeaderName::from_static(REQUEST_ID_HEADER),
        }
    }
}

impl RequestLogConfig {
    pub fn with_fatal_error_message(mut self, message: impl Into<String>) -> Self {
        self.fatal_error_message = message.into();
        self
    }
}

/// Per-request context stored in the request extensions.
///
/// Also an extractor. Log through `span` (or inside it) to tie events to the
/// request id:
///
/// ```ignore
/// async fn handler(context: RequestContext) {
///     context.span.in_scope(|| tracing::info!("loading"));
/// }
/// ```
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub started_at: Instant,
    pub span: tracing::Span,
}

impl RequestContext {
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

impl<S: Send + Sync> FromRequestParts<S> for RequestContext {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<RequestContext>()
            .cloned()
            .ok_or_else(|| AppError::internal("REQUEST_CONTEXT", "request logging is not installed"))
    }
}

/// Wrap `router` with request logging and panic recovery.
///
/// Installs the panic capture hook on first use.
pub fn instrument<S>(router: Router<S>, config: RequestLogConfig) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    panic_capture::install();

    router.layer(
        ServiceBuilder::new()
            .layer(middleware::from_fn_with_state(Arc::new(config), request_log))
            .layer(CatchPanicLayer::custom(handle_panic)),
    )
}

/// Logging middleware function installed by [`instrument`].
pub async fn request_log(
    State(config): State<Arc<RequestLogConfig>>,
    mut request: Request,
    next: Next,
) -> Response {
    let request_id = request
        .headers()
        .get(&config.request_id_header)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "-".to_string());

    let span = tracing::info_span!("request", request_id = %request_id);
    let context = RequestContext {
        request_id: request_id.clone(),
        started_at: Instant::now(),
        span: span.clone(),
    };
    request.extensions_mut().insert(context.clone());

    let mut response = next.run(request).instrument(span.clone()).await;

    let status = response.status().as_u16();
    let latency_ms = context.elapsed().as_millis() as u64;

    match response.extensions().get::<Arc<AppError>>().cloned() {
        Some(error) => {
            span.in_scope(|| {
                tracing::error!(
                    path = %path,
                    method = %method,
                    ip = %ip,
                    status,
                    latency_ms,
                    error_message = error.message(),
                    part = error.part(),
                    callers = ?error.callers(),
                    stack = error.stack().unwrap_or_default(),
                    "request failed"
                )
            });

            if error.is_fatal() && config.fatal_error_message != DEFAULT_FATAL_MESSAGE {
                response = error.to_response(&config.fatal_error_message);
                response.extensions_mut().insert(error);
            }
        }
        None => span.in_scope(|| {
            tracing::info!(path = %path, method = %method, ip = %ip, status, latency_ms, "request completed")
        }),
    }

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response
            .headers_mut()
            .insert(config.request_id_header.clone(), value);
    }
    response
}

fn handle_panic(payload: Box<dyn Any + Send + 'static>) -> Response {
    AppError::from_panic(payload, panic_capture::take()).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::StatusCode, routing::get};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    async fn request_id(context: RequestContext) -> String {
        context.request_id
    }

    async fn fails() -> Result<String, AppError> {
        Err(AppError::new("DB", "connection refused"))
    }

    async fn missing() -> Result<String, AppError> {
        Err(AppError::not_found("ACCOUNTS__GET", "Record Not Found"))
    }

    async fn panics() -> &'static str {
        panic!("handler exploded")
    }

    fn app(config: RequestLogConfig) -> Router {
        let router = Router::new()
            .route("/id", get(request_id))
            .route("/fails", get(fails))
            .route("/missing", get(missing))
            .route("/panics", get(panics));
        instrument(router, config)
    }

    fn get_request(uri: &str) -> Request {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn inbound_request_id_is_kept_and_echoed() {
        let request = Request::builder()
            .uri("/id")
            .header(REQUEST_ID_HEADER, "req-42")
            .body(Body::empty())
            .unwrap();
        let response = app(RequestLogConfig::default()).oneshot(request).await.unwrap();

        assert_eq!(response.headers()[REQUEST_ID_HEADER], "req-42");
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"req-42");
    }

    #[tokio::test]
    async fn request_id_is_generated_when_absent() {
        let response = app(RequestLogConfig::default())
            .oneshot(get_request("/id"))
            .await
            .unwrap();

        let echoed = response.headers()[REQUEST_ID_HEADER].to_str().unwrap().to_string();
        assert!(Uuid::parse_str(&echoed).is_ok());

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(String::from_utf8(bytes.to_vec()).unwrap(), echoed);
    }

    #[tokio::test]
    async fn fatal_errors_use_configured_message() {
        let config = RequestLogConfig::default().with_fatal_error_message("Try again later");
        let response = app(config).oneshot(get_request("/fails")).await.unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(response.headers().contains_key(REQUEST_ID_HEADER));

        let json = body_json(response).await;
        assert_eq!(json["message"], "Try again later");
        assert_eq!(json["statusCode"], "DB");
    }

    #[tokio::test]
    async fn non_fatal_errors_keep_their_message() {
        let config = RequestLogConfig::default().with_fatal_error_message("Try again later");
        let response = app(config).oneshot(get_request("/missing")).await.unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["message"], "Record Not Found");
    }

    #[tokio::test]
    async fn panics_become_fatal_error_responses() {
        let response = app(RequestLogConfig::default())
            .oneshot(get_request("/panics"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let error = response.extensions().get::<Arc<AppError>>().cloned().unwrap();
        assert_eq!(error.message(), "handler exploded");
        assert!(error.origin().unwrap().contains("request_log.rs"));

        let json = body_json(response).await;
        assert_eq!(json["message"], DEFAULT_FATAL_MESSAGE);
        assert_eq!(json["statusCode"], "PANIC");
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn failure_event_is_one_json_object_per_line() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = crate::logging::subscriber(
            crate::config::LogFormat::Json,
            tracing_subscriber::EnvFilter::new("info"),
            move || writer.clone(),
        );
        let _guard = tracing::subscriber::set_default(subscriber);

        let response = app(RequestLogConfig::default())
            .oneshot(get_request("/missing"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let output = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        let line = output
            .lines()
            .find(|line| line.contains("request failed"))
            .unwrap();
        assert_eq!(line.matches("\"message\":").count(), 1);

        let event: serde_json::Value = serde_json::from_str(line).unwrap();
        assert_eq!(event["level"], "ERROR");
        assert_eq!(event["message"], "request failed");
        assert_eq!(event["error_message"], "Record Not Found");
        assert_eq!(event["part"], "ACCOUNTS__GET");
        assert_eq!(event["status"], 404);
    }

    #[tokio::test]
    async fn context_extractor_needs_the_middleware() {
        let router = Router::new().route("/id", get(request_id));
        let response = router.oneshot(get_request("/id")).await.unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}

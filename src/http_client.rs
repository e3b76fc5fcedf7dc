//! Small outbound HTTP client for JSON and form APIs.
//!
//! ```ignore
//! let client = HttpClient::with_timeout(Duration::from_secs(5))?;
//! let profile: Profile = client
//!     .get("https://auth.example.com/me")
//!     .bearer_auth(&token)
//!     .error_prefix("AUTH_SERVER")
//!     .send()
//!     .await?;
//! ```

use std::time::Duration;

use reqwest::{
    Method, StatusCode,
    header::{HeaderMap, HeaderName, HeaderValue},
};
use serde::{Serialize, de::DeserializeOwned};

pub const JSON_CONTENT_TYPE: &str = "application/json";
pub const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// Errors returned by [`HttpRequest::send`].
#[derive(Debug, thiserror::Error)]
pub enum HttpClientError {
    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("invalid header: {0}")]
    InvalidHeader(String),

    /// Connection, timeout or body transfer failure.
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// The server answered with a status of 300 or above.
    #[error("{body}")]
    Status {
        status: StatusCode,
        body: String,
        /// `body` parsed as JSON, when it is JSON.
        detail: Option<serde_json::Value>,
    },

    #[error("invalid response body: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("payload could not be serialized: {0}")]
    Encode(#[source] serde_json::Error),
}

/// A header to send, as plain strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpHeader {
    pub key: String,
    pub value: String,
}

impl HttpHeader {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// `Authorization: Bearer <token>`
pub fn authorization_header(token: &str) -> HttpHeader {
    HttpHeader::new("Authorization", format!("Bearer {token}"))
}

/// `Content-Type: application/json`
pub fn json_content_type_header() -> HttpHeader {
    HttpHeader::new("Content-Type", JSON_CONTENT_TYPE)
}

/// `Content-Type: application/x-www-form-urlencoded`
pub fn form_content_type_header() -> HttpHeader {
    HttpHeader::new("Content-Type", FORM_CONTENT_TYPE)
}

/// Pooled client; clones share connections.
#[derive(Debug, Clone, Default)]
pub struct HttpClient {
    inner: reqwest::Client,
}

impl HttpClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Client whose requests fail after `timeout`.
    pub fn with_timeout(timeout: Duration) -> Result<Self, HttpClientError> {
        let inner = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { inner })
    }

    pub fn request(&self, method: Method, url: &str) -> HttpRequest {
        HttpRequest {
            client: self.inner.clone(),
            method,
            url: url.to_string(),
            headers: Vec::new(),
            payload: None,
            form: None,
            error_prefix: String::new(),
            log_request: false,
            log_response: false,
        }
    }

    pub fn get(&self, url: &str) -> HttpRequest {
        self.request(Method::GET, url)
    }

    pub fn post(&self, url: &str) -> HttpRequest {
        self.request(Method::POST, url)
    }
}

/// Raw response of a successful request.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub body: Vec<u8>,
}

/// Request builder.
///
/// Without explicit headers the content type defaults to JSON, or to form
/// encoding when form arguments are set. Once any header is set, only the
/// given headers are sent.
#[derive(Debug)]
pub struct HttpRequest {
    client: reqwest::Client,
    method: Method,
    url: String,
    headers: Vec<HttpHeader>,
    payload: Option<Result<Vec<u8>, serde_json::Error>>,
    form: Option<Vec<(String, String)>>,
    error_prefix: String,
    log_request: bool,
    log_response: bool,
}

impl HttpRequest {
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push(HttpHeader::new(key, value));
        self
    }

    pub fn headers(mut self, headers: impl IntoIterator<Item = HttpHeader>) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn bearer_auth(self, token: &str) -> Self {
        self.headers([authorization_header(token)])
    }

    /// Serialize `value` as the JSON payload.
    pub fn json<T: Serialize + ?Sized>(mut self, value: &T) -> Self {
        self.payload = Some(serde_json::to_vec(value));
        self
    }

    /// Raw payload.
    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.payload = Some(Ok(body.into()));
        self
    }

    /// Form arguments, sent url-encoded as the payload.
    pub fn form<K, V>(mut self, args: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        let args = args
            .into_iter()
            .map(|(key, value)| (key.into(), value.into()));
        self.form.get_or_insert_with(Vec::new).extend(args);
        self
    }

    /// Prefix of the error log line for failed requests.
    pub fn error_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.error_prefix = prefix.into();
        self
    }

    pub fn log_request(mut self, enabled: bool) -> Self {
        self.log_request = enabled;
        self
    }

    pub fn log_response(mut self, enabled: bool) -> Self {
        self.log_response = enabled;
        self
    }

    /// Send and decode the JSON response.
    ///
    /// An empty body decodes as JSON `null`.
    ///
    /// # Errors
    ///
    /// - `InvalidUrl` / `InvalidHeader` before anything is sent
    /// - `Transport` when the request does not complete
    /// - `Status` for responses with status 300 or above
    /// - `Decode` when the body is not the expected JSON
    pub async fn send<T: DeserializeOwned>(self) -> Result<T, HttpClientError> {
        let response = self.send_raw().await?;
        let body = if response.body.is_empty() {
            b"null".as_slice()
        } else {
            response.body.as_slice()
        };
        Ok(serde_json::from_slice(body)?)
    }

    /// Send and return the raw response.
    pub async fn send_raw(mut self) -> Result<HttpResponse, HttpClientError> {
        let url = url::Url::parse(&self.url)?;
        let payload = self.take_payload()?;
        let headers = self.header_map()?;

        if self.log_request {
            tracing::info!(
                method = %self.method,
                url = %url,
                payload = %String::from_utf8_lossy(payload.as_deref().unwrap_or_default()),
                "outgoing request"
            );
        }

        let mut request = self.client.request(self.method.clone(), url).headers(headers);
        if let Some(payload) = &payload {
            request = request.body(payload.clone());
        }

        let response = request.send().await?;
        let status = response.status();
        let body = response.bytes().await?.to_vec();

        if status.as_u16() >= 300 {
            let text = String::from_utf8_lossy(&body).into_owned();
            tracing::error!(
                prefix = %self.error_prefix,
                method = %self.method,
                url = %self.url,
                status = status.as_u16(),
                payload = %String::from_utf8_lossy(payload.as_deref().unwrap_or_default()),
                response = %text,
                "http error response"
            );
            return Err(HttpClientError::Status {
                status,
                detail: serde_json::from_slice(&body).ok(),
                body: text,
            });
        }

        if self.log_response {
            tracing::info!(
                status = status.as_u16(),
                response = %String::from_utf8_lossy(&body),
                "incoming response"
            );
        }

        Ok(HttpResponse { status, body })
    }

    fn take_payload(&mut self) -> Result<Option<Vec<u8>>, HttpClientError> {
        if let Some(form) = &self.form {
            let encoded = url::form_urlencoded::Serializer::new(String::new())
                .extend_pairs(form)
                .finish();
            return Ok(Some(encoded.into_bytes()));
        }

        self.payload
            .take()
            .transpose()
            .map_err(HttpClientError::Encode)
    }

    fn header_map(&self) -> Result<HeaderMap, HttpClientError> {
        let defaults;
        let headers = if self.headers.is_empty() {
            defaults = [if self.form.is_some() {
                form_content_type_header()
            } else {
                json_content_type_header()
            }];
            defaults.as_slice()
        } else {
            self.headers.as_slice()
        };

        let mut map = HeaderMap::new();
        for HttpHeader { key, value } in headers {
            let name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|_| HttpClientError::InvalidHeader(key.clone()))?;
            let value = HeaderValue::from_str(value)
                .map_err(|_| HttpClientError::InvalidHeader(key.clone()))?;
            map.insert(name, value);
        }
        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use axum::{
        Json, Router,
        http::{HeaderMap as AxumHeaders, StatusCode as AxumStatus},
        routing::{get, post},
    };
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Profile {
        name: String,
    }

    async fn echo(headers: AxumHeaders, body: String) -> String {
        let content_type = headers
            .get("content-type")
            .and_then(|value| value.to_str().ok())
            .unwrap_or("-")
            .to_string();
        let authorization = headers
            .get("authorization")
            .and_then(|value| value.to_str().ok())
            .unwrap_or("-")
            .to_string();
        format!("{content_type}|{authorization}|{body}")
    }

    async fn spawn_server() -> String {
        let router = Router::new()
            .route("/profile", get(|| async { Json(json!({ "name": "acme" })) }))
            .route("/echo", post(echo))
            .route(
                "/fail",
                get(|| async { (AxumStatus::UNPROCESSABLE_ENTITY, Json(json!({ "error": "nope" }))) }),
            )
            .route("/text", get(|| async { "not json" }))
            .route("/empty", post(|| async { AxumStatus::NO_CONTENT }));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn decodes_json_response() {
        let base = spawn_server().await;
        let profile: Profile = HttpClient::new()
            .get(&format!("{base}/profile"))
            .log_request(true)
            .log_response(true)
            .send()
            .await
            .unwrap();

        assert_eq!(profile.name, "acme");
    }

    #[tokio::test]
    async fn content_type_defaults_to_json() {
        let base = spawn_server().await;
        let response = HttpClient::new()
            .post(&format!("{base}/echo"))
            .json(&json!({ "a": 1 }))
            .send_raw()
            .await
            .unwrap();

        assert_eq!(
            String::from_utf8(response.body).unwrap(),
            r#"application/json|-|{"a":1}"#
        );
    }

    #[tokio::test]
    async fn explicit_headers_replace_the_default() {
        let base = spawn_server().await;
        let response = HttpClient::new()
            .post(&format!("{base}/echo"))
            .bearer_auth("abc123")
            .body("raw")
            .send_raw()
            .await
            .unwrap();

        assert_eq!(String::from_utf8(response.body).unwrap(), "-|Bearer abc123|raw");
    }

    #[tokio::test]
    async fn form_arguments_are_url_encoded() {
        let base = spawn_server().await;
        let response = HttpClient::new()
            .post(&format!("{base}/echo"))
            .form([("grant_type", "client_credentials"), ("scope", "read write")])
            .send_raw()
            .await
            .unwrap();

        assert_eq!(
            String::from_utf8(response.body).unwrap(),
            "application/x-www-form-urlencoded|-|grant_type=client_credentials&scope=read+write"
        );
    }

    #[tokio::test]
    async fn error_status_carries_body_and_detail() {
        let base = spawn_server().await;
        let error = HttpClient::new()
            .get(&format!("{base}/fail"))
            .error_prefix("PROFILE")
            .send::<Profile>()
            .await
            .unwrap_err();

        match &error {
            HttpClientError::Status { status, body, detail } => {
                assert_eq!(status.as_u16(), 422);
                assert_eq!(body, r#"{"error":"nope"}"#);
                assert_eq!(detail.as_ref().unwrap()["error"], "nope");
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let error = AppError::from(error);
        assert_eq!(error.status().as_u16(), 502);
        assert_eq!(error.part(), "HTTP_CLIENT");
    }

    #[tokio::test]
    async fn non_json_body_is_a_decode_error() {
        let base = spawn_server().await;
        let error = HttpClient::new()
            .get(&format!("{base}/text"))
            .send::<Profile>()
            .await
            .unwrap_err();

        assert!(matches!(error, HttpClientError::Decode(_)));
    }

    #[tokio::test]
    async fn empty_body_decodes_as_null() {
        let base = spawn_server().await;
        let value: Option<Profile> = HttpClient::new()
            .post(&format!("{base}/empty"))
            .send()
            .await
            .unwrap();

        assert_eq!(value, None);
    }

    #[tokio::test]
    async fn invalid_url_and_header_fail_before_sending() {
        let client = HttpClient::new();

        let error = client.get("not a url").send_raw().await.unwrap_err();
        assert!(matches!(error, HttpClientError::InvalidUrl(_)));

        let error = client
            .get("http://127.0.0.1:1/")
            .header("bad header", "x")
            .send_raw()
            .await
            .unwrap_err();
        assert!(matches!(error, HttpClientError::InvalidHeader(_)));
        assert_eq!(AppError::from(error).status().as_u16(), 500);
    }

    #[test]
    fn header_helpers() {
        assert_eq!(authorization_header("t").value, "Bearer t");
        assert_eq!(json_content_type_header().value, JSON_CONTENT_TYPE);
        assert_eq!(form_content_type_header().key, "Content-Type");
    }
}

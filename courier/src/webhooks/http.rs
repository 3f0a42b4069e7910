//! Outbound HTTP transport.
//!
//! [`HttpClient`] is the seam between the delivery engine and the network. The engine
//! builds a fully formed [`OutboundRequest`]; the client only performs the POST and
//! reports what came back. Non-2xx responses are `Ok` here; deciding what counts as
//! success is the engine's job.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use thiserror::Error;

/// A signed webhook request ready to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
    pub timeout: Duration,
}

impl OutboundRequest {
    /// First header value with this name, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// What the receiver answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    /// Lowercased header names; repeated headers are joined with `", "`.
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body: String::new(),
        }
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// The request never produced an HTTP response.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("request failed: {0}")]
    Other(String),
}

#[async_trait]
pub trait HttpClient: Send + Sync {
    /// POST `request.body` to `request.url` with `request.headers`.
    async fn post(&self, request: OutboundRequest) -> Result<HttpResponse, TransportError>;
}

// ============================================================================
// Production Implementation using reqwest
// ============================================================================

/// reqwest-backed client. Redirects are never followed, so a 3xx is reported as-is.
#[derive(Clone)]
pub struct ReqwestHttpClient {
    client: reqwest::Client,
    max_response_body_bytes: usize,
}

impl ReqwestHttpClient {
    /// `max_response_body_bytes` caps how much of a response body is read and kept.
    pub fn new(max_response_body_bytes: usize) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create webhook HTTP client: {e}"))?;
        Ok(Self {
            client,
            max_response_body_bytes,
        })
    }

    fn header_map(headers: &[(String, String)]) -> HeaderMap {
        let mut map = HeaderMap::with_capacity(headers.len());
        for (name, value) in headers {
            match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
                (Ok(name), Ok(value)) => {
                    map.append(name, value);
                }
                _ => tracing::warn!(header = %name, "Skipping invalid outbound header"),
            }
        }
        map
    }

    async fn read_body(&self, mut response: reqwest::Response) -> String {
        let limit = self.max_response_body_bytes;
        let mut buf: Vec<u8> = Vec::new();
        loop {
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    let remaining = limit.saturating_sub(buf.len());
                    buf.extend_from_slice(&chunk[..chunk.len().min(remaining)]);
                    if buf.len() >= limit {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(error = %e, "Failed to read webhook response body");
                    break;
                }
            }
        }
        let mut body = String::from_utf8_lossy(&buf).into_owned();
        truncate_on_char_boundary(&mut body, limit);
        body
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    #[tracing::instrument(skip(self, request), fields(url = %request.url, timeout_secs = request.timeout.as_secs()))]
    async fn post(&self, request: OutboundRequest) -> Result<HttpResponse, TransportError> {
        let timeout = request.timeout;
        let response = self
            .client
            .post(&request.url)
            .headers(Self::header_map(&request.headers))
            .timeout(timeout)
            .body(request.body)
            .send()
            .await
            .map_err(|e| classify(e, timeout))?;

        let status = response.status().as_u16();
        let mut headers: BTreeMap<String, String> = BTreeMap::new();
        for (name, value) in response.headers() {
            let Ok(value) = value.to_str() else { continue };
            headers
                .entry(name.as_str().to_string())
                .and_modify(|existing| {
                    existing.push_str(", ");
                    existing.push_str(value);
                })
                .or_insert_with(|| value.to_string());
        }
        let body = self.read_body(response).await;

        tracing::debug!(status_code = status, response_len = body.len(), "Webhook HTTP request completed");

        Ok(HttpResponse { status, headers, body })
    }
}

fn classify(error: reqwest::Error, timeout: Duration) -> TransportError {
    if error.is_timeout() {
        return TransportError::Timeout(timeout);
    }
    let message = error_chain(&error);
    if error.is_builder() {
        TransportError::InvalidRequest(message)
    } else if error.is_connect() {
        TransportError::Connect(message)
    } else {
        TransportError::Other(message)
    }
}

/// reqwest's top-level message hides the cause (DNS, refused, TLS); include the chain.
fn error_chain(error: &(dyn std::error::Error + 'static)) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

fn truncate_on_char_boundary(s: &mut String, max_bytes: usize) {
    if s.len() <= max_bytes {
        return;
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s.truncate(end);
}

// ============================================================================
// Test/Mock Implementation
// ============================================================================

/// Mock HTTP client for testing.
///
/// Responses are scripted per URL and returned in FIFO order. Once a URL's script is
/// exhausted (or for URLs with no script) the fallback is returned, which defaults to
/// an empty `200`.
#[derive(Clone)]
pub struct MockHttpClient {
    responses: Arc<Mutex<HashMap<String, VecDeque<Result<HttpResponse, TransportError>>>>>,
    fallback: Arc<Mutex<Result<HttpResponse, TransportError>>>,
    calls: Arc<Mutex<Vec<OutboundRequest>>>,
}

impl MockHttpClient {
    pub fn new() -> Self {
        Self {
            responses: Arc::new(Mutex::new(HashMap::new())),
            fallback: Arc::new(Mutex::new(Ok(HttpResponse::new(200)))),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Queue a response for the next unanswered request to `url`.
    pub fn add_response(&self, url: &str, response: Result<HttpResponse, TransportError>) {
        self.responses.lock().entry(url.to_string()).or_default().push_back(response);
    }

    pub fn set_fallback(&self, response: Result<HttpResponse, TransportError>) {
        *self.fallback.lock() = response;
    }

    /// Get all requests that have been made to this mock client.
    pub fn calls(&self) -> Vec<OutboundRequest> {
        self.calls.lock().clone()
    }

    pub fn calls_to(&self, url: &str) -> Vec<OutboundRequest> {
        self.calls.lock().iter().filter(|c| c.url == url).cloned().collect()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

impl Default for MockHttpClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpClient for MockHttpClient {
    async fn post(&self, request: OutboundRequest) -> Result<HttpResponse, TransportError> {
        let scripted = self.responses.lock().get_mut(&request.url).and_then(|queue| queue.pop_front());
        self.calls.lock().push(request);
        scripted.unwrap_or_else(|| self.fallback.lock().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request(url: String) -> OutboundRequest {
        OutboundRequest {
            url,
            headers: vec![
                ("Content-Type".to_string(), "application/json".to_string()),
                ("X-Webhook-Event".to_string(), "user.created".to_string()),
            ],
            body: r#"{"test": true}"#.to_string(),
            timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_post_sends_headers_and_body() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header("content-type", "application/json"))
            .and(header("x-webhook-event", "user.created"))
            .and(body_string(r#"{"test": true}"#))
            .respond_with(ResponseTemplate::new(200).insert_header("x-request-id", "abc").set_body_string("ok"))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = ReqwestHttpClient::new(1024).unwrap();
        let response = client.post(request(format!("{}/hook", mock_server.uri()))).await.unwrap();

        assert_eq!(response.status, 200);
        assert!(response.is_success());
        assert_eq!(response.body, "ok");
        assert_eq!(response.headers.get("x-request-id").map(String::as_str), Some("abc"));
    }

    #[tokio::test]
    async fn test_non_2xx_is_a_response_not_an_error() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("down"))
            .mount(&mock_server)
            .await;

        let client = ReqwestHttpClient::new(1024).unwrap();
        let response = client.post(request(mock_server.uri())).await.unwrap();

        assert_eq!(response.status, 503);
        assert!(!response.is_success());
        assert_eq!(response.body, "down");
    }

    #[tokio::test]
    async fn test_redirects_are_not_followed() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/old"))
            .respond_with(ResponseTemplate::new(302).insert_header("location", "/new"))
            .expect(1)
            .mount(&mock_server)
            .await;
        Mock::given(method("POST"))
            .and(path("/new"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&mock_server)
            .await;

        let client = ReqwestHttpClient::new(1024).unwrap();
        let response = client.post(request(format!("{}/old", mock_server.uri()))).await.unwrap();

        assert_eq!(response.status, 302);
        assert!(!response.is_success());
    }

    #[tokio::test]
    async fn test_timeout() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&mock_server)
            .await;

        let client = ReqwestHttpClient::new(1024).unwrap();
        let mut req = request(mock_server.uri());
        req.timeout = Duration::from_millis(200);

        let err = client.post(req).await.unwrap_err();
        assert!(matches!(err, TransportError::Timeout(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn test_connection_refused() {
        // Point to a port that's not listening
        let client = ReqwestHttpClient::new(1024).unwrap();
        let err = client.post(request("http://127.0.0.1:1".to_string())).await.unwrap_err();
        assert!(matches!(err, TransportError::Connect(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn test_response_body_is_truncated() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("x".repeat(10_000)))
            .mount(&mock_server)
            .await;

        let client = ReqwestHttpClient::new(16).unwrap();
        let response = client.post(request(mock_server.uri())).await.unwrap();
        assert_eq!(response.body.len(), 16);
    }

    #[tokio::test]
    async fn test_invalid_header_is_skipped() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("x-good", "yes"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = ReqwestHttpClient::new(1024).unwrap();
        let mut req = request(mock_server.uri());
        req.headers.push(("bad header".to_string(), "v".to_string()));
        req.headers.push(("x-good".to_string(), "yes".to_string()));

        let response = client.post(req).await.unwrap();
        assert_eq!(response.status, 204);
    }

    #[test]
    fn test_truncate_on_char_boundary() {
        let mut s = "aé".to_string(); // 'é' is two bytes
        truncate_on_char_boundary(&mut s, 2);
        assert_eq!(s, "a");

        let mut s = "abc".to_string();
        truncate_on_char_boundary(&mut s, 10);
        assert_eq!(s, "abc");
    }

    #[tokio::test]
    async fn test_mock_scripts_per_url_then_falls_back() {
        let mock = MockHttpClient::new();
        mock.add_response("http://a", Ok(HttpResponse::new(500)));
        mock.add_response("http://a", Err(TransportError::Connect("refused".to_string())));

        assert_eq!(mock.post(request("http://a".to_string())).await.unwrap().status, 500);
        assert!(mock.post(request("http://a".to_string())).await.is_err());
        assert_eq!(mock.post(request("http://a".to_string())).await.unwrap().status, 200);
        assert_eq!(mock.post(request("http://b".to_string())).await.unwrap().status, 200);

        mock.set_fallback(Ok(HttpResponse::new(418)));
        assert_eq!(mock.post(request("http://b".to_string())).await.unwrap().status, 418);

        assert_eq!(mock.call_count(), 5);
        assert_eq!(mock.calls_to("http://a").len(), 3);
        assert_eq!(mock.calls()[0].header("x-webhook-event"), Some("user.created"));
    }
}

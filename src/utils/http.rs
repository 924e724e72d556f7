use std::future::Future;
use std::time::Duration;

use once_cell::sync::Lazy;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Method, Response, StatusCode};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

const ERROR_BODY_LOG_LIMIT: usize = 800;
const MAX_BACKOFF_DOUBLINGS: u32 = 16;

static HTTP_CLIENT: Lazy<Client> = Lazy::new(|| {
    Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .unwrap_or_else(|err| {
            warn!("Failed to build tuned HTTP client, using defaults: {err}");
            Client::new()
        })
});

pub fn get_http_client() -> &'static Client {
    &HTTP_CLIENT
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("could not encode request body: {0}")]
    Body(String),
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("HTTP {status}: {detail}")]
    Status { status: StatusCode, detail: String },
}

impl DispatchError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            DispatchError::Status { status, .. } => Some(*status),
            DispatchError::Transport(err) => err.status(),
            DispatchError::Body(_) => None,
        }
    }
}

/// Bounded exponential backoff for outbound provider calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub retryable_status_codes: Vec<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::new(4, Duration::from_secs(1))
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_backoff: Duration) -> Self {
        RetryPolicy {
            max_attempts: max_attempts.max(1),
            base_backoff,
            retryable_status_codes: std::iter::once(429).chain(500..600).collect(),
        }
    }

    pub fn with_retryable_status_codes(mut self, codes: Vec<u16>) -> Self {
        self.retryable_status_codes = codes;
        self
    }

    pub fn is_retryable_status(&self, status: StatusCode) -> bool {
        self.retryable_status_codes.contains(&status.as_u16())
    }

    /// Delay slept before `attempt` (1-based). The first attempt goes out
    /// immediately, every retry after that doubles the previous wait.
    pub fn backoff_before_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let doublings = (attempt - 2).min(MAX_BACKOFF_DOUBLINGS);
        self.base_backoff.saturating_mul(1u32 << doublings)
    }

    fn is_transient(&self, err: &DispatchError) -> bool {
        match err {
            DispatchError::Status { status, .. } => self.is_retryable_status(*status),
            DispatchError::Transport(err) => err.is_timeout() || err.is_connect(),
            DispatchError::Body(_) => false,
        }
    }
}

#[derive(Debug, Clone)]
pub enum RequestBody {
    Empty,
    Json(Value),
    Form(Vec<(String, String)>),
}

/// Everything needed to rebuild the same HTTP request for every attempt.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: RequestBody,
    pub timeout: Duration,
}

impl OutboundRequest {
    pub fn new(method: Method, url: impl Into<String>, timeout: Duration) -> Self {
        OutboundRequest {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: RequestBody::Empty,
            timeout,
        }
    }

    pub fn get(url: impl Into<String>, timeout: Duration) -> Self {
        Self::new(Method::GET, url, timeout)
    }

    pub fn post_json(url: impl Into<String>, payload: Value, timeout: Duration) -> Self {
        let mut request = Self::new(Method::POST, url, timeout);
        request.body = RequestBody::Json(payload);
        request
    }

    pub fn post_form(url: impl Into<String>, fields: Vec<(String, String)>, timeout: Duration) -> Self {
        let mut request = Self::new(Method::POST, url, timeout);
        request.body = RequestBody::Form(fields);
        request
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn bearer_auth(self, token: &str) -> Self {
        self.header("Authorization", format!("Bearer {token}"))
    }

    async fn send_once(&self, client: &Client) -> Result<Response, DispatchError> {
        let mut builder = client
            .request(self.method.clone(), &self.url)
            .timeout(self.timeout);
        for (name, value) in &self.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder = match &self.body {
            RequestBody::Empty => builder,
            RequestBody::Json(payload) => builder.json(payload),
            RequestBody::Form(fields) => {
                let encoded = serde_urlencoded::to_string(fields)
                    .map_err(|err| DispatchError::Body(err.to_string()))?;
                builder
                    .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
                    .body(encoded)
            }
        };
        builder
            .send()
            .await
            .map_err(|err| DispatchError::Transport(err.without_url()))
    }
}

pub fn truncate_for_log(value: &str, limit: usize) -> String {
    if value.chars().count() <= limit {
        return value.to_string();
    }
    let truncated: String = value.chars().take(limit).collect();
    format!("{truncated}... (truncated)")
}

fn summarize_error_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "empty response body".to_string();
    }

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        let message = value
            .pointer("/error/message")
            .or_else(|| value.get("error").filter(|v| v.is_string()))
            .or_else(|| value.get("message"))
            .or_else(|| value.get("status"))
            .and_then(|v| v.as_str());
        if let Some(message) = message {
            return truncate_for_log(message, ERROR_BODY_LOG_LIMIT);
        }
        return truncate_for_log(&value.to_string(), ERROR_BODY_LOG_LIMIT);
    }

    truncate_for_log(trimmed, ERROR_BODY_LOG_LIMIT)
}

async fn status_error(response: Response) -> DispatchError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    DispatchError::Status {
        status,
        detail: summarize_error_body(&body),
    }
}

/// URL as it may appear in logs. Telegram `bot<id>:<token>` path segments
/// are masked, credentials and query strings are dropped.
pub fn loggable_url(raw: &str) -> String {
    let Ok(mut url) = Url::parse(raw) else {
        return "<unparsable url>".to_string();
    };
    let _ = url.set_username("");
    let _ = url.set_password(None);
    url.set_query(None);
    let masked = url.path_segments().map(|segments| {
        segments
            .map(|segment| {
                if is_bot_token_segment(segment) {
                    "bot[REDACTED]"
                } else {
                    segment
                }
            })
            .collect::<Vec<_>>()
            .join("/")
    });
    if let Some(path) = masked {
        url.set_path(&path);
    }
    url.to_string()
}

fn is_bot_token_segment(segment: &str) -> bool {
    segment
        .strip_prefix("bot")
        .and_then(|rest| rest.split_once(':'))
        .is_some_and(|(id, secret)| {
            !id.is_empty() && id.bytes().all(|byte| byte.is_ascii_digit()) && !secret.is_empty()
        })
}

/// Runs `attempt_once` until it succeeds, fails permanently, or the policy
/// runs out of attempts. `target` only labels the log lines.
async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    target: &str,
    mut attempt_once: F,
) -> Result<T, DispatchError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DispatchError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        let error = match attempt_once().await {
            Ok(value) => {
                debug!("{target} succeeded on attempt {attempt}/{max_attempts}");
                return Ok(value);
            }
            Err(err) => err,
        };

        if !policy.is_transient(&error) {
            return Err(error);
        }
        if attempt >= max_attempts {
            warn!("{target} giving up after {attempt} attempts: {error}");
            return Err(error);
        }

        attempt += 1;
        let delay = policy.backoff_before_attempt(attempt);
        warn!("{target} failed ({error}); retrying in {delay:?} (attempt {attempt}/{max_attempts})");
        tokio::time::sleep(delay).await;
    }
}

/// Sends `request`, retrying 429/5xx responses and transient transport
/// failures with exponential backoff. Any other failure is returned as-is
/// after a single attempt.
pub async fn send_with_retry(
    client: &Client,
    request: &OutboundRequest,
    policy: &RetryPolicy,
) -> Result<Response, DispatchError> {
    let target = format!("{} {}", request.method, loggable_url(&request.url));
    retry_with_backoff(policy, &target, move || async move {
        match request.send_once(client).await {
            Ok(response) if response.status().is_success() => Ok(response),
            Ok(response) => Err(status_error(response).await),
            Err(err) => Err(err),
        }
    })
    .await
}

pub async fn fetch_bytes(
    client: &Client,
    url: &str,
    timeout: Duration,
    policy: &RetryPolicy,
) -> Result<Vec<u8>, DispatchError> {
    let response = send_with_retry(client, &OutboundRequest::get(url, timeout), policy).await?;
    let bytes = response
        .bytes()
        .await
        .map_err(|err| DispatchError::Transport(err.without_url()))?;
    Ok(bytes.to_vec())
}


#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::test_support::spawn_scripted;
    use super::*;
    use crate::utils::logging::test_support::CapturedLogs;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(1))
    }

    fn timeout() -> Duration {
        Duration::from_secs(5)
    }

    #[test]
    fn backoff_doubles_from_one_unit() {
        let policy = RetryPolicy::new(5, Duration::from_secs(1));
        assert_eq!(policy.backoff_before_attempt(1), Duration::ZERO);
        assert_eq!(policy.backoff_before_attempt(2), Duration::from_secs(1));
        assert_eq!(policy.backoff_before_attempt(3), Duration::from_secs(2));
        assert_eq!(policy.backoff_before_attempt(4), Duration::from_secs(4));
        assert_eq!(policy.backoff_before_attempt(5), Duration::from_secs(8));

        for attempt in 3..10 {
            let ratio = policy.backoff_before_attempt(attempt).as_secs_f64()
                / policy.backoff_before_attempt(attempt - 1).as_secs_f64();
            assert_eq!(ratio, 2.0);
        }
    }

    #[test]
    fn default_policy_retries_rate_limits_and_server_errors_only() {
        let policy = RetryPolicy::default();
        assert!(policy.is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(policy.is_retryable_status(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(policy.is_retryable_status(StatusCode::GATEWAY_TIMEOUT));
        assert!(!policy.is_retryable_status(StatusCode::BAD_REQUEST));
        assert!(!policy.is_retryable_status(StatusCode::UNAUTHORIZED));
        assert!(!policy.is_retryable_status(StatusCode::NOT_FOUND));
    }

    #[test]
    fn zero_attempts_is_clamped_to_one() {
        assert_eq!(RetryPolicy::new(0, Duration::from_secs(1)).max_attempts, 1);
    }

    #[test]
    fn error_body_summary_prefers_provider_message() {
        assert_eq!(
            summarize_error_body(r#"{"error":{"message":"quota exceeded"}}"#),
            "quota exceeded"
        );
        assert_eq!(summarize_error_body(r#"{"status":"bad key"}"#), "bad key");
        assert_eq!(summarize_error_body("  "), "empty response body");
        assert_eq!(summarize_error_body("gateway down"), "gateway down");
    }

    #[tokio::test]
    async fn retries_transient_statuses_until_success() {
        let server = spawn_scripted(vec![(503, "{}"), (429, "{}"), (200, r#"{"ok":true}"#)]).await;
        let request = OutboundRequest::get(&server.base_url, timeout());

        let response = send_with_retry(get_http_client(), &request, &fast_policy(4))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(server.hits(), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts_with_last_error() {
        let server = spawn_scripted(vec![(502, "{}"), (500, r#"{"message":"still down"}"#)]).await;
        let request = OutboundRequest::get(&server.base_url, timeout());

        let err = send_with_retry(get_http_client(), &request, &fast_policy(3))
            .await
            .unwrap_err();

        assert_eq!(server.hits(), 3);
        assert_eq!(err.status(), Some(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(err.to_string().contains("still down"));
    }

    #[tokio::test]
    async fn non_retryable_status_is_sent_exactly_once() {
        let server =
            spawn_scripted(vec![(400, r#"{"error":{"message":"bad prompt"}}"#), (200, "{}")]).await;
        let request = OutboundRequest::post_json(&server.base_url, json!({"prompt": "x"}), timeout());

        let err = send_with_retry(get_http_client(), &request, &fast_policy(5))
            .await
            .unwrap_err();

        assert_eq!(server.hits(), 1);
        assert_eq!(err.status(), Some(StatusCode::BAD_REQUEST));
        assert!(err.to_string().contains("bad prompt"));
    }

    #[tokio::test]
    async fn custom_status_list_disables_server_error_retries() {
        let server = spawn_scripted(vec![(503, "{}")]).await;
        let request = OutboundRequest::get(&server.base_url, timeout());
        let policy = fast_policy(4).with_retryable_status_codes(vec![429]);

        let err = send_with_retry(get_http_client(), &request, &policy)
            .await
            .unwrap_err();

        assert_eq!(server.hits(), 1);
        assert_eq!(err.status(), Some(StatusCode::SERVICE_UNAVAILABLE));
    }

    #[tokio::test]
    async fn sends_headers_and_form_body() {
        let server = spawn_scripted(vec![(200, "{}")]).await;
        let request = OutboundRequest::post_form(
            format!("{}/api/text2video", server.base_url),
            vec![("text".to_string(), "hello world & more".to_string())],
            timeout(),
        )
        .header("api-key", "video-key");

        send_with_retry(get_http_client(), &request, &fast_policy(1))
            .await
            .unwrap();

        let recorded = server.requests();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].path, "/api/text2video");
        assert_eq!(recorded[0].body, "text=hello+world+%26+more");
        assert_eq!(recorded[0].headers["api-key"], "video-key");
        assert_eq!(
            recorded[0].headers["content-type"],
            "application/x-www-form-urlencoded"
        );
    }

    #[tokio::test]
    async fn connection_failures_surface_as_transport_errors() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let request = OutboundRequest::get(format!("http://{addr}"), timeout());
        let err = send_with_retry(get_http_client(), &request, &fast_policy(2))
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::Transport(_)));
    }

    #[test]
    fn loggable_urls_hide_bot_tokens_and_queries() {
        assert_eq!(
            loggable_url("https://api.telegram.org/file/bot123456:AA-secret_x/photos/a.jpg"),
            "https://api.telegram.org/file/bot[REDACTED]/photos/a.jpg"
        );
        assert_eq!(
            loggable_url("https://user:pw@api.example.com/v1/images?key=sk-live"),
            "https://api.example.com/v1/images"
        );
        assert_eq!(
            loggable_url("https://api.deepai.org/api/text2video"),
            "https://api.deepai.org/api/text2video"
        );
        assert_eq!(loggable_url("https://example.com/robots/bot:x"), "https://example.com/robots/bot:x");
        assert_eq!(loggable_url("not a url"), "<unparsable url>");
    }

    #[tokio::test(start_paused = true)]
    async fn retries_sleep_the_backoff_schedule() {
        let base = Duration::from_millis(500);
        let policy = RetryPolicy::new(4, base);
        let mut replies = vec![
            Err(DispatchError::Status {
                status: StatusCode::SERVICE_UNAVAILABLE,
                detail: "busy".to_string(),
            }),
            Err(DispatchError::Status {
                status: StatusCode::SERVICE_UNAVAILABLE,
                detail: "busy".to_string(),
            }),
            Ok(7),
        ]
        .into_iter();

        let started = tokio::time::Instant::now();
        let value = retry_with_backoff(&policy, "GET test", || {
            let reply = replies.next().unwrap_or(Ok(0));
            async move { reply }
        })
        .await
        .unwrap();

        assert_eq!(value, 7);
        assert_eq!(started.elapsed(), base + base * 2);
    }

    #[tokio::test]
    async fn retry_logs_do_not_contain_bot_tokens() {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let server = spawn_scripted(vec![(503, "{}"), (200, "photo-bytes")]).await;
        let url = format!("{}/file/bot123456:SECRETTOKEN/photos/a.jpg", server.base_url);
        let bytes = fetch_bytes(get_http_client(), &url, timeout(), &fast_policy(2))
            .await
            .unwrap();
        assert_eq!(bytes, b"photo-bytes");

        let logged = logs.contents();
        assert!(logged.contains("retrying"), "no retry line in: {logged}");
        assert!(logged.contains("/file/bot[REDACTED]/photos/a.jpg"));
        assert!(!logged.contains("SECRETTOKEN"));
    }

    #[tokio::test]
    async fn fetch_bytes_returns_body() {
        let server = spawn_scripted(vec![(500, "{}"), (200, "raw-bytes")]).await;
        let bytes = fetch_bytes(get_http_client(), &server.base_url, timeout(), &fast_policy(2))
            .await
            .unwrap();
        assert_eq!(bytes, b"raw-bytes");
    }
}

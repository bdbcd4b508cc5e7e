// Azion API client - token lifecycle and authenticated requests
//
// Every request goes through `ensure_valid_token`, which holds the token
// mutex across the renewal exchange. Concurrent callers queue on the lock
// and pick up the outcome of that exchange, the new token or its error, so
// one expiry causes one renewal.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use reqwest::StatusCode;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::error::{ApiError, ErrorMessages};
use super::token::{Clock, Credentials, SystemClock, Token, TokenResponse};
use super::{AnalyticsSource, MetricQuery};

/// Public Azion API endpoint
pub const DEFAULT_BASE_URL: &str = "https://api.azionapi.net/";

/// Media type pinning the API version
const API_MEDIA_TYPE: &str = "application/json; version=2";

const USER_AGENT: &str = concat!("azion-exporter/", env!("CARGO_PKG_VERSION"));

/// How often a failed request is attempted again before giving up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts after the first one
    pub max_retries: u32,

    /// Fixed pause between attempts
    pub delay: Duration,
}

impl RetryPolicy {
    /// Single attempt, no retries
    #[cfg(test)]
    pub fn none() -> Self {
        RetryPolicy {
            max_retries: 0,
            delay: Duration::ZERO,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: 1,
            delay: Duration::from_millis(500),
        }
    }
}

/// Connection settings for the API client
#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// API root; a trailing slash is added if missing
    pub base_url: String,

    /// Upper bound for every single HTTP exchange
    pub request_timeout: Duration,

    /// Value of the `date_from` query argument (e.g. "last-hour")
    pub date_from: String,

    pub retry: RetryPolicy,
}

impl Default for ClientSettings {
    fn default() -> Self {
        ClientSettings {
            base_url: DEFAULT_BASE_URL.to_string(),
            request_timeout: Duration::from_secs(20),
            date_from: "last-hour".to_string(),
            retry: RetryPolicy::default(),
        }
    }
}

/// Body of `GET /analytics/metadata`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AnalyticsMetadata {
    /// Metric name to its available dimensions
    #[serde(default, alias = "Dimensions")]
    pub dimensions: BTreeMap<String, serde_json::Value>,
}

impl AnalyticsMetadata {
    pub fn metric_names(&self) -> impl Iterator<Item = &str> {
        self.dimensions.keys().map(String::as_str)
    }
}

/// Authenticated client for the Azion API
pub struct AzionClient {
    http: reqwest::Client,
    base_url: String,
    credentials: Credentials,
    date_from: String,
    retry: RetryPolicy,
    token: Mutex<TokenState>,
    /// Mirrors `TokenState::renewals` so callers can note it before queueing
    renewals: AtomicU64,
    clock: Arc<dyn Clock>,
}

/// Held token plus the outcome of the latest renewal attempt
#[derive(Default)]
struct TokenState {
    token: Option<Token>,
    renewals: u64,
    last_failure: Option<ApiError>,
}

impl AzionClient {
    /// Creates a client; no request is made until the first fetch.
    pub fn new(credentials: Credentials, settings: ClientSettings) -> Result<Self, ApiError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(API_MEDIA_TYPE));

        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .timeout(settings.request_timeout)
            .build()
            .map_err(|e| ApiError::Client(e.to_string()))?;

        let mut base_url = settings.base_url.trim().to_string();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }

        Ok(AzionClient {
            http,
            base_url,
            credentials,
            date_from: settings.date_from,
            retry: settings.retry,
            token: Mutex::new(TokenState::default()),
            renewals: AtomicU64::new(0),
            clock: Arc::new(SystemClock),
        })
    }

    /// Replaces the clock used to judge token expiry.
    #[cfg(test)]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[cfg(test)]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Returns a usable token value, renewing first if none is held or it expired.
    ///
    /// Callers that queued behind a renewal share its outcome: when that
    /// attempt failed they get its error instead of sending another exchange.
    pub async fn ensure_valid_token(&self) -> Result<String, ApiError> {
        let observed = self.renewals.load(Ordering::Acquire);
        let mut state = self.token.lock().await;

        if let Some(token) = state.token.as_ref() {
            if token.is_valid_at(self.clock.now()) {
                return Ok(token.value().to_string());
            }
            debug!(expired_at = %token.expires_at(), "Azion token expired, renewing");
        }

        if state.renewals != observed {
            if let Some(failure) = state.last_failure.as_ref() {
                debug!("Token renewal failed while waiting, sharing its error");
                return Err(failure.clone());
            }
        }

        let token = self.renew_locked(&mut state).await?;
        Ok(token.value().to_string())
    }

    /// Unconditionally exchanges the credentials for a fresh token.
    ///
    /// The held token is only replaced when the exchange succeeds.
    pub async fn renew_token(&self) -> Result<Token, ApiError> {
        let mut state = self.token.lock().await;
        self.renew_locked(&mut state).await
    }

    /// Snapshot of the currently held token
    #[cfg(test)]
    pub async fn current_token(&self) -> Option<Token> {
        self.token.lock().await.token.clone()
    }

    /// Runs one exchange and records its outcome; the caller holds the lock.
    async fn renew_locked(&self, state: &mut TokenState) -> Result<Token, ApiError> {
        let outcome = self.exchange_credentials().await;

        state.renewals += 1;
        self.renewals.store(state.renewals, Ordering::Release);

        match outcome {
            Ok(token) => {
                state.token = Some(token.clone());
                state.last_failure = None;
                Ok(token)
            }
            Err(e) => {
                state.last_failure = Some(e.clone());
                Err(e)
            }
        }
    }

    /// Fetches the raw time-series payload for one query.
    pub async fn fetch(&self, query: &MetricQuery) -> Result<Bytes, ApiError> {
        let path = query.path();
        self.get(&path, &[("date_from", self.date_from.as_str())])
            .await
    }

    /// Lists the metrics and dimensions the account can query.
    pub async fn metadata(&self) -> Result<AnalyticsMetadata, ApiError> {
        let body = self.get("analytics/metadata", &[]).await?;
        if body.is_empty() {
            return Ok(AnalyticsMetadata::default());
        }
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::Malformed(format!("analytics metadata: {}", e)))
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Drops the held token if it is still the one the API just rejected.
    async fn invalidate_token(&self, rejected: &str) {
        let mut state = self.token.lock().await;
        if state.token.as_ref().is_some_and(|token| token.value() == rejected) {
            debug!("Azion API rejected the current token, discarding it");
            state.token = None;
        }
    }

    async fn exchange_credentials(&self) -> Result<Token, ApiError> {
        debug!("Requesting Azion API token for {}", self.credentials.email());

        let response = self
            .http
            .post(self.url("tokens"))
            .basic_auth(self.credentials.email(), Some(self.credentials.password()))
            .send()
            .await?;

        let status = response.status();
        let body = response.bytes().await?;

        if !status.is_success() {
            return Err(ApiError::Auth {
                status: Some(status.as_u16()),
                message: "token request rejected".to_string(),
                errors: ErrorMessages::from_body(&body),
            });
        }

        let auth_error = |message: String| ApiError::Auth {
            status: Some(status.as_u16()),
            message,
            errors: None,
        };

        let parsed: TokenResponse = serde_json::from_slice(&body)
            .map_err(|e| auth_error(format!("malformed token response: {}", e)))?;
        let token = parsed.into_token().map_err(auth_error)?;

        info!(
            issued_at = %token.issued_at(),
            expires_at = %token.expires_at(),
            "Obtained Azion API token"
        );
        Ok(token)
    }

    async fn get(&self, path: &str, query: &[(&str, &str)]) -> Result<Bytes, ApiError> {
        let mut attempt = 0;

        loop {
            match self.get_once(path, query).await {
                Ok(body) => {
                    if attempt > 0 {
                        info!("Request to {} succeeded after {} retry(ies)", path, attempt);
                    }
                    return Ok(body);
                }
                Err(e) if attempt < self.retry.max_retries && e.is_retryable() => {
                    attempt += 1;
                    warn!(
                        status = ?e.status(),
                        "Request to {} failed (attempt {}/{}): {}. Retrying in {:?}...",
                        path,
                        attempt,
                        self.retry.max_retries + 1,
                        e,
                        self.retry.delay
                    );
                    tokio::time::sleep(self.retry.delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn get_once(&self, path: &str, query: &[(&str, &str)]) -> Result<Bytes, ApiError> {
        let token = self.ensure_valid_token().await?;

        let mut request = self
            .http
            .get(self.url(path))
            .header(AUTHORIZATION, format!("Token {}", token));
        if !query.is_empty() {
            request = request.query(query);
        }

        let response = request.send().await?;
        let status = response.status();
        let body = response.bytes().await?;

        if status.is_success() {
            debug!("GET {} -> {} ({} bytes)", path, status, body.len());
            return Ok(body);
        }

        if status == StatusCode::UNAUTHORIZED {
            self.invalidate_token(&token).await;
        }

        Err(ApiError::Upstream {
            status: status.as_u16(),
            body: String::from_utf8_lossy(&body).into_owned(),
            errors: ErrorMessages::from_body(&body),
        })
    }
}

#[async_trait]
impl AnalyticsSource for AzionClient {
    async fn fetch(&self, query: &MetricQuery) -> Result<Bytes, ApiError> {
        AzionClient::fetch(self, query).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::azion::token::{format_api_datetime, ManualClock};
    use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
    use futures_util::future::join_all;
    use serde_json::json;
    use wiremock::matchers::{basic_auth, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const SERIES_PATH: &str = "/products/1441740010/aggregate/metrics/requests/dimensions/total";

    fn query() -> MetricQuery {
        MetricQuery::new("1441740010", "requests", "total")
    }

    fn settings(server: &MockServer, retry: RetryPolicy) -> ClientSettings {
        ClientSettings {
            base_url: server.uri(),
            request_timeout: Duration::from_secs(5),
            date_from: "last-hour".to_string(),
            retry,
        }
    }

    fn client(server: &MockServer, retry: RetryPolicy) -> AzionClient {
        AzionClient::new(
            Credentials::new("ops@example.com", "secret"),
            settings(server, retry),
        )
        .unwrap()
    }

    fn token_response(value: &str, created: DateTime<Utc>, expires: DateTime<Utc>) -> ResponseTemplate {
        ResponseTemplate::new(201).set_body_json(json!({
            "token": value,
            "created_at": format_api_datetime(created),
            "expires_at": format_api_datetime(expires),
        }))
    }

    async fn mount_long_lived_token(server: &MockServer, expected_calls: u64) {
        let now = Utc::now();
        Mock::given(method("POST"))
            .and(path("/tokens"))
            .respond_with(token_response("tok-1", now, now + ChronoDuration::hours(1)))
            .expect(expected_calls)
            .mount(server)
            .await;
    }

    fn series_body() -> serde_json::Value {
        json!({"products": {"1441740010": {"requests": {"total": [[1000, 3.0], [1060, 1.0]]}}}})
    }

    async fn token_requests(server: &MockServer) -> usize {
        server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter(|request| request.url.path() == "/tokens")
            .count()
    }

    #[tokio::test]
    async fn test_fetch_authenticates_and_returns_payload() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/tokens"))
            .and(basic_auth("ops@example.com", "secret"))
            .respond_with(token_response("tok-1", Utc::now(), Utc::now() + ChronoDuration::hours(1)))
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path(SERIES_PATH))
            .and(header("Authorization", "Token tok-1"))
            .and(header("Accept", API_MEDIA_TYPE))
            .and(query_param("date_from", "last-hour"))
            .respond_with(ResponseTemplate::new(200).set_body_json(series_body()))
            .expect(1)
            .mount(&server)
            .await;

        let client = client(&server, RetryPolicy::none());
        let payload = client.fetch(&query()).await.unwrap();

        let decoded: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(decoded, series_body());
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_renewal() {
        let server = MockServer::start().await;
        mount_long_lived_token(&server, 1).await;

        Mock::given(method("GET"))
            .and(path(SERIES_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(series_body()))
            .expect(10)
            .mount(&server)
            .await;

        let client = client(&server, RetryPolicy::none());
        let query = query();
        let results = join_all((0..10).map(|_| client.fetch(&query))).await;

        assert!(results.iter().all(Result::is_ok));
        assert_eq!(token_requests(&server).await, 1);
    }

    #[tokio::test]
    async fn test_failed_renewal_is_shared_by_waiting_requests() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/tokens"))
            .respond_with(ResponseTemplate::new(500).set_delay(Duration::from_millis(100)))
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path(SERIES_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(series_body()))
            .expect(0)
            .mount(&server)
            .await;

        let client = client(&server, RetryPolicy::none());
        let query = query();
        let results = join_all((0..10).map(|_| client.fetch(&query))).await;

        assert!(results
            .iter()
            .all(|result| matches!(result, Err(ApiError::Auth { status: Some(500), .. }))));
        assert_eq!(token_requests(&server).await, 1);

        // A request arriving after the failure starts a new exchange
        assert!(client.fetch(&query).await.is_err());
        assert_eq!(token_requests(&server).await, 2);
    }

    #[tokio::test]
    async fn test_token_reused_before_expiry_and_renewed_once_after() {
        let server = MockServer::start().await;
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();

        Mock::given(method("POST"))
            .and(path("/tokens"))
            .respond_with(token_response("first", t0, t0 + ChronoDuration::seconds(3600)))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/tokens"))
            .respond_with(token_response(
                "second",
                t0 + ChronoDuration::seconds(3601),
                t0 + ChronoDuration::seconds(7201),
            ))
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path(SERIES_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(series_body()))
            .mount(&server)
            .await;

        let clock = Arc::new(ManualClock::new(t0));
        let client = client(&server, RetryPolicy::none()).with_clock(clock.clone());
        let query = query();

        client.fetch(&query).await.unwrap();
        assert_eq!(client.current_token().await.unwrap().value(), "first");

        clock.set(t0 + ChronoDuration::seconds(3599));
        client.fetch(&query).await.unwrap();
        assert_eq!(client.current_token().await.unwrap().value(), "first");
        assert_eq!(token_requests(&server).await, 1);

        clock.set(t0 + ChronoDuration::seconds(3601));
        let results = join_all((0..8).map(|_| client.fetch(&query))).await;
        assert!(results.iter().all(Result::is_ok));

        assert_eq!(client.current_token().await.unwrap().value(), "second");
        assert_eq!(token_requests(&server).await, 2);
    }

    #[tokio::test]
    async fn test_upstream_error_carries_parsed_body() {
        let server = MockServer::start().await;
        mount_long_lived_token(&server, 1).await;

        Mock::given(method("GET"))
            .and(path(SERIES_PATH))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "errors": {"params": {"date_from": "invalid"}, "request": ["bad date range"], "system": []}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = client(&server, RetryPolicy::default());
        let err = client.fetch(&query()).await.unwrap_err();

        match err {
            ApiError::Upstream { status, errors, .. } => {
                assert_eq!(status, 400);
                let errors = errors.expect("structured error body");
                assert_eq!(errors.request, vec!["bad date range".to_string()]);
                assert_eq!(errors.params["date_from"], "invalid");
            }
            other => panic!("expected upstream error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rejected_credentials_abort_fetch() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/tokens"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "errors": {"request": ["invalid credentials"]}
            })))
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path(SERIES_PATH))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let client = client(&server, RetryPolicy::default());
        let err = client.fetch(&query()).await.unwrap_err();

        match err {
            ApiError::Auth { status, errors, .. } => {
                assert_eq!(status, Some(401));
                assert_eq!(errors.unwrap().request, vec!["invalid credentials".to_string()]);
            }
            other => panic!("expected auth error, got {:?}", other),
        }
        assert!(client.current_token().await.is_none());
    }

    #[tokio::test]
    async fn test_malformed_expiry_is_auth_error() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/tokens"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "token": "tok-1",
                "created_at": "2024-01-01 12:00:00",
                "expires_at": "2024-01-01T13:00:00Z",
            })))
            .mount(&server)
            .await;

        let client = client(&server, RetryPolicy::none());
        let err = client.renew_token().await.unwrap_err();

        assert!(matches!(err, ApiError::Auth { .. }));
        assert!(err.to_string().contains("expires_at"));
    }

    #[tokio::test]
    async fn test_empty_body_is_empty_payload() {
        let server = MockServer::start().await;
        mount_long_lived_token(&server, 1).await;

        Mock::given(method("GET"))
            .and(path(SERIES_PATH))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let client = client(&server, RetryPolicy::none());
        let payload = client.fetch(&query()).await.unwrap();
        assert!(payload.is_empty());
    }

    #[tokio::test]
    async fn test_retries_server_errors() {
        let server = MockServer::start().await;
        mount_long_lived_token(&server, 1).await;

        Mock::given(method("GET"))
            .and(path(SERIES_PATH))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path(SERIES_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(series_body()))
            .expect(1)
            .mount(&server)
            .await;

        let retry = RetryPolicy {
            max_retries: 1,
            delay: Duration::from_millis(10),
        };
        let client = client(&server, retry);
        assert!(client.fetch(&query()).await.is_ok());
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let server = MockServer::start().await;
        mount_long_lived_token(&server, 1).await;

        Mock::given(method("GET"))
            .and(path(SERIES_PATH))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let retry = RetryPolicy {
            max_retries: 3,
            delay: Duration::from_millis(10),
        };
        let client = client(&server, retry);
        let err = client.fetch(&query()).await.unwrap_err();
        assert_eq!(err.status(), Some(404));
    }

    #[tokio::test]
    async fn test_rejected_token_is_renewed_on_retry() {
        let server = MockServer::start().await;
        mount_long_lived_token(&server, 2).await;

        Mock::given(method("GET"))
            .and(path(SERIES_PATH))
            .respond_with(ResponseTemplate::new(401))
            .up_to_n_times(1)
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path(SERIES_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(series_body()))
            .mount(&server)
            .await;

        let retry = RetryPolicy {
            max_retries: 1,
            delay: Duration::from_millis(10),
        };
        let client = client(&server, retry);

        assert!(client.fetch(&query()).await.is_ok());
        assert_eq!(token_requests(&server).await, 2);
    }

    #[tokio::test]
    async fn test_unreachable_api_is_transport_error() {
        let settings = ClientSettings {
            base_url: "http://127.0.0.1:1".to_string(),
            request_timeout: Duration::from_secs(2),
            retry: RetryPolicy::none(),
            ..Default::default()
        };
        let client = AzionClient::new(Credentials::new("ops@example.com", "secret"), settings).unwrap();

        let err = client.fetch(&query()).await.unwrap_err();
        assert!(matches!(err, ApiError::Transport(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_metadata() {
        let server = MockServer::start().await;
        mount_long_lived_token(&server, 1).await;

        Mock::given(method("GET"))
            .and(path("/analytics/metadata"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "dimensions": {
                    "requests": [{"total": "Total"}, {"saved": "Saved"}],
                    "status_code": [{"5xx": "5xx"}]
                }
            })))
            .mount(&server)
            .await;

        let client = client(&server, RetryPolicy::none());
        let metadata = client.metadata().await.unwrap();

        let names: Vec<&str> = metadata.metric_names().collect();
        assert_eq!(names, vec!["requests", "status_code"]);
    }

    #[test]
    fn test_base_url_normalized() {
        let settings = ClientSettings {
            base_url: "https://api.example.net/v2".to_string(),
            ..Default::default()
        };
        let client = AzionClient::new(Credentials::new("a", "b"), settings).unwrap();
        assert_eq!(client.base_url(), "https://api.example.net/v2/");
        assert_eq!(client.url("/tokens"), "https://api.example.net/v2/tokens");
    }
}

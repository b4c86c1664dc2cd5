use crate::payments::error::{PaymentError, PaymentResult, UNKNOWN_ERROR_MESSAGE};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use std::future::Future;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Which stage a gateway call belongs to; decides the error variant a
/// failure is reported as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayStage {
    Purchase,
    Verify,
}

impl GatewayStage {
    pub fn error(self, driver: &str, message: impl Into<String>, code: Option<String>) -> PaymentError {
        match self {
            GatewayStage::Purchase => PaymentError::purchase_failed(driver, message, code),
            GatewayStage::Verify => PaymentError::invalid_payment(driver, message, code),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum HttpError {
    #[error("gateway request timed out: {0}")]
    Timeout(String),

    #[error("gateway request failed: {0}")]
    Transport(String),

    #[error("invalid gateway response: {0}")]
    Decode(String),
}

impl HttpError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, HttpError::Timeout(_))
    }

    pub fn into_payment_error(self, driver: &str, stage: GatewayStage) -> PaymentError {
        match self {
            HttpError::Timeout(message) => PaymentError::Timeout {
                driver: driver.to_string(),
                message,
            },
            other => stage.error(driver, other.to_string(), None),
        }
    }
}

impl From<reqwest::Error> for HttpError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            HttpError::Timeout(e.to_string())
        } else if e.is_decode() {
            HttpError::Decode(e.to_string())
        } else {
            HttpError::Transport(e.to_string())
        }
    }
}

/// Raw gateway answer. Many gateways report business errors with a 4xx
/// status and a JSON body, so a non-2xx status is not an error here.
#[derive(Debug, Clone)]
pub struct GatewayReply {
    pub status: StatusCode,
    pub body: String,
}

impl GatewayReply {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, HttpError> {
        serde_json::from_str(&self.body).map_err(|e| {
            HttpError::Decode(format!("HTTP {}: {} ({})", self.status, e, truncate(&self.body)))
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub enum RequestAuth<'a> {
    None,
    Bearer(&'a str),
    Basic(&'a str, &'a str),
}

#[derive(Debug, Clone)]
pub struct GatewayHttpClient {
    client: Client,
    timeout: Duration,
}

impl GatewayHttpClient {
    pub fn new(timeout: Duration) -> PaymentResult<Self> {
        let client = Client::builder().timeout(timeout).build().map_err(|e| {
            PaymentError::validation(
                format!("failed to initialize HTTP client: {}", e),
                Some("timeout_secs"),
            )
        })?;

        Ok(Self { client, timeout })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn request_json(
        &self,
        method: reqwest::Method,
        url: &str,
        auth: RequestAuth<'_>,
        body: Option<&JsonValue>,
        additional_headers: &[(&str, &str)],
    ) -> Result<GatewayReply, HttpError> {
        let mut request = self
            .client
            .request(method.clone(), url)
            .header("Accept", "application/json");
        request = apply_auth(request, auth);
        for (k, v) in additional_headers {
            request = request.header(*k, *v);
        }
        if let Some(payload) = body {
            request = request.json(payload);
        }

        debug!(method = %method, url = url, "Sending gateway request");
        self.send(request, url).await
    }

    pub async fn post_json(
        &self,
        url: &str,
        body: &JsonValue,
        additional_headers: &[(&str, &str)],
    ) -> Result<GatewayReply, HttpError> {
        self.request_json(
            reqwest::Method::POST,
            url,
            RequestAuth::None,
            Some(body),
            additional_headers,
        )
        .await
    }

    pub async fn post_form(
        &self,
        url: &str,
        auth: RequestAuth<'_>,
        form: &[(&str, String)],
    ) -> Result<GatewayReply, HttpError> {
        let request = apply_auth(
            self.client
                .post(url)
                .header("Accept", "application/json")
                .form(form),
            auth,
        );

        debug!(method = "POST", url = url, "Sending gateway form request");
        self.send(request, url).await
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        url: &str,
    ) -> Result<GatewayReply, HttpError> {
        let response = request.send().await.map_err(|e| {
            let err = HttpError::from(e);
            warn!(url = url, error = %err, "Gateway request failed");
            err
        })?;

        let status = response.status();
        let body = response.text().await.map_err(HttpError::from)?;
        if !status.is_success() {
            debug!(url = url, status = %status, "Gateway answered with non-success status");
        }
        Ok(GatewayReply { status, body })
    }
}

fn apply_auth(request: reqwest::RequestBuilder, auth: RequestAuth<'_>) -> reqwest::RequestBuilder {
    match auth {
        RequestAuth::None => request,
        RequestAuth::Bearer(token) => request.bearer_auth(token),
        RequestAuth::Basic(user, password) => request.basic_auth(user, Some(password)),
    }
}

fn truncate(body: &str) -> String {
    const LIMIT: usize = 200;
    if body.chars().count() <= LIMIT {
        body.to_string()
    } else {
        let head: String = body.chars().take(LIMIT).collect();
        format!("{}...", head)
    }
}

/// Looks a gateway status code up in a driver's message table, falling back
/// to the generic unknown-error text.
pub fn lookup_message(table: &'static [(&'static str, &'static str)], code: &str) -> &'static str {
    table
        .iter()
        .find(|(known, _)| *known == code)
        .map(|(_, message)| *message)
        .unwrap_or(UNKNOWN_ERROR_MESSAGE)
}

/// Gateways return status codes as numbers or strings depending on the
/// endpoint; normalise both to a string for table lookups.
pub fn code_to_string(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::String(s) => Some(s.clone()),
        _ => None,
    }
}

/// Joins a configured base URL and a path without doubling slashes.
pub fn endpoint(base_url: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// Access token shared by the calls of one driver instance.
///
/// The lock is held while a token is fetched, so concurrent callers wait for
/// a single refresh instead of racing. Tokens are treated as expired a
/// little before the gateway says so.
#[derive(Debug)]
pub struct AccessTokenCache {
    state: Mutex<Option<CachedToken>>,
    expiry_margin: Duration,
}

impl Default for AccessTokenCache {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl AccessTokenCache {
    pub fn new(expiry_margin: Duration) -> Self {
        Self {
            state: Mutex::new(None),
            expiry_margin,
        }
    }

    /// Returns the cached token, or fetches a new one when there is none,
    /// it has expired, or `force_refresh` is set. `fetch` yields the token
    /// and its lifetime.
    pub async fn get_or_fetch<F, Fut>(&self, force_refresh: bool, fetch: F) -> PaymentResult<String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = PaymentResult<(String, Duration)>>,
    {
        let mut guard = self.state.lock().await;
        if !force_refresh {
            if let Some(cached) = guard.as_ref() {
                if Instant::now() < cached.expires_at {
                    return Ok(cached.value.clone());
                }
            }
        }

        let (value, lifetime) = fetch().await?;
        let expires_at = Instant::now() + lifetime.saturating_sub(self.expiry_margin);
        *guard = Some(CachedToken {
            value: value.clone(),
            expires_at,
        });
        Ok(value)
    }

    pub async fn invalidate(&self) {
        *self.state.lock().await = None;
    }
}

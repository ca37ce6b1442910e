// HTTP capability - the only way a plugin reaches the network
//
// Wraps reqwest with a retry policy and structured failures. Retryable
// categories (rate_limited, server_error, transport) are retried with
// exponential backoff + jitter before the failure surfaces; the executor
// maps a surfaced HttpRequestFailed to a provider_error result.

use std::collections::HashMap;
use std::time::Duration;

use rand::Rng;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

/// Failure category, mapped from status codes and transport errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpErrorCategory {
    AuthError,
    Forbidden,
    NotFound,
    ValidationError,
    RateLimited,
    ServerError,
    Transport,
    Other,
}

impl HttpErrorCategory {
    pub fn from_status(status: u16) -> Self {
        match status {
            401 => HttpErrorCategory::AuthError,
            403 => HttpErrorCategory::Forbidden,
            404 => HttpErrorCategory::NotFound,
            400 | 422 => HttpErrorCategory::ValidationError,
            429 => HttpErrorCategory::RateLimited,
            500..=599 => HttpErrorCategory::ServerError,
            _ => HttpErrorCategory::Other,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            HttpErrorCategory::RateLimited
                | HttpErrorCategory::ServerError
                | HttpErrorCategory::Transport
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HttpErrorCategory::AuthError => "auth_error",
            HttpErrorCategory::Forbidden => "forbidden",
            HttpErrorCategory::NotFound => "not_found",
            HttpErrorCategory::ValidationError => "validation_error",
            HttpErrorCategory::RateLimited => "rate_limited",
            HttpErrorCategory::ServerError => "server_error",
            HttpErrorCategory::Transport => "transport",
            HttpErrorCategory::Other => "other",
        }
    }
}

/// Structured HTTP failure surfaced to the executor
#[derive(Debug, Clone, Error)]
#[error("HTTP request to {url} failed ({})", .status_code.map(|s| s.to_string()).unwrap_or_else(|| "transport".to_string()))]
pub struct HttpRequestFailed {
    pub status_code: Option<u16>,
    pub url: String,
    /// Response body, parsed as JSON when possible
    pub body: Value,
    pub error_category: HttpErrorCategory,
    pub is_retryable: bool,
}

/// Retry policy for outbound requests
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Random jitter fraction (0.0 to 1.0) to avoid thundering herds
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after `attempt` (1-based) failed attempts
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        let capped = base.min(self.max_delay.as_secs_f64());
        let jitter = if self.jitter_factor > 0.0 {
            rand::thread_rng().gen_range(0.0..=self.jitter_factor) * capped
        } else {
            0.0
        };
        Duration::from_secs_f64(capped + jitter)
    }
}

/// Request shape accepted by `fetch`
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub query: Vec<(String, String)>,
    pub json_body: Option<Value>,
    pub bearer_token: Option<String>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            url: url.into(),
            headers: HashMap::new(),
            query: Vec::new(),
            json_body: None,
            bearer_token: None,
        }
    }

    pub fn post(url: impl Into<String>, body: Value) -> Self {
        Self {
            method: "POST".to_string(),
            url: url.into(),
            headers: HashMap::new(),
            query: Vec::new(),
            json_body: Some(body),
            bearer_token: None,
        }
    }

    pub fn with_bearer(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// Successful response
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status_code: u16,
    pub body: Value,
}

/// Plugin-scoped HTTP client
#[derive(Debug)]
pub struct HttpCapability {
    client: reqwest::Client,
    retry: RetryPolicy,
    plugin_name: String,
}

impl HttpCapability {
    pub fn new(plugin_name: &str, retry: RetryPolicy) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(format!("shu-plugin/{plugin_name}"))
            .build()
            .unwrap_or_default();
        Self {
            client,
            retry,
            plugin_name: plugin_name.to_string(),
        }
    }

    /// Execute a request, retrying retryable failures per the policy.
    pub async fn fetch(&self, request: HttpRequest) -> Result<HttpResponse, HttpRequestFailed> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.send_once(&request).await {
                Ok(response) => return Ok(response),
                Err(failure) => {
                    if failure.is_retryable && attempt < self.retry.max_attempts {
                        let delay = self.retry.delay_for_attempt(attempt);
                        debug!(
                            plugin = %self.plugin_name,
                            url = %failure.url,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            category = failure.error_category.as_str(),
                            "Retrying HTTP request"
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    warn!(
                        plugin = %self.plugin_name,
                        url = %failure.url,
                        status = ?failure.status_code,
                        category = failure.error_category.as_str(),
                        "HTTP request failed"
                    );
                    return Err(failure);
                }
            }
        }
    }

    /// Convenience GET returning the parsed body
    pub async fn get_json(&self, url: &str) -> Result<Value, HttpRequestFailed> {
        Ok(self.fetch(HttpRequest::get(url)).await?.body)
    }

    async fn send_once(&self, request: &HttpRequest) -> Result<HttpResponse, HttpRequestFailed> {
        let method: reqwest::Method = request.method.parse().map_err(|_| HttpRequestFailed {
            status_code: None,
            url: request.url.clone(),
            body: Value::String(format!("invalid method '{}'", request.method)),
            error_category: HttpErrorCategory::Other,
            is_retryable: false,
        })?;

        let mut builder = self.client.request(method, &request.url);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        for (key, value) in &request.headers {
            builder = builder.header(key, value);
        }
        if let Some(token) = &request.bearer_token {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = &request.json_body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| HttpRequestFailed {
            status_code: None,
            url: request.url.clone(),
            body: Value::String(e.to_string()),
            error_category: HttpErrorCategory::Transport,
            is_retryable: true,
        })?;

        let status = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();
        let body = serde_json::from_str(&text).unwrap_or(Value::String(text));

        if (200..300).contains(&status) {
            return Ok(HttpResponse {
                status_code: status,
                body,
            });
        }

        let category = HttpErrorCategory::from_status(status);
        Err(HttpRequestFailed {
            status_code: Some(status),
            url: request.url.clone(),
            body,
            error_category: category,
            is_retryable: category.is_retryable(),
        })
    }
}

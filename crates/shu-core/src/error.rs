// Error types for the plugin runtime
//
// Policy denials (quota / rate / concurrency) are typed errors so the outer
// HTTP layer can render them as 429 responses with standard rate-limit
// headers. Everything that happens *inside* a plugin call is materialized
// into a PluginResult instead and never surfaces as an error from the
// executor.

use std::collections::HashMap;

use thiserror::Error;

/// Result type alias for core runtime operations
pub type Result<T> = std::result::Result<T, CoreError>;

/// Quota window that was exhausted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaPeriod {
    Daily,
    Monthly,
}

impl QuotaPeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuotaPeriod::Daily => "daily",
            QuotaPeriod::Monthly => "monthly",
        }
    }
}

impl std::fmt::Display for QuotaPeriod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can escape the executor and the stores
#[derive(Debug, Error)]
pub enum CoreError {
    /// Per-user/per-plugin token bucket denied the call
    #[error("rate limited, retry after {retry_after}s")]
    RateLimited {
        retry_after: u64,
        headers: HashMap<String, String>,
    },

    /// Shared provider token bucket denied the call
    #[error("provider '{provider}' rate limited, retry after {retry_after}s")]
    ProviderRateLimited {
        provider: String,
        retry_after: u64,
        headers: HashMap<String, String>,
    },

    /// Provider concurrency cap reached
    #[error("provider '{provider}' concurrency limit reached")]
    ProviderConcurrencyLimited {
        provider: String,
        headers: HashMap<String, String>,
    },

    /// Daily or monthly quota exhausted
    #[error("{period} quota exceeded, resets in {reset_in}s")]
    QuotaExceeded {
        period: QuotaPeriod,
        reset_in: u64,
        headers: HashMap<String, String>,
    },

    /// Input params violated the plugin's input schema
    #[error("validation error: {0}")]
    Validation(String),

    /// Plugin returned success data violating its output schema
    #[error("output validation error: {0}")]
    OutputValidation(String),

    /// Misconfiguration (missing keys, undecryptable secrets, bad manifests)
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Backing store failure
    #[error("store error: {0}")]
    Store(String),

    /// Provider API error surfaced by the stream loop
    #[error("provider error: {0}")]
    Provider(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl CoreError {
    /// Create a store error
    pub fn store(msg: impl Into<String>) -> Self {
        CoreError::Store(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        CoreError::Configuration(msg.into())
    }

    /// Create a provider error
    pub fn provider(msg: impl Into<String>) -> Self {
        CoreError::Provider(msg.into())
    }

    /// True for quota/rate/concurrency denials that must propagate to the
    /// caller instead of being folded into a PluginResult.
    pub fn is_policy_denial(&self) -> bool {
        matches!(
            self,
            CoreError::RateLimited { .. }
                | CoreError::ProviderRateLimited { .. }
                | CoreError::ProviderConcurrencyLimited { .. }
                | CoreError::QuotaExceeded { .. }
        )
    }

    /// Taxonomy code for structured error surfaces
    pub fn error_code(&self) -> &'static str {
        match self {
            CoreError::RateLimited { .. } => "rate_limited",
            CoreError::ProviderRateLimited { .. } => "provider_rate_limited",
            CoreError::ProviderConcurrencyLimited { .. } => "provider_concurrency_limited",
            CoreError::QuotaExceeded { .. } => "quota_exceeded",
            CoreError::Validation(_) => "validation_error",
            CoreError::OutputValidation(_) => "output_validation_error",
            CoreError::Configuration(_) => "configuration_error",
            CoreError::Store(_) => "store_error",
            CoreError::Provider(_) => "provider_error",
            CoreError::Internal(_) => "internal_error",
        }
    }

    /// HTTP status the outer layer should render this error as
    pub fn status_code(&self) -> u16 {
        match self {
            CoreError::RateLimited { .. }
            | CoreError::ProviderRateLimited { .. }
            | CoreError::ProviderConcurrencyLimited { .. }
            | CoreError::QuotaExceeded { .. } => 429,
            CoreError::Validation(_) => 422,
            _ => 500,
        }
    }

    /// Rate-limit response headers carried by policy denials
    pub fn headers(&self) -> Option<&HashMap<String, String>> {
        match self {
            CoreError::RateLimited { headers, .. }
            | CoreError::ProviderRateLimited { headers, .. }
            | CoreError::ProviderConcurrencyLimited { headers, .. }
            | CoreError::QuotaExceeded { headers, .. } => Some(headers),
            _ => None,
        }
    }

    /// Structured detail payload matching the wire taxonomy
    pub fn detail(&self) -> serde_json::Value {
        match self {
            CoreError::RateLimited { retry_after, .. } => serde_json::json!({
                "error": "rate_limited",
                "retry_after": retry_after,
            }),
            CoreError::ProviderRateLimited {
                provider,
                retry_after,
                ..
            } => serde_json::json!({
                "error": "provider_rate_limited",
                "provider": provider,
                "retry_after": retry_after,
            }),
            CoreError::ProviderConcurrencyLimited { provider, .. } => serde_json::json!({
                "error": "provider_concurrency_limited",
                "provider": provider,
            }),
            CoreError::QuotaExceeded {
                period, reset_in, ..
            } => serde_json::json!({
                "error": "quota_exceeded",
                "period": period.as_str(),
                "reset_in": reset_in,
            }),
            CoreError::Validation(msg) => serde_json::json!({
                "error": "validation_error",
                "message": msg,
            }),
            CoreError::OutputValidation(msg) => serde_json::json!({
                "error": "output_validation_error",
                "message": msg,
            }),
            other => serde_json::json!({
                "error": other.error_code(),
                "message": other.to_string(),
            }),
        }
    }
}

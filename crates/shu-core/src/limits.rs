// Per-plugin limit overrides and effective-limit resolution
//
// PluginLimits rides on the persisted definition row; EffectiveLimits merges
// those overrides over the global defaults for one execution.

use serde::{Deserialize, Serialize};

use crate::settings::Settings;

/// Optional limit overrides stored on a plugin definition
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PluginLimits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit_user_requests: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit_user_period: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota_daily_requests: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota_monthly_requests: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_rpm: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_window_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_concurrency: Option<u64>,
}

/// Limits in force for a single execution (overrides merged over defaults)
#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveLimits {
    pub daily_quota: u64,
    pub monthly_quota: u64,
    pub user_requests: u64,
    pub user_period_seconds: u64,
    pub provider_name: Option<String>,
    pub provider_rpm: u64,
    pub provider_window_seconds: u64,
    pub provider_concurrency: u64,
}

impl EffectiveLimits {
    /// Merge per-plugin overrides over the global defaults.
    pub fn resolve(limits: Option<&PluginLimits>, settings: &Settings) -> Self {
        let limits = limits.cloned().unwrap_or_default();
        let provider_name = limits
            .provider_name
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty());
        Self {
            daily_quota: limits
                .quota_daily_requests
                .unwrap_or(settings.plugin_quota_daily_requests_default),
            monthly_quota: limits
                .quota_monthly_requests
                .unwrap_or(settings.plugin_quota_monthly_requests_default),
            user_requests: limits
                .rate_limit_user_requests
                .unwrap_or(settings.rate_limit_user_requests)
                .max(1),
            user_period_seconds: limits
                .rate_limit_user_period
                .unwrap_or(settings.rate_limit_user_period)
                .max(1),
            provider_name,
            provider_rpm: limits.provider_rpm.unwrap_or(0),
            provider_window_seconds: limits.provider_window_seconds.unwrap_or(60).max(1),
            provider_concurrency: limits.provider_concurrency.unwrap_or(0),
        }
    }

    /// Refill rate for the per-user bucket: ceil(requests / period)
    pub fn user_refill_per_second(&self) -> u64 {
        self.user_requests.div_ceil(self.user_period_seconds).max(1)
    }

    /// Refill rate for the provider bucket
    pub fn provider_refill_per_second(&self) -> u64 {
        self.provider_rpm
            .div_ceil(self.provider_window_seconds)
            .max(1)
    }
}

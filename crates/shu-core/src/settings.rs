// Runtime Settings
//
// Every knob that changes core behavior, loaded from the environment with
// code defaults. Binaries call dotenvy before Settings::from_env so .env
// files work in development.

use std::collections::HashSet;
use std::path::PathBuf;

/// Core runtime configuration
#[derive(Debug, Clone)]
pub struct Settings {
    /// Directory scanned for plugin sub-directories with manifests
    pub plugins_root: PathBuf,
    /// Master switch for all limiters (rate, provider rate, concurrency)
    pub enable_rate_limiting: bool,
    /// Default per-user token bucket: requests per period
    pub rate_limit_user_requests: u64,
    /// Default per-user token bucket: period seconds
    pub rate_limit_user_period: u64,
    /// Default daily quota (0 disables)
    pub plugin_quota_daily_requests_default: u64,
    /// Default monthly quota (0 disables)
    pub plugin_quota_monthly_requests_default: u64,
    /// Serialized result byte cap (0 disables)
    pub plugin_exec_output_max_bytes: usize,
    /// Wall-clock limit for a single plugin call, seconds
    pub plugin_exec_timeout_seconds: u64,
    /// Root directory attachments may be read from
    pub attachment_storage_dir: PathBuf,
    /// Feed params cleared after the first COMPLETED run
    pub one_shot_feed_params: HashSet<String>,
    /// Ceiling on tool-call rounds within one turn
    pub max_tool_calls: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            plugins_root: PathBuf::from("plugins"),
            enable_rate_limiting: true,
            rate_limit_user_requests: 60,
            rate_limit_user_period: 60,
            plugin_quota_daily_requests_default: 0,
            plugin_quota_monthly_requests_default: 0,
            plugin_exec_output_max_bytes: 262_144,
            plugin_exec_timeout_seconds: 120,
            attachment_storage_dir: PathBuf::from("data/attachments"),
            one_shot_feed_params: ["reset_cursor".to_string()].into_iter().collect(),
            max_tool_calls: 16,
        }
    }
}

impl Settings {
    /// Load settings from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Settings::default();
        Self {
            plugins_root: env_path("SHU_PLUGINS_ROOT", defaults.plugins_root),
            enable_rate_limiting: env_bool("SHU_ENABLE_RATE_LIMITING", true),
            rate_limit_user_requests: env_u64(
                "SHU_RATE_LIMIT_USER_REQUESTS",
                defaults.rate_limit_user_requests,
            ),
            rate_limit_user_period: env_u64(
                "SHU_RATE_LIMIT_USER_PERIOD",
                defaults.rate_limit_user_period,
            ),
            plugin_quota_daily_requests_default: env_u64(
                "SHU_PLUGIN_QUOTA_DAILY_REQUESTS_DEFAULT",
                defaults.plugin_quota_daily_requests_default,
            ),
            plugin_quota_monthly_requests_default: env_u64(
                "SHU_PLUGIN_QUOTA_MONTHLY_REQUESTS_DEFAULT",
                defaults.plugin_quota_monthly_requests_default,
            ),
            plugin_exec_output_max_bytes: env_u64(
                "SHU_PLUGIN_EXEC_OUTPUT_MAX_BYTES",
                defaults.plugin_exec_output_max_bytes as u64,
            ) as usize,
            plugin_exec_timeout_seconds: env_u64(
                "SHU_PLUGIN_EXEC_TIMEOUT_SECONDS",
                defaults.plugin_exec_timeout_seconds,
            ),
            attachment_storage_dir: env_path(
                "SHU_ATTACHMENT_STORAGE_DIR",
                defaults.attachment_storage_dir,
            ),
            one_shot_feed_params: defaults.one_shot_feed_params,
            max_tool_calls: env_u64("SHU_MAX_TOOL_CALLS", defaults.max_tool_calls as u64) as u32,
        }
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"),
        Err(_) => default,
    }
}

fn env_path(key: &str, default: PathBuf) -> PathBuf {
    std::env::var(key).map(PathBuf::from).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let s = Settings::default();
        assert!(s.enable_rate_limiting);
        assert_eq!(s.rate_limit_user_requests, 60);
        assert!(s.one_shot_feed_params.contains("reset_cursor"));
        assert!(s.plugin_exec_output_max_bytes > 0);
    }
}

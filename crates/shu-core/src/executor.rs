// Plugin Executor - the policy chokepoint
//
// Every plugin call, whether it comes from the LLM tool-call loop, a
// scheduled feed, or an ad-hoc invocation, goes through Executor::execute.
// The protocol, in order: host-overlay extraction, effective limits, quota,
// per-user rate, provider rate, provider concurrency, input validation,
// op-scoped auth derivation, schedule-id threading, host construction,
// timeout-bounded execution, output validation, error mapping, concurrency
// release.
//
// Policy denials are typed errors (rendered as 429 upstream). Everything
// that happens inside the plugin is folded into a PluginResult and never
// escapes as an exception.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::capabilities::{make_host, CapabilityDenied, HostContext, HostServices, HttpRequestFailed};
use crate::counters::{
    concurrency_key, daily_quota_key, monthly_quota_key, seconds_until_end_of_day,
    seconds_until_next_month, CounterStore, TokenBucketRateLimiter,
};
use crate::error::{CoreError, QuotaPeriod, Result};
use crate::limits::{EffectiveLimits, PluginLimits};
use crate::manifest::AuthMode;
use crate::plugin::{ExecuteContext, LoadedPlugin, PluginResult};
use crate::schema;
use crate::settings::Settings;
use crate::traits::ProviderIdentity;

const USER_BUCKET_NAMESPACE: &str = "rl:plugin:user";
const PROVIDER_BUCKET_NAMESPACE: &str = "rl:plugin:prov";
const CONCURRENCY_TTL: Duration = Duration::from_secs(30);

/// Everything the executor needs to know about one call
#[derive(Debug, Clone)]
pub struct ExecuteRequest {
    pub user_id: String,
    pub user_email: Option<String>,
    pub agent_key: Option<String>,
    pub params: Value,
    pub limits: Option<PluginLimits>,
    pub provider_identities: HashMap<String, Vec<ProviderIdentity>>,
}

impl ExecuteRequest {
    pub fn new(user_id: impl Into<String>, params: Value) -> Self {
        Self {
            user_id: user_id.into(),
            user_email: None,
            agent_key: None,
            params,
            limits: None,
            provider_identities: HashMap::new(),
        }
    }
}

/// Auth requirement resolved for a call: provider plus mode/subject/scopes
#[derive(Debug, Clone, PartialEq)]
pub struct AuthRequirement {
    pub provider: String,
    pub mode: Option<AuthMode>,
    pub subject: Option<String>,
    pub scopes: Vec<String>,
}

/// Resolve `(provider, mode, subject, scopes)` for the call's op.
///
/// Precedence: explicit per-request param > manifest op_auth default.
/// (Feed-stored params arrive as request params, so they sit in the middle
/// of the chain naturally.) Returns None when the op declares no auth.
pub fn resolve_auth_requirements(
    plugin: &LoadedPlugin,
    params: &Value,
) -> Option<AuthRequirement> {
    let op = params
        .get("op")
        .and_then(Value::as_str)
        .map(|s| s.to_ascii_lowercase())
        .unwrap_or_default();
    let op_auth = plugin.op_auth().get(&op)?;
    let provider = op_auth.provider.trim().to_ascii_lowercase();
    if provider.is_empty() {
        return None;
    }

    let explicit_mode = params
        .get("auth_mode")
        .and_then(Value::as_str)
        .and_then(AuthMode::parse);
    let mode = explicit_mode.or(op_auth.mode);

    let explicit_subject = params
        .get("impersonate_email")
        .or_else(|| params.get("auth_subject"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    Some(AuthRequirement {
        provider,
        mode,
        subject: explicit_subject,
        scopes: op_auth.scopes.clone(),
    })
}

pub struct Executor {
    settings: Settings,
    counters: Arc<dyn CounterStore>,
    services: HostServices,
}

impl Executor {
    pub fn new(settings: Settings, counters: Arc<dyn CounterStore>, services: HostServices) -> Self {
        Self {
            settings,
            counters,
            services,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Execute one plugin call under the full policy protocol.
    pub async fn execute(
        &self,
        plugin: &LoadedPlugin,
        mut request: ExecuteRequest,
    ) -> Result<PluginResult> {
        let started = Instant::now();

        // Step 1: split the reserved __host overlay out of plugin-visible params
        let (mut params, mut overlay) = split_host_overlay(std::mem::take(&mut request.params));

        // Step 2: effective limits (per-plugin overrides over defaults)
        let limits = EffectiveLimits::resolve(request.limits.as_ref(), &self.settings);
        let bucket = format!(
            "{}:{}:{}",
            plugin.name(),
            plugin.version(),
            request.user_id
        );

        // Step 3: quotas (daily / monthly)
        self.enforce_quotas(&bucket, &limits).await?;

        // Step 4: per-user token bucket
        if self.settings.enable_rate_limiting {
            let limiter = TokenBucketRateLimiter::new(self.counters.as_ref(), USER_BUCKET_NAMESPACE);
            let decision = limiter
                .check(
                    &bucket,
                    1,
                    limits.user_requests,
                    limits.user_refill_per_second(),
                )
                .await?;
            debug!(
                bucket = %bucket,
                capacity = limits.user_requests,
                allowed = decision.allowed,
                "Rate limit check"
            );
            if !decision.allowed {
                return Err(CoreError::RateLimited {
                    retry_after: decision.retry_after_seconds,
                    headers: decision.to_headers(),
                });
            }
        }

        // Step 5: provider-level RPM cap (shared across plugins)
        if self.settings.enable_rate_limiting {
            if let Some(provider) = limits.provider_name.as_deref() {
                if limits.provider_rpm > 0 {
                    let limiter =
                        TokenBucketRateLimiter::new(self.counters.as_ref(), PROVIDER_BUCKET_NAMESPACE);
                    let decision = limiter
                        .check(
                            provider,
                            1,
                            limits.provider_rpm,
                            limits.provider_refill_per_second(),
                        )
                        .await?;
                    if !decision.allowed {
                        return Err(CoreError::ProviderRateLimited {
                            provider: provider.to_string(),
                            retry_after: decision.retry_after_seconds,
                            headers: decision.to_headers(),
                        });
                    }
                }
            }
        }

        // Step 6: provider concurrency slot (short TTL self-heals after
        // worker death); released below on every exit path
        let concurrency_slot = self.acquire_concurrency(&limits).await?;

        let result = self
            .execute_inner(plugin, &request, &mut params, &mut overlay)
            .await;

        if let Some(provider) = concurrency_slot {
            if let Err(e) = self.counters.decr(&concurrency_key(&provider)).await {
                warn!(provider = %provider, error = %e, "Failed to release concurrency slot");
            }
        }

        let outcome = match &result {
            Ok(r) => r.status,
            Err(_) => crate::plugin::PluginStatus::Error,
        };
        info!(
            plugin = plugin.name(),
            user_id = %request.user_id,
            duration_ms = started.elapsed().as_millis() as u64,
            outcome = ?outcome,
            "Plugin execution finished"
        );

        result
    }

    /// Steps 7-12: validation, auth derivation, host build, execution,
    /// output checks, error mapping.
    async fn execute_inner(
        &self,
        plugin: &LoadedPlugin,
        request: &ExecuteRequest,
        params: &mut Value,
        overlay: &mut Value,
    ) -> Result<PluginResult> {
        // Step 7: input validation
        if let Some(input_schema) = plugin.input_schema() {
            schema::validate(&input_schema, params).map_err(CoreError::Validation)?;
        }

        // Step 8: op-scoped auth -> host overlay (never overwriting
        // caller-provided values)
        if let Some(requirement) = resolve_auth_requirements(plugin, params) {
            let section = auth_section(overlay, &requirement.provider);
            if !requirement.scopes.is_empty() && section.get("scopes").is_none() {
                section.insert("scopes".to_string(), json!(requirement.scopes));
            }
            if let Some(mode) = requirement.mode {
                section
                    .entry("mode".to_string())
                    .or_insert_with(|| json!(mode.as_str()));
            }
            if let Some(subject) = requirement.subject {
                section
                    .entry("subject".to_string())
                    .or_insert_with(|| json!(subject));
            }
        }

        // Step 9: thread the schedule id for the cursor capability
        if let Some(sid) = params.get("__schedule_id").and_then(Value::as_str) {
            let exec = ensure_object(overlay, "exec");
            exec.entry("schedule_id".to_string())
                .or_insert_with(|| json!(sid));
        }

        // Step 10: build the host with the manifest's capability allow-list
        let context = HostContext::parse(overlay);
        let host = make_host(
            &self.services,
            plugin.name(),
            &request.user_id,
            request.user_email.as_deref(),
            plugin.capabilities(),
            request.provider_identities.clone(),
            context,
        );
        let ctx = ExecuteContext::new(request.user_id.clone(), request.agent_key.clone());

        // Step 11: execute under the wall clock
        let timeout = Duration::from_secs(self.settings.plugin_exec_timeout_seconds.max(1));
        let executed =
            match tokio::time::timeout(timeout, plugin.execute(params.clone(), &ctx, &host)).await
            {
                Ok(executed) => executed,
                Err(_) => {
                    warn!(
                        plugin = plugin.name(),
                        timeout_s = timeout.as_secs(),
                        "Plugin execution timed out"
                    );
                    return Ok(PluginResult::timeout(format!(
                        "execution exceeded {}s",
                        timeout.as_secs()
                    )));
                }
            };

        let result = match executed {
            Ok(result) => {
                // Output schema applies to success payloads only
                if result.is_success() {
                    if let Some(output_schema) = plugin.output_schema() {
                        let data = result.data.clone().unwrap_or(Value::Null);
                        schema::validate(&output_schema, &data)
                            .map_err(CoreError::OutputValidation)?;
                    }
                }
                result
            }
            // Step 12: map plugin failures into structured results
            Err(e) => self.map_plugin_error(plugin, e),
        };

        Ok(self.enforce_output_cap(result))
    }

    fn map_plugin_error(&self, plugin: &LoadedPlugin, error: anyhow::Error) -> PluginResult {
        if let Some(failure) = error.downcast_ref::<HttpRequestFailed>() {
            let provider_message = extract_provider_message(&failure.body);
            let status = failure.status_code.unwrap_or(0);
            return PluginResult::err_with_details(
                format!("Provider HTTP error ({status})"),
                "provider_error",
                json!({
                    "status_code": failure.status_code,
                    "url": failure.url,
                    "provider_message": provider_message,
                }),
            );
        }
        if let Some(denied) = error.downcast_ref::<CapabilityDenied>() {
            warn!(plugin = plugin.name(), capability = %denied.capability, "Capability denied");
            return PluginResult::err(denied.to_string(), "plugin_execute_error");
        }
        warn!(plugin = plugin.name(), error = %error, "Plugin failed");
        PluginResult::err(error.to_string(), "plugin_execute_error")
    }

    /// Serialized-result byte cap: a plugin must not be able to exhaust the
    /// LLM context with an unbounded blob.
    fn enforce_output_cap(&self, result: PluginResult) -> PluginResult {
        let max_bytes = self.settings.plugin_exec_output_max_bytes;
        if max_bytes == 0 {
            return result;
        }
        let size = serde_json::to_vec(&result.to_json())
            .map(|b| b.len())
            .unwrap_or(max_bytes + 1);
        if size > max_bytes {
            return PluginResult::err(
                format!("output exceeds max bytes ({size} > {max_bytes})"),
                "output_too_large",
            );
        }
        result
    }

    async fn enforce_quotas(&self, bucket: &str, limits: &EffectiveLimits) -> Result<()> {
        if limits.daily_quota == 0 && limits.monthly_quota == 0 {
            return Ok(());
        }
        let now = Utc::now();
        let reset_in_day = seconds_until_end_of_day(now);
        let reset_in_month = seconds_until_next_month(now);

        let day_key = daily_quota_key(bucket);
        let month_key = monthly_quota_key(bucket);
        let day_count = self.counters.get_counter(&day_key).await?.unwrap_or(0);
        let month_count = self.counters.get_counter(&month_key).await?.unwrap_or(0);

        if limits.daily_quota > 0 && day_count >= limits.daily_quota as i64 {
            return Err(CoreError::QuotaExceeded {
                period: QuotaPeriod::Daily,
                reset_in: reset_in_day,
                headers: quota_headers(limits.daily_quota, 86_400, reset_in_day),
            });
        }
        if limits.monthly_quota > 0 && month_count >= limits.monthly_quota as i64 {
            return Err(CoreError::QuotaExceeded {
                period: QuotaPeriod::Monthly,
                reset_in: reset_in_month,
                headers: quota_headers(limits.monthly_quota, reset_in_month + 1, reset_in_month),
            });
        }

        // Consume one from both windows; the expiry pins each counter to the
        // end of its period
        if limits.daily_quota > 0 {
            self.counters
                .set_counter(&day_key, day_count + 1, Duration::from_secs(reset_in_day))
                .await?;
        }
        if limits.monthly_quota > 0 {
            self.counters
                .set_counter(
                    &month_key,
                    month_count + 1,
                    Duration::from_secs(reset_in_month),
                )
                .await?;
        }
        Ok(())
    }

    /// Acquire a provider concurrency slot. Returns the provider name when a
    /// slot was taken (and must later be released).
    async fn acquire_concurrency(&self, limits: &EffectiveLimits) -> Result<Option<String>> {
        if !self.settings.enable_rate_limiting {
            return Ok(None);
        }
        let Some(provider) = limits.provider_name.as_deref() else {
            return Ok(None);
        };
        if limits.provider_concurrency == 0 {
            return Ok(None);
        }
        let key = concurrency_key(provider);
        let count = self.counters.incr(&key, CONCURRENCY_TTL).await?;
        if count > limits.provider_concurrency as i64 {
            self.counters.decr(&key).await?;
            let mut headers = HashMap::new();
            headers.insert("Retry-After".to_string(), "1".to_string());
            headers.insert(
                "X-Provider-Concurrency-Limit".to_string(),
                limits.provider_concurrency.to_string(),
            );
            return Err(CoreError::ProviderConcurrencyLimited {
                provider: provider.to_string(),
                headers,
            });
        }
        Ok(Some(provider.to_string()))
    }
}

/// Remove the reserved `__host` key from params, returning (params, overlay).
fn split_host_overlay(params: Value) -> (Value, Value) {
    let mut params = match params {
        Value::Object(map) => map,
        other => {
            return (other, json!({}));
        }
    };
    let overlay = match params.remove("__host") {
        Some(Value::Object(map)) => Value::Object(map),
        _ => json!({}),
    };
    (Value::Object(params), overlay)
}

fn ensure_object<'a>(value: &'a mut Value, key: &str) -> &'a mut Map<String, Value> {
    if !value.is_object() {
        *value = json!({});
    }
    let map = value.as_object_mut().unwrap();
    let entry = map.entry(key.to_string()).or_insert_with(|| json!({}));
    if !entry.is_object() {
        *entry = json!({});
    }
    entry.as_object_mut().unwrap()
}

fn auth_section<'a>(overlay: &'a mut Value, provider: &str) -> &'a mut Map<String, Value> {
    let auth = ensure_object(overlay, "auth");
    let entry = auth.entry(provider.to_string()).or_insert_with(|| json!({}));
    if !entry.is_object() {
        *entry = json!({});
    }
    entry.as_object_mut().unwrap()
}

fn quota_headers(limit: u64, window: u64, reset_in: u64) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    headers.insert("Retry-After".to_string(), reset_in.to_string());
    headers.insert("RateLimit-Limit".to_string(), format!("{limit};w={window}"));
    headers.insert("RateLimit-Remaining".to_string(), "0".to_string());
    headers.insert("RateLimit-Reset".to_string(), reset_in.to_string());
    headers
}

/// Pull a human-usable message out of a provider error body.
fn extract_provider_message(body: &Value) -> String {
    if let Some(obj) = body.as_object() {
        for key in ["error_description", "error", "message"] {
            if let Some(v) = obj.get(key) {
                return match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
            }
        }
        return Value::Object(obj.clone()).to_string();
    }
    let s = body.to_string();
    s.chars().take(400).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn split_overlay_strips_reserved_key() {
        let (params, overlay) =
            split_host_overlay(json!({"op": "list", "__host": {"kb": {"knowledge_base_ids": ["kb-1"]}}}));
        assert!(params.get("__host").is_none());
        assert_eq!(params["op"], "list");
        assert_eq!(overlay["kb"]["knowledge_base_ids"][0], "kb-1");
    }

    #[test]
    fn split_overlay_tolerates_non_dict() {
        let (params, overlay) = split_host_overlay(json!({"op": "x", "__host": 42}));
        assert!(params.get("__host").is_none());
        assert_eq!(overlay, json!({}));
        let _ = params;
    }

    #[test]
    fn provider_message_prefers_error_description() {
        let body = json!({"error": "invalid_grant", "error_description": "Token expired"});
        assert_eq!(extract_provider_message(&body), "Token expired");
        let body = json!({"message": "boom"});
        assert_eq!(extract_provider_message(&body), "boom");
        let body = json!("plain text error");
        assert_eq!(extract_provider_message(&body), "\"plain text error\"");
    }

    #[test]
    fn quota_headers_have_standard_shape() {
        let headers = quota_headers(100, 86_400, 3600);
        assert_eq!(headers["RateLimit-Limit"], "100;w=86400");
        assert_eq!(headers["Retry-After"], "3600");
        assert_eq!(headers["RateLimit-Remaining"], "0");
    }
}

// Execution record driver
//
// Advances a single RUNNING execution record through the full lifecycle:
// feed gate, plugin resolution, per-plugin limits, auth + secrets
// preflight, executor call, output cap, and the feed updates that belong to
// a COMPLETED run (last_run_at bump + one-shot param clearing).
//
// The runner never writes: it returns a RunOutcome describing everything
// the caller must apply, so the caller keeps its own transaction and retry
// semantics. Policy denials raised by the executor propagate unchanged.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use shu_core::error::Result;
use shu_core::executor::resolve_auth_requirements;
use shu_core::manifest::AuthMode;
use shu_core::traits::{
    DefinitionStore, ExecutionOutcome, ExecutionStatus, FeedStore, PluginExecution, PluginFeed,
    ProviderIdentity, ProviderIdentityStore, SecretStore, SubscriptionGate, TokenBroker,
};
use shu_core::{ExecuteRequest, Executor, LoadedPlugin, PluginRegistry, Settings};

/// Feed fields to apply after a COMPLETED run
#[derive(Debug, Clone)]
pub struct FeedUpdates {
    pub feed_id: uuid::Uuid,
    pub last_run_at: chrono::DateTime<chrono::Utc>,
    /// Replacement params when one-shot keys were cleared
    pub params: Option<Value>,
}

/// Everything the caller must apply for one driven execution
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub outcome: ExecutionOutcome,
    /// Set when the run never reached the executor
    pub error_code: Option<String>,
    pub skipped: bool,
    pub feed_updates: Option<FeedUpdates>,
    /// The feed should be disabled (unresolvable plugin)
    pub disable_feed: Option<uuid::Uuid>,
}

impl RunOutcome {
    fn preflight_failure(error_code: &str) -> Self {
        let now = Utc::now();
        Self {
            outcome: ExecutionOutcome {
                status: ExecutionStatus::Failed,
                result: Some(json!({"status": "error", "error": error_code})),
                error: Some(error_code.to_string()),
                completed_at: now,
            },
            error_code: Some(error_code.to_string()),
            skipped: true,
            feed_updates: None,
            disable_feed: None,
        }
    }
}

pub struct ExecutionRunner {
    executor: Arc<Executor>,
    registry: Arc<PluginRegistry>,
    definitions: Arc<dyn DefinitionStore>,
    feeds: Arc<dyn FeedStore>,
    identities: Arc<dyn ProviderIdentityStore>,
    token_broker: Arc<dyn TokenBroker>,
    subscriptions: Arc<dyn SubscriptionGate>,
    secrets: Arc<dyn SecretStore>,
    settings: Settings,
}

impl ExecutionRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        executor: Arc<Executor>,
        registry: Arc<PluginRegistry>,
        definitions: Arc<dyn DefinitionStore>,
        feeds: Arc<dyn FeedStore>,
        identities: Arc<dyn ProviderIdentityStore>,
        token_broker: Arc<dyn TokenBroker>,
        subscriptions: Arc<dyn SubscriptionGate>,
        secrets: Arc<dyn SecretStore>,
        settings: Settings,
    ) -> Self {
        Self {
            executor,
            registry,
            definitions,
            feeds,
            identities,
            token_broker,
            subscriptions,
            secrets,
            settings,
        }
    }

    /// Drive one record (already RUNNING) to its outcome.
    ///
    /// Executor policy denials propagate as errors so the caller can apply
    /// its own retry policy; everything else lands in the RunOutcome.
    pub async fn run_record(&self, record: &PluginExecution) -> Result<RunOutcome> {
        // Load the associated feed once (gate + post-run updates)
        let feed: Option<PluginFeed> = match record.schedule_id {
            Some(schedule_id) => self.feeds.get_feed(schedule_id).await?,
            None => None,
        };

        // Step 1: disabled schedule
        if let Some(feed) = &feed {
            if !feed.enabled {
                return Ok(RunOutcome::preflight_failure("schedule_disabled"));
            }
        }

        // Step 2: resolve the plugin; auto-disable the feed on failure to
        // stop the schedule from failing forever
        let plugin = match self
            .registry
            .resolve(&record.plugin_name, self.definitions.as_ref())
            .await?
        {
            Some(plugin) => plugin,
            None => {
                let mut outcome = RunOutcome::preflight_failure("plugin_not_found");
                outcome.disable_feed = feed.as_ref().filter(|f| f.enabled).map(|f| f.id);
                return Ok(outcome);
            }
        };

        // Step 3: per-plugin limits from the definition row
        let limits = self
            .definitions
            .get_definition(&record.plugin_name)
            .await?
            .and_then(|d| d.limits);

        // Step 4: feed-op policy + identity resolution from params
        let mut eff_params = match record.params.clone() {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        if record.schedule_id.is_some() {
            match eff_params.get("op").and_then(Value::as_str) {
                None => {
                    // Feeds fall back to the manifest's default op
                    if let Some(op) = plugin.default_feed_op() {
                        eff_params.insert("op".to_string(), json!(op));
                    }
                }
                Some(op) => {
                    let allowed = plugin.allowed_feed_ops();
                    if !allowed.is_empty() && !allowed.iter().any(|a| a == op) {
                        return Ok(RunOutcome::preflight_failure("op_not_allowed"));
                    }
                }
            }
        }
        let params = Value::Object(eff_params.clone());
        let user_email = resolve_user_email(&params);

        // Step 5: provider identities map
        let provider_identities = self.identities_map(&record.user_id).await;

        // Step 6: auth preflight
        if let Some(code) = self.auth_preflight(record, &plugin, &params).await {
            return Ok(RunOutcome::preflight_failure(&code));
        }

        // Step 7: secrets preflight
        if let Some(code) = self.secrets_preflight(record, &plugin).await {
            return Ok(RunOutcome::preflight_failure(&code));
        }

        // Step 8: thread the schedule id
        if let Some(schedule_id) = record.schedule_id {
            eff_params.insert("__schedule_id".to_string(), json!(schedule_id.to_string()));
        }

        // Step 9: execute (policy denials propagate)
        let result = self
            .executor
            .execute(
                &plugin,
                ExecuteRequest {
                    user_id: record.user_id.clone(),
                    user_email,
                    agent_key: record.agent_key.clone(),
                    params: Value::Object(eff_params),
                    limits,
                    provider_identities,
                },
            )
            .await?;

        // Step 10: normalize + duplicate output cap (defense in depth)
        let payload = result.to_json();
        let now = Utc::now();
        let max_bytes = self.settings.plugin_exec_output_max_bytes;
        let payload_size = serde_json::to_vec(&payload).map(|b| b.len()).unwrap_or(0);
        if max_bytes > 0 && payload_size > max_bytes {
            return Ok(RunOutcome {
                outcome: ExecutionOutcome {
                    status: ExecutionStatus::Failed,
                    result: Some(json!({"status": "error", "error": "output_too_large"})),
                    error: Some(format!(
                        "output exceeds max bytes ({payload_size} > {max_bytes})"
                    )),
                    completed_at: now,
                },
                error_code: Some("output_too_large".to_string()),
                skipped: false,
                feed_updates: None,
                disable_feed: None,
            });
        }

        // Step 11: execution status from the result payload
        let succeeded = payload["status"] == "success";
        let status = if succeeded {
            ExecutionStatus::Completed
        } else {
            ExecutionStatus::Failed
        };
        let error = if succeeded {
            None
        } else {
            Some(match &payload["error"] {
                Value::String(s) => s.clone(),
                Value::Null => "unknown error".to_string(),
                other => other.to_string(),
            })
        };

        // Step 12: diagnostics
        if let Some(warnings) = payload["warnings"].as_array() {
            for warning in warnings {
                warn!(
                    plugin = %record.plugin_name,
                    exec_id = %record.id,
                    warning = %warning,
                    "Plugin diagnostic"
                );
            }
        }
        info!(
            plugin = %record.plugin_name,
            exec_id = %record.id,
            status = status.as_str(),
            "Execution record driven"
        );

        // Steps 13-14: feed updates on success only
        let feed_updates = match (&feed, succeeded) {
            (Some(feed), true) => Some(FeedUpdates {
                feed_id: feed.id,
                last_run_at: now,
                params: clear_one_shot_params(&feed.params, &self.settings),
            }),
            _ => None,
        };

        Ok(RunOutcome {
            outcome: ExecutionOutcome {
                status,
                result: Some(payload),
                error,
                completed_at: now,
            },
            error_code: None,
            skipped: false,
            feed_updates,
            disable_feed: None,
        })
    }

    async fn identities_map(&self, user_id: &str) -> HashMap<String, Vec<ProviderIdentity>> {
        match self.identities.identities_for_user(user_id).await {
            Ok(identities) => {
                let mut map: HashMap<String, Vec<ProviderIdentity>> = HashMap::new();
                for identity in identities {
                    map.entry(identity.provider_key.clone())
                        .or_default()
                        .push(identity);
                }
                map
            }
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Failed to load provider identities, proceeding with empty map");
                HashMap::new()
            }
        }
    }

    /// Per-mode auth checks before paying the execution cost. Returns the
    /// failure code, or None to proceed. Resolution errors default to allow;
    /// the inner host checks fail closed.
    async fn auth_preflight(
        &self,
        record: &PluginExecution,
        plugin: &LoadedPlugin,
        params: &Value,
    ) -> Option<String> {
        let requirement = resolve_auth_requirements(plugin, params)?;
        let mode = requirement.mode.unwrap_or(AuthMode::User);
        let scopes = requirement.scopes.clone();

        match mode {
            AuthMode::User => {
                // Subscription gate first: an existing subscription list
                // restricts which plugins may use this provider
                match self
                    .subscriptions
                    .subscribed_plugins(&record.user_id, &requirement.provider)
                    .await
                {
                    Ok(Some(subscribed)) if !subscribed.iter().any(|p| p == &record.plugin_name) => {
                        warn!(
                            user_id = %record.user_id,
                            provider = %requirement.provider,
                            plugin = %record.plugin_name,
                            "Subscription enforcement blocked execution"
                        );
                        return Some("subscription_required".to_string());
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "Subscription check failed, defaulting to allow");
                    }
                }
                match self
                    .token_broker
                    .user_token(&record.user_id, &requirement.provider, &scopes)
                    .await
                {
                    Ok(Some(_)) => None,
                    Ok(None) => Some("identity_required".to_string()),
                    Err(e) => {
                        warn!(error = %e, "User token preflight failed, defaulting to allow");
                        None
                    }
                }
            }
            AuthMode::DomainDelegate => {
                let Some(subject) = requirement.subject.filter(|s| !s.trim().is_empty()) else {
                    return Some("identity_required".to_string());
                };
                match self
                    .token_broker
                    .delegation_check(&requirement.provider, &scopes, &subject)
                    .await
                {
                    Ok(status) if status.ready => None,
                    Ok(_) => Some("identity_required".to_string()),
                    Err(e) => {
                        warn!(error = %e, "Delegation preflight failed, defaulting to allow");
                        None
                    }
                }
            }
            AuthMode::ServiceAccount => {
                match self
                    .token_broker
                    .service_account_token(&requirement.provider, &scopes, None)
                    .await
                {
                    Ok(_) => None,
                    Err(_) => Some("identity_required".to_string()),
                }
            }
        }
    }

    /// Missing required secrets fail before execution.
    async fn secrets_preflight(
        &self,
        record: &PluginExecution,
        plugin: &LoadedPlugin,
    ) -> Option<String> {
        for key in plugin.required_secrets() {
            match self
                .secrets
                .has_secret(&record.plugin_name, Some(&record.user_id), key)
                .await
            {
                Ok(true) => continue,
                Ok(false) => {
                    // Fall back to the plugin-wide secret
                    match self.secrets.has_secret(&record.plugin_name, None, key).await {
                        Ok(true) => continue,
                        Ok(false) => return Some("missing_secrets".to_string()),
                        Err(e) => {
                            warn!(error = %e, key = %key, "Secrets preflight failed unexpectedly");
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, key = %key, "Secrets preflight failed unexpectedly");
                }
            }
        }
        None
    }
}

/// The user email used for host identity, resolved from params.
fn resolve_user_email(params: &Value) -> Option<String> {
    if let Some(email) = params.get("user_email").and_then(Value::as_str) {
        return Some(email.to_string());
    }
    let mode = params
        .get("auth_mode")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_ascii_lowercase();
    if mode == "domain_delegate" {
        if let Some(email) = params.get("impersonate_email").and_then(Value::as_str) {
            return Some(email.to_string());
        }
    }
    None
}

/// Remove one-shot keys from the feed params. None when nothing changed,
/// Some(new_params) when the stored params must be rewritten.
fn clear_one_shot_params(params: &Value, settings: &Settings) -> Option<Value> {
    let map = params.as_object()?;
    let mut cleared = map.clone();
    let mut modified = false;
    for key in &settings.one_shot_feed_params {
        if cleared.remove(key).is_some() {
            modified = true;
        }
    }
    modified.then_some(Value::Object(cleared))
}

// ExecutorBroker - routes adapter tool calls through the plugin pipeline
//
// The adapter hands over (plugin, op, args); the broker resolves the plugin
// from the registry, loads its persisted limits, builds the identities map,
// and calls the executor. Whatever happens - success, plugin failure, or a
// policy denial - the LLM gets back one JSON string it can reason about.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::warn;

use crate::adapter::PluginBroker;
use crate::error::CoreError;
use crate::executor::{ExecuteRequest, Executor};
use crate::registry::PluginRegistry;
use crate::traits::{DefinitionStore, ProviderIdentity, ProviderIdentityStore};

pub struct ExecutorBroker {
    executor: Arc<Executor>,
    registry: Arc<PluginRegistry>,
    definitions: Arc<dyn DefinitionStore>,
    identities: Arc<dyn ProviderIdentityStore>,
    user_id: String,
    user_email: Option<String>,
}

impl ExecutorBroker {
    pub fn new(
        executor: Arc<Executor>,
        registry: Arc<PluginRegistry>,
        definitions: Arc<dyn DefinitionStore>,
        identities: Arc<dyn ProviderIdentityStore>,
        user_id: impl Into<String>,
        user_email: Option<String>,
    ) -> Self {
        Self {
            executor,
            registry,
            definitions,
            identities,
            user_id: user_id.into(),
            user_email,
        }
    }

    async fn identities_map(&self) -> HashMap<String, Vec<ProviderIdentity>> {
        match self.identities.identities_for_user(&self.user_id).await {
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
                warn!(user_id = %self.user_id, error = %e, "Failed to load provider identities");
                HashMap::new()
            }
        }
    }
}

fn error_json(code: &str, message: impl Into<String>) -> String {
    json!({
        "status": "error",
        "error": {"code": code, "message": message.into()},
    })
    .to_string()
}

#[async_trait]
impl PluginBroker for ExecutorBroker {
    async fn call_plugin(&self, plugin_name: &str, op: &str, args: Value) -> String {
        let mut args = match args {
            Value::Object(map) => Value::Object(map),
            other => json!({"value": other}),
        };
        if !op.is_empty() && args.get("op").is_none() {
            args["op"] = json!(op);
        }

        let plugin = match self.registry.resolve(plugin_name, self.definitions.as_ref()).await {
            Ok(Some(plugin)) => plugin,
            Ok(None) => {
                return error_json(
                    "plugin_not_found",
                    format!("Plugin '{plugin_name}' is not installed or not enabled."),
                );
            }
            Err(e) => return error_json("plugin_not_found", e.to_string()),
        };

        let limits = match self.definitions.get_definition(plugin_name).await {
            Ok(definition) => definition.and_then(|d| d.limits),
            Err(e) => {
                warn!(plugin = plugin_name, error = %e, "Failed to load plugin limits");
                None
            }
        };

        let request = ExecuteRequest {
            user_id: self.user_id.clone(),
            user_email: self.user_email.clone(),
            agent_key: None,
            params: args,
            limits,
            provider_identities: self.identities_map().await,
        };

        match self.executor.execute(&plugin, request).await {
            Ok(result) => result.to_json().to_string(),
            // Policy denials and validation failures become structured tool
            // results so the model can recover gracefully
            Err(e @ CoreError::RateLimited { .. })
            | Err(e @ CoreError::ProviderRateLimited { .. })
            | Err(e @ CoreError::ProviderConcurrencyLimited { .. })
            | Err(e @ CoreError::QuotaExceeded { .. })
            | Err(e @ CoreError::Validation(_))
            | Err(e @ CoreError::OutputValidation(_)) => {
                let mut detail = e.detail();
                let code = detail["error"].as_str().unwrap_or("error").to_string();
                detail["code"] = json!(code);
                let obj = detail.as_object_mut().unwrap();
                obj.remove("error");
                obj.entry("message".to_string())
                    .or_insert_with(|| json!(e.to_string()));
                json!({"status": "error", "error": detail}).to_string()
            }
            Err(e) => error_json("plugin_execute_error", e.to_string()),
        }
    }
}

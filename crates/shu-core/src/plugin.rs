// Plugin Contract
//
// The structural interface every plugin implements, plus the PluginResult
// envelope that flows back to callers and (JSON-serialized, verbatim) into
// LLM tool-result messages.
//
// Design decisions:
// - Plugins return anyhow::Result<PluginResult> so host failures propagate
//   with `?`; the executor downcasts known failure types when mapping errors
// - PluginResult serialization must stay stable - tool results embed it
// - Capability allow-list and op_auth come from the manifest and are attached
//   read-only at load time via LoadedPlugin

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::capabilities::Host;
use crate::chat::CallableTool;
use crate::manifest::{OpAuth, PluginManifest};

// ============================================================================
// PluginResult - Structured Return Value
// ============================================================================

/// Terminal status of a plugin call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginStatus {
    Success,
    Error,
    Timeout,
}

/// Structured error carried by non-success results
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PluginError {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub details: Value,
}

/// The structured return value of every plugin call.
///
/// `data` is only present on success; `error` only when not successful.
/// `warnings` surface as diagnostics, `citations` carry grounding references.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginResult {
    pub status: PluginStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<PluginError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warnings: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub citations: Option<Vec<Value>>,
}

impl PluginResult {
    /// Successful result with a data payload
    pub fn ok(data: Value) -> Self {
        Self {
            status: PluginStatus::Success,
            data: Some(data),
            error: None,
            warnings: None,
            citations: None,
        }
    }

    /// Error result with a taxonomy code and message
    pub fn err(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self::err_with_details(message, code, Value::Null)
    }

    /// Error result carrying structured details
    pub fn err_with_details(
        message: impl Into<String>,
        code: impl Into<String>,
        details: Value,
    ) -> Self {
        let code = code.into();
        Self {
            status: PluginStatus::Error,
            data: None,
            error: Some(PluginError {
                code: if code.is_empty() {
                    "plugin_error".to_string()
                } else {
                    code
                },
                message: message.into(),
                details,
            }),
            warnings: None,
            citations: None,
        }
    }

    /// Timeout result (wall clock elapsed)
    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            status: PluginStatus::Timeout,
            data: None,
            error: Some(PluginError {
                code: "timeout".to_string(),
                message: message.into(),
                details: Value::Null,
            }),
            warnings: None,
            citations: None,
        }
    }

    /// Attach warnings to the result
    pub fn with_warnings(mut self, warnings: Vec<String>) -> Self {
        self.warnings = Some(warnings);
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == PluginStatus::Success
    }

    /// Stable JSON serialization used for persistence and tool results
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| {
            serde_json::json!({
                "status": "error",
                "error": {"code": "serialization_error", "message": "unserializable result"},
            })
        })
    }
}

// ============================================================================
// Execution Context
// ============================================================================

/// Host-provided context handed to every plugin call
#[derive(Debug, Clone)]
pub struct ExecuteContext {
    pub user_id: String,
    pub agent_key: Option<String>,
}

impl ExecuteContext {
    pub fn new(user_id: impl Into<String>, agent_key: Option<String>) -> Self {
        Self {
            user_id: user_id.into(),
            agent_key,
        }
    }
}

// ============================================================================
// Plugin Trait
// ============================================================================

/// Trait every plugin implements.
///
/// `input_schema` must declare `properties.op.enum` with at least one value
/// (the op enum contract, enforced at load). `output_schema` - when present -
/// is validated against `data` on successful results.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Unique plugin name (must match the manifest)
    fn name(&self) -> &str;

    /// Plugin version string
    fn version(&self) -> &str;

    /// JSON schema for input params, if the plugin declares one
    fn input_schema(&self) -> Option<Value> {
        None
    }

    /// JSON schema for PluginResult.data on success, if declared
    fn output_schema(&self) -> Option<Value> {
        None
    }

    /// Execute one operation. Reach the outside world only through `host`.
    async fn execute(
        &self,
        params: Value,
        context: &ExecuteContext,
        host: &Host,
    ) -> anyhow::Result<PluginResult>;
}

// ============================================================================
// LoadedPlugin - Plugin + Manifest Metadata
// ============================================================================

/// A plugin instance with its manifest-derived metadata attached.
///
/// Constructed by the loader; the capability list and op_auth map are fixed
/// for the lifetime of the instance.
#[derive(Clone)]
pub struct LoadedPlugin {
    plugin: Arc<dyn Plugin>,
    capabilities: Arc<Vec<String>>,
    op_auth: Arc<HashMap<String, OpAuth>>,
    required_secrets: Arc<Vec<String>>,
    display_name: Option<String>,
    default_feed_op: Option<String>,
    allowed_feed_ops: Arc<Vec<String>>,
    chat_callable_ops: Arc<Vec<String>>,
}

impl LoadedPlugin {
    pub fn new(plugin: Arc<dyn Plugin>, manifest: &PluginManifest) -> Self {
        Self {
            plugin,
            capabilities: Arc::new(manifest.capabilities.clone()),
            op_auth: Arc::new(manifest.op_auth.clone()),
            required_secrets: Arc::new(manifest.required_secrets.clone()),
            display_name: manifest.display_name.clone(),
            default_feed_op: manifest.default_feed_op.clone(),
            allowed_feed_ops: Arc::new(manifest.allowed_feed_ops.clone()),
            chat_callable_ops: Arc::new(manifest.chat_callable_ops.clone()),
        }
    }

    pub fn name(&self) -> &str {
        self.plugin.name()
    }

    pub fn version(&self) -> &str {
        self.plugin.version()
    }

    pub fn input_schema(&self) -> Option<Value> {
        self.plugin.input_schema()
    }

    pub fn output_schema(&self) -> Option<Value> {
        self.plugin.output_schema()
    }

    pub fn capabilities(&self) -> &[String] {
        &self.capabilities
    }

    pub fn op_auth(&self) -> &HashMap<String, OpAuth> {
        &self.op_auth
    }

    pub fn required_secrets(&self) -> &[String] {
        &self.required_secrets
    }

    pub fn default_feed_op(&self) -> Option<&str> {
        self.default_feed_op.as_deref()
    }

    pub fn allowed_feed_ops(&self) -> &[String] {
        &self.allowed_feed_ops
    }

    pub fn inner(&self) -> &Arc<dyn Plugin> {
        &self.plugin
    }

    /// Ops declared in the input schema's op enum.
    pub fn declared_ops(&self) -> Vec<String> {
        self.input_schema()
            .as_ref()
            .and_then(|s| s.pointer("/properties/op/enum"))
            .and_then(Value::as_array)
            .map(|ops| {
                ops.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// CallableTool projections for a chat turn: one per op the manifest
    /// allows the LLM to call (all declared ops when unrestricted).
    pub fn callable_tools(&self) -> Vec<CallableTool> {
        let schema = self.input_schema();
        self.declared_ops()
            .into_iter()
            .filter(|op| {
                self.chat_callable_ops.is_empty() || self.chat_callable_ops.contains(op)
            })
            .map(|op| {
                let mut tool = CallableTool::new(self.name(), op);
                if let Some(schema) = &schema {
                    tool = tool.with_schema(schema.clone());
                }
                if let Some(label) = &self.display_name {
                    tool.display_label = Some(label.clone());
                }
                tool
            })
            .collect()
    }

    pub async fn execute(
        &self,
        params: Value,
        context: &ExecuteContext,
        host: &Host,
    ) -> anyhow::Result<PluginResult> {
        self.plugin.execute(params, context, host).await
    }
}

impl std::fmt::Debug for LoadedPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedPlugin")
            .field("name", &self.name())
            .field("version", &self.version())
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_result_serializes_without_error_field() {
        let result = PluginResult::ok(serde_json::json!({"items": []}));
        let json = result.to_json();
        assert_eq!(json["status"], "success");
        assert!(json.get("error").is_none());
        assert_eq!(json["data"]["items"], serde_json::json!([]));
    }

    #[test]
    fn err_result_defaults_code() {
        let result = PluginResult::err("boom", "");
        let json = result.to_json();
        assert_eq!(json["status"], "error");
        assert_eq!(json["error"]["code"], "plugin_error");
        assert_eq!(json["error"]["message"], "boom");
        assert!(json.get("data").is_none());
    }

    #[test]
    fn timeout_result_carries_code() {
        let result = PluginResult::timeout("wall clock elapsed");
        let json = result.to_json();
        assert_eq!(json["status"], "timeout");
        assert_eq!(json["error"]["code"], "timeout");
    }

    #[test]
    fn round_trips_through_serde() {
        let result = PluginResult::ok(serde_json::json!({"n": 1}))
            .with_warnings(vec!["partial window".to_string()]);
        let json = serde_json::to_string(&result).unwrap();
        let back: PluginResult = serde_json::from_str(&json).unwrap();
        assert!(back.is_success());
        assert_eq!(back.warnings.unwrap()[0], "partial window");
    }
}

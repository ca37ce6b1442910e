// Provider adapter framework
//
// An adapter encapsulates one provider API: request shaping, streaming event
// parsing, tool-call aggregation, attachment formatting, usage extraction.
// Adapters are constructed fresh per request from the AdapterRegistry and
// reach plugins only through the PluginBroker, which routes every call
// through the executor and returns the JSON-serialized PluginResult.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::chat::{Attachment, CallableTool, ChatContext};
use crate::error::{CoreError, Result};
use crate::provider::{ProviderCapabilities, ProviderInformation, ProviderStreamEvent};

// ============================================================================
// PluginBroker - the adapters' path into the executor
// ============================================================================

/// Routes tool calls from adapters into the plugin pipeline. The returned
/// string is the JSON-serialized PluginResult; policy denials are converted
/// to structured error JSON so the model can recover.
#[async_trait]
pub trait PluginBroker: Send + Sync {
    async fn call_plugin(&self, plugin_name: &str, op: &str, args: Value) -> String;
}

// ============================================================================
// Adapter context
// ============================================================================

/// Decrypted connection material for one provider row. Decryption happens
/// before construction; an undecryptable key never reaches an adapter.
#[derive(Debug, Clone, Default)]
pub struct ProviderCredentials {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    /// Free-form provider settings (from the provider row)
    pub settings: Value,
}

/// Per-request execution context passed to adapters.
#[derive(Clone)]
pub struct AdapterContext {
    pub credentials: ProviderCredentials,
    pub conversation_owner_id: Option<String>,
    /// KB scope for every tool call made during this request
    pub knowledge_base_ids: Vec<String>,
    broker: Arc<dyn PluginBroker>,
}

impl AdapterContext {
    pub fn new(
        credentials: ProviderCredentials,
        conversation_owner_id: Option<String>,
        knowledge_base_ids: Vec<String>,
        broker: Arc<dyn PluginBroker>,
    ) -> Self {
        Self {
            credentials,
            conversation_owner_id,
            knowledge_base_ids,
            broker,
        }
    }

    /// Invoke a plugin op and return the JSON-serialized result.
    ///
    /// Bound KB IDs are merged into `args.__host.kb.knowledge_base_ids`;
    /// any other `__host` keys the caller set are preserved.
    pub async fn call_plugin(&self, plugin_name: &str, op: &str, args: Value) -> String {
        let args = self.merge_kb_scope(args);
        info!(plugin = plugin_name, op = op, "Calling plugin from adapter");
        self.broker.call_plugin(plugin_name, op, args).await
    }

    fn merge_kb_scope(&self, args: Value) -> Value {
        if self.knowledge_base_ids.is_empty() {
            return args;
        }
        let mut args = match args {
            Value::Object(map) => map,
            other => {
                warn!("Non-object tool args; wrapping for KB scoping");
                let mut map = serde_json::Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        let mut host = match args.remove("__host") {
            Some(Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        };
        let mut kb = match host.remove("kb") {
            Some(Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        };
        kb.insert(
            "knowledge_base_ids".to_string(),
            json!(self.knowledge_base_ids),
        );
        host.insert("kb".to_string(), Value::Object(kb));
        args.insert("__host".to_string(), Value::Object(host));
        Value::Object(args)
    }
}

// ============================================================================
// ProviderAdapter trait
// ============================================================================

/// Contract every provider adapter implements.
///
/// Parsing methods take `&mut self` because streaming tool-call arguments
/// arrive in fragments that the adapter accumulates until the stream ends.
#[async_trait]
pub trait ProviderAdapter: Send {
    // Description
    fn information(&self) -> ProviderInformation;
    fn capabilities(&self) -> ProviderCapabilities;
    fn api_base_url(&self) -> String;
    fn chat_endpoint(&self) -> String;
    fn models_endpoint(&self) -> String;
    fn authorization_headers(&self) -> Vec<(String, String)>;

    /// Full request URL for one invocation. Most providers ignore the model
    /// here; Gemini embeds it (and the streaming mode) in the path.
    fn request_url(&self, _model: &str, _streaming: bool) -> String {
        format!("{}{}", self.api_base_url(), self.chat_endpoint())
    }

    /// Declarative map from generic parameter names to provider-specific
    /// JSON schema, so a uniform config layer can drive any provider.
    fn parameter_mapping(&self) -> Value {
        json!({})
    }

    /// True when the provider accepts native document parts (PDFs etc.)
    fn supports_native_documents(&self) -> bool {
        false
    }

    // Outbound payload shaping
    fn set_messages_in_payload(&self, context: &ChatContext, payload: Value) -> Result<Value>;
    fn inject_tool_payload(&self, tools: &[CallableTool], payload: Value) -> Result<Value>;

    fn inject_model_parameter(&self, model: &str, mut payload: Value) -> Result<Value> {
        payload["model"] = json!(model);
        Ok(payload)
    }

    fn inject_streaming_parameter(&self, should_stream: bool, mut payload: Value) -> Result<Value> {
        payload["stream"] = json!(should_stream);
        Ok(payload)
    }

    fn post_process_payload(&self, payload: Value) -> Result<Value> {
        Ok(payload)
    }

    // Inbound parsing
    /// Handle one streaming chunk; None when the chunk only updated
    /// internal accumulators.
    async fn handle_provider_event(&mut self, chunk: &Value) -> Result<Option<ProviderStreamEvent>>;

    /// Flush accumulators at end of stream. Tool calls are executed here
    /// (through the broker) and come back as one FunctionCall event.
    async fn finalize_provider_events(&mut self) -> Result<Vec<ProviderStreamEvent>>;

    /// Parse a non-streaming completion body.
    async fn handle_provider_completion(&mut self, data: &Value) -> Result<Vec<ProviderStreamEvent>>;
}

// ============================================================================
// Adapter registry
// ============================================================================

pub type AdapterFactory =
    Arc<dyn Fn(AdapterContext) -> Result<Box<dyn ProviderAdapter>> + Send + Sync>;

/// Process-global mapping from adapter name to constructor. Adapters
/// register at composition time; get() builds a fresh instance per request.
#[derive(Default, Clone)]
pub struct AdapterRegistry {
    factories: HashMap<String, AdapterFactory>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        factory: impl Fn(AdapterContext) -> Result<Box<dyn ProviderAdapter>> + Send + Sync + 'static,
    ) {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    pub fn get(&self, name: &str, context: AdapterContext) -> Result<Box<dyn ProviderAdapter>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| CoreError::config(format!("unknown provider adapter '{name}'")))?;
        factory(context)
    }
}

// ============================================================================
// Attachment reading (shared by adapters)
// ============================================================================

/// Reads attachment files with a path-traversal guard: the resolved path
/// must stay inside the configured storage directory and symlinks are
/// rejected.
#[derive(Debug, Clone)]
pub struct AttachmentReader {
    storage_dir: PathBuf,
}

impl AttachmentReader {
    pub fn new(storage_dir: impl Into<PathBuf>) -> Self {
        Self {
            storage_dir: storage_dir.into(),
        }
    }

    /// Read the attachment bytes as base64, or None when unreadable or
    /// outside the sandbox.
    pub fn read_base64(&self, attachment: &Attachment) -> Option<String> {
        let raw = attachment.storage_path.as_deref()?;
        let path = Path::new(raw);

        if path
            .symlink_metadata()
            .map(|m| m.file_type().is_symlink())
            .unwrap_or(false)
        {
            warn!(attachment = %attachment.id, "Symlink access blocked");
            return None;
        }

        let resolved = match path.canonicalize() {
            Ok(resolved) => resolved,
            Err(_) => {
                warn!(attachment = %attachment.id, "Attachment file not found");
                return None;
            }
        };
        let storage_dir = self
            .storage_dir
            .canonicalize()
            .unwrap_or_else(|_| self.storage_dir.clone());
        if !resolved.starts_with(&storage_dir) {
            warn!(attachment = %attachment.id, path = %resolved.display(), "Path traversal blocked");
            return None;
        }

        std::fs::read(&resolved).ok().map(|bytes| BASE64.encode(bytes))
    }

    /// data:mime;base64,... URI for vision parts
    pub fn data_uri(&self, attachment: &Attachment) -> Option<String> {
        let b64 = self.read_base64(attachment)?;
        Some(format!("data:{};base64,{}", attachment.mime_type, b64))
    }
}

/// Labeled text fallback used when native documents are unsupported.
pub fn attachment_text_fallback(attachment: &Attachment) -> Option<String> {
    let text = attachment.extracted_text.as_deref()?;
    Some(format!(
        "[Attached: {}]\n{}",
        attachment.original_filename, text
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::RecordingBroker;

    fn context_with_kbs(kb_ids: Vec<&str>) -> (AdapterContext, Arc<RecordingBroker>) {
        let broker = Arc::new(RecordingBroker::default());
        let ctx = AdapterContext::new(
            ProviderCredentials::default(),
            Some("user-1".to_string()),
            kb_ids.into_iter().map(str::to_string).collect(),
            broker.clone(),
        );
        (ctx, broker)
    }

    #[tokio::test]
    async fn kb_scope_merges_preserving_other_host_keys() {
        let (ctx, broker) = context_with_kbs(vec!["kb-1", "kb-2"]);
        ctx.call_plugin(
            "kb_search",
            "search",
            json!({"op": "search", "__host": {"auth": {"google": {"mode": "user"}}}}),
        )
        .await;

        let calls = broker.calls();
        let args = &calls[0].2;
        assert_eq!(args["__host"]["kb"]["knowledge_base_ids"], json!(["kb-1", "kb-2"]));
        assert_eq!(args["__host"]["auth"]["google"]["mode"], "user");
        assert_eq!(args["op"], "search");
    }

    #[tokio::test]
    async fn empty_kb_scope_leaves_args_untouched() {
        let (ctx, broker) = context_with_kbs(vec![]);
        ctx.call_plugin("p", "op", json!({"op": "op"})).await;
        assert!(broker.calls()[0].2.get("__host").is_none());
    }

    #[test]
    fn attachment_fallback_is_labeled() {
        let att = Attachment {
            id: "a1".to_string(),
            original_filename: "report.pdf".to_string(),
            mime_type: "application/pdf".to_string(),
            storage_path: None,
            extracted_text: Some("Q3 numbers".to_string()),
        };
        assert_eq!(
            attachment_text_fallback(&att).unwrap(),
            "[Attached: report.pdf]\nQ3 numbers"
        );
    }

    #[test]
    fn reader_blocks_paths_outside_storage_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = tmp.path().join("attachments");
        std::fs::create_dir_all(&storage).unwrap();
        let outside = tmp.path().join("secret.txt");
        std::fs::write(&outside, b"secret").unwrap();

        let reader = AttachmentReader::new(&storage);
        let att = Attachment {
            id: "a1".to_string(),
            original_filename: "secret.txt".to_string(),
            mime_type: "text/plain".to_string(),
            storage_path: Some(outside.to_string_lossy().to_string()),
            extracted_text: None,
        };
        assert!(reader.read_base64(&att).is_none());

        let inside = storage.join("ok.txt");
        std::fs::write(&inside, b"fine").unwrap();
        let att_ok = Attachment {
            storage_path: Some(inside.to_string_lossy().to_string()),
            ..att
        };
        assert!(reader.read_base64(&att_ok).is_some());
    }
}

// Gemini generateContent adapter
//
// Chunks carry candidates[0].content.parts with text and whole functionCall
// parts (no argument fragmenting). Tool results go back as functionResponse
// parts keyed by the tool name, the system prompt rides in
// system_instruction, and usage arrives in usageMetadata. Tool schemas are
// sanitized because Gemini rejects several JSON-schema keywords.

use async_trait::async_trait;
use serde_json::{json, Value};

use shu_core::{
    attachment_text_fallback, AdapterContext, AttachmentReader, CallableTool, ChatContext,
    ChatMessage, ChatRole, ProviderAdapter, ProviderCapabilities, ProviderInformation,
    ProviderStreamEvent, Result, ToolCallInstruction, Usage,
};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// Schema keywords Gemini's function declarations reject
const UNSUPPORTED_SCHEMA_KEYS: &[&str] = &["additionalProperties", "const", "default", "$schema"];

pub struct GeminiAdapter {
    context: AdapterContext,
    attachments: Option<AttachmentReader>,
    stream_content: Vec<String>,
    stream_function_calls: Vec<Value>,
    finished: bool,
    usage: Usage,
}

impl GeminiAdapter {
    pub fn new(context: AdapterContext) -> Self {
        Self {
            context,
            attachments: None,
            stream_content: Vec::new(),
            stream_function_calls: Vec::new(),
            finished: false,
            usage: Usage::default(),
        }
    }

    /// Enable native attachment parts, reading files under `storage_dir`.
    pub fn with_attachment_reader(mut self, reader: AttachmentReader) -> Self {
        self.attachments = Some(reader);
        self
    }

    fn extract_usage(&mut self, payload: &Value) {
        let usage = &payload["usageMetadata"];
        if !usage.is_object() {
            return;
        }
        let input = usage["promptTokenCount"].as_u64().unwrap_or(0);
        let output = usage["candidatesTokenCount"].as_u64().unwrap_or(0);
        let cached = usage["cachedContentTokenCount"].as_u64().unwrap_or(0);
        let reasoning = usage["thoughtsTokenCount"].as_u64().unwrap_or(0);
        let total = usage["totalTokenCount"].as_u64().unwrap_or(input + output);
        self.usage
            .add(&Usage::new(input, output, cached, reasoning, total));
    }

    fn tool_call_from_part(function_call: &Value) -> ToolCallInstruction {
        let name = function_call["name"].as_str().unwrap_or_default();
        let (plugin_name, operation) = CallableTool::parse_wire_name(name);
        let args = if function_call["args"].is_object() {
            function_call["args"].clone()
        } else {
            json!({})
        };
        ToolCallInstruction {
            plugin_name,
            operation,
            args,
        }
    }

    /// Execute the calls and compose the model functionCall message plus one
    /// user message of functionResponse parts keyed by tool name.
    async fn build_function_call_event(
        &mut self,
        function_calls: Vec<Value>,
    ) -> Result<ProviderStreamEvent> {
        let tool_calls: Vec<ToolCallInstruction> = function_calls
            .iter()
            .map(Self::tool_call_from_part)
            .collect();

        let call_parts: Vec<Value> = function_calls
            .iter()
            .map(|fc| json!({"functionCall": fc}))
            .collect();

        let mut response_parts = Vec::new();
        for (function_call, call) in function_calls.iter().zip(&tool_calls) {
            let output = self
                .context
                .call_plugin(&call.plugin_name, &call.operation, call.args.clone())
                .await;
            let response: Value =
                serde_json::from_str(&output).unwrap_or(Value::String(output));
            response_parts.push(json!({
                "functionResponse": {
                    "name": function_call["name"].as_str().unwrap_or_default(),
                    "response": {"result": response},
                }
            }));
        }

        let additional_messages = vec![
            ChatMessage::structured(
                ChatRole::Assistant,
                json!({"role": "model", "parts": call_parts}),
            ),
            ChatMessage::structured(
                ChatRole::User,
                json!({"role": "user", "parts": response_parts}),
            ),
        ];

        Ok(ProviderStreamEvent::FunctionCall {
            tool_calls,
            additional_messages,
            content: String::new(),
        })
    }

    fn attachment_parts(&self, message: &ChatMessage) -> Vec<Value> {
        let mut parts = Vec::new();
        for attachment in &message.attachments {
            // Gemini takes inlineData for any mimeType; fall back to the
            // extracted text when the file is unreadable
            if let Some(b64) = self
                .attachments
                .as_ref()
                .and_then(|reader| reader.read_base64(attachment))
            {
                parts.push(json!({
                    "inlineData": {"mimeType": attachment.mime_type, "data": b64}
                }));
            } else if let Some(text) = attachment_text_fallback(attachment) {
                parts.push(json!({"text": text}));
            }
        }
        parts
    }
}

#[async_trait]
impl ProviderAdapter for GeminiAdapter {
    fn information(&self) -> ProviderInformation {
        ProviderInformation {
            key: "gemini".to_string(),
            display_name: "Google Gemini".to_string(),
        }
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            streaming: true,
            tools: true,
            vision: true,
        }
    }

    fn api_base_url(&self) -> String {
        self.context
            .credentials
            .base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
    }

    fn chat_endpoint(&self) -> String {
        "/v1beta/models".to_string()
    }

    fn models_endpoint(&self) -> String {
        "/v1beta/models".to_string()
    }

    fn authorization_headers(&self) -> Vec<(String, String)> {
        match &self.context.credentials.api_key {
            Some(key) => vec![("x-goog-api-key".to_string(), key.clone())],
            None => Vec::new(),
        }
    }

    /// Model and streaming mode are path segments, not payload fields.
    fn request_url(&self, model: &str, streaming: bool) -> String {
        let method = if streaming {
            "streamGenerateContent?alt=sse"
        } else {
            "generateContent"
        };
        format!("{}/v1beta/models/{model}:{method}", self.api_base_url())
    }

    fn parameter_mapping(&self) -> Value {
        json!({
            "temperature": {"type": "number", "path": "generationConfig.temperature", "min": 0.0, "max": 2.0},
            "top_p": {"type": "number", "path": "generationConfig.topP", "min": 0.0, "max": 1.0},
            "max_tokens": {"type": "integer", "path": "generationConfig.maxOutputTokens", "min": 1},
            "reasoning": {"type": "integer", "path": "generationConfig.thinkingConfig.thinkingBudget", "min": 0},
            "safety_settings": {
                "type": "array",
                "path": "safetySettings",
                "label": "Safety settings",
            },
        })
    }

    fn supports_native_documents(&self) -> bool {
        true
    }

    fn set_messages_in_payload(&self, context: &ChatContext, mut payload: Value) -> Result<Value> {
        let mut contents = Vec::new();
        for message in &context.messages {
            // Round-trip messages already carry {role, parts}
            if message.content.get("parts").is_some() {
                contents.push(message.content.clone());
                continue;
            }
            let role = match message.role {
                ChatRole::Assistant => "model",
                _ => "user",
            };
            let mut parts = Vec::new();
            let text = message.content_text();
            if !text.is_empty() {
                parts.push(json!({"text": text}));
            }
            parts.extend(self.attachment_parts(message));
            if parts.is_empty() {
                continue;
            }
            contents.push(json!({"role": role, "parts": parts}));
        }
        payload["contents"] = Value::Array(contents);

        if let Some(prompt) = &context.system_prompt {
            payload["system_instruction"] = json!({"parts": [{"text": prompt}]});
        }
        Ok(payload)
    }

    fn inject_tool_payload(&self, tools: &[CallableTool], mut payload: Value) -> Result<Value> {
        if tools.is_empty() {
            return Ok(payload);
        }
        let declarations: Vec<Value> = tools
            .iter()
            .map(|tool| {
                json!({
                    "name": tool.wire_name(),
                    "description": tool.tool_description(),
                    "parameters": sanitize_schema(tool.pinned_schema()),
                })
            })
            .collect();
        payload["tools"] = json!([{"functionDeclarations": declarations}]);
        Ok(payload)
    }

    /// Streaming mode is selected by the URL; nothing to set in the payload.
    fn inject_streaming_parameter(&self, _should_stream: bool, payload: Value) -> Result<Value> {
        Ok(payload)
    }

    async fn handle_provider_event(&mut self, chunk: &Value) -> Result<Option<ProviderStreamEvent>> {
        self.extract_usage(chunk);

        let Some(candidate) = chunk["candidates"].as_array().and_then(|c| c.first()) else {
            return Ok(None);
        };
        if candidate["finishReason"].as_str() == Some("STOP") {
            self.finished = true;
        }

        let Some(parts) = candidate["content"]["parts"].as_array() else {
            return Ok(None);
        };
        for part in parts {
            if let Some(function_call) = part.get("functionCall") {
                self.stream_function_calls.push(function_call.clone());
            }
        }
        // One text part per chunk in practice; join if several arrive
        let text: String = parts
            .iter()
            .filter_map(|p| p["text"].as_str())
            .collect::<Vec<_>>()
            .join("");
        if !text.is_empty() {
            self.stream_content.push(text.clone());
            return Ok(Some(ProviderStreamEvent::ContentDelta(text)));
        }
        Ok(None)
    }

    async fn finalize_provider_events(&mut self) -> Result<Vec<ProviderStreamEvent>> {
        if !self.stream_function_calls.is_empty() {
            let calls = std::mem::take(&mut self.stream_function_calls);
            self.stream_content.clear();
            return Ok(vec![self.build_function_call_event(calls).await?]);
        }
        if self.finished {
            self.finished = false;
            let content = std::mem::take(&mut self.stream_content).join("");
            return Ok(vec![ProviderStreamEvent::FinalMessage {
                content,
                usage: self.usage,
            }]);
        }
        Ok(Vec::new())
    }

    async fn handle_provider_completion(&mut self, data: &Value) -> Result<Vec<ProviderStreamEvent>> {
        self.extract_usage(data);

        let Some(candidate) = data["candidates"].as_array().and_then(|c| c.first()) else {
            return Ok(vec![ProviderStreamEvent::Error(
                "no candidates in Gemini response".to_string(),
            )]);
        };
        let parts = candidate["content"]["parts"]
            .as_array()
            .cloned()
            .unwrap_or_default();

        let function_calls: Vec<Value> = parts
            .iter()
            .filter_map(|p| p.get("functionCall").cloned())
            .collect();
        if !function_calls.is_empty() {
            return Ok(vec![self.build_function_call_event(function_calls).await?]);
        }

        let content: String = parts
            .iter()
            .filter_map(|p| p["text"].as_str())
            .collect::<Vec<_>>()
            .join("");
        Ok(vec![ProviderStreamEvent::FinalMessage {
            content,
            usage: self.usage,
        }])
    }
}

/// Strip schema keywords Gemini rejects, recursively.
fn sanitize_schema(mut schema: Value) -> Value {
    fn walk(value: &mut Value) {
        match value {
            Value::Object(map) => {
                for key in UNSUPPORTED_SCHEMA_KEYS {
                    map.remove(*key);
                }
                for child in map.values_mut() {
                    walk(child);
                }
            }
            Value::Array(items) => {
                for item in items {
                    walk(item);
                }
            }
            _ => {}
        }
    }
    walk(&mut schema);
    schema
}

#[cfg(test)]
mod tests {
    use super::*;
    use shu_core::memory::RecordingBroker;
    use shu_core::ProviderCredentials;
    use std::sync::Arc;

    fn adapter() -> (GeminiAdapter, Arc<RecordingBroker>) {
        let broker = Arc::new(RecordingBroker::with_response(
            r#"{"status":"success","data":{"files":[]}}"#,
        ));
        let context = AdapterContext::new(
            ProviderCredentials {
                api_key: Some("AIza-test".to_string()),
                base_url: None,
                settings: json!({}),
            },
            Some("user-1".to_string()),
            vec![],
            broker.clone(),
        );
        (GeminiAdapter::new(context), broker)
    }

    #[test]
    fn url_embeds_model_and_mode() {
        let (adapter, _) = adapter();
        assert_eq!(
            adapter.request_url("gemini-2.0-flash", true),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.0-flash:streamGenerateContent?alt=sse"
        );
        assert_eq!(
            adapter.request_url("gemini-2.0-flash", false),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.0-flash:generateContent"
        );
    }

    #[test]
    fn schema_sanitizer_strips_rejected_keywords() {
        let tool = CallableTool::new("kb", "search").with_schema(json!({
            "type": "object",
            "additionalProperties": false,
            "properties": {"q": {"type": "string", "default": ""}},
        }));
        let sanitized = sanitize_schema(tool.pinned_schema());
        assert!(sanitized.get("additionalProperties").is_none());
        assert!(sanitized["properties"]["q"].get("default").is_none());
        assert!(sanitized["properties"]["op"].get("const").is_none());
        assert_eq!(sanitized["properties"]["op"]["enum"][0], "search");
    }

    #[tokio::test]
    async fn function_call_part_round_trips_by_name() {
        let (mut adapter, broker) = adapter();
        adapter
            .handle_provider_event(&json!({
                "candidates": [{"content": {"parts": [
                    {"functionCall": {"name": "gdrive_files__sync", "args": {"op": "sync"}}}
                ]}}],
            }))
            .await
            .unwrap();

        let events = adapter.finalize_provider_events().await.unwrap();
        let ProviderStreamEvent::FunctionCall {
            tool_calls,
            additional_messages,
            ..
        } = &events[0]
        else {
            panic!("expected function call");
        };
        assert_eq!(tool_calls[0].plugin_name, "gdrive_files");
        assert_eq!(tool_calls[0].operation, "sync");
        assert_eq!(broker.calls().len(), 1);

        // model functionCall message, then functionResponse keyed by name
        assert_eq!(additional_messages[0].content["role"], "model");
        let response_part = &additional_messages[1].content["parts"][0]["functionResponse"];
        assert_eq!(response_part["name"], "gdrive_files__sync");
        assert_eq!(response_part["response"]["result"]["status"], "success");
    }

    #[tokio::test]
    async fn stop_without_calls_is_final_with_usage() {
        let (mut adapter, _) = adapter();
        adapter
            .handle_provider_event(&json!({
                "candidates": [{"content": {"parts": [{"text": "All synced."}]}, "finishReason": "STOP"}],
                "usageMetadata": {"promptTokenCount": 8, "candidatesTokenCount": 3, "totalTokenCount": 11},
            }))
            .await
            .unwrap();
        let events = adapter.finalize_provider_events().await.unwrap();
        let ProviderStreamEvent::FinalMessage { content, usage } = &events[0] else {
            panic!("expected final message");
        };
        assert_eq!(content, "All synced.");
        assert_eq!(usage.total_tokens, 11);
    }

    #[test]
    fn system_prompt_becomes_system_instruction() {
        let (adapter, _) = adapter();
        let context = ChatContext::from_messages(vec![
            ChatMessage::system("Be accurate."),
            ChatMessage::user("sync my drive"),
        ]);
        let payload = adapter
            .set_messages_in_payload(&context, json!({}))
            .unwrap();
        assert_eq!(payload["system_instruction"]["parts"][0]["text"], "Be accurate.");
        assert_eq!(payload["contents"][0]["role"], "user");
        assert_eq!(payload["contents"][0]["parts"][0]["text"], "sync my drive");
    }
}

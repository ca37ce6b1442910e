// Chat-Completions adapter (OpenAI-compatible dialect)
//
// Tool-call arguments stream as index-keyed fragments that are merged until
// a finish_reason arrives. The same adapter serves every server speaking
// this dialect - xAI, Perplexity, Ollama, LM Studio, plain local endpoints -
// through base-URL and capability presets.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::{json, Value};

use shu_core::{
    AdapterContext, CallableTool, ChatContext, ChatMessage, ChatRole, ProviderAdapter,
    ProviderCapabilities, ProviderInformation, ProviderStreamEvent, Result, ToolCallInstruction,
    Usage,
};

/// Identity + defaults for one OpenAI-compatible server
#[derive(Debug, Clone)]
pub struct CompletionsProfile {
    pub key: &'static str,
    pub display_name: &'static str,
    pub default_base_url: &'static str,
    pub capabilities: ProviderCapabilities,
}

impl CompletionsProfile {
    pub fn openai() -> Self {
        Self {
            key: "openai_completions",
            display_name: "OpenAI (Chat Completions)",
            default_base_url: "https://api.openai.com",
            capabilities: ProviderCapabilities {
                streaming: true,
                tools: true,
                vision: true,
            },
        }
    }

    pub fn xai() -> Self {
        Self {
            key: "xai",
            display_name: "xAI",
            default_base_url: "https://api.x.ai",
            capabilities: ProviderCapabilities {
                streaming: true,
                tools: true,
                vision: true,
            },
        }
    }

    pub fn perplexity() -> Self {
        Self {
            key: "perplexity",
            display_name: "Perplexity",
            default_base_url: "https://api.perplexity.ai",
            capabilities: ProviderCapabilities {
                streaming: true,
                tools: false,
                vision: false,
            },
        }
    }

    pub fn ollama() -> Self {
        Self {
            key: "ollama",
            display_name: "Ollama",
            default_base_url: "http://localhost:11434",
            capabilities: ProviderCapabilities {
                streaming: true,
                tools: true,
                vision: false,
            },
        }
    }

    pub fn lmstudio() -> Self {
        Self {
            key: "lmstudio",
            display_name: "LM Studio",
            default_base_url: "http://localhost:1234",
            capabilities: ProviderCapabilities {
                streaming: true,
                tools: true,
                vision: false,
            },
        }
    }

    pub fn local() -> Self {
        Self {
            key: "local",
            display_name: "Local (OpenAI-compatible)",
            default_base_url: "http://localhost:8000",
            capabilities: ProviderCapabilities {
                streaming: true,
                tools: false,
                vision: false,
            },
        }
    }
}

pub struct CompletionsAdapter {
    context: AdapterContext,
    profile: CompletionsProfile,
    stream_content: Vec<String>,
    /// index -> partially merged tool_call object
    stream_tool_calls: BTreeMap<u64, Value>,
    finished: Option<String>,
    usage: Usage,
}

impl CompletionsAdapter {
    pub fn new(context: AdapterContext, profile: CompletionsProfile) -> Self {
        Self {
            context,
            profile,
            stream_content: Vec::new(),
            stream_tool_calls: BTreeMap::new(),
            finished: None,
            usage: Usage::default(),
        }
    }

    fn extract_usage(&mut self, usage: &Value) {
        let input = usage["prompt_tokens"].as_u64().unwrap_or(0);
        let output = usage["completion_tokens"].as_u64().unwrap_or(0);
        let cached = usage["prompt_tokens_details"]["cached_tokens"]
            .as_u64()
            .unwrap_or(0);
        let reasoning = usage["completion_tokens_details"]["reasoning_tokens"]
            .as_u64()
            .unwrap_or(0);
        let total = usage["total_tokens"].as_u64().unwrap_or(input + output);
        self.usage
            .add(&Usage::new(input, output, cached, reasoning, total));
    }

    /// Merge one streamed tool_call fragment into the index-keyed map.
    fn merge_tool_call_delta(&mut self, fragment: &Value) {
        let Some(index) = fragment["index"].as_u64() else {
            return;
        };
        let entry = self
            .stream_tool_calls
            .entry(index)
            .or_insert_with(|| json!({"type": "function", "function": {"name": "", "arguments": ""}}));

        if let Some(id) = fragment["id"].as_str() {
            entry["id"] = json!(id);
        }
        if let Some(name) = fragment["function"]["name"].as_str() {
            let current = entry["function"]["name"].as_str().unwrap_or_default();
            entry["function"]["name"] = json!(format!("{current}{name}"));
        }
        if let Some(arguments) = fragment["function"]["arguments"].as_str() {
            let current = entry["function"]["arguments"].as_str().unwrap_or_default();
            entry["function"]["arguments"] = json!(format!("{current}{arguments}"));
        }
    }

    fn tool_call_from_merged(call: &Value) -> ToolCallInstruction {
        let name = call["function"]["name"].as_str().unwrap_or_default();
        let (plugin_name, operation) = CallableTool::parse_wire_name(name);
        let args = call["function"]["arguments"]
            .as_str()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_else(|| json!({}));
        ToolCallInstruction {
            plugin_name,
            operation,
            args,
        }
    }

    /// Execute the merged calls and compose the assistant + tool messages.
    async fn build_function_call_event(
        &mut self,
        calls: Vec<Value>,
        content: String,
    ) -> Result<ProviderStreamEvent> {
        let tool_calls: Vec<ToolCallInstruction> =
            calls.iter().map(Self::tool_call_from_merged).collect();

        let assistant = ChatMessage::structured(
            ChatRole::Assistant,
            json!({
                "role": "assistant",
                "content": if content.is_empty() { Value::Null } else { json!(content) },
                "tool_calls": calls,
            }),
        );

        let mut additional = vec![assistant];
        for (call, instruction) in calls.iter().zip(&tool_calls) {
            let output = self
                .context
                .call_plugin(
                    &instruction.plugin_name,
                    &instruction.operation,
                    instruction.args.clone(),
                )
                .await;
            additional.push(ChatMessage::structured(
                ChatRole::Tool,
                json!({
                    "role": "tool",
                    "tool_call_id": call["id"].as_str().unwrap_or_default(),
                    "content": output,
                }),
            ));
        }

        Ok(ProviderStreamEvent::FunctionCall {
            tool_calls,
            additional_messages: additional,
            content: String::new(),
        })
    }

    fn message_to_wire(message: &ChatMessage) -> Value {
        // Round-trip messages carry a full wire object already
        if message.content.get("role").is_some() {
            return message.content.clone();
        }
        json!({
            "role": message.role.as_str(),
            "content": message.content,
        })
    }
}

#[async_trait]
impl ProviderAdapter for CompletionsAdapter {
    fn information(&self) -> ProviderInformation {
        ProviderInformation {
            key: self.profile.key.to_string(),
            display_name: self.profile.display_name.to_string(),
        }
    }

    fn capabilities(&self) -> ProviderCapabilities {
        self.profile.capabilities
    }

    fn api_base_url(&self) -> String {
        self.context
            .credentials
            .base_url
            .clone()
            .unwrap_or_else(|| self.profile.default_base_url.to_string())
    }

    fn chat_endpoint(&self) -> String {
        "/v1/chat/completions".to_string()
    }

    fn models_endpoint(&self) -> String {
        "/v1/models".to_string()
    }

    fn authorization_headers(&self) -> Vec<(String, String)> {
        match &self.context.credentials.api_key {
            Some(key) => vec![("Authorization".to_string(), format!("Bearer {key}"))],
            None => Vec::new(),
        }
    }

    fn parameter_mapping(&self) -> Value {
        json!({
            "temperature": {"type": "number", "path": "temperature", "min": 0.0, "max": 2.0},
            "top_p": {"type": "number", "path": "top_p", "min": 0.0, "max": 1.0},
            "max_tokens": {"type": "integer", "path": "max_tokens", "min": 1},
            "tool_choice": {
                "type": "enum",
                "path": "tool_choice",
                "options": [{"value": "auto"}, {"value": "none"}, {"value": "required"}],
                "default": "auto",
            },
        })
    }

    fn set_messages_in_payload(&self, context: &ChatContext, mut payload: Value) -> Result<Value> {
        let mut messages = Vec::new();
        if let Some(prompt) = &context.system_prompt {
            messages.push(json!({"role": "system", "content": prompt}));
        }
        for message in &context.messages {
            messages.push(Self::message_to_wire(message));
        }
        payload["messages"] = Value::Array(messages);
        Ok(payload)
    }

    fn inject_tool_payload(&self, tools: &[CallableTool], mut payload: Value) -> Result<Value> {
        if tools.is_empty() || !self.profile.capabilities.tools {
            return Ok(payload);
        }
        let declarations: Vec<Value> = tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.wire_name(),
                        "description": tool.tool_description(),
                        "parameters": tool.pinned_schema(),
                    },
                })
            })
            .collect();
        payload["tools"] = Value::Array(declarations);
        Ok(payload)
    }

    fn inject_streaming_parameter(&self, should_stream: bool, mut payload: Value) -> Result<Value> {
        payload["stream"] = json!(should_stream);
        if should_stream {
            // Ask for the usage frame on the final chunk
            payload["stream_options"] = json!({"include_usage": true});
        }
        Ok(payload)
    }

    async fn handle_provider_event(&mut self, chunk: &Value) -> Result<Option<ProviderStreamEvent>> {
        if chunk["object"] != "chat.completion.chunk" {
            return Ok(None);
        }

        if chunk["usage"].is_object() {
            let usage = chunk["usage"].clone();
            self.extract_usage(&usage);
        }

        let Some(choice) = chunk["choices"].as_array().and_then(|c| c.first()) else {
            return Ok(None);
        };

        if let Some(fragments) = choice["delta"]["tool_calls"].as_array() {
            let fragments = fragments.clone();
            for fragment in &fragments {
                self.merge_tool_call_delta(fragment);
            }
        }

        if let Some(reason) = choice["finish_reason"].as_str() {
            self.finished = Some(reason.to_string());
        }

        if let Some(delta) = choice["delta"]["content"].as_str() {
            if !delta.is_empty() {
                self.stream_content.push(delta.to_string());
                return Ok(Some(ProviderStreamEvent::ContentDelta(delta.to_string())));
            }
        }

        Ok(None)
    }

    async fn finalize_provider_events(&mut self) -> Result<Vec<ProviderStreamEvent>> {
        let content = std::mem::take(&mut self.stream_content).join("");

        if !self.stream_tool_calls.is_empty() {
            let calls: Vec<Value> = std::mem::take(&mut self.stream_tool_calls)
                .into_values()
                .collect();
            return Ok(vec![self.build_function_call_event(calls, content).await?]);
        }

        if self.finished.take().is_some() || !content.is_empty() {
            return Ok(vec![ProviderStreamEvent::FinalMessage {
                content,
                usage: self.usage,
            }]);
        }

        Ok(Vec::new())
    }

    async fn handle_provider_completion(&mut self, data: &Value) -> Result<Vec<ProviderStreamEvent>> {
        if data["usage"].is_object() {
            let usage = data["usage"].clone();
            self.extract_usage(&usage);
        }

        let message = &data["choices"][0]["message"];
        let content = message["content"].as_str().unwrap_or_default().to_string();

        if let Some(calls) = message["tool_calls"].as_array() {
            if !calls.is_empty() {
                let calls = calls.clone();
                return Ok(vec![self.build_function_call_event(calls, content).await?]);
            }
        }

        Ok(vec![ProviderStreamEvent::FinalMessage {
            content,
            usage: self.usage,
        }])
    }
}

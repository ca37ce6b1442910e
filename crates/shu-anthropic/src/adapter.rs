// Anthropic Messages API adapter
//
// Streaming shape: content_block_start opens a text or tool_use block,
// content_block_delta carries text_delta / input_json_delta fragments,
// message_delta carries the stop reason and the output-token usage frame.
// Tool results round-trip as user messages holding tool_result blocks keyed
// by tool_use_id. Cache usage is split across cache_read_input_tokens and
// cache_creation_input_tokens.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::{json, Value};

use shu_core::{
    AdapterContext, CallableTool, ChatContext, ChatMessage, ChatRole, ProviderAdapter,
    ProviderCapabilities, ProviderInformation, ProviderStreamEvent, Result, ToolCallInstruction,
    Usage,
};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u64 = 4096;

pub struct AnthropicAdapter {
    context: AdapterContext,
    stream_content: Vec<String>,
    /// block index -> (tool_use block, buffered partial JSON input)
    stream_tool_calls: BTreeMap<u64, (Value, String)>,
    /// Input-side usage from message_start (input + cache tokens)
    start_usage: Option<Value>,
    /// Output-side usage from the latest message_delta
    delta_usage: Option<Value>,
    usage: Usage,
}

impl AnthropicAdapter {
    pub fn new(context: AdapterContext) -> Self {
        Self {
            context,
            stream_content: Vec::new(),
            stream_tool_calls: BTreeMap::new(),
            start_usage: None,
            delta_usage: None,
            usage: Usage::default(),
        }
    }

    /// Fold the collected usage frames into the running totals.
    /// message_start carries input + cache tokens, message_delta carries
    /// the cumulative output count.
    fn fold_usage(&mut self) {
        let start = self.start_usage.take().unwrap_or(Value::Null);
        let delta = self.delta_usage.take().unwrap_or(Value::Null);
        let input = start["input_tokens"].as_u64().unwrap_or(0);
        let cached = start["cache_read_input_tokens"].as_u64().unwrap_or(0)
            + start["cache_creation_input_tokens"].as_u64().unwrap_or(0);
        let output = delta["output_tokens"]
            .as_u64()
            .or_else(|| start["output_tokens"].as_u64())
            .unwrap_or(0);
        if input == 0 && cached == 0 && output == 0 {
            return;
        }
        self.usage
            .add(&Usage::new(input, output, cached, 0, input + cached + output));
    }

    fn tool_call_from_block(block: &Value, buffered_input: &str) -> ToolCallInstruction {
        let name = block["name"].as_str().unwrap_or_default();
        let (plugin_name, operation) = CallableTool::parse_wire_name(name);
        let args = if !buffered_input.is_empty() {
            serde_json::from_str(buffered_input).unwrap_or_else(|_| json!({}))
        } else if block["input"].is_object() {
            block["input"].clone()
        } else {
            json!({})
        };
        ToolCallInstruction {
            plugin_name,
            operation,
            args,
        }
    }

    /// Execute the calls and compose the assistant tool_use message plus one
    /// user message holding every tool_result block, in emission order.
    async fn build_function_call_event(
        &mut self,
        blocks: Vec<Value>,
        tool_calls: Vec<ToolCallInstruction>,
        final_text: String,
    ) -> Result<ProviderStreamEvent> {
        let mut assistant_blocks = Vec::new();
        if !final_text.is_empty() {
            assistant_blocks.push(json!({"type": "text", "text": final_text}));
        }
        for (block, call) in blocks.iter().zip(&tool_calls) {
            assistant_blocks.push(json!({
                "type": "tool_use",
                "id": block["id"].as_str().unwrap_or_default(),
                "name": block["name"].as_str().unwrap_or_default(),
                "input": call.args,
            }));
        }

        let mut result_blocks = Vec::new();
        for (block, call) in blocks.iter().zip(&tool_calls) {
            let output = self
                .context
                .call_plugin(&call.plugin_name, &call.operation, call.args.clone())
                .await;
            result_blocks.push(json!({
                "type": "tool_result",
                "tool_use_id": block["id"].as_str().unwrap_or_default(),
                "content": output,
            }));
        }

        let additional_messages = vec![
            ChatMessage::structured(ChatRole::Assistant, Value::Array(assistant_blocks)),
            ChatMessage::structured(ChatRole::User, Value::Array(result_blocks)),
        ];

        Ok(ProviderStreamEvent::FunctionCall {
            tool_calls,
            additional_messages,
            content: String::new(),
        })
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn information(&self) -> ProviderInformation {
        ProviderInformation {
            key: "anthropic".to_string(),
            display_name: "Anthropic".to_string(),
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
        "/v1/messages".to_string()
    }

    fn models_endpoint(&self) -> String {
        "/v1/models".to_string()
    }

    fn authorization_headers(&self) -> Vec<(String, String)> {
        let mut headers = vec![("anthropic-version".to_string(), API_VERSION.to_string())];
        if let Some(key) = &self.context.credentials.api_key {
            headers.push(("x-api-key".to_string(), key.clone()));
        }
        headers
    }

    fn parameter_mapping(&self) -> Value {
        json!({
            "temperature": {"type": "number", "path": "temperature", "min": 0.0, "max": 1.0},
            "top_p": {"type": "number", "path": "top_p", "min": 0.0, "max": 1.0},
            "max_tokens": {"type": "integer", "path": "max_tokens", "min": 1, "default": DEFAULT_MAX_TOKENS},
            "reasoning": {
                "type": "integer",
                "path": "thinking.budget_tokens",
                "label": "Thinking budget",
                "min": 1024,
            },
            "tool_choice": {
                "type": "enum",
                "path": "tool_choice.type",
                "options": [{"value": "auto"}, {"value": "any"}, {"value": "none"}],
                "default": "auto",
            },
        })
    }

    fn supports_native_documents(&self) -> bool {
        true
    }

    fn set_messages_in_payload(&self, context: &ChatContext, mut payload: Value) -> Result<Value> {
        if let Some(prompt) = &context.system_prompt {
            payload["system"] = json!(prompt);
        }
        let mut messages = Vec::new();
        for message in &context.messages {
            let role = match message.role {
                ChatRole::Assistant => "assistant",
                // tool results ride in user messages; system handled above
                _ => "user",
            };
            messages.push(json!({"role": role, "content": message.content}));
        }
        payload["messages"] = Value::Array(messages);
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
                    "input_schema": tool.pinned_schema(),
                })
            })
            .collect();
        payload["tools"] = Value::Array(declarations);
        Ok(payload)
    }

    fn post_process_payload(&self, mut payload: Value) -> Result<Value> {
        // max_tokens is required by the Messages API
        if payload.get("max_tokens").is_none() {
            payload["max_tokens"] = json!(DEFAULT_MAX_TOKENS);
        }
        Ok(payload)
    }

    async fn handle_provider_event(&mut self, chunk: &Value) -> Result<Option<ProviderStreamEvent>> {
        let event_type = chunk["type"].as_str().unwrap_or_default();

        if chunk["message"]["usage"].is_object() {
            self.start_usage = Some(chunk["message"]["usage"].clone());
        }
        if chunk["usage"].is_object() {
            self.delta_usage = Some(chunk["usage"].clone());
        }

        match event_type {
            "content_block_delta" => {
                let delta = &chunk["delta"];
                if let Some(text) = delta["text"].as_str() {
                    self.stream_content.push(text.to_string());
                    return Ok(Some(ProviderStreamEvent::ContentDelta(text.to_string())));
                }
                if delta["type"] == "thinking_delta" {
                    if let Some(thinking) = delta["thinking"].as_str() {
                        return Ok(Some(ProviderStreamEvent::ReasoningDelta(
                            thinking.to_string(),
                        )));
                    }
                }
                if delta["type"] == "input_json_delta" {
                    if let Some(index) = chunk["index"].as_u64() {
                        if let Some((_, buffer)) = self.stream_tool_calls.get_mut(&index) {
                            buffer.push_str(delta["partial_json"].as_str().unwrap_or_default());
                        }
                    }
                }
                Ok(None)
            }
            "content_block_start" => {
                if chunk["content_block"]["type"] == "tool_use" {
                    if let Some(index) = chunk["index"].as_u64() {
                        self.stream_tool_calls
                            .insert(index, (chunk["content_block"].clone(), String::new()));
                    }
                }
                Ok(None)
            }
            "message_delta" => {
                self.fold_usage();
                match chunk["delta"]["stop_reason"].as_str() {
                    Some("end_turn") | Some("max_tokens") => {
                        let content = std::mem::take(&mut self.stream_content).join("");
                        Ok(Some(ProviderStreamEvent::FinalMessage {
                            content,
                            usage: self.usage,
                        }))
                    }
                    _ => Ok(None),
                }
            }
            _ => Ok(None),
        }
    }

    async fn finalize_provider_events(&mut self) -> Result<Vec<ProviderStreamEvent>> {
        if self.stream_tool_calls.is_empty() {
            return Ok(Vec::new());
        }

        let entries: Vec<(Value, String)> = std::mem::take(&mut self.stream_tool_calls)
            .into_values()
            .collect();
        let tool_calls: Vec<ToolCallInstruction> = entries
            .iter()
            .map(|(block, buffer)| Self::tool_call_from_block(block, buffer))
            .collect();
        let blocks: Vec<Value> = entries.into_iter().map(|(block, _)| block).collect();
        let final_text = std::mem::take(&mut self.stream_content).join("");

        Ok(vec![
            self.build_function_call_event(blocks, tool_calls, final_text)
                .await?,
        ])
    }

    async fn handle_provider_completion(&mut self, data: &Value) -> Result<Vec<ProviderStreamEvent>> {
        // Non-streaming bodies carry one complete usage object
        if data["usage"].is_object() {
            let usage = &data["usage"];
            let input = usage["input_tokens"].as_u64().unwrap_or(0);
            let output = usage["output_tokens"].as_u64().unwrap_or(0);
            let cached = usage["cache_read_input_tokens"].as_u64().unwrap_or(0)
                + usage["cache_creation_input_tokens"].as_u64().unwrap_or(0);
            self.usage
                .add(&Usage::new(input, output, cached, 0, input + cached + output));
        }

        let content_blocks = data["content"].as_array().cloned().unwrap_or_default();
        let mut text_parts = Vec::new();
        let mut tool_blocks = Vec::new();
        for block in content_blocks {
            match block["type"].as_str() {
                Some("text") => text_parts.push(block["text"].as_str().unwrap_or("").to_string()),
                Some("tool_use") => tool_blocks.push(block),
                _ => {}
            }
        }
        let final_text = text_parts.join("");

        let mut events = Vec::new();
        if !tool_blocks.is_empty() {
            let tool_calls: Vec<ToolCallInstruction> = tool_blocks
                .iter()
                .map(|block| Self::tool_call_from_block(block, ""))
                .collect();
            events.push(
                self.build_function_call_event(tool_blocks, tool_calls, final_text.clone())
                    .await?,
            );
        }

        let stop_reason = data["stop_reason"].as_str().unwrap_or_default();
        if stop_reason == "end_turn" || stop_reason == "max_tokens" {
            events.push(ProviderStreamEvent::FinalMessage {
                content: final_text,
                usage: self.usage,
            });
        }

        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shu_core::memory::RecordingBroker;
    use shu_core::ProviderCredentials;
    use std::sync::Arc;

    fn adapter() -> (AnthropicAdapter, Arc<RecordingBroker>) {
        let broker = Arc::new(RecordingBroker::with_response(
            r#"{"status":"success","data":{"messages":[]}}"#,
        ));
        let context = AdapterContext::new(
            ProviderCredentials {
                api_key: Some("sk-ant-test".to_string()),
                base_url: None,
                settings: json!({}),
            },
            Some("user-1".to_string()),
            vec!["kb-1".to_string()],
            broker.clone(),
        );
        (AnthropicAdapter::new(context), broker)
    }

    #[tokio::test]
    async fn text_deltas_accumulate_to_final_on_end_turn() {
        let (mut adapter, _) = adapter();
        adapter
            .handle_provider_event(&json!({
                "type": "message_start",
                "message": {"usage": {"input_tokens": 12, "output_tokens": 1}},
            }))
            .await
            .unwrap();
        adapter
            .handle_provider_event(&json!({
                "type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "Hel"},
            }))
            .await
            .unwrap();
        adapter
            .handle_provider_event(&json!({
                "type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "lo"},
            }))
            .await
            .unwrap();
        let event = adapter
            .handle_provider_event(&json!({
                "type": "message_delta",
                "delta": {"stop_reason": "end_turn"},
                "usage": {"output_tokens": 5},
            }))
            .await
            .unwrap();

        let Some(ProviderStreamEvent::FinalMessage { content, usage }) = event else {
            panic!("expected final message");
        };
        assert_eq!(content, "Hello");
        assert_eq!(usage.input_tokens, 12);
    }

    #[tokio::test]
    async fn buffered_input_json_becomes_tool_call() {
        let (mut adapter, broker) = adapter();
        adapter
            .handle_provider_event(&json!({
                "type": "content_block_start",
                "index": 1,
                "content_block": {"type": "tool_use", "id": "toolu_1", "name": "kb_search__search", "input": {}},
            }))
            .await
            .unwrap();
        adapter
            .handle_provider_event(&json!({
                "type": "content_block_delta", "index": 1,
                "delta": {"type": "input_json_delta", "partial_json": "{\"op\":\"sea"},
            }))
            .await
            .unwrap();
        adapter
            .handle_provider_event(&json!({
                "type": "content_block_delta", "index": 1,
                "delta": {"type": "input_json_delta", "partial_json": "rch\"}"},
            }))
            .await
            .unwrap();
        adapter
            .handle_provider_event(&json!({
                "type": "message_delta", "delta": {"stop_reason": "tool_use"},
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
        assert_eq!(tool_calls[0].plugin_name, "kb_search");
        assert_eq!(tool_calls[0].args["op"], "search");

        // KB scope was merged into the broker call
        let calls = broker.calls();
        assert_eq!(
            calls[0].2["__host"]["kb"]["knowledge_base_ids"][0],
            "kb-1"
        );

        // assistant tool_use message, then one user message of tool_results
        assert_eq!(additional_messages.len(), 2);
        assert_eq!(additional_messages[0].role, ChatRole::Assistant);
        let blocks = additional_messages[0].content.as_array().unwrap();
        assert_eq!(blocks[0]["type"], "tool_use");
        assert_eq!(blocks[0]["id"], "toolu_1");
        let results = additional_messages[1].content.as_array().unwrap();
        assert_eq!(results[0]["type"], "tool_result");
        assert_eq!(results[0]["tool_use_id"], "toolu_1");
    }

    #[tokio::test]
    async fn cache_usage_is_summed() {
        let (mut adapter, _) = adapter();
        adapter
            .handle_provider_event(&json!({
                "type": "message_start",
                "message": {"usage": {
                    "input_tokens": 10,
                    "output_tokens": 0,
                    "cache_read_input_tokens": 100,
                    "cache_creation_input_tokens": 50,
                }},
            }))
            .await
            .unwrap();
        let event = adapter
            .handle_provider_event(&json!({
                "type": "message_delta", "delta": {"stop_reason": "end_turn"},
            }))
            .await
            .unwrap();
        let Some(ProviderStreamEvent::FinalMessage { usage, .. }) = event else {
            panic!("expected final message");
        };
        assert_eq!(usage.cached_tokens, 150);
        assert_eq!(usage.total_tokens, 160);
    }

    #[test]
    fn payload_shape_matches_messages_api() {
        let (adapter, _) = adapter();
        let context = ChatContext::from_messages(vec![
            ChatMessage::system("You are Shu."),
            ChatMessage::user("hi"),
        ]);
        let payload = adapter
            .set_messages_in_payload(&context, json!({}))
            .unwrap();
        assert_eq!(payload["system"], "You are Shu.");
        assert_eq!(payload["messages"][0]["role"], "user");

        let payload = adapter
            .inject_tool_payload(&[CallableTool::new("p", "o")], payload)
            .unwrap();
        assert_eq!(payload["tools"][0]["name"], "p__o");
        assert!(payload["tools"][0]["input_schema"].is_object());

        let payload = adapter.post_process_payload(payload).unwrap();
        assert_eq!(payload["max_tokens"], DEFAULT_MAX_TOKENS);
    }
}

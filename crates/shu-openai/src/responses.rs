// OpenAI Responses API adapter
//
// Streaming event model: typed events (`response.output_text.delta`,
// `response.output_item.done`, `response.completed`). Function-call items
// arrive whole via `response.output_item.done`; reasoning items are
// collected too and replayed ahead of the call items on the next turn, as
// the API requires. Tool results go back as `function_call_output` items
// keyed by `call_id`.

use async_trait::async_trait;
use serde_json::{json, Value};

use shu_core::{
    AdapterContext, CallableTool, ChatContext, ChatMessage, ChatRole, ProviderAdapter,
    ProviderCapabilities, ProviderInformation, ProviderStreamEvent, Result, ToolCallInstruction,
    Usage,
};

const DEFAULT_BASE_URL: &str = "https://api.openai.com";

pub struct ResponsesAdapter {
    context: AdapterContext,
    function_call_items: Vec<Value>,
    reasoning_items: Vec<Value>,
    usage: Usage,
}

impl ResponsesAdapter {
    pub fn new(context: AdapterContext) -> Self {
        Self {
            context,
            function_call_items: Vec::new(),
            reasoning_items: Vec::new(),
            usage: Usage::default(),
        }
    }

    fn extract_usage(&mut self, usage: &Value) {
        let input = usage["input_tokens"].as_u64().unwrap_or(0);
        let output = usage["output_tokens"].as_u64().unwrap_or(0);
        let cached = usage["input_tokens_details"]["cached_tokens"]
            .as_u64()
            .unwrap_or(0);
        let reasoning = usage["output_tokens_details"]["reasoning_tokens"]
            .as_u64()
            .unwrap_or(0);
        let total = usage["total_tokens"].as_u64().unwrap_or(input + output);
        self.usage
            .add(&Usage::new(input, output, cached, reasoning, total));
    }

    fn tool_call_from_item(item: &Value) -> ToolCallInstruction {
        let name = item["name"].as_str().unwrap_or_default();
        let (plugin_name, operation) = CallableTool::parse_wire_name(name);
        let args = item["arguments"]
            .as_str()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_else(|| json!({}));
        ToolCallInstruction {
            plugin_name,
            operation,
            args,
        }
    }

    /// Execute the aggregated calls and compose the follow-up items.
    async fn build_function_call_event(
        &mut self,
        function_call_items: Vec<Value>,
        reasoning_items: Vec<Value>,
    ) -> Result<ProviderStreamEvent> {
        let tool_calls: Vec<ToolCallInstruction> = function_call_items
            .iter()
            .map(Self::tool_call_from_item)
            .collect();

        let mut additional = Vec::new();
        for item in &reasoning_items {
            additional.push(ChatMessage::structured(ChatRole::Assistant, item.clone()));
        }
        for item in &function_call_items {
            additional.push(ChatMessage::structured(ChatRole::Assistant, item.clone()));
        }
        for (item, call) in function_call_items.iter().zip(&tool_calls) {
            let output = self
                .context
                .call_plugin(&call.plugin_name, &call.operation, call.args.clone())
                .await;
            additional.push(ChatMessage::structured(
                ChatRole::Tool,
                json!({
                    "type": "function_call_output",
                    "call_id": item["call_id"].as_str().unwrap_or_default(),
                    "output": output,
                }),
            ));
        }

        Ok(ProviderStreamEvent::FunctionCall {
            tool_calls,
            additional_messages: additional,
            content: String::new(),
        })
    }

    fn message_content(message: &ChatMessage) -> Value {
        if message.role == ChatRole::User && !message.attachments.is_empty() {
            let mut parts = vec![json!({"type": "input_text", "text": message.content_text()})];
            for attachment in &message.attachments {
                if let Some(text) = shu_core::attachment_text_fallback(attachment) {
                    parts.push(json!({"type": "input_text", "text": text}));
                }
            }
            return Value::Array(parts);
        }
        message.content.clone()
    }
}

#[async_trait]
impl ProviderAdapter for ResponsesAdapter {
    fn information(&self) -> ProviderInformation {
        ProviderInformation {
            key: "openai".to_string(),
            display_name: "OpenAI".to_string(),
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
        "/v1/responses".to_string()
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
            "max_tokens": {"type": "integer", "path": "max_output_tokens", "min": 1},
            "reasoning": {
                "type": "enum",
                "path": "reasoning.effort",
                "options": [
                    {"value": "minimal"}, {"value": "low"}, {"value": "medium"}, {"value": "high"}
                ],
            },
            "tool_choice": {
                "type": "enum",
                "path": "tool_choice",
                "options": [{"value": "auto"}, {"value": "none"}, {"value": "required"}],
                "default": "auto",
            },
        })
    }

    fn supports_native_documents(&self) -> bool {
        false
    }

    fn set_messages_in_payload(&self, context: &ChatContext, mut payload: Value) -> Result<Value> {
        if let Some(prompt) = &context.system_prompt {
            payload["instructions"] = json!(prompt);
        }
        let mut input = Vec::new();
        for message in &context.messages {
            // Round-trip items (function_call, function_call_output,
            // reasoning) are provider-native and go into the input verbatim
            if message.content.get("type").is_some() {
                input.push(message.content.clone());
                continue;
            }
            input.push(json!({
                "role": message.role.as_str(),
                "content": Self::message_content(message),
            }));
        }
        payload["input"] = Value::Array(input);
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
                    "type": "function",
                    "name": tool.wire_name(),
                    "description": tool.tool_description(),
                    "parameters": tool.pinned_schema(),
                })
            })
            .collect();
        payload["tools"] = Value::Array(declarations);
        Ok(payload)
    }

    async fn handle_provider_event(&mut self, chunk: &Value) -> Result<Option<ProviderStreamEvent>> {
        let event_type = chunk["type"].as_str().unwrap_or_default();

        match event_type {
            "response.incomplete" => {
                let reason = chunk["response"]["incomplete_details"]["reason"]
                    .as_str()
                    .unwrap_or("incomplete");
                Ok(Some(ProviderStreamEvent::Error(format!(
                    "response incomplete: {reason}"
                ))))
            }
            "response.output_item.done" => {
                let item = &chunk["item"];
                match item["type"].as_str() {
                    Some("reasoning") => self.reasoning_items.push(item.clone()),
                    Some("function_call") => self.function_call_items.push(item.clone()),
                    _ => {}
                }
                Ok(None)
            }
            "response.output_text.delta" => Ok(chunk["delta"]
                .as_str()
                .map(|d| ProviderStreamEvent::ContentDelta(d.to_string()))),
            "response.reasoning_summary_text.delta" => Ok(chunk["delta"]
                .as_str()
                .map(|d| ProviderStreamEvent::ReasoningDelta(d.to_string()))),
            "response.completed" => {
                if chunk["response"]["usage"].is_object() {
                    let usage = chunk["response"]["usage"].clone();
                    self.extract_usage(&usage);
                }
                // With pending function calls the turn continues; finalize
                // turns them into the FunctionCall event
                if !self.function_call_items.is_empty() {
                    return Ok(None);
                }
                let final_text = final_output_text(&chunk["response"]);
                Ok(Some(ProviderStreamEvent::FinalMessage {
                    content: final_text,
                    usage: self.usage,
                }))
            }
            _ => Ok(None),
        }
    }

    async fn finalize_provider_events(&mut self) -> Result<Vec<ProviderStreamEvent>> {
        if self.function_call_items.is_empty() {
            return Ok(Vec::new());
        }
        let calls = std::mem::take(&mut self.function_call_items);
        let reasoning = std::mem::take(&mut self.reasoning_items);
        Ok(vec![self.build_function_call_event(calls, reasoning).await?])
    }

    async fn handle_provider_completion(&mut self, data: &Value) -> Result<Vec<ProviderStreamEvent>> {
        if data["usage"].is_object() {
            let usage = data["usage"].clone();
            self.extract_usage(&usage);
        }

        let output = data["output"].as_array().cloned().unwrap_or_default();
        let function_call_items: Vec<Value> = output
            .iter()
            .filter(|item| item["type"] == "function_call")
            .cloned()
            .collect();

        if function_call_items.is_empty() {
            return Ok(vec![ProviderStreamEvent::FinalMessage {
                content: final_output_text(data),
                usage: self.usage,
            }]);
        }

        let reasoning_items: Vec<Value> = output
            .iter()
            .filter(|item| item["type"] == "reasoning")
            .cloned()
            .collect();
        Ok(vec![
            self.build_function_call_event(function_call_items, reasoning_items)
                .await?,
        ])
    }
}

/// Text of the last output message's last content part, if any
fn final_output_text(response: &Value) -> String {
    response["output"]
        .as_array()
        .and_then(|output| output.last())
        .and_then(|item| item["content"].as_array())
        .and_then(|content| content.last())
        .and_then(|part| part["text"].as_str())
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use shu_core::memory::RecordingBroker;
    use shu_core::ProviderCredentials;
    use std::sync::Arc;

    fn adapter() -> (ResponsesAdapter, Arc<RecordingBroker>) {
        let broker = Arc::new(RecordingBroker::with_response(
            r#"{"status":"success","data":{"count":3}}"#,
        ));
        let context = AdapterContext::new(
            ProviderCredentials {
                api_key: Some("sk-test".to_string()),
                base_url: None,
                settings: json!({}),
            },
            Some("user-1".to_string()),
            vec![],
            broker.clone(),
        );
        (ResponsesAdapter::new(context), broker)
    }

    #[tokio::test]
    async fn content_deltas_pass_through() {
        let (mut adapter, _) = adapter();
        let event = adapter
            .handle_provider_event(&json!({"type": "response.output_text.delta", "delta": "Hi"}))
            .await
            .unwrap();
        assert!(matches!(event, Some(ProviderStreamEvent::ContentDelta(d)) if d == "Hi"));
    }

    #[tokio::test]
    async fn function_call_round_trip() {
        let (mut adapter, broker) = adapter();

        adapter
            .handle_provider_event(&json!({
                "type": "response.output_item.done",
                "item": {
                    "type": "function_call",
                    "call_id": "call_42",
                    "name": "gmail_digest__list",
                    "arguments": "{\"op\":\"list\"}",
                },
            }))
            .await
            .unwrap();

        let events = adapter.finalize_provider_events().await.unwrap();
        assert_eq!(events.len(), 1);
        let ProviderStreamEvent::FunctionCall {
            tool_calls,
            additional_messages,
            ..
        } = &events[0]
        else {
            panic!("expected function call event");
        };

        assert_eq!(tool_calls[0].plugin_name, "gmail_digest");
        assert_eq!(tool_calls[0].operation, "list");
        assert_eq!(tool_calls[0].args["op"], "list");

        // Broker saw the call
        assert_eq!(broker.calls().len(), 1);

        // The call item is replayed, then its result with the matching call_id
        assert_eq!(additional_messages.len(), 2);
        assert_eq!(additional_messages[0].content["type"], "function_call");
        assert_eq!(additional_messages[1].content["type"], "function_call_output");
        assert_eq!(additional_messages[1].content["call_id"], "call_42");
        let output = additional_messages[1].content["output"].as_str().unwrap();
        assert!(output.contains("\"count\":3"));
    }

    #[tokio::test]
    async fn completed_without_calls_is_final() {
        let (mut adapter, _) = adapter();
        let event = adapter
            .handle_provider_event(&json!({
                "type": "response.completed",
                "response": {
                    "usage": {"input_tokens": 10, "output_tokens": 5, "total_tokens": 15},
                    "output": [
                        {"type": "message", "content": [{"type": "output_text", "text": "done"}]}
                    ],
                },
            }))
            .await
            .unwrap();
        let Some(ProviderStreamEvent::FinalMessage { content, usage }) = event else {
            panic!("expected final message");
        };
        assert_eq!(content, "done");
        assert_eq!(usage.input_tokens, 10);
        assert_eq!(usage.total_tokens, 15);
    }

    #[tokio::test]
    async fn completed_with_pending_calls_defers_to_finalize() {
        let (mut adapter, _) = adapter();
        adapter
            .handle_provider_event(&json!({
                "type": "response.output_item.done",
                "item": {"type": "function_call", "call_id": "c", "name": "p__o", "arguments": "{}"},
            }))
            .await
            .unwrap();
        let event = adapter
            .handle_provider_event(&json!({
                "type": "response.completed",
                "response": {"usage": {"input_tokens": 1, "output_tokens": 1}},
            }))
            .await
            .unwrap();
        assert!(event.is_none());
    }

    #[test]
    fn payload_shaping_includes_instructions_and_tools() {
        let (adapter, _) = adapter();
        let context = ChatContext::from_messages(vec![
            ChatMessage::system("be terse"),
            ChatMessage::user("hello"),
        ]);
        let payload = adapter
            .set_messages_in_payload(&context, json!({}))
            .unwrap();
        assert_eq!(payload["instructions"], "be terse");
        assert_eq!(payload["input"][0]["role"], "user");

        let tool = CallableTool::new("kb_search", "search");
        let payload = adapter.inject_tool_payload(&[tool], payload).unwrap();
        assert_eq!(payload["tools"][0]["name"], "kb_search__search");
        assert_eq!(payload["tools"][0]["parameters"]["properties"]["op"]["enum"][0], "search");
    }
}

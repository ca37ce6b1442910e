// Tool-call loop tests with a scripted transport and adapter
//
// Verifies the loop terminates on the first terminal event, appends
// tool-round-trip messages to the context in order, aggregates usage
// across cycles, and enforces the max_tool_calls backstop.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;
use serde_json::{json, Value};

use shu_core::memory::CollectingEventSink;
use shu_core::orchestrator::{ChunkStream, ProviderTransport};
use shu_core::{
    CallableTool, ChatContext, ChatMessage, ChatRole, CoreError, ProviderAdapter,
    ProviderCapabilities, ProviderInformation, ProviderStreamEvent, Result, ToolCallInstruction,
    TurnRunner, Usage,
};

// ============================================================================
// Scripted transport: each open_stream pops the next canned chunk list
// ============================================================================

struct ScriptedTransport {
    rounds: Mutex<Vec<Vec<Value>>>,
}

impl ScriptedTransport {
    fn new(rounds: Vec<Vec<Value>>) -> Self {
        Self {
            rounds: Mutex::new(rounds),
        }
    }
}

#[async_trait]
impl ProviderTransport for ScriptedTransport {
    async fn open_stream(
        &self,
        _url: &str,
        _headers: &[(String, String)],
        _payload: &Value,
    ) -> Result<ChunkStream> {
        let mut rounds = self.rounds.lock().unwrap();
        if rounds.is_empty() {
            return Err(CoreError::provider("no more scripted rounds"));
        }
        let chunks = rounds.remove(0);
        Ok(Box::pin(stream::iter(chunks.into_iter().map(Ok))))
    }

    async fn complete(
        &self,
        _url: &str,
        _headers: &[(String, String)],
        _payload: &Value,
    ) -> Result<Value> {
        let mut rounds = self.rounds.lock().unwrap();
        if rounds.is_empty() {
            return Err(CoreError::provider("no more scripted rounds"));
        }
        Ok(rounds.remove(0).into_iter().next().unwrap_or(json!({})))
    }
}

// ============================================================================
// Scripted adapter: a minimal provider dialect for the loop
//
// Chunk dialect: {"delta": "text"} | {"tool": {"name": "...", "args": {...}}}
//              | {"done": {"usage": N}}
// ============================================================================

struct ScriptedAdapter {
    content: String,
    pending_tool: Option<(String, Value)>,
    usage: Usage,
}

impl ScriptedAdapter {
    fn new() -> Self {
        Self {
            content: String::new(),
            pending_tool: None,
            usage: Usage::default(),
        }
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedAdapter {
    fn information(&self) -> ProviderInformation {
        ProviderInformation {
            key: "scripted".to_string(),
            display_name: "Scripted".to_string(),
        }
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            streaming: true,
            tools: true,
            vision: false,
        }
    }

    fn api_base_url(&self) -> String {
        "http://scripted.test".to_string()
    }

    fn chat_endpoint(&self) -> String {
        "/chat".to_string()
    }

    fn models_endpoint(&self) -> String {
        "/models".to_string()
    }

    fn authorization_headers(&self) -> Vec<(String, String)> {
        Vec::new()
    }

    fn set_messages_in_payload(&self, context: &ChatContext, mut payload: Value) -> Result<Value> {
        payload["messages"] = json!(context.messages.len());
        Ok(payload)
    }

    fn inject_tool_payload(&self, tools: &[CallableTool], mut payload: Value) -> Result<Value> {
        payload["tools"] = json!(tools.len());
        Ok(payload)
    }

    async fn handle_provider_event(&mut self, chunk: &Value) -> Result<Option<ProviderStreamEvent>> {
        if let Some(delta) = chunk.get("delta").and_then(Value::as_str) {
            self.content.push_str(delta);
            return Ok(Some(ProviderStreamEvent::ContentDelta(delta.to_string())));
        }
        if let Some(tool) = chunk.get("tool") {
            let name = tool["name"].as_str().unwrap_or_default().to_string();
            self.pending_tool = Some((name, tool["args"].clone()));
            return Ok(None);
        }
        if let Some(done) = chunk.get("done") {
            let tokens = done["usage"].as_u64().unwrap_or(0);
            self.usage.add(&Usage::new(tokens, tokens / 2, 0, 0, tokens + tokens / 2));
            if self.pending_tool.is_none() {
                return Ok(Some(ProviderStreamEvent::FinalMessage {
                    content: std::mem::take(&mut self.content),
                    usage: self.usage,
                }));
            }
        }
        Ok(None)
    }

    async fn finalize_provider_events(&mut self) -> Result<Vec<ProviderStreamEvent>> {
        let Some((name, args)) = self.pending_tool.take() else {
            return Ok(Vec::new());
        };
        let (plugin, op) = CallableTool::parse_wire_name(&name);
        let call_id = format!("call-{plugin}");
        Ok(vec![ProviderStreamEvent::FunctionCall {
            tool_calls: vec![ToolCallInstruction {
                plugin_name: plugin.clone(),
                operation: op,
                args: args.clone(),
            }],
            additional_messages: vec![
                ChatMessage::structured(
                    ChatRole::Assistant,
                    json!([{"type": "tool_call", "id": call_id, "name": name, "args": args}]),
                ),
                ChatMessage::structured(
                    ChatRole::Tool,
                    json!({"tool_call_id": call_id, "output": {"status": "success"}}),
                ),
            ],
            content: String::new(),
        }])
    }

    async fn handle_provider_completion(&mut self, data: &Value) -> Result<Vec<ProviderStreamEvent>> {
        let content = data["content"].as_str().unwrap_or_default().to_string();
        Ok(vec![ProviderStreamEvent::FinalMessage {
            content,
            usage: self.usage,
        }])
    }
}

fn user_context() -> ChatContext {
    ChatContext::from_messages(vec![
        ChatMessage::system("be helpful"),
        ChatMessage::user("list my unread mail"),
    ])
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn plain_turn_terminates_with_one_final_message() {
    let transport = Arc::new(ScriptedTransport::new(vec![vec![
        json!({"delta": "Hello"}),
        json!({"delta": " there"}),
        json!({"done": {"usage": 10}}),
    ]]));
    let runner = TurnRunner::with_transport(transport, 8);
    let sink = CollectingEventSink::new();
    let mut adapter = ScriptedAdapter::new();
    let mut context = user_context();

    let result = runner
        .run_streaming(&mut adapter, &mut context, &[], "scripted-1", &sink)
        .await
        .unwrap();

    assert_eq!(result.content, "Hello there");
    assert_eq!(result.rounds, 1);

    let events = sink.events();
    let finals = events
        .iter()
        .filter(|e| matches!(e, ProviderStreamEvent::FinalMessage { .. }))
        .count();
    assert_eq!(finals, 1);
}

#[tokio::test]
async fn tool_round_trip_extends_context_and_sums_usage() {
    let transport = Arc::new(ScriptedTransport::new(vec![
        // Round 1: the model asks for a tool
        vec![
            json!({"tool": {"name": "gmail_digest__list", "args": {"op": "list"}}}),
            json!({"done": {"usage": 100}}),
        ],
        // Round 2: final answer
        vec![
            json!({"delta": "You have 3 unread messages."}),
            json!({"done": {"usage": 40}}),
        ],
    ]));
    let runner = TurnRunner::with_transport(transport, 8);
    let sink = CollectingEventSink::new();
    let mut adapter = ScriptedAdapter::new();
    let mut context = user_context();
    let messages_before = context.messages.len();

    let tools = vec![CallableTool::new("gmail_digest", "list")];
    let result = runner
        .run_streaming(&mut adapter, &mut context, &tools, "scripted-1", &sink)
        .await
        .unwrap();

    assert_eq!(result.content, "You have 3 unread messages.");
    assert_eq!(result.rounds, 2);
    // Usage summed across both cycles
    assert_eq!(result.usage.input_tokens, 140);

    // Assistant tool-call message then its tool result, in order
    assert_eq!(context.messages.len(), messages_before + 2);
    assert_eq!(context.messages[messages_before].role, ChatRole::Assistant);
    assert_eq!(context.messages[messages_before + 1].role, ChatRole::Tool);
    let call_id = context.messages[messages_before].content[0]["id"].clone();
    let result_id = context.messages[messages_before + 1].content["tool_call_id"].clone();
    assert_eq!(call_id, result_id);

    // Exactly one FunctionCall and one FinalMessage observed
    let events = sink.events();
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, ProviderStreamEvent::FunctionCall { .. }))
            .count(),
        1
    );
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, ProviderStreamEvent::FinalMessage { .. }))
            .count(),
        1
    );
}

#[tokio::test]
async fn max_tool_calls_is_the_backstop() {
    // Every round asks for another tool call; the loop must give up
    let rounds: Vec<Vec<Value>> = (0..10)
        .map(|i| {
            vec![
                json!({"tool": {"name": format!("p__op{i}"), "args": {}}}),
                json!({"done": {"usage": 1}}),
            ]
        })
        .collect();
    let transport = Arc::new(ScriptedTransport::new(rounds));
    let runner = TurnRunner::with_transport(transport, 3);
    let sink = CollectingEventSink::new();
    let mut adapter = ScriptedAdapter::new();
    let mut context = user_context();

    let err = runner
        .run_streaming(&mut adapter, &mut context, &[], "scripted-1", &sink)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("max tool-call rounds"));
}

#[tokio::test]
async fn transport_error_mid_stream_abandons_the_loop() {
    struct FailingTransport;

    #[async_trait]
    impl ProviderTransport for FailingTransport {
        async fn open_stream(
            &self,
            _url: &str,
            _headers: &[(String, String)],
            _payload: &Value,
        ) -> Result<ChunkStream> {
            Ok(Box::pin(stream::iter(vec![
                Ok(json!({"delta": "partial"})),
                Err(CoreError::provider("connection reset")),
            ])))
        }

        async fn complete(
            &self,
            _url: &str,
            _headers: &[(String, String)],
            _payload: &Value,
        ) -> Result<Value> {
            Err(CoreError::provider("unused"))
        }
    }

    let runner = TurnRunner::with_transport(Arc::new(FailingTransport), 4);
    let sink = CollectingEventSink::new();
    let mut adapter = ScriptedAdapter::new();
    let mut context = user_context();

    let err = runner
        .run_streaming(&mut adapter, &mut context, &[], "scripted-1", &sink)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("connection reset"));

    // Partial content reached the sink before the error
    let events = sink.events();
    assert!(matches!(&events[0], ProviderStreamEvent::ContentDelta(d) if d == "partial"));
    assert!(matches!(events.last().unwrap(), ProviderStreamEvent::Error(_)));
}

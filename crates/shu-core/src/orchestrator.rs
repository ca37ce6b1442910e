// Tool-call loop: drives one user turn to a final assistant message
//
// Opens the provider stream, feeds chunks to the adapter, forwards the
// normalized events to the sink, and on stream end finalizes the adapter.
// A FunctionCall event means the adapter already executed the plugins (via
// the broker) and composed the provider-native follow-up messages; the loop
// appends them to the context and re-opens the stream. The loop terminates
// on the first FinalMessage or Error; max_tool_calls is the backstop
// against adapter bugs.
//
// Transport is a trait so the loop can be driven by canned chunks in tests;
// HttpTransport is the production implementation (reqwest + SSE).

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::{Stream, StreamExt};
use serde_json::Value;
use tracing::{info, warn};

use crate::adapter::ProviderAdapter;
use crate::chat::{CallableTool, ChatContext};
use crate::error::{CoreError, Result};
use crate::provider::{ProviderStreamEvent, Usage};

// ============================================================================
// EventSink - where normalized events go
// ============================================================================

/// Consumer of the normalized event stream (SSE forwarder, collector, ...)
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: ProviderStreamEvent) -> Result<()>;
}

/// Result of a completed turn
#[derive(Debug, Clone)]
pub struct TurnResult {
    pub content: String,
    pub usage: Usage,
    /// Provider invocations made (1 = no tool calls)
    pub rounds: u32,
}

// ============================================================================
// ProviderTransport - how chunks reach the loop
// ============================================================================

/// Parsed provider chunks, in arrival order
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Value>> + Send>>;

#[async_trait]
pub trait ProviderTransport: Send + Sync {
    /// Open a streaming request; yields parsed JSON chunks
    async fn open_stream(
        &self,
        url: &str,
        headers: &[(String, String)],
        payload: &Value,
    ) -> Result<ChunkStream>;

    /// Non-streaming request; returns the full response body
    async fn complete(
        &self,
        url: &str,
        headers: &[(String, String)],
        payload: &Value,
    ) -> Result<Value>;
}

/// Production transport: reqwest POST + SSE parsing.
#[derive(Default)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    async fn send(
        &self,
        url: &str,
        headers: &[(String, String)],
        payload: &Value,
    ) -> Result<reqwest::Response> {
        let mut request = self.client.post(url).json(payload);
        for (key, value) in headers {
            request = request.header(key, value);
        }
        let response = request
            .send()
            .await
            .map_err(|e| CoreError::provider(format!("request to {url} failed: {e}")))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(CoreError::provider(format!(
                "provider returned {status}: {body}"
            )));
        }
        Ok(response)
    }
}

#[async_trait]
impl ProviderTransport for HttpTransport {
    async fn open_stream(
        &self,
        url: &str,
        headers: &[(String, String)],
        payload: &Value,
    ) -> Result<ChunkStream> {
        let response = self.send(url, headers, payload).await?;
        let stream = response
            .bytes_stream()
            .eventsource()
            .filter_map(|sse_event| async move {
                match sse_event {
                    Ok(event) if event.data == "[DONE]" => None,
                    Ok(event) => serde_json::from_str::<Value>(&event.data).ok().map(Ok),
                    Err(e) => Some(Err(CoreError::provider(format!("stream error: {e}")))),
                }
            });
        Ok(Box::pin(stream))
    }

    async fn complete(
        &self,
        url: &str,
        headers: &[(String, String)],
        payload: &Value,
    ) -> Result<Value> {
        let response = self.send(url, headers, payload).await?;
        response
            .json()
            .await
            .map_err(|e| CoreError::provider(format!("invalid provider response: {e}")))
    }
}

// ============================================================================
// TurnRunner
// ============================================================================

pub struct TurnRunner {
    transport: Arc<dyn ProviderTransport>,
    max_tool_calls: u32,
}

impl TurnRunner {
    pub fn new(max_tool_calls: u32) -> Self {
        Self::with_transport(Arc::new(HttpTransport::new()), max_tool_calls)
    }

    pub fn with_transport(transport: Arc<dyn ProviderTransport>, max_tool_calls: u32) -> Self {
        Self {
            transport,
            max_tool_calls: max_tool_calls.max(1),
        }
    }

    /// Shape the outbound payload for one provider invocation.
    fn shape_payload(
        &self,
        adapter: &dyn ProviderAdapter,
        context: &ChatContext,
        tools: &[CallableTool],
        model: &str,
        streaming: bool,
    ) -> Result<Value> {
        let payload = Value::Object(serde_json::Map::new());
        let payload = adapter.set_messages_in_payload(context, payload)?;
        let payload = adapter.inject_tool_payload(tools, payload)?;
        let payload = adapter.inject_model_parameter(model, payload)?;
        let payload = adapter.inject_streaming_parameter(streaming, payload)?;
        adapter.post_process_payload(payload)
    }

    /// Drive a streaming turn to completion.
    ///
    /// Tool-result messages land in `context` in provider emission order, so
    /// every native call id has its matching result before the next
    /// invocation.
    pub async fn run_streaming(
        &self,
        adapter: &mut dyn ProviderAdapter,
        context: &mut ChatContext,
        tools: &[CallableTool],
        model: &str,
        sink: &dyn EventSink,
    ) -> Result<TurnResult> {
        let mut rounds = 0u32;

        loop {
            rounds += 1;
            if rounds > self.max_tool_calls {
                let message = format!("max tool-call rounds ({}) reached", self.max_tool_calls);
                warn!(model = model, "{message}");
                sink.emit(ProviderStreamEvent::Error(message.clone())).await?;
                return Err(CoreError::provider(message));
            }

            let payload = self.shape_payload(adapter, context, tools, model, true)?;
            let url = adapter.request_url(model, true);
            let headers = adapter.authorization_headers();
            let mut stream = self.transport.open_stream(&url, &headers, &payload).await?;

            let mut terminal: Option<ProviderStreamEvent> = None;
            while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        let message = e.to_string();
                        sink.emit(ProviderStreamEvent::Error(message.clone())).await?;
                        return Err(CoreError::provider(message));
                    }
                };
                if let Some(event) = adapter.handle_provider_event(&chunk).await? {
                    if event.is_terminal() {
                        terminal = Some(event);
                        break;
                    }
                    sink.emit(event).await?;
                }
            }
            drop(stream);

            // Flush accumulators; a FunctionCall here means tool calls were
            // aggregated across the stream
            let mut function_call = None;
            for event in adapter.finalize_provider_events().await? {
                match event {
                    ProviderStreamEvent::FunctionCall { .. } => function_call = Some(event),
                    other if other.is_terminal() && terminal.is_none() => terminal = Some(other),
                    other => sink.emit(other).await?,
                }
            }

            if let Some(ProviderStreamEvent::FunctionCall {
                tool_calls,
                additional_messages,
                content,
            }) = function_call
            {
                info!(
                    model = model,
                    calls = tool_calls.len(),
                    round = rounds,
                    "Tool-call round trip"
                );
                sink.emit(ProviderStreamEvent::FunctionCall {
                    tool_calls,
                    additional_messages: additional_messages.clone(),
                    content,
                })
                .await?;
                context.extend(additional_messages);
                continue;
            }

            return self.terminate(terminal, rounds, sink).await;
        }
    }

    /// Drive a non-streaming turn through handle_provider_completion.
    pub async fn run_completion(
        &self,
        adapter: &mut dyn ProviderAdapter,
        context: &mut ChatContext,
        tools: &[CallableTool],
        model: &str,
        sink: &dyn EventSink,
    ) -> Result<TurnResult> {
        let mut rounds = 0u32;

        loop {
            rounds += 1;
            if rounds > self.max_tool_calls {
                return Err(CoreError::provider(format!(
                    "max tool-call rounds ({}) reached",
                    self.max_tool_calls
                )));
            }

            let payload = self.shape_payload(adapter, context, tools, model, false)?;
            let url = adapter.request_url(model, false);
            let headers = adapter.authorization_headers();
            let body = self.transport.complete(&url, &headers, &payload).await?;

            let mut terminal = None;
            let mut function_call = None;
            for event in adapter.handle_provider_completion(&body).await? {
                match event {
                    ProviderStreamEvent::FunctionCall { .. } => function_call = Some(event),
                    other if other.is_terminal() => terminal = Some(other),
                    other => sink.emit(other).await?,
                }
            }

            if let Some(ProviderStreamEvent::FunctionCall {
                tool_calls,
                additional_messages,
                content,
            }) = function_call
            {
                sink.emit(ProviderStreamEvent::FunctionCall {
                    tool_calls,
                    additional_messages: additional_messages.clone(),
                    content,
                })
                .await?;
                context.extend(additional_messages);
                continue;
            }

            return self.terminate(terminal, rounds, sink).await;
        }
    }

    async fn terminate(
        &self,
        terminal: Option<ProviderStreamEvent>,
        rounds: u32,
        sink: &dyn EventSink,
    ) -> Result<TurnResult> {
        match terminal {
            Some(ProviderStreamEvent::FinalMessage { content, usage }) => {
                sink.emit(ProviderStreamEvent::FinalMessage {
                    content: content.clone(),
                    usage,
                })
                .await?;
                Ok(TurnResult {
                    content,
                    usage,
                    rounds,
                })
            }
            Some(ProviderStreamEvent::Error(message)) => {
                // Abandon the loop; already-streamed content stays with the
                // client, followed by this error
                sink.emit(ProviderStreamEvent::Error(message.clone())).await?;
                Err(CoreError::provider(message))
            }
            _ => {
                let message = "provider stream ended without a terminal event".to_string();
                sink.emit(ProviderStreamEvent::Error(message.clone())).await?;
                Err(CoreError::provider(message))
            }
        }
    }
}

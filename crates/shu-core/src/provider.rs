// Provider stream contract
//
// Adapters normalize heterogeneous provider APIs into this event stream.
// Invariant: every turn ends in exactly one FinalMessage OR one Error.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::chat::ChatMessage;

// ============================================================================
// Usage accounting
// ============================================================================

/// Per-call token usage, accumulated across tool-call cycles
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cached_tokens: u64,
    pub reasoning_tokens: u64,
    pub total_tokens: u64,
}

impl Usage {
    pub fn new(
        input_tokens: u64,
        output_tokens: u64,
        cached_tokens: u64,
        reasoning_tokens: u64,
        total_tokens: u64,
    ) -> Self {
        Self {
            input_tokens,
            output_tokens,
            cached_tokens,
            reasoning_tokens,
            total_tokens,
        }
    }

    /// Accumulate another cycle's usage
    pub fn add(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cached_tokens += other.cached_tokens;
        self.reasoning_tokens += other.reasoning_tokens;
        self.total_tokens += other.total_tokens;
    }

    pub fn is_empty(&self) -> bool {
        *self == Usage::default()
    }
}

// ============================================================================
// Provider description
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderInformation {
    pub key: String,
    pub display_name: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ProviderCapabilities {
    pub streaming: bool,
    pub tools: bool,
    pub vision: bool,
}

// ============================================================================
// Stream events
// ============================================================================

/// One normalized tool call parsed from a provider response
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallInstruction {
    pub plugin_name: String,
    pub operation: String,
    pub args: Value,
}

/// Adapter-normalized output consumed by the tool-call loop
#[derive(Debug, Clone)]
pub enum ProviderStreamEvent {
    /// Incremental assistant text
    ContentDelta(String),
    /// Incremental reasoning/thinking text
    ReasoningDelta(String),
    /// Tool calls plus the provider-native messages that must be appended
    /// to the next turn to satisfy the round-trip invariants
    FunctionCall {
        tool_calls: Vec<ToolCallInstruction>,
        additional_messages: Vec<ChatMessage>,
        content: String,
    },
    /// Terminal: the final assistant message with accumulated usage
    FinalMessage { content: String, usage: Usage },
    /// Terminal: the turn failed
    Error(String),
}

impl ProviderStreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProviderStreamEvent::FinalMessage { .. } | ProviderStreamEvent::Error(_)
        )
    }
}

// Chat context types handed to provider adapters
//
// ChatMessage content is either a plain string or provider-native structured
// parts (kept as raw JSON so tool-round-trip messages survive verbatim).
// Call IDs ride inside that structured content, which is what lets each
// adapter reconstruct its provider's round-trip invariants.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

// ============================================================================
// Messages
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRole::System => "system",
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
            ChatRole::Tool => "tool",
        }
    }
}

/// File attached to a message. `storage_path` points inside the configured
/// attachment directory; `extracted_text` is the pre-extracted fallback for
/// providers without native document support.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    pub original_filename: String,
    pub mime_type: String,
    #[serde(default)]
    pub storage_path: Option<String>,
    #[serde(default)]
    pub extracted_text: Option<String>,
}

impl Attachment {
    pub fn is_image(&self) -> bool {
        self.mime_type.starts_with("image/")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    /// String content or provider-native structured parts
    pub content: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl ChatMessage {
    pub fn text(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Value::String(content.into()),
            attachments: Vec::new(),
            metadata: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::text(ChatRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::text(ChatRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::text(ChatRole::Assistant, content)
    }

    /// Provider-native structured message (tool calls, tool results, parts)
    pub fn structured(role: ChatRole, content: Value) -> Self {
        Self {
            role,
            content,
            attachments: Vec::new(),
            metadata: None,
        }
    }

    /// Plain-text view of the content (structured parts flattened)
    pub fn content_text(&self) -> String {
        match &self.content {
            Value::String(s) => s.clone(),
            Value::Array(parts) => parts
                .iter()
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join(""),
            other => other.to_string(),
        }
    }
}

/// The semantic message list handed to an adapter: ordered messages plus an
/// extracted leading system prompt.
#[derive(Debug, Clone, Default)]
pub struct ChatContext {
    pub system_prompt: Option<String>,
    pub messages: Vec<ChatMessage>,
}

impl ChatContext {
    /// Build a context, folding leading system messages into system_prompt.
    pub fn from_messages(messages: Vec<ChatMessage>) -> Self {
        let mut system_parts = Vec::new();
        let mut rest = Vec::new();
        let mut seen_non_system = false;
        for msg in messages {
            if !seen_non_system && msg.role == ChatRole::System {
                system_parts.push(msg.content_text());
            } else {
                seen_non_system = true;
                rest.push(msg);
            }
        }
        Self {
            system_prompt: if system_parts.is_empty() {
                None
            } else {
                Some(system_parts.join("\n\n"))
            },
            messages: rest,
        }
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    pub fn extend(&mut self, messages: Vec<ChatMessage>) {
        self.messages.extend(messages);
    }
}

// ============================================================================
// CallableTool - per-turn (plugin, op) projection
// ============================================================================

/// Wire-name separator between plugin name and op
pub const TOOL_NAME_SEPARATOR: &str = "__";

/// A (plugin, op) pair exposed to the LLM for one turn. Never persisted.
#[derive(Debug, Clone)]
pub struct CallableTool {
    pub plugin_name: String,
    pub op: String,
    pub description: Option<String>,
    /// Plugin input schema; `pinned_schema` narrows op to this tool's op
    pub schema: Option<Value>,
    pub display_label: Option<String>,
}

impl CallableTool {
    pub fn new(plugin_name: impl Into<String>, op: impl Into<String>) -> Self {
        Self {
            plugin_name: plugin_name.into(),
            op: op.into(),
            description: None,
            schema: None,
            display_label: None,
        }
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Name on the wire to providers: `<plugin_name>__<op>`
    pub fn wire_name(&self) -> String {
        format!("{}{}{}", self.plugin_name, TOOL_NAME_SEPARATOR, self.op)
    }

    /// Split an inbound tool name on the first `__`
    pub fn parse_wire_name(name: &str) -> (String, String) {
        match name.split_once(TOOL_NAME_SEPARATOR) {
            Some((plugin, op)) => (plugin.to_string(), op.to_string()),
            None => (name.to_string(), String::new()),
        }
    }

    /// Tool description shown to the LLM
    pub fn tool_description(&self) -> String {
        self.description
            .clone()
            .or_else(|| self.display_label.clone())
            .unwrap_or_else(|| format!("Run {}:{}", self.plugin_name, self.op))
    }

    /// The plugin schema with `op` pinned to this tool's op.
    pub fn pinned_schema(&self) -> Value {
        let mut schema = self
            .schema
            .clone()
            .unwrap_or_else(|| json!({"type": "object", "properties": {}, "additionalProperties": true}));
        if !schema.is_object() {
            schema = json!({"type": "object", "properties": {}});
        }
        let obj = schema.as_object_mut().unwrap();
        let props = obj
            .entry("properties".to_string())
            .or_insert_with(|| json!({}));
        if let Some(props) = props.as_object_mut() {
            props.insert(
                "op".to_string(),
                json!({
                    "type": "string",
                    "enum": [self.op],
                    "const": self.op,
                    "default": self.op,
                }),
            );
        }
        match obj.get_mut("required") {
            Some(Value::Array(required)) => {
                if !required.iter().any(|v| v == "op") {
                    required.push(json!("op"));
                }
            }
            _ => {
                obj.insert("required".to_string(), json!(["op"]));
            }
        }
        schema
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leading_system_messages_fold_into_prompt() {
        let ctx = ChatContext::from_messages(vec![
            ChatMessage::system("You are Shu."),
            ChatMessage::system("Be brief."),
            ChatMessage::user("hi"),
            ChatMessage::system("mid-stream system"),
        ]);
        assert_eq!(ctx.system_prompt.as_deref(), Some("You are Shu.\n\nBe brief."));
        assert_eq!(ctx.messages.len(), 2);
    }

    #[test]
    fn wire_name_round_trips() {
        let tool = CallableTool::new("gmail_digest", "list");
        assert_eq!(tool.wire_name(), "gmail_digest__list");
        let (plugin, op) = CallableTool::parse_wire_name("gmail_digest__list");
        assert_eq!(plugin, "gmail_digest");
        assert_eq!(op, "list");
    }

    #[test]
    fn wire_name_splits_on_first_separator() {
        let (plugin, op) = CallableTool::parse_wire_name("a__b__c");
        assert_eq!(plugin, "a");
        assert_eq!(op, "b__c");
        let (plugin, op) = CallableTool::parse_wire_name("bare");
        assert_eq!(plugin, "bare");
        assert_eq!(op, "");
    }

    #[test]
    fn pinned_schema_narrows_op() {
        let tool = CallableTool::new("kb", "search").with_schema(json!({
            "type": "object",
            "properties": {"op": {"type": "string", "enum": ["search", "get"]}, "q": {"type": "string"}},
            "required": ["q"],
        }));
        let schema = tool.pinned_schema();
        assert_eq!(schema["properties"]["op"]["enum"], json!(["search"]));
        assert_eq!(schema["properties"]["op"]["const"], "search");
        let required = schema["required"].as_array().unwrap();
        assert!(required.contains(&json!("op")));
        assert!(required.contains(&json!("q")));
    }

    #[test]
    fn structured_content_flattens_to_text() {
        let msg = ChatMessage::structured(
            ChatRole::Assistant,
            json!([{"type": "text", "text": "a"}, {"type": "tool_use", "id": "t1"}, {"type": "text", "text": "b"}]),
        );
        assert_eq!(msg.content_text(), "ab");
    }
}

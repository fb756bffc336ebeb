use serde::{Deserialize, Serialize};

/// Literal line that terminates every output sequence.
pub const SENTINEL: &str = "[DONE]";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Only set on assistant messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    /// Only set on tool messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::text(MessageRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::text(MessageRole::User, content)
    }

    pub fn assistant_tool_calls(tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: None,
            tool_calls: Some(tool_calls),
            tool_call_id: None,
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Tool,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
        }
    }

    fn text(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

/// A completed tool invocation requested by the model. `arguments` is the raw
/// JSON text exactly as the model streamed it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

fn default_stream() -> bool {
    true
}

fn default_max_tokens() -> u32 {
    2000
}

fn default_temperature() -> f32 {
    1.0
}

/// Request from client to gateway. A follow-up round works on a fresh copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub prompt: String,
    /// Empty means "use the gateway's default model".
    #[serde(default)]
    pub model: String,
    #[serde(default = "default_stream")]
    pub stream: bool,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub history: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_group_id: Option<String>,
}

impl ChatRequest {
    pub fn from_prompt(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            model: String::new(),
            stream: default_stream(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            history: Vec::new(),
            tool_group_id: None,
        }
    }
}

/// Body of a non-streaming `/chat` answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub content: String,
    pub model: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkPayload {
    pub chunk: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: u16,
    pub message: String,
    pub success: bool,
}

/// One item of the caller-facing output sequence.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputFrame {
    Chunk(String),
    Error(ErrorPayload),
    Done,
}

impl OutputFrame {
    pub fn error(code: u16, message: impl Into<String>) -> Self {
        OutputFrame::Error(ErrorPayload {
            code,
            message: message.into(),
            success: false,
        })
    }

    /// Single-line wire form: `{"chunk":...}`, the error object, or `[DONE]`.
    pub fn to_line(&self) -> String {
        match self {
            OutputFrame::Chunk(text) => serde_json::to_string(&ChunkPayload { chunk: text.clone() })
                .unwrap_or_else(|_| String::from("{\"chunk\":\"\"}")),
            OutputFrame::Error(payload) => serde_json::to_string(payload).unwrap_or_else(|_| {
                format!(
                    "{{\"code\":{},\"message\":\"internal error\",\"success\":false}}",
                    payload.code
                )
            }),
            OutputFrame::Done => SENTINEL.to_string(),
        }
    }
}

//! The upstream chat-completions endpoint, seen as a stream of raw lines.

use async_openai::types::{
    ChatCompletionMessageToolCall, ChatCompletionRequestAssistantMessageArgs,
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
    ChatCompletionRequestToolMessageArgs, ChatCompletionRequestUserMessageArgs, ChatCompletionTool,
    ChatCompletionToolType, CreateChatCompletionRequest, CreateChatCompletionRequestArgs,
    FunctionCall, FunctionObject,
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use reqwest::StatusCode;
use tiein_shared::{ChatMessage, ChatRequest, MessageRole, ToolCall};
use tracing::{debug, error};

use crate::catalog::ToolDescriptor;
use crate::config::UpstreamConfig;
use crate::error::GatewayError;

pub type LineStream = BoxStream<'static, Result<String, GatewayError>>;

/// Longest line accepted from the upstream before the stream is abandoned.
pub const MAX_LINE_BYTES: usize = 1 << 20;

/// Dropping the returned stream must abort the in-flight upstream request.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    async fn open_stream(
        &self,
        request: &ChatRequest,
        tools: &[ToolDescriptor],
    ) -> Result<LineStream, GatewayError>;
}

pub struct OpenAiUpstream {
    client: reqwest::Client,
    chat_url: String,
    api_key: String,
}

impl OpenAiUpstream {
    pub fn new(config: &UpstreamConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            chat_url: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            api_key: config.api_key.clone(),
        }
    }
}

#[async_trait]
impl UpstreamClient for OpenAiUpstream {
    async fn open_stream(
        &self,
        request: &ChatRequest,
        tools: &[ToolDescriptor],
    ) -> Result<LineStream, GatewayError> {
        let body = build_completion_request(request, tools)?;
        debug!(
            "Opening upstream stream: model={}, messages={}, tools={}",
            body.model,
            body.messages.len(),
            tools.len()
        );

        let response = self
            .client
            .post(&self.chat_url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            error!("Upstream rejected request with status {}: {}", status, text);
            return Err(if status == StatusCode::TOO_MANY_REQUESTS {
                GatewayError::UpstreamRateLimited(text)
            } else {
                GatewayError::UpstreamTransport(format!("status {status}: {text}"))
            });
        }

        let mut body = response.bytes_stream();
        let lines = async_stream::stream! {
            let mut buffer: Vec<u8> = Vec::new();
            while let Some(chunk) = body.next().await {
                match chunk {
                    Ok(bytes) => {
                        buffer.extend_from_slice(&bytes);
                        while let Some(line) = take_line(&mut buffer) {
                            yield Ok::<String, GatewayError>(line);
                        }
                        if buffer.len() > MAX_LINE_BYTES {
                            yield Err(GatewayError::UpstreamTransport(format!(
                                "line exceeds {MAX_LINE_BYTES} bytes without a newline"
                            )));
                            return;
                        }
                    }
                    Err(e) => {
                        yield Err(GatewayError::UpstreamTransport(format!("stream interrupted: {e}")));
                        return;
                    }
                }
            }
            if !buffer.is_empty() {
                yield Ok(String::from_utf8_lossy(&buffer).into_owned());
            }
        };
        Ok(Box::pin(lines))
    }
}

/// Split off one complete line. Bytes are only decoded once the newline has
/// arrived, so a character split across network chunks stays intact.
fn take_line(buffer: &mut Vec<u8>) -> Option<String> {
    let pos = buffer.iter().position(|b| *b == b'\n')?;
    let mut line: Vec<u8> = buffer.drain(..=pos).collect();
    line.pop();
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Some(String::from_utf8_lossy(&line).into_owned())
}

pub fn build_completion_request(
    request: &ChatRequest,
    tools: &[ToolDescriptor],
) -> Result<CreateChatCompletionRequest, GatewayError> {
    let messages = request
        .history
        .iter()
        .cloned()
        .map(to_request_message)
        .collect::<Result<Vec<_>, _>>()?;

    let mut builder = CreateChatCompletionRequestArgs::default();
    builder
        .model(&request.model)
        .messages(messages)
        .max_tokens(request.max_tokens)
        .temperature(request.temperature)
        .stream(true);
    if !tools.is_empty() {
        builder.tools(tool_definitions(tools));
    }
    Ok(builder.build()?)
}

fn tool_definitions(tools: &[ToolDescriptor]) -> Vec<ChatCompletionTool> {
    tools
        .iter()
        .map(|tool| ChatCompletionTool {
            r#type: ChatCompletionToolType::Function,
            function: FunctionObject {
                name: tool.function_name(),
                description: Some(tool.function_description()),
                parameters: tool.input_schema.clone(),
                strict: None,
            },
        })
        .collect()
}

fn to_request_message(msg: ChatMessage) -> Result<ChatCompletionRequestMessage, GatewayError> {
    let ChatMessage {
        role,
        content,
        tool_calls,
        tool_call_id,
    } = msg;
    let text = content.unwrap_or_default();

    Ok(match role {
        MessageRole::System => ChatCompletionRequestSystemMessageArgs::default()
            .content(text)
            .build()?
            .into(),
        MessageRole::User => ChatCompletionRequestUserMessageArgs::default()
            .content(text)
            .build()?
            .into(),
        MessageRole::Tool => ChatCompletionRequestToolMessageArgs::default()
            .content(text)
            .tool_call_id(tool_call_id.unwrap_or_default())
            .build()?
            .into(),
        MessageRole::Assistant => {
            let mut args = ChatCompletionRequestAssistantMessageArgs::default();
            if !text.is_empty() {
                args.content(text);
            }
            if let Some(calls) = tool_calls {
                args.tool_calls(calls.into_iter().map(to_request_tool_call).collect::<Vec<_>>());
            }
            args.build()?.into()
        }
    })
}

fn to_request_tool_call(call: ToolCall) -> ChatCompletionMessageToolCall {
    ChatCompletionMessageToolCall {
        id: call.id,
        r#type: ChatCompletionToolType::Function,
        function: FunctionCall {
            name: call.name,
            arguments: call.arguments,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn take_line_handles_crlf_and_partial_tail() {
        let mut buffer = b"data: a\r\ndata: b\ndata: c".to_vec();
        assert_eq!(take_line(&mut buffer).as_deref(), Some("data: a"));
        assert_eq!(take_line(&mut buffer).as_deref(), Some("data: b"));
        assert_eq!(take_line(&mut buffer), None);
        assert_eq!(buffer, b"data: c");
    }

    #[test]
    fn take_line_waits_for_split_multibyte_character() {
        let text = "data: Zürich\n".as_bytes();
        let split = text.iter().position(|b| *b >= 0x80).unwrap() + 1;
        let mut buffer = text[..split].to_vec();
        assert_eq!(take_line(&mut buffer), None);
        buffer.extend_from_slice(&text[split..]);
        assert_eq!(take_line(&mut buffer).as_deref(), Some("data: Zürich"));
    }

    #[test]
    fn request_body_carries_tools_and_history() {
        let mut request = ChatRequest::from_prompt("weather?");
        request.model = "gpt-test".into();
        request.max_tokens = 128;
        request.history = vec![
            ChatMessage::user("weather?"),
            ChatMessage::assistant_tool_calls(vec![ToolCall {
                id: "call_1".into(),
                name: "tool_7".into(),
                arguments: "{\"city\":\"Oslo\"}".into(),
            }]),
            ChatMessage::tool_result("call_1", "sunny"),
        ];
        let tools = vec![ToolDescriptor {
            id: "7".into(),
            name: "weather".into(),
            description: "Current weather".into(),
            input_schema: Some(json!({"type": "object"})),
        }];

        let body = serde_json::to_value(build_completion_request(&request, &tools).unwrap()).unwrap();

        assert_eq!(body["model"], "gpt-test");
        assert_eq!(body["stream"], true);
        assert_eq!(body["max_tokens"], 128);
        assert_eq!(body["tools"][0]["function"]["name"], "tool_7");
        assert_eq!(body["tools"][0]["function"]["description"], "weather:Current weather");
        assert_eq!(body["messages"][1]["role"], "assistant");
        assert_eq!(body["messages"][1]["tool_calls"][0]["id"], "call_1");
        assert_eq!(body["messages"][2]["role"], "tool");
        assert_eq!(body["messages"][2]["tool_call_id"], "call_1");
    }

    #[test]
    fn empty_tool_list_is_omitted() {
        let mut request = ChatRequest::from_prompt("hi");
        request.model = "gpt-test".into();
        request.history = vec![ChatMessage::user("hi")];
        let body = serde_json::to_value(build_completion_request(&request, &[]).unwrap()).unwrap();
        assert!(body.get("tools").is_none());
    }
}

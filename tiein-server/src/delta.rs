//! Decoding of single upstream stream lines into typed events.

use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::error::GatewayError;

const END_OF_STREAM: &str = "[DONE]";

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Content(String),
    ToolFragment(ToolFragment),
    End,
}

/// A piece of a streamed tool call. Only the first piece of a call carries
/// its id; everything after it is matched back by `index`.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolFragment {
    Opener {
        index: u32,
        id: String,
        name: Option<String>,
        args_chunk: Option<String>,
    },
    Continuation {
        index: u32,
        name: Option<String>,
        args_chunk: Option<String>,
    },
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<StreamDelta>,
}

#[derive(Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Deserialize)]
struct ToolCallDelta {
    #[serde(default)]
    index: Option<u32>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Deserialize)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

/// Decode one raw line. Blank lines, SSE comments and heartbeats decode to
/// no events. `Err(MalformedLine)` is recoverable: the caller skips the line.
/// An upstream error object is reported as `UpstreamTransport`.
pub fn decode_line(line: &str) -> Result<Vec<StreamEvent>, GatewayError> {
    let Some(payload) = payload_of(line) else {
        return Ok(Vec::new());
    };
    if payload == END_OF_STREAM {
        return Ok(vec![StreamEvent::End]);
    }

    let chunk: StreamChunk =
        serde_json::from_str(payload).map_err(|err| GatewayError::MalformedLine {
            reason: format!("{err}; payload={payload}"),
        })?;

    if let Some(error) = chunk.error {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        return Err(GatewayError::UpstreamTransport(message));
    }

    let Some(delta) = chunk.choices.into_iter().next().and_then(|choice| choice.delta) else {
        return Ok(Vec::new());
    };

    match delta.tool_calls {
        Some(tool_calls) if !tool_calls.is_empty() => Ok(tool_calls
            .into_iter()
            .filter_map(fragment_from_delta)
            .map(StreamEvent::ToolFragment)
            .collect()),
        _ => match delta.content {
            Some(text) if !text.is_empty() => Ok(vec![StreamEvent::Content(text)]),
            _ => Ok(Vec::new()),
        },
    }
}

/// Strips the SSE `data:` marker. Other SSE fields carry nothing we need.
fn payload_of(line: &str) -> Option<&str> {
    let line = line.trim();
    if line.is_empty() || line.starts_with(':') {
        return None;
    }
    let payload = match line.strip_prefix("data:") {
        Some(rest) => rest.trim(),
        None if ["event:", "id:", "retry:"].iter().any(|field| line.starts_with(field)) => {
            return None;
        }
        None => line,
    };
    (!payload.is_empty()).then_some(payload)
}

fn fragment_from_delta(delta: ToolCallDelta) -> Option<ToolFragment> {
    let Some(index) = delta.index else {
        warn!("Dropping tool-call delta without index (id: {:?})", delta.id);
        return None;
    };
    let (name, args_chunk) = match delta.function {
        Some(function) => (function.name, function.arguments),
        None => (None, None),
    };

    // Some compatible upstreams repeat `"id": ""` on continuations.
    match delta.id.filter(|id| !id.is_empty()) {
        Some(id) => Some(ToolFragment::Opener {
            index,
            id,
            name,
            args_chunk,
        }),
        None => Some(ToolFragment::Continuation {
            index,
            name,
            args_chunk,
        }),
    }
}

//! Building the message history for the first round and for each follow-up.

use tiein_shared::{ChatMessage, ChatRequest, MessageRole, ToolCall};

use crate::catalog::{ResourceDescriptor, ToolExecutionResult};

/// Derive the next round's request: the original history, one assistant
/// message carrying `tool_calls`, then exactly one tool message per call in
/// the same order. `results` is matched by call id; a call without a result
/// still gets a (failed) tool message.
pub fn compose_followup(
    request: &ChatRequest,
    tool_calls: &[ToolCall],
    results: &[ToolExecutionResult],
) -> ChatRequest {
    let mut history = Vec::with_capacity(request.history.len() + tool_calls.len() + 1);
    history.extend(request.history.iter().cloned());
    history.push(ChatMessage::assistant_tool_calls(tool_calls.to_vec()));

    for call in tool_calls {
        let content = results
            .iter()
            .find(|result| result.tool_call_id == call.id)
            .map(ToolExecutionResult::message_content)
            .unwrap_or_else(|| String::from("Error: no result was produced for this tool call"));
        history.push(ChatMessage::tool_result(call.id.clone(), content));
    }

    ChatRequest {
        history,
        stream: true,
        ..request.clone()
    }
}

/// Seed an empty history with the prompt and fill in the default model.
pub fn prepare_request(mut request: ChatRequest, default_model: &str) -> ChatRequest {
    if request.model.is_empty() {
        request.model = default_model.to_string();
    }
    if request.history.is_empty() {
        request.history.push(ChatMessage::user(request.prompt.clone()));
    }
    request
}

/// Append resource text to the first system message, inserting one at the
/// front when the history has none.
pub fn inject_resources(history: &mut Vec<ChatMessage>, resources: &[ResourceDescriptor]) {
    if resources.is_empty() {
        return;
    }

    let mut block = String::from("\n\nAvailable Resources:\n");
    for resource in resources {
        block.push_str(&format!(
            "--- Resource Name: {} ---\n{}\n",
            resource.name, resource.content
        ));
    }

    match history.iter_mut().find(|m| m.role == MessageRole::System) {
        Some(system) => system.content.get_or_insert_with(String::new).push_str(&block),
        None => history.insert(0, ChatMessage::system(block)),
    }
}

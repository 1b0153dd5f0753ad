//! Classifier for chat-completions chunks.
//!
//! ```text
//! {"choices":[{"index":0,"delta":{"content":"Hi","tool_calls":[...]},"finish_reason":null}],
//!  "usage":{"prompt_tokens":9,"completion_tokens":12}}
//! ```

use serde_json::Value;

use super::{as_string, as_u64};
use crate::event::{NormalizedEvent, ProviderFailure};

pub(super) fn classify(value: &Value) -> Vec<NormalizedEvent> {
    if let Some(error) = value.get("error").filter(|e| !e.is_null()) {
        return vec![NormalizedEvent::Error(ProviderFailure::from_error_object(
            error,
        ))];
    }

    let mut events = Vec::new();
    if let Some(choices) = value.get("choices").and_then(|v| v.as_array()) {
        for choice in choices {
            classify_choice(choice, &mut events);
        }
    }

    if let Some(usage) = value.get("usage").filter(|u| u.is_object()) {
        let input_tokens = as_u64(usage.get("prompt_tokens"));
        let output_tokens = as_u64(usage.get("completion_tokens"));
        if input_tokens.is_some() || output_tokens.is_some() {
            events.push(NormalizedEvent::UsageUpdate {
                input_tokens,
                output_tokens,
            });
        }
    }

    if events.is_empty() {
        events.push(NormalizedEvent::Other);
    }
    events
}

fn classify_choice(choice: &Value, events: &mut Vec<NormalizedEvent>) {
    if let Some(delta) = choice.get("delta") {
        if let Some(text) = delta.get("content").and_then(|v| v.as_str())
            && !text.is_empty()
        {
            events.push(NormalizedEvent::TextDelta(text.to_string()));
        }

        if let Some(tool_calls) = delta.get("tool_calls").and_then(|v| v.as_array()) {
            for (position, call) in tool_calls.iter().enumerate() {
                let index = call
                    .get("index")
                    .and_then(|v| v.as_u64())
                    .map_or(position, |i| i as usize);
                let function = call.get("function");
                classify_tool_fragment(
                    index,
                    as_string(call.get("id")),
                    as_string(function.and_then(|f| f.get("name"))),
                    function
                        .and_then(|f| f.get("arguments"))
                        .and_then(|v| v.as_str()),
                    events,
                );
            }
        }

        // Legacy single function call, always slot 0.
        if let Some(function) = delta.get("function_call").filter(|f| f.is_object()) {
            classify_tool_fragment(
                0,
                None,
                as_string(function.get("name")),
                function.get("arguments").and_then(|v| v.as_str()),
                events,
            );
        }
    }

    if let Some(reason) = choice.get("finish_reason").and_then(|v| v.as_str()) {
        events.push(NormalizedEvent::StopReasonUpdate(reason.to_string()));
    }
}

fn classify_tool_fragment(
    index: usize,
    id: Option<String>,
    name: Option<String>,
    arguments: Option<&str>,
    events: &mut Vec<NormalizedEvent>,
) {
    if id.is_some() || name.is_some() {
        events.push(NormalizedEvent::ToolCallStart { index, id, name });
    }
    if let Some(fragment) = arguments.filter(|a| !a.is_empty()) {
        events.push(NormalizedEvent::ToolCallArgDelta {
            index,
            fragment: fragment.to_string(),
        });
    }
}

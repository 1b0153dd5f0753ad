//! Classifier for named-event message streams.
//!
//! Event order on the wire: `message_start`, then per content block
//! `content_block_start` / `content_block_delta`* / `content_block_stop`,
//! then `message_delta` and `message_stop`. `ping` and `error` may appear
//! anywhere.

use serde_json::Value;

use super::{as_string, as_u64};
use crate::event::{NormalizedEvent, ProviderFailure};

pub(super) fn classify(event_name: Option<&str>, value: &Value) -> Vec<NormalizedEvent> {
    let event_type = value
        .get("type")
        .and_then(|v| v.as_str())
        .or(event_name)
        .unwrap_or_default();
    let index = value
        .get("index")
        .and_then(|v| v.as_u64())
        .map_or(0, |i| i as usize);

    let mut events = Vec::new();
    match event_type {
        "message_start" => {
            if let Some(usage) = value.get("message").and_then(|m| m.get("usage")) {
                push_usage(usage, &mut events);
            }
        }
        "content_block_start" => {
            let block = value.get("content_block");
            match block.and_then(|b| b.get("type")).and_then(|v| v.as_str()) {
                Some("tool_use") | Some("server_tool_use") => {
                    events.push(NormalizedEvent::ToolCallStart {
                        index,
                        id: as_string(block.and_then(|b| b.get("id"))),
                        name: as_string(block.and_then(|b| b.get("name"))),
                    });
                }
                Some("text") => {
                    if let Some(text) = block
                        .and_then(|b| b.get("text"))
                        .and_then(|v| v.as_str())
                        .filter(|t| !t.is_empty())
                    {
                        events.push(NormalizedEvent::TextDelta(text.to_string()));
                    }
                }
                _ => {}
            }
        }
        "content_block_delta" => {
            let delta = value.get("delta");
            match delta.and_then(|d| d.get("type")).and_then(|v| v.as_str()) {
                Some("text_delta") => {
                    if let Some(text) = delta
                        .and_then(|d| d.get("text"))
                        .and_then(|v| v.as_str())
                        .filter(|t| !t.is_empty())
                    {
                        events.push(NormalizedEvent::TextDelta(text.to_string()));
                    }
                }
                Some("input_json_delta") => {
                    if let Some(fragment) = delta
                        .and_then(|d| d.get("partial_json"))
                        .and_then(|v| v.as_str())
                        .filter(|f| !f.is_empty())
                    {
                        events.push(NormalizedEvent::ToolCallArgDelta {
                            index,
                            fragment: fragment.to_string(),
                        });
                    }
                }
                _ => {}
            }
        }
        "content_block_stop" => events.push(NormalizedEvent::ToolCallEnd { index }),
        "message_delta" => {
            if let Some(reason) = value
                .get("delta")
                .and_then(|d| d.get("stop_reason"))
                .and_then(|v| v.as_str())
            {
                events.push(NormalizedEvent::StopReasonUpdate(reason.to_string()));
            }
            if let Some(usage) = value.get("usage") {
                push_usage(usage, &mut events);
            }
        }
        "message_stop" => events.push(NormalizedEvent::End),
        "error" => {
            let error = value.get("error").unwrap_or(value);
            events.push(NormalizedEvent::Error(ProviderFailure::from_error_object(
                error,
            )));
        }
        _ => {}
    }

    if events.is_empty() {
        events.push(NormalizedEvent::Other);
    }
    events
}

fn push_usage(usage: &Value, events: &mut Vec<NormalizedEvent>) {
    let input_tokens = as_u64(usage.get("input_tokens"));
    let output_tokens = as_u64(usage.get("output_tokens"));
    if input_tokens.is_some() || output_tokens.is_some() {
        events.push(NormalizedEvent::UsageUpdate {
            input_tokens,
            output_tokens,
        });
    }
}

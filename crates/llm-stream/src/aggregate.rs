//! Folds normalized events into the state a final result is built from.
//!
//! Invariants kept by [`AggregateState::apply`]:
//! - text only grows, in arrival order;
//! - a usage field moves from unknown to known, never back;
//! - the first stop reason is kept.
//!
//! Tool-call arguments are stored as raw fragments and parsed exactly once,
//! in [`AggregateState::snapshot`].

use std::collections::BTreeMap;

use tracing::warn;

use crate::content::{Completion, ContentPart, FinalResult, Message, Role, ToolCall, ToolInput, Usage};
use crate::errors::StreamError;
use crate::event::NormalizedEvent;

/// In-progress tool call keyed by its stream index.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolCallBuilder {
    pub id: Option<String>,
    pub name: Option<String>,
    pub argument_fragments: Vec<String>,
    /// The provider closed the block; no more fragments are expected.
    pub closed: bool,
}

impl ToolCallBuilder {
    /// All fragments joined in arrival order.
    pub fn arguments(&self) -> String {
        self.argument_fragments.concat()
    }

    fn finalize(&self) -> ToolCall {
        let raw = self.arguments();
        let input = if raw.trim().is_empty() {
            ToolInput::Parsed {
                value: serde_json::Value::Object(serde_json::Map::new()),
            }
        } else {
            match serde_json::from_str(&raw) {
                Ok(value) => ToolInput::Parsed { value },
                Err(e) => ToolInput::Invalid {
                    raw,
                    error: e.to_string(),
                },
            }
        };
        ToolCall {
            id: self.id.clone().unwrap_or_default(),
            name: self.name.clone().unwrap_or_default(),
            input,
        }
    }
}

/// Token counts; `None` means the provider has not reported the field yet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageCounters {
    pub input: Option<u64>,
    pub output: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregateState {
    pub text: String,
    pub tool_calls: BTreeMap<usize, ToolCallBuilder>,
    pub usage: UsageCounters,
    pub stop_reason: Option<String>,
}

impl AggregateState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one event. Returns an anomaly when the event conflicted with
    /// state already held; the existing value is kept in that case.
    pub fn apply(&mut self, event: &NormalizedEvent) -> Option<StreamError> {
        match event {
            NormalizedEvent::TextDelta(text) => {
                self.text.push_str(text);
                None
            }
            NormalizedEvent::ToolCallStart { index, id, name } => {
                let builder = self.tool_calls.entry(*index).or_default();
                let id_conflict = merge_field(&mut builder.id, id.as_deref());
                let name_conflict = merge_field(&mut builder.name, name.as_deref());
                id_conflict.or(name_conflict).map(|(kept, ignored)| {
                    anomaly(format!(
                        "tool call {index} identity changed mid-stream: kept {kept:?}, ignored {ignored:?}"
                    ))
                })
            }
            NormalizedEvent::ToolCallArgDelta { index, fragment } => {
                let builder = self.tool_calls.entry(*index).or_default();
                if builder.closed {
                    warn!(index, "argument fragment for a closed tool call");
                }
                builder.argument_fragments.push(fragment.clone());
                None
            }
            NormalizedEvent::ToolCallEnd { index } => {
                if let Some(builder) = self.tool_calls.get_mut(index) {
                    builder.closed = true;
                }
                None
            }
            NormalizedEvent::UsageUpdate {
                input_tokens,
                output_tokens,
            } => {
                if input_tokens.is_some() {
                    self.usage.input = *input_tokens;
                }
                if output_tokens.is_some() {
                    self.usage.output = *output_tokens;
                }
                None
            }
            NormalizedEvent::StopReasonUpdate(reason) => match &self.stop_reason {
                None => {
                    self.stop_reason = Some(reason.clone());
                    None
                }
                Some(existing) if existing == reason => None,
                Some(existing) => Some(anomaly(format!(
                    "conflicting stop reason: kept {existing:?}, ignored {reason:?}"
                ))),
            },
            NormalizedEvent::Error(_) | NormalizedEvent::End | NormalizedEvent::Other => None,
        }
    }

    /// Returns true once any content or metadata has been aggregated.
    pub fn has_data(&self) -> bool {
        !self.text.is_empty()
            || !self.tool_calls.is_empty()
            || self.usage != UsageCounters::default()
            || self.stop_reason.is_some()
    }

    /// Builds the final result. A tool call whose arguments fail to parse is
    /// kept as [`ToolInput::Invalid`] and does not affect the rest.
    pub fn snapshot(&self, completion: Completion) -> FinalResult {
        let mut content = Vec::with_capacity(self.tool_calls.len() + 1);
        if !self.text.is_empty() {
            content.push(ContentPart::Text(self.text.clone()));
        }
        content.extend(
            self.tool_calls
                .values()
                .map(|builder| ContentPart::ToolCall(builder.finalize())),
        );

        let input = self.usage.input.unwrap_or(0);
        let output = self.usage.output.unwrap_or(0);
        FinalResult {
            message: Message {
                role: Role::Assistant,
                content,
            },
            usage: Usage {
                input,
                output,
                total: input.saturating_add(output),
                input_reported: self.usage.input.is_some(),
                output_reported: self.usage.output.is_some(),
            },
            stop_reason: self.stop_reason.clone(),
            completion,
        }
    }
}

/// Fills an absent field. Returns `(kept, ignored)` when a different value
/// was already present.
fn merge_field(slot: &mut Option<String>, incoming: Option<&str>) -> Option<(String, String)> {
    let incoming = incoming.filter(|v| !v.is_empty())?;
    match slot.as_deref() {
        Some(existing) if !existing.is_empty() => {
            (existing != incoming).then(|| (existing.to_string(), incoming.to_string()))
        }
        _ => {
            *slot = Some(incoming.to_string());
            None
        }
    }
}

fn anomaly(message: String) -> StreamError {
    StreamError::AggregationAnomaly { message }
}

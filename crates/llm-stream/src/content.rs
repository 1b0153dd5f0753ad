use crate::errors::CancelReason;

/// Author of the reconstructed message. Streams only ever produce assistant
/// turns.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Assistant,
}

/// Arguments of a finalized tool call.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolInput {
    /// The concatenated fragments parsed as JSON.
    Parsed { value: serde_json::Value },
    /// The concatenated fragments were not valid JSON.
    Invalid { raw: String, error: String },
}

impl ToolInput {
    /// Returns the parsed arguments, if parsing succeeded.
    pub fn value(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Parsed { value } => Some(value),
            Self::Invalid { .. } => None,
        }
    }
}

/// A tool invocation reconstructed from streamed fragments.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: ToolInput,
}

/// Output content produced by a generation, in stream order.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[non_exhaustive]
pub enum ContentPart {
    Text(String),
    ToolCall(ToolCall),
}

/// The reconstructed assistant message.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentPart>,
}

impl Message {
    /// Concatenates all text parts in order and ignores tool calls.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for part in &self.content {
            if let ContentPart::Text(text) = part {
                out.push_str(text);
            }
        }
        out
    }

    pub fn tool_calls(&self) -> impl Iterator<Item = &ToolCall> {
        self.content.iter().filter_map(|part| match part {
            ContentPart::ToolCall(call) => Some(call),
            ContentPart::Text(_) => None,
        })
    }
}

/// Token usage at stream end.
///
/// `input`/`output` are 0 when never reported; the `*_reported` flags tell
/// an observed zero apart from a missing count.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Usage {
    pub input: u64,
    pub output: u64,
    pub total: u64,
    pub input_reported: bool,
    pub output_reported: bool,
}

/// Why a snapshot does not describe a cleanly finished generation.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum IncompleteReason {
    Transport { message: String },
    Provider { message: String },
    Cancelled { cause: CancelReason },
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Completion {
    Complete,
    Incomplete(IncompleteReason),
}

/// Immutable snapshot of everything a generation produced.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct FinalResult {
    pub message: Message,
    pub usage: Usage,
    pub stop_reason: Option<String>,
    pub completion: Completion,
}

impl FinalResult {
    pub fn text(&self) -> String {
        self.message.text()
    }

    pub fn tool_calls(&self) -> Vec<&ToolCall> {
        self.message.tool_calls().collect()
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.completion, Completion::Complete)
    }
}

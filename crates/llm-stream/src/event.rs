/// Provider-independent meaning of one classified frame.
///
/// A single wire frame may classify into several events (for example a tool
/// call's name and its first argument fragment), so classifiers return
/// `Vec<NormalizedEvent>`.
#[derive(Clone, Debug, PartialEq)]
pub enum NormalizedEvent {
    /// Incremental assistant text.
    TextDelta(String),
    /// A tool call was announced, or more of its identity arrived.
    ToolCallStart {
        index: usize,
        id: Option<String>,
        name: Option<String>,
    },
    /// A fragment of a tool call's JSON argument string.
    ToolCallArgDelta { index: usize, fragment: String },
    /// The provider closed the content block holding a tool call.
    ToolCallEnd { index: usize },
    /// Token counts; only the fields present on the wire are `Some`.
    UsageUpdate {
        input_tokens: Option<u64>,
        output_tokens: Option<u64>,
    },
    /// Explicit finish signal.
    StopReasonUpdate(String),
    /// In-band provider error frame.
    Error(ProviderFailure),
    /// Explicit end-of-stream sentinel (`[DONE]`, `message_stop`).
    End,
    /// Recognized envelope with nothing the aggregate cares about.
    Other,
}

impl NormalizedEvent {
    /// Short label used in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TextDelta(_) => "text_delta",
            Self::ToolCallStart { .. } => "tool_call_start",
            Self::ToolCallArgDelta { .. } => "tool_call_arg_delta",
            Self::ToolCallEnd { .. } => "tool_call_end",
            Self::UsageUpdate { .. } => "usage_update",
            Self::StopReasonUpdate(_) => "stop_reason",
            Self::Error(_) => "error",
            Self::End => "end",
            Self::Other => "other",
        }
    }
}

/// Structured error payload reported in-band by a provider.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ProviderFailure {
    /// Vendor error type (`overloaded_error`, `server_error`, ...), when given.
    pub error_type: Option<String>,
    pub message: String,
    /// The provider's error object exactly as received.
    pub payload: serde_json::Value,
}

impl ProviderFailure {
    /// Builds a failure from a vendor error object such as
    /// `{"type": "...", "message": "..."}`.
    pub fn from_error_object(payload: &serde_json::Value) -> Self {
        let error_type = payload
            .get("type")
            .or_else(|| payload.get("code"))
            .and_then(|v| v.as_str())
            .map(ToOwned::to_owned);
        let message = payload
            .get("message")
            .and_then(|v| v.as_str())
            .or_else(|| payload.as_str())
            .unwrap_or("provider reported an error")
            .to_string();
        Self {
            error_type,
            message,
            payload: payload.clone(),
        }
    }
}

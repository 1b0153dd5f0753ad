//! Vendor wire vocabularies.
//!
//! Each provider pairs a frame [`Grammar`] with a classifier that maps parsed
//! frames to [`NormalizedEvent`]s. The pair is chosen once per generation via
//! [`ProviderKind`].
mod anthropic;
mod openai;

use std::fmt;
use std::str::FromStr;

use crate::event::NormalizedEvent;
use crate::sse::Grammar;

/// Closed set of supported streaming protocols.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Chat-completions style `data: <json>` chunks terminated by `[DONE]`.
    OpenAi,
    /// Named `event:` blocks (`message_start` ... `message_stop`).
    Anthropic,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
        }
    }

    /// Frame grammar spoken by this provider.
    pub fn grammar(&self) -> Grammar {
        match self {
            Self::OpenAi => Grammar::LineJson,
            Self::Anthropic => Grammar::NamedEvent,
        }
    }

    /// Classifies one parsed frame. `event_name` is the SSE `event:` field,
    /// when the frame had one.
    pub fn classify(
        &self,
        event_name: Option<&str>,
        value: &serde_json::Value,
    ) -> Vec<NormalizedEvent> {
        match self {
            Self::OpenAi => openai::classify(value),
            Self::Anthropic => anthropic::classify(event_name, value),
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "anthropic" => Ok(Self::Anthropic),
            other => Err(format!("unknown provider kind: {other}")),
        }
    }
}

fn as_u64(value: Option<&serde_json::Value>) -> Option<u64> {
    value.and_then(|v| v.as_u64())
}

fn as_string(value: Option<&serde_json::Value>) -> Option<String> {
    value.and_then(|v| v.as_str()).map(ToOwned::to_owned)
}

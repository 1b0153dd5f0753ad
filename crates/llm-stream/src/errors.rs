use std::time::Duration;

use crate::content::FinalResult;
use crate::event::ProviderFailure;
use crate::vendors::ProviderKind;

/// Coarse classification used to decide how an error propagates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// One frame could not be parsed; the stream continues.
    FrameDecode,
    /// Reading from the byte source failed.
    Transport,
    /// The provider sent an explicit error frame.
    Provider,
    /// Conflicting data that the aggregate resolved deterministically.
    AggregationAnomaly,
    /// The caller aborted the generation or its timeout elapsed.
    Cancelled,
}

/// Why a generation stopped before the provider finished.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum CancelReason {
    /// `AbortHandle::abort` was called.
    Aborted,
    /// The configured timeout elapsed.
    TimedOut { after: Duration },
}

/// Every error the engine reports, through `on_error` or a terminal result.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StreamError {
    /// A single frame's payload was not valid JSON.
    #[error("frame decode error ({provider}): {message}")]
    FrameDecode {
        provider: ProviderKind,
        message: String,
        data: String,
    },
    /// Transport or stream I/O failed.
    #[error("transport error ({provider}): {message}")]
    Transport {
        provider: ProviderKind,
        message: String,
    },
    /// In-band error reported by the provider.
    #[error("provider error ({provider}): {}", failure.message)]
    Provider {
        provider: ProviderKind,
        failure: ProviderFailure,
    },
    /// The aggregate saw conflicting values and kept the first one.
    #[error("aggregation anomaly: {message}")]
    AggregationAnomaly { message: String },
    /// The generation was cancelled.
    #[error("generation cancelled ({reason:?}, mid_frame={mid_frame})")]
    Cancelled { reason: CancelReason, mid_frame: bool },
}

impl StreamError {
    /// Creates a frame-level decode error.
    pub fn frame_decode(
        provider: ProviderKind,
        message: impl Into<String>,
        data: impl Into<String>,
    ) -> Self {
        Self::FrameDecode {
            provider,
            message: message.into(),
            data: data.into(),
        }
    }

    /// Creates a transport-level error.
    pub fn transport(provider: ProviderKind, message: impl Into<String>) -> Self {
        Self::Transport {
            provider,
            message: message.into(),
        }
    }

    /// Creates an error for an in-band provider failure.
    pub fn provider(provider: ProviderKind, failure: ProviderFailure) -> Self {
        Self::Provider { provider, failure }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::FrameDecode { .. } => ErrorKind::FrameDecode,
            Self::Transport { .. } => ErrorKind::Transport,
            Self::Provider { .. } => ErrorKind::Provider,
            Self::AggregationAnomaly { .. } => ErrorKind::AggregationAnomaly,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
        }
    }

    /// Returns true if this error ends the generation.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Transport | ErrorKind::Provider | ErrorKind::Cancelled
        )
    }

    /// The provider's structured error object, for in-band errors.
    pub fn provider_payload(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Provider { failure, .. } => Some(&failure.payload),
            _ => None,
        }
    }
}

/// Terminal failure returned by the deferred accessors.
///
/// `partial` is `None` when the generation failed before any data was
/// aggregated; otherwise it holds everything seen so far, tagged
/// `Completion::Incomplete`.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{error}")]
pub struct GenerationError {
    pub error: StreamError,
    pub partial: Option<FinalResult>,
}

impl GenerationError {
    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }

    pub fn partial(&self) -> Option<&FinalResult> {
        self.partial.as_ref()
    }
}

/// Invalid configuration or builder input.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {message}")]
    InvalidEnv { key: String, message: String },
    #[error("validation error: {0}")]
    Validation(String),
}

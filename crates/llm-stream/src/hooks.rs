use chrono::{DateTime, Utc};

use crate::content::{FinalResult, Usage};
use crate::errors::StreamError;
use crate::event::NormalizedEvent;

/// Lifecycle callbacks invoked from the read loop.
///
/// Every method defaults to a no-op. Hooks run synchronously between chunks,
/// so implementations should return quickly.
pub trait GenerationHooks: Send + Sync {
    /// Called once before the first byte is read.
    fn on_before_call(&self, _at: DateTime<Utc>, _request: &serde_json::Value) {}

    /// Called for every classified event together with the frame's JSON.
    fn on_message(&self, _at: DateTime<Utc>, _event: &NormalizedEvent, _raw: &serde_json::Value) {}

    /// Called for every error. Non-fatal errors may be reported many times
    /// before the stream ends; see [`StreamError::is_fatal`].
    fn on_error(&self, _at: DateTime<Utc>, _error: &StreamError, _raw: Option<&serde_json::Value>) {}

    /// Called once when the generation completes cleanly.
    fn on_finish(
        &self,
        _at: DateTime<Utc>,
        _result: &FinalResult,
        _usage: &Usage,
        _stop_reason: Option<&str>,
        _last_raw: Option<&serde_json::Value>,
    ) {
    }
}

/// Hooks that ignore every callback.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl GenerationHooks for NoopHooks {}

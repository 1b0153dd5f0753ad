//! Streaming response normalization for LLM providers.
//!
//! Turns a vendor's server-sent-event byte stream into two views: a live
//! sequence of text increments for display, and a reconstructed final
//! message (text, tool calls with parsed arguments, usage, stop reason)
//! that resolves once the stream is over.
//!
//! Vendor wire formats are namespaced under `vendors::*`.
//!
//! # Usage
//!
//! ```no_run
//! use llm_stream::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let response = reqwest::Client::new()
//!     .post("https://api.openai.com/v1/chat/completions")
//!     .bearer_auth(std::env::var("OPENAI_API_KEY")?)
//!     .json(&serde_json::json!({
//!         "model": "gpt-4o-mini",
//!         "stream": true,
//!         "messages": [{"role": "user", "content": "Say hello"}],
//!     }))
//!     .send()
//!     .await?;
//!
//! let mut generation = generate(ProviderKind::OpenAi).start(ByteSource::from_response(response))?;
//! while let Some(text) = generation.next_text().await {
//!     print!("{}", text?);
//! }
//! let result = generation.finish().await?;
//! println!("\nstop reason: {:?}", result.stop_reason);
//! # Ok(())
//! # }
//! ```

/// Folds normalized events into the final result.
pub mod aggregate;
/// Engine settings.
pub mod config;
/// Final message types.
pub mod content;
/// Error taxonomy.
pub mod errors;
/// Vendor-neutral events.
pub mod event;
/// Generation coordinator and its handles.
pub mod generate;
/// Lifecycle callbacks.
pub mod hooks;
/// Tracing subscriber setup.
pub mod observability;
/// Convenience re-exports.
pub mod prelude;
/// Byte sources feeding a generation.
pub mod source;
/// Server-sent-event framing.
pub mod sse;
/// Vendor-specific classifiers.
pub mod vendors;

pub use config::StreamConfig;
pub use content::{
    Completion, ContentPart, FinalResult, IncompleteReason, Message, Role, ToolCall, ToolInput,
    Usage,
};
pub use errors::{CancelReason, ConfigError, ErrorKind, GenerationError, StreamError};
pub use event::{NormalizedEvent, ProviderFailure};
pub use generate::{
    AbortHandle, GenerateBuilder, Generation, ResultHandle, TextStream, generate,
};
pub use hooks::{GenerationHooks, NoopHooks};
pub use observability::{ObservabilitySettings, init_observability};
pub use source::ByteSource;
pub use vendors::ProviderKind;

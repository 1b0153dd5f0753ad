//! Common imports for typical usage.
pub use crate::{
    AbortHandle, ByteSource, FinalResult, GenerateBuilder, Generation, GenerationError,
    GenerationHooks, ProviderKind, ResultHandle, StreamConfig, StreamError, TextStream, generate,
};

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt as _};
use tracing::debug;

type BoxedBytes = Pin<Box<dyn Stream<Item = Result<bytes::Bytes, String>> + Send + 'static>>;

/// Ordered byte stream over an already-opened response body.
///
/// Read errors are carried as strings; the engine classifies them as
/// transport errors.
pub struct ByteSource {
    inner: BoxedBytes,
}

impl ByteSource {
    /// Wraps any byte stream whose error type can be displayed.
    pub fn new<S, E>(stream: S) -> Self
    where
        S: Stream<Item = Result<bytes::Bytes, E>> + Send + 'static,
        E: std::fmt::Display + 'static,
    {
        Self {
            inner: Box::pin(stream.map(|item| item.map_err(|e| e.to_string()))),
        }
    }

    /// Reads the body of a streaming `reqwest` response.
    pub fn from_response(response: reqwest::Response) -> Self {
        Self::new(response.bytes_stream())
    }

    /// Byte source over in-memory chunks (captured traces, tests).
    pub fn from_chunks<I, B>(chunks: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<bytes::Bytes>,
    {
        let items: Vec<Result<bytes::Bytes, String>> =
            chunks.into_iter().map(|c| Ok(c.into())).collect();
        Self {
            inner: Box::pin(futures::stream::iter(items)),
        }
    }
}

impl Stream for ByteSource {
    type Item = Result<bytes::Bytes, String>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

/// Owns the byte source for one generation and releases it exactly once,
/// on whichever path the read loop exits.
pub(crate) struct SourceGuard {
    source: Option<ByteSource>,
    generation_id: uuid::Uuid,
}

impl SourceGuard {
    pub(crate) fn new(source: ByteSource, generation_id: uuid::Uuid) -> Self {
        Self {
            source: Some(source),
            generation_id,
        }
    }

    /// Reads the next chunk. Returns `None` after the source is exhausted or
    /// released.
    pub(crate) async fn next_chunk(&mut self) -> Option<Result<bytes::Bytes, String>> {
        match self.source.as_mut() {
            Some(source) => source.next().await,
            None => None,
        }
    }

    /// Drops the underlying source. Later calls are no-ops.
    pub(crate) fn release(&mut self) {
        if self.source.take().is_some() {
            debug!(generation_id = %self.generation_id, "byte source released");
        }
    }
}

impl Drop for SourceGuard {
    fn drop(&mut self) {
        self.release();
    }
}

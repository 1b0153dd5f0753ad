//! Generation coordinator.
//!
//! One spawned read loop per generation owns the byte source, the frame
//! decoder and the [`AggregateState`]. It feeds two audiences:
//!
//! * a live [`TextStream`] of text increments, over a bounded channel so a
//!   slow reader suspends the loop instead of letting it buffer;
//! * a [`ResultHandle`] whose accessors resolve exactly once, after the loop
//!   has finished, with the reconstructed [`FinalResult`].
//!
//! Frames from one chunk are classified and folded synchronously. The loop
//! only suspends to read the next chunk or to hand text to the reader.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt as _;
use futures::future::{BoxFuture, Shared};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{Instrument as _, debug, info, info_span, warn};

use crate::aggregate::AggregateState;
use crate::config::StreamConfig;
use crate::content::{Completion, FinalResult, IncompleteReason, Message, Usage};
use crate::errors::{CancelReason, ConfigError, GenerationError, StreamError};
use crate::event::NormalizedEvent;
use crate::hooks::{GenerationHooks, NoopHooks};
use crate::source::{ByteSource, SourceGuard};
use crate::sse::{DecodedFrame, FrameDecoder};
use crate::vendors::ProviderKind;

type Outcome = Result<FinalResult, GenerationError>;
type TextItem = Result<String, StreamError>;

/// Starts configuring a generation for the given provider protocol.
pub fn generate(provider: ProviderKind) -> GenerateBuilder {
    GenerateBuilder::new(provider)
}

/// Handle used to cancel a running generation.
#[derive(Clone)]
pub struct AbortHandle {
    tx: watch::Sender<bool>,
}

impl AbortHandle {
    /// Requests cancellation.
    ///
    /// The read loop stops at its next suspension point; the result handle
    /// then rejects with `StreamError::Cancelled` carrying the partial result.
    pub fn abort(&self) {
        let _ = self.tx.send(true);
    }
}

/// Builder for a single streaming generation.
pub struct GenerateBuilder {
    provider: ProviderKind,
    config: StreamConfig,
    request: serde_json::Value,
    hooks: Arc<dyn GenerationHooks>,
}

impl GenerateBuilder {
    pub fn new(provider: ProviderKind) -> Self {
        Self {
            provider,
            config: StreamConfig::default(),
            request: serde_json::Value::Null,
            hooks: Arc::new(NoopHooks),
        }
    }

    /// Replaces the whole engine config.
    pub fn config(mut self, config: StreamConfig) -> Self {
        self.config = config;
        self
    }

    /// Cancels the generation if it has not completed after `timeout`.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = Some(timeout);
        self
    }

    pub fn text_buffer_capacity(mut self, capacity: usize) -> Self {
        self.config.text_buffer_capacity = capacity;
        self
    }

    /// Request body passed to `on_before_call`. The engine does not send it.
    pub fn request_payload(mut self, request: serde_json::Value) -> Self {
        self.request = request;
        self
    }

    pub fn hooks(mut self, hooks: Arc<dyn GenerationHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Validates the configuration and spawns the read loop over `source`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(self, source: ByteSource) -> Result<Generation, ConfigError> {
        self.config.validate()?;

        let id = uuid::Uuid::new_v4();
        let (text_tx, text_rx) = mpsc::channel(self.config.text_buffer_capacity);
        let (final_tx, final_rx) = oneshot::channel();
        let (abort_tx, abort_rx) = watch::channel(false);

        let provider = self.provider;
        let read_loop = ReadLoop {
            provider,
            decoder: FrameDecoder::new(provider.grammar()),
            state: AggregateState::new(),
            hooks: self.hooks,
            text_tx: Some(text_tx),
            last_raw: None,
        };
        let interrupts = Interrupts {
            abort_rx,
            abort_open: true,
            deadline: self.config.timeout.map(|t| Instant::now() + t),
            timeout: self.config.timeout,
        };
        let span = info_span!("generation", generation_id = %id, provider = %provider);
        tokio::spawn(
            run_generation(
                read_loop,
                SourceGuard::new(source, id),
                self.request,
                interrupts,
                final_tx,
            )
            .instrument(span),
        );

        Ok(Generation {
            id,
            provider,
            text: TextStream { rx: text_rx },
            result: ResultHandle::new(provider, final_rx),
            abort: AbortHandle { tx: abort_tx },
        })
    }
}

/// A running generation: live text, deferred result, cancellation.
pub struct Generation {
    id: uuid::Uuid,
    provider: ProviderKind,
    text: TextStream,
    result: ResultHandle,
    abort: AbortHandle,
}

impl Generation {
    pub fn id(&self) -> uuid::Uuid {
        self.id
    }

    pub fn provider(&self) -> ProviderKind {
        self.provider
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// A cloneable handle to the deferred accessors.
    pub fn result_handle(&self) -> ResultHandle {
        self.result.clone()
    }

    /// Waits for the next live text increment.
    pub async fn next_text(&mut self) -> Option<TextItem> {
        self.text.next_text().await
    }

    /// Splits the generation so the text stream and the result can be
    /// consumed from different tasks.
    pub fn into_parts(self) -> (TextStream, ResultHandle, AbortHandle) {
        (self.text, self.result, self.abort)
    }

    /// Drains any unread text and returns the final result.
    pub async fn finish(mut self) -> Outcome {
        while self.text.next_text().await.is_some() {}
        self.result.final_result().await
    }
}

/// Live, single-pass sequence of text increments.
///
/// Ends with `None` on completion or cancellation, and yields one `Err`
/// before ending when the generation fails (or is cancelled mid-frame).
pub struct TextStream {
    rx: mpsc::Receiver<TextItem>,
}

impl TextStream {
    pub async fn next_text(&mut self) -> Option<TextItem> {
        self.rx.recv().await
    }
}

impl futures::Stream for TextStream {
    type Item = TextItem;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Deferred accessors over the final result.
///
/// Each accessor resolves once the read loop has finished. The loop only
/// finishes if the [`TextStream`] is being read or has been dropped.
#[derive(Clone)]
pub struct ResultHandle {
    outcome: Shared<BoxFuture<'static, Outcome>>,
}

impl ResultHandle {
    fn new(provider: ProviderKind, rx: oneshot::Receiver<Outcome>) -> Self {
        let outcome = async move {
            rx.await.unwrap_or_else(|_| {
                Err(GenerationError {
                    error: StreamError::transport(
                        provider,
                        "generation task ended without a result",
                    ),
                    partial: None,
                })
            })
        }
        .boxed()
        .shared();
        Self { outcome }
    }

    pub async fn final_result(&self) -> Outcome {
        self.outcome.clone().await
    }

    pub async fn final_message(&self) -> Result<Message, GenerationError> {
        self.final_result().await.map(|r| r.message)
    }

    pub async fn usage(&self) -> Result<Usage, GenerationError> {
        self.final_result().await.map(|r| r.usage)
    }

    pub async fn stop_reason(&self) -> Result<Option<String>, GenerationError> {
        self.final_result().await.map(|r| r.stop_reason)
    }
}

enum Termination {
    Complete,
    Fatal {
        error: StreamError,
        raw: Option<serde_json::Value>,
    },
    Cancelled(CancelReason),
}

/// Abort and timeout signals; both end the loop as a cancellation.
struct Interrupts {
    abort_rx: watch::Receiver<bool>,
    abort_open: bool,
    deadline: Option<Instant>,
    timeout: Option<Duration>,
}

impl Interrupts {
    async fn wait(&mut self) -> CancelReason {
        loop {
            tokio::select! {
                changed = self.abort_rx.changed(), if self.abort_open => match changed {
                    Ok(()) => {
                        if *self.abort_rx.borrow_and_update() {
                            return CancelReason::Aborted;
                        }
                    }
                    // Every abort handle was dropped.
                    Err(_) => self.abort_open = false,
                },
                _ = sleep_or_pending(self.deadline) => {
                    return CancelReason::TimedOut {
                        after: self.timeout.unwrap_or_default(),
                    };
                }
            }
        }
    }
}

async fn sleep_or_pending(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

struct ReadLoop {
    provider: ProviderKind,
    decoder: FrameDecoder,
    state: AggregateState,
    hooks: Arc<dyn GenerationHooks>,
    /// `None` once the live reader dropped its stream.
    text_tx: Option<mpsc::Sender<TextItem>>,
    last_raw: Option<serde_json::Value>,
}

async fn run_generation(
    mut read_loop: ReadLoop,
    mut source: SourceGuard,
    request: serde_json::Value,
    mut interrupts: Interrupts,
    final_tx: oneshot::Sender<Outcome>,
) {
    read_loop.hooks.on_before_call(Utc::now(), &request);
    debug!("read loop started");

    let termination = loop {
        let next = tokio::select! {
            biased;
            reason = interrupts.wait() => break Termination::Cancelled(reason),
            next = source.next_chunk() => next,
        };
        let frames = match next {
            Some(Ok(chunk)) => read_loop.decoder.push_chunk(&chunk),
            Some(Err(message)) => {
                break Termination::Fatal {
                    error: StreamError::transport(read_loop.provider, message),
                    raw: None,
                };
            }
            None => {
                // An unparseable tail means the body was cut off mid-frame.
                let (truncated, frames): (Vec<_>, Vec<_>) = read_loop
                    .decoder
                    .finish()
                    .into_iter()
                    .partition(|frame| matches!(frame, DecodedFrame::Invalid { .. }));
                let (texts, ended) = read_loop.process_frames(frames);
                if let Some(cancelled) = read_loop.deliver(texts, &mut interrupts).await {
                    break cancelled;
                }
                if let Some(ended) = ended {
                    break ended;
                }
                break match truncated.into_iter().next() {
                    Some(DecodedFrame::Invalid { frame, error }) => Termination::Fatal {
                        error: StreamError::transport(
                            read_loop.provider,
                            format!(
                                "byte source ended mid-frame ({} bytes unparsed): {error}",
                                frame.data.len()
                            ),
                        ),
                        raw: None,
                    },
                    _ => Termination::Complete,
                };
            }
        };
        let (texts, ended) = read_loop.process_frames(frames);
        if let Some(cancelled) = read_loop.deliver(texts, &mut interrupts).await {
            break cancelled;
        }
        if let Some(ended) = ended {
            break ended;
        }
    };

    source.release();
    read_loop.terminate(termination, final_tx).await;
}

impl ReadLoop {
    /// Classifies and folds decoded frames. Returns the text to deliver and,
    /// if a frame ended the stream, how it ended. Frames after the end are
    /// ignored.
    fn process_frames(&mut self, frames: Vec<DecodedFrame>) -> (Vec<String>, Option<Termination>) {
        let mut texts = Vec::new();
        for frame in frames {
            let (event_name, value) = match frame {
                DecodedFrame::Json { frame, value } => (frame.event, value),
                DecodedFrame::Done => {
                    let raw = serde_json::Value::String("[DONE]".into());
                    self.hooks.on_message(Utc::now(), &NormalizedEvent::End, &raw);
                    return (texts, Some(Termination::Complete));
                }
                DecodedFrame::Invalid { frame, error } => {
                    let err = StreamError::frame_decode(self.provider, error, frame.data);
                    warn!(error = %err, "skipping undecodable frame");
                    self.hooks.on_error(Utc::now(), &err, None);
                    continue;
                }
            };

            for event in self.provider.classify(event_name.as_deref(), &value) {
                debug!(kind = event.kind(), "classified event");
                self.hooks.on_message(Utc::now(), &event, &value);
                match &event {
                    NormalizedEvent::TextDelta(text) => texts.push(text.clone()),
                    NormalizedEvent::Error(failure) => {
                        let error = StreamError::provider(self.provider, failure.clone());
                        return (texts, Some(Termination::Fatal { error, raw: Some(value) }));
                    }
                    NormalizedEvent::End => {
                        self.last_raw = Some(value);
                        return (texts, Some(Termination::Complete));
                    }
                    _ => {}
                }
                if let Some(anomaly) = self.state.apply(&event) {
                    warn!(error = %anomaly, "aggregation anomaly");
                    self.hooks.on_error(Utc::now(), &anomaly, Some(&value));
                }
            }
            self.last_raw = Some(value);
        }
        (texts, None)
    }

    /// Hands text to the live reader, waiting while its buffer is full.
    async fn deliver(
        &mut self,
        texts: Vec<String>,
        interrupts: &mut Interrupts,
    ) -> Option<Termination> {
        for text in texts {
            let Some(tx) = self.text_tx.as_ref() else {
                return None;
            };
            let reader_gone = tokio::select! {
                biased;
                reason = interrupts.wait() => return Some(Termination::Cancelled(reason)),
                sent = tx.send(Ok(text)) => sent.is_err(),
            };
            if reader_gone {
                debug!("live text reader dropped; continuing aggregation");
                self.text_tx = None;
            }
        }
        None
    }

    async fn terminate(mut self, termination: Termination, final_tx: oneshot::Sender<Outcome>) {
        let (outcome, text_error) = match termination {
            Termination::Complete => {
                let result = self.state.snapshot(Completion::Complete);
                if result.stop_reason.is_none() {
                    warn!("stream completed without a stop reason");
                }
                info!(
                    text_len = result.text().len(),
                    tool_calls = result.tool_calls().len(),
                    total_tokens = result.usage.total,
                    "generation completed"
                );
                self.hooks.on_finish(
                    Utc::now(),
                    &result,
                    &result.usage,
                    result.stop_reason.as_deref(),
                    self.last_raw.as_ref(),
                );
                (Ok(result), None)
            }
            Termination::Fatal { error, raw } => {
                warn!(error = %error, "generation failed");
                self.hooks.on_error(Utc::now(), &error, raw.as_ref());
                let reason = match &error {
                    StreamError::Provider { failure, .. } => IncompleteReason::Provider {
                        message: failure.message.clone(),
                    },
                    other => IncompleteReason::Transport {
                        message: other.to_string(),
                    },
                };
                let partial = self
                    .state
                    .has_data()
                    .then(|| self.state.snapshot(Completion::Incomplete(reason)));
                (
                    Err(GenerationError {
                        error: error.clone(),
                        partial,
                    }),
                    Some(error),
                )
            }
            Termination::Cancelled(reason) => {
                let mid_frame = self.decoder.has_partial();
                info!(?reason, mid_frame, "generation cancelled");
                let error = StreamError::Cancelled {
                    reason: reason.clone(),
                    mid_frame,
                };
                let partial = self
                    .state
                    .snapshot(Completion::Incomplete(IncompleteReason::Cancelled { cause: reason }));
                (
                    Err(GenerationError {
                        error: error.clone(),
                        partial: Some(partial),
                    }),
                    mid_frame.then_some(error),
                )
            }
        };

        let _ = final_tx.send(outcome);
        if let (Some(tx), Some(error)) = (self.text_tx.take(), text_error) {
            let _ = tx.send(Err(error)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::{ToolCall, ToolInput};
    use crate::errors::ErrorKind;
    use futures::StreamExt as _;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingHooks {
        before: AtomicUsize,
        messages: Mutex<Vec<&'static str>>,
        raws: Mutex<Vec<serde_json::Value>>,
        errors: Mutex<Vec<(ErrorKind, Option<serde_json::Value>)>>,
        finishes: AtomicUsize,
    }

    impl GenerationHooks for RecordingHooks {
        fn on_before_call(&self, _at: chrono::DateTime<Utc>, _request: &serde_json::Value) {
            self.before.fetch_add(1, Ordering::SeqCst);
        }

        fn on_message(
            &self,
            _at: chrono::DateTime<Utc>,
            event: &NormalizedEvent,
            raw: &serde_json::Value,
        ) {
            self.messages.lock().unwrap().push(event.kind());
            self.raws.lock().unwrap().push(raw.clone());
        }

        fn on_error(
            &self,
            _at: chrono::DateTime<Utc>,
            error: &StreamError,
            raw: Option<&serde_json::Value>,
        ) {
            self.errors
                .lock()
                .unwrap()
                .push((error.kind(), raw.cloned()));
        }

        fn on_finish(
            &self,
            _at: chrono::DateTime<Utc>,
            _result: &FinalResult,
            _usage: &Usage,
            _stop_reason: Option<&str>,
            _last_raw: Option<&serde_json::Value>,
        ) {
            self.finishes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn openai_text(text: &str) -> String {
        format!(
            "data: {}\n\n",
            serde_json::json!({"choices":[{"index":0,"delta":{"content":text}}]})
        )
    }

    fn openai_stop(reason: &str) -> String {
        format!(
            "data: {}\n\n",
            serde_json::json!({"choices":[{"index":0,"delta":{},"finish_reason":reason}]})
        )
    }

    fn start(provider: ProviderKind, source: ByteSource) -> (Generation, Arc<RecordingHooks>) {
        let hooks = Arc::new(RecordingHooks::default());
        let generation = generate(provider)
            .hooks(hooks.clone())
            .start(source)
            .expect("start");
        (generation, hooks)
    }

    async fn collect_text(generation: &mut Generation) -> (Vec<String>, Option<StreamError>) {
        let mut texts = Vec::new();
        while let Some(item) = generation.next_text().await {
            match item {
                Ok(text) => texts.push(text),
                Err(err) => return (texts, Some(err)),
            }
        }
        (texts, None)
    }

    #[tokio::test]
    async fn scenario_a_live_text_and_final_content() {
        let source = ByteSource::from_chunks(vec![
            openai_text("Hel"),
            openai_text("lo"),
            openai_stop("stop"),
            "data: [DONE]\n\n".to_string(),
        ]);
        let (mut generation, hooks) = start(ProviderKind::OpenAi, source);

        let (texts, error) = collect_text(&mut generation).await;
        assert_eq!(texts, vec!["Hel", "lo"]);
        assert!(error.is_none());

        let result = generation.finish().await.expect("final");
        assert_eq!(result.text(), "Hello");
        assert_eq!(result.stop_reason.as_deref(), Some("stop"));
        assert!(result.is_complete());
        assert_eq!(hooks.before.load(Ordering::SeqCst), 1);
        assert_eq!(hooks.finishes.load(Ordering::SeqCst), 1);
        assert!(hooks.errors.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn scenario_b_tool_call_reassembled_across_chunks() {
        let frames = [
            serde_json::json!({"choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"id":"id1","type":"function","function":{"name":"getWeather","arguments":""}}]}}]}),
            serde_json::json!({"choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"city\":"}}]}}]}),
            serde_json::json!({"choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"Paris\"}"}}]}}]}),
            serde_json::json!({"choices":[{"index":0,"delta":{},"finish_reason":"tool_calls"}]}),
        ];
        let mut wire: String = frames.iter().map(|f| format!("data: {f}\n\n")).collect();
        wire.push_str("data: [DONE]\n\n");
        // Split at arbitrary byte offsets so frames straddle chunks.
        let bytes = wire.into_bytes();
        let chunks: Vec<Vec<u8>> = bytes.chunks(13).map(|c| c.to_vec()).collect();

        let (generation, _hooks) = start(ProviderKind::OpenAi, ByteSource::from_chunks(chunks));
        let result = generation.finish().await.expect("final");
        assert_eq!(
            result.tool_calls(),
            vec![&ToolCall {
                id: "id1".into(),
                name: "getWeather".into(),
                input: ToolInput::Parsed {
                    value: serde_json::json!({"city":"Paris"}),
                },
            }]
        );
        assert_eq!(result.stop_reason.as_deref(), Some("tool_calls"));
    }

    #[tokio::test]
    async fn scenario_c_transport_failure_keeps_partial_text() {
        let items: Vec<Result<bytes::Bytes, String>> = vec![
            Ok(format!("{}{}", openai_text("partial text "), openai_text("so far")).into()),
            Err("connection reset by peer".into()),
        ];
        let (mut generation, hooks) =
            start(ProviderKind::OpenAi, ByteSource::new(futures::stream::iter(items)));

        let (texts, error) = collect_text(&mut generation).await;
        assert_eq!(texts, vec!["partial text ", "so far"]);
        assert_eq!(error.map(|e| e.kind()), Some(ErrorKind::Transport));

        let err = generation
            .result_handle()
            .final_message()
            .await
            .expect_err("transport failure");
        assert_eq!(err.kind(), ErrorKind::Transport);
        let partial = err.partial().expect("partial result");
        assert_eq!(partial.text(), "partial text so far");
        assert!(matches!(
            partial.completion,
            Completion::Incomplete(IncompleteReason::Transport { .. })
        ));

        let errors = hooks.errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0, ErrorKind::Transport);
        assert_eq!(hooks.finishes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn scenario_d_in_band_error_is_fatal_with_payload() {
        let error_frame = serde_json::json!({"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}});
        let source = ByteSource::from_chunks(vec![
            "event: message_start\ndata: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":10,\"output_tokens\":1}}}\n\n".to_string(),
            "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hi\"}}\n\n".to_string(),
            format!("event: error\ndata: {error_frame}\n\n"),
            "event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n".to_string(),
        ]);
        let (mut generation, hooks) = start(ProviderKind::Anthropic, source);

        let (texts, error) = collect_text(&mut generation).await;
        assert_eq!(texts, vec!["Hi"]);
        assert_eq!(error.map(|e| e.kind()), Some(ErrorKind::Provider));

        let err = generation.finish().await.expect_err("provider error");
        assert_eq!(
            err.error.provider_payload(),
            Some(&serde_json::json!({"type":"overloaded_error","message":"Overloaded"}))
        );
        assert_eq!(err.partial().map(|p| p.text()), Some("Hi".to_string()));

        let errors = hooks.errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0, ErrorKind::Provider);
        assert_eq!(errors[0].1, Some(error_frame));
        assert_eq!(hooks.finishes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failure_before_any_data_has_no_partial_result() {
        let items: Vec<Result<bytes::Bytes, String>> = vec![Err("timed out".into())];
        let (generation, _hooks) =
            start(ProviderKind::OpenAi, ByteSource::new(futures::stream::iter(items)));
        let err = generation.finish().await.expect_err("failure");
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert!(err.partial().is_none());
    }

    #[tokio::test]
    async fn provider_error_before_any_data_has_no_partial_result() {
        let source = ByteSource::from_chunks(vec![format!(
            "data: {}\n\n",
            serde_json::json!({"error":{"type":"invalid_request_error","message":"bad model"}})
        )]);
        let (generation, hooks) = start(ProviderKind::OpenAi, source);
        let err = generation.finish().await.expect_err("provider error");
        assert_eq!(err.kind(), ErrorKind::Provider);
        assert!(err.partial().is_none());
        assert_eq!(hooks.errors.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn on_message_receives_the_raw_frame() {
        let chunk = serde_json::json!({"choices":[{"index":0,"delta":{"content":"hi"}}]});
        let source = ByteSource::from_chunks(vec![
            format!("data: {chunk}\n\n"),
            "data: [DONE]\n\n".to_string(),
        ]);
        let (generation, hooks) = start(ProviderKind::OpenAi, source);
        generation.finish().await.expect("final");

        assert_eq!(*hooks.messages.lock().unwrap(), vec!["text_delta", "end"]);
        assert_eq!(
            *hooks.raws.lock().unwrap(),
            vec![chunk, serde_json::Value::String("[DONE]".into())]
        );
    }

    #[tokio::test]
    async fn anthropic_stream_reconstructs_text_tool_call_and_usage() {
        let events = [
            ("message_start", serde_json::json!({"type":"message_start","message":{"id":"msg_1","usage":{"input_tokens":472,"output_tokens":2}}})),
            ("content_block_start", serde_json::json!({"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}})),
            ("ping", serde_json::json!({"type":"ping"})),
            ("content_block_delta", serde_json::json!({"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Checking"}})),
            ("content_block_stop", serde_json::json!({"type":"content_block_stop","index":0})),
            ("content_block_start", serde_json::json!({"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"toolu_1","name":"get_weather","input":{}}})),
            ("content_block_delta", serde_json::json!({"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":""}})),
            ("content_block_delta", serde_json::json!({"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"location\": \"San Fra"}})),
            ("content_block_delta", serde_json::json!({"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"ncisco\"}"}})),
            ("content_block_stop", serde_json::json!({"type":"content_block_stop","index":1})),
            ("message_delta", serde_json::json!({"type":"message_delta","delta":{"stop_reason":"tool_use","stop_sequence":null},"usage":{"output_tokens":89}})),
            ("message_stop", serde_json::json!({"type":"message_stop"})),
        ];
        let wire: String = events
            .iter()
            .map(|(name, data)| format!("event: {name}\ndata: {data}\n\n"))
            .collect();
        let (generation, hooks) =
            start(ProviderKind::Anthropic, ByteSource::from_chunks(vec![wire]));

        let result = generation.finish().await.expect("final");
        assert_eq!(result.text(), "Checking");
        let calls = result.tool_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "toolu_1");
        assert_eq!(
            calls[0].input.value(),
            Some(&serde_json::json!({"location":"San Francisco"}))
        );
        assert_eq!(result.usage.input, 472);
        assert_eq!(result.usage.output, 89);
        assert_eq!(result.usage.total, 561);
        assert_eq!(result.stop_reason.as_deref(), Some("tool_use"));
        assert!(hooks.messages.lock().unwrap().contains(&"other"));
    }

    #[tokio::test]
    async fn frame_errors_are_reported_and_stream_continues() {
        let source = ByteSource::from_chunks(vec![
            openai_text("a"),
            "data: {broken\n\n".to_string(),
            openai_text("b"),
            "data: [DONE]\n\n".to_string(),
        ]);
        let (generation, hooks) = start(ProviderKind::OpenAi, source);
        let result = generation.finish().await.expect("final");
        assert_eq!(result.text(), "ab");
        let errors = hooks.errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0, ErrorKind::FrameDecode);
        assert_eq!(hooks.finishes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn conflicting_stop_reason_is_reported_first_wins() {
        let source = ByteSource::from_chunks(vec![
            openai_stop("stop"),
            openai_stop("length"),
        ]);
        let (generation, hooks) = start(ProviderKind::OpenAi, source);
        let result = generation.finish().await.expect("final");
        assert_eq!(result.stop_reason.as_deref(), Some("stop"));
        assert_eq!(
            hooks.errors.lock().unwrap()[0].0,
            ErrorKind::AggregationAnomaly
        );
    }

    #[tokio::test]
    async fn source_exhaustion_without_sentinel_completes() {
        let (generation, _hooks) = start(
            ProviderKind::OpenAi,
            ByteSource::from_chunks(vec![openai_text("tail").trim_end().to_string()]),
        );
        let result = generation.finish().await.expect("final");
        assert_eq!(result.text(), "tail");
        assert!(result.is_complete());
    }

    #[tokio::test]
    async fn source_ending_mid_frame_is_a_transport_failure() {
        let opening = serde_json::json!({"choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"lookup","arguments":"{\"a\":"}}]}}]});
        let source = ByteSource::from_chunks(vec![
            format!("data: {opening}\n\n"),
            r#"data: {"choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"function":{"argum"#
                .to_string(),
        ]);
        let (generation, hooks) = start(ProviderKind::OpenAi, source);

        let err = generation.finish().await.expect_err("truncated body");
        assert_eq!(err.kind(), ErrorKind::Transport);
        let partial = err.partial().expect("partial result");
        assert!(matches!(
            partial.completion,
            Completion::Incomplete(IncompleteReason::Transport { .. })
        ));
        assert_eq!(partial.tool_calls()[0].id, "call_1");

        assert_eq!(hooks.finishes.load(Ordering::SeqCst), 0);
        let errors = hooks.errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0, ErrorKind::Transport);
    }

    #[tokio::test]
    async fn oversized_usage_counts_do_not_abort_the_generation() {
        let source = ByteSource::from_chunks(vec![
            openai_text("hi"),
            "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":18446744073709551615,\"completion_tokens\":1}}\n\n".to_string(),
            openai_stop("stop"),
        ]);
        let (generation, hooks) = start(ProviderKind::OpenAi, source);
        let result = generation.finish().await.expect("final");
        assert_eq!(result.text(), "hi");
        assert_eq!(result.usage.total, u64::MAX);
        assert_eq!(hooks.finishes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn frames_after_done_are_ignored() {
        let source = ByteSource::from_chunks(vec![format!(
            "{}data: [DONE]\n\n{}",
            openai_text("kept"),
            openai_text("dropped")
        )]);
        let (generation, _hooks) = start(ProviderKind::OpenAi, source);
        assert_eq!(generation.finish().await.expect("final").text(), "kept");
    }

    #[tokio::test]
    async fn accessors_resolve_from_cloned_handles() {
        let source = ByteSource::from_chunks(vec![
            openai_text("x"),
            format!(
                "data: {}\n\n",
                serde_json::json!({"choices":[],"usage":{"prompt_tokens":3,"completion_tokens":4}})
            ),
            openai_stop("stop"),
        ]);
        let (generation, _hooks) = start(ProviderKind::OpenAi, source);
        let (text, result, _abort) = generation.into_parts();
        drop(text);

        let other = result.clone();
        let (usage, stop) = tokio::join!(result.usage(), other.stop_reason());
        assert_eq!(usage.expect("usage").total, 7);
        assert_eq!(stop.expect("stop").as_deref(), Some("stop"));
        assert_eq!(result.final_message().await.expect("message").text(), "x");
    }

    #[tokio::test]
    async fn slow_reader_applies_backpressure() {
        let pulled = Arc::new(AtomicUsize::new(0));
        let counter = pulled.clone();
        let chunks: Vec<Result<bytes::Bytes, String>> = (0..20)
            .map(|i| Ok(bytes::Bytes::from(openai_text(&i.to_string()))))
            .collect();
        let source = ByteSource::new(futures::stream::iter(chunks).map(move |chunk| {
            counter.fetch_add(1, Ordering::SeqCst);
            chunk
        }));
        let generation = generate(ProviderKind::OpenAi)
            .text_buffer_capacity(2)
            .start(source)
            .expect("start");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(pulled.load(Ordering::SeqCst) <= 4, "loop ran ahead of the reader");

        let (text, result, _abort) = generation.into_parts();
        let texts: Vec<String> = text.map(|item| item.expect("text")).collect().await;
        assert_eq!(texts.len(), 20);
        assert_eq!(texts[19], "19");
        assert_eq!(pulled.load(Ordering::SeqCst), 20);
        assert!(result.final_result().await.is_ok());
    }

    #[tokio::test]
    async fn dropped_reader_does_not_stop_aggregation() {
        let chunks: Vec<String> = (0..10).map(|i| openai_text(&i.to_string())).collect();
        let generation = generate(ProviderKind::OpenAi)
            .text_buffer_capacity(1)
            .start(ByteSource::from_chunks(chunks))
            .expect("start");
        let (text, result, _abort) = generation.into_parts();
        drop(text);
        assert_eq!(
            result.final_result().await.expect("final").text(),
            "0123456789"
        );
    }

    #[tokio::test]
    async fn abort_ends_live_stream_and_marks_result_incomplete() {
        let head: Vec<Result<bytes::Bytes, String>> = vec![Ok(openai_text("before").into())];
        let source = ByteSource::new(futures::stream::iter(head).chain(futures::stream::pending()));
        let (mut generation, hooks) = start(ProviderKind::OpenAi, source);

        assert_eq!(generation.next_text().await, Some(Ok("before".to_string())));
        generation.abort_handle().abort();
        assert_eq!(generation.next_text().await, None);

        let err = generation.finish().await.expect_err("cancelled");
        assert!(matches!(
            err.error,
            StreamError::Cancelled {
                reason: CancelReason::Aborted,
                mid_frame: false
            }
        ));
        let partial = err.partial().expect("partial");
        assert_eq!(partial.text(), "before");
        assert!(!partial.is_complete());
        assert_eq!(hooks.finishes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn abort_mid_frame_ends_live_stream_with_error() {
        let head: Vec<Result<bytes::Bytes, String>> =
            vec![Ok(bytes::Bytes::from_static(b"data: {\"choices\":[{\"delta\":"))];
        let source = ByteSource::new(futures::stream::iter(head).chain(futures::stream::pending()));
        let (mut generation, _hooks) = start(ProviderKind::OpenAi, source);

        tokio::time::sleep(Duration::from_millis(10)).await;
        generation.abort_handle().abort();
        match generation.next_text().await {
            Some(Err(StreamError::Cancelled { mid_frame, .. })) => assert!(mid_frame),
            other => panic!("expected mid-frame cancellation, got {other:?}"),
        }
        assert_eq!(generation.next_text().await, None);
    }

    #[tokio::test]
    async fn timeout_is_a_cancellation() {
        let head: Vec<Result<bytes::Bytes, String>> = vec![Ok(openai_text("slow").into())];
        let source = ByteSource::new(futures::stream::iter(head).chain(futures::stream::pending()));
        let generation = generate(ProviderKind::OpenAi)
            .timeout(Duration::from_millis(30))
            .start(source)
            .expect("start");
        let err = generation.finish().await.expect_err("timed out");
        assert!(matches!(
            err.error,
            StreamError::Cancelled {
                reason: CancelReason::TimedOut { .. },
                ..
            }
        ));
        assert_eq!(err.partial().map(|p| p.text()), Some("slow".to_string()));
    }

    #[tokio::test]
    async fn source_is_released_on_every_exit_path() {
        struct Release(Arc<AtomicUsize>);
        impl Drop for Release {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        fn tracked(
            items: Vec<Result<bytes::Bytes, String>>,
            hang: bool,
            releases: &Arc<AtomicUsize>,
        ) -> ByteSource {
            let marker = Release(releases.clone());
            let tail = if hang {
                futures::stream::pending::<Result<bytes::Bytes, String>>().boxed()
            } else {
                futures::stream::empty::<Result<bytes::Bytes, String>>().boxed()
            };
            ByteSource::new(futures::stream::iter(items).chain(tail).map(move |item| {
                let _held = &marker;
                item
            }))
        }

        let releases = Arc::new(AtomicUsize::new(0));

        let ok = tracked(vec![Ok(openai_stop("stop").into())], false, &releases);
        let (generation, _) = start(ProviderKind::OpenAi, ok);
        assert!(generation.finish().await.is_ok());

        let failing = tracked(vec![Err("reset".into())], false, &releases);
        let (generation, _) = start(ProviderKind::OpenAi, failing);
        assert!(generation.finish().await.is_err());

        let hanging = tracked(vec![], true, &releases);
        let (generation, _) = start(ProviderKind::OpenAi, hanging);
        generation.abort_handle().abort();
        assert!(generation.finish().await.is_err());

        assert_eq!(releases.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn zero_capacity_is_rejected() {
        let result = generate(ProviderKind::OpenAi)
            .text_buffer_capacity(0)
            .start(ByteSource::from_chunks(Vec::<String>::new()));
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }
}

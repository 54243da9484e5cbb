//! Async streaming over a shared session.
//!
//! The decode loop is synchronous, so each streamed predict runs on a
//! blocking thread and forwards chunks through a bounded channel. Dropping
//! the [`TokenStream`] closes the channel; the producer sees the failed send
//! and cancels the generation.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use parking_lot::{Mutex, MutexGuard};
use tokio::sync::mpsc;

use super::backend::EngineLoader;
use super::cancel::{StopHandle, StopResult};
use super::error::SessionError;
use super::generation::Completion;
use super::input::PredictInput;
use super::output::{FinishReason, GenerationSummary, StreamChunk};
use super::session::Session;

/// One message on a token stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamingOutput {
    pub chunk: Option<StreamChunk>,
    pub is_final: bool,
    /// Present on the final message.
    pub summary: Option<GenerationSummary>,
}

impl StreamingOutput {
    fn chunk(chunk: StreamChunk) -> Self {
        Self {
            chunk: Some(chunk),
            is_final: false,
            summary: None,
        }
    }

    fn last(summary: GenerationSummary) -> Self {
        Self {
            chunk: None,
            is_final: true,
            summary: Some(summary),
        }
    }

    pub fn finish_reason(&self) -> Option<&FinishReason> {
        self.summary.as_ref().map(|s| &s.finish_reason)
    }
}

type StreamItem = Result<StreamingOutput, SessionError>;

/// Async stream of generated chunks.
pub struct TokenStream {
    receiver: mpsc::Receiver<StreamItem>,
    stop: StopHandle,
}

impl TokenStream {
    fn new(buffer_size: usize, stop: StopHandle) -> (TokenStreamSender, Self) {
        let (sender, receiver) = mpsc::channel(buffer_size.max(1));
        (TokenStreamSender { sender }, Self { receiver, stop })
    }

    /// Receive the next message, if any.
    pub async fn next(&mut self) -> Option<StreamItem> {
        self.receiver.recv().await
    }

    /// Ask the producing generation to stop. Chunks already queued are
    /// still delivered, followed by the final message.
    pub fn stop(&self) {
        self.stop.request();
    }

    /// Collect all remaining chunks.
    pub async fn collect(mut self) -> Result<Completion, SessionError> {
        let mut content = String::new();
        let mut reasoning = String::new();
        while let Some(item) = self.next().await {
            let output = item?;
            if let Some(chunk) = output.chunk {
                if chunk.is_reasoning {
                    reasoning.push_str(&chunk.text);
                } else {
                    content.push_str(&chunk.text);
                }
            }
            if let Some(summary) = output.summary {
                return Ok(Completion {
                    content,
                    reasoning,
                    summary,
                });
            }
        }
        Err(SessionError::Engine(super::error::EngineError::Context(
            "stream closed before the final message".into(),
        )))
    }
}

impl Stream for TokenStream {
    type Item = StreamItem;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

/// Producer half, used from the blocking thread.
struct TokenStreamSender {
    sender: mpsc::Sender<StreamItem>,
}

impl TokenStreamSender {
    fn send(&self, item: StreamItem) -> Result<(), StreamClosed> {
        self.sender.blocking_send(item).map_err(|_| StreamClosed)
    }
}

#[derive(Debug)]
struct StreamClosed;

/// A session shared between async tasks.
///
/// Holds the stop handle outside the lock so a running generation can be
/// cancelled without waiting for it.
pub struct SharedSession<L: EngineLoader> {
    session: Arc<Mutex<Session<L>>>,
    stop: StopHandle,
}

impl<L: EngineLoader> Clone for SharedSession<L> {
    fn clone(&self) -> Self {
        Self {
            session: self.session.clone(),
            stop: self.stop.clone(),
        }
    }
}

impl<L> SharedSession<L>
where
    L: EngineLoader + 'static,
{
    pub fn new(session: Session<L>) -> Self {
        let stop = session.stop_handle();
        Self {
            session: Arc::new(Mutex::new(session)),
            stop,
        }
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Blocking access for `load`, `reset` and inspection.
    pub fn lock(&self) -> MutexGuard<'_, Session<L>> {
        self.session.lock()
    }

    pub fn stop(&self) {
        self.stop.request();
    }

    /// Stop the running generation and wait for the session to go idle.
    pub async fn stop_and_wait(&self, timeout: Duration) -> StopResult {
        self.stop.stop_and_wait(timeout).await
    }

    /// Run `predict` on a blocking thread and stream its chunks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn predict_stream(&self, input: PredictInput, buffer_size: usize) -> TokenStream {
        let (sender, stream) = TokenStream::new(buffer_size, self.stop.clone());
        // Reserve the slot before returning so an early stop() reaches this run.
        let Some(reservation) = self.stop.begin() else {
            let _ = sender.sender.try_send(Err(SessionError::Busy));
            return stream;
        };

        let session = self.session.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = session.lock();
            let summary = match guard.predict_reserved(input, reservation) {
                Ok(generation) => forward(generation, &sender),
                Err(e) => {
                    let _ = sender.send(Err(e));
                    None
                }
            };
            drop(guard);
            if let Some(summary) = summary {
                let _ = sender.send(Ok(StreamingOutput::last(summary)));
            }
        });
        stream
    }
}

/// Pump a generation into the channel. Returns the summary when the
/// generation finished on its own terms and the consumer is still there.
fn forward<L: EngineLoader>(
    mut generation: super::generation::Generation<'_, L>,
    sender: &TokenStreamSender,
) -> Option<GenerationSummary> {
    for item in generation.by_ref() {
        match item {
            Ok(chunk) => {
                if sender.send(Ok(StreamingOutput::chunk(chunk))).is_err() {
                    tracing::debug!("stream consumer dropped, cancelling generation");
                    return None;
                }
            }
            Err(e) => {
                let _ = sender.send(Err(e));
                return None;
            }
        }
    }
    generation.summary().cloned()
}

//! The streamed request body buffer.
//!
//! [`BodyBuffer`] accumulates chunks pushed by the transport receiver loop
//! while the handler consumes them, either incrementally (chunk by chunk)
//! or in bulk (await the complete body). The two consumption modes are
//! mutually exclusive; the first read locks the buffer into its mode and
//! the other mode is rejected from then on.
//!
//! Size enforcement is terminal: once the accumulated length passes the
//! configured maximum the buffer stores [`BodyError::TooLarge`], marks
//! itself complete so any parked consumer wakes up, and re-raises the
//! stored error on every subsequent read.

use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures_core::Stream;
use thiserror::Error;
use tokio::sync::Notify;

/// Terminal or usage errors raised by body reads.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BodyError {
    /// The accumulated body exceeds the configured maximum size.
    #[error("request body exceeds the configured maximum size")]
    TooLarge,

    /// The buffer was already locked into the other consumption mode.
    #[error("request body is already being consumed {locked}")]
    ModeConflict { locked: ConsumeMode },
}

/// How the buffer is being drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeMode {
    Incremental,
    Bulk,
}

impl std::fmt::Display for ConsumeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConsumeMode::Incremental => f.write_str("incrementally"),
            ConsumeMode::Bulk => f.write_str("in bulk"),
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    data: BytesMut,
    complete: bool,
    error: Option<BodyError>,
    mode: Option<ConsumeMode>,
}

/// An async buffer bridging the transport receiver loop and the handler.
///
/// Producers call [`append`](Self::append) and
/// [`set_complete`](Self::set_complete); consumers either drain chunks via
/// [`next_chunk`](Self::next_chunk) (or the [`chunks`](Self::chunks)
/// stream adapter) or await the whole body via [`full`](Self::full).
#[derive(Debug)]
pub struct BodyBuffer {
    inner: Mutex<Inner>,
    wakeup: Notify,
    max_content_length: Option<usize>,
}

impl BodyBuffer {
    /// Create a buffer.
    ///
    /// If the declared `expected_content_length` already exceeds
    /// `max_content_length` the buffer starts in the errored state: the
    /// limit cannot be met, so no byte is ever accepted.
    pub fn new(expected_content_length: Option<usize>, max_content_length: Option<usize>) -> Self {
        let mut inner = Inner::default();
        if let (Some(expected), Some(max)) = (expected_content_length, max_content_length)
            && expected > max
        {
            inner.error = Some(BodyError::TooLarge);
            inner.complete = true;
        }
        Self {
            inner: Mutex::new(inner),
            wakeup: Notify::new(),
            max_content_length,
        }
    }

    /// A buffer with no limits, for tests and synthetic requests.
    pub fn unlimited() -> Self {
        Self::new(None, None)
    }

    /// Append a chunk from the transport.
    ///
    /// No-op when the chunk is empty or the buffer is complete or errored.
    /// Crossing the size limit transitions to the terminal error state and
    /// marks the buffer complete so parked consumers observe the error
    /// instead of waiting forever.
    pub fn append(&self, data: &[u8]) {
        let mut inner = self.inner.lock().expect("body lock");
        if data.is_empty() || inner.complete || inner.error.is_some() {
            return;
        }
        inner.data.extend_from_slice(data);
        if let Some(max) = self.max_content_length
            && inner.data.len() > max
        {
            inner.error = Some(BodyError::TooLarge);
            inner.complete = true;
        }
        drop(inner);
        self.wakeup.notify_waiters();
    }

    /// Mark the body complete; no further appends are accepted.
    pub fn set_complete(&self) {
        self.inner.lock().expect("body lock").complete = true;
        self.wakeup.notify_waiters();
    }

    /// Append then complete, in one call.
    pub fn set_result(&self, data: &[u8]) {
        self.append(data);
        self.set_complete();
    }

    /// Discard buffered bytes without changing state. Frees memory after
    /// an uncached bulk read.
    pub fn clear(&self) {
        self.inner.lock().expect("body lock").data.clear();
    }

    /// Whether the producer finished (or the buffer errored).
    pub fn is_complete(&self) -> bool {
        self.inner.lock().expect("body lock").complete
    }

    fn lock_mode(&self, inner: &mut Inner, wanted: ConsumeMode) -> Result<(), BodyError> {
        match inner.mode {
            None => {
                inner.mode = Some(wanted);
                Ok(())
            }
            Some(locked) if locked == wanted => Ok(()),
            Some(locked) => Err(BodyError::ModeConflict { locked }),
        }
    }

    /// Incremental consumption: wait for data, yield and clear the
    /// accumulated chunk. Returns `Ok(None)` once complete and drained.
    ///
    /// The terminal error is checked on every pass around the wait, so an
    /// error set while this consumer is parked is observed on wakeup.
    pub async fn next_chunk(&self) -> Result<Option<Bytes>, BodyError> {
        loop {
            let notified = self.wakeup.notified();
            tokio::pin!(notified);
            // Register before the state check so a notification arriving
            // in between is not lost.
            notified.as_mut().enable();
            {
                let mut inner = self.inner.lock().expect("body lock");
                if let Some(err) = inner.error.clone() {
                    return Err(err);
                }
                self.lock_mode(&mut inner, ConsumeMode::Incremental)?;
                if !inner.data.is_empty() {
                    return Ok(Some(inner.data.split().freeze()));
                }
                if inner.complete {
                    return Ok(None);
                }
            }
            notified.await;
        }
    }

    /// Bulk consumption: wait for completion, return the full body.
    ///
    /// The buffered data is left in place so repeated calls return the
    /// same bytes; use [`clear`](Self::clear) to drop it afterwards.
    pub async fn full(&self) -> Result<Bytes, BodyError> {
        loop {
            let notified = self.wakeup.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut inner = self.inner.lock().expect("body lock");
                if let Some(err) = inner.error.clone() {
                    return Err(err);
                }
                self.lock_mode(&mut inner, ConsumeMode::Bulk)?;
                if inner.complete {
                    return Ok(Bytes::copy_from_slice(&inner.data));
                }
            }
            notified.await;
        }
    }

    /// Stream adapter over [`next_chunk`](Self::next_chunk).
    pub fn chunks(&self) -> BodyChunks<'_> {
        BodyChunks {
            buffer: self,
            pending: None,
        }
    }
}

type ChunkFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Option<Bytes>, BodyError>> + Send + 'a>>;

/// `Stream` over a body's chunks; ends when the buffer completes.
pub struct BodyChunks<'a> {
    buffer: &'a BodyBuffer,
    pending: Option<ChunkFuture<'a>>,
}

impl Stream for BodyChunks<'_> {
    type Item = Result<Bytes, BodyError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let mut fut = this
            .pending
            .take()
            .unwrap_or_else(|| Box::pin(this.buffer.next_chunk()));
        match fut.as_mut().poll(cx) {
            Poll::Ready(Ok(Some(chunk))) => Poll::Ready(Some(Ok(chunk))),
            Poll::Ready(Ok(None)) => Poll::Ready(None),
            Poll::Ready(Err(err)) => Poll::Ready(Some(Err(err))),
            Poll::Pending => {
                this.pending = Some(fut);
                Poll::Pending
            }
        }
    }
}

//! The incoming request object.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::body::{BodyBuffer, BodyError};
use crate::error::HttpError;
use crate::head::RequestHead;
use crate::header::HeaderMap;

/// Boxed future used by the type-erased transport callables.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Callable that sends a push promise for a path with a header subset.
/// Provided by the HTTP adapter when the transport supports server push.
pub type PushPromiseFn = Arc<dyn Fn(String, HeaderMap) -> BoxFuture<()> + Send + Sync>;

/// Headers copied from the originating request onto a push promise.
/// Deliberately a small allowlist — copying arbitrary request headers
/// could poison the promised response's cache key.
const PUSH_PROMISE_HEADERS: [&str; 5] = [
    "accept",
    "accept-encoding",
    "accept-language",
    "cache-control",
    "user-agent",
];

/// An incoming HTTP request with a streamed body.
///
/// The body arrives incrementally from the transport; handlers either
/// drain it chunk by chunk via [`body`](Self::body) or read it whole via
/// [`get_data`](Self::get_data) / [`get_json`](Self::get_json).
#[derive(Clone)]
pub struct Request {
    head: RequestHead,
    body: Arc<BodyBuffer>,
    body_timeout: Option<Duration>,
    push_promise: Option<PushPromiseFn>,
}

impl Request {
    pub fn new(head: RequestHead, body: BodyBuffer) -> Self {
        Self {
            head,
            body: Arc::new(body),
            body_timeout: None,
            push_promise: None,
        }
    }

    /// Set the timeout applied to whole-body reads.
    pub fn with_body_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.body_timeout = timeout;
        self
    }

    /// Attach the adapter's push-promise callable.
    pub fn with_push_promise(mut self, push: PushPromiseFn) -> Self {
        self.push_promise = Some(push);
        self
    }

    pub fn head(&self) -> &RequestHead {
        &self.head
    }

    pub fn head_mut(&mut self) -> &mut RequestHead {
        &mut self.head
    }

    pub fn method(&self) -> &str {
        &self.head.method
    }

    pub fn path(&self) -> &str {
        &self.head.path
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.head.headers
    }

    /// The body buffer, for incremental consumption.
    pub fn body(&self) -> &BodyBuffer {
        &self.body
    }

    /// Read the complete body.
    ///
    /// Waits for the transport to finish delivering chunks, subject to the
    /// body timeout. With `cache` false the buffered bytes are discarded
    /// after the read, freeing memory for large uncached payloads.
    pub async fn get_data(&self, cache: bool) -> Result<Bytes, HttpError> {
        let read = self.body.full();
        let result = match self.body_timeout {
            Some(timeout) => tokio::time::timeout(timeout, read)
                .await
                .map_err(|_| HttpError::RequestTimeout)?,
            None => read.await,
        };
        let data = result.map_err(|err| match err {
            BodyError::TooLarge => HttpError::PayloadTooLarge,
            BodyError::ModeConflict { .. } => HttpError::InternalServerError,
        })?;
        if !cache {
            self.body.clear();
        }
        Ok(data)
    }

    /// Parse the body as JSON.
    ///
    /// A parse failure is a 400 unless `silent`, in which case `Null` is
    /// returned instead.
    pub async fn get_json(&self, silent: bool) -> Result<serde_json::Value, HttpError> {
        let data = self.get_data(true).await?;
        match serde_json::from_slice(&data) {
            Ok(value) => Ok(value),
            Err(_) if silent => Ok(serde_json::Value::Null),
            Err(err) => {
                tracing::debug!(error = %err, "request body failed to parse as JSON");
                Err(HttpError::BadRequest)
            }
        }
    }

    /// Send a push promise for `path`, copying the cache-relevant header
    /// subset from this request. No-op when the transport did not
    /// advertise push support.
    pub async fn send_push_promise(&self, path: &str) {
        let Some(push) = &self.push_promise else {
            return;
        };
        let mut headers = HeaderMap::new();
        for name in PUSH_PROMISE_HEADERS {
            for value in self.head.headers.get_all(name) {
                headers.insert(name, value);
            }
        }
        push(path.to_string(), headers).await;
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.head.method)
            .field("path", &self.head.path)
            .finish_non_exhaustive()
    }
}
